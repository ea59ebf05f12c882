// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt::Display;

use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

/// Broad classification of a deal failure, used by callers to decide whether a failure is
/// the peer's fault, a local resource problem or a logic error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ErrorKind {
    IllegalArgument = 1,
    NotFound = 2,
    Forbidden = 3,
    InsufficientFunds = 4,
    IllegalState = 5,
    Serialization = 6,
    Network = 7,
    AlreadyExists = 8,
    Timeout = 9,
    Unspecified = 10,
}

/// The error type returned by deal operations, state machine actions and environments.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("DealError(kind: {kind:?}, msg: {msg})")]
pub struct DealError {
    kind: ErrorKind,
    /// Message for debugging purposes and for the deal record's `message` field.
    msg: String,
}

impl DealError {
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    pub fn illegal_argument(msg: String) -> Self {
        Self { kind: ErrorKind::IllegalArgument, msg }
    }
    pub fn not_found(msg: String) -> Self {
        Self { kind: ErrorKind::NotFound, msg }
    }
    pub fn forbidden(msg: String) -> Self {
        Self { kind: ErrorKind::Forbidden, msg }
    }
    pub fn insufficient_funds(msg: String) -> Self {
        Self { kind: ErrorKind::InsufficientFunds, msg }
    }
    pub fn illegal_state(msg: String) -> Self {
        Self { kind: ErrorKind::IllegalState, msg }
    }
    pub fn serialization(msg: String) -> Self {
        Self { kind: ErrorKind::Serialization, msg }
    }
    pub fn network(msg: String) -> Self {
        Self { kind: ErrorKind::Network, msg }
    }
    pub fn already_exists(msg: String) -> Self {
        Self { kind: ErrorKind::AlreadyExists, msg }
    }
    pub fn timeout(msg: String) -> Self {
        Self { kind: ErrorKind::Timeout, msg }
    }
    pub fn unspecified(msg: String) -> Self {
        Self { kind: ErrorKind::Unspecified, msg }
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Error message of the deal error.
    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// Prefix error message with a string message.
    pub fn wrap(mut self, msg: impl AsRef<str>) -> Self {
        self.msg = format!("{}: {}", msg.as_ref(), self.msg);
        self
    }
}

/// Converts a raw encoding error into a serialization error.
impl From<fvm_ipld_encoding::Error> for DealError {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Self { kind: ErrorKind::Serialization, msg: e.to_string() }
    }
}

impl From<std::io::Error> for DealError {
    fn from(e: std::io::Error) -> Self {
        Self { kind: ErrorKind::Network, msg: e.to_string() }
    }
}

/// Convenience macro for generating deal errors
#[macro_export]
macro_rules! deal_error {
    // Error with only one stringable expression
    ( $code:ident; $msg:expr ) => { $crate::DealError::$code($msg.to_string()) };

    // String with positional arguments
    ( $code:ident; $msg:literal $(, $ex:expr)+ ) => {
        $crate::DealError::$code(format!($msg, $($ex,)*))
    };

    // Error with only one stringable expression, with comma separator
    ( $code:ident, $msg:expr ) => { $crate::deal_error!($code; $msg) };

    // String with positional arguments, with comma separator
    ( $code:ident, $msg:literal $(, $ex:expr)+ ) => {
        $crate::deal_error!($code; $msg $(, $ex)*)
    };
}

// Adds context to a deal error's descriptive message.
pub trait DealContext<T> {
    fn context<C>(self, context: C) -> Result<T, DealError>
    where
        C: Display + 'static;

    fn with_context<C, F>(self, f: F) -> Result<T, DealError>
    where
        C: Display + 'static,
        F: FnOnce() -> C;
}

impl<T> DealContext<T> for Result<T, DealError> {
    fn context<C>(self, context: C) -> Result<T, DealError>
    where
        C: Display + 'static,
    {
        self.map_err(|mut err| {
            err.msg = format!("{}: {}", context, err.msg);
            err
        })
    }

    fn with_context<C, F>(self, f: F) -> Result<T, DealError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|mut err| {
            err.msg = format!("{}: {}", f(), err.msg);
            err
        })
    }
}

// Adapts a target into a deal error.
pub trait AsDealError<T>: Sized {
    fn kind(self, kind: ErrorKind) -> Result<T, DealError>;

    fn context_kind<C>(self, kind: ErrorKind, context: C) -> Result<T, DealError>
    where
        C: Display + 'static;

    fn with_context_kind<C, F>(self, kind: ErrorKind, f: F) -> Result<T, DealError>
    where
        C: Display + 'static,
        F: FnOnce() -> C;
}

// Note: E is Display rather than std::error::Error so anyhow errors from the blockstore convert.
impl<T, E: Display> AsDealError<T> for Result<T, E> {
    fn kind(self, kind: ErrorKind) -> Result<T, DealError> {
        self.map_err(|err| DealError { kind, msg: err.to_string() })
    }

    fn context_kind<C>(self, kind: ErrorKind, context: C) -> Result<T, DealError>
    where
        C: Display + 'static,
    {
        self.map_err(|err| DealError { kind, msg: format!("{}: {}", context, err) })
    }

    fn with_context_kind<C, F>(self, kind: ErrorKind, f: F) -> Result<T, DealError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|err| DealError { kind, msg: format!("{}: {}", f(), err) })
    }
}

impl<T> AsDealError<T> for Option<T> {
    fn kind(self, kind: ErrorKind) -> Result<T, DealError> {
        self.ok_or_else(|| DealError { kind, msg: "None".to_string() })
    }

    fn context_kind<C>(self, kind: ErrorKind, context: C) -> Result<T, DealError>
    where
        C: Display + 'static,
    {
        self.ok_or_else(|| DealError { kind, msg: context.to_string() })
    }

    fn with_context_kind<C, F>(self, kind: ErrorKind, f: F) -> Result<T, DealError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| DealError { kind, msg: f().to_string() })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn macro_formats_arguments() {
        let e = deal_error!(not_found; "piece {} missing from {}", "baga", "store");
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.msg(), "piece baga missing from store");
    }

    #[test]
    fn context_prefixes_message() {
        let r: Result<(), DealError> = Err(DealError::network("stream reset".into()));
        let e = r.context("reading deal response").unwrap_err();
        assert_eq!(e.msg(), "reading deal response: stream reset");
        assert_eq!(e.kind(), ErrorKind::Network);
    }

    #[test]
    fn option_converts_with_kind() {
        let none: Option<u64> = None;
        let e = none.context_kind(ErrorKind::NotFound, "no such deal").unwrap_err();
        assert_eq!(e, DealError::not_found("no such deal".into()));
    }
}

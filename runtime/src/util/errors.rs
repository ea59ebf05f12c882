use crate::{AsDealError, DealError, ErrorKind};
use std::fmt::Display;

// Convenient wrappers for error conversion.
pub trait AsDealErrors<T>: Sized {
    fn or_illegal_state<C>(self, context: C) -> Result<T, DealError>
    where
        C: Display + 'static;

    fn or_with_illegal_state<C, F>(self, f: F) -> Result<T, DealError>
    where
        C: Display + 'static,
        F: FnOnce() -> C;

    fn or_serialization<C>(self, context: C) -> Result<T, DealError>
    where
        C: Display + 'static;
}

impl<T, E: Display> AsDealErrors<T> for Result<T, E> {
    fn or_illegal_state<C>(self, context: C) -> Result<T, DealError>
    where
        C: Display + 'static,
    {
        self.context_kind(ErrorKind::IllegalState, context)
    }

    fn or_with_illegal_state<C, F>(self, f: F) -> Result<T, DealError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.with_context_kind(ErrorKind::IllegalState, f)
    }

    fn or_serialization<C>(self, context: C) -> Result<T, DealError>
    where
        C: Display + 'static,
    {
        self.context_kind(ErrorKind::Serialization, context)
    }
}

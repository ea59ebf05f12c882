// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Generic runtime for per-deal finite state machines.
//!
//! A machine is declared as an [`EventTable`] plus one async entry action per state, wrapped in
//! an [`FsmDefinition`]. A [`StateGroup`] persists every record in a [`StateStore`] and applies
//! events through one dispatch loop.
//!
//! [`StateStore`]: crate::statestore::StateStore

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::statestore::StateKey;

mod context;
mod group;
mod table;

pub use context::{ErrorEvent, FsmContext};
pub use group::{FsmDefinition, Notification, StateGroup};
pub use table::{Action, Destination, EventTable, Sources};

/// A record driven by a state machine.
pub trait DealRecord: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    type Key: StateKey + Eq + Hash;
    type Status: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
    fn status(&self) -> Self::Status;
    fn set_status(&mut self, status: Self::Status);
}

/// An event carrying its arguments. `Kind` is the field-less discriminant tables match on.
pub trait FsmEvent: Debug + Clone + Send + Sync + 'static {
    type Kind: Copy + Eq + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Declares an event enum together with its field-less kind enum.
///
/// ```ignore
/// deal_events! {
///     pub enum ClientEvent / ClientEventKind {
///         Open,
///         PaymentRequested(TokenAmount),
///         Error { message: String },
///     }
/// }
/// ```
#[macro_export]
macro_rules! deal_events {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident / $kind:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident
                $( ( $($ty:ty),* $(,)? ) )?
                $( { $($field:ident : $fty:ty),* $(,)? } )?
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant
                $( ( $($ty),* ) )?
                $( { $($field : $fty),* } )?
            ),*
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $kind {
            $( $variant ),*
        }

        impl $crate::fsm::FsmEvent for $name {
            type Kind = $kind;

            fn kind(&self) -> $kind {
                match self {
                    $( $name::$variant { .. } => $kind::$variant ),*
                }
            }
        }
    };
}

// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub use self::errors::AsDealErrors;
pub use self::pubsub::{Subscribers, Unsubscribe};
pub use self::ready::ReadySignal;

pub mod cid;
mod errors;
pub(crate) mod pubsub;
mod ready;

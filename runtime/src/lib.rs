// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Building blocks shared by the storage and retrieval markets: the deal state machine
//! runtime, persistent deal state, DAG traversal, unsealing and stream plumbing.

pub use self::deal_error::*;

pub mod blockstore;
pub mod carstore;
pub mod commp;
pub mod config;
pub mod datastore;
mod deal_error;
pub mod fsm;
pub mod ipld;
pub mod mount;
pub mod network;
pub mod piecestore;
pub mod statestore;
pub mod traversal;
pub mod unsealing;
pub mod util;

#[cfg(feature = "test_utils")]
pub mod test_utils;

// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Storage market: a client proposes a deal to store a payload with a provider, pushes the
//! data, and both sides follow the deal on chain until it is sealed and, later, expires.

pub use asks::{AskBounds, AskStore};
pub use client::{ClientEvent, ClientEventKind, StorageClient};
pub use node::{StorageClientNode, StorageCommon, StorageProviderNode};
pub use piece::{prepare_piece, PieceData};
pub use provider::{DealDecider, ProviderEvent, ProviderEventKind, StorageProvider};
pub use types::*;

pub mod asks;
pub mod client;
pub mod messages;
pub mod node;
mod piece;
pub mod provider;
#[cfg(feature = "test_utils")]
pub mod testing;
pub mod transfer;
mod types;
pub mod validation;

// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Retrieval market: a client pays a provider incrementally, over a payment channel, for the
//! blocks of a payload DAG, and the provider unseals and streams them.

pub use client::{ClientEvent, ClientEventKind, RetrievalClient};
pub use node::{RetrievalClientNode, RetrievalProviderNode};
pub use provider::{DealDecider, ProviderEvent, ProviderEventKind, RetrievalProvider};
pub use types::*;

pub mod client;
pub mod migrations;
pub mod node;
pub mod provider;
mod stats;
#[cfg(feature = "test_utils")]
pub mod testing;
mod types;

// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::{Arc, RwLock};

use fil_markets_runtime::config::AskDefaults;
use fil_markets_runtime::datastore::Datastore;
use fil_markets_runtime::util::AsDealErrors;
use fil_markets_runtime::{deal_error, DealError};
use fvm_ipld_encoding::{from_slice, to_vec};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use log::{info, warn};

use crate::node::StorageProviderNode;
use crate::types::{SignedStorageAsk, StorageAsk};

const ASK_KEY: &str = "latest-ask";

/// Piece size bounds for [`AskStore::set_price`]. Unset bounds keep the current ask's.
#[derive(Clone, Copy, Debug, Default)]
pub struct AskBounds {
    pub min_piece_size: Option<PaddedPieceSize>,
    pub max_piece_size: Option<PaddedPieceSize>,
}

/// The provider's current signed ask, persisted across restarts.
pub struct AskStore {
    miner: Address,
    node: Arc<dyn StorageProviderNode>,
    meta: Arc<dyn Datastore>,
    defaults: AskDefaults,
    ask: RwLock<Option<SignedStorageAsk>>,
}

impl AskStore {
    pub fn new(
        miner: Address,
        node: Arc<dyn StorageProviderNode>,
        meta: Arc<dyn Datastore>,
        defaults: AskDefaults,
    ) -> Self {
        Self { miner, node, meta, defaults, ask: RwLock::new(None) }
    }

    /// Reads the stored ask. Returns whether there was one.
    pub fn load(&self) -> Result<bool, DealError> {
        let Some(bytes) = self.meta.get(ASK_KEY)? else {
            warn!("no previous ask found, miner will not accept deals until a price is set");
            return Ok(false);
        };
        let ask: SignedStorageAsk = from_slice(&bytes).or_serialization("decoding stored storage ask")?;
        *self.write()? = Some(ask);
        Ok(true)
    }

    /// Signs and stores a new ask valid for `duration` epochs from the chain head. The
    /// sequence number is one above the previous ask's.
    pub async fn set_price(
        &self,
        price: TokenAmount,
        verified_price: TokenAmount,
        duration: ChainEpoch,
        bounds: AskBounds,
    ) -> Result<SignedStorageAsk, DealError> {
        let previous = self.get_ask()?;
        let head = self.node.get_chain_head().await?;
        let (seq_no, min, max) = match &previous {
            Some(p) => (p.ask.seq_no + 1, p.ask.min_piece_size, p.ask.max_piece_size),
            None => (
                0,
                PaddedPieceSize(self.defaults.min_piece_size),
                PaddedPieceSize(self.defaults.max_piece_size),
            ),
        };
        let ask = StorageAsk {
            price,
            verified_price,
            min_piece_size: bounds.min_piece_size.unwrap_or(min),
            max_piece_size: bounds.max_piece_size.unwrap_or(max),
            miner: self.miner,
            timestamp: head,
            expiry: head + duration,
            seq_no,
        };
        let signed = self.sign(ask).await?;
        let bytes = to_vec(&signed).or_serialization("encoding storage ask")?;
        self.meta.put(ASK_KEY, &bytes)?;
        *self.write()? = Some(signed.clone());
        info!("storage ask for {} set to {} (seq {})", self.miner, signed.ask.price, signed.ask.seq_no);
        Ok(signed)
    }

    /// Sets an ask from the configured defaults.
    pub async fn set_default(&self) -> Result<SignedStorageAsk, DealError> {
        let d = &self.defaults;
        self.set_price(
            TokenAmount::from_atto(d.price),
            TokenAmount::from_atto(d.verified_price),
            d.duration,
            AskBounds::default(),
        )
        .await
    }

    pub fn get_ask(&self) -> Result<Option<SignedStorageAsk>, DealError> {
        self.ask.read().map(|a| a.clone()).map_err(|_| deal_error!(illegal_state; "ask lock poisoned"))
    }

    async fn sign(&self, ask: StorageAsk) -> Result<SignedStorageAsk, DealError> {
        let worker = self.node.get_miner_worker_address(&self.miner).await?;
        let bytes = to_vec(&ask).or_serialization("encoding storage ask for signing")?;
        let signature = self.node.sign_bytes(&worker, &bytes).await.map_err(|e| e.wrap("signing storage ask"))?;
        Ok(SignedStorageAsk { ask, signature })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Option<SignedStorageAsk>>, DealError> {
        self.ask.write().map_err(|_| deal_error!(illegal_state; "ask lock poisoned"))
    }
}

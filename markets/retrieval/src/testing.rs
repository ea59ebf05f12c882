// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory nodes and sector access for exercising retrieval deals end to end.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use cid::Cid;
use fil_markets_runtime::carstore::write_car;
use fil_markets_runtime::commp::padded_size_for;
use fil_markets_runtime::piecestore::{BlockLocation, DealInfo, PieceStore};
use fil_markets_runtime::unsealing::SectorAccessor;
use fil_markets_runtime::{deal_error, DealError};
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::{PaddedPieceSize, UnpaddedPieceSize};
use fvm_shared::sector::SectorNumber;
use num_traits::Zero;

use crate::node::{RetrievalClientNode, RetrievalProviderNode};
use crate::types::SignedVoucher;

fn poisoned() -> DealError {
    deal_error!(illegal_state; "test node lock poisoned")
}

#[derive(Default)]
struct ClientNodeState {
    funded: TokenAmount,
    available_override: Option<TokenAmount>,
    next_lane: u64,
    nonce: u64,
    vouchers: Vec<SignedVoucher>,
    fail_channel: bool,
    fail_lane: bool,
    fail_voucher: bool,
}

/// Client node with a single payment channel funded with whatever the first deal asks for.
pub struct TestRetrievalClientNode {
    pay_ch: Address,
    create_msg: Option<Cid>,
    state: Mutex<ClientNodeState>,
}

impl TestRetrievalClientNode {
    pub fn new(pay_ch: Address) -> Self {
        Self { pay_ch, create_msg: None, state: Mutex::new(ClientNodeState::default()) }
    }

    /// Makes channel creation go through a message the deal has to wait on.
    pub fn with_create_message(mut self, msg: Cid) -> Self {
        self.create_msg = Some(msg);
        self
    }

    /// Overrides what `check_available_funds` reports.
    pub fn set_available_funds(&self, amount: TokenAmount) {
        if let Ok(mut state) = self.state.lock() {
            state.available_override = Some(amount);
        }
    }

    pub fn fail_payment_channel(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_channel = true;
        }
    }

    pub fn fail_lane_allocation(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_lane = true;
        }
    }

    pub fn fail_vouchers(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_voucher = true;
        }
    }

    /// Every voucher created so far, oldest first.
    pub fn vouchers(&self) -> Vec<SignedVoucher> {
        self.state.lock().map(|s| s.vouchers.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RetrievalClientNode for TestRetrievalClientNode {
    async fn get_or_create_payment_channel(
        &self,
        _client: &Address,
        _miner: &Address,
        funds: &TokenAmount,
    ) -> Result<(Address, Option<Cid>), DealError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.fail_channel {
            return Err(deal_error!(illegal_state; "payment channel creation failed"));
        }
        state.funded = funds.clone();
        Ok((self.pay_ch, self.create_msg))
    }

    async fn wait_for_payment_channel_ready(&self, message: &Cid) -> Result<Address, DealError> {
        match self.create_msg {
            Some(expected) if expected == *message => Ok(self.pay_ch),
            _ => Err(deal_error!(not_found; "unknown payment channel message {}", message)),
        }
    }

    async fn allocate_lane(&self, channel: &Address) -> Result<u64, DealError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.fail_lane || *channel != self.pay_ch {
            return Err(deal_error!(illegal_argument; "cannot allocate a lane on {}", channel));
        }
        let lane = state.next_lane;
        state.next_lane += 1;
        Ok(lane)
    }

    async fn create_payment_voucher(
        &self,
        channel: &Address,
        amount: &TokenAmount,
        lane: u64,
    ) -> Result<SignedVoucher, DealError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.fail_voucher {
            return Err(deal_error!(illegal_state; "voucher signing failed"));
        }
        state.nonce += 1;
        let voucher = SignedVoucher {
            channel_addr: *channel,
            lane,
            nonce: state.nonce,
            amount: amount.clone(),
            signature: Some(Signature::new_secp256k1(vec![0u8; 65])),
        };
        state.vouchers.push(voucher.clone());
        Ok(voucher)
    }

    async fn check_available_funds(&self, _channel: &Address) -> Result<TokenAmount, DealError> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(amount) = &state.available_override {
            return Ok(amount.clone());
        }
        let committed = state.vouchers.last().map(|v| v.amount.clone()).unwrap_or_else(TokenAmount::zero);
        Ok(&state.funded - &committed)
    }
}

#[derive(Default)]
struct ProviderNodeState {
    best: HashMap<(Address, u64), TokenAmount>,
    received: Vec<TokenAmount>,
    fail_worker: bool,
    fail_vouchers: bool,
}

/// Provider node that accepts any voucher raising the best amount on its lane.
pub struct TestRetrievalProviderNode {
    worker: Address,
    state: Mutex<ProviderNodeState>,
}

impl TestRetrievalProviderNode {
    pub fn new(worker: Address) -> Self {
        Self { worker, state: Mutex::new(ProviderNodeState::default()) }
    }

    /// Amounts each saved voucher added, in order.
    pub fn received(&self) -> Vec<TokenAmount> {
        self.state.lock().map(|s| s.received.clone()).unwrap_or_default()
    }

    pub fn fail_worker_lookup(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_worker = true;
        }
    }

    pub fn fail_vouchers(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_vouchers = true;
        }
    }
}

#[async_trait]
impl RetrievalProviderNode for TestRetrievalProviderNode {
    async fn save_payment_voucher(
        &self,
        channel: &Address,
        voucher: &SignedVoucher,
        _proof: &[u8],
        _expected: &TokenAmount,
    ) -> Result<TokenAmount, DealError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.fail_vouchers {
            return Err(deal_error!(illegal_state; "voucher rejected by node"));
        }
        let key = (*channel, voucher.lane);
        let best = state.best.get(&key).cloned().unwrap_or_else(TokenAmount::zero);
        if voucher.amount <= best {
            return Err(deal_error!(illegal_argument;
                "voucher amount {} is not above the best voucher {}", voucher.amount.atto(), best.atto()));
        }
        let delta = &voucher.amount - &best;
        state.best.insert(key, voucher.amount.clone());
        state.received.push(delta.clone());
        Ok(delta)
    }

    async fn get_miner_worker_address(&self, _miner: &Address) -> Result<Address, DealError> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        if state.fail_worker {
            return Err(deal_error!(not_found; "miner actor not found"));
        }
        Ok(self.worker)
    }
}

#[derive(Default)]
struct SectorState {
    contents: HashMap<SectorNumber, Vec<u8>>,
    unsealed: HashSet<SectorNumber>,
    failing: HashSet<SectorNumber>,
    unseal_calls: Vec<SectorNumber>,
}

/// Sectors holding pre-built CARs. Unseal calls are recorded.
#[derive(Default)]
pub struct TestSectorAccessor {
    state: Mutex<SectorState>,
}

impl TestSectorAccessor {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_sector(&self, sector: SectorNumber, car: Vec<u8>) {
        if let Ok(mut state) = self.state.lock() {
            state.contents.insert(sector, car);
        }
    }

    pub fn mark_unsealed(&self, sector: SectorNumber) {
        if let Ok(mut state) = self.state.lock() {
            state.unsealed.insert(sector);
        }
    }

    pub fn fail_sector(&self, sector: SectorNumber) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(sector);
        }
    }

    pub fn unseal_calls(&self) -> Vec<SectorNumber> {
        self.state.lock().map(|s| s.unseal_calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SectorAccessor for TestSectorAccessor {
    async fn is_unsealed(
        &self,
        sector_id: SectorNumber,
        _offset: UnpaddedPieceSize,
        _length: UnpaddedPieceSize,
    ) -> Result<bool, DealError> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state.unsealed.contains(&sector_id))
    }

    async fn unseal_sector(
        &self,
        sector_id: SectorNumber,
        _offset: UnpaddedPieceSize,
        _length: UnpaddedPieceSize,
    ) -> Result<Vec<u8>, DealError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.unseal_calls.push(sector_id);
        if state.failing.contains(&sector_id) {
            return Err(deal_error!(illegal_state; "unsealing sector {} failed", sector_id));
        }
        state
            .contents
            .get(&sector_id)
            .cloned()
            .ok_or_else(|| deal_error!(not_found; "no sector {}", sector_id))
    }
}

/// Stores a payload DAG as a piece in `sectors`, one deal per sector, and indexes every block
/// of it in `pieces`.
pub async fn store_payload_piece(
    pieces: &dyn PieceStore,
    sectors: &TestSectorAccessor,
    piece_cid: Cid,
    root: Cid,
    blocks: &[(Cid, Vec<u8>)],
    sector_ids: &[SectorNumber],
) -> Result<(), DealError> {
    let car = write_car(vec![root], blocks.to_vec()).await?;
    let length = padded_size_for(car.len() as u64);
    for (i, sector) in sector_ids.iter().enumerate() {
        sectors.add_sector(*sector, car.clone());
        let deal = DealInfo { deal_id: i as u64 + 1, sector_id: *sector, offset: PaddedPieceSize(0), length };
        pieces.add_deal_for_piece(piece_cid, deal)?;
    }
    let mut offset = 0;
    let locations: BTreeMap<Cid, BlockLocation> = blocks
        .iter()
        .map(|(cid, data)| {
            let location = BlockLocation { rel_offset: offset, block_size: data.len() as u64 };
            offset += data.len() as u64;
            (*cid, location)
        })
        .collect();
    pieces.add_piece_block_locations(piece_cid, locations)?;
    Ok(())
}

// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! An in-memory chain and storage nodes on top of it, for exercising storage deals end to end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cid::Cid;
use fil_markets_runtime::util::cid::raw_cid;
use fil_markets_runtime::util::AsDealErrors;
use fil_markets_runtime::{deal_error, DealError};
use fvm_ipld_encoding::to_vec;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::{PaddedPieceSize, UnpaddedPieceSize};
use fvm_shared::sector::SectorNumber;
use num_traits::Zero;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::node::{StorageClientNode, StorageCommon, StorageProviderNode};
use crate::types::{
    Balance, ClientDeal, ClientDealProposal, DealCompletion, DealProposal, MinerDeal, PackingResult,
};

fn poisoned() -> DealError {
    deal_error!(illegal_state; "test chain lock poisoned")
}

/// Deterministic stand-in for a wallet signature.
fn fake_signature(signer: &Address, data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(signer.to_bytes());
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[derive(Default)]
struct OnChainDeal {
    proposal_cid: Option<Cid>,
    sector: Option<SectorNumber>,
    precommitted: bool,
    active: bool,
    completion: Option<DealCompletion>,
}

#[derive(Default)]
struct ChainState {
    head: ChainEpoch,
    next_message: u64,
    messages: HashSet<Cid>,
    failed_messages: HashSet<Cid>,
    escrow: HashMap<Address, TokenAmount>,
    locked: HashMap<Address, TokenAmount>,
    workers: HashMap<Address, Address>,
    publishes: HashMap<Cid, DealID>,
    next_deal_id: DealID,
    deals: HashMap<DealID, OnChainDeal>,
    next_sector: SectorNumber,
    sectors: HashMap<SectorNumber, Vec<u8>>,
    hold_sealing: bool,
}

impl ChainState {
    fn message(&mut self, kind: &str) -> Result<Cid, DealError> {
        self.next_message += 1;
        let cid = raw_cid(format!("{}-{}", kind, self.next_message).as_bytes())?;
        self.messages.insert(cid);
        Ok(cid)
    }

    fn balance(&self, addr: &Address) -> Balance {
        let escrow = self.escrow.get(addr).cloned().unwrap_or_else(TokenAmount::zero);
        let locked = self.locked.get(addr).cloned().unwrap_or_else(TokenAmount::zero);
        Balance { available: &escrow - &locked, locked }
    }

    fn deal(&mut self, id: DealID) -> Result<&mut OnChainDeal, DealError> {
        self.deals.get_mut(&id).ok_or_else(|| deal_error!(not_found; "no deal {} on chain", id))
    }
}

/// Chain state shared by every test node: escrow balances, published deals and the sectors
/// holding them. Sealing runs as soon as a deal is handed off unless held.
pub struct TestChain {
    state: Mutex<ChainState>,
    changed: watch::Sender<u64>,
}

impl TestChain {
    pub fn new() -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(Self { state: Mutex::new(ChainState::default()), changed })
    }

    fn update<T>(&self, f: impl FnOnce(&mut ChainState) -> Result<T, DealError>) -> Result<T, DealError> {
        let res = f(&mut *self.state.lock().map_err(|_| poisoned())?);
        self.changed.send_modify(|version| *version += 1);
        res
    }

    /// Resolves once `check` returns a value, re-checking after every change to the chain.
    async fn wait_for<T>(&self, check: impl Fn(&ChainState) -> Option<Result<T, DealError>>) -> Result<T, DealError> {
        let mut changes = self.changed.subscribe();
        loop {
            let ready = {
                let state = self.state.lock().map_err(|_| poisoned())?;
                check(&state)
            };
            if let Some(res) = ready {
                return res;
            }
            changes.changed().await.map_err(|_| deal_error!(illegal_state; "test chain dropped"))?;
        }
    }

    pub fn set_head(&self, epoch: ChainEpoch) {
        let _ = self.update(|s| {
            s.head = epoch;
            Ok(())
        });
    }

    pub fn register_worker(&self, miner: Address, worker: Address) {
        let _ = self.update(|s| {
            s.workers.insert(miner, worker);
            Ok(())
        });
    }

    /// Credits `addr`'s escrow directly.
    pub fn fund(&self, addr: Address, amount: TokenAmount) {
        let _ = self.update(|s| {
            *s.escrow.entry(addr).or_insert_with(TokenAmount::zero) += amount;
            Ok(())
        });
    }

    pub fn balance(&self, addr: &Address) -> Balance {
        self.state.lock().map(|s| s.balance(addr)).unwrap_or_default()
    }

    /// Makes `wait_for_message` fail for `message`.
    pub fn fail_message(&self, message: Cid) {
        let _ = self.update(|s| {
            s.failed_messages.insert(message);
            Ok(())
        });
    }

    /// Keeps handed-off deals waiting for [`TestChain::precommit`] and [`TestChain::activate`].
    pub fn hold_sealing(&self, hold: bool) {
        let _ = self.update(|s| {
            s.hold_sealing = hold;
            Ok(())
        });
    }

    pub fn precommit(&self, deal_id: DealID) -> Result<(), DealError> {
        self.update(|s| {
            s.deal(deal_id)?.precommitted = true;
            Ok(())
        })
    }

    pub fn activate(&self, deal_id: DealID) -> Result<(), DealError> {
        self.update(|s| {
            let deal = s.deal(deal_id)?;
            deal.precommitted = true;
            deal.active = true;
            Ok(())
        })
    }

    pub fn expire(&self, deal_id: DealID) -> Result<(), DealError> {
        self.update(|s| {
            s.deal(deal_id)?.completion = Some(DealCompletion::Expired);
            Ok(())
        })
    }

    pub fn slash(&self, deal_id: DealID, epoch: ChainEpoch) -> Result<(), DealError> {
        self.update(|s| {
            s.deal(deal_id)?.completion = Some(DealCompletion::Slashed(epoch));
            Ok(())
        })
    }

    /// Deals published so far.
    pub fn deal_ids(&self) -> Vec<DealID> {
        let mut ids: Vec<DealID> = self.state.lock().map(|s| s.deals.keys().copied().collect()).unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// The piece data sealed into `sector`.
    pub fn sector_data(&self, sector: SectorNumber) -> Option<Vec<u8>> {
        self.state.lock().ok().and_then(|s| s.sectors.get(&sector).cloned())
    }
}

#[derive(Default)]
struct Faults {
    corrupt_signatures: AtomicBool,
    fail_reserve: AtomicBool,
    fail_publish: AtomicBool,
    fail_handoff: AtomicBool,
}

/// A client or provider node on a [`TestChain`]. Signatures are hashes of the signer and the
/// signed bytes.
pub struct TestStorageNode {
    chain: Arc<TestChain>,
    faults: Faults,
}

impl TestStorageNode {
    pub fn new(chain: Arc<TestChain>) -> Self {
        Self { chain, faults: Faults::default() }
    }

    pub fn chain(&self) -> &Arc<TestChain> {
        &self.chain
    }

    /// Makes every signature this node produces invalid.
    pub fn corrupt_signatures(&self, on: bool) {
        self.faults.corrupt_signatures.store(on, Ordering::SeqCst);
    }

    pub fn fail_reserve_funds(&self, on: bool) {
        self.faults.fail_reserve.store(on, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, on: bool) {
        self.faults.fail_publish.store(on, Ordering::SeqCst);
    }

    pub fn fail_handoff(&self, on: bool) {
        self.faults.fail_handoff.store(on, Ordering::SeqCst);
    }

    fn sign(&self, signer: &Address, data: &[u8]) -> Signature {
        let mut bytes = fake_signature(signer, data);
        if self.faults.corrupt_signatures.load(Ordering::SeqCst) {
            bytes.iter_mut().for_each(|b| *b = !*b);
        }
        Signature::new_secp256k1(bytes)
    }
}

#[async_trait]
impl StorageCommon for TestStorageNode {
    async fn add_funds(&self, addr: &Address, amount: &TokenAmount) -> Result<Cid, DealError> {
        self.chain.update(|s| {
            *s.escrow.entry(*addr).or_insert_with(TokenAmount::zero) += amount;
            s.message("add-funds")
        })
    }

    async fn reserve_funds(
        &self,
        _wallet: &Address,
        addr: &Address,
        amount: &TokenAmount,
    ) -> Result<Option<Cid>, DealError> {
        if self.faults.fail_reserve.load(Ordering::SeqCst) {
            return Err(deal_error!(insufficient_funds; "not enough funds in wallet"));
        }
        self.chain.update(|s| {
            let available = s.balance(addr).available;
            if available >= *amount {
                return Ok(None);
            }
            let shortfall = amount - &available;
            *s.escrow.entry(*addr).or_insert_with(TokenAmount::zero) += shortfall;
            s.message("add-funds").map(Some)
        })
    }

    async fn release_funds(&self, _addr: &Address, _amount: &TokenAmount) -> Result<(), DealError> {
        Ok(())
    }

    async fn get_balance(&self, addr: &Address) -> Result<Balance, DealError> {
        let state = self.chain.state.lock().map_err(|_| poisoned())?;
        Ok(state.balance(addr))
    }

    async fn verify_signature(
        &self,
        signature: &Signature,
        signer: &Address,
        plaintext: &[u8],
    ) -> Result<bool, DealError> {
        Ok(signature.bytes() == fake_signature(signer, plaintext).as_slice())
    }

    async fn sign_bytes(&self, signer: &Address, data: &[u8]) -> Result<Signature, DealError> {
        Ok(self.sign(signer, data))
    }

    async fn get_miner_worker_address(&self, miner: &Address) -> Result<Address, DealError> {
        let state = self.chain.state.lock().map_err(|_| poisoned())?;
        state.workers.get(miner).copied().ok_or_else(|| deal_error!(not_found; "miner actor {} not found", miner))
    }

    async fn wait_for_message(&self, message: &Cid) -> Result<(), DealError> {
        let state = self.chain.state.lock().map_err(|_| poisoned())?;
        if state.failed_messages.contains(message) {
            return Err(deal_error!(illegal_state; "message {} failed with exit code 16", message));
        }
        if !state.messages.contains(message) {
            return Err(deal_error!(not_found; "message {} not found", message));
        }
        Ok(())
    }

    async fn get_chain_head(&self) -> Result<ChainEpoch, DealError> {
        Ok(self.chain.state.lock().map_err(|_| poisoned())?.head)
    }

    async fn on_deal_sector_pre_committed(
        &self,
        _provider: &Address,
        deal_id: DealID,
        _proposal: &DealProposal,
        _publish_cid: Option<Cid>,
    ) -> Result<SectorNumber, DealError> {
        self.chain
            .wait_for(|s| {
                let deal = s.deals.get(&deal_id)?;
                match (deal.sector, deal.precommitted) {
                    (Some(sector), true) => Some(Ok(sector)),
                    _ => None,
                }
            })
            .await
    }

    async fn on_deal_sector_committed(
        &self,
        _provider: &Address,
        deal_id: DealID,
        _sector: SectorNumber,
        _proposal: &DealProposal,
    ) -> Result<(), DealError> {
        self.chain.wait_for(|s| s.deals.get(&deal_id).filter(|d| d.active).map(|_| Ok(()))).await
    }

    async fn on_deal_expired_or_slashed(&self, deal_id: DealID) -> Result<DealCompletion, DealError> {
        self.chain.wait_for(|s| s.deals.get(&deal_id).and_then(|d| d.completion).map(Ok)).await
    }
}

#[async_trait]
impl StorageClientNode for TestStorageNode {
    async fn sign_proposal(&self, signer: &Address, proposal: DealProposal) -> Result<ClientDealProposal, DealError> {
        let bytes = to_vec(&proposal).or_serialization("encoding deal proposal")?;
        Ok(ClientDealProposal { client_signature: self.sign(signer, &bytes), proposal })
    }

    async fn validate_published_deal(&self, deal: &ClientDeal) -> Result<DealID, DealError> {
        let publish = deal
            .publish_message
            .ok_or_else(|| deal_error!(illegal_argument; "deal {} has no publish message", deal.proposal_cid))?;
        let state = self.chain.state.lock().map_err(|_| poisoned())?;
        let id = *state
            .publishes
            .get(&publish)
            .ok_or_else(|| deal_error!(not_found; "publish message {} not found", publish))?;
        let on_chain = state.deals.get(&id).and_then(|d| d.proposal_cid);
        if on_chain != Some(deal.proposal_cid) {
            return Err(deal_error!(illegal_state; "deal proposal {} not found in publish message", deal.proposal_cid));
        }
        Ok(id)
    }
}

#[async_trait]
impl StorageProviderNode for TestStorageNode {
    async fn publish_deals(&self, deal: &MinerDeal) -> Result<Cid, DealError> {
        if self.faults.fail_publish.load(Ordering::SeqCst) {
            return Err(deal_error!(illegal_state; "publish message failed to send"));
        }
        let proposal = deal.proposal();
        self.chain.update(|s| {
            let message = s.message("publish")?;
            s.next_deal_id += 1;
            let id = s.next_deal_id;
            *s.locked.entry(proposal.client).or_insert_with(TokenAmount::zero) +=
                proposal.client_balance_requirement();
            *s.locked.entry(proposal.provider).or_insert_with(TokenAmount::zero) +=
                proposal.provider_balance_requirement();
            s.deals.insert(
                id,
                OnChainDeal { proposal_cid: Some(deal.proposal_cid), ..Default::default() },
            );
            s.publishes.insert(message, id);
            Ok(message)
        })
    }

    async fn wait_for_publish_deals(&self, publish_cid: &Cid, _proposal: &DealProposal) -> Result<DealID, DealError> {
        self.wait_for_message(publish_cid).await?;
        let state = self.chain.state.lock().map_err(|_| poisoned())?;
        state
            .publishes
            .get(publish_cid)
            .copied()
            .ok_or_else(|| deal_error!(not_found; "no deals in publish message {}", publish_cid))
    }

    async fn on_deal_complete(
        &self,
        deal: &MinerDeal,
        _piece_size: UnpaddedPieceSize,
        piece_data: Vec<u8>,
    ) -> Result<PackingResult, DealError> {
        if self.faults.fail_handoff.load(Ordering::SeqCst) {
            return Err(deal_error!(illegal_state; "sealing subsystem unavailable"));
        }
        let deal_id = deal.deal_id.ok_or_else(|| deal_error!(illegal_state; "deal was not published"))?;
        let size = deal.proposal().piece_size;
        self.chain.update(|s| {
            s.next_sector += 1;
            let sector = s.next_sector;
            s.sectors.insert(sector, piece_data);
            let hold = s.hold_sealing;
            let on_chain = s.deal(deal_id)?;
            on_chain.sector = Some(sector);
            on_chain.precommitted = !hold;
            on_chain.active = !hold;
            Ok(PackingResult { sector_number: sector, offset: PaddedPieceSize(0), size })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_tops_up_escrow_only_when_short() {
        let chain = TestChain::new();
        let node = TestStorageNode::new(chain.clone());
        let client = Address::new_id(100);
        chain.fund(client, TokenAmount::from_atto(500));

        let none = node.reserve_funds(&client, &client, &TokenAmount::from_atto(400)).await.unwrap();
        assert!(none.is_none());
        let msg = node.reserve_funds(&client, &client, &TokenAmount::from_atto(800)).await.unwrap().unwrap();
        node.wait_for_message(&msg).await.unwrap();
        assert_eq!(chain.balance(&client).available, TokenAmount::from_atto(800));
    }

    #[tokio::test]
    async fn signatures_verify_only_for_signer_and_data() {
        let node = TestStorageNode::new(TestChain::new());
        let signer = Address::new_id(1);
        let sig = node.sign_bytes(&signer, b"hello").await.unwrap();
        assert!(node.verify_signature(&sig, &signer, b"hello").await.unwrap());
        assert!(!node.verify_signature(&sig, &Address::new_id(2), b"hello").await.unwrap());
        assert!(!node.verify_signature(&sig, &signer, b"bye").await.unwrap());

        node.corrupt_signatures(true);
        let bad = node.sign_bytes(&signer, b"hello").await.unwrap();
        assert!(!node.verify_signature(&bad, &signer, b"hello").await.unwrap());
    }

    #[tokio::test]
    async fn completion_waits_for_chain() {
        let chain = TestChain::new();
        let node = Arc::new(TestStorageNode::new(chain.clone()));
        chain.update(|s| {
            s.deals.insert(1, OnChainDeal::default());
            Ok(())
        })
        .unwrap();

        let waiter = {
            let node = node.clone();
            tokio::spawn(async move { node.on_deal_expired_or_slashed(1).await })
        };
        tokio::task::yield_now().await;
        chain.slash(1, 42).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), DealCompletion::Slashed(42));
    }
}

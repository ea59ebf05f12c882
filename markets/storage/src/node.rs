// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use cid::Cid;
use fil_markets_runtime::DealError;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::UnpaddedPieceSize;
use fvm_shared::sector::SectorNumber;

use crate::types::{
    Balance, ClientDeal, ClientDealProposal, DealCompletion, DealProposal, MinerDeal, PackingResult,
};

/// Chain and wallet operations both sides of a storage deal need.
#[async_trait]
pub trait StorageCommon: Send + Sync {
    /// Moves `amount` from the wallet into `addr`'s market escrow.
    async fn add_funds(&self, addr: &Address, amount: &TokenAmount) -> Result<Cid, DealError>;

    /// Sets `amount` of `addr`'s escrow aside for a deal, topping the escrow up from `wallet`
    /// first when it is too small. Returns the CID of the top-up message, if one was sent.
    async fn reserve_funds(
        &self,
        wallet: &Address,
        addr: &Address,
        amount: &TokenAmount,
    ) -> Result<Option<Cid>, DealError>;

    async fn release_funds(&self, addr: &Address, amount: &TokenAmount) -> Result<(), DealError>;

    async fn get_balance(&self, addr: &Address) -> Result<Balance, DealError>;

    async fn verify_signature(
        &self,
        signature: &Signature,
        signer: &Address,
        plaintext: &[u8],
    ) -> Result<bool, DealError>;

    async fn sign_bytes(&self, signer: &Address, data: &[u8]) -> Result<Signature, DealError>;

    async fn get_miner_worker_address(&self, miner: &Address) -> Result<Address, DealError>;

    /// Resolves once `message` has executed successfully, failing if it did not.
    async fn wait_for_message(&self, message: &Cid) -> Result<(), DealError>;

    async fn get_chain_head(&self) -> Result<ChainEpoch, DealError>;

    /// Resolves with the sector once the deal's sector is pre-committed.
    async fn on_deal_sector_pre_committed(
        &self,
        provider: &Address,
        deal_id: DealID,
        proposal: &DealProposal,
        publish_cid: Option<Cid>,
    ) -> Result<SectorNumber, DealError>;

    /// Resolves once the deal's sector is proven and the deal active.
    async fn on_deal_sector_committed(
        &self,
        provider: &Address,
        deal_id: DealID,
        sector: SectorNumber,
        proposal: &DealProposal,
    ) -> Result<(), DealError>;

    async fn on_deal_expired_or_slashed(&self, deal_id: DealID) -> Result<DealCompletion, DealError>;
}

/// What a storage client needs on top of [`StorageCommon`].
#[async_trait]
pub trait StorageClientNode: StorageCommon {
    async fn sign_proposal(&self, signer: &Address, proposal: DealProposal) -> Result<ClientDealProposal, DealError>;

    /// Checks the deal's publish message on chain and returns the deal's on-chain ID.
    async fn validate_published_deal(&self, deal: &ClientDeal) -> Result<DealID, DealError>;
}

/// What a storage provider needs on top of [`StorageCommon`].
#[async_trait]
pub trait StorageProviderNode: StorageCommon {
    /// Sends the message publishing the deal and returns its CID.
    async fn publish_deals(&self, deal: &MinerDeal) -> Result<Cid, DealError>;

    /// Waits for the publish message and returns the deal's on-chain ID.
    async fn wait_for_publish_deals(&self, publish_cid: &Cid, proposal: &DealProposal) -> Result<DealID, DealError>;

    /// Hands the piece over to the sealing subsystem.
    async fn on_deal_complete(
        &self,
        deal: &MinerDeal,
        piece_size: UnpaddedPieceSize,
        piece_data: Vec<u8>,
    ) -> Result<PackingResult, DealError>;
}

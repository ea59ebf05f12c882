// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use cid::Cid;
use fil_markets_runtime::fsm::DealRecord;
use fil_markets_runtime::network::PeerId;
use fil_markets_runtime::util::cid::{cid_of, BLAKE2B_256, DAG_CBOR};
use fil_markets_runtime::util::AsDealErrors;
use fil_markets_runtime::DealError;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::to_vec;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::SectorNumber;
use num_derive::FromPrimitive;
use num_traits::Zero;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::transfer::ChannelId;

/// Schema version of client and provider deal records.
pub const DEAL_STATE_VERSION: u64 = 1;

/// Transfer types a [`DataRef`] may name.
pub const TRANSFER_GRAPHSYNC: &str = "graphsync";
pub const TRANSFER_MANUAL: &str = "manual";

/// Bytes in the GiB that ask prices are quoted per.
pub const GIB: u64 = 1 << 30;

/// Status of a storage deal, shared by both sides and carried in deal responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, Serialize_repr, Deserialize_repr)]
#[repr(u64)]
pub enum StorageDealStatus {
    Unknown = 0,
    ProposalNotFound = 1,
    ProposalRejected = 2,
    ProposalAccepted = 3,
    Staged = 4,
    Sealing = 5,
    Finalizing = 6,
    Active = 7,
    Expired = 8,
    Slashed = 9,
    Rejecting = 10,
    Failing = 11,
    FundsReserved = 12,
    CheckForAcceptance = 13,
    Validating = 14,
    AcceptWait = 15,
    StartDataTransfer = 16,
    Transferring = 17,
    WaitingForData = 18,
    VerifyData = 19,
    ReserveProviderFunds = 20,
    ReserveClientFunds = 21,
    ProviderFunding = 22,
    ClientFunding = 23,
    Publish = 24,
    Publishing = 25,
    Error = 26,
    ProviderTransferAwaitRestart = 27,
    ClientTransferRestart = 28,
    AwaitingPreCommit = 29,
}

impl StorageDealStatus {
    /// Statuses a deal never leaves, on either side.
    pub const FINALITY: [StorageDealStatus; 3] =
        [StorageDealStatus::Error, StorageDealStatus::Expired, StorageDealStatus::Slashed];

    pub fn is_final(&self) -> bool {
        Self::FINALITY.contains(self)
    }
}

impl fmt::Display for StorageDealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageDeal{:?}", self)
    }
}

/// Terms of a storage deal as they go on chain.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,
    pub label: String,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: TokenAmount,
    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

impl DealProposal {
    pub fn duration(&self) -> ChainEpoch {
        self.end_epoch - self.start_epoch
    }

    pub fn total_storage_fee(&self) -> TokenAmount {
        &self.storage_price_per_epoch * self.duration()
    }

    pub fn client_balance_requirement(&self) -> TokenAmount {
        &self.client_collateral + self.total_storage_fee()
    }

    pub fn provider_balance_requirement(&self) -> &TokenAmount {
        &self.provider_collateral
    }
}

/// A deal proposal with the client's signature over its encoding.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

impl ClientDealProposal {
    /// Content address of the signed proposal; the key of the deal on both sides.
    pub fn cid(&self) -> Result<Cid, DealError> {
        let bytes = to_vec(self).or_serialization("encoding signed deal proposal")?;
        cid_of(DAG_CBOR, BLAKE2B_256, &bytes)
    }
}

/// How the payload of a deal reaches the provider.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct DataRef {
    /// `graphsync` for a pushed transfer, `manual` for an out-of-band import.
    pub transfer_type: String,
    pub root: Cid,
    /// Precomputed commitment; computed from the payload when absent.
    pub piece_cid: Option<Cid>,
    pub piece_size: Option<PaddedPieceSize>,
}

impl DataRef {
    pub fn graphsync(root: Cid) -> Self {
        Self { transfer_type: TRANSFER_GRAPHSYNC.to_string(), root, piece_cid: None, piece_size: None }
    }

    pub fn manual(root: Cid, piece_cid: Cid, piece_size: PaddedPieceSize) -> Self {
        Self {
            transfer_type: TRANSFER_MANUAL.to_string(),
            root,
            piece_cid: Some(piece_cid),
            piece_size: Some(piece_size),
        }
    }

    pub fn is_manual(&self) -> bool {
        self.transfer_type == TRANSFER_MANUAL
    }
}

/// Terms a provider offers for storing data.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct StorageAsk {
    /// Price per GiB per epoch.
    pub price: TokenAmount,
    pub verified_price: TokenAmount,
    pub min_piece_size: PaddedPieceSize,
    pub max_piece_size: PaddedPieceSize,
    pub miner: Address,
    pub timestamp: ChainEpoch,
    pub expiry: ChainEpoch,
    pub seq_no: u64,
}

impl StorageAsk {
    /// Lowest acceptable price per epoch for a piece of `size`.
    pub fn min_price_per_epoch(&self, size: PaddedPieceSize, verified: bool) -> TokenAmount {
        let price = if verified { &self.verified_price } else { &self.price };
        (price * size.0).div_floor(GIB)
    }
}

/// An ask signed by the miner's worker.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct SignedStorageAsk {
    pub ask: StorageAsk,
    pub signature: Signature,
}

/// Escrow held by the market for an address.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, Default, PartialEq, Eq)]
pub struct Balance {
    pub locked: TokenAmount,
    pub available: TokenAmount,
}

/// Voucher sent with a data-transfer request, naming the deal the data belongs to.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct StorageDataTransferVoucher {
    pub proposal: Cid,
}

/// Where the sealing subsystem put a handed-off piece.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackingResult {
    pub sector_number: SectorNumber,
    pub offset: PaddedPieceSize,
    pub size: PaddedPieceSize,
}

/// How an active deal ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DealCompletion {
    Expired,
    Slashed(ChainEpoch),
}

/// Everything a client needs to reach a storage provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageProviderInfo {
    pub address: Address,
    pub worker: Address,
    pub peer_id: PeerId,
}

/// Arguments of [`StorageClient::propose_storage_deal`](crate::StorageClient::propose_storage_deal).
#[derive(Clone, Debug)]
pub struct ProposeStorageDealParams {
    pub wallet: Address,
    pub provider: StorageProviderInfo,
    pub data: DataRef,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub price_per_epoch: TokenAmount,
    pub collateral: TokenAmount,
    pub verified_deal: bool,
    pub label: String,
}

/// A deal as tracked by the client.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct ClientDeal {
    pub client_deal_proposal: ClientDealProposal,
    pub proposal_cid: Cid,
    pub add_funds_cid: Option<Cid>,
    pub state: StorageDealStatus,
    pub miner: PeerId,
    pub miner_worker: Address,
    pub deal_id: Option<DealID>,
    pub data_ref: DataRef,
    pub message: String,
    pub publish_message: Option<Cid>,
    pub sector_number: Option<SectorNumber>,
    pub slash_epoch: ChainEpoch,
    pub poll_retry_count: u64,
    pub poll_error_count: u64,
    pub funds_reserved: TokenAmount,
    pub transfer_channel_id: Option<ChannelId>,
}

impl ClientDeal {
    pub fn new(
        client_deal_proposal: ClientDealProposal,
        proposal_cid: Cid,
        miner: PeerId,
        miner_worker: Address,
        data_ref: DataRef,
    ) -> Self {
        Self {
            client_deal_proposal,
            proposal_cid,
            add_funds_cid: None,
            state: StorageDealStatus::Unknown,
            miner,
            miner_worker,
            deal_id: None,
            data_ref,
            message: String::new(),
            publish_message: None,
            sector_number: None,
            slash_epoch: -1,
            poll_retry_count: 0,
            poll_error_count: 0,
            funds_reserved: TokenAmount::zero(),
            transfer_channel_id: None,
        }
    }

    pub fn proposal(&self) -> &DealProposal {
        &self.client_deal_proposal.proposal
    }
}

impl DealRecord for ClientDeal {
    type Key = Cid;
    type Status = StorageDealStatus;

    fn key(&self) -> Cid {
        self.proposal_cid
    }
    fn status(&self) -> StorageDealStatus {
        self.state
    }
    fn set_status(&mut self, status: StorageDealStatus) {
        self.state = status
    }
}

/// A deal as tracked by the provider.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct MinerDeal {
    pub client_deal_proposal: ClientDealProposal,
    pub proposal_cid: Cid,
    pub add_funds_cid: Option<Cid>,
    pub publish_cid: Option<Cid>,
    pub client: PeerId,
    pub state: StorageDealStatus,
    pub message: String,
    pub data_ref: DataRef,
    pub deal_id: Option<DealID>,
    pub sector_number: Option<SectorNumber>,
    pub offset: Option<PaddedPieceSize>,
    pub funds_reserved: TokenAmount,
    pub transfer_channel_id: Option<ChannelId>,
}

impl MinerDeal {
    pub fn new(client_deal_proposal: ClientDealProposal, proposal_cid: Cid, client: PeerId, data_ref: DataRef) -> Self {
        Self {
            client_deal_proposal,
            proposal_cid,
            add_funds_cid: None,
            publish_cid: None,
            client,
            state: StorageDealStatus::Unknown,
            message: String::new(),
            data_ref,
            deal_id: None,
            sector_number: None,
            offset: None,
            funds_reserved: TokenAmount::zero(),
            transfer_channel_id: None,
        }
    }

    pub fn proposal(&self) -> &DealProposal {
        &self.client_deal_proposal.proposal
    }

    /// What the deal status protocol reports for this deal.
    pub fn provider_state(&self) -> ProviderDealState {
        ProviderDealState {
            state: self.state,
            message: self.message.clone(),
            proposal: Some(self.proposal().clone()),
            proposal_cid: self.proposal_cid,
            add_funds_cid: self.add_funds_cid,
            publish_cid: self.publish_cid,
            deal_id: self.deal_id,
        }
    }
}

impl DealRecord for MinerDeal {
    type Key = Cid;
    type Status = StorageDealStatus;

    fn key(&self) -> Cid {
        self.proposal_cid
    }
    fn status(&self) -> StorageDealStatus {
        self.state
    }
    fn set_status(&mut self, status: StorageDealStatus) {
        self.state = status
    }
}

/// The provider's view of a deal, as returned by the deal status protocol.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct ProviderDealState {
    pub state: StorageDealStatus,
    pub message: String,
    pub proposal: Option<DealProposal>,
    pub proposal_cid: Cid,
    pub add_funds_cid: Option<Cid>,
    pub publish_cid: Option<Cid>,
    pub deal_id: Option<DealID>,
}

impl ProviderDealState {
    pub fn not_found(proposal_cid: Cid) -> Self {
        Self {
            state: StorageDealStatus::ProposalNotFound,
            message: String::new(),
            proposal: None,
            proposal_cid,
            add_funds_cid: None,
            publish_cid: None,
            deal_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use fil_markets_runtime::util::cid::raw_cid;
    use fvm_ipld_encoding::from_slice;

    use super::*;

    fn proposal() -> DealProposal {
        DealProposal {
            piece_cid: raw_cid(b"piece").unwrap(),
            piece_size: PaddedPieceSize(2048),
            verified_deal: false,
            client: Address::new_id(100),
            provider: Address::new_id(200),
            label: "label".to_string(),
            start_epoch: 100,
            end_epoch: 300,
            storage_price_per_epoch: TokenAmount::from_atto(10),
            provider_collateral: TokenAmount::from_atto(7),
            client_collateral: TokenAmount::from_atto(5),
        }
    }

    #[test]
    fn balance_requirements() {
        let p = proposal();
        assert_eq!(p.duration(), 200);
        assert_eq!(p.total_storage_fee(), TokenAmount::from_atto(2000));
        assert_eq!(p.client_balance_requirement(), TokenAmount::from_atto(2005));
        assert_eq!(p.provider_balance_requirement(), &TokenAmount::from_atto(7));
    }

    #[test]
    fn proposal_cid_covers_signature() {
        let a = ClientDealProposal { proposal: proposal(), client_signature: Signature::new_secp256k1(vec![1; 65]) };
        let mut b = a.clone();
        b.client_signature = Signature::new_secp256k1(vec![2; 65]);
        assert_eq!(a.cid().unwrap(), a.clone().cid().unwrap());
        assert_ne!(a.cid().unwrap(), b.cid().unwrap());
        assert_eq!(a.cid().unwrap().hash().code(), BLAKE2B_256);
    }

    #[test]
    fn ask_price_scales_with_piece_size() {
        let ask = StorageAsk {
            price: TokenAmount::from_atto(GIB),
            verified_price: TokenAmount::from_atto(GIB / 2),
            min_piece_size: PaddedPieceSize(256),
            max_piece_size: PaddedPieceSize(1 << 20),
            miner: Address::new_id(200),
            timestamp: 0,
            expiry: 100,
            seq_no: 0,
        };
        assert_eq!(ask.min_price_per_epoch(PaddedPieceSize(2048), false), TokenAmount::from_atto(2048));
        assert_eq!(ask.min_price_per_epoch(PaddedPieceSize(2048), true), TokenAmount::from_atto(1024));
    }

    #[test]
    fn status_encodes_as_integer() {
        let bytes = to_vec(&StorageDealStatus::AwaitingPreCommit).unwrap();
        assert_eq!(from_slice::<u64>(&bytes).unwrap(), 29);
        assert_eq!(StorageDealStatus::Transferring.to_string(), "StorageDealTransferring");
        assert!(StorageDealStatus::Slashed.is_final());
        assert!(!StorageDealStatus::Active.is_final());
    }
}

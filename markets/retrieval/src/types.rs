// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::fmt;

use cid::Cid;
use fil_markets_runtime::fsm::DealRecord;
use fil_markets_runtime::network::PeerId;
use fil_markets_runtime::piecestore::PieceInfo;
use fil_markets_runtime::statestore::StateKey;
use fil_markets_runtime::traversal::{Selector, TraversalState};
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{from_slice, strict_bytes, to_vec};
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use num_derive::FromPrimitive;
use num_traits::Zero;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Identifier of a retrieval deal, unique per client.
pub type DealId = u64;

/// Schema version of client and provider deal records.
pub const DEAL_STATE_VERSION: u64 = 1;

pub const DEFAULT_PRICE_PER_BYTE: u64 = 2;
pub const DEFAULT_PAYMENT_INTERVAL: u64 = 1 << 20;
pub const DEFAULT_PAYMENT_INTERVAL_INCREASE: u64 = 1 << 20;

/// Status of a retrieval deal, shared by both sides and carried in deal responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum DealStatus {
    New = 0,
    Unsealing = 1,
    WaitForAcceptance = 3,
    PaymentChannelCreating = 4,
    Accepted = 6,
    FundsNeededUnseal = 7,
    Failing = 8,
    Rejected = 9,
    FundsNeeded = 10,
    Ongoing = 13,
    FundsNeededLastPayment = 14,
    Completed = 15,
    DealNotFound = 16,
    Errored = 17,
    Finalizing = 19,
    CheckFunds = 22,
    InsufficientFunds = 23,
    PaymentChannelAllocatingLane = 24,
    Cancelling = 25,
    Cancelled = 26,
}

impl DealStatus {
    /// Statuses a deal never leaves, on either side.
    pub const FINALITY: [DealStatus; 5] = [
        DealStatus::Completed,
        DealStatus::Errored,
        DealStatus::Rejected,
        DealStatus::DealNotFound,
        DealStatus::Cancelled,
    ];

    pub fn is_final(&self) -> bool {
        Self::FINALITY.contains(self)
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DealStatus{:?}", self)
    }
}

/// Terms of a retrieval deal.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Params {
    /// Sub-DAG to retrieve. `None` retrieves the whole DAG.
    pub selector: Option<Selector>,
    /// Restricts the retrieval to one piece holding the payload.
    pub piece_cid: Option<Cid>,
    pub price_per_byte: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
    pub unseal_price: TokenAmount,
}

impl Params {
    pub fn new(
        price_per_byte: TokenAmount,
        payment_interval: u64,
        payment_interval_increase: u64,
        unseal_price: TokenAmount,
    ) -> Self {
        Self {
            selector: None,
            piece_cid: None,
            price_per_byte,
            payment_interval,
            payment_interval_increase,
            unseal_price,
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_piece(mut self, piece_cid: Cid) -> Self {
        self.piece_cid = Some(piece_cid);
        self
    }

    /// The selector to traverse with.
    pub fn selector(&self) -> Selector {
        self.selector.clone().unwrap_or_else(Selector::all)
    }
}

/// Opening message of the deal protocol.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct DealProposal {
    pub payload_cid: Cid,
    pub id: DealId,
    pub params: Params,
}

/// One block on the wire: the CID prefix and the block bytes it hashes.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    #[serde(with = "strict_bytes")]
    pub prefix: Vec<u8>,
    #[serde(with = "strict_bytes")]
    pub data: Vec<u8>,
}

/// Provider to client message. Carries blocks while the deal is ongoing and payment requests
/// when the provider pauses.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct DealResponse {
    pub status: DealStatus,
    pub id: DealId,
    pub payment_owed: TokenAmount,
    pub message: String,
    pub blocks: Vec<Block>,
}

impl DealResponse {
    pub fn new(status: DealStatus, id: DealId) -> Self {
        Self { status, id, payment_owed: TokenAmount::zero(), message: String::new(), blocks: Vec::new() }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// A payment channel voucher. `amount` is cumulative over the lane.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct SignedVoucher {
    pub channel_addr: Address,
    pub lane: u64,
    pub nonce: u64,
    pub amount: TokenAmount,
    pub signature: Option<Signature>,
}

/// Client to provider payment message.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct DealPayment {
    pub id: DealId,
    pub payment_channel: Address,
    pub payment_voucher: SignedVoucher,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub piece_cid: Option<Cid>,
}

/// Asks a provider whether, and on what terms, it can serve a payload.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub payload_cid: Cid,
    pub params: QueryParams,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum QueryResponseStatus {
    Available = 0,
    Unavailable = 1,
    Error = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum QueryItemStatus {
    Available = 0,
    Unavailable = 1,
    Unknown = 2,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct QueryResponse {
    pub status: QueryResponseStatus,
    pub piece_cid_found: QueryItemStatus,
    /// Unpadded size of the payload's piece.
    pub size: u64,
    pub payment_address: Address,
    pub min_price_per_byte: TokenAmount,
    pub max_payment_interval: u64,
    pub max_payment_interval_increase: u64,
    pub message: String,
    pub unseal_price: TokenAmount,
}

impl QueryResponse {
    /// What retrieving the whole piece costs at the advertised price.
    pub fn piece_retrieval_price(&self) -> TokenAmount {
        TokenAmount::from_atto(self.min_price_per_byte.atto() * self.size) + &self.unseal_price
    }
}

/// A provider's retrieval terms.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct Ask {
    pub price_per_byte: TokenAmount,
    pub unseal_price: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
}

impl Default for Ask {
    fn default() -> Self {
        Self {
            price_per_byte: TokenAmount::from_atto(DEFAULT_PRICE_PER_BYTE),
            unseal_price: TokenAmount::zero(),
            payment_interval: DEFAULT_PAYMENT_INTERVAL,
            payment_interval_increase: DEFAULT_PAYMENT_INTERVAL_INCREASE,
        }
    }
}

/// A provider as the client addresses it.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct RetrievalPeer {
    pub address: Address,
    pub id: PeerId,
    pub piece_cid: Option<Cid>,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct PaymentInfo {
    pub pay_ch: Address,
    pub lane: u64,
}

/// How far a deal's block transfer has got.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    /// Bytes moved by this step.
    pub bytes: u64,
    pub traversal: TraversalState,
    pub complete: bool,
}

/// The client's record of a retrieval deal.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct ClientDealState {
    pub proposal: DealProposal,
    pub status: DealStatus,
    /// The provider's peer.
    pub sender: PeerId,
    pub total_funds: TokenAmount,
    pub client_wallet: Address,
    pub miner_wallet: Address,
    pub payment_info: Option<PaymentInfo>,
    pub wait_msg_cid: Option<Cid>,
    pub total_received: u64,
    pub message: String,
    pub bytes_paid_for: u64,
    pub current_interval: u64,
    pub payment_requested: TokenAmount,
    pub funds_spent: TokenAmount,
    pub unseal_funds_paid: TokenAmount,
    pub last_payment_requested: bool,
    pub all_blocks_received: bool,
    pub traversal: Option<TraversalState>,
}

impl ClientDealState {
    pub fn new(
        proposal: DealProposal,
        sender: PeerId,
        total_funds: TokenAmount,
        client_wallet: Address,
        miner_wallet: Address,
    ) -> Self {
        let current_interval = proposal.params.payment_interval;
        Self {
            proposal,
            status: DealStatus::New,
            sender,
            total_funds,
            client_wallet,
            miner_wallet,
            payment_info: None,
            wait_msg_cid: None,
            total_received: 0,
            message: String::new(),
            bytes_paid_for: 0,
            current_interval,
            payment_requested: TokenAmount::zero(),
            funds_spent: TokenAmount::zero(),
            unseal_funds_paid: TokenAmount::zero(),
            last_payment_requested: false,
            all_blocks_received: false,
            traversal: None,
        }
    }

    pub fn id(&self) -> DealId {
        self.proposal.id
    }

    pub fn payload_cid(&self) -> &Cid {
        &self.proposal.payload_cid
    }
}

impl DealRecord for ClientDealState {
    type Key = DealId;
    type Status = DealStatus;

    fn key(&self) -> DealId {
        self.proposal.id
    }
    fn status(&self) -> DealStatus {
        self.status
    }
    fn set_status(&mut self, status: DealStatus) {
        self.status = status
    }
}

/// Provider-side key of a deal: deal IDs are only unique per client.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderDealIdentifier {
    pub receiver: PeerId,
    pub deal_id: DealId,
}

impl fmt::Display for ProviderDealIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.receiver, self.deal_id)
    }
}

impl StateKey for ProviderDealIdentifier {
    fn from_bytes(b: &[u8]) -> Result<Self, String> {
        from_slice(b).map_err(|e| e.to_string())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, String> {
        to_vec(self).map_err(|e| e.to_string())
    }
}

/// The provider's record of a retrieval deal.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct ProviderDealState {
    pub proposal: DealProposal,
    pub status: DealStatus,
    /// The client's peer.
    pub receiver: PeerId,
    pub piece_info: Option<PieceInfo>,
    pub total_sent: u64,
    /// Bytes sent when payment was last requested.
    pub bytes_billed: u64,
    pub funds_received: TokenAmount,
    pub current_interval: u64,
    pub message: String,
    pub traversal: Option<TraversalState>,
}

impl ProviderDealState {
    pub fn new(proposal: DealProposal, receiver: PeerId) -> Self {
        let current_interval = proposal.params.payment_interval;
        Self {
            proposal,
            status: DealStatus::New,
            receiver,
            piece_info: None,
            total_sent: 0,
            bytes_billed: 0,
            funds_received: TokenAmount::zero(),
            current_interval,
            message: String::new(),
            traversal: None,
        }
    }

    pub fn identifier(&self) -> ProviderDealIdentifier {
        ProviderDealIdentifier { receiver: self.receiver.clone(), deal_id: self.proposal.id }
    }

    /// Unseal fee plus the price of every byte sent so far, less what has been paid.
    pub fn payment_owed(&self) -> TokenAmount {
        let params = &self.proposal.params;
        let due = TokenAmount::from_atto(params.price_per_byte.atto() * self.total_sent) + &params.unseal_price;
        due - &self.funds_received
    }
}

impl DealRecord for ProviderDealState {
    type Key = ProviderDealIdentifier;
    type Status = DealStatus;

    fn key(&self) -> ProviderDealIdentifier {
        self.identifier()
    }
    fn status(&self) -> DealStatus {
        self.status
    }
    fn set_status(&mut self, status: DealStatus) {
        self.status = status
    }
}

/// Running counters of a client or provider.
pub type RetrievalStats = BTreeMap<String, u64>;

#[cfg(test)]
mod tests {
    use fil_markets_runtime::util::cid::raw_cid;

    use super::*;

    fn proposal() -> DealProposal {
        DealProposal {
            payload_cid: raw_cid(b"payload").unwrap(),
            id: 7,
            params: Params::new(TokenAmount::from_atto(1000), 10_000, 1000, TokenAmount::from_atto(10)),
        }
    }

    #[test]
    fn provider_owes_unseal_and_bytes_less_received() {
        let mut deal = ProviderDealState::new(proposal(), PeerId::new("client"));
        assert_eq!(deal.payment_owed(), TokenAmount::from_atto(10));
        deal.total_sent = 100;
        deal.funds_received = TokenAmount::from_atto(60_010);
        assert_eq!(deal.payment_owed(), TokenAmount::from_atto(40_000));
    }

    #[test]
    fn provider_key_round_trips_through_bytes() {
        let key = ProviderDealIdentifier { receiver: PeerId::new("client"), deal_id: 3 };
        let bytes = StateKey::to_bytes(&key).unwrap();
        assert_eq!(<ProviderDealIdentifier as StateKey>::from_bytes(&bytes).unwrap(), key);
    }

    #[test]
    fn params_default_to_whole_dag() {
        let params = proposal().params;
        assert_eq!(params.selector(), Selector::all());
        assert_eq!(params.with_selector(Selector::root_only()).selector(), Selector::root_only());
    }

    #[test]
    fn statuses_display_with_prefix() {
        assert_eq!(DealStatus::Ongoing.to_string(), "DealStatusOngoing");
        assert!(DealStatus::Cancelled.is_final());
        assert!(!DealStatus::InsufficientFunds.is_final());
    }
}

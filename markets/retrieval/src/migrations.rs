// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Upgrades of stored deal records. Version 0 records predate unseal pricing.

use cid::Cid;
use fil_markets_runtime::network::PeerId;
use fil_markets_runtime::piecestore::PieceInfo;
use fil_markets_runtime::statestore::Migration;
use fil_markets_runtime::traversal::{Selector, TraversalState};
use fil_markets_runtime::util::AsDealErrors;
use fil_markets_runtime::DealError;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{from_slice, to_vec};
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;

use crate::types::{ClientDealState, DealId, DealProposal, DealStatus, Params, PaymentInfo, ProviderDealState};

pub const CLIENT_MIGRATIONS: [Migration; 1] = [Migration { from_version: 0, upgrade: upgrade_client_v0 }];

pub const PROVIDER_MIGRATIONS: [Migration; 1] =
    [Migration { from_version: 0, upgrade: upgrade_provider_v0 }];

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct ParamsV0 {
    pub selector: Option<Selector>,
    pub piece_cid: Option<Cid>,
    pub price_per_byte: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct DealProposalV0 {
    pub payload_cid: Cid,
    pub id: DealId,
    pub params: ParamsV0,
}

impl From<DealProposalV0> for DealProposal {
    fn from(old: DealProposalV0) -> Self {
        let p = old.params;
        DealProposal {
            payload_cid: old.payload_cid,
            id: old.id,
            params: Params {
                selector: p.selector,
                piece_cid: p.piece_cid,
                price_per_byte: p.price_per_byte,
                payment_interval: p.payment_interval,
                payment_interval_increase: p.payment_interval_increase,
                unseal_price: TokenAmount::zero(),
            },
        }
    }
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct ClientDealStateV0 {
    pub proposal: DealProposalV0,
    pub status: DealStatus,
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
    pub last_payment_requested: bool,
    pub all_blocks_received: bool,
    pub traversal: Option<TraversalState>,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct ProviderDealStateV0 {
    pub proposal: DealProposalV0,
    pub status: DealStatus,
    pub receiver: PeerId,
    pub piece_info: Option<PieceInfo>,
    pub total_sent: u64,
    pub bytes_billed: u64,
    pub funds_received: TokenAmount,
    pub current_interval: u64,
    pub message: String,
    pub traversal: Option<TraversalState>,
}

fn upgrade_client_v0(bytes: &[u8]) -> Result<Vec<u8>, DealError> {
    let old: ClientDealStateV0 = from_slice(bytes).or_serialization("decoding v0 client deal")?;
    let upgraded = ClientDealState {
        proposal: old.proposal.into(),
        status: old.status,
        sender: old.sender,
        total_funds: old.total_funds,
        client_wallet: old.client_wallet,
        miner_wallet: old.miner_wallet,
        payment_info: old.payment_info,
        wait_msg_cid: old.wait_msg_cid,
        total_received: old.total_received,
        message: old.message,
        bytes_paid_for: old.bytes_paid_for,
        current_interval: old.current_interval,
        payment_requested: old.payment_requested,
        funds_spent: old.funds_spent,
        unseal_funds_paid: TokenAmount::zero(),
        last_payment_requested: old.last_payment_requested,
        all_blocks_received: old.all_blocks_received,
        traversal: old.traversal,
    };
    to_vec(&upgraded).or_serialization("encoding v1 client deal")
}

fn upgrade_provider_v0(bytes: &[u8]) -> Result<Vec<u8>, DealError> {
    let old: ProviderDealStateV0 = from_slice(bytes).or_serialization("decoding v0 provider deal")?;
    let upgraded = ProviderDealState {
        proposal: old.proposal.into(),
        status: old.status,
        receiver: old.receiver,
        piece_info: old.piece_info,
        total_sent: old.total_sent,
        bytes_billed: old.bytes_billed,
        funds_received: old.funds_received,
        current_interval: old.current_interval,
        message: old.message,
        traversal: old.traversal,
    };
    to_vec(&upgraded).or_serialization("encoding v1 provider deal")
}

#[cfg(test)]
mod tests {
    use fil_markets_runtime::util::cid::raw_cid;

    use super::*;

    fn proposal_v0() -> DealProposalV0 {
        DealProposalV0 {
            payload_cid: raw_cid(b"payload").unwrap(),
            id: 9,
            params: ParamsV0 {
                selector: None,
                piece_cid: None,
                price_per_byte: TokenAmount::from_atto(2),
                payment_interval: 100,
                payment_interval_increase: 10,
            },
        }
    }

    #[test]
    fn client_deals_gain_unseal_fields() {
        let old = ClientDealStateV0 {
            proposal: proposal_v0(),
            status: DealStatus::Ongoing,
            sender: PeerId::new("provider"),
            total_funds: TokenAmount::from_atto(1000),
            client_wallet: Address::new_id(1),
            miner_wallet: Address::new_id(2),
            payment_info: Some(PaymentInfo { pay_ch: Address::new_id(3), lane: 1 }),
            wait_msg_cid: None,
            total_received: 50,
            message: String::new(),
            bytes_paid_for: 0,
            current_interval: 100,
            payment_requested: TokenAmount::zero(),
            funds_spent: TokenAmount::from_atto(20),
            last_payment_requested: false,
            all_blocks_received: false,
            traversal: None,
        };
        let upgraded = upgrade_client_v0(&to_vec(&old).unwrap()).unwrap();
        let deal: ClientDealState = from_slice(&upgraded).unwrap();
        assert_eq!(deal.id(), 9);
        assert_eq!(deal.status, DealStatus::Ongoing);
        assert_eq!(deal.funds_spent, TokenAmount::from_atto(20));
        assert!(deal.unseal_funds_paid.is_zero());
        assert!(deal.proposal.params.unseal_price.is_zero());
    }

    #[test]
    fn provider_deals_upgrade_and_garbage_fails() {
        let old = ProviderDealStateV0 {
            proposal: proposal_v0(),
            status: DealStatus::FundsNeeded,
            receiver: PeerId::new("client"),
            piece_info: None,
            total_sent: 120,
            bytes_billed: 0,
            funds_received: TokenAmount::zero(),
            current_interval: 100,
            message: String::new(),
            traversal: None,
        };
        let upgraded = upgrade_provider_v0(&to_vec(&old).unwrap()).unwrap();
        let deal: ProviderDealState = from_slice(&upgraded).unwrap();
        assert_eq!(deal.payment_owed(), TokenAmount::from_atto(240));

        let err = upgrade_provider_v0(&[0xff, 0x00]).unwrap_err();
        assert_eq!(err.kind(), fil_markets_runtime::ErrorKind::Serialization);
    }
}

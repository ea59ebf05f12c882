// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Data-transfer request validators for storage deals.

use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::blockstore::SharedBlockstore;
use fil_markets_runtime::carstore::StoreTracker;
use fil_markets_runtime::fsm::{DealRecord, FsmEvent, StateGroup};
use fil_markets_runtime::network::PeerId;
use fil_markets_runtime::traversal::Selector;
use fil_markets_runtime::{deal_error, DealError};

use crate::transfer::{decode_voucher, RequestValidator};
use crate::types::{ClientDeal, MinerDeal, StorageDealStatus};

/// Provider states in which a deal may receive its payload.
pub const PROVIDER_TRANSFER_STATES: [StorageDealStatus; 5] = [
    StorageDealStatus::Validating,
    StorageDealStatus::WaitingForData,
    StorageDealStatus::ProposalAccepted,
    StorageDealStatus::Transferring,
    StorageDealStatus::ProviderTransferAwaitRestart,
];

/// Client states in which a deal may send its payload.
pub const CLIENT_TRANSFER_STATES: [StorageDealStatus; 4] = [
    StorageDealStatus::FundsReserved,
    StorageDealStatus::StartDataTransfer,
    StorageDealStatus::Transferring,
    StorageDealStatus::ClientTransferRestart,
];

/// Finds deals by proposal CID.
pub trait DealLookup<D>: Send + Sync {
    fn deal(&self, proposal: &Cid) -> Result<D, DealError>;
}

impl<D: DealRecord<Key = Cid>, E: FsmEvent> DealLookup<D> for StateGroup<D, E> {
    fn deal(&self, proposal: &Cid) -> Result<D, DealError> {
        self.get(proposal)
    }
}

fn lookup<D>(deals: &dyn DealLookup<D>, voucher: &[u8]) -> Result<(Cid, D), DealError> {
    let voucher = decode_voucher(voucher)?;
    let deal = deals
        .deal(&voucher.proposal)
        .map_err(|_| deal_error!(not_found; "Proposal CID {}: no deal found", voucher.proposal))?;
    Ok((voucher.proposal, deal))
}

/// Accepts payload pushes from a deal's client into that deal's private store.
pub struct ProviderRequestValidator {
    deals: Arc<dyn DealLookup<MinerDeal>>,
    stores: Arc<StoreTracker>,
}

impl ProviderRequestValidator {
    pub fn new(deals: Arc<dyn DealLookup<MinerDeal>>, stores: Arc<StoreTracker>) -> Self {
        Self { deals, stores }
    }
}

impl RequestValidator for ProviderRequestValidator {
    fn validate_push(
        &self,
        sender: &PeerId,
        voucher: &[u8],
        root: &Cid,
        _selector: &Selector,
    ) -> Result<SharedBlockstore, DealError> {
        let (proposal, deal) = lookup(self.deals.as_ref(), voucher)?;
        if deal.client != *sender {
            return Err(deal_error!(forbidden;
                "Deal Peer {}, Data Transfer Peer {}: data transfer peer id and deal peer id do not match",
                deal.client, sender));
        }
        if deal.data_ref.root != *root {
            return Err(deal_error!(illegal_argument;
                "Deal Payload CID {}, Data Transfer CID {}: base CID for deal does not match CID for piece",
                deal.data_ref.root, root));
        }
        if !PROVIDER_TRANSFER_STATES.contains(&deal.state) {
            return Err(deal_error!(illegal_state;
                "Deal State {}: deal is not in a state where data can be received", deal.state));
        }
        Ok(self.stores.get_or_create(&proposal.to_string(), *root)?.store)
    }

    fn validate_pull(
        &self,
        _receiver: &PeerId,
        _voucher: &[u8],
        _root: &Cid,
        _selector: &Selector,
    ) -> Result<SharedBlockstore, DealError> {
        Err(deal_error!(forbidden; "provider should not send data for a storage deal"))
    }
}

/// Lets a deal's provider pull the payload from the client; refuses pushes.
pub struct ClientRequestValidator {
    deals: Arc<dyn DealLookup<ClientDeal>>,
    store: SharedBlockstore,
}

impl ClientRequestValidator {
    pub fn new(deals: Arc<dyn DealLookup<ClientDeal>>, store: SharedBlockstore) -> Self {
        Self { deals, store }
    }
}

impl RequestValidator for ClientRequestValidator {
    fn validate_push(
        &self,
        _sender: &PeerId,
        _voucher: &[u8],
        _root: &Cid,
        _selector: &Selector,
    ) -> Result<SharedBlockstore, DealError> {
        Err(deal_error!(forbidden; "client should not receive data for a storage deal"))
    }

    fn validate_pull(
        &self,
        receiver: &PeerId,
        voucher: &[u8],
        root: &Cid,
        _selector: &Selector,
    ) -> Result<SharedBlockstore, DealError> {
        let (_, deal) = lookup(self.deals.as_ref(), voucher)?;
        if deal.miner != *receiver {
            return Err(deal_error!(forbidden;
                "Deal Peer {}, Data Transfer Peer {}: data transfer peer id and deal peer id do not match",
                deal.miner, receiver));
        }
        if deal.data_ref.root != *root {
            return Err(deal_error!(illegal_argument;
                "Deal Payload CID {}, Data Transfer CID {}: base CID for deal does not match CID for piece",
                deal.data_ref.root, root));
        }
        if !CLIENT_TRANSFER_STATES.contains(&deal.state) {
            return Err(deal_error!(illegal_state;
                "Deal State {}: deal is not in a state where data can be sent", deal.state));
        }
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use fil_markets_runtime::util::cid::raw_cid;
    use fil_markets_runtime::ErrorKind;
    use fvm_shared::address::Address;
    use fvm_shared::crypto::signature::Signature;
    use fvm_shared::econ::TokenAmount;
    use fvm_shared::piece::PaddedPieceSize;
    use test_case::test_case;

    use super::*;
    use crate::transfer::encode_voucher;
    use crate::types::{ClientDealProposal, DataRef, DealProposal, StorageDataTransferVoucher};

    struct Deals<D>(HashMap<Cid, D>);

    impl<D: Clone + Send + Sync> DealLookup<D> for Deals<D> {
        fn deal(&self, proposal: &Cid) -> Result<D, DealError> {
            self.0.get(proposal).cloned().ok_or_else(|| deal_error!(not_found; "missing"))
        }
    }

    fn signed() -> ClientDealProposal {
        ClientDealProposal {
            proposal: DealProposal {
                piece_cid: raw_cid(b"piece").unwrap(),
                piece_size: PaddedPieceSize(1024),
                verified_deal: false,
                client: Address::new_id(1),
                provider: Address::new_id(2),
                label: String::new(),
                start_epoch: 10,
                end_epoch: 20,
                storage_price_per_epoch: TokenAmount::from_atto(1),
                provider_collateral: TokenAmount::from_atto(0),
                client_collateral: TokenAmount::from_atto(0),
            },
            client_signature: Signature::new_secp256k1(vec![0; 65]),
        }
    }

    fn root() -> Cid {
        raw_cid(b"payload").unwrap()
    }

    fn voucher(proposal: Cid) -> Vec<u8> {
        encode_voucher(&StorageDataTransferVoucher { proposal }).unwrap()
    }

    fn provider_with(state: StorageDealStatus) -> (ProviderRequestValidator, Cid) {
        let proposal = signed();
        let cid = proposal.cid().unwrap();
        let mut deal = MinerDeal::new(proposal, cid, PeerId::new("client"), DataRef::graphsync(root()));
        deal.state = state;
        let deals = Deals(HashMap::from([(cid, deal)]));
        (ProviderRequestValidator::new(Arc::new(deals), Arc::new(StoreTracker::new())), cid)
    }

    #[test_case(StorageDealStatus::Validating; "validating")]
    #[test_case(StorageDealStatus::WaitingForData; "waiting")]
    #[test_case(StorageDealStatus::Transferring; "transferring")]
    fn provider_accepts_push_from_client(state: StorageDealStatus) {
        let (validator, cid) = provider_with(state);
        let store = validator.validate_push(&PeerId::new("client"), &voucher(cid), &root(), &Selector::all());
        assert!(store.is_ok());
    }

    #[test]
    fn provider_rejects_bad_pushes() {
        let (validator, cid) = provider_with(StorageDealStatus::WaitingForData);
        let all = Selector::all();

        let err = validator.validate_push(&PeerId::new("client"), &[0xff], &root(), &all).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);

        let unknown = raw_cid(b"other proposal").unwrap();
        let err = validator.validate_push(&PeerId::new("client"), &voucher(unknown), &root(), &all).unwrap_err();
        assert!(err.msg().contains("no deal found"));

        let err = validator.validate_push(&PeerId::new("mallory"), &voucher(cid), &root(), &all).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let other_root = raw_cid(b"other payload").unwrap();
        let err = validator.validate_push(&PeerId::new("client"), &voucher(cid), &other_root, &all).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);

        let err = validator.validate_pull(&PeerId::new("client"), &voucher(cid), &root(), &all).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn provider_rejects_push_in_late_state() {
        let (validator, cid) = provider_with(StorageDealStatus::Publishing);
        let err = validator
            .validate_push(&PeerId::new("client"), &voucher(cid), &root(), &Selector::all())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn client_only_serves_its_miner() {
        let proposal = signed();
        let cid = proposal.cid().unwrap();
        let mut deal = ClientDeal::new(proposal, cid, PeerId::new("miner"), Address::new_id(3), DataRef::graphsync(root()));
        deal.state = StorageDealStatus::Transferring;
        let validator = ClientRequestValidator::new(
            Arc::new(Deals(HashMap::from([(cid, deal)]))),
            fil_markets_runtime::blockstore::MemoryBlockstore::shared(),
        );
        let all = Selector::all();
        assert!(validator.validate_pull(&PeerId::new("miner"), &voucher(cid), &root(), &all).is_ok());
        assert!(validator.validate_pull(&PeerId::new("other"), &voucher(cid), &root(), &all).is_err());
        assert!(validator.validate_push(&PeerId::new("miner"), &voucher(cid), &root(), &all).is_err());
    }
}

// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Messages of the storage deal, ask and deal status protocols.

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;

use crate::types::{ClientDealProposal, DataRef, ProviderDealState, SignedStorageAsk, StorageDealStatus};

/// Opens a storage deal.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Proposal {
    pub deal_proposal: ClientDealProposal,
    pub piece: DataRef,
}

/// The provider's answer to a [`Proposal`].
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Response {
    pub state: StorageDealStatus,
    /// Why the deal was rejected, if it was.
    pub message: String,
    /// CID of the proposal being answered.
    pub proposal: Cid,
    pub publish_message: Option<Cid>,
}

/// A [`Response`] signed by the provider's worker.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct SignedResponse {
    pub response: Response,
    pub signature: Signature,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct AskRequest {
    pub miner: Address,
}

#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct AskResponse {
    pub ask: Option<SignedStorageAsk>,
}

/// Asks the provider where a deal stands. The client signs the proposal CID's bytes.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct DealStatusRequest {
    pub proposal: Cid,
    pub signature: Signature,
}

/// The provider's view of a deal, signed by its worker over the encoded state.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct DealStatusResponse {
    pub deal_state: ProviderDealState,
    pub signature: Signature,
}

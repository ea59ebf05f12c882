// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use cid::Cid;
use fil_markets_runtime::DealError;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;

use crate::types::SignedVoucher;

/// Chain and wallet operations a retrieval client needs.
#[async_trait]
pub trait RetrievalClientNode: Send + Sync {
    /// Returns a channel from `client` to `miner` holding at least `funds`. When a message had
    /// to be sent to create or top up the channel, its CID is returned and the channel is not
    /// usable until [`RetrievalClientNode::wait_for_payment_channel_ready`] resolves.
    async fn get_or_create_payment_channel(
        &self,
        client: &Address,
        miner: &Address,
        funds: &TokenAmount,
    ) -> Result<(Address, Option<Cid>), DealError>;

    async fn wait_for_payment_channel_ready(&self, message: &Cid) -> Result<Address, DealError>;

    async fn allocate_lane(&self, channel: &Address) -> Result<u64, DealError>;

    /// Signs a voucher for the cumulative `amount` on `lane`.
    async fn create_payment_voucher(
        &self,
        channel: &Address,
        amount: &TokenAmount,
        lane: u64,
    ) -> Result<SignedVoucher, DealError>;

    /// Funds in the channel not yet committed to vouchers.
    async fn check_available_funds(&self, channel: &Address) -> Result<TokenAmount, DealError>;
}

/// Chain operations a retrieval provider needs.
#[async_trait]
pub trait RetrievalProviderNode: Send + Sync {
    /// Stores `voucher` and returns the amount it adds over the best voucher already stored on
    /// its lane. `expected` is the amount the provider was waiting for.
    async fn save_payment_voucher(
        &self,
        channel: &Address,
        voucher: &SignedVoucher,
        proof: &[u8],
        expected: &TokenAmount,
    ) -> Result<TokenAmount, DealError>;

    async fn get_miner_worker_address(&self, miner: &Address) -> Result<Address, DealError>;
}

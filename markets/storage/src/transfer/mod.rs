// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The bulk data-transfer subsystem storage deals move payloads with: channels keyed by the
//! peers and a per-initiator counter, vouchers naming the deal, and validators the receiving
//! side uses to accept or refuse a channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use fil_markets_runtime::blockstore::SharedBlockstore;
use fil_markets_runtime::fsm::{DealRecord, FsmEvent, StateGroup};
use fil_markets_runtime::network::{with_timeout, PeerId};
use fil_markets_runtime::traversal::Selector;
use fil_markets_runtime::util::{AsDealErrors, Unsubscribe};
use fil_markets_runtime::DealError;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{from_slice, to_vec};
use log::{debug, warn};

use crate::types::StorageDataTransferVoucher;

pub use self::memory::{MemoryDataTransfer, MemoryTransferNetwork};

mod memory;

/// Identifies a data-transfer channel.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub initiator: PeerId,
    pub responder: PeerId,
    pub id: u64,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.initiator, self.responder, self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEventCode {
    Open,
    /// Bytes moved so far.
    Progress(u64),
    Complete,
    Error(String),
    Restart,
    Cancelled,
}

/// A change to a channel, published on both of its ends.
#[derive(Clone, Debug)]
pub struct TransferEvent {
    pub channel: ChannelId,
    pub voucher: Vec<u8>,
    pub code: TransferEventCode,
}

impl TransferEvent {
    /// The deal the channel belongs to, if its voucher is a storage voucher.
    pub fn deal(&self) -> Option<Cid> {
        decode_voucher(&self.voucher).ok().map(|v| v.proposal)
    }
}

pub fn encode_voucher(voucher: &StorageDataTransferVoucher) -> Result<Vec<u8>, DealError> {
    to_vec(voucher).or_serialization("encoding storage data transfer voucher")
}

pub fn decode_voucher(bytes: &[u8]) -> Result<StorageDataTransferVoucher, DealError> {
    from_slice(bytes).or_serialization("decoding storage data transfer voucher")
}

/// Accepts or refuses channels opened towards this peer. An accepted channel writes into the
/// returned block store.
pub trait RequestValidator: Send + Sync {
    /// A peer wants to push `root` to us.
    fn validate_push(
        &self,
        sender: &PeerId,
        voucher: &[u8],
        root: &Cid,
        selector: &Selector,
    ) -> Result<SharedBlockstore, DealError>;

    /// A peer wants to pull `root` from us.
    fn validate_pull(
        &self,
        receiver: &PeerId,
        voucher: &[u8],
        root: &Cid,
        selector: &Selector,
    ) -> Result<SharedBlockstore, DealError>;
}

#[async_trait]
pub trait DataTransfer: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Opens a channel sending the DAG under `root` from `source` to `to`. Fails if `to`
    /// refuses it.
    async fn open_push_data_channel(
        &self,
        to: &PeerId,
        voucher: Vec<u8>,
        root: Cid,
        selector: Selector,
        source: SharedBlockstore,
    ) -> Result<ChannelId, DealError>;

    /// Resumes a channel that stopped before completing.
    async fn restart_data_channel(&self, channel: &ChannelId) -> Result<(), DealError>;

    async fn close_data_channel(&self, channel: &ChannelId) -> Result<(), DealError>;

    fn register_validator(&self, validator: Arc<dyn RequestValidator>);

    fn subscribe_to_events(
        &self,
        f: Box<dyn Fn(&TransferEvent) + Send + Sync>,
    ) -> Unsubscribe<TransferEvent>;
}

/// Closes `channel`, giving up after `limit`. Failures are logged and otherwise ignored.
pub(crate) async fn close_channel_within(transfer: &dyn DataTransfer, channel: &ChannelId, limit: Duration, deal: &Cid) {
    match with_timeout(limit, "closing data channel", transfer.close_data_channel(channel)).await {
        Ok(()) => debug!("storage deal {}: closed data channel {}", deal, channel),
        Err(e) => warn!("storage deal {}: closing data channel {}: {}", deal, channel, e),
    }
}

/// Feeds transfer events for deals into `deals`, translated by `translate`. Events that the deal's
/// current state does not accept are dropped.
pub(crate) fn forward_transfer_events<R, E>(
    transfer: &dyn DataTransfer,
    deals: StateGroup<R, E>,
    translate: fn(&TransferEvent) -> Option<E>,
) -> Unsubscribe<TransferEvent>
where
    R: DealRecord<Key = Cid>,
    E: FsmEvent,
{
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(Cid, E)>();
    tokio::spawn(async move {
        while let Some((proposal, event)) = rx.recv().await {
            if let Err(e) = deals.send(proposal, event).await {
                debug!("dropping transfer event for deal {}: {}", proposal, e);
            }
        }
    });
    transfer.subscribe_to_events(Box::new(move |event| {
        if let (Some(proposal), Some(translated)) = (event.deal(), translate(event)) {
            let _ = tx.send((proposal, translated));
        }
    }))
}

// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use cid::Cid;
use fil_markets_runtime::blockstore::SharedBlockstore;
use fil_markets_runtime::network::PeerId;
use fil_markets_runtime::traversal::{traverse_blockstore, Selector};
use fil_markets_runtime::util::{AsDealErrors, Subscribers, Unsubscribe};
use fil_markets_runtime::{deal_error, DealError};
use fvm_ipld_blockstore::Blockstore;
use log::{debug, warn};
use tokio::task::JoinHandle;

use super::{ChannelId, DataTransfer, RequestValidator, TransferEvent, TransferEventCode};

#[derive(Default)]
struct Endpoint {
    validator: RwLock<Option<Arc<dyn RequestValidator>>>,
    events: Subscribers<TransferEvent>,
}

struct Channel {
    voucher: Vec<u8>,
    root: Cid,
    selector: Selector,
    source: SharedBlockstore,
    target: SharedBlockstore,
    done: bool,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Hub {
    endpoints: Mutex<HashMap<PeerId, Arc<Endpoint>>>,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    next_id: AtomicU64,
    stalled: AtomicBool,
}

impl Hub {
    fn endpoint(&self, peer: &PeerId) -> Result<Arc<Endpoint>, DealError> {
        self.endpoints
            .lock()
            .map_err(|_| deal_error!(illegal_state; "transfer hub lock poisoned"))?
            .get(peer)
            .cloned()
            .ok_or_else(|| deal_error!(network; "peer {} is not reachable for data transfer", peer))
    }

    fn channels(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ChannelId, Channel>>, DealError> {
        self.channels.lock().map_err(|_| deal_error!(illegal_state; "transfer channel lock poisoned"))
    }

    /// Publishes on both ends of the channel.
    fn publish(&self, channel: &ChannelId, voucher: &[u8], code: TransferEventCode) {
        let event = TransferEvent { channel: channel.clone(), voucher: voucher.to_vec(), code };
        for peer in [&channel.initiator, &channel.responder] {
            match self.endpoint(peer) {
                Ok(endpoint) => endpoint.events.publish(&event),
                Err(e) => debug!("dropping transfer event for {}: {}", peer, e),
            }
        }
    }

    fn copy(&self, channel: &ChannelId) -> Result<u64, DealError> {
        let (source, target, root, selector) = {
            let channels = self.channels()?;
            let ch = channels.get(channel).ok_or_else(|| deal_error!(not_found; "no channel {}", channel))?;
            (ch.source.clone(), ch.target.clone(), ch.root, ch.selector.clone())
        };
        let mut sent = 0;
        for (cid, data) in traverse_blockstore(&source, root, selector)? {
            target.put_keyed(&cid, &data).or_illegal_state("writing transferred block")?;
            sent += data.len() as u64;
        }
        Ok(sent)
    }
}

fn run_channel(hub: Arc<Hub>, channel: ChannelId, voucher: Vec<u8>, opening: TransferEventCode) {
    hub.publish(&channel, &voucher, opening);
    if hub.stalled.load(Ordering::SeqCst) {
        debug!("channel {} stalled", channel);
        return;
    }
    match hub.copy(&channel) {
        Ok(sent) => {
            if let Ok(mut channels) = hub.channels() {
                if let Some(ch) = channels.get_mut(&channel) {
                    ch.done = true;
                }
            }
            hub.publish(&channel, &voucher, TransferEventCode::Progress(sent));
            hub.publish(&channel, &voucher, TransferEventCode::Complete);
        }
        Err(e) => {
            warn!("data transfer on channel {} failed: {}", channel, e);
            hub.publish(&channel, &voucher, TransferEventCode::Error(e.msg().to_string()));
        }
    }
}

/// In-process data-transfer network. Each peer gets an endpoint; channels copy blocks
/// directly between the two peers' block stores on a spawned task.
#[derive(Clone, Default)]
pub struct MemoryTransferNetwork {
    hub: Arc<Hub>,
}

impl MemoryTransferNetwork {
    pub fn new() -> Self {
        Default::default()
    }

    /// The endpoint for `peer`, created on first use.
    pub fn endpoint(&self, peer: PeerId) -> MemoryDataTransfer {
        if let Ok(mut endpoints) = self.hub.endpoints.lock() {
            endpoints.entry(peer.clone()).or_default();
        }
        MemoryDataTransfer { peer, hub: self.hub.clone() }
    }

    /// While stalled, channels open but move no data until restarted.
    pub fn set_stalled(&self, stalled: bool) {
        self.hub.stalled.store(stalled, Ordering::SeqCst);
    }
}

/// One peer's end of a [`MemoryTransferNetwork`].
#[derive(Clone)]
pub struct MemoryDataTransfer {
    peer: PeerId,
    hub: Arc<Hub>,
}

impl MemoryDataTransfer {
    fn spawn(&self, channel: ChannelId, voucher: Vec<u8>, opening: TransferEventCode) -> JoinHandle<()> {
        let hub = self.hub.clone();
        tokio::spawn(async move { run_channel(hub, channel, voucher, opening) })
    }
}

#[async_trait]
impl DataTransfer for MemoryDataTransfer {
    fn local_peer(&self) -> PeerId {
        self.peer.clone()
    }

    async fn open_push_data_channel(
        &self,
        to: &PeerId,
        voucher: Vec<u8>,
        root: Cid,
        selector: Selector,
        source: SharedBlockstore,
    ) -> Result<ChannelId, DealError> {
        let receiver = self.hub.endpoint(to)?;
        let validator = receiver
            .validator
            .read()
            .map_err(|_| deal_error!(illegal_state; "validator lock poisoned"))?
            .clone()
            .ok_or_else(|| deal_error!(forbidden; "peer {} accepts no data transfers", to))?;
        let target = validator
            .validate_push(&self.peer, &voucher, &root, &selector)
            .map_err(|e| e.wrap("data transfer request rejected"))?;

        let channel = ChannelId {
            initiator: self.peer.clone(),
            responder: to.clone(),
            id: self.hub.next_id.fetch_add(1, Ordering::SeqCst),
        };
        self.hub.channels()?.insert(
            channel.clone(),
            Channel { voucher: voucher.clone(), root, selector, source, target, done: false, task: None },
        );
        let task = self.spawn(channel.clone(), voucher, TransferEventCode::Open);
        if let Some(ch) = self.hub.channels()?.get_mut(&channel) {
            ch.task = Some(task);
        }
        debug!("opened push channel {} for {}", channel, root);
        Ok(channel)
    }

    async fn restart_data_channel(&self, channel: &ChannelId) -> Result<(), DealError> {
        let voucher = {
            let channels = self.hub.channels()?;
            let ch = channels.get(channel).ok_or_else(|| deal_error!(not_found; "no channel {}", channel))?;
            if ch.done {
                return Err(deal_error!(illegal_state; "channel {} already completed", channel));
            }
            ch.voucher.clone()
        };
        let task = self.spawn(channel.clone(), voucher, TransferEventCode::Restart);
        if let Some(ch) = self.hub.channels()?.get_mut(channel) {
            if let Some(old) = ch.task.replace(task) {
                old.abort();
            }
        }
        Ok(())
    }

    async fn close_data_channel(&self, channel: &ChannelId) -> Result<(), DealError> {
        let removed = self.hub.channels()?.remove(channel);
        let ch = removed.ok_or_else(|| deal_error!(not_found; "no channel {}", channel))?;
        if let Some(task) = ch.task {
            task.abort();
        }
        if !ch.done {
            self.hub.publish(channel, &ch.voucher, TransferEventCode::Cancelled);
        }
        Ok(())
    }

    fn register_validator(&self, validator: Arc<dyn RequestValidator>) {
        if let Ok(endpoint) = self.hub.endpoint(&self.peer) {
            if let Ok(mut slot) = endpoint.validator.write() {
                *slot = Some(validator);
            }
        }
    }

    fn subscribe_to_events(
        &self,
        f: Box<dyn Fn(&TransferEvent) + Send + Sync>,
    ) -> Unsubscribe<TransferEvent> {
        match self.hub.endpoint(&self.peer) {
            Ok(endpoint) => endpoint.events.subscribe(f),
            // Endpoints are created with the handle, so this only happens on a poisoned lock.
            Err(_) => Subscribers::new().subscribe(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use fil_markets_runtime::blockstore::MemoryBlockstore;
    use fil_markets_runtime::test_utils::build_dag;

    use super::*;

    struct AcceptAll(SharedBlockstore);

    impl RequestValidator for AcceptAll {
        fn validate_push(&self, _: &PeerId, _: &[u8], _: &Cid, _: &Selector) -> Result<SharedBlockstore, DealError> {
            Ok(self.0.clone())
        }
        fn validate_pull(&self, _: &PeerId, _: &[u8], _: &Cid, _: &Selector) -> Result<SharedBlockstore, DealError> {
            Err(deal_error!(forbidden; "no pulls"))
        }
    }

    async fn wait_for(events: &StdMutex<Vec<TransferEventCode>>, code: TransferEventCode) {
        for _ in 0..200 {
            if events.lock().unwrap().contains(&code) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never saw {:?}: {:?}", code, events.lock().unwrap());
    }

    #[tokio::test]
    async fn push_copies_dag_and_notifies_both_ends() {
        let net = MemoryTransferNetwork::new();
        let sender = net.endpoint(PeerId::new("a"));
        let receiver = net.endpoint(PeerId::new("b"));
        let target = MemoryBlockstore::shared();
        receiver.register_validator(Arc::new(AcceptAll(target.clone())));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        let _sub = receiver.subscribe_to_events(Box::new(move |e| recorder.lock().unwrap().push(e.code.clone())));

        let dag = build_dag(3, 200, &[200, 300]).unwrap();
        let source = MemoryBlockstore::shared();
        dag.put_into(&source).unwrap();
        let chid = sender
            .open_push_data_channel(&PeerId::new("b"), vec![1], dag.root, Selector::all(), source)
            .await
            .unwrap();
        assert_eq!(chid.initiator, PeerId::new("a"));

        wait_for(&seen, TransferEventCode::Complete).await;
        for (cid, _) in &dag.blocks {
            assert!(target.has(cid).unwrap());
        }
        assert_eq!(seen.lock().unwrap()[0], TransferEventCode::Open);
        let err = sender.restart_data_channel(&chid).await.unwrap_err();
        assert_eq!(err.kind(), fil_markets_runtime::ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn stalled_channel_moves_data_after_restart() {
        let net = MemoryTransferNetwork::new();
        let sender = net.endpoint(PeerId::new("a"));
        let receiver = net.endpoint(PeerId::new("b"));
        let target = MemoryBlockstore::shared();
        receiver.register_validator(Arc::new(AcceptAll(target.clone())));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        let _sub = sender.subscribe_to_events(Box::new(move |e| recorder.lock().unwrap().push(e.code.clone())));

        let dag = build_dag(4, 200, &[50]).unwrap();
        let source = MemoryBlockstore::shared();
        dag.put_into(&source).unwrap();
        net.set_stalled(true);
        let chid = sender
            .open_push_data_channel(&PeerId::new("b"), vec![], dag.root, Selector::all(), source)
            .await
            .unwrap();
        wait_for(&seen, TransferEventCode::Open).await;
        assert!(!target.has(&dag.root).unwrap());

        net.set_stalled(false);
        sender.restart_data_channel(&chid).await.unwrap();
        wait_for(&seen, TransferEventCode::Complete).await;
        assert!(target.has(&dag.root).unwrap());
        assert!(seen.lock().unwrap().contains(&TransferEventCode::Restart));
    }

    #[tokio::test]
    async fn unreachable_or_unwilling_peers_refuse_channels() {
        let net = MemoryTransferNetwork::new();
        let sender = net.endpoint(PeerId::new("a"));
        let root = fil_markets_runtime::util::cid::raw_cid(b"x").unwrap();

        let err = sender
            .open_push_data_channel(&PeerId::new("nobody"), vec![], root, Selector::all(), MemoryBlockstore::shared())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), fil_markets_runtime::ErrorKind::Network);

        let _receiver = net.endpoint(PeerId::new("b"));
        let err = sender
            .open_push_data_channel(&PeerId::new("b"), vec![], root, Selector::all(), MemoryBlockstore::shared())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), fil_markets_runtime::ErrorKind::Forbidden);
    }
}

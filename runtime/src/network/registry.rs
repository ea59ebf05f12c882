// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::network::{with_timeout, MessageStream};
use crate::{deal_error, DealError};

/// A deal stream shared between the entry actions of one deal.
pub type SharedStream = Arc<DealStream>;

/// A message stream that can be shut down while another task is blocked reading or writing
/// on it. Pending reads and writes fail as soon as [`DealStream::close`] is called, which
/// releases the stream so the close itself does not wait on the peer.
pub struct DealStream {
    inner: tokio::sync::Mutex<MessageStream>,
    shutdown: watch::Sender<bool>,
}

impl DealStream {
    pub fn new(stream: MessageStream) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { inner: tokio::sync::Mutex::new(stream), shutdown }
    }

    pub async fn read<T: DeserializeOwned>(&self) -> Result<T, DealError> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => Err(closed_error()),
            res = async { self.inner.lock().await.read::<T>().await } => res,
        }
    }

    pub async fn write<T: Serialize>(&self, msg: &T) -> Result<(), DealError> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => Err(closed_error()),
            res = async { self.inner.lock().await.write(msg).await } => res,
        }
    }

    /// Aborts pending reads and writes, then shuts the stream down.
    pub async fn close(&self) -> Result<(), DealError> {
        self.shutdown.send_replace(true);
        self.inner.lock().await.close().await
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

fn closed_error() -> DealError {
    deal_error!(network; "deal stream closed")
}

/// Open deal streams by deal key. A deal whose stream is missing, e.g. after a restart, can
/// no longer talk to its peer.
pub struct StreamRegistry<K> {
    streams: Mutex<HashMap<K, SharedStream>>,
}

impl<K> Default for StreamRegistry<K> {
    fn default() -> Self {
        Self { streams: Mutex::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone + Debug> StreamRegistry<K> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&self, key: K, stream: MessageStream) -> Result<(), DealError> {
        self.lock()?.insert(key, Arc::new(DealStream::new(stream)));
        Ok(())
    }

    pub fn get(&self, key: &K) -> Result<SharedStream, DealError> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| deal_error!(not_found; "no open deal stream for {:?}", key))
    }

    pub fn remove(&self, key: &K) -> Result<Option<SharedStream>, DealError> {
        Ok(self.lock()?.remove(key))
    }

    /// Forgets the stream and closes it, giving up after `limit`. Entry actions blocked on the
    /// stream are woken with an error first.
    pub async fn close(&self, key: &K, limit: Duration) {
        let stream = match self.remove(key) {
            Ok(Some(stream)) => stream,
            Ok(None) => return,
            Err(e) => {
                warn!("failed to remove stream for {:?}: {}", key, e);
                return;
            }
        };
        let res = with_timeout(limit, "closing deal stream", async move { stream.close().await }).await;
        match res {
            Ok(()) => debug!("closed deal stream for {:?}", key),
            Err(e) => warn!("failed to close deal stream for {:?}: {}", key, e),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<K, SharedStream>>, DealError> {
        self.streams.lock().map_err(|_| deal_error!(illegal_state; "stream registry lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::network::PeerId;
    use crate::ErrorKind;

    fn pair() -> (MessageStream, MessageStream) {
        let (a, b) = tokio::io::duplex(1024);
        (
            MessageStream::new(PeerId::new("provider"), "/test", a),
            MessageStream::new(PeerId::new("client"), "/test", b),
        )
    }

    #[tokio::test]
    async fn close_interrupts_pending_read() {
        let (ours, mut peer) = pair();
        let registry = StreamRegistry::new();
        registry.insert(7u64, ours).unwrap();

        let stream = registry.get(&7).unwrap();
        let reader = tokio::spawn(async move { stream.read::<u64>().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        registry.close(&7, Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.msg(), "deal stream closed");

        // The peer sees the end of the stream.
        let read = tokio::time::timeout(Duration::from_secs(1), peer.read::<u64>()).await.unwrap();
        assert!(read.is_err());
        assert_eq!(registry.get(&7).err().unwrap().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn closed_stream_refuses_writes() {
        let (ours, mut peer) = pair();
        let stream = DealStream::new(ours);
        stream.write(&1u64).await.unwrap();
        assert_eq!(peer.read::<u64>().await.unwrap(), 1);

        stream.close().await.unwrap();
        assert!(stream.is_closed());
        assert_eq!(stream.write(&2u64).await.unwrap_err().msg(), "deal stream closed");
    }
}

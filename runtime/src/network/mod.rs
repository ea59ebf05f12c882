// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::config::BackoffConfig;
use crate::{deal_error, DealError};

pub use self::framing::{read_message, write_message, MAX_FRAME_SIZE};
pub use self::memory::{MemoryHost, MemoryNetwork};
pub use self::registry::{DealStream, SharedStream, StreamRegistry};

mod framing;
mod memory;
mod registry;

pub const STORAGE_DEAL_PROTOCOL: &str = "/fil/storage/mk/1.1.0";
pub const STORAGE_ASK_PROTOCOL: &str = "/fil/storage/ask/1.1.0";
pub const STORAGE_DEAL_STATUS_PROTOCOL: &str = "/fil/storage/status/1.1.0";
pub const RETRIEVAL_QUERY_PROTOCOL: &str = "/fil/retrieval/qry/1.0.0";
pub const RETRIEVAL_DEAL_PROTOCOL: &str = "/fil/retrieval/deal/1.0.0";

/// Identity of a peer on the transport.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// A bidirectional stream of framed DAG-CBOR messages with one remote peer.
pub struct MessageStream {
    remote: PeerId,
    protocol: String,
    io: Box<dyn Duplex>,
}

impl MessageStream {
    pub fn new(remote: PeerId, protocol: impl Into<String>, io: impl Duplex + 'static) -> Self {
        Self { remote, protocol: protocol.into(), io: Box::new(io) }
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<T, DealError> {
        read_message(&mut self.io).await.map_err(|e| e.wrap(format!("reading from {}", self.remote)))
    }

    pub async fn write<T: Serialize>(&mut self, msg: &T) -> Result<(), DealError> {
        write_message(&mut self.io, msg).await.map_err(|e| e.wrap(format!("writing to {}", self.remote)))
    }

    pub async fn close(&mut self) -> Result<(), DealError> {
        Ok(self.io.shutdown().await?)
    }
}

impl fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStream").field("remote", &self.remote).field("protocol", &self.protocol).finish()
    }
}

/// Opens outbound streams.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    fn local_peer(&self) -> PeerId;

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<MessageStream, DealError>;
}

/// Receives inbound streams for a protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle_stream(&self, stream: MessageStream);
}

/// A transport endpoint that accepts inbound streams as well as opening them.
pub trait StreamHost: StreamOpener {
    fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>);
    fn remove_stream_handler(&self, protocol: &str);
}

/// Opens a stream, retrying with exponential backoff until `backoff.max_attempts` opens have
/// failed.
pub async fn open_with_backoff(
    opener: &dyn StreamOpener,
    peer: &PeerId,
    protocol: &str,
    backoff: &BackoffConfig,
) -> Result<MessageStream, DealError> {
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match opener.open_stream(peer, protocol).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };
        attempt += 1;
        if attempt >= max_attempts {
            warn!("giving up opening {} to {}: {}", protocol, peer, err);
            return Err(DealError::new(
                err.kind(),
                format!(
                    "exhausted {} attempts but failed to open stream, err: {}",
                    max_attempts,
                    err.msg()
                ),
            ));
        }
        let delay = jittered(backoff, attempt - 1);
        debug!("failed to open {} to {} (attempt {}), retrying in {:?}: {}", protocol, peer, attempt, delay, err);
        tokio::time::sleep(delay).await;
    }
}

fn jittered(backoff: &BackoffConfig, attempt: u32) -> Duration {
    let delay = backoff.delay(attempt);
    if !backoff.jitter || delay <= backoff.min_delay {
        return delay;
    }
    rand::thread_rng().gen_range(backoff.min_delay..=delay)
}

/// Fails when `fut` takes longer than `limit`.
pub async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T, DealError>>,
) -> Result<T, DealError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| deal_error!(timeout; "{} timed out after {:?}", what, limit))?
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::BackoffConfigBuilder;

    struct Refusing {
        attempts: AtomicU32,
        succeed_on: u32,
        host: MemoryHost,
    }

    #[async_trait]
    impl StreamOpener for Refusing {
        fn local_peer(&self) -> PeerId {
            self.host.local_peer()
        }

        async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<MessageStream, DealError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < self.succeed_on {
                return Err(deal_error!(network; "connection refused"));
            }
            self.host.open_stream(peer, protocol).await
        }
    }

    struct Echo;

    #[async_trait]
    impl StreamHandler for Echo {
        async fn handle_stream(&self, mut stream: MessageStream) {
            if let Ok(msg) = stream.read::<String>().await {
                let _ = stream.write(&msg).await;
            }
        }
    }

    fn fast() -> BackoffConfig {
        BackoffConfigBuilder::default()
            .min_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn retries_until_the_stream_opens() {
        let net = MemoryNetwork::new();
        let server = net.host(PeerId::new("server"));
        server.set_handler("/echo", Echo);
        let opener = Refusing { attempts: AtomicU32::new(0), succeed_on: 3, host: net.host(PeerId::new("client")) };

        let mut s = open_with_backoff(&opener, &PeerId::new("server"), "/echo", &fast()).await.unwrap();
        s.write(&"hi".to_string()).await.unwrap();
        assert_eq!(s.read::<String>().await.unwrap(), "hi");
        assert_eq!(opener.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let net = MemoryNetwork::new();
        let opener = Refusing { attempts: AtomicU32::new(0), succeed_on: 100, host: net.host(PeerId::new("client")) };
        let err = open_with_backoff(&opener, &PeerId::new("server"), "/echo", &fast()).await.unwrap_err();
        assert_eq!(err.msg(), "exhausted 5 attempts but failed to open stream, err: connection refused");
        assert_eq!(opener.attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn timeouts_are_reported() {
        let err = with_timeout(Duration::from_millis(5), "closing channel", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
    }
}

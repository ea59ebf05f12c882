// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::debug;

use crate::network::{MessageStream, PeerId, StreamHandler, StreamHost, StreamOpener};
use crate::{deal_error, DealError};

const PIPE_CAPACITY: usize = 64 << 10;

type Handlers = HashMap<(PeerId, String), Arc<dyn StreamHandler>>;

/// In-process transport: hosts on the same network reach each other's registered protocol
/// handlers over in-memory pipes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    handlers: Arc<RwLock<Handlers>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn host(&self, peer: PeerId) -> MemoryHost {
        MemoryHost { peer, network: self.clone() }
    }
}

/// One peer's endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryHost {
    peer: PeerId,
    network: MemoryNetwork,
}

impl MemoryHost {
    pub fn set_handler(&self, protocol: &str, handler: impl StreamHandler + 'static) {
        self.set_shared_handler(protocol, Arc::new(handler))
    }

    pub fn set_shared_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        if let Ok(mut handlers) = self.network.handlers.write() {
            handlers.insert((self.peer.clone(), protocol.to_string()), handler);
        }
    }

    pub fn remove_handler(&self, protocol: &str) {
        if let Ok(mut handlers) = self.network.handlers.write() {
            handlers.remove(&(self.peer.clone(), protocol.to_string()));
        }
    }
}

#[async_trait]
impl StreamOpener for MemoryHost {
    fn local_peer(&self) -> PeerId {
        self.peer.clone()
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<MessageStream, DealError> {
        let handler = self
            .network
            .handlers
            .read()
            .map_err(|_| deal_error!(illegal_state; "network lock poisoned"))?
            .get(&(peer.clone(), protocol.to_string()))
            .cloned()
            .ok_or_else(|| deal_error!(network; "protocol not supported"))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = MessageStream::new(self.peer.clone(), protocol, remote);
        debug!("{} opened {} to {}", self.peer, protocol, peer);
        tokio::spawn(async move { handler.handle_stream(inbound).await });
        Ok(MessageStream::new(peer.clone(), protocol, local))
    }
}

impl StreamHost for MemoryHost {
    fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.set_shared_handler(protocol, handler)
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.remove_handler(protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    #[async_trait]
    impl StreamHandler for Silent {
        async fn handle_stream(&self, _stream: MessageStream) {}
    }

    #[tokio::test]
    async fn unregistered_protocols_are_refused() {
        let net = MemoryNetwork::new();
        let a = net.host(PeerId::new("a"));
        let b = net.host(PeerId::new("b"));

        let err = a.open_stream(&PeerId::new("b"), "/x").await.unwrap_err();
        assert_eq!(err.msg(), "protocol not supported");

        b.set_handler("/x", Silent);
        let s = a.open_stream(&PeerId::new("b"), "/x").await.unwrap();
        assert_eq!(s.remote_peer(), &PeerId::new("b"));

        b.remove_handler("/x");
        assert!(a.open_stream(&PeerId::new("b"), "/x").await.is_err());
    }
}

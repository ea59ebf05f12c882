// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::RwLock;

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_car::{load_car, CarHeader};
use log::debug;

use crate::blockstore::{MemoryBlockstore, SharedBlockstore};
use crate::traversal::{traverse_blockstore, Selector};
use crate::util::AsDealErrors;
use crate::{deal_error, DealError};

/// Serialises blocks into a CARv1 archive with the given roots.
pub async fn write_car(roots: Vec<Cid>, blocks: Vec<(Cid, Vec<u8>)>) -> Result<Vec<u8>, DealError> {
    let header = CarHeader { roots, version: 1 };
    let mut out = Vec::new();
    header
        .write_stream_async(&mut out, &mut futures::stream::iter(blocks))
        .await
        .or_illegal_state("failed to write car")?;
    Ok(out)
}

/// Loads every block of a CARv1 archive into `store`, returning the archive's roots.
pub async fn load_car_bytes<BS: Blockstore>(store: &BS, car: &[u8]) -> Result<Vec<Cid>, DealError> {
    load_car(store, futures::io::Cursor::new(car)).await.or_illegal_state("attempting to read car file")
}

/// A deal's private block store and the root of the DAG it holds.
#[derive(Clone, Debug)]
pub struct TrackedStore {
    pub root: Cid,
    pub store: SharedBlockstore,
}

/// Keeps one isolated block store per deal, so blocks from different deals never mix.
#[derive(Default)]
pub struct StoreTracker {
    stores: RwLock<HashMap<String, TrackedStore>>,
}

impl StoreTracker {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the store for `key`, creating an empty one rooted at `root` if needed.
    pub fn get_or_create(&self, key: &str, root: Cid) -> Result<TrackedStore, DealError> {
        let mut stores =
            self.stores.write().map_err(|_| deal_error!(illegal_state; "store tracker lock poisoned"))?;
        let tracked = stores.entry(key.to_string()).or_insert_with(|| {
            debug!("tracking new store {} for root {}", key, root);
            TrackedStore { root, store: SharedBlockstore::new(MemoryBlockstore::new()) }
        });
        if tracked.root != root {
            return Err(deal_error!(illegal_argument;
                "store {} already tracks root {}, not {}", key, tracked.root, root));
        }
        Ok(tracked.clone())
    }

    pub fn get(&self, key: &str) -> Result<TrackedStore, DealError> {
        self.stores
            .read()
            .map_err(|_| deal_error!(illegal_state; "store tracker lock poisoned"))?
            .get(key)
            .cloned()
            .ok_or_else(|| deal_error!(not_found; "no store tracked for {}", key))
    }

    /// Stops tracking `key` and drops its blocks. Cleaning an unknown key is not an error.
    pub fn clean(&self, key: &str) -> Result<(), DealError> {
        let removed = self
            .stores
            .write()
            .map_err(|_| deal_error!(illegal_state; "store tracker lock poisoned"))?
            .remove(key);
        if let Some(tracked) = removed {
            tracked.store.clear().or_illegal_state("failed to clear deal store")?;
        }
        Ok(())
    }

    /// Writes the DAG tracked under `key` as a CAR with its root.
    pub async fn export_car(&self, key: &str) -> Result<Vec<u8>, DealError> {
        let tracked = self.get(key)?;
        let blocks = traverse_blockstore(&tracked.store, tracked.root, Selector::all())?;
        write_car(vec![tracked.root], blocks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipld::Node;
    use crate::util::cid::{cbor_cid, raw_cid};

    #[tokio::test]
    async fn export_then_load() {
        let tracker = StoreTracker::new();
        let leaf = raw_cid(b"leaf data").unwrap();
        let root_bytes = Node::map([("Links", Node::List(vec![Node::Link(leaf)]))]).encode().unwrap();
        let root = cbor_cid(&root_bytes).unwrap();

        let tracked = tracker.get_or_create("deal-1", root).unwrap();
        tracked.store.put_keyed(&leaf, b"leaf data").unwrap();
        tracked.store.put_keyed(&root, &root_bytes).unwrap();
        assert!(tracker.get_or_create("deal-1", leaf).is_err());

        let car = tracker.export_car("deal-1").await.unwrap();
        let target = MemoryBlockstore::new();
        assert_eq!(load_car_bytes(&target, &car).await.unwrap(), vec![root]);
        assert_eq!(target.get(&leaf).unwrap().as_deref(), Some(&b"leaf data"[..]));

        tracker.clean("deal-1").unwrap();
        assert_eq!(tracker.get("deal-1").unwrap_err().kind(), crate::ErrorKind::NotFound);
        tracker.clean("deal-1").unwrap();
    }
}

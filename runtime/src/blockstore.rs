// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use cid::Cid;

use fvm_ipld_blockstore::Blockstore;

/// Stats for a [MemoryBlockstore] this indicates the amount of read and written data
/// to the wrapped store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BSStats {
    /// Number of reads
    pub r: usize,
    /// Number of writes
    pub w: usize,
    /// Bytes Read
    pub br: usize,
    /// Bytes Written
    pub bw: usize,
}

/// Thread-safe in-memory blockstore that tracks reads and writes.
/// Shared between deals, so every access takes the lock for the shortest possible time.
#[derive(Debug, Default)]
pub struct MemoryBlockstore {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
    stats: Mutex<BSStats>,
}

/// Blockstore handle shared across deals and tasks.
#[derive(Debug, Clone, Default)]
pub struct SharedBlockstore(Arc<MemoryBlockstore>);

impl SharedBlockstore {
    pub fn new(store: MemoryBlockstore) -> Self {
        Self(Arc::new(store))
    }
}

impl Deref for SharedBlockstore {
    type Target = MemoryBlockstore;

    fn deref(&self) -> &MemoryBlockstore {
        &self.0
    }
}

impl Blockstore for SharedBlockstore {
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        self.0.get(cid)
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        self.0.has(cid)
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> Result<()> {
        self.0.put_keyed(k, block)
    }
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self { blocks: Default::default(), stats: Default::default() }
    }

    pub fn shared() -> SharedBlockstore {
        SharedBlockstore::new(Self::new())
    }

    pub fn stats(&self) -> BSStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Number of blocks held.
    pub fn len(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a block, returning whether it was present.
    pub fn delete(&self, cid: &Cid) -> Result<bool> {
        let mut blocks = self.blocks.write().map_err(|_| anyhow!("blockstore lock poisoned"))?;
        Ok(blocks.remove(cid).is_some())
    }

    /// Drops every block.
    pub fn clear(&self) -> Result<()> {
        self.blocks.write().map_err(|_| anyhow!("blockstore lock poisoned"))?.clear();
        Ok(())
    }

    fn record(&self, f: impl FnOnce(&mut BSStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats)
        }
    }
}

impl Blockstore for MemoryBlockstore {
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        let bytes = self
            .blocks
            .read()
            .map_err(|_| anyhow!("blockstore lock poisoned"))?
            .get(cid)
            .cloned();
        self.record(|stats| {
            stats.r += 1;
            if let Some(bytes) = &bytes {
                stats.br += bytes.len();
            }
        });
        Ok(bytes)
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        self.record(|stats| stats.r += 1);
        Ok(self.blocks.read().map_err(|_| anyhow!("blockstore lock poisoned"))?.contains_key(cid))
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> Result<()> {
        self.record(|stats| {
            stats.w += 1;
            stats.bw += block.len();
        });
        self.blocks
            .write()
            .map_err(|_| anyhow!("blockstore lock poisoned"))?
            .insert(*k, block.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::cid::{cbor_cid, raw_cid};

    #[test]
    fn basic_tracking_store() {
        let tr_store = MemoryBlockstore::new();
        assert_eq!(tr_store.stats(), BSStats::default());

        let data = &b"foobar"[..];
        let cid = raw_cid(data).unwrap();
        tr_store.get(&cid).unwrap();
        assert_eq!(tr_store.stats(), BSStats { r: 1, ..Default::default() });

        tr_store.put_keyed(&cid, data).unwrap();
        assert_eq!(tr_store.get(&cid).unwrap().as_deref(), Some(data));
        assert_eq!(tr_store.stats(), BSStats { r: 2, br: data.len(), w: 1, bw: data.len() });

        let b2 = &b"\x82\x01\x02"[..];
        let cid2 = cbor_cid(b2).unwrap();
        tr_store.put_keyed(&cid2, b2).unwrap();
        assert!(tr_store.has(&cid2).unwrap());
        assert_eq!(tr_store.len(), 2);

        assert!(tr_store.delete(&cid).unwrap());
        assert!(!tr_store.has(&cid).unwrap());
        tr_store.clear().unwrap();
        assert!(tr_store.is_empty());
    }

    #[test]
    fn concurrent_writers_do_not_lose_blocks() {
        let store = MemoryBlockstore::shared();
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..32u8 {
                        let data = [i, j];
                        store.put_keyed(&raw_cid(&data).unwrap(), &data).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 8 * 32);
    }
}

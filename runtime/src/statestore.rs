// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{from_slice, strict_bytes, to_vec};
use fvm_ipld_hamt::{BytesKey, Config, Hamt, Sha256};
use fvm_shared::address::Address;
use integer_encoding::VarInt;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::datastore::Datastore;
use crate::util::AsDealErrors;
use crate::{deal_error, DealError};

pub const HAMT_BIT_WIDTH: u32 = 5;

pub const DEFAULT_HAMT_CONFIG: Config =
    Config { bit_width: HAMT_BIT_WIDTH, min_data_depth: 0, max_array_width: 3 };

/// Datastore slot holding the CID of the HAMT root.
const ROOT_KEY: &str = "root";

/// A record as persisted: the schema version it was written with, and its CBOR encoding.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub version: u64,
    #[serde(with = "strict_bytes")]
    pub data: Vec<u8>,
}

pub trait StateKey: Sized + Debug + Clone + Send + Sync + 'static {
    fn from_bytes(b: &[u8]) -> Result<Self, String>;
    fn to_bytes(&self) -> Result<Vec<u8>, String>;
}

/// Upgrades the encoding of a record from `from_version` to `from_version + 1`.
#[derive(Clone, Copy)]
pub struct Migration {
    pub from_version: u64,
    pub upgrade: fn(&[u8]) -> Result<Vec<u8>, DealError>,
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failed: Vec<(String, DealError)>,
}

/// Durable keyed store of deal records.
///
/// Records live in a HAMT in `store`. Every mutation flushes the HAMT and writes the new root
/// into `meta`, so a store opened later over the same blockstore and datastore sees every
/// record. Mutations on one store are serialized by a single lock, so a read-modify-write of
/// one key can never interleave with another write.
pub struct StateStore<BS, K, V>
where
    BS: Blockstore,
    K: StateKey,
    V: Serialize + DeserializeOwned,
{
    store: BS,
    meta: Arc<dyn Datastore>,
    name: &'static str,
    version: u64,
    root: Mutex<Cid>,
    types: PhantomData<(K, V)>,
}

impl<BS, K, V> StateStore<BS, K, V>
where
    BS: Blockstore,
    K: StateKey,
    V: Serialize + DeserializeOwned,
{
    /// Opens the store recorded in `meta`, or creates an empty one.
    /// `version` is the schema version new records are written with.
    pub fn open(
        store: BS,
        meta: Arc<dyn Datastore>,
        name: &'static str,
        version: u64,
    ) -> Result<Self, DealError> {
        let root = match meta.get(ROOT_KEY)? {
            Some(bytes) => Cid::try_from(bytes.as_slice())
                .or_with_illegal_state(|| format!("invalid root for state store '{}'", name))?,
            None => {
                let root = Hamt::<&BS, StoredRecord, BytesKey, Sha256>::new_with_config(
                    &store,
                    DEFAULT_HAMT_CONFIG,
                )
                .flush()
                .or_with_illegal_state(|| format!("failed to flush empty state store '{}'", name))?;
                meta.put(ROOT_KEY, &root.to_bytes())?;
                root
            }
        };
        Ok(Self { store, meta, name, version, root: Mutex::new(root), types: PhantomData })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Creates a brand-new record. Fails if the key is already tracked.
    pub fn begin(&self, key: &K, value: &V) -> Result<(), DealError> {
        let mut root = self.lock_root()?;
        let mut hamt = self.load(&root)?;
        let k = self.key_bytes(key)?;
        let record = StoredRecord { version: self.version, data: to_vec(value)? };
        let inserted = hamt.set_if_absent(k.into(), record).or_with_illegal_state(|| {
            format!("failed to set key {:?} in state store '{}'", key, self.name)
        })?;
        if !inserted {
            return Err(deal_error!(already_exists; "state store '{}' already tracks {:?}", self.name, key));
        }
        self.commit(&mut root, &mut hamt)
    }

    /// Returns a snapshot of a record, if present.
    pub fn get(&self, key: &K) -> Result<Option<V>, DealError> {
        let root = self.lock_root()?;
        let hamt = self.load(&root)?;
        let k = self.key_bytes(key)?;
        let record = hamt.get(&k).or_with_illegal_state(|| {
            format!("failed to get key {:?} from state store '{}'", key, self.name)
        })?;
        record.map(|r| self.decode(key, r)).transpose()
    }

    pub fn has(&self, key: &K) -> Result<bool, DealError> {
        let root = self.lock_root()?;
        let hamt = self.load(&root)?;
        let k = self.key_bytes(key)?;
        hamt.contains_key(&k).or_with_illegal_state(|| {
            format!("failed to check key {:?} in state store '{}'", key, self.name)
        })
    }

    /// Atomically reads, modifies and writes back one record.
    /// Nothing is written if `f` fails.
    pub fn mutate<R, F>(&self, key: &K, f: F) -> Result<R, DealError>
    where
        F: FnOnce(&mut V) -> Result<R, DealError>,
    {
        let mut root = self.lock_root()?;
        let mut hamt = self.load(&root)?;
        let k = self.key_bytes(key)?;
        let record = hamt
            .get(&k)
            .or_with_illegal_state(|| {
                format!("failed to get key {:?} from state store '{}'", key, self.name)
            })?
            .ok_or_else(|| deal_error!(not_found; "no record for {:?} in state store '{}'", key, self.name))?;
        let mut value = self.decode(key, record)?;
        let out = f(&mut value)?;
        let record = StoredRecord { version: self.version, data: to_vec(&value)? };
        hamt.set(k.into(), record).or_with_illegal_state(|| {
            format!("failed to set key {:?} in state store '{}'", key, self.name)
        })?;
        self.commit(&mut root, &mut hamt)?;
        Ok(out)
    }

    /// Removes a record, returning it if it was present.
    pub fn end(&self, key: &K) -> Result<Option<V>, DealError> {
        let mut root = self.lock_root()?;
        let mut hamt = self.load(&root)?;
        let k = self.key_bytes(key)?;
        let removed = hamt.delete(&k).or_with_illegal_state(|| {
            format!("failed to delete key {:?} from state store '{}'", key, self.name)
        })?;
        let removed = match removed {
            Some((_, record)) => Some(self.decode(key, &record)?),
            None => None,
        };
        self.commit(&mut root, &mut hamt)?;
        Ok(removed)
    }

    /// Decodes every live record.
    pub fn list(&self) -> Result<Vec<(K, V)>, DealError> {
        let root = self.lock_root()?;
        let hamt = self.load(&root)?;
        let mut out = Vec::new();
        hamt.for_each(|k, record| {
            let key = K::from_bytes(k).map_err(|e| anyhow::anyhow!("invalid key: {}", e))?;
            let value = self.decode(&key, record).map_err(|e| anyhow::anyhow!(e))?;
            out.push((key, value));
            Ok(())
        })
        .or_with_illegal_state(|| format!("error traversing state store '{}'", self.name))?;
        Ok(out)
    }

    /// Brings every record written with an older schema version up to the current one.
    /// A record that fails to upgrade is reported and left as it was; the rest still run.
    pub fn migrate(&self, migrations: &[Migration]) -> Result<MigrationReport, DealError> {
        let mut root = self.lock_root()?;
        let mut hamt = self.load(&root)?;

        let mut stale = Vec::new();
        hamt.for_each(|k, record| {
            if record.version < self.version {
                stale.push((k.0.clone(), record.clone()));
            }
            Ok(())
        })
        .or_with_illegal_state(|| format!("error traversing state store '{}'", self.name))?;

        let mut report = MigrationReport::default();
        for (k, record) in stale {
            let label = K::from_bytes(&k).map(|key| format!("{:?}", key)).unwrap_or_else(|e| e);
            match self.upgrade(record, migrations) {
                Ok(upgraded) => {
                    hamt.set(k.into(), upgraded).or_with_illegal_state(|| {
                        format!("failed to write migrated record {} in '{}'", label, self.name)
                    })?;
                    report.migrated += 1;
                }
                Err(e) => {
                    warn!("failed to migrate record {} in state store '{}': {}", label, self.name, e);
                    report.failed.push((label, e));
                }
            }
        }
        if report.migrated > 0 {
            self.commit(&mut root, &mut hamt)?;
            info!("migrated {} records in state store '{}'", report.migrated, self.name);
        }
        Ok(report)
    }

    fn upgrade(
        &self,
        mut record: StoredRecord,
        migrations: &[Migration],
    ) -> Result<StoredRecord, DealError> {
        while record.version < self.version {
            let step = migrations
                .iter()
                .find(|m| m.from_version == record.version)
                .ok_or_else(|| deal_error!(illegal_state; "no migration from version {}", record.version))?;
            record = StoredRecord { version: record.version + 1, data: (step.upgrade)(&record.data)? };
        }
        Ok(record)
    }

    fn decode(&self, key: &K, record: &StoredRecord) -> Result<V, DealError> {
        if record.version != self.version {
            return Err(deal_error!(illegal_state;
                "record {:?} in '{}' has version {}, expected {}",
                key, self.name, record.version, self.version));
        }
        Ok(from_slice(&record.data)?)
    }

    fn key_bytes(&self, key: &K) -> Result<Vec<u8>, DealError> {
        key.to_bytes().map_err(|e| deal_error!(illegal_argument; "invalid key {:?}: {}", key, e))
    }

    fn lock_root(&self) -> Result<MutexGuard<'_, Cid>, DealError> {
        self.root
            .lock()
            .map_err(|_| deal_error!(illegal_state; "state store '{}' lock poisoned", self.name))
    }

    fn load(&self, root: &Cid) -> Result<Hamt<&BS, StoredRecord, BytesKey, Sha256>, DealError> {
        Hamt::load_with_config(root, &self.store, DEFAULT_HAMT_CONFIG)
            .or_with_illegal_state(|| format!("failed to load state store '{}'", self.name))
    }

    fn commit(
        &self,
        root: &mut Cid,
        hamt: &mut Hamt<&BS, StoredRecord, BytesKey, Sha256>,
    ) -> Result<(), DealError> {
        let new_root = hamt
            .flush()
            .or_with_illegal_state(|| format!("failed to flush state store '{}'", self.name))?;
        self.meta.put(ROOT_KEY, &new_root.to_bytes())?;
        *root = new_root;
        Ok(())
    }
}

impl StateKey for Vec<u8> {
    fn from_bytes(b: &[u8]) -> Result<Self, String> {
        Ok(b.to_vec())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, String> {
        Ok(self.clone())
    }
}

impl StateKey for u64 {
    fn from_bytes(b: &[u8]) -> Result<Self, String> {
        if let Some((result, size)) = VarInt::decode_var(b) {
            if size != b.len() {
                return Err(format!("trailing bytes after varint in {:?}", b));
            }
            Ok(result)
        } else {
            Err(format!("failed to decode varint in {:?}", b))
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, String> {
        Ok(self.encode_var_vec())
    }
}

impl StateKey for Address {
    fn from_bytes(b: &[u8]) -> Result<Self, String> {
        Address::from_bytes(b).map_err(|e| e.to_string())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, String> {
        Ok(Address::to_bytes(*self))
    }
}

impl StateKey for Cid {
    fn from_bytes(b: &[u8]) -> Result<Self, String> {
        Cid::try_from(b).map_err(|e| e.to_string())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, String> {
        Ok(Cid::to_bytes(self))
    }
}

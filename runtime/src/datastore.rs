// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::{deal_error, DealError};

/// A flat key-value store for small metadata slots: state store roots, the latest ask,
/// deal ID counters.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DealError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), DealError>;
    fn delete(&self, key: &str) -> Result<(), DealError>;
    fn has(&self, key: &str) -> Result<bool, DealError> {
        Ok(self.get(key)?.is_some())
    }
    /// Lists keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, DealError>;
}

/// Thread-safe datastore held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn shared() -> Arc<dyn Datastore> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> DealError {
    deal_error!(illegal_state; "datastore lock poisoned")
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DealError> {
        Ok(self.entries.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), DealError> {
        self.entries.write().map_err(|_| poisoned())?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), DealError> {
        self.entries.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, DealError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Prefixes every key with a namespace such as `/deals/client`, so several stores can
/// share one backing datastore.
#[derive(Clone)]
pub struct NamespacedDatastore {
    inner: Arc<dyn Datastore>,
    prefix: String,
}

impl NamespacedDatastore {
    pub fn new(inner: Arc<dyn Datastore>, prefix: impl Into<String>) -> Self {
        Self { inner, prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key.trim_start_matches('/'))
    }
}

impl Datastore for NamespacedDatastore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DealError> {
        self.inner.get(&self.full_key(key))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), DealError> {
        self.inner.put(&self.full_key(key), value)
    }

    fn delete(&self, key: &str) -> Result<(), DealError> {
        self.inner.delete(&self.full_key(key))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, DealError> {
        let own = format!("{}/", self.prefix);
        Ok(self
            .inner
            .keys_with_prefix(&self.full_key(prefix))?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&own).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_are_isolated() {
        let ds = MemoryDatastore::shared();
        let client = NamespacedDatastore::new(ds.clone(), "/deals/client");
        let provider = NamespacedDatastore::new(ds.clone(), "/deals/provider");

        client.put("root", b"c").unwrap();
        provider.put("root", b"p").unwrap();
        provider.put("latest-ask", b"ask").unwrap();

        assert_eq!(client.get("root").unwrap(), Some(b"c".to_vec()));
        assert_eq!(provider.get("root").unwrap(), Some(b"p".to_vec()));
        assert!(!client.has("latest-ask").unwrap());
        assert_eq!(provider.keys_with_prefix("").unwrap(), vec!["latest-ask", "root"]);
        assert!(ds.has("/deals/client/root").unwrap());

        provider.delete("root").unwrap();
        assert_eq!(provider.get("root").unwrap(), None);
    }
}

//! In-process [`ObjectBackend`] for tests.
//!
//! Buckets live in a [`DashMap`]; keys are kept sorted so listings are
//! deterministic.  Failure switches let callers exercise the deletion
//! fallback without a real store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use super::{ObjectBackend, StoreClient, StoreConnector};
use crate::config::StoreConfig;
use crate::error::CsiError;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: DashMap<String, BTreeSet<String>>,
    /// Keys that refuse to be deleted, in bulk or one by one.
    undeletable: DashSet<String>,
    fail_bulk: AtomicBool,
    unreachable: AtomicBool,
    bulk_calls: AtomicUsize,
    single_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_bucket(&self, bucket: &str) {
        self.buckets.entry(bucket.to_owned()).or_default();
    }

    /// Insert `key`, creating the bucket if needed.
    pub fn insert_object(&self, bucket: &str, key: &str) {
        self.buckets
            .entry(bucket.to_owned())
            .or_default()
            .insert(key.to_owned());
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.contains_key(bucket)
    }

    /// Sorted keys of `bucket`, or `None` if it does not exist.
    pub fn objects(&self, bucket: &str) -> Option<Vec<String>> {
        self.buckets
            .get(bucket)
            .map(|keys| keys.iter().cloned().collect())
    }

    /// Make every multi-object delete fail as a whole.
    pub fn set_fail_bulk(&self, fail: bool) {
        self.fail_bulk.store(fail, Ordering::SeqCst);
    }

    /// Make every call fail as if the endpoint were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn make_undeletable(&self, key: &str) {
        self.undeletable.insert(key.to_owned());
    }

    pub fn bulk_delete_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn single_delete_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), CsiError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CsiError::StoreUnavailable(
                "memory store marked unreachable".into(),
            ));
        }
        Ok(())
    }

    fn no_such_bucket(bucket: &str) -> CsiError {
        CsiError::StoreOperationFailed(format!("NoSuchBucket: {bucket}"))
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn head_bucket(&self, bucket: &str) -> Result<bool, CsiError> {
        self.check_reachable()?;
        Ok(self.buckets.contains_key(bucket))
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        self.check_reachable()?;
        match self.buckets.entry(bucket.to_owned()) {
            Entry::Occupied(_) => Err(CsiError::StoreOperationFailed(format!(
                "BucketAlreadyOwnedByYou: {bucket}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(BTreeSet::new());
                Ok(())
            }
        }
    }

    async fn put_empty_object(&self, bucket: &str, key: &str) -> Result<(), CsiError> {
        self.check_reachable()?;
        let mut keys = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        keys.insert(key.to_owned());
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<(), CsiError> {
        self.check_reachable()?;
        // Snapshot first so no map guard is held across the sends.
        let keys: Vec<String> = self
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in keys {
            if tx.send(key).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CsiError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.undeletable.contains(key) {
            return Err(CsiError::StoreOperationFailed(format!("AccessDenied: {key}")));
        }
        let mut keys = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        keys.remove(key);
        Ok(())
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        keys: Vec<String>,
    ) -> Result<Vec<String>, CsiError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(CsiError::StoreOperationFailed(
                "MalformedXML: bulk delete rejected".into(),
            ));
        }
        let mut stored = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        let mut failed = Vec::new();
        for key in keys {
            if self.undeletable.contains(&key) {
                failed.push(key);
            } else {
                stored.remove(&key);
            }
        }
        Ok(failed)
    }

    async fn remove_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        self.check_reachable()?;
        match self.buckets.entry(bucket.to_owned()) {
            Entry::Vacant(_) => Err(Self::no_such_bucket(bucket)),
            Entry::Occupied(entry) if !entry.get().is_empty() => Err(
                CsiError::StoreOperationFailed(format!("BucketNotEmpty: {bucket}")),
            ),
            Entry::Occupied(entry) => {
                entry.remove();
                Ok(())
            }
        }
    }
}

/// Hands out clients that all share this backend, whatever the config says.
impl StoreConnector for Arc<MemoryBackend> {
    fn connect(&self, _config: &StoreConfig) -> Result<StoreClient, CsiError> {
        Ok(StoreClient::new(Arc::clone(self) as Arc<dyn ObjectBackend>))
    }
}

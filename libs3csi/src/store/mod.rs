//! Object store access.
//!
//! [`ObjectBackend`] is the narrow set of primitives a store must offer
//! (bucket head/create/remove, object put/list/delete).  [`StoreClient`]
//! builds the volume-level operations on top of it, most notably the
//! two-phase bucket and prefix deletion:
//!
//! 1. **Bulk** - a listing task streams keys into a queue; the caller groups
//!    them into batches of [`BULK_DELETE_BATCH`] and issues one multi-object
//!    delete per batch.
//! 2. **One by one** - only if phase 1 reported any failure: the listing task
//!    feeds [`DELETE_PARALLELISM`] workers that each delete a single key at a
//!    time.  The caller joins every worker before reading the counters, and
//!    leaves the bucket in place if anything survived.
//!
//! A [`StoreClient`] is created per request through a [`StoreConnector`]
//! from that request's [`StoreConfig`]; nothing is reused across requests.

#[cfg(test)]
pub(crate) mod memory;
pub mod s3;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::error::CsiError;

#[cfg(test)]
pub(crate) use memory::MemoryBackend;
pub use s3::{S3Backend, S3Connector};

/// Maximum keys per multi-object delete request.
pub const BULK_DELETE_BATCH: usize = 1000;

/// Concurrent single-object deletions in the fallback phase.
pub const DELETE_PARALLELISM: usize = 16;

/// Primitive operations against an object store.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Whether `bucket` exists.  Unreachable stores yield
    /// [`CsiError::StoreUnavailable`].
    async fn head_bucket(&self, bucket: &str) -> Result<bool, CsiError>;

    /// Create `bucket`; fails if it already exists.
    async fn make_bucket(&self, bucket: &str) -> Result<(), CsiError>;

    /// Write a zero-length object at `key`.
    async fn put_empty_object(&self, bucket: &str, key: &str) -> Result<(), CsiError>;

    /// Send every key under `prefix` (recursively) into `tx`.  Returns early
    /// and successfully if the receiver is dropped.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<(), CsiError>;

    /// Delete a single object.  Deleting a missing key succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CsiError>;

    /// Delete many objects in one call and return the keys that were not
    /// removed.  An `Err` means the whole batch failed.
    async fn delete_objects(&self, bucket: &str, keys: Vec<String>)
    -> Result<Vec<String>, CsiError>;

    /// Remove an empty bucket.
    async fn remove_bucket(&self, bucket: &str) -> Result<(), CsiError>;
}

/// Creates a [`StoreClient`] for one request.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, config: &StoreConfig) -> Result<StoreClient, CsiError>;
}

/// Key of the zero-length object that materializes `prefix`.
pub fn prefix_marker(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

/// Volume-level operations on top of an [`ObjectBackend`].
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn ObjectBackend>,
}

impl StoreClient {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool, CsiError> {
        self.backend.head_bucket(bucket).await
    }

    /// Create `bucket`.  Callers must check [`Self::bucket_exists`] first;
    /// creating an existing bucket is an error.
    #[instrument(skip(self))]
    pub async fn create_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        self.backend.make_bucket(bucket).await?;
        info!(bucket, "bucket created");
        Ok(())
    }

    /// Materialize `prefix` inside `bucket` with a zero-length marker.
    #[instrument(skip(self))]
    pub async fn create_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CsiError> {
        self.backend
            .put_empty_object(bucket, &prefix_marker(prefix))
            .await?;
        info!(bucket, prefix, "prefix created");
        Ok(())
    }

    /// Empty and remove `bucket`.
    ///
    /// If objects survive the one-by-one fallback the bucket is left in
    /// place and [`CsiError::PartialDeletionFailure`] is returned.
    #[instrument(skip(self))]
    pub async fn delete_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        self.delete_objects(bucket, "").await?;
        self.backend.remove_bucket(bucket).await?;
        info!(bucket, "bucket deleted");
        Ok(())
    }

    /// Remove `prefix` and everything under it, then remove the bucket if
    /// nothing else is left in it.
    #[instrument(skip(self))]
    pub async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CsiError> {
        let marker = prefix_marker(prefix);
        self.backend.delete_object(bucket, &marker).await?;
        debug!(bucket, %marker, "prefix marker removed");

        self.delete_objects(bucket, &marker).await?;

        if self.is_bucket_empty(bucket).await? {
            self.backend.remove_bucket(bucket).await?;
            info!(bucket, prefix, "prefix deleted, bucket was empty and has been removed");
        } else {
            info!(bucket, prefix, "prefix deleted");
        }
        Ok(())
    }

    /// Bulk pass, then the one-by-one pass if the bulk pass reported any
    /// failure.
    async fn delete_objects(&self, bucket: &str, prefix: &str) -> Result<(), CsiError> {
        match self.delete_objects_bulk(bucket, prefix).await {
            Ok(removed) => {
                debug!(bucket, prefix, removed, "bulk delete complete");
                Ok(())
            }
            Err(e) => {
                warn!(bucket, prefix, error = %e, "bulk delete failed, deleting objects one by one");
                let removed = self.delete_objects_one_by_one(bucket, prefix).await?;
                debug!(bucket, prefix, removed, "one-by-one delete complete");
                Ok(())
            }
        }
    }

    fn spawn_listing(
        &self,
        bucket: &str,
        prefix: &str,
        tx: mpsc::Sender<String>,
    ) -> JoinHandle<Result<(), CsiError>> {
        let backend = Arc::clone(&self.backend);
        let bucket = bucket.to_owned();
        let prefix = prefix.to_owned();
        tokio::spawn(async move { backend.list_objects(&bucket, &prefix, tx).await })
    }

    /// Returns the number of objects removed.
    async fn delete_objects_bulk(&self, bucket: &str, prefix: &str) -> Result<u64, CsiError> {
        let (tx, mut rx) = mpsc::channel(BULK_DELETE_BATCH);
        let lister = self.spawn_listing(bucket, prefix, tx);

        let mut batch = Vec::with_capacity(BULK_DELETE_BATCH);
        let mut total = 0u64;
        let mut failed = 0u64;
        while let Some(key) = rx.recv().await {
            batch.push(key);
            if batch.len() == BULK_DELETE_BATCH {
                total += batch.len() as u64;
                failed += self.flush_batch(bucket, &mut batch).await;
            }
        }
        if !batch.is_empty() {
            total += batch.len() as u64;
            failed += self.flush_batch(bucket, &mut batch).await;
        }

        lister.await.map_err(CsiError::internal)??;

        if failed > 0 {
            return Err(CsiError::PartialDeletionFailure {
                failed,
                total,
                path: scope_path(bucket, prefix),
            });
        }
        Ok(total)
    }

    /// Issue one multi-object delete and return how many keys failed.
    async fn flush_batch(&self, bucket: &str, batch: &mut Vec<String>) -> u64 {
        let keys = std::mem::take(batch);
        let attempted = keys.len() as u64;
        match self.backend.delete_objects(bucket, keys).await {
            Ok(failed) => {
                for key in &failed {
                    warn!(bucket, %key, "bulk delete left object behind");
                }
                failed.len() as u64
            }
            Err(e) => {
                warn!(bucket, attempted, error = %e, "bulk delete request failed");
                attempted
            }
        }
    }

    /// Returns the number of objects removed.
    async fn delete_objects_one_by_one(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<u64, CsiError> {
        let (tx, rx) = mpsc::channel::<String>(DELETE_PARALLELISM);
        let lister = self.spawn_listing(bucket, prefix, tx);

        let queue = Arc::new(Mutex::new(rx));
        let total = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let mut workers = JoinSet::new();
        for _ in 0..DELETE_PARALLELISM {
            let queue = Arc::clone(&queue);
            let backend = Arc::clone(&self.backend);
            let bucket = bucket.to_owned();
            let total = Arc::clone(&total);
            let failed = Arc::clone(&failed);
            workers.spawn(async move {
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some(key) = next else { break };
                    total.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = backend.delete_object(&bucket, &key).await {
                        warn!(%bucket, %key, error = %e, "failed to remove object");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }

        // Every worker must be done before the counters are read.
        while let Some(joined) = workers.join_next().await {
            joined.map_err(CsiError::internal)?;
        }
        lister.await.map_err(CsiError::internal)??;

        let total = total.load(Ordering::Acquire);
        let failed = failed.load(Ordering::Acquire);
        if failed > 0 {
            return Err(CsiError::PartialDeletionFailure {
                failed,
                total,
                path: scope_path(bucket, prefix),
            });
        }
        Ok(total)
    }

    async fn is_bucket_empty(&self, bucket: &str) -> Result<bool, CsiError> {
        let (tx, mut rx) = mpsc::channel(1);
        let lister = self.spawn_listing(bucket, "", tx);
        let first = rx.recv().await;
        // Dropping the receiver stops the listing after the first key.
        drop(rx);
        lister.await.map_err(CsiError::internal)??;
        Ok(first.is_none())
    }
}

fn scope_path(bucket: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        bucket.to_owned()
    } else {
        format!("{bucket}/{}", prefix.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(backend: &Arc<MemoryBackend>) -> StoreClient {
        StoreClient::new(Arc::clone(backend) as Arc<dyn ObjectBackend>)
    }

    fn seeded(bucket: &str, keys: impl IntoIterator<Item = String>) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_bucket(bucket);
        for key in keys {
            backend.insert_object(bucket, &key);
        }
        backend
    }

    #[test]
    fn marker_has_single_trailing_slash() {
        assert_eq!(prefix_marker("vol-1"), "vol-1/");
        assert_eq!(prefix_marker("vol-1/"), "vol-1/");
    }

    #[tokio::test]
    async fn create_bucket_twice_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let store = client(&backend);
        assert!(!store.bucket_exists("vol-1").await.unwrap());
        store.create_bucket("vol-1").await.unwrap();
        assert!(store.bucket_exists("vol-1").await.unwrap());

        let err = store.create_bucket("vol-1").await.unwrap_err();
        assert!(matches!(err, CsiError::StoreOperationFailed(_)));
    }

    #[tokio::test]
    async fn unreachable_store_is_unavailable() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_unreachable(true);
        let err = client(&backend).bucket_exists("vol-1").await.unwrap_err();
        assert!(matches!(err, CsiError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn delete_bucket_uses_bulk_path() {
        let backend = seeded("vol-1", (0..2500).map(|i| format!("dir/file-{i}")));
        client(&backend).delete_bucket("vol-1").await.unwrap();

        assert!(!backend.has_bucket("vol-1"));
        // 2500 keys in batches of 1000.
        assert_eq!(backend.bulk_delete_calls(), 3);
        assert_eq!(backend.single_delete_calls(), 0);
    }

    #[tokio::test]
    async fn bulk_failure_falls_back_to_one_by_one() {
        let n = 137;
        let backend = seeded("vol-1", (0..n).map(|i| format!("file-{i}")));
        backend.set_fail_bulk(true);

        client(&backend).delete_bucket("vol-1").await.unwrap();

        assert_eq!(backend.single_delete_calls(), n);
        assert!(!backend.has_bucket("vol-1"));
    }

    #[tokio::test]
    async fn partial_failure_keeps_bucket_and_counts() {
        let n = 50;
        let backend = seeded("vol-1", (0..n).map(|i| format!("file-{i}")));
        backend.set_fail_bulk(true);
        backend.make_undeletable("file-3");
        backend.make_undeletable("file-42");

        let err = client(&backend).delete_bucket("vol-1").await.unwrap_err();
        match err {
            CsiError::PartialDeletionFailure {
                failed,
                total,
                path,
            } => {
                assert_eq!(failed, 2);
                assert_eq!(total, n as u64);
                assert_eq!(path, "vol-1");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.single_delete_calls(), n);
        assert!(backend.has_bucket("vol-1"));
        assert_eq!(
            backend.objects("vol-1").unwrap(),
            vec!["file-3".to_owned(), "file-42".to_owned()]
        );
    }

    #[tokio::test]
    async fn bulk_partial_result_triggers_fallback() {
        let backend = seeded("vol-1", (0..10).map(|i| format!("file-{i}")));
        // Bulk call succeeds but reports one key as not removed; the
        // one-by-one pass then sees only that survivor.
        backend.make_undeletable("file-7");

        let err = client(&backend).delete_bucket("vol-1").await.unwrap_err();
        assert!(matches!(
            err,
            CsiError::PartialDeletionFailure {
                failed: 1,
                total: 1,
                ..
            }
        ));
        assert_eq!(backend.bulk_delete_calls(), 1);
        assert_eq!(backend.single_delete_calls(), 1);
    }

    #[tokio::test]
    async fn delete_prefix_keeps_other_content() {
        let backend = seeded(
            "shared",
            ["vol-1/", "vol-1/a", "vol-1/b/c", "vol-10/x", "vol-2/"]
                .into_iter()
                .map(str::to_owned),
        );

        client(&backend)
            .delete_prefix("shared", "vol-1")
            .await
            .unwrap();

        assert!(backend.has_bucket("shared"));
        assert_eq!(
            backend.objects("shared").unwrap(),
            vec!["vol-10/x".to_owned(), "vol-2/".to_owned()]
        );
    }

    #[tokio::test]
    async fn delete_last_prefix_removes_bucket() {
        let backend = seeded(
            "shared",
            ["vol-1/", "vol-1/a"].into_iter().map(str::to_owned),
        );
        client(&backend)
            .delete_prefix("shared", "vol-1")
            .await
            .unwrap();
        assert!(!backend.has_bucket("shared"));
    }

    #[tokio::test]
    async fn delete_prefix_fallback_is_scoped() {
        let backend = seeded(
            "shared",
            ["vol-1/", "vol-1/a", "vol-1/b", "other/keep"]
                .into_iter()
                .map(str::to_owned),
        );
        backend.set_fail_bulk(true);

        client(&backend)
            .delete_prefix("shared", "vol-1")
            .await
            .unwrap();

        // Marker delete + the two objects under the prefix.
        assert_eq!(backend.single_delete_calls(), 3);
        assert_eq!(
            backend.objects("shared").unwrap(),
            vec!["other/keep".to_owned()]
        );
    }

    #[tokio::test]
    async fn delete_prefix_partial_failure_keeps_bucket() {
        let backend = seeded(
            "shared",
            ["vol-1/", "vol-1/a", "vol-1/b"]
                .into_iter()
                .map(str::to_owned),
        );
        backend.set_fail_bulk(true);
        backend.make_undeletable("vol-1/b");

        let err = client(&backend)
            .delete_prefix("shared", "vol-1")
            .await
            .unwrap_err();
        match err {
            CsiError::PartialDeletionFailure {
                failed,
                total,
                path,
            } => {
                assert_eq!((failed, total), (1, 2));
                assert_eq!(path, "shared/vol-1");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(backend.has_bucket("shared"));
        assert_eq!(
            backend.objects("shared").unwrap(),
            vec!["vol-1/b".to_owned()]
        );
    }
}

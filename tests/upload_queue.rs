use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::sync::Semaphore;
use upload_queue::{
    AssetRef, AssetResolver, BatchId, BatchOutcome, BatchReport, BatchSnapshot, FsAssetResolver,
    LocalObjectStore, MAX_SELECTION, ObjectStore, OutcomeNotifier, QueueConfig, ResolvedAsset,
    SelectionSet, StaticIdentity, StorageError, Subscription, TransferError, TransferStatus,
    UploadError, UploadQueue, Visibility,
    models::{metadata::UploadMetadata, object::StoredObject, upload_session::UploadSession},
};
use uuid::Uuid;

/// In-memory store. `finish_upload` for a gated file index blocks until the
/// test releases it, which lets tests pick the completion order.
#[derive(Default)]
struct ScriptedStore {
    sessions: Mutex<HashMap<String, (String, Vec<u8>)>>,
    gates: Mutex<HashMap<usize, Arc<Semaphore>>>,
    chunk_calls: Mutex<usize>,
    broken: bool,
}

impl ScriptedStore {
    fn gated(indices: &[usize]) -> Arc<Self> {
        let store = Self::default();
        for &i in indices {
            store.gates.lock().insert(i, Arc::new(Semaphore::new(0)));
        }
        Arc::new(store)
    }

    fn broken() -> Arc<Self> {
        Arc::new(Self {
            broken: true,
            ..Default::default()
        })
    }

    fn release(&self, index: usize) {
        if let Some(gate) = self.gates.lock().get(&index) {
            gate.add_permits(1);
        }
    }

    fn file_index(key: &str) -> Option<usize> {
        key.rsplit('-')
            .next()
            .and_then(|tail| tail.strip_suffix(".jpg"))
            .and_then(|n| n.parse().ok())
    }
}

#[async_trait]
impl ObjectStore for ScriptedStore {
    async fn begin_upload(
        &self,
        key: &str,
        total_bytes: u64,
        metadata: &UploadMetadata,
    ) -> Result<UploadSession, StorageError> {
        let upload_id = Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .insert(upload_id.clone(), (key.to_string(), Vec::new()));
        Ok(UploadSession {
            upload_id,
            key: key.to_string(),
            content_type: metadata.content_type.clone(),
            custom_metadata: "[]".into(),
            total_bytes: total_bytes as i64,
            committed_bytes: 0,
            initiated_at: Utc::now(),
        })
    }

    async fn upload_chunk(&self, upload_id: &str, offset: u64, chunk: Bytes) -> Result<u64, StorageError> {
        *self.chunk_calls.lock() += 1;
        if self.broken {
            return Err(StorageError::Unavailable("network is unreachable".into()));
        }
        let mut sessions = self.sessions.lock();
        let (_, data) = sessions
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::SessionNotFound(upload_id.to_string()))?;
        if offset != data.len() as u64 {
            return Err(StorageError::OffsetMismatch {
                expected: data.len() as u64,
                got: offset,
            });
        }
        data.extend_from_slice(&chunk);
        Ok(data.len() as u64)
    }

    async fn committed_offset(&self, upload_id: &str) -> Result<u64, StorageError> {
        self.sessions
            .lock()
            .get(upload_id)
            .map(|(_, data)| data.len() as u64)
            .ok_or_else(|| StorageError::SessionNotFound(upload_id.to_string()))
    }

    async fn finish_upload(&self, upload_id: &str) -> Result<StoredObject, StorageError> {
        let (key, size) = self
            .sessions
            .lock()
            .get(upload_id)
            .map(|(key, data)| (key.clone(), data.len() as i64))
            .ok_or_else(|| StorageError::SessionNotFound(upload_id.to_string()))?;

        let gate = Self::file_index(&key).and_then(|i| self.gates.lock().get(&i).cloned());
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        Ok(StoredObject {
            id: Uuid::new_v4(),
            key,
            content_type: Some("image/jpeg".into()),
            size_bytes: size,
            etag: String::new(),
            last_modified: Utc::now(),
        })
    }

    async fn download_url(&self, key: &str) -> Result<String, StorageError> {
        Ok(format!("mem://{key}"))
    }
}

/// Serves a few bytes for every asset except the ones listed as missing.
#[derive(Default)]
struct MemoryResolver {
    missing: HashSet<String>,
    panics_on: Option<String>,
}

#[async_trait]
impl AssetResolver for MemoryResolver {
    async fn resolve(&self, asset: &AssetRef) -> Result<ResolvedAsset, TransferError> {
        if self.panics_on.as_deref() == Some(asset.as_str()) {
            panic!("resolver crashed on {asset}");
        }
        if self.missing.contains(asset.as_str()) {
            return Err(TransferError::asset_unavailable(asset, "deleted from library"));
        }
        Ok(ResolvedAsset {
            bytes: Bytes::from(asset.as_str().repeat(16)),
            content_type: "image/jpeg".into(),
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    reports: Mutex<Vec<BatchReport>>,
}

impl OutcomeNotifier for RecordingNotifier {
    fn notify(&self, report: &BatchReport) {
        self.reports.lock().push(report.clone());
    }
}

type SnapshotLog = Arc<Mutex<Vec<Vec<BatchSnapshot>>>>;

fn config() -> QueueConfig {
    QueueConfig {
        chunk_size: 8,
        chunk_retries: 2,
        retry_backoff: Duration::ZERO,
    }
}

fn queue_with(
    store: Arc<dyn ObjectStore>,
    resolver: MemoryResolver,
) -> (UploadQueue, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let queue = UploadQueue::new(store, Arc::new(resolver), notifier.clone(), config());
    (queue, notifier)
}

async fn local_store(root: &Path) -> LocalObjectStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = LocalObjectStore::new(Arc::new(pool), root, "http://photos.test");
    store.migrate().await.unwrap();
    store
}

fn assets(names: &[&str]) -> Vec<AssetRef> {
    names.iter().map(|n| AssetRef::from(*n)).collect()
}

fn record(queue: &UploadQueue) -> (Subscription, SnapshotLog) {
    let log: SnapshotLog = Arc::default();
    let sink = Arc::clone(&log);
    let sub = queue.subscribe(move |batches| sink.lock().push(batches.to_vec()));
    (sub, log)
}

/// Snapshots of one batch, in the order they were published.
fn history(log: &SnapshotLog, id: BatchId) -> Vec<BatchSnapshot> {
    log.lock()
        .iter()
        .filter_map(|batches| batches.iter().find(|b| b.id == id).cloned())
        .collect()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn assert_bounds(snapshot: &BatchSnapshot) {
    assert!(snapshot.completed_files <= snapshot.total_files);
    assert!((0.0..=100.0).contains(&snapshot.progress), "progress {}", snapshot.progress);
}

#[tokio::test]
async fn empty_selection_is_a_no_op() {
    let store = ScriptedStore::gated(&[]);
    let (queue, notifier) = queue_with(store.clone(), MemoryResolver::default());
    let (_sub, log) = record(&queue);

    let started = queue
        .start_upload(&StaticIdentity::signed_in("user-1"), Vec::new(), Visibility::Public)
        .unwrap();

    assert_eq!(started, None);
    assert!(!queue.is_uploading());
    assert!(queue.list_active_batches().is_empty());
    // Only the replay on subscribe.
    assert_eq!(log.lock().len(), 1);
    assert!(notifier.reports.lock().is_empty());
}

#[tokio::test]
async fn missing_identity_is_rejected_without_a_batch() {
    let store = ScriptedStore::gated(&[]);
    let (queue, notifier) = queue_with(store.clone(), MemoryResolver::default());

    let err = queue
        .start_upload(&StaticIdentity::anonymous(), assets(&["a.jpg"]), Visibility::Private)
        .unwrap_err();

    assert_eq!(err, UploadError::Unauthenticated);
    assert!(!queue.is_uploading());
    assert!(queue.shutdown().await.is_empty());
    assert_eq!(*store.chunk_calls.lock(), 0);
    assert!(notifier.reports.lock().is_empty());
}

#[tokio::test]
async fn owner_id_that_would_nest_keys_is_rejected_without_a_batch() {
    let store = ScriptedStore::gated(&[]);
    let (queue, notifier) = queue_with(store.clone(), MemoryResolver::default());

    for owner in ["alice/../bob", "bob/photos", ".."] {
        let err = queue
            .start_upload(&StaticIdentity::signed_in(owner), assets(&["a.jpg"]), Visibility::Public)
            .unwrap_err();
        assert_eq!(err, UploadError::InvalidOwner(owner.to_string()));
    }

    assert!(!queue.is_uploading());
    assert!(queue.shutdown().await.is_empty());
    assert_eq!(*store.chunk_calls.lock(), 0);
    assert!(notifier.reports.lock().is_empty());
}

#[tokio::test]
async fn fourth_asset_is_refused() {
    let mut selection = SelectionSet::try_from(assets(&["a", "b", "c"])).unwrap();
    assert!(selection.add("d".into()).is_err());
    assert_eq!(selection.len(), MAX_SELECTION);
    assert!(!selection.contains(&"d".into()));

    let (queue, _) = queue_with(ScriptedStore::gated(&[]), MemoryResolver::default());
    let err = queue
        .start_upload(
            &StaticIdentity::signed_in("user-1"),
            assets(&["a", "b", "c", "d"]),
            Visibility::Public,
        )
        .unwrap_err();
    assert_eq!(err, UploadError::SelectionLimitExceeded { limit: 3 });
    assert!(queue.list_active_batches().is_empty());
}

#[tokio::test]
async fn out_of_order_completion_counts_up_and_ends_at_100() {
    let store = ScriptedStore::gated(&[0, 1, 2]);
    let (queue, notifier) = queue_with(store.clone(), MemoryResolver::default());
    let (_sub, log) = record(&queue);

    let id = queue
        .start_upload(
            &StaticIdentity::signed_in("user-1"),
            assets(&["a.jpg", "b.jpg", "c.jpg"]),
            Visibility::Public,
        )
        .unwrap()
        .unwrap();
    assert!(queue.is_uploading());

    // Second file first, then the first, then the third.
    for (done, index) in [1usize, 0, 2].into_iter().enumerate() {
        store.release(index);
        let log = Arc::clone(&log);
        eventually(move || {
            let reached = history(&log, id).iter().any(|s| s.completed_files == done + 1);
            async move { reached }
        })
        .await;
    }

    let report = queue.wait_for(id).await.unwrap();
    assert_eq!(report.outcome, BatchOutcome::Succeeded);
    assert_eq!(report.message(), "Successfully uploaded 3 image(s)");
    assert_eq!(report.succeeded.len(), 3);

    let seen = history(&log, id);
    seen.iter().for_each(assert_bounds);

    let mut completed: Vec<usize> = seen.iter().map(|s| s.completed_files).collect();
    completed.dedup();
    assert_eq!(completed, vec![0, 1, 2, 3]);

    let first_done = seen.iter().find(|s| s.completed_files == 1).unwrap();
    assert_eq!(first_done.files[1].status, TransferStatus::Succeeded);
    assert_eq!(first_done.files[0].status, TransferStatus::Uploading);

    let last = seen.last().unwrap();
    assert_eq!(last.progress, 100.0);
    assert_eq!(last.summary(), "3 of 3 photos • 100%");

    assert!(!queue.is_uploading());
    assert!(log.lock().last().unwrap().is_empty());
    assert_eq!(notifier.reports.lock().len(), 1);
}

#[tokio::test]
async fn unavailable_asset_fails_the_batch_but_it_still_settles() {
    let resolver = MemoryResolver {
        missing: HashSet::from(["b.jpg".to_string()]),
        ..Default::default()
    };
    let (queue, notifier) = queue_with(ScriptedStore::gated(&[]), resolver);

    let id = queue
        .start_upload(
            &StaticIdentity::signed_in("user-1"),
            assets(&["a.jpg", "b.jpg", "c.jpg"]),
            Visibility::Private,
        )
        .unwrap()
        .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), queue.wait_for(id))
        .await
        .expect("batch did not settle")
        .unwrap();

    assert_eq!(report.outcome, BatchOutcome::Failed);
    assert_eq!(
        report.message(),
        "There was an error uploading your photos. Please check your connection and try again."
    );
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].index, 1);
    assert!(matches!(report.failed[0].error, TransferError::AssetUnavailable { .. }));

    assert!(queue.list_active_batches().is_empty());
    assert_eq!(notifier.reports.lock().as_slice(), &[report]);
}

#[tokio::test]
async fn crashed_executor_still_lets_the_batch_settle() {
    let resolver = MemoryResolver {
        panics_on: Some("b.jpg".into()),
        ..Default::default()
    };
    let (queue, notifier) = queue_with(ScriptedStore::gated(&[]), resolver);

    let id = queue
        .start_upload(
            &StaticIdentity::signed_in("user-1"),
            assets(&["a.jpg", "b.jpg"]),
            Visibility::Public,
        )
        .unwrap()
        .unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), queue.wait_for(id))
        .await
        .expect("batch did not settle")
        .unwrap();

    assert_eq!(report.outcome, BatchOutcome::Failed);
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.failed[0].index, 1);
    assert!(matches!(report.failed[0].error, TransferError::TransferFailed { .. }));
    assert!(!queue.is_uploading());
    assert_eq!(notifier.reports.lock().len(), 1);
}

#[tokio::test]
async fn storage_outage_exhausts_retries_and_fails_every_file() {
    let store = ScriptedStore::broken();
    let (queue, _) = queue_with(store.clone(), MemoryResolver::default());

    let id = queue
        .start_upload(
            &StaticIdentity::signed_in("user-1"),
            assets(&["a.jpg", "b.jpg"]),
            Visibility::Public,
        )
        .unwrap()
        .unwrap();
    let report = queue.wait_for(id).await.unwrap();

    assert_eq!(report.outcome, BatchOutcome::Failed);
    assert_eq!(report.failed.len(), 2);
    assert!(report
        .failed
        .iter()
        .all(|f| matches!(f.error, TransferError::TransferFailed { .. })));
    // One attempt plus two resumes per file.
    assert_eq!(*store.chunk_calls.lock(), 6);
}

#[tokio::test]
async fn batches_created_together_never_share_keys() {
    let store = ScriptedStore::gated(&[0, 1, 2]);
    let (queue, _) = queue_with(store.clone(), MemoryResolver::default());
    let me = StaticIdentity::signed_in("user-1");

    let first = queue
        .start_upload(&me, assets(&["a", "b", "c"]), Visibility::Public)
        .unwrap()
        .unwrap();
    let second = queue
        .start_upload(&me, assets(&["d", "e", "f"]), Visibility::Public)
        .unwrap()
        .unwrap();
    assert_ne!(first, second);

    let batches = queue.list_active_batches();
    assert_eq!(batches.len(), 2);
    let keys: HashSet<String> = batches
        .iter()
        .flat_map(|b| b.files.iter().map(|f| f.key.to_string()))
        .collect();
    assert_eq!(keys.len(), 6);
    assert!(keys.contains(&format!("photos/user-1/{}-0.jpg", first.as_millis())));
    assert!(keys.contains(&format!("photos/user-1/{}-2.jpg", second.as_millis())));

    for index in 0..3 {
        for _ in 0..2 {
            store.release(index);
        }
    }
    assert_eq!(queue.shutdown().await.len(), 2);
}

#[tokio::test]
async fn late_subscriber_sees_the_settled_state_before_removal() {
    let store = ScriptedStore::gated(&[0, 1]);
    let (queue, _) = queue_with(store.clone(), MemoryResolver::default());

    let id = queue
        .start_upload(
            &StaticIdentity::signed_in("user-1"),
            assets(&["a.jpg", "b.jpg"]),
            Visibility::Public,
        )
        .unwrap()
        .unwrap();

    let (_sub, log) = record(&queue);
    store.release(0);
    store.release(1);
    queue.wait_for(id).await.unwrap();

    let seen = history(&log, id);
    assert!(!seen.is_empty());
    let last = seen.last().unwrap();
    assert_eq!(last.completed_files, last.total_files);
    assert_eq!(last.progress, 100.0);
    assert!(log.lock().last().unwrap().is_empty());
}

#[tokio::test]
async fn uploads_land_in_the_local_object_store() {
    let assets_dir = tempfile::tempdir().unwrap();
    let objects_dir = tempfile::tempdir().unwrap();
    std::fs::write(assets_dir.path().join("beach.jpg"), vec![7u8; 100]).unwrap();
    std::fs::write(assets_dir.path().join("dog.png"), vec![9u8; 33]).unwrap();

    let store = local_store(objects_dir.path()).await;

    let notifier = Arc::new(RecordingNotifier::default());
    let queue = UploadQueue::new(
        Arc::new(store.clone()),
        Arc::new(FsAssetResolver::with_root(assets_dir.path())),
        notifier,
        config(),
    );

    let id = queue
        .start_upload(
            &StaticIdentity::signed_in("user-9"),
            assets(&["beach.jpg", "file://dog.png"]),
            Visibility::Private,
        )
        .unwrap()
        .unwrap();
    let report = queue.wait_for(id).await.unwrap();
    assert_eq!(report.outcome, BatchOutcome::Succeeded);

    let key = format!("photos/user-9/{}-1.jpg", id.as_millis());
    assert_eq!(report.succeeded[1].url, format!("http://photos.test/objects/{key}"));

    let (object, metadata) = store.get_object_metadata(&key).await.unwrap();
    assert_eq!(object.size_bytes, 33);
    assert_eq!(object.content_type.as_deref(), Some("image/png"));
    let pairs: Vec<(String, String)> = metadata.into_iter().map(|m| (m.key, m.value)).collect();
    assert!(pairs.contains(&("uid".into(), "user-9".into())));
    assert!(pairs.contains(&("public".into(), "false".into())));
}

#[tokio::test]
async fn dotted_owner_ids_upload_like_any_other() {
    let assets_dir = tempfile::tempdir().unwrap();
    let objects_dir = tempfile::tempdir().unwrap();
    std::fs::write(assets_dir.path().join("pier.jpg"), vec![3u8; 20]).unwrap();
    let store = local_store(objects_dir.path()).await;

    let queue = UploadQueue::new(
        Arc::new(store.clone()),
        Arc::new(FsAssetResolver::with_root(assets_dir.path())),
        Arc::new(RecordingNotifier::default()),
        config(),
    );

    for owner in ["jane.doe", "jane..doe", "..."] {
        let id = queue
            .start_upload(
                &StaticIdentity::signed_in(owner),
                assets(&["pier.jpg"]),
                Visibility::Public,
            )
            .unwrap()
            .unwrap();
        let report = queue.wait_for(id).await.unwrap();
        assert_eq!(report.outcome, BatchOutcome::Succeeded, "{owner}: {:?}", report.failed);

        let key = format!("photos/{owner}/{}-0.jpg", id.as_millis());
        let (object, _) = store.get_object_metadata(&key).await.unwrap();
        assert_eq!(object.size_bytes, 20);
    }
}

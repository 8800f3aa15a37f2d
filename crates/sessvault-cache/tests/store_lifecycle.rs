//! End-to-end behavior of the file-backed store against an in-memory backing store.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use sessvault_cache::{
    BackingRow, BackingStore, Error, FileBackedStore, FlushOutcome, MemoryBackingStore, Result,
    SessionDocument, StoreConfig, StoredSession,
};

/// Shares one in-memory backing store between store instances, like two
/// process lifetimes pointed at the same database.
#[derive(Clone, Default)]
struct SharedBacking(Arc<MemoryBackingStore>);

#[async_trait]
impl BackingStore for SharedBacking {
    async fn ensure_table(&self) -> Result<()> {
        self.0.ensure_table().await
    }

    async fn select_all(&self) -> Result<Vec<StoredSession>> {
        self.0.select_all().await
    }

    async fn delete_many(&self, ids: &[String]) -> Result<()> {
        self.0.delete_many(ids).await
    }

    async fn upsert_many(&self, rows: &[BackingRow]) -> Result<()> {
        self.0.upsert_many(rows).await
    }
}

/// Shared backing store whose upserts can be switched to fail.
#[derive(Clone, Default)]
struct FlakyBacking {
    rows: SharedBacking,
    fail_upserts: Arc<AtomicBool>,
}

#[async_trait]
impl BackingStore for FlakyBacking {
    async fn ensure_table(&self) -> Result<()> {
        self.rows.ensure_table().await
    }

    async fn select_all(&self) -> Result<Vec<StoredSession>> {
        self.rows.select_all().await
    }

    async fn delete_many(&self, ids: &[String]) -> Result<()> {
        self.rows.delete_many(ids).await
    }

    async fn upsert_many(&self, rows: &[BackingRow]) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Error::backing("connection reset"));
        }
        self.rows.upsert_many(rows).await
    }
}

fn config(dir: &Path) -> StoreConfig {
    StoreConfig::new()
        .with_dir(dir.join("sessions"))
        .with_backup_interval(Duration::from_secs(3600))
        .with_retry_limit(3)
        .with_retry_wait(Duration::from_millis(20))
}

fn doc(value: Value) -> SessionDocument {
    SessionDocument::from_value(value).unwrap()
}

fn stored(backing: &SharedBacking, id: &str) -> Option<Value> {
    backing
        .0
        .row(id)
        .map(|row| serde_json::from_str(&row.data).unwrap())
}

#[tokio::test]
async fn disjoint_writers_do_not_clobber() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileBackedStore::open(config(dir.path()), MemoryBackingStore::new())
        .await
        .unwrap();
    store.set("x", &doc(json!({"views": 0}))).await.unwrap();

    let mut a = store.get("x").await.unwrap().unwrap();
    let mut b = store.get("x").await.unwrap().unwrap();

    b.insert("p", json!("from-b"));
    store.set("x", &b).await.unwrap();
    a.insert("q", json!("from-a"));
    store.set("x", &a).await.unwrap();

    let result = store.get("x").await.unwrap().unwrap();
    assert_eq!(
        Value::Object(result.into_fields()),
        json!({"views": 0, "p": "from-b", "q": "from-a"})
    );
}

#[tokio::test]
async fn later_writer_wins_on_shared_field() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileBackedStore::open(config(dir.path()), MemoryBackingStore::new())
        .await
        .unwrap();
    store.set("x", &doc(json!({"theme": "light"}))).await.unwrap();

    let mut a = store.get("x").await.unwrap().unwrap();
    let mut b = store.get("x").await.unwrap().unwrap();

    a.insert("theme", json!("dark"));
    store.set("x", &a).await.unwrap();
    b.insert("theme", json!("solarized"));
    store.set("x", &b).await.unwrap();

    let result = store.get("x").await.unwrap().unwrap();
    assert_eq!(result.get("theme"), Some(&json!("solarized")));
}

#[tokio::test]
async fn removed_field_is_removed_without_touching_others() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileBackedStore::open(config(dir.path()), MemoryBackingStore::new())
        .await
        .unwrap();
    store
        .set("x", &doc(json!({"flash": "saved", "user": "ada"})))
        .await
        .unwrap();

    let mut a = store.get("x").await.unwrap().unwrap();
    let mut b = store.get("x").await.unwrap().unwrap();
    b.insert("cart", json!([1]));
    store.set("x", &b).await.unwrap();
    a.remove("flash");
    store.set("x", &a).await.unwrap();

    let result = store.get("x").await.unwrap().unwrap();
    assert_eq!(
        Value::Object(result.into_fields()),
        json!({"user": "ada", "cart": [1]})
    );
}

#[tokio::test]
async fn ledger_survives_restart_before_flush() {
    let dir = tempfile::tempdir().unwrap();
    let backing = SharedBacking::default();

    {
        let store = FileBackedStore::open(config(dir.path()), backing.clone())
            .await
            .unwrap();
        store.set("s1", &doc(json!({"n": 1}))).await.unwrap();
        // Dropped without shutdown: nothing reached the backing store.
    }
    assert!(backing.0.is_empty());

    let store = FileBackedStore::open(config(dir.path()), backing.clone())
        .await
        .unwrap();
    assert_eq!(store.pending().await.dirty, vec!["s1".to_string()]);
    assert_eq!(
        store.get("s1").await.unwrap().unwrap().get("n"),
        Some(&json!(1))
    );

    store.flush().await.unwrap();
    assert_eq!(stored(&backing, "s1"), Some(json!({"n": 1})));
}

#[tokio::test]
async fn failed_flush_is_recovered_at_next_startup() {
    let dir = tempfile::tempdir().unwrap();
    let backing = FlakyBacking::default();
    backing.fail_upserts.store(true, Ordering::SeqCst);

    {
        let store = FileBackedStore::open(config(dir.path()), backing.clone())
            .await
            .unwrap();
        store.set("s1", &doc(json!({"user": "ada"}))).await.unwrap();
        assert!(store.flush().await.is_err());
        assert!(store.pending().await.is_empty());
        assert_eq!(store.stats().dropped_ids, 1);
    }
    assert!(backing.rows.0.is_empty());

    backing.fail_upserts.store(false, Ordering::SeqCst);
    let store = FileBackedStore::open(config(dir.path()), backing.clone())
        .await
        .unwrap();
    assert_eq!(
        store.get("s1").await.unwrap().unwrap().get("user"),
        Some(&json!("ada"))
    );
    assert_eq!(store.pending().await.dirty, vec!["s1".to_string()]);

    store.flush().await.unwrap();
    assert_eq!(stored(&backing.rows, "s1"), Some(json!({"user": "ada"})));
}

#[tokio::test]
async fn removed_then_recreated_is_present_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let backing = SharedBacking::default();
    let store = FileBackedStore::open(config(dir.path()), backing.clone())
        .await
        .unwrap();

    store.set("s1", &doc(json!({"gen": 1}))).await.unwrap();
    store.flush().await.unwrap();
    assert!(stored(&backing, "s1").is_some());

    store.destroy("s1").await.unwrap();
    store.set("s1", &doc(json!({"gen": 2}))).await.unwrap();
    store.flush().await.unwrap();

    assert_eq!(stored(&backing, "s1"), Some(json!({"gen": 2})));
}

#[tokio::test]
async fn destroyed_dirty_id_is_deleted_not_upserted() {
    let dir = tempfile::tempdir().unwrap();
    let backing = SharedBacking::default();
    let store = FileBackedStore::open(config(dir.path()), backing.clone())
        .await
        .unwrap();

    store.set("keep", &doc(json!({}))).await.unwrap();
    store.set("drop", &doc(json!({}))).await.unwrap();
    store.flush().await.unwrap();
    store.set("drop", &doc(json!({"late": true}))).await.unwrap();
    store.destroy("drop").await.unwrap();

    let outcome = store.flush().await.unwrap();
    match outcome {
        FlushOutcome::Flushed(report) => {
            assert_eq!(report.deleted, 1);
            assert_eq!(report.upserted, 0);
        }
        other => panic!("expected a flush, got {other:?}"),
    }
    assert!(stored(&backing, "drop").is_none());
    assert!(stored(&backing, "keep").is_some());
}

#[tokio::test]
async fn corrupted_document_is_destroyed_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileBackedStore::open(config(dir.path()), MemoryBackingStore::new())
        .await
        .unwrap();
    store.set("s1", &doc(json!({"n": 1}))).await.unwrap();
    std::fs::write(store.dir().join("s1.json"), b"{\"n\": 1, \"tr").unwrap();

    let started = Instant::now();
    let err = store.get("s1").await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert!(matches!(err, Error::Corrupted { attempts: 4, .. }));

    assert!(!store.dir().join("s1.json").exists());
    let pending = store.pending().await;
    assert!(!pending.dirty.contains(&"s1".to_string()));
    assert_eq!(pending.removed, vec!["s1".to_string()]);
    assert_eq!(store.get("s1").await.unwrap(), None);
}

#[tokio::test]
async fn clear_empties_cache_and_flush_deletes_known_ids() {
    let dir = tempfile::tempdir().unwrap();
    let backing = SharedBacking::default();
    let store = FileBackedStore::open(config(dir.path()), backing.clone())
        .await
        .unwrap();

    for id in ["a", "b", "c"] {
        store.set(id, &doc(json!({"id": id}))).await.unwrap();
    }
    store.flush().await.unwrap();
    assert_eq!(backing.0.len(), 3);

    store.clear().await.unwrap();
    assert!(store.all().await.unwrap().is_empty());
    assert_eq!(store.length().await.unwrap(), 0);

    store.flush().await.unwrap();
    assert!(backing.0.is_empty());
}

#[tokio::test]
async fn restart_loads_what_was_flushed() {
    let dir = tempfile::tempdir().unwrap();
    let backing = SharedBacking::default();
    {
        let store = FileBackedStore::open(config(dir.path()), backing.clone())
            .await
            .unwrap();
        store
            .set(
                "s1",
                &doc(json!({"user": "ada", "cookie": {"expires": "2030-01-01T00:00:00.000Z"}})),
            )
            .await
            .unwrap();
        store.shutdown().await.unwrap();
    }
    assert_eq!(backing.0.row("s1").unwrap().expires, 1_893_456_000);

    // A fresh cache directory sees only what the backing store holds.
    let other = tempfile::tempdir().unwrap();
    let store = FileBackedStore::open(config(other.path()), backing.clone())
        .await
        .unwrap();
    let all = store.all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all["s1"].get("user"), Some(&json!("ada")));
}

#[tokio::test]
async fn timer_flushes_without_manual_calls() {
    let dir = tempfile::tempdir().unwrap();
    let backing = SharedBacking::default();
    let store = FileBackedStore::open(
        config(dir.path()).with_backup_interval(Duration::from_millis(25)),
        backing.clone(),
    )
    .await
    .unwrap();

    store.set("s1", &doc(json!({"n": 1}))).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while stored(&backing, "s1").is_none() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored(&backing, "s1"), Some(json!({"n": 1})));
    assert!(store.stats().cycles >= 1);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_flushes_pending_changes() {
    let dir = tempfile::tempdir().unwrap();
    let backing = SharedBacking::default();
    let store = FileBackedStore::open(config(dir.path()), backing.clone())
        .await
        .unwrap();
    store.set("s1", &doc(json!({"n": 1}))).await.unwrap();

    let outcome = store.shutdown().await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Flushed(_)));
    assert!(stored(&backing, "s1").is_some());
    assert!(store.pending().await.is_empty());
}

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use futures::StreamExt;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{split_entry_path, BroadcastStore, Snapshot, StoreError, StoreResult};

/// Pub/sub channel carrying the name of every collection that changed.
const CHANGES_CHANNEL: &str = "duochat:changes";

/// How long a client's on-disconnect entries outlive its last heartbeat.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// Consecutive failed resubscriptions before subscribers are closed.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Removes the entries of a collection whose lease expired, bumping the
/// version and announcing the change when anything was removed.
///
/// KEYS: hash, leased set, version. ARGV: lease key prefix, changes channel,
/// collection name.
const SWEEP_SCRIPT: &str = r#"
local removed = 0
for _, key in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  if redis.call('EXISTS', ARGV[1] .. key) == 0 then
    removed = removed + redis.call('HDEL', KEYS[1], key)
    redis.call('SREM', KEYS[2], key)
  end
end
if removed > 0 then
  redis.call('INCR', KEYS[3])
  redis.call('PUBLISH', ARGV[2], ARGV[3])
end
return removed
"#;

fn hash_key(collection: &str) -> String {
    format!("duochat:{}", collection)
}

fn seq_key(collection: &str) -> String {
    format!("duochat:{}:seq", collection)
}

fn version_key(collection: &str) -> String {
    format!("duochat:{}:version", collection)
}

fn leased_key(collection: &str) -> String {
    format!("duochat:{}:leased", collection)
}

fn lease_prefix(collection: &str) -> String {
    format!("duochat:{}:lease:", collection)
}

fn lease_key(collection: &str, key: &str) -> String {
    format!("{}{}", lease_prefix(collection), key)
}

fn reconnect_delay(attempt: u32) -> Duration {
    let millis = 250u64.saturating_mul(1 << attempt.min(5));
    Duration::from_millis(millis.min(5_000))
}

/// Add the version bump and change notification to a mutation.
fn mark_changed<'a>(pipe: &'a mut redis::Pipeline, collection: &str) -> &'a mut redis::Pipeline {
    pipe.incr(version_key(collection), 1)
        .ignore()
        .publish(CHANGES_CHANNEL, collection)
        .ignore()
}

struct Watcher {
    tx: watch::Sender<Snapshot>,
    version: Option<u64>,
}

/// Watched collections and the version of the snapshot each last published.
#[derive(Default)]
struct Watchers {
    entries: DashMap<String, Watcher>,
    closed: AtomicBool,
}

impl Watchers {
    fn register(&self, collection: &str) -> StoreResult<watch::Receiver<Snapshot>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Disconnected);
        }
        let watcher = self
            .entries
            .entry(collection.to_string())
            .or_insert_with(|| Watcher {
                tx: watch::channel(Snapshot::new()).0,
                version: None,
            });
        Ok(watcher.tx.subscribe())
    }

    fn is_watched(&self, collection: &str) -> bool {
        self.entries.contains_key(collection)
    }

    fn collections(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Publish `snapshot` unless one at least as new was already published.
    fn apply(&self, collection: &str, version: u64, snapshot: Snapshot) -> bool {
        let Some(mut watcher) = self.entries.get_mut(collection) else {
            return false;
        };
        if watcher.version.is_some_and(|current| version <= current) {
            return false;
        }
        watcher.version = Some(version);
        watcher.tx.send_replace(snapshot);
        true
    }

    /// Drop every sender so subscribers see the subscription end.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.entries.clear();
    }
}

/// Redis-backed broadcast store.
///
/// Each collection is a hash; appends draw ids from a per-collection counter
/// so that ids sort in publish order. Every mutation bumps a per-collection
/// version and publishes the collection name on [`CHANGES_CHANNEL`] in the
/// same transaction. A listener task refreshes the snapshot of every watched
/// collection and only ever moves a subscriber forward in version.
///
/// Entries registered with [`BroadcastStore::on_disconnect_remove`] hold a
/// lease that a heartbeat keeps alive. When a client vanishes without
/// disconnecting, its leases lapse and any other client watching the
/// collection sweeps the entries.
pub struct RedisStore {
    pool: Pool,
    watchers: Arc<Watchers>,
    leases: Arc<Mutex<Vec<String>>>,
    lease_ttl: Duration,
    listener: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        Self::connect_with_lease_ttl(redis_url, DEFAULT_LEASE_TTL).await
    }

    pub async fn connect_with_lease_ttl(redis_url: &str, lease_ttl: Duration) -> StoreResult<Self> {
        let pool = RedisConfig::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Redis(format!("Failed to create Redis pool: {}", e)))?;

        let client = redis::Client::open(redis_url)?;
        let pubsub = subscribe_changes(&client).await?;

        let watchers = Arc::new(Watchers::default());
        let leases = Arc::new(Mutex::new(Vec::new()));
        let listener = tokio::spawn(listen_for_changes(
            client,
            Some(pubsub),
            pool.clone(),
            watchers.clone(),
        ));
        let heartbeat = tokio::spawn(keep_leases(
            pool.clone(),
            leases.clone(),
            watchers.clone(),
            lease_ttl,
        ));

        tracing::info!(lease_ttl_ms = lease_ttl.as_millis() as u64, "Redis broadcast store connected");

        Ok(Self {
            pool,
            watchers,
            leases,
            lease_ttl,
            listener,
            heartbeat,
        })
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.listener.abort();
    }
}

async fn subscribe_changes(client: &redis::Client) -> redis::RedisResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(CHANGES_CHANNEL).await?;
    Ok(pubsub)
}

async fn fetch_snapshot(pool: &Pool, collection: &str) -> StoreResult<(Snapshot, u64)> {
    let mut conn = pool.get().await?;
    let (data, version): (Vec<(String, String)>, Option<u64>) = redis::pipe()
        .atomic()
        .hgetall(hash_key(collection))
        .get(version_key(collection))
        .query_async(&mut *conn)
        .await?;

    let mut snapshot = Snapshot::new();
    for (key, json) in data {
        match serde_json::from_str(&json) {
            Ok(value) => {
                snapshot.insert(key, value);
            }
            Err(e) => {
                tracing::warn!(collection = %collection, key = %key, error = %e, "Skipping malformed entry");
            }
        }
    }
    Ok((snapshot, version.unwrap_or(0)))
}

async fn refresh(pool: &Pool, watchers: &Watchers, collection: &str) {
    match fetch_snapshot(pool, collection).await {
        Ok((snapshot, version)) => {
            watchers.apply(collection, version, snapshot);
        }
        Err(e) => {
            tracing::warn!(collection = %collection, error = %e, "Failed to refresh snapshot");
        }
    }
}

async fn listen_for_changes(
    client: redis::Client,
    mut pubsub: Option<redis::aio::PubSub>,
    pool: Pool,
    watchers: Arc<Watchers>,
) {
    let mut failures = 0u32;

    loop {
        let mut current = match pubsub.take() {
            Some(current) => current,
            None => match subscribe_changes(&client).await {
                Ok(current) => {
                    failures = 0;
                    tracing::info!("Resubscribed to Redis changes");
                    // Anything published while unsubscribed was missed
                    for collection in watchers.collections() {
                        refresh(&pool, &watchers, &collection).await;
                    }
                    current
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_RECONNECT_ATTEMPTS {
                        tracing::error!(error = %e, attempts = failures, "Giving up on Redis changes, closing subscriptions");
                        watchers.close();
                        return;
                    }
                    let delay = reconnect_delay(failures);
                    tracing::warn!(
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to resubscribe to Redis changes"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            },
        };

        let mut messages = current.on_message();
        while let Some(msg) = messages.next().await {
            let collection: String = match msg.get_payload() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid change notification");
                    continue;
                }
            };

            if watchers.is_watched(&collection) {
                refresh(&pool, &watchers, &collection).await;
            }
        }

        tracing::warn!("Redis change stream ended, reconnecting");
    }
}

/// (Re)arm the leases of `paths` for another `ttl`.
async fn renew_leases(pool: &Pool, paths: &[String], ttl: Duration) -> StoreResult<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let ttl_ms = ttl.as_millis() as u64;
    let mut pipe = redis::pipe();
    for path in paths {
        let (collection, key) = split_entry_path(path)?;
        pipe.pset_ex(lease_key(collection, key), 1, ttl_ms)
            .ignore()
            .sadd(leased_key(collection), key)
            .ignore();
    }
    let mut conn = pool.get().await?;
    pipe.query_async::<()>(&mut *conn).await?;
    Ok(())
}

async fn sweep_expired(pool: &Pool, collection: &str) -> StoreResult<u64> {
    let mut conn = pool.get().await?;
    let removed = redis::cmd("EVAL")
        .arg(SWEEP_SCRIPT)
        .arg(3)
        .arg(hash_key(collection))
        .arg(leased_key(collection))
        .arg(version_key(collection))
        .arg(lease_prefix(collection))
        .arg(CHANGES_CHANNEL)
        .arg(collection)
        .query_async::<u64>(&mut *conn)
        .await?;
    Ok(removed)
}

async fn keep_leases(
    pool: Pool,
    leases: Arc<Mutex<Vec<String>>>,
    watchers: Arc<Watchers>,
    ttl: Duration,
) {
    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let owned = leases.lock().await.clone();
        if let Err(e) = renew_leases(&pool, &owned, ttl).await {
            tracing::warn!(error = %e, "Failed to renew leases");
        }

        let mut collections: BTreeSet<String> = watchers.collections().into_iter().collect();
        collections.extend(
            owned
                .iter()
                .filter_map(|path| split_entry_path(path).ok())
                .map(|(collection, _)| collection.to_string()),
        );
        for collection in collections {
            match sweep_expired(&pool, &collection).await {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::info!(collection = %collection, removed, "Removed entries of vanished clients");
                }
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Failed to sweep expired leases");
                }
            }
        }
    }
}

#[async_trait]
impl BroadcastStore for RedisStore {
    async fn write(&self, path: &str, value: Value) -> StoreResult<()> {
        let (collection, key) = split_entry_path(path)?;
        let json = serde_json::to_string(&value)?;

        let mut pipe = redis::pipe();
        pipe.atomic().hset(hash_key(collection), key, &json).ignore();
        mark_changed(&mut pipe, collection);
        let mut conn = self.pool.get().await?;
        pipe.query_async::<()>(&mut *conn).await?;

        tracing::trace!(path = %path, "Entry written");
        Ok(())
    }

    async fn append(&self, path: &str, value: Value) -> StoreResult<String> {
        let collection = path.trim_matches('/');
        let json = serde_json::to_string(&value)?;

        let mut conn = self.pool.get().await?;
        let seq: u64 = conn.incr(seq_key(collection), 1).await?;
        let id = format!("{:020}", seq);

        let mut pipe = redis::pipe();
        pipe.atomic().hset(hash_key(collection), &id, &json).ignore();
        mark_changed(&mut pipe, collection);
        pipe.query_async::<()>(&mut *conn).await?;

        tracing::trace!(collection = %collection, id = %id, "Entry appended");
        Ok(id)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let (collection, key) = split_entry_path(path)?;
        let mut conn = self.pool.get().await?;
        let removed: u64 = conn.hdel(hash_key(collection), key).await?;
        if removed > 0 {
            let mut pipe = redis::pipe();
            pipe.atomic();
            mark_changed(&mut pipe, collection);
            pipe.query_async::<()>(&mut *conn).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> StoreResult<watch::Receiver<Snapshot>> {
        let collection = path.trim_matches('/').to_string();

        // Register first so a change landing during the fetch is not lost
        let mut rx = self.watchers.register(&collection)?;
        let (initial, version) = fetch_snapshot(&self.pool, &collection).await?;
        self.watchers.apply(&collection, version, initial);
        let _ = rx.borrow_and_update();

        tracing::debug!(collection = %collection, version, "Subscribed to collection");
        Ok(rx)
    }

    async fn on_disconnect_remove(&self, path: &str) -> StoreResult<()> {
        split_entry_path(path)?;
        renew_leases(&self.pool, &[path.to_string()], self.lease_ttl).await?;
        self.leases.lock().await.push(path.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> StoreResult<()> {
        self.heartbeat.abort();

        let paths = std::mem::take(&mut *self.leases.lock().await);
        for path in paths {
            if let Err(e) = self.delete(&path).await {
                tracing::warn!(path = %path, error = %e, "Failed to remove entry on disconnect");
                continue;
            }
            let (collection, key) = split_entry_path(&path)?;
            let mut conn = self.pool.get().await?;
            redis::pipe()
                .del(lease_key(collection, key))
                .ignore()
                .srem(leased_key(collection), key)
                .ignore()
                .query_async::<()>(&mut *conn)
                .await?;
        }
        self.listener.abort();
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;

        let pong: String = redis::cmd("PING").query_async(&mut *conn).await?;

        Ok(pong == "PONG")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entry_path;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use uuid::Uuid;

    fn snapshot(pairs: &[(&str, Value)]) -> Snapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn keys_are_namespaced_per_collection() {
        assert_eq!(hash_key("presence/r1"), "duochat:presence/r1");
        assert_eq!(version_key("presence/r1"), "duochat:presence/r1:version");
        assert_eq!(leased_key("presence/r1"), "duochat:presence/r1:leased");
        assert_eq!(lease_key("presence/r1", "u1"), "duochat:presence/r1:lease:u1");
    }

    #[test]
    fn reconnect_delay_backs_off_to_a_ceiling() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(reconnect_delay(2), Duration::from_secs(1));
        assert_eq!(reconnect_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn older_snapshots_never_replace_newer_ones() {
        let watchers = Watchers::default();
        let rx = watchers.register("c").unwrap();

        assert!(watchers.apply("c", 3, snapshot(&[("a", json!(1))])));
        // A fetch that started before the last change finishes late
        assert!(!watchers.apply("c", 2, Snapshot::new()));
        assert!(!watchers.apply("c", 3, Snapshot::new()));
        assert_eq!(*rx.borrow(), snapshot(&[("a", json!(1))]));

        assert!(watchers.apply("c", 4, Snapshot::new()));
        assert!(rx.borrow().is_empty());
        assert!(!watchers.apply("unwatched", 1, Snapshot::new()));
    }

    #[tokio::test]
    async fn closing_ends_every_subscription() {
        let watchers = Watchers::default();
        let mut rx = watchers.register("c").unwrap();

        watchers.close();
        assert!(rx.changed().await.is_err());
        assert!(matches!(
            watchers.register("c"),
            Err(StoreError::Disconnected)
        ));
    }

    fn redis_test_url() -> Option<String> {
        std::env::var("REDIS_TEST_URL").ok()
    }

    #[tokio::test]
    async fn entries_of_a_vanished_client_are_swept() {
        let Some(url) = redis_test_url() else {
            return;
        };
        let collection = format!("test/{}", Uuid::new_v4());
        let entry = entry_path(&collection, "u1");
        let ttl = Duration::from_millis(300);

        let vanishing = RedisStore::connect_with_lease_ttl(&url, ttl).await.unwrap();
        vanishing.write(&entry, json!({"online": true})).await.unwrap();
        vanishing.on_disconnect_remove(&entry).await.unwrap();

        let observer = RedisStore::connect_with_lease_ttl(&url, ttl).await.unwrap();
        let mut rx = observer.subscribe(&collection).await.unwrap();
        assert!(rx.borrow().contains_key("u1"));

        // No disconnect: the heartbeat just stops
        drop(vanishing);
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(Snapshot::is_empty))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn changes_from_another_client_reach_subscribers() {
        let Some(url) = redis_test_url() else {
            return;
        };
        let collection = format!("test/{}", Uuid::new_v4());

        let writer = RedisStore::connect(&url).await.unwrap();
        let reader = RedisStore::connect(&url).await.unwrap();
        let mut rx = reader.subscribe(&collection).await.unwrap();
        assert!(rx.borrow().is_empty());

        let id = writer.append(&collection, json!({"n": 1})).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.contains_key(&id)))
            .await
            .unwrap()
            .unwrap();

        writer.delete(&entry_path(&collection, &id)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(Snapshot::is_empty))
            .await
            .unwrap()
            .unwrap();
    }
}

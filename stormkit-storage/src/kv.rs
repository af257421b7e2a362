//! Shared KV client.
//!
//! Strings, sorted sets, lists, pub/sub and TTL-bounded distributed locks
//! over Redis (`fred`), plus an in-memory backend with the same semantics
//! for hermetic tests. Certificate storage, the analytics batcher, cache
//! invalidation and the image variant counters all sit on top of this.

use fred::clients::{Client, SubscriberClient};
use fred::interfaces::*;
use fred::types::config::Config as RedisConfig;
use fred::types::scan::Scanner;
use fred::types::{Builder, Expiration, SetOptions};
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Connection attempts made before giving up, with quadratic backoff
/// (1, 4, 9, 16, 25 seconds).
const CONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv connection error: {0}")]
    Connection(String),

    #[error("kv backend error: {0}")]
    Backend(String),

    #[error("lock not obtained")]
    NotObtained,
}

/// Substring match against the closed set of transport failures that
/// warrant a reconnect instead of a hard error.
pub fn is_connection_error(message: &str) -> bool {
    const NEEDLES: [&str; 5] = [
        "connection refused",
        "network is unreachable",
        "no route to host",
        "i/o timeout",
        "EOF",
    ];

    NEEDLES.iter().any(|needle| message.contains(needle))
        || message.contains("connection closed")
}

fn map_err(err: fred::error::Error) -> KvError {
    let text = err.to_string();
    if is_connection_error(&text) {
        KvError::Connection(text)
    } else {
        KvError::Backend(text)
    }
}

/// KV client over Redis or an in-memory store.
///
/// The variant is chosen at construction time; callers never branch on it.
#[derive(Clone)]
pub enum Kv {
    Redis(RedisKv),
    Memory(MemoryKv),
}

impl Kv {
    /// Connect to Redis, retrying with quadratic backoff on connection
    /// errors (five attempts total).
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let config = RedisConfig::from_url(url)
            .map_err(|e| KvError::Backend(format!("invalid redis url: {e}")))?;

        let mut last_err = None;

        for attempt in 1..=CONNECT_ATTEMPTS {
            match Self::try_connect(config.clone()).await {
                Ok(kv) => return Ok(kv),
                Err(e) => {
                    let backoff = Duration::from_secs(u64::from(attempt * attempt));
                    tracing::error!(
                        attempt,
                        error = %e,
                        "redis connection attempt failed, retrying in {:?}",
                        backoff
                    );
                    last_err = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| KvError::Connection("unreachable".to_string())))
    }

    async fn try_connect(config: RedisConfig) -> Result<Self, KvError> {
        let client = Client::new(config.clone(), None, None, None);
        client.init().await.map_err(map_err)?;
        client.ping::<()>(None).await.map_err(map_err)?;

        Ok(Kv::Redis(RedisKv { client, config }))
    }

    /// In-memory backend with the same semantics. Used by tests and by
    /// single-node setups without Redis.
    pub fn in_memory() -> Self {
        Kv::Memory(MemoryKv::default())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match self {
            Kv::Redis(r) => r.client.get(key).await.map_err(map_err),
            Kv::Memory(m) => Ok(m.get(key)),
        }
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        match self {
            Kv::Redis(r) => r
                .client
                .set::<(), _, _>(
                    key,
                    value,
                    ttl.map(|d| Expiration::PX(d.as_millis() as i64)),
                    None,
                    false,
                )
                .await
                .map_err(map_err),
            Kv::Memory(m) => {
                m.set(key, value, ttl);
                Ok(())
            }
        }
    }

    /// `SET key value NX PX ttl`; returns false when the key already exists.
    pub async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        match self {
            Kv::Redis(r) => {
                let reply: Option<String> = r
                    .client
                    .set(
                        key,
                        value,
                        Some(Expiration::PX(ttl.as_millis() as i64)),
                        Some(SetOptions::NX),
                        false,
                    )
                    .await
                    .map_err(map_err)?;
                Ok(reply.is_some())
            }
            Kv::Memory(m) => Ok(m.set_nx(key, value, ttl)),
        }
    }

    pub async fn del(&self, key: &str) -> Result<(), KvError> {
        match self {
            Kv::Redis(r) => r.client.del::<i64, _>(key).await.map(|_| ()).map_err(map_err),
            Kv::Memory(m) => {
                m.del(key);
                Ok(())
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, KvError> {
        match self {
            Kv::Redis(r) => {
                let count: i64 = r.client.exists(key).await.map_err(map_err)?;
                Ok(count > 0)
            }
            Kv::Memory(m) => Ok(m.exists(key)),
        }
    }

    /// Insert into a sorted set; returns true when the member was new.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, KvError> {
        match self {
            Kv::Redis(r) => {
                let added: i64 = r
                    .client
                    .zadd(key, None, None, false, false, (score, member))
                    .await
                    .map_err(map_err)?;
                Ok(added > 0)
            }
            Kv::Memory(m) => Ok(m.zadd(key, member, score)),
        }
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
        match self {
            Kv::Redis(r) => r
                .client
                .zrem::<i64, _, _>(key, member)
                .await
                .map(|_| ())
                .map_err(map_err),
            Kv::Memory(m) => {
                m.zrem(key, member);
                Ok(())
            }
        }
    }

    /// All members of a sorted set, ordered by score.
    pub async fn zrange(&self, key: &str) -> Result<Vec<String>, KvError> {
        match self {
            Kv::Redis(r) => r
                .client
                .zrange(
                    key,
                    fred::types::sorted_sets::ZRange::from(0),
                    fred::types::sorted_sets::ZRange::from(-1),
                    None,
                    false,
                    None,
                    false,
                )
                .await
                .map_err(map_err),
            Kv::Memory(m) => Ok(m.zrange(key)),
        }
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        match self {
            Kv::Redis(r) => r
                .client
                .lpush::<i64, _, _>(key, value)
                .await
                .map(|_| ())
                .map_err(map_err),
            Kv::Memory(m) => {
                m.lpush(key, value);
                Ok(())
            }
        }
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<String>, KvError> {
        match self {
            Kv::Redis(r) => r.client.rpop(key, None).await.map_err(map_err),
            Kv::Memory(m) => Ok(m.rpop(key)),
        }
    }

    /// All keys starting with `prefix`. Used by the certificate storage
    /// repair walk; the memory backend matches by prefix, Redis scans with
    /// `<prefix>*`.
    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        match self {
            Kv::Redis(r) => {
                let mut keys = Vec::new();
                let mut stream = r.client.scan(format!("{prefix}*"), Some(500), None);

                while let Some(page) = stream.next().await {
                    let mut page = page.map_err(map_err)?;
                    if let Some(page_keys) = page.take_results() {
                        keys.extend(
                            page_keys
                                .into_iter()
                                .filter_map(|k| k.into_string()),
                        );
                    }
                    let _ = page.next();
                }

                Ok(keys)
            }
            Kv::Memory(m) => Ok(m.scan_prefix(prefix)),
        }
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        match self {
            Kv::Redis(r) => r
                .client
                .publish::<i64, _, _>(channel, payload)
                .await
                .map(|_| ())
                .map_err(map_err),
            Kv::Memory(m) => {
                m.publish(channel, payload);
                Ok(())
            }
        }
    }

    /// Subscribe to a channel. The receiver yields message payloads until
    /// the subscription task dies with the connection.
    pub async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, KvError> {
        match self {
            Kv::Redis(r) => {
                let subscriber: SubscriberClient = Builder::from_config(r.config.clone())
                    .build_subscriber_client()
                    .map_err(map_err)?;
                subscriber.init().await.map_err(map_err)?;
                subscriber
                    .subscribe(channel.to_string())
                    .await
                    .map_err(map_err)?;

                let mut message_rx = subscriber.message_rx();
                let wanted = channel.to_string();
                let (tx, rx) = mpsc::channel(64);

                tokio::spawn(async move {
                    // The subscriber client must stay alive for the stream.
                    let _subscriber = subscriber;
                    while let Ok(message) = message_rx.recv().await {
                        if message.channel.to_string() != wanted {
                            continue;
                        }
                        if let Ok(text) = message.value.convert::<String>() {
                            if tx.send(text).await.is_err() {
                                break;
                            }
                        }
                    }
                });

                Ok(rx)
            }
            Kv::Memory(m) => Ok(m.subscribe(channel)),
        }
    }

    /// Obtain an exclusive TTL-bounded lock. A single attempt; callers poll
    /// on [`KvError::NotObtained`].
    pub async fn obtain_lock(&self, key: &str, ttl: Duration) -> Result<KvLock, KvError> {
        let token: String = {
            let mut rng = rand::thread_rng();
            (0..16)
                .map(|_| format!("{:02x}", rng.r#gen::<u8>()))
                .collect()
        };

        if self.set_nx(key, &token, ttl).await? {
            Ok(KvLock {
                kv: self.clone(),
                key: key.to_string(),
                token,
            })
        } else {
            Err(KvError::NotObtained)
        }
    }
}

/// Handle for a held distributed lock. Refresh extends the TTL while the
/// holder is alive; release deletes the key only when the stored token
/// still matches.
#[derive(Clone)]
pub struct KvLock {
    kv: Kv,
    key: String,
    token: String,
}

impl KvLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn refresh(&self, ttl: Duration) -> Result<(), KvError> {
        match self.kv.get(&self.key).await? {
            Some(ref held) if *held == self.token => {
                self.kv.set(&self.key, &self.token, Some(ttl)).await
            }
            _ => Err(KvError::NotObtained),
        }
    }

    pub async fn release(&self) -> Result<(), KvError> {
        if let Some(held) = self.kv.get(&self.key).await? {
            if held == self.token {
                self.kv.del(&self.key).await?;
            }
        }
        Ok(())
    }
}

/// Redis-backed KV.
#[derive(Clone)]
pub struct RedisKv {
    client: Client,
    config: RedisConfig,
}

#[derive(Default)]
struct MemoryStore {
    strings: HashMap<String, (String, Option<Instant>)>,
    zsets: HashMap<String, Vec<(String, f64)>>,
    lists: HashMap<String, VecDeque<String>>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    fn live_string(&mut self, key: &str) -> Option<&String> {
        if let Some((_, Some(expires))) = self.strings.get(key) {
            if *expires <= Instant::now() {
                self.strings.remove(key);
                return None;
            }
        }
        self.strings.get(key).map(|(v, _)| v)
    }
}

/// In-memory KV with Redis semantics, shared across clones.
#[derive(Clone, Default)]
pub struct MemoryKv {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryKv {
    fn get(&self, key: &str) -> Option<String> {
        self.store.lock().live_string(key).cloned()
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires = ttl.map(|d| Instant::now() + d);
        self.store
            .lock()
            .strings
            .insert(key.to_string(), (value.to_string(), expires));
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut store = self.store.lock();
        if store.live_string(key).is_some() {
            return false;
        }
        store.strings.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        true
    }

    fn del(&self, key: &str) {
        let mut store = self.store.lock();
        store.strings.remove(key);
        store.zsets.remove(key);
        store.lists.remove(key);
    }

    fn exists(&self, key: &str) -> bool {
        let mut store = self.store.lock();
        store.live_string(key).is_some()
            || store.zsets.contains_key(key)
            || store.lists.contains_key(key)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> bool {
        let mut store = self.store.lock();
        let set = store.zsets.entry(key.to_string()).or_default();

        if let Some(entry) = set.iter_mut().find(|(m, _)| m == member) {
            entry.1 = score;
            false
        } else {
            set.push((member.to_string(), score));
            true
        }
    }

    fn zrem(&self, key: &str, member: &str) {
        let mut store = self.store.lock();
        let now_empty = match store.zsets.get_mut(key) {
            Some(set) => {
                set.retain(|(m, _)| m != member);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            store.zsets.remove(key);
        }
    }

    fn zrange(&self, key: &str) -> Vec<String> {
        let store = self.store.lock();
        let Some(set) = store.zsets.get(key) else {
            return Vec::new();
        };

        let mut members = set.clone();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        members.into_iter().map(|(m, _)| m).collect()
    }

    fn lpush(&self, key: &str, value: &str) {
        self.store
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
    }

    fn rpop(&self, key: &str) -> Option<String> {
        let mut store = self.store.lock();
        let (value, now_empty) = {
            let list = store.lists.get_mut(key)?;
            (list.pop_back(), list.is_empty())
        };
        if now_empty {
            store.lists.remove(key);
        }
        value
    }

    fn scan_prefix(&self, prefix: &str) -> Vec<String> {
        let mut store = self.store.lock();
        let keys: Vec<String> = store
            .strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        // Drop expired entries from the result.
        keys.into_iter()
            .filter(|k| store.live_string(k).is_some())
            .collect()
    }

    fn publish(&self, channel: &str, payload: &str) {
        let store = self.store.lock();
        if let Some(tx) = store.channels.get(channel) {
            let _ = tx.send(payload.to_string());
        }
    }

    fn subscribe(&self, channel: &str) -> mpsc::Receiver<String> {
        let mut broadcast_rx = {
            let mut store = self.store.lock();
            store
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(payload) = broadcast_rx.recv().await {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_connection_error() {
        assert!(is_connection_error("dial tcp: connection refused"));
        assert!(is_connection_error("read: i/o timeout"));
        assert!(is_connection_error("unexpected EOF"));
        assert!(is_connection_error("network is unreachable"));
        assert!(!is_connection_error("WRONGTYPE Operation against a key"));
    }

    #[tokio::test]
    async fn test_memory_get_set_del() {
        let kv = Kv::in_memory();
        assert_eq!(kv.get("a").await.unwrap(), None);

        kv.set("a", "1", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));

        kv.del("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_ttl_expiry() {
        let kv = Kv::in_memory();
        kv.set("a", "1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_zset_ordering_and_membership() {
        let kv = Kv::in_memory();
        assert!(kv.zadd("dir", "b", 2.0).await.unwrap());
        assert!(kv.zadd("dir", "a", 1.0).await.unwrap());
        // Re-adding an existing member updates the score, returns false.
        assert!(!kv.zadd("dir", "b", 3.0).await.unwrap());

        assert_eq!(kv.zrange("dir").await.unwrap(), vec!["a", "b"]);

        kv.zrem("dir", "a").await.unwrap();
        kv.zrem("dir", "b").await.unwrap();
        assert!(kv.zrange("dir").await.unwrap().is_empty());
        assert!(!kv.exists("dir").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_list_is_fifo_across_lpush_rpop() {
        let kv = Kv::in_memory();
        kv.lpush("q", "first").await.unwrap();
        kv.lpush("q", "second").await.unwrap();

        assert_eq!(kv.rpop("q").await.unwrap(), Some("first".to_string()));
        assert_eq!(kv.rpop("q").await.unwrap(), Some("second".to_string()));
        assert_eq!(kv.rpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_exclusivity_and_release() {
        let kv = Kv::in_memory();
        let lock = kv
            .obtain_lock("locks/example.org", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(matches!(
            kv.obtain_lock("locks/example.org", Duration::from_secs(5)).await,
            Err(KvError::NotObtained)
        ));

        lock.release().await.unwrap();
        // No residue: the key is gone and the lock is obtainable again.
        assert_eq!(kv.get("locks/example.org").await.unwrap(), None);
        let second = kv
            .obtain_lock("locks/example.org", Duration::from_secs(5))
            .await
            .unwrap();
        // Releasing twice is a no-op.
        second.release().await.unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_release_does_not_steal_other_holder() {
        let kv = Kv::in_memory();
        let lock = kv
            .obtain_lock("locks/h", Duration::from_millis(10))
            .await
            .unwrap();

        // Let the first lock expire, then let another holder take it.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = kv
            .obtain_lock("locks/h", Duration::from_secs(5))
            .await
            .unwrap();

        // The stale handle must not delete the new holder's key.
        lock.release().await.unwrap();
        assert!(kv.get("locks/h").await.unwrap().is_some());
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_pubsub_delivery() {
        let kv = Kv::in_memory();
        let mut rx = kv.subscribe("invalidate-admin-cache").await.unwrap();

        kv.publish("invalidate-admin-cache", "1").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let kv = Kv::in_memory();
        kv.set("le_/acme/a", "1", None).await.unwrap();
        kv.set("le_/acme/b", "2", None).await.unwrap();
        kv.set("other", "3", None).await.unwrap();

        let mut keys = kv.scan_prefix("le_").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["le_/acme/a", "le_/acme/b"]);
    }
}

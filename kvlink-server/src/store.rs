//! # In-Memory Store
//!
//! Provide the keyspace behind the reference server: typed values, TTL-aware
//! lookups, and a purge pass for active expiration.
//!
//! ## Design Principles
//!
//! 1. **Single Lock**: The whole keyspace sits behind one mutex, so a
//!    transaction or a script runs without interleaving by holding it once.
//! 2. **TTL Fast Path**: Expiration is checked on access; a stale entry is
//!    removed before the caller sees it.
//! 3. **Typed Values**: Each key holds exactly one kind of value; commands
//!    that expect another kind answer `WRONGTYPE`.
//! 4. **No Empty Collections**: A collection that loses its last element is
//!    removed, matching what clients observe from a real server.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, MutexGuard};

/// Hash map keyed by raw bytes with the shared ahash state.
pub type ByteMap<V> = HashMap<Vec<u8>, V, RandomState>;
pub type ByteSet = HashSet<Vec<u8>, RandomState>;

/// A stored value.
#[derive(Debug, Clone)]
pub enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(ByteMap<Vec<u8>>),
    Set(ByteSet),
    ZSet(SortedSet),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::ZSet(_) => "zset",
        }
    }

    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(list) => list.is_empty(),
            Value::Hash(hash) => hash.is_empty(),
            Value::Set(set) => set.is_empty(),
            Value::ZSet(zset) => zset.len() == 0,
        }
    }
}

/// Sorted set ordered by (score, member).
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    scores: ByteMap<f64>,
}

impl SortedSet {
    /// Inserts or updates a member; returns true when it is new.
    pub fn insert(&mut self, member: Vec<u8>, score: f64) -> bool {
        self.scores.insert(member, score).is_none()
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        self.scores.remove(member).is_some()
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Members in ascending order.
    pub fn ordered(&self) -> Vec<(&[u8], f64)> {
        let mut items: Vec<(&[u8], f64)> = self
            .scores
            .iter()
            .map(|(member, score)| (member.as_slice(), *score))
            .collect();
        items.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        items
    }

    /// Zero-based position in ascending order.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        self.scores.get(member)?;
        self.ordered().iter().position(|(m, _)| *m == member)
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// The keyspace. Every accessor takes `now` so expiry is decided once per
/// command.
#[derive(Debug, Default)]
pub struct Db {
    map: ByteMap<Entry>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &[u8], now: Instant) -> Option<&Value> {
        self.evict_if_expired(key, now);
        self.map.get(key).map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, key: &[u8], now: Instant) -> Option<&mut Value> {
        self.evict_if_expired(key, now);
        self.map.get_mut(key).map(|entry| &mut entry.value)
    }

    /// Returns the value at `key`, creating it with `init` when absent.
    pub fn get_or_insert_with(
        &mut self,
        key: &[u8],
        now: Instant,
        init: impl FnOnce() -> Value,
    ) -> &mut Value {
        self.evict_if_expired(key, now);
        &mut self
            .map
            .entry(key.to_vec())
            .or_insert_with(|| Entry {
                value: init(),
                expires_at: None,
            })
            .value
    }

    /// Stores `value`, replacing any previous value and TTL.
    pub fn insert(&mut self, key: Vec<u8>, value: Value, expires_at: Option<Instant>) {
        self.map.insert(key, Entry { value, expires_at });
    }

    pub fn remove(&mut self, key: &[u8], now: Instant) -> Option<Value> {
        self.evict_if_expired(key, now);
        self.map.remove(key).map(|entry| entry.value)
    }

    pub fn contains(&mut self, key: &[u8], now: Instant) -> bool {
        self.get(key, now).is_some()
    }

    /// `None` when the key is missing, `Some(None)` when it never expires.
    pub fn expiry(&mut self, key: &[u8], now: Instant) -> Option<Option<Duration>> {
        self.evict_if_expired(key, now);
        self.map
            .get(key)
            .map(|entry| entry.expires_at.map(|deadline| deadline.saturating_duration_since(now)))
    }

    /// Sets or clears the deadline; returns false when the key is missing.
    pub fn set_expiry(&mut self, key: &[u8], now: Instant, deadline: Option<Instant>) -> bool {
        self.evict_if_expired(key, now);
        match self.map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = deadline;
                true
            }
            None => false,
        }
    }

    /// Moves a value and its TTL to `to`, replacing whatever was there.
    pub fn rename(&mut self, from: &[u8], to: &[u8], now: Instant) -> bool {
        self.evict_if_expired(from, now);
        match self.map.remove(from) {
            Some(entry) => {
                self.map.insert(to.to_vec(), entry);
                true
            }
            None => false,
        }
    }

    /// Live keys in byte order.
    pub fn keys(&mut self, now: Instant) -> Vec<Vec<u8>> {
        self.purge_expired(now);
        let mut keys: Vec<Vec<u8>> = self.map.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drops `key` when it holds an empty collection.
    pub fn remove_if_empty(&mut self, key: &[u8]) {
        if self
            .map
            .get(key)
            .map_or(false, |entry| entry.value.is_empty_collection())
        {
            self.map.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Removes every entry whose deadline has passed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        before - self.map.len()
    }

    fn evict_if_expired(&mut self, key: &[u8], now: Instant) {
        if self.map.get(key).map_or(false, |entry| entry.is_expired(now)) {
            self.map.remove(key);
        }
    }
}

/// Shared handle to the keyspace.
#[derive(Debug, Default)]
pub struct Store {
    db: Mutex<Db>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the keyspace for one command, transaction or script.
    pub fn lock(&self) -> MutexGuard<'_, Db> {
        self.db.lock()
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        self.db.lock().purge_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_roundtrip() {
        let mut db = Db::new();
        let now = Instant::now();
        db.insert(b"key".to_vec(), Value::Str(b"value".to_vec()), None);
        match db.get(b"key", now) {
            Some(Value::Str(data)) => assert_eq!(data, b"value"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(db.remove(b"key", now).is_some());
        assert!(db.get(b"key", now).is_none());
    }

    #[test]
    fn expired_entries_are_hidden() {
        let mut db = Db::new();
        let now = Instant::now();
        db.insert(b"key".to_vec(), Value::Str(b"v".to_vec()), Some(now + Duration::from_millis(5)));
        assert!(db.contains(b"key", now));
        assert!(!db.contains(b"key", now + Duration::from_millis(5)));
        assert_eq!(db.len(), 0);
    }

    #[test]
    fn purge_expired_removes_entries() {
        let mut db = Db::new();
        let now = Instant::now();
        db.insert(b"a".to_vec(), Value::Str(Vec::new()), Some(now));
        db.insert(b"b".to_vec(), Value::Str(Vec::new()), None);
        assert_eq!(db.purge_expired(now), 1);
        assert_eq!(db.keys(now), vec![b"b".to_vec()]);
    }

    #[test]
    fn expiry_reports_missing_or_remaining() {
        let mut db = Db::new();
        let now = Instant::now();
        db.insert(b"plain".to_vec(), Value::Str(Vec::new()), None);
        db.insert(b"ttl".to_vec(), Value::Str(Vec::new()), Some(now + Duration::from_secs(10)));
        assert_eq!(db.expiry(b"missing", now), None);
        assert_eq!(db.expiry(b"plain", now), Some(None));
        assert_eq!(db.expiry(b"ttl", now), Some(Some(Duration::from_secs(10))));
        assert!(db.set_expiry(b"ttl", now, None));
        assert_eq!(db.expiry(b"ttl", now), Some(None));
    }

    #[test]
    fn rename_carries_ttl() {
        let mut db = Db::new();
        let now = Instant::now();
        db.insert(b"old".to_vec(), Value::Str(b"v".to_vec()), Some(now + Duration::from_secs(5)));
        assert!(db.rename(b"old", b"new", now));
        assert!(!db.contains(b"old", now));
        assert_eq!(db.expiry(b"new", now), Some(Some(Duration::from_secs(5))));
    }

    #[test]
    fn sorted_set_orders_by_score_then_member() {
        let mut zset = SortedSet::default();
        assert!(zset.insert(b"b".to_vec(), 1.0));
        assert!(zset.insert(b"a".to_vec(), 1.0));
        assert!(zset.insert(b"c".to_vec(), 0.5));
        assert!(!zset.insert(b"c".to_vec(), 2.0));
        let order: Vec<&[u8]> = zset.ordered().into_iter().map(|(m, _)| m).collect();
        assert_eq!(order, [&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert_eq!(zset.rank(b"c"), Some(2));
        assert_eq!(zset.rank(b"zzz"), None);
    }

    #[test]
    fn empty_collections_are_dropped() {
        let mut db = Db::new();
        let now = Instant::now();
        db.insert(b"list".to_vec(), Value::List(VecDeque::new()), None);
        db.remove_if_empty(b"list");
        assert!(!db.contains(b"list", now));
    }
}

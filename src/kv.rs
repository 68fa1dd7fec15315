//! The transactional key-value store (C10, ambient). Captures exactly the
//! operations the spec names in §6: string append, hash fields, set members,
//! under WATCH/MULTI/EXEC optimistic concurrency.
//!
//! `MemoryKvStore` is the in-process reference implementation used by the
//! CLI, the driver, and every test. Sharded the way this codebase's
//! predecessor sharded its KV writer, so that unrelated keys rarely contend
//! on the same lock; the brief compare-and-swap at `commit()` is the only
//! globally serialized step, mirroring a real store's EXEC.

use crate::errors::DedupeError;
use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const SHARD_COUNT: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvValue {
    Bytes(Vec<u8>),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Absent,
}

impl KvValue {
    fn as_bytes(&self) -> &[u8] {
        match self {
            KvValue::Bytes(b) => b,
            _ => &[],
        }
    }
    fn as_hash(&self) -> HashMap<String, String> {
        match self {
            KvValue::Hash(h) => h.clone(),
            _ => HashMap::new(),
        }
    }
    fn as_set(&self) -> HashSet<String> {
        match self {
            KvValue::Set(s) => s.clone(),
            _ => HashSet::new(),
        }
    }
}

struct Entry {
    value: KvValue,
    version: u64,
}

struct Shard {
    data: RwLock<HashMap<String, Entry>>,
}

/// In-process reference `KvStore`. Cheaply cloneable; each clone shares the
/// same underlying data (an isolated connection in spec terms is just a
/// fresh `Transaction` built from a clone).
#[derive(Clone)]
pub struct MemoryKvStore {
    shards: Arc<Vec<Shard>>,
    commit_lock: Arc<Mutex<()>>,
    hasher: RandomState,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard { data: RwLock::new(HashMap::new()) })
            .collect();
        Self {
            shards: Arc::new(shards),
            commit_lock: Arc::new(Mutex::new(())),
            hasher: RandomState::with_seeds(
                0x5ea1_c0de_0000_0001,
                0x5ea1_c0de_0000_0002,
                0x5ea1_c0de_0000_0003,
                0x5ea1_c0de_0000_0004,
            ),
        }
    }

    pub fn begin(&self) -> Transaction {
        Transaction::new(self.clone())
    }

    fn shard_index(&self, key: &str) -> usize {
        (self.hasher.hash_one(key) as usize) % self.shards.len()
    }

    fn version(&self, key: &str) -> u64 {
        let shard = &self.shards[self.shard_index(key)];
        shard.data.read().get(key).map(|e| e.version).unwrap_or(0)
    }

    fn read(&self, key: &str) -> KvValue {
        let shard = &self.shards[self.shard_index(key)];
        shard
            .data
            .read()
            .get(key)
            .map(|e| e.value.clone())
            .unwrap_or(KvValue::Absent)
    }

    fn write(&self, key: &str, value: KvValue) {
        let shard = &self.shards[self.shard_index(key)];
        let mut map = shard.data.write();
        let entry = map.entry(key.to_string()).or_insert(Entry { value: KvValue::Absent, version: 0 });
        entry.value = value;
        entry.version += 1;
    }
}

/// A single card's unit-of-work transaction: accumulates watches and local
/// writes, and performs the compare-and-swap at `commit()`.
pub struct Transaction {
    store: MemoryKvStore,
    watches: HashMap<String, u64>,
    cache: HashMap<String, KvValue>,
    dirty: HashSet<String>,
}

impl Transaction {
    fn new(store: MemoryKvStore) -> Self {
        Self { store, watches: HashMap::new(), cache: HashMap::new(), dirty: HashSet::new() }
    }

    /// WATCH `key` if this is the first time this transaction has seen it,
    /// then snapshot its current value into the local cache.
    fn ensure_loaded(&mut self, key: &str) {
        if self.cache.contains_key(key) {
            return;
        }
        self.watches.entry(key.to_string()).or_insert_with(|| self.store.version(key));
        let value = self.store.read(key);
        self.cache.insert(key.to_string(), value);
    }

    pub fn get_bytes(&mut self, key: &str) -> Vec<u8> {
        self.ensure_loaded(key);
        self.cache.get(key).map(|v| v.as_bytes().to_vec()).unwrap_or_default()
    }

    pub fn append_bytes(&mut self, key: &str, data: &[u8]) {
        self.ensure_loaded(key);
        let mut buf = self.cache.get(key).map(|v| v.as_bytes().to_vec()).unwrap_or_default();
        buf.extend_from_slice(data);
        self.cache.insert(key.to_string(), KvValue::Bytes(buf));
        self.dirty.insert(key.to_string());
    }

    pub fn hash_exists(&mut self, key: &str) -> bool {
        self.ensure_loaded(key);
        !matches!(self.cache.get(key), Some(KvValue::Absent) | None)
    }

    pub fn get_hash_field(&mut self, key: &str, field: &str) -> Option<String> {
        self.ensure_loaded(key);
        self.cache.get(key).and_then(|v| v.as_hash().get(field).cloned())
    }

    pub fn get_hash_all(&mut self, key: &str) -> HashMap<String, String> {
        self.ensure_loaded(key);
        self.cache.get(key).map(|v| v.as_hash()).unwrap_or_default()
    }

    pub fn set_hash_field(&mut self, key: &str, field: &str, value: String) {
        self.ensure_loaded(key);
        let mut h = self.cache.get(key).map(|v| v.as_hash()).unwrap_or_default();
        h.insert(field.to_string(), value);
        self.cache.insert(key.to_string(), KvValue::Hash(h));
        self.dirty.insert(key.to_string());
    }

    pub fn delete_hash_field(&mut self, key: &str, field: &str) {
        self.ensure_loaded(key);
        let mut h = self.cache.get(key).map(|v| v.as_hash()).unwrap_or_default();
        h.remove(field);
        self.cache.insert(key.to_string(), KvValue::Hash(h));
        self.dirty.insert(key.to_string());
    }

    pub fn get_set_members(&mut self, key: &str) -> HashSet<String> {
        self.ensure_loaded(key);
        self.cache.get(key).map(|v| v.as_set()).unwrap_or_default()
    }

    pub fn add_set_member(&mut self, key: &str, member: String) {
        self.ensure_loaded(key);
        let mut s = self.cache.get(key).map(|v| v.as_set()).unwrap_or_default();
        s.insert(member);
        self.cache.insert(key.to_string(), KvValue::Set(s));
        self.dirty.insert(key.to_string());
    }

    pub fn remove_set_member(&mut self, key: &str, member: &str) {
        self.ensure_loaded(key);
        let mut s = self.cache.get(key).map(|v| v.as_set()).unwrap_or_default();
        s.remove(member);
        self.cache.insert(key.to_string(), KvValue::Set(s));
        self.dirty.insert(key.to_string());
    }

    /// Overwrite a hash key's entire contents with `fields`. Used when saving
    /// an entity whose final shape (after adds and removals) is already known,
    /// rather than replaying individual field mutations.
    pub fn replace_hash(&mut self, key: &str, fields: HashMap<String, String>) {
        self.ensure_loaded(key);
        self.cache.insert(key.to_string(), KvValue::Hash(fields));
        self.dirty.insert(key.to_string());
    }

    /// Overwrite a set key's entire membership with `members`.
    pub fn replace_set(&mut self, key: &str, members: HashSet<String>) {
        self.ensure_loaded(key);
        self.cache.insert(key.to_string(), KvValue::Set(members));
        self.dirty.insert(key.to_string());
    }

    pub fn delete_key(&mut self, key: &str) {
        self.ensure_loaded(key);
        self.cache.insert(key.to_string(), KvValue::Absent);
        self.dirty.insert(key.to_string());
    }

    /// Move a cached entity to a new key, scheduling the old key for deletion.
    /// Mirrors the Context's `renameCacheKey`: the underlying KV key is deleted
    /// at save time and the new one written, with both folded into this
    /// transaction's single atomic commit.
    pub fn rename_key(&mut self, old: &str, new: &str) {
        self.ensure_loaded(old);
        let value = self.cache.get(old).cloned().unwrap_or(KvValue::Absent);
        self.cache.insert(old.to_string(), KvValue::Absent);
        self.dirty.insert(old.to_string());
        self.ensure_loaded(new);
        self.cache.insert(new.to_string(), value);
        self.dirty.insert(new.to_string());
    }

    /// Perform the compare-and-swap: fail with `OptimisticConflict` if any
    /// watched key changed since it was first read, otherwise apply every
    /// dirty write atomically.
    pub fn commit(self) -> Result<(), DedupeError> {
        let _guard = self.store.commit_lock.lock();
        for (key, seen_version) in &self.watches {
            if self.store.version(key) != *seen_version {
                return Err(DedupeError::OptimisticConflict { key: key.clone() });
            }
        }
        for key in &self.dirty {
            let value = self.cache.get(key).cloned().unwrap_or(KvValue::Absent);
            self.store.write(key, value);
        }
        Ok(())
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::OwnedMutexGuard;

use crate::context::Context;
use crate::errors::CodeError;

use super::sketch::Sketch;
use super::{Caches, Locker, Lockers, Scope, Store};

/// How many mutations between opportunistic sweeps of expired entries.
const SWEEP_EVERY: u64 = 4096;

enum Slot {
    Bytes(Vec<u8>),
    Counter(i64),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(Instant::now() + ttl)
    }
}

/// In-process TTL map. Entries expire lazily on access with an
/// amortised sweep on mutation.
#[derive(Default)]
pub struct LocalStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<Vec<u8>, Entry>,
    mutations: u64,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreState {
    fn maybe_sweep(&mut self) {
        self.mutations += 1;
        if self.mutations % SWEEP_EVERY != 0 {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.expired(now));
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn get(
        &self,
        _ctx: &Context,
        scope: Scope,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, CodeError> {
        let key = scope.key(key);
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let expired = state
            .entries
            .get(&key)
            .map(|entry| entry.expired(now))
            .unwrap_or(false);
        if expired {
            state.entries.remove(&key);
            return Ok(None);
        }
        Ok(state.entries.get(&key).map(|entry| match &entry.slot {
            Slot::Bytes(bytes) => bytes.clone(),
            Slot::Counter(counter) => counter.to_be_bytes().to_vec(),
        }))
    }

    async fn set(
        &self,
        _ctx: &Context,
        scope: Scope,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<(), CodeError> {
        let key = scope.key(key);
        let mut state = self.state.lock().unwrap();
        state.maybe_sweep();
        state.entries.insert(
            key,
            Entry {
                slot: Slot::Bytes(value),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        _ctx: &Context,
        scope: Scope,
        key: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CodeError> {
        let key = scope.key(key);
        let mut state = self.state.lock().unwrap();
        state.maybe_sweep();
        state.entries.insert(
            key,
            Entry {
                slot: Slot::Bytes(value),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn incr(
        &self,
        _ctx: &Context,
        scope: Scope,
        key: &[u8],
        delta: i64,
    ) -> Result<i64, CodeError> {
        let key = scope.key(key);
        let mut state = self.state.lock().unwrap();
        state.maybe_sweep();
        let now = Instant::now();
        let stale = match state.entries.get(&key) {
            Some(entry) => entry.expired(now),
            None => true,
        };
        if stale {
            state.entries.insert(
                key.clone(),
                Entry {
                    slot: Slot::Counter(0),
                    expires_at: None,
                },
            );
        }
        let entry = state.entries.get_mut(&key).unwrap();
        let counter = match &mut entry.slot {
            Slot::Counter(counter) => counter,
            Slot::Bytes(_) => {
                return Err(CodeError::bad_request("key does not hold a counter"));
            }
        };
        *counter += delta;
        let value = *counter;
        if value < 0 {
            state.entries.remove(&key);
        }
        Ok(value)
    }

    async fn expire_key(
        &self,
        _ctx: &Context,
        scope: Scope,
        key: &[u8],
        ttl: Duration,
    ) -> Result<(), CodeError> {
        let key = scope.key(key);
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.expires_at = expiry(ttl);
        }
        Ok(())
    }

    async fn remove(&self, _ctx: &Context, scope: Scope, key: &[u8]) -> Result<(), CodeError> {
        let key = scope.key(key);
        self.state.lock().unwrap().entries.remove(&key);
        Ok(())
    }
}

/// In-process mutex registry. A lock releases with its holder, so the TTL
/// only matters for the remote variant.
#[derive(Default)]
pub struct LocalLockers {
    slots: Mutex<HashMap<Vec<u8>, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLockers {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Lockers for LocalLockers {
    async fn acquire(
        &self,
        _ctx: &Context,
        scope: Scope,
        key: &[u8],
        _ttl: Duration,
    ) -> Result<Box<dyn Locker>, CodeError> {
        let key = scope.key(key);
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            if slots.len() > 1024 {
                // Drop slots nobody holds or waits on.
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry(key).or_default().clone()
        };
        Ok(Box::new(LocalLocker { slot, guard: None }))
    }
}

struct LocalLocker {
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl Locker for LocalLocker {
    async fn lock(&mut self, ctx: &Context) -> Result<(), CodeError> {
        if self.guard.is_some() {
            return Ok(());
        }
        let acquire = self.slot.clone().lock_owned();
        let guard = match ctx.deadline() {
            None => acquire.await,
            Some(deadline) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), acquire)
                    .await
                    .map_err(|_| CodeError::timeout("deadline exceeded acquiring lock"))?
            }
        };
        self.guard = Some(guard);
        Ok(())
    }

    async fn unlock(&mut self, _ctx: &Context) -> Result<(), CodeError> {
        self.guard.take();
        Ok(())
    }
}

/// Cost-based admission cache: LRU eviction with a frequency sketch
/// deciding whether a candidate is worth its victim. Rejected sets return
/// `false`.
pub struct LocalCaches {
    state: Mutex<CacheState>,
}

struct CacheState {
    entries: LruCache<Vec<u8>, CacheEntry>,
    sketch: Sketch,
    cost: usize,
    max_cost: usize,
}

struct CacheEntry {
    value: Vec<u8>,
    cost: usize,
    expires_at: Option<Instant>,
}

impl LocalCaches {
    /// `max_cost` bounds the summed key+value bytes held.
    pub fn new(max_cost: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                sketch: Sketch::new(1024),
                cost: 0,
                max_cost: max_cost.max(1),
            }),
        }
    }

    fn fetch(&self, scope: Scope, key: &[u8]) -> Option<Vec<u8>> {
        let key = scope.key(key);
        let mut state = self.state.lock().unwrap();
        state.sketch.record(&key);
        let now = Instant::now();
        let expired = state
            .entries
            .get(&key)
            .map(|entry| entry.expired(now))
            .unwrap_or(false);
        if expired {
            let removed = state.entries.pop(&key).unwrap();
            state.cost -= removed.cost;
            return None;
        }
        state.entries.get(&key).map(|entry| entry.value.clone())
    }
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[async_trait]
impl Caches for LocalCaches {
    async fn get(
        &self,
        _ctx: &Context,
        scope: Scope,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, CodeError> {
        Ok(self.fetch(scope, key))
    }

    async fn exist(&self, _ctx: &Context, scope: Scope, key: &[u8]) -> Result<bool, CodeError> {
        Ok(self.fetch(scope, key).is_some())
    }

    async fn set(
        &self,
        _ctx: &Context,
        scope: Scope,
        key: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CodeError> {
        let key = scope.key(key);
        let cost = key.len() + value.len();
        let mut state = self.state.lock().unwrap();
        if cost > state.max_cost {
            return Ok(false);
        }
        state.sketch.record(&key);

        if let Some(existing) = state.entries.pop(&key) {
            state.cost -= existing.cost;
        }
        // Evict while over budget, but only victims colder than the
        // candidate; a hotter victim rejects the set instead.
        while state.cost + cost > state.max_cost {
            let candidate_freq = state.sketch.estimate(&key);
            let victim = match state.entries.peek_lru() {
                Some((victim_key, _)) => victim_key.clone(),
                None => break,
            };
            if state.sketch.estimate(&victim) > candidate_freq {
                return Ok(false);
            }
            let removed = state.entries.pop(&victim).unwrap();
            state.cost -= removed.cost;
        }

        state.cost += cost;
        state.entries.put(
            key,
            CacheEntry {
                value,
                cost,
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn remove(&self, _ctx: &Context, scope: Scope, key: &[u8]) -> Result<(), CodeError> {
        let key = scope.key(key);
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.pop(&key) {
            state.cost -= entry.cost;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_store_ttl() {
        let store = LocalStore::new();
        let ctx = Context::background();

        store
            .set_with_ttl(&ctx, Scope::System, b"k", b"v".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(
            store.get(&ctx, Scope::System, b"k").await.unwrap(),
            Some(b"v".to_vec())
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get(&ctx, Scope::System, b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_scopes_partition_keys() {
        let store = LocalStore::new();
        let ctx = Context::background();

        store
            .set(&ctx, Scope::System, b"k", b"sys".to_vec())
            .await
            .unwrap();
        assert_eq!(store.get(&ctx, Scope::User, b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter() {
        let store = LocalStore::new();
        let ctx = Context::background();

        assert_eq!(store.incr(&ctx, Scope::System, b"n", 1).await.unwrap(), 1);
        assert_eq!(store.incr(&ctx, Scope::System, b"n", 2).await.unwrap(), 3);
        assert_eq!(store.incr(&ctx, Scope::System, b"n", -1).await.unwrap(), 2);
        // Dropping below zero removes the key.
        assert_eq!(store.incr(&ctx, Scope::System, b"n", -3).await.unwrap(), -1);
        assert_eq!(store.get(&ctx, Scope::System, b"n").await.unwrap(), None);
        assert_eq!(store.incr(&ctx, Scope::System, b"n", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_key() {
        let store = LocalStore::new();
        let ctx = Context::background();

        store.incr(&ctx, Scope::System, b"n", 1).await.unwrap();
        store
            .expire_key(&ctx, Scope::System, b"n", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get(&ctx, Scope::System, b"n").await.unwrap(), None);
        // The counter restarts once expired.
        assert_eq!(store.incr(&ctx, Scope::System, b"n", 5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_lockers_serialise() {
        let lockers = LocalLockers::new();
        let ctx = Context::background();

        let mut first = lockers
            .acquire(&ctx, Scope::System, b"l", Duration::from_secs(5))
            .await
            .unwrap();
        first.lock(&ctx).await.unwrap();

        let mut second = lockers
            .acquire(&ctx, Scope::System, b"l", Duration::from_secs(5))
            .await
            .unwrap();
        let bounded = ctx.with_timeout(Duration::from_millis(30));
        assert_eq!(
            second.lock(&bounded).await.unwrap_err().name,
            "timeout"
        );

        first.unlock(&ctx).await.unwrap();
        second.lock(&ctx).await.unwrap();
        second.unlock(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_admission() {
        let caches = LocalCaches::new(64);
        let ctx = Context::background();

        // Make `hot` clearly worth keeping.
        for _ in 0..16 {
            caches.get(&ctx, Scope::System, b"hot").await.unwrap();
        }
        assert!(caches
            .set(&ctx, Scope::System, b"hot", vec![0; 32], Duration::ZERO)
            .await
            .unwrap());

        // A cold key that would evict `hot` is rejected...
        assert!(!caches
            .set(&ctx, Scope::System, b"cold", vec![0; 40], Duration::ZERO)
            .await
            .unwrap());
        assert!(caches.exist(&ctx, Scope::System, b"hot").await.unwrap());

        // ...but a small one that fits alongside is admitted.
        assert!(caches
            .set(&ctx, Scope::System, b"tiny", vec![0; 4], Duration::ZERO)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cache_ttl_and_remove() {
        let caches = LocalCaches::new(1024);
        let ctx = Context::background();

        assert!(caches
            .set(&ctx, Scope::User, b"k", b"v".to_vec(), Duration::from_millis(20))
            .await
            .unwrap());
        assert!(caches.exist(&ctx, Scope::User, b"k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!caches.exist(&ctx, Scope::User, b"k").await.unwrap());

        caches
            .set(&ctx, Scope::User, b"k", b"v".to_vec(), Duration::ZERO)
            .await
            .unwrap();
        caches.remove(&ctx, Scope::User, b"k").await.unwrap();
        assert!(!caches.exist(&ctx, Scope::User, b"k").await.unwrap());
    }
}

//! Bounded LRU cache with a non-evictable, refcounted "endured" tier.
//!
//! Two collections behind one lock: an `lru::LruCache` for the
//! evictable tier and a plain `HashMap` for the endured tier, each entry
//! carrying its own refcount. The refcount is driven entirely by caller
//! lifecycle (subscription count in the repository core), never by weak
//! references.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::{debug, warn};

/// Error surfaced by cache construction. Cache reads/writes themselves never
/// fail — reads and writes are synchronous and non-blocking — only
/// misconfiguration does.
#[derive(Debug, thiserror::Error)]
pub enum StateCacheError {
    #[error("cache limit must be greater than zero")]
    ZeroCapacity,
}

struct EnduredEntry<V> {
    value: V,
    refcount: usize,
}

struct Inner<K, V> {
    evictable: LruCache<K, V>,
    endured: HashMap<K, EnduredEntry<V>>,
}

/// Bounded cache of live values (`RunningState`s in the repository core, but
/// generic here so it is independently testable) with an unbounded endured
/// tier for entries under active external subscription.
///
/// `on_evict` fires once per key evicted from the *evictable* tier only —
/// moving a key into the endured tier, or freeing it back out, never fires
/// it. It is the repository's hook to call `RunningState::complete()`.
pub struct StateCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    inner: Mutex<Inner<K, V>>,
    cache_limit: usize,
    on_evict: Box<dyn Fn(&K, &V) + Send + Sync>,
}

impl<K, V> StateCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new<F>(cache_limit: usize, on_evict: F) -> Result<Self, StateCacheError>
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        let capacity = NonZeroUsize::new(cache_limit).ok_or(StateCacheError::ZeroCapacity)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                evictable: LruCache::new(capacity),
                endured: HashMap::new(),
            }),
            cache_limit,
            on_evict: Box::new(on_evict),
        })
    }

    /// Looks up a key across both tiers. Touches LRU recency if the hit is
    /// in the evictable tier.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("state cache lock poisoned");
        if let Some(entry) = inner.endured.get(key) {
            return Some(entry.value.clone());
        }
        inner.evictable.get(key).cloned()
    }

    /// Inserts or refreshes a value in the evictable tier. If the key is
    /// already endured, the endured status is preserved and only the value
    /// is refreshed: setting a key that is already endured never downgrades
    /// it to evictable.
    ///
    /// May evict the least-recently-used *other* evictable entry if this
    /// insertion pushes the evictable tier over `cache_limit`.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.lock().expect("state cache lock poisoned");
        if let Some(entry) = inner.endured.get_mut(&key) {
            entry.value = value;
            return;
        }
        inner.evictable.put(key, value);
        self.evict_overflow(&mut inner);
    }

    /// Moves `key` into the endured tier, refcounting it. If already
    /// endured, increments the refcount and refreshes the value: endure of
    /// an already-evictable key promotes it, with refcount
    /// 1"). Returns the refcount after the call.
    pub fn endure(&self, key: K, value: V) -> usize {
        let mut inner = self.inner.lock().expect("state cache lock poisoned");
        inner.evictable.pop(&key);
        let entry = inner
            .endured
            .entry(key)
            .and_modify(|e| {
                e.value = value.clone();
                e.refcount += 1;
            })
            .or_insert(EnduredEntry { value, refcount: 1 });
        entry.refcount
    }

    /// Decrements the refcount on an endured entry; at zero, demotes it back
    /// into the evictable tier (where it immediately becomes eligible for
    /// LRU eviction under pressure). Returns the refcount after the call, or
    /// `None` if the key was not endured.
    pub fn free(&self, key: &K) -> Option<usize> {
        let mut inner = self.inner.lock().expect("state cache lock poisoned");
        let refcount = {
            let entry = inner.endured.get_mut(key)?;
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.refcount
        };
        if refcount == 0 {
            if let Some(entry) = inner.endured.remove(key) {
                inner.evictable.put(key.clone(), entry.value);
                self.evict_overflow(&mut inner);
            }
        }
        Some(refcount)
    }

    /// Removes a key from whichever tier holds it without invoking
    /// `on_evict` (an explicit delete is not an LRU eviction).
    pub fn delete(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("state cache lock poisoned");
        if let Some(entry) = inner.endured.remove(key) {
            return Some(entry.value);
        }
        inner.evictable.pop(key)
    }

    /// Snapshot of every entry currently cached, endured or not.
    pub fn iterate(&self) -> Vec<(K, V)> {
        let inner = self.inner.lock().expect("state cache lock poisoned");
        let mut out: Vec<(K, V)> = inner
            .endured
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        out.extend(inner.evictable.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    pub fn is_endured(&self, key: &K) -> bool {
        let inner = self.inner.lock().expect("state cache lock poisoned");
        inner.endured.contains_key(key)
    }

    pub fn evictable_len(&self) -> usize {
        let inner = self.inner.lock().expect("state cache lock poisoned");
        inner.evictable.len()
    }

    pub fn endured_len(&self) -> usize {
        let inner = self.inner.lock().expect("state cache lock poisoned");
        inner.endured.len()
    }

    /// Eviction fires only when the evictable tier exceeds `cache_limit`
    /// after an insertion; `lru::LruCache` is itself bounded at
    /// construction, so in practice this removes at most the one entry that
    /// `put` displaced. We still loop defensively in case callers shrink
    /// `cache_limit` in a future version.
    fn evict_overflow(&self, inner: &mut Inner<K, V>) {
        while inner.evictable.len() > self.cache_limit {
            match inner.evictable.pop_lru() {
                Some((key, value)) => {
                    debug!(cache_limit = self.cache_limit, "evicting cache entry");
                    (self.on_evict)(&key, &value);
                }
                None => break,
            }
        }
    }
}

impl<K, V> StateCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    /// Logs (but does not prevent) eviction of a key that callers report as
    /// still subscribed — this implementation
    /// keeps `StateCache` decoupled from subscriber bookkeeping and leaves
    /// prevention to `updates$` always enduring correctly.
    pub fn warn_if_evicting_subscribed(&self, key: &K, still_subscribed: bool) {
        if still_subscribed {
            warn!(?key, "evicting cache entry with active subscribers");
        }
    }
}

//! Two-generation timeout cache.
//!
//! Every live key sits in exactly one of two sets: `candidates` (evicted by the next sweep)
//! or `livings` (safe for at least one more sweep). Writes and touched reads move a key into
//! `livings`; a sweep evicts all candidates and then promotes `livings` to be the new
//! candidate generation. An entry therefore stays alive between one and two sweep intervals
//! after it was last used, without keeping per-entry timestamps.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

type OnDelete<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

pub struct TimeoutCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for TimeoutCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct CacheInner<K, V> {
    state: Mutex<CacheState<K, V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> Drop for CacheInner<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

struct CacheState<K, V> {
    candidates: HashSet<K>,
    livings: HashSet<K>,
    data: HashMap<K, V>,
    reverse: Option<Box<dyn ReverseIndex<K, V>>>,
    on_delete: Option<OnDelete<K, V>>,
    terminated: bool,
}

/// Value to key index, only built for caches that need [`TimeoutCache::get_key`].
trait ReverseIndex<K, V>: Send {
    fn key_of(&self, value: &V) -> Option<&K>;
    fn insert(&mut self, value: V, key: K);
    /// Drops `value` only while it still maps to `key`.
    fn remove(&mut self, value: &V, key: &K);
    fn clear(&mut self);
}

impl<K, V> ReverseIndex<K, V> for HashMap<V, K>
where
    K: Eq + Send,
    V: Hash + Eq + Send,
{
    fn key_of(&self, value: &V) -> Option<&K> {
        self.get(value)
    }
    fn insert(&mut self, value: V, key: K) {
        HashMap::insert(self, value, key);
    }
    fn remove(&mut self, value: &V, key: &K) {
        if self.get(value) == Some(key) {
            HashMap::remove(self, value);
        }
    }
    fn clear(&mut self) {
        HashMap::clear(self)
    }
}

impl<K, V> TimeoutCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a cache swept every `sweep_interval` by a task on the current tokio runtime.
    /// The task ends when the cache is terminated or its last handle is dropped.
    pub fn new(sweep_interval: Duration) -> Self {
        Self::manual().spawn_sweeper(sweep_interval)
    }

    /// Create a cache without a sweep task; generations rotate only when [`Self::sweep`] is
    /// called.
    pub fn manual() -> Self {
        Self::with_state(None)
    }

    fn with_state(reverse: Option<Box<dyn ReverseIndex<K, V>>>) -> Self {
        let state = CacheState {
            candidates: HashSet::new(),
            livings: HashSet::new(),
            data: HashMap::new(),
            reverse,
            on_delete: None,
            terminated: false,
        };
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(state),
                sweeper: Mutex::new(None),
            }),
        }
    }

    fn spawn_sweeper(self, sweep_interval: Duration) -> Self {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(sweep_loop(weak, sweep_interval));
        self.inner.sweeper.lock().replace(handle);
        self
    }

    /// Register the callback that receives every evicted entry, e.g. to close a socket.
    pub fn set_on_delete<F>(&self, f: F)
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.inner.state.lock().on_delete.replace(Arc::new(f));
    }

    pub fn has(&self, key: &K) -> bool {
        self.inner.state.lock().data.contains_key(key)
    }

    pub fn get(&self, key: &K, touch: bool) -> Option<V> {
        let mut state = self.inner.state.lock();
        if touch {
            state.touch(key);
        }
        state.data.get(key).cloned()
    }

    pub fn touch(&self, key: &K) {
        self.inner.state.lock().touch(key);
    }

    pub fn set(&self, key: K, value: V) {
        let mut state = self.inner.state.lock();
        if state.terminated {
            return;
        }
        state.candidates.remove(&key);
        state.livings.insert(key.clone());
        let old = state.data.insert(key.clone(), value.clone());
        if let Some(reverse) = state.reverse.as_mut() {
            if let Some(old) = old {
                reverse.remove(&old, &key);
            }
            reverse.insert(value, key);
        }
    }

    /// Rotate the generations once, returning how many entries were evicted.
    pub fn sweep(&self) -> usize {
        self.inner.rotate().unwrap_or(0)
    }

    /// Flush every entry through the eviction callback and stop sweeping.
    /// The cache is inert afterwards.
    pub fn terminate(&self) {
        let (evicted, on_delete) = {
            let mut state = self.inner.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.candidates.clear();
            state.livings.clear();
            if let Some(reverse) = state.reverse.as_mut() {
                reverse.clear();
            }
            let evicted: Vec<(K, V)> = state.data.drain().collect();
            (evicted, state.on_delete.take())
        };
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
        if let Some(on_delete) = on_delete {
            for (key, value) in evicted {
                on_delete(key, value);
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminated
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> TimeoutCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Hash + Eq + Clone + Send + 'static,
{
    /// Like [`Self::new`], also indexing keys by value for [`Self::get_key`].
    pub fn with_reverse(sweep_interval: Duration) -> Self {
        Self::manual_with_reverse().spawn_sweeper(sweep_interval)
    }

    pub fn manual_with_reverse() -> Self {
        Self::with_state(Some(Box::new(HashMap::<V, K>::new())))
    }

    pub fn has_value(&self, value: &V) -> bool {
        self.inner
            .state
            .lock()
            .reverse
            .as_ref()
            .is_some_and(|reverse| reverse.key_of(value).is_some())
    }

    /// Reverse lookup. Always `None` when the cache was built without reverse lookup.
    pub fn get_key(&self, value: &V, touch: bool) -> Option<K> {
        let mut state = self.inner.state.lock();
        let key = state.reverse.as_ref()?.key_of(value).cloned()?;
        if touch {
            state.touch(&key);
        }
        Some(key)
    }
}

impl<K: Hash + Eq + Clone, V> CacheInner<K, V> {
    /// `None` once terminated.
    fn rotate(&self) -> Option<usize> {
        let (evicted, on_delete) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.terminated {
                return None;
            }
            let mut evicted = Vec::with_capacity(state.candidates.len());
            for key in state.candidates.drain() {
                if let Some(value) = state.data.remove(&key) {
                    if let Some(reverse) = state.reverse.as_mut() {
                        reverse.remove(&value, &key);
                    }
                    evicted.push((key, value));
                }
            }
            state.candidates = std::mem::take(&mut state.livings);
            (evicted, state.on_delete.clone())
        };
        let count = evicted.len();
        if let Some(on_delete) = on_delete {
            for (key, value) in evicted {
                on_delete(key, value);
            }
        }
        Some(count)
    }
}

impl<K: Hash + Eq + Clone, V> CacheState<K, V> {
    fn touch(&mut self, key: &K) {
        if self.candidates.remove(key) {
            self.livings.insert(key.clone());
        }
    }
}

async fn sweep_loop<K, V>(cache: Weak<CacheInner<K, V>>, sweep_interval: Duration)
where
    K: Hash + Eq + Clone,
{
    let mut interval = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(cache) = cache.upgrade() else {
            break;
        };
        match cache.rotate() {
            Some(0) => {}
            Some(count) => log::debug!("timeout cache evicted {count} entries"),
            None => break,
        }
    }
}

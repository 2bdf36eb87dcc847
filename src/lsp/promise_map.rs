//! Identifier-keyed single-assignment values.
//!
//! A [`PromiseMap`] correlates an id with the one value that will eventually be
//! supplied for it. The value may be supplied before anyone asks for it, or
//! after; observers see the same value either way.
//!
//! Entry lifecycle: `pending -> resolved -> retired`. An entry is created by
//! whichever of `get` or `set` comes first. Recently retired ids are
//! remembered so that a late or duplicate `set` cannot recreate an entry
//! nobody will consume. Once the map is closed no new entry is created.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::lsp::error::TransportError;

/// How many retired ids are remembered by default.
pub const DEFAULT_RETIRED_CAPACITY: usize = 4096;

enum Entry<V> {
    Pending(Vec<oneshot::Sender<V>>),
    Resolved(V),
}

struct State<K, V> {
    entries: HashMap<K, Entry<V>>,
    retired: HashSet<K>,
    /// Retirement order, oldest first. Same keys as `retired`.
    retired_order: VecDeque<K>,
    closed: bool,
}

/// What `set` did with the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// At least one observer was waiting and has been resolved.
    Delivered,
    /// Nobody was waiting; the value is kept for the next `get`.
    Stored,
    /// The id already has a value, has been retired, or the map is closed.
    /// Nothing changed.
    Rejected,
}

enum Observed<V> {
    Ready(V),
    Waiting(oneshot::Receiver<V>),
    Closed,
}

pub struct PromiseMap<K, V> {
    state: Mutex<State<K, V>>,
    retired_capacity: usize,
}

impl<K, V> Default for PromiseMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PromiseMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_retired_capacity(DEFAULT_RETIRED_CAPACITY)
    }

    /// Create a map remembering at most `capacity` retired ids. Older ones are
    /// evicted first.
    pub fn with_retired_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                retired: HashSet::new(),
                retired_order: VecDeque::new(),
                closed: false,
            }),
            retired_capacity: capacity,
        }
    }

    /// Observe the value for `key`.
    ///
    /// The observer is registered before this returns, so a `set` racing with
    /// the first poll is not lost. Resolved values stay in the map and can be
    /// observed again until the key is taken or forgotten. On a closed map an
    /// unknown key fails with [`TransportError::ConnectionClosed`] at once.
    pub fn get(&self, key: K) -> impl Future<Output = Result<V, TransportError>> + Send + 'static
    where
        V: Send + 'static,
    {
        let mut state = self.lock();
        let closed = state.closed;
        let observed = match state.entries.get_mut(&key) {
            Some(Entry::Resolved(value)) => Observed::Ready(value.clone()),
            Some(Entry::Pending(waiters)) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Observed::Waiting(rx)
            }
            None if closed => Observed::Closed,
            None => {
                let (tx, rx) = oneshot::channel();
                state.entries.insert(key, Entry::Pending(vec![tx]));
                Observed::Waiting(rx)
            }
        };
        drop(state);

        async move {
            match observed {
                Observed::Ready(value) => Ok(value),
                Observed::Waiting(rx) => rx.await.map_err(|_| TransportError::ConnectionClosed),
                Observed::Closed => Err(TransportError::ConnectionClosed),
            }
        }
    }

    /// Observe the value for `key` as its single consumer.
    ///
    /// The key is retired when this future completes or is dropped, so an
    /// abandoned caller leaves nothing behind.
    pub async fn take(&self, key: K) -> Result<V, TransportError>
    where
        V: Send + 'static,
    {
        let _retire = RetireOnDrop {
            map: self,
            key: key.clone(),
        };
        self.get(key).await
    }

    /// Supply the value for `key`.
    pub fn set(&self, key: K, value: V) -> SetOutcome {
        let mut state = self.lock();
        if state.retired.contains(&key) {
            return SetOutcome::Rejected;
        }
        match state.entries.remove(&key) {
            Some(Entry::Resolved(existing)) => {
                state.entries.insert(key, Entry::Resolved(existing));
                SetOutcome::Rejected
            }
            Some(Entry::Pending(waiters)) => {
                state.entries.insert(key, Entry::Resolved(value.clone()));
                drop(state);
                if deliver(waiters, &value) {
                    SetOutcome::Delivered
                } else {
                    SetOutcome::Stored
                }
            }
            None if state.closed => SetOutcome::Rejected,
            None => {
                state.entries.insert(key, Entry::Resolved(value));
                SetOutcome::Stored
            }
        }
    }

    /// Drop the entry for `key` and retire it. Pending observers see
    /// [`TransportError::ConnectionClosed`].
    pub fn forget(&self, key: &K) -> bool {
        let mut state = self.lock();
        if state.retired.insert(key.clone()) {
            state.retired_order.push_back(key.clone());
            while state.retired_order.len() > self.retired_capacity {
                if let Some(oldest) = state.retired_order.pop_front() {
                    state.retired.remove(&oldest);
                }
            }
        }
        state.entries.remove(key).is_some()
    }

    /// Resolve every pending entry with `value_for(key)`. Returns how many
    /// entries were resolved.
    pub fn resolve_pending(&self, value_for: impl FnMut(&K) -> V) -> usize {
        self.settle_pending(value_for, false)
    }

    /// Resolve every pending entry with `value_for(key)` and close the map.
    ///
    /// Afterwards `get` on an unknown key fails immediately and `set` on an
    /// unknown key is rejected. Values already resolved stay observable.
    pub fn close(&self, value_for: impl FnMut(&K) -> V) -> usize {
        self.settle_pending(value_for, true)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_retired(&self, key: &K) -> bool {
        self.lock().retired.contains(key)
    }

    /// Number of retired ids currently remembered.
    pub fn retired_len(&self) -> usize {
        self.lock().retired.len()
    }

    /// Number of pending or resolved entries. Diagnostics only.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settle_pending(&self, mut value_for: impl FnMut(&K) -> V, close: bool) -> usize {
        let mut state = self.lock();
        state.closed |= close;
        let mut wakeups = Vec::new();
        for (key, entry) in state.entries.iter_mut() {
            if let Entry::Pending(_) = entry {
                let value = value_for(key);
                if let Entry::Pending(waiters) =
                    std::mem::replace(entry, Entry::Resolved(value.clone()))
                {
                    wakeups.push((waiters, value));
                }
            }
        }
        drop(state);

        let count = wakeups.len();
        for (waiters, value) in wakeups {
            deliver(waiters, &value);
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Send `value` to every waiter. True if at least one was still listening.
fn deliver<V: Clone>(waiters: Vec<oneshot::Sender<V>>, value: &V) -> bool {
    let mut delivered = false;
    for waiter in waiters {
        delivered |= waiter.send(value.clone()).is_ok();
    }
    delivered
}

/// Retires `key` when dropped.
struct RetireOnDrop<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    map: &'a PromiseMap<K, V>,
    key: K,
}

impl<K, V> Drop for RetireOnDrop<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        self.map.forget(&self.key);
    }
}

//! Broadcast Queue
//!
//! A [`BroadcastQueue`] fans every pushed item out to all of its listeners.
//! Each [`QueueListener`] keeps its own read cursor, so a slow listener never
//! holds back a fast one and no listener can steal items from another.
//!
//! Items live in a single arena owned by the queue. Cursors are absolute
//! positions into it; once every live listener has moved past an item, the
//! item is dropped from the front of the arena. A listener whose signal is
//! cancelled stops counting as live, even if it is never polled again.
//!
//! ```text
//!   base                                  base + len
//!    │                                       │
//!    ▼                                       ▼
//!   [ i4 | i5 | i6 | i7 | i8 ]  ◀── push(i9)
//!      ▲         ▲            ▲
//!      L1        L2           L3 (joined after i8, waiting)
//! ```

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::signal::Signal;

struct Cursor {
    position: u64,
    signal: Signal,
}

struct State<T> {
    items: VecDeque<T>,
    /// Absolute position of `items[0]`
    base: u64,
    cursors: HashMap<u64, Cursor>,
    next_listener: u64,
    waiting: usize,
}

impl<T> State<T> {
    fn tail(&self) -> u64 {
        self.base + self.items.len() as u64
    }

    /// Forget cancelled listeners, then drop items every live one has seen
    fn prune(&mut self) {
        self.cursors.retain(|_, cursor| !cursor.signal.is_cancelled());
        let floor = self
            .cursors
            .values()
            .map(|cursor| cursor.position)
            .min()
            .unwrap_or_else(|| self.tail());
        while self.base < floor && !self.items.is_empty() {
            self.items.pop_front();
            self.base += 1;
        }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Append-only queue where every listener observes every item
///
/// Cloning yields another handle to the same queue.
pub struct BroadcastQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BroadcastQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> BroadcastQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    base: 0,
                    cursors: HashMap::new(),
                    next_listener: 0,
                    waiting: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Append items
    ///
    /// Returns whether a listener blocked in `next()` was woken.
    pub fn push<I>(&self, items: I) -> bool
    where
        I: IntoIterator<Item = T>,
    {
        let woke = {
            let mut state = self.shared.state.lock();
            state.items.extend(items);
            state.prune();
            state.waiting > 0
        };
        self.shared.notify.notify_waiters();
        woke
    }

    /// Append a single item
    pub fn push_one(&self, item: T) -> bool {
        self.push(std::iter::once(item))
    }

    /// Join at the current tail, bound to `signal`
    ///
    /// The listener only sees items pushed after this call.
    #[must_use]
    pub fn join(&self, signal: &Signal) -> QueueListener<T> {
        let (id, position) = {
            let mut state = self.shared.state.lock();
            let id = state.next_listener;
            state.next_listener += 1;
            let position = state.tail();
            state.cursors.insert(
                id,
                Cursor {
                    position,
                    signal: signal.clone(),
                },
            );
            (id, position)
        };
        QueueListener {
            shared: Arc::clone(&self.shared),
            signal: signal.clone(),
            id,
            position,
            attached: true,
        }
    }

    /// Number of items still buffered for some live listener
    #[must_use]
    pub fn buffered(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.prune();
        state.items.len()
    }

    /// Number of live listeners
    #[must_use]
    pub fn listeners(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.prune();
        state.cursors.len()
    }
}

impl<T: Clone> Default for BroadcastQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BroadcastQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BroadcastQueue")
            .field("base", &state.base)
            .field("buffered", &state.items.len())
            .field("listeners", &state.cursors.len())
            .finish()
    }
}

/// Independent read cursor into a [`BroadcastQueue`]
///
/// Inert forever once its signal is cancelled.
pub struct QueueListener<T> {
    shared: Arc<Shared<T>>,
    signal: Signal,
    id: u64,
    position: u64,
    attached: bool,
}

impl<T: Clone> QueueListener<T> {
    /// Wait for and take the next unseen item
    ///
    /// Returns `None` once the listener's signal is cancelled. Cancel-safe:
    /// an item is only consumed when it is returned.
    pub async fn next(&mut self) -> Option<T> {
        let shared = Arc::clone(&self.shared);
        loop {
            if self.signal.is_cancelled() {
                self.detach();
                return None;
            }

            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_next() {
                return Some(item);
            }

            let _waiting = WaitingGuard::new(&shared);
            tokio::select! {
                () = &mut notified => {}
                () = self.signal.cancelled() => {}
            }
        }
    }

    /// Take the next unseen item without waiting
    pub fn try_next(&mut self) -> Option<T> {
        if self.signal.is_cancelled() {
            self.detach();
            return None;
        }
        let mut state = self.shared.state.lock();
        let index = usize::try_from(self.position.checked_sub(state.base)?).ok()?;
        let item = state.items.get(index)?.clone();
        self.position += 1;
        if let Some(cursor) = state.cursors.get_mut(&self.id) {
            cursor.position = self.position;
        }
        state.prune();
        Some(item)
    }

    /// Look at the next unseen item without consuming it
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        if self.signal.is_cancelled() {
            return None;
        }
        let state = self.shared.state.lock();
        let index = usize::try_from(self.position.checked_sub(state.base)?).ok()?;
        state.items.get(index).cloned()
    }

    /// Wait for at least one item, then drain everything available
    ///
    /// Returns an empty vec only when the listener is cancelled.
    pub async fn batch(&mut self) -> Vec<T> {
        let Some(first) = self.next().await else {
            return Vec::new();
        };
        let mut items = vec![first];
        while let Some(item) = self.try_next() {
            items.push(item);
        }
        items
    }

    /// The signal bounding this listener
    #[must_use]
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        let mut state = self.shared.state.lock();
        state.cursors.remove(&self.id);
        state.prune();
    }
}

impl<T> Drop for QueueListener<T> {
    fn drop(&mut self) {
        if self.attached {
            let mut state = self.shared.state.lock();
            state.cursors.remove(&self.id);
            state.prune();
        }
    }
}

impl<T> std::fmt::Debug for QueueListener<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueListener")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("cancelled", &self.signal.is_cancelled())
            .finish()
    }
}

struct WaitingGuard<'a, T> {
    shared: &'a Shared<T>,
}

impl<'a, T> WaitingGuard<'a, T> {
    fn new(shared: &'a Shared<T>) -> Self {
        shared.state.lock().waiting += 1;
        Self { shared }
    }
}

impl<T> Drop for WaitingGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

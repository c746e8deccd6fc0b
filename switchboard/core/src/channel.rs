//! Channel & Select
//!
//! [`Channel`] is an unbounded FIFO with pull semantics: consumers first wait
//! until something is pending, then take it synchronously with
//! [`Channel::next`]. This split is what lets [`select`] race many channels and
//! still consume from exactly one of them.
//!
//! # Waiter release
//!
//! Waiters registered with [`Channel::wait`] are released one at a time, with a
//! scheduler yield between releases. The first waiter to wake therefore gets to
//! call `next()` before the second one is even woken:
//!
//! ```text
//!   push(a) ──▶ release w1 ── yield ──▶ w1: next() == a
//!                                       │
//!   push(b) ─────────────────────────── release w2 ── yield ──▶ w2: next() == b
//! ```
//!
//! Waiters whose futures were dropped (the losing arms of a `select`) are
//! skipped without a yield, so a wakeup is never lost on them.
//!
//! # Closing
//!
//! [`Channel::close`] appends a terminal value. Once it reaches the head of the
//! queue, `next()` keeps returning it and [`Channel::is_closed`] turns true.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{select_all, FutureExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::MuxError;
use crate::signal::Signal;

enum Entry<T> {
    Value(T, Option<oneshot::Sender<()>>),
    Terminal(T),
}

struct State<T> {
    entries: VecDeque<Entry<T>>,
    waiters: VecDeque<oneshot::Sender<()>>,
    /// `close()` has been called
    closing: bool,
    /// The terminal entry has reached the head
    closed: bool,
    /// A release loop is running
    releasing: bool,
}

impl<T> State<T> {
    /// Release the first live waiter, if anything is pending
    fn release_one(&mut self) -> bool {
        while !self.entries.is_empty() {
            match self.waiters.pop_front() {
                Some(waiter) => {
                    if waiter.send(()).is_ok() {
                        return true;
                    }
                }
                None => return false,
            }
        }
        false
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// Unbounded FIFO with wait-then-pull semantics
///
/// Cloning yields another handle to the same channel.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Channel<T> {
    /// Create an empty, open channel
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: VecDeque::new(),
                    waiters: VecDeque::new(),
                    closing: false,
                    closed: false,
                    releasing: false,
                }),
            }),
        }
    }

    /// Append a value
    ///
    /// The returned [`Consumed`] resolves once this value has been taken by
    /// [`next`](Self::next). After `close()` the value is discarded and
    /// `Consumed` is already resolved.
    pub fn push(&self, value: T) -> Consumed {
        let mut state = self.shared.state.lock();
        if state.closing {
            return Consumed { rx: None };
        }
        let (tx, rx) = oneshot::channel();
        state.entries.push_back(Entry::Value(value, Some(tx)));
        self.kick(&mut state);
        Consumed { rx: Some(rx) }
    }

    /// Close the channel with a terminal value
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::ChannelClosed`] if the channel was already closed.
    pub fn close(&self, terminal: T) -> Result<(), MuxError> {
        let mut state = self.shared.state.lock();
        if state.closing {
            return Err(MuxError::ChannelClosed);
        }
        state.closing = true;
        state.entries.push_back(Entry::Terminal(terminal));
        self.kick(&mut state);
        Ok(())
    }

    /// Whether `next()` would return something right now
    #[must_use]
    pub fn pending(&self) -> bool {
        !self.shared.state.lock().entries.is_empty()
    }

    /// Whether the terminal value has been reached
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of unconsumed values, not counting the terminal one
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .filter(|entry| matches!(entry, Entry::Value(..)))
            .count()
    }

    /// Whether there are no unconsumed values
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the oldest value
    ///
    /// Returns `None` when empty. Once the terminal value is at the head it is
    /// returned on every call.
    pub fn next(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        if let Entry::Terminal(terminal) = state.entries.front()? {
            let terminal = terminal.clone();
            state.closed = true;
            return Some(terminal);
        }
        match state.entries.pop_front()? {
            Entry::Value(value, ack) => {
                if let Some(ack) = ack {
                    ack.send(()).ok();
                }
                Some(value)
            }
            Entry::Terminal(terminal) => Some(terminal),
        }
    }

    /// Resolve once something is pending
    ///
    /// The waiter is registered when this method is called, not when the
    /// future is first polled.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        self.wait_with(())
    }

    /// Like [`wait`](Self::wait), resolving with `value`
    pub fn wait_with<R: Send + 'static>(&self, value: R) -> impl Future<Output = R> + Send + 'static {
        let rx = {
            let mut state = self.shared.state.lock();
            state.waiters.retain(|waiter| !waiter.is_closed());
            if !state.entries.is_empty() && state.waiters.is_empty() && !state.releasing {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                self.kick(&mut state);
                Some(rx)
            }
        };
        async move {
            if let Some(rx) = rx {
                rx.await.ok();
            }
            value
        }
    }

    /// Start releasing waiters if values are pending and no loop is running
    fn kick(&self, state: &mut State<T>) {
        if state.releasing || !state.release_one() || state.waiters.is_empty() {
            return;
        }
        state.releasing = true;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::task::yield_now().await;
                let mut state = shared.state.lock();
                if !state.release_one() || state.waiters.is_empty() {
                    state.releasing = false;
                    return;
                }
            }
        });
    }
}

impl<T: Clone + Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Channel")
            .field("entries", &state.entries.len())
            .field("waiters", &state.waiters.len())
            .field("closing", &state.closing)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Resolves once a pushed value has been consumed
#[derive(Debug)]
#[must_use]
pub struct Consumed {
    rx: Option<oneshot::Receiver<()>>,
}

impl Future for Consumed {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.rx.as_mut() {
            None => Poll::Ready(()),
            Some(rx) => Pin::new(rx).poll(cx).map(|_| ()),
        }
    }
}

/// The winning arm of a [`select`]
#[derive(Debug, Clone)]
pub struct Selected<K, T> {
    /// Key of the arm that became ready
    pub key: K,
    /// The channel that became ready
    pub channel: Channel<T>,
    /// The value taken from it
    pub value: T,
    /// Whether `value` is the channel's terminal value
    pub closed: bool,
}

/// Take a value from whichever channel becomes ready first
///
/// Arms are swept in slice order first; if any is pending the result is
/// returned without suspending. Otherwise every arm's `wait` is raced against
/// `cancel`. Returns `Ok(None)` if `cancel` fires first.
///
/// # Errors
///
/// Returns [`MuxError::EmptySelect`] with no arms and no signal.
pub async fn select<K, T>(
    arms: &[(K, Channel<T>)],
    cancel: Option<&Signal>,
) -> Result<Option<Selected<K, T>>, MuxError>
where
    K: Clone,
    T: Clone + Send + 'static,
{
    if arms.is_empty() && cancel.is_none() {
        return Err(MuxError::EmptySelect);
    }

    loop {
        for (key, channel) in arms {
            if let Some(value) = channel.next() {
                return Ok(Some(Selected {
                    key: key.clone(),
                    channel: channel.clone(),
                    closed: channel.is_closed(),
                    value,
                }));
            }
        }

        let cancelled = cancel.map(Signal::cancelled);
        if cancel.is_some_and(Signal::is_cancelled) {
            return Ok(None);
        }

        let cancelled = async move {
            match cancelled {
                Some(fut) => fut.await,
                None => futures::future::pending().await,
            }
        };

        if arms.is_empty() {
            cancelled.await;
            return Ok(None);
        }

        let waits = arms
            .iter()
            .enumerate()
            .map(|(index, (_, channel))| channel.wait_with(index).boxed());

        tokio::select! {
            biased;
            (index, _, _) = select_all(waits) => {
                let (key, channel) = &arms[index];
                if let Some(value) = channel.next() {
                    return Ok(Some(Selected {
                        key: key.clone(),
                        channel: channel.clone(),
                        closed: channel.is_closed(),
                        value,
                    }));
                }
            }
            () = cancelled => return Ok(None),
        }
    }
}

/// Adapt a signal into a channel that is ready forever once it cancels
///
/// The channel's terminal value is the signal itself.
pub fn channel_for_cancellation(signal: &Signal) -> Channel<Signal> {
    let channel = Channel::new();
    if signal.is_cancelled() {
        channel.close(signal.clone()).ok();
        return channel;
    }

    let closer = channel.clone();
    let signal = signal.clone();
    tokio::spawn(async move {
        signal.cancelled().await;
        closer.close(signal).ok();
    });
    channel
}

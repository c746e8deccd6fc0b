//! Session Multiplexer
//!
//! The server-shaped counterpart of [`Connection`](crate::protocol::Connection):
//! a single runner task owns the processing of many concurrent logical calls.
//!
//! ```text
//!   MuxCall::send ──┐                        ┌──► MuxSession::handle ──► MuxCall::recv
//!   Multiplexer::call ─► pending tasks ─► runner
//!                                            └──► MuxSession::stop
//! ```
//!
//! The runner is started lazily when a call is open and at most one runs at a
//! time. When it exits (returns, fails or panics) every call open at that
//! moment ends with its error, or [`MuxError::RunnerStopped`] when it returned
//! `Ok`. This includes calls whose tasks it never took. Calls opened while no
//! runner is alive queue until the next one starts.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::error::MuxError;
use crate::protocol::call::{CallItem, CallStream};
use crate::signal::Signal;

/// Opaque identity of a multiplexed call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallToken(u64);

/// Work handed to the runner
#[derive(Clone, Debug)]
pub enum MuxTask<T> {
    /// A new call; `signal` is cancelled when the call ends from either side
    Open {
        /// The call
        token: CallToken,
        /// Lifetime of the call
        signal: Signal,
    },
    /// Data sent by the caller
    Data {
        /// The call
        token: CallToken,
        /// Payload
        data: T,
    },
}

impl<T> MuxTask<T> {
    /// The call this task belongs to
    #[must_use]
    pub fn token(&self) -> CallToken {
        match self {
            Self::Open { token, .. } | Self::Data { token, .. } => *token,
        }
    }
}

type Runner<In, Out> =
    Arc<dyn Fn(MuxSession<In, Out>) -> BoxFuture<'static, Result<(), MuxError>> + Send + Sync>;

struct Entry<Out> {
    inbound: Channel<CallItem<Out>>,
    signal: Signal,
}

struct State<Out> {
    calls: HashMap<CallToken, Entry<Out>>,
    runner: Option<u64>,
    generation: u64,
}

struct Shared<In, Out> {
    runner: Runner<In, Out>,
    pending: Channel<MuxTask<In>>,
    state: Mutex<State<Out>>,
    next_token: AtomicU64,
}

/// Single-runner session multiplexer
///
/// Cloning yields another handle to the same multiplexer.
pub struct Multiplexer<In, Out> {
    shared: Arc<Shared<In, Out>>,
}

impl<In, Out> Clone for Multiplexer<In, Out> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<In, Out> Multiplexer<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    /// Create a multiplexer driven by `runner`
    ///
    /// `runner` is invoked once per runner start with a fresh [`MuxSession`].
    pub fn new<F, Fut, E>(runner: F) -> Self
    where
        F: Fn(MuxSession<In, Out>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<MuxError> + 'static,
    {
        let runner: Runner<In, Out> = Arc::new(move |session| {
            let fut = runner(session);
            async move { fut.await.map_err(Into::into) }.boxed()
        });
        Self {
            shared: Arc::new(Shared {
                runner,
                pending: Channel::new(),
                state: Mutex::new(State {
                    calls: HashMap::new(),
                    runner: None,
                    generation: 0,
                }),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Open a call bound to `signal`
    ///
    /// Must be called within a tokio runtime. An already cancelled `signal`
    /// yields a call that has ended with its reason.
    pub fn call(&self, signal: &Signal) -> MuxCall<In, Out> {
        let token = CallToken(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let call_signal = signal.child();

        if let Some(reason) = signal.reason() {
            return MuxCall {
                token,
                signal: call_signal,
                stream: CallStream::failed(reason),
                shared: Arc::clone(&self.shared),
            };
        }

        let inbound = Channel::new();
        self.shared.state.lock().calls.insert(
            token,
            Entry {
                inbound: inbound.clone(),
                signal: call_signal.clone(),
            },
        );
        drop(self.shared.pending.push(MuxTask::Open {
            token,
            signal: call_signal.clone(),
        }));

        let shared = Arc::downgrade(&self.shared);
        let watched = call_signal.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            if let Some(shared) = Weak::upgrade(&shared) {
                shared.finish(token, None);
            }
        });

        self.shared.ensure_runner();
        MuxCall {
            token,
            signal: call_signal,
            stream: CallStream::new(inbound),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether the runner still has work (any call is open)
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.shared.keep_alive()
    }

    /// Whether a runner is currently alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().runner.is_some()
    }

    /// Number of open calls
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.shared.state.lock().calls.len()
    }
}

impl<In, Out> std::fmt::Debug for Multiplexer<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Multiplexer")
            .field("calls", &state.calls.len())
            .field("runner", &state.runner)
            .finish_non_exhaustive()
    }
}

impl<In, Out> Shared<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    fn keep_alive(&self) -> bool {
        !self.state.lock().calls.is_empty()
    }

    fn ensure_runner(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock();
            if state.runner.is_some() || state.calls.is_empty() {
                return;
            }
            state.generation += 1;
            state.runner = Some(state.generation);
            state.generation
        };

        debug!(generation, "Starting session runner");
        let session = MuxSession {
            shared: Arc::clone(self),
            generation,
        };
        let runner = Arc::clone(&self.runner);
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let run = AssertUnwindSafe(async move { runner(session).await });
            let error = match run.catch_unwind().await {
                Ok(Ok(())) => {
                    debug!(generation, "Session runner returned");
                    MuxError::RunnerStopped
                }
                Ok(Err(e)) => {
                    warn!(generation, error = %e, "Session runner failed");
                    e
                }
                Err(panic) => {
                    let e = MuxError::from_panic(panic.as_ref());
                    warn!(generation, error = %e, "Session runner panicked");
                    e
                }
            };
            shared.runner_exited(generation, &error);
        });
    }

    fn runner_exited(self: &Arc<Self>, generation: u64, error: &MuxError) {
        let open: Vec<CallToken> = {
            let mut state = self.state.lock();
            if state.runner != Some(generation) {
                return;
            }
            state.runner = None;
            state.calls.keys().copied().collect()
        };

        // Calls still queued belonged to this session too
        debug!(generation, calls = open.len(), "Terminating calls of exited runner");
        for token in open {
            self.finish(token, Some(error.clone()));
        }
        // Calls opened while the old runner was winding down
        self.ensure_runner();
    }

    /// End a call: its stream finishes with `error` and its signal cancels
    fn finish(&self, token: CallToken, error: Option<MuxError>) -> bool {
        let Some(entry) = self.state.lock().calls.remove(&token) else {
            return false;
        };
        trace!(?token, error = ?error, "Call finished");
        let _ = entry.inbound.close(CallItem::End(error.clone()));
        entry
            .signal
            .cancel_with(error.unwrap_or(MuxError::Cancelled));
        true
    }
}

/// The runner's view of the multiplexer
pub struct MuxSession<In, Out> {
    shared: Arc<Shared<In, Out>>,
    generation: u64,
}

impl<In, Out> Clone for MuxSession<In, Out> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            generation: self.generation,
        }
    }
}

impl<In, Out> MuxSession<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    /// Wait until a task is pending
    pub async fn wait_for_task(&self) {
        self.shared.pending.wait().await;
    }

    /// Take the next pending task without waiting
    ///
    /// Tasks of calls that already ended are skipped. A session whose runner
    /// has exited gets `None`.
    pub fn next_task(&self) -> Option<MuxTask<In>> {
        let mut state = self.shared.state.lock();
        if state.runner != Some(self.generation) {
            return None;
        }
        loop {
            let task = self.shared.pending.next()?;
            if !state.calls.contains_key(&task.token()) {
                trace!(token = ?task.token(), "Skipping task of ended call");
                continue;
            };
            return Some(task);
        }
    }

    /// Deliver data to the caller of `token`
    ///
    /// Returns `false` if the call has ended.
    pub fn handle(&self, token: CallToken, data: Out) -> bool {
        let inbound = match self.shared.state.lock().calls.get(&token) {
            Some(entry) => entry.inbound.clone(),
            None => return false,
        };
        drop(inbound.push(CallItem::Data(data)));
        true
    }

    /// End the call `token`, with `error` or cleanly
    ///
    /// Returns `false` if the call had already ended.
    pub fn stop(&self, token: CallToken, error: Option<MuxError>) -> bool {
        self.shared.finish(token, error)
    }

    /// Whether there is still work for the runner
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.shared.keep_alive()
    }
}

impl<In, Out> std::fmt::Debug for MuxSession<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Caller side of a multiplexed call
pub struct MuxCall<In, Out> {
    token: CallToken,
    signal: Signal,
    stream: CallStream<Out>,
    shared: Arc<Shared<In, Out>>,
}

impl<In, Out> MuxCall<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    /// The call's token
    #[must_use]
    pub fn token(&self) -> CallToken {
        self.token
    }

    /// Signal cancelled when the call ends
    #[must_use]
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Queue data for the runner; a no-op after the call ended
    pub fn send(&self, data: In) -> bool {
        if self.signal.is_cancelled() {
            return false;
        }
        drop(self.shared.pending.push(MuxTask::Data {
            token: self.token,
            data,
        }));
        self.shared.ensure_runner();
        true
    }

    /// Wait for the next item from the runner
    pub async fn recv(&mut self) -> Option<Result<Out, MuxError>> {
        self.stream.recv().await
    }

    /// End the call locally
    pub fn cancel(&self) {
        self.signal.cancel();
    }
}

impl<In, Out> std::fmt::Debug for MuxCall<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxCall")
            .field("token", &self.token)
            .field("ended", &self.signal.is_cancelled())
            .finish_non_exhaustive()
    }
}

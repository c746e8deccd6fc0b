//! Supervision Group
//!
//! A [`SupervisionGroup`] folds any number of member [`Signal`]s into a single
//! derived "group signal" that stays active while at least one member is.
//! Background work launched with [`SupervisionGroup::go`] is bound to the group
//! signal, and a failing task takes the whole group down with it.
//!
//! # Shutdown attempts
//!
//! When the last member leaves, the group does not cancel right away if halt
//! hooks are registered. Instead it enters a draining attempt:
//!
//! ```text
//!   Running ──last member leaves──▶ Draining { attempt, resume, outstanding }
//!      ▲                                  │                   │
//!      └──────── member added ────────────┘                   │
//!                (resume cancelled)                all hooks settled
//!                                                             ▼
//!                                                         Finished
//! ```
//!
//! A hook that sees its `resume` signal fire may abandon cleanup: the group is
//! alive again. Hooks of an abandoned attempt still run to completion, but
//! their settling no longer counts toward finishing the group.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::error::MuxError;
use crate::signal::Signal;

type Deferred = Box<dyn FnOnce(Signal) -> BoxFuture<'static, Result<(), MuxError>> + Send>;
type HaltHook = Arc<dyn Fn(Signal, Signal) -> BoxFuture<'static, Result<(), MuxError>> + Send + Sync>;

/// Where the group is in its lifecycle
#[derive(Debug)]
enum Phase {
    Running,
    Draining {
        attempt: u64,
        resume: Signal,
        outstanding: usize,
    },
    Finished,
}

struct State {
    phase: Phase,
    started: bool,
    active: usize,
    deferred: Vec<Deferred>,
    hooks: Vec<HaltHook>,
    cause: Option<MuxError>,
    attempts: u64,
}

struct Shared {
    signal: Signal,
    state: Mutex<State>,
}

/// Grouped abort lifecycle with halt/resume hooks
///
/// Cloning yields another handle to the same group.
#[derive(Clone)]
pub struct SupervisionGroup {
    shared: Arc<Shared>,
}

impl SupervisionGroup {
    /// Create an empty, unstarted group
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                signal: Signal::new(),
                state: Mutex::new(State {
                    phase: Phase::Running,
                    started: false,
                    active: 0,
                    deferred: Vec::new(),
                    hooks: Vec::new(),
                    cause: None,
                    attempts: 0,
                }),
            }),
        }
    }

    /// The group signal: cancelled once the group has finished
    #[must_use]
    pub fn signal(&self) -> Signal {
        self.shared.signal.clone()
    }

    /// Number of members whose signals are still active
    #[must_use]
    pub fn active_members(&self) -> usize {
        self.shared.state.lock().active
    }

    /// Whether the group signal has been cancelled
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.signal.is_cancelled()
    }

    /// The first error recorded by a task or hook, if any
    #[must_use]
    pub fn cause(&self) -> Option<MuxError> {
        self.shared.state.lock().cause.clone()
    }

    /// Register a member signal
    ///
    /// Returns `false` if `member` or the group is already cancelled. Adding a
    /// member while halt hooks are running aborts that shutdown attempt.
    pub fn add(&self, member: &Signal) -> bool {
        if member.is_cancelled() {
            return false;
        }
        {
            let mut state = self.shared.state.lock();
            if matches!(state.phase, Phase::Finished) || self.shared.signal.is_cancelled() {
                return false;
            }
            state.active += 1;
            if let Phase::Draining { attempt, resume, .. } =
                std::mem::replace(&mut state.phase, Phase::Running)
            {
                tracing::debug!(attempt, "member joined during halt, resuming group");
                resume.cancel();
            }
        }

        let shared = Arc::clone(&self.shared);
        let member = member.clone();
        let group = self.shared.signal.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = member.cancelled() => shared.member_left(),
                () = group.cancelled() => {}
            }
        });

        !self.shared.signal.is_cancelled()
    }

    /// Fix the group's lifetime and launch deferred tasks
    ///
    /// Idempotent. With zero members the group finishes immediately.
    pub fn start(&self) {
        let deferred = {
            let mut state = self.shared.state.lock();
            if state.started {
                return;
            }
            state.started = true;
            if state.active == 0 {
                tracing::debug!("group started with no members");
                drop(state);
                self.shared.finish();
                return;
            }
            std::mem::take(&mut state.deferred)
        };

        for task in deferred {
            self.shared.spawn_task(task);
        }
    }

    /// Run `task(group_signal)` as part of the group
    ///
    /// Tasks queued before [`start`](Self::start) wait for it. An `Err` or a
    /// panic cancels the group. Returns `false` if the group already finished.
    pub fn go<F, Fut, E>(&self, task: F) -> bool
    where
        F: FnOnce(Signal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<MuxError> + 'static,
    {
        let task: Deferred = Box::new(move |signal| {
            let fut = task(signal);
            async move { fut.await.map_err(Into::into) }.boxed()
        });

        {
            let mut state = self.shared.state.lock();
            if matches!(state.phase, Phase::Finished) || self.shared.signal.is_cancelled() {
                return false;
            }
            if !state.started {
                state.deferred.push(task);
                return true;
            }
        }

        self.shared.spawn_task(task);
        true
    }

    /// Register a halt hook `hook(group_signal, resume_signal)`
    ///
    /// Hooks run every time the last member leaves. The group only cancels
    /// once all hooks of that attempt have settled; a hook error cancels the
    /// group right away.
    pub fn halt<F, Fut, E>(&self, hook: F)
    where
        F: Fn(Signal, Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<MuxError> + 'static,
    {
        let hook: HaltHook = Arc::new(move |group, resume| {
            let fut = hook(group, resume);
            async move { fut.await.map_err(Into::into) }.boxed()
        });
        self.shared.state.lock().hooks.push(hook);
    }

    /// Start the group if needed and wait for it to finish
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by a task or halt hook.
    pub async fn wait(&self) -> Result<(), MuxError> {
        self.start();
        self.shared.signal.cancelled().await;
        match self.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }
}

impl Default for SupervisionGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SupervisionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SupervisionGroup")
            .field("phase", &state.phase)
            .field("started", &state.started)
            .field("active", &state.active)
            .field("cause", &state.cause)
            .finish()
    }
}

impl Shared {
    fn spawn_task(self: &Arc<Self>, task: Deferred) {
        let fut = task(self.signal.clone());
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => shared.fail(err),
                Err(panic) => shared.fail(MuxError::from_panic(panic.as_ref())),
            }
        });
    }

    fn member_left(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.active > 0 || !state.started || !matches!(state.phase, Phase::Running) {
            return;
        }

        if state.hooks.is_empty() {
            drop(state);
            self.finish();
            return;
        }

        state.attempts += 1;
        let attempt = state.attempts;
        let resume = Signal::new();
        let hooks = state.hooks.clone();
        state.phase = Phase::Draining {
            attempt,
            resume: resume.clone(),
            outstanding: hooks.len(),
        };
        drop(state);

        tracing::debug!(attempt, hooks = hooks.len(), "last member left, running halt hooks");
        for hook in hooks {
            let fut = hook(self.signal.clone(), resume.clone());
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => shared.fail(err),
                    Err(panic) => shared.fail(MuxError::from_panic(panic.as_ref())),
                }
                shared.hook_settled(attempt);
            });
        }
    }

    fn hook_settled(&self, settled: u64) {
        let mut state = self.state.lock();
        let Phase::Draining {
            attempt,
            outstanding,
            ..
        } = &mut state.phase
        else {
            return;
        };
        if *attempt != settled {
            return;
        }
        *outstanding -= 1;
        if *outstanding == 0 {
            drop(state);
            self.finish();
        }
    }

    fn fail(&self, err: MuxError) {
        {
            let mut state = self.state.lock();
            if state.cause.is_none() {
                tracing::warn!(error = %err, "supervised task failed, cancelling group");
                state.cause = Some(err.clone());
            }
            state.phase = Phase::Finished;
        }
        self.signal.cancel_with(err);
    }

    fn finish(&self) {
        let cause = {
            let mut state = self.state.lock();
            state.phase = Phase::Finished;
            state.cause.clone()
        };
        if self.signal.cancel_with(cause.unwrap_or(MuxError::Cancelled)) {
            tracing::debug!("group finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::{mpsc, Notify};

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_without_members_finishes_immediately() {
        let group = SupervisionGroup::new();
        group.start();
        assert!(group.is_finished());
        assert!(group.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_add_rejects_cancelled_member() {
        let group = SupervisionGroup::new();
        let member = Signal::cancelled_with(MuxError::Cancelled);
        assert!(!group.add(&member));
        assert_eq!(group.active_members(), 0);
    }

    #[tokio::test]
    async fn test_add_after_finish_is_rejected() {
        let group = SupervisionGroup::new();
        group.start();
        assert!(!group.add(&Signal::new()));
        assert!(!group.go(|_signal| async { Ok::<(), MuxError>(()) }));
    }

    #[tokio::test]
    async fn test_deferred_tasks_wait_for_start() {
        let group = SupervisionGroup::new();
        let member = Signal::new();
        assert!(group.add(&member));

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        assert!(group.go(move |signal| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            signal.cancelled().await;
            Ok::<(), MuxError>(())
        }));

        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        group.start();
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        member.cancel();
        tokio::time::timeout(Duration::from_secs(1), group.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_group_cancels_when_last_member_leaves() {
        let group = SupervisionGroup::new();
        let a = Signal::new();
        let b = Signal::new();
        group.add(&a);
        group.add(&b);
        group.start();

        a.cancel();
        settle().await;
        assert!(!group.is_finished());
        assert_eq!(group.active_members(), 1);

        b.cancel();
        settle().await;
        assert!(group.is_finished());
    }

    #[tokio::test]
    async fn test_task_error_becomes_cause_first_wins() {
        let group = SupervisionGroup::new();
        let member = Signal::new();
        group.add(&member);
        group.start();

        group.go(|_signal| async { Err::<(), _>(anyhow::anyhow!("first")) });
        settle().await;
        group.go(|_signal| async { Err::<(), _>(MuxError::Task("second".into())) });
        settle().await;

        let err = group.wait().await.unwrap_err();
        assert_eq!(err, MuxError::Task("first".into()));
        assert_eq!(group.signal().reason(), Some(MuxError::Task("first".into())));
    }

    #[tokio::test]
    async fn test_task_panic_cancels_group() {
        let group = SupervisionGroup::new();
        group.add(&Signal::new());
        group.start();

        group.go(|_signal| async {
            if true {
                panic!("worker exploded");
            }
            Ok::<(), MuxError>(())
        });

        let err = tokio::time::timeout(Duration::from_secs(1), group.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, MuxError::TaskPanicked("worker exploded".into()));
    }

    #[tokio::test]
    async fn test_halt_then_resume_then_finalize() {
        let group = SupervisionGroup::new();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<u32>();
        let (resumed_tx, mut resumed_rx) = mpsc::unbounded_channel::<()>();
        let release = Arc::new(Notify::new());

        let calls = Arc::new(AtomicUsize::new(0));
        {
            let release = Arc::clone(&release);
            let calls = Arc::clone(&calls);
            group.halt(move |_group, resume| {
                let started_tx = started_tx.clone();
                let resumed_tx = resumed_tx.clone();
                let release = Arc::clone(&release);
                let n = calls.fetch_add(1, Ordering::SeqCst) as u32;
                async move {
                    started_tx.send(n).ok();
                    tokio::select! {
                        () = resume.cancelled() => { resumed_tx.send(()).ok(); }
                        () = release.notified() => {}
                    }
                    Ok::<(), MuxError>(())
                }
            });
        }

        let first = Signal::new();
        group.add(&first);
        group.start();

        first.cancel();
        assert_eq!(started_rx.recv().await, Some(0));
        assert!(!group.is_finished());

        // A new member arrives before the hook settles
        let second = Signal::new();
        assert!(group.add(&second));
        resumed_rx.recv().await.unwrap();
        settle().await;
        assert!(!group.is_finished());

        // Last member leaves again, hook settles without interruption
        second.cancel();
        assert_eq!(started_rx.recv().await, Some(1));
        assert!(!group.is_finished());

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(1), group.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(group.signal().reason(), Some(MuxError::Cancelled));
    }

    #[tokio::test]
    async fn test_halt_hook_error_cancels_group() {
        let group = SupervisionGroup::new();
        group.halt(|_group, _resume| async { Err::<(), _>(anyhow::anyhow!("flush failed")) });

        let member = Signal::new();
        group.add(&member);
        group.start();
        member.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), group.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, MuxError::Task("flush failed".into()));
    }
}

//! Cancellation Signal
//!
//! [`Signal`] is the cancellation token every component in this crate accepts
//! to bound its lifetime. It wraps a `tokio_util` [`CancellationToken`] and adds
//! a reason: the first [`MuxError`] passed to [`Signal::cancel_with`] is kept
//! forever and can be read by every holder of the signal.
//!
//! Signals form a tree. A child created with [`Signal::child`] is cancelled
//! when its parent is, and inherits the parent's reason in that case.
//! [`Signal::link`] covers the other direction: deriving a signal from a
//! second, unrelated parent.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::MuxError;

struct Inner {
    token: CancellationToken,
    reason: Mutex<Option<MuxError>>,
    parent: Option<Signal>,
}

/// Cloneable cancellation handle carrying a reason
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

impl Signal {
    /// Create a new, active root signal
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                reason: Mutex::new(None),
                parent: None,
            }),
        }
    }

    /// Create a signal that is already cancelled with `reason`
    #[must_use]
    pub fn cancelled_with(reason: MuxError) -> Self {
        let signal = Self::new();
        signal.cancel_with(reason);
        signal
    }

    /// Derive a child signal, cancelled whenever `self` is
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                reason: Mutex::new(None),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel with the plain [`MuxError::Cancelled`] reason
    pub fn cancel(&self) -> bool {
        self.cancel_with(MuxError::Cancelled)
    }

    /// Cancel with `reason`
    ///
    /// Returns `false` if the signal was already cancelled, in which case the
    /// earlier reason is kept.
    pub fn cancel_with(&self, reason: MuxError) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if self.inner.token.is_cancelled() || slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.inner.token.cancel();
        true
    }

    /// Whether the signal (or an ancestor) has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The cancellation reason, `None` while active
    #[must_use]
    pub fn reason(&self) -> Option<MuxError> {
        if !self.is_cancelled() {
            return None;
        }
        if let Some(reason) = self.inner.reason.lock().clone() {
            return Some(reason);
        }
        match &self.inner.parent {
            Some(parent) => parent.reason(),
            None => Some(MuxError::Cancelled),
        }
    }

    /// Resolve once the signal is cancelled
    ///
    /// The returned future owns its handle, so it can be moved into spawned
    /// tasks or stored next to the signal.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.inner.token.clone();
        async move { token.cancelled().await }
    }

    /// Cancel `self` (with the same reason) when `other` is cancelled
    ///
    /// The link is one-way and stops being watched once `self` is cancelled.
    /// Must be called from within a tokio runtime unless `other` is already
    /// cancelled.
    pub fn link(&self, other: &Signal) {
        if let Some(reason) = other.reason() {
            self.cancel_with(reason);
            return;
        }
        if self.is_cancelled() {
            return;
        }
        let this = self.clone();
        let other = other.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = other.cancelled() => {
                    this.cancel_with(other.reason().unwrap_or(MuxError::Cancelled));
                }
                () = this.cancelled() => {}
            }
        });
    }

    /// Whether two handles refer to the same signal
    #[must_use]
    pub fn ptr_eq(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let signal = Signal::new();
        assert!(signal.reason().is_none());

        assert!(signal.cancel_with(MuxError::TransportClosed));
        assert!(!signal.cancel_with(MuxError::RunnerStopped));
        assert!(!signal.cancel());

        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), Some(MuxError::TransportClosed));
    }

    #[test]
    fn test_child_inherits_parent_reason() {
        let parent = Signal::new();
        let child = parent.child();

        parent.cancel_with(MuxError::Handshake("nope".into()));

        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some(MuxError::Handshake("nope".into())));
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent() {
        let parent = Signal::new();
        let child = parent.child();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_cancelled_with_is_precancelled() {
        let signal = Signal::cancelled_with(MuxError::RunnerStopped);
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), Some(MuxError::RunnerStopped));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let signal = Signal::new();
        let waiter = tokio::spawn(signal.cancelled());

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_link_propagates_reason() {
        let a = Signal::new();
        let b = Signal::new();
        b.link(&a);

        a.cancel_with(MuxError::TransportClosed);
        tokio::time::timeout(Duration::from_secs(1), b.cancelled())
            .await
            .unwrap();

        assert_eq!(b.reason(), Some(MuxError::TransportClosed));
    }

    #[tokio::test]
    async fn test_link_to_cancelled_signal_is_immediate() {
        let a = Signal::cancelled_with(MuxError::RunnerStopped);
        let b = Signal::new();
        b.link(&a);
        assert_eq!(b.reason(), Some(MuxError::RunnerStopped));
    }
}

//! Per-call handles
//!
//! A [`Call`] pairs a [`CallSender`] (outbound data, fire and forget) with a
//! [`CallStream`] (inbound data, ending with `None` or one error).

use std::sync::Arc;

use futures::Stream;
use serde_json::Value;

use super::connection::Shared;
use super::wire::CallId;
use crate::channel::Channel;
use crate::error::MuxError;
use crate::signal::Signal;

/// Inbound channel entry
#[derive(Clone, Debug)]
pub(crate) enum CallItem<T> {
    Data(T),
    /// Terminal entry: `None` for a clean end
    End(Option<MuxError>),
}

/// Inbound half of a call
///
/// Yields data in arrival order, then either `None` (clean end) or a single
/// `Some(Err(_))` followed by `None`.
pub struct CallStream<T> {
    channel: Channel<CallItem<T>>,
    done: bool,
}

impl<T: Clone + Send + 'static> CallStream<T> {
    pub(crate) fn new(channel: Channel<CallItem<T>>) -> Self {
        Self {
            channel,
            done: false,
        }
    }

    /// A stream that has already ended with `error`
    pub(crate) fn failed(error: MuxError) -> Self {
        let channel = Channel::new();
        let _ = channel.close(CallItem::End(Some(error)));
        Self::new(channel)
    }

    /// Wait for the next item
    pub async fn recv(&mut self) -> Option<Result<T, MuxError>> {
        loop {
            if let Some(item) = self.try_recv_inner() {
                return item;
            }
            self.channel.wait().await;
        }
    }

    /// Take the next item without waiting
    ///
    /// `None` means nothing is buffered or the stream has ended; use
    /// [`is_finished`](Self::is_finished) to tell them apart.
    pub fn try_recv(&mut self) -> Option<Result<T, MuxError>> {
        self.try_recv_inner().flatten()
    }

    /// Whether the stream has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.done || self.channel.is_closed()
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<T, MuxError>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|item| (item, stream))
        })
    }

    /// `Some(item)` when the outcome is decided, `None` when it must wait
    fn try_recv_inner(&mut self) -> Option<Option<Result<T, MuxError>>> {
        if self.done {
            return Some(None);
        }
        match self.channel.next()? {
            CallItem::Data(value) => Some(Some(Ok(value))),
            CallItem::End(end) => {
                self.done = true;
                Some(end.map(Err))
            }
        }
    }
}

impl<T> std::fmt::Debug for CallStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Outbound half of a call
#[derive(Clone)]
pub struct CallSender {
    id: CallId,
    signal: Signal,
    shared: Arc<Shared>,
}

impl CallSender {
    pub(crate) fn new(id: CallId, signal: Signal, shared: Arc<Shared>) -> Self {
        Self { id, signal, shared }
    }

    /// Queue a data frame
    ///
    /// A no-op once the call has ended; returns whether the frame was queued.
    pub fn send(&self, value: Value) -> bool {
        if self.signal.is_cancelled() {
            return false;
        }
        self.shared.send_data(self.id, value);
        true
    }

    /// The call's id
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }
}

impl std::fmt::Debug for CallSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSender")
            .field("id", &self.id)
            .field("ended", &self.signal.is_cancelled())
            .finish()
    }
}

/// One logical call on a connection
#[derive(Debug)]
pub struct Call {
    sender: CallSender,
    stream: CallStream<Value>,
    signal: Signal,
}

impl Call {
    pub(crate) fn new(sender: CallSender, stream: CallStream<Value>, signal: Signal) -> Self {
        Self {
            sender,
            stream,
            signal,
        }
    }

    /// The call's id, unique within its connection
    #[must_use]
    pub fn id(&self) -> CallId {
        self.sender.id
    }

    /// Signal cancelled when the call ends, from either side
    #[must_use]
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Queue a data frame; a no-op after the call ended
    pub fn send(&self, value: Value) -> bool {
        self.sender.send(value)
    }

    /// Wait for the next inbound item
    pub async fn recv(&mut self) -> Option<Result<Value, MuxError>> {
        self.stream.recv().await
    }

    /// End the call locally; the peer receives a stop frame
    pub fn cancel(&self) {
        self.signal.cancel();
    }

    /// A clonable sender for this call
    #[must_use]
    pub fn sender(&self) -> CallSender {
        self.sender.clone()
    }

    /// Split into independently owned halves
    #[must_use]
    pub fn split(self) -> (CallSender, CallStream<Value>) {
        (self.sender, self.stream)
    }
}

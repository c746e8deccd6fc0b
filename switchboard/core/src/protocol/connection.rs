//! Client Connection
//!
//! A [`Connection`] multiplexes any number of [`Call`]s over one transport.
//!
//! # Lifecycle
//!
//! ```text
//!   connect ──► handshake ──► active ──────────────► torn down
//!                   │           │ inbound loop  ┐       ▲
//!                   │           │ outbound loop ┘ group │
//!                   ▼           └───────────────────────┘
//!              Err(Handshake)     transport closed / error,
//!                                 loop failure, signal cancelled
//! ```
//!
//! Both loops run inside a [`SupervisionGroup`] whose only member is the
//! connection signal. Whatever ends the connection, the group finishes, the
//! connection signal is cancelled with the cause, every call stream ends and
//! the transport is closed. No stop frames are sent during teardown.
//!
//! # Outbound ordering
//!
//! Call starts and data frames leave strictly in the order they were queued,
//! gated by the call and packet limiters. Stop frames travel on a separate
//! channel and are written as soon as they appear, even while the queue is
//! waiting for a token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::call::{Call, CallItem, CallSender, CallStream};
use super::routing::{InboundAction, InboundRoute, OutboundRoute};
use super::wire::{version_frame, CallId, Frame, Hello};
use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::error::MuxError;
use crate::group::SupervisionGroup;
use crate::limit::RateLimiter;
use crate::queue::{BroadcastQueue, QueueListener};
use crate::signal::Signal;
use crate::transport::{Connector, ReadyState, Transport, TransportEvent};

/// Queued outbound work, drained in order by the outbound loop
#[derive(Clone, Debug)]
pub(crate) enum Outbound {
    /// Announce a new call (consumes a call token)
    Start(CallId),
    /// Data for a call (consumes a packet token)
    Data(CallId, Value),
}

/// Priority notice for the outbound loop
#[derive(Clone, Copy, Debug)]
pub(crate) struct StopFrame {
    id: CallId,
    /// `false` when the peer ended the call and only local state needs clearing
    notify_peer: bool,
}

struct CallEntry {
    inbound: Channel<CallItem<Value>>,
    signal: Signal,
}

pub(crate) struct Shared {
    hello: Hello,
    call_limiter: RateLimiter,
    packet_limiter: RateLimiter,
    next_id: AtomicU64,
    calls: DashMap<CallId, CallEntry>,
    outbound: BroadcastQueue<Outbound>,
    stops: Channel<StopFrame>,
    signal: Signal,
    transport: Arc<dyn Transport>,
    /// Cancelled once teardown has finished
    closed: Signal,
}

/// Open a transport through `connector` and perform the handshake
///
/// `signal` bounds the attempt and the resulting connection: the connection
/// signal is a child of it.
///
/// # Errors
///
/// - the transport error if the connector fails
/// - [`MuxError::Handshake`] if the peer closes, errors, times out or sends a bad hello
/// - the signal's reason if it is cancelled first
pub async fn connect(
    connector: &dyn Connector,
    signal: &Signal,
    config: &ClientConfig,
) -> Result<Connection, MuxError> {
    if let Some(reason) = signal.reason() {
        return Err(reason);
    }

    let transport = tokio::select! {
        biased;
        () = signal.cancelled() => return Err(signal.reason().unwrap_or(MuxError::Cancelled)),
        result = connector.connect() => result.map_err(|e| {
            warn!(error = %e, "Failed to open transport");
            MuxError::from(e)
        })?,
    };

    Connection::handshake(transport, signal, config).await
}

/// Handle to an established connection
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Perform the handshake over an already open transport
    ///
    /// The transport is closed if the handshake fails.
    pub async fn handshake(
        transport: Arc<dyn Transport>,
        signal: &Signal,
        config: &ClientConfig,
    ) -> Result<Self, MuxError> {
        let result = match exchange_hello(transport.as_ref(), signal, config.handshake_timeout())
            .await
        {
            Ok(hello) => Self::establish(Arc::clone(&transport), hello, signal, config),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(error = %e, "Handshake failed");
            transport.close().await;
        }
        result
    }

    fn establish(
        transport: Arc<dyn Transport>,
        hello: Hello,
        signal: &Signal,
        config: &ClientConfig,
    ) -> Result<Self, MuxError> {
        let call_limiter = RateLimiter::new(hello.limits.calls.unwrap_or(config.call_limit))?;
        let packet_limiter =
            RateLimiter::new(hello.limits.packets.unwrap_or(config.packet_limit))?;

        let conn_signal = signal.child();
        let outbound = BroadcastQueue::new();
        // Joined before any call can be queued, so nothing is missed
        let listener = outbound.join(&conn_signal);

        let shared = Arc::new(Shared {
            hello,
            call_limiter,
            packet_limiter,
            next_id: AtomicU64::new(1),
            calls: DashMap::new(),
            outbound,
            stops: Channel::new(),
            signal: conn_signal.clone(),
            transport,
            closed: Signal::new(),
        });

        let group = SupervisionGroup::new();
        group.add(&conn_signal);
        conn_signal.link(&group.signal());

        let inbound = Arc::clone(&shared);
        group.go(move |group_signal| inbound_loop(inbound, group_signal));

        let outbound = OutboundLoop {
            shared: Arc::clone(&shared),
            listener,
            route: OutboundRoute::default(),
        };
        group.go(move |group_signal| outbound.run(group_signal));
        group.start();

        let teardown = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = group.wait().await {
                warn!(error = %e, "Connection loop failed");
            }
            teardown.teardown().await;
        });

        info!(
            call_rate = shared.call_limiter.config().rate,
            packet_rate = shared.packet_limiter.config().rate,
            "Connected"
        );
        Ok(Self { shared })
    }

    /// Open a new call bound to `signal`
    ///
    /// Cancelling `signal` (or [`Call::cancel`]) ends the call locally and
    /// sends a stop frame. If `signal` is already cancelled, or the connection
    /// is gone, the returned call has already ended with that reason.
    pub fn call(&self, signal: &Signal) -> Call {
        self.shared.open_call(signal)
    }

    /// The init payload from the server's hello
    #[must_use]
    pub fn hello(&self) -> &Value {
        &self.shared.hello.init
    }

    /// The connection signal, cancelled when the connection ends
    #[must_use]
    pub fn signal(&self) -> Signal {
        self.shared.signal.clone()
    }

    /// Number of calls currently open
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.shared.calls.len()
    }

    /// Whether the connection has ended (teardown may still be running)
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.signal.is_cancelled()
    }

    /// State of the underlying transport
    #[must_use]
    pub fn transport_state(&self) -> ReadyState {
        self.shared.transport.state()
    }

    /// Limiter gating call starts
    #[must_use]
    pub fn call_limiter(&self) -> &RateLimiter {
        &self.shared.call_limiter
    }

    /// Limiter gating data frames
    #[must_use]
    pub fn packet_limiter(&self) -> &RateLimiter {
        &self.shared.packet_limiter
    }

    /// End the connection
    pub fn close(&self) {
        self.shared.signal.cancel_with(MuxError::ConnectionClosed);
    }

    /// Wait until teardown has finished, returning why the connection ended
    pub async fn closed(&self) -> MuxError {
        self.shared.closed.cancelled().await;
        self.shared
            .closed
            .reason()
            .unwrap_or(MuxError::ConnectionClosed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("active_calls", &self.shared.calls.len())
            .field("closed", &self.shared.signal.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn exchange_hello(
    transport: &dyn Transport,
    signal: &Signal,
    timeout: Duration,
) -> Result<Hello, MuxError> {
    transport
        .send(version_frame())
        .await
        .map_err(|e| MuxError::Handshake(format!("failed to send version: {e}")))?;

    let first = async {
        tokio::select! {
            biased;
            () = signal.cancelled() => None,
            event = transport.recv() => Some(event),
        }
    };
    let event = match tokio::time::timeout(timeout, first).await {
        Ok(Some(event)) => event,
        Ok(None) => return Err(signal.reason().unwrap_or(MuxError::Cancelled)),
        Err(_) => return Err(MuxError::Handshake("timed out waiting for hello".into())),
    };

    match event {
        TransportEvent::Message(text) => Hello::parse(&text),
        TransportEvent::Closed => Err(MuxError::Handshake("transport closed before hello".into())),
        TransportEvent::Error(e) => Err(MuxError::Handshake(format!(
            "transport error before hello: {e}"
        ))),
    }
}

impl Shared {
    fn open_call(self: &Arc<Self>, signal: &Signal) -> Call {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let call_signal = self.signal.child();
        let sender = CallSender::new(id, call_signal.clone(), Arc::clone(self));

        if let Some(reason) = signal.reason() {
            call_signal.cancel_with(reason.clone());
            return Call::new(sender, CallStream::failed(reason), call_signal);
        }
        if self.signal.is_cancelled() {
            return Call::new(
                sender,
                CallStream::failed(MuxError::ConnectionClosed),
                call_signal,
            );
        }

        let inbound = Channel::new();
        self.calls.insert(
            id,
            CallEntry {
                inbound: inbound.clone(),
                signal: call_signal.clone(),
            },
        );
        call_signal.link(signal);
        self.outbound.push_one(Outbound::Start(id));

        let shared = Arc::clone(self);
        let watched = call_signal.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            shared.end_call(id);
        });

        debug!(call_id = id, "Call opened");
        Call::new(sender, CallStream::new(inbound), call_signal)
    }

    pub(crate) fn send_data(&self, id: CallId, value: Value) {
        self.outbound.push_one(Outbound::Data(id, value));
    }

    fn is_active(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    /// Local end of a call: its signal was cancelled
    fn end_call(&self, id: CallId) {
        let Some((_, entry)) = self.calls.remove(&id) else {
            return;
        };
        let _ = entry.inbound.close(CallItem::End(None));
        if self.signal.is_cancelled() {
            return;
        }
        debug!(call_id = id, "Call cancelled locally");
        drop(self.stops.push(StopFrame {
            id,
            notify_peer: true,
        }));
    }

    /// Remote end of a call: a stop control frame arrived
    fn remote_stop(&self, id: CallId, reason: String) {
        let Some((_, entry)) = self.calls.remove(&id) else {
            debug!(call_id = id, "Stop for unknown call");
            return;
        };
        debug!(call_id = id, reason = %reason, "Call stopped by peer");
        let error = MuxError::RemoteCall { reason };
        let _ = entry.inbound.close(CallItem::End(Some(error.clone())));
        entry.signal.cancel_with(error);
        drop(self.stops.push(StopFrame {
            id,
            notify_peer: false,
        }));
    }

    fn dispatch(&self, route: &mut InboundRoute, text: &str) {
        match Frame::decode(text) {
            Ok(Frame::Control(frame)) => match route.apply(frame) {
                InboundAction::Routed => trace!(call_id = ?route.current(), "Inbound call switched"),
                InboundAction::Stop { id, reason } => self.remote_stop(id, reason),
                InboundAction::Orphan => warn!("Dropping stop frame with no current call"),
            },
            Ok(Frame::Data(value)) => {
                let inbound = route
                    .current()
                    .and_then(|id| self.calls.get(&id).map(|entry| entry.inbound.clone()));
                match inbound {
                    Some(inbound) => {
                        drop(inbound.push(CallItem::Data(value)));
                    }
                    None => trace!(call_id = ?route.current(), "Dropping unroutable data frame"),
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }

    async fn teardown(&self) {
        let reason = self.signal.reason().unwrap_or(MuxError::ConnectionClosed);

        let ids: Vec<CallId> = self.calls.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.calls.remove(&id) {
                let _ = entry.inbound.close(CallItem::End(None));
            }
        }

        self.transport.close().await;
        info!(reason = %reason, "Disconnected");
        self.closed.cancel_with(reason);
    }

    async fn write(&self, text: String) -> Result<(), MuxError> {
        trace!(frame = %text, "Sending frame");
        self.transport.send(text).await.map_err(MuxError::from)
    }
}

async fn inbound_loop(shared: Arc<Shared>, signal: Signal) -> Result<(), MuxError> {
    let mut route = InboundRoute::default();
    loop {
        let event = tokio::select! {
            biased;
            () = signal.cancelled() => return Ok(()),
            event = shared.transport.recv() => event,
        };
        match event {
            TransportEvent::Message(text) => shared.dispatch(&mut route, &text),
            TransportEvent::Closed => {
                debug!("Transport closed by peer");
                return Err(MuxError::TransportClosed);
            }
            TransportEvent::Error(e) => return Err(MuxError::Transport(e)),
        }
    }
}

#[derive(Clone, Copy)]
enum Limiter {
    Calls,
    Packets,
}

struct OutboundLoop {
    shared: Arc<Shared>,
    listener: QueueListener<Outbound>,
    route: OutboundRoute,
}

impl OutboundLoop {
    async fn run(mut self, signal: Signal) -> Result<(), MuxError> {
        loop {
            self.flush_stops().await?;

            let stop_ready = self.shared.stops.wait();
            let frame = tokio::select! {
                biased;
                () = signal.cancelled() => return Ok(()),
                () = stop_ready => continue,
                frame = self.listener.next() => match frame {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
            };

            self.process(frame, &signal).await?;
        }
    }

    async fn process(&mut self, frame: Outbound, signal: &Signal) -> Result<(), MuxError> {
        match frame {
            Outbound::Start(id) => {
                if !self.admit(id, Limiter::Calls, signal).await? {
                    return Ok(());
                }
                let control = self.route.start(id);
                self.shared.write(control.encode()).await
            }
            Outbound::Data(id, value) => {
                if !self.admit(id, Limiter::Packets, signal).await? {
                    return Ok(());
                }
                if let Some(control) = self.route.switch_to(id) {
                    self.shared.write(control.encode()).await?;
                }
                self.shared.write(value.to_string()).await
            }
        }
    }

    /// Take a token for a frame of call `id`
    ///
    /// `false` when the call ended (before or while waiting) or the loop is
    /// shutting down. Stop frames are flushed while waiting.
    async fn admit(
        &mut self,
        id: CallId,
        limiter: Limiter,
        signal: &Signal,
    ) -> Result<bool, MuxError> {
        if !self.shared.is_active(id) {
            trace!(call_id = id, "Skipping frame of ended call");
            return Ok(false);
        }

        let shared = Arc::clone(&self.shared);
        let limiter = match limiter {
            Limiter::Calls => &shared.call_limiter,
            Limiter::Packets => &shared.packet_limiter,
        };

        loop {
            let stop_ready = shared.stops.wait();
            let admitted = tokio::select! {
                biased;
                () = stop_ready => None,
                admitted = limiter.acquire(signal) => Some(admitted),
            };
            match admitted {
                None => self.flush_stops().await?,
                Some(admitted) => return Ok(admitted && self.shared.is_active(id)),
            }
        }
    }

    async fn flush_stops(&mut self) -> Result<(), MuxError> {
        while let Some(stop) = self.shared.stops.next() {
            if !stop.notify_peer {
                self.route.forget(stop.id);
                continue;
            }
            if let Some(control) = self.route.stop(stop.id) {
                debug!(call_id = stop.id, "Sending stop");
                self.shared.write(control.encode()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const HELLO: &str = r#"{"ok":true,"i":{"name":"test"},"l":{"c":{"b":100,"r":100},"p":{"b":1000,"r":1000}}}"#;

    async fn expect_message(peer: &InProcessTransport) -> String {
        match tokio::time::timeout(Duration::from_secs(1), peer.recv()).await {
            Ok(TransportEvent::Message(text)) => text,
            other => panic!("expected message, got {other:?}"),
        }
    }

    async fn connected() -> (Connection, InProcessTransport, Signal) {
        let (client, server) = InProcessTransport::new_pair();
        let signal = Signal::new();

        let handshake = tokio::spawn({
            let signal = signal.clone();
            async move {
                Connection::handshake(Arc::new(client), &signal, &ClientConfig::default()).await
            }
        });

        assert_eq!(expect_message(&server).await, r#"{"p":"1"}"#);
        server.send(HELLO.into()).await.unwrap();
        let connection = handshake.await.unwrap().unwrap();
        (connection, server, signal)
    }

    #[tokio::test]
    async fn test_handshake_exposes_hello() {
        let (connection, _server, _signal) = connected().await;
        assert_eq!(connection.hello(), &json!({"name": "test"}));
        assert!((connection.call_limiter().config().burst - 100.0).abs() < f64::EPSILON);
        assert_eq!(connection.active_calls(), 0);
        assert_eq!(connection.transport_state(), ReadyState::Open);
    }

    #[tokio::test]
    async fn test_call_ids_are_monotonic_from_one() {
        let (connection, server, _signal) = connected().await;
        let call_signal = Signal::new();

        let first = connection.call(&call_signal);
        let second = connection.call(&call_signal);
        assert_eq!((first.id(), second.id()), (1, 2));

        assert_eq!(expect_message(&server).await, r#":{"c":1}"#);
        assert_eq!(expect_message(&server).await, r#":{"c":2}"#);
    }

    #[tokio::test]
    async fn test_switch_frame_only_when_call_changes() {
        let (connection, server, _signal) = connected().await;
        let call_signal = Signal::new();
        let a = connection.call(&call_signal);
        let b = connection.call(&call_signal);

        a.send(json!(1));
        a.send(json!(2));
        b.send(json!(3));
        a.send(json!(4));

        let expected = [
            r#":{"c":1}"#,
            r#":{"c":2}"#,
            r#":{"c":1}"#,
            "1",
            "2",
            r#":{"c":2}"#,
            "3",
            r#":{"c":1}"#,
            "4",
        ];
        for frame in expected {
            assert_eq!(expect_message(&server).await, frame);
        }
    }

    #[tokio::test]
    async fn test_inbound_routing_and_remote_stop() {
        let (connection, server, _signal) = connected().await;
        let mut call = connection.call(&Signal::new());
        expect_message(&server).await;

        server.send(r#":{"c":1}"#.into()).await.unwrap();
        server.send(r#"{"n":1}"#.into()).await.unwrap();
        server.send(r#":{"stop":"quota"}"#.into()).await.unwrap();

        assert_eq!(call.recv().await, Some(Ok(json!({"n": 1}))));
        assert_eq!(
            call.recv().await,
            Some(Err(MuxError::RemoteCall {
                reason: "quota".into()
            }))
        );
        assert_eq!(call.recv().await, None);
        assert!(!call.send(json!("late")));
        assert_eq!(connection.active_calls(), 0);
    }

    #[tokio::test]
    async fn test_local_cancel_sends_stop_and_ends_stream() {
        let (connection, server, _signal) = connected().await;
        let call_signal = Signal::new();
        let mut call = connection.call(&call_signal);
        assert_eq!(expect_message(&server).await, r#":{"c":1}"#);

        call_signal.cancel();
        assert_eq!(expect_message(&server).await, r#":{"c":1,"stop":""}"#);
        assert_eq!(call.recv().await, None);
        assert!(!call.send(json!(1)));
    }

    #[tokio::test]
    async fn test_precancelled_call_ends_with_reason() {
        let (connection, _server, _signal) = connected().await;
        let mut call = connection.call(&Signal::cancelled_with(MuxError::RunnerStopped));

        assert_eq!(call.recv().await, Some(Err(MuxError::RunnerStopped)));
        assert_eq!(call.recv().await, None);
        assert!(!call.send(json!(1)));
        assert_eq!(connection.active_calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_unroutable_frames_are_dropped() {
        let (connection, server, _signal) = connected().await;
        let mut call = connection.call(&Signal::new());
        expect_message(&server).await;

        server.send("{not json".into()).await.unwrap();
        server.send(r#""before routing""#.into()).await.unwrap();
        server.send(r#":{"c":9}"#.into()).await.unwrap();
        server.send(r#""to unknown call""#.into()).await.unwrap();
        server.send(r#":{"c":1}"#.into()).await.unwrap();
        server.send(r#""kept""#.into()).await.unwrap();

        assert_eq!(call.recv().await, Some(Ok(json!("kept"))));
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_tears_down() {
        let (connection, server, _signal) = connected().await;
        let mut call = connection.call(&Signal::new());
        expect_message(&server).await;

        server.close().await;

        let reason = tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();
        assert_eq!(reason, MuxError::TransportClosed);
        assert_eq!(call.recv().await, None);
        assert!(connection.is_closed());
        assert_eq!(connection.active_calls(), 0);

        let mut late = connection.call(&Signal::new());
        assert_eq!(late.recv().await, Some(Err(MuxError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_transport_error_tears_down() {
        let (connection, server, _signal) = connected().await;
        server.fail("reset").await;

        let reason = tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();
        assert_eq!(reason, MuxError::Transport("reset".into()));
    }

    #[tokio::test]
    async fn test_parent_signal_cancel_sends_no_stops() {
        let (connection, server, signal) = connected().await;
        let _call = connection.call(&Signal::new());
        assert_eq!(expect_message(&server).await, r#":{"c":1}"#);

        signal.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();
        assert_eq!(reason, MuxError::Cancelled);

        // Only the close is observed, never a stop frame
        assert_eq!(server.recv().await, TransportEvent::Closed);
    }
}

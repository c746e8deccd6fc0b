//! Routing State
//!
//! Both directions share one implicit "current call". Control frames switch
//! it; data frames in between belong to it.

use std::collections::HashSet;

use super::wire::{CallId, ControlFrame};

/// What an inbound control frame asks for
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum InboundAction {
    /// Current call switched (or unchanged); nothing else to do
    Routed,
    /// Terminate `id` with the remote reason
    Stop { id: CallId, reason: String },
    /// Stop frame with no call to apply it to
    Orphan,
}

/// Where inbound data frames currently go
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum InboundRoute {
    /// No control frame seen yet
    #[default]
    Unrouted,
    /// Data frames belong to this call
    Call(CallId),
}

impl InboundRoute {
    /// Apply a control frame: switch first, then stop the (new) current call
    pub(crate) fn apply(&mut self, frame: ControlFrame) -> InboundAction {
        if let Some(id) = frame.c {
            *self = Self::Call(id);
        }
        match (frame.stop, *self) {
            (None, _) => InboundAction::Routed,
            (Some(reason), Self::Call(id)) => InboundAction::Stop { id, reason },
            (Some(_), Self::Unrouted) => InboundAction::Orphan,
        }
    }

    /// Target of the next data frame
    pub(crate) fn current(&self) -> Option<CallId> {
        match self {
            Self::Unrouted => None,
            Self::Call(id) => Some(*id),
        }
    }
}

/// Outbound framing state: the current call plus the calls the peer knows about
#[derive(Debug, Default)]
pub(crate) struct OutboundRoute {
    current: Option<CallId>,
    started: HashSet<CallId>,
}

impl OutboundRoute {
    /// Record a call start; the start frame always switches
    pub(crate) fn start(&mut self, id: CallId) -> ControlFrame {
        self.current = Some(id);
        self.started.insert(id);
        ControlFrame::switch(id)
    }

    /// Switch frame needed before data for `id`, if the current call differs
    pub(crate) fn switch_to(&mut self, id: CallId) -> Option<ControlFrame> {
        if self.current == Some(id) {
            return None;
        }
        self.current = Some(id);
        Some(ControlFrame::switch(id))
    }

    /// Stop frame for `id`, or `None` if the peer never saw the call start
    pub(crate) fn stop(&mut self, id: CallId) -> Option<ControlFrame> {
        if !self.started.remove(&id) {
            return None;
        }
        self.current = Some(id);
        Some(ControlFrame::stop(id, ""))
    }

    /// Forget a call the peer terminated
    pub(crate) fn forget(&mut self, id: CallId) {
        self.started.remove(&id);
    }
}

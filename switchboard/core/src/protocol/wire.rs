//! Wire Format
//!
//! Every transport message is one UTF-8 text frame:
//!
//! ```text
//! client → server   {"p":"1"}                          version announcement
//! server → client   {"ok":true,"i":…,"l":{"c":…,"p":…}} hello, exactly once
//! either way        :{"c":7}                           switch current call
//! either way        :{"c":7,"stop":"reason"}           terminate call 7
//! either way        <any JSON>                         data for current call
//! ```
//!
//! Control frames are distinguished from data frames by the leading `:`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MuxError;
use crate::limit::RateLimitConfig;

/// Protocol version sent in the handshake
pub const PROTOCOL_VERSION: &str = "1";

/// Prefix marking a control frame
pub const CONTROL_PREFIX: char = ':';

/// Identifier of a logical call, allocated by the client from 1 upward
pub type CallId = u64;

#[derive(Serialize)]
struct VersionFrame<'a> {
    p: &'a str,
}

/// Encode the client's version announcement
pub fn version_frame() -> String {
    serde_json::to_string(&VersionFrame {
        p: PROTOCOL_VERSION,
    })
    .unwrap_or_else(|_| format!(r#"{{"p":"{PROTOCOL_VERSION}"}}"#))
}

/// Limiter configurations advertised by the server
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvertisedLimits {
    /// Call-start limiter
    #[serde(default, rename = "c", skip_serializing_if = "Option::is_none")]
    pub calls: Option<RateLimitConfig>,

    /// Per-packet limiter
    #[serde(default, rename = "p", skip_serializing_if = "Option::is_none")]
    pub packets: Option<RateLimitConfig>,
}

/// The server's handshake reply
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Must be `true` for the handshake to succeed
    pub ok: bool,

    /// Opaque init payload handed to the application
    #[serde(default, rename = "i")]
    pub init: Value,

    /// Advertised limiter configurations
    #[serde(default, rename = "l")]
    pub limits: AdvertisedLimits,
}

impl Hello {
    /// Parse and validate a hello message
    ///
    /// # Errors
    ///
    /// [`MuxError::Handshake`] if the text is not a hello or `ok` is not `true`.
    pub fn parse(text: &str) -> Result<Self, MuxError> {
        let hello: Self = serde_json::from_str(text)
            .map_err(|e| MuxError::Handshake(format!("malformed hello: {e}")))?;
        if !hello.ok {
            return Err(MuxError::Handshake("server refused the connection".into()));
        }
        Ok(hello)
    }
}

/// Routing and termination frame
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    /// Call to switch to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<CallId>,

    /// Present when the call terminates; the string is the reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
}

impl ControlFrame {
    /// Frame switching the current call to `id`
    #[must_use]
    pub fn switch(id: CallId) -> Self {
        Self {
            c: Some(id),
            stop: None,
        }
    }

    /// Frame terminating call `id`
    #[must_use]
    pub fn stop(id: CallId, reason: impl Into<String>) -> Self {
        Self {
            c: Some(id),
            stop: Some(reason.into()),
        }
    }

    /// Encode with the control prefix
    #[must_use]
    pub fn encode(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{CONTROL_PREFIX}{body}")
    }
}

/// One decoded inbound message
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Routing / termination
    Control(ControlFrame),
    /// Payload for the current call
    Data(Value),
}

impl Frame {
    /// Decode a transport message
    ///
    /// # Errors
    ///
    /// `serde_json::Error` for text that is neither a control nor a JSON data frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        match text.strip_prefix(CONTROL_PREFIX) {
            Some(body) => serde_json::from_str(body).map(Self::Control),
            None => serde_json::from_str(text).map(Self::Data),
        }
    }
}

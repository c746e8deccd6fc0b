//! Unix Socket Transport
//!
//! Local process separation over Unix domain sockets. Messages travel as
//! length-prefixed, CRC32-checked frames (see [`frame`](super::frame)).
//!
//! # Socket Location
//!
//! Default: `$XDG_RUNTIME_DIR/switchboard/switchboard.sock`
//! Fallback: `/tmp/switchboard-$UID/switchboard.sock`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                      ┌──────────────────┐
//! │  Connection          │                      │  Remote peer     │
//! │                      │                      │                  │
//! │ UnixSocketTransport ─┼──── frames ─────────►│                  │
//! │  (in-process half) ◄─┼──── frames ──────────┤                  │
//! │         ▲            │                      │                  │
//! │         │ pump task  │                      │                  │
//! └─────────┴────────────┘                      └──────────────────┘
//! ```

mod client;

pub use client::{UnixSocketConnector, UnixSocketTransport};

use std::path::PathBuf;

/// Default socket path
///
/// `$XDG_RUNTIME_DIR/switchboard/switchboard.sock` when the runtime dir is
/// set, otherwise `/tmp/switchboard-$UID/switchboard.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir)
            .join("switchboard")
            .join("switchboard.sock");
    }
    // SAFETY: getuid has no preconditions and cannot fail
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/switchboard-{uid}/switchboard.sock"))
}

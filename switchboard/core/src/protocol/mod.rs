//! Call Multiplexing Protocol (client side)
//!
//! Many logical calls share one [`Transport`](crate::transport::Transport).
//! Call ids are allocated by the client, and a `:`-prefixed control frame
//! selects which call the following data frames belong to.
//!
//! - [`wire`]: frame shapes and encoding
//! - `routing`: the "current call" state for each direction
//! - [`Connection`]: handshake, call table and the two frame loops
//! - [`Call`]: per-call sender and inbound stream

pub(crate) mod call;
mod connection;
mod routing;
pub mod wire;

pub use call::{Call, CallSender, CallStream};
pub use connection::{connect, Connection};
pub use wire::{AdvertisedLimits, CallId, ControlFrame, Frame, Hello};

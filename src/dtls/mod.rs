//! Seed-addressed DTLS 1.2: record layer, handshake engines, the dispatch
//! listener, and the seed-driven dialer.
//!
//! The engine speaks a single suite (ECDHE-ECDSA with AES-128-GCM), requires
//! the extended master secret and mutual certificate authentication, and
//! puts the seed-derived 32-byte random in the clear on the first packet —
//! that random is the entire addressing scheme.

pub mod client;
pub mod conn;
pub(crate) mod crypto;
mod flight;
pub mod listener;
pub(crate) mod message;
mod record;
pub mod server;

use std::time::Duration;

pub use client::{dial, dial_with_transport};
pub use conn::{packet_pipe, DtlsConn, PacketTransport, UdpTransport};
pub use listener::Listener;
pub use server::{
    accept_dtls, server_with_seed, ClientHelloInfo, ServerCallbacks, VerifyInfo,
};

/// End-to-end bound on a handshake, client or server side.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

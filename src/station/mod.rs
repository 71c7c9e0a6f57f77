//! Station-side plumbing: DNAT bootstrap, rendezvous, the transport
//! contract, and the TCP connection-dispatch state machine.

pub mod dispatch;
pub mod dnat;
pub mod rendezvous;
pub mod transport;

use std::net::IpAddr;

/// Which transport a registration asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Minimal TCP transport
    Min,
    /// Obfuscated TCP transport
    Obfs4,
    /// Prefix TCP transport
    Prefix,
    /// The covert DTLS transport this crate implements
    Dtls,
}

/// The slice of a registration message the covert transport consumes.
///
/// Produced by the out-of-band registration ingest; opaque fields it also
/// carries are none of our business.
#[derive(Debug, Clone)]
pub struct Registration {
    /// The session's shared secret, sole input to identity derivation
    pub shared_secret: Vec<u8>,
    /// Client address as reported by the registrar
    pub client_ip: IpAddr,
    /// Client UDP source port from the transport parameters
    pub client_port: u16,
    /// Phantom address the client will dial
    pub phantom_ip: IpAddr,
    /// Phantom port the client will dial
    pub phantom_port: u16,
    /// Declared transport
    pub transport: TransportType,
}

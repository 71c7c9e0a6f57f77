//! # mirage
//!
//! Seed-keyed covert DTLS transport core for a refraction-networking
//! station.
//!
//! A client registers out of band, receives a shared secret, and dials a
//! DTLS handshake at an arbitrary phantom address inside the censored
//! network. The station, on path, recognizes the handshake by the
//! seed-derived ClientHello random, terminates it locally, runs an SCTP
//! stream over the record layer, and hands the resulting bytestream to the
//! rest of the station.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  station: rendezvous (DNAT shim + dial/accept race)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  heartbeat overlay (keepalive + liveness watchdog)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SCTP framing (stream 0, reliability, reassembly)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DTLS 1.2 (seed-derived identities, random-keyed dispatch)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  UDP (shared listener socket / SO_REUSEPORT dialers)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The identity scheme is the load-bearing trick: client certificate,
//! server certificate, and ClientHello random are all pure functions of the
//! seed, so both ends derive matching material without ever sending it.

// unsafe is confined to the TUN ioctls and SO_ORIGINAL_DST lookup.
#![warn(missing_docs, rust_2018_idioms)]

pub mod conn;
pub mod crypto;
pub mod dtls;
pub mod error;
pub mod heartbeat;
pub mod sctp;
pub mod station;

pub use conn::Conn;
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::conn::Conn;
    use crate::dtls::conn::packet_pipe;
    use crate::dtls::{dial_with_transport, server_with_seed};

    /// The end-to-end shape: both roles constructed from one shared
    /// secret, talking over an in-memory transport.
    #[tokio::test]
    async fn test_end_to_end_with_shared_secret() {
        let seed = b"hihihihihihihihihihihihihihihihi";
        let (client_end, server_end) = packet_pipe();

        let server = tokio::spawn(async move {
            server_with_seed(Arc::new(server_end), seed).await
        });
        let client = dial_with_transport(Arc::new(client_end), seed)
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();

        let mut payload = vec![0u8; 65535];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut payload);
        client.write(&payload).await.unwrap();

        let mut received = Vec::with_capacity(payload.len());
        let mut buf = vec![0u8; 65535];
        while received.len() < payload.len() {
            let n = server.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);
    }
}

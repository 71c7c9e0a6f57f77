//! The station's generic transport contract, implemented for DTLS.
//!
//! Everything the connection manager needs to route a registration to this
//! transport: a name, a stable registration identifier, port selection, and
//! parameter parsing. The identifier HMAC personalization string carries a
//! historical typo; it is visible in station bookkeeping and must never be
//! "fixed".

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::rendezvous::Rendezvous;
use super::{Registration, TransportType};
use crate::conn::Conn;
use crate::crypto::SeedStream;
use crate::error::{Error, Result};

const IDENTIFIER_PERSONALIZATION: &[u8] = b"dtlsTrasportHMACString";

/// Phantom destination ports are drawn from the unprivileged range.
const PORT_RANGE_MIN: u16 = 1024;

/// Wire protocol of this transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// Transport rides TCP
    Tcp,
    /// Transport rides UDP
    Udp,
}

/// Transport parameters the client shares through its registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DtlsTransportParams {
    /// UDP source port the client commits to dialing from
    pub src_port: u32,
}

/// The covert DTLS transport as seen by the station's dispatcher.
pub struct DtlsTransport {
    rendezvous: Rendezvous,
}

impl DtlsTransport {
    /// Wrap a rendezvous controller in the transport contract.
    pub fn new(rendezvous: Rendezvous) -> DtlsTransport {
        DtlsTransport { rendezvous }
    }

    /// Transport name for registration matching.
    pub fn name(&self) -> &'static str {
        "dtls"
    }

    /// Prefix for per-connection log lines.
    pub fn log_prefix(&self) -> &'static str {
        "DTLS"
    }

    /// The wire protocol the station must capture for this transport.
    pub fn proto(&self) -> Proto {
        Proto::Udp
    }

    /// Identifier for station bookkeeping, stable across restarts:
    /// `HMAC-SHA256(shared_secret, personalization)`.
    pub fn identifier(&self, reg: &Registration) -> Vec<u8> {
        identifier_for_secret(&reg.shared_secret)
    }

    /// The client's committed UDP source port.
    pub fn src_port(&self, params: &DtlsTransportParams) -> u16 {
        params.src_port as u16
    }

    /// Phantom destination port, drawn uniformly from the seed.
    pub fn dst_port(&self, seed: &[u8]) -> Result<u16> {
        dst_port_from_seed(seed)
    }

    /// Parse the opaque parameter blob from the registration.
    pub fn parse_params(&self, blob: &[u8]) -> Result<DtlsTransportParams> {
        serde_json::from_slice(blob)
            .map_err(|e| Error::invalid(format!("dtls transport params: {e}")))
    }

    /// Establish the covert connection for a registration.
    pub async fn connect(&self, reg: &Registration) -> Result<Box<dyn Conn>> {
        if reg.transport != TransportType::Dtls {
            return Err(Error::NotThisTransport);
        }
        self.rendezvous.connect(reg).await
    }
}

/// HMAC identifier shared with station bookkeeping.
pub fn identifier_for_secret(shared_secret: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(shared_secret)
        .expect("hmac accepts keys of any length");
    mac.update(IDENTIFIER_PERSONALIZATION);
    mac.finalize().into_bytes().to_vec()
}

/// Seed-determined phantom destination port in `[1024, 65535)`.
pub fn dst_port_from_seed(seed: &[u8]) -> Result<u16> {
    let mut stream = SeedStream::new(seed);
    let mut bytes = [0u8; 8];
    stream.fill(&mut bytes)?;
    let value = u64::from_be_bytes(bytes);
    let span = (u16::MAX - PORT_RANGE_MIN) as u64;
    Ok(PORT_RANGE_MIN + (value % span) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_is_deterministic_and_keyed() {
        let a = identifier_for_secret(b"secret-a");
        let b = identifier_for_secret(b"secret-a");
        let c = identifier_for_secret(b"secret-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_dst_port_range_and_determinism() {
        for seed in [&b"aaaa"[..], b"bbbb", b"hihihihihihihihihihihihihihihihi"] {
            let port = dst_port_from_seed(seed).unwrap();
            assert!(port >= PORT_RANGE_MIN);
            assert_eq!(port, dst_port_from_seed(seed).unwrap());
        }
    }

    #[test]
    fn test_params_round_trip() {
        let params = DtlsTransportParams { src_port: 6666 };
        let blob = serde_json::to_vec(&params).unwrap();

        let listener_side: DtlsTransportParams = serde_json::from_slice(&blob).unwrap();
        assert_eq!(listener_side, params);
    }

    #[test]
    fn test_parse_params_rejects_garbage() {
        let rendezvous_free_check = serde_json::from_slice::<DtlsTransportParams>(b"not json");
        assert!(rendezvous_free_check.is_err());
    }
}

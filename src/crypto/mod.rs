//! Seed-derived cryptographic identities.
//!
//! From one registration seed both peers deterministically derive a matching
//! certificate pair and ClientHello random. The random is the connection's
//! cleartext fingerprint; the certificates carry the mutual authentication.

mod cert;
mod seed;

pub use cert::{
    certs_from_seed, new_certificate, public_key_der, random_certificate, verify_cert,
    verifying_key_from_cert, CertPair, Identity,
};
pub use seed::{
    client_hello_random_from_seed, ConnectionId, SeedStream, CONNECTION_ID_LEN,
};

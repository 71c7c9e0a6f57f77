//! Seed-derived X.509 certificates and signature-based verification.
//!
//! Certificates are self-signed ECDSA-P256, built from material drawn off
//! the seed keystream. There is no CA: a peer certificate is valid when its
//! signature checks out against the public key of the certificate we derived
//! from the same seed. Comparing by key instead of by DER bytes sidesteps
//! the validity window, which depends on the local clock, and the signature
//! bytes, which depend on signing-time randomness.

use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::EncodePrivateKey;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::crypto::seed::{
    serial_from_seed, signing_key_from_seed, subject_cn_from_seed,
};
use crate::error::{Error, Result};

/// Certificate validity span. The window starts at UTC midnight so the two
/// peers agree on it to the day even with moderate clock skew.
const VALIDITY_DAYS: i64 = 30;

/// One side's handshake identity: a DER certificate plus its signing key.
#[derive(Clone)]
pub struct Identity {
    /// DER-encoded self-signed certificate
    pub cert_der: Vec<u8>,
    /// The P-256 key the certificate binds
    pub signing_key: SigningKey,
}

/// The client and server identities derived from one seed.
///
/// Both draws restart the keystream, so the two certificates carry the same
/// key material. The dispatch listener registers pairs under the derived
/// connection ID.
#[derive(Clone)]
pub struct CertPair {
    /// Identity the dialing client presents
    pub client: Identity,
    /// Identity the terminating station presents
    pub server: Identity,
}

/// Derive the client/server certificate pair for a seed.
pub fn certs_from_seed(seed: &[u8]) -> Result<CertPair> {
    let client = new_certificate(seed)?;
    let server = new_certificate(seed)?;
    Ok(CertPair { client, server })
}

/// Build one self-signed certificate from a seed.
pub fn new_certificate(seed: &[u8]) -> Result<Identity> {
    let signing_key = signing_key_from_seed(seed)?;
    let serial = serial_from_seed(seed)?;
    let cn = subject_cn_from_seed(seed)?;

    let pkcs8 = signing_key
        .to_pkcs8_der()
        .map_err(|e| Error::certification(format!("pkcs8 encoding failed: {e}")))?;
    let key_pair = KeyPair::try_from(pkcs8.as_bytes())
        .map_err(|e| Error::certification(format!("key pair import failed: {e}")))?;

    let mut params = CertificateParams::new(vec![cn.clone()])
        .map_err(|e| Error::certification(format!("certificate params: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let not_before = time::OffsetDateTime::now_utc().replace_time(time::Time::MIDNIGHT);
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(VALIDITY_DAYS);

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::certification(format!("self-sign failed: {e}")))?;

    Ok(Identity {
        cert_der: cert.der().to_vec(),
        signing_key,
    })
}

/// Build a certificate from fresh OS randomness.
///
/// Served to probing ClientHellos so an unregistered handshake looks like a
/// perfectly ordinary DTLS server until verification quietly fails.
pub fn random_certificate() -> Result<Identity> {
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    new_certificate(&seed)
}

/// Check `peer_der`'s signature against the key bound in `expected_der`.
///
/// The equivalent of parsing both certificates and calling
/// `CheckSignatureFrom`: only the public key matters, never the exact DER.
pub fn verify_cert(peer_der: &[u8], expected_der: &[u8]) -> Result<()> {
    let (_, peer) = X509Certificate::from_der(peer_der)
        .map_err(|e| Error::handshake(format!("peer certificate parse: {e}")))?;
    let (_, expected) = X509Certificate::from_der(expected_der)
        .map_err(|e| Error::handshake(format!("expected certificate parse: {e}")))?;

    peer.verify_signature(Some(expected.public_key()))
        .map_err(|e| Error::handshake(format!("certificate signature mismatch: {e}")))
}

/// Extract the P-256 verifying key from a DER certificate.
pub fn verifying_key_from_cert(cert_der: &[u8]) -> Result<VerifyingKey> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::handshake(format!("certificate parse: {e}")))?;
    VerifyingKey::from_sec1_bytes(&cert.public_key().subject_public_key.data)
        .map_err(|e| Error::handshake(format!("certificate public key: {e}")))
}

/// The DER-encoded subject public key of a certificate, used by tests and
/// the station identifier plumbing to compare identities.
pub fn public_key_der(cert_der: &[u8]) -> Result<Vec<u8>> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::certification(format!("certificate parse: {e}")))?;
    Ok(cert.public_key().raw.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::seed::client_hello_random_from_seed;

    const SEED: &[u8] = b"hihihihihihihihihihihihihihihihi";

    #[test]
    fn test_pair_shares_key_material() {
        let pair = certs_from_seed(SEED).unwrap();
        assert_eq!(
            public_key_der(&pair.client.cert_der).unwrap(),
            public_key_der(&pair.server.cert_der).unwrap()
        );
    }

    #[test]
    fn test_derivation_is_deterministic_across_calls() {
        let seed = [0u8; 32];
        let a = certs_from_seed(&seed).unwrap();
        let b = certs_from_seed(&seed).unwrap();

        assert_eq!(
            public_key_der(&a.client.cert_der).unwrap(),
            public_key_der(&b.client.cert_der).unwrap()
        );
        assert_eq!(
            subject_cn_from_seed(&seed).unwrap(),
            subject_cn_from_seed(&seed).unwrap()
        );
        assert_eq!(
            client_hello_random_from_seed(&seed).unwrap(),
            client_hello_random_from_seed(&seed).unwrap()
        );
    }

    #[test]
    fn test_cross_verify_independent_derivations() {
        // The dialer and the station derive independently; signatures are
        // not byte-stable but the key check must still pass.
        let ours = certs_from_seed(SEED).unwrap();
        let theirs = certs_from_seed(SEED).unwrap();

        verify_cert(&theirs.client.cert_der, &ours.client.cert_der).unwrap();
        verify_cert(&ours.server.cert_der, &theirs.server.cert_der).unwrap();
    }

    #[test]
    fn test_wrong_seed_fails_verification() {
        let ours = certs_from_seed(SEED).unwrap();
        let other = certs_from_seed(b"00000000000000000000000000000000").unwrap();

        assert!(verify_cert(&other.client.cert_der, &ours.client.cert_der).is_err());
    }

    #[test]
    fn test_random_certificate_fails_against_seed_cert() {
        let ours = certs_from_seed(SEED).unwrap();
        let random = random_certificate().unwrap();

        assert!(verify_cert(&random.cert_der, &ours.client.cert_der).is_err());
    }

    #[test]
    fn test_verifying_key_matches_signing_key() {
        let identity = new_certificate(SEED).unwrap();
        let from_cert = verifying_key_from_cert(&identity.cert_der).unwrap();
        assert_eq!(&from_cert, identity.signing_key.verifying_key());
    }
}

//! DTLS server handshake with pluggable certificate selection and
//! connection verification.
//!
//! The two hooks mirror what the dispatch listener needs: certificate
//! selection keyed on the cleartext ClientHello random, and a final
//! verification pass over the peer certificate once the handshake has
//! produced it. Verification failures are silent — the station never sends
//! an alert that would distinguish it from a phantom that was simply never
//! a DTLS server.

use std::sync::Arc;

use bytes::Bytes;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::Signature;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;

use super::conn::{DtlsConn, PacketTransport};
use super::crypto::{master_secret, verify_data, SessionKeys};
use super::flight::{expect_message, FlightIo, Incoming};
use super::message::{
    default_extensions, has_extended_master_secret, CertificateMsg, CertificateRequest,
    CertificateVerify, ClientHello, ClientKeyExchange, Finished, HandshakeType, ServerHello,
    ServerKeyExchange, CIPHER_SUITE,
};
use super::HANDSHAKE_TIMEOUT;
use crate::crypto::{certs_from_seed, verify_cert, verifying_key_from_cert, ConnectionId, Identity};
use crate::error::{Error, Result};
use crate::sctp::SctpConn;

/// Parsed ClientHello facts handed to [`ServerCallbacks::get_certificate`].
pub struct ClientHelloInfo {
    /// The cleartext ClientHello random
    pub random: ConnectionId,
    /// Offered cipher suites; empty for bare probes
    pub cipher_suites: Vec<u16>,
}

/// Completed-handshake facts handed to [`ServerCallbacks::verify_connection`].
pub struct VerifyInfo {
    /// The peer's ClientHello random
    pub client_random: ConnectionId,
    /// DER certificates the peer presented
    pub peer_certificates: Vec<Bytes>,
}

/// Callback type selecting the server certificate for a ClientHello.
pub type GetCertificate = dyn Fn(&ClientHelloInfo) -> Result<Identity> + Send + Sync;

/// Callback type vetting a completed handshake.
pub type VerifyConnection = dyn Fn(&VerifyInfo) -> Result<()> + Send + Sync;

/// The hooks a dispatching server threads into each handshake.
#[derive(Clone)]
pub struct ServerCallbacks {
    /// Invoked at ServerHello time with the parsed ClientHello
    pub get_certificate: Arc<GetCertificate>,
    /// Invoked after the peer certificate and Finished have been received
    pub verify_connection: Arc<VerifyConnection>,
}

impl ServerCallbacks {
    /// Callbacks for a single-seed server: serve the derived server
    /// certificate and require the derived client certificate back.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let pair = certs_from_seed(seed)?;
        let server_identity = pair.server.clone();
        let expected_client = pair.client.cert_der.clone();
        Ok(Self {
            get_certificate: Arc::new(move |_info| Ok(server_identity.clone())),
            verify_connection: Arc::new(move |info| {
                if info.peer_certificates.len() != 1 {
                    return Err(Error::handshake(format!(
                        "expected 1 peer certificate, got {}",
                        info.peer_certificates.len()
                    )));
                }
                verify_cert(&info.peer_certificates[0], &expected_client)
            }),
        })
    }
}

/// Accept one DTLS handshake over `transport` with per-seed identities.
pub async fn accept_dtls_with_seed(
    transport: Arc<dyn PacketTransport>,
    seed: &[u8],
) -> Result<DtlsConn> {
    let callbacks = ServerCallbacks::from_seed(seed)?;
    accept_dtls(transport, &callbacks).await
}

/// Accept a covert session: DTLS handshake, then SCTP server-side wrap.
pub async fn server_with_seed(
    transport: Arc<dyn PacketTransport>,
    seed: &[u8],
) -> Result<SctpConn> {
    let conn = accept_dtls_with_seed(transport, seed).await?;
    SctpConn::server(conn).await
}

/// Run the server side of the DTLS handshake.
pub async fn accept_dtls(
    transport: Arc<dyn PacketTransport>,
    callbacks: &ServerCallbacks,
) -> Result<DtlsConn> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(transport, callbacks))
        .await
        .map_err(|_| Error::handshake("server handshake timed out"))?
}

async fn handshake(
    transport: Arc<dyn PacketTransport>,
    callbacks: &ServerCallbacks,
) -> Result<DtlsConn> {
    let mut io = FlightIo::new(transport);

    let msg = expect_message(&mut io, None, HandshakeType::ClientHello).await?;
    io.transcript_extend(&msg.to_bytes());
    let mut body = msg.body.clone();
    let client_hello = ClientHello::decode(&mut body)?;
    let client_random = client_hello.random;

    let info = ClientHelloInfo {
        random: client_random,
        cipher_suites: client_hello.cipher_suites.clone(),
    };
    // Certificate selection comes first so probes exercise the same path a
    // registered session does.
    let identity = (callbacks.get_certificate)(&info)?;

    if !client_hello.cipher_suites.contains(&CIPHER_SUITE) {
        return Err(Error::handshake("no mutually supported cipher suite"));
    }
    if !has_extended_master_secret(&client_hello.extensions) {
        return Err(Error::handshake("client did not offer extended master secret"));
    }

    // Flight 2: ServerHello, Certificate, ServerKeyExchange,
    // CertificateRequest, ServerHelloDone.
    let mut server_random = [0u8; 32];
    OsRng.fill_bytes(&mut server_random);
    let server_hello = ServerHello {
        random: server_random,
        cipher_suite: CIPHER_SUITE,
        extensions: default_extensions(),
    };
    io.add_message(HandshakeType::ServerHello, server_hello.encode());

    let cert_msg = CertificateMsg {
        certificates: vec![Bytes::from(identity.cert_der.clone())],
    };
    io.add_message(HandshakeType::Certificate, cert_msg.encode());

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let public_point = ephemeral.public_key().to_encoded_point(false);
    let mut ske = ServerKeyExchange {
        public_key: public_point.as_bytes().to_vec(),
        signature: Vec::new(),
    };
    let mut signed = Vec::with_capacity(64 + ske.public_key.len() + 4);
    signed.extend_from_slice(&client_random);
    signed.extend_from_slice(&server_random);
    signed.extend_from_slice(&ske.params_bytes());
    let ske_sig: Signature = identity.signing_key.sign(&signed);
    ske.signature = ske_sig.to_der().as_bytes().to_vec();
    io.add_message(HandshakeType::ServerKeyExchange, ske.encode());

    io.add_message(HandshakeType::CertificateRequest, CertificateRequest.encode());
    io.add_message(HandshakeType::ServerHelloDone, Bytes::new());
    io.send_flight().await?;

    // Flight 3: client Certificate, ClientKeyExchange, CertificateVerify,
    // ChangeCipherSpec, Finished.
    let msg = expect_message(&mut io, None, HandshakeType::Certificate).await?;
    io.transcript_extend(&msg.to_bytes());
    let mut body = msg.body.clone();
    let peer_cert_msg = CertificateMsg::decode(&mut body)?;
    let peer_certificates = peer_cert_msg.certificates.clone();
    let first_peer_cert = peer_certificates
        .first()
        .cloned()
        .ok_or_else(|| Error::handshake("client sent no certificate"))?;

    let msg = expect_message(&mut io, None, HandshakeType::ClientKeyExchange).await?;
    io.transcript_extend(&msg.to_bytes());
    let mut body = msg.body.clone();
    let cke = ClientKeyExchange::decode(&mut body)?;
    let client_public = PublicKey::from_sec1_bytes(&cke.public_key)
        .map_err(|_| Error::handshake("malformed client key share"))?;
    let shared = ephemeral.diffie_hellman(&client_public);
    let master = master_secret(shared.raw_secret_bytes().as_slice(), io.transcript())?;

    let msg = expect_message(&mut io, None, HandshakeType::CertificateVerify).await?;
    let cv_raw = msg.to_bytes();
    let mut body = msg.body.clone();
    let cert_verify = CertificateVerify::decode(&mut body)?;
    let cv_sig = Signature::from_der(&cert_verify.signature)
        .map_err(|e| Error::handshake(format!("certificate verify encoding: {e}")))?;
    verifying_key_from_cert(&first_peer_cert)?
        .verify(io.transcript(), &cv_sig)
        .map_err(|_| Error::handshake("certificate verify signature failed"))?;
    io.transcript_extend(&cv_raw);

    match io.next(None).await? {
        Incoming::ChangeCipherSpec => {}
        Incoming::Message(_) => {
            return Err(Error::handshake("expected ChangeCipherSpec before client Finished"))
        }
    }

    let keys = SessionKeys::expand(&master, &client_random, &server_random)?;
    let cipher = keys.cipher(false);

    let msg = expect_message(&mut io, Some(&cipher), HandshakeType::Finished).await?;
    let finished_raw = msg.to_bytes();
    let mut body = msg.body.clone();
    let finished = Finished::decode(&mut body)?;
    let expected = verify_data(&master, b"client finished", io.transcript())?;
    if finished.verify_data != expected {
        return Err(Error::handshake("client finished verification failed"));
    }
    io.transcript_extend(&finished_raw);

    // The delayed rejection point: an unregistered or mismatched peer dies
    // here, silently, after a fully ordinary-looking handshake.
    let verify_info = VerifyInfo {
        client_random,
        peer_certificates,
    };
    (callbacks.verify_connection)(&verify_info)?;

    // Flight 4: ChangeCipherSpec + Finished.
    let server_vd = verify_data(&master, b"server finished", io.transcript())?;
    io.add_ccs();
    io.add_finished(&cipher, Bytes::from(server_vd))?;
    io.send_flight().await?;

    let final_flight = io.last_flight();
    Ok(DtlsConn::new(
        io.into_transport(),
        cipher,
        client_random,
        1,
        final_flight,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtls::client::connect_dtls;
    use crate::dtls::conn::packet_pipe;
    use crate::dtls::message::Extensions;

    const SEED: &[u8] = b"hihihihihihihihihihihihihihihihi";

    #[tokio::test]
    async fn test_verify_connection_rejects_unknown_peer() {
        let (client_end, server_end) = packet_pipe();

        let callbacks = ServerCallbacks {
            get_certificate: Arc::new(|_info| crate::crypto::random_certificate()),
            verify_connection: Arc::new(|_info| Err(Error::NoMatchingRegistration)),
        };
        let server = tokio::spawn(async move {
            accept_dtls(Arc::new(server_end), &callbacks).await
        });

        // The client's own verification fails first: the random certificate
        // does not descend from the seed.
        let client = connect_dtls(Arc::new(client_end), SEED).await;
        assert!(client.is_err());
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_probe_without_cipher_suites_is_dropped() {
        let (probe_end, server_end) = packet_pipe();

        let server = tokio::spawn(async move {
            accept_dtls_with_seed(Arc::new(server_end), SEED).await
        });

        // Hand-build a suiteless hello the way a prober might.
        let hello = ClientHello {
            random: [9u8; 32],
            session_id: Vec::new(),
            cookie: Vec::new(),
            cipher_suites: Vec::new(),
            compression_methods: vec![0],
            extensions: Extensions::new(),
        };
        let mut io = FlightIo::new(Arc::new(probe_end));
        io.add_message(HandshakeType::ClientHello, hello.encode());
        io.send_flight().await.unwrap();

        let result = server.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_callbacks_see_client_random() {
        let (client_end, server_end) = packet_pipe();
        let derived = crate::crypto::client_hello_random_from_seed(SEED).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_in_cb = seen.clone();
        let pair = certs_from_seed(SEED).unwrap();
        let server_identity = pair.server.clone();
        let expected_client = pair.client.cert_der.clone();
        let callbacks = ServerCallbacks {
            get_certificate: Arc::new(move |info| {
                *seen_in_cb.lock() = Some(info.random);
                Ok(server_identity.clone())
            }),
            verify_connection: Arc::new(move |info| {
                verify_cert(&info.peer_certificates[0], &expected_client)
            }),
        };

        let server =
            tokio::spawn(async move { accept_dtls(Arc::new(server_end), &callbacks).await });
        let client = connect_dtls(Arc::new(client_end), SEED).await.unwrap();
        let server = server.await.unwrap().unwrap();

        assert_eq!(seen.lock().take().unwrap(), derived);
        assert_eq!(client.connection_id(), derived);
        assert_eq!(server.connection_id(), derived);
    }
}

//! Seed-driven DTLS client.
//!
//! The dialer's ClientHello random is the seed-derived connection ID, which
//! is all the on-path station needs to recognize the session. The server
//! certificate is accepted only if its signature checks out against the
//! certificate we derived from the same seed; nothing else about it is
//! trusted.

use std::sync::Arc;

use bytes::Bytes;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::Signature;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use tokio::net::UdpSocket;

use super::conn::{DtlsConn, PacketTransport, UdpTransport};
use super::crypto::{master_secret, verify_data, SessionKeys};
use super::flight::{expect_message, FlightIo, Incoming};
use super::message::{
    has_extended_master_secret, CertificateMsg, CertificateVerify, ClientHello,
    ClientKeyExchange, HandshakeType, ServerHello, ServerKeyExchange, CIPHER_SUITE,
};
use super::HANDSHAKE_TIMEOUT;
use crate::crypto::{
    certs_from_seed, client_hello_random_from_seed, verify_cert, verifying_key_from_cert,
};
use crate::error::{Error, Result};
use crate::sctp::SctpConn;

/// Dial a covert session over a caller-supplied datagram transport.
///
/// The caller controls the socket (and with it the source address and any
/// `SO_REUSEPORT` binding); this function only drives the handshake and
/// wraps the SCTP stream.
pub async fn dial_with_transport(
    transport: Arc<dyn PacketTransport>,
    seed: &[u8],
) -> Result<SctpConn> {
    let conn = connect_dtls(transport, seed).await?;
    SctpConn::client(conn).await
}

/// Dial a phantom address directly over a fresh UDP socket.
pub async fn dial(addr: std::net::SocketAddr, seed: &[u8]) -> Result<SctpConn> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
    let bind = if addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    dial_with_transport(Arc::new(UdpTransport::new(socket)), seed).await
}

/// Run the client side of the DTLS handshake.
pub async fn connect_dtls(
    transport: Arc<dyn PacketTransport>,
    seed: &[u8],
) -> Result<DtlsConn> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(transport, seed))
        .await
        .map_err(|_| Error::handshake("client handshake timed out"))?
}

async fn handshake(transport: Arc<dyn PacketTransport>, seed: &[u8]) -> Result<DtlsConn> {
    let pair = certs_from_seed(seed)?;
    let client_random = client_hello_random_from_seed(seed)?;

    let mut io = FlightIo::new(transport);

    // Flight 1: ClientHello with the derived random.
    let hello = ClientHello::new(client_random);
    io.add_message(HandshakeType::ClientHello, hello.encode());
    io.send_flight().await?;

    // Flight 2: ServerHello .. ServerHelloDone.
    let msg = expect_message(&mut io, None, HandshakeType::ServerHello).await?;
    io.transcript_extend(&msg.to_bytes());
    let mut body = msg.body.clone();
    let server_hello = ServerHello::decode(&mut body)?;
    if server_hello.cipher_suite != CIPHER_SUITE {
        return Err(Error::handshake("server selected an unexpected cipher suite"));
    }
    if !has_extended_master_secret(&server_hello.extensions) {
        return Err(Error::handshake("server did not negotiate extended master secret"));
    }
    let server_random = server_hello.random;

    let msg = expect_message(&mut io, None, HandshakeType::Certificate).await?;
    io.transcript_extend(&msg.to_bytes());
    let mut body = msg.body.clone();
    let cert_msg = CertificateMsg::decode(&mut body)?;
    if cert_msg.certificates.len() != 1 {
        return Err(Error::handshake(format!(
            "expected 1 peer certificate, got {}",
            cert_msg.certificates.len()
        )));
    }
    let server_cert = cert_msg.certificates[0].clone();
    // The only trust anchor is the seed: check the signature against the
    // derived server certificate and ignore everything else about it.
    verify_cert(&server_cert, &pair.server.cert_der)?;

    let msg = expect_message(&mut io, None, HandshakeType::ServerKeyExchange).await?;
    io.transcript_extend(&msg.to_bytes());
    let mut body = msg.body.clone();
    let ske = ServerKeyExchange::decode(&mut body)?;
    let mut signed = Vec::with_capacity(64 + ske.public_key.len() + 4);
    signed.extend_from_slice(&client_random);
    signed.extend_from_slice(&server_random);
    signed.extend_from_slice(&ske.params_bytes());
    let ske_sig = Signature::from_der(&ske.signature)
        .map_err(|e| Error::handshake(format!("key exchange signature encoding: {e}")))?;
    verifying_key_from_cert(&server_cert)?
        .verify(&signed, &ske_sig)
        .map_err(|_| Error::handshake("key exchange signature verification failed"))?;

    let msg = expect_message(&mut io, None, HandshakeType::CertificateRequest).await?;
    io.transcript_extend(&msg.to_bytes());
    let msg = expect_message(&mut io, None, HandshakeType::ServerHelloDone).await?;
    io.transcript_extend(&msg.to_bytes());

    // Flight 3: Certificate, ClientKeyExchange, CertificateVerify,
    // ChangeCipherSpec, Finished.
    let cert_body = CertificateMsg {
        certificates: vec![Bytes::from(pair.client.cert_der.clone())],
    };
    io.add_message(HandshakeType::Certificate, cert_body.encode());

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let public_point = ephemeral.public_key().to_encoded_point(false);
    let cke = ClientKeyExchange {
        public_key: public_point.as_bytes().to_vec(),
    };
    io.add_message(HandshakeType::ClientKeyExchange, cke.encode());

    let server_public = PublicKey::from_sec1_bytes(&ske.public_key)
        .map_err(|_| Error::handshake("malformed server key share"))?;
    let shared = ephemeral.diffie_hellman(&server_public);
    let master = master_secret(shared.raw_secret_bytes().as_slice(), io.transcript())?;

    // CertificateVerify covers the transcript up to and including the
    // ClientKeyExchange, before this message itself.
    let cv_sig: Signature = pair.client.signing_key.sign(io.transcript());
    let cert_verify = CertificateVerify {
        signature: cv_sig.to_der().as_bytes().to_vec(),
    };
    io.add_message(HandshakeType::CertificateVerify, cert_verify.encode());

    let keys = SessionKeys::expand(&master, &client_random, &server_random)?;
    let cipher = keys.cipher(true);

    let client_vd = verify_data(&master, b"client finished", io.transcript())?;
    io.add_ccs();
    io.add_finished(&cipher, Bytes::from(client_vd))?;
    io.send_flight().await?;

    // Flight 4: server ChangeCipherSpec + Finished.
    match io.next(Some(&cipher)).await? {
        Incoming::ChangeCipherSpec => {}
        Incoming::Message(_) => {
            return Err(Error::handshake("expected ChangeCipherSpec before server Finished"))
        }
    }
    let msg = expect_message(&mut io, Some(&cipher), HandshakeType::Finished).await?;
    let expected = verify_data(&master, b"server finished", io.transcript())?;
    if msg.body.as_ref() != expected.as_slice() {
        return Err(Error::handshake("server finished verification failed"));
    }

    Ok(DtlsConn::new(
        io.into_transport(),
        cipher,
        client_random,
        1,
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtls::conn::packet_pipe;

    const SEED: &[u8] = b"hihihihihihihihihihihihihihihihi";

    #[tokio::test]
    async fn test_handshake_over_pipe() {
        let (client_end, server_end) = packet_pipe();

        let server = tokio::spawn(async move {
            crate::dtls::server::accept_dtls_with_seed(Arc::new(server_end), SEED).await
        });
        let client = connect_dtls(Arc::new(client_end), SEED).await.unwrap();
        let server = server.await.unwrap().unwrap();

        client.send(b"up the covert channel").await.unwrap();
        assert_eq!(&server.recv().await.unwrap()[..], b"up the covert channel");

        server.send(b"and back down").await.unwrap();
        assert_eq!(&client.recv().await.unwrap()[..], b"and back down");
    }

    #[tokio::test]
    async fn test_seed_mismatch_fails() {
        let (client_end, server_end) = packet_pipe();

        let server = tokio::spawn(async move {
            crate::dtls::server::accept_dtls_with_seed(
                Arc::new(server_end),
                b"not the same seed at all---------",
            )
            .await
        });
        let client = connect_dtls(Arc::new(client_end), SEED).await;
        assert!(client.is_err());
        let _ = server.await;
    }
}

//! DTLS 1.2 handshake message codecs.
//!
//! Only the messages the single supported suite needs: full ECDHE-ECDSA
//! flights with mutual authentication. Flights always fit one datagram, so
//! messages are never emitted fragmented and fragments are rejected on
//! receipt.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256, the only suite spoken.
pub const CIPHER_SUITE: u16 = 0xc02b;

/// named_curve secp256r1.
pub const NAMED_CURVE_P256: u16 = 23;

/// SignatureAndHashAlgorithm ecdsa_secp256r1_sha256.
pub const SIG_ECDSA_SHA256: u16 = 0x0403;

/// extension: supported_groups
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
/// extension: ec_point_formats
pub const EXT_EC_POINT_FORMATS: u16 = 11;
/// extension: signature_algorithms
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
/// extension: extended_master_secret
pub const EXT_EXTENDED_MASTER_SECRET: u16 = 23;

/// Handshake message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    ClientHello,
    ServerHello,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
}

impl HandshakeType {
    fn to_u8(self) -> u8 {
        match self {
            HandshakeType::ClientHello => 1,
            HandshakeType::ServerHello => 2,
            HandshakeType::Certificate => 11,
            HandshakeType::ServerKeyExchange => 12,
            HandshakeType::CertificateRequest => 13,
            HandshakeType::ServerHelloDone => 14,
            HandshakeType::CertificateVerify => 15,
            HandshakeType::ClientKeyExchange => 16,
            HandshakeType::Finished => 20,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(HandshakeType::ClientHello),
            2 => Ok(HandshakeType::ServerHello),
            11 => Ok(HandshakeType::Certificate),
            12 => Ok(HandshakeType::ServerKeyExchange),
            13 => Ok(HandshakeType::CertificateRequest),
            14 => Ok(HandshakeType::ServerHelloDone),
            15 => Ok(HandshakeType::CertificateVerify),
            16 => Ok(HandshakeType::ClientKeyExchange),
            20 => Ok(HandshakeType::Finished),
            other => Err(Error::invalid(format!("unknown handshake type {other}"))),
        }
    }
}

/// A handshake message with its DTLS framing fields.
#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    /// Message type
    pub msg_type: HandshakeType,
    /// Message sequence within the handshake
    pub message_seq: u16,
    /// Message body
    pub body: Bytes,
}

impl HandshakeMessage {
    /// Encode with the 12-byte DTLS handshake header (unfragmented).
    pub fn encode(&self, buf: &mut BytesMut) {
        let len = self.body.len() as u32;
        buf.reserve(12 + self.body.len());
        buf.put_u8(self.msg_type.to_u8());
        buf.put_uint(len as u64, 3);
        buf.put_u16(self.message_seq);
        buf.put_uint(0, 3); // fragment offset
        buf.put_uint(len as u64, 3); // fragment length
        buf.put_slice(&self.body);
    }

    /// Encoded wire bytes, as fed into the handshake transcript.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one message off the front of `data`. Fragments are rejected.
    pub fn decode(data: &mut Bytes) -> Result<Option<HandshakeMessage>> {
        if data.is_empty() {
            return Ok(None);
        }
        if data.len() < 12 {
            return Err(Error::invalid("truncated handshake header"));
        }
        let msg_type = HandshakeType::from_u8(data.get_u8())?;
        let total_len = data.get_uint(3) as usize;
        let message_seq = data.get_u16();
        let fragment_offset = data.get_uint(3) as usize;
        let fragment_len = data.get_uint(3) as usize;
        if fragment_offset != 0 || fragment_len != total_len {
            return Err(Error::invalid("fragmented handshake message"));
        }
        if data.len() < total_len {
            return Err(Error::invalid("truncated handshake body"));
        }
        let body = data.split_to(total_len);
        Ok(Some(HandshakeMessage {
            msg_type,
            message_seq,
            body,
        }))
    }
}

/// Raw extension list: `(type, data)` pairs.
pub type Extensions = Vec<(u16, Bytes)>;

fn encode_extensions(extensions: &Extensions, buf: &mut BytesMut) {
    let total: usize = extensions.iter().map(|(_, d)| 4 + d.len()).sum();
    buf.put_u16(total as u16);
    for (ext_type, data) in extensions {
        buf.put_u16(*ext_type);
        buf.put_u16(data.len() as u16);
        buf.put_slice(data);
    }
}

fn decode_extensions(data: &mut Bytes) -> Result<Extensions> {
    // Pre-EMS probes may omit the extension block entirely.
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < 2 {
        return Err(Error::invalid("truncated extensions length"));
    }
    let total = data.get_u16() as usize;
    if data.len() < total {
        return Err(Error::invalid("truncated extensions"));
    }
    let mut block = data.split_to(total);
    let mut extensions = Vec::new();
    while block.len() >= 4 {
        let ext_type = block.get_u16();
        let len = block.get_u16() as usize;
        if block.len() < len {
            return Err(Error::invalid("truncated extension body"));
        }
        extensions.push((ext_type, block.split_to(len)));
    }
    Ok(extensions)
}

/// Whether an extension list negotiates extended master secret.
pub fn has_extended_master_secret(extensions: &Extensions) -> bool {
    extensions
        .iter()
        .any(|(t, _)| *t == EXT_EXTENDED_MASTER_SECRET)
}

/// The baseline extension set both sides offer.
pub fn default_extensions() -> Extensions {
    vec![
        (EXT_EXTENDED_MASTER_SECRET, Bytes::new()),
        (
            EXT_SUPPORTED_GROUPS,
            Bytes::from_static(&[0x00, 0x02, 0x00, NAMED_CURVE_P256 as u8]),
        ),
        (EXT_EC_POINT_FORMATS, Bytes::from_static(&[0x01, 0x00])),
        (
            EXT_SIGNATURE_ALGORITHMS,
            Bytes::from_static(&[0x00, 0x02, 0x04, 0x03]),
        ),
    ]
}

/// ClientHello.
#[derive(Debug, Clone)]
pub struct ClientHello {
    /// 32-byte random; seed-derived for covert dials
    pub random: [u8; 32],
    /// Legacy session id (always empty here)
    pub session_id: Vec<u8>,
    /// DTLS cookie (empty: no HelloVerifyRequest exchange)
    pub cookie: Vec<u8>,
    /// Offered cipher suites
    pub cipher_suites: Vec<u16>,
    /// Offered compression methods
    pub compression_methods: Vec<u8>,
    /// Raw extensions
    pub extensions: Extensions,
}

impl ClientHello {
    /// Build the hello a covert dialer sends.
    pub fn new(random: [u8; 32]) -> Self {
        Self {
            random,
            session_id: Vec::new(),
            cookie: Vec::new(),
            cipher_suites: vec![CIPHER_SUITE],
            compression_methods: vec![0],
            extensions: default_extensions(),
        }
    }

    /// Encode the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(super::record::DTLS_1_2.0);
        buf.put_u8(super::record::DTLS_1_2.1);
        buf.put_slice(&self.random);
        buf.put_u8(self.session_id.len() as u8);
        buf.put_slice(&self.session_id);
        buf.put_u8(self.cookie.len() as u8);
        buf.put_slice(&self.cookie);
        buf.put_u16((self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            buf.put_u16(*suite);
        }
        buf.put_u8(self.compression_methods.len() as u8);
        buf.put_slice(&self.compression_methods);
        encode_extensions(&self.extensions, &mut buf);
        buf.freeze()
    }

    /// Decode a body.
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        if data.len() < 2 + 32 + 1 {
            return Err(Error::invalid("client hello too short"));
        }
        data.advance(2); // legacy version
        let mut random = [0u8; 32];
        random.copy_from_slice(&data.split_to(32));
        let sid_len = data.get_u8() as usize;
        if data.len() < sid_len + 1 {
            return Err(Error::invalid("client hello truncated at session id"));
        }
        let session_id = data.split_to(sid_len).to_vec();
        let cookie_len = data.get_u8() as usize;
        if data.len() < cookie_len + 2 {
            return Err(Error::invalid("client hello truncated at cookie"));
        }
        let cookie = data.split_to(cookie_len).to_vec();
        let suites_len = data.get_u16() as usize;
        if data.len() < suites_len + 1 || suites_len % 2 != 0 {
            return Err(Error::invalid("client hello truncated at cipher suites"));
        }
        let mut suites = data.split_to(suites_len);
        let mut cipher_suites = Vec::with_capacity(suites_len / 2);
        while suites.has_remaining() {
            cipher_suites.push(suites.get_u16());
        }
        let comp_len = data.get_u8() as usize;
        if data.len() < comp_len {
            return Err(Error::invalid("client hello truncated at compression"));
        }
        let compression_methods = data.split_to(comp_len).to_vec();
        let extensions = decode_extensions(data)?;
        Ok(Self {
            random,
            session_id,
            cookie,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }
}

/// ServerHello.
#[derive(Debug, Clone)]
pub struct ServerHello {
    /// 32-byte server random
    pub random: [u8; 32],
    /// Selected cipher suite
    pub cipher_suite: u16,
    /// Raw extensions
    pub extensions: Extensions,
}

impl ServerHello {
    /// Encode the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(super::record::DTLS_1_2.0);
        buf.put_u8(super::record::DTLS_1_2.1);
        buf.put_slice(&self.random);
        buf.put_u8(0); // empty session id
        buf.put_u16(self.cipher_suite);
        buf.put_u8(0); // null compression
        encode_extensions(&self.extensions, &mut buf);
        buf.freeze()
    }

    /// Decode a body.
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        if data.len() < 2 + 32 + 1 {
            return Err(Error::invalid("server hello too short"));
        }
        data.advance(2);
        let mut random = [0u8; 32];
        random.copy_from_slice(&data.split_to(32));
        let sid_len = data.get_u8() as usize;
        if data.len() < sid_len + 3 {
            return Err(Error::invalid("server hello truncated"));
        }
        data.advance(sid_len);
        let cipher_suite = data.get_u16();
        data.advance(1); // compression
        let extensions = decode_extensions(data)?;
        Ok(Self {
            random,
            cipher_suite,
            extensions,
        })
    }
}

/// Certificate chain message. The covert protocol always carries exactly one
/// self-signed certificate, but the codec keeps the list form.
#[derive(Debug, Clone)]
pub struct CertificateMsg {
    /// DER certificates, leaf first
    pub certificates: Vec<Bytes>,
}

impl CertificateMsg {
    /// Encode the body.
    pub fn encode(&self) -> Bytes {
        let total: usize = self.certificates.iter().map(|c| 3 + c.len()).sum();
        let mut buf = BytesMut::with_capacity(3 + total);
        buf.put_uint(total as u64, 3);
        for cert in &self.certificates {
            buf.put_uint(cert.len() as u64, 3);
            buf.put_slice(cert);
        }
        buf.freeze()
    }

    /// Decode a body.
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        if data.len() < 3 {
            return Err(Error::invalid("certificate message too short"));
        }
        let total = data.get_uint(3) as usize;
        if data.len() < total {
            return Err(Error::invalid("truncated certificate list"));
        }
        let mut list = data.split_to(total);
        let mut certificates = Vec::new();
        while list.len() >= 3 {
            let len = list.get_uint(3) as usize;
            if list.len() < len {
                return Err(Error::invalid("truncated certificate entry"));
            }
            certificates.push(list.split_to(len));
        }
        Ok(Self { certificates })
    }
}

/// ServerKeyExchange: signed ephemeral ECDHE parameters.
#[derive(Debug, Clone)]
pub struct ServerKeyExchange {
    /// Uncompressed SEC1 point of the server's ephemeral key
    pub public_key: Vec<u8>,
    /// DER ECDSA signature over client_random || server_random || params
    pub signature: Vec<u8>,
}

impl ServerKeyExchange {
    /// The byte string the signature covers, minus the randoms.
    pub fn params_bytes(&self) -> Vec<u8> {
        let mut params = Vec::with_capacity(4 + self.public_key.len());
        params.push(3); // curve_type: named_curve
        params.extend_from_slice(&NAMED_CURVE_P256.to_be_bytes());
        params.push(self.public_key.len() as u8);
        params.extend_from_slice(&self.public_key);
        params
    }

    /// Encode the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&self.params_bytes());
        buf.put_u16(SIG_ECDSA_SHA256);
        buf.put_u16(self.signature.len() as u16);
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    /// Decode a body.
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::invalid("server key exchange too short"));
        }
        let curve_type = data.get_u8();
        let curve = data.get_u16();
        if curve_type != 3 || curve != NAMED_CURVE_P256 {
            return Err(Error::invalid("unsupported key exchange curve"));
        }
        let point_len = data.get_u8() as usize;
        if data.len() < point_len + 4 {
            return Err(Error::invalid("truncated key exchange point"));
        }
        let public_key = data.split_to(point_len).to_vec();
        let sig_alg = data.get_u16();
        if sig_alg != SIG_ECDSA_SHA256 {
            return Err(Error::invalid("unsupported key exchange signature"));
        }
        let sig_len = data.get_u16() as usize;
        if data.len() < sig_len {
            return Err(Error::invalid("truncated key exchange signature"));
        }
        let signature = data.split_to(sig_len).to_vec();
        Ok(Self {
            public_key,
            signature,
        })
    }
}

/// CertificateRequest: client authentication is always required.
#[derive(Debug, Clone)]
pub struct CertificateRequest;

impl CertificateRequest {
    /// Encode the body: ecdsa_sign, sha256/ecdsa, no CA constraints.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(1); // one certificate type
        buf.put_u8(64); // ecdsa_sign
        buf.put_u16(2);
        buf.put_u16(SIG_ECDSA_SHA256);
        buf.put_u16(0); // no certificate authorities
        buf.freeze()
    }

    /// Decode a body (contents are fixed; only shape is checked).
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        if data.len() < 1 {
            return Err(Error::invalid("certificate request too short"));
        }
        let type_count = data.get_u8() as usize;
        if data.len() < type_count + 2 {
            return Err(Error::invalid("truncated certificate request"));
        }
        data.advance(type_count);
        let algs_len = data.get_u16() as usize;
        if data.len() < algs_len + 2 {
            return Err(Error::invalid("truncated certificate request algorithms"));
        }
        data.advance(algs_len);
        let ca_len = data.get_u16() as usize;
        if data.len() < ca_len {
            return Err(Error::invalid("truncated certificate request CAs"));
        }
        data.advance(ca_len);
        Ok(Self)
    }
}

/// ClientKeyExchange: the client's ephemeral ECDHE point.
#[derive(Debug, Clone)]
pub struct ClientKeyExchange {
    /// Uncompressed SEC1 point
    pub public_key: Vec<u8>,
}

impl ClientKeyExchange {
    /// Encode the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.public_key.len());
        buf.put_u8(self.public_key.len() as u8);
        buf.put_slice(&self.public_key);
        buf.freeze()
    }

    /// Decode a body.
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::invalid("client key exchange too short"));
        }
        let len = data.get_u8() as usize;
        if data.len() < len {
            return Err(Error::invalid("truncated client key exchange"));
        }
        Ok(Self {
            public_key: data.split_to(len).to_vec(),
        })
    }
}

/// CertificateVerify: client's signature over the running transcript.
#[derive(Debug, Clone)]
pub struct CertificateVerify {
    /// DER ECDSA signature
    pub signature: Vec<u8>,
}

impl CertificateVerify {
    /// Encode the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(SIG_ECDSA_SHA256);
        buf.put_u16(self.signature.len() as u16);
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    /// Decode a body.
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::invalid("certificate verify too short"));
        }
        let sig_alg = data.get_u16();
        if sig_alg != SIG_ECDSA_SHA256 {
            return Err(Error::invalid("unsupported certificate verify algorithm"));
        }
        let len = data.get_u16() as usize;
        if data.len() < len {
            return Err(Error::invalid("truncated certificate verify"));
        }
        Ok(Self {
            signature: data.split_to(len).to_vec(),
        })
    }
}

/// Finished: PRF-derived digest of the transcript.
#[derive(Debug, Clone)]
pub struct Finished {
    /// 12-byte verify_data
    pub verify_data: Vec<u8>,
}

impl Finished {
    /// Encode the body.
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.verify_data)
    }

    /// Decode a body.
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        if data.len() != 12 {
            return Err(Error::invalid("finished verify_data must be 12 bytes"));
        }
        Ok(Self {
            verify_data: data.split_to(12).to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_round_trip() {
        let hello = ClientHello::new([0x42; 32]);
        let body = hello.encode();

        let mut data = body.clone();
        let decoded = ClientHello::decode(&mut data).unwrap();
        assert_eq!(decoded.random, [0x42; 32]);
        assert_eq!(decoded.cipher_suites, vec![CIPHER_SUITE]);
        assert!(has_extended_master_secret(&decoded.extensions));
    }

    #[test]
    fn test_client_hello_without_extensions() {
        let hello = ClientHello {
            random: [1; 32],
            session_id: Vec::new(),
            cookie: Vec::new(),
            cipher_suites: Vec::new(),
            compression_methods: vec![0],
            extensions: Vec::new(),
        };
        let mut data = hello.encode();
        let decoded = ClientHello::decode(&mut data).unwrap();
        assert!(decoded.cipher_suites.is_empty());
        assert!(!has_extended_master_secret(&decoded.extensions));
    }

    #[test]
    fn test_server_hello_round_trip() {
        let hello = ServerHello {
            random: [7; 32],
            cipher_suite: CIPHER_SUITE,
            extensions: default_extensions(),
        };
        let mut data = hello.encode();
        let decoded = ServerHello::decode(&mut data).unwrap();
        assert_eq!(decoded.random, [7; 32]);
        assert_eq!(decoded.cipher_suite, CIPHER_SUITE);
        assert!(has_extended_master_secret(&decoded.extensions));
    }

    #[test]
    fn test_certificate_round_trip() {
        let msg = CertificateMsg {
            certificates: vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")],
        };
        let mut data = msg.encode();
        let decoded = CertificateMsg::decode(&mut data).unwrap();
        assert_eq!(decoded.certificates.len(), 2);
        assert_eq!(&decoded.certificates[0][..], b"first");
    }

    #[test]
    fn test_server_key_exchange_round_trip() {
        let ske = ServerKeyExchange {
            public_key: vec![4; 65],
            signature: vec![9; 70],
        };
        let mut data = ske.encode();
        let decoded = ServerKeyExchange::decode(&mut data).unwrap();
        assert_eq!(decoded.public_key, vec![4; 65]);
        assert_eq!(decoded.signature, vec![9; 70]);
    }

    #[test]
    fn test_handshake_message_round_trip() {
        let msg = HandshakeMessage {
            msg_type: HandshakeType::Finished,
            message_seq: 3,
            body: Bytes::from_static(&[0u8; 12]),
        };
        let mut data = msg.to_bytes();
        let decoded = HandshakeMessage::decode(&mut data).unwrap().unwrap();
        assert_eq!(decoded.msg_type, HandshakeType::Finished);
        assert_eq!(decoded.message_seq, 3);
        assert_eq!(decoded.body.len(), 12);
    }

    #[test]
    fn test_fragmented_handshake_rejected() {
        let msg = HandshakeMessage {
            msg_type: HandshakeType::Certificate,
            message_seq: 0,
            body: Bytes::from_static(b"0123456789"),
        };
        let mut raw = BytesMut::new();
        msg.encode(&mut raw);
        raw[9] = 0;
        raw[10] = 0;
        raw[11] = 5; // fragment_length != total_length

        let mut data = raw.freeze();
        assert!(HandshakeMessage::decode(&mut data).is_err());
    }
}

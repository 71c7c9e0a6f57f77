//! TLS 1.2 PRF, key schedule, and AES-128-GCM record protection.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce, Tag};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::record::{ContentType, DTLS_1_2};
use crate::error::{Error, Result};

const KEY_LEN: usize = 16;
const IV_LEN: usize = 4;
const NONCE_EXPLICIT_LEN: usize = 8;
const TAG_LEN: usize = 16;

/// P_SHA256 expansion from RFC 5246 §5.
pub fn prf_sha256(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    let prototype = <Hmac<Sha256> as Mac>::new_from_slice(secret)
        .map_err(|_| Error::handshake("prf: invalid hmac key"))?;

    let mut output = Vec::with_capacity(out_len);
    let mut a = label_seed.clone();
    while output.len() < out_len {
        let mut mac = prototype.clone();
        mac.update(&a);
        a = mac.finalize().into_bytes().to_vec();

        let mut mac = prototype.clone();
        mac.update(&a);
        mac.update(&label_seed);
        let block = mac.finalize().into_bytes();

        let take = block.len().min(out_len - output.len());
        output.extend_from_slice(&block[..take]);
    }
    Ok(output)
}

/// Derive the master secret.
///
/// Extended master secret is mandatory on this wire, so the seed is always
/// the session hash of the transcript up to (and including)
/// ClientKeyExchange, never the random concatenation.
pub fn master_secret(pre_master: &[u8], transcript: &[u8]) -> Result<Vec<u8>> {
    let session_hash = Sha256::digest(transcript);
    prf_sha256(pre_master, b"extended master secret", &session_hash, 48)
}

/// Finished verify_data over the transcript so far.
pub fn verify_data(master: &[u8], label: &[u8], transcript: &[u8]) -> Result<Vec<u8>> {
    let hash = Sha256::digest(transcript);
    prf_sha256(master, label, &hash, 12)
}

/// Directional record-protection keys for the single AES-128-GCM suite.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Master secret, kept for Finished computation
    pub master: Vec<u8>,
    client_key: [u8; KEY_LEN],
    server_key: [u8; KEY_LEN],
    client_iv: [u8; IV_LEN],
    server_iv: [u8; IV_LEN],
}

impl SessionKeys {
    /// Run the RFC 5246 key expansion.
    pub fn expand(master: &[u8], client_random: &[u8], server_random: &[u8]) -> Result<Self> {
        let seed = [server_random, client_random].concat();
        let block = prf_sha256(master, b"key expansion", &seed, 2 * KEY_LEN + 2 * IV_LEN)?;

        let mut keys = SessionKeys {
            master: master.to_vec(),
            client_key: [0; KEY_LEN],
            server_key: [0; KEY_LEN],
            client_iv: [0; IV_LEN],
            server_iv: [0; IV_LEN],
        };
        keys.client_key.copy_from_slice(&block[..KEY_LEN]);
        keys.server_key.copy_from_slice(&block[KEY_LEN..2 * KEY_LEN]);
        keys.client_iv
            .copy_from_slice(&block[2 * KEY_LEN..2 * KEY_LEN + IV_LEN]);
        keys.server_iv.copy_from_slice(&block[2 * KEY_LEN + IV_LEN..]);
        Ok(keys)
    }

    /// Build the record ciphers for one side of the connection.
    pub fn cipher(&self, is_client: bool) -> RecordCipher {
        let (write_key, write_iv, read_key, read_iv) = if is_client {
            (self.client_key, self.client_iv, self.server_key, self.server_iv)
        } else {
            (self.server_key, self.server_iv, self.client_key, self.client_iv)
        };
        RecordCipher {
            write: Aes128Gcm::new_from_slice(&write_key).expect("aes-128 key length"),
            write_iv,
            read: Aes128Gcm::new_from_slice(&read_key).expect("aes-128 key length"),
            read_iv,
        }
    }
}

/// Sealing/opening state for protected records, oriented to one role.
pub struct RecordCipher {
    write: Aes128Gcm,
    write_iv: [u8; IV_LEN],
    read: Aes128Gcm,
    read_iv: [u8; IV_LEN],
}

fn make_aad(seq: u64, content_type: ContentType, len: usize) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&seq.to_be_bytes());
    aad[8] = content_type.to_u8();
    aad[9] = DTLS_1_2.0;
    aad[10] = DTLS_1_2.1;
    aad[11..].copy_from_slice(&(len as u16).to_be_bytes());
    aad
}

fn nonce_for(iv: &[u8; IV_LEN], explicit: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..IV_LEN].copy_from_slice(iv);
    nonce[IV_LEN..].copy_from_slice(explicit);
    nonce
}

impl RecordCipher {
    /// Seal a payload: explicit nonce || ciphertext || tag.
    pub fn seal(&self, seq: u64, content_type: ContentType, plaintext: &[u8]) -> Result<Vec<u8>> {
        let explicit = seq.to_be_bytes();
        let nonce_bytes = nonce_for(&self.write_iv, &explicit);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = make_aad(seq, content_type, plaintext.len());

        let mut out = Vec::with_capacity(NONCE_EXPLICIT_LEN + plaintext.len() + TAG_LEN);
        out.extend_from_slice(&explicit);
        out.extend_from_slice(plaintext);
        let tag = self
            .write
            .encrypt_in_place_detached(nonce, &aad, &mut out[NONCE_EXPLICIT_LEN..])
            .map_err(|_| Error::handshake("record encryption failed"))?;
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Open a protected payload.
    pub fn open(&self, seq: u64, content_type: ContentType, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_EXPLICIT_LEN + TAG_LEN {
            return Err(Error::invalid("protected record too short"));
        }
        let (explicit, rest) = payload.split_at(NONCE_EXPLICIT_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        let nonce_bytes = nonce_for(&self.read_iv, explicit);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = make_aad(seq, content_type, ciphertext.len());

        let mut out = ciphertext.to_vec();
        self.read
            .decrypt_in_place_detached(nonce, &aad, &mut out, Tag::from_slice(tag))
            .map_err(|_| Error::handshake("record authentication failed"))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_is_deterministic() {
        let a = prf_sha256(b"secret", b"label", b"seed", 48).unwrap();
        let b = prf_sha256(b"secret", b"label", b"seed", 48).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 48);

        let c = prf_sha256(b"secret", b"label", b"other seed", 48).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_expansion_symmetric() {
        let master = prf_sha256(b"pms", b"extended master secret", b"hash", 48).unwrap();
        let client = SessionKeys::expand(&master, &[1; 32], &[2; 32]).unwrap();
        let server = SessionKeys::expand(&master, &[1; 32], &[2; 32]).unwrap();

        assert_eq!(client.client_key, server.client_key);
        assert_eq!(client.server_iv, server.server_iv);
        assert_ne!(client.client_key, client.server_key);
    }

    #[test]
    fn test_seal_open_round_trip() {
        let master = vec![0x5a; 48];
        let keys_a = SessionKeys::expand(&master, &[1; 32], &[2; 32]).unwrap();
        let keys_b = SessionKeys::expand(&master, &[1; 32], &[2; 32]).unwrap();
        let client = keys_a.cipher(true);
        let server = keys_b.cipher(false);

        let seq = (1u64 << 48) | 9;
        let sealed = client
            .seal(seq, ContentType::ApplicationData, b"covert bytes")
            .unwrap();
        assert_ne!(&sealed[NONCE_EXPLICIT_LEN..], b"covert bytes".as_slice());

        let opened = server
            .open(seq, ContentType::ApplicationData, &sealed)
            .unwrap();
        assert_eq!(opened, b"covert bytes");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let master = vec![0x5a; 48];
        let client = SessionKeys::expand(&master, &[1; 32], &[2; 32])
            .unwrap()
            .cipher(true);
        let server = SessionKeys::expand(&master, &[1; 32], &[2; 32])
            .unwrap()
            .cipher(false);

        let seq = 1u64 << 48;
        let mut sealed = client.seal(seq, ContentType::ApplicationData, b"data").unwrap();
        sealed[NONCE_EXPLICIT_LEN] ^= 1;
        assert!(server.open(seq, ContentType::ApplicationData, &sealed).is_err());

        // Wrong sequence breaks the AAD binding.
        let sealed = client.seal(seq, ContentType::ApplicationData, b"data").unwrap();
        assert!(server
            .open(seq + 1, ContentType::ApplicationData, &sealed)
            .is_err());
    }

    #[test]
    fn test_verify_data_length() {
        let vd = verify_data(&[0u8; 48], b"client finished", b"transcript").unwrap();
        assert_eq!(vd.len(), 12);
    }
}

//! Deterministic keystream and identity material derived from a session seed.
//!
//! Both peers hold the registration's shared secret and must arrive at
//! byte-identical identity material without ever exchanging it. Everything
//! here is a pure function of the seed: the keystream is a streaming
//! HKDF-SHA256 expansion (no salt, no info), and every derivation step
//! re-instantiates the stream from offset zero. That convention is part of
//! the wire contract — the dialer and the listener must never diverge on it.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdsa::SigningKey;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Length of the ClientHello random field, and of the connection ID it
/// doubles as.
pub const CONNECTION_ID_LEN: usize = 32;

/// The in-band demultiplexing key: a seed-derived ClientHello random.
pub type ConnectionId = [u8; CONNECTION_ID_LEN];

type HmacSha256 = Hmac<Sha256>;

/// A deterministic CSPRNG over the HKDF-SHA256 expansion of a seed.
///
/// Reads produce the same byte sequence as a streaming HKDF reader:
/// `T(n) = HMAC(PRK, T(n-1) || n)` with empty info, consumed front to back.
pub struct SeedStream {
    prk: HmacSha256,
    block: [u8; 32],
    offset: usize,
    counter: u8,
}

impl SeedStream {
    /// Create a stream positioned at keystream offset zero.
    pub fn new(seed: &[u8]) -> Self {
        let (prk, _) = Hkdf::<Sha256>::extract(None, seed);
        let prk = HmacSha256::new_from_slice(&prk)
            .expect("hmac accepts keys of any length");
        Self {
            prk,
            block: [0u8; 32],
            offset: 32,
            counter: 0,
        }
    }

    /// Fill `dest` with the next keystream bytes.
    pub fn fill(&mut self, dest: &mut [u8]) -> Result<()> {
        for byte in dest.iter_mut() {
            if self.offset == 32 {
                self.next_block()?;
            }
            *byte = self.block[self.offset];
            self.offset += 1;
        }
        Ok(())
    }

    fn next_block(&mut self) -> Result<()> {
        if self.counter == u8::MAX {
            return Err(Error::certification("seed keystream exhausted"));
        }
        let mut mac = self.prk.clone();
        if self.counter > 0 {
            mac.update(&self.block);
        }
        self.counter += 1;
        mac.update(&[self.counter]);
        self.block.copy_from_slice(&mac.finalize().into_bytes());
        self.offset = 0;
        Ok(())
    }
}

impl Drop for SeedStream {
    fn drop(&mut self) {
        self.block.zeroize();
    }
}

/// Derive the ClientHello random for a seed: the first 32 keystream bytes.
///
/// Visible in cleartext on the first handshake packet; the listener keys its
/// dispatch tables on it.
pub fn client_hello_random_from_seed(seed: &[u8]) -> Result<ConnectionId> {
    let mut stream = SeedStream::new(seed);
    let mut random = [0u8; CONNECTION_ID_LEN];
    stream.fill(&mut random)?;
    Ok(random)
}

/// Derive the ECDSA-P256 signing key for a seed.
///
/// Candidates are rejection-sampled from a fresh keystream until one lands
/// in the scalar field, so the result is stable across processes.
pub fn signing_key_from_seed(seed: &[u8]) -> Result<SigningKey> {
    let mut stream = SeedStream::new(seed);
    // A valid scalar on the first draw is overwhelmingly likely; the bound
    // exists so a broken stream cannot spin forever.
    for _ in 0..128 {
        let mut candidate = [0u8; 32];
        stream.fill(&mut candidate)?;
        if let Ok(key) = SigningKey::from_slice(&candidate) {
            candidate.zeroize();
            return Ok(key);
        }
        candidate.zeroize();
    }
    Err(Error::certification("no valid P-256 scalar in keystream"))
}

/// Derive the 130-bit certificate serial for a seed.
pub fn serial_from_seed(seed: &[u8]) -> Result<[u8; 17]> {
    let mut stream = SeedStream::new(seed);
    let mut serial = [0u8; 17];
    stream.fill(&mut serial)?;
    // Top bits masked so the value fits 130 bits.
    serial[0] &= 0x03;
    Ok(serial)
}

/// Derive the certificate subject CN for a seed: 8 keystream bytes, hex.
pub fn subject_cn_from_seed(seed: &[u8]) -> Result<String> {
    let mut stream = SeedStream::new(seed);
    let mut cn = [0u8; 8];
    stream.fill(&mut cn)?;
    Ok(hex::encode(cn))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &[u8] = b"hihihihihihihihihihihihihihihihi";

    #[test]
    fn test_stream_is_deterministic() {
        let mut a = SeedStream::new(SEED);
        let mut b = SeedStream::new(SEED);

        let mut out_a = [0u8; 96];
        let mut out_b = [0u8; 96];
        a.fill(&mut out_a).unwrap();
        b.fill(&mut out_b).unwrap();

        assert_eq!(out_a, out_b);
        assert!(!out_a.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_stream_differs_per_seed() {
        let mut a = SeedStream::new(SEED);
        let mut b = SeedStream::new(b"another seed entirely");

        let mut out_a = [0u8; 32];
        let mut out_b = [0u8; 32];
        a.fill(&mut out_a).unwrap();
        b.fill(&mut out_b).unwrap();

        assert_ne!(out_a, out_b);
    }

    #[test]
    fn test_split_reads_match_single_read() {
        let mut whole = SeedStream::new(SEED);
        let mut split = SeedStream::new(SEED);

        let mut expected = [0u8; 80];
        whole.fill(&mut expected).unwrap();

        let mut first = [0u8; 7];
        let mut second = [0u8; 73];
        split.fill(&mut first).unwrap();
        split.fill(&mut second).unwrap();

        assert_eq!(&expected[..7], &first[..]);
        assert_eq!(&expected[7..], &second[..]);
    }

    #[test]
    fn test_client_hello_random_is_stream_prefix() {
        let random = client_hello_random_from_seed(SEED).unwrap();

        let mut stream = SeedStream::new(SEED);
        let mut prefix = [0u8; 32];
        stream.fill(&mut prefix).unwrap();

        assert_eq!(random, prefix);
    }

    #[test]
    fn test_signing_key_determinism_zero_seed() {
        let seed = [0u8; 32];
        let a = signing_key_from_seed(&seed).unwrap();
        let b = signing_key_from_seed(&seed).unwrap();

        assert_eq!(
            a.verifying_key().to_encoded_point(false),
            b.verifying_key().to_encoded_point(false)
        );
        assert_eq!(
            client_hello_random_from_seed(&seed).unwrap(),
            client_hello_random_from_seed(&seed).unwrap()
        );
        assert_eq!(
            subject_cn_from_seed(&seed).unwrap(),
            subject_cn_from_seed(&seed).unwrap()
        );
    }

    #[test]
    fn test_serial_fits_130_bits() {
        let serial = serial_from_seed(SEED).unwrap();
        assert_eq!(serial.len(), 17);
        assert!(serial[0] <= 0x03);
    }

    #[test]
    fn test_subject_cn_is_hex() {
        let cn = subject_cn_from_seed(SEED).unwrap();
        assert_eq!(cn.len(), 16);
        assert!(cn.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! DTLS 1.2 record layer codec.
//!
//! A record is the 13-byte header (content type, version, epoch, 48-bit
//! sequence number, length) followed by the payload. Epoch 0 records travel
//! in the clear; epoch 1 payloads are AES-GCM protected. Several records may
//! share one datagram, so decoding consumes from the front of a buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// DTLS 1.2 on the wire: 254.253.
pub const DTLS_1_2: (u8, u8) = (254, 253);

/// Record header length.
pub const HEADER_LEN: usize = 13;

/// Upper bound on a record payload, matching the TLS ciphertext limit.
pub const MAX_PAYLOAD: usize = 16384 + 256;

/// Record content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Epoch-switch marker
    ChangeCipherSpec,
    /// Alert (the engine only ever emits close_notify)
    Alert,
    /// Handshake flight payload
    Handshake,
    /// Post-handshake user data
    ApplicationData,
}

impl ContentType {
    /// Wire value.
    pub fn to_u8(self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
        }
    }

    /// Parse a wire value.
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            other => Err(Error::invalid(format!("unknown content type {other}"))),
        }
    }
}

/// One DTLS record.
#[derive(Debug, Clone)]
pub struct Record {
    /// Content type of the payload
    pub content_type: ContentType,
    /// Cipher epoch: 0 before ChangeCipherSpec, 1 after
    pub epoch: u16,
    /// 48-bit record sequence number within the epoch
    pub sequence: u64,
    /// Payload (ciphertext when epoch > 0)
    pub payload: Bytes,
}

impl Record {
    /// Encode into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.payload.len());
        buf.put_u8(self.content_type.to_u8());
        buf.put_u8(DTLS_1_2.0);
        buf.put_u8(DTLS_1_2.1);
        buf.put_u16(self.epoch);
        buf.put_uint(self.sequence & 0xffff_ffff_ffff, 6);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }

    /// Decode one record off the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` is empty; errors on truncated or
    /// malformed input.
    pub fn decode(data: &mut Bytes) -> Result<Option<Record>> {
        if data.is_empty() {
            return Ok(None);
        }
        if data.len() < HEADER_LEN {
            return Err(Error::invalid("truncated record header"));
        }
        let content_type = ContentType::from_u8(data.get_u8())?;
        let major = data.get_u8();
        let minor = data.get_u8();
        if (major, minor) != DTLS_1_2 {
            return Err(Error::invalid(format!(
                "unsupported record version {major}.{minor}"
            )));
        }
        let epoch = data.get_u16();
        let sequence = data.get_uint(6);
        let len = data.get_u16() as usize;
        if len > MAX_PAYLOAD {
            return Err(Error::invalid(format!("record payload too large: {len}")));
        }
        if data.len() < len {
            return Err(Error::invalid("truncated record payload"));
        }
        let payload = data.split_to(len);
        Ok(Some(Record {
            content_type,
            epoch,
            sequence,
            payload,
        }))
    }

    /// The 64-bit sequence used for nonces and AAD: epoch in the top 16
    /// bits, record sequence in the low 48.
    pub fn full_sequence(&self) -> u64 {
        ((self.epoch as u64) << 48) | (self.sequence & 0xffff_ffff_ffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let record = Record {
            content_type: ContentType::Handshake,
            epoch: 0,
            sequence: 7,
            payload: Bytes::from_static(b"flight one"),
        };

        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN + 10);
        assert_eq!(buf[0], 22);
        assert_eq!((buf[1], buf[2]), DTLS_1_2);

        let mut data = buf.freeze();
        let decoded = Record::decode(&mut data).unwrap().unwrap();
        assert_eq!(decoded.content_type, ContentType::Handshake);
        assert_eq!(decoded.epoch, 0);
        assert_eq!(decoded.sequence, 7);
        assert_eq!(&decoded.payload[..], b"flight one");
        assert!(data.is_empty());
    }

    #[test]
    fn test_multiple_records_per_datagram() {
        let mut buf = BytesMut::new();
        for seq in 0..3u64 {
            Record {
                content_type: ContentType::Handshake,
                epoch: 0,
                sequence: seq,
                payload: Bytes::from_static(b"x"),
            }
            .encode(&mut buf);
        }

        let mut data = buf.freeze();
        let mut seqs = Vec::new();
        while let Some(record) = Record::decode(&mut data).unwrap() {
            seqs.push(record.sequence);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_full_sequence_packs_epoch() {
        let record = Record {
            content_type: ContentType::ApplicationData,
            epoch: 1,
            sequence: 5,
            payload: Bytes::new(),
        };
        assert_eq!(record.full_sequence(), (1u64 << 48) | 5);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let mut data = Bytes::from_static(&[22, 254, 253, 0, 0]);
        assert!(Record::decode(&mut data).is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let record = Record {
            content_type: ContentType::Handshake,
            epoch: 0,
            sequence: 0,
            payload: Bytes::new(),
        };
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        buf[1] = 3; // TLS, not DTLS

        let mut data = buf.freeze();
        assert!(Record::decode(&mut data).is_err());
    }
}

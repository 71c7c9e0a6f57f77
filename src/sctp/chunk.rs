//! SCTP chunk codec.
//!
//! The subset the covert stream needs: association setup, DATA with
//! fragmentation flags, cumulative SACK, and SHUTDOWN. Chunk type values
//! match RFC 4960 so captures read sensibly in a dissector.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Payload protocol identifier for WebRTC string data, carried on every
/// DATA chunk of the covert stream.
pub const PPID_WEBRTC_STRING: u32 = 51;

/// The single stream the covert bytestream runs on.
pub const STREAM_ID: u16 = 0;

/// DATA flag: first fragment of a message.
pub const FLAG_BEGIN: u8 = 0x02;

/// DATA flag: last fragment of a message.
pub const FLAG_END: u8 = 0x01;

const TYPE_DATA: u8 = 0;
const TYPE_INIT: u8 = 1;
const TYPE_INIT_ACK: u8 = 2;
const TYPE_SACK: u8 = 3;
const TYPE_SHUTDOWN: u8 = 7;

/// One SCTP chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Association request with the sender's initial TSN
    Init {
        /// First TSN the sender will use
        initial_tsn: u32,
    },
    /// Association acknowledgment with the responder's initial TSN
    InitAck {
        /// First TSN the responder will use
        initial_tsn: u32,
    },
    /// A payload fragment
    Data {
        /// Transmission sequence number
        tsn: u32,
        /// Stream identifier
        stream_id: u16,
        /// Payload protocol identifier
        ppid: u32,
        /// Fragmentation flags
        flags: u8,
        /// Fragment bytes
        payload: Bytes,
    },
    /// Cumulative acknowledgment
    Sack {
        /// Highest TSN received in order
        cum_tsn: u32,
    },
    /// Graceful association teardown
    Shutdown,
}

impl Chunk {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Chunk::Init { initial_tsn } => {
                buf.put_u8(TYPE_INIT);
                buf.put_u8(0);
                buf.put_u32(*initial_tsn);
            }
            Chunk::InitAck { initial_tsn } => {
                buf.put_u8(TYPE_INIT_ACK);
                buf.put_u8(0);
                buf.put_u32(*initial_tsn);
            }
            Chunk::Data {
                tsn,
                stream_id,
                ppid,
                flags,
                payload,
            } => {
                buf.put_u8(TYPE_DATA);
                buf.put_u8(*flags);
                buf.put_u32(*tsn);
                buf.put_u16(*stream_id);
                buf.put_u32(*ppid);
                buf.put_slice(payload);
            }
            Chunk::Sack { cum_tsn } => {
                buf.put_u8(TYPE_SACK);
                buf.put_u8(0);
                buf.put_u32(*cum_tsn);
            }
            Chunk::Shutdown => {
                buf.put_u8(TYPE_SHUTDOWN);
                buf.put_u8(0);
            }
        }
        buf.freeze()
    }

    /// Decode from one DTLS frame.
    pub fn decode(mut data: Bytes) -> Result<Chunk> {
        if data.len() < 2 {
            return Err(Error::sctp("chunk too short"));
        }
        let chunk_type = data.get_u8();
        let flags = data.get_u8();
        match chunk_type {
            TYPE_INIT => {
                if data.len() < 4 {
                    return Err(Error::sctp("truncated init"));
                }
                Ok(Chunk::Init {
                    initial_tsn: data.get_u32(),
                })
            }
            TYPE_INIT_ACK => {
                if data.len() < 4 {
                    return Err(Error::sctp("truncated init ack"));
                }
                Ok(Chunk::InitAck {
                    initial_tsn: data.get_u32(),
                })
            }
            TYPE_DATA => {
                if data.len() < 10 {
                    return Err(Error::sctp("truncated data chunk"));
                }
                let tsn = data.get_u32();
                let stream_id = data.get_u16();
                let ppid = data.get_u32();
                Ok(Chunk::Data {
                    tsn,
                    stream_id,
                    ppid,
                    flags,
                    payload: data,
                })
            }
            TYPE_SACK => {
                if data.len() < 4 {
                    return Err(Error::sctp("truncated sack"));
                }
                Ok(Chunk::Sack {
                    cum_tsn: data.get_u32(),
                })
            }
            TYPE_SHUTDOWN => Ok(Chunk::Shutdown),
            other => Err(Error::sctp(format!("unknown chunk type {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_round_trip() {
        let chunk = Chunk::Data {
            tsn: 42,
            stream_id: STREAM_ID,
            ppid: PPID_WEBRTC_STRING,
            flags: FLAG_BEGIN | FLAG_END,
            payload: Bytes::from_static(b"payload"),
        };
        let decoded = Chunk::decode(chunk.encode()).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_control_round_trips() {
        for chunk in [
            Chunk::Init { initial_tsn: 1 },
            Chunk::InitAck { initial_tsn: 99 },
            Chunk::Sack { cum_tsn: 7 },
            Chunk::Shutdown,
        ] {
            assert_eq!(Chunk::decode(chunk.encode()).unwrap(), chunk);
        }
    }

    #[test]
    fn test_empty_payload_data() {
        let chunk = Chunk::Data {
            tsn: 0,
            stream_id: 0,
            ppid: PPID_WEBRTC_STRING,
            flags: FLAG_BEGIN | FLAG_END,
            payload: Bytes::new(),
        };
        assert_eq!(Chunk::decode(chunk.encode()).unwrap(), chunk);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Chunk::decode(Bytes::from_static(&[0xff, 0, 1, 2])).is_err());
        assert!(Chunk::decode(Bytes::from_static(&[0])).is_err());
    }
}

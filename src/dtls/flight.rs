//! Handshake flight I/O shared by the client and server engines.
//!
//! Flights are buffered into a single datagram, recorded for retransmission,
//! and replayed when the peer goes quiet. Incoming records are decoded into
//! handshake messages with duplicate suppression; a datagram that contains
//! nothing but duplicates means our last flight was lost, so it is resent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use super::conn::PacketTransport;
use super::crypto::RecordCipher;
use super::message::{HandshakeMessage, HandshakeType};
use super::record::{ContentType, Record};
use crate::error::{Error, Result};

/// Time to wait for the peer's next flight before retransmitting ours.
const RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Retransmissions attempted before the handshake is abandoned.
const MAX_RETRANSMITS: u32 = 6;

/// One unit delivered by [`FlightIo::next`].
pub(crate) enum Incoming {
    /// A handshake message (transcript handling is the caller's call)
    Message(HandshakeMessage),
    /// The peer's ChangeCipherSpec marker
    ChangeCipherSpec,
}

pub(crate) struct FlightIo {
    transport: Arc<dyn PacketTransport>,
    transcript: Vec<u8>,
    next_send_msg_seq: u16,
    next_send_record_seq: u64,
    epoch1_record_seq: u64,
    next_recv_msg_seq: u16,
    outgoing: BytesMut,
    last_flight: Option<Bytes>,
    leftover: Bytes,
    pending: VecDeque<Incoming>,
    /// Encrypted handshake records that arrived before the session cipher
    /// existed (the peer's Finished shares a datagram with the material
    /// that creates the cipher).
    deferred: Vec<Record>,
    seen_peer_ccs: bool,
}

impl FlightIo {
    pub(crate) fn new(transport: Arc<dyn PacketTransport>) -> Self {
        Self {
            transport,
            transcript: Vec::new(),
            next_send_msg_seq: 0,
            next_send_record_seq: 0,
            epoch1_record_seq: 0,
            next_recv_msg_seq: 0,
            outgoing: BytesMut::new(),
            last_flight: None,
            leftover: Bytes::new(),
            pending: VecDeque::new(),
            deferred: Vec::new(),
            seen_peer_ccs: false,
        }
    }

    /// Append a plaintext handshake message to the current flight and the
    /// transcript.
    pub(crate) fn add_message(&mut self, msg_type: HandshakeType, body: Bytes) {
        let msg = HandshakeMessage {
            msg_type,
            message_seq: self.next_send_msg_seq,
            body,
        };
        self.next_send_msg_seq += 1;
        let wire = msg.to_bytes();
        self.transcript.extend_from_slice(&wire);
        let record = Record {
            content_type: ContentType::Handshake,
            epoch: 0,
            sequence: self.next_send_record_seq,
            payload: wire,
        };
        self.next_send_record_seq += 1;
        record.encode(&mut self.outgoing);
    }

    /// Append our ChangeCipherSpec marker. Not part of the transcript.
    pub(crate) fn add_ccs(&mut self) {
        let record = Record {
            content_type: ContentType::ChangeCipherSpec,
            epoch: 0,
            sequence: self.next_send_record_seq,
            payload: Bytes::from_static(&[1]),
        };
        self.next_send_record_seq += 1;
        record.encode(&mut self.outgoing);
    }

    /// Append our encrypted Finished message (first epoch-1 record).
    pub(crate) fn add_finished(&mut self, cipher: &RecordCipher, verify_data: Bytes) -> Result<()> {
        let msg = HandshakeMessage {
            msg_type: HandshakeType::Finished,
            message_seq: self.next_send_msg_seq,
            body: verify_data,
        };
        self.next_send_msg_seq += 1;
        let wire = msg.to_bytes();
        self.transcript.extend_from_slice(&wire);

        let seq = self.epoch1_record_seq;
        self.epoch1_record_seq += 1;
        let full_seq = (1u64 << 48) | seq;
        let sealed = cipher.seal(full_seq, ContentType::Handshake, &wire)?;
        let record = Record {
            content_type: ContentType::Handshake,
            epoch: 1,
            sequence: seq,
            payload: Bytes::from(sealed),
        };
        record.encode(&mut self.outgoing);
        Ok(())
    }

    /// Send the buffered flight and remember it for retransmission.
    pub(crate) async fn send_flight(&mut self) -> Result<()> {
        let datagram = self.outgoing.split().freeze();
        self.transport.send(&datagram).await?;
        self.last_flight = Some(datagram);
        Ok(())
    }

    /// Wait for the next handshake item, retransmitting our last flight
    /// whenever the peer stalls or echoes duplicates.
    pub(crate) async fn next(&mut self, cipher: Option<&RecordCipher>) -> Result<Incoming> {
        let mut retransmits = 0u32;
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(item);
            }

            let saw_only_duplicates = self.drain_leftover(cipher)?;
            if !self.pending.is_empty() {
                continue;
            }
            if saw_only_duplicates {
                self.resend_last_flight().await?;
            }

            match tokio::time::timeout(RETRANSMIT_TIMEOUT, self.transport.recv()).await {
                Ok(datagram) => self.leftover = datagram?,
                Err(_) => {
                    retransmits += 1;
                    if retransmits > MAX_RETRANSMITS {
                        return Err(Error::handshake("timed out waiting for peer flight"));
                    }
                    self.resend_last_flight().await?;
                }
            }
        }
    }

    /// Decode buffered records into pending items. Returns true when the
    /// datagram carried handshake data but all of it was already seen.
    fn drain_leftover(&mut self, cipher: Option<&RecordCipher>) -> Result<bool> {
        let mut saw_handshake = false;
        let mut saw_fresh = false;

        // Records held back until the cipher existed come first.
        if cipher.is_some() && !self.deferred.is_empty() {
            for record in std::mem::take(&mut self.deferred) {
                saw_handshake = true;
                if self.absorb_handshake_record(&record, cipher)? {
                    saw_fresh = true;
                }
            }
        }

        loop {
            let record = match Record::decode(&mut self.leftover) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(_) => {
                    // Undecodable tail (probe garbage); drop the rest.
                    self.leftover = Bytes::new();
                    break;
                }
            };
            match record.content_type {
                ContentType::ChangeCipherSpec => {
                    if !self.seen_peer_ccs {
                        self.seen_peer_ccs = true;
                        self.pending.push_back(Incoming::ChangeCipherSpec);
                        saw_fresh = true;
                    } else {
                        saw_handshake = true;
                    }
                }
                ContentType::Handshake => {
                    if record.epoch > 0 && cipher.is_none() {
                        // Cannot open it yet; the caller will come back
                        // with a cipher once key material is in hand.
                        self.deferred.push(record);
                        saw_fresh = true;
                        continue;
                    }
                    saw_handshake = true;
                    if self.absorb_handshake_record(&record, cipher)? {
                        saw_fresh = true;
                    }
                }
                ContentType::Alert => {
                    return Err(Error::handshake("peer alert during handshake"));
                }
                ContentType::ApplicationData => {
                    // The peer considers the handshake done; not for us.
                    continue;
                }
            }
        }
        Ok(saw_handshake && !saw_fresh)
    }

    /// Decode one handshake record's messages into `pending`. Returns true
    /// when anything fresh came out of it.
    fn absorb_handshake_record(
        &mut self,
        record: &Record,
        cipher: Option<&RecordCipher>,
    ) -> Result<bool> {
        let mut payload = if record.epoch == 0 {
            record.payload.clone()
        } else {
            let Some(cipher) = cipher else {
                return Ok(false);
            };
            match cipher.open(record.full_sequence(), record.content_type, &record.payload) {
                Ok(p) => Bytes::from(p),
                Err(_) => return Ok(false),
            }
        };
        let mut fresh = false;
        while let Some(msg) = HandshakeMessage::decode(&mut payload)? {
            if msg.message_seq < self.next_recv_msg_seq {
                continue; // duplicate from a retransmitted flight
            }
            self.next_recv_msg_seq = msg.message_seq + 1;
            self.pending.push_back(Incoming::Message(msg));
            fresh = true;
        }
        Ok(fresh)
    }

    async fn resend_last_flight(&mut self) -> Result<()> {
        if let Some(flight) = &self.last_flight {
            self.transport.send(flight).await?;
        }
        Ok(())
    }

    /// The transcript accumulated so far.
    pub(crate) fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    /// Append raw message bytes to the transcript (used for a peer Finished
    /// after it has been verified against the pre-Finished transcript).
    pub(crate) fn transcript_extend(&mut self, raw: &[u8]) {
        self.transcript.extend_from_slice(raw);
    }

    /// The last flight sent, for post-handshake replay.
    pub(crate) fn last_flight(&self) -> Option<Bytes> {
        self.last_flight.clone()
    }

    /// Hand back the transport for the established connection.
    pub(crate) fn into_transport(self) -> Arc<dyn PacketTransport> {
        self.transport
    }
}

/// Await a handshake message of an exact type, treating anything else as a
/// protocol violation.
pub(crate) async fn expect_message(
    io: &mut FlightIo,
    cipher: Option<&RecordCipher>,
    want: HandshakeType,
) -> Result<HandshakeMessage> {
    match io.next(cipher).await? {
        Incoming::Message(msg) if msg.msg_type == want => Ok(msg),
        Incoming::Message(msg) => Err(Error::handshake(format!(
            "expected {want:?}, got {:?}",
            msg.msg_type
        ))),
        Incoming::ChangeCipherSpec => {
            Err(Error::handshake(format!("expected {want:?}, got ChangeCipherSpec")))
        }
    }
}

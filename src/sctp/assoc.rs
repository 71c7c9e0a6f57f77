//! Association setup, reliable ordered delivery, and the stream adapter.
//!
//! The DTLS layer preserves frame boundaries but not delivery: datagrams
//! drop and reorder. DATA chunks carry a TSN per fragment; the receiver
//! reorders, reassembles fragmented messages, and acknowledges with a
//! cumulative SACK, while the sender retransmits anything unacknowledged
//! past the RTO. Bounded retries turn a dead path into a closed connection,
//! and every buffer is capped: the retransmission queue backpressures the
//! writer, the reorder window drops far-future chunks, and an unterminated
//! message kills the association instead of growing without bound.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::chunk::{Chunk, FLAG_BEGIN, FLAG_END, PPID_WEBRTC_STRING, STREAM_ID};
use crate::conn::{maybe_timeout, Conn};
use crate::dtls::DtlsConn;
use crate::error::{Error, Result};

/// Fragment payload bound; keeps chunk + record + UDP headers under an MTU.
const FRAGMENT_LEN: usize = 1150;

/// Fixed retransmission timeout.
const RTO: Duration = Duration::from_millis(500);

/// How often the driver scans for retransmissions.
const RETRANSMIT_TICK: Duration = Duration::from_millis(200);

/// Retransmissions per chunk before the association is declared dead.
const MAX_RETRIES: u32 = 8;

/// Most unacknowledged chunks the sender may hold; writes wait for SACKs
/// once the queue is full.
const MAX_PENDING: usize = 1000;

/// Most out-of-order chunks buffered ahead of the next expected TSN.
/// Anything beyond the window is dropped and left to retransmission.
const MAX_REORDER: usize = 500;

/// Upper bound on one reassembled message. A peer that opens a fragment
/// run and never ends it is cut off here.
const MAX_MESSAGE: usize = 1 << 20;

/// How long association setup may take end to end.
const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between INIT retransmissions during setup.
const INIT_RETRY: Duration = Duration::from_millis(500);

struct PendingChunk {
    wire: Bytes,
    sent_at: Instant,
    retries: u32,
}

struct SendState {
    next_tsn: u32,
    pending: BTreeMap<u32, PendingChunk>,
}

/// An SCTP stream over a DTLS connection, presented as one bidirectional
/// bytestream.
///
/// Reads and writes ride the stream; addresses and deadlines pass through to
/// the DTLS connection underneath. Close tears down both, stream first.
pub struct SctpConn {
    dtls: Arc<DtlsConn>,
    send_state: Arc<Mutex<SendState>>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    residue: Mutex<Bytes>,
    closed: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl SctpConn {
    /// Client side: initiate the association and open stream 0.
    pub async fn client(conn: DtlsConn) -> Result<SctpConn> {
        tokio::time::timeout(SETUP_TIMEOUT, Self::client_setup(conn))
            .await
            .map_err(|_| Error::sctp("association setup timed out"))?
    }

    async fn client_setup(conn: DtlsConn) -> Result<SctpConn> {
        let dtls = Arc::new(conn);
        let initial_tsn = rand::rngs::OsRng.next_u32();
        let init = Chunk::Init { initial_tsn }.encode();

        // Wait for the INIT ACK, re-sending the INIT when the peer stalls.
        // Early DATA seen during the race is stashed, not dropped.
        let mut stash = Vec::new();
        let peer_tsn = loop {
            dtls.send(&init).await?;
            match tokio::time::timeout(INIT_RETRY, dtls.recv()).await {
                Ok(frame) => match Chunk::decode(frame?)? {
                    Chunk::InitAck { initial_tsn } => break initial_tsn,
                    chunk @ Chunk::Data { .. } => stash.push(chunk),
                    _ => continue,
                },
                Err(_) => continue,
            }
        };

        Ok(Self::establish(dtls, initial_tsn, peer_tsn, None, stash))
    }

    /// Server side: answer the association and accept the first stream.
    pub async fn server(conn: DtlsConn) -> Result<SctpConn> {
        tokio::time::timeout(SETUP_TIMEOUT, Self::server_setup(conn))
            .await
            .map_err(|_| Error::sctp("association setup timed out"))?
    }

    async fn server_setup(conn: DtlsConn) -> Result<SctpConn> {
        let dtls = Arc::new(conn);
        let peer_tsn = loop {
            let frame = dtls.recv().await?;
            match Chunk::decode(frame)? {
                Chunk::Init { initial_tsn } => break initial_tsn,
                _ => continue,
            }
        };
        let initial_tsn = rand::rngs::OsRng.next_u32();
        dtls.send(&Chunk::InitAck { initial_tsn }.encode()).await?;

        Ok(Self::establish(
            dtls,
            initial_tsn,
            peer_tsn,
            Some(initial_tsn),
            Vec::new(),
        ))
    }

    fn establish(
        dtls: Arc<DtlsConn>,
        initial_tsn: u32,
        peer_tsn: u32,
        reply_init_ack: Option<u32>,
        stash: Vec<Chunk>,
    ) -> SctpConn {
        let send_state = Arc::new(Mutex::new(SendState {
            next_tsn: initial_tsn,
            pending: BTreeMap::new(),
        }));
        let closed = Arc::new(AtomicBool::new(false));
        let (recv_tx, recv_rx) = mpsc::channel(256);

        let driver = tokio::spawn(drive(
            dtls.clone(),
            send_state.clone(),
            closed.clone(),
            recv_tx,
            peer_tsn,
            reply_init_ack,
            stash,
        ));

        SctpConn {
            dtls,
            send_state,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            residue: Mutex::new(Bytes::new()),
            closed,
            driver,
        }
    }

    /// The DTLS connection underneath, for identity lookups.
    pub fn dtls(&self) -> &DtlsConn {
        &self.dtls
    }

    fn take_residue(&self, buf: &mut [u8]) -> Option<usize> {
        let mut residue = self.residue.lock();
        if residue.is_empty() {
            return None;
        }
        let n = residue.len().min(buf.len());
        buf[..n].copy_from_slice(&residue[..n]);
        let rest = residue.slice(n..);
        *residue = rest;
        Some(n)
    }
}

impl Drop for SctpConn {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl Conn for SctpConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if let Some(n) = self.take_residue(buf) {
            return Ok(n);
        }
        let limit = self.dtls.read_timeout();
        maybe_timeout(limit, async {
            let message = {
                let mut rx = self.recv_rx.lock().await;
                rx.recv().await.ok_or(Error::Closed)?
            };
            let n = message.len().min(buf.len());
            buf[..n].copy_from_slice(&message[..n]);
            if n < message.len() {
                *self.residue.lock() = message.slice(n..);
            }
            Ok(n)
        })
        .await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        // A stalled peer stalls the writer here rather than growing the
        // retransmission queue.
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            if self.send_state.lock().pending.len() < MAX_PENDING {
                break;
            }
            tokio::time::sleep(RETRANSMIT_TICK).await;
        }
        // Fragment, allocate TSNs, and register for retransmission under
        // the lock; actual sends happen after it is released.
        let wires: Vec<Bytes> = {
            let mut state = self.send_state.lock();
            let mut wires = Vec::new();
            let fragments: Vec<&[u8]> = if buf.is_empty() {
                vec![&[]]
            } else {
                buf.chunks(FRAGMENT_LEN).collect()
            };
            let last = fragments.len() - 1;
            for (i, fragment) in fragments.into_iter().enumerate() {
                let mut flags = 0;
                if i == 0 {
                    flags |= FLAG_BEGIN;
                }
                if i == last {
                    flags |= FLAG_END;
                }
                let tsn = state.next_tsn;
                state.next_tsn = state.next_tsn.wrapping_add(1);
                let wire = Chunk::Data {
                    tsn,
                    stream_id: STREAM_ID,
                    ppid: PPID_WEBRTC_STRING,
                    flags,
                    payload: Bytes::copy_from_slice(fragment),
                }
                .encode();
                state.pending.insert(
                    tsn,
                    PendingChunk {
                        wire: wire.clone(),
                        sent_at: Instant::now(),
                        retries: 0,
                    },
                );
                wires.push(wire);
            }
            wires
        };
        for wire in wires {
            self.dtls.send(&wire).await?;
        }
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        // Stream first, then the DTLS connection; both are attempted and
        // the first failure wins.
        let stream_res = if self.closed.swap(true, Ordering::AcqRel) {
            Ok(())
        } else {
            self.dtls.send(&Chunk::Shutdown.encode()).await
        };
        let dtls_res = self.dtls.close().await;
        self.driver.abort();
        stream_res.and(dtls_res)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.dtls.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.dtls.remote_addr()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.dtls.set_read_timeout(timeout);
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.dtls.set_write_timeout(timeout);
    }
}

struct RecvState {
    next_expected: u32,
    reorder: BTreeMap<u32, (u8, Bytes)>,
    partial: BytesMut,
}

impl RecvState {
    /// Absorb one DATA chunk; completed messages go to `out`.
    ///
    /// Errors mean the peer overran the reassembly limit and the
    /// association must close.
    fn on_data(&mut self, tsn: u32, flags: u8, payload: Bytes, out: &mut Vec<Bytes>) -> Result<()> {
        let fresh = (tsn.wrapping_sub(self.next_expected) as i32) >= 0;
        if fresh {
            if self.reorder.len() >= MAX_REORDER && tsn != self.next_expected {
                // Window full. Dropping it is safe: it stays unacked, so
                // the peer retransmits once the head catches up.
                return Ok(());
            }
            self.reorder.insert(tsn, (flags, payload));
        }
        while let Some((flags, payload)) = self.reorder.remove(&self.next_expected) {
            self.next_expected = self.next_expected.wrapping_add(1);
            if flags & FLAG_BEGIN != 0 {
                self.partial.clear();
            }
            if self.partial.len() + payload.len() > MAX_MESSAGE {
                return Err(Error::sctp("reassembled message exceeds limit"));
            }
            self.partial.extend_from_slice(&payload);
            if flags & FLAG_END != 0 {
                out.push(self.partial.split().freeze());
            }
        }
        Ok(())
    }

    fn cum_tsn(&self) -> u32 {
        self.next_expected.wrapping_sub(1)
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    dtls: Arc<DtlsConn>,
    send_state: Arc<Mutex<SendState>>,
    closed: Arc<AtomicBool>,
    recv_tx: mpsc::Sender<Bytes>,
    peer_initial_tsn: u32,
    reply_init_ack: Option<u32>,
    stash: Vec<Chunk>,
) {
    let mut recv = RecvState {
        next_expected: peer_initial_tsn,
        reorder: BTreeMap::new(),
        partial: BytesMut::new(),
    };
    let mut ticker = tokio::time::interval(RETRANSMIT_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Chunks that raced ahead of the INIT ACK.
    let mut completed = Vec::new();
    for chunk in stash {
        if let Chunk::Data {
            tsn,
            flags,
            payload,
            ..
        } = chunk
        {
            if recv.on_data(tsn, flags, payload, &mut completed).is_err() {
                closed.store(true, Ordering::Release);
                let _ = dtls.close().await;
                return;
            }
        }
    }
    for message in completed.drain(..) {
        if recv_tx.send(message).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            frame = dtls.recv() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let chunk = match Chunk::decode(frame) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::debug!("dropping undecodable chunk: {err}");
                        continue;
                    }
                };
                match chunk {
                    Chunk::Data { tsn, flags, payload, .. } => {
                        if let Err(err) = recv.on_data(tsn, flags, payload, &mut completed) {
                            tracing::debug!("closing association: {err}");
                            break;
                        }
                        let sack = Chunk::Sack { cum_tsn: recv.cum_tsn() }.encode();
                        let _ = dtls.send(&sack).await;
                        for message in completed.drain(..) {
                            if recv_tx.send(message).await.is_err() {
                                // Reader went away; keep ACKing is pointless.
                                closed.store(true, Ordering::Release);
                                let _ = dtls.close().await;
                                return;
                            }
                        }
                    }
                    Chunk::Sack { cum_tsn } => {
                        let mut state = send_state.lock();
                        state
                            .pending
                            .retain(|tsn, _| (tsn.wrapping_sub(cum_tsn) as i32) > 0);
                    }
                    Chunk::Init { .. } => {
                        // Duplicate INIT: our INIT ACK was lost.
                        if let Some(initial_tsn) = reply_init_ack {
                            let _ = dtls.send(&Chunk::InitAck { initial_tsn }.encode()).await;
                        }
                    }
                    Chunk::InitAck { .. } => {}
                    Chunk::Shutdown => {
                        tracing::debug!("peer shut the stream down");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                let (wires, dead) = {
                    let mut state = send_state.lock();
                    let now = Instant::now();
                    let mut wires = Vec::new();
                    let mut dead = false;
                    for pending in state.pending.values_mut() {
                        if now.duration_since(pending.sent_at) < RTO {
                            continue;
                        }
                        if pending.retries >= MAX_RETRIES {
                            dead = true;
                            break;
                        }
                        pending.retries += 1;
                        pending.sent_at = now;
                        wires.push(pending.wire.clone());
                    }
                    (wires, dead)
                };
                if dead {
                    tracing::debug!("retransmission budget exhausted, closing association");
                    break;
                }
                for wire in wires {
                    if dtls.send(&wire).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    let _ = dtls.close().await;
    // recv_tx drops here, waking any blocked read with Closed.
}

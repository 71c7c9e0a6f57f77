//! Datagram transports and the established DTLS connection.
//!
//! The handshake engines are generic over [`PacketTransport`] so the same
//! code drives a connected UDP socket, a demultiplexed slice of the
//! listener's shared socket, or an in-memory pair in tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::crypto::RecordCipher;
use super::record::{ContentType, Record};
use crate::conn::maybe_timeout;
use crate::crypto::ConnectionId;
use crate::error::{Error, Result};

/// Largest datagram the engine will send or accept.
pub const MAX_DATAGRAM: usize = 65535;

/// An unreliable datagram pipe.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Send one datagram.
    async fn send(&self, buf: &[u8]) -> Result<()>;

    /// Receive one datagram.
    async fn recv(&self) -> Result<Bytes>;

    /// Local address, if any.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Peer address, if any.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// A connected UDP socket as a datagram transport.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Wrap a socket already `connect`ed to its peer.
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl PacketTransport for UdpTransport {
    async fn send(&self, buf: &[u8]) -> Result<()> {
        self.socket.send(buf).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }
}

/// One end of an in-memory datagram pipe.
pub struct PacketPipe {
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

/// Create a connected pair of in-memory datagram pipes.
pub fn packet_pipe() -> (PacketPipe, PacketPipe) {
    let (a_tx, a_rx) = mpsc::channel(256);
    let (b_tx, b_rx) = mpsc::channel(256);
    (
        PacketPipe {
            tx: a_tx,
            rx: tokio::sync::Mutex::new(b_rx),
        },
        PacketPipe {
            tx: b_tx,
            rx: tokio::sync::Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl PacketTransport for PacketPipe {
    async fn send(&self, buf: &[u8]) -> Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| Error::Closed)
    }

    async fn recv(&self) -> Result<Bytes> {
        self.rx.lock().await.recv().await.ok_or(Error::Closed)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// An established DTLS connection carrying framed payloads.
///
/// One frame maps to one protected record to one datagram, so the SCTP layer
/// above keeps its chunk boundaries for free.
pub struct DtlsConn {
    transport: Arc<dyn PacketTransport>,
    cipher: RecordCipher,
    /// ClientHello random of the handshake that produced this connection:
    /// the listener's demultiplexing key.
    connection_id: ConnectionId,
    write_seq: AtomicU64,
    read_leftover: tokio::sync::Mutex<Bytes>,
    /// Our final handshake flight. Replayed when the peer re-sends
    /// handshake records, which means it never saw the flight.
    final_flight: Option<Bytes>,
    closed: AtomicBool,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
}

impl DtlsConn {
    pub(crate) fn new(
        transport: Arc<dyn PacketTransport>,
        cipher: RecordCipher,
        connection_id: ConnectionId,
        next_write_seq: u64,
        final_flight: Option<Bytes>,
    ) -> Self {
        Self {
            transport,
            cipher,
            connection_id,
            write_seq: AtomicU64::new(next_write_seq),
            read_leftover: tokio::sync::Mutex::new(Bytes::new()),
            final_flight,
            closed: AtomicBool::new(false),
            read_timeout: Mutex::new(None),
            write_timeout: Mutex::new(None),
        }
    }

    /// The ClientHello random this connection handshook with.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Send one frame as a protected application-data record.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let limit = *self.write_timeout.lock();
        let seq = (1u64 << 48) | self.write_seq.fetch_add(1, Ordering::SeqCst);
        let sealed = self
            .cipher
            .seal(seq, ContentType::ApplicationData, payload)?;
        let record = Record {
            content_type: ContentType::ApplicationData,
            epoch: 1,
            sequence: seq & 0xffff_ffff_ffff,
            payload: Bytes::from(sealed),
        };
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        maybe_timeout(limit, self.transport.send(&buf)).await
    }

    /// Receive the next application-data frame.
    pub async fn recv(&self) -> Result<Bytes> {
        let limit = *self.read_timeout.lock();
        maybe_timeout(limit, self.recv_inner()).await
    }

    async fn recv_inner(&self) -> Result<Bytes> {
        let mut leftover = self.read_leftover.lock().await;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            while let Some(record) = Record::decode(&mut leftover)? {
                // Handshake stragglers mean our final flight was lost;
                // replay it and drop the record.
                if matches!(
                    record.content_type,
                    ContentType::Handshake | ContentType::ChangeCipherSpec
                ) {
                    if let Some(flight) = &self.final_flight {
                        let _ = self.transport.send(flight).await;
                    }
                    continue;
                }
                if record.epoch == 0 {
                    continue;
                }
                let plaintext =
                    match self
                        .cipher
                        .open(record.full_sequence(), record.content_type, &record.payload)
                    {
                        Ok(p) => p,
                        Err(_) => continue, // garbage or replay, drop the record
                    };
                match record.content_type {
                    ContentType::ApplicationData => return Ok(Bytes::from(plaintext)),
                    ContentType::Alert => {
                        // close_notify or fatal either way ends the session
                        self.closed.store(true, Ordering::Release);
                        return Err(Error::Closed);
                    }
                    _ => continue,
                }
            }
            *leftover = self.transport.recv().await?;
        }
    }

    /// Close the connection, announcing close_notify to the peer.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let seq = (1u64 << 48) | self.write_seq.fetch_add(1, Ordering::SeqCst);
        // warning level, close_notify
        if let Ok(sealed) = self.cipher.seal(seq, ContentType::Alert, &[1, 0]) {
            let record = Record {
                content_type: ContentType::Alert,
                epoch: 1,
                sequence: seq & 0xffff_ffff_ffff,
                payload: Bytes::from(sealed),
            };
            let mut buf = BytesMut::new();
            record.encode(&mut buf);
            let _ = self.transport.send(&buf).await;
        }
        Ok(())
    }

    /// Local address of the underlying transport.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Peer address of the underlying transport.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    /// Bound future reads.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock() = timeout;
    }

    /// Bound future writes.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.write_timeout.lock() = timeout;
    }

    /// The currently configured read bound.
    pub fn read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.lock()
    }

    /// The currently configured write bound.
    pub fn write_timeout(&self) -> Option<Duration> {
        *self.write_timeout.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtls::crypto::SessionKeys;

    fn conn_pair() -> (DtlsConn, DtlsConn) {
        let (a, b) = packet_pipe();
        let master = vec![0x33; 48];
        let client_keys = SessionKeys::expand(&master, &[1; 32], &[2; 32]).unwrap();
        let server_keys = SessionKeys::expand(&master, &[1; 32], &[2; 32]).unwrap();
        let id = [1u8; 32];
        (
            DtlsConn::new(Arc::new(a), client_keys.cipher(true), id, 0, None),
            DtlsConn::new(Arc::new(b), server_keys.cipher(false), id, 0, None),
        )
    }

    #[tokio::test]
    async fn test_send_recv_frames() {
        let (client, server) = conn_pair();

        client.send(b"first").await.unwrap();
        client.send(b"second").await.unwrap();

        assert_eq!(&server.recv().await.unwrap()[..], b"first");
        assert_eq!(&server.recv().await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn test_close_notify_reaches_peer() {
        let (client, server) = conn_pair();

        client.close().await.unwrap();
        assert!(matches!(server.recv().await, Err(Error::Closed)));
        assert!(matches!(client.send(b"x").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (client, _server) = conn_pair();

        client.set_read_timeout(Some(Duration::from_millis(20)));
        let err = client.recv().await.unwrap_err();
        match err {
            Error::Network(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {other}"),
        }
    }
}

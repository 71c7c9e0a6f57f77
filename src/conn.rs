//! Bidirectional frame-oriented connection abstraction.
//!
//! `Conn` is the crate's `net.Conn` equivalent: everything that comes out of
//! a rendezvous (SCTP-over-DTLS adapters, heartbeat wrappers) implements it,
//! and overlays wrap it without caring what sits underneath. Reads return one
//! inbound frame at a time; oversized frames spill into an internal residue
//! buffer so callers get ordinary stream semantics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A bidirectional, frame-preserving connection.
///
/// Methods take `&self` so connections can be shared behind an [`Arc`] by
/// reader, writer, and watchdog tasks at the same time.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read the next frame into `buf`, returning the number of bytes copied.
    ///
    /// A frame larger than `buf` is delivered across successive reads.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one frame.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Local address, if the underlying transport has one.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote address, if the underlying transport has one.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Bound applied to future `read` calls. `None` clears it.
    fn set_read_timeout(&self, timeout: Option<Duration>);

    /// Bound applied to future `write` calls. `None` clears it.
    fn set_write_timeout(&self, timeout: Option<Duration>);
}

/// Run `fut` under an optional deadline, mapping expiry to a timeout error.
pub(crate) async fn maybe_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match limit {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Network(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "i/o deadline exceeded",
            ))),
        },
        None => fut.await,
    }
}

/// Close state shared by both pipe ends: closing either end fails all
/// pending and future I/O on both, like an OS socket pair.
struct Shutdown {
    closed: AtomicBool,
    notify: tokio::sync::Notify,
}

impl Shutdown {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// One end of an in-memory frame pipe.
///
/// The test-suite stand-in for a real transport, mirroring what the original
/// exercises with an OS-level socket pair. Frame boundaries are preserved.
pub struct PipeConn {
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    residue: Mutex<Bytes>,
    shutdown: Arc<Shutdown>,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
}

/// Create a connected pair of in-memory frame pipes.
pub fn pipe() -> (PipeConn, PipeConn) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    let shutdown = Arc::new(Shutdown {
        closed: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });
    let make = |tx, rx, shutdown| PipeConn {
        tx,
        rx: tokio::sync::Mutex::new(rx),
        residue: Mutex::new(Bytes::new()),
        shutdown,
        read_timeout: Mutex::new(None),
        write_timeout: Mutex::new(None),
    };
    (
        make(a_tx, b_rx, shutdown.clone()),
        make(b_tx, a_rx, shutdown),
    )
}

impl PipeConn {
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

#[async_trait]
impl Conn for PipeConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if let Some(n) = self.take_residue(buf) {
            return Ok(n);
        }
        if self.shutdown.is_closed() {
            return Err(Error::Closed);
        }
        let limit = *self.read_timeout.lock();
        maybe_timeout(limit, async {
            let frame = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(f) => f,
                        None => return Err(Error::Closed),
                    },
                    _ = self.shutdown.notify.notified() => return Err(Error::Closed),
                }
            };
            let n = frame.len().min(buf.len());
            buf[..n].copy_from_slice(&frame[..n]);
            if n < frame.len() {
                *self.residue.lock() = frame.slice(n..);
            }
            Ok(n)
        })
        .await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.shutdown.is_closed() {
            return Err(Error::Closed);
        }
        let limit = *self.write_timeout.lock();
        maybe_timeout(limit, async {
            self.tx
                .send(Bytes::copy_from_slice(buf))
                .await
                .map_err(|_| Error::Closed)?;
            Ok(buf.len())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.close();
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock() = timeout;
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.write_timeout.lock() = timeout;
    }
}

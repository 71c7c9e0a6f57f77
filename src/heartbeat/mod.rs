//! Heartbeat keepalive overlay.
//!
//! The sender side writes a fixed payload every half interval; the receiver
//! side strips those frames before the caller sees them and closes the
//! connection when a full interval passes without any peer activity. One
//! wrapper per direction; stacking both yields full-duplex liveness.
//!
//! A data frame that happens to equal the payload byte-for-byte is
//! indistinguishable from a heartbeat and is swallowed; the 32-byte default
//! makes that collision negligible.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conn::Conn;
use crate::error::{Error, Result};

/// Default heartbeat payload.
pub const DEFAULT_PAYLOAD: &[u8] = b"6v3jyM521GkBo1lsMyVLcRyzdZ7FKEM3";

/// Default checking interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Payload sent as the heartbeat
    pub payload: Bytes,
    /// Checking interval for the watchdog; heartbeats go out every half
    /// interval
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            payload: Bytes::from_static(DEFAULT_PAYLOAD),
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl Config {
    fn validated(&self) -> Config {
        let mut conf = self.clone();
        if conf.payload.is_empty() {
            conf.payload = Bytes::from_static(DEFAULT_PAYLOAD);
        }
        if conf.interval.is_zero() {
            conf.interval = DEFAULT_INTERVAL;
        }
        conf
    }
}

/// Start the sending half: writes the heartbeat payload every half
/// interval until a write fails.
///
/// The first write error arrives on the returned channel rather than
/// vanishing with the task.
pub fn start_client(conn: Arc<dyn Conn>, config: &Config) -> mpsc::Receiver<Error> {
    let conf = config.validated();
    let (err_tx, err_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            if let Err(err) = conn.write(&conf.payload).await {
                let _ = err_tx.try_send(err);
                return;
            }
            tokio::time::sleep(conf.interval / 2).await;
        }
    });
    err_rx
}

/// The receiving half: a connection wrapper that strips heartbeats and
/// enforces liveness.
pub struct HeartbeatConn {
    conn: Arc<dyn Conn>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Result<Bytes>>>,
    residue: Mutex<Bytes>,
    timed_out: Arc<AtomicBool>,
    recv_task: JoinHandle<()>,
    watchdog_task: JoinHandle<()>,
}

/// Wrap `conn` with the heartbeat receiver and watchdog.
pub fn server(conn: Arc<dyn Conn>, config: &Config) -> HeartbeatConn {
    let conf = config.validated();
    let waiting = Arc::new(AtomicBool::new(false));
    let timed_out = Arc::new(AtomicBool::new(false));
    let (recv_tx, recv_rx) = mpsc::channel(64);

    let recv_task = {
        let conn = conn.clone();
        let waiting = waiting.clone();
        let payload = conf.payload.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match conn.read(&mut buf).await {
                    Ok(n) => {
                        if buf[..n] == payload[..] {
                            // Heartbeat: reset the watchdog, stay invisible.
                            waiting.store(false, Ordering::Release);
                            continue;
                        }
                        if recv_tx
                            .send(Ok(Bytes::copy_from_slice(&buf[..n])))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = recv_tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        })
    };

    let watchdog_task = {
        let conn = conn.clone();
        let waiting = waiting.clone();
        let timed_out = timed_out.clone();
        let interval = conf.interval;
        tokio::spawn(async move {
            loop {
                if waiting.load(Ordering::Acquire) {
                    tracing::debug!("no peer activity for a full interval, closing");
                    timed_out.store(true, Ordering::Release);
                    let _ = conn.close().await;
                    return;
                }
                waiting.store(true, Ordering::Release);
                tokio::time::sleep(interval).await;
            }
        })
    };

    HeartbeatConn {
        conn,
        recv_rx: tokio::sync::Mutex::new(recv_rx),
        residue: Mutex::new(Bytes::new()),
        timed_out,
        recv_task,
        watchdog_task,
    }
}

impl HeartbeatConn {
    fn map_closed(&self, err: Error) -> Error {
        if self.timed_out.load(Ordering::Acquire) {
            Error::HeartbeatTimeout
        } else {
            err
        }
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

impl Drop for HeartbeatConn {
    fn drop(&mut self) {
        self.recv_task.abort();
        self.watchdog_task.abort();
    }
}

#[async_trait]
impl Conn for HeartbeatConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if let Some(n) = self.take_residue(buf) {
            return Ok(n);
        }
        let frame = {
            let mut rx = self.recv_rx.lock().await;
            rx.recv().await
        };
        match frame {
            Some(Ok(frame)) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                if n < frame.len() {
                    *self.residue.lock() = frame.slice(n..);
                }
                Ok(n)
            }
            Some(Err(err)) => Err(self.map_closed(err)),
            None => Err(self.map_closed(Error::Closed)),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.conn.write(buf).await.map_err(|e| self.map_closed(e))
    }

    async fn close(&self) -> Result<()> {
        self.conn.close().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.conn.set_read_timeout(timeout);
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.conn.set_write_timeout(timeout);
    }
}

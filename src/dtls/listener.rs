//! The dispatch listener: one UDP socket, every covert handshake.
//!
//! Inbound datagrams are demultiplexed by source address into per-peer
//! handshake tasks. Certificate selection and connection verification key on
//! the cleartext ClientHello random, looked up in two independently locked
//! maps that acceptors register into. A completed, verified handshake is
//! wrapped server-side SCTP and handed to the acceptor waiting on that
//! seed's channel — and to nobody else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::conn::{PacketTransport, MAX_DATAGRAM};
use super::server::{accept_dtls, ServerCallbacks};
use crate::crypto::{
    certs_from_seed, client_hello_random_from_seed, random_certificate, verify_cert, CertPair,
    ConnectionId, Identity,
};
use crate::error::{Error, Result};
use crate::sctp::SctpConn;

type ConnMap = Arc<RwLock<HashMap<ConnectionId, mpsc::Sender<SctpConn>>>>;
type CertMap = Arc<RwLock<HashMap<ConnectionId, CertPair>>>;
type PeerMap = Arc<RwLock<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

/// A DTLS dispatch listener bound to one UDP socket.
pub struct Listener {
    socket: Arc<UdpSocket>,
    conn_map: ConnMap,
    cert_map: CertMap,
    demux: JoinHandle<()>,
}

impl Listener {
    /// Bind the socket and start accepting handshakes.
    ///
    /// The port is shared with the rendezvous dial sockets, so the bind
    /// carries SO_REUSEPORT.
    pub async fn bind(addr: SocketAddr) -> Result<Listener> {
        let raw = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        raw.set_reuse_address(true)?;
        #[cfg(unix)]
        raw.set_reuse_port(true)?;
        raw.set_nonblocking(true)?;
        raw.bind(&addr.into())?;
        let socket = Arc::new(UdpSocket::from_std(raw.into())?);
        // Only ever served to cipher-suite probes.
        let default_cert = random_certificate()?;

        let conn_map: ConnMap = Arc::new(RwLock::new(HashMap::new()));
        let cert_map: CertMap = Arc::new(RwLock::new(HashMap::new()));
        let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));

        let demux = tokio::spawn(demux_loop(
            socket.clone(),
            peers,
            conn_map.clone(),
            cert_map.clone(),
            default_cert,
        ));

        tracing::info!(addr = %socket.local_addr()?, "dtls dispatch listener up");
        Ok(Listener {
            socket,
            conn_map,
            cert_map,
            demux,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for the covert connection belonging to `seed`.
    ///
    /// Registers the derived connection ID, blocks until a verified
    /// handshake with that ClientHello random completes, and cleans up its
    /// registrations on every exit path — including cancellation.
    pub async fn accept_from_secret(&self, seed: &[u8]) -> Result<SctpConn> {
        let pair = certs_from_seed(seed)?;
        let conn_id = client_hello_random_from_seed(seed)?;

        // The channel is registered first: a duplicate seed must fail
        // before it can disturb the first acceptor's certificate entry.
        let mut rx = {
            let mut map = self.conn_map.write();
            if map.contains_key(&conn_id) {
                return Err(Error::SeedAlreadyRegistered);
            }
            let (tx, rx) = mpsc::channel(1);
            map.insert(conn_id, tx);
            rx
        };
        let _conn_guard = MapGuard {
            map: self.conn_map.clone(),
            id: conn_id,
        };

        self.cert_map.write().insert(conn_id, pair);
        let _cert_guard = MapGuard {
            map: self.cert_map.clone(),
            id: conn_id,
        };

        rx.recv().await.ok_or(Error::Canceled)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

/// Removes a registration when the acceptor leaves, however it leaves.
struct MapGuard<V> {
    map: Arc<RwLock<HashMap<ConnectionId, V>>>,
    id: ConnectionId,
}

impl<V> Drop for MapGuard<V> {
    fn drop(&mut self) {
        self.map.write().remove(&self.id);
    }
}

/// Route datagrams to per-peer handshake tasks by source address.
async fn demux_loop(
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    conn_map: ConnMap,
    cert_map: CertMap,
    default_cert: Identity,
) {
    let callbacks = make_callbacks(cert_map, default_cert);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!("listener recv error: {err}");
                continue;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        let existing = {
            let peers = peers.read();
            peers.get(&from).cloned()
        };
        if let Some(tx) = existing {
            if tx.try_send(datagram).is_err() {
                tracing::debug!(peer = %from, "dropping datagram for saturated handshake");
            }
            continue;
        }

        // New peer: one task per handshake so a slow SCTP wrap never
        // blocks the accept path.
        let (tx, rx) = mpsc::channel(256);
        let _ = tx.try_send(datagram);
        peers.write().insert(from, tx);

        let transport = Arc::new(MuxTransport {
            socket: socket.clone(),
            peer: from,
            rx: tokio::sync::Mutex::new(rx),
            peers: peers.clone(),
        });
        let callbacks = callbacks.clone();
        let conn_map = conn_map.clone();
        tokio::spawn(async move {
            handle_peer(transport, callbacks, conn_map, from).await;
        });
    }
}

fn make_callbacks(cert_map: CertMap, default_cert: Identity) -> ServerCallbacks {
    let certs_for_hello = cert_map.clone();
    ServerCallbacks {
        get_certificate: Arc::new(move |info| {
            // A hello with no cipher suites is suite enumeration, not a
            // session; it gets the fixed default certificate.
            if info.cipher_suites.is_empty() {
                return Ok(default_cert.clone());
            }
            let hit = {
                let map = certs_for_hello.read();
                map.get(&info.random).map(|pair| pair.server.clone())
            };
            match hit {
                Some(identity) => Ok(identity),
                // Unknown random: serve a fresh random certificate and let
                // verification reject the peer later. Indistinguishable
                // from a real DTLS server under probing.
                None => random_certificate(),
            }
        }),
        verify_connection: Arc::new(move |info| {
            let expected = {
                let map = cert_map.read();
                map.get(&info.client_random)
                    .map(|pair| pair.client.cert_der.clone())
            };
            let Some(expected) = expected else {
                return Err(Error::NoMatchingRegistration);
            };
            if info.peer_certificates.len() != 1 {
                return Err(Error::handshake(format!(
                    "expected 1 peer certificate, got {}",
                    info.peer_certificates.len()
                )));
            }
            verify_cert(&info.peer_certificates[0], &expected)
        }),
    }
}

async fn handle_peer(
    transport: Arc<MuxTransport>,
    callbacks: ServerCallbacks,
    conn_map: ConnMap,
    from: SocketAddr,
) {
    let dtls = match accept_dtls(transport, &callbacks).await {
        Ok(conn) => conn,
        Err(err) => {
            // Silent: no alert went out, the phantom stays a phantom.
            tracing::debug!(peer = %from, "handshake rejected: {err}");
            return;
        }
    };
    let conn_id = dtls.connection_id();

    let sctp = match SctpConn::server(dtls).await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::debug!(peer = %from, "sctp wrap failed: {err}");
            return;
        }
    };

    // Clone the sender under the read lock, then send with the lock
    // dropped: a blocking send under the lock can deadlock against an
    // acceptor unregistering itself.
    let pending = {
        let map = conn_map.read();
        map.get(&conn_id).cloned()
    };
    match pending {
        Some(tx) => {
            if tx.send(sctp).await.is_err() {
                tracing::debug!(peer = %from, "acceptor left before handoff");
            }
        }
        None => {
            tracing::debug!(peer = %from, "no pending acceptor, dropping connection");
        }
    }
}

/// A per-peer view of the shared listener socket.
struct MuxTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    peers: PeerMap,
}

impl Drop for MuxTransport {
    fn drop(&mut self) {
        self.peers.write().remove(&self.peer);
    }
}

#[async_trait::async_trait]
impl PacketTransport for MuxTransport {
    async fn send(&self, buf: &[u8]) -> Result<()> {
        self.socket.send_to(buf, self.peer).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        self.rx.lock().await.recv().await.ok_or(Error::Closed)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Conn;
    use crate::dtls::client::dial;

    async fn listener() -> Listener {
        Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_accept_matches_dialing_seed() {
        let listener = listener().await;
        let addr = listener.local_addr().unwrap();
        let seed = b"hihihihihihihihihihihihihihihihi";

        let listener = Arc::new(listener);
        let acceptor = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_from_secret(seed).await })
        };

        let client = dial(addr, seed).await.unwrap();
        let station = acceptor.await.unwrap().unwrap();

        client.write(b"through the phantom").await.unwrap();
        let mut buf = [0u8; 64];
        let n = station.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"through the phantom");
    }

    #[tokio::test]
    async fn test_two_seeds_demultiplex() {
        let listener = Arc::new(listener().await);
        let addr = listener.local_addr().unwrap();
        let seed1 = b"11111111111111111111111111111111";
        let seed2 = b"22222222222222222222222222222222";

        let accept1 = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_from_secret(seed1).await })
        };
        let accept2 = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_from_secret(seed2).await })
        };

        let client1 = dial(addr, seed1).await.unwrap();
        let client2 = dial(addr, seed2).await.unwrap();

        let station1 = accept1.await.unwrap().unwrap();
        let station2 = accept2.await.unwrap().unwrap();

        client1.write(b"from one").await.unwrap();
        client2.write(b"from two").await.unwrap();

        let mut buf = [0u8; 32];
        let n = station1.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from one");
        let n = station2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from two");
    }

    #[tokio::test]
    async fn test_unregistered_seed_rejected_listener_stays_up() {
        let listener = Arc::new(listener().await);
        let addr = listener.local_addr().unwrap();
        let registered = b"hihihihihihihihihihihihihihihihi";
        let unknown = b"nobody registered this seed -----";

        // The probe handshakes up to verification, then dies quietly.
        assert!(dial(addr, unknown).await.is_err());

        // The listener keeps working for real registrations afterwards.
        let acceptor = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_from_secret(registered).await })
        };
        let client = dial(addr, registered).await.unwrap();
        let station = acceptor.await.unwrap().unwrap();

        station.write(b"still alive").await.unwrap();
        let mut buf = [0u8; 32];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still alive");
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails_without_perturbing_first() {
        let listener = Arc::new(listener().await);
        let addr = listener.local_addr().unwrap();
        let seed = b"hihihihihihihihihihihihihihihihi";

        let first = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_from_secret(seed).await })
        };
        // Let the first registration land.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let second = listener.accept_from_secret(seed).await;
        assert!(matches!(second, Err(Error::SeedAlreadyRegistered)));

        // First acceptor still completes normally.
        let client = dial(addr, seed).await.unwrap();
        let station = first.await.unwrap().unwrap();
        client.write(b"unperturbed").await.unwrap();
        let mut buf = [0u8; 32];
        let n = station.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"unperturbed");
    }

    #[tokio::test]
    async fn test_cancellation_clears_registrations() {
        let listener = Arc::new(listener().await);
        let seed = b"hihihihihihihihihihihihihihihihi";
        let conn_id = client_hello_random_from_seed(seed).unwrap();

        let acceptor = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_from_secret(seed).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(listener.conn_map.read().contains_key(&conn_id));
        assert!(listener.cert_map.read().contains_key(&conn_id));

        acceptor.abort();
        let _ = acceptor.await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!listener.conn_map.read().contains_key(&conn_id));
        assert!(!listener.cert_map.read().contains_key(&conn_id));
    }
}

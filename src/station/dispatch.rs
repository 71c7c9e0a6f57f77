//! TCP connection-dispatch state machine.
//!
//! Phantom TCP connections land here before anyone knows which transport
//! they belong to. Each connection walks Created → Reading/Checking until a
//! transport claims it, every transport rejects it, or the socket dies. A
//! rejected connection is not dropped: it drains into a sink until its
//! deadline so a prober sees exactly what a real service would show them.
//!
//! Every transition bumps a `(from, to)` counter cell, globally and per
//! (ASN, country), replacing the original's two dozen hand-written counter
//! methods.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

#[cfg(target_os = "linux")]
use crate::error::Result;

/// Connection states. The first four are live, the rest terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, nothing read yet
    Created,
    /// Waiting for more bytes
    Reading,
    /// Running the buffered bytes past the transports
    Checking,
    /// Draining to a sink until deadline
    IoDiscarding,
    /// A transport claimed the connection
    Found,
    /// Peer reset the socket
    Reset,
    /// Deadline expired
    Timeout,
    /// Peer closed cleanly
    Closed,
    /// Unexpected socket or transport failure
    Error,
}

/// Number of states, and the counter-table dimension.
pub const STATE_COUNT: usize = 9;

impl ConnState {
    /// Dense index for counter tables.
    pub fn index(self) -> usize {
        match self {
            ConnState::Created => 0,
            ConnState::Reading => 1,
            ConnState::Checking => 2,
            ConnState::IoDiscarding => 3,
            ConnState::Found => 4,
            ConnState::Reset => 5,
            ConnState::Timeout => 6,
            ConnState::Closed => 7,
            ConnState::Error => 8,
        }
    }

    /// Whether the state ends a connection's life.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnState::Found
                | ConnState::Reset
                | ConnState::Timeout
                | ConnState::Closed
                | ConnState::Error
        )
    }
}

/// Whether `from → to` appears in the transition table.
pub fn transition_allowed(from: ConnState, to: ConnState) -> bool {
    use ConnState::*;
    matches!(
        (from, to),
        (Created, IoDiscarding)
            | (Created, Checking)
            | (Created, Reset)
            | (Created, Timeout)
            | (Created, Error)
            | (Checking, Found)
            | (Checking, Reading)
            | (Checking, Created)
            | (Checking, IoDiscarding)
            | (Checking, Error)
            | (Reading, Checking)
            | (Reading, Reset)
            | (Reading, Timeout)
            | (Reading, Error)
            | (IoDiscarding, Reset)
            | (IoDiscarding, Timeout)
            | (IoDiscarding, Error)
            | (IoDiscarding, Closed)
    )
}

/// One set of state/transition counters.
pub struct StateCounters {
    started: AtomicU64,
    occupancy: [AtomicU64; STATE_COUNT],
    transitions: [[AtomicU64; STATE_COUNT]; STATE_COUNT],
}

impl StateCounters {
    fn new() -> StateCounters {
        StateCounters {
            started: AtomicU64::new(0),
            occupancy: std::array::from_fn(|_| AtomicU64::new(0)),
            transitions: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
        }
    }

    fn created(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.occupancy[ConnState::Created.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn transition(&self, from: ConnState, to: ConnState) {
        self.occupancy[from.index()].fetch_sub(1, Ordering::Relaxed);
        self.occupancy[to.index()].fetch_add(1, Ordering::Relaxed);
        self.transitions[from.index()][to.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Connections that ever entered the machine.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Connections currently (or finally) in `state`.
    pub fn occupancy(&self, state: ConnState) -> u64 {
        self.occupancy[state.index()].load(Ordering::Relaxed)
    }

    /// Times the `from → to` edge was taken.
    pub fn transition_count(&self, from: ConnState, to: ConnState) -> u64 {
        self.transitions[from.index()][to.index()].load(Ordering::Relaxed)
    }

    /// All transitions taken.
    pub fn total_transitions(&self) -> u64 {
        self.transitions
            .iter()
            .flatten()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Sum of terminal-state occupancy.
    pub fn terminal_total(&self) -> u64 {
        [
            ConnState::Found,
            ConnState::Reset,
            ConnState::Timeout,
            ConnState::Closed,
            ConnState::Error,
        ]
        .into_iter()
        .map(|s| self.occupancy(s))
        .sum()
    }
}

struct AsnCounters {
    cc: String,
    counters: StateCounters,
}

/// Global plus per-(ASN, country) counters.
pub struct ConnStats {
    overall: StateCounters,
    geo: RwLock<HashMap<u32, Arc<AsnCounters>>>,
}

impl ConnStats {
    /// Fresh, all-zero stats.
    pub fn new() -> ConnStats {
        ConnStats {
            overall: StateCounters::new(),
            geo: RwLock::new(HashMap::new()),
        }
    }

    fn geo_entry(&self, asn: u32, cc: &str) -> Arc<AsnCounters> {
        if let Some(entry) = self.geo.read().get(&asn) {
            return entry.clone();
        }
        let mut map = self.geo.write();
        map.entry(asn)
            .or_insert_with(|| {
                Arc::new(AsnCounters {
                    cc: cc.to_string(),
                    counters: StateCounters::new(),
                })
            })
            .clone()
    }

    /// Record a connection entering the machine.
    pub fn created(&self, asn: u32, cc: &str) {
        self.overall.created();
        if !cc.is_empty() {
            self.geo_entry(asn, cc).counters.created();
        }
    }

    /// Record a state transition.
    pub fn transition(&self, from: ConnState, to: ConnState, asn: u32, cc: &str) {
        debug_assert!(transition_allowed(from, to), "illegal transition {from:?} -> {to:?}");
        self.overall.transition(from, to);
        if !cc.is_empty() {
            self.geo_entry(asn, cc).counters.transition(from, to);
        }
    }

    /// The global counters.
    pub fn overall(&self) -> &StateCounters {
        &self.overall
    }

    /// Country code recorded for an ASN, if any connection carried one.
    pub fn asn_cc(&self, asn: u32) -> Option<String> {
        self.geo.read().get(&asn).map(|e| e.cc.clone())
    }

    /// Per-ASN transition count.
    pub fn asn_transition_count(&self, asn: u32, from: ConnState, to: ConnState) -> u64 {
        self.geo
            .read()
            .get(&asn)
            .map(|e| e.counters.transition_count(from, to))
            .unwrap_or(0)
    }
}

impl Default for ConnStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a transport declined (or deferred) a connection.
#[derive(Debug)]
pub enum WrapError {
    /// Not enough bytes buffered to decide
    TryAgain,
    /// Definitely not this transport
    NotTransport,
    /// The attempt corrupted the connection state; give up on it
    Fatal(String),
}

/// A successful transport identification.
#[derive(Debug, Clone)]
pub struct TransportMatch {
    /// Name of the transport that claimed the connection
    pub transport: &'static str,
    /// Registration identifier for bookkeeping
    pub identifier: Vec<u8>,
}

/// A transport that can identify its own connections from buffered bytes.
pub trait WrappingTransport: Send + Sync {
    /// Transport name for logging.
    fn name(&self) -> &'static str;

    /// Try to claim the connection from what has been read so far.
    ///
    /// A transport may consume bytes from `buffered` while deciding. One
    /// that drains the buffer empty and still returns
    /// [`WrapError::TryAgain`] is treated as ambiguous: the connection
    /// falls back to the Created state and starts accumulating afresh.
    fn try_wrap(
        &self,
        buffered: &mut Vec<u8>,
        original_dst: IpAddr,
    ) -> std::result::Result<TransportMatch, WrapError>;
}

/// Dispatches accepted phantom TCP connections to wrapping transports.
pub struct ConnDispatcher {
    stats: Arc<ConnStats>,
    transports: Vec<Arc<dyn WrappingTransport>>,
    log_client_ip: bool,
}

impl ConnDispatcher {
    /// Build a dispatcher over the registered wrapping transports.
    ///
    /// Client IPs appear in logs only when `LOG_CLIENT_IP=true`.
    pub fn new(transports: Vec<Arc<dyn WrappingTransport>>) -> ConnDispatcher {
        let log_client_ip = std::env::var("LOG_CLIENT_IP")
            .map(|v| v == "true")
            .unwrap_or(false);
        ConnDispatcher {
            stats: Arc::new(ConnStats::new()),
            transports,
            log_client_ip,
        }
    }

    /// Shared handle to the counters.
    pub fn stats(&self) -> Arc<ConnStats> {
        self.stats.clone()
    }

    /// Drive one accepted connection to a terminal state.
    ///
    /// Returns the claimed connection with its buffered prefix when a
    /// transport matched; `None` for every other outcome.
    pub async fn handle_new_conn(
        &self,
        mut stream: TcpStream,
        original_dst: IpAddr,
        asn: u32,
        cc: &str,
        registration_count: usize,
    ) -> Option<(TransportMatch, Vec<u8>, TcpStream)> {
        let peer = if self.log_client_ip {
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "_".into())
        } else {
            "_".into()
        };
        self.stats.created(asn, cc);

        // Identification deadline with jitter so probes cannot time us.
        let ms = rand::thread_rng().gen_range(5000..10000);
        let deadline = Instant::now() + Duration::from_millis(ms);

        if registration_count < 1 {
            // No registration ever pointed at this phantom. Reading is
            // pointless, but dropping early would hand probers a signal;
            // keep ACKing into a sink until the deadline.
            tracing::debug!(%peer, dst = %original_dst, "no possible registrations, discarding");
            self.stats.transition(ConnState::Created, ConnState::IoDiscarding, asn, cc);
            let outcome = discard_until(&mut stream, deadline).await;
            self.stats.transition(ConnState::IoDiscarding, outcome, asn, cc);
            return None;
        }

        let mut possible: Vec<Arc<dyn WrappingTransport>> = self.transports.clone();
        let mut buffered: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            if possible.is_empty() {
                let outcome = discard_until(&mut stream, deadline).await;
                self.stats.transition(ConnState::IoDiscarding, outcome, asn, cc);
                return None;
            }

            let from = if buffered.is_empty() {
                ConnState::Created
            } else {
                ConnState::Reading
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    // A clean close without a match reads as an error
                    // outcome, same as the original.
                    self.stats.transition(from, ConnState::Error, asn, cc);
                    return None;
                }
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    let outcome = classify_io_error(&err);
                    tracing::debug!(%peer, "read failed after {} bytes: {err}", buffered.len());
                    self.stats.transition(from, outcome, asn, cc);
                    return None;
                }
                Err(_) => {
                    self.stats.transition(from, ConnState::Timeout, asn, cc);
                    return None;
                }
            };
            self.stats.transition(from, ConnState::Checking, asn, cc);
            buffered.extend_from_slice(&buf[..n]);

            let mut rejected = Vec::new();
            for (i, transport) in possible.iter().enumerate() {
                match transport.try_wrap(&mut buffered, original_dst) {
                    Ok(matched) => {
                        tracing::debug!(
                            %peer,
                            transport = transport.name(),
                            "registration found"
                        );
                        self.stats.transition(ConnState::Checking, ConnState::Found, asn, cc);
                        return Some((matched, buffered, stream));
                    }
                    Err(WrapError::TryAgain) => {}
                    Err(WrapError::NotTransport) => rejected.push(i),
                    Err(WrapError::Fatal(reason)) => {
                        // The transport may have consumed state; the
                        // connection is unusable. Sit out the deadline so
                        // the close timing still looks ordinary.
                        tracing::warn!(
                            %peer,
                            transport = transport.name(),
                            "fatal wrap error: {reason}"
                        );
                        self.stats.transition(ConnState::Checking, ConnState::Error, asn, cc);
                        tokio::time::sleep(deadline.saturating_duration_since(Instant::now()))
                            .await;
                        return None;
                    }
                }
            }
            for i in rejected.into_iter().rev() {
                possible.remove(i);
            }

            if possible.is_empty() {
                self.stats.transition(ConnState::Checking, ConnState::IoDiscarding, asn, cc);
            } else if buffered.is_empty() {
                // A transport drained the buffer without deciding:
                // ambiguous, fall back and start over.
                self.stats.transition(ConnState::Checking, ConnState::Created, asn, cc);
            } else {
                self.stats.transition(ConnState::Checking, ConnState::Reading, asn, cc);
            }
        }
    }
}

/// Drain a connection into a sink until its deadline, classifying the end.
async fn discard_until(stream: &mut TcpStream, deadline: Instant) -> ConnState {
    let mut sink = [0u8; 8192];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ConnState::Timeout;
        }
        match tokio::time::timeout(remaining, stream.read(&mut sink)).await {
            Ok(Ok(0)) => return ConnState::Closed,
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return classify_io_error(&err),
            Err(_) => return ConnState::Timeout,
        }
    }
}

fn classify_io_error(err: &std::io::Error) -> ConnState {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset => ConnState::Reset,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ConnState::Timeout,
        _ => ConnState::Error,
    }
}

/// Original destination of a redirected TCP connection, via
/// `SO_ORIGINAL_DST`.
#[cfg(target_os = "linux")]
pub fn original_dst(stream: &TcpStream) -> Result<IpAddr> {
    use std::os::fd::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;
    let fd = stream.as_raw_fd();

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 {
        let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        return Ok(IpAddr::V4(ip));
    }

    let mut addr6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    let mut len6 = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            SO_ORIGINAL_DST,
            &mut addr6 as *mut _ as *mut libc::c_void,
            &mut len6,
        )
    };
    if rc == 0 {
        return Ok(IpAddr::V6(std::net::Ipv6Addr::from(addr6.sin6_addr.s6_addr)));
    }
    Err(crate::error::Error::Network(std::io::Error::last_os_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    struct MatchAfter {
        need: usize,
    }

    impl WrappingTransport for MatchAfter {
        fn name(&self) -> &'static str {
            "match-after"
        }

        fn try_wrap(
            &self,
            buffered: &mut Vec<u8>,
            _dst: IpAddr,
        ) -> std::result::Result<TransportMatch, WrapError> {
            if buffered.len() >= self.need {
                Ok(TransportMatch {
                    transport: "match-after",
                    identifier: buffered[..4.min(buffered.len())].to_vec(),
                })
            } else {
                Err(WrapError::TryAgain)
            }
        }
    }

    struct NeverMatches;

    impl WrappingTransport for NeverMatches {
        fn name(&self) -> &'static str {
            "never"
        }

        fn try_wrap(
            &self,
            _buffered: &mut Vec<u8>,
            _dst: IpAddr,
        ) -> std::result::Result<TransportMatch, WrapError> {
            Err(WrapError::NotTransport)
        }
    }

    /// First call eats the whole buffer and stays undecided; later calls
    /// match once enough fresh bytes accumulate.
    struct DrainingProbe {
        drained: std::sync::atomic::AtomicBool,
    }

    impl WrappingTransport for DrainingProbe {
        fn name(&self) -> &'static str {
            "draining"
        }

        fn try_wrap(
            &self,
            buffered: &mut Vec<u8>,
            _dst: IpAddr,
        ) -> std::result::Result<TransportMatch, WrapError> {
            if !self.drained.swap(true, Ordering::SeqCst) {
                buffered.clear();
                return Err(WrapError::TryAgain);
            }
            if buffered.len() >= 6 {
                Ok(TransportMatch {
                    transport: "draining",
                    identifier: buffered.clone(),
                })
            } else {
                Err(WrapError::TryAgain)
            }
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn dst() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 33))
    }

    #[tokio::test]
    async fn test_transport_match_path() {
        let dispatcher = ConnDispatcher::new(vec![
            Arc::new(NeverMatches),
            Arc::new(MatchAfter { need: 4 }),
        ]);
        let (mut client, server) = tcp_pair().await;

        client.write_all(b"covert-prefix").await.unwrap();
        let result = dispatcher
            .handle_new_conn(server, dst(), 64496, "aa", 1)
            .await;

        let (matched, buffered, _stream) = result.unwrap();
        assert_eq!(matched.transport, "match-after");
        assert_eq!(buffered, b"covert-prefix");

        let stats = dispatcher.stats();
        assert_eq!(stats.overall().started(), 1);
        assert_eq!(
            stats
                .overall()
                .transition_count(ConnState::Created, ConnState::Checking),
            1
        );
        assert_eq!(
            stats
                .overall()
                .transition_count(ConnState::Checking, ConnState::Found),
            1
        );
        assert_eq!(stats.overall().terminal_total(), stats.overall().started());
        assert_eq!(stats.asn_cc(64496).as_deref(), Some("aa"));
        assert_eq!(
            stats.asn_transition_count(64496, ConnState::Checking, ConnState::Found),
            1
        );
    }

    #[tokio::test]
    async fn test_partial_consume_falls_back_to_created() {
        let dispatcher = ConnDispatcher::new(vec![Arc::new(DrainingProbe {
            drained: std::sync::atomic::AtomicBool::new(false),
        })]);
        let (mut client, server) = tcp_pair().await;

        let handle = tokio::spawn(async move {
            client.write_all(b"amb").await.unwrap();
            // Leave time for the ambiguous prefix to be consumed alone.
            tokio::time::sleep(Duration::from_millis(200)).await;
            client.write_all(b"covert").await.unwrap();
            client
        });

        let result = dispatcher.handle_new_conn(server, dst(), 7, "cc", 1).await;
        let (matched, buffered, _stream) = result.unwrap();
        assert_eq!(matched.transport, "draining");
        assert_eq!(buffered, b"covert");
        let _ = handle.await;

        let stats = dispatcher.stats();
        assert_eq!(
            stats
                .overall()
                .transition_count(ConnState::Checking, ConnState::Created),
            1
        );
        assert_eq!(
            stats
                .overall()
                .transition_count(ConnState::Created, ConnState::Checking),
            2
        );
        assert_eq!(
            stats
                .overall()
                .transition_count(ConnState::Checking, ConnState::Found),
            1
        );
        assert_eq!(stats.overall().terminal_total(), stats.overall().started());
    }

    #[tokio::test]
    async fn test_no_registrations_discards_until_close() {
        let dispatcher = ConnDispatcher::new(vec![Arc::new(MatchAfter { need: 1 })]);
        let (mut client, server) = tcp_pair().await;

        let handle = tokio::spawn(async move {
            // Data written while discarding must be consumed, not matched.
            client.write_all(b"probe bytes").await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let result = dispatcher.handle_new_conn(server, dst(), 0, "", 0).await;
        assert!(result.is_none());
        let _ = handle.await;

        let stats = dispatcher.stats();
        assert_eq!(
            stats
                .overall()
                .transition_count(ConnState::Created, ConnState::IoDiscarding),
            1
        );
        assert_eq!(
            stats
                .overall()
                .transition_count(ConnState::IoDiscarding, ConnState::Closed),
            1
        );
        assert_eq!(stats.overall().terminal_total(), stats.overall().started());
    }

    #[tokio::test]
    async fn test_all_transports_reject_then_discard() {
        let dispatcher = ConnDispatcher::new(vec![Arc::new(NeverMatches)]);
        let (mut client, server) = tcp_pair().await;

        let handle = tokio::spawn(async move {
            client.write_all(b"not a covert prefix").await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let result = dispatcher.handle_new_conn(server, dst(), 0, "", 3).await;
        assert!(result.is_none());
        let _ = handle.await;

        let stats = dispatcher.stats();
        assert_eq!(
            stats
                .overall()
                .transition_count(ConnState::Checking, ConnState::IoDiscarding),
            1
        );
        assert_eq!(stats.overall().terminal_total(), stats.overall().started());
    }

    #[tokio::test]
    async fn test_counter_balance_over_mixed_outcomes() {
        let dispatcher = ConnDispatcher::new(vec![Arc::new(MatchAfter { need: 4 })]);

        for payload in [&b"yes!"[..], b"no", b""] {
            let (mut client, server) = tcp_pair().await;
            let payload = payload.to_vec();
            let writer = tokio::spawn(async move {
                if !payload.is_empty() {
                    client.write_all(&payload).await.unwrap();
                }
                client.shutdown().await.unwrap();
                client
            });
            let _ = dispatcher.handle_new_conn(server, dst(), 1, "bb", 1).await;
            let _ = writer.await;
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.overall().started(), 3);
        assert_eq!(stats.overall().terminal_total(), 3);
        assert!(stats.overall().total_transitions() >= 3);
    }

    #[test]
    fn test_transition_table_shape() {
        assert!(transition_allowed(ConnState::Created, ConnState::Checking));
        assert!(transition_allowed(ConnState::Checking, ConnState::Found));
        assert!(transition_allowed(ConnState::IoDiscarding, ConnState::Closed));
        assert!(!transition_allowed(ConnState::Found, ConnState::Created));
        assert!(!transition_allowed(ConnState::Created, ConnState::Found));
        assert!(!transition_allowed(ConnState::Reading, ConnState::Found));
    }
}

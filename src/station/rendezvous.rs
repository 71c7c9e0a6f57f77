//! Dual-path rendezvous: race an outbound dial against the shared
//! listener's accept.
//!
//! The DNAT path can fail intermittently (conntrack races, dropped seed
//! packets, asymmetric routing), so the station plays both roles at once:
//! dial the client from the listen port with SO_REUSEPORT, and wait for the
//! client's own handshake on the dispatch listener. Whichever side
//! completes first carries the session; the loser is dropped on the floor.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

use super::dnat::Dnat;
use super::Registration;
use crate::conn::Conn;
use crate::dtls::{dial_with_transport, Listener, UdpTransport};
use crate::error::{Error, Result};
use crate::heartbeat;

/// Station-side rendezvous controller.
pub struct Rendezvous {
    listener: Arc<Listener>,
    dnat: Dnat,
    listen_port: u16,
    heartbeat: heartbeat::Config,
}

impl Rendezvous {
    /// Build a controller over the shared listener and DNAT shim.
    pub fn new(listener: Arc<Listener>, dnat: Dnat, listen_port: u16) -> Rendezvous {
        Rendezvous {
            listener,
            dnat,
            listen_port,
            heartbeat: heartbeat::Config::default(),
        }
    }

    /// Override the heartbeat configuration for established sessions.
    pub fn with_heartbeat(mut self, config: heartbeat::Config) -> Rendezvous {
        self.heartbeat = config;
        self
    }

    /// Establish the covert bytestream for one registration.
    ///
    /// Writes the DNAT entry, then races dial and accept. The winner comes
    /// back wrapped in the heartbeat receiver. Dropping the future cancels
    /// both arms and clears the accept registrations.
    pub async fn connect(&self, reg: &Registration) -> Result<Box<dyn Conn>> {
        let (IpAddr::V4(client_ip), IpAddr::V4(phantom_ip)) = (reg.client_ip, reg.phantom_ip)
        else {
            return Err(Error::dnat("only IPv4 phantoms are routable here"));
        };
        // Conntrack state must exist before either arm can see traffic.
        self.dnat
            .add_entry(client_ip, reg.client_port, phantom_ip, reg.phantom_port)?;

        let client_addr = SocketAddr::new(reg.client_ip, reg.client_port);
        let dial_fut = dial_arm(self.listen_port, client_addr, reg.shared_secret.clone());
        let accept_fut = self.listener.accept_from_secret(&reg.shared_secret);
        tokio::pin!(dial_fut);
        tokio::pin!(accept_fut);

        let mut dial_err: Option<Error> = None;
        let mut accept_err: Option<Error> = None;
        loop {
            tokio::select! {
                res = &mut dial_fut, if dial_err.is_none() => match res {
                    Ok(conn) => {
                        tracing::debug!(client = %client_addr, "rendezvous won by dial arm");
                        return Ok(self.wrap(conn));
                    }
                    Err(err) => {
                        tracing::debug!(client = %client_addr, "dial arm failed: {err}");
                        dial_err = Some(err);
                    }
                },
                res = &mut accept_fut, if accept_err.is_none() => match res {
                    Ok(conn) => {
                        tracing::debug!(client = %client_addr, "rendezvous won by accept arm");
                        return Ok(self.wrap(conn));
                    }
                    Err(err) => {
                        tracing::debug!(client = %client_addr, "accept arm failed: {err}");
                        accept_err = Some(err);
                    }
                },
            }
            if let (Some(dial), Some(accept)) = (&dial_err, &accept_err) {
                return Err(Error::Rendezvous {
                    dial: dial.to_string(),
                    accept: accept.to_string(),
                });
            }
        }
    }

    fn wrap(&self, conn: crate::sctp::SctpConn) -> Box<dyn Conn> {
        Box::new(heartbeat::server(Arc::new(conn), &self.heartbeat))
    }
}

/// Dial the client from the shared listen port.
///
/// SO_REUSEPORT lets this socket coexist with the dispatch listener on the
/// same port; the connected four-tuple steers replies here.
async fn dial_arm(
    listen_port: u16,
    client_addr: SocketAddr,
    seed: Vec<u8>,
) -> Result<crate::sctp::SctpConn> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port);
    socket.bind(&bind_addr.into())?;
    socket.connect(&client_addr.into())?;

    let socket = tokio::net::UdpSocket::from_std(socket.into())?;
    dial_with_transport(Arc::new(UdpTransport::new(socket)), &seed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NullInjector;

    impl super::super::dnat::PacketInjector for NullInjector {
        fn inject(&self, _packet: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    struct FailInjector;

    impl super::super::dnat::PacketInjector for FailInjector {
        fn inject(&self, _packet: &[u8]) -> Result<()> {
            Err(Error::dnat("injector down"))
        }
    }

    fn registration(seed: &[u8], client_port: u16) -> Registration {
        Registration {
            shared_secret: seed.to_vec(),
            client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            client_port,
            phantom_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            phantom_port: 443,
            transport: super::super::TransportType::Dtls,
        }
    }

    #[tokio::test]
    async fn test_accept_arm_wins_when_client_dials_in() {
        let listener = Arc::new(
            Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap(),
        );
        let station_addr = listener.local_addr().unwrap();
        let seed = b"hihihihihihihihihihihihihihihihi";

        // The fabricated client: no socket listens on its port, so the
        // dial arm can only lose.
        let reg = registration(seed, 59999);
        let rendezvous = Rendezvous::new(
            listener,
            Dnat::with_injector(Box::new(NullInjector)),
            station_addr.port(),
        )
        .with_heartbeat(heartbeat::Config {
            payload: bytes::Bytes::from_static(b"hb-payload"),
            interval: Duration::from_secs(1),
        });

        let client = tokio::spawn(async move {
            crate::dtls::dial(station_addr, b"hihihihihihihihihihihihihihihihi").await
        });

        let station_conn = rendezvous.connect(&reg).await.unwrap();
        let client_conn = client.await.unwrap().unwrap();

        client_conn.write(b"rendezvous complete").await.unwrap();
        let mut buf = [0u8; 64];
        let n = station_conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"rendezvous complete");
    }

    #[tokio::test]
    async fn test_dnat_failure_is_fatal_for_the_attempt() {
        let listener = Arc::new(
            Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap(),
        );
        let port = listener.local_addr().unwrap().port();
        let rendezvous =
            Rendezvous::new(listener, Dnat::with_injector(Box::new(FailInjector)), port);

        let reg = registration(b"hihihihihihihihihihihihihihihihi", 59998);
        assert!(matches!(
            rendezvous.connect(&reg).await,
            Err(Error::Dnat(_))
        ));
    }

    #[tokio::test]
    async fn test_both_arms_failing_joins_causes() {
        let listener = Arc::new(
            Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap(),
        );
        let port = listener.local_addr().unwrap().port();
        let rendezvous = Rendezvous::new(
            listener.clone(),
            Dnat::with_injector(Box::new(NullInjector)),
            port,
        );

        // Nobody dials in; cancel the attempt quickly by holding the seed
        // registered on the accept side and timing the whole thing out.
        let reg = registration(b"33333333333333333333333333333333", 59997);
        let res =
            tokio::time::timeout(Duration::from_millis(500), rendezvous.connect(&reg)).await;
        // Neither arm can finish: the future is still pending when the
        // timeout fires, and dropping it must clear the registration.
        assert!(res.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = tokio::time::timeout(
            Duration::from_millis(200),
            listener.accept_from_secret(b"33333333333333333333333333333333"),
        )
        .await;
        // Registering again succeeds (times out waiting, not duplicate).
        assert!(second.is_err());
    }
}

//! Station-side demo binary.
//!
//! Binds the dispatch listener and reads registrations as JSON lines on
//! stdin:
//!
//! ```text
//! {"shared_secret":"<hex>","client_ip":"1.2.3.4","client_port":6666,
//!  "phantom_ip":"5.6.7.8","phantom_port":4443}
//! ```
//!
//! Each registration runs a rendezvous; an established covert stream is
//! echoed back to the client. Requires a TUN device (CJ_CORECOUNT, OFFSET)
//! unless --no-dnat substitutes a no-op injector for local testing.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use mirage::station::dnat::{Dnat, PacketInjector};
use mirage::station::rendezvous::Rendezvous;
use mirage::station::{Registration, TransportType};
use mirage::Conn;

#[derive(Deserialize)]
struct RegistrationLine {
    shared_secret: String,
    client_ip: IpAddr,
    client_port: u16,
    phantom_ip: IpAddr,
    phantom_port: u16,
}

struct NullInjector;

impl PacketInjector for NullInjector {
    fn inject(&self, _packet: &[u8]) -> mirage::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut listen: SocketAddr = "0.0.0.0:4443".parse()?;
    let mut no_dnat = false;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-l" | "--listen" => {
                listen = iter
                    .next()
                    .context("--listen requires an address")?
                    .parse()?;
            }
            "--no-dnat" => no_dnat = true,
            "-h" | "--help" => {
                println!("usage: mirage-station [--listen ADDR:PORT] [--no-dnat]");
                return Ok(());
            }
            other => anyhow::bail!("unknown option: {other}"),
        }
    }

    let listener = Arc::new(mirage::dtls::Listener::bind(listen).await?);
    let listen_port = listener.local_addr()?.port();

    let dnat = if no_dnat {
        Dnat::with_injector(Box::new(NullInjector))
    } else {
        open_tun_dnat()?
    };

    let rendezvous = Arc::new(Rendezvous::new(listener, dnat, listen_port));
    tracing::info!("station up, reading registrations from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: RegistrationLine = match serde_json::from_str(&line) {
            Ok(reg) => reg,
            Err(err) => {
                tracing::warn!("bad registration line: {err}");
                continue;
            }
        };
        let shared_secret = match hex::decode(parsed.shared_secret.trim()) {
            Ok(secret) => secret,
            Err(err) => {
                tracing::warn!("bad shared secret hex: {err}");
                continue;
            }
        };
        let reg = Registration {
            shared_secret,
            client_ip: parsed.client_ip,
            client_port: parsed.client_port,
            phantom_ip: parsed.phantom_ip,
            phantom_port: parsed.phantom_port,
            transport: TransportType::Dtls,
        };

        let rendezvous = rendezvous.clone();
        tokio::spawn(async move {
            match rendezvous.connect(&reg).await {
                Ok(conn) => {
                    tracing::info!("covert session established, echoing");
                    echo(conn).await;
                }
                Err(err) => tracing::warn!("rendezvous failed: {err}"),
            }
        });
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn open_tun_dnat() -> anyhow::Result<Dnat> {
    Dnat::from_env().context("tun device init (set CJ_CORECOUNT and OFFSET)")
}

#[cfg(not(target_os = "linux"))]
fn open_tun_dnat() -> anyhow::Result<Dnat> {
    anyhow::bail!("DNAT requires Linux; run with --no-dnat")
}

async fn echo(conn: Box<dyn Conn>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match conn.read(&mut buf).await {
            Ok(n) => {
                if conn.write(&buf[..n]).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!("session ended: {err}");
                return;
            }
        }
    }
}

//! Client-side demo binary: dial a phantom with a hex seed and chat over
//! the covert stream. Lines from stdin go up; frames from the station come
//! back on stdout.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use mirage::heartbeat;
use mirage::Conn;

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
    if args.len() != 3 {
        eprintln!("usage: mirage-client <phantom-addr:port> <seed-hex>");
        std::process::exit(2);
    }
    let addr = args[1].parse().context("phantom address")?;
    let seed = hex::decode(&args[2]).context("seed hex")?;

    let conn: Arc<dyn Conn> = Arc::new(mirage::dtls::dial(addr, &seed).await?);
    tracing::info!("connected to phantom {addr}");

    // Keepalive toward the station; its watchdog closes idle sessions.
    let mut hb_errs = heartbeat::start_client(conn.clone(), &heartbeat::Config::default());

    let reader = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match conn.read(&mut buf).await {
                    Ok(n) => println!("{}", String::from_utf8_lossy(&buf[..n])),
                    Err(err) => {
                        tracing::info!("stream closed: {err}");
                        return;
                    }
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if line == "exit" {
                        conn.close().await.ok();
                        break;
                    }
                    conn.write(line.as_bytes()).await?;
                }
                None => break,
            },
            err = hb_errs.recv() => {
                if let Some(err) = err {
                    tracing::warn!("heartbeat send failed: {err}");
                }
                break;
            }
        }
    }

    reader.abort();
    Ok(())
}

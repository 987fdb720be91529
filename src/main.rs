//! simple-messenger: run a messaging entity from a config file.
//!
//! ```text
//! simple-messenger -c osd0.toml run
//!     bind, answer pings, reload config on change or SIGHUP,
//!     print status as JSON on shutdown
//!
//! simple-messenger -c client.toml ping --peer 127.0.0.1:6800/7 --peer-name osd.0
//!     send pings over one session, print round trips and status as JSON
//!
//! simple-messenger -c osd0.toml check-config
//!     validate and print the effective configuration
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;

use simple_messenger::config::watcher::ConfigWatcher;
use simple_messenger::config::{load_config, MessengerConfig};
use simple_messenger::lifecycle::{next_signal, SignalEvent};
use simple_messenger::observability::{logging, metrics};
use simple_messenger::{
    Delivery, Dispatcher, EntityAddr, EntityInst, EntityName, Message, Messenger,
};

const MSG_PING: u16 = 0x7001;
const MSG_PONG: u16 = 0x7002;

#[derive(Parser)]
#[command(name = "simple-messenger")]
#[command(about = "Reliable session messaging between named entities", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve until interrupted, answering pings
    Run,
    /// Ping a peer and report round-trip times
    Ping {
        /// Peer address as ip:port/nonce
        #[arg(long)]
        peer: EntityAddr,
        /// Peer entity name, e.g. osd.0
        #[arg(long, default_value = "osd.0")]
        peer_name: EntityName,
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u64,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Validate the configuration and print it
    CheckConfig,
}

/// Answers pings and collects pongs.
struct PingPong {
    pongs: mpsc::UnboundedSender<u64>,
}

impl Dispatcher for PingPong {
    fn ms_dispatch(&self, m: Message) -> Delivery {
        match m.msg_type() {
            MSG_PING => {
                if let Some(con) = m.connection() {
                    let pong = Message::new(MSG_PONG)
                        .with_tid(m.tid())
                        .with_data(m.data().clone());
                    if let Err(e) = con.send_message(pong) {
                        tracing::warn!(error = %e, "failed to answer ping");
                    }
                }
                Delivery::Handled
            }
            MSG_PONG => {
                let _ = self.pongs.send(m.tid());
                Delivery::Handled
            }
            _ => Delivery::Unhandled(m),
        }
    }

    fn ms_handle_reset(&self, con: &simple_messenger::ConnectionRef) -> bool {
        tracing::info!(peer = %con.peer_addr(), "session reset");
        true
    }
}

#[derive(Serialize)]
struct PingReport {
    peer: EntityAddr,
    sent: u64,
    received: u64,
    rtt_ms: Vec<f64>,
    status: simple_messenger::MessengerStatus,
}

fn load(path: Option<&PathBuf>) -> Result<MessengerConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => load_config(path)?,
        None => MessengerConfig::default(),
    })
}

fn start_observability(config: &MessengerConfig) {
    logging::init(&config.observability.log_level);
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "failed to parse metrics address"
            ),
        }
    }
}

async fn build(
    config: MessengerConfig,
) -> Result<(Messenger, mpsc::UnboundedReceiver<u64>), Box<dyn std::error::Error>> {
    let listener = config.listener.clone();
    let msgr = Messenger::from_config(config)?;
    let (pongs, rx) = mpsc::unbounded_channel();
    msgr.add_dispatcher_tail(Arc::new(PingPong { pongs }));
    if listener.enabled {
        msgr.bind(listener.bind_address.parse()?).await?;
    }
    msgr.start()?;
    tracing::info!(name = %msgr.my_name(), addr = %msgr.my_addr(), "simple-messenger started");
    Ok((msgr, rx))
}

async fn run(msgr: Messenger, path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    // the watcher must outlive the loop
    let _watcher = match &path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let tx = reload_tx.clone();
            tokio::spawn(async move {
                while let Some(config) = updates.recv().await {
                    let _ = tx.send(config);
                }
            });
            Some(watcher.run()?)
        }
        None => None,
    };

    loop {
        tokio::select! {
            Some(config) = reload_rx.recv() => msgr.apply_config(config),
            signal = next_signal() => match signal? {
                SignalEvent::Shutdown => break,
                SignalEvent::Reload => match &path {
                    Some(path) => match load_config(path) {
                        Ok(config) => msgr.apply_config(config),
                        Err(e) => tracing::error!(error = %e, "reload failed, keeping current configuration"),
                    },
                    None => tracing::info!("no config file, nothing to reload"),
                },
            },
        }
    }

    let status = msgr.status();
    msgr.shutdown();
    msgr.wait().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn ping(
    msgr: Messenger,
    mut pongs: mpsc::UnboundedReceiver<u64>,
    peer: EntityInst,
    count: u64,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let con = msgr.get_connection(&peer)?;
    let mut sent_at = HashMap::new();
    for tid in 1..=count {
        sent_at.insert(tid, Instant::now());
        con.send_message(Message::new(MSG_PING).with_tid(tid))?;
    }

    let mut rtt_ms = Vec::with_capacity(count as usize);
    let deadline = tokio::time::Instant::now() + timeout;
    while (rtt_ms.len() as u64) < count {
        match tokio::time::timeout_at(deadline, pongs.recv()).await {
            Ok(Some(tid)) => {
                if let Some(started) = sent_at.remove(&tid) {
                    rtt_ms.push(started.elapsed().as_secs_f64() * 1000.0);
                }
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(received = rtt_ms.len(), expected = count, "ping timed out");
                break;
            }
        }
    }

    let report = PingReport {
        peer: peer.addr,
        sent: count,
        received: rtt_ms.len() as u64,
        rtt_ms,
        status: msgr.status(),
    };
    msgr.shutdown();
    msgr.wait().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load(cli.config.as_ref())?;

    match cli.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Run => {
            start_observability(&config);
            let (msgr, _pongs) = build(config).await?;
            run(msgr, cli.config).await?;
        }
        Command::Ping {
            peer,
            peer_name,
            count,
            timeout_ms,
        } => {
            start_observability(&config);
            let (msgr, pongs) = build(config).await?;
            let peer = EntityInst::new(peer_name, peer);
            ping(msgr, pongs, peer, count, Duration::from_millis(timeout_ms)).await?;
        }
    }
    Ok(())
}

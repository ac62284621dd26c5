#![forbid(unsafe_code)]

//! JFK node - runs the handshake over a UDP socket.
//!
//! The node:
//! 1. Loads (or creates) its Ed25519 identity
//! 2. Answers handshakes from known peers, and optionally anonymous ones
//! 3. Periodically initiates handshakes with every configured peer

mod peers;
mod runtime;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use jfk_common::HandshakeConfig;
use jfk_crypto::{Decoded, Handshaker, IdentityKeypair, LocalNode, NodeSigner, PeerSession};
use peers::{load_peers, PeerTable};
use rand::Rng;
use runtime::{TokioScheduler, UdpTransport};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const DEFAULT_CONNECT_INTERVAL_SECS: u64 = 10;
const DEFAULT_REKEY_AFTER_SECS: u64 = 3600;
const DEFAULT_MAX_ANONYMOUS_PEERS: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "jfk-node")]
#[command(about = "JFK handshake node - answers and initiates handshakes over UDP")]
struct Args {
    /// UDP listen address
    #[arg(long, default_value = "127.0.0.1:4100")]
    listen: SocketAddr,

    /// Private key file; created if missing
    #[arg(long, default_value = "jfk-identity.key")]
    identity_file: String,

    /// JSON file listing peers to connect to
    #[arg(long)]
    peers: Option<PathBuf>,

    /// JSON handshake configuration; defaults apply to missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Accept anonymous initiators (act as a seed node)
    #[arg(long, default_value_t = false)]
    seed: bool,

    /// Anonymous initiators remembered at once when acting as a seed
    #[arg(long, default_value_t = DEFAULT_MAX_ANONYMOUS_PEERS)]
    max_anonymous_peers: usize,

    /// Offer the legacy negotiation type 6
    #[arg(long, default_value_t = false)]
    open: bool,

    /// Seconds between connection attempts
    #[arg(long, default_value_t = DEFAULT_CONNECT_INTERVAL_SECS)]
    connect_interval: u64,

    /// Seconds after which an established session is rekeyed
    #[arg(long, default_value_t = DEFAULT_REKEY_AFTER_SECS)]
    rekey_after: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<HandshakeConfig> {
    let mut config = match &args.config {
        Some(path) => HandshakeConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => HandshakeConfig::default(),
    };
    config.apply_env_overrides();
    if args.seed {
        config.accept_anonymous_initiators = true;
    }
    config.validate()?;
    Ok(config)
}

async fn connect_loop(
    handshaker: Arc<Handshaker>,
    table: Arc<PeerTable>,
    interval: Duration,
    rekey_after: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if handshaker.is_shutting_down() {
            return;
        }
        let now = Instant::now();
        for peer in table.known() {
            if !peer.needs_handshake(now, rekey_after) {
                continue;
            }
            if peer.has_keys() {
                debug!("rekeying {}", peer.node_id());
            } else {
                debug!("connecting to {}", peer.node_id());
            }
            let session = Arc::clone(peer) as Arc<dyn PeerSession>;
            // Failures are logged by the handshaker.
            let _ = handshaker.send_handshake(&session, now);
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, handshaker: Arc<Handshaker>) -> Result<()> {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let packet = buf[..len].to_vec();
        let worker = handshaker.clone();
        // Key agreement and signature checks are CPU bound.
        let decoded =
            tokio::task::spawn_blocking(move || worker.handle_incoming(&packet, from, Instant::now()))
                .await?;
        match decoded {
            Decoded::Handled => {}
            Decoded::NotRecognized => debug!("ignored {} bytes from {}", len, from),
            Decoded::ShuttingDown => return Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    jfk_common::init_tracing_with_default(&args.log_level);
    info!("Starting jfk-node v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let keypair = Arc::new(IdentityKeypair::load_or_generate(&args.identity_file)?);
    info!("Node ID: {}", keypair.node_id());

    let entries = match &args.peers {
        Some(path) => load_peers(path)?,
        None => Vec::new(),
    };
    let boot_id: u64 = rand::thread_rng().gen();
    let table = Arc::new(PeerTable::new(&entries, boot_id, args.max_anonymous_peers)?);
    info!("{} configured peers", table.known().len());

    let socket = Arc::new(
        UdpSocket::bind(args.listen)
            .await
            .with_context(|| format!("failed to bind {}", args.listen))?,
    );
    info!("Listening on {}", socket.local_addr()?);

    let local = LocalNode {
        reference: Bytes::copy_from_slice(&keypair.identity()),
        signer: keypair,
        open: args.open,
    };
    let now = Instant::now();
    let handshaker = Arc::new(Handshaker::new(
        config,
        local,
        Arc::new(UdpTransport::new(socket.clone())),
        table.clone(),
        Arc::new(TokioScheduler::new(tokio::runtime::Handle::current())),
        now,
    )?);

    // Context generation is CPU bound.
    {
        let handshaker = handshaker.clone();
        tokio::task::spawn_blocking(move || handshaker.start(now)).await?;
    }

    tokio::spawn(connect_loop(
        handshaker.clone(),
        table.clone(),
        Duration::from_secs(args.connect_interval.max(1)),
        Duration::from_secs(args.rekey_after),
    ));

    let receiver = tokio::spawn(receive_loop(socket, handshaker.clone()));

    tokio::select! {
        result = receiver => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("receive loop failed: {}", e),
                Err(e) => warn!("receive loop panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    handshaker.shutdown();
    info!(
        "Shut down ({} anonymous peers accepted)",
        table.accepted_count()
    );
    Ok(())
}

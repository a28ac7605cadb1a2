//! `neverliie-peer` — reference peer binary.
//!
//! Usage:
//!   neverliie-peer --name term
//!
//! Boots a peer node under the given name, exposes a handful of sample
//! operations and serves until it is terminated (or told to stop through
//! its remote `shutdown` operation). A second instance under the same name
//! exits cleanly with status 0.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use neverliie::{ops, IpcError, LaunchDescriptor, NodeConfig, PeerNode, ValueStream};

#[derive(Parser, Debug)]
#[command(name = "neverliie-peer", about = "reference peer for the NeverLiie mesh")]
struct Args {
    /// Peer name to register and listen under.
    #[arg(long)]
    name: String,

    /// Runtime directory holding the registry and the peer sockets.
    /// Defaults to `~/.neverliie`.
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.base_dir {
        Some(dir) => NodeConfig::with_base_dir(dir),
        None => NodeConfig::new(),
    };
    // Record the full command line (with absolute argv[0]) so `wake` can
    // bring this exact peer back, flags included.
    let exe = std::env::current_exe()?;
    let mut cmd: Vec<String> = std::env::args().collect();
    cmd[0] = exe.display().to_string();
    let cwd = exe.parent().map(PathBuf::from).unwrap_or_else(|| "/".into());
    config = config.launch_descriptor(LaunchDescriptor::binary(cmd, cwd));

    let node = match PeerNode::start(args.name.clone(), config).await {
        Ok(node) => node,
        Err(IpcError::AlreadyRunning(name)) => {
            // A duplicate is not an error: the mesh already has this peer.
            info!(peer = %name, "already running, exiting");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let stop = CancellationToken::new();
    register_sample_ops(&node, stop.clone());

    tokio::select! {
        _ = stop.cancelled() => info!("shutdown requested remotely"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    // Give the worker that carried the shutdown call a beat to flush its
    // reply before the listener goes away.
    tokio::time::sleep(Duration::from_millis(50)).await;
    node.shutdown().await;
    Ok(())
}

fn register_sample_ops(node: &PeerNode, stop: CancellationToken) {
    node.expose(
        "add",
        ops::unary(|inv| async move {
            let a = number(inv.args.first())?;
            let b = number(inv.args.get(1))?;
            Ok(match (a, b) {
                (Num::Int(a), Num::Int(b)) => json!(a + b),
                (a, b) => json!(a.as_f64() + b.as_f64()),
            })
        }),
    );

    node.expose(
        "echo",
        ops::unary(|inv| async move {
            Ok(inv.args.into_iter().next().unwrap_or(Value::Null))
        }),
    );

    // Yields 1..=n.
    node.expose(
        "count",
        ops::streaming(|inv| async move {
            let n = inv
                .args
                .first()
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow::anyhow!("count(n) needs a non-negative integer"))?;
            let s = futures::stream::iter((1..=n).map(|i| Ok::<_, anyhow::Error>(json!(i))));
            Ok(Box::pin(s) as ValueStream)
        }),
    );

    // Yields forever, one integer every 50 ms, until cancelled.
    node.expose(
        "drip",
        ops::streaming(|_inv| async move {
            let s = futures::stream::unfold(0u64, |i| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some((Ok::<_, anyhow::Error>(json!(i)), i + 1))
            });
            Ok(Box::pin(s) as ValueStream)
        }),
    );

    node.expose(
        "shutdown",
        ops::unary(move |_inv| {
            let stop = stop.clone();
            async move {
                stop.cancel();
                Ok(Value::Null)
            }
        }),
    );
}

enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(&self) -> f64 {
        match *self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn number(v: Option<&Value>) -> anyhow::Result<Num> {
    let v = v.ok_or_else(|| anyhow::anyhow!("missing numeric argument"))?;
    if let Some(i) = v.as_i64() {
        Ok(Num::Int(i))
    } else if let Some(f) = v.as_f64() {
        Ok(Num::Float(f))
    } else {
        anyhow::bail!("expected a number, got {v}")
    }
}

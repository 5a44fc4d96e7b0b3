//! opflow-ping: runs several engines on one in-process fabric and has node 0
//! ping every other node.

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use opflow_core::NodeId;
use opflow_engine::{
    Engine, EngineConfig, FabricConfig, LocalFabric, OpError, PingOp, RdmaPingOp, ResultFuture,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "opflow-ping", about = "Ping protocols over an in-process fabric")]
struct Cli {
    /// Number of engines on the fabric, including the pinging node.
    #[arg(long, env = "OPFLOW_NODES", default_value_t = 4)]
    nodes: u64,

    /// Pings sent to each peer.
    #[arg(long, env = "OPFLOW_PINGS", default_value_t = 1)]
    pings: usize,

    /// Payload carried by every ping.
    #[arg(long, env = "OPFLOW_MESSAGE", default_value = "this is the ping message")]
    message: String,

    /// Move the payload with get/put instead of inside the message.
    #[arg(long, env = "OPFLOW_RDMA")]
    rdma: bool,

    /// Per-ping timeout. Zero waits forever.
    #[arg(long, env = "OPFLOW_TIMEOUT_MS", default_value_t = 2_000)]
    timeout_ms: u64,

    /// Latency added to every fabric action.
    #[arg(long, env = "OPFLOW_LATENCY_MS", default_value_t = 0)]
    latency_ms: u64,

    /// Probability that a fabric send is lost.
    #[arg(long, env = "OPFLOW_DROP_RATE", default_value_t = 0.0)]
    drop_rate: f64,

    /// Emit logs and the report as JSON.
    #[arg(long, env = "OPFLOW_JSON")]
    json: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PingReport {
    peer: u64,
    ok: bool,
    reply: Option<String>,
    error: Option<String>,
    elapsed_us: u128,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);
    anyhow::ensure!(cli.nodes >= 2, "need at least two nodes, got {}", cli.nodes);

    let fabric = LocalFabric::new(FabricConfig {
        latency: Duration::from_millis(cli.latency_ms),
        drop_rate: cli.drop_rate.clamp(0.0, 1.0),
    });

    let mut engines = Vec::new();
    for n in 0..cli.nodes {
        let node = NodeId(n);
        let engine = Engine::builder(EngineConfig::default())
            .register_op::<PingOp>()
            .register_op::<RdmaPingOp>()
            .start(fabric.attach(node))
            .with_context(|| format!("starting engine on {node}"))?;
        engines.push(engine);
    }

    let origin = &engines[0];
    let timeout = (cli.timeout_ms > 0).then(|| Duration::from_millis(cli.timeout_ms));

    let mut pending = Vec::new();
    for target in engines.iter().skip(1).map(Engine::node) {
        let peer = origin
            .peer(target)
            .with_context(|| format!("{target} is not on the fabric"))?;
        for _ in 0..cli.pings {
            let started = Instant::now();
            let future = if cli.rdma {
                let (mut op, future) = RdmaPingOp::new(origin.allocator(), peer, &cli.message)?;
                if let Some(t) = timeout {
                    op = op.with_timeout(t);
                }
                origin.launch(op)?;
                future
            } else {
                let (mut op, future) = PingOp::new(peer, cli.message.clone());
                if let Some(t) = timeout {
                    op = op.with_timeout(t);
                }
                origin.launch(op)?;
                future
            };
            pending.push((target, started, future));
        }
    }

    let mut reports = Vec::with_capacity(pending.len());
    for (target, started, future) in pending {
        reports.push(collect(target, started, future).await);
    }

    let failures = reports.iter().filter(|r| !r.ok).count();
    if cli.json {
        let stats: Vec<_> = engines.iter().map(|e| (e.node().0, e.stats())).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "pings": reports,
                "stats": stats,
            }))?
        );
    } else {
        for report in &reports {
            match (&report.reply, &report.error) {
                (Some(reply), _) => {
                    println!("node {:>3}  {:>8}us  {reply}", report.peer, report.elapsed_us);
                }
                (None, Some(error)) => {
                    println!("node {:>3}  FAILED     {error}", report.peer);
                }
                (None, None) => {}
            }
        }
        println!("{} pings, {failures} failed", reports.len());
    }

    for engine in &engines {
        engine.shutdown_default().await;
    }
    anyhow::ensure!(failures == 0, "{failures} pings failed");
    Ok(())
}

async fn collect(target: NodeId, started: Instant, future: ResultFuture<String>) -> PingReport {
    let result: Result<String, OpError> = future.await;
    let elapsed_us = started.elapsed().as_micros();
    match result {
        Ok(reply) => PingReport {
            peer: target.0,
            ok: true,
            reply: Some(reply),
            error: None,
            elapsed_us,
        },
        Err(e) => PingReport {
            peer: target.0,
            ok: false,
            reply: None,
            error: Some(e.to_string()),
            elapsed_us,
        },
    }
}

//! capsim - Capstone revocation-node scenario harness
//!
//! Loads a YAML scenario of node operations, drives them through the
//! cycle-level model one commit at a time, and reports results, memory
//! traffic and queue statistics. With `--audit`, the node pool is checked
//! against its structural invariants after every operation.

mod scenario;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capsim_core::{audit, SimConfig, System};

use crate::scenario::Scenario;

#[derive(Parser)]
#[command(name = "capsim")]
#[command(about = "Capstone revocation-node scenario harness")]
struct Args {
    /// Scenario file to run
    scenario: PathBuf,

    /// Model configuration file (YAML)
    #[arg(long, default_value = "capsim.yaml")]
    config: PathBuf,

    /// Audit pool invariants after every operation
    #[arg(long)]
    audit: bool,

    /// Per-operation tick budget before the run is declared stuck
    #[arg(long, default_value = "100000")]
    max_ticks: u64,

    /// Log filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .init();

    let config = SimConfig::load(&args.config).context("loading configuration")?;
    let scenario = Scenario::load(&args.scenario)?;
    info!(
        "Running {} operations ({} threads, ncq depth {}, memory latency {})",
        scenario.ops.len(),
        config.threads,
        config.ncq_depth,
        config.mem_latency
    );

    let mut sys = System::new(&config);

    for (step, op) in scenario.ops.iter().enumerate() {
        let node_op = op.to_node_op();
        debug!("step {}: {:?}", step, node_op);

        let started = sys.now();
        sys.push_commit_command(0, node_op);
        sys.run_until_quiet(args.max_ticks);
        let done = sys
            .ncq
            .take_retired_commits()
            .pop()
            .with_context(|| format!("step {} did not retire", step))?;
        let elapsed = sys.now() - started;

        op.check(&done)
            .with_context(|| format!("step {} ({:?})", step, node_op))?;
        info!("step {}: {:?} -> {:?} in {} ticks", step, node_op, done.result, elapsed);

        if args.audit {
            let snap = audit(&sys.controller, &sys.memory)
                .with_context(|| format!("pool audit after step {}", step))?;
            debug!(
                "audit: {} live, {} free, {} handed out",
                snap.live.len(),
                snap.free.len(),
                snap.first_fresh
            );
        }
    }

    info!("Scenario complete in {} ticks", sys.now());
    println!("{}", sys.controller.stats());
    println!("{}", sys.ncq.stats());
    println!(
        "memory: {} reads, {} writes",
        sys.memory.reads, sys.memory.writes
    );

    Ok(())
}

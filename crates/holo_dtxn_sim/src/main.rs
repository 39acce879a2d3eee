//! Simulator binary: start a local cluster, run a workload, verify replicas.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_dtxn::dtxn::{ExhaustedTxnPolicy, SiteId};
use holo_dtxn_sim::cluster::{ClusterConfig, LocalCluster};
use holo_dtxn_sim::history::{write_history, History, HistoryMeta};
use holo_dtxn_sim::workload::{run_workload, WorkloadConfig};
use rand::Rng;
use tokio::time;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-dtxn-sim")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for one simulated run.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    #[arg(long, env = "HOLO_DTXN_PARTITIONS", default_value_t = 4)]
    partitions: u64,

    /// Extra replicas per partition.
    #[arg(long, env = "HOLO_DTXN_K_FACTOR", default_value_t = 1)]
    k_factor: u32,

    #[arg(long, env = "HOLO_DTXN_INITIATORS", default_value_t = 2)]
    initiators: u64,

    /// Hold each transaction until every replica is known to have received it.
    #[arg(long, env = "HOLO_DTXN_SAFETY_DANCE", default_value_t = false, action = clap::ArgAction::Set)]
    safety_dance: bool,

    #[arg(long, env = "HOLO_DTXN_HEARTBEAT_INTERVAL", default_value = "5ms")]
    heartbeat_interval: humantime::Duration,

    #[arg(long, env = "HOLO_DTXN_POLL_INTERVAL", default_value = "5ms")]
    poll_interval: humantime::Duration,

    /// Answer with an unknown outcome instead of halting when every replica
    /// of a transaction fails.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    report_unknown_outcome: bool,

    #[arg(long, default_value_t = 8)]
    clients: usize,

    #[arg(long, default_value_t = 16)]
    keys: usize,

    /// Percent of calls that span every partition.
    #[arg(long, default_value_t = 10)]
    mp_pct: u8,

    /// Percent of calls that write.
    #[arg(long, default_value_t = 50)]
    write_pct: u8,

    /// Percent of single-partition writes that abort after writing.
    #[arg(long, default_value_t = 5)]
    abort_pct: u8,

    #[arg(long, default_value = "5s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value = "10s")]
    op_timeout: humantime::Duration,

    /// When true, any call error aborts the run.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Crash one replica partway through the run.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    fail_site: bool,

    /// Site to crash. Defaults to the lowest site id, a multipartition coordinator.
    #[arg(long)]
    victim: Option<SiteId>,

    #[arg(long, default_value = "1s")]
    fail_after: humantime::Duration,

    /// How long replicas get to catch up before they are compared.
    #[arg(long, default_value = "5s")]
    settle_timeout: humantime::Duration,

    #[arg(long, default_value = ".tmp/dtxn/history.json")]
    out: PathBuf,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.partitions > 0, "--partitions must be > 0");
    anyhow::ensure!(args.initiators > 0, "--initiators must be > 0");
    anyhow::ensure!(
        !args.fail_site || args.k_factor > 0,
        "--fail-site needs --k-factor >= 1"
    );

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let mut cluster_config = ClusterConfig::new(args.partitions, args.k_factor);
    cluster_config.initiators = args.initiators;
    cluster_config.use_safety_dance = args.safety_dance;
    cluster_config.heartbeat_interval = args.heartbeat_interval.into();
    cluster_config.poll_interval = args.poll_interval.into();
    if args.report_unknown_outcome {
        cluster_config.exhausted_policy = ExhaustedTxnPolicy::ReportUnknownOutcome;
    }
    let cluster = Arc::new(LocalCluster::start(cluster_config)?);

    let victim = if args.fail_site {
        let victim = args
            .victim
            .or_else(|| cluster.default_victim())
            .context("no site to fail")?;
        anyhow::ensure!(cluster.sites().contains(&victim), "unknown site {victim}");
        Some(victim)
    } else {
        None
    };
    let failure = victim.map(|victim| {
        let cluster = cluster.clone();
        let fail_after: Duration = args.fail_after.into();
        tokio::spawn(async move {
            time::sleep(fail_after).await;
            cluster.fail_site(victim).await
        })
    });

    let mut workload = WorkloadConfig::new(seed, args.duration.into());
    workload.clients = args.clients;
    workload.keys = args.keys;
    workload.mp_pct = args.mp_pct;
    workload.write_pct = args.write_pct;
    workload.abort_pct = args.abort_pct;
    workload.op_timeout = args.op_timeout.into();
    workload.fail_fast = args.fail_fast;
    let duration = workload.duration;

    let ops = run_workload(cluster.clone(), workload).await;
    if let Some(failure) = failure {
        failure.await.context("failure task panicked")??;
    }
    for initiator_id in cluster.stopped_initiators()? {
        tracing::error!(initiator_id, "initiator stopped during the run");
    }
    let settle_timeout: Duration = args.settle_timeout.into();
    if !cluster.settle(settle_timeout).await? {
        tracing::warn!("replicas did not catch up before the settle timeout");
    }
    let replicas = cluster.verify_replicas()?;
    let outcome = cluster.shutdown(settle_timeout).await?;
    let ops = ops?;

    let meta = HistoryMeta {
        partitions: args.partitions,
        k_factor: args.k_factor,
        initiators: args.initiators,
        safety_dance: args.safety_dance,
        clients: args.clients,
        keys: args.keys,
        mp_pct: args.mp_pct,
        write_pct: args.write_pct,
        abort_pct: args.abort_pct,
        duration_ms: duration.as_millis() as u64,
        seed,
        failed_site: victim,
    };
    let consistent = replicas.iter().all(|report| report.is_consistent());
    let clean = outcome.is_clean();
    let history = History {
        meta,
        ops,
        replicas,
        outcome,
    };
    write_history(&args.out, &history).context("write history")?;
    eprintln!(
        "wrote history: {} ({} ops, seed {seed})",
        args.out.display(),
        history.ops.len()
    );

    anyhow::ensure!(consistent, "replicas diverged; see {}", args.out.display());
    anyhow::ensure!(clean, "a site or initiator halted; see {}", args.out.display());
    Ok(())
}

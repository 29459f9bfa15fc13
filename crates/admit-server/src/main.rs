//! Admit Server Binary

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod simulation;

use config::ServerConfig;
use simulation::Simulation;

/// Query queue server CLI
#[derive(Parser, Debug)]
#[command(name = "admit")]
#[command(version = "0.1.0")]
#[command(about = "Query admission control with an in-process workload driver")]
struct Args {
    /// Config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name of this frontend
    #[arg(long)]
    frontend: Option<String>,

    /// Queries to submit
    #[arg(long)]
    queries: Option<usize>,

    /// Milliseconds an admitted query holds its slot
    #[arg(long)]
    hold_ms: Option<u64>,

    /// Global concurrency limit, 0 disables it
    #[arg(long)]
    concurrency_limit: Option<i32>,

    /// Queue capacity, 0 means unlimited
    #[arg(long)]
    max_queued: Option<i32>,

    /// Pending timeout in seconds
    #[arg(long)]
    pending_timeout: Option<i32>,

    /// Write the effective config to this path and exit
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(frontend) = &self.frontend {
            config.frontend = frontend.clone();
        }
        if let Some(queries) = self.queries {
            config.workload.queries = queries;
        }
        if let Some(hold_ms) = self.hold_ms {
            config.workload.hold_ms = hold_ms;
        }
        if let Some(limit) = self.concurrency_limit {
            config.queue.query_queue_concurrency_limit = limit;
        }
        if let Some(max_queued) = self.max_queued {
            config.queue.query_queue_max_queued_queries = max_queued;
        }
        if let Some(timeout) = self.pending_timeout {
            config.queue.query_queue_pending_timeout_second = timeout;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from_file(path)?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);
    config.queue.validate()?;

    if let Some(path) = &args.dump_config {
        config.save_to_file(path)?;
        tracing::info!("Wrote config to {:?}", path);
        return Ok(());
    }

    tracing::info!(
        "Starting frontend {} with {} queries, concurrency limit {}",
        config.frontend,
        config.workload.queries,
        config.queue.query_queue_concurrency_limit
    );

    let simulation = Simulation::new(config);
    let summary = tokio::select! {
        summary = simulation.run() => summary,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            simulation.leader().stop().await;
            return Ok(());
        }
    };

    println!(
        "admitted: {}, rejected: {}, max running: {}",
        summary.admitted, summary.rejected, summary.max_running
    );
    Ok(())
}

//! Demo runner: bootstraps an in-process cluster and routes ad-hoc SQL.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tessera_conductor::{ConductorConfig, LocalCluster};

#[derive(Debug, Parser)]
#[command(name = "tessera", about = "Distributed SQL router over SQLite shards")]
struct Args {
    /// Number of storage nodes to bootstrap.
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Logical shards per table created through DDL.
    #[arg(long, default_value_t = 1)]
    shards: u32,

    /// Keep catalog and shard databases under this directory instead of
    /// in memory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Statements to execute in order; reads them from stdin when empty.
    statements: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ConductorConfig {
        default_num_shards: args.shards.max(1),
        ..ConductorConfig::default()
    };
    let cluster = match &args.data_dir {
        Some(dir) => LocalCluster::bootstrap_at(dir, args.nodes, config)?,
        None => LocalCluster::bootstrap(args.nodes, config)?,
    };

    let statements = if args.statements.is_empty() {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("read statements from stdin")?;
        buffer
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        args.statements
    };

    for sql in &statements {
        let outcome = cluster
            .conductor
            .execute(sql, Vec::new())
            .await
            .with_context(|| format!("execute: {sql}"))?;
        for row in &outcome.rows {
            println!(
                "{}",
                serde_json::to_string(row).context("render result row")?
            );
        }
        if outcome.rows_affected > 0 {
            info!(rows_affected = outcome.rows_affected, "write applied");
        }
        // Index builds and write deltas settle before the next statement,
        // so a CREATE INDEX is queryable immediately after.
        let report = cluster.drain_maintenance().await;
        if report.delivered > 0 {
            info!(
                delivered = report.delivered,
                dead_lettered = report.dead_lettered,
                "maintenance drained"
            );
        }
    }
    Ok(())
}

//! Tessera query router: one logical SQL database over many SQLite shards.
//!
//! A single conductor process hosts:
//! - the SQL front-end (tokenizer, parser, AST rendering),
//! - the shard planner and parallel fan-out executor,
//! - the result merger and the process-local caches,
//! - the producer side of asynchronous virtual-index maintenance.
//!
//! This crate root wires those pieces into [`LocalCluster`], an in-process
//! cluster used by the demo binary and the integration tests: one catalog,
//! N SQLite-backed nodes, and an in-memory maintenance queue with its
//! consumer. Production embeddings construct [`Conductor`] directly over
//! their own `ShardClient` and `MaintenanceQueue` bindings.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use tessera_shard::{ShardClient, SqliteShardNode};
use tessera_topology::Topology;

pub mod cache;
pub mod conductor;
pub mod error;
pub mod executor;
pub mod hash;
pub mod maintenance;
pub mod merge;
pub mod planner;
pub mod queue;
pub mod sql;

pub use conductor::{Conductor, ConductorConfig, QueryOutcome};
pub use error::{ConductorError, Result};

use maintenance::MaintenanceConsumer;
use queue::{DrainReport, InMemoryMaintenanceQueue};

/// One whole cluster in one process: catalog, storage nodes, router,
/// maintenance queue and its consumer.
pub struct LocalCluster {
    pub conductor: Conductor,
    pub topology: Arc<Topology>,
    pub queue: Arc<InMemoryMaintenanceQueue>,
    consumer: MaintenanceConsumer,
}

impl LocalCluster {
    /// Bootstraps an in-memory cluster with `num_nodes` storage nodes.
    pub fn bootstrap(num_nodes: usize, config: ConductorConfig) -> anyhow::Result<Self> {
        let topology = Arc::new(Topology::open_in_memory().context("open catalog")?);
        Self::assemble(topology, num_nodes, config, None)
    }

    /// Bootstraps a file-backed cluster under `data_dir`.
    pub fn bootstrap_at(
        data_dir: &Path,
        num_nodes: usize,
        config: ConductorConfig,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;
        let topology =
            Arc::new(Topology::open(&data_dir.join("catalog.db")).context("open catalog")?);
        Self::assemble(topology, num_nodes, config, Some(data_dir))
    }

    fn assemble(
        topology: Arc<Topology>,
        num_nodes: usize,
        config: ConductorConfig,
        data_dir: Option<&Path>,
    ) -> anyhow::Result<Self> {
        if !topology.is_created().context("read catalog state")? {
            topology.create(num_nodes).context("bootstrap catalog")?;
        }

        let mut clients: BTreeMap<String, Arc<dyn ShardClient>> = BTreeMap::new();
        for node in topology.get_topology().context("read catalog")?.nodes {
            let client: Arc<dyn ShardClient> = match data_dir {
                Some(dir) => Arc::new(
                    SqliteShardNode::open(&node.node_id, &dir.join(format!("{}.db", node.node_id)))
                        .with_context(|| format!("open storage node {}", node.node_id))?,
                ),
                None => Arc::new(
                    SqliteShardNode::open_in_memory(&node.node_id)
                        .with_context(|| format!("open storage node {}", node.node_id))?,
                ),
            };
            clients.insert(node.node_id, client);
        }

        let queue = Arc::new(InMemoryMaintenanceQueue::new());
        let consumer = MaintenanceConsumer::new(
            topology.clone(),
            clients.clone(),
            config.executor.clone(),
            config.database_id.clone(),
        );
        let conductor = Conductor::new(topology.clone(), clients, queue.clone(), config);
        info!(num_nodes, "local cluster ready");
        Ok(Self {
            conductor,
            topology,
            queue,
            consumer,
        })
    }

    /// Delivers every queued maintenance message to the consumer. Returns
    /// once the queue is empty.
    pub async fn drain_maintenance(&self) -> DrainReport {
        self.queue.drain(&self.consumer).await
    }
}

//! Asynchronous virtual-index maintenance.
//!
//! Writes capture their indexed-column values in the same shard fan-out
//! that executes them; the deltas computed here become
//! `maintain_index_events` messages. The consumer side backfills new
//! indexes (`build_index`) and applies event deltas to the catalog. Index
//! maintenance never blocks or fails a client write: it is eventually
//! consistent behind the queue.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use tessera_shard::{Row, ShardClient, ShardStatement, SqlValue, StatementKind};
use tessera_topology::{
    IndexDeltaOp, IndexEntryUpsert, IndexStatus, JobStatus, Topology, TopologyError,
    VirtualIndexRecord,
};

use crate::executor::{execute_calls, ErrorTolerance, ExecutorConfig, ShardCall};
use crate::planner::{canonical_index_key, ShardLocation};
use crate::queue::{IndexMaintenanceEvent, MaintenanceBatchHandler, MaintenanceMessage};
use crate::sql::ast::{SelectItem, Statement};

/// Job type written to the async-job log for index backfills.
pub const BUILD_INDEX_JOB: &str = "build_index";

// ---- delta computation (producer side) ---------------------------------

/// Extracts one captured row's index key; `None` when any indexed column
/// is NULL (NULL tuples are never indexed).
fn captured_row_key(index: &VirtualIndexRecord, row: &Row) -> Option<String> {
    let values: Vec<SqlValue> = index
        .columns
        .iter()
        .map(|column| row.get(column).cloned().unwrap_or(SqlValue::Null))
        .collect();
    canonical_index_key(&values)
}

fn keys_of(index: &VirtualIndexRecord, rows: &[Row]) -> BTreeSet<String> {
    rows.iter()
        .filter_map(|row| captured_row_key(index, row))
        .collect()
}

/// `add` events for freshly inserted rows: one per distinct (key, shard).
pub fn insert_events(
    index: &VirtualIndexRecord,
    rows: &[(u32, Vec<SqlValue>)],
) -> Vec<IndexMaintenanceEvent> {
    let mut seen = BTreeSet::new();
    let mut events = Vec::new();
    for (shard_id, values) in rows {
        let Some(key) = canonical_index_key(values) else {
            continue;
        };
        if seen.insert((key.clone(), *shard_id)) {
            events.push(IndexMaintenanceEvent {
                index_name: index.index_name.clone(),
                key_value: key,
                shard_id: *shard_id,
                operation: IndexDeltaOp::Add,
            });
        }
    }
    events
}

/// `remove` events for deleted rows, keyed per shard from the capture
/// SELECT that ran atomically with the DELETE.
pub fn delete_events(
    index: &VirtualIndexRecord,
    captured: &[(u32, Vec<Row>)],
) -> Vec<IndexMaintenanceEvent> {
    let mut events = Vec::new();
    for (shard_id, rows) in captured {
        for key in keys_of(index, rows) {
            events.push(IndexMaintenanceEvent {
                index_name: index.index_name.clone(),
                key_value: key,
                shard_id: *shard_id,
                operation: IndexDeltaOp::Remove,
            });
        }
    }
    events
}

/// Events for an UPDATE from before/after captures.
///
/// Per shard, `removed = old \ new` and `added = new \ old`; then a global
/// pass across every captured shard drops a `remove` while any shard still
/// holds the value (rows sharing a key must not evict each other's entry)
/// and drops an `add` when the value existed somewhere before (the entry
/// is already present).
pub fn update_events(
    index: &VirtualIndexRecord,
    captured: &[(u32, Vec<Row>, Vec<Row>)],
) -> Vec<IndexMaintenanceEvent> {
    let mut union_before = BTreeSet::new();
    let mut union_after = BTreeSet::new();
    let mut per_shard: Vec<(u32, BTreeSet<String>, BTreeSet<String>)> = Vec::new();
    for (shard_id, before_rows, after_rows) in captured {
        let before = keys_of(index, before_rows);
        let after = keys_of(index, after_rows);
        union_before.extend(before.iter().cloned());
        union_after.extend(after.iter().cloned());
        per_shard.push((*shard_id, before, after));
    }

    let mut events = Vec::new();
    for (shard_id, before, after) in &per_shard {
        for key in before.difference(after) {
            if union_after.contains(key) {
                continue;
            }
            events.push(IndexMaintenanceEvent {
                index_name: index.index_name.clone(),
                key_value: key.clone(),
                shard_id: *shard_id,
                operation: IndexDeltaOp::Remove,
            });
        }
        for key in after.difference(before) {
            if union_before.contains(key) {
                continue;
            }
            events.push(IndexMaintenanceEvent {
                index_name: index.index_name.clone(),
                key_value: key.clone(),
                shard_id: *shard_id,
                operation: IndexDeltaOp::Add,
            });
        }
    }
    events
}

// ---- consumer ----------------------------------------------------------

/// Queue consumer: backfills new indexes and applies event deltas. Runs
/// beside the router and mutates only the catalog; it never blocks
/// queries. The transport may be shared, so messages stamped with another
/// database id are acknowledged and skipped.
pub struct MaintenanceConsumer {
    topology: Arc<Topology>,
    clients: BTreeMap<String, Arc<dyn ShardClient>>,
    executor: ExecutorConfig,
    database_id: String,
}

impl MaintenanceConsumer {
    pub fn new(
        topology: Arc<Topology>,
        clients: BTreeMap<String, Arc<dyn ShardClient>>,
        executor: ExecutorConfig,
        database_id: impl Into<String>,
    ) -> Self {
        Self {
            topology,
            clients,
            executor,
            database_id: database_id.into(),
        }
    }

    async fn process_message(&self, message: MaintenanceMessage) -> anyhow::Result<()> {
        match message {
            MaintenanceMessage::BuildIndex {
                database_id,
                index_name,
                table_name,
                column_name,
                ..
            } => {
                if !self.is_local(&database_id, &index_name) {
                    return Ok(());
                }
                self.build_index(&index_name, &table_name, &column_name)
                    .await
            }
            MaintenanceMessage::MaintainIndexEvents {
                database_id,
                table_name,
                events,
                ..
            } => {
                if !self.is_local(&database_id, &table_name) {
                    return Ok(());
                }
                self.apply_events(events).await
            }
        }
    }

    fn is_local(&self, database_id: &str, subject: &str) -> bool {
        if database_id == self.database_id {
            return true;
        }
        warn!(
            message_database = database_id,
            consumer_database = %self.database_id,
            subject,
            "skipping maintenance message for another database"
        );
        false
    }

    /// Backfills one index from every logical shard, then flips it ready.
    /// Any backfill failure is terminal for the index (status `failed`
    /// with the message) and is not redelivered. `column_name` is the
    /// column list the build was requested with; it must still match the
    /// cataloged definition when the message is finally delivered.
    async fn build_index(
        &self,
        index_name: &str,
        table_name: &str,
        column_name: &str,
    ) -> anyhow::Result<()> {
        let job_id = self.claim_job(table_name);
        match self.backfill(index_name, table_name, column_name).await {
            Ok(entries) => {
                self.topology
                    .batch_upsert_index_entries(index_name, &entries)
                    .context("persist index entries")?;
                self.topology
                    .update_index_status(index_name, IndexStatus::Ready, None)
                    .context("mark index ready")?;
                if let Some(job_id) = job_id {
                    let _ = self
                        .topology
                        .update_job_status(job_id, JobStatus::Completed, None);
                }
                info!(
                    index = index_name,
                    table = table_name,
                    entries = entries.len(),
                    "index backfill completed"
                );
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                warn!(
                    index = index_name,
                    table = table_name,
                    error = %message,
                    "index backfill failed"
                );
                if let Err(status_err) = self.topology.update_index_status(
                    index_name,
                    IndexStatus::Failed,
                    Some(&message),
                ) {
                    warn!(index = index_name, error = %status_err, "could not mark index failed");
                }
                if let Some(job_id) = job_id {
                    let _ =
                        self.topology
                            .update_job_status(job_id, JobStatus::Failed, Some(&message));
                }
                Ok(())
            }
        }
    }

    async fn backfill(
        &self,
        index_name: &str,
        table_name: &str,
        column_name: &str,
    ) -> anyhow::Result<Vec<IndexEntryUpsert>> {
        let index = self
            .topology
            .virtual_index(index_name)?
            .ok_or_else(|| anyhow!("index '{index_name}' is not in the catalog"))?;
        let requested: Vec<String> = column_name
            .split(',')
            .map(|column| column.trim().to_string())
            .filter(|column| !column.is_empty())
            .collect();
        if requested != index.columns {
            return Err(anyhow!(
                "build request columns [{}] do not match cataloged index '{index_name}' columns [{}]",
                requested.join(", "),
                index.columns.join(", ")
            ));
        }
        let snapshot = self.topology.snapshot()?;
        if snapshot.table(table_name).is_none() {
            return Err(anyhow!("table '{table_name}' is not in the catalog"));
        }

        let mut select = crate::sql::ast::SelectStatement::simple(
            table_name,
            requested.iter().map(|c| SelectItem::column(c)).collect(),
        );
        select.distinct = true;
        let sql = Statement::Select(select).to_string();

        let calls: Vec<ShardCall> = snapshot
            .shards_of(table_name)
            .into_iter()
            .map(|shard| ShardCall {
                location: ShardLocation {
                    shard_id: shard.shard_id,
                    node_id: shard.node_id.clone(),
                },
                statements: vec![ShardStatement::new(
                    sql.clone(),
                    Vec::new(),
                    StatementKind::Read,
                )],
            })
            .collect();

        let outcomes = execute_calls(
            calls,
            &self.clients,
            &self.executor,
            true,
            ErrorTolerance::None,
        )
        .await?;

        let mut grouped: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
        for outcome in &outcomes {
            for result in &outcome.results {
                for row in &result.rows {
                    if let Some(key) = captured_row_key(&index, row) {
                        grouped
                            .entry(key)
                            .or_default()
                            .insert(outcome.location.shard_id);
                    }
                }
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(key_value, shard_ids)| IndexEntryUpsert {
                key_value,
                shard_ids: shard_ids.into_iter().collect(),
            })
            .collect())
    }

    /// Applies event deltas in order. Events for indexes that were dropped
    /// in the meantime are skipped, not failed.
    async fn apply_events(&self, events: Vec<IndexMaintenanceEvent>) -> anyhow::Result<()> {
        for event in events {
            match self.topology.apply_index_delta(
                &event.index_name,
                event.shard_id,
                &event.key_value,
                event.operation,
            ) {
                Ok(()) => {}
                Err(TopologyError::UnknownIndex(name)) => {
                    debug!(index = %name, "skipping event for dropped index");
                }
                Err(err) => {
                    return Err(err).context("apply index delta");
                }
            }
        }
        Ok(())
    }

    /// Claims the oldest pending backfill job for the table, if any.
    fn claim_job(&self, table_name: &str) -> Option<i64> {
        let jobs = self.topology.list_jobs().ok()?;
        let job = jobs.into_iter().find(|job| {
            job.job_type == BUILD_INDEX_JOB
                && job.table_name == table_name
                && job.status == JobStatus::Pending
        })?;
        match self
            .topology
            .update_job_status(job.job_id, JobStatus::Running, None)
        {
            Ok(()) => Some(job.job_id),
            Err(err) => {
                warn!(job_id = job.job_id, error = %err, "could not claim build job");
                None
            }
        }
    }
}

#[async_trait]
impl MaintenanceBatchHandler for MaintenanceConsumer {
    /// Settles a delivery batch concurrently and re-propagates the first
    /// failure so the transport redelivers the batch.
    async fn process_batch(&self, messages: Vec<MaintenanceMessage>) -> anyhow::Result<()> {
        let settled = join_all(
            messages
                .into_iter()
                .map(|message| self.process_message(message)),
        )
        .await;
        for result in settled {
            result?;
        }
        Ok(())
    }
}

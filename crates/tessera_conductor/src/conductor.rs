//! The query router.
//!
//! One `Conductor` owns the process-local caches and the client handles
//! for every storage node, and drives each statement through
//! parse → plan → fan-out → merge, plus the post-execution side effects:
//! cache invalidation and asynchronous index maintenance. DDL statements
//! additionally orchestrate the catalog (register tables, start index
//! builds) before or after their shard fan-out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use tessera_shard::{Row, ShardClient, ShardStatement, SqlValue, StatementKind};
use tessera_topology::{
    IndexKind, IndexStatus, TableSpec, TableUpdate, Topology, TopologyDelta, TopologyError,
    VirtualIndexRecord,
};

use crate::cache::{ResultCache, StatementCache, TopologyCache};
use crate::error::{ConductorError, Result};
use crate::executor::{
    execute_calls, ErrorTolerance, ExecutorConfig, ShardCall, ShardOutcome, ShardQueryStats,
};
use crate::maintenance::{delete_events, insert_events, update_events, BUILD_INDEX_JOB};
use crate::merge::{merge_results, MergedResult};
use crate::planner::{expr_value, plan_statement, QueryPlan, ShardDispatch};
use crate::queue::{IndexMaintenanceEvent, MaintenanceMessage, MaintenanceQueue};
use crate::sql::ast::{
    referenced_columns, AlterAction, CreateIndexStatement, CreateTableStatement, ColumnConstraint,
    DropIndexStatement, DropTableStatement, SelectItem, SelectStatement, Statement,
    TableConstraint,
};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Logical database id stamped into maintenance messages.
    pub database_id: String,
    /// `num_shards` for tables created through SQL DDL.
    pub default_num_shards: u32,
    /// `block_size` hint for tables created through SQL DDL.
    pub default_block_size: u64,
    pub executor: ExecutorConfig,
    /// Enables the read-result cache.
    pub result_cache: bool,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            database_id: "db-0".to_string(),
            default_num_shards: 1,
            default_block_size: 10_000,
            executor: ExecutorConfig::default(),
            result_cache: true,
        }
    }
}

/// Result of one routed statement.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    pub shard_stats: Option<Vec<ShardQueryStats>>,
}

pub struct Conductor {
    topology: Arc<Topology>,
    clients: BTreeMap<String, Arc<dyn ShardClient>>,
    queue: Arc<dyn MaintenanceQueue>,
    config: ConductorConfig,
    topology_cache: TopologyCache,
    statement_cache: StatementCache,
    result_cache: ResultCache,
}

impl Conductor {
    pub fn new(
        topology: Arc<Topology>,
        clients: BTreeMap<String, Arc<dyn ShardClient>>,
        queue: Arc<dyn MaintenanceQueue>,
        config: ConductorConfig,
    ) -> Self {
        Self {
            topology_cache: TopologyCache::new(topology.clone()),
            statement_cache: StatementCache::new(),
            result_cache: ResultCache::new(),
            topology,
            clients,
            queue,
            config,
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Executes one SQL statement with out-of-band parameters.
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<QueryOutcome> {
        self.execute_with_correlation(sql, params, None).await
    }

    /// As [`Self::execute`], threading a correlation id into any
    /// maintenance messages the statement produces.
    pub async fn execute_with_correlation(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
        correlation_id: Option<String>,
    ) -> Result<QueryOutcome> {
        let statement = self.statement_cache.get_or_parse(sql).await?;
        debug!(kind = statement.kind_name(), "routing statement");
        match statement.as_ref() {
            Statement::CreateTable(create) => self.create_table(create).await,
            Statement::DropTable(drop) => self.drop_table(drop).await,
            Statement::AlterTable(_) => self.alter_table(&statement).await,
            Statement::CreateIndex(create) => self.create_index(create).await,
            Statement::DropIndex(drop) => self.drop_index(drop).await,
            Statement::Pragma(_) => self.run_pragma(&statement).await,
            Statement::Select(_) => self.run_select(sql, &statement, &params).await,
            Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_) => {
                self.run_write(&statement, &params, correlation_id).await
            }
        }
    }

    // ---- reads ---------------------------------------------------------

    async fn run_select(
        &self,
        sql: &str,
        statement: &Statement,
        params: &[SqlValue],
    ) -> Result<QueryOutcome> {
        let snapshot = self.topology_cache.snapshot().await?;
        let plan = plan_statement(statement, params, &snapshot, &self.topology)?;

        let cache_key = ResultCache::key(sql, params);
        if self.config.result_cache && plan.table.is_some() {
            if let Some(cached) = self.result_cache.get(&cache_key).await {
                debug!("serving read from result cache");
                return Ok(QueryOutcome {
                    rows: cached.rows,
                    rows_affected: 0,
                    shard_stats: None,
                });
            }
        }

        let shard_ids: BTreeSet<u32> = plan
            .dispatches
            .iter()
            .map(|d| d.location.shard_id)
            .collect();
        let (merged, stats) = self.fan_out(&plan, true, ErrorTolerance::None).await?;

        // Zero-dispatch results are not cached: nothing would ever
        // invalidate an entry with no shard footprint.
        if self.config.result_cache && !shard_ids.is_empty() {
            if let Some(table) = &plan.table {
                self.result_cache
                    .put(
                        cache_key,
                        table.clone(),
                        shard_ids,
                        referenced_columns(statement),
                        merged.clone(),
                    )
                    .await;
            }
        }

        Ok(QueryOutcome {
            rows: merged.rows,
            rows_affected: 0,
            shard_stats: Some(stats),
        })
    }

    async fn run_pragma(&self, statement: &Statement) -> Result<QueryOutcome> {
        let snapshot = self.topology_cache.snapshot().await?;
        let plan = plan_statement(statement, &[], &snapshot, &self.topology)?;
        let (merged, stats) = self.fan_out(&plan, true, ErrorTolerance::None).await?;
        Ok(QueryOutcome {
            rows: merged.rows,
            rows_affected: 0,
            shard_stats: Some(stats),
        })
    }

    // ---- writes --------------------------------------------------------

    async fn run_write(
        &self,
        statement: &Statement,
        params: &[SqlValue],
        correlation_id: Option<String>,
    ) -> Result<QueryOutcome> {
        let snapshot = self.topology_cache.snapshot().await?;
        let plan = plan_statement(statement, params, &snapshot, &self.topology)?;
        let table = plan.table.clone().ok_or_else(|| {
            ConductorError::Plan("write statement without a target table".to_string())
        })?;

        // Writes also maintain building/rebuilding indexes, otherwise an
        // in-flight backfill would race the write and miss its rows.
        let indexes: Vec<VirtualIndexRecord> = snapshot
            .indexes_of(&table)
            .into_iter()
            .filter(|index| index.status != IndexStatus::Failed)
            .cloned()
            .collect();
        let capture_columns: BTreeSet<String> = indexes
            .iter()
            .flat_map(|index| index.columns.iter().cloned())
            .collect();

        let (calls, capture_shape) =
            build_write_calls(&plan.dispatches, statement, &capture_columns)?;
        let outcomes = execute_calls(
            calls,
            &self.clients,
            &self.config.executor,
            false,
            ErrorTolerance::None,
        )
        .await?;

        let main_results: Vec<_> = outcomes
            .iter()
            .map(|outcome| {
                outcome
                    .results
                    .get(capture_shape.main_index)
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        let merged = merge_results(&plan.merge, &main_results);
        let stats: Vec<ShardQueryStats> = outcomes.iter().map(|o| o.stats.clone()).collect();

        self.write_side_effects(
            statement,
            &plan,
            &table,
            &indexes,
            capture_shape,
            &outcomes,
            correlation_id,
        )
        .await;

        Ok(QueryOutcome {
            rows: merged.rows,
            rows_affected: merged.rows_affected,
            shard_stats: Some(stats),
        })
    }

    /// Cache invalidation and index-maintenance emission. Never fails the
    /// write: every failure path is logged and dropped.
    #[allow(clippy::too_many_arguments)]
    async fn write_side_effects(
        &self,
        statement: &Statement,
        plan: &QueryPlan,
        table: &str,
        indexes: &[VirtualIndexRecord],
        capture_shape: CaptureShape,
        outcomes: &[ShardOutcome],
        correlation_id: Option<String>,
    ) {
        // Plan-cache and result-cache invalidation for the written table.
        self.statement_cache.invalidate_table(table).await;
        let written_shards: BTreeSet<u32> =
            outcomes.iter().map(|o| o.location.shard_id).collect();
        match statement {
            Statement::Update(update) => {
                let mut columns: BTreeSet<String> = indexes
                    .iter()
                    .flat_map(|index| index.columns.iter().cloned())
                    .collect();
                columns.extend(update.assignments.iter().map(|(c, _)| c.clone()));
                self.result_cache
                    .invalidate_write(table, &written_shards, &columns)
                    .await;
            }
            // Inserts and deletes change row membership, and an
            // index-narrowed read may have skipped the written shards
            // entirely; every cached read of the table is stale.
            _ => {
                self.result_cache.invalidate_table(table).await;
            }
        }

        // Capacity accounting follows row membership.
        for outcome in outcomes {
            let main = outcome.results.get(capture_shape.main_index);
            let affected = main.map(|r| r.rows_affected as i64).unwrap_or(0);
            let delta = match statement {
                Statement::Insert(_) => affected,
                Statement::Delete(_) => -affected,
                _ => 0,
            };
            if delta != 0 {
                if let Err(err) = self.topology.record_capacity(&outcome.location.node_id, delta) {
                    debug!(node = %outcome.location.node_id, error = %err, "capacity accounting skipped");
                }
            }
        }

        if indexes.is_empty() {
            return;
        }
        let events = match compute_index_events(statement, plan, indexes, capture_shape, outcomes)
        {
            Ok(events) => events,
            Err(err) => {
                warn!(table, error = %err, "failed to compute index maintenance events");
                return;
            }
        };
        if events.is_empty() {
            return;
        }

        let message = MaintenanceMessage::MaintainIndexEvents {
            database_id: self.config.database_id.clone(),
            table_name: table.to_string(),
            events,
            created_at: now_unix_ms(),
            correlation_id,
        };
        // Fire and forget: indexes are eventually consistent and a queue
        // outage must not fail the client's write.
        if let Err(err) = self.queue.enqueue(message).await {
            warn!(table, error = %err, "failed to enqueue index maintenance events");
        }
    }

    // ---- DDL -----------------------------------------------------------

    async fn create_table(&self, create: &CreateTableStatement) -> Result<QueryOutcome> {
        let spec = table_spec_from_ddl(create, &self.config)?;
        match self.topology.update_topology(TopologyDelta {
            add: vec![spec],
            ..Default::default()
        }) {
            Ok(()) => {}
            Err(TopologyError::AlreadyExists { .. }) if create.if_not_exists => {}
            Err(TopologyError::AlreadyExists { name, .. }) => {
                return Err(ConductorError::Schema(format!(
                    "table '{name}' already exists"
                )));
            }
            Err(err) => return Err(err.into()),
        }
        self.topology_cache.invalidate().await;

        let snapshot = self.topology_cache.snapshot().await?;
        let plan = plan_statement(
            &Statement::CreateTable(create.clone()),
            &[],
            &snapshot,
            &self.topology,
        )?;
        let tolerance = if create.if_not_exists {
            ErrorTolerance::IdempotentDdl
        } else {
            ErrorTolerance::None
        };
        let (_, stats) = self.fan_out(&plan, false, tolerance).await?;
        Ok(QueryOutcome {
            rows: Vec::new(),
            rows_affected: 0,
            shard_stats: Some(stats),
        })
    }

    async fn drop_table(&self, drop: &DropTableStatement) -> Result<QueryOutcome> {
        let snapshot = self.topology_cache.snapshot().await?;
        let plan = plan_statement(
            &Statement::DropTable(drop.clone()),
            &[],
            &snapshot,
            &self.topology,
        )?;
        let tolerance = if drop.if_exists {
            ErrorTolerance::IdempotentDdl
        } else {
            ErrorTolerance::None
        };
        let (_, stats) = self.fan_out(&plan, false, tolerance).await?;

        if snapshot.table(&drop.name).is_some() {
            self.topology.update_topology(TopologyDelta {
                remove: vec![drop.name.clone()],
                ..Default::default()
            })?;
        }
        self.invalidate_table_caches(&drop.name).await;
        Ok(QueryOutcome {
            rows: Vec::new(),
            rows_affected: 0,
            shard_stats: Some(stats),
        })
    }

    async fn alter_table(&self, statement: &Statement) -> Result<QueryOutcome> {
        let Statement::AlterTable(alter) = statement else {
            return Err(ConductorError::Plan("expected ALTER TABLE".to_string()));
        };
        let snapshot = self.topology_cache.snapshot().await?;
        let table = snapshot.table(&alter.table).ok_or_else(|| {
            ConductorError::Schema(format!("table '{}' does not exist", alter.table))
        })?;
        let indexed: BTreeSet<&String> = snapshot
            .indexes_of(&alter.table)
            .into_iter()
            .flat_map(|index| index.columns.iter())
            .collect();

        // Structural guards: the routing key and indexed columns cannot be
        // renamed or dropped out from under the catalog.
        match &alter.action {
            AlterAction::RenameColumn { old, .. } | AlterAction::DropColumn(old) => {
                if *old == table.shard_key {
                    return Err(ConductorError::Plan(format!(
                        "column '{old}' is the shard key of '{}'",
                        alter.table
                    )));
                }
                if indexed.contains(old) {
                    return Err(ConductorError::Plan(format!(
                        "column '{old}' is covered by a virtual index; drop the index first"
                    )));
                }
            }
            AlterAction::AddColumn(_) | AlterAction::RenameTo(_) => {}
        }

        let plan = plan_statement(statement, &[], &snapshot, &self.topology)?;
        let (_, stats) = self.fan_out(&plan, false, ErrorTolerance::None).await?;

        if let AlterAction::RenameTo(new_name) = &alter.action {
            self.topology.update_topology(TopologyDelta {
                update: vec![TableUpdate {
                    table_name: alter.table.clone(),
                    renamed_to: Some(new_name.clone()),
                    ..Default::default()
                }],
                ..Default::default()
            })?;
        }
        self.invalidate_table_caches(&alter.table).await;
        Ok(QueryOutcome {
            rows: Vec::new(),
            rows_affected: 0,
            shard_stats: Some(stats),
        })
    }

    /// Registers the index as `building`, records the async job and
    /// enqueues the backfill. No shard receives any DDL: the index is
    /// catalog metadata only.
    async fn create_index(&self, create: &CreateIndexStatement) -> Result<QueryOutcome> {
        let snapshot = self.topology_cache.snapshot().await?;
        if snapshot.table(&create.table).is_none() {
            return Err(ConductorError::Schema(format!(
                "table '{}' does not exist",
                create.table
            )));
        }
        let kind = if create.unique {
            IndexKind::Unique
        } else {
            IndexKind::Hash
        };
        match self
            .topology
            .create_virtual_index(&create.name, &create.table, &create.columns, kind)
        {
            Ok(()) => {}
            Err(TopologyError::AlreadyExists { .. }) if create.if_not_exists => {
                return Ok(QueryOutcome::default());
            }
            Err(err) => return Err(err.into()),
        }
        self.invalidate_table_caches(&create.table).await;

        if let Err(err) = self.topology.create_job(BUILD_INDEX_JOB, &create.table) {
            warn!(index = %create.name, error = %err, "could not record build job");
        }
        let message = MaintenanceMessage::BuildIndex {
            database_id: self.config.database_id.clone(),
            table_name: create.table.clone(),
            column_name: create.columns.join(","),
            index_name: create.name.clone(),
            created_at: now_unix_ms(),
        };
        if let Err(err) = self.queue.enqueue(message).await {
            warn!(index = %create.name, error = %err, "failed to enqueue index build");
        }
        Ok(QueryOutcome::default())
    }

    async fn drop_index(&self, drop: &DropIndexStatement) -> Result<QueryOutcome> {
        let record = self.topology.virtual_index(&drop.name)?;
        let existed = self.topology.drop_virtual_index(&drop.name)?;
        if !existed && !drop.if_exists {
            return Err(ConductorError::Schema(format!(
                "index '{}' does not exist",
                drop.name
            )));
        }
        match record {
            Some(record) => self.invalidate_table_caches(&record.table_name).await,
            None => self.topology_cache.invalidate().await,
        }
        Ok(QueryOutcome::default())
    }

    // ---- shared --------------------------------------------------------

    async fn fan_out(
        &self,
        plan: &QueryPlan,
        read_path: bool,
        tolerance: ErrorTolerance,
    ) -> Result<(MergedResult, Vec<ShardQueryStats>)> {
        let calls: Vec<ShardCall> = plan
            .dispatches
            .iter()
            .map(|dispatch| ShardCall {
                location: dispatch.location.clone(),
                statements: vec![dispatch.statement.clone()],
            })
            .collect();
        let outcomes = execute_calls(
            calls,
            &self.clients,
            &self.config.executor,
            read_path,
            tolerance,
        )
        .await?;
        let per_shard: Vec<_> = outcomes
            .iter()
            .map(|o| o.results.first().cloned().unwrap_or_default())
            .collect();
        let merged = merge_results(&plan.merge, &per_shard);
        let stats = outcomes.into_iter().map(|o| o.stats).collect();
        Ok((merged, stats))
    }

    async fn invalidate_table_caches(&self, table: &str) {
        self.topology_cache.invalidate().await;
        self.statement_cache.invalidate_table(table).await;
        self.result_cache.invalidate_table(table).await;
    }
}

/// Which slot in each shard's statement batch holds which result.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CaptureShape {
    before_index: Option<usize>,
    main_index: usize,
    after_index: Option<usize>,
}

/// Builds per-shard statement batches, wrapping writes with indexed-column
/// capture SELECTs when the table carries indexes: DELETE runs
/// `[capture, delete]`, UPDATE runs `[capture, update, capture]`.
fn build_write_calls(
    dispatches: &[ShardDispatch],
    statement: &Statement,
    capture_columns: &BTreeSet<String>,
) -> Result<(Vec<ShardCall>, CaptureShape)> {
    let needs_capture = !capture_columns.is_empty()
        && matches!(statement, Statement::Update(_) | Statement::Delete(_));
    if !needs_capture {
        let calls = dispatches
            .iter()
            .map(|dispatch| ShardCall {
                location: dispatch.location.clone(),
                statements: vec![dispatch.statement.clone()],
            })
            .collect();
        return Ok((
            calls,
            CaptureShape {
                before_index: None,
                main_index: 0,
                after_index: None,
            },
        ));
    }

    let is_update = matches!(statement, Statement::Update(_));
    let mut calls = Vec::with_capacity(dispatches.len());
    for dispatch in dispatches {
        let capture = capture_statement(dispatch, capture_columns)?;
        let mut statements = vec![capture.clone(), dispatch.statement.clone()];
        if is_update {
            statements.push(capture);
        }
        calls.push(ShardCall {
            location: dispatch.location.clone(),
            statements,
        });
    }
    let shape = if is_update {
        CaptureShape {
            before_index: Some(0),
            main_index: 1,
            after_index: Some(2),
        }
    } else {
        CaptureShape {
            before_index: Some(0),
            main_index: 1,
            after_index: None,
        }
    };
    Ok((calls, shape))
}

/// `SELECT <indexed cols> FROM t WHERE <same predicate>` sharing the
/// dispatch's parameter pool, so capture sees exactly the rows the write
/// touches.
fn capture_statement(
    dispatch: &ShardDispatch,
    capture_columns: &BTreeSet<String>,
) -> Result<ShardStatement> {
    let (table, where_clause) = match &dispatch.source {
        Statement::Update(update) => (&update.table, update.where_clause.clone()),
        Statement::Delete(delete) => (&delete.table, delete.where_clause.clone()),
        other => {
            return Err(ConductorError::Plan(format!(
                "capture does not apply to {}",
                other.kind_name()
            )))
        }
    };
    let mut select = SelectStatement::simple(
        table,
        capture_columns.iter().map(|c| SelectItem::column(c)).collect(),
    );
    select.where_clause = where_clause;
    let capture = Statement::Select(select);
    let order = crate::sql::ast::placeholder_indices(&capture);
    let params: Vec<SqlValue> = order
        .iter()
        .map(|index| {
            dispatch.param_pool.get(*index).cloned().ok_or_else(|| {
                ConductorError::Plan(format!("capture placeholder {index} out of range"))
            })
        })
        .collect::<Result<_>>()?;
    Ok(ShardStatement::new(
        capture.to_string(),
        params,
        StatementKind::Read,
    ))
}

/// Computes the maintenance events a completed write produces across
/// every index of its table.
fn compute_index_events(
    statement: &Statement,
    plan: &QueryPlan,
    indexes: &[VirtualIndexRecord],
    capture_shape: CaptureShape,
    outcomes: &[ShardOutcome],
) -> Result<Vec<IndexMaintenanceEvent>> {
    let mut events = Vec::new();
    match statement {
        Statement::Insert(_) => {
            for index in indexes {
                let rows = inserted_index_rows(plan, index)?;
                events.extend(insert_events(index, &rows));
            }
        }
        Statement::Update(_) => {
            let captured: Vec<(u32, Vec<Row>, Vec<Row>)> = outcomes
                .iter()
                .map(|outcome| {
                    let before = capture_shape
                        .before_index
                        .and_then(|i| outcome.results.get(i))
                        .map(|r| r.rows.clone())
                        .unwrap_or_default();
                    let after = capture_shape
                        .after_index
                        .and_then(|i| outcome.results.get(i))
                        .map(|r| r.rows.clone())
                        .unwrap_or_default();
                    (outcome.location.shard_id, before, after)
                })
                .collect();
            for index in indexes {
                events.extend(update_events(index, &captured));
            }
        }
        Statement::Delete(_) => {
            let captured: Vec<(u32, Vec<Row>)> = outcomes
                .iter()
                .map(|outcome| {
                    let before = capture_shape
                        .before_index
                        .and_then(|i| outcome.results.get(i))
                        .map(|r| r.rows.clone())
                        .unwrap_or_default();
                    (outcome.location.shard_id, before)
                })
                .collect();
            for index in indexes {
                events.extend(delete_events(index, &captured));
            }
        }
        _ => {}
    }
    Ok(events)
}

/// Extracts each inserted row's indexed-column values straight from the
/// planned per-shard INSERT ASTs (literals or bound parameters).
fn inserted_index_rows(
    plan: &QueryPlan,
    index: &VirtualIndexRecord,
) -> Result<Vec<(u32, Vec<SqlValue>)>> {
    let mut out = Vec::new();
    for dispatch in &plan.dispatches {
        let Statement::Insert(insert) = &dispatch.source else {
            continue;
        };
        let positions: Vec<Option<usize>> = index
            .columns
            .iter()
            .map(|column| insert.columns.iter().position(|c| c == column))
            .collect();
        for row in &insert.rows {
            let mut values = Vec::with_capacity(positions.len());
            for position in &positions {
                let value = match position {
                    // A column the INSERT does not set is NULL for
                    // indexing purposes, which suppresses the row.
                    None => SqlValue::Null,
                    Some(position) => {
                        let expr = row.get(*position).ok_or_else(|| {
                            ConductorError::Plan("INSERT row shorter than column list".to_string())
                        })?;
                        expr_value(expr, &dispatch.param_pool)?.unwrap_or(SqlValue::Null)
                    }
                };
                values.push(value);
            }
            out.push((dispatch.location.shard_id, values));
        }
    }
    Ok(out)
}

/// Derives catalog metadata for a table created through SQL DDL.
fn table_spec_from_ddl(
    create: &CreateTableStatement,
    config: &ConductorConfig,
) -> Result<TableSpec> {
    let mut pk: Option<(String, String)> = None;
    for column in &create.columns {
        if column
            .constraints
            .iter()
            .any(|c| matches!(c, ColumnConstraint::PrimaryKey))
        {
            pk = Some((
                column.name.clone(),
                column.data_type.clone().unwrap_or_else(|| "INTEGER".to_string()),
            ));
            break;
        }
    }
    if pk.is_none() {
        for constraint in &create.constraints {
            if let TableConstraint::PrimaryKey(columns) = constraint {
                let name = columns.first().cloned().ok_or_else(|| {
                    ConductorError::Schema("empty PRIMARY KEY column list".to_string())
                })?;
                let data_type = create
                    .columns
                    .iter()
                    .find(|c| c.name == name)
                    .and_then(|c| c.data_type.clone())
                    .unwrap_or_else(|| "INTEGER".to_string());
                pk = Some((name, data_type));
                break;
            }
        }
    }
    let (pk_column, pk_type) = pk.unwrap_or_else(|| {
        // No declared key: fall back to the first column, mirroring how
        // the storage engine would expose an implicit rowid key.
        create
            .columns
            .first()
            .map(|c| {
                (
                    c.name.clone(),
                    c.data_type.clone().unwrap_or_else(|| "INTEGER".to_string()),
                )
            })
            .unwrap_or_else(|| ("rowid".to_string(), "INTEGER".to_string()))
    });

    Ok(TableSpec {
        table_name: create.name.clone(),
        pk_column,
        pk_type,
        shard_key: None,
        num_shards: config.default_num_shards,
        block_size: config.default_block_size,
    })
}

fn now_unix_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(u64::MAX as u128) as u64,
        Err(_) => 0,
    }
}

//! Shard planning: turns one parsed statement plus its parameters into the
//! minimal set of per-shard dispatches and a merge strategy.
//!
//! Target selection runs the routing rules in order: table-spanning DDL
//! fans out to nodes, INSERTs hash their shard-key values, equality on the
//! shard key routes to one shard, an equality covered by a `ready` virtual
//! index routes to the indexed shards, and everything else fans out to all
//! shards of the table. Rewrites append placeholders at fresh indices;
//! existing parameter positions are never renumbered.

use std::collections::BTreeMap;

use tessera_shard::{ShardStatement, SqlValue, StatementKind};
use tessera_topology::{IndexStatus, TableRecord, Topology, TopologySnapshot};

use crate::error::{ConductorError, Result};
use crate::hash::shard_for_key;
use crate::sql::ast::*;

/// Column injected into every physical table so the primary key is
/// composite and rows can coexist in two shards during a move.
pub const VIRTUAL_SHARD_COLUMN: &str = "_virtualShard";

/// One logical shard resolved to its hosting node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLocation {
    pub shard_id: u32,
    pub node_id: String,
}

/// One statement bound for one shard.
#[derive(Debug, Clone)]
pub struct ShardDispatch {
    pub location: ShardLocation,
    pub statement: ShardStatement,
    /// The (possibly rewritten) AST `statement` was rendered from; index
    /// maintenance derives its capture SELECTs from this.
    pub source: Statement,
    /// Parameter pool indexable by every placeholder index in `source`.
    pub param_pool: Vec<SqlValue>,
}

/// Aggregate functions the merger can recombine across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    /// Merged as the mean of per-shard means; approximate when shard row
    /// counts differ.
    Avg,
}

/// One output column of an aggregated SELECT.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeColumn {
    pub name: String,
    pub aggregate: Option<AggregateKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePlan {
    /// Output names of the GROUP BY columns; empty for plain aggregation.
    pub group_by: Vec<String>,
    pub columns: Vec<MergeColumn>,
}

/// How per-shard results combine into the client's result.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeStrategy {
    /// Concatenate rows in shard order.
    Rows {
        strip_virtual_shard: bool,
        distinct: bool,
    },
    /// Reduce aggregates across shards, optionally per GROUP BY key.
    Aggregate(AggregatePlan),
    /// Sum `rows_affected`; concatenate any RETURNING rows.
    RowsAffected,
    /// DDL fan-out: success only, no rows.
    Ddl,
}

/// A fully planned statement.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub table: Option<String>,
    pub dispatches: Vec<ShardDispatch>,
    pub merge: MergeStrategy,
    pub kind: StatementKind,
}

/// A shard-key or indexed-column equality value found in a WHERE clause.
#[derive(Debug, Clone, PartialEq)]
enum EqValue {
    Literal(SqlValue),
    Param(usize),
}

impl EqValue {
    fn resolve(&self, params: &[SqlValue]) -> Result<SqlValue> {
        match self {
            EqValue::Literal(value) => Ok(value.clone()),
            EqValue::Param(index) => params.get(*index).cloned().ok_or_else(|| {
                ConductorError::Plan(format!(
                    "placeholder {index} has no bound parameter ({} supplied)",
                    params.len()
                ))
            }),
        }
    }
}

/// Plans one statement against a topology snapshot.
///
/// `topology` is consulted only for point lookups into the virtual-index
/// entries; everything else comes from the (possibly cached) snapshot.
pub fn plan_statement(
    statement: &Statement,
    params: &[SqlValue],
    snapshot: &TopologySnapshot,
    topology: &Topology,
) -> Result<QueryPlan> {
    check_parameter_count(statement, params)?;

    match statement {
        Statement::CreateTable(create) => plan_create_table(create, snapshot),
        Statement::DropTable(drop) => plan_table_ddl(
            &drop.name,
            drop.if_exists,
            Statement::DropTable(drop.clone()),
            snapshot,
        ),
        Statement::AlterTable(alter) => plan_table_ddl(
            &alter.table,
            false,
            Statement::AlterTable(alter.clone()),
            snapshot,
        ),
        // Index DDL is metadata-only: physical per-shard indexes are not
        // part of the storage contract. The conductor drives the catalog
        // and the async build job.
        Statement::CreateIndex(_) | Statement::DropIndex(_) => Ok(QueryPlan {
            table: statement.table_name().map(str::to_string),
            dispatches: Vec::new(),
            merge: MergeStrategy::Ddl,
            kind: StatementKind::Ddl,
        }),
        Statement::Pragma(pragma) => plan_pragma(pragma, snapshot),
        Statement::Insert(insert) => plan_insert(insert, params, snapshot),
        Statement::Select(select) => plan_select(select, params, snapshot, topology),
        Statement::Update(update) => plan_write_with_where(
            &update.table,
            update.where_clause.as_ref(),
            Statement::Update(update.clone()),
            params,
            snapshot,
            topology,
        ),
        Statement::Delete(delete) => plan_write_with_where(
            &delete.table,
            delete.where_clause.as_ref(),
            Statement::Delete(delete.clone()),
            params,
            snapshot,
            topology,
        ),
    }
}

fn check_parameter_count(statement: &Statement, params: &[SqlValue]) -> Result<()> {
    let indices = placeholder_indices(statement);
    let needed = indices.iter().max().map(|max| max + 1).unwrap_or(0);
    if params.len() < needed {
        return Err(ConductorError::Plan(format!(
            "statement uses {needed} parameter(s) but {} were supplied",
            params.len()
        )));
    }
    Ok(())
}

// ---- DDL ---------------------------------------------------------------

fn plan_create_table(
    create: &CreateTableStatement,
    snapshot: &TopologySnapshot,
) -> Result<QueryPlan> {
    let rewritten = Statement::CreateTable(rewrite_create_table(create));
    let sql = rewritten.to_string();
    // Schema must exist in every shard slot before data arrives. When the
    // table is already registered its shard map names the slots exactly;
    // an unregistered table (metadata-first flows register before
    // planning) falls back to slot 0 of every node.
    let locations: Vec<ShardLocation> = if snapshot.table(&create.name).is_some() {
        snapshot
            .shards_of(&create.name)
            .into_iter()
            .map(|shard| ShardLocation {
                shard_id: shard.shard_id,
                node_id: shard.node_id.clone(),
            })
            .collect()
    } else {
        snapshot
            .nodes
            .iter()
            .map(|node| ShardLocation {
                shard_id: 0,
                node_id: node.node_id.clone(),
            })
            .collect()
    };
    let dispatches = locations
        .into_iter()
        .map(|location| ShardDispatch {
            location,
            statement: ShardStatement::new(sql.clone(), Vec::new(), StatementKind::Ddl),
            source: rewritten.clone(),
            param_pool: Vec::new(),
        })
        .collect();
    Ok(QueryPlan {
        table: Some(create.name.clone()),
        dispatches,
        merge: MergeStrategy::Ddl,
        kind: StatementKind::Ddl,
    })
}

fn plan_table_ddl(
    table: &str,
    missing_ok: bool,
    statement: Statement,
    snapshot: &TopologySnapshot,
) -> Result<QueryPlan> {
    if snapshot.table(table).is_none() {
        if missing_ok {
            return Ok(QueryPlan {
                table: Some(table.to_string()),
                dispatches: Vec::new(),
                merge: MergeStrategy::Ddl,
                kind: StatementKind::Ddl,
            });
        }
        return Err(ConductorError::Schema(format!(
            "table '{table}' does not exist"
        )));
    }
    let sql = statement.to_string();
    let dispatches = snapshot
        .shards_of(table)
        .into_iter()
        .map(|shard| ShardDispatch {
            location: ShardLocation {
                shard_id: shard.shard_id,
                node_id: shard.node_id.clone(),
            },
            statement: ShardStatement::new(sql.clone(), Vec::new(), StatementKind::Ddl),
            source: statement.clone(),
            param_pool: Vec::new(),
        })
        .collect();
    Ok(QueryPlan {
        table: Some(table.to_string()),
        dispatches,
        merge: MergeStrategy::Ddl,
        kind: StatementKind::Ddl,
    })
}

fn plan_pragma(pragma: &PragmaStatement, snapshot: &TopologySnapshot) -> Result<QueryPlan> {
    let statement = Statement::Pragma(pragma.clone());
    let sql = statement.to_string();
    let dispatches = snapshot
        .nodes
        .iter()
        .map(|node| ShardDispatch {
            location: ShardLocation {
                shard_id: 0,
                node_id: node.node_id.clone(),
            },
            statement: ShardStatement::new(sql.clone(), Vec::new(), StatementKind::Ddl),
            source: statement.clone(),
            param_pool: Vec::new(),
        })
        .collect();
    Ok(QueryPlan {
        table: None,
        dispatches,
        merge: MergeStrategy::Rows {
            strip_virtual_shard: false,
            distinct: false,
        },
        kind: StatementKind::Ddl,
    })
}

/// Rewrites a CREATE TABLE to the physical schema: the hidden shard column
/// is appended and any declared primary key is demoted into a composite
/// `(_virtualShard, pk…)` table constraint.
pub fn rewrite_create_table(create: &CreateTableStatement) -> CreateTableStatement {
    let mut pk_columns: Vec<String> = Vec::new();
    let mut columns = Vec::with_capacity(create.columns.len() + 1);
    for column in &create.columns {
        let mut demoted = column.clone();
        if demoted
            .constraints
            .iter()
            .any(|c| matches!(c, ColumnConstraint::PrimaryKey))
        {
            pk_columns.push(demoted.name.clone());
            demoted
                .constraints
                .retain(|c| !matches!(c, ColumnConstraint::PrimaryKey));
        }
        columns.push(demoted);
    }

    let mut constraints = Vec::new();
    for constraint in &create.constraints {
        match constraint {
            TableConstraint::PrimaryKey(cols) => pk_columns.extend(cols.iter().cloned()),
            other => constraints.push(other.clone()),
        }
    }

    columns.push(ColumnDef {
        name: VIRTUAL_SHARD_COLUMN.to_string(),
        data_type: Some("INTEGER".to_string()),
        constraints: vec![
            ColumnConstraint::NotNull,
            ColumnConstraint::Default(Expr::Literal(Literal::Integer(0))),
        ],
    });

    if !pk_columns.is_empty() {
        let mut composite = vec![VIRTUAL_SHARD_COLUMN.to_string()];
        composite.extend(pk_columns);
        constraints.push(TableConstraint::PrimaryKey(composite));
    }

    CreateTableStatement {
        if_not_exists: create.if_not_exists,
        name: create.name.clone(),
        columns,
        constraints,
    }
}

// ---- INSERT ------------------------------------------------------------

fn plan_insert(
    insert: &InsertStatement,
    params: &[SqlValue],
    snapshot: &TopologySnapshot,
) -> Result<QueryPlan> {
    let table = require_table(snapshot, &insert.table)?;
    let key_position = insert
        .columns
        .iter()
        .position(|c| c == &table.shard_key)
        .ok_or_else(|| {
            ConductorError::Schema(format!(
                "INSERT into '{}' must include the shard key column '{}'",
                table.table_name, table.shard_key
            ))
        })?;

    // Group rows by their computed logical shard; one dispatch per shard.
    let mut rows_by_shard: BTreeMap<u32, Vec<Vec<Expr>>> = BTreeMap::new();
    for row in &insert.rows {
        let expr = row.get(key_position).ok_or_else(|| {
            ConductorError::Schema(format!(
                "INSERT row has {} values but {} columns",
                row.len(),
                insert.columns.len()
            ))
        })?;
        let value = expr_value(expr, params)?.ok_or_else(|| {
            ConductorError::Plan(format!(
                "shard key '{}' must be a literal or placeholder",
                table.shard_key
            ))
        })?;
        let shard_id = shard_for_key(&value.display_string(), table.num_shards);
        rows_by_shard.entry(shard_id).or_default().push(row.clone());
    }

    let shard_map = shard_locations(snapshot, table)?;
    let mut dispatches = Vec::new();
    for (shard_id, mut rows) in rows_by_shard {
        let location = locate(&shard_map, shard_id, &table.table_name)?;
        let mut columns = insert.columns.clone();
        let mut extended = params.to_vec();
        if table.resharding {
            // Pin each physical row to its logical shard while a move is
            // in flight; the new placeholders take the next free indices.
            columns.push(VIRTUAL_SHARD_COLUMN.to_string());
            for row in &mut rows {
                row.push(Expr::Placeholder {
                    index: extended.len(),
                });
                extended.push(SqlValue::Integer(shard_id as i64));
            }
        }
        let statement = Statement::Insert(InsertStatement {
            table: insert.table.clone(),
            columns,
            rows,
        });
        let shard_params = project_params(&statement, &extended)?;
        dispatches.push(ShardDispatch {
            location,
            statement: ShardStatement::new(statement.to_string(), shard_params, StatementKind::Write),
            source: statement,
            param_pool: extended,
        });
    }

    Ok(QueryPlan {
        table: Some(table.table_name.clone()),
        dispatches,
        merge: MergeStrategy::RowsAffected,
        kind: StatementKind::Write,
    })
}

// ---- SELECT / UPDATE / DELETE -----------------------------------------

fn plan_select(
    select: &SelectStatement,
    params: &[SqlValue],
    snapshot: &TopologySnapshot,
    topology: &Topology,
) -> Result<QueryPlan> {
    let Some(from) = &select.from else {
        // Table-less SELECT evaluates anywhere; use the first node.
        let node = snapshot.nodes.first().ok_or_else(|| {
            ConductorError::Schema("no storage nodes available".to_string())
        })?;
        let statement = Statement::Select(select.clone());
        let shard_params = project_params(&statement, params)?;
        return Ok(QueryPlan {
            table: None,
            dispatches: vec![ShardDispatch {
                location: ShardLocation {
                    shard_id: 0,
                    node_id: node.node_id.clone(),
                },
                statement: ShardStatement::new(
                    statement.to_string(),
                    shard_params,
                    StatementKind::Read,
                ),
                source: statement,
                param_pool: params.to_vec(),
            }],
            merge: MergeStrategy::Rows {
                strip_virtual_shard: false,
                distinct: select.distinct,
            },
            kind: StatementKind::Read,
        });
    };

    let table = require_table(snapshot, &from.name)?;
    let targets = route_by_where(
        select.where_clause.as_ref(),
        table,
        params,
        snapshot,
        topology,
    )?;
    let merge = select_merge_strategy(select);
    let statement = Statement::Select(select.clone());
    let dispatches =
        dispatch_to_targets(statement, params, table, targets, snapshot, StatementKind::Read)?;
    Ok(QueryPlan {
        table: Some(table.table_name.clone()),
        dispatches,
        merge,
        kind: StatementKind::Read,
    })
}

fn plan_write_with_where(
    table_name: &str,
    where_clause: Option<&Expr>,
    statement: Statement,
    params: &[SqlValue],
    snapshot: &TopologySnapshot,
    topology: &Topology,
) -> Result<QueryPlan> {
    let table = require_table(snapshot, table_name)?;
    let targets = route_by_where(where_clause, table, params, snapshot, topology)?;
    let dispatches =
        dispatch_to_targets(statement, params, table, targets, snapshot, StatementKind::Write)?;
    Ok(QueryPlan {
        table: Some(table.table_name.clone()),
        dispatches,
        merge: MergeStrategy::RowsAffected,
        kind: StatementKind::Write,
    })
}

/// Resolved routing decision for a WHERE clause.
enum RouteTargets {
    /// Exact shard set, possibly empty (an index lookup found no shard).
    Shards(Vec<u32>),
    /// No usable predicate: every shard of the table.
    AllShards,
}

fn route_by_where(
    where_clause: Option<&Expr>,
    table: &TableRecord,
    params: &[SqlValue],
    snapshot: &TopologySnapshot,
    topology: &Topology,
) -> Result<RouteTargets> {
    let Some(where_clause) = where_clause else {
        return Ok(RouteTargets::AllShards);
    };
    let Some(equalities) = top_level_equalities(where_clause) else {
        return Ok(RouteTargets::AllShards);
    };

    // Rule: equality on the shard key hashes straight to one shard.
    if let Some(eq) = equalities.get(table.shard_key.as_str()) {
        let value = eq.resolve(params)?;
        if !value.is_null() {
            let shard_id = shard_for_key(&value.display_string(), table.num_shards);
            return Ok(RouteTargets::Shards(vec![shard_id]));
        }
    }

    // Rule: a ready virtual index whose columns are all constrained by
    // equalities narrows the fan-out to the indexed shards.
    for index in snapshot.ready_indexes_of(&table.table_name) {
        debug_assert_eq!(index.status, IndexStatus::Ready);
        let mut values = Vec::with_capacity(index.columns.len());
        for column in &index.columns {
            match equalities.get(column.as_str()) {
                Some(eq) => values.push(eq.resolve(params)?),
                None => {
                    values.clear();
                    break;
                }
            }
        }
        if values.len() != index.columns.len() {
            continue;
        }
        let Some(key) = canonical_index_key(&values) else {
            // NULL never matches an index entry; keep scanning rules.
            continue;
        };
        let shards = topology
            .get_indexed_shards(&index.index_name, &key)
            .map_err(ConductorError::Topology)?;
        return Ok(RouteTargets::Shards(shards));
    }

    Ok(RouteTargets::AllShards)
}

fn dispatch_to_targets(
    statement: Statement,
    params: &[SqlValue],
    table: &TableRecord,
    targets: RouteTargets,
    snapshot: &TopologySnapshot,
    kind: StatementKind,
) -> Result<Vec<ShardDispatch>> {
    let shard_ids: Vec<u32> = match targets {
        RouteTargets::Shards(ids) => ids,
        RouteTargets::AllShards => (0..table.num_shards).collect(),
    };
    if shard_ids.is_empty() {
        return Ok(Vec::new());
    }
    let map = shard_locations(snapshot, table)?;

    let mut rewritten = statement;
    if table.resharding {
        // The filter's placeholder sits after every caller-supplied
        // parameter; `check_parameter_count` guaranteed params covers all
        // existing placeholder indices.
        conjoin_virtual_shard_filter(&mut rewritten, params.len());
    }

    let sql = rewritten.to_string();
    let order = placeholder_indices(&rewritten);
    let mut dispatches = Vec::new();
    for shard_id in shard_ids {
        let location = locate(&map, shard_id, &table.table_name)?;
        let mut extended = params.to_vec();
        if table.resharding {
            extended.push(SqlValue::Integer(shard_id as i64));
        }
        let shard_params = project(&order, &extended)?;
        dispatches.push(ShardDispatch {
            location,
            statement: ShardStatement::new(sql.clone(), shard_params, kind),
            source: rewritten.clone(),
            param_pool: extended,
        });
    }
    Ok(dispatches)
}

fn require_table<'a>(snapshot: &'a TopologySnapshot, name: &str) -> Result<&'a TableRecord> {
    snapshot
        .table(name)
        .ok_or_else(|| ConductorError::Schema(format!("table '{name}' does not exist")))
}

fn shard_locations(
    snapshot: &TopologySnapshot,
    table: &TableRecord,
) -> Result<BTreeMap<u32, String>> {
    let mut map = BTreeMap::new();
    for shard in snapshot.shards_of(&table.table_name) {
        map.insert(shard.shard_id, shard.node_id.clone());
    }
    for shard_id in 0..table.num_shards {
        if !map.contains_key(&shard_id) {
            return Err(ConductorError::Plan(format!(
                "table '{}' has no node for shard {shard_id}",
                table.table_name
            )));
        }
    }
    Ok(map)
}

fn locate(map: &BTreeMap<u32, String>, shard_id: u32, table: &str) -> Result<ShardLocation> {
    map.get(&shard_id)
        .map(|node_id| ShardLocation {
            shard_id,
            node_id: node_id.clone(),
        })
        .ok_or_else(|| {
            ConductorError::Plan(format!("table '{table}' has no node for shard {shard_id}"))
        })
}

fn project_params(statement: &Statement, params: &[SqlValue]) -> Result<Vec<SqlValue>> {
    project(&placeholder_indices(statement), params)
}

fn project(order: &[usize], params: &[SqlValue]) -> Result<Vec<SqlValue>> {
    order
        .iter()
        .map(|index| {
            params.get(*index).cloned().ok_or_else(|| {
                ConductorError::Plan(format!(
                    "placeholder {index} has no bound parameter ({} supplied)",
                    params.len()
                ))
            })
        })
        .collect()
}

/// Conjoins `_virtualShard = ?` (with the given parameter index) onto a
/// statement's WHERE clause, or installs it as the whole WHERE.
fn conjoin_virtual_shard_filter(statement: &mut Statement, param_index: usize) {
    let filter = Expr::equals(
        Expr::column(VIRTUAL_SHARD_COLUMN),
        Expr::Placeholder { index: param_index },
    );
    let slot = match statement {
        Statement::Select(s) => &mut s.where_clause,
        Statement::Update(s) => &mut s.where_clause,
        Statement::Delete(s) => &mut s.where_clause,
        _ => return,
    };
    *slot = Some(match slot.take() {
        Some(existing) => Expr::and(existing, filter),
        None => filter,
    });
}

// ---- WHERE analysis ----------------------------------------------------

/// Extracts `column = value` pairs from the top-level AND conjunction of a
/// WHERE clause. Returns `None` when any top-level conjunct contains OR,
/// which disables key-based routing entirely.
fn top_level_equalities(expr: &Expr) -> Option<BTreeMap<String, EqValue>> {
    let mut conjuncts = Vec::new();
    flatten_conjuncts(expr, &mut conjuncts);
    if conjuncts.iter().any(|c| contains_or(c)) {
        return None;
    }
    let mut out = BTreeMap::new();
    for conjunct in conjuncts {
        if let Some((column, value)) = equality(conjunct) {
            out.entry(column).or_insert(value);
        }
    }
    Some(out)
}

fn flatten_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            flatten_conjuncts(left, out);
            flatten_conjuncts(right, out);
        }
        Expr::Grouping(inner) => flatten_conjuncts(inner, out),
        other => out.push(other),
    }
}

fn contains_or(expr: &Expr) -> bool {
    match expr {
        Expr::Binary { left, op, right } => {
            *op == BinaryOp::Or || contains_or(left) || contains_or(right)
        }
        Expr::Grouping(inner) | Expr::Unary { expr: inner, .. } => contains_or(inner),
        Expr::InList { expr, list, .. } => {
            contains_or(expr) || list.iter().any(contains_or)
        }
        Expr::Between {
            expr, low, high, ..
        } => contains_or(expr) || contains_or(low) || contains_or(high),
        Expr::IsNull { expr, .. } => contains_or(expr),
        _ => false,
    }
}

/// Recognizes `col = value` with the column on either side.
fn equality(expr: &Expr) -> Option<(String, EqValue)> {
    let Expr::Binary {
        left,
        op: BinaryOp::Eq,
        right,
    } = expr
    else {
        return None;
    };
    match (column_name(left), routable_value(right)) {
        (Some(column), Some(value)) => return Some((column, value)),
        _ => {}
    }
    match (column_name(right), routable_value(left)) {
        (Some(column), Some(value)) => Some((column, value)),
        _ => None,
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Column(column) => Some(column.column.clone()),
        Expr::Grouping(inner) => column_name(inner),
        _ => None,
    }
}

fn routable_value(expr: &Expr) -> Option<EqValue> {
    match expr {
        Expr::Literal(literal) => Some(EqValue::Literal(literal_value(literal))),
        Expr::Placeholder { index } => Some(EqValue::Param(*index)),
        Expr::Grouping(inner) => routable_value(inner),
        _ => None,
    }
}

/// Lowers a parsed literal to a shard value.
pub fn literal_value(literal: &Literal) -> SqlValue {
    match literal {
        Literal::Null => SqlValue::Null,
        Literal::Boolean(b) => SqlValue::Integer(*b as i64),
        Literal::Integer(v) => SqlValue::Integer(*v),
        Literal::Real(v) => SqlValue::Real(*v),
        Literal::String(v) => SqlValue::Text(v.clone()),
    }
}

/// Resolves an expression to a concrete value when it is a literal or a
/// bound placeholder; anything else is not routable.
pub fn expr_value(expr: &Expr, params: &[SqlValue]) -> Result<Option<SqlValue>> {
    match expr {
        Expr::Literal(literal) => Ok(Some(literal_value(literal))),
        Expr::Placeholder { index } => params
            .get(*index)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                ConductorError::Plan(format!(
                    "placeholder {index} has no bound parameter ({} supplied)",
                    params.len()
                ))
            }),
        Expr::Grouping(inner) => expr_value(inner, params),
        _ => Ok(None),
    }
}

/// Canonical index key for a tuple of values; `None` when any value is
/// NULL, which suppresses indexing and index lookups alike.
pub fn canonical_index_key(values: &[SqlValue]) -> Option<String> {
    if values.iter().any(SqlValue::is_null) {
        return None;
    }
    if values.len() == 1 {
        return Some(values[0].display_string());
    }
    let array: Vec<serde_json::Value> = values.iter().map(SqlValue::to_json).collect();
    serde_json::to_string(&array).ok()
}

// ---- SELECT merge planning ---------------------------------------------

fn aggregate_kind(name: &str) -> Option<AggregateKind> {
    match name.to_ascii_uppercase().as_str() {
        "COUNT" => Some(AggregateKind::Count),
        "SUM" => Some(AggregateKind::Sum),
        "MIN" => Some(AggregateKind::Min),
        "MAX" => Some(AggregateKind::Max),
        "AVG" => Some(AggregateKind::Avg),
        _ => None,
    }
}

/// Chooses the merge strategy for a SELECT from its projection shape.
pub fn select_merge_strategy(select: &SelectStatement) -> MergeStrategy {
    let plain_rows = MergeStrategy::Rows {
        strip_virtual_shard: !projects_virtual_shard(select),
        distinct: select.distinct,
    };

    let mut columns = Vec::with_capacity(select.items.len());
    let mut has_aggregate = false;
    for item in &select.items {
        let SelectItem::Expr { expr, .. } = item else {
            // Wildcards cannot participate in aggregate recombination.
            return plain_rows;
        };
        let aggregate = match expr {
            Expr::Function { name, .. } => aggregate_kind(name),
            _ => None,
        };
        has_aggregate |= aggregate.is_some();
        let Some(name) = item.output_name() else {
            return plain_rows;
        };
        columns.push(MergeColumn { name, aggregate });
    }

    if select.group_by.is_empty() {
        if has_aggregate {
            return MergeStrategy::Aggregate(AggregatePlan {
                group_by: Vec::new(),
                columns,
            });
        }
        return plain_rows;
    }

    // GROUP BY merging needs every grouped column in the projection; when
    // one is missing the union of shard rows is returned untouched.
    let mut group_names = Vec::with_capacity(select.group_by.len());
    for group_expr in &select.group_by {
        let Some(group_column) = column_name(group_expr) else {
            return MergeStrategy::Rows {
                strip_virtual_shard: false,
                distinct: false,
            };
        };
        let projected = columns.iter().any(|c| c.name == group_column);
        if !projected {
            return MergeStrategy::Rows {
                strip_virtual_shard: false,
                distinct: false,
            };
        }
        group_names.push(group_column);
    }
    MergeStrategy::Aggregate(AggregatePlan {
        group_by: group_names,
        columns,
    })
}

fn projects_virtual_shard(select: &SelectStatement) -> bool {
    select.items.iter().any(|item| match item {
        SelectItem::Expr { expr, alias } => {
            alias.as_deref() == Some(VIRTUAL_SHARD_COLUMN)
                || matches!(expr, Expr::Column(c) if c.column == VIRTUAL_SHARD_COLUMN)
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parse_statement;
    use tessera_topology::{IndexKind, TableSpec, TopologyDelta};

    fn fixture(num_nodes: usize, num_shards: u32) -> (Topology, TopologySnapshot) {
        let topology = Topology::open_in_memory().expect("open catalog");
        topology.create(num_nodes).expect("create");
        topology
            .update_topology(TopologyDelta {
                add: vec![TableSpec {
                    table_name: "users".to_string(),
                    pk_column: "id".to_string(),
                    pk_type: "INTEGER".to_string(),
                    shard_key: None,
                    num_shards,
                    block_size: 1000,
                }],
                ..Default::default()
            })
            .expect("add table");
        let snapshot = topology.snapshot().expect("snapshot");
        (topology, snapshot)
    }

    fn plan(sql: &str, params: Vec<SqlValue>, topology: &Topology) -> QueryPlan {
        let statement = parse_statement(sql).expect("parse");
        let snapshot = topology.snapshot().expect("snapshot");
        plan_statement(&statement, &params, &snapshot, topology).expect("plan")
    }

    #[test]
    fn shard_key_equality_routes_to_one_shard() {
        let (topology, _) = fixture(2, 4);
        let plan = plan("SELECT * FROM users WHERE id = 100", Vec::new(), &topology);
        assert_eq!(plan.dispatches.len(), 1);
        assert_eq!(
            plan.dispatches[0].location.shard_id,
            shard_for_key("100", 4)
        );
    }

    #[test]
    fn shard_key_resolves_through_the_right_placeholder() {
        let (topology, _) = fixture(2, 4);
        // the shard key binds through the second placeholder, not the first
        let plan = plan(
            "SELECT * FROM users WHERE age > ? AND id = ?",
            vec![SqlValue::Integer(20), SqlValue::Integer(100)],
            &topology,
        );
        assert_eq!(plan.dispatches.len(), 1);
        assert_eq!(
            plan.dispatches[0].location.shard_id,
            shard_for_key("100", 4)
        );
    }

    #[test]
    fn or_in_where_disables_key_routing() {
        let (topology, _) = fixture(2, 4);
        let plan = plan(
            "SELECT * FROM users WHERE id = 100 OR id = 200",
            Vec::new(),
            &topology,
        );
        assert_eq!(plan.dispatches.len(), 4);
    }

    #[test]
    fn non_key_predicates_fan_out_to_all_shards() {
        let (topology, _) = fixture(2, 4);
        let plan = plan(
            "SELECT * FROM users WHERE age > 20",
            Vec::new(),
            &topology,
        );
        assert_eq!(plan.dispatches.len(), 4);
    }

    #[test]
    fn ready_index_narrows_fanout_and_empty_lookup_plans_zero_shards() {
        let (topology, _) = fixture(2, 4);
        topology
            .create_virtual_index("idx_email", "users", &["email".to_string()], IndexKind::Hash)
            .expect("create index");

        // building: the planner must ignore the index and scan all shards
        let building = plan(
            "SELECT * FROM users WHERE email = 'a@example.com'",
            Vec::new(),
            &topology,
        );
        assert_eq!(building.dispatches.len(), 4);

        topology
            .update_index_status("idx_email", tessera_topology::IndexStatus::Ready, None)
            .expect("ready");
        topology
            .apply_index_delta(
                "idx_email",
                3,
                "a@example.com",
                tessera_topology::IndexDeltaOp::Add,
            )
            .expect("delta");

        let ready = plan(
            "SELECT * FROM users WHERE email = 'a@example.com'",
            Vec::new(),
            &topology,
        );
        assert_eq!(ready.dispatches.len(), 1);
        assert_eq!(ready.dispatches[0].location.shard_id, 3);

        // a key no shard holds plans zero dispatches
        let absent = plan(
            "SELECT * FROM users WHERE email = 'nobody@example.com'",
            Vec::new(),
            &topology,
        );
        assert!(absent.dispatches.is_empty());
    }

    #[test]
    fn insert_requires_shard_key_and_groups_rows_per_shard() {
        let (topology, _) = fixture(2, 4);
        let statement = parse_statement("INSERT INTO users (email) VALUES ('x')").expect("parse");
        let snapshot = topology.snapshot().expect("snapshot");
        let err = plan_statement(&statement, &[], &snapshot, &topology).expect_err("must fail");
        assert!(matches!(err, ConductorError::Schema(_)));

        let multi = plan(
            "INSERT INTO users (id, email) VALUES (?, ?), (?, ?)",
            vec![
                SqlValue::Integer(1),
                SqlValue::from("a@example.com"),
                SqlValue::Integer(2),
                SqlValue::from("b@example.com"),
            ],
            &topology,
        );
        let mut expected: Vec<u32> = vec![shard_for_key("1", 4), shard_for_key("2", 4)];
        expected.sort_unstable();
        expected.dedup();
        assert_eq!(multi.dispatches.len(), expected.len());
    }

    #[test]
    fn create_table_rewrite_demotes_primary_key() {
        let Statement::CreateTable(create) =
            parse_statement("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)")
                .expect("parse")
        else {
            panic!("expected CREATE TABLE");
        };
        let rewritten = rewrite_create_table(&create);
        assert_eq!(
            rewritten.to_string(),
            "CREATE TABLE users (id INTEGER, email TEXT, \
             _virtualShard INTEGER NOT NULL DEFAULT 0, \
             PRIMARY KEY (_virtualShard, id))"
        );
    }

    #[test]
    fn create_table_targets_every_node() {
        let (topology, snapshot) = fixture(3, 2);
        let statement =
            parse_statement("CREATE TABLE orders (id INTEGER PRIMARY KEY)").expect("parse");
        let plan = plan_statement(&statement, &[], &snapshot, &topology).expect("plan");
        assert_eq!(plan.dispatches.len(), 3);
        assert!(plan
            .dispatches
            .iter()
            .all(|d| d.statement.sql.contains(VIRTUAL_SHARD_COLUMN)));
    }

    #[test]
    fn resharding_appends_filter_without_renumbering() {
        let (topology, _) = fixture(1, 2);
        topology
            .update_topology(TopologyDelta {
                update: vec![tessera_topology::TableUpdate {
                    table_name: "users".to_string(),
                    resharding: Some(true),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .expect("flag resharding");

        let plan = plan(
            "UPDATE users SET email = ? WHERE id = ?",
            vec![SqlValue::from("new@example.com"), SqlValue::Integer(7)],
            &topology,
        );
        assert_eq!(plan.dispatches.len(), 1);
        let dispatch = &plan.dispatches[0];
        assert!(dispatch
            .statement
            .sql
            .ends_with("WHERE id = ? AND _virtualShard = ?"));
        assert_eq!(
            dispatch.statement.params,
            vec![
                SqlValue::from("new@example.com"),
                SqlValue::Integer(7),
                SqlValue::Integer(dispatch.location.shard_id as i64),
            ]
        );
    }

    #[test]
    fn resharding_insert_interleaves_virtual_shard_values() {
        let (topology, _) = fixture(1, 2);
        topology
            .update_topology(TopologyDelta {
                update: vec![tessera_topology::TableUpdate {
                    table_name: "users".to_string(),
                    resharding: Some(true),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .expect("flag resharding");

        let plan = plan(
            "INSERT INTO users (id, email) VALUES (?, ?)",
            vec![SqlValue::Integer(1), SqlValue::from("a@example.com")],
            &topology,
        );
        assert_eq!(plan.dispatches.len(), 1);
        let dispatch = &plan.dispatches[0];
        assert!(dispatch.statement.sql.contains("_virtualShard"));
        assert_eq!(dispatch.statement.params.len(), 3);
        assert_eq!(
            dispatch.statement.params[2],
            SqlValue::Integer(dispatch.location.shard_id as i64)
        );
    }

    #[test]
    fn merge_strategy_classification() {
        let strategies = [
            ("SELECT * FROM users", true),
            ("SELECT COUNT(*) FROM users", false),
        ];
        for (sql, expect_rows) in strategies {
            let Statement::Select(select) = parse_statement(sql).expect("parse") else {
                panic!("expected SELECT");
            };
            match (select_merge_strategy(&select), expect_rows) {
                (MergeStrategy::Rows { .. }, true) | (MergeStrategy::Aggregate(_), false) => {}
                (other, _) => panic!("unexpected strategy for {sql}: {other:?}"),
            }
        }

        // GROUP BY column projected: aggregate plan keyed by it
        let Statement::Select(grouped) =
            parse_statement("SELECT status, COUNT(*) FROM users GROUP BY status").expect("parse")
        else {
            panic!("expected SELECT");
        };
        let MergeStrategy::Aggregate(plan) = select_merge_strategy(&grouped) else {
            panic!("expected aggregate strategy");
        };
        assert_eq!(plan.group_by, vec!["status"]);
        assert_eq!(plan.columns[1].aggregate, Some(AggregateKind::Count));

        // GROUP BY column not projected: untouched union
        let Statement::Select(unprojected) =
            parse_statement("SELECT COUNT(*) FROM users GROUP BY status").expect("parse")
        else {
            panic!("expected SELECT");
        };
        assert!(matches!(
            select_merge_strategy(&unprojected),
            MergeStrategy::Rows { .. }
        ));
    }

    #[test]
    fn null_shard_key_value_skips_index_and_key_routing() {
        let (topology, _) = fixture(1, 4);
        let plan = plan(
            "SELECT * FROM users WHERE id = ?",
            vec![SqlValue::Null],
            &topology,
        );
        assert_eq!(plan.dispatches.len(), 4);
    }
}

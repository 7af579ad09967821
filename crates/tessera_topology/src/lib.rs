//! Durable cluster catalog for the tessera distributed SQL front-end.
//!
//! The catalog ("Topology") is the single source of truth for the storage
//! node roster, table metadata, the logical→physical shard map, virtual
//! secondary-index definitions and entries, and the async-job log. It is
//! the only globally mutable state in the system: every mutation goes
//! through one serialized writer, and every mutation bumps a persisted
//! monotonic version that routers use to validate their local snapshots.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use thiserror::Error;
use tracing::debug;

pub mod types;

pub use types::*;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("topology already created")]
    AlreadyCreated,
    #[error("topology not created")]
    NotCreated,
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("unknown index '{0}'")]
    UnknownIndex(String),
    #[error("invalid index status transition {from:?} -> {to:?} for '{index}'")]
    InvalidStatusTransition {
        index: String,
        from: IndexStatus,
        to: IndexStatus,
    },
    #[error("unknown job {0}")]
    UnknownJob(i64),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("shard {shard_id} is outside [0, {num_shards}) for table '{table}'")]
    ShardOutOfRange {
        table: String,
        shard_id: u32,
        num_shards: u32,
    },
    #[error("catalog storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, TopologyError>;

/// Identifier of the shard-routing hash pinned on new tables.
pub const HASH_ALGORITHM: &str = "fold32";
/// Version of the shard-routing hash pinned on new tables.
pub const HASH_VERSION: u32 = 1;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS catalog_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS nodes (
    node_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    capacity_used INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
CREATE TABLE IF NOT EXISTS tables (
    table_name TEXT PRIMARY KEY,
    pk_column TEXT NOT NULL,
    pk_type TEXT NOT NULL,
    shard_key TEXT NOT NULL,
    num_shards INTEGER NOT NULL,
    block_size INTEGER NOT NULL,
    resharding INTEGER NOT NULL DEFAULT 0,
    hash_algorithm TEXT NOT NULL,
    hash_version INTEGER NOT NULL,
    created_at_unix_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS table_shards (
    table_name TEXT NOT NULL,
    shard_id INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    PRIMARY KEY (table_name, shard_id)
);
CREATE TABLE IF NOT EXISTS virtual_indexes (
    index_name TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    columns TEXT NOT NULL,
    index_type TEXT NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    created_at_unix_ms INTEGER NOT NULL,
    updated_at_unix_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS virtual_index_entries (
    index_name TEXT NOT NULL,
    key_value TEXT NOT NULL,
    shard_ids TEXT NOT NULL,
    PRIMARY KEY (index_name, key_value)
);
CREATE TABLE IF NOT EXISTS async_jobs (
    job_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    table_name TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    created_at_unix_ms INTEGER NOT NULL,
    updated_at_unix_ms INTEGER NOT NULL
);
";

/// Serialized-writer handle over one catalog database.
pub struct Topology {
    conn: Mutex<Connection>,
}

impl Topology {
    /// Opens an in-memory catalog (tests, single-process clusters).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Opens or creates a file-backed catalog.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bootstraps the node roster. Fails if the catalog was already created
    /// or `num_nodes` is zero.
    pub fn create(&self, num_nodes: usize) -> Result<()> {
        if num_nodes < 1 {
            return Err(TopologyError::InvalidArgument(
                "cluster needs at least one node".to_string(),
            ));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if read_meta(&tx, "created")?.is_some() {
            return Err(TopologyError::AlreadyCreated);
        }
        for i in 0..num_nodes {
            tx.execute(
                "INSERT INTO nodes (node_id, status, capacity_used) VALUES (?, ?, 0)",
                params![format!("node-{i}"), NodeStatus::Active.as_str()],
            )?;
        }
        write_meta(&tx, "created", "1")?;
        bump_version(&tx)?;
        tx.commit()?;
        debug!(num_nodes, "catalog created");
        Ok(())
    }

    pub fn is_created(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Ok(read_meta(&conn, "created")?.is_some())
    }

    /// Monotonic catalog version; bumped by every committed mutation.
    pub fn version(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        Ok(read_version(&conn)?)
    }

    /// Full consistent catalog dump. Fails if the catalog is not created.
    pub fn get_topology(&self) -> Result<TopologyCatalog> {
        let conn = self.conn.lock().unwrap();
        if read_meta(&conn, "created")?.is_none() {
            return Err(TopologyError::NotCreated);
        }
        Ok(TopologyCatalog {
            version: read_version(&conn)?,
            nodes: read_nodes(&conn)?,
            tables: read_tables(&conn)?,
            table_shards: read_table_shards(&conn)?,
            virtual_indexes: read_indexes(&conn)?,
            virtual_index_entries: read_index_entries(&conn)?,
            async_jobs: read_jobs(&conn)?,
        })
    }

    /// Routing view used by planners: everything except index entries and
    /// the job log, which are read point-wise.
    pub fn snapshot(&self) -> Result<TopologySnapshot> {
        let conn = self.conn.lock().unwrap();
        if read_meta(&conn, "created")?.is_none() {
            return Err(TopologyError::NotCreated);
        }
        Ok(TopologySnapshot {
            version: read_version(&conn)?,
            nodes: read_nodes(&conn)?,
            tables: read_tables(&conn)?,
            table_shards: read_table_shards(&conn)?,
            virtual_indexes: read_indexes(&conn)?,
        })
    }

    /// Applies a batch of table-metadata changes atomically.
    ///
    /// Added tables materialize their shard map with the assignment
    /// `node_id = nodes[shard_id mod len(nodes)]` over active nodes.
    pub fn update_topology(&self, delta: TopologyDelta) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if read_meta(&tx, "created")?.is_none() {
            return Err(TopologyError::NotCreated);
        }

        let active_nodes: Vec<String> = read_nodes(&tx)?
            .into_iter()
            .filter(|n| n.status == NodeStatus::Active)
            .map(|n| n.node_id)
            .collect();

        for spec in &delta.add {
            if spec.num_shards < 1 {
                return Err(TopologyError::InvalidArgument(format!(
                    "table '{}' needs num_shards >= 1",
                    spec.table_name
                )));
            }
            if table_exists(&tx, &spec.table_name)? {
                return Err(TopologyError::AlreadyExists {
                    kind: "table",
                    name: spec.table_name.clone(),
                });
            }
            if active_nodes.is_empty() {
                return Err(TopologyError::InvalidArgument(
                    "no active nodes to place shards on".to_string(),
                ));
            }
            let shard_key = spec.shard_key.clone().unwrap_or_else(|| spec.pk_column.clone());
            tx.execute(
                "INSERT INTO tables (table_name, pk_column, pk_type, shard_key, num_shards, \
                 block_size, resharding, hash_algorithm, hash_version, created_at_unix_ms) \
                 VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
                params![
                    spec.table_name,
                    spec.pk_column,
                    spec.pk_type,
                    shard_key,
                    spec.num_shards,
                    spec.block_size,
                    HASH_ALGORITHM,
                    HASH_VERSION,
                    now_unix_ms(),
                ],
            )?;
            for shard_id in 0..spec.num_shards {
                let node_id = &active_nodes[shard_id as usize % active_nodes.len()];
                tx.execute(
                    "INSERT INTO table_shards (table_name, shard_id, node_id) VALUES (?, ?, ?)",
                    params![spec.table_name, shard_id, node_id],
                )?;
            }
        }

        for update in &delta.update {
            if !table_exists(&tx, &update.table_name)? {
                return Err(TopologyError::UnknownTable(update.table_name.clone()));
            }
            if let Some(resharding) = update.resharding {
                tx.execute(
                    "UPDATE tables SET resharding = ? WHERE table_name = ?",
                    params![resharding as i64, update.table_name],
                )?;
            }
            if let Some(block_size) = update.block_size {
                tx.execute(
                    "UPDATE tables SET block_size = ? WHERE table_name = ?",
                    params![block_size, update.table_name],
                )?;
            }
            if let Some(new_name) = &update.renamed_to {
                if table_exists(&tx, new_name)? {
                    return Err(TopologyError::AlreadyExists {
                        kind: "table",
                        name: new_name.clone(),
                    });
                }
                tx.execute(
                    "UPDATE tables SET table_name = ? WHERE table_name = ?",
                    params![new_name, update.table_name],
                )?;
                tx.execute(
                    "UPDATE table_shards SET table_name = ? WHERE table_name = ?",
                    params![new_name, update.table_name],
                )?;
                tx.execute(
                    "UPDATE virtual_indexes SET table_name = ? WHERE table_name = ?",
                    params![new_name, update.table_name],
                )?;
                tx.execute(
                    "UPDATE async_jobs SET table_name = ? WHERE table_name = ?",
                    params![new_name, update.table_name],
                )?;
            }
        }

        for table_name in &delta.remove {
            if !table_exists(&tx, table_name)? {
                return Err(TopologyError::UnknownTable(table_name.clone()));
            }
            tx.execute(
                "DELETE FROM virtual_index_entries WHERE index_name IN \
                 (SELECT index_name FROM virtual_indexes WHERE table_name = ?)",
                params![table_name],
            )?;
            tx.execute(
                "DELETE FROM virtual_indexes WHERE table_name = ?",
                params![table_name],
            )?;
            tx.execute(
                "DELETE FROM table_shards WHERE table_name = ?",
                params![table_name],
            )?;
            tx.execute("DELETE FROM tables WHERE table_name = ?", params![table_name])?;
        }

        bump_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Registers a virtual index in `building` state.
    pub fn create_virtual_index(
        &self,
        index_name: &str,
        table_name: &str,
        columns: &[String],
        kind: IndexKind,
    ) -> Result<()> {
        if columns.is_empty() {
            return Err(TopologyError::InvalidArgument(format!(
                "index '{index_name}' needs at least one column"
            )));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if !table_exists(&tx, table_name)? {
            return Err(TopologyError::UnknownTable(table_name.to_string()));
        }
        let taken: Option<String> = tx
            .query_row(
                "SELECT index_name FROM virtual_indexes WHERE index_name = ?",
                params![index_name],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(TopologyError::AlreadyExists {
                kind: "index",
                name: index_name.to_string(),
            });
        }
        let now = now_unix_ms();
        tx.execute(
            "INSERT INTO virtual_indexes (index_name, table_name, columns, index_type, status, \
             created_at_unix_ms, updated_at_unix_ms) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                index_name,
                table_name,
                serde_json::to_string(columns).unwrap_or_default(),
                kind.as_str(),
                IndexStatus::Building.as_str(),
                now,
                now,
            ],
        )?;
        bump_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Transitions an index's lifecycle status, enforcing the legal edges.
    pub fn update_index_status(
        &self,
        index_name: &str,
        status: IndexStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let current = read_index(&tx, index_name)?
            .ok_or_else(|| TopologyError::UnknownIndex(index_name.to_string()))?;
        if !current.status.can_transition_to(status) {
            return Err(TopologyError::InvalidStatusTransition {
                index: index_name.to_string(),
                from: current.status,
                to: status,
            });
        }
        tx.execute(
            "UPDATE virtual_indexes SET status = ?, error_message = ?, updated_at_unix_ms = ? \
             WHERE index_name = ?",
            params![status.as_str(), error, now_unix_ms(), index_name],
        )?;
        bump_version(&tx)?;
        tx.commit()?;
        debug!(index = index_name, status = status.as_str(), "index status updated");
        Ok(())
    }

    /// Idempotent per-key replace of index entries. Empty shard sets delete.
    pub fn batch_upsert_index_entries(
        &self,
        index_name: &str,
        entries: &[IndexEntryUpsert],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let index = read_index(&tx, index_name)?
            .ok_or_else(|| TopologyError::UnknownIndex(index_name.to_string()))?;
        let num_shards = table_num_shards(&tx, &index.table_name)?;
        for entry in entries {
            if entry.shard_ids.is_empty() {
                tx.execute(
                    "DELETE FROM virtual_index_entries WHERE index_name = ? AND key_value = ?",
                    params![index_name, entry.key_value],
                )?;
                continue;
            }
            let shard_ids = normalize_shard_set(&index.table_name, num_shards, &entry.shard_ids)?;
            tx.execute(
                "INSERT INTO virtual_index_entries (index_name, key_value, shard_ids) \
                 VALUES (?, ?, ?) \
                 ON CONFLICT (index_name, key_value) DO UPDATE SET shard_ids = excluded.shard_ids",
                params![
                    index_name,
                    entry.key_value,
                    serde_json::to_string(&shard_ids).unwrap_or_default()
                ],
            )?;
        }
        bump_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Adds or removes exactly one shard in one key's set. The entry is
    /// deleted outright when its set drains. Same-tuple deltas are
    /// linearized by the writer lock.
    pub fn apply_index_delta(
        &self,
        index_name: &str,
        shard_id: u32,
        key_value: &str,
        op: IndexDeltaOp,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let index = read_index(&tx, index_name)?
            .ok_or_else(|| TopologyError::UnknownIndex(index_name.to_string()))?;
        let num_shards = table_num_shards(&tx, &index.table_name)?;
        if shard_id >= num_shards {
            return Err(TopologyError::ShardOutOfRange {
                table: index.table_name,
                shard_id,
                num_shards,
            });
        }

        let existing: Option<String> = tx
            .query_row(
                "SELECT shard_ids FROM virtual_index_entries WHERE index_name = ? AND key_value = ?",
                params![index_name, key_value],
                |row| row.get(0),
            )
            .optional()?;
        let mut shard_ids: Vec<u32> = match existing.as_deref() {
            Some(raw) => serde_json::from_str(raw).unwrap_or_default(),
            None => Vec::new(),
        };

        match op {
            IndexDeltaOp::Add => {
                if !shard_ids.contains(&shard_id) {
                    shard_ids.push(shard_id);
                    shard_ids.sort_unstable();
                }
            }
            IndexDeltaOp::Remove => {
                shard_ids.retain(|id| *id != shard_id);
            }
        }

        if shard_ids.is_empty() {
            tx.execute(
                "DELETE FROM virtual_index_entries WHERE index_name = ? AND key_value = ?",
                params![index_name, key_value],
            )?;
        } else {
            tx.execute(
                "INSERT INTO virtual_index_entries (index_name, key_value, shard_ids) \
                 VALUES (?, ?, ?) \
                 ON CONFLICT (index_name, key_value) DO UPDATE SET shard_ids = excluded.shard_ids",
                params![
                    index_name,
                    key_value,
                    serde_json::to_string(&shard_ids).unwrap_or_default()
                ],
            )?;
        }
        bump_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Shards currently holding `key_value`, or empty when absent.
    pub fn get_indexed_shards(&self, index_name: &str, key_value: &str) -> Result<Vec<u32>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT shard_ids FROM virtual_index_entries WHERE index_name = ? AND key_value = ?",
                params![index_name, key_value],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw
            .as_deref()
            .map(|raw| serde_json::from_str(raw).unwrap_or_default())
            .unwrap_or_default())
    }

    /// Removes an index definition and all of its entries. Returns whether
    /// the definition existed.
    pub fn drop_virtual_index(&self, index_name: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM virtual_index_entries WHERE index_name = ?",
            params![index_name],
        )?;
        let dropped = tx.execute(
            "DELETE FROM virtual_indexes WHERE index_name = ?",
            params![index_name],
        )?;
        bump_version(&tx)?;
        tx.commit()?;
        Ok(dropped > 0)
    }

    /// Looks up one index definition.
    pub fn virtual_index(&self, index_name: &str) -> Result<Option<VirtualIndexRecord>> {
        let conn = self.conn.lock().unwrap();
        read_index(&conn, index_name)
    }

    /// Appends a pending async job and returns its id.
    pub fn create_job(&self, job_type: &str, table_name: &str) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = now_unix_ms();
        tx.execute(
            "INSERT INTO async_jobs (job_type, table_name, status, created_at_unix_ms, \
             updated_at_unix_ms) VALUES (?, ?, ?, ?, ?)",
            params![job_type, table_name, JobStatus::Pending.as_str(), now, now],
        )?;
        let id = tx.last_insert_rowid();
        bump_version(&tx)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE async_jobs SET status = ?, error = ?, updated_at_unix_ms = ? WHERE job_id = ?",
            params![status.as_str(), error, now_unix_ms(), job_id],
        )?;
        if updated == 0 {
            return Err(TopologyError::UnknownJob(job_id));
        }
        bump_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<AsyncJobRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(read_jobs(&conn)?)
    }

    /// Transitions a node's lifecycle status.
    pub fn set_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE nodes SET status = ?, last_error = ? WHERE node_id = ?",
            params![status.as_str(), last_error, node_id],
        )?;
        if updated == 0 {
            return Err(TopologyError::UnknownNode(node_id.to_string()));
        }
        bump_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Adjusts a node's usage counter by a signed delta, floored at zero.
    pub fn record_capacity(&self, node_id: &str, delta: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE nodes SET capacity_used = MAX(0, capacity_used + ?) WHERE node_id = ?",
            params![delta, node_id],
        )?;
        if updated == 0 {
            return Err(TopologyError::UnknownNode(node_id.to_string()));
        }
        bump_version(&tx)?;
        tx.commit()?;
        Ok(())
    }
}

fn normalize_shard_set(table: &str, num_shards: u32, shard_ids: &[u32]) -> Result<Vec<u32>> {
    let mut out: Vec<u32> = shard_ids.to_vec();
    out.sort_unstable();
    out.dedup();
    if let Some(&bad) = out.iter().find(|id| **id >= num_shards) {
        return Err(TopologyError::ShardOutOfRange {
            table: table.to_string(),
            shard_id: bad,
            num_shards,
        });
    }
    Ok(out)
}

fn read_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM catalog_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

fn write_meta(tx: &Transaction<'_>, key: &str, value: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO catalog_meta (key, value) VALUES (?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn read_version(conn: &Connection) -> rusqlite::Result<u64> {
    let raw = read_meta(conn, "version")?;
    Ok(raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0))
}

fn bump_version(tx: &Transaction<'_>) -> rusqlite::Result<u64> {
    let next = read_version(tx)? + 1;
    write_meta(tx, "version", &next.to_string())?;
    Ok(next)
}

fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM tables WHERE table_name = ?",
            params![table_name],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn table_num_shards(conn: &Connection, table_name: &str) -> Result<u32> {
    conn.query_row(
        "SELECT num_shards FROM tables WHERE table_name = ?",
        params![table_name],
        |row| row.get::<_, u32>(0),
    )
    .optional()?
    .ok_or_else(|| TopologyError::UnknownTable(table_name.to_string()))
}

fn read_nodes(conn: &Connection) -> rusqlite::Result<Vec<StorageNodeRecord>> {
    let mut stmt = conn.prepare(
        "SELECT node_id, status, capacity_used, last_error FROM nodes ORDER BY node_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(StorageNodeRecord {
            node_id: row.get(0)?,
            status: NodeStatus::parse(&row.get::<_, String>(1)?).unwrap_or(NodeStatus::Failed),
            capacity_used: row.get(2)?,
            last_error: row.get(3)?,
        })
    })?;
    rows.collect()
}

fn read_tables(conn: &Connection) -> rusqlite::Result<Vec<TableRecord>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, pk_column, pk_type, shard_key, num_shards, block_size, resharding, \
         hash_algorithm, hash_version, created_at_unix_ms FROM tables ORDER BY table_name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(TableRecord {
            table_name: row.get(0)?,
            pk_column: row.get(1)?,
            pk_type: row.get(2)?,
            shard_key: row.get(3)?,
            num_shards: row.get(4)?,
            block_size: row.get(5)?,
            resharding: row.get::<_, i64>(6)? != 0,
            hash_algorithm: row.get(7)?,
            hash_version: row.get(8)?,
            created_at_unix_ms: row.get(9)?,
        })
    })?;
    rows.collect()
}

fn read_table_shards(conn: &Connection) -> rusqlite::Result<Vec<TableShardRecord>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, shard_id, node_id FROM table_shards ORDER BY table_name, shard_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(TableShardRecord {
            table_name: row.get(0)?,
            shard_id: row.get(1)?,
            node_id: row.get(2)?,
        })
    })?;
    rows.collect()
}

fn read_index(conn: &Connection, index_name: &str) -> Result<Option<VirtualIndexRecord>> {
    let record = conn
        .query_row(
            "SELECT index_name, table_name, columns, index_type, status, error_message, \
             created_at_unix_ms, updated_at_unix_ms FROM virtual_indexes WHERE index_name = ?",
            params![index_name],
            map_index_row,
        )
        .optional()?;
    Ok(record)
}

fn map_index_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VirtualIndexRecord> {
    let columns_raw: String = row.get(2)?;
    Ok(VirtualIndexRecord {
        index_name: row.get(0)?,
        table_name: row.get(1)?,
        columns: serde_json::from_str(&columns_raw).unwrap_or_default(),
        kind: IndexKind::parse(&row.get::<_, String>(3)?).unwrap_or(IndexKind::Hash),
        status: IndexStatus::parse(&row.get::<_, String>(4)?).unwrap_or(IndexStatus::Failed),
        error_message: row.get(5)?,
        created_at_unix_ms: row.get(6)?,
        updated_at_unix_ms: row.get(7)?,
    })
}

fn read_indexes(conn: &Connection) -> rusqlite::Result<Vec<VirtualIndexRecord>> {
    let mut stmt = conn.prepare(
        "SELECT index_name, table_name, columns, index_type, status, error_message, \
         created_at_unix_ms, updated_at_unix_ms FROM virtual_indexes ORDER BY index_name",
    )?;
    let rows = stmt.query_map([], map_index_row)?;
    rows.collect()
}

fn read_index_entries(conn: &Connection) -> rusqlite::Result<Vec<VirtualIndexEntryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT index_name, key_value, shard_ids FROM virtual_index_entries \
         ORDER BY index_name, key_value",
    )?;
    let rows = stmt.query_map([], |row| {
        let shard_ids_raw: String = row.get(2)?;
        Ok(VirtualIndexEntryRecord {
            index_name: row.get(0)?,
            key_value: row.get(1)?,
            shard_ids: serde_json::from_str(&shard_ids_raw).unwrap_or_default(),
        })
    })?;
    rows.collect()
}

fn read_jobs(conn: &Connection) -> rusqlite::Result<Vec<AsyncJobRecord>> {
    let mut stmt = conn.prepare(
        "SELECT job_id, job_type, table_name, status, error, created_at_unix_ms, \
         updated_at_unix_ms FROM async_jobs ORDER BY job_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(AsyncJobRecord {
            job_id: row.get(0)?,
            job_type: row.get(1)?,
            table_name: row.get(2)?,
            status: JobStatus::parse(&row.get::<_, String>(3)?).unwrap_or(JobStatus::Failed),
            error: row.get(4)?,
            created_at_unix_ms: row.get(5)?,
            updated_at_unix_ms: row.get(6)?,
        })
    })?;
    rows.collect()
}

fn now_unix_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(u64::MAX as u128) as u64,
        Err(_) => 0,
    }
}

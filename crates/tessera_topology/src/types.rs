//! Catalog record types.
//!
//! The catalog is a flat relational model keyed by plain identifiers.
//! Records never hold references to each other; joins happen by key at
//! read time so mutation stays local and snapshots stay cheap.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Draining,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Draining => "draining",
            NodeStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(NodeStatus::Active),
            "draining" => Some(NodeStatus::Draining),
            "failed" => Some(NodeStatus::Failed),
            _ => None,
        }
    }
}

/// One storage node in the cluster roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNodeRecord {
    pub node_id: String,
    pub status: NodeStatus,
    pub capacity_used: u64,
    pub last_error: Option<String>,
}

/// Table metadata.
///
/// The hash algorithm and version are pinned at creation time so a future
/// change to the router's hash cannot silently remap existing rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub table_name: String,
    pub pk_column: String,
    pub pk_type: String,
    pub shard_key: String,
    pub num_shards: u32,
    pub block_size: u64,
    pub resharding: bool,
    pub hash_algorithm: String,
    pub hash_version: u32,
    pub created_at_unix_ms: u64,
}

/// One logical-shard → physical-node assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableShardRecord {
    pub table_name: String,
    pub shard_id: u32,
    pub node_id: String,
}

/// Kind of a virtual secondary index. Only equality lookups are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Hash,
    Unique,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Hash => "hash",
            IndexKind::Unique => "unique",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hash" => Some(IndexKind::Hash),
            "unique" => Some(IndexKind::Unique),
            _ => None,
        }
    }
}

/// Lifecycle state of a virtual index. Only `Ready` participates in planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Building,
    Ready,
    Failed,
    Rebuilding,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Building => "building",
            IndexStatus::Ready => "ready",
            IndexStatus::Failed => "failed",
            IndexStatus::Rebuilding => "rebuilding",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "building" => Some(IndexStatus::Building),
            "ready" => Some(IndexStatus::Ready),
            "failed" => Some(IndexStatus::Failed),
            "rebuilding" => Some(IndexStatus::Rebuilding),
            _ => None,
        }
    }

    /// Legal lifecycle transitions.
    pub fn can_transition_to(self, next: IndexStatus) -> bool {
        matches!(
            (self, next),
            (IndexStatus::Building, IndexStatus::Ready)
                | (IndexStatus::Building, IndexStatus::Failed)
                | (IndexStatus::Ready, IndexStatus::Rebuilding)
                | (IndexStatus::Rebuilding, IndexStatus::Ready)
                | (IndexStatus::Rebuilding, IndexStatus::Failed)
        )
    }
}

/// Definition of one virtual index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualIndexRecord {
    pub index_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub kind: IndexKind,
    pub status: IndexStatus,
    pub error_message: Option<String>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

/// One key's shard set. Absent entries mean no shard holds the key; the
/// set is never stored empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualIndexEntryRecord {
    pub index_name: String,
    pub key_value: String,
    pub shard_ids: Vec<u32>,
}

/// Upsert payload for [`crate::Topology::batch_upsert_index_entries`].
/// An empty `shard_ids` deletes the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntryUpsert {
    pub key_value: String,
    pub shard_ids: Vec<u32>,
}

/// Direction of a single-entry index delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexDeltaOp {
    Add,
    Remove,
}

/// Lifecycle state of an asynchronous catalog job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One row in the async-job log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncJobRecord {
    pub job_id: i64,
    pub job_type: String,
    pub table_name: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

/// New-table payload for [`crate::Topology::update_topology`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub table_name: String,
    pub pk_column: String,
    pub pk_type: String,
    /// Defaults to the primary key when absent.
    pub shard_key: Option<String>,
    pub num_shards: u32,
    pub block_size: u64,
}

/// In-place metadata update for an existing table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableUpdate {
    pub table_name: String,
    pub resharding: Option<bool>,
    pub block_size: Option<u64>,
    pub renamed_to: Option<String>,
}

/// Batch of table-metadata changes applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyDelta {
    pub add: Vec<TableSpec>,
    pub update: Vec<TableUpdate>,
    pub remove: Vec<String>,
}

/// Routing view of the catalog used by the planner. Entries are looked up
/// point-wise through the store instead of being copied into snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot {
    pub version: u64,
    pub nodes: Vec<StorageNodeRecord>,
    pub tables: Vec<TableRecord>,
    pub table_shards: Vec<TableShardRecord>,
    pub virtual_indexes: Vec<VirtualIndexRecord>,
}

impl TopologySnapshot {
    pub fn table(&self, name: &str) -> Option<&TableRecord> {
        self.tables.iter().find(|t| t.table_name == name)
    }

    /// Shard assignments for one table, sorted by shard id.
    pub fn shards_of(&self, table: &str) -> Vec<&TableShardRecord> {
        let mut shards: Vec<&TableShardRecord> = self
            .table_shards
            .iter()
            .filter(|s| s.table_name == table)
            .collect();
        shards.sort_by_key(|s| s.shard_id);
        shards
    }

    /// Ready indexes on one table.
    pub fn ready_indexes_of(&self, table: &str) -> Vec<&VirtualIndexRecord> {
        self.virtual_indexes
            .iter()
            .filter(|i| i.table_name == table && i.status == IndexStatus::Ready)
            .collect()
    }

    /// All indexes on one table regardless of status (writes must maintain
    /// building indexes too, or the backfill races with concurrent writes).
    pub fn indexes_of(&self, table: &str) -> Vec<&VirtualIndexRecord> {
        self.virtual_indexes
            .iter()
            .filter(|i| i.table_name == table)
            .collect()
    }
}

/// Full catalog dump, the `get_topology` contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyCatalog {
    pub version: u64,
    pub nodes: Vec<StorageNodeRecord>,
    pub tables: Vec<TableRecord>,
    pub table_shards: Vec<TableShardRecord>,
    pub virtual_indexes: Vec<VirtualIndexRecord>,
    pub virtual_index_entries: Vec<VirtualIndexEntryRecord>,
    pub async_jobs: Vec<AsyncJobRecord>,
}

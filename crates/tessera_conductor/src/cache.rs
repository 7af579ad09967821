//! Process-local caches.
//!
//! All three caches are advisory: correctness never depends on a hit.
//! The topology cache is keyed by the catalog's monotonic version, so a
//! mutation committed by any writer is picked up on the next read; the
//! statement and result caches are invalidated per table by DDL and
//! writes.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use tessera_topology::{Topology, TopologySnapshot};

use crate::error::Result;
use crate::merge::MergedResult;
use crate::sql::ast::Statement;
use crate::sql::{parse_statement, ParseFailure};

/// Version-checked snapshot cache over the catalog.
pub struct TopologyCache {
    topology: Arc<Topology>,
    cached: Mutex<Option<Arc<TopologySnapshot>>>,
}

impl TopologyCache {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self {
            topology,
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached snapshot when its version still matches the
    /// catalog, re-reading otherwise.
    pub async fn snapshot(&self) -> Result<Arc<TopologySnapshot>> {
        let current_version = self.topology.version()?;
        let mut guard = self.cached.lock().await;
        if let Some(snapshot) = guard.as_ref() {
            if snapshot.version == current_version {
                return Ok(snapshot.clone());
            }
            debug!(
                cached_version = snapshot.version,
                current_version, "topology cache stale; re-reading"
            );
        }
        let fresh = Arc::new(self.topology.snapshot()?);
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drops the cached snapshot (same-process DDL path).
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

/// Parse cache keyed by statement text.
#[derive(Default)]
pub struct StatementCache {
    entries: Mutex<HashMap<String, Arc<Statement>>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_parse(
        &self,
        sql: &str,
    ) -> std::result::Result<Arc<Statement>, ParseFailure> {
        {
            let entries = self.entries.lock().await;
            if let Some(statement) = entries.get(sql) {
                return Ok(statement.clone());
            }
        }
        let statement = Arc::new(parse_statement(sql)?);
        self.entries
            .lock()
            .await
            .insert(sql.to_string(), statement.clone());
        Ok(statement)
    }

    /// Drops cached statements that touch `table`.
    pub async fn invalidate_table(&self, table: &str) {
        self.entries
            .lock()
            .await
            .retain(|_, statement| statement.table_name() != Some(table));
    }
}

/// One cached SELECT result with its dependency footprint.
#[derive(Debug, Clone)]
struct CachedResult {
    table: String,
    shard_ids: BTreeSet<u32>,
    columns: BTreeSet<String>,
    merged: MergedResult,
}

const RESULT_CACHE_CAPACITY: usize = 256;

/// Read-result cache. A write invalidates every entry whose shard set and
/// dependency columns both intersect the write's.
#[derive(Default)]
pub struct ResultCache {
    entries: Mutex<(HashMap<String, CachedResult>, VecDeque<String>)>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key: the statement text plus the canonical parameter vector.
    pub fn key(sql: &str, params: &[tessera_shard::SqlValue]) -> String {
        let values: Vec<serde_json::Value> =
            params.iter().map(tessera_shard::SqlValue::to_json).collect();
        format!("{sql}\u{1}{}", serde_json::Value::Array(values))
    }

    pub async fn get(&self, key: &str) -> Option<MergedResult> {
        let entries = self.entries.lock().await;
        entries.0.get(key).map(|entry| entry.merged.clone())
    }

    pub async fn put(
        &self,
        key: String,
        table: String,
        shard_ids: BTreeSet<u32>,
        columns: BTreeSet<String>,
        merged: MergedResult,
    ) {
        let mut entries = self.entries.lock().await;
        let (map, order) = &mut *entries;
        while map.len() >= RESULT_CACHE_CAPACITY {
            match order.pop_front() {
                Some(evicted) => {
                    map.remove(&evicted);
                }
                None => break,
            }
        }
        if map
            .insert(
                key.clone(),
                CachedResult {
                    table,
                    shard_ids,
                    columns,
                    merged,
                },
            )
            .is_none()
        {
            order.push_back(key);
        }
    }

    /// Write-path invalidation: an entry dies when it reads the written
    /// table, overlaps the written shards, and depends on a written
    /// column. An entry with no recorded columns (wildcard projection)
    /// depends on everything.
    pub async fn invalidate_write(
        &self,
        table: &str,
        shard_ids: &BTreeSet<u32>,
        columns: &BTreeSet<String>,
    ) {
        let mut entries = self.entries.lock().await;
        let (map, order) = &mut *entries;
        map.retain(|_, entry| {
            let column_overlap =
                entry.columns.is_empty() || !entry.columns.is_disjoint(columns);
            let overlaps = entry.table == table
                && !entry.shard_ids.is_disjoint(shard_ids)
                && column_overlap;
            !overlaps
        });
        order.retain(|key| map.contains_key(key));
    }

    /// Membership-changing writes (INSERT/DELETE): every entry of the
    /// table overlapping the written shards is stale, whatever it reads.
    pub async fn invalidate_table_shards(&self, table: &str, shard_ids: &BTreeSet<u32>) {
        let mut entries = self.entries.lock().await;
        let (map, order) = &mut *entries;
        map.retain(|_, entry| {
            !(entry.table == table && !entry.shard_ids.is_disjoint(shard_ids))
        });
        order.retain(|key| map.contains_key(key));
    }

    /// DDL invalidation: everything touching the table goes.
    pub async fn invalidate_table(&self, table: &str) {
        let mut entries = self.entries.lock().await;
        let (map, order) = &mut *entries;
        map.retain(|_, entry| entry.table != table);
        order.retain(|key| map.contains_key(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_shard::SqlValue;
    use tessera_topology::{TableSpec, TopologyDelta};

    #[tokio::test]
    async fn topology_cache_follows_the_catalog_version() {
        let topology = Arc::new(Topology::open_in_memory().expect("open"));
        topology.create(1).expect("create");
        let cache = TopologyCache::new(topology.clone());

        let first = cache.snapshot().await.expect("snapshot");
        let again = cache.snapshot().await.expect("snapshot");
        assert!(Arc::ptr_eq(&first, &again));

        topology
            .update_topology(TopologyDelta {
                add: vec![TableSpec {
                    table_name: "users".to_string(),
                    pk_column: "id".to_string(),
                    pk_type: "INTEGER".to_string(),
                    shard_key: None,
                    num_shards: 1,
                    block_size: 1000,
                }],
                ..Default::default()
            })
            .expect("add table");

        let fresh = cache.snapshot().await.expect("snapshot");
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(fresh.table("users").is_some());
    }

    #[tokio::test]
    async fn statement_cache_invalidates_per_table() {
        let cache = StatementCache::new();
        let a = cache
            .get_or_parse("SELECT * FROM users")
            .await
            .expect("parse");
        let b = cache
            .get_or_parse("SELECT * FROM users")
            .await
            .expect("parse");
        assert!(Arc::ptr_eq(&a, &b));

        cache.invalidate_table("users").await;
        let c = cache
            .get_or_parse("SELECT * FROM users")
            .await
            .expect("parse");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn result_cache_invalidation_needs_shard_and_column_overlap() {
        let cache = ResultCache::new();
        let key = ResultCache::key("SELECT * FROM users WHERE email = ?", &[SqlValue::from("a")]);
        cache
            .put(
                key.clone(),
                "users".to_string(),
                BTreeSet::from([0, 1]),
                BTreeSet::from(["email".to_string()]),
                MergedResult::default(),
            )
            .await;

        // disjoint shards: survives
        cache
            .invalidate_write(
                "users",
                &BTreeSet::from([2]),
                &BTreeSet::from(["email".to_string()]),
            )
            .await;
        assert!(cache.get(&key).await.is_some());

        // disjoint columns: survives
        cache
            .invalidate_write(
                "users",
                &BTreeSet::from([0]),
                &BTreeSet::from(["age".to_string()]),
            )
            .await;
        assert!(cache.get(&key).await.is_some());

        // overlap on both: evicted
        cache
            .invalidate_write(
                "users",
                &BTreeSet::from([1]),
                &BTreeSet::from(["email".to_string()]),
            )
            .await;
        assert!(cache.get(&key).await.is_none());
    }
}

//! Parallel shard fan-out.
//!
//! The target set is partitioned into batches of at most
//! [`ExecutorConfig::max_parallel`] calls; batches run sequentially and
//! calls within a batch run concurrently. Read batches fail fast: the
//! first failure cancels the rest of the batch, since dropping a read has
//! no side effects. Write batches always run to completion (an in-flight
//! write may already have landed) and aggregate every failure into one
//! `partial_write` report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{join_all, try_join_all};
use tracing::warn;

use tessera_shard::{ShardClient, ShardResult, ShardStatement};

use crate::error::{ConductorError, Result, ShardFailure};
use crate::planner::ShardLocation;

/// Fan-out policy.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum concurrent shard calls per batch. The default of 7 honors
    /// hosting environments that cap concurrent subrequests.
    pub max_parallel: usize,
    /// Per-call timeout.
    pub statement_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 7,
            statement_timeout: Duration::from_secs(30),
        }
    }
}

/// One shard's work item: a statement batch executed atomically on the node.
#[derive(Debug, Clone)]
pub struct ShardCall {
    pub location: ShardLocation,
    pub statements: Vec<ShardStatement>,
}

/// Per-shard observability record surfaced as `shard_stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShardQueryStats {
    pub shard_id: u32,
    pub node_id: String,
    pub rows_returned: u64,
    pub rows_affected: u64,
    pub duration_ms: u64,
}

/// One shard's completed call.
#[derive(Debug, Clone)]
pub struct ShardOutcome {
    pub location: ShardLocation,
    pub results: Vec<ShardResult>,
    pub stats: ShardQueryStats,
}

/// Errors a fan-out may tolerate per shard instead of failing the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTolerance {
    None,
    /// Idempotent DDL: "already exists" class errors count as success, so
    /// re-running bootstrap DDL over a partially created cluster converges.
    IdempotentDdl,
}

/// Classifies per-shard errors that idempotent DDL re-runs may ignore.
fn is_idempotent_ddl_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("already exists")
        || lower.contains("duplicate column")
        || lower.contains("no such table")
        || lower.contains("no such index")
}

/// Executes calls against their nodes, preserving call order in the output.
pub async fn execute_calls(
    calls: Vec<ShardCall>,
    clients: &BTreeMap<String, Arc<dyn ShardClient>>,
    config: &ExecutorConfig,
    read_path: bool,
    tolerance: ErrorTolerance,
) -> Result<Vec<ShardOutcome>> {
    let mut outcomes = Vec::with_capacity(calls.len());
    let mut failures: Vec<ShardFailure> = Vec::new();
    let mut any_success = false;

    for batch in calls.chunks(config.max_parallel.max(1)) {
        if read_path {
            let settled = try_join_all(
                batch
                    .iter()
                    .map(|call| run_call(call.clone(), clients, config, tolerance)),
            )
            .await;
            match settled {
                Ok(batch_outcomes) => outcomes.extend(batch_outcomes),
                Err(failure) => {
                    return Err(ConductorError::ShardExecution {
                        failures: vec![failure],
                        partial_write: false,
                    })
                }
            }
        } else {
            let settled = join_all(
                batch
                    .iter()
                    .map(|call| run_call(call.clone(), clients, config, tolerance)),
            )
            .await;
            for result in settled {
                match result {
                    Ok(outcome) => {
                        any_success = true;
                        outcomes.push(outcome);
                    }
                    Err(failure) => failures.push(failure),
                }
            }
        }
    }

    if !failures.is_empty() {
        for failure in &failures {
            warn!(
                shard_id = failure.shard_id,
                node_id = %failure.node_id,
                error = %failure.message,
                "shard write failed"
            );
        }
        return Err(ConductorError::ShardExecution {
            failures,
            partial_write: any_success,
        });
    }
    Ok(outcomes)
}

async fn run_call(
    call: ShardCall,
    clients: &BTreeMap<String, Arc<dyn ShardClient>>,
    config: &ExecutorConfig,
    tolerance: ErrorTolerance,
) -> std::result::Result<ShardOutcome, ShardFailure> {
    let failure = |message: String| ShardFailure {
        shard_id: call.location.shard_id,
        node_id: call.location.node_id.clone(),
        message,
    };

    let Some(client) = clients.get(&call.location.node_id).cloned() else {
        return Err(failure(format!(
            "no client for node '{}'",
            call.location.node_id
        )));
    };

    let started = Instant::now();
    let executed = tokio::time::timeout(
        config.statement_timeout,
        execute_on_client(client, call.location.shard_id, call.statements.clone()),
    )
    .await;

    let results = match executed {
        Ok(Ok(results)) => results,
        Ok(Err(err)) => {
            let message = err.to_string();
            if tolerance == ErrorTolerance::IdempotentDdl && is_idempotent_ddl_error(&message) {
                vec![ShardResult::default(); call.statements.len()]
            } else {
                return Err(failure(message));
            }
        }
        Err(_) => {
            return Err(failure(format!(
                "shard call timed out after {}ms",
                config.statement_timeout.as_millis()
            )))
        }
    };

    let rows_returned = results.iter().map(|r| r.rows.len() as u64).sum();
    let rows_affected = results.iter().map(|r| r.rows_affected).sum();
    Ok(ShardOutcome {
        stats: ShardQueryStats {
            shard_id: call.location.shard_id,
            node_id: call.location.node_id.clone(),
            rows_returned,
            rows_affected,
            duration_ms: started.elapsed().as_millis().min(u64::MAX as u128) as u64,
        },
        location: call.location,
        results,
    })
}

async fn execute_on_client(
    client: Arc<dyn ShardClient>,
    shard_id: u32,
    statements: Vec<ShardStatement>,
) -> std::result::Result<Vec<ShardResult>, tessera_shard::ShardError> {
    if statements.len() == 1 {
        let mut statements = statements;
        let statement = statements.pop().expect("len checked");
        Ok(vec![client.execute(shard_id, statement).await?])
    } else {
        client.execute_batch(shard_id, statements).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessera_shard::{ShardError, StatementKind};

    /// Test double that records peak concurrency and can fail per node.
    struct ProbeClient {
        node_id: String,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ShardClient for ProbeClient {
        fn node_id(&self) -> &str {
            &self.node_id
        }

        async fn execute(&self, shard_id: u32, statement: ShardStatement) -> Result2<ShardResult> {
            self.execute_batch(shard_id, vec![statement])
                .await
                .map(|mut v| v.pop().unwrap_or_default())
        }

        async fn execute_batch(
            &self,
            _shard_id: u32,
            statements: Vec<ShardStatement>,
        ) -> Result2<Vec<ShardResult>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(ShardError::Unavailable(self.node_id.clone()));
            }
            Ok(vec![ShardResult::default(); statements.len()])
        }
    }

    type Result2<T> = std::result::Result<T, ShardError>;

    fn probe_cluster(
        nodes: usize,
        failing: Option<usize>,
    ) -> (BTreeMap<String, Arc<dyn ShardClient>>, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut clients: BTreeMap<String, Arc<dyn ShardClient>> = BTreeMap::new();
        for i in 0..nodes {
            let node_id = format!("node-{i}");
            clients.insert(
                node_id.clone(),
                Arc::new(ProbeClient {
                    node_id,
                    active: active.clone(),
                    peak: peak.clone(),
                    fail: failing == Some(i),
                }),
            );
        }
        (clients, peak)
    }

    fn calls(count: usize) -> Vec<ShardCall> {
        (0..count)
            .map(|i| ShardCall {
                location: ShardLocation {
                    shard_id: i as u32,
                    node_id: format!("node-{i}"),
                },
                statements: vec![ShardStatement::new(
                    "SELECT 1",
                    Vec::new(),
                    StatementKind::Read,
                )],
            })
            .collect()
    }

    #[tokio::test]
    async fn batches_cap_concurrency() {
        let (clients, peak) = probe_cluster(20, None);
        let config = ExecutorConfig::default();
        let outcomes = execute_calls(calls(20), &clients, &config, true, ErrorTolerance::None)
            .await
            .expect("execute");
        assert_eq!(outcomes.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 7);
        // outcomes preserve call order for deterministic merging
        let shard_ids: Vec<u32> = outcomes.iter().map(|o| o.location.shard_id).collect();
        assert_eq!(shard_ids, (0..20).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn write_batches_attempt_all_and_report_partial_write() {
        let (clients, _) = probe_cluster(3, Some(1));
        let config = ExecutorConfig::default();
        let err = execute_calls(calls(3), &clients, &config, false, ErrorTolerance::None)
            .await
            .expect_err("must fail");
        let ConductorError::ShardExecution {
            failures,
            partial_write,
        } = err
        else {
            panic!("expected shard execution error");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].node_id, "node-1");
        assert!(partial_write);
    }

    #[tokio::test]
    async fn read_failure_fails_the_query_without_partial_write() {
        let (clients, _) = probe_cluster(3, Some(2));
        let config = ExecutorConfig::default();
        let err = execute_calls(calls(3), &clients, &config, true, ErrorTolerance::None)
            .await
            .expect_err("must fail");
        let ConductorError::ShardExecution { partial_write, .. } = err else {
            panic!("expected shard execution error");
        };
        assert!(!partial_write);
    }

    #[tokio::test]
    async fn missing_client_is_a_shard_failure() {
        let (clients, _) = probe_cluster(1, None);
        let config = ExecutorConfig::default();
        let mut stray = calls(1);
        stray[0].location.node_id = "node-9".to_string();
        let err = execute_calls(stray, &clients, &config, true, ErrorTolerance::None)
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("node-9"));
    }

    #[test]
    fn idempotent_ddl_classifier() {
        assert!(is_idempotent_ddl_error("table users already exists"));
        assert!(is_idempotent_ddl_error("no such table: users"));
        assert!(!is_idempotent_ddl_error("disk I/O error"));
    }
}

//! End-to-end routing scenarios over an in-process cluster: one catalog,
//! SQLite-backed nodes, and the in-memory maintenance queue drained
//! explicitly where a scenario depends on index state.

use anyhow::{Context, Result};
use tessera_conductor::{ConductorConfig, LocalCluster, QueryOutcome};
use tessera_shard::SqlValue;
use tessera_topology::{IndexStatus, JobStatus};

fn config(shards: u32) -> ConductorConfig {
    ConductorConfig {
        default_num_shards: shards,
        ..ConductorConfig::default()
    }
}

fn cluster(nodes: usize, shards: u32) -> LocalCluster {
    LocalCluster::bootstrap(nodes, config(shards)).expect("bootstrap cluster")
}

async fn exec(cluster: &LocalCluster, sql: &str, params: Vec<SqlValue>) -> Result<QueryOutcome> {
    cluster
        .conductor
        .execute(sql, params)
        .await
        .with_context(|| format!("execute: {sql}"))
}

async fn seed_users(cluster: &LocalCluster, rows: &[(i64, &str)]) -> Result<()> {
    exec(
        cluster,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)",
        Vec::new(),
    )
    .await?;
    for (id, email) in rows {
        let email_value = if email.is_empty() {
            SqlValue::Null
        } else {
            SqlValue::from(*email)
        };
        exec(
            cluster,
            "INSERT INTO users (id, email) VALUES (?, ?)",
            vec![SqlValue::Integer(*id), email_value],
        )
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn build_index_on_populated_table() -> Result<()> {
    let cluster = cluster(3, 3);
    seed_users(
        &cluster,
        &[
            (1, "alice@example.com"),
            (2, "bob@example.com"),
            (3, "charlie@example.com"),
        ],
    )
    .await?;

    exec(&cluster, "CREATE INDEX idx_email ON users (email)", Vec::new()).await?;
    cluster.drain_maintenance().await;

    let catalog = cluster.topology.get_topology()?;
    assert_eq!(catalog.virtual_indexes.len(), 1);
    let index = &catalog.virtual_indexes[0];
    assert_eq!(index.status, IndexStatus::Ready);
    assert_eq!(index.error_message, None);

    assert_eq!(catalog.virtual_index_entries.len(), 3);
    for entry in &catalog.virtual_index_entries {
        assert_eq!(entry.shard_ids.len(), 1, "one shard per email");
    }
    let jobs = cluster.topology.list_jobs()?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn null_values_are_never_indexed() -> Result<()> {
    let cluster = cluster(3, 3);
    seed_users(
        &cluster,
        &[(1, "alice@example.com"), (2, "bob@example.com"), (3, "")],
    )
    .await?;

    exec(&cluster, "CREATE INDEX idx_email ON users (email)", Vec::new()).await?;
    cluster.drain_maintenance().await;

    let catalog = cluster.topology.get_topology()?;
    assert_eq!(catalog.virtual_index_entries.len(), 2);
    assert!(catalog
        .virtual_index_entries
        .iter()
        .all(|entry| entry.key_value != "null"));
    Ok(())
}

#[tokio::test]
async fn index_build_on_unknown_column_fails_with_the_column_name() -> Result<()> {
    let cluster = cluster(3, 1);
    exec(
        &cluster,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        Vec::new(),
    )
    .await?;
    exec(
        &cluster,
        "CREATE INDEX idx_bad ON users (nonexistent_column)",
        Vec::new(),
    )
    .await?;
    cluster.drain_maintenance().await;

    let index = cluster
        .topology
        .virtual_index("idx_bad")?
        .context("index should still be cataloged")?;
    assert_eq!(index.status, IndexStatus::Failed);
    let message = index.error_message.context("failure must carry a message")?;
    assert!(
        message.contains("nonexistent_column"),
        "error should name the column: {message}"
    );

    let jobs = cluster.topology.list_jobs()?;
    assert_eq!(jobs[0].status, JobStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn point_lookup_routes_to_one_shard_and_scan_hits_all() -> Result<()> {
    let cluster = cluster(2, 1);
    seed_users(&cluster, &[(100, "a@example.com"), (200, "b@example.com")]).await?;

    let point = exec(&cluster, "SELECT * FROM users WHERE id = 100", Vec::new()).await?;
    assert_eq!(point.rows.len(), 1);
    assert_eq!(point.rows[0]["id"], SqlValue::Integer(100));
    assert_eq!(point.shard_stats.as_ref().map(Vec::len), Some(1));

    let scan = exec(&cluster, "SELECT * FROM users", Vec::new()).await?;
    assert_eq!(scan.rows.len(), 2);
    Ok(())
}

#[tokio::test]
async fn shard_key_resolves_through_the_correct_placeholder() -> Result<()> {
    let cluster = cluster(2, 4);
    exec(
        &cluster,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)",
        Vec::new(),
    )
    .await?;
    exec(
        &cluster,
        "INSERT INTO users (id, name, age) VALUES (?, ?, ?)",
        vec![
            SqlValue::Integer(100),
            SqlValue::from("alice"),
            SqlValue::Integer(30),
        ],
    )
    .await?;
    exec(
        &cluster,
        "INSERT INTO users (id, name, age) VALUES (?, ?, ?)",
        vec![
            SqlValue::Integer(200),
            SqlValue::from("bob"),
            SqlValue::Integer(25),
        ],
    )
    .await?;

    // The shard key binds through the second placeholder, not the first.
    let outcome = exec(
        &cluster,
        "SELECT * FROM users WHERE age > ? AND id = ?",
        vec![SqlValue::Integer(20), SqlValue::Integer(100)],
    )
    .await?;
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(outcome.rows[0]["id"], SqlValue::Integer(100));
    assert_eq!(outcome.shard_stats.as_ref().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn update_rewrites_index_entries() -> Result<()> {
    let cluster = cluster(3, 3);
    seed_users(&cluster, &[(1, "alice@example.com"), (2, "bob@example.com")]).await?;
    exec(&cluster, "CREATE INDEX idx_email ON users (email)", Vec::new()).await?;
    cluster.drain_maintenance().await;

    exec(
        &cluster,
        "UPDATE users SET email = ? WHERE id = ?",
        vec![SqlValue::from("alice2@example.com"), SqlValue::Integer(1)],
    )
    .await?;
    cluster.drain_maintenance().await;

    assert!(cluster
        .topology
        .get_indexed_shards("idx_email", "alice@example.com")?
        .is_empty());
    let new_shards = cluster
        .topology
        .get_indexed_shards("idx_email", "alice2@example.com")?;
    assert_eq!(new_shards.len(), 1);
    let bob_shards = cluster
        .topology
        .get_indexed_shards("idx_email", "bob@example.com")?;
    assert_eq!(bob_shards.len(), 1);
    Ok(())
}

#[tokio::test]
async fn shared_key_update_keeps_the_other_shards_entry() -> Result<()> {
    let cluster = cluster(2, 2);
    // ids 1 and 2 hash to different shards under two shards
    seed_users(&cluster, &[(1, "shared@example.com"), (2, "shared@example.com")]).await?;
    exec(&cluster, "CREATE INDEX idx_email ON users (email)", Vec::new()).await?;
    cluster.drain_maintenance().await;
    assert_eq!(
        cluster
            .topology
            .get_indexed_shards("idx_email", "shared@example.com")?
            .len(),
        2
    );

    exec(
        &cluster,
        "UPDATE users SET email = ? WHERE id = ?",
        vec![SqlValue::from("new@example.com"), SqlValue::Integer(1)],
    )
    .await?;
    cluster.drain_maintenance().await;

    // row 2 still holds the shared value on its own shard
    let shared = cluster
        .topology
        .get_indexed_shards("idx_email", "shared@example.com")?;
    assert_eq!(shared.len(), 1);
    let fresh = cluster
        .topology
        .get_indexed_shards("idx_email", "new@example.com")?;
    assert_eq!(fresh.len(), 1);
    assert_ne!(shared, fresh);
    Ok(())
}

#[tokio::test]
async fn ready_index_narrows_the_read_and_reads_stay_correct() -> Result<()> {
    let cluster = cluster(2, 4);
    seed_users(
        &cluster,
        &[
            (1, "a@example.com"),
            (2, "b@example.com"),
            (3, "c@example.com"),
            (4, "d@example.com"),
        ],
    )
    .await?;

    // Without an index the email predicate fans out to all four shards.
    let before = exec(
        &cluster,
        "SELECT * FROM users WHERE email = ?",
        vec![SqlValue::from("a@example.com")],
    )
    .await?;
    assert_eq!(before.rows.len(), 1);
    assert_eq!(before.shard_stats.as_ref().map(Vec::len), Some(4));

    exec(&cluster, "CREATE INDEX idx_email ON users (email)", Vec::new()).await?;
    cluster.drain_maintenance().await;

    let after = exec(
        &cluster,
        "SELECT * FROM users WHERE email = ?",
        vec![SqlValue::from("a@example.com")],
    )
    .await?;
    assert_eq!(after.rows.len(), 1);
    assert_eq!(after.shard_stats.as_ref().map(Vec::len), Some(1));

    // An absent key plans zero shards and returns an empty result.
    let missing = exec(
        &cluster,
        "SELECT * FROM users WHERE email = ?",
        vec![SqlValue::from("nobody@example.com")],
    )
    .await?;
    assert!(missing.rows.is_empty());
    assert_eq!(missing.shard_stats.as_ref().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn aggregates_merge_like_the_union() -> Result<()> {
    let cluster = cluster(2, 4);
    exec(
        &cluster,
        "CREATE TABLE readings (id INTEGER PRIMARY KEY, value INTEGER)",
        Vec::new(),
    )
    .await?;
    let values: Vec<(i64, i64)> = (1..=20).map(|id| (id, id * 10)).collect();
    for (id, value) in &values {
        exec(
            &cluster,
            "INSERT INTO readings (id, value) VALUES (?, ?)",
            vec![SqlValue::Integer(*id), SqlValue::Integer(*value)],
        )
        .await?;
    }

    let outcome = exec(
        &cluster,
        "SELECT COUNT(*), SUM(value), MIN(value), MAX(value), AVG(value) FROM readings",
        Vec::new(),
    )
    .await?;
    assert_eq!(outcome.rows.len(), 1);
    let row = &outcome.rows[0];
    assert_eq!(row["COUNT(*)"], SqlValue::Integer(20));
    assert_eq!(row["SUM(value)"], SqlValue::Integer(2100));
    assert_eq!(row["MIN(value)"], SqlValue::Integer(10));
    assert_eq!(row["MAX(value)"], SqlValue::Integer(200));
    // AVG merges as the mean of per-shard means, which is approximate
    // when shard cardinalities differ; it still lands inside the range.
    let SqlValue::Real(avg) = row["AVG(value)"] else {
        panic!("AVG should merge to a real");
    };
    assert!((10.0..=200.0).contains(&avg));
    Ok(())
}

#[tokio::test]
async fn group_by_merges_groups_across_shards() -> Result<()> {
    let cluster = cluster(2, 4);
    exec(
        &cluster,
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, status TEXT)",
        Vec::new(),
    )
    .await?;
    for (id, status) in [
        (1, "open"),
        (2, "open"),
        (3, "shipped"),
        (4, "open"),
        (5, "shipped"),
        (6, "void"),
    ] {
        exec(
            &cluster,
            "INSERT INTO orders (id, status) VALUES (?, ?)",
            vec![SqlValue::Integer(id), SqlValue::from(status)],
        )
        .await?;
    }

    let outcome = exec(
        &cluster,
        "SELECT status, COUNT(*) FROM orders GROUP BY status",
        Vec::new(),
    )
    .await?;
    let mut counts: Vec<(String, i64)> = outcome
        .rows
        .iter()
        .map(|row| {
            let SqlValue::Text(status) = &row["status"] else {
                panic!("status should be text");
            };
            let SqlValue::Integer(count) = row["COUNT(*)"] else {
                panic!("count should be an integer");
            };
            (status.clone(), count)
        })
        .collect();
    counts.sort();
    assert_eq!(
        counts,
        vec![
            ("open".to_string(), 3),
            ("shipped".to_string(), 2),
            ("void".to_string(), 1),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn virtual_shard_is_hidden_unless_projected() -> Result<()> {
    let cluster = cluster(1, 2);
    seed_users(&cluster, &[(1, "a@example.com")]).await?;

    let hidden = exec(&cluster, "SELECT * FROM users WHERE id = 1", Vec::new()).await?;
    assert!(!hidden.rows[0].contains_key("_virtualShard"));

    let projected = exec(
        &cluster,
        "SELECT id, _virtualShard FROM users WHERE id = 1",
        Vec::new(),
    )
    .await?;
    assert!(projected.rows[0].contains_key("_virtualShard"));
    Ok(())
}

#[tokio::test]
async fn resharding_writes_pin_rows_to_their_logical_shard() -> Result<()> {
    let cluster = cluster(2, 2);
    exec(
        &cluster,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)",
        Vec::new(),
    )
    .await?;
    cluster.topology.update_topology(tessera_topology::TopologyDelta {
        update: vec![tessera_topology::TableUpdate {
            table_name: "users".to_string(),
            resharding: Some(true),
            ..Default::default()
        }],
        ..Default::default()
    })?;

    exec(
        &cluster,
        "INSERT INTO users (id, email) VALUES (?, ?)",
        vec![SqlValue::Integer(1), SqlValue::from("a@example.com")],
    )
    .await?;

    let outcome = exec(
        &cluster,
        "SELECT id, email, _virtualShard FROM users WHERE id = ?",
        vec![SqlValue::Integer(1)],
    )
    .await?;
    assert_eq!(outcome.rows.len(), 1);
    // the injected column carries the logical shard id, not the default
    let SqlValue::Integer(virtual_shard) = outcome.rows[0]["_virtualShard"] else {
        panic!("_virtualShard should be an integer");
    };
    assert!(virtual_shard >= 0);

    let update = exec(
        &cluster,
        "UPDATE users SET email = ? WHERE id = ?",
        vec![SqlValue::from("b@example.com"), SqlValue::Integer(1)],
    )
    .await?;
    assert_eq!(update.rows_affected, 1);
    Ok(())
}

#[tokio::test]
async fn delete_returns_summed_rows_affected_and_maintains_the_index() -> Result<()> {
    let cluster = cluster(2, 2);
    seed_users(
        &cluster,
        &[(1, "a@example.com"), (2, "b@example.com"), (3, "c@example.com")],
    )
    .await?;
    exec(&cluster, "CREATE INDEX idx_email ON users (email)", Vec::new()).await?;
    cluster.drain_maintenance().await;

    let outcome = exec(&cluster, "DELETE FROM users WHERE id > 0", Vec::new()).await?;
    assert_eq!(outcome.rows_affected, 3);
    cluster.drain_maintenance().await;

    let catalog = cluster.topology.get_topology()?;
    assert!(catalog.virtual_index_entries.is_empty());
    Ok(())
}

#[tokio::test]
async fn ddl_lifecycle_register_rename_drop() -> Result<()> {
    let cluster = cluster(2, 2);
    exec(
        &cluster,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)",
        Vec::new(),
    )
    .await?;
    // shard map covers [0, num_shards) on active nodes
    let catalog = cluster.topology.get_topology()?;
    let shard_ids: Vec<u32> = catalog.table_shards.iter().map(|s| s.shard_id).collect();
    assert_eq!(shard_ids, vec![0, 1]);

    // duplicate registration fails, IF NOT EXISTS converges
    assert!(exec(
        &cluster,
        "CREATE TABLE users (id INTEGER PRIMARY KEY)",
        Vec::new()
    )
    .await
    .is_err());
    exec(
        &cluster,
        "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, email TEXT)",
        Vec::new(),
    )
    .await?;

    exec(&cluster, "ALTER TABLE users RENAME TO people", Vec::new()).await?;
    exec(
        &cluster,
        "INSERT INTO people (id, email) VALUES (?, ?)",
        vec![SqlValue::Integer(1), SqlValue::from("a@example.com")],
    )
    .await?;

    exec(&cluster, "DROP TABLE people", Vec::new()).await?;
    assert!(cluster.topology.get_topology()?.tables.is_empty());
    assert!(exec(&cluster, "SELECT * FROM people", Vec::new()).await.is_err());
    // dropping again is an error unless IF EXISTS
    assert!(exec(&cluster, "DROP TABLE people", Vec::new()).await.is_err());
    exec(&cluster, "DROP TABLE IF EXISTS people", Vec::new()).await?;
    Ok(())
}

#[tokio::test]
async fn drop_index_restores_full_fanout() -> Result<()> {
    let cluster = cluster(2, 4);
    seed_users(&cluster, &[(1, "a@example.com")]).await?;
    exec(&cluster, "CREATE INDEX idx_email ON users (email)", Vec::new()).await?;
    cluster.drain_maintenance().await;

    let narrowed = exec(
        &cluster,
        "SELECT * FROM users WHERE email = ?",
        vec![SqlValue::from("a@example.com")],
    )
    .await?;
    assert_eq!(narrowed.shard_stats.as_ref().map(Vec::len), Some(1));

    exec(&cluster, "DROP INDEX idx_email", Vec::new()).await?;
    let widened = exec(
        &cluster,
        "SELECT * FROM users WHERE email = ?",
        vec![SqlValue::from("a@example.com")],
    )
    .await?;
    assert_eq!(widened.shard_stats.as_ref().map(Vec::len), Some(4));
    assert_eq!(widened.rows.len(), 1);
    Ok(())
}

#[tokio::test]
async fn update_returning_surfaces_rows() -> Result<()> {
    let cluster = cluster(1, 1);
    seed_users(&cluster, &[(1, "a@example.com")]).await?;
    let outcome = exec(
        &cluster,
        "UPDATE users SET email = ? WHERE id = ? RETURNING id, email",
        vec![SqlValue::from("b@example.com"), SqlValue::Integer(1)],
    )
    .await?;
    assert_eq!(outcome.rows_affected, 1);
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(outcome.rows[0]["email"], SqlValue::from("b@example.com"));
    Ok(())
}

#[tokio::test]
async fn pragma_fans_out_to_every_node() -> Result<()> {
    let cluster = cluster(3, 1);
    let outcome = exec(&cluster, "PRAGMA journal_mode", Vec::new()).await?;
    assert_eq!(outcome.shard_stats.as_ref().map(Vec::len), Some(3));
    assert_eq!(outcome.rows.len(), 3);
    Ok(())
}

#[tokio::test]
async fn malformed_and_unsupported_sql_fail_typed() -> Result<()> {
    let cluster = cluster(1, 1);
    use tessera_conductor::ConductorError;

    let parse_err = cluster
        .conductor
        .execute("VACUUM", Vec::new())
        .await
        .expect_err("unsupported statement");
    assert!(matches!(parse_err, ConductorError::Parse(_)));

    let token_err = cluster
        .conductor
        .execute("SELECT 'unterminated", Vec::new())
        .await
        .expect_err("unterminated literal");
    assert!(matches!(token_err, ConductorError::Tokenize(_)));

    let schema_err = cluster
        .conductor
        .execute("SELECT * FROM missing_table", Vec::new())
        .await
        .expect_err("unknown table");
    assert!(matches!(schema_err, ConductorError::Schema(_)));

    // INSERT without the shard key cannot be routed
    cluster
        .conductor
        .execute("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)", Vec::new())
        .await?;
    let missing_key = cluster
        .conductor
        .execute(
            "INSERT INTO users (email) VALUES (?)",
            vec![SqlValue::from("a@example.com")],
        )
        .await
        .expect_err("missing shard key");
    assert!(matches!(missing_key, ConductorError::Schema(_)));
    Ok(())
}

#[tokio::test]
async fn insert_then_read_roundtrip_across_many_keys() -> Result<()> {
    let cluster = cluster(3, 5);
    exec(
        &cluster,
        "CREATE TABLE events (id INTEGER PRIMARY KEY, payload TEXT)",
        Vec::new(),
    )
    .await?;
    for id in 0..30i64 {
        exec(
            &cluster,
            "INSERT INTO events (id, payload) VALUES (?, ?)",
            vec![SqlValue::Integer(id), SqlValue::from(format!("payload-{id}"))],
        )
        .await?;
    }

    // every key routes back to the shard that stored it
    for id in 0..30i64 {
        let outcome = exec(
            &cluster,
            "SELECT payload FROM events WHERE id = ?",
            vec![SqlValue::Integer(id)],
        )
        .await?;
        assert_eq!(outcome.rows.len(), 1, "id {id} should round-trip");
        assert_eq!(
            outcome.rows[0]["payload"],
            SqlValue::from(format!("payload-{id}"))
        );
        assert_eq!(outcome.shard_stats.as_ref().map(Vec::len), Some(1));
    }

    let scan = exec(&cluster, "SELECT * FROM events", Vec::new()).await?;
    assert_eq!(scan.rows.len(), 30);
    assert_eq!(scan.shard_stats.as_ref().map(Vec::len), Some(5));
    Ok(())
}

#[tokio::test]
async fn distinct_dedupes_across_shards() -> Result<()> {
    let cluster = cluster(2, 4);
    exec(
        &cluster,
        "CREATE TABLE visits (id INTEGER PRIMARY KEY, country TEXT)",
        Vec::new(),
    )
    .await?;
    for (id, country) in [(1, "de"), (2, "de"), (3, "fr"), (4, "de"), (5, "fr")] {
        exec(
            &cluster,
            "INSERT INTO visits (id, country) VALUES (?, ?)",
            vec![SqlValue::Integer(id), SqlValue::from(country)],
        )
        .await?;
    }
    let outcome = exec(&cluster, "SELECT DISTINCT country FROM visits", Vec::new()).await?;
    assert_eq!(outcome.rows.len(), 2);
    Ok(())
}

//! Cross-shard result merging.
//!
//! Plain SELECTs concatenate rows in shard order and strip the hidden
//! shard column unless the client projected it. Aggregated SELECTs reduce
//! per-shard partials: COUNT and SUM add, MIN and MAX take extrema, and
//! AVG is the mean of per-shard means, an approximation when shard
//! cardinalities differ. GROUP BY merging keys a multimap on the
//! JSON-canonicalized tuple of grouped values.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tessera_shard::{Row, ShardResult, SqlValue};

use crate::planner::{AggregateKind, AggregatePlan, MergeStrategy, VIRTUAL_SHARD_COLUMN};

/// Merged client-facing result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// Merges per-shard results (already in shard order) per the plan's
/// strategy.
pub fn merge_results(strategy: &MergeStrategy, per_shard: &[ShardResult]) -> MergedResult {
    match strategy {
        MergeStrategy::Ddl => MergedResult::default(),
        MergeStrategy::RowsAffected => MergedResult {
            rows_affected: per_shard.iter().map(|r| r.rows_affected).sum(),
            rows: concat_rows(per_shard, true, false),
        },
        MergeStrategy::Rows {
            strip_virtual_shard,
            distinct,
        } => MergedResult {
            rows: concat_rows(per_shard, *strip_virtual_shard, *distinct),
            rows_affected: 0,
        },
        MergeStrategy::Aggregate(plan) => MergedResult {
            rows: merge_aggregates(plan, per_shard),
            rows_affected: 0,
        },
    }
}

fn concat_rows(per_shard: &[ShardResult], strip_virtual_shard: bool, distinct: bool) -> Vec<Row> {
    let mut out = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for result in per_shard {
        for row in &result.rows {
            let mut row = row.clone();
            if strip_virtual_shard {
                row.remove(VIRTUAL_SHARD_COLUMN);
            }
            if distinct {
                let key = row_key(&row);
                if !seen.insert(key) {
                    continue;
                }
            }
            out.push(row);
        }
    }
    out
}

fn row_key(row: &Row) -> String {
    let map: serde_json::Map<String, serde_json::Value> = row
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();
    serde_json::Value::Object(map).to_string()
}

fn merge_aggregates(plan: &AggregatePlan, per_shard: &[ShardResult]) -> Vec<Row> {
    if plan.group_by.is_empty() {
        return vec![reduce_group(
            plan,
            per_shard.iter().flat_map(|r| r.rows.iter()),
        )];
    }

    // Multimap keyed by the grouped tuple, preserving first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<&Row>> = BTreeMap::new();
    for result in per_shard {
        for row in &result.rows {
            let key_values: Vec<serde_json::Value> = plan
                .group_by
                .iter()
                .map(|column| row.get(column).map(SqlValue::to_json).unwrap_or_default())
                .collect();
            let key = serde_json::Value::Array(key_values).to_string();
            let entry = groups.entry(key.clone()).or_default();
            if entry.is_empty() {
                order.push(key);
            }
            entry.push(row);
        }
    }

    order
        .into_iter()
        .map(|key| {
            let rows = groups.remove(&key).unwrap_or_default();
            reduce_group(plan, rows.into_iter())
        })
        .collect()
}

/// Reduces one group's rows into a single output row.
fn reduce_group<'a>(plan: &AggregatePlan, rows: impl Iterator<Item = &'a Row>) -> Row {
    let rows: Vec<&Row> = rows.collect();
    let mut out = Row::new();
    for column in &plan.columns {
        let values = rows
            .iter()
            .filter_map(|row| row.get(&column.name))
            .filter(|v| !v.is_null());
        let merged = match column.aggregate {
            Some(AggregateKind::Count) => {
                let mut total: i64 = 0;
                for value in values {
                    total += integer_of(value).unwrap_or(0);
                }
                SqlValue::Integer(total)
            }
            Some(AggregateKind::Sum) => reduce_sum(values),
            Some(AggregateKind::Min) => reduce_extremum(values, Ordering::Less),
            Some(AggregateKind::Max) => reduce_extremum(values, Ordering::Greater),
            Some(AggregateKind::Avg) => {
                // Mean of the per-shard means; exact only when every shard
                // contributed the same number of rows.
                let mut sum = 0.0;
                let mut count = 0usize;
                for value in values {
                    if let Some(v) = real_of(value) {
                        sum += v;
                        count += 1;
                    }
                }
                if count == 0 {
                    SqlValue::Null
                } else {
                    SqlValue::Real(sum / count as f64)
                }
            }
            // GROUP BY columns and plain expressions flow through from the
            // group's first row.
            None => rows
                .first()
                .and_then(|row| row.get(&column.name))
                .cloned()
                .unwrap_or(SqlValue::Null),
        };
        out.insert(column.name.clone(), merged);
    }
    out
}

fn reduce_sum<'a>(values: impl Iterator<Item = &'a SqlValue>) -> SqlValue {
    let mut acc: Option<SqlValue> = None;
    for value in values {
        acc = Some(match acc {
            None => value.clone(),
            Some(current) => add_values(&current, value),
        });
    }
    // SUM over no rows is NULL, matching the storage engine.
    acc.unwrap_or(SqlValue::Null)
}

fn add_values(a: &SqlValue, b: &SqlValue) -> SqlValue {
    match (a, b) {
        (SqlValue::Integer(x), SqlValue::Integer(y)) => match x.checked_add(*y) {
            Some(sum) => SqlValue::Integer(sum),
            None => SqlValue::Real(*x as f64 + *y as f64),
        },
        _ => match (real_of(a), real_of(b)) {
            (Some(x), Some(y)) => SqlValue::Real(x + y),
            _ => SqlValue::Null,
        },
    }
}

fn reduce_extremum<'a>(
    values: impl Iterator<Item = &'a SqlValue>,
    keep_when: Ordering,
) -> SqlValue {
    let mut best: Option<&SqlValue> = None;
    for value in values {
        best = Some(match best {
            None => value,
            Some(current) => {
                if compare_values(value, current) == keep_when {
                    value
                } else {
                    current
                }
            }
        });
    }
    best.cloned().unwrap_or(SqlValue::Null)
}

/// Orders two values the way the storage engine would: numerics by value,
/// text lexically, mixed kinds by storage-class rank.
fn compare_values(a: &SqlValue, b: &SqlValue) -> Ordering {
    match (real_of(a), real_of(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a, b) {
            (SqlValue::Text(x), SqlValue::Text(y)) => x.cmp(y),
            _ => class_rank(a).cmp(&class_rank(b)),
        },
    }
}

fn class_rank(value: &SqlValue) -> u8 {
    match value {
        SqlValue::Null => 0,
        SqlValue::Integer(_) | SqlValue::Real(_) => 1,
        SqlValue::Text(_) => 2,
        SqlValue::Blob(_) => 3,
    }
}

fn integer_of(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Integer(v) => Some(*v),
        SqlValue::Real(v) => Some(*v as i64),
        _ => None,
    }
}

fn real_of(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::Integer(v) => Some(*v as f64),
        SqlValue::Real(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::MergeColumn;

    fn row(pairs: &[(&str, SqlValue)]) -> Row {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn shard(rows: Vec<Row>) -> ShardResult {
        ShardResult {
            rows,
            rows_affected: 0,
        }
    }

    #[test]
    fn concatenation_strips_the_virtual_shard_column() {
        let per_shard = vec![
            shard(vec![row(&[
                ("id", SqlValue::Integer(1)),
                (VIRTUAL_SHARD_COLUMN, SqlValue::Integer(0)),
            ])]),
            shard(vec![row(&[
                ("id", SqlValue::Integer(2)),
                (VIRTUAL_SHARD_COLUMN, SqlValue::Integer(1)),
            ])]),
        ];
        let merged = merge_results(
            &MergeStrategy::Rows {
                strip_virtual_shard: true,
                distinct: false,
            },
            &per_shard,
        );
        assert_eq!(merged.rows.len(), 2);
        assert!(merged
            .rows
            .iter()
            .all(|r| !r.contains_key(VIRTUAL_SHARD_COLUMN)));
        // shard order is preserved
        assert_eq!(merged.rows[0]["id"], SqlValue::Integer(1));
        assert_eq!(merged.rows[1]["id"], SqlValue::Integer(2));
    }

    #[test]
    fn projected_virtual_shard_survives() {
        let per_shard = vec![shard(vec![row(&[
            ("id", SqlValue::Integer(1)),
            (VIRTUAL_SHARD_COLUMN, SqlValue::Integer(0)),
        ])])];
        let merged = merge_results(
            &MergeStrategy::Rows {
                strip_virtual_shard: false,
                distinct: false,
            },
            &per_shard,
        );
        assert!(merged.rows[0].contains_key(VIRTUAL_SHARD_COLUMN));
    }

    #[test]
    fn distinct_dedupes_across_shards() {
        let per_shard = vec![
            shard(vec![row(&[("email", SqlValue::from("a@x"))])]),
            shard(vec![
                row(&[("email", SqlValue::from("a@x"))]),
                row(&[("email", SqlValue::from("b@x"))]),
            ]),
        ];
        let merged = merge_results(
            &MergeStrategy::Rows {
                strip_virtual_shard: true,
                distinct: true,
            },
            &per_shard,
        );
        assert_eq!(merged.rows.len(), 2);
    }

    #[test]
    fn aggregate_rollup_without_group_by() {
        let plan = AggregatePlan {
            group_by: Vec::new(),
            columns: vec![
                MergeColumn {
                    name: "COUNT(*)".to_string(),
                    aggregate: Some(AggregateKind::Count),
                },
                MergeColumn {
                    name: "SUM(age)".to_string(),
                    aggregate: Some(AggregateKind::Sum),
                },
                MergeColumn {
                    name: "MIN(age)".to_string(),
                    aggregate: Some(AggregateKind::Min),
                },
                MergeColumn {
                    name: "MAX(age)".to_string(),
                    aggregate: Some(AggregateKind::Max),
                },
            ],
        };
        let per_shard = vec![
            shard(vec![row(&[
                ("COUNT(*)", SqlValue::Integer(2)),
                ("SUM(age)", SqlValue::Integer(50)),
                ("MIN(age)", SqlValue::Integer(20)),
                ("MAX(age)", SqlValue::Integer(30)),
            ])]),
            shard(vec![row(&[
                ("COUNT(*)", SqlValue::Integer(1)),
                ("SUM(age)", SqlValue::Integer(40)),
                ("MIN(age)", SqlValue::Integer(40)),
                ("MAX(age)", SqlValue::Integer(40)),
            ])]),
        ];
        let merged = merge_results(&MergeStrategy::Aggregate(plan), &per_shard);
        assert_eq!(merged.rows.len(), 1);
        let out = &merged.rows[0];
        assert_eq!(out["COUNT(*)"], SqlValue::Integer(3));
        assert_eq!(out["SUM(age)"], SqlValue::Integer(90));
        assert_eq!(out["MIN(age)"], SqlValue::Integer(20));
        assert_eq!(out["MAX(age)"], SqlValue::Integer(40));
    }

    #[test]
    fn avg_is_mean_of_shard_means() {
        // Shard means 10 and 30 merge to 20 even though the shards held
        // different row counts; the approximation is the contract.
        let plan = AggregatePlan {
            group_by: Vec::new(),
            columns: vec![MergeColumn {
                name: "AVG(age)".to_string(),
                aggregate: Some(AggregateKind::Avg),
            }],
        };
        let per_shard = vec![
            shard(vec![row(&[("AVG(age)", SqlValue::Real(10.0))])]),
            shard(vec![row(&[("AVG(age)", SqlValue::Real(30.0))])]),
        ];
        let merged = merge_results(&MergeStrategy::Aggregate(plan), &per_shard);
        assert_eq!(merged.rows[0]["AVG(age)"], SqlValue::Real(20.0));
    }

    #[test]
    fn group_by_merges_within_groups_only() {
        let plan = AggregatePlan {
            group_by: vec!["status".to_string()],
            columns: vec![
                MergeColumn {
                    name: "status".to_string(),
                    aggregate: None,
                },
                MergeColumn {
                    name: "COUNT(*)".to_string(),
                    aggregate: Some(AggregateKind::Count),
                },
            ],
        };
        let per_shard = vec![
            shard(vec![
                row(&[
                    ("status", SqlValue::from("active")),
                    ("COUNT(*)", SqlValue::Integer(2)),
                ]),
                row(&[
                    ("status", SqlValue::from("banned")),
                    ("COUNT(*)", SqlValue::Integer(1)),
                ]),
            ]),
            shard(vec![row(&[
                ("status", SqlValue::from("active")),
                ("COUNT(*)", SqlValue::Integer(3)),
            ])]),
        ];
        let merged = merge_results(&MergeStrategy::Aggregate(plan), &per_shard);
        assert_eq!(merged.rows.len(), 2);
        assert_eq!(merged.rows[0]["status"], SqlValue::from("active"));
        assert_eq!(merged.rows[0]["COUNT(*)"], SqlValue::Integer(5));
        assert_eq!(merged.rows[1]["status"], SqlValue::from("banned"));
        assert_eq!(merged.rows[1]["COUNT(*)"], SqlValue::Integer(1));
    }

    #[test]
    fn zero_shard_aggregate_still_produces_a_row() {
        let plan = AggregatePlan {
            group_by: Vec::new(),
            columns: vec![
                MergeColumn {
                    name: "COUNT(*)".to_string(),
                    aggregate: Some(AggregateKind::Count),
                },
                MergeColumn {
                    name: "SUM(age)".to_string(),
                    aggregate: Some(AggregateKind::Sum),
                },
            ],
        };
        let merged = merge_results(&MergeStrategy::Aggregate(plan), &[]);
        assert_eq!(merged.rows.len(), 1);
        assert_eq!(merged.rows[0]["COUNT(*)"], SqlValue::Integer(0));
        assert_eq!(merged.rows[0]["SUM(age)"], SqlValue::Null);
    }

    #[test]
    fn write_merge_sums_rows_affected() {
        let per_shard = vec![
            ShardResult {
                rows: Vec::new(),
                rows_affected: 2,
            },
            ShardResult {
                rows: Vec::new(),
                rows_affected: 3,
            },
        ];
        let merged = merge_results(&MergeStrategy::RowsAffected, &per_shard);
        assert_eq!(merged.rows_affected, 5);
        assert!(merged.rows.is_empty());
    }
}

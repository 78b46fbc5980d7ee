//! Routing planner.
//!
//! Turns a logical table plus optional time ranges into a [`RoutingPlan`]:
//! the per-request fan-out descriptor mapping each backend address to the
//! sub-query it should run. Addresses iterate in lexicographic order, so a
//! plan built from identical metadata is identical — which in turn makes the
//! merger's tie-breaks deterministic.

use std::collections::{BTreeMap, HashSet};

use crate::error::{ShardError, ShardResult};
use crate::meta::{MetaStore, TimeRange};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Parameters of one per-shard sub-query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubQuery {
    pub table_name: String,
    pub file_ids: Vec<String>,
}

/// Address → sub-query mapping for one search request. Every file needed by
/// the query appears under exactly one address.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutingPlan {
    entries: BTreeMap<String, SubQuery>,
}

impl RoutingPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SubQuery)> {
        self.entries.iter()
    }
}

// ---------------------------------------------------------------------------
// Range normalization
// ---------------------------------------------------------------------------

/// Convert wire ranges (pairs of date strings) into the representation the
/// metadata store expects. An empty input means the whole table.
pub fn normalize_ranges(pairs: &[(String, String)]) -> ShardResult<Option<Vec<TimeRange>>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let ranges = pairs
        .iter()
        .map(|(start, end)| TimeRange::parse(start, end))
        .collect::<ShardResult<Vec<_>>>()?;
    Ok(Some(ranges))
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Builds routing plans from metadata-store lookups. Deterministic given
/// identical store state.
pub struct RoutingPlanner {
    meta: std::sync::Arc<dyn MetaStore>,
}

impl RoutingPlanner {
    pub fn new(meta: std::sync::Arc<dyn MetaStore>) -> Self {
        Self { meta }
    }

    /// Resolve `table` into a routing plan. A table whose lookup yields zero
    /// shards produces an empty plan; the caller short-circuits to an empty
    /// result rather than treating it as an error.
    pub async fn plan(
        &self,
        table: &str,
        ranges: Option<&[TimeRange]>,
    ) -> ShardResult<RoutingPlan> {
        let mapping = self.meta.lookup(table, ranges).await?;

        let mut seen_files: HashSet<&str> = HashSet::new();
        for (address, file_ids) in &mapping {
            for file_id in file_ids {
                if !seen_files.insert(file_id.as_str()) {
                    return Err(ShardError::internal(format!(
                        "metadata store listed file '{file_id}' under two addresses \
                         (second: {address})"
                    )));
                }
            }
        }

        let entries = mapping
            .into_iter()
            .filter(|(_, file_ids)| !file_ids.is_empty())
            .map(|(address, file_ids)| {
                (
                    address,
                    SubQuery {
                        table_name: table.to_string(),
                        file_ids,
                    },
                )
            })
            .collect();
        Ok(RoutingPlan { entries })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::MockMetaStore;

    fn planner(store: MockMetaStore) -> RoutingPlanner {
        RoutingPlanner::new(Arc::new(store))
    }

    #[test]
    fn no_ranges_normalizes_to_none() {
        assert_eq!(normalize_ranges(&[]).unwrap(), None);
    }

    #[test]
    fn ranges_normalize_in_order() {
        let pairs = vec![
            ("2019-01-01".to_string(), "2019-02-01".to_string()),
            ("2019-06-01".to_string(), "2019-07-01".to_string()),
        ];
        let ranges = normalize_ranges(&pairs).unwrap().unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], TimeRange::parse("2019-01-01", "2019-02-01").unwrap());
    }

    #[test]
    fn unparsable_range_is_invalid_argument() {
        let pairs = vec![("soon".to_string(), "later".to_string())];
        let err = normalize_ranges(&pairs).unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn plan_is_ordered_by_address() {
        let store = MockMetaStore::default().with_files("t", "http://b:1", &["f-2"]).with_files(
            "t",
            "http://a:1",
            &["f-1"],
        );
        let plan = planner(store).plan("t", None).await.unwrap();
        let addresses: Vec<_> = plan.iter().map(|(a, _)| a.clone()).collect();
        assert_eq!(addresses, vec!["http://a:1", "http://b:1"]);
    }

    #[tokio::test]
    async fn plan_carries_table_and_files() {
        let store = MockMetaStore::default().with_files("t", "http://a:1", &["f-1", "f-2"]);
        let plan = planner(store).plan("t", None).await.unwrap();
        let (_, sub) = plan.iter().next().unwrap();
        assert_eq!(sub.table_name, "t");
        assert_eq!(sub.file_ids, vec!["f-1", "f-2"]);
    }

    #[tokio::test]
    async fn zero_shards_yield_empty_plan() {
        let store = MockMetaStore::default().with_table("t");
        let plan = planner(store).plan("t", None).await.unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn duplicated_file_across_addresses_is_internal() {
        let store = MockMetaStore::default()
            .with_files("t", "http://a:1", &["f-1"])
            .with_files("t", "http://b:1", &["f-1"]);
        let err = planner(store).plan("t", None).await.unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::Internal);
        assert!(err.to_string().contains("f-1"), "error was: {err}");
    }

    #[tokio::test]
    async fn plan_is_deterministic() {
        let store = MockMetaStore::default()
            .with_files("t", "http://a:1", &["f-1"])
            .with_files("t", "http://b:1", &["f-2", "f-3"]);
        let planner = planner(store);
        let first = planner.plan("t", None).await.unwrap();
        let second = planner.plan("t", None).await.unwrap();
        assert_eq!(first, second);
    }
}

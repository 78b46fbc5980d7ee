//! Request handler: the orchestration layer behind the gRPC surface.
//!
//! The search path is the core: validate bounds, resolve the table
//! descriptor (memoized), build the routing plan, fan the sub-queries out,
//! and merge the partials under the table's metric. Everything else is a
//! pass-through to an arbitrary live backend — the middleware presents the
//! cluster as if it were one node.
//!
//! The descriptor cache is process-local and never invalidated here; a
//! DROP followed by CREATE of the same table can therefore serve stale
//! metadata to searches. Administrative operations bypass the cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::backend::{IndexParams, TopKBlock};
use crate::config::MishardConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ShardError, ShardResult};
use crate::merge;
use crate::meta::{MetaStore, TableDescriptor, TimeRange};
use crate::pool::ConnectionPool;
use crate::router::{self, RoutingPlanner};

/// Long-lived service state: one instance per process.
pub struct ServiceHandler {
    meta: Arc<dyn MetaStore>,
    pool: Arc<ConnectionPool>,
    planner: RoutingPlanner,
    dispatcher: Dispatcher,
    descriptors: RwLock<HashMap<String, TableDescriptor>>,
    max_topk: i64,
    max_nprobe: i64,
}

impl ServiceHandler {
    pub fn new(
        config: &MishardConfig,
        meta: Arc<dyn MetaStore>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            planner: RoutingPlanner::new(meta.clone()),
            dispatcher: Dispatcher::new(pool.clone(), config.max_workers),
            meta,
            pool,
            descriptors: RwLock::new(HashMap::new()),
            max_topk: config.max_topk,
            max_nprobe: config.max_nprobe,
        }
    }

    // -----------------------------------------------------------------------
    // Search path
    // -----------------------------------------------------------------------

    /// Run one search across the cluster. Returns exactly one block per
    /// query vector, each at most `topk` rows, ordered by the table metric.
    pub async fn search(
        &self,
        table: &str,
        vectors: Vec<Vec<f32>>,
        topk: i64,
        nprobe: i64,
        ranges: &[(String, String)],
        cancel: CancellationToken,
    ) -> ShardResult<Vec<TopKBlock>> {
        let query_id = Uuid::new_v4();
        let span = tracing::info_span!("search", query_id = %query_id, table = %table);
        self.search_inner(table, vectors, topk, nprobe, ranges, cancel)
            .instrument(span)
            .await
    }

    async fn search_inner(
        &self,
        table: &str,
        vectors: Vec<Vec<f32>>,
        topk: i64,
        nprobe: i64,
        ranges: &[(String, String)],
        cancel: CancellationToken,
    ) -> ShardResult<Vec<TopKBlock>> {
        if topk <= 0 || topk > self.max_topk {
            return Err(ShardError::invalid_argument(format!(
                "invalid topk: {topk} (expected 1..={})",
                self.max_topk
            )));
        }
        if nprobe <= 0 || nprobe > self.max_nprobe {
            return Err(ShardError::invalid_argument(format!(
                "invalid nprobe: {nprobe} (expected 1..={})",
                self.max_nprobe
            )));
        }
        let ranges = router::normalize_ranges(ranges)?;

        let started = Instant::now();
        tracing::info!(
            nq = vectors.len(),
            topk,
            nprobe,
            ranges = ranges.as_ref().map_or(0, |r| r.len()),
            "search received"
        );

        let descriptor = self.table_descriptor(table).await?;

        let nq = vectors.len();
        if nq == 0 {
            return Ok(Vec::new());
        }

        let routing_started = Instant::now();
        let plan = self.planner.plan(table, ranges.as_deref()).await?;
        tracing::debug!(
            shards = plan.len(),
            elapsed_ms = routing_started.elapsed().as_millis() as u64,
            "routing complete"
        );
        if plan.is_empty() {
            return Ok(vec![TopKBlock::new(); nq]);
        }

        let partials = self
            .dispatcher
            .dispatch(&plan, Arc::new(vectors), topk, nprobe, &cancel)
            .await?;

        let merge_started = Instant::now();
        let blocks = merge::merge(&partials, topk as usize, descriptor.metric)?;
        tracing::debug!(
            elapsed_ms = merge_started.elapsed().as_millis() as u64,
            "merge complete"
        );

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search complete"
        );

        if blocks.is_empty() {
            // Every shard answered with no blocks at all.
            return Ok(vec![TopKBlock::new(); nq]);
        }
        if blocks.len() != nq {
            return Err(ShardError::internal(format!(
                "merged {} blocks for {nq} queries",
                blocks.len()
            )));
        }
        Ok(blocks)
    }

    /// Fetch the table descriptor, memoizing it for the life of the
    /// process. Writes are last-writer-wins; entries are never removed.
    async fn table_descriptor(&self, table: &str) -> ShardResult<TableDescriptor> {
        {
            let cached = self.descriptors.read().unwrap();
            if let Some(descriptor) = cached.get(table) {
                return Ok(descriptor.clone());
            }
        }
        let descriptor = self.meta.describe(table).await?;
        self.descriptors
            .write()
            .unwrap()
            .insert(table.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    // -----------------------------------------------------------------------
    // Administrative pass-throughs
    // -----------------------------------------------------------------------

    pub async fn create_table(&self, descriptor: &TableDescriptor) -> ShardResult<()> {
        tracing::info!(table = %descriptor.name, "create table");
        self.pool.any().await?.create_table(descriptor).await
    }

    pub async fn has_table(&self, table: &str) -> ShardResult<bool> {
        self.pool.any().await?.has_table(table).await
    }

    pub async fn drop_table(&self, table: &str) -> ShardResult<()> {
        tracing::info!(table = %table, "drop table");
        self.pool.any().await?.drop_table(table).await
    }

    pub async fn create_index(&self, table: &str, index: IndexParams) -> ShardResult<()> {
        tracing::info!(table = %table, "create index");
        self.pool.any().await?.create_index(table, index).await
    }

    pub async fn insert(
        &self,
        table: &str,
        vectors: &[Vec<f32>],
        row_ids: &[i64],
    ) -> ShardResult<Vec<i64>> {
        self.pool.any().await?.insert(table, vectors, row_ids).await
    }

    /// Administrative describe bypasses the descriptor cache and asks a
    /// backend directly.
    pub async fn describe_table(&self, table: &str) -> ShardResult<TableDescriptor> {
        self.pool.any().await?.describe_table(table).await
    }

    pub async fn count_table(&self, table: &str) -> ShardResult<i64> {
        self.pool.any().await?.count_table(table).await
    }

    pub async fn show_tables(&self) -> ShardResult<Vec<String>> {
        self.pool.any().await?.show_tables().await
    }

    /// `version` is answered by the middleware itself; every other command
    /// passes through.
    pub async fn cmd(&self, cmd: &str) -> ShardResult<String> {
        if cmd == "version" {
            return Ok(format!("mishard {}", crate::VERSION));
        }
        self.pool.any().await?.cmd(cmd).await
    }

    pub async fn delete_by_range(
        &self,
        table: &str,
        start: &str,
        end: &str,
    ) -> ShardResult<()> {
        let range = TimeRange::parse(start, end)?;
        tracing::info!(table = %table, start = %range.start, end = %range.end, "delete by range");
        self.pool.any().await?.delete_by_range(table, &range).await
    }

    pub async fn preload_table(&self, table: &str) -> ShardResult<()> {
        self.pool.any().await?.preload_table(table).await
    }

    pub async fn describe_index(&self, table: &str) -> ShardResult<IndexParams> {
        self.pool.any().await?.describe_index(table).await
    }

    pub async fn drop_index(&self, table: &str) -> ShardResult<()> {
        tracing::info!(table = %table, "drop index");
        self.pool.any().await?.drop_index(table).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResultRow;
    use crate::meta::MetricKind;
    use crate::testing::{MockCluster, MockConnector, MockMetaStore};

    struct Fixture {
        cluster: MockCluster,
        meta: MockMetaStore,
        handler: ServiceHandler,
    }

    fn fixture(meta: MockMetaStore) -> Fixture {
        let cluster = MockCluster::default();
        let config = MishardConfig {
            backends: vec!["http://a:1".to_string()],
            ..MishardConfig::default()
        };
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(MockConnector::new(cluster.clone())),
            &config,
        ));
        let handler = ServiceHandler::new(&config, Arc::new(meta.clone()), pool);
        Fixture {
            cluster,
            meta,
            handler,
        }
    }

    fn two_shard_meta() -> MockMetaStore {
        MockMetaStore::default()
            .with_descriptor("t", 2, MetricKind::L2)
            .with_files("t", "http://a:1", &["f-1"])
            .with_files("t", "http://b:1", &["f-2"])
    }

    fn query() -> Vec<Vec<f32>> {
        vec![vec![0.0, 1.0]]
    }

    async fn run_search(fx: &Fixture, topk: i64, nprobe: i64) -> ShardResult<Vec<TopKBlock>> {
        fx.handler
            .search("t", query(), topk, nprobe, &[], CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn invalid_topk_rejected_before_any_backend_call() {
        let fx = fixture(two_shard_meta());
        for topk in [0, 2049] {
            let err = run_search(&fx, topk, 16).await.unwrap_err();
            assert_eq!(err.code(), crate::pb::ErrorCode::InvalidArgument);
        }
        assert_eq!(fx.cluster.search_calls(), 0);
        assert_eq!(fx.cluster.connect_calls(), 0);
        assert_eq!(fx.meta.describe_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_nprobe_rejected_before_any_backend_call() {
        let fx = fixture(two_shard_meta());
        for nprobe in [0, 2049] {
            let err = run_search(&fx, 10, nprobe).await.unwrap_err();
            assert_eq!(err.code(), crate::pb::ErrorCode::InvalidArgument);
        }
        assert_eq!(fx.cluster.search_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_table_is_not_found() {
        let fx = fixture(MockMetaStore::default());
        let err = run_search(&fx, 10, 16).await.unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn search_merges_partials_across_shards() {
        let fx = fixture(two_shard_meta());
        fx.cluster.set_blocks(
            "http://a:1",
            vec![vec![ResultRow::new(1, 0.2), ResultRow::new(2, 0.8)]],
        );
        fx.cluster.set_blocks(
            "http://b:1",
            vec![vec![ResultRow::new(3, 0.3), ResultRow::new(4, 0.5)]],
        );

        let blocks = run_search(&fx, 2, 16).await.unwrap();
        let ids: Vec<i64> = blocks[0].iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn ip_metric_reverses_merge_order() {
        let meta = MockMetaStore::default()
            .with_descriptor("t", 2, MetricKind::Ip)
            .with_files("t", "http://a:1", &["f-1"])
            .with_files("t", "http://b:1", &["f-2"]);
        let fx = fixture(meta);
        fx.cluster.set_blocks(
            "http://a:1",
            vec![vec![ResultRow::new(1, 0.9), ResultRow::new(2, 0.2)]],
        );
        fx.cluster.set_blocks(
            "http://b:1",
            vec![vec![ResultRow::new(3, 0.7), ResultRow::new(4, 0.1)]],
        );

        let blocks = run_search(&fx, 2, 16).await.unwrap();
        let ids: Vec<i64> = blocks[0].iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn failed_shard_surfaces_unavailable_with_no_rows() {
        let fx = fixture(two_shard_meta());
        fx.cluster
            .set_search_error("http://a:1", ShardError::unavailable("shard a down"));
        fx.cluster
            .set_blocks("http://b:1", vec![vec![ResultRow::new(1, 0.2)]]);

        let err = run_search(&fx, 2, 16).await.unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn descriptor_is_memoized_after_first_lookup() {
        let fx = fixture(two_shard_meta());
        run_search(&fx, 2, 16).await.unwrap();
        run_search(&fx, 2, 16).await.unwrap();
        assert_eq!(fx.meta.describe_calls(), 1);
    }

    #[tokio::test]
    async fn metadata_outage_aborts_with_unavailable() {
        let meta = MockMetaStore::default()
            .with_descriptor("t", 2, MetricKind::L2)
            .with_lookup_error(ShardError::unavailable("metadata store down"));
        let fx = fixture(meta);
        let err = run_search(&fx, 2, 16).await.unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn table_with_zero_shards_yields_empty_blocks() {
        let meta = MockMetaStore::default()
            .with_descriptor("t", 2, MetricKind::L2)
            .with_table("t");
        let fx = fixture(meta);
        let blocks = run_search(&fx, 2, 16).await.unwrap();
        assert_eq!(blocks, vec![TopKBlock::new()]);
        assert_eq!(fx.cluster.search_calls(), 0);
    }

    #[tokio::test]
    async fn empty_query_batch_returns_empty_success() {
        let fx = fixture(two_shard_meta());
        let blocks = fx
            .handler
            .search("t", Vec::new(), 2, 16, &[], CancellationToken::new())
            .await
            .unwrap();
        assert!(blocks.is_empty());
        assert_eq!(fx.cluster.search_calls(), 0);
    }

    #[tokio::test]
    async fn unparsable_range_is_invalid_argument() {
        let fx = fixture(two_shard_meta());
        let ranges = vec![("yesterday".to_string(), "tomorrow".to_string())];
        let err = fx
            .handler
            .search("t", query(), 2, 16, &ranges, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::InvalidArgument);
        assert_eq!(fx.cluster.search_calls(), 0);
    }

    #[tokio::test]
    async fn version_cmd_is_answered_locally() {
        let fx = fixture(two_shard_meta());
        let reply = fx.handler.cmd("version").await.unwrap();
        assert!(reply.starts_with("mishard "), "reply was: {reply}");
        assert!(fx.cluster.ops().is_empty());
    }

    #[tokio::test]
    async fn other_cmds_pass_through_to_a_backend() {
        let fx = fixture(two_shard_meta());
        let reply = fx.handler.cmd("status").await.unwrap();
        assert_eq!(reply, "mock-reply:status");
        assert_eq!(fx.cluster.ops(), vec!["cmd:status"]);
    }

    #[tokio::test]
    async fn admin_describe_bypasses_the_descriptor_cache() {
        let fx = fixture(two_shard_meta());
        fx.cluster.set_descriptor(TableDescriptor {
            name: "t".to_string(),
            dimension: 32,
            index_file_size: 2048,
            metric: MetricKind::Ip,
        });

        // Warm the cache through the search path with the meta store's view.
        run_search(&fx, 2, 16).await.unwrap();

        // The administrative describe must reflect the backend, not the
        // cached search-path descriptor.
        let descriptor = fx.handler.describe_table("t").await.unwrap();
        assert_eq!(descriptor.dimension, 32);
        assert_eq!(descriptor.metric, MetricKind::Ip);
        assert_eq!(fx.meta.describe_calls(), 1);
    }

    #[tokio::test]
    async fn admin_ops_pass_through() {
        let fx = fixture(two_shard_meta());
        fx.handler.preload_table("t").await.unwrap();
        fx.handler.drop_index("t").await.unwrap();
        assert_eq!(fx.cluster.ops(), vec!["preload_table:t", "drop_index:t"]);
    }

    #[tokio::test]
    async fn delete_by_range_validates_dates_first() {
        let fx = fixture(two_shard_meta());
        let err = fx
            .handler
            .delete_by_range("t", "not-a-date", "2019-01-01")
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::InvalidArgument);
        assert!(fx.cluster.ops().is_empty());
    }
}

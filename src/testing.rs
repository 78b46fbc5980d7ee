//! Test doubles for the two external seams of the core: the backend client
//! factory and the metadata store. The doubles implement the same traits
//! production code is written against, so every layer from the pool up to
//! the request handler can be exercised without a live cluster.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendClient, BackendConnector, IndexParams, TopKBlock};
use crate::error::{ShardError, ShardResult};
use crate::meta::{MetaStore, MetricKind, TableDescriptor, TimeRange};

// ---------------------------------------------------------------------------
// Mock backend cluster
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ClusterState {
    connect_calls: AtomicUsize,
    search_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    blocks: Mutex<HashMap<String, Vec<TopKBlock>>>,
    search_errors: Mutex<HashMap<String, ShardError>>,
    delays: Mutex<HashMap<String, Duration>>,
    failed_pings: Mutex<HashSet<String>>,
    failed_connects: Mutex<HashSet<String>>,
    descriptors: Mutex<HashMap<String, TableDescriptor>>,
    ops: Mutex<Vec<String>>,
}

/// Scripted behavior and call accounting for a whole fleet of mock
/// backends, shared by every client the [`MockConnector`] hands out.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<ClusterState>,
}

impl MockCluster {
    /// Canned blocks returned by `search_in_files` against `address`.
    pub fn set_blocks(&self, address: &str, blocks: Vec<TopKBlock>) {
        self.state
            .blocks
            .lock()
            .unwrap()
            .insert(address.to_string(), blocks);
    }

    /// Make `search_in_files` against `address` fail with `error`.
    pub fn set_search_error(&self, address: &str, error: ShardError) {
        self.state
            .search_errors
            .lock()
            .unwrap()
            .insert(address.to_string(), error);
    }

    /// Delay `search_in_files` against `address` by `delay`.
    pub fn set_delay(&self, address: &str, delay: Duration) {
        self.state
            .delays
            .lock()
            .unwrap()
            .insert(address.to_string(), delay);
    }

    /// Make subsequent pings of clients to `address` fail.
    pub fn fail_ping(&self, address: &str) {
        self.state
            .failed_pings
            .lock()
            .unwrap()
            .insert(address.to_string());
    }

    /// Make subsequent dials to `address` fail with `Unavailable`.
    pub fn fail_connect(&self, address: &str) {
        self.state
            .failed_connects
            .lock()
            .unwrap()
            .insert(address.to_string());
    }

    /// Register a table schema served by `describe_table` on every backend.
    pub fn set_descriptor(&self, descriptor: TableDescriptor) {
        self.state
            .descriptors
            .lock()
            .unwrap()
            .insert(descriptor.name.clone(), descriptor);
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.state.search_calls.load(Ordering::SeqCst)
    }

    /// Highest number of sub-queries that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Administrative operations observed by any backend, in call order,
    /// formatted as `"op:argument"`.
    pub fn ops(&self) -> Vec<String> {
        self.state.ops.lock().unwrap().clone()
    }

    fn record_op(&self, op: &str, argument: &str) {
        self.state
            .ops
            .lock()
            .unwrap()
            .push(format!("{op}:{argument}"));
    }
}

/// Connector producing [`MockBackend`]s wired to a shared [`MockCluster`].
pub struct MockConnector {
    cluster: MockCluster,
}

impl MockConnector {
    pub fn new(cluster: MockCluster) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl BackendConnector for MockConnector {
    async fn connect(&self, address: &str) -> ShardResult<Box<dyn BackendClient>> {
        if self
            .cluster
            .state
            .failed_connects
            .lock()
            .unwrap()
            .contains(address)
        {
            return Err(ShardError::unavailable(format!(
                "mock backend {address} refused the connection"
            )));
        }
        self.cluster.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBackend {
            address: address.to_string(),
            cluster: self.cluster.clone(),
        }))
    }
}

/// One scripted backend node.
pub struct MockBackend {
    address: String,
    cluster: MockCluster,
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn ping(&mut self) -> ShardResult<()> {
        if self
            .cluster
            .state
            .failed_pings
            .lock()
            .unwrap()
            .contains(&self.address)
        {
            return Err(ShardError::unavailable(format!(
                "mock backend {} did not answer the ping",
                self.address
            )));
        }
        Ok(())
    }

    async fn search_in_files(
        &mut self,
        _table: &str,
        _file_ids: &[String],
        _vectors: &[Vec<f32>],
        _topk: i64,
        _nprobe: i64,
    ) -> ShardResult<Vec<TopKBlock>> {
        let state = &self.cluster.state;
        state.search_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = state.delays.lock().unwrap().get(&self.address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        state.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = state.search_errors.lock().unwrap().get(&self.address) {
            return Err(error.clone());
        }
        Ok(state
            .blocks
            .lock()
            .unwrap()
            .get(&self.address)
            .cloned()
            .unwrap_or_default())
    }

    async fn describe_table(&mut self, table: &str) -> ShardResult<TableDescriptor> {
        self.cluster.record_op("describe_table", table);
        self.cluster
            .state
            .descriptors
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| ShardError::not_found(format!("table '{table}' does not exist")))
    }

    async fn create_table(&mut self, descriptor: &TableDescriptor) -> ShardResult<()> {
        self.cluster.record_op("create_table", &descriptor.name);
        Ok(())
    }

    async fn has_table(&mut self, table: &str) -> ShardResult<bool> {
        self.cluster.record_op("has_table", table);
        Ok(self
            .cluster
            .state
            .descriptors
            .lock()
            .unwrap()
            .contains_key(table))
    }

    async fn drop_table(&mut self, table: &str) -> ShardResult<()> {
        self.cluster.record_op("drop_table", table);
        Ok(())
    }

    async fn create_index(&mut self, table: &str, _index: IndexParams) -> ShardResult<()> {
        self.cluster.record_op("create_index", table);
        Ok(())
    }

    async fn insert(
        &mut self,
        table: &str,
        vectors: &[Vec<f32>],
        _row_ids: &[i64],
    ) -> ShardResult<Vec<i64>> {
        self.cluster.record_op("insert", table);
        Ok((0..vectors.len() as i64).collect())
    }

    async fn count_table(&mut self, table: &str) -> ShardResult<i64> {
        self.cluster.record_op("count_table", table);
        Ok(42)
    }

    async fn show_tables(&mut self) -> ShardResult<Vec<String>> {
        self.cluster.record_op("show_tables", "");
        let mut names: Vec<String> = self
            .cluster
            .state
            .descriptors
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn cmd(&mut self, cmd: &str) -> ShardResult<String> {
        self.cluster.record_op("cmd", cmd);
        Ok(format!("mock-reply:{cmd}"))
    }

    async fn delete_by_range(&mut self, table: &str, _range: &TimeRange) -> ShardResult<()> {
        self.cluster.record_op("delete_by_range", table);
        Ok(())
    }

    async fn preload_table(&mut self, table: &str) -> ShardResult<()> {
        self.cluster.record_op("preload_table", table);
        Ok(())
    }

    async fn describe_index(&mut self, table: &str) -> ShardResult<IndexParams> {
        self.cluster.record_op("describe_index", table);
        Ok(IndexParams {
            index_type: 1,
            nlist: 16384,
        })
    }

    async fn drop_index(&mut self, table: &str) -> ShardResult<()> {
        self.cluster.record_op("drop_index", table);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock metadata store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MetaState {
    tables: Mutex<HashMap<String, BTreeMap<String, Vec<String>>>>,
    descriptors: Mutex<HashMap<String, TableDescriptor>>,
    lookup_error: Mutex<Option<ShardError>>,
    describe_calls: AtomicUsize,
}

/// In-memory [`MetaStore`] with a builder-style setup API.
#[derive(Clone, Default)]
pub struct MockMetaStore {
    state: Arc<MetaState>,
}

impl MockMetaStore {
    /// Register `table` with no shards at all.
    pub fn with_table(self, table: &str) -> Self {
        self.state
            .tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default();
        self
    }

    /// Assign `files` of `table` to the backend at `address`.
    pub fn with_files(self, table: &str, address: &str, files: &[&str]) -> Self {
        self.state
            .tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .entry(address.to_string())
            .or_default()
            .extend(files.iter().map(|f| f.to_string()));
        self
    }

    /// Register the descriptor served by `describe`.
    pub fn with_descriptor(self, table: &str, dimension: i64, metric: MetricKind) -> Self {
        self.state.descriptors.lock().unwrap().insert(
            table.to_string(),
            TableDescriptor {
                name: table.to_string(),
                dimension,
                index_file_size: 1024,
                metric,
            },
        );
        self
    }

    /// Make every `lookup` fail with `error`.
    pub fn with_lookup_error(self, error: ShardError) -> Self {
        *self.state.lookup_error.lock().unwrap() = Some(error);
        self
    }

    pub fn describe_calls(&self) -> usize {
        self.state.describe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetaStore for MockMetaStore {
    async fn lookup(
        &self,
        table: &str,
        _ranges: Option<&[TimeRange]>,
    ) -> ShardResult<BTreeMap<String, Vec<String>>> {
        if let Some(error) = self.state.lookup_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.state
            .tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| ShardError::not_found(format!("table '{table}' does not exist")))
    }

    async fn describe(&self, table: &str) -> ShardResult<TableDescriptor> {
        self.state.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .descriptors
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| ShardError::not_found(format!("table '{table}' does not exist")))
    }
}

//! Parallel sub-query dispatcher.
//!
//! Executes one sub-query per routing-plan entry on a shared bounded worker
//! pool and collects the partial results. Partials are reported in plan
//! order regardless of completion order, which is what lets the merger
//! resolve distance ties deterministically. A failed sub-query never cancels
//! its peers; it is captured as an error-bearing [`Partial`] for the merger
//! to observe. The request's cancellation token reaches every task, and on
//! cancellation each task abandons its RPC and hands its client back to the
//! pool.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{ShardError, ShardResult};
use crate::merge::Partial;
use crate::pool::ConnectionPool;
use crate::router::{RoutingPlan, SubQuery};

/// Fan-out executor shared by all requests of one service instance. The
/// semaphore bounds how many sub-queries run at once across requests.
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    workers: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(pool: Arc<ConnectionPool>, max_workers: usize) -> Self {
        Self {
            pool,
            workers: Arc::new(Semaphore::new(max_workers)),
        }
    }

    /// Run every sub-query of `plan` and return the partials in plan order.
    ///
    /// Waits for all tasks before returning; there is no streaming into the
    /// merger. Returns `Canceled` when the request token fires, discarding
    /// any partials that had already completed.
    pub async fn dispatch(
        &self,
        plan: &RoutingPlan,
        vectors: Arc<Vec<Vec<f32>>>,
        topk: i64,
        nprobe: i64,
        cancel: &CancellationToken,
    ) -> ShardResult<Vec<Partial>> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let mut addresses = Vec::with_capacity(plan.len());
        let mut handles = Vec::with_capacity(plan.len());
        for (address, sub_query) in plan.iter() {
            let span = tracing::info_span!("search_shard", address = %address);
            let task = run_sub_query(
                self.pool.clone(),
                self.workers.clone(),
                cancel.clone(),
                address.clone(),
                sub_query.clone(),
                vectors.clone(),
                topk,
                nprobe,
            );
            addresses.push(address.clone());
            handles.push(tokio::spawn(task.instrument(span)));
        }

        let mut partials = Vec::with_capacity(handles.len());
        for (address, handle) in addresses.into_iter().zip(handles) {
            match handle.await {
                Ok(partial) => partials.push(partial),
                Err(e) => partials.push(Partial::err(
                    address,
                    ShardError::internal(format!("sub-query task failed: {e}")),
                )),
            }
        }

        if cancel.is_cancelled() {
            return Err(ShardError::canceled("search request canceled"));
        }

        tracing::debug!(
            shards = partials.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fan-out complete"
        );
        Ok(partials)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_sub_query(
    pool: Arc<ConnectionPool>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    address: String,
    sub_query: SubQuery,
    vectors: Arc<Vec<Vec<f32>>>,
    topk: i64,
    nprobe: i64,
) -> Partial {
    let result = search_one_shard(
        pool, workers, cancel, &address, &sub_query, &vectors, topk, nprobe,
    )
    .await;
    if let Err(error) = &result {
        tracing::warn!(address = %address, error = %error, "sub-query failed");
    }
    Partial { address, result }
}

#[allow(clippy::too_many_arguments)]
async fn search_one_shard(
    pool: Arc<ConnectionPool>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    address: &str,
    sub_query: &SubQuery,
    vectors: &[Vec<f32>],
    topk: i64,
    nprobe: i64,
) -> ShardResult<Vec<crate::backend::TopKBlock>> {
    let _permit = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(ShardError::canceled("request canceled while queued"));
        }
        permit = workers.acquire_owned() => {
            permit.map_err(|_| ShardError::internal("worker pool closed"))?
        }
    };

    let mut client = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(ShardError::canceled("request canceled while connecting"));
        }
        client = pool.get(address) => client?,
    };

    tracing::debug!(
        address = %address,
        files = sub_query.file_ids.len(),
        nq = vectors.len(),
        topk,
        nprobe,
        "sending sub-query"
    );

    let started = Instant::now();
    let reply = tokio::select! {
        _ = cancel.cancelled() => {
            // Abandon the in-flight RPC; the client goes back to the pool
            // when the guard drops.
            return Err(ShardError::canceled("request canceled in flight"));
        }
        reply = client.search_in_files(
            &sub_query.table_name,
            &sub_query.file_ids,
            vectors,
            topk,
            nprobe,
        ) => reply,
    };

    match reply {
        Ok(blocks) => {
            tracing::debug!(
                address = %address,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sub-query complete"
            );
            Ok(blocks)
        }
        Err(error) => {
            client.discard();
            Err(error)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

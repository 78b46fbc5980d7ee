//! Backend connection pool.
//!
//! One sub-pool per backend address, each bounded to `pool_size` live
//! clients. Idle clients are parked for reuse and recycled once they have
//! rested longer than `pool_recycle`; a client handed back out is pre-pinged
//! first and silently replaced when the ping fails. Acquisition as a whole
//! is bounded by `pool_timeout` and surfaces as `Unavailable` on expiry.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::{BackendClient, BackendConnector};
use crate::config::MishardConfig;
use crate::error::{ShardError, ShardResult};

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct IdleClient {
    client: Box<dyn BackendClient>,
    parked_at: Instant,
}

struct AddressPool {
    idle: Mutex<Vec<IdleClient>>,
    permits: Arc<Semaphore>,
}

/// Long-lived pool of reusable backend clients, keyed by address.
pub struct ConnectionPool {
    connector: Arc<dyn BackendConnector>,
    pool_size: usize,
    recycle: Duration,
    acquire_timeout: Duration,
    admin_addresses: Vec<String>,
    admin_cursor: AtomicUsize,
    pools: Mutex<HashMap<String, Arc<AddressPool>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn BackendConnector>, config: &MishardConfig) -> Self {
        Self {
            connector,
            pool_size: config.pool_size,
            recycle: Duration::from_secs(config.pool_recycle),
            acquire_timeout: Duration::from_secs(config.pool_timeout),
            admin_addresses: config.backends.clone(),
            admin_cursor: AtomicUsize::new(0),
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn address_pool(&self, address: &str) -> Arc<AddressPool> {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(AddressPool {
                    idle: Mutex::new(Vec::new()),
                    permits: Arc::new(Semaphore::new(self.pool_size)),
                })
            })
            .clone()
    }

    /// Check a client out of the pool for `address`, dialing a new one when
    /// no parked client survives the recycle window and the pre-ping.
    pub async fn get(&self, address: &str) -> ShardResult<PooledClient> {
        let pool = self.address_pool(address);
        tokio::time::timeout(self.acquire_timeout, self.checkout(pool, address))
            .await
            .map_err(|_| {
                ShardError::unavailable(format!(
                    "timed out acquiring a connection to {address} after {:?}",
                    self.acquire_timeout
                ))
            })?
    }

    /// Check out a client to any configured backend, for administrative
    /// operations that are not tied to a shard. Tries each address once,
    /// starting from a rotating cursor.
    pub async fn any(&self) -> ShardResult<PooledClient> {
        if self.admin_addresses.is_empty() {
            return Err(ShardError::unavailable("no backend addresses configured"));
        }
        let start = self.admin_cursor.fetch_add(1, Ordering::Relaxed);
        let mut last_err = None;
        for offset in 0..self.admin_addresses.len() {
            let address = &self.admin_addresses[(start + offset) % self.admin_addresses.len()];
            match self.get(address).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    tracing::debug!(address = %address, error = %e, "backend unavailable for admin op");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ShardError::unavailable("no live backend")))
    }

    async fn checkout(&self, pool: Arc<AddressPool>, address: &str) -> ShardResult<PooledClient> {
        let permit = pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ShardError::internal("connection pool closed"))?;

        loop {
            let parked = pool.idle.lock().unwrap().pop();
            let Some(parked) = parked else { break };
            if parked.parked_at.elapsed() >= self.recycle {
                // Rested past the recycle window; let it drop.
                continue;
            }
            let mut client = parked.client;
            match client.ping().await {
                Ok(()) => {
                    return Ok(PooledClient {
                        address: address.to_string(),
                        client: Some(client),
                        home: pool,
                        _permit: permit,
                        discard: false,
                    })
                }
                Err(e) => {
                    tracing::debug!(address = %address, error = %e, "discarding idle client that failed pre-ping");
                }
            }
        }

        let client = self.connector.connect(address).await?;
        Ok(PooledClient {
            address: address.to_string(),
            client: Some(client),
            home: pool,
            _permit: permit,
            discard: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Checkout guard
// ---------------------------------------------------------------------------

/// A checked-out backend client. Returns the underlying client to its
/// sub-pool on drop unless it has been marked broken with [`discard`].
///
/// [`discard`]: PooledClient::discard
pub struct PooledClient {
    address: String,
    client: Option<Box<dyn BackendClient>>,
    home: Arc<AddressPool>,
    _permit: OwnedSemaphorePermit,
    discard: bool,
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("address", &self.address)
            .field("discard", &self.discard)
            .finish()
    }
}

impl PooledClient {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Mark the client broken; it will be dropped instead of parked.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Deref for PooledClient {
    type Target = dyn BackendClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_deref().expect("client present until drop")
    }
}

impl DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_deref_mut().expect("client present until drop")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if self.discard {
            return;
        }
        if let Some(client) = self.client.take() {
            self.home.idle.lock().unwrap().push(IdleClient {
                client,
                parked_at: Instant::now(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCluster, MockConnector};

    fn pool_config(pool_size: usize, recycle: u64, timeout: u64) -> MishardConfig {
        MishardConfig {
            pool_size,
            pool_recycle: recycle,
            pool_timeout: timeout,
            backends: vec!["http://a:1".to_string(), "http://b:1".to_string()],
            ..MishardConfig::default()
        }
    }

    #[tokio::test]
    async fn checkout_dials_once_and_reuses_idle_client() {
        let cluster = MockCluster::default();
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::new(cluster.clone())),
            &pool_config(4, 60, 5),
        );

        {
            let _client = pool.get("http://a:1").await.unwrap();
        }
        {
            let _client = pool.get("http://a:1").await.unwrap();
        }
        assert_eq!(cluster.connect_calls(), 1);
    }

    #[tokio::test]
    async fn idle_client_past_recycle_window_is_replaced() {
        let cluster = MockCluster::default();
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::new(cluster.clone())),
            &pool_config(4, 0, 5),
        );

        {
            let _client = pool.get("http://a:1").await.unwrap();
        }
        // Zero recycle window: the parked client is already stale.
        let _client = pool.get("http://a:1").await.unwrap();
        assert_eq!(cluster.connect_calls(), 2);
    }

    #[tokio::test]
    async fn failed_pre_ping_discards_idle_client() {
        let cluster = MockCluster::default();
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::new(cluster.clone())),
            &pool_config(4, 60, 5),
        );

        {
            let _client = pool.get("http://a:1").await.unwrap();
        }
        cluster.fail_ping("http://a:1");
        let _client = pool.get("http://a:1").await.unwrap();
        assert_eq!(cluster.connect_calls(), 2);
    }

    #[tokio::test]
    async fn discarded_client_is_not_parked() {
        let cluster = MockCluster::default();
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::new(cluster.clone())),
            &pool_config(4, 60, 5),
        );

        {
            let mut client = pool.get("http://a:1").await.unwrap();
            client.discard();
        }
        let _client = pool.get("http://a:1").await.unwrap();
        assert_eq!(cluster.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_times_out_as_unavailable() {
        let cluster = MockCluster::default();
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::new(cluster.clone())),
            &pool_config(1, 60, 1),
        );

        let held = pool.get("http://a:1").await.unwrap();
        let err = pool.get("http://a:1").await.unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::Unavailable);
        assert!(err.to_string().contains("timed out"), "error was: {err}");
        drop(held);
    }

    #[tokio::test]
    async fn refused_connection_surfaces_unavailable() {
        let cluster = MockCluster::default();
        cluster.fail_connect("http://a:1");
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::new(cluster.clone())),
            &pool_config(4, 60, 5),
        );
        let err = pool.get("http://a:1").await.unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn any_rotates_over_configured_backends() {
        let cluster = MockCluster::default();
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::new(cluster.clone())),
            &pool_config(4, 60, 5),
        );

        let first = pool.any().await.unwrap().address().to_string();
        let second = pool.any().await.unwrap().address().to_string();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn any_without_backends_is_unavailable() {
        let cluster = MockCluster::default();
        let config = MishardConfig::default();
        let pool = ConnectionPool::new(Arc::new(MockConnector::new(cluster)), &config);
        let err = pool.any().await.unwrap_err();
        assert_eq!(err.code(), crate::pb::ErrorCode::Unavailable);
    }
}

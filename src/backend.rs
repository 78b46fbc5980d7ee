//! Backend node client.
//!
//! The middleware treats every backend as an opaque peer speaking the same
//! wire contract it serves itself. [`BackendClient`] exposes exactly the
//! operations the core uses — the sharded search primitive, the schema read,
//! and the administrative pass-throughs — so tests can substitute mocks for
//! live nodes. [`GrpcBackend`] is the production implementation over a tonic
//! channel; each instance owns one channel to a single endpoint, established
//! once and reused for all subsequent calls.

use async_trait::async_trait;
use tonic::transport::Channel;

use crate::error::{ShardError, ShardResult};
use crate::meta::{MetricKind, TableDescriptor, TimeRange};
use crate::pb;
use crate::pb::vector_service_client::VectorServiceClient;

// ---------------------------------------------------------------------------
// Result rows
// ---------------------------------------------------------------------------

/// One search hit: a stored vector id and its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultRow {
    pub id: i64,
    pub distance: f64,
}

impl ResultRow {
    pub fn new(id: i64, distance: f64) -> Self {
        Self { id, distance }
    }
}

/// The top-K rows for one query vector, sorted by the table's metric.
pub type TopKBlock = Vec<ResultRow>;

/// Index-creation parameters forwarded unchanged to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    pub index_type: i32,
    pub nlist: i32,
}

// ---------------------------------------------------------------------------
// Client traits
// ---------------------------------------------------------------------------

/// Operations the core invokes against a single backend node.
#[async_trait]
pub trait BackendClient: Send {
    /// Cheap liveness probe used by the connection pool before handing out
    /// an idle client.
    async fn ping(&mut self) -> ShardResult<()>;

    /// Search `vectors` against the given file shards only. Returns one
    /// block per query vector, aligned with the input order.
    async fn search_in_files(
        &mut self,
        table: &str,
        file_ids: &[String],
        vectors: &[Vec<f32>],
        topk: i64,
        nprobe: i64,
    ) -> ShardResult<Vec<TopKBlock>>;

    async fn describe_table(&mut self, table: &str) -> ShardResult<TableDescriptor>;

    async fn create_table(&mut self, descriptor: &TableDescriptor) -> ShardResult<()>;
    async fn has_table(&mut self, table: &str) -> ShardResult<bool>;
    async fn drop_table(&mut self, table: &str) -> ShardResult<()>;
    async fn create_index(&mut self, table: &str, index: IndexParams) -> ShardResult<()>;
    async fn insert(
        &mut self,
        table: &str,
        vectors: &[Vec<f32>],
        row_ids: &[i64],
    ) -> ShardResult<Vec<i64>>;
    async fn count_table(&mut self, table: &str) -> ShardResult<i64>;
    async fn show_tables(&mut self) -> ShardResult<Vec<String>>;
    async fn cmd(&mut self, cmd: &str) -> ShardResult<String>;
    async fn delete_by_range(&mut self, table: &str, range: &TimeRange) -> ShardResult<()>;
    async fn preload_table(&mut self, table: &str) -> ShardResult<()>;
    async fn describe_index(&mut self, table: &str) -> ShardResult<IndexParams>;
    async fn drop_index(&mut self, table: &str) -> ShardResult<()>;
}

/// Factory dialing new [`BackendClient`]s; the connection pool owns one.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, address: &str) -> ShardResult<Box<dyn BackendClient>>;
}

// ---------------------------------------------------------------------------
// gRPC implementation
// ---------------------------------------------------------------------------

/// Dials [`GrpcBackend`]s over plain HTTP/2 channels.
#[derive(Debug, Default)]
pub struct GrpcConnector;

#[async_trait]
impl BackendConnector for GrpcConnector {
    async fn connect(&self, address: &str) -> ShardResult<Box<dyn BackendClient>> {
        let endpoint = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let client = VectorServiceClient::connect(endpoint).await.map_err(|e| {
            ShardError::unavailable(format!("failed to connect to backend {address}: {e}"))
        })?;
        Ok(Box::new(GrpcBackend {
            address: address.to_string(),
            client,
        }))
    }
}

/// One backend node reached over a dedicated tonic channel.
pub struct GrpcBackend {
    address: String,
    client: VectorServiceClient<Channel>,
}

impl GrpcBackend {
    fn rpc_err(&self, status: tonic::Status) -> ShardError {
        match status.code() {
            tonic::Code::Cancelled | tonic::Code::DeadlineExceeded => {
                ShardError::canceled(format!("backend {}: {}", self.address, status.message()))
            }
            _ => ShardError::unavailable(format!("backend {}: {}", self.address, status.message())),
        }
    }
}

/// Turn an embedded reply status into a `ShardResult`.
fn check_status(status: Option<pb::Status>) -> ShardResult<()> {
    match status {
        Some(s) if s.error_code == pb::ErrorCode::Success as i32 => Ok(()),
        Some(s) => Err(ShardError::from_wire(s.error_code, s.reason)),
        None => Err(ShardError::internal("backend reply carried no status")),
    }
}

fn rows_to_vectors(vectors: &[Vec<f32>]) -> Vec<pb::RowRecord> {
    vectors
        .iter()
        .map(|v| pb::RowRecord {
            vector_data: v.clone(),
        })
        .collect()
}

pub(crate) fn wire_to_blocks(results: Vec<pb::TopKQueryResult>) -> Vec<TopKBlock> {
    results
        .into_iter()
        .map(|block| {
            block
                .query_result_arrays
                .into_iter()
                .map(|row| ResultRow::new(row.id, row.distance))
                .collect()
        })
        .collect()
}

pub(crate) fn blocks_to_wire(blocks: Vec<TopKBlock>) -> Vec<pb::TopKQueryResult> {
    blocks
        .into_iter()
        .map(|block| pb::TopKQueryResult {
            query_result_arrays: block
                .into_iter()
                .map(|row| pb::QueryResult {
                    id: row.id,
                    distance: row.distance,
                })
                .collect(),
        })
        .collect()
}

#[async_trait]
impl BackendClient for GrpcBackend {
    async fn ping(&mut self) -> ShardResult<()> {
        let reply = self
            .client
            .cmd(pb::Command {
                cmd: "status".to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(reply.status)
    }

    async fn search_in_files(
        &mut self,
        table: &str,
        file_ids: &[String],
        vectors: &[Vec<f32>],
        topk: i64,
        nprobe: i64,
    ) -> ShardResult<Vec<TopKBlock>> {
        let param = pb::SearchInFilesParam {
            file_id_array: file_ids.to_vec(),
            search_param: Some(pb::SearchParam {
                table_name: table.to_string(),
                query_record_array: rows_to_vectors(vectors),
                query_range_array: Vec::new(),
                topk,
                nprobe,
            }),
        };
        let reply = self
            .client
            .search_in_files(param)
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(reply.status)?;
        Ok(wire_to_blocks(reply.topk_query_result))
    }

    async fn describe_table(&mut self, table: &str) -> ShardResult<TableDescriptor> {
        let reply = self
            .client
            .describe_table(pb::TableName {
                table_name: table.to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(reply.status)?;
        Ok(TableDescriptor {
            name: reply.table_name,
            dimension: reply.dimension,
            index_file_size: reply.index_file_size,
            metric: MetricKind::from_wire(reply.metric_type)?,
        })
    }

    async fn create_table(&mut self, descriptor: &TableDescriptor) -> ShardResult<()> {
        let reply = self
            .client
            .create_table(pb::TableSchema {
                status: None,
                table_name: descriptor.name.clone(),
                dimension: descriptor.dimension,
                index_file_size: descriptor.index_file_size,
                metric_type: descriptor.metric.as_wire(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(Some(reply))
    }

    async fn has_table(&mut self, table: &str) -> ShardResult<bool> {
        let reply = self
            .client
            .has_table(pb::TableName {
                table_name: table.to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(reply.status)?;
        Ok(reply.bool_reply)
    }

    async fn drop_table(&mut self, table: &str) -> ShardResult<()> {
        let reply = self
            .client
            .drop_table(pb::TableName {
                table_name: table.to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(Some(reply))
    }

    async fn create_index(&mut self, table: &str, index: IndexParams) -> ShardResult<()> {
        let reply = self
            .client
            .create_index(pb::IndexParam {
                status: None,
                table_name: table.to_string(),
                index: Some(pb::Index {
                    index_type: index.index_type,
                    nlist: index.nlist,
                }),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(Some(reply))
    }

    async fn insert(
        &mut self,
        table: &str,
        vectors: &[Vec<f32>],
        row_ids: &[i64],
    ) -> ShardResult<Vec<i64>> {
        let reply = self
            .client
            .insert(pb::InsertParam {
                table_name: table.to_string(),
                row_record_array: rows_to_vectors(vectors),
                row_id_array: row_ids.to_vec(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(reply.status)?;
        Ok(reply.vector_id_array)
    }

    async fn count_table(&mut self, table: &str) -> ShardResult<i64> {
        let reply = self
            .client
            .count_table(pb::TableName {
                table_name: table.to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(reply.status)?;
        Ok(reply.table_row_count)
    }

    async fn show_tables(&mut self) -> ShardResult<Vec<String>> {
        let reply = self
            .client
            .show_tables(pb::Command { cmd: String::new() })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(reply.status)?;
        Ok(reply.table_names)
    }

    async fn cmd(&mut self, cmd: &str) -> ShardResult<String> {
        let reply = self
            .client
            .cmd(pb::Command {
                cmd: cmd.to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(reply.status)?;
        Ok(reply.string_reply)
    }

    async fn delete_by_range(&mut self, table: &str, range: &TimeRange) -> ShardResult<()> {
        let reply = self
            .client
            .delete_by_range(pb::DeleteByRangeParam {
                range: Some(pb::Range {
                    start_value: range.start.to_string(),
                    end_value: range.end.to_string(),
                }),
                table_name: table.to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(Some(reply))
    }

    async fn preload_table(&mut self, table: &str) -> ShardResult<()> {
        let reply = self
            .client
            .preload_table(pb::TableName {
                table_name: table.to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(Some(reply))
    }

    async fn describe_index(&mut self, table: &str) -> ShardResult<IndexParams> {
        let reply = self
            .client
            .describe_index(pb::TableName {
                table_name: table.to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(reply.status)?;
        let index = reply
            .index
            .ok_or_else(|| ShardError::internal("describe index reply carried no index"))?;
        Ok(IndexParams {
            index_type: index.index_type,
            nlist: index.nlist,
        })
    }

    async fn drop_index(&mut self, table: &str) -> ShardResult<()> {
        let reply = self
            .client
            .drop_index(pb::TableName {
                table_name: table.to_string(),
            })
            .await
            .map_err(|e| self.rpc_err(e))?
            .into_inner();
        check_status(Some(reply))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_unreachable_backend_is_unavailable() {
        let result = GrpcConnector.connect("http://127.0.0.1:1").await;
        let err = result.err().expect("connect should fail");
        assert_eq!(err.code(), pb::ErrorCode::Unavailable);
        assert!(
            err.to_string().contains("127.0.0.1:1"),
            "error was: {err}"
        );
    }

    #[tokio::test]
    async fn bare_host_port_gets_a_scheme() {
        // Connection still fails, but the address must have been accepted as
        // a URI rather than rejected as malformed.
        let err = GrpcConnector.connect("127.0.0.1:1").await.err().unwrap();
        assert_eq!(err.code(), pb::ErrorCode::Unavailable);
    }

    #[test]
    fn missing_reply_status_is_internal() {
        let err = check_status(None).unwrap_err();
        assert_eq!(err.code(), pb::ErrorCode::Internal);
    }

    #[test]
    fn embedded_error_status_surfaces_kind() {
        let err = check_status(Some(pb::Status {
            error_code: pb::ErrorCode::NotFound as i32,
            reason: "no such table".to_string(),
        }))
        .unwrap_err();
        assert_eq!(err.code(), pb::ErrorCode::NotFound);
    }

    #[test]
    fn wire_block_round_trip() {
        let blocks = vec![
            vec![ResultRow::new(7, 0.1), ResultRow::new(8, 0.5)],
            vec![],
        ];
        let back = wire_to_blocks(blocks_to_wire(blocks.clone()));
        assert_eq!(back, blocks);
    }
}

//! gRPC surface.
//!
//! Thin translation layer between the wire contract and the request
//! handler. Application failures never become transport errors: every reply
//! carries an embedded `(code, reason)` status and an empty but well-typed
//! payload, so clients can distinguish an empty success from a failure.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response};

use crate::backend::{blocks_to_wire, IndexParams};
use crate::error::{success_status, ShardError, ShardResult};
use crate::handler::ServiceHandler;
use crate::meta::{MetricKind, TableDescriptor};
use crate::pb;
use crate::pb::vector_service_server::VectorService;

/// The tonic service exposed to clients.
#[derive(Clone)]
pub struct MishardService {
    handler: Arc<ServiceHandler>,
}

impl MishardService {
    pub fn new(handler: Arc<ServiceHandler>) -> Self {
        Self { handler }
    }
}

fn to_status(result: ShardResult<()>) -> pb::Status {
    match result {
        Ok(()) => success_status(),
        Err(error) => error.status(),
    }
}

#[tonic::async_trait]
impl VectorService for MishardService {
    async fn create_table(
        &self,
        request: Request<pb::TableSchema>,
    ) -> Result<Response<pb::Status>, tonic::Status> {
        let schema = request.into_inner();
        let result = async {
            let metric = MetricKind::from_wire(schema.metric_type)?;
            let descriptor = TableDescriptor {
                name: schema.table_name,
                dimension: schema.dimension,
                index_file_size: schema.index_file_size,
                metric,
            };
            self.handler.create_table(&descriptor).await
        }
        .await;
        Ok(Response::new(to_status(result)))
    }

    async fn has_table(
        &self,
        request: Request<pb::TableName>,
    ) -> Result<Response<pb::BoolReply>, tonic::Status> {
        let name = request.into_inner().table_name;
        let reply = match self.handler.has_table(&name).await {
            Ok(exists) => pb::BoolReply {
                status: Some(success_status()),
                bool_reply: exists,
            },
            Err(error) => pb::BoolReply {
                status: Some(error.status()),
                bool_reply: false,
            },
        };
        Ok(Response::new(reply))
    }

    async fn drop_table(
        &self,
        request: Request<pb::TableName>,
    ) -> Result<Response<pb::Status>, tonic::Status> {
        let name = request.into_inner().table_name;
        Ok(Response::new(to_status(
            self.handler.drop_table(&name).await,
        )))
    }

    async fn create_index(
        &self,
        request: Request<pb::IndexParam>,
    ) -> Result<Response<pb::Status>, tonic::Status> {
        let param = request.into_inner();
        let index = param.index.unwrap_or_default();
        let result = self
            .handler
            .create_index(
                &param.table_name,
                IndexParams {
                    index_type: index.index_type,
                    nlist: index.nlist,
                },
            )
            .await;
        Ok(Response::new(to_status(result)))
    }

    async fn insert(
        &self,
        request: Request<pb::InsertParam>,
    ) -> Result<Response<pb::VectorIds>, tonic::Status> {
        let param = request.into_inner();
        let vectors: Vec<Vec<f32>> = param
            .row_record_array
            .into_iter()
            .map(|r| r.vector_data)
            .collect();
        let reply = match self
            .handler
            .insert(&param.table_name, &vectors, &param.row_id_array)
            .await
        {
            Ok(ids) => pb::VectorIds {
                status: Some(success_status()),
                vector_id_array: ids,
            },
            Err(error) => pb::VectorIds {
                status: Some(error.status()),
                vector_id_array: Vec::new(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn search(
        &self,
        request: Request<pb::SearchParam>,
    ) -> Result<Response<pb::TopKQueryResultList>, tonic::Status> {
        let param = request.into_inner();
        let vectors: Vec<Vec<f32>> = param
            .query_record_array
            .into_iter()
            .map(|r| r.vector_data)
            .collect();
        let ranges: Vec<(String, String)> = param
            .query_range_array
            .into_iter()
            .map(|r| (r.start_value, r.end_value))
            .collect();

        // Dropping this request future — e.g. the client went away — trips
        // the token and aborts the fan-out tasks it spawned.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        let reply = match self
            .handler
            .search(
                &param.table_name,
                vectors,
                param.topk,
                param.nprobe,
                &ranges,
                cancel,
            )
            .await
        {
            Ok(blocks) => pb::TopKQueryResultList {
                status: Some(success_status()),
                topk_query_result: blocks_to_wire(blocks),
            },
            Err(error) => pb::TopKQueryResultList {
                status: Some(error.status()),
                topk_query_result: Vec::new(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn search_in_files(
        &self,
        _request: Request<pb::SearchInFilesParam>,
    ) -> Result<Response<pb::TopKQueryResultList>, tonic::Status> {
        let error = ShardError::unimplemented("SearchInFiles is reserved");
        Ok(Response::new(pb::TopKQueryResultList {
            status: Some(error.status()),
            topk_query_result: Vec::new(),
        }))
    }

    async fn describe_table(
        &self,
        request: Request<pb::TableName>,
    ) -> Result<Response<pb::TableSchema>, tonic::Status> {
        let name = request.into_inner().table_name;
        let reply = match self.handler.describe_table(&name).await {
            Ok(descriptor) => pb::TableSchema {
                status: Some(success_status()),
                table_name: descriptor.name,
                dimension: descriptor.dimension,
                index_file_size: descriptor.index_file_size,
                metric_type: descriptor.metric.as_wire(),
            },
            Err(error) => pb::TableSchema {
                status: Some(error.status()),
                table_name: name,
                ..Default::default()
            },
        };
        Ok(Response::new(reply))
    }

    async fn count_table(
        &self,
        request: Request<pb::TableName>,
    ) -> Result<Response<pb::TableRowCount>, tonic::Status> {
        let name = request.into_inner().table_name;
        let reply = match self.handler.count_table(&name).await {
            Ok(count) => pb::TableRowCount {
                status: Some(success_status()),
                table_row_count: count,
            },
            Err(error) => pb::TableRowCount {
                status: Some(error.status()),
                table_row_count: -1,
            },
        };
        Ok(Response::new(reply))
    }

    async fn show_tables(
        &self,
        _request: Request<pb::Command>,
    ) -> Result<Response<pb::TableNameList>, tonic::Status> {
        let reply = match self.handler.show_tables().await {
            Ok(names) => pb::TableNameList {
                status: Some(success_status()),
                table_names: names,
            },
            Err(error) => pb::TableNameList {
                status: Some(error.status()),
                table_names: Vec::new(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn cmd(
        &self,
        request: Request<pb::Command>,
    ) -> Result<Response<pb::StringReply>, tonic::Status> {
        let cmd = request.into_inner().cmd;
        let reply = match self.handler.cmd(&cmd).await {
            Ok(text) => pb::StringReply {
                status: Some(success_status()),
                string_reply: text,
            },
            Err(error) => pb::StringReply {
                status: Some(error.status()),
                string_reply: String::new(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn delete_by_range(
        &self,
        request: Request<pb::DeleteByRangeParam>,
    ) -> Result<Response<pb::Status>, tonic::Status> {
        let param = request.into_inner();
        let result = match param.range {
            Some(range) => {
                self.handler
                    .delete_by_range(&param.table_name, &range.start_value, &range.end_value)
                    .await
            }
            None => Err(ShardError::invalid_argument(
                "delete by range requires a range",
            )),
        };
        Ok(Response::new(to_status(result)))
    }

    async fn preload_table(
        &self,
        request: Request<pb::TableName>,
    ) -> Result<Response<pb::Status>, tonic::Status> {
        let name = request.into_inner().table_name;
        Ok(Response::new(to_status(
            self.handler.preload_table(&name).await,
        )))
    }

    async fn describe_index(
        &self,
        request: Request<pb::TableName>,
    ) -> Result<Response<pb::IndexParam>, tonic::Status> {
        let name = request.into_inner().table_name;
        let reply = match self.handler.describe_index(&name).await {
            Ok(index) => pb::IndexParam {
                status: Some(success_status()),
                table_name: name,
                index: Some(pb::Index {
                    index_type: index.index_type,
                    nlist: index.nlist,
                }),
            },
            Err(error) => pb::IndexParam {
                status: Some(error.status()),
                table_name: name,
                index: None,
            },
        };
        Ok(Response::new(reply))
    }

    async fn drop_index(
        &self,
        request: Request<pb::TableName>,
    ) -> Result<Response<pb::Status>, tonic::Status> {
        let name = request.into_inner().table_name;
        Ok(Response::new(to_status(
            self.handler.drop_index(&name).await,
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

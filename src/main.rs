use std::sync::Arc;

use tonic::transport::Server;

use mishard::config::{MishardConfig, CONFIG_ENV};
use mishard::backend::GrpcConnector;
use mishard::handler::ServiceHandler;
use mishard::meta::StaticMetaStore;
use mishard::pb::vector_service_server::VectorServiceServer;
use mishard::pool::ConnectionPool;
use mishard::service::MishardService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = if std::env::var(CONFIG_ENV).is_ok() {
        MishardConfig::from_env()?
    } else {
        MishardConfig::default()
    };

    if config.tracing_enabled {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    let addr = config.listen_addr.parse()?;
    let meta = Arc::new(StaticMetaStore::from_config(&config));
    let pool = Arc::new(ConnectionPool::new(Arc::new(GrpcConnector), &config));
    let handler = Arc::new(ServiceHandler::new(&config, meta, pool));

    tracing::info!(version = mishard::VERSION, %addr, "mishard serving");

    Server::builder()
        .add_service(VectorServiceServer::new(MishardService::new(handler)))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}

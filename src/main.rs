use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use fieldlog::config::{AuditBackend, AuditConfig};
use fieldlog::logging::init_logging;
use fieldlog::server::{self, AppState};
use fieldlog::{
    AuditStore, DispatchTransport, FieldlogConfig, FieldlogMetrics, InMemoryAuditStore,
    LettreRelay, Stager, SubmissionPipeline,
};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = FieldlogConfig::load_with_dotenv().context("Failed to load configuration")?;
    init_logging(&config.logging)?;

    let stager = Stager::new(&config.staging);
    if let Err(e) = stager.sweep_stale(Duration::from_secs(config.staging.stale_after_secs)) {
        tracing::warn!(error = %e, "Stale staging sweep failed");
    }

    let relay = Arc::new(
        LettreRelay::new(&config.relay, config.transport.greeting_timeout())
            .context("Failed to configure mail relay")?,
    );
    let shutdown = CancellationToken::new();
    let transport = DispatchTransport::start(relay, config.transport.clone(), shutdown.clone());

    let audit = build_audit_store(&config.audit).await?;
    let metrics = FieldlogMetrics::new(prometheus::Registry::new())?;

    let pipeline = SubmissionPipeline::new(
        config.validation,
        stager,
        config.compose_options(),
        transport.clone(),
        audit.clone(),
    )
    .with_metrics(metrics.clone());
    let state = AppState::new(pipeline, audit, config.server.max_body_bytes).with_metrics(metrics);

    let served = server::serve(&config.server, state).await;

    tracing::info!("HTTP server stopped, shutting down dispatch transport");
    transport.shutdown().await;
    served.context("HTTP server failed")
}

async fn build_audit_store(config: &AuditConfig) -> anyhow::Result<Arc<dyn AuditStore>> {
    match config.backend {
        AuditBackend::Memory => {
            tracing::warn!("Using in-memory audit store; history is lost on restart");
            Ok(Arc::new(InMemoryAuditStore::new()))
        }
        #[cfg(feature = "postgres")]
        AuditBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("audit.database_url is required for the postgres backend")?;
            let pool = sqlx::PgPool::connect(url)
                .await
                .context("Failed to connect to audit database")?;
            fieldlog::migrator()
                .run(&pool)
                .await
                .context("Failed to run audit migrations")?;
            Ok(Arc::new(fieldlog::PostgresAuditStore::new(pool)))
        }
        #[cfg(not(feature = "postgres"))]
        AuditBackend::Postgres => {
            anyhow::bail!("audit.backend = \"postgres\" requires building with the `postgres` feature")
        }
    }
}

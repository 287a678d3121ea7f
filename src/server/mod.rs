//! HTTP boundary: the submission endpoint plus history, health and metrics.

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{App, HttpResponse, HttpServer, ResponseError, web};
use serde::Serialize;

use crate::audit::AuditStore;
use crate::config::ServerConfig;
use crate::error::{DispatchFailure, ErrorClass, FieldlogError};
use crate::metrics::FieldlogMetrics;
use crate::pipeline::SubmissionPipeline;

pub mod handlers;
pub mod multipart;

pub use multipart::{FormError, FormLimits, IDENTITY_HEADER};

/// Shared state for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: SubmissionPipeline,
    pub audit: Arc<dyn AuditStore>,
    pub metrics: Option<FieldlogMetrics>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(pipeline: SubmissionPipeline, audit: Arc<dyn AuditStore>, max_body_bytes: usize) -> Self {
        Self {
            pipeline,
            audit,
            metrics: None,
            max_body_bytes,
        }
    }

    pub fn with_metrics(mut self, metrics: FieldlogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Register every route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(handlers::submit_log)
        .service(handlers::list_logs)
        .service(handlers::health)
        .service(handlers::metrics);
}

/// Bind and run the server until it is stopped by a signal.
pub async fn serve(config: &ServerConfig, state: AppState) -> std::io::Result<()> {
    let data = web::Data::new(state);
    tracing::info!(host = %config.host, port = config.port, "Starting HTTP server");

    HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .bind((config.host.as_str(), config.port))?
        .run()
        .await
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl ResponseError for FieldlogError {
    fn status_code(&self) -> StatusCode {
        match (self, self.class()) {
            (FieldlogError::Dispatch(DispatchFailure::Shutdown), _) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorClass::Client) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        })
    }
}

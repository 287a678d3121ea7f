use actix_multipart::Multipart;
use actix_web::{HttpRequest, HttpResponse, get, post, web};
use serde::{Deserialize, Serialize};

use crate::domain::submission::SubmitterId;
use crate::error::FieldlogError;
use crate::reconcile::AuditStatus;
use crate::staging::StagingStats;
use crate::transport::TransportStats;

use super::AppState;
use super::multipart::{FormLimits, read_submission};

const DEFAULT_LOG_LIMIT: usize = 50;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    success: bool,
    submission_id: String,
    attachments: usize,
    audit: AuditStatus,
}

/// POST /submit-log
///
/// Responds only after the message has been sent (or has failed) and the
/// staged photos have been removed.
#[post("/submit-log")]
pub async fn submit_log(
    req: HttpRequest,
    payload: Multipart,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let limits = FormLimits {
        max_body_bytes: state.max_body_bytes,
        // One past the limit is enough for validation to reject the submission
        max_buffered_photos: crate::domain::submission::MAX_ATTACHMENTS + 1,
    };
    let raw = read_submission(req.headers(), payload, limits).await?;
    let receipt = state.pipeline.submit(raw).await?;

    Ok(HttpResponse::Ok().json(SubmitResponse {
        success: true,
        submission_id: receipt.submission_id.0.to_string(),
        attachments: receipt.attachments_sent,
        audit: receipt.audit,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

/// GET /logs/{submitter}
///
/// The submitter's audit records, most recent first.
#[get("/logs/{submitter}")]
pub async fn list_logs(
    path: web::Path<String>,
    query: web::Query<LogsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, FieldlogError> {
    let submitter = SubmitterId::new(path.into_inner());
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let records = state.audit.list_for_submitter(&submitter, Some(limit)).await?;
    Ok(HttpResponse::Ok().json(records))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    transport: TransportStats,
    staging: StagingStats,
}

/// GET /health
#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        transport: state.pipeline.transport().stats(),
        staging: state.pipeline.stager().stats(),
    })
}

/// GET /metrics
#[get("/metrics")]
pub async fn metrics(state: web::Data<AppState>) -> Result<HttpResponse, FieldlogError> {
    let Some(metrics) = &state.metrics else {
        return Ok(HttpResponse::NotFound().finish());
    };
    metrics.set_dispatch_queue_depth(state.pipeline.transport().stats().queued);
    let body = metrics.render()?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

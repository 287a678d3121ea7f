//! Decoding the submission form.
//!
//! Scalar fields arrive as text parts, `employees` as a JSON-encoded array
//! and photos as repeated `photos` file parts. Photos beyond the attachment
//! limit are counted but not buffered, so an oversized submission is
//! rejected by validation without holding its bytes.

use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::http::header::HeaderMap;
use actix_web::{HttpResponse, ResponseError};
use bytes::BytesMut;
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;

use crate::domain::submission::{RawEmployee, RawSubmission, UploadedPart};

/// Header set by an upstream identity provider; preferred over `userEmail`.
pub const IDENTITY_HEADER: &str = "x-submitter-identity";

const PHOTOS_FIELD: &str = "photos";

/// The request body could not be decoded into a submission.
#[derive(Error, Debug)]
pub enum FormError {
    #[error("malformed multipart body: {0}")]
    Malformed(String),

    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("field '{0}' is not valid UTF-8")]
    InvalidText(String),
}

#[derive(Serialize)]
struct FormErrorBody {
    error: String,
    kind: &'static str,
}

impl ResponseError for FormError {
    fn status_code(&self) -> StatusCode {
        match self {
            FormError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(FormErrorBody {
            error: self.to_string(),
            kind: "validation",
        })
    }
}

/// Limits applied while reading the body.
#[derive(Debug, Clone, Copy)]
pub struct FormLimits {
    pub max_body_bytes: usize,
    /// Photos buffered beyond this are only counted
    pub max_buffered_photos: usize,
}

/// Read the whole form into a [`RawSubmission`].
pub async fn read_submission(
    headers: &HeaderMap,
    mut payload: Multipart,
    limits: FormLimits,
) -> Result<RawSubmission, FormError> {
    let mut raw = RawSubmission::default();
    let mut user_email: Option<String> = None;
    let mut total_bytes = 0usize;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| FormError::Malformed(e.to_string()))?;
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let content_type = field.content_type().map(|m| m.to_string());

        let keep = name != PHOTOS_FIELD || raw.parts.len() < limits.max_buffered_photos;
        let mut buf = BytesMut::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| FormError::Malformed(e.to_string()))?;
            total_bytes += chunk.len();
            if total_bytes > limits.max_body_bytes {
                return Err(FormError::TooLarge {
                    limit: limits.max_body_bytes,
                });
            }
            if keep {
                buf.extend_from_slice(&chunk);
            }
        }

        if name == PHOTOS_FIELD {
            if keep {
                raw.parts.push(UploadedPart {
                    file_name,
                    content_type,
                    data: buf.freeze(),
                });
            } else {
                raw.discarded_parts += 1;
            }
            continue;
        }

        let text = String::from_utf8(buf.to_vec()).map_err(|_| FormError::InvalidText(name.clone()))?;
        match name.as_str() {
            "foreman" => raw.foreman_name = text,
            "foremanHours" => raw.foreman_hours = text,
            "date" => raw.date = text,
            "jobNumber" => raw.job_number = text,
            "taskDescription" => raw.task_description = text,
            "userEmail" => user_email = Some(text),
            "employees" => raw.employees = parse_employees(&text),
            other => tracing::debug!(field = other, "Ignoring unknown form field"),
        }
    }

    raw.submitter = identity_from_headers(headers).or(user_email);
    Ok(raw)
}

fn identity_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Malformed or missing JSON yields no employees rather than an error.
fn parse_employees(text: &str) -> Vec<RawEmployee> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str(text) {
        Ok(employees) => employees,
        Err(e) => {
            tracing::warn!(error = %e, "Could not parse employees field; treating as empty");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_employees_tolerates_garbage() {
        assert!(parse_employees("").is_empty());
        assert!(parse_employees("not json").is_empty());
        assert!(parse_employees(r#"{"name":"x"}"#).is_empty());

        let employees = parse_employees(r#"[{"name":"Joe Baker","hours":"8"}]"#);
        assert_eq!(employees.len(), 1);
        assert_eq!(employees[0].name, "Joe Baker");
    }

    #[test]
    fn test_identity_header_trimmed_and_optional() {
        let mut headers = HeaderMap::new();
        assert_eq!(identity_from_headers(&headers), None);

        headers.insert(
            actix_web::http::header::HeaderName::from_static(IDENTITY_HEADER),
            actix_web::http::header::HeaderValue::from_static("  jeff@example.com "),
        );
        assert_eq!(
            identity_from_headers(&headers).as_deref(),
            Some("jeff@example.com")
        );
    }

    #[test]
    fn test_form_error_status() {
        assert_eq!(
            FormError::TooLarge { limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            FormError::Malformed("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}

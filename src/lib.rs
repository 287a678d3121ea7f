//! Daily field-log submission service.
//!
//! A crew foreman submits a day's log (hours, job, task notes, photos). The
//! service validates it, stages the photos on disk, renders a notification
//! for the office, sends it over a pooled and rate-limited SMTP relay
//! connection, removes the staged photos and records the submission in an
//! audit log.
//!
//! ```text
//! RawSubmission ─validate─> Validated ─stage─> Staged ─compose─> Composed
//!                                                                   │
//!                     SubmissionReceipt <─reconcile─ Dispatched <─dispatch
//! ```
//!
//! The dispatch transport is the only component with long-lived resources:
//! it owns every relay connection and serializes sends through them.

pub mod audit;
pub mod compose;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod reconcile;
pub mod relay;
pub mod server;
pub mod staging;
pub mod transport;

pub use audit::{AuditEntry, AuditRecord, AuditStore, InMemoryAuditStore};
pub use compose::{ComposeOptions, OutboundMessage, compose};
pub use config::FieldlogConfig;
pub use domain::submission::{
    RawEmployee, RawSubmission, Submission, SubmissionId, SubmitterId, UploadedPart,
    ValidationLimits, validate,
};
pub use error::{DispatchFailure, FieldlogError, Result};
pub use metrics::FieldlogMetrics;
pub use pipeline::SubmissionPipeline;
pub use reconcile::{AuditStatus, Reconciler, SubmissionReceipt};
pub use relay::{LettreRelay, MailRelay, MockRelay, RelayConfig, RelayConnection, RelayError};
pub use staging::{
    AttachmentRef, FsWriter, ReleaseReport, StagedAttachments, Stager, StagingConfig, StagingWriter,
};
pub use transport::{DispatchOutcome, DispatchTransport, TransportConfig, TransportStats};

#[cfg(feature = "postgres")]
pub use audit::postgres::PostgresAuditStore;

/// Migrator for the audit store schema.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

//! Finalizing a dispatched submission.
//!
//! Reconciliation always releases the staged attachments first, whatever the
//! dispatch outcome. Only a sent submission produces an audit record; the
//! audit write is best-effort and its failure never turns a sent message into
//! a failed submission.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditEntry, AuditStore};
use crate::domain::submission::{Dispatched, Submission, SubmissionId, SubmitterId};
use crate::error::{FieldlogError, Result};
use crate::metrics::FieldlogMetrics;
use crate::staging::ReleaseReport;
use crate::transport::{ConnectionId, DispatchOutcome};

/// Result of the audit write for a sent submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AuditStatus {
    Written { created_at: DateTime<Utc> },
    Failed { reason: String },
}

impl AuditStatus {
    pub fn is_written(&self) -> bool {
        matches!(self, AuditStatus::Written { .. })
    }
}

/// Outcome of a successfully sent submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub submission_id: SubmissionId,
    pub submitter: SubmitterId,
    pub attachments_sent: usize,
    pub released: ReleaseReport,
    pub audit: AuditStatus,
    pub connection: ConnectionId,
}

#[derive(Clone)]
pub struct Reconciler {
    audit: Arc<dyn AuditStore>,
    metrics: Option<FieldlogMetrics>,
}

impl Reconciler {
    pub fn new(audit: Arc<dyn AuditStore>) -> Self {
        Self {
            audit,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: FieldlogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Release attachments, then record the submission if it was sent.
    ///
    /// Returns the dispatch failure as an error when the message was not sent.
    #[tracing::instrument(skip(self, submission), fields(submission_id = %submission.id))]
    pub async fn reconcile(&self, submission: Submission<Dispatched>) -> Result<SubmissionReceipt> {
        let Submission { id, data, state } = submission;
        let attachment_names: Vec<String> = state
            .attachments
            .refs()
            .iter()
            .map(|a| a.original_name.clone())
            .collect();

        let released = state.attachments.release().await;
        if released.failed > 0 {
            tracing::warn!(
                removed = released.removed,
                failed = released.failed,
                "Some staged attachments could not be removed"
            );
        }

        let receipt = match state.outcome {
            DispatchOutcome::Failed(failure) => {
                tracing::warn!(error = %failure, "Submission not sent; no audit record written");
                return Err(FieldlogError::Dispatch(failure));
            }
            DispatchOutcome::Sent(receipt) => receipt,
        };

        let entry = AuditEntry::from_submission(id, &data, attachment_names.clone());
        let audit = match self.audit.append(entry).await {
            Ok(record) => {
                self.record_audit("written");
                AuditStatus::Written {
                    created_at: record.created_at,
                }
            }
            Err(e) => {
                // The message is already sent; only the history entry is lost
                tracing::error!(
                    submitter = %data.submitter,
                    error = %e,
                    "Failed to write audit record for sent submission"
                );
                self.record_audit("failed");
                AuditStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };

        Ok(SubmissionReceipt {
            submission_id: id,
            submitter: data.submitter,
            attachments_sent: attachment_names.len(),
            released,
            audit,
            connection: receipt.connection,
        })
    }

    fn record_audit(&self, status: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_audit_write(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::audit::{AuditRecord, InMemoryAuditStore};
    use crate::domain::submission::{SubmissionData, UploadedPart};
    use crate::error::DispatchFailure;
    use crate::staging::{Stager, StagingConfig};
    use crate::transport::DispatchReceipt;

    struct FailingAuditStore;

    #[async_trait]
    impl AuditStore for FailingAuditStore {
        async fn append(&self, _entry: AuditEntry) -> Result<AuditRecord> {
            Err(FieldlogError::AuditWrite("database unavailable".to_string()))
        }

        async fn list_for_submitter(
            &self,
            _submitter: &SubmitterId,
            _limit: Option<usize>,
        ) -> Result<Vec<AuditRecord>> {
            Ok(Vec::new())
        }
    }

    fn data() -> SubmissionData {
        SubmissionData {
            submitter: SubmitterId::new("jeff@example.com"),
            foreman_name: "Jeff LaFave".to_string(),
            foreman_hours: "8".to_string(),
            date: "01/15/2024".to_string(),
            job_number: "J-500".to_string(),
            task_description: "Replaced valve".to_string(),
            employees: Vec::new(),
        }
    }

    async fn dispatched(
        stager: &Stager,
        outcome: DispatchOutcome,
    ) -> (Submission<Dispatched>, Vec<std::path::PathBuf>) {
        let parts = vec![UploadedPart {
            file_name: Some("photo_1.jpg".to_string()),
            content_type: Some("image/jpeg".to_string()),
            data: Bytes::from_static(b"jpeg"),
        }];
        let attachments = stager.stage(parts).await.unwrap();
        let paths = attachments.refs().iter().map(|a| a.location.clone()).collect();
        (
            Submission {
                id: SubmissionId::new(),
                data: data(),
                state: Dispatched {
                    attachments,
                    outcome,
                },
            },
            paths,
        )
    }

    fn sent() -> DispatchOutcome {
        DispatchOutcome::Sent(DispatchReceipt {
            connection: ConnectionId(1),
            queued_for: Duration::ZERO,
            elapsed: Duration::from_millis(5),
        })
    }

    fn stager(dir: &tempfile::TempDir) -> Stager {
        Stager::new(&StagingConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_sent_submission_releases_and_audits() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(&dir);
        let store = Arc::new(InMemoryAuditStore::new());
        let reconciler = Reconciler::new(store.clone());

        let (submission, paths) = dispatched(&stager, sent()).await;
        let receipt = reconciler.reconcile(submission).await.unwrap();

        assert!(paths.iter().all(|p| !p.exists()));
        assert_eq!(receipt.released.removed, 1);
        assert_eq!(receipt.attachments_sent, 1);
        assert!(receipt.audit.is_written());

        let records = store
            .list_for_submitter(&SubmitterId::new("jeff@example.com"), None)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.attachment_names, vec!["photo_1.jpg"]);
    }

    #[tokio::test]
    async fn test_failed_dispatch_releases_without_audit() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(&dir);
        let store = Arc::new(InMemoryAuditStore::new());
        let reconciler = Reconciler::new(store.clone());

        let (submission, paths) =
            dispatched(&stager, DispatchOutcome::Failed(DispatchFailure::SendTimeout)).await;
        let err = reconciler.reconcile(submission).await.unwrap_err();

        assert!(matches!(
            err,
            FieldlogError::Dispatch(DispatchFailure::SendTimeout)
        ));
        assert!(paths.iter().all(|p| !p.exists()));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_submission() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(&dir);
        let metrics = FieldlogMetrics::new(prometheus::Registry::new()).unwrap();
        let reconciler = Reconciler::new(Arc::new(FailingAuditStore)).with_metrics(metrics.clone());

        let (submission, paths) = dispatched(&stager, sent()).await;
        let receipt = reconciler.reconcile(submission).await.unwrap();

        assert!(paths.iter().all(|p| !p.exists()));
        match receipt.audit {
            AuditStatus::Failed { reason } => assert!(reason.contains("database unavailable")),
            other => panic!("Expected failed audit, got {:?}", other),
        }
        assert!(
            metrics
                .render()
                .unwrap()
                .contains("fieldlog_audit_writes_total{status=\"failed\"} 1")
        );
    }
}

//! Audit log of successfully sent submissions.
//!
//! One record per submission whose notification the relay accepted, keyed by
//! submitter. Records are listed most recent first; the store assigns
//! `created_at` so ordering does not depend on client clocks.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::domain::submission::{EmployeeHours, SubmissionData, SubmissionId, SubmitterId};
use crate::error::Result;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Fields written for one sent submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub submission_id: SubmissionId,
    pub submitter: SubmitterId,
    pub foreman: String,
    pub foreman_hours: String,
    pub date: String,
    pub job_number: String,
    pub employees: Vec<EmployeeHours>,
    pub task_description: String,
    /// Original names of the photos that were attached
    pub attachment_names: Vec<String>,
}

impl AuditEntry {
    pub fn from_submission(
        submission_id: SubmissionId,
        data: &SubmissionData,
        attachment_names: Vec<String>,
    ) -> Self {
        Self {
            submission_id,
            submitter: data.submitter.clone(),
            foreman: data.foreman_name.clone(),
            foreman_hours: data.foreman_hours.clone(),
            date: data.date.clone(),
            job_number: data.job_number.clone(),
            employees: data.employees.clone(),
            task_description: data.task_description.clone(),
            attachment_names,
        }
    }
}

/// A stored audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

/// Append-only store of audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Store an entry, stamping it with the store's clock.
    async fn append(&self, entry: AuditEntry) -> Result<AuditRecord>;

    /// Records for one submitter, most recent first.
    async fn list_for_submitter(
        &self,
        submitter: &SubmitterId,
        limit: Option<usize>,
    ) -> Result<Vec<AuditRecord>>;
}

/// Process-local audit store, used in development and tests.
#[derive(Default)]
pub struct InMemoryAuditStore {
    records: RwLock<HashMap<SubmitterId, Vec<AuditRecord>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all submitters.
    pub fn len(&self) -> usize {
        self.records.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<AuditRecord> {
        let record = AuditRecord {
            created_at: Utc::now(),
            entry,
        };
        self.records
            .write()
            .entry(record.entry.submitter.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn list_for_submitter(
        &self,
        submitter: &SubmitterId,
        limit: Option<usize>,
    ) -> Result<Vec<AuditRecord>> {
        let records = self.records.read();
        let Some(list) = records.get(submitter) else {
            return Ok(Vec::new());
        };
        // Appends arrive in clock order, so reverse insertion order is newest first
        Ok(list
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(submitter: &str, job: &str) -> AuditEntry {
        AuditEntry {
            submission_id: SubmissionId::new(),
            submitter: SubmitterId::new(submitter),
            foreman: "Jeff LaFave".to_string(),
            foreman_hours: "8".to_string(),
            date: "01/15/2024".to_string(),
            job_number: job.to_string(),
            employees: vec![EmployeeHours {
                name: "Joe Baker".to_string(),
                hours: "8".to_string(),
            }],
            task_description: "Replaced valve".to_string(),
            attachment_names: vec!["photo_1.jpg".to_string()],
        }
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_scoped_to_submitter() {
        let store = InMemoryAuditStore::new();
        store.append(entry("a@example.com", "J-1")).await.unwrap();
        store.append(entry("b@example.com", "J-2")).await.unwrap();
        store.append(entry("a@example.com", "J-3")).await.unwrap();

        let records = store
            .list_for_submitter(&SubmitterId::new("a@example.com"), None)
            .await
            .unwrap();
        let jobs: Vec<_> = records.iter().map(|r| r.entry.job_number.as_str()).collect();
        assert_eq!(jobs, vec!["J-3", "J-1"]);
        assert!(records[0].created_at >= records[1].created_at);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_list_respects_limit_and_unknown_submitter() {
        let store = InMemoryAuditStore::new();
        for i in 0..5 {
            store
                .append(entry("a@example.com", &format!("J-{i}")))
                .await
                .unwrap();
        }

        let records = store
            .list_for_submitter(&SubmitterId::new("a@example.com"), Some(2))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entry.job_number, "J-4");

        let none = store
            .list_for_submitter(&SubmitterId::new("nobody@example.com"), None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_record_serializes_flat_camel_case() {
        let record = AuditRecord {
            created_at: Utc::now(),
            entry: entry("a@example.com", "J-1"),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["jobNumber"], "J-1");
        assert_eq!(json["submitter"], "a@example.com");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("entry").is_none());
    }
}

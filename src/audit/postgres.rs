//! PostgreSQL-backed audit store.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use crate::domain::submission::{EmployeeHours, SubmissionId, SubmitterId};
use crate::error::{FieldlogError, Result};

use super::{AuditEntry, AuditRecord, AuditStore};

/// Audit store over the `audit_records` table.
///
/// Run [`crate::migrator`] against the pool before use.
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &PgRow) -> std::result::Result<AuditRecord, sqlx::Error> {
    let employees: Json<Vec<EmployeeHours>> = row.try_get("employees")?;
    let attachment_names: Json<Vec<String>> = row.try_get("attachment_names")?;
    let submission_id: uuid::Uuid = row.try_get("submission_id")?;
    let submitter: String = row.try_get("submitter")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(AuditRecord {
        created_at,
        entry: AuditEntry {
            submission_id: SubmissionId::from(submission_id),
            submitter: SubmitterId::new(submitter),
            foreman: row.try_get("foreman")?,
            foreman_hours: row.try_get("foreman_hours")?,
            date: row.try_get("date")?,
            job_number: row.try_get("job_number")?,
            employees: employees.0,
            task_description: row.try_get("task_description")?,
            attachment_names: attachment_names.0,
        },
    })
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    #[tracing::instrument(skip(self, entry), fields(submission_id = %entry.submission_id))]
    async fn append(&self, entry: AuditEntry) -> Result<AuditRecord> {
        let created_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO audit_records (
                submission_id, submitter, foreman, foreman_hours, date,
                job_number, employees, task_description, attachment_names
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING created_at
            "#,
        )
        .bind(*entry.submission_id)
        .bind(entry.submitter.as_str())
        .bind(&entry.foreman)
        .bind(&entry.foreman_hours)
        .bind(&entry.date)
        .bind(&entry.job_number)
        .bind(Json(&entry.employees))
        .bind(&entry.task_description)
        .bind(Json(&entry.attachment_names))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| FieldlogError::AuditWrite(format!("Failed to insert audit record: {}", e)))?;

        Ok(AuditRecord { created_at, entry })
    }

    async fn list_for_submitter(
        &self,
        submitter: &SubmitterId,
        limit: Option<usize>,
    ) -> Result<Vec<AuditRecord>> {
        // LIMIT NULL is no limit
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows = sqlx::query(
            r#"
            SELECT submission_id, submitter, created_at, foreman, foreman_hours, date,
                   job_number, employees, task_description, attachment_names
            FROM audit_records
            WHERE submitter = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(submitter.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FieldlogError::Other(anyhow!("Failed to list audit records: {}", e)))?;

        rows.iter()
            .map(|row| {
                record_from_row(row).map_err(|e| {
                    FieldlogError::Other(anyhow!("Failed to decode audit record: {}", e))
                })
            })
            .collect()
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
            attachment_names: vec!["photo_1.jpg".to_string(), "photo_2.jpg".to_string()],
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    #[test_log::test]
    async fn test_append_and_list_newest_first(pool: PgPool) {
        let store = PostgresAuditStore::new(pool);
        let first = store.append(entry("a@example.com", "J-1")).await.unwrap();
        store.append(entry("b@example.com", "J-2")).await.unwrap();
        store.append(entry("a@example.com", "J-3")).await.unwrap();

        let records = store
            .list_for_submitter(&SubmitterId::new("a@example.com"), None)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entry.job_number, "J-3");
        assert_eq!(records[1].entry, first.entry);
        assert_eq!(records[1].entry.attachment_names.len(), 2);

        let limited = store
            .list_for_submitter(&SubmitterId::new("a@example.com"), Some(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].entry.job_number, "J-3");
    }

    #[sqlx::test(migrations = "./migrations")]
    #[test_log::test]
    async fn test_duplicate_submission_is_rejected(pool: PgPool) {
        let store = PostgresAuditStore::new(pool);
        let e = entry("a@example.com", "J-1");
        store.append(e.clone()).await.unwrap();

        let err = store.append(e).await.unwrap_err();
        assert!(matches!(err, FieldlogError::AuditWrite(_)));
    }
}

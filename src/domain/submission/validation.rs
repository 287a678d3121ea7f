//! Submission validation.
//!
//! Pure function of its input: no staging or network I/O happens until a
//! submission has passed every check here.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::state::{
    EmployeeHours, RawSubmission, Submission, SubmissionData, SubmissionId, SubmitterId, Validated,
};

/// Hard ceiling on attachments per submission.
pub const MAX_ATTACHMENTS: usize = 20;

/// Limits applied by [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationLimits {
    pub max_attachments: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_attachments: MAX_ATTACHMENTS,
        }
    }
}

/// Validate a raw submission.
///
/// Checks run in a fixed order and the first violation is returned:
/// 1. required scalar fields are non-empty (after trimming)
/// 2. every employee row has hours
/// 3. the attachment count is within `limits.max_attachments`
pub fn validate(
    raw: RawSubmission,
    limits: &ValidationLimits,
) -> Result<Submission<Validated>, ValidationError> {
    let submitter = required("userEmail", raw.submitter.as_deref().unwrap_or_default())?;
    let foreman_name = required("foreman", &raw.foreman_name)?;
    let foreman_hours = required("foremanHours", &raw.foreman_hours)?;
    let date = required("date", &raw.date)?;
    let job_number = required("jobNumber", &raw.job_number)?;
    let task_description = required("taskDescription", &raw.task_description)?;

    let mut employees = Vec::with_capacity(raw.employees.len());
    for (i, employee) in raw.employees.iter().enumerate() {
        let hours = employee.hours.trim();
        if hours.is_empty() {
            return Err(ValidationError::MissingEmployeeHours {
                index: i + 1,
                name: employee.name.trim().to_string(),
            });
        }
        employees.push(EmployeeHours {
            name: employee.name.trim().to_string(),
            hours: hours.to_string(),
        });
    }

    let count = raw.attachment_count();
    if count > limits.max_attachments {
        return Err(ValidationError::TooManyAttachments {
            count,
            max: limits.max_attachments,
        });
    }

    Ok(Submission {
        id: SubmissionId::new(),
        data: SubmissionData {
            submitter: SubmitterId::new(submitter),
            foreman_name,
            foreman_hours,
            date,
            job_number,
            task_description,
            employees,
        },
        state: Validated { parts: raw.parts },
    })
}

fn required(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(value.to_string())
}

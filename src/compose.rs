//! Rendering a submission into the office notification message.
//!
//! Pure transformation: attachments are referenced by their staged location
//! and read only by the relay connection at send time.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::submission::{SubmissionData, SubmissionId};
use crate::staging::AttachmentRef;

/// Fixed addressing for composed messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeOptions {
    /// The single office address every log is sent to
    pub recipient: String,
}

/// An attachment as the relay will transmit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundAttachment {
    pub display_name: String,
    pub source: PathBuf,
    pub content_type: String,
}

/// A fully rendered notification, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub submission_id: SubmissionId,
    pub recipient: String,
    pub subject: String,
    pub body_text: String,
    pub attachments: Vec<OutboundAttachment>,
}

/// Render a submission and its staged attachments.
pub fn compose(
    submission_id: SubmissionId,
    data: &SubmissionData,
    attachments: &[AttachmentRef],
    options: &ComposeOptions,
) -> OutboundMessage {
    OutboundMessage {
        submission_id,
        recipient: options.recipient.clone(),
        subject: format!("Daily Log - {} - {}", data.date, data.foreman_name),
        body_text: render_body(data),
        attachments: attachments
            .iter()
            .map(|a| OutboundAttachment {
                display_name: a.original_name.clone(),
                source: a.location.clone(),
                content_type: a.content_type.clone(),
            })
            .collect(),
    }
}

fn render_body(data: &SubmissionData) -> String {
    let employees = data
        .employees
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {} - {} hours", i + 1, e.name, e.hours))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Submitted by: {}\n\
         Foreman: {} - {} hours\n\
         Date: {}\n\
         Job #: {}\n\
         \n\
         Employees:\n\
         {}\n\
         \n\
         Task Description:\n\
         {}\n",
        data.submitter,
        data.foreman_name,
        data.foreman_hours,
        data.date,
        data.job_number,
        employees,
        data.task_description,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::submission::{EmployeeHours, SubmitterId};

    fn data() -> SubmissionData {
        SubmissionData {
            submitter: SubmitterId::new("jeff@example.com"),
            foreman_name: "Jeff LaFave".to_string(),
            foreman_hours: "8".to_string(),
            date: "01/15/2024".to_string(),
            job_number: "J-500".to_string(),
            task_description: "Replaced valve".to_string(),
            employees: vec![
                EmployeeHours {
                    name: "Joe Baker".to_string(),
                    hours: "8".to_string(),
                },
                EmployeeHours {
                    name: "Sam Ortiz".to_string(),
                    hours: "6.5".to_string(),
                },
            ],
        }
    }

    fn options() -> ComposeOptions {
        ComposeOptions {
            recipient: "office@example.com".to_string(),
        }
    }

    #[test]
    fn test_subject_has_date_and_foreman_only() {
        let message = compose(SubmissionId::new(), &data(), &[], &options());
        assert_eq!(message.subject, "Daily Log - 01/15/2024 - Jeff LaFave");
        assert!(!message.subject.contains("J-500"));
        assert_eq!(message.recipient, "office@example.com");
    }

    #[test]
    fn test_body_renders_all_fields() {
        let message = compose(SubmissionId::new(), &data(), &[], &options());
        let expected = "Submitted by: jeff@example.com\n\
                        Foreman: Jeff LaFave - 8 hours\n\
                        Date: 01/15/2024\n\
                        Job #: J-500\n\
                        \n\
                        Employees:\n\
                        1. Joe Baker - 8 hours\n\
                        2. Sam Ortiz - 6.5 hours\n\
                        \n\
                        Task Description:\n\
                        Replaced valve\n";
        assert_eq!(message.body_text, expected);
    }

    #[test]
    fn test_attachments_keep_order_and_names() {
        let refs = vec![
            AttachmentRef {
                original_name: "photo_1.jpg".to_string(),
                location: PathBuf::from("/tmp/x/01-photo_1.jpg"),
                size_bytes: 10,
                content_type: "image/jpeg".to_string(),
            },
            AttachmentRef {
                original_name: "photo_2.jpg".to_string(),
                location: PathBuf::from("/tmp/x/02-photo_2.jpg"),
                size_bytes: 12,
                content_type: "image/jpeg".to_string(),
            },
        ];
        let message = compose(SubmissionId::new(), &data(), &refs, &options());
        let names: Vec<_> = message
            .attachments
            .iter()
            .map(|a| a.display_name.as_str())
            .collect();
        assert_eq!(names, vec!["photo_1.jpg", "photo_2.jpg"]);
        assert_eq!(message.attachments[1].source, refs[1].location);
    }
}

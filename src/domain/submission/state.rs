//! Submission types and lifecycle states.
//!
//! A submission moves through the pipeline as `Submission<State>`, where each
//! state type carries exactly the resources that exist at that point: uploaded
//! bytes before staging, the staged-file guard afterwards, and the composed
//! message and dispatch outcome later on.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::compose::OutboundMessage;
use crate::staging::StagedAttachments;
use crate::transport::DispatchOutcome;

/// Unique identifier for a submission, assigned when validation succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        SubmissionId(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubmissionId {
    fn from(uuid: Uuid) -> Self {
        SubmissionId(uuid)
    }
}

impl std::ops::Deref for SubmissionId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Authenticated identity of the worker who submitted a log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmitterId(String);

impl SubmitterId {
    pub fn new(id: impl Into<String>) -> Self {
        SubmitterId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hours one crew member worked on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeHours {
    pub name: String,
    pub hours: String,
}

/// Structured fields of a validated submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionData {
    pub submitter: SubmitterId,
    pub foreman_name: String,
    pub foreman_hours: String,
    pub date: String,
    pub job_number: String,
    pub task_description: String,
    pub employees: Vec<EmployeeHours>,
}

/// One binary part of an upload, held in memory until staged.
#[derive(Debug, Clone)]
pub struct UploadedPart {
    /// File name declared by the client, if any
    pub file_name: Option<String>,
    /// Content type declared by the client, if any
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Employee row as submitted; hours may arrive as a JSON string or number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawEmployee {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub hours: String,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Unvalidated submission exactly as received at the boundary.
#[derive(Debug, Clone, Default)]
pub struct RawSubmission {
    pub submitter: Option<String>,
    pub foreman_name: String,
    pub foreman_hours: String,
    pub date: String,
    pub job_number: String,
    pub task_description: String,
    pub employees: Vec<RawEmployee>,
    pub parts: Vec<UploadedPart>,
    /// Attachment parts the boundary counted but did not buffer
    pub discarded_parts: usize,
}

impl RawSubmission {
    /// Total number of attachment parts the caller sent.
    pub fn attachment_count(&self) -> usize {
        self.parts.len() + self.discarded_parts
    }
}

/// Pipeline stage, used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStage {
    Validating,
    Staging,
    Composing,
    Dispatching,
    Succeeded,
    Failed,
}

impl fmt::Display for SubmissionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionStage::Validating => "validating",
            SubmissionStage::Staging => "staging",
            SubmissionStage::Composing => "composing",
            SubmissionStage::Dispatching => "dispatching",
            SubmissionStage::Succeeded => "succeeded",
            SubmissionStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Marker trait for valid submission states.
pub trait SubmissionState: Send + Sync {
    /// The stage a submission in this state is about to run.
    const STAGE: SubmissionStage;
}

/// A submission moving through the dispatch pipeline.
///
/// The generic parameter `T` is the current lifecycle state; transitions in
/// [`super::transitions`] consume the submission and return the next state.
#[derive(Debug)]
pub struct Submission<T: SubmissionState> {
    pub id: SubmissionId,
    pub data: SubmissionData,
    pub state: T,
}

impl<T: SubmissionState> Submission<T> {
    pub fn current_stage(&self) -> SubmissionStage {
        T::STAGE
    }
}

/// Fields are valid; attachments are still in memory.
#[derive(Debug)]
pub struct Validated {
    pub parts: Vec<UploadedPart>,
}

impl SubmissionState for Validated {
    const STAGE: SubmissionStage = SubmissionStage::Staging;
}

/// Attachments are on disk and owned by the staging guard.
#[derive(Debug)]
pub struct Staged {
    pub attachments: StagedAttachments,
}

impl SubmissionState for Staged {
    const STAGE: SubmissionStage = SubmissionStage::Composing;
}

/// Notification message rendered; ready to hand to the transport.
#[derive(Debug)]
pub struct Composed {
    pub attachments: StagedAttachments,
    pub message: OutboundMessage,
}

impl SubmissionState for Composed {
    const STAGE: SubmissionStage = SubmissionStage::Dispatching;
}

/// The transport has reported a terminal outcome; awaiting reconciliation.
#[derive(Debug)]
pub struct Dispatched {
    pub attachments: StagedAttachments,
    pub outcome: DispatchOutcome,
}

impl SubmissionState for Dispatched {
    const STAGE: SubmissionStage = SubmissionStage::Dispatching;
}

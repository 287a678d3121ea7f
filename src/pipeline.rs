//! The submission pipeline: validate, stage, compose, dispatch, reconcile.
//!
//! Validation runs inline and touches nothing outside the submission. Every
//! later stage runs in a spawned task that the caller awaits, so a caller that
//! goes away (client disconnect, request timeout) cannot cut the pipeline
//! short between staging and release.

use std::sync::Arc;

use anyhow::anyhow;
use tokio::time::Instant;
use tracing::Instrument;

use crate::audit::AuditStore;
use crate::compose::ComposeOptions;
use crate::domain::submission::{
    RawSubmission, Submission, SubmissionId, SubmissionStage, Validated, ValidationLimits,
    validate,
};
use crate::error::{FieldlogError, Result};
use crate::metrics::FieldlogMetrics;
use crate::reconcile::{Reconciler, SubmissionReceipt};
use crate::staging::Stager;
use crate::transport::DispatchTransport;

#[derive(Clone)]
pub struct SubmissionPipeline {
    limits: ValidationLimits,
    stager: Stager,
    compose_options: Arc<ComposeOptions>,
    transport: Arc<DispatchTransport>,
    reconciler: Reconciler,
    metrics: Option<FieldlogMetrics>,
}

impl SubmissionPipeline {
    pub fn new(
        limits: ValidationLimits,
        stager: Stager,
        compose_options: ComposeOptions,
        transport: Arc<DispatchTransport>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            limits,
            stager,
            compose_options: Arc::new(compose_options),
            transport,
            reconciler: Reconciler::new(audit),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: FieldlogMetrics) -> Self {
        self.reconciler = self.reconciler.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn stager(&self) -> &Stager {
        &self.stager
    }

    pub fn transport(&self) -> &Arc<DispatchTransport> {
        &self.transport
    }

    /// Run one submission to its terminal outcome.
    ///
    /// Invalid submissions are rejected before any staging or network I/O.
    pub async fn submit(&self, raw: RawSubmission) -> Result<SubmissionReceipt> {
        let submission = match validate(raw, &self.limits) {
            Ok(submission) => submission,
            Err(e) => {
                tracing::info!(
                    stage = %SubmissionStage::Validating,
                    error = %e,
                    "Submission rejected"
                );
                self.record_submission("rejected");
                return Err(e.into());
            }
        };

        let span = tracing::info_span!(
            "submission",
            submission_id = %submission.id,
            submitter = %submission.data.submitter,
        );
        let pipeline = self.clone();
        let handle = tokio::spawn(async move { pipeline.run(submission).await }.instrument(span));

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(FieldlogError::Other(anyhow!("Submission task failed: {}", e))),
        };

        match &result {
            Ok(receipt) => {
                tracing::info!(
                    stage = %SubmissionStage::Succeeded,
                    submission_id = %receipt.submission_id,
                    attachments = receipt.attachments_sent,
                    audit_written = receipt.audit.is_written(),
                    "Submission sent"
                );
                self.record_submission("sent");
            }
            Err(e) => {
                tracing::warn!(
                    stage = %SubmissionStage::Failed,
                    error = %e,
                    kind = e.kind(),
                    "Submission failed"
                );
                self.record_submission(e.kind());
            }
        }
        result
    }

    async fn run(self, submission: Submission<Validated>) -> Result<SubmissionReceipt> {
        let id: SubmissionId = submission.id;
        tracing::debug!(stage = %submission.current_stage(), "Submission validated");

        let staged = submission.stage(&self.stager).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_attachments_staged(staged.state.attachments.len());
        }

        let composed = staged.compose(&self.compose_options);
        tracing::debug!(
            subject = %composed.state.message.subject,
            "Composed notification"
        );

        if let Some(metrics) = &self.metrics {
            metrics.set_dispatch_queue_depth(self.transport.stats().queued);
        }
        let started = Instant::now();
        let dispatched = composed.dispatch(&self.transport).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(dispatched.state.outcome.label(), started.elapsed());
        }
        tracing::debug!(
            submission_id = %id,
            outcome = dispatched.state.outcome.label(),
            "Dispatch finished"
        );

        dispatched.reconcile(&self.reconciler).await
    }

    fn record_submission(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_submission(outcome);
        }
    }
}

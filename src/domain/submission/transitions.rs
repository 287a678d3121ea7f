//! State transitions for submissions.
//!
//! ```text
//! Submission<Validated> ──stage()──> Submission<Staged> ──compose()──> Submission<Composed>
//!                                                                            │
//!                          SubmissionReceipt <──reconcile()── Submission<Dispatched> <──dispatch()──┘
//! ```
//!
//! Every transition consumes the submission. Once staging succeeds the staged
//! files travel inside the state value, so they are released by
//! `reconcile()` on every dispatch outcome, or by the guard's `Drop` if the
//! submission is abandoned before reaching it.

use crate::compose::{ComposeOptions, compose};
use crate::error::Result;
use crate::reconcile::{Reconciler, SubmissionReceipt};
use crate::staging::Stager;
use crate::transport::DispatchTransport;

use super::state::{Composed, Dispatched, Staged, Submission, Validated};

impl Submission<Validated> {
    /// Write the uploaded parts to a fresh per-submission staging directory.
    ///
    /// On failure nothing remains on disk.
    pub async fn stage(self, stager: &Stager) -> Result<Submission<Staged>> {
        let attachments = stager.stage(self.state.parts).await?;
        tracing::debug!(
            submission_id = %self.id,
            attachments = attachments.len(),
            dir = %attachments.dir().display(),
            "Staged attachments"
        );
        Ok(Submission {
            id: self.id,
            data: self.data,
            state: Staged { attachments },
        })
    }
}

impl Submission<Staged> {
    pub fn compose(self, options: &ComposeOptions) -> Submission<Composed> {
        let message = compose(self.id, &self.data, self.state.attachments.refs(), options);
        Submission {
            id: self.id,
            data: self.data,
            state: Composed {
                attachments: self.state.attachments,
                message,
            },
        }
    }
}

impl Submission<Composed> {
    /// Hand the message to the transport and wait for its terminal outcome.
    ///
    /// Never fails: transport failures are carried in the outcome so that
    /// reconciliation sees them.
    pub async fn dispatch(self, transport: &DispatchTransport) -> Submission<Dispatched> {
        let outcome = transport.send(self.state.message).await;
        Submission {
            id: self.id,
            data: self.data,
            state: Dispatched {
                attachments: self.state.attachments,
                outcome,
            },
        }
    }
}

impl Submission<Dispatched> {
    pub async fn reconcile(self, reconciler: &Reconciler) -> Result<SubmissionReceipt> {
        reconciler.reconcile(self).await
    }
}

//! Submission aggregate: types, validation and lifecycle transitions.

pub mod state;
pub mod transitions;
pub mod validation;

pub use state::*;
pub use validation::{MAX_ATTACHMENTS, ValidationLimits, validate};

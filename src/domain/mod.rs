//! Core domain types for field-log submissions.
//!
//! Pure types and transitions with no HTTP or persistence dependencies.

pub mod submission;

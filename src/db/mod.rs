//! Local journal of end-call submissions.
//!
//! A row is written once local cleanup of a call is done and flipped to
//! `Acknowledged` when the backend confirms the upload, so a crash in between
//! is resumed with the same session id instead of producing a second upload.

mod connection;
mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use models::{SubmissionRecord, SubmissionState};

pub mod submission;

pub use submission::{SubmissionRecord, SubmissionState};

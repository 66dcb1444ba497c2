//! Read-only view of a candidate's progress through the hiring stages.

pub mod tracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use tracker::PipelineTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewStageStatus {
    NotScheduled,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl InterviewStageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InterviewStageStatus::Completed
                | InterviewStageStatus::Cancelled
                | InterviewStageStatus::NoShow
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            InterviewStageStatus::NotScheduled => "not scheduled",
            InterviewStageStatus::Scheduled => "scheduled",
            InterviewStageStatus::InProgress => "in progress",
            InterviewStageStatus::Completed => "completed",
            InterviewStageStatus::Cancelled => "cancelled",
            InterviewStageStatus::NoShow => "no show",
        }
    }

    fn marker(&self) -> &'static str {
        match self {
            InterviewStageStatus::NotScheduled => "[ ]",
            InterviewStageStatus::Scheduled => "[~]",
            InterviewStageStatus::InProgress => "[>]",
            InterviewStageStatus::Completed => "[x]",
            InterviewStageStatus::Cancelled | InterviewStageStatus::NoShow => "[-]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub name: String,
    pub status: InterviewStageStatus,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub application_id: String,
    #[serde(default)]
    pub stages: Vec<StageProgress>,
}

impl PipelineProgress {
    /// No further server-side transitions are expected.
    pub fn is_settled(&self) -> bool {
        !self.stages.is_empty() && self.stages.iter().all(|s| s.status.is_terminal())
    }

    /// The first stage that is not finished yet.
    pub fn current_stage(&self) -> Option<&StageProgress> {
        self.stages.iter().find(|s| !s.status.is_terminal())
    }

    pub fn completed_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == InterviewStageStatus::Completed)
            .count()
    }
}

/// Plain-text rendering, one line per stage.
pub fn render(progress: &PipelineProgress) -> String {
    let mut out = format!(
        "Application {} ({}/{} stages completed)\n",
        progress.application_id,
        progress.completed_count(),
        progress.stages.len()
    );

    if progress.stages.is_empty() {
        out.push_str("  no interview stages yet\n");
        return out;
    }

    let width = progress
        .stages
        .iter()
        .map(|s| s.name.chars().count())
        .max()
        .unwrap_or(0);

    for stage in &progress.stages {
        out.push_str(&format!(
            "  {} {:<width$}  {}",
            stage.status.marker(),
            stage.name,
            stage.status.label(),
        ));
        if let (InterviewStageStatus::Scheduled, Some(at)) = (stage.status, stage.scheduled_at) {
            out.push_str(&format!(" for {}", at.format("%Y-%m-%d %H:%M UTC")));
        }
        out.push('\n');
    }
    out
}

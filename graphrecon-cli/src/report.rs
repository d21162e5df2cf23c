//! Per-step results and how they are printed.

use std::process::ExitCode;

use graphrecon_core::{Classification, ErrorInfo, Lookup, OperationOutcome, OutcomeStatus, PropagationState};
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::config::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    AlreadyExists,
    Updated,
    Failed,
    Skipped,
    Present,
    Absent,
    Ambiguous,
    Ready,
    TimedOut,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Created => "created",
            StepStatus::AlreadyExists => "exists",
            StepStatus::Updated => "updated",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "skipped",
            StepStatus::Present => "present",
            StepStatus::Absent => "absent",
            StepStatus::Ambiguous => "AMBIGUOUS",
            StepStatus::Ready => "ready",
            StepStatus::TimedOut => "timed out",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: String,
    pub kind: String,
    pub natural_key: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation: Option<PropagationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub attempts: u32,
    pub detail: String,
}

impl StepReport {
    fn new(step: &Step, status: StepStatus, detail: impl Into<String>) -> Self {
        Self {
            step: step.id.clone(),
            kind: step.descriptor.kind().to_string(),
            natural_key: step.descriptor.natural_key().to_string(),
            status,
            resource_id: None,
            propagation: None,
            classification: None,
            http_status: None,
            attempts: 0,
            detail: detail.into(),
        }
    }

    fn with_error(mut self, error: &ErrorInfo) -> Self {
        self.classification = Some(error.classification);
        self.http_status = error.http_status;
        self
    }

    pub fn skipped(step: &Step, reason: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Skipped, reason)
    }

    pub fn failed(step: &Step, error: &ErrorInfo) -> Self {
        Self::new(step, StepStatus::Failed, error.to_string()).with_error(error)
    }

    pub fn from_outcome(step: &Step, outcome: &OperationOutcome) -> Self {
        let status = match outcome.status() {
            OutcomeStatus::Created => StepStatus::Created,
            OutcomeStatus::AlreadyExists => StepStatus::AlreadyExists,
            OutcomeStatus::Updated => StepStatus::Updated,
            OutcomeStatus::Failed => StepStatus::Failed,
        };
        let detail = match (outcome.error(), outcome.propagation()) {
            (Some(e), _) => e.to_string(),
            (None, Some(PropagationState::Ready)) => "propagated".to_string(),
            (None, Some(PropagationState::TimedOut)) => {
                "not visible yet, rerun later".to_string()
            }
            (None, Some(PropagationState::Pending)) => "propagation not confirmed".to_string(),
            (None, None) if outcome.status() == OutcomeStatus::AlreadyExists => {
                "nothing to do".to_string()
            }
            (None, None) => String::new(),
        };

        let mut report = Self::new(step, status, detail);
        report.resource_id = outcome.resource_id().map(str::to_string);
        report.propagation = outcome.propagation();
        report.attempts = outcome.attempts();
        match outcome.error() {
            Some(e) => report.with_error(e),
            None => report,
        }
    }

    pub fn from_lookup(step: &Step, lookup: &Lookup) -> Self {
        match lookup {
            Lookup::Absent => Self::new(step, StepStatus::Absent, ""),
            Lookup::Present(existing) => {
                let mut report = Self::new(step, StepStatus::Present, "");
                report.resource_id = Some(existing.id.clone());
                report
            }
            Lookup::Ambiguous(matches) => {
                let ids: Vec<&str> = matches.iter().map(|m| m.id.as_str()).collect();
                let mut report = Self::new(
                    step,
                    StepStatus::Ambiguous,
                    format!("{} matches: {}", matches.len(), ids.join(", ")),
                );
                report.classification = Some(Classification::Ambiguous);
                report
            }
        }
    }

    pub fn from_wait(step: &Step, id: &str, state: PropagationState) -> Self {
        let (status, detail) = match state {
            PropagationState::Ready => (StepStatus::Ready, ""),
            PropagationState::TimedOut => (StepStatus::TimedOut, "not visible yet, rerun later"),
            PropagationState::Pending => (StepStatus::Skipped, "cancelled"),
        };
        let mut report = Self::new(step, status, detail);
        report.resource_id = Some(id.to_string());
        report.propagation = Some(state);
        report
    }

    /// Failed lookups or changes, and duplicates that need a human.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Failed | StepStatus::Ambiguous | StepStatus::Absent
        )
    }

    /// Work left for a later run.
    pub fn incomplete(&self) -> bool {
        matches!(self.status, StepStatus::Skipped | StepStatus::TimedOut)
            || self.propagation == Some(PropagationState::TimedOut)
            || self.propagation == Some(PropagationState::Pending)
    }
}

/// 0 when everything settled, 1 when something failed, 2 when nothing
/// failed but work remains (skipped steps, pending propagation).
pub fn exit_code(reports: &[StepReport]) -> ExitCode {
    ExitCode::from(exit_status(reports))
}

fn exit_status(reports: &[StepReport]) -> u8 {
    if reports.iter().any(StepReport::needs_attention) {
        1
    } else if reports.iter().any(StepReport::incomplete) {
        2
    } else {
        0
    }
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "STEP")]
    step: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "KEY")]
    key: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

pub fn render_table(reports: &[StepReport]) -> String {
    let rows: Vec<StepRow> = reports
        .iter()
        .map(|r| StepRow {
            step: r.step.clone(),
            kind: r.kind.clone(),
            key: truncate(&r.natural_key, 32),
            status: r.status.to_string(),
            id: r.resource_id.clone().unwrap_or_else(|| "-".to_string()),
            detail: truncate(&r.detail, 60),
        })
        .collect();
    Table::new(rows).to_string()
}

pub fn render_json(reports: &[StepReport]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(reports)
}

//! Result of one reconciliation.

use std::fmt;

use serde::Serialize;

use crate::error::ErrorInfo;
use crate::propagation::PropagationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Created,
    AlreadyExists,
    Updated,
    Failed,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::AlreadyExists => "already exists",
            Self::Updated => "updated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a reconciliation did. Built once by the reconciler; read-only after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
    /// Calls spent on the mutating step (or the lookup when nothing changed).
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    propagation: Option<PropagationState>,
}

impl OperationOutcome {
    fn new(status: OutcomeStatus, resource_id: Option<String>, error: Option<ErrorInfo>) -> Self {
        Self {
            status,
            resource_id,
            error,
            attempts: 1,
            propagation: None,
        }
    }

    pub fn created(id: impl Into<String>) -> Self {
        Self::new(OutcomeStatus::Created, Some(id.into()), None)
    }

    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::new(OutcomeStatus::AlreadyExists, Some(id.into()), None)
    }

    pub fn updated(id: impl Into<String>) -> Self {
        Self::new(OutcomeStatus::Updated, Some(id.into()), None)
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self::new(OutcomeStatus::Failed, None, Some(error))
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Attach the result of a propagation wait.
    pub fn with_propagation(mut self, state: PropagationState) -> Self {
        self.propagation = Some(state);
        self
    }

    pub fn status(&self) -> OutcomeStatus {
        self.status
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource_id.as_deref()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn propagation(&self) -> Option<PropagationState> {
        self.propagation
    }

    /// The resource exists (whether or not its propagation finished).
    pub fn is_success(&self) -> bool {
        self.status != OutcomeStatus::Failed
    }

    /// Created or patched in this run.
    pub fn changed(&self) -> bool {
        matches!(self.status, OutcomeStatus::Created | OutcomeStatus::Updated)
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, &self.resource_id) {
            (Some(e), _) => write!(f, "{}: {}", self.status, e)?,
            (None, Some(id)) => write!(f, "{} ({})", self.status, id)?,
            (None, None) => write!(f, "{}", self.status)?,
        }
        if self.propagation == Some(PropagationState::TimedOut) {
            write!(f, ", propagation still pending")?;
        }
        Ok(())
    }
}

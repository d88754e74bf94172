//! Batch outcomes and the error policy.

use serde::Serialize;
use tracing::warn;

use super::confirm::PlannedAction;
use crate::db::QueryResult;
use crate::error::{FleetError, Result};

/// What to do with a target-scoped failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log a warning, record the failure and continue with the next target.
    #[default]
    Warn,
    /// Return the failure immediately.
    Raise,
}

/// A failure that affected a single target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub target: String,
    /// The source being executed, if the failure happened during execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub category: String,
    pub message: String,
}

/// Result of one source on one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRecord {
    /// Originating target, set when results must stay attributable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub source: String,
    #[serde(flatten)]
    pub result: QueryResult,
}

/// An action that was not taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub target: String,
    pub reason: String,
}

/// Everything a batch produced.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport<R> {
    pub records: Vec<R>,
    /// Actions reported by a dry run.
    pub planned: Vec<PlannedAction>,
    pub failures: Vec<TargetFailure>,
    pub skipped: Vec<Skipped>,
}

impl<R> Default for BatchReport<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            planned: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

impl<R> BatchReport<R> {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn skip(&mut self, target: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push(Skipped {
            target: target.into(),
            reason: reason.into(),
        });
    }

    /// Applies `policy` to an error raised while processing `target`.
    ///
    /// Batch-fatal errors and any error under [`ErrorPolicy::Raise`] are
    /// returned; target-scoped errors under [`ErrorPolicy::Warn`] are logged
    /// and recorded.
    pub fn record_failure(
        &mut self,
        policy: ErrorPolicy,
        target: &str,
        source: Option<&str>,
        err: FleetError,
    ) -> Result<()> {
        if err.is_batch_fatal() || policy == ErrorPolicy::Raise {
            return Err(err);
        }

        match source {
            Some(source) => warn!(target_name = %target, %source, error = %err, "Target failed"),
            None => warn!(target_name = %target, error = %err, "Target failed"),
        }

        let message = match &err {
            FleetError::Connection(m) | FleetError::Execution(m) => m.clone(),
            other => other.to_string(),
        };
        self.failures.push(TargetFailure {
            target: target.to_string(),
            source: source.map(String::from),
            category: err.category().to_string(),
            message,
        });
        Ok(())
    }
}

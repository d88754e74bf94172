//! Confirm-before-mutate gate.
//!
//! Every action the executor or the membership job is about to take is
//! passed through [`ConfirmationGate::check`], which either records it as
//! planned (dry run), asks the user, or lets it through.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// How much damage an action can do.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    #[default]
    High,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Impact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Impact {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid impact: {s}. Expected: low, medium, or high")),
        }
    }
}

/// One action about to be taken against a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAction {
    pub target: String,
    /// Human-readable description, e.g. `Remove login 'app' from server role 'sysadmin'`.
    pub action: String,
    pub impact: Impact,
}

impl PlannedAction {
    pub fn new(target: impl Into<String>, action: impl Into<String>, impact: Impact) -> Self {
        Self {
            target: target.into(),
            action: action.into(),
            impact,
        }
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({} impact)", self.target, self.action, self.impact)
    }
}

/// Outcome of passing an action through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Execute the action.
    Proceed,
    /// The user declined; do not execute.
    Skip,
    /// Dry run; record the action without executing it.
    Planned,
}

/// Asks the user whether to go ahead with an action.
pub trait Prompter: Send + Sync {
    fn confirm(&self, action: &PlannedAction) -> Result<bool>;
}

/// Prompts on stderr and reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm(&self, action: &PlannedAction) -> Result<bool> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{action}. Continue? [y/N] ")?;
        stderr.flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

/// Answers every prompt the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompter(pub bool);

impl Prompter for FixedPrompter {
    fn confirm(&self, _action: &PlannedAction) -> Result<bool> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    DryRun,
    Apply {
        /// `None` disables prompting.
        threshold: Option<Impact>,
        assume_yes: bool,
    },
}

/// Decides for each action whether it runs, is skipped, or is only planned.
pub struct ConfirmationGate {
    mode: Mode,
    prompter: Box<dyn Prompter>,
}

impl ConfirmationGate {
    /// A gate that never executes anything.
    pub fn dry_run() -> Self {
        Self {
            mode: Mode::DryRun,
            prompter: Box::new(FixedPrompter(false)),
        }
    }

    /// A gate that executes, prompting for actions at or above `threshold`.
    ///
    /// With `assume_yes` or no threshold nothing is prompted.
    pub fn apply(threshold: Option<Impact>, assume_yes: bool) -> Self {
        Self {
            mode: Mode::Apply {
                threshold,
                assume_yes,
            },
            prompter: Box::new(StdinPrompter),
        }
    }

    /// A gate that executes everything without asking.
    pub fn unattended() -> Self {
        Self::apply(None, true)
    }

    /// Replaces the prompter.
    pub fn with_prompter(mut self, prompter: impl Prompter + 'static) -> Self {
        self.prompter = Box::new(prompter);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode == Mode::DryRun
    }

    /// Passes one action through the gate.
    pub fn check(&self, action: &PlannedAction) -> Result<Decision> {
        match self.mode {
            Mode::DryRun => Ok(Decision::Planned),
            Mode::Apply {
                assume_yes: true, ..
            }
            | Mode::Apply {
                threshold: None, ..
            } => Ok(Decision::Proceed),
            Mode::Apply {
                threshold: Some(threshold),
                ..
            } => {
                if action.impact < threshold {
                    return Ok(Decision::Proceed);
                }
                let confirmed = self.prompter.confirm(action).map_err(|e| {
                    FleetError::internal(format!("Failed to read confirmation: {e}"))
                })?;
                Ok(if confirmed {
                    Decision::Proceed
                } else {
                    Decision::Skip
                })
            }
        }
    }
}

impl fmt::Debug for ConfirmationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmationGate")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

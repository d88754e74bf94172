//! Batch execution of SQL sources across targets.
//!
//! Targets and sources are processed strictly in order. A target-scoped
//! failure skips the rest of that target's sources; the next target still
//! runs. Owned contexts are released before moving on, including after a
//! failure.

use std::time::Instant;

use tokio::time::timeout;
use tracing::{debug, info};

use super::binder::{BoundContext, ConnectionBinder};
use super::confirm::{ConfirmationGate, Decision, Impact, PlannedAction};
use super::report::{BatchReport, ErrorPolicy, QueryRecord};
use super::{ExecutionTarget, QueryOptions};
use crate::db::{CommandType, DatabaseBackend, QueryRequest, QueryResult};
use crate::error::{FleetError, Result};
use crate::resolve::{split_batches, Batch, SqlSource};
use crate::safety::{Classification, SqlClassifier};

/// Runs resolved sources against targets.
pub struct BatchExecutor<'a> {
    binder: &'a ConnectionBinder,
    gate: &'a ConfirmationGate,
    policy: ErrorPolicy,
    options: &'a QueryOptions,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(
        binder: &'a ConnectionBinder,
        gate: &'a ConfirmationGate,
        policy: ErrorPolicy,
        options: &'a QueryOptions,
    ) -> Self {
        Self {
            binder,
            gate,
            policy,
            options,
        }
    }

    /// Executes every source against every target.
    ///
    /// Returns `Err` only for batch-fatal errors, or for the first
    /// target-scoped error under [`ErrorPolicy::Raise`].
    pub async fn run(
        &self,
        targets: &[ExecutionTarget],
        sources: &[SqlSource],
    ) -> Result<BatchReport<QueryRecord>> {
        let mut report = BatchReport::default();
        let tag = targets.len() > 1 || self.options.append_instance;

        for target in targets {
            let label = target.label();

            if self.gate.is_dry_run() {
                self.plan_target(target, &label, sources, &mut report)?;
                continue;
            }

            let context = match self.binder.bind(target).await {
                Ok(Some(context)) => context,
                Ok(None) => {
                    report.skip(&label, "database is not accessible");
                    continue;
                }
                Err(e) => {
                    report.record_failure(self.policy, &label, None, e)?;
                    continue;
                }
            };

            let outcome = self
                .run_target(&context, target.backend(), &label, sources, tag, &mut report)
                .await;
            let released = context.release().await;
            outcome?;
            if let Err(e) = released {
                debug!(target_name = %label, error = %e, "Failed to release connection");
            }
        }

        info!(
            targets = targets.len(),
            records = report.records.len(),
            failures = report.failures.len(),
            "Batch finished"
        );
        Ok(report)
    }

    fn plan_target(
        &self,
        target: &ExecutionTarget,
        label: &str,
        sources: &[SqlSource],
        report: &mut BatchReport<QueryRecord>,
    ) -> Result<()> {
        for source in sources {
            let action = self.action_for(target.backend(), label, source)?;
            if self.gate.check(&action)? == Decision::Planned {
                report.planned.push(action);
            }
        }
        Ok(())
    }

    async fn run_target(
        &self,
        context: &BoundContext,
        backend: DatabaseBackend,
        label: &str,
        sources: &[SqlSource],
        tag: bool,
        report: &mut BatchReport<QueryRecord>,
    ) -> Result<()> {
        for source in sources {
            let action = self.action_for(backend, label, source)?;
            match self.gate.check(&action)? {
                Decision::Proceed => {}
                Decision::Planned => {
                    report.planned.push(action);
                    continue;
                }
                Decision::Skip => {
                    report.skip(label, format!("declined: {}", action.action));
                    continue;
                }
            }

            let source_label = source.label();
            debug!(target_name = %label, source = %source_label, "Executing");
            match self.execute_source(context, backend, source.text()?).await {
                Ok(result) => report.records.push(QueryRecord {
                    target: tag.then(|| label.to_string()),
                    source: source_label,
                    result,
                }),
                Err(e) => {
                    report.record_failure(self.policy, label, Some(&source_label), e)?;
                    break;
                }
            }
        }
        Ok(())
    }

    fn action_for(
        &self,
        backend: DatabaseBackend,
        label: &str,
        source: &SqlSource,
    ) -> Result<PlannedAction> {
        let text = source.text()?;
        let (action, impact) = match self.options.command_type {
            CommandType::Text => {
                let classification = classify(backend, text);
                (
                    format!("Execute {} [{classification}]", source.label()),
                    classification.impact(),
                )
            }
            CommandType::Procedure => (format!("Execute procedure {}", text.trim()), Impact::High),
            CommandType::Table => (format!("Read table {}", text.trim()), Impact::Low),
        };
        Ok(PlannedAction::new(label, action, impact))
    }

    async fn execute_source(
        &self,
        context: &BoundContext,
        backend: DatabaseBackend,
        text: &str,
    ) -> Result<QueryResult> {
        let single = |sql: String| vec![Batch { sql, repeat: 1 }];
        let batches = match self.options.command_type {
            CommandType::Text if backend.uses_batch_separator() => split_batches(text),
            CommandType::Text => single(text.to_string()),
            CommandType::Procedure | CommandType::Table => single(text.trim().to_string()),
        };

        let start = Instant::now();
        let mut combined = QueryResult::new();
        for batch in batches {
            let request = QueryRequest {
                sql: batch.sql,
                command_type: self.options.command_type,
                params: self.options.params.clone(),
                capture_messages: self.options.capture_messages,
            };
            for _ in 0..batch.repeat {
                let result = timeout(self.options.timeout, context.client().execute(&request))
                    .await
                    .map_err(|_| {
                        FleetError::execution(format!(
                            "Query timed out after {} seconds",
                            self.options.timeout.as_secs()
                        ))
                    })??;
                combined.absorb(result);
            }
        }
        Ok(combined.with_execution_time(start.elapsed()))
    }
}

fn classify(backend: DatabaseBackend, text: &str) -> Classification {
    let classifier = SqlClassifier::for_backend(backend);
    if backend.uses_batch_separator() {
        let batches = split_batches(text);
        classifier.classify_batches(batches.iter().map(|b| b.sql.as_str()))
    } else {
        classifier.classify(text)
    }
}

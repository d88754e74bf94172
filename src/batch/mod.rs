//! Execution targets and the query batch pipeline.
//!
//! A query invocation validates its target selector, resolves its inputs,
//! runs every source against every target through the [`BatchExecutor`] and
//! finally deletes the temporary artifacts created during resolution, on
//! every exit path.

mod binder;
mod confirm;
mod executor;
mod report;

pub use binder::{BoundContext, ConnectionBinder, Ownership};
pub use confirm::{
    ConfirmationGate, Decision, FixedPrompter, Impact, PlannedAction, Prompter, StdinPrompter,
};
pub use executor::BatchExecutor;
pub use report::{BatchReport, ErrorPolicy, QueryRecord, Skipped, TargetFailure};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::db::{CommandType, DatabaseBackend, QueryParam, ServerClient};
use crate::error::{FleetError, Result};
use crate::instance::InstanceSpec;
use crate::resolve::{InputResolver, QueryInput, SqlSource};

/// Default query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(600);

/// A database on an already open connection.
#[derive(Clone)]
pub struct DatabaseHandle {
    pub server: Arc<dyn ServerClient>,
    pub name: String,
}

impl DatabaseHandle {
    pub fn new(server: Arc<dyn ServerClient>, name: impl Into<String>) -> Self {
        Self {
            server,
            name: name.into(),
        }
    }

    /// `instance/database`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.server.instance().display_name(), self.name)
    }
}

impl fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("instance", &self.server.instance().display_name())
            .field("name", &self.name)
            .finish()
    }
}

/// Something a batch runs against.
#[derive(Debug, Clone)]
pub enum ExecutionTarget {
    /// An instance to connect to.
    Instance(InstanceSpec),
    /// A database on a connection opened by the caller.
    Database(DatabaseHandle),
}

impl ExecutionTarget {
    /// Name used to attribute results and failures.
    pub fn label(&self) -> String {
        match self {
            Self::Instance(spec) => spec.display_name(),
            Self::Database(handle) => handle.label(),
        }
    }

    pub fn backend(&self) -> DatabaseBackend {
        match self {
            Self::Instance(spec) => spec.backend,
            Self::Database(handle) => handle.server.instance().backend,
        }
    }
}

/// Fails unless exactly one kind of target was supplied.
pub fn ensure_single_target_kind(has_instances: bool, has_databases: bool) -> Result<()> {
    match (has_instances, has_databases) {
        (true, true) => Err(FleetError::invalid_argument(
            "Explicit instances and piped databases cannot be combined",
        )),
        (false, false) => Err(FleetError::invalid_argument(
            "No targets given: supply instances or piped databases",
        )),
        _ => Ok(()),
    }
}

/// The targets of one invocation: explicit instances or database handles.
#[derive(Debug, Clone, Default)]
pub struct TargetSelector {
    pub instances: Vec<InstanceSpec>,
    pub databases: Vec<DatabaseHandle>,
}

impl TargetSelector {
    pub fn instances(instances: Vec<InstanceSpec>) -> Self {
        Self {
            instances,
            databases: Vec::new(),
        }
    }

    pub fn databases(databases: Vec<DatabaseHandle>) -> Self {
        Self {
            instances: Vec::new(),
            databases,
        }
    }

    /// Validates the selector and returns targets in input order.
    pub fn into_targets(self) -> Result<Vec<ExecutionTarget>> {
        ensure_single_target_kind(!self.instances.is_empty(), !self.databases.is_empty())?;
        Ok(self
            .instances
            .into_iter()
            .map(ExecutionTarget::Instance)
            .chain(self.databases.into_iter().map(ExecutionTarget::Database))
            .collect())
    }
}

/// How each source is executed.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub command_type: CommandType,
    pub params: Vec<QueryParam>,
    pub timeout: Duration,
    /// Ask the backend for informational messages.
    pub capture_messages: bool,
    /// Tag results with their target even for a single target.
    pub append_instance: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            command_type: CommandType::default(),
            params: Vec::new(),
            timeout: DEFAULT_QUERY_TIMEOUT,
            capture_messages: false,
            append_instance: false,
        }
    }
}

/// What to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryBody {
    /// A single query, run once per target.
    Literal(String),
    /// Inputs resolved into sources, each run per target.
    Inputs(Vec<QueryInput>),
}

/// A complete query request.
#[derive(Debug, Clone)]
pub struct QueryInvocation {
    pub selector: TargetSelector,
    pub body: QueryBody,
    pub options: QueryOptions,
}

/// Runs a query invocation.
///
/// The selector is validated before anything else happens. Temporary
/// artifacts are deleted when this returns, whatever the outcome.
pub async fn invoke_query(
    invocation: QueryInvocation,
    resolver: &InputResolver,
    binder: &ConnectionBinder,
    gate: &ConfirmationGate,
    policy: ErrorPolicy,
) -> Result<BatchReport<QueryRecord>> {
    let QueryInvocation {
        selector,
        body,
        options,
    } = invocation;
    let targets = selector.into_targets()?;

    let outcome = run_invocation(&targets, body, &options, resolver, binder, gate, policy).await;

    let removed = resolver.temp().finalize();
    debug!(removed, "Finalized temporary artifacts");
    outcome
}

async fn run_invocation(
    targets: &[ExecutionTarget],
    body: QueryBody,
    options: &QueryOptions,
    resolver: &InputResolver,
    binder: &ConnectionBinder,
    gate: &ConfirmationGate,
    policy: ErrorPolicy,
) -> Result<BatchReport<QueryRecord>> {
    let sources = resolve_body(body, resolver).await?;
    BatchExecutor::new(binder, gate, policy, options)
        .run(targets, &sources)
        .await
}

/// Resolves a query body into sources with their text loaded.
///
/// Unreadable or undecodable scripts fail here, before any target is touched.
/// Temporary artifacts stay registered with the resolver until finalized.
pub async fn resolve_body(body: QueryBody, resolver: &InputResolver) -> Result<Vec<SqlSource>> {
    let sources = match body {
        QueryBody::Literal(sql) => {
            if sql.trim().is_empty() {
                return Err(FleetError::invalid_argument("Query text is empty"));
            }
            vec![SqlSource::literal(sql)]
        }
        QueryBody::Inputs(inputs) => {
            if inputs.is_empty() {
                return Err(FleetError::invalid_argument("No query inputs given"));
            }
            resolver.resolve(&inputs).await?
        }
    };
    for source in &sources {
        source.text()?;
    }
    Ok(sources)
}

/// Runs sources from [`resolve_body`] against the selected targets.
pub async fn execute_sources(
    selector: TargetSelector,
    sources: &[SqlSource],
    options: &QueryOptions,
    binder: &ConnectionBinder,
    gate: &ConfirmationGate,
    policy: ErrorPolicy,
) -> Result<BatchReport<QueryRecord>> {
    let targets = selector.into_targets()?;
    BatchExecutor::new(binder, gate, policy, options)
        .run(&targets, sources)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectOptions, MockConnector, MockServer};

    #[test]
    fn test_selector_rejects_mixed_targets() {
        let err = ensure_single_target_kind(true, true).unwrap_err();
        assert!(matches!(err, FleetError::InvalidArgument(_)));
        assert!(ensure_single_target_kind(false, false).is_err());
        assert!(ensure_single_target_kind(true, false).is_ok());
    }

    #[tokio::test]
    async fn test_selector_keeps_order() {
        let server = MockServer::new();
        let connector = MockConnector::new().with_server("sql01", server);
        let shared = crate::db::Connector::connect(
            &connector,
            &InstanceSpec::new("sql01"),
            &ConnectOptions::default(),
        )
        .await
        .unwrap();

        let targets = TargetSelector::databases(vec![
            DatabaseHandle::new(Arc::clone(&shared), "b"),
            DatabaseHandle::new(shared, "a"),
        ])
        .into_targets()
        .unwrap();
        let labels: Vec<String> = targets.iter().map(ExecutionTarget::label).collect();
        assert_eq!(labels, vec!["sql01/b", "sql01/a"]);
    }

    #[test]
    fn test_instance_target_label() {
        let target = ExecutionTarget::Instance(InstanceSpec::parse(r"sql01\APP").unwrap());
        assert_eq!(target.label(), r"sql01\APP");
        assert_eq!(target.backend(), DatabaseBackend::Mssql);
    }
}

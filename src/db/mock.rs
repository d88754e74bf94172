//! Mock database servers for testing.
//!
//! Provides an in-memory server model with roles, databases and scripted
//! failures, plus a connector that hands out clients for registered hosts.
//! Every server records what was executed against it so tests can assert on
//! side effects.

use super::{
    filter_roles, ColumnInfo, ConnectOptions, Connector, QueryParam, QueryRequest, QueryResult,
    ScriptableObject, ServerClient, ServerRole, Value,
};
use crate::error::{FleetError, Result};
use crate::instance::InstanceSpec;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A statement executed against a mock server.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub database: Option<String>,
    pub sql: String,
    pub params: Vec<QueryParam>,
}

/// Mutable state of a mock server.
#[derive(Debug, Default)]
pub struct MockState {
    /// Refuse all connections.
    pub unreachable: bool,
    /// Role name to members.
    pub roles: BTreeMap<String, Vec<String>>,
    /// Databases the login cannot access.
    pub inaccessible: HashSet<String>,
    /// Requests whose text contains one of these fail.
    pub failing: Vec<String>,
    /// Role membership changes fail.
    pub fail_role_changes: bool,
    /// Object definitions by lowercase name.
    pub definitions: HashMap<String, String>,
    /// Informational messages returned when requested.
    pub messages: Vec<String>,
    /// Simulated execution time per request.
    pub delay: Option<Duration>,

    pub executed: Vec<ExecutedStatement>,
    pub role_changes: Vec<String>,
    pub connects: usize,
    pub pooled_connects: usize,
    pub closes: usize,
}

/// A shareable handle to an in-memory server.
#[derive(Debug, Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<MockState>>,
}

impl MockServer {
    /// Creates a reachable server with no roles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a server that refuses connections.
    pub fn unreachable() -> Self {
        let server = Self::new();
        server.state().unreachable = true;
        server
    }

    /// Adds a role with members.
    pub fn with_role(self, name: &str, members: &[&str]) -> Self {
        self.state().roles.insert(
            name.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    /// Marks a database as inaccessible.
    pub fn with_inaccessible_database(self, database: &str) -> Self {
        self.state().inaccessible.insert(database.to_lowercase());
        self
    }

    /// Makes requests containing `fragment` fail.
    pub fn failing_on(self, fragment: &str) -> Self {
        self.state().failing.push(fragment.to_string());
        self
    }

    /// Makes role membership changes fail.
    pub fn failing_role_changes(self) -> Self {
        self.state().fail_role_changes = true;
        self
    }

    /// Registers an object definition for scripting.
    pub fn with_definition(self, name: &str, definition: &str) -> Self {
        self.state()
            .definitions
            .insert(name.to_lowercase(), definition.to_string());
        self
    }

    /// Adds an informational message returned with every result.
    pub fn with_message(self, message: &str) -> Self {
        self.state().messages.push(message.to_string());
        self
    }

    /// Delays every request.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state().delay = Some(delay);
        self
    }

    /// Locks and returns the server state.
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns all executed statements.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state().executed.clone()
    }

    /// Returns the SQL text of all executed statements.
    pub fn executed_sql(&self) -> Vec<String> {
        self.state().executed.iter().map(|s| s.sql.clone()).collect()
    }

    /// Returns the members of a role.
    pub fn members_of(&self, role: &str) -> Vec<String> {
        self.state().roles.get(role).cloned().unwrap_or_default()
    }

    /// Returns the recorded role membership changes.
    pub fn role_changes(&self) -> Vec<String> {
        self.state().role_changes.clone()
    }

    /// Returns the number of connections opened.
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    /// Returns the number of pooled connections opened.
    pub fn pooled_connects(&self) -> usize {
        self.state().pooled_connects
    }

    /// Returns the number of connections closed.
    pub fn closes(&self) -> usize {
        self.state().closes
    }
}

/// Connector that serves registered mock servers by host name.
#[derive(Debug, Default)]
pub struct MockConnector {
    servers: HashMap<String, MockServer>,
}

impl MockConnector {
    /// Creates a connector with no servers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a server under a host name.
    pub fn with_server(mut self, host: &str, server: MockServer) -> Self {
        self.servers.insert(host.to_lowercase(), server);
        self
    }

    /// Returns the server registered for a host.
    pub fn server(&self, host: &str) -> Option<MockServer> {
        self.servers.get(&host.to_lowercase()).cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        spec: &InstanceSpec,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn ServerClient>> {
        let server = self.server(&spec.host).ok_or_else(|| {
            FleetError::connection(format!(
                "Cannot connect to {}. Check that the server is running.",
                spec.display_name()
            ))
        })?;

        {
            let mut state = server.state();
            if state.unreachable {
                return Err(FleetError::connection(format!(
                    "Connection to {} timed out. The server may be overloaded or unreachable.",
                    spec.display_name()
                )));
            }
            state.connects += 1;
            if options.pooled {
                state.pooled_connects += 1;
            }
        }

        let database = spec.database.clone().or_else(|| Some("master".to_string()));
        Ok(Arc::new(MockClient::new(server, spec.clone(), database)))
    }
}

/// A client connected to a mock server.
#[derive(Debug)]
pub struct MockClient {
    server: MockServer,
    spec: InstanceSpec,
    database: Option<String>,
    closed: AtomicBool,
}

impl MockClient {
    fn new(server: MockServer, spec: InstanceSpec, database: Option<String>) -> Self {
        Self {
            server,
            spec,
            database,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FleetError::execution("Connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl ServerClient for MockClient {
    fn instance(&self) -> &InstanceSpec {
        &self.spec
    }

    fn current_database(&self) -> Option<String> {
        self.database.clone()
    }

    async fn is_database_accessible(&self, database: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(!self.server.state().inaccessible.contains(&database.to_lowercase()))
    }

    async fn with_database(&self, database: &str) -> Result<Arc<dyn ServerClient>> {
        self.ensure_open()?;
        self.server.state().connects += 1;
        let spec = self.spec.clone().with_database(database);
        Ok(Arc::new(MockClient::new(
            self.server.clone(),
            spec,
            Some(database.to_string()),
        )))
    }

    async fn execute(&self, request: &QueryRequest) -> Result<QueryResult> {
        self.ensure_open()?;

        let (delay, failing, messages) = {
            let mut state = self.server.state();
            state.executed.push(ExecutedStatement {
                database: self.database.clone(),
                sql: request.sql.clone(),
                params: request.params.clone(),
            });
            let failing = state
                .failing
                .iter()
                .find(|fragment| request.sql.contains(fragment.as_str()))
                .cloned();
            (state.delay, failing, state.messages.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(fragment) = failing {
            return Err(FleetError::execution(format!(
                "Incorrect syntax near '{fragment}'."
            )));
        }

        let mut result = if request.sql.trim_start().to_uppercase().starts_with("SELECT") {
            QueryResult::single(
                vec![ColumnInfo::new("result", "nvarchar")],
                vec![vec![Value::String(request.sql.trim().to_string())]],
            )
        } else {
            let mut result = QueryResult::new();
            result.rows_affected = Some(0);
            result
        };

        if request.capture_messages {
            result.messages = messages;
        }
        Ok(result.with_execution_time(Duration::from_millis(1)))
    }

    async fn list_server_roles(&self, filter: &[String]) -> Result<Vec<ServerRole>> {
        self.ensure_open()?;
        let roles = self
            .server
            .state()
            .roles
            .iter()
            .map(|(name, members)| ServerRole::new(name.clone(), members.clone()))
            .collect();
        Ok(filter_roles(roles, filter))
    }

    async fn add_role_member(&self, role: &str, member: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.server.state();
        if state.fail_role_changes {
            return Err(FleetError::execution(format!(
                "Cannot alter the server role '{role}', because it does not exist or you do not have permission."
            )));
        }
        let members = state
            .roles
            .get_mut(role)
            .ok_or_else(|| FleetError::execution(format!("Server role '{role}' does not exist")))?;
        members.push(member.to_string());
        state.role_changes.push(format!("ADD {member} TO {role}"));
        Ok(())
    }

    async fn drop_role_member(&self, role: &str, member: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.server.state();
        if state.fail_role_changes {
            return Err(FleetError::execution(format!(
                "Cannot alter the server role '{role}', because it does not exist or you do not have permission."
            )));
        }
        let members = state
            .roles
            .get_mut(role)
            .ok_or_else(|| FleetError::execution(format!("Server role '{role}' does not exist")))?;
        members.retain(|m| !m.eq_ignore_ascii_case(member));
        state.role_changes.push(format!("DROP {member} FROM {role}"));
        Ok(())
    }

    async fn script_object(&self, object: &ScriptableObject) -> Result<String> {
        self.ensure_open()?;
        self.server
            .state()
            .definitions
            .get(&object.name.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                FleetError::generation(format!(
                    "Definition of {object} is not available on {}",
                    self.spec.display_name()
                ))
            })
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.state().closes += 1;
        }
        Ok(())
    }
}

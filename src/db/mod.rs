//! Database abstraction layer for sqlfleet.
//!
//! Provides trait-based interfaces for the server object model: opening
//! connections, executing requests, reading and changing server role
//! membership, and scripting object definitions. SQL Server and PostgreSQL
//! backends implement them, and an in-memory mock is available for tests.

mod mock;
mod mssql;
mod postgres;
mod types;

pub use mock::{ExecutedStatement, MockConnector, MockServer, MockState};
pub use mssql::MssqlClient;
pub use postgres::PostgresClient;
pub use types::{
    ColumnInfo, CommandType, ObjectKind, QueryParam, QueryRequest, QueryResult, ResultSet, Row,
    ScriptableObject, ServerRole, Value,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConnectionSettings;
use crate::error::Result;
use crate::instance::InstanceSpec;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Mssql,
    Postgres,
}

impl DatabaseBackend {
    /// Returns the backend as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mssql => "mssql",
            Self::Postgres => "postgres",
        }
    }

    /// Parses a backend from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mssql" | "sqlserver" => Some(Self::Mssql),
            "postgres" | "postgresql" => Some(Self::Postgres),
            _ => None,
        }
    }

    /// Maps a URL scheme to a backend.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        Self::parse(scheme)
    }

    /// Returns the default port for this backend.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Mssql => 1433,
            Self::Postgres => 5432,
        }
    }

    /// Returns true if scripts for this backend use `GO` batch separators.
    pub fn uses_batch_separator(&self) -> bool {
        matches!(self, Self::Mssql)
    }
}

/// Options that shape how a connection is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Whether the connection may be shared and reused by later targets.
    pub pooled: bool,
    pub application_name: String,
    pub connect_timeout: Duration,
    pub trust_server_certificate: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for ConnectOptions {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            pooled: !settings.legacy,
            application_name: settings.application_name.clone(),
            connect_timeout: settings.connect_timeout(),
            trust_server_certificate: settings.trust_server_certificate,
        }
    }
}

impl ConnectOptions {
    /// Returns a copy with the given pooling mode.
    pub fn with_pooling(mut self, pooled: bool) -> Self {
        self.pooled = pooled;
        self
    }
}

/// An open connection context bound to one instance and database.
///
/// All operations are async and return Results with FleetError.
#[async_trait]
pub trait ServerClient: Send + Sync {
    /// The instance this client is connected to.
    fn instance(&self) -> &InstanceSpec;

    /// The database the connection is currently using.
    fn current_database(&self) -> Option<String>;

    /// Returns true if the login can access `database`.
    async fn is_database_accessible(&self, database: &str) -> Result<bool>;

    /// Opens a new context on the same instance scoped to `database`.
    ///
    /// The receiver's connection state is left untouched.
    async fn with_database(&self, database: &str) -> Result<Arc<dyn ServerClient>>;

    /// Executes a request and returns all result sets.
    async fn execute(&self, request: &QueryRequest) -> Result<QueryResult>;

    /// Lists server roles whose names match `filter` (all roles if empty).
    async fn list_server_roles(&self, filter: &[String]) -> Result<Vec<ServerRole>>;

    /// Adds `member` (a login or another role) to `role`.
    async fn add_role_member(&self, role: &str, member: &str) -> Result<()>;

    /// Removes `member` (a login or another role) from `role`.
    async fn drop_role_member(&self, role: &str, member: &str) -> Result<()>;

    /// Serializes an object definition into SQL text.
    async fn script_object(&self, object: &ScriptableObject) -> Result<String>;

    /// Closes the connection.
    async fn close(&self) -> Result<()>;
}

/// Opens connections to instances.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to an instance.
    async fn connect(
        &self,
        spec: &InstanceSpec,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn ServerClient>>;
}

/// Connector for real servers, dispatching on the instance backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeConnector;

#[async_trait]
impl Connector for NativeConnector {
    async fn connect(
        &self,
        spec: &InstanceSpec,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn ServerClient>> {
        match spec.backend {
            DatabaseBackend::Mssql => {
                let client = MssqlClient::connect(spec, options).await?;
                Ok(Arc::new(client))
            }
            DatabaseBackend::Postgres => {
                let client = PostgresClient::connect(spec, options).await?;
                Ok(Arc::new(client))
            }
        }
    }
}

/// Keeps the roles whose names match `filter` (case-insensitive).
pub(crate) fn filter_roles(roles: Vec<ServerRole>, filter: &[String]) -> Vec<ServerRole> {
    if filter.is_empty() {
        return roles;
    }
    roles
        .into_iter()
        .filter(|role| filter.iter().any(|f| f.eq_ignore_ascii_case(&role.name)))
        .collect()
}

/// Builds `(n rows affected)` messages for each result set.
///
/// Neither driver surfaces server informational messages, so row counts are
/// reported in their place.
pub(crate) fn affected_messages(result: &QueryResult) -> Vec<String> {
    let mut messages: Vec<String> = result
        .sets
        .iter()
        .map(|set| format!("({} rows affected)", set.row_count()))
        .collect();
    if let Some(n) = result.rows_affected {
        messages.push(format!("({n} rows affected)"));
    }
    messages
}

/// Groups `(role, member)` pairs from a catalog query into roles.
///
/// Pairs must be ordered by role name. A `None` member marks a role without members.
pub(crate) fn group_role_members(pairs: Vec<(String, Option<String>)>) -> Vec<ServerRole> {
    let mut roles: Vec<ServerRole> = Vec::new();
    for (role, member) in pairs {
        let is_same = roles.last().map(|r| r.name == role).unwrap_or(false);
        if !is_same {
            roles.push(ServerRole::new(role, Vec::<String>::new()));
        }
        if let (Some(member), Some(last)) = (member, roles.last_mut()) {
            last.members.push(member);
        }
    }
    roles
}

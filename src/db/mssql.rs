//! SQL Server client implementation.
//!
//! Provides the `MssqlClient` struct that implements the `ServerClient` trait
//! using tiberius over a tokio TCP stream.

use super::{
    affected_messages, filter_roles, group_role_members, ColumnInfo, CommandType, ConnectOptions,
    QueryRequest, QueryResult, ResultSet, Row, ScriptableObject, ServerClient, ServerRole, Value,
};
use crate::error::{FleetError, Result};
use crate::instance::InstanceSpec;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, QueryItem, SqlBrowser, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

type TdsClient = Client<Compat<TcpStream>>;

/// SQL Server client.
pub struct MssqlClient {
    client: Mutex<Option<TdsClient>>,
    spec: InstanceSpec,
    options: ConnectOptions,
    database: Option<String>,
}

impl std::fmt::Debug for MssqlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlClient")
            .field("instance", &self.spec.display_name())
            .field("database", &self.database)
            .finish()
    }
}

impl MssqlClient {
    /// Opens a connection to a SQL Server instance.
    pub async fn connect(spec: &InstanceSpec, options: &ConnectOptions) -> Result<Self> {
        let config = build_config(spec, options)?;

        debug!(
            instance = %spec.display_name(),
            pooled = options.pooled,
            "Connecting to SQL Server"
        );

        let client = tokio::time::timeout(options.connect_timeout, open(config))
            .await
            .map_err(|_| {
                FleetError::connection(format!(
                    "Connection to {} timed out. The server may be overloaded or unreachable.",
                    spec.display_name()
                ))
            })?
            .map_err(|e| map_connection_error(e, spec))?;

        let mut this = Self {
            client: Mutex::new(Some(client)),
            spec: spec.clone(),
            options: options.clone(),
            database: spec.database.clone(),
        };

        let current = this
            .query_scalar_text("SELECT DB_NAME()", &[])
            .await
            .map_err(|e| FleetError::connection(e.to_string()))?;
        this.database = current.or(this.database);

        info!(instance = %spec.display_name(), database = ?this.database, "Connected");
        Ok(this)
    }

    async fn run(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> std::result::Result<QueryResult, tiberius::error::Error> {
        let mut guard = self.client.lock().await;
        let client = match guard.as_mut() {
            Some(client) => client,
            None => {
                return Err(tiberius::error::Error::Io {
                    kind: std::io::ErrorKind::NotConnected,
                    message: "connection is closed".to_string(),
                })
            }
        };

        let mut stream = if params.is_empty() {
            client.simple_query(sql).await?
        } else {
            client.query(sql, params).await?
        };

        let mut result = QueryResult::new();
        while let Some(item) = stream.try_next().await? {
            match item {
                QueryItem::Metadata(meta) => {
                    let columns = meta
                        .columns()
                        .iter()
                        .map(|col| ColumnInfo::new(col.name(), format!("{:?}", col.column_type())))
                        .collect();
                    result.sets.push(ResultSet::new(columns));
                }
                QueryItem::Row(row) => {
                    if let Some(set) = result.sets.last_mut() {
                        set.rows.push(convert_row(row));
                    }
                }
            }
        }
        Ok(result)
    }

    async fn query_scalar_text(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Option<String>> {
        let result = self
            .run(sql, params)
            .await
            .map_err(|e| FleetError::execution(format_query_error(e)))?;
        Ok(match result.first_value() {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        })
    }

    async fn alter_role(&self, role: &str, verb: &str, member: &str) -> Result<()> {
        let sql = role_change_sql(role, verb, member);
        debug!(instance = %self.spec.display_name(), %sql, "Changing role membership");
        self.run(&sql, &[])
            .await
            .map_err(|e| FleetError::execution(format_query_error(e)))?;
        Ok(())
    }
}

async fn open(config: Config) -> std::result::Result<TdsClient, tiberius::error::Error> {
    let tcp = connect_tcp(&config).await?;
    match Client::connect(config.clone(), tcp.compat_write()).await {
        // Availability group listeners may redirect to the current primary.
        Err(tiberius::error::Error::Routing { host, port }) => {
            let mut config = config;
            config.host(&host);
            config.port(port);
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Client::connect(config, tcp.compat_write()).await
        }
        other => other,
    }
}

async fn connect_tcp(config: &Config) -> std::result::Result<TcpStream, tiberius::error::Error> {
    let tcp = TcpStream::connect_named(config).await?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

fn build_config(spec: &InstanceSpec, options: &ConnectOptions) -> Result<Config> {
    let mut config = Config::new();
    config.host(&spec.host);
    if let Some(port) = spec.port {
        config.port(port);
    } else if spec.instance_name.is_none() {
        config.port(spec.effective_port());
    }
    if let Some(instance) = &spec.instance_name {
        config.instance_name(instance);
    }
    if let Some(database) = &spec.database {
        config.database(database);
    }
    config.application_name(&options.application_name);
    config.readonly(spec.read_only);
    if options.trust_server_certificate {
        config.trust_cert();
    }

    let credential = spec.credential.as_ref().ok_or_else(|| {
        FleetError::connection(format!(
            "No login configured for {}. Pass --user or set SQLFLEET_USER.",
            spec.display_name()
        ))
    })?;
    let password = credential.password.clone().unwrap_or_default();
    config.authentication(AuthMethod::sql_server(&credential.user, password));

    Ok(config)
}

#[async_trait]
impl ServerClient for MssqlClient {
    fn instance(&self) -> &InstanceSpec {
        &self.spec
    }

    fn current_database(&self) -> Option<String> {
        self.database.clone()
    }

    async fn is_database_accessible(&self, database: &str) -> Result<bool> {
        let name = Value::from(database);
        let result = self
            .run("SELECT HAS_DBACCESS(@P1)", &[&name])
            .await
            .map_err(|e| FleetError::execution(format_query_error(e)))?;
        Ok(matches!(result.first_value(), Some(Value::Int(1))))
    }

    async fn with_database(&self, database: &str) -> Result<Arc<dyn ServerClient>> {
        let spec = self.spec.clone().with_database(database);
        let client = MssqlClient::connect(&spec, &self.options).await?;
        Ok(Arc::new(client))
    }

    async fn execute(&self, request: &QueryRequest) -> Result<QueryResult> {
        let start = Instant::now();
        let (sql, args) = build_command(request);
        let refs: Vec<&dyn ToSql> = args.iter().map(|v| v as &dyn ToSql).collect();

        debug!(
            instance = %self.spec.display_name(),
            database = ?self.database,
            params = request.params.len(),
            "Executing request"
        );

        let mut result = self
            .run(&sql, &refs)
            .await
            .map_err(|e| FleetError::execution(format_query_error(e)))?;

        if request.capture_messages {
            result.messages = affected_messages(&result);
        }
        Ok(result.with_execution_time(start.elapsed()))
    }

    async fn list_server_roles(&self, filter: &[String]) -> Result<Vec<ServerRole>> {
        let result = self
            .run(
                r#"
                SELECT r.name, m.name
                FROM sys.server_principals r
                LEFT JOIN sys.server_role_members rm ON rm.role_principal_id = r.principal_id
                LEFT JOIN sys.server_principals m ON m.principal_id = rm.member_principal_id
                WHERE r.type = 'R'
                ORDER BY r.name, m.name
                "#,
                &[],
            )
            .await
            .map_err(|e| {
                FleetError::execution(format!(
                    "Failed to list server roles: {}",
                    format_query_error(e)
                ))
            })?;

        let pairs = result
            .sets
            .into_iter()
            .flat_map(|set| set.rows)
            .filter_map(|row| {
                let mut cells = row.into_iter();
                match (cells.next(), cells.next()) {
                    (Some(Value::String(role)), Some(Value::String(member))) => {
                        Some((role, Some(member)))
                    }
                    (Some(Value::String(role)), _) => Some((role, None)),
                    _ => None,
                }
            })
            .collect();

        Ok(filter_roles(group_role_members(pairs), filter))
    }

    async fn add_role_member(&self, role: &str, member: &str) -> Result<()> {
        self.alter_role(role, "ADD", member).await
    }

    async fn drop_role_member(&self, role: &str, member: &str) -> Result<()> {
        self.alter_role(role, "DROP", member).await
    }

    async fn script_object(&self, object: &ScriptableObject) -> Result<String> {
        let name = Value::from(object.name.as_str());
        let definition = self
            .query_scalar_text("SELECT OBJECT_DEFINITION(OBJECT_ID(@P1))", &[&name])
            .await
            .map_err(|e| FleetError::generation(e.to_string()))?;

        let definition = definition.ok_or_else(|| {
            FleetError::generation(format!(
                "Definition of {object} is not available on {}",
                self.spec.display_name()
            ))
        })?;

        Ok(definition.trim().to_string())
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.lock().await.take() {
            debug!(instance = %self.spec.display_name(), "Closing connection");
            client
                .close()
                .await
                .map_err(|e| FleetError::connection(e.to_string()))?;
        }
        Ok(())
    }
}

/// Builds the command text and positional arguments for a request.
///
/// Named parameters are passed through `sp_executesql` so the SQL text can
/// refer to them as `@name`.
fn build_command(request: &QueryRequest) -> (String, Vec<Value>) {
    match request.command_type {
        CommandType::Text if request.params.is_empty() => (request.sql.clone(), Vec::new()),
        CommandType::Text => {
            let declarations = request
                .params
                .iter()
                .map(|p| format!("@{} {}", p.name, sql_type(&p.value)))
                .collect::<Vec<_>>()
                .join(", ");
            let assignments = request
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| format!(", @{} = @P{}", p.name, i + 3))
                .collect::<String>();

            let mut args = vec![Value::from(request.sql.as_str()), Value::String(declarations)];
            args.extend(request.params.iter().map(|p| p.value.clone()));
            (
                format!("EXEC sp_executesql @P1, @P2{assignments}"),
                args,
            )
        }
        CommandType::Procedure => {
            let assignments = request
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| format!("@{} = @P{}", p.name, i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = if assignments.is_empty() {
                format!("EXEC {}", quote_ident(&request.sql))
            } else {
                format!("EXEC {} {}", quote_ident(&request.sql), assignments)
            };
            (sql, request.params.iter().map(|p| p.value.clone()).collect())
        }
        CommandType::Table => (format!("SELECT * FROM {}", quote_ident(&request.sql)), Vec::new()),
    }
}

fn sql_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "bit",
        Value::Int(_) => "bigint",
        Value::Float(_) => "float",
        Value::Bytes(_) => "varbinary(max)",
        Value::Null | Value::String(_) => "nvarchar(max)",
    }
}

/// `ALTER SERVER ROLE` statement. Principal names are single-part: dots and
/// backslashes are part of the name.
fn role_change_sql(role: &str, verb: &str, member: &str) -> String {
    format!(
        "ALTER SERVER ROLE {} {verb} MEMBER {}",
        quote_name(role),
        quote_name(member)
    )
}

/// Brackets a single-part name, like `QUOTENAME`.
fn quote_name(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Quotes a possibly schema-qualified identifier with brackets.
fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| {
            let part = part.trim().trim_start_matches('[').trim_end_matches(']');
            format!("[{}]", part.replace(']', "]]"))
        })
        .collect::<Vec<_>>()
        .join(".")
}

impl ToSql for Value {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Value::Null => ColumnData::String(None),
            Value::Bool(b) => ColumnData::Bit(Some(*b)),
            Value::Int(i) => ColumnData::I64(Some(*i)),
            Value::Float(f) => ColumnData::F64(Some(*f)),
            Value::String(s) => ColumnData::String(Some(Cow::from(s.as_str()))),
            Value::Bytes(b) => ColumnData::Binary(Some(Cow::from(b.as_slice()))),
        }
    }
}

/// Converts a tiberius row to our Row type.
fn convert_row(row: tiberius::Row) -> Row {
    row.into_iter().map(|data| convert_value(&data)).collect()
}

/// Converts a single column value to our Value type.
fn convert_value(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(|v| Value::Int(v as i64)).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(|v| Value::Int(v as i64)).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(|v| Value::Int(v as i64)).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::Int).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|v| Value::Float(v as f64)).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(Value::Float).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v.map(|g| Value::String(g.to_string())).unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::Bytes(b.to_vec()))
            .unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v.map(|n| Value::String(n.to_string())).unwrap_or(Value::Null),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| Value::String(x.as_ref().clone().into_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal::<chrono::NaiveDateTime>(data)
        }
        ColumnData::Date(_) => temporal::<chrono::NaiveDate>(data),
        ColumnData::Time(_) => temporal::<chrono::NaiveTime>(data),
        ColumnData::DateTimeOffset(_) => temporal::<chrono::DateTime<chrono::FixedOffset>>(data),
    }
}

fn temporal<'a, T>(data: &'a ColumnData<'static>) -> Value
where
    T: FromSql<'a> + std::fmt::Display,
{
    T::from_sql(data)
        .ok()
        .flatten()
        .map(|v| Value::String(v.to_string()))
        .unwrap_or(Value::Null)
}

/// Maps tiberius connection errors to user-friendly messages.
fn map_connection_error(error: tiberius::error::Error, spec: &InstanceSpec) -> FleetError {
    let instance = spec.display_name();
    let user = spec.user().unwrap_or("unknown");

    match &error {
        tiberius::error::Error::Server(token) if token.code() == 18456 => FleetError::connection(
            format!("Login failed for user '{user}' on {instance}. Check your credentials."),
        ),
        tiberius::error::Error::Server(token) if token.code() == 4060 => {
            FleetError::connection(format!(
                "Cannot open database '{}' on {instance}.",
                spec.database.as_deref().unwrap_or("unknown")
            ))
        }
        tiberius::error::Error::Io { .. } => FleetError::connection(format!(
            "Cannot connect to {instance}. Check that the server is running."
        )),
        tiberius::error::Error::Tls(msg) => {
            FleetError::connection(format!("TLS negotiation with {instance} failed: {msg}"))
        }
        _ => FleetError::connection(format!("{instance}: {error}")),
    }
}

/// Formats a server error the way SQL Server tools report it.
fn format_query_error(error: tiberius::error::Error) -> String {
    match error {
        tiberius::error::Error::Server(token) => format!(
            "Msg {}, Level {}, State {}, Line {}\n{}",
            token.code(),
            token.class(),
            token.state(),
            token.line(),
            token.message()
        ),
        other => other.to_string(),
    }
}

//! PostgreSQL client implementation.
//!
//! Provides the `PostgresClient` struct that implements the `ServerClient` trait
//! for PostgreSQL servers using sqlx. Server roles map to PostgreSQL group
//! roles (roles that cannot log in).

use super::{
    affected_messages, filter_roles, group_role_members, ColumnInfo, CommandType, ConnectOptions,
    ObjectKind, QueryRequest, QueryResult, ResultSet, Row, ScriptableObject, ServerClient,
    ServerRole, Value,
};
use crate::error::{FleetError, Result};
use crate::instance::InstanceSpec;
use async_trait::async_trait;
use futures::TryStreamExt;
use regex::Regex;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column as SqlxColumn, Either, Postgres, Row as SqlxRow, TypeInfo};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info};

/// Connections kept by a pooled client.
const POOL_SIZE: u32 = 5;

/// PostgreSQL client.
#[derive(Debug)]
pub struct PostgresClient {
    pool: PgPool,
    spec: InstanceSpec,
    options: ConnectOptions,
    database: Option<String>,
}

impl PostgresClient {
    /// Opens a connection pool to a PostgreSQL server.
    ///
    /// Non-pooled clients hold a single connection.
    pub async fn connect(spec: &InstanceSpec, options: &ConnectOptions) -> Result<Self> {
        let mut connect_options = PgConnectOptions::new()
            .host(&spec.host)
            .port(spec.effective_port())
            .application_name(&options.application_name);
        if let Some(credential) = &spec.credential {
            connect_options = connect_options.username(&credential.user);
            if let Some(password) = &credential.password {
                connect_options = connect_options.password(password);
            }
        }
        if let Some(database) = &spec.database {
            connect_options = connect_options.database(database);
        }
        if spec.read_only {
            connect_options = connect_options.options([("default_transaction_read_only", "on")]);
        }

        let max_connections = if options.pooled { POOL_SIZE } else { 1 };
        debug!(
            instance = %spec.display_name(),
            max_connections,
            "Connecting to PostgreSQL"
        );

        let pool = tokio::time::timeout(
            options.connect_timeout,
            PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(options.connect_timeout)
                .connect_with(connect_options),
        )
        .await
        .map_err(|_| {
            FleetError::connection(format!(
                "Connection to {} timed out. The server may be overloaded or unreachable.",
                spec.display_name()
            ))
        })?
        .map_err(|e| map_connection_error(e, spec))?;

        let database: Option<String> = sqlx::query_scalar("SELECT current_database()::text")
            .fetch_optional(&pool)
            .await
            .map_err(|e| FleetError::connection(format_query_error(e)))?;

        info!(instance = %spec.display_name(), database = ?database, "Connected");
        Ok(Self {
            pool,
            spec: spec.clone(),
            options: options.clone(),
            database: database.or_else(|| spec.database.clone()),
        })
    }

    /// Runs text without parameters, collecting one result set per statement.
    async fn run_raw(&self, sql: &str) -> Result<QueryResult> {
        let mut result = QueryResult::new();
        let mut current: Option<ResultSet> = None;
        let mut stream = sqlx::raw_sql(sql).fetch_many(&self.pool);

        while let Some(item) = stream
            .try_next()
            .await
            .map_err(|e| FleetError::execution(format_query_error(e)))?
        {
            match item {
                Either::Left(done) => {
                    if let Some(set) = current.take() {
                        result.sets.push(set);
                    } else {
                        let affected = result.rows_affected.unwrap_or(0);
                        result.rows_affected = Some(affected + done.rows_affected());
                    }
                }
                Either::Right(row) => {
                    let set = current.get_or_insert_with(|| ResultSet::new(column_info(&row)));
                    set.rows.push(convert_row(&row));
                }
            }
        }
        if let Some(set) = current {
            result.sets.push(set);
        }
        Ok(result)
    }

    /// Runs a statement with positional arguments.
    async fn run_bound(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        let query = args.iter().fold(sqlx::query(sql), bind_value);
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| FleetError::execution(format_query_error(e)))?;

        let columns = rows.first().map(column_info).unwrap_or_default();
        let rows = rows.iter().map(convert_row).collect();
        Ok(QueryResult {
            sets: vec![ResultSet::with_rows(columns, rows)],
            ..Default::default()
        })
    }
}

#[async_trait]
impl ServerClient for PostgresClient {
    fn instance(&self) -> &InstanceSpec {
        &self.spec
    }

    fn current_database(&self) -> Option<String> {
        self.database.clone()
    }

    async fn is_database_accessible(&self, database: &str) -> Result<bool> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(
                (SELECT has_database_privilege(datname, 'CONNECT')
                 FROM pg_database WHERE datname = $1 AND datallowconn),
                false)
            "#,
        )
        .bind(database)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| FleetError::execution(format_query_error(e)))
    }

    async fn with_database(&self, database: &str) -> Result<Arc<dyn ServerClient>> {
        let spec = self.spec.clone().with_database(database);
        let client = PostgresClient::connect(&spec, &self.options).await?;
        Ok(Arc::new(client))
    }

    async fn execute(&self, request: &QueryRequest) -> Result<QueryResult> {
        let start = Instant::now();
        debug!(
            instance = %self.spec.display_name(),
            database = ?self.database,
            params = request.params.len(),
            "Executing request"
        );

        let mut result = match request.command_type {
            CommandType::Text if request.params.is_empty() => self.run_raw(&request.sql).await?,
            CommandType::Text => {
                let (sql, args) = positional_params(request);
                self.run_bound(&sql, &args).await?
            }
            CommandType::Procedure => {
                let placeholders = (1..=request.params.len())
                    .map(|i| format!("${i}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!("CALL {}({})", quote_ident(&request.sql), placeholders);
                let args: Vec<Value> = request.params.iter().map(|p| p.value.clone()).collect();
                self.run_bound(&sql, &args).await?
            }
            CommandType::Table => {
                self.run_raw(&format!("SELECT * FROM {}", quote_ident(&request.sql)))
                    .await?
            }
        };

        if request.capture_messages {
            result.messages = affected_messages(&result);
        }
        Ok(result.with_execution_time(start.elapsed()))
    }

    async fn list_server_roles(&self, filter: &[String]) -> Result<Vec<ServerRole>> {
        let pairs: Vec<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT r.rolname::text, m.rolname::text
            FROM pg_roles r
            LEFT JOIN pg_auth_members am ON am.roleid = r.oid
            LEFT JOIN pg_roles m ON m.oid = am.member
            WHERE NOT r.rolcanlogin
            ORDER BY r.rolname, m.rolname
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FleetError::execution(format!("Failed to list roles: {e}")))?;

        Ok(filter_roles(group_role_members(pairs), filter))
    }

    async fn add_role_member(&self, role: &str, member: &str) -> Result<()> {
        let sql = membership_sql(MembershipChange::Grant, role, member);
        self.run_raw(&sql).await.map(|_| ())
    }

    async fn drop_role_member(&self, role: &str, member: &str) -> Result<()> {
        let sql = membership_sql(MembershipChange::Revoke, role, member);
        self.run_raw(&sql).await.map(|_| ())
    }

    async fn script_object(&self, object: &ScriptableObject) -> Result<String> {
        let sql = match object.kind {
            ObjectKind::View => "SELECT pg_get_viewdef($1::regclass, true)",
            ObjectKind::Procedure | ObjectKind::Function => {
                "SELECT pg_get_functiondef($1::regproc)"
            }
            ObjectKind::Trigger => {
                "SELECT pg_get_triggerdef(oid, true) FROM pg_trigger WHERE tgname = $1"
            }
        };

        let definition: Option<String> = sqlx::query_scalar(sql)
            .bind(&object.name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| FleetError::generation(format_query_error(e)))?;

        let definition = definition.ok_or_else(|| {
            FleetError::generation(format!(
                "Definition of {object} is not available on {}",
                self.spec.display_name()
            ))
        })?;

        Ok(match object.kind {
            ObjectKind::View => format!(
                "CREATE OR REPLACE VIEW {} AS\n{}",
                quote_ident(&object.name),
                definition.trim()
            ),
            _ => format!("{};", definition.trim().trim_end_matches(';')),
        })
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Matches `@name` outside string literals, quoted identifiers, dollar-quoted
/// bodies and comments. Only group 1 is a parameter reference.
fn param_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?s)'(?:[^']|'')*'|"(?:[^"]|"")*"|\$\$.*?\$\$|--[^\n]*|/\*.*?\*/|@([A-Za-z_][A-Za-z0-9_]*)"#,
        )
        .expect("param pattern is valid")
    })
}

/// Rewrites `@name` references to `$n` placeholders.
///
/// Placeholders are numbered by first reference and only referenced
/// parameters are bound. Unknown names are left untouched.
fn positional_params(request: &QueryRequest) -> (String, Vec<Value>) {
    let mut bound: Vec<usize> = Vec::new();
    let sql = param_pattern().replace_all(&request.sql, |caps: &regex::Captures<'_>| {
        let Some(name) = caps.get(1) else {
            return caps[0].to_string();
        };
        let Some(index) = request
            .params
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name.as_str()))
        else {
            return caps[0].to_string();
        };
        let slot = match bound.iter().position(|&b| b == index) {
            Some(slot) => slot,
            None => {
                bound.push(index);
                bound.len() - 1
            }
        };
        format!("${}", slot + 1)
    });
    let sql = sql.into_owned();
    let args = bound
        .into_iter()
        .map(|index| request.params[index].value.clone())
        .collect();
    (sql, args)
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::String(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
    }
}

#[derive(Debug, Clone, Copy)]
enum MembershipChange {
    Grant,
    Revoke,
}

fn membership_sql(change: MembershipChange, role: &str, member: &str) -> String {
    match change {
        MembershipChange::Grant => format!("GRANT {} TO {}", quote_name(role), quote_name(member)),
        MembershipChange::Revoke => {
            format!("REVOKE {} FROM {}", quote_name(role), quote_name(member))
        }
    }
}

/// Quotes a single-part name such as a role; dots are kept inside the quotes.
fn quote_name(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a possibly schema-qualified identifier.
fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| {
            let part = part.trim().trim_matches('"');
            format!("\"{}\"", part.replace('"', "\"\""))
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn column_info(row: &PgRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, spec: &InstanceSpec) -> FleetError {
    let instance = spec.display_name();
    let user = spec.user().unwrap_or("unknown");
    let database = spec.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        FleetError::connection(format!(
            "Cannot connect to {instance}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        FleetError::connection(format!(
            "Authentication failed for user '{user}' on {instance}. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        FleetError::connection(format!("Database '{database}' does not exist on {instance}."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        FleetError::connection(format!(
            "Connection to {instance} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        FleetError::connection(format!("{instance}: {error}"))
    }
}

/// Formats a query error with detail and hint if available.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = format!("ERROR: {}", db_error.message());
    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
    }
    result
}

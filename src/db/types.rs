//! Query request and result types.
//!
//! Defines the structures passed to and returned from a `ServerClient`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FleetError, Result};

/// How the command text of a request is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    /// Ad-hoc SQL text.
    #[default]
    Text,
    /// Name of a stored procedure, called with the request parameters.
    Procedure,
    /// Name of a table; all rows are selected.
    Table,
}

impl FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "procedure" | "storedprocedure" | "proc" => Ok(Self::Procedure),
            "table" | "tabledirect" => Ok(Self::Table),
            _ => Err(format!(
                "Invalid command type: {s}. Expected: text, procedure, or table"
            )),
        }
    }
}

/// A named query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParam {
    /// Parameter name without the leading `@`.
    pub name: String,
    pub value: Value,
}

impl QueryParam {
    /// Creates a parameter.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into().trim_start_matches('@').to_string(),
            value: value.into(),
        }
    }

    /// Parses `name=value`, inferring the value type.
    pub fn parse(input: &str) -> Result<Self> {
        let (name, raw) = input.split_once('=').ok_or_else(|| {
            FleetError::invalid_argument(format!(
                "Invalid parameter '{input}'. Expected NAME=VALUE"
            ))
        })?;

        let name = name.trim().trim_start_matches('@');
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(FleetError::invalid_argument(format!(
                "Invalid parameter name in '{input}'"
            )));
        }

        Ok(Self::new(name, Value::parse_literal(raw)))
    }
}

/// A request sent to a server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    /// SQL text, procedure name or table name depending on `command_type`.
    pub sql: String,
    pub command_type: CommandType,
    pub params: Vec<QueryParam>,
    /// Return server informational messages with the result.
    pub capture_messages: bool,
}

impl QueryRequest {
    /// Creates a plain text request without parameters.
    pub fn text(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }
}

/// One result set returned by a statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultSet {
    /// Column metadata for the result set.
    pub columns: Vec<ColumnInfo>,

    /// Rows of data.
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Creates an empty result set with the given columns.
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Creates a result set with the given columns and rows.
    pub fn with_rows(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Returns the number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns the column names.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Represents the result of executing a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    /// Result sets, in the order the server produced them.
    pub sets: Vec<ResultSet>,

    /// Server informational messages, when requested and supported.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,

    /// Rows affected by data modification statements, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// Time taken to execute the request.
    #[serde(with = "duration_serde")]
    pub execution_time: Duration,
}

impl QueryResult {
    /// Creates a new empty query result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query result with a single result set.
    pub fn single(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self {
            sets: vec![ResultSet::with_rows(columns, rows)],
            ..Default::default()
        }
    }

    /// Sets the execution time.
    pub fn with_execution_time(mut self, duration: Duration) -> Self {
        self.execution_time = duration;
        self
    }

    /// Returns the total number of rows across all result sets.
    pub fn row_count(&self) -> usize {
        self.sets.iter().map(ResultSet::row_count).sum()
    }

    /// Returns true if no result set has any rows.
    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Returns the first column of the first row of the first result set.
    pub fn first_value(&self) -> Option<&Value> {
        self.sets
            .iter()
            .find(|set| !set.rows.is_empty())
            .and_then(|set| set.rows.first())
            .and_then(|row| row.first())
    }

    /// Appends another result, as when a script runs in several batches.
    pub fn absorb(&mut self, other: QueryResult) {
        self.sets.extend(other.sets);
        self.messages.extend(other.messages);
        self.rows_affected = match (self.rows_affected, other.rows_affected) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.execution_time += other.execution_time;
    }
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Column data type.
    pub data_type: String,
}

impl ColumnInfo {
    /// Creates a new column info with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A row of data from a query result.
pub type Row = Vec<Value>;

/// Represents a single value from a database query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text/string value.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Infers a value from command-line text: `null`, booleans, integers,
    /// floats, and everything else as a string. Quoting with `'` forces a string.
    pub fn parse_literal(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
            return Value::String(trimmed[1..trimmed.len() - 1].to_string());
        }
        if trimmed.eq_ignore_ascii_case("null") {
            return Value::Null;
        }
        if trimmed.eq_ignore_ascii_case("true") {
            return Value::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Value::Bool(false);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Value::Float(f);
            }
        }
        Value::String(raw.to_string())
    }

    /// Attempts to convert the value to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// A server role and its current members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRole {
    pub name: String,
    /// Logins and roles that belong to this role.
    pub members: Vec<String>,
}

impl ServerRole {
    /// Creates a role with the given members.
    pub fn new(name: impl Into<String>, members: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if `principal` is a member (case-insensitive).
    pub fn has_member(&self, principal: &str) -> bool {
        self.members.iter().any(|m| m.eq_ignore_ascii_case(principal))
    }
}

/// Kinds of server objects that can be scripted into SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    View,
    Procedure,
    Function,
    Trigger,
}

impl ObjectKind {
    /// Returns the kind as a lowercase word.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Procedure => "procedure",
            Self::Function => "function",
            Self::Trigger => "trigger",
        }
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "view" => Ok(Self::View),
            "procedure" | "proc" => Ok(Self::Procedure),
            "function" | "func" => Ok(Self::Function),
            "trigger" => Ok(Self::Trigger),
            _ => Err(format!(
                "Invalid object kind: {s}. Expected: view, procedure, function, or trigger"
            )),
        }
    }
}

/// A server object whose definition can be scripted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptableObject {
    pub kind: ObjectKind,
    /// Object name, optionally schema-qualified.
    pub name: String,
}

impl ScriptableObject {
    /// Creates a scriptable object reference.
    pub fn new(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Parses `kind:name`, e.g. `view:dbo.ActiveUsers`.
    pub fn parse(input: &str) -> Result<Self> {
        let (kind, name) = input.split_once(':').ok_or_else(|| {
            FleetError::unsupported_input(format!(
                "Invalid object reference '{input}'. Expected KIND:NAME"
            ))
        })?;
        let kind = kind.parse::<ObjectKind>().map_err(FleetError::unsupported_input)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(FleetError::unsupported_input(format!(
                "Missing object name in '{input}'"
            )));
        }
        Ok(Self::new(kind, name))
    }
}

impl fmt::Display for ScriptableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.name)
    }
}

/// Serde support for Duration (not natively supported by serde).
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_display_string(), "NULL");
        assert_eq!(Value::Bool(true).to_display_string(), "true");
        assert_eq!(Value::Int(42).to_display_string(), "42");
        assert_eq!(Value::Float(2.71).to_display_string(), "2.71");
        assert_eq!(Value::Bytes(vec![1, 2, 3]).to_display_string(), "<3 bytes>");
    }

    #[test]
    fn test_value_parse_literal() {
        assert_eq!(Value::parse_literal("null"), Value::Null);
        assert_eq!(Value::parse_literal("TRUE"), Value::Bool(true));
        assert_eq!(Value::parse_literal("42"), Value::Int(42));
        assert_eq!(Value::parse_literal("2.5"), Value::Float(2.5));
        assert_eq!(Value::parse_literal("'42'"), Value::String("42".to_string()));
        assert_eq!(Value::parse_literal("sales"), Value::String("sales".to_string()));
        assert_eq!(Value::parse_literal("inf"), Value::String("inf".to_string()));
    }

    #[test]
    fn test_value_serializes_untagged() {
        let row = vec![Value::Int(1), Value::Null, Value::String("a".to_string())];
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"[1,null,"a"]"#);
    }

    #[test]
    fn test_query_param_parse() {
        let param = QueryParam::parse("@dbname=sales").unwrap();
        assert_eq!(param.name, "dbname");
        assert_eq!(param.value, Value::String("sales".to_string()));

        let param = QueryParam::parse("limit=10").unwrap();
        assert_eq!(param.value, Value::Int(10));

        assert!(QueryParam::parse("novalue").is_err());
        assert!(QueryParam::parse("bad name=1").is_err());
        assert!(QueryParam::parse("=1").is_err());
    }

    #[test]
    fn test_command_type_from_str() {
        assert_eq!("text".parse::<CommandType>().unwrap(), CommandType::Text);
        assert_eq!(
            "StoredProcedure".parse::<CommandType>().unwrap(),
            CommandType::Procedure
        );
        assert_eq!("tabledirect".parse::<CommandType>().unwrap(), CommandType::Table);
        assert!("bogus".parse::<CommandType>().is_err());
    }

    #[test]
    fn test_query_result_first_value_skips_empty_sets() {
        let mut result = QueryResult::new();
        result.sets.push(ResultSet::new(vec![ColumnInfo::new("a", "int")]));
        result.sets.push(ResultSet::with_rows(
            vec![ColumnInfo::new("b", "int")],
            vec![vec![Value::Int(7)]],
        ));
        assert_eq!(result.first_value(), Some(&Value::Int(7)));
        assert_eq!(result.row_count(), 1);
    }

    #[test]
    fn test_query_result_absorb() {
        let mut a = QueryResult::single(vec![ColumnInfo::new("x", "int")], vec![vec![1.into()]])
            .with_execution_time(Duration::from_millis(5));
        a.rows_affected = Some(2);
        let mut b = QueryResult::new().with_execution_time(Duration::from_millis(7));
        b.rows_affected = Some(3);
        b.messages.push("done".to_string());

        a.absorb(b);
        assert_eq!(a.sets.len(), 1);
        assert_eq!(a.rows_affected, Some(5));
        assert_eq!(a.messages, vec!["done"]);
        assert_eq!(a.execution_time, Duration::from_millis(12));
    }

    #[test]
    fn test_server_role_has_member_case_insensitive() {
        let role = ServerRole::new("sysadmin", ["CORP\\Alice", "sa"]);
        assert!(role.has_member("corp\\alice"));
        assert!(!role.has_member("bob"));
    }

    #[test]
    fn test_scriptable_object_parse() {
        let obj = ScriptableObject::parse("view:dbo.ActiveUsers").unwrap();
        assert_eq!(obj.kind, ObjectKind::View);
        assert_eq!(obj.name, "dbo.ActiveUsers");
        assert_eq!(obj.to_string(), "view dbo.ActiveUsers");

        assert!(matches!(
            ScriptableObject::parse("table:dbo.Users"),
            Err(FleetError::UnsupportedInput(_))
        ));
        assert!(ScriptableObject::parse("view:").is_err());
        assert!(ScriptableObject::parse("dbo.Users").is_err());
    }
}

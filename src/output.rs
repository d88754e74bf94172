//! Rendering of batch reports.
//!
//! Text output uses `comfy-table`; JSON output is a single document per
//! invocation so it can be piped into other tools.

use clap::ValueEnum;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Table};
use serde_json::{json, Map, Value as Json};

use crate::batch::{BatchReport, PlannedAction, QueryRecord, Skipped, TargetFailure};
use crate::db::{ResultSet, ServerRole, Value};
use crate::error::{FleetError, Result};
use crate::membership::MembershipRecord;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// How query results are shaped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ResultShape {
    /// All rows of all result sets.
    #[default]
    Rows,
    /// Each result set separately.
    Tables,
    /// First column of the first row.
    Single,
}

/// Column added to rows when results are tagged with their target.
const INSTANCE_COLUMN: &str = "instance";

/// Renders a query report.
pub fn render_query_report(
    report: &BatchReport<QueryRecord>,
    shape: ResultShape,
    format: OutputFormat,
) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(query_text(report, shape)),
        OutputFormat::Json => {
            let results: Vec<Json> = report
                .records
                .iter()
                .flat_map(|record| query_json(record, shape))
                .collect();
            to_json(json!({
                "results": results,
                "planned": report.planned,
                "skipped": report.skipped,
                "failures": report.failures,
            }))
        }
    }
}

fn query_text(report: &BatchReport<QueryRecord>, shape: ResultShape) -> String {
    let mut out = String::new();
    for record in &report.records {
        let prefix = record
            .target
            .as_ref()
            .map(|t| format!("[{t}] "))
            .unwrap_or_default();

        match shape {
            ResultShape::Single => {
                let value = record
                    .result
                    .first_value()
                    .map(Value::to_display_string)
                    .unwrap_or_else(|| "NULL".to_string());
                out.push_str(&format!("{prefix}{value}\n"));
            }
            ResultShape::Tables => {
                for (i, set) in record.result.sets.iter().enumerate() {
                    out.push_str(&format!("{prefix}{} (result set {})\n", record.source, i + 1));
                    out.push_str(&set_table(set, None).to_string());
                    out.push('\n');
                }
            }
            ResultShape::Rows => {
                for set in record.result.sets.iter().filter(|s| !s.columns.is_empty()) {
                    out.push_str(&set_table(set, record.target.as_deref()).to_string());
                    out.push('\n');
                }
            }
        }

        for message in &record.result.messages {
            out.push_str(&format!("{prefix}{message}\n"));
        }
        if record.result.sets.is_empty() {
            if let Some(n) = record.result.rows_affected {
                out.push_str(&format!("{prefix}{}: {n} row(s) affected\n", record.source));
            }
        }
    }

    push_planned(&mut out, &report.planned);
    push_skipped(&mut out, &report.skipped);
    out
}

fn set_table(set: &ResultSet, instance: Option<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);

    let mut header: Vec<Cell> = Vec::with_capacity(set.columns.len() + 1);
    if instance.is_some() {
        header.push(Cell::new(INSTANCE_COLUMN));
    }
    header.extend(set.columns.iter().map(|c| Cell::new(&c.name)));
    table.set_header(header);

    for row in &set.rows {
        let mut cells: Vec<Cell> = Vec::with_capacity(row.len() + 1);
        if let Some(instance) = instance {
            cells.push(Cell::new(instance));
        }
        cells.extend(row.iter().map(|v| Cell::new(v.to_display_string())));
        table.add_row(cells);
    }
    table
}

fn query_json(record: &QueryRecord, shape: ResultShape) -> Vec<Json> {
    match shape {
        ResultShape::Single => {
            let value = record
                .result
                .first_value()
                .map(value_json)
                .unwrap_or(Json::Null);
            vec![tagged(record, vec![("value", value)])]
        }
        ResultShape::Tables => record
            .result
            .sets
            .iter()
            .map(|set| {
                let rows: Vec<Json> = set.rows.iter().map(|row| row_json(set, row, None)).collect();
                tagged(
                    record,
                    vec![
                        ("source", Json::String(record.source.clone())),
                        ("columns", json!(set.column_names())),
                        ("rows", Json::Array(rows)),
                    ],
                )
            })
            .collect(),
        ResultShape::Rows => record
            .result
            .sets
            .iter()
            .flat_map(|set| {
                set.rows
                    .iter()
                    .map(|row| row_json(set, row, record.target.as_deref()))
            })
            .collect(),
    }
}

fn tagged(record: &QueryRecord, fields: Vec<(&str, Json)>) -> Json {
    let mut object = Map::new();
    if let Some(target) = &record.target {
        object.insert(INSTANCE_COLUMN.to_string(), Json::String(target.clone()));
    }
    for (key, value) in fields {
        object.insert(key.to_string(), value);
    }
    Json::Object(object)
}

fn row_json(set: &ResultSet, row: &[Value], instance: Option<&str>) -> Json {
    let mut object = Map::new();
    if let Some(instance) = instance {
        object.insert(INSTANCE_COLUMN.to_string(), Json::String(instance.to_string()));
    }
    for (column, value) in set.columns.iter().zip(row) {
        object.insert(column.name.clone(), value_json(value));
    }
    Json::Object(object)
}

fn value_json(value: &Value) -> Json {
    serde_json::to_value(value).unwrap_or(Json::Null)
}

/// Renders a membership report.
pub fn render_membership_report(
    report: &BatchReport<MembershipRecord>,
    format: OutputFormat,
) -> Result<String> {
    match format {
        OutputFormat::Json => to_json(json!({
            "changes": report.records,
            "planned": report.planned,
            "skipped": report.skipped,
            "failures": report.failures,
        })),
        OutputFormat::Text => {
            let mut out = String::new();
            if !report.records.is_empty() {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["instance", "server role", "member", "kind", "action"]);
                for record in &report.records {
                    table.add_row(vec![
                        record.instance.clone(),
                        record.server_role.clone(),
                        record.member.clone(),
                        record.member_kind.to_string(),
                        format!("{:?}", record.action).to_lowercase(),
                    ]);
                }
                out.push_str(&table.to_string());
                out.push('\n');
            }
            push_planned(&mut out, &report.planned);
            push_skipped(&mut out, &report.skipped);
            Ok(out)
        }
    }
}

/// Renders a role listing.
pub fn render_roles(
    report: &BatchReport<(String, ServerRole)>,
    format: OutputFormat,
) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let roles: Vec<Json> = report
                .records
                .iter()
                .map(|(instance, role)| {
                    json!({ "instance": instance, "role": role.name, "members": role.members })
                })
                .collect();
            to_json(json!({ "roles": roles, "failures": report.failures }))
        }
        OutputFormat::Text => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["instance", "role", "members"]);
            for (instance, role) in &report.records {
                table.add_row(vec![
                    instance.clone(),
                    role.name.clone(),
                    role.members.join(", "),
                ]);
            }
            Ok(format!("{table}\n"))
        }
    }
}

/// Renders target failures for stderr.
pub fn render_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(|f| match &f.source {
            Some(source) => format!("{}: {} ({source}): {}\n", f.target, f.category, f.message),
            None => format!("{}: {}: {}\n", f.target, f.category, f.message),
        })
        .collect()
}

fn push_planned(out: &mut String, planned: &[PlannedAction]) {
    for action in planned {
        out.push_str(&format!("What if: {action}\n"));
    }
}

fn push_skipped(out: &mut String, skipped: &[Skipped]) {
    for skip in skipped {
        out.push_str(&format!("Skipped [{}]: {}\n", skip.target, skip.reason));
    }
}

fn to_json(value: Json) -> Result<String> {
    serde_json::to_string_pretty(&value)
        .map_err(|e| FleetError::internal(format!("Failed to serialize output: {e}")))
}

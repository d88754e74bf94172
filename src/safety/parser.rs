//! Dialect-aware statement walking.
//!
//! Uses sqlparser-rs with the dialect of the target backend. CTEs, derived
//! tables and set operations are walked so a data-modifying statement hidden
//! inside a query is still seen.

use sqlparser::ast::{Query, Select, Set, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::{MsSqlDialect, PostgreSqlDialect};
use sqlparser::parser::{Parser, ParserError};

use crate::db::DatabaseBackend;

use super::{Classification, SafetyLevel, StatementKind};

type Verdict = (SafetyLevel, StatementKind);

const SAFE_SELECT: Verdict = (SafetyLevel::Safe, StatementKind::Select);

/// Classifies SQL for one backend dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlClassifier {
    backend: DatabaseBackend,
}

impl SqlClassifier {
    pub fn for_backend(backend: DatabaseBackend) -> Self {
        Self { backend }
    }

    /// Classifies one batch. Empty or unparseable text is destructive.
    pub fn classify(&self, sql: &str) -> Classification {
        match self.parse(sql) {
            Ok(statements) if statements.is_empty() => {
                Classification::new(SafetyLevel::Destructive, StatementKind::Unknown, 0)
                    .with_note("empty batch")
            }
            Ok(statements) => {
                let (level, kind) = statements
                    .iter()
                    .map(classify_statement)
                    .reduce(worse)
                    .unwrap_or(SAFE_SELECT);
                let classification = Classification::new(level, kind, statements.len());
                if level == SafetyLevel::Destructive {
                    classification.with_note("cannot be undone")
                } else {
                    classification
                }
            }
            Err(_) => Classification::new(SafetyLevel::Destructive, StatementKind::Unknown, 0)
                .with_note("could not be parsed"),
        }
    }

    /// Classifies the batches of one script, keeping the worst verdict and
    /// the total statement count.
    pub fn classify_batches<'a>(&self, batches: impl IntoIterator<Item = &'a str>) -> Classification {
        let mut total = 0;
        let mut worst: Option<Classification> = None;
        for batch in batches {
            let next = self.classify(batch);
            total += next.statements.max(1);
            worst = match worst {
                Some(current) if current.level >= next.level => Some(current),
                _ => Some(next),
            };
        }
        match worst {
            Some(mut classification) => {
                classification.statements = total;
                classification
            }
            None => Classification::new(SafetyLevel::Safe, StatementKind::Unknown, 0),
        }
    }

    fn parse(&self, sql: &str) -> Result<Vec<Statement>, ParserError> {
        match self.backend {
            DatabaseBackend::Mssql => Parser::parse_sql(&MsSqlDialect {}, sql),
            DatabaseBackend::Postgres => Parser::parse_sql(&PostgreSqlDialect {}, sql),
        }
    }
}

/// The first verdict wins ties.
fn worse(current: Verdict, next: Verdict) -> Verdict {
    if next.0 > current.0 {
        next
    } else {
        current
    }
}

fn classify_statement(statement: &Statement) -> Verdict {
    use SafetyLevel::{Destructive, Mutating, Safe};

    match statement {
        Statement::Query(query) => classify_query(query),
        Statement::Explain {
            analyze, statement, ..
        } => {
            // EXPLAIN ANALYZE runs the statement.
            let level = if *analyze {
                classify_statement(statement).0
            } else {
                Safe
            };
            (level, StatementKind::Explain)
        }
        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. } => (Safe, StatementKind::Show),
        Statement::Set(Set::SingleAssignment { .. } | Set::ParenthesizedAssignments { .. }) => {
            (Safe, StatementKind::Set)
        }

        Statement::Insert(_) => (Mutating, StatementKind::Insert),
        Statement::Update { .. } => (Mutating, StatementKind::Update),
        Statement::Merge { .. } => (Mutating, StatementKind::Merge),

        Statement::Delete(_) => (Destructive, StatementKind::Delete),
        Statement::Drop { .. } => (Destructive, StatementKind::Drop),
        Statement::Truncate { .. } => (Destructive, StatementKind::Truncate),
        Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterRole { .. } => (Destructive, StatementKind::Alter),
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateRole { .. } => (Destructive, StatementKind::Create),
        Statement::Grant { .. } => (Destructive, StatementKind::Grant),
        Statement::Revoke { .. } => (Destructive, StatementKind::Revoke),

        _ => (Destructive, StatementKind::Unknown),
    }
}

fn classify_query(query: &Query) -> Verdict {
    let ctes = query
        .with
        .iter()
        .flat_map(|with| with.cte_tables.iter())
        .map(|cte| classify_query(&cte.query));

    std::iter::once(classify_set_expr(&query.body))
        .chain(ctes)
        .fold(SAFE_SELECT, worse)
}

fn classify_set_expr(set_expr: &SetExpr) -> Verdict {
    match set_expr {
        SetExpr::Delete(stmt)
        | SetExpr::Update(stmt)
        | SetExpr::Insert(stmt)
        | SetExpr::Merge(stmt) => classify_statement(stmt),
        SetExpr::Query(query) => classify_query(query),
        SetExpr::Select(select) => classify_select(select),
        SetExpr::SetOperation { left, right, .. } => {
            worse(classify_set_expr(left), classify_set_expr(right))
        }
        SetExpr::Values(_) | SetExpr::Table(_) => SAFE_SELECT,
    }
}

fn classify_select(select: &Select) -> Verdict {
    select
        .from
        .iter()
        .map(classify_from)
        .fold(SAFE_SELECT, worse)
}

fn classify_from(twj: &TableWithJoins) -> Verdict {
    std::iter::once(&twj.relation)
        .chain(twj.joins.iter().map(|join| &join.relation))
        .map(|factor| match factor {
            TableFactor::Derived { subquery, .. } => classify_query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => classify_from(table_with_joins),
            _ => SAFE_SELECT,
        })
        .fold(SAFE_SELECT, worse)
}

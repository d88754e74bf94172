//! Impact classification for SQL text.
//!
//! Parses a batch with the target's dialect and decides how much it can
//! change on the server. The confirmation gate only sees the resulting
//! [`Impact`].

mod parser;

pub use parser::SqlClassifier;

use std::fmt;

use crate::batch::Impact;

/// How much a batch can change. Ordered from harmless to dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SafetyLevel {
    /// SELECT, EXPLAIN, SHOW, SET.
    Safe,
    /// INSERT, UPDATE, MERGE.
    Mutating,
    /// DELETE, DDL, permission changes and anything unparseable.
    Destructive,
}

impl SafetyLevel {
    pub fn impact(self) -> Impact {
        match self {
            Self::Safe => Impact::Low,
            Self::Mutating => Impact::Medium,
            Self::Destructive => Impact::High,
        }
    }
}

/// Leading keyword of the most dangerous statement in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Merge,
    Delete,
    Drop,
    Truncate,
    Alter,
    Create,
    Grant,
    Revoke,
    Explain,
    Show,
    Set,
    Unknown,
}

impl StatementKind {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Merge => "MERGE",
            Self::Delete => "DELETE",
            Self::Drop => "DROP",
            Self::Truncate => "TRUNCATE",
            Self::Alter => "ALTER",
            Self::Create => "CREATE",
            Self::Grant => "GRANT",
            Self::Revoke => "REVOKE",
            Self::Explain => "EXPLAIN",
            Self::Show => "SHOW",
            Self::Set => "SET",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Outcome of classifying one or more batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub level: SafetyLevel,
    pub kind: StatementKind,
    /// Number of statements seen.
    pub statements: usize,
    /// Shown next to the planned action when present.
    pub note: Option<&'static str>,
}

impl Classification {
    pub fn new(level: SafetyLevel, kind: StatementKind, statements: usize) -> Self {
        Self {
            level,
            kind,
            statements,
            note: None,
        }
    }

    pub fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    pub fn impact(&self) -> Impact {
        self.level.impact()
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.statements > 1 {
            write!(f, "{} statements, worst {}", self.statements, self.kind.keyword())?;
        } else {
            f.write_str(self.kind.keyword())?;
        }
        if let Some(note) = self.note {
            write!(f, " ({note})")?;
        }
        Ok(())
    }
}

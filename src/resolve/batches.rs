//! Splitting SQL Server scripts on `GO` separators.

use std::sync::OnceLock;

use regex::Regex;

fn separator() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*GO(?:\s+(\d+))?\s*(?:--.*)?$").expect("separator pattern is valid")
    })
}

/// One batch of a script and how many times to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub sql: String,
    /// From `GO n`; at least 1.
    pub repeat: u64,
}

impl Batch {
    fn new(sql: &str, repeat: u64) -> Self {
        Self {
            sql: sql.trim_end().to_string(),
            repeat: repeat.max(1),
        }
    }
}

/// Splits script text into batches.
///
/// A line containing only `GO` ends the current batch. `GO n` runs the
/// preceding batch `n` times. Batches that are empty or whitespace are dropped.
pub fn split_batches(script: &str) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = String::new();

    for line in script.lines() {
        match separator().captures(line) {
            Some(caps) => {
                let repeat = caps
                    .get(1)
                    .and_then(|m| m.as_str().parse::<u64>().ok())
                    .unwrap_or(1);
                if !current.trim().is_empty() {
                    batches.push(Batch::new(&current, repeat));
                }
                current.clear();
            }
            None => {
                current.push_str(line);
                current.push('\n');
            }
        }
    }

    if !current.trim().is_empty() {
        batches.push(Batch::new(&current, 1));
    }
    batches
}

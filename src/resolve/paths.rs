//! Local path resolution: directory listings, wildcard expansion and
//! rejection of non-local references.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use url::Url;

use crate::error::{FleetError, Result};

/// Returns true if `s` contains `*` or `?`.
pub fn has_wildcards(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// Returns true if `path` has one of `extensions` (case-insensitive, no dot).
pub fn has_script_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            extensions
                .iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Lists the script files directly inside `dir`, sorted by file name.
///
/// Subdirectories are not searched.
pub fn list_scripts(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(FleetError::not_found(format!(
            "Directory {} does not exist",
            dir.display()
        )));
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| FleetError::not_found(format!("Cannot read {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && has_script_extension(path, extensions))
        .collect();

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Converts a wildcard pattern to an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut regex = String::with_capacity(pattern.len() + 8);
    if cfg!(windows) {
        regex.push_str("(?i)");
    }
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex)
        .map_err(|e| FleetError::unsupported_input(format!("Invalid wildcard '{pattern}': {e}")))
}

/// Maps a path string to a local path.
///
/// `file://` URLs become paths. Any other URL scheme is rejected with
/// `InvalidReference`. Single-letter schemes are Windows drive letters.
pub fn local_path(reference: &str) -> Result<PathBuf> {
    match Url::parse(reference) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().map_err(|_| {
            FleetError::invalid_reference(format!("'{reference}' is not a valid local file URL"))
        }),
        Ok(url) if url.scheme().len() > 1 => Err(FleetError::invalid_reference(format!(
            "'{reference}' uses the '{}' scheme; only local files can be executed",
            url.scheme()
        ))),
        _ => Ok(PathBuf::from(reference)),
    }
}

/// Resolves a path string to the files it names.
///
/// Wildcards are expanded in the last path component only. Directories are
/// skipped. Matches are sorted by file name.
pub fn expand(reference: &str) -> Result<Vec<PathBuf>> {
    let path = local_path(reference)?;
    let text = path.to_string_lossy();

    if !has_wildcards(&text) {
        if !path.exists() {
            return Err(FleetError::not_found(format!(
                "File {} does not exist",
                path.display()
            )));
        }
        return Ok(if path.is_dir() { Vec::new() } else { vec![path] });
    }

    let pattern = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| FleetError::unsupported_input(format!("Invalid path '{reference}'")))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if has_wildcards(&parent.to_string_lossy()) {
        return Err(FleetError::unsupported_input(format!(
            "Wildcards are only supported in the file name: '{reference}'"
        )));
    }
    if !parent.is_dir() {
        return Err(FleetError::not_found(format!(
            "Directory {} does not exist",
            parent.display()
        )));
    }

    let matcher = wildcard_regex(&pattern)?;
    let mut matches: Vec<PathBuf> = fs::read_dir(&parent)
        .map_err(|e| FleetError::not_found(format!("Cannot read {}: {e}", parent.display())))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| matcher.is_match(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .filter(|path| !path.is_dir())
        .collect();

    if matches.is_empty() {
        return Err(FleetError::not_found(format!("No files match '{reference}'")));
    }
    matches.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(matches)
}

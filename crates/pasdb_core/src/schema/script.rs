//! Schema script discovery and statement splitting.

use crate::error::{DbError, DbResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder replaced with the table prefix.
pub const DB_PREFIX_PLACEHOLDER: &str = "__db_prefix__";

/// Upgrade files of one schema directory, keyed by version.
#[derive(Debug, Default)]
pub(crate) struct ScriptSet {
    sql: BTreeMap<u64, PathBuf>,
    manifests: BTreeMap<u64, PathBuf>,
}

impl ScriptSet {
    /// Collects `schema_<N>.sql` and `schema_<N>.json` files.
    ///
    /// A missing directory yields an empty set.
    pub(crate) fn discover(directory: &Path) -> DbResult<Self> {
        let mut scripts = Self::default();
        if !directory.is_dir() {
            return Ok(scripts);
        }
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_ascii_lowercase) else {
                continue;
            };
            match parse_script_name(&name) {
                Some((version, ScriptKind::Sql)) => {
                    scripts.sql.insert(version, entry.path());
                }
                Some((version, ScriptKind::Manifest)) => {
                    scripts.manifests.insert(version, entry.path());
                }
                None => {}
            }
        }
        Ok(scripts)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sql.is_empty() && self.manifests.is_empty()
    }

    /// SQL files with a version in `(current, target]`, ascending.
    pub(crate) fn steps_between(&self, current: u64, target: u64) -> Vec<(u64, &Path)> {
        if current >= target {
            return Vec::new();
        }
        self.sql
            .range(current + 1..=target)
            .map(|(version, path)| (*version, path.as_path()))
            .collect()
    }

    pub(crate) fn manifest(&self, version: u64) -> Option<&Path> {
        self.manifests.get(&version).map(PathBuf::as_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    Sql,
    Manifest,
}

fn parse_script_name(name: &str) -> Option<(u64, ScriptKind)> {
    let (version, extension) = name.strip_prefix("schema_")?.split_once('.')?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let kind = match extension {
        "sql" => ScriptKind::Sql,
        "json" => ScriptKind::Manifest,
        _ => return None,
    };
    Some((version.parse().ok()?, kind))
}

/// Reads an SQL file and splits it into statements.
pub(crate) fn load_statements(path: &Path, prefix: &str) -> DbResult<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|err| {
        DbError::io(format!("Schema file '{}' is invalid: {err}", path.display()))
    })?;
    Ok(split_statements(&content, prefix))
}

/// Splits an SQL script into trimmed, non-empty statements.
///
/// `__db_prefix__` is replaced with `prefix` and lines starting with `--`
/// are dropped. A `;` preceded by an odd number of backslashes does not end
/// the statement; one backslash is removed and the `;` kept.
#[must_use]
pub fn split_statements(content: &str, prefix: &str) -> Vec<String> {
    let content = content.replace(DB_PREFIX_PLACEHOLDER, prefix);
    let content = content
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    let pieces: Vec<&str> = content.split(';').collect();
    let last = pieces.len().saturating_sub(1);
    let mut statements = Vec::new();
    let mut current = String::new();

    for (index, piece) in pieces.into_iter().enumerate() {
        let backslashes = piece.len() - piece.trim_end_matches('\\').len();
        if index < last && backslashes % 2 == 1 {
            current.push_str(&piece[..piece.len() - 1]);
            current.push(';');
            continue;
        }
        current.push_str(piece);
        let statement = current.trim();
        if !statement.is_empty() {
            statements.push(statement.to_string());
        }
        current.clear();
    }
    statements
}

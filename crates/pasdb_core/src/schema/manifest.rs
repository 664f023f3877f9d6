//! Upgrade step manifests (`schema_<N>.json`).

use crate::error::{DbError, DbResult};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// A schema version another schema must have reached.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchemaDependency {
    /// Class name of the required schema.
    pub name: String,
    /// Minimum version.
    pub version_required: u64,
}

#[derive(Debug, Default, Deserialize)]
struct DependencyEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version_required: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    List(Vec<DependencyEntry>),
    Object {
        #[serde(default)]
        dependencies: Vec<DependencyEntry>,
    },
}

/// Parses manifest JSON. Entries lacking a name or version are skipped.
///
/// # Errors
///
/// Returns [`DbError::Json`] if the document has neither supported shape.
pub fn parse_dependencies(json: &str) -> DbResult<Vec<SchemaDependency>> {
    let entries = match serde_json::from_str(json)? {
        ManifestFile::List(entries) | ManifestFile::Object { dependencies: entries } => entries,
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            Some(SchemaDependency {
                name: entry.name?,
                version_required: entry.version_required?,
            })
        })
        .collect())
}

pub(crate) fn load_dependencies(path: &Path) -> DbResult<Vec<SchemaDependency>> {
    let content = fs::read_to_string(path).map_err(|err| {
        DbError::io(format!(
            "An error occurred while reading database schema settings '{}': {err}",
            path.display()
        ))
    })?;
    parse_dependencies(&content).map_err(|err| {
        DbError::io(format!(
            "'{}' is not a valid JSON encoded file: {err}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_form() {
        let dependencies =
            parse_dependencies(r#"{"dependencies": [{"name": "X", "version_required": 3}]}"#)
                .unwrap();
        assert_eq!(
            dependencies,
            vec![SchemaDependency {
                name: "X".into(),
                version_required: 3
            }]
        );
    }

    #[test]
    fn list_form_skips_incomplete_entries() {
        let dependencies =
            parse_dependencies(r#"[{"name": "A", "version_required": 1}, {"name": "B"}]"#).unwrap();
        assert_eq!(dependencies.len(), 1);
        assert_eq!(dependencies[0].name, "A");
    }

    #[test]
    fn object_without_dependencies_is_empty() {
        assert!(parse_dependencies(r#"{"comment": "none"}"#).unwrap().is_empty());
    }

    #[test]
    fn invalid_json_fails() {
        assert!(matches!(parse_dependencies("[1,"), Err(DbError::Json(_))));
    }
}

//! Test fixtures and registry helpers.
//!
//! Provides registries backed by an inspectable [`MemoryEngine`] and a
//! temporary data directory for schema scripts.

use pasdb_core::{Connection, Instance, Registry, Schema, Settings};
use pasdb_session::MemoryEngine;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A registry over a fresh in-memory engine with automatic cleanup.
pub struct TestRegistry {
    /// The registry.
    pub registry: Registry,
    /// The engine, for inspecting committed state and injecting failures.
    pub engine: MemoryEngine,
    data_dir: TempDir,
}

impl TestRegistry {
    /// Threaded registry using savepoints for nested transactions.
    pub fn memory() -> Self {
        Self::with_settings(Settings::new())
    }

    /// Registry serializing connection contexts across threads.
    pub fn serialized() -> Self {
        Self::with_settings(
            Settings::new()
                .threaded(false)
                .lock_timeout(Duration::from_secs(5)),
        )
    }

    /// Registry using subtransactions instead of savepoints.
    pub fn subtransactions() -> Self {
        Self::with_settings(Settings::new().use_native_nested(false))
    }

    /// Registry with either nesting policy.
    pub fn nested(use_native_nested: bool) -> Self {
        Self::with_settings(Settings::new().use_native_nested(use_native_nested))
    }

    /// Registry built from `settings`; URL and data path are overridden.
    pub fn with_settings(settings: Settings) -> Self {
        let data_dir = TempDir::new().expect("Failed to create temp directory");
        let engine = MemoryEngine::new();
        let registry = Registry::with_engine(
            settings.url("memory:").path_data(data_dir.path()),
            Arc::new(engine.clone()),
        )
        .expect("Failed to open registry");
        Self {
            registry,
            engine,
            data_dir,
        }
    }

    /// Returns the data directory.
    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    /// Returns the schema script directory of `class_name`.
    pub fn schema_dir(&self, class_name: &str) -> SchemaDir {
        SchemaDir::new(self.registry.settings().schema_directory(class_name))
    }

    /// Returns this thread's connection.
    pub fn connection(&self) -> Rc<Connection> {
        self.registry
            .connection()
            .expect("Failed to get connection")
    }

    /// Records `version` for `class_name` as if an upgrade had applied it.
    pub fn record_schema_version(&self, class_name: &str, version: u64) {
        let mut entry = Schema::new(&self.registry).expect("Failed to create schema entry");
        entry
            .set_data_attributes(&[("name", class_name.into()), ("version", version.into())])
            .expect("Failed to set schema entry");
        entry.save().expect("Failed to save schema entry");
    }
}

impl std::ops::Deref for TestRegistry {
    type Target = Registry;

    fn deref(&self) -> &Self::Target {
        &self.registry
    }
}

/// Runs a test with a fresh [`TestRegistry`].
pub fn with_test_registry<F, R>(f: F) -> R
where
    F: FnOnce(&TestRegistry) -> R,
{
    let registry = TestRegistry::memory();
    f(&registry)
}

/// Writer for the upgrade scripts of one schema directory.
#[derive(Debug, Clone)]
pub struct SchemaDir {
    path: PathBuf,
}

impl SchemaDir {
    /// Uses `path`, creating it if needed.
    pub fn new(path: PathBuf) -> Self {
        fs::create_dir_all(&path).expect("Failed to create schema directory");
        Self { path }
    }

    /// Returns the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `schema_<version>.sql`.
    pub fn sql(&self, version: u64, content: &str) -> &Self {
        self.file(&format!("schema_{version}.sql"), content)
    }

    /// Writes `schema_<version>.json` requiring the given schema versions.
    pub fn requires(&self, version: u64, dependencies: &[(&str, u64)]) -> &Self {
        let dependencies: Vec<_> = dependencies
            .iter()
            .map(|(name, required)| {
                serde_json::json!({ "name": name, "version_required": required })
            })
            .collect();
        let manifest = serde_json::json!({ "dependencies": dependencies });
        self.file(&format!("schema_{version}.json"), &manifest.to_string())
    }

    /// Writes an arbitrary file.
    pub fn file(&self, name: &str, content: &str) -> &Self {
        fs::write(self.path.join(name), content).expect("Failed to write schema file");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_dir_follows_settings_layout() {
        let test = TestRegistry::memory();
        let dir = test.schema_dir("Note");
        assert_eq!(
            dir.path(),
            test.data_dir().join("database").join("memory_schema").join("Note")
        );
        dir.sql(2, "SELECT 2;").requires(2, &[("Other", 1)]);
        assert!(dir.path().join("schema_2.sql").is_file());
        assert!(dir.path().join("schema_2.json").is_file());
    }

    #[test]
    fn recorded_versions_are_visible() {
        with_test_registry(|test| {
            test.record_schema_version("Note", 4);
            assert_eq!(Schema::current_version(test, "Note").unwrap(), 4);
        });
    }

    #[test]
    fn policies() {
        assert!(!TestRegistry::subtransactions().settings().use_native_nested);
        assert!(TestRegistry::serialized().is_serialized());
        assert!(!TestRegistry::memory().is_serialized());
    }
}

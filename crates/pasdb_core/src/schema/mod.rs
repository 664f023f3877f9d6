//! Versioned schema upgrades.
//!
//! Each versioned entity keeps its upgrade scripts in
//! `<path_data>/database/<backend>_schema/<ClassName>/`:
//!
//! - `schema_<N>.sql`: statements upgrading to version `N`
//! - `schema_<N>.json`: optional manifest listing the schema versions of other
//!   entities the step depends on
//!
//! Applied versions are recorded in the `schema_version` table. A fresh
//! install records the target version without running scripts, since the
//! tables are expected to be created at that version.

mod manifest;
mod script;

pub use manifest::{parse_dependencies, SchemaDependency};
pub use script::{split_statements, DB_PREFIX_PLACEHOLDER};

use crate::connection::Connection;
use crate::descriptor::EntityDescriptor;
use crate::error::{DbError, DbResult};
use crate::instance::{Instance, InstanceBase};
use crate::registry::Registry;
use crate::transaction_context::TransactionContext;
use crate::unix_time;
use pasdb_session::{Filter, Order, Row, Value};
use script::ScriptSet;
use std::any::Any;
use tracing::{error, info, warn};

/// Entity recording applied schema versions.
pub const SCHEMA_VERSION: EntityDescriptor = EntityDescriptor {
    class_name: "SchemaVersion",
    table: "schema_version",
    primary_key: "id",
    columns: &["id", "name", "version", "applied"],
    schema_version: Some(1),
    instance_class: Some("Schema"),
};

/// How [`Schema::apply_version`] finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOutcome {
    /// No version was recorded; the target version was recorded directly.
    Installed,
    /// Upgrade steps were applied up to the target version.
    Upgraded,
    /// The step to `version` has unmet dependencies. Earlier steps were kept.
    Halted {
        /// Version whose step was not applied.
        version: u64,
        /// Names of the schemas below their required version.
        missing: Vec<String>,
    },
    /// Nothing to do.
    UpToDate,
}

/// Report of one [`Schema::apply_version`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaUpgrade {
    /// Class name of the upgraded entity.
    pub class_name: String,
    /// Version recorded before the run; 0 if none.
    pub previous_version: u64,
    /// Version expected by the code.
    pub target_version: u64,
    /// Version recorded after the run.
    pub final_version: u64,
    /// Versions whose scripts were applied, ascending.
    pub applied: Vec<u64>,
    /// How the run finished.
    pub outcome: SchemaOutcome,
}

/// A recorded schema version.
#[derive(Debug)]
pub struct Schema {
    base: InstanceBase,
}

impl Schema {
    /// Creates an empty entry.
    ///
    /// # Errors
    ///
    /// Infallible for a fresh entry; kept fallible for symmetry with
    /// [`Schema::from_row`].
    pub fn new(registry: &Registry) -> DbResult<Self> {
        Ok(Self {
            base: InstanceBase::new(registry, &SCHEMA_VERSION, None)?,
        })
    }

    /// Encapsulates an existing `schema_version` row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Type`] if the row belongs to another entity.
    pub fn from_row(registry: &Registry, row: Row) -> DbResult<Self> {
        Ok(Self {
            base: InstanceBase::new(registry, &SCHEMA_VERSION, Some(row))?,
        })
    }

    fn construct(registry: &Registry, row: Option<Row>) -> DbResult<Box<dyn Instance>> {
        Ok(Box::new(Self {
            base: InstanceBase::new(registry, &SCHEMA_VERSION, row)?,
        }))
    }

    /// Returns the schema class name.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    pub fn name(&mut self) -> DbResult<String> {
        Ok(self
            .get_data_attribute("name")?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    /// Returns the recorded version.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    pub fn version(&mut self) -> DbResult<u64> {
        let version = self.get_data_attribute("version")?;
        Ok(version
            .as_i64()
            .and_then(|version| u64::try_from(version).ok())
            .unwrap_or_default())
    }

    /// Loads the entry with the highest version for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NothingMatched`] if no version is recorded.
    pub fn load_latest_name_entry(registry: &Registry, name: &str) -> DbResult<Self> {
        let query = SCHEMA_VERSION
            .query(registry.table_prefix())
            .filter(Filter::eq("name", name))
            .order_by("version", Order::Descending)
            .limit(1);
        let connection = Connection::get_instance(registry)?;
        let row = connection
            .scope(|connection| connection.query(&query))?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::nothing_matched(format!("Schema name '{name}' is invalid")))?;
        Self::from_row(registry, row)
    }

    /// Returns the latest recorded version of `name`, or 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails for another reason than a
    /// missing entry.
    pub fn current_version(registry: &Registry, name: &str) -> DbResult<u64> {
        match Self::load_latest_name_entry(registry, name) {
            Ok(mut entry) => entry.version(),
            Err(err) if err.is_nothing_matched() => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Brings the schema of `descriptor` to its declared version.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Type`] if the entity is not versioned. Any error
    /// while upgrading is logged and returned; the partial upgrade is rolled
    /// back. Unmet dependencies are not an error.
    pub fn apply_version(
        registry: &Registry,
        descriptor: &EntityDescriptor,
    ) -> DbResult<SchemaUpgrade> {
        let Some(target_version) = descriptor.schema_version else {
            return Err(DbError::type_error(format!(
                "{} is not a versioned database entity",
                descriptor.class_name
            )));
        };
        let class_name = descriptor.class_name;
        let connection = Connection::get_instance(registry)?;

        connection.scope(|_| -> DbResult<SchemaUpgrade> {
            let current_version = Self::current_version(registry, class_name)?;
            let mut upgrade = SchemaUpgrade {
                class_name: class_name.to_string(),
                previous_version: current_version,
                target_version,
                final_version: current_version,
                applied: Vec::new(),
                outcome: SchemaOutcome::UpToDate,
            };

            if current_version == 0 {
                info!(schema = class_name, version = target_version, "database schema installed");
                record_version(registry, class_name, target_version)?;
                upgrade.final_version = target_version;
                upgrade.outcome = SchemaOutcome::Installed;
                return Ok(upgrade);
            }
            if current_version >= target_version {
                return Ok(upgrade);
            }

            let directory = registry.settings().schema_directory(class_name);
            let scripts = ScriptSet::discover(&directory)?;
            if scripts.is_empty() {
                return Ok(upgrade);
            }
            if let Err(err) = upgrade_steps(registry, &scripts, &mut upgrade) {
                error!(schema = class_name, error = %err, "An error occurred updating the database schema");
                return Err(err);
            }
            Ok(upgrade)
        })
    }
}

fn upgrade_steps(
    registry: &Registry,
    scripts: &ScriptSet,
    upgrade: &mut SchemaUpgrade,
) -> DbResult<()> {
    let class_name = upgrade.class_name.clone();
    info!(
        schema = %class_name,
        from = upgrade.previous_version,
        to = upgrade.target_version,
        "upgrading database schema"
    );

    let mut context = TransactionContext::new(registry);
    let scope = context.scope()?;
    for (version, path) in scripts.steps_between(upgrade.previous_version, upgrade.target_version) {
        if let Some(manifest) = scripts.manifest(version) {
            let missing = missing_dependencies(registry, &manifest::load_dependencies(manifest)?)?;
            if !missing.is_empty() {
                warn!(
                    schema = %class_name,
                    version,
                    missing = ?missing,
                    "stopped schema upgrade because of missing dependencies"
                );
                upgrade.outcome = SchemaOutcome::Halted { version, missing };
                break;
            }
        }

        for statement in script::load_statements(path, registry.table_prefix())? {
            scope.connection().execute(&statement)?;
        }
        record_version(registry, &class_name, version)?;
        info!(schema = %class_name, version, "database schema upgraded");
        upgrade.applied.push(version);
        upgrade.final_version = version;
    }
    scope.finish();

    if !upgrade.applied.is_empty() && upgrade.outcome == SchemaOutcome::UpToDate {
        upgrade.outcome = SchemaOutcome::Upgraded;
    }
    Ok(())
}

fn missing_dependencies(
    registry: &Registry,
    dependencies: &[SchemaDependency],
) -> DbResult<Vec<String>> {
    let mut missing = Vec::new();
    for dependency in dependencies {
        if Schema::current_version(registry, &dependency.name)? < dependency.version_required {
            missing.push(dependency.name.clone());
        }
    }
    Ok(missing)
}

fn record_version(registry: &Registry, class_name: &str, version: u64) -> DbResult<()> {
    let mut entry = Schema::new(registry)?;
    entry.set_data_attributes(&[("name", Value::from(class_name)), ("version", Value::from(version))])?;
    entry.save()
}

impl Instance for Schema {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut InstanceBase {
        &mut self.base
    }

    fn descriptor(&self) -> EntityDescriptor {
        SCHEMA_VERSION
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn initialize_row(&self, row: &Row) {
        row.set("id", uuid::Uuid::new_v4().simple().to_string());
        row.set("applied", unix_time());
    }
}

pub(crate) fn register(registry: &Registry) {
    registry.register_entity(SCHEMA_VERSION);
    registry.instances().register("Schema", Schema::construct);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use pasdb_session::MemoryEngine;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    const NOTE: EntityDescriptor = EntityDescriptor {
        class_name: "Note",
        table: "note",
        primary_key: "id",
        columns: &["id", "text"],
        schema_version: Some(3),
        instance_class: None,
    };

    fn registry(dir: &TempDir) -> (Registry, MemoryEngine) {
        let engine = MemoryEngine::new();
        let registry = Registry::with_engine(
            Settings::new().url("memory:").path_data(dir.path()),
            Arc::new(engine.clone()),
        )
        .unwrap();
        (registry, engine)
    }

    fn write_script(dir: &TempDir, class_name: &str, name: &str, content: &str) {
        let directory = dir
            .path()
            .join("database")
            .join("memory_schema")
            .join(class_name);
        fs::create_dir_all(&directory).unwrap();
        fs::write(directory.join(name), content).unwrap();
    }

    #[test]
    fn unversioned_entity_is_a_type_error() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = registry(&dir);
        let plain = EntityDescriptor {
            schema_version: None,
            ..NOTE
        };
        assert!(matches!(
            Schema::apply_version(&registry, &plain),
            Err(DbError::Type { .. })
        ));
    }

    #[test]
    fn fresh_install_records_target() {
        let dir = TempDir::new().unwrap();
        let (registry, engine) = registry(&dir);
        write_script(&dir, "Note", "schema_2.sql", "CREATE TABLE __db_prefix___note_v2;");

        let upgrade = Schema::apply_version(&registry, &NOTE).unwrap();
        assert_eq!(upgrade.outcome, SchemaOutcome::Installed);
        assert_eq!(upgrade.final_version, 3);
        assert!(engine.statements().is_empty());

        let mut entry = Schema::load_latest_name_entry(&registry, "Note").unwrap();
        assert_eq!(entry.version().unwrap(), 3);
        assert_eq!(entry.name().unwrap(), "Note");
        assert_eq!(entry.get_data_attribute("id").unwrap().as_str().map(str::len), Some(32));
    }

    #[test]
    fn upgrade_runs_pending_steps_in_order() {
        let dir = TempDir::new().unwrap();
        let (registry, engine) = registry(&dir);
        record_version(&registry, "Note", 1).unwrap();
        write_script(&dir, "Note", "schema_1.sql", "SELECT 'old';");
        write_script(&dir, "Note", "schema_3.sql", "SELECT 3;");
        write_script(&dir, "Note", "Schema_2.SQL", "-- two\nSELECT 2a;\nSELECT 2b;");

        let upgrade = Schema::apply_version(&registry, &NOTE).unwrap();
        assert_eq!(upgrade.outcome, SchemaOutcome::Upgraded);
        assert_eq!(upgrade.applied, vec![2, 3]);
        assert_eq!(engine.statements(), vec!["SELECT 2a", "SELECT 2b", "SELECT 3"]);
        assert_eq!(Schema::current_version(&registry, "Note").unwrap(), 3);

        let again = Schema::apply_version(&registry, &NOTE).unwrap();
        assert_eq!(again.outcome, SchemaOutcome::UpToDate);
    }

    #[test]
    fn failing_statement_rolls_back_all_steps() {
        let dir = TempDir::new().unwrap();
        let (registry, engine) = registry(&dir);
        record_version(&registry, "Note", 1).unwrap();
        write_script(&dir, "Note", "schema_2.sql", "SELECT 2;");
        write_script(&dir, "Note", "schema_3.sql", "BROKEN 3;");
        engine.reject_statements_containing("BROKEN");

        assert!(Schema::apply_version(&registry, &NOTE).is_err());
        assert_eq!(Schema::current_version(&registry, "Note").unwrap(), 1);
        assert!(engine.statements().is_empty());

        let connection = registry.connection().unwrap();
        assert_eq!(connection.transaction_depth(), 0);
        assert_eq!(connection.context_depth(), 0);
    }

    #[test]
    fn missing_latest_entry() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = registry(&dir);
        let err = Schema::load_latest_name_entry(&registry, "Unknown").unwrap_err();
        assert!(err.is_nothing_matched());
        assert_eq!(Schema::current_version(&registry, "Unknown").unwrap(), 0);
    }

    #[test]
    fn factory_builds_schema_instances() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = registry(&dir);
        let row = SCHEMA_VERSION.new_row(registry.table_prefix());
        let instance = registry
            .instances()
            .construct(&registry, "Schema", Some(row))
            .unwrap();
        assert_eq!(instance.class_name(), "Schema");
        assert!(instance.downcast_ref::<Schema>().is_some());
    }
}

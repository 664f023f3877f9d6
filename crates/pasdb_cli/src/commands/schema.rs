//! Schema commands.

use pasdb_core::{
    DbError, DbResult, EntityDescriptor, Registry, Schema, SchemaOutcome, SchemaUpgrade, Settings,
};
use std::path::Path;
use tracing::info;

/// Applies pending schema upgrades.
pub fn apply(data: &Path, classes: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let registry = open_registry(data)?;
    let descriptors = versioned_entities(&registry, classes)?;

    let connection = registry.connection()?;
    let upgrades = connection.scope(|_| {
        descriptors
            .iter()
            .map(|descriptor| Schema::apply_version(&registry, descriptor))
            .collect::<DbResult<Vec<_>>>()
    })?;

    println!("Schema Upgrades");
    println!("===============");
    for upgrade in &upgrades {
        println!("  {}", describe(upgrade));
    }
    Ok(())
}

/// Shows the recorded version of every versioned entity.
pub fn status(data: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let registry = open_registry(data)?;
    let mut rows = Vec::new();
    for descriptor in versioned_entities(&registry, &[])? {
        let current = Schema::current_version(&registry, descriptor.class_name)?;
        let target = descriptor.schema_version.unwrap_or_default();
        rows.push((descriptor.class_name, current, target));
    }

    if format == "json" {
        let entries: Vec<_> = rows
            .iter()
            .map(|(name, current, target)| {
                serde_json::json!({
                    "name": name,
                    "version": current,
                    "target_version": target,
                    "up_to_date": current >= target,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("Schema Status");
    println!("=============");
    println!("  Backend: {}", registry.backend_name());
    for (name, current, target) in rows {
        let marker = if current >= target { "✓" } else { "○" };
        println!("  {marker} {name}: v{current} (code expects v{target})");
    }
    Ok(())
}

fn open_registry(data: &Path) -> DbResult<Registry> {
    info!("Loading database settings from {:?}", data);
    Registry::open(Settings::load(data)?)
}

fn versioned_entities(registry: &Registry, classes: &[String]) -> DbResult<Vec<EntityDescriptor>> {
    if classes.is_empty() {
        return Ok(registry
            .entities()
            .into_iter()
            .filter(|descriptor| descriptor.schema_version.is_some())
            .collect());
    }
    classes
        .iter()
        .map(|class| {
            registry.entity(class).ok_or_else(|| {
                DbError::nothing_matched(format!("Database class '{class}' is not supported"))
            })
        })
        .collect()
}

fn describe(upgrade: &SchemaUpgrade) -> String {
    let name = &upgrade.class_name;
    match &upgrade.outcome {
        SchemaOutcome::Installed => format!("{name}: installed at v{}", upgrade.final_version),
        SchemaOutcome::Upgraded => format!(
            "{name}: upgraded v{} -> v{} (applied {:?})",
            upgrade.previous_version, upgrade.final_version, upgrade.applied
        ),
        SchemaOutcome::Halted { version, missing } => format!(
            "{name}: stopped before v{version} at v{}, missing dependencies: {}",
            upgrade.final_version,
            missing.join(", ")
        ),
        SchemaOutcome::UpToDate => format!("{name}: up to date at v{}", upgrade.final_version),
    }
}

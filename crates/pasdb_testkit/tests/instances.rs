//! Instance contexts, persistence and polymorphic construction.

use pasdb_core::session::{Row, Value};
use pasdb_core::{
    ConditionDefinition, Concatenation, DbError, DbResult, EntityDescriptor, Instance,
    InstanceBase, InstanceContext, InstanceIterator, KeyStore, Registry, SortDefinition,
    TransactionContext,
};
use pasdb_testkit::prelude::*;
use serde_json::json;
use std::any::Any;

const NOTE: EntityDescriptor = EntityDescriptor {
    class_name: "Note",
    table: "note",
    primary_key: "id",
    columns: &["id", "title", "rank"],
    schema_version: None,
    instance_class: Some("Note"),
};

#[derive(Debug)]
struct Note {
    base: InstanceBase,
}

impl Note {
    fn new(registry: &Registry) -> DbResult<Self> {
        Ok(Self {
            base: InstanceBase::new(registry, &NOTE, None)?,
        })
    }

    fn construct(registry: &Registry, row: Option<Row>) -> DbResult<Box<dyn Instance>> {
        Ok(Box::new(Self {
            base: InstanceBase::new(registry, &NOTE, row)?,
        }))
    }
}

impl Instance for Note {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut InstanceBase {
        &mut self.base
    }

    fn descriptor(&self) -> EntityDescriptor {
        NOTE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn initialize_row(&self, row: &Row) {
        row.set("rank", 0_i64);
    }

    fn default_sort_definition(&self, _context: Option<&str>) -> SortDefinition {
        SortDefinition::from_tuples([("rank", 2)]).unwrap_or_default()
    }
}

/// Plain base class resolving to the registered subclass of each row.
struct Document;

impl Document {
    fn construct(_registry: &Registry, _row: Option<Row>) -> DbResult<Box<dyn Instance>> {
        Err(DbError::not_implemented("Document is abstract"))
    }
}

fn notes() -> TestRegistry {
    let test = TestRegistry::memory();
    test.register_entity(NOTE);
    test.instances().register("Note", Note::construct);
    test.instances().register("Document", Document::construct);
    test
}

fn note_table(test: &TestRegistry) -> String {
    NOTE.table_name(test.table_prefix())
}

fn saved_note(test: &TestRegistry, title: &str, rank: i64) {
    let mut note = Note::new(test).unwrap();
    note.set_data_attributes(&[("title", title.into()), ("rank", rank.into())])
        .unwrap();
    note.save().unwrap();
}

#[test]
fn reentered_context_commits_on_last_exit() {
    let test = notes();
    let mut note = Note::new(&test).unwrap();

    let mut outer = InstanceContext::enter(&mut note).unwrap();
    let mut inner = InstanceContext::enter(&mut *outer).unwrap();
    inner.set_data_attributes(&[("title", "draft".into())]).unwrap();
    inner.save().unwrap();
    assert!(inner.base().is_transaction_wrapped());
    inner.finish();

    assert_eq!(outer.base().context_depth(), 1);
    assert_eq!(test.connection().context_depth(), 1);
    assert_eq!(test.connection().transaction_depth(), 1);
    assert_eq!(test.engine.row_count(&note_table(&test)), 0);

    outer.finish();
    assert_eq!(note.base().context_depth(), 0);
    assert!(note.base().connection().is_none());
    assert_eq!(test.connection().transaction_depth(), 0);
    assert_eq!(test.engine.row_count(&note_table(&test)), 1);
    assert_eq!(test.engine.stats().transactions_committed, 1);
}

#[test]
fn reentered_context_keeps_lock_until_last_exit() {
    let test = TestRegistry::serialized();
    test.register_entity(NOTE);
    let mut note = Note::new(&test).unwrap();

    let mut outer = InstanceContext::enter(&mut note).unwrap();
    let inner = InstanceContext::enter(&mut *outer).unwrap();
    inner.finish();
    assert_eq!(test.lock_stats().released, 0);
    outer.finish();

    let stats = test.lock_stats();
    assert_eq!(stats.acquired, 1);
    assert_eq!(stats.released, 1);
}

#[test]
fn dropped_context_rolls_back_wrapped_transaction() {
    let test = notes();
    let mut note = Note::new(&test).unwrap();
    {
        let mut context = InstanceContext::enter(&mut note).unwrap();
        context.set_data_attributes(&[("title", "abandoned".into())]).unwrap();
        context.save().unwrap();
    }
    assert_eq!(test.engine.row_count(&note_table(&test)), 0);
    assert_eq!(test.engine.stats().transactions_rolled_back, 1);
    assert!(!note.is_known());
}

#[test]
fn saving_twice_inserts_once() {
    let test = notes();
    let mut note = Note::new(&test).unwrap();
    note.set_data_attributes(&[("title", "twice".into())]).unwrap();

    TransactionContext::run(&test, |_| -> DbResult<()> {
        note.save()?;
        note.save()
    })
    .unwrap();
    assert_eq!(test.engine.row_count(&note_table(&test)), 1);

    note.save().unwrap();
    note.save().unwrap();
    assert_eq!(test.engine.row_count(&note_table(&test)), 1);
    assert!(note.is_known());
}

#[test]
fn updates_are_flushed_on_save() {
    let test = notes();
    let mut note = Note::new(&test).unwrap();
    note.set_data_attributes(&[("title", "before".into())]).unwrap();
    note.save().unwrap();

    note.set_data_attributes(&[("title", "after".into())]).unwrap();
    note.save().unwrap();

    let rows = test.engine.rows(&note_table(&test));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("title"), Some(&Value::from("after")));
}

#[test]
fn delete_and_reload() {
    let test = notes();
    let mut note = Note::new(&test).unwrap();
    assert!(matches!(note.reload(), Err(DbError::Io { .. })));

    note.set_data_attributes(&[("title", "gone soon".into())]).unwrap();
    note.save().unwrap();
    note.reload().unwrap();
    assert_eq!(note.get_data_attribute("title").unwrap(), Value::from("gone soon"));

    assert!(note.delete().unwrap());
    assert_eq!(test.engine.row_count(&note_table(&test)), 0);
    assert!(!note.is_known());
}

#[test]
fn base_class_resolves_registered_subclass() {
    let test = notes();
    saved_note(&test, "polymorphic", 1);

    let query = NOTE.query(test.table_prefix());
    let mut instances = InstanceIterator::query(&test, "Document", &query).unwrap();
    assert_eq!(instances.len(), 1);

    let mut instance = instances.next().unwrap().unwrap();
    assert_eq!(instance.class_name(), "Note");
    assert_eq!(
        instance.get_data_attribute("title").unwrap(),
        Value::from("polymorphic")
    );
    assert!(instance.downcast_ref::<Note>().is_some());
    assert!(instance.downcast_mut::<KeyStore>().is_none());

    let err = test
        .instances()
        .construct(&test, "Missing", None)
        .err()
        .expect("unknown classes are rejected");
    assert_eq!(err.to_string(), "Database class 'Missing' is not supported");
}

#[test]
fn conditions_and_sort_definitions_shape_queries() {
    let test = notes();
    for (title, rank) in [("alpha", 3), ("beta", 1), ("gamma", 2), ("Alpine", 5)] {
        saved_note(&test, title, rank);
    }

    let mut conditions = ConditionDefinition::new(Concatenation::And);
    conditions
        .add_case_insensitive_match_condition("title", "al%")
        .add_less_than_match_condition("rank", 5_i64);
    let mut either = ConditionDefinition::default();
    either
        .add_exact_match_condition("title", "gamma")
        .add_sub_condition(conditions);

    let mut probe = Note::new(&test).unwrap();
    let query = either.apply(&NOTE, NOTE.query(test.table_prefix())).unwrap();
    let query = probe.apply_db_sort_definition(query, None).unwrap();
    let titles: Vec<String> = InstanceIterator::query(&test, "Note", &query)
        .unwrap()
        .map(|instance| {
            let mut instance = instance.unwrap();
            let title = instance.get_data_attribute("title").unwrap();
            title.as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(titles, vec!["alpha", "gamma"]);

    probe.set_sort_definition(SortDefinition::from_tuples([("title", 1)]).unwrap(), Some("list"));
    let query = probe
        .apply_db_sort_definition(NOTE.query(test.table_prefix()), Some("list"))
        .unwrap();
    assert_eq!(InstanceIterator::query(&test, "Note", &query).unwrap().len(), 4);

    let mut unknown = ConditionDefinition::default();
    unknown.add_exact_match_condition("colour", "red");
    assert!(matches!(
        unknown.apply(&NOTE, NOTE.query(test.table_prefix())),
        Err(DbError::Value { .. })
    ));
}

#[test]
fn key_store_entries_round_trip() {
    let test = TestRegistry::memory();
    let err = KeyStore::load_key(&test, "missing").unwrap_err();
    assert!(err.is_nothing_matched());

    let mut entry = KeyStore::new(&test).unwrap();
    entry.set_key("session").unwrap();
    let data = json!({"user": "ada"});
    entry
        .set_value_dict(data.as_object().unwrap())
        .unwrap();
    entry.save().unwrap();

    let mut loaded = KeyStore::load_key(&test, "session").unwrap();
    assert_eq!(loaded.id(), entry.id());
    assert_eq!(loaded.value_dict().unwrap(), *data.as_object().unwrap());
    assert!(loaded.is_valid().unwrap());
}

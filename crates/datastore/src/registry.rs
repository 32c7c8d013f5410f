//! Schemas and the registry holding them.
//!
//! A [Schema] is a named namespace of tables and joins.  Tables are reachable under their SQL name, their display
//! alias, and any schema-level aliases; joins share the same namespace.  Schemas only ever grow: adding a table or
//! join at run time never disturbs the `Arc`s already handed out, so existing accessors and entities keep working.
//!
//! The process-wide registry from [global] is populated once at startup and read thereafter.  Tests, and programs
//! that want isolation, can make their own [Registry].
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use itertools::Itertools;
use log::*;

use crate::accessor::Accessor;
use crate::descriptor::{ColumnDescriptor, JoinDescriptor, SchemaDescriptor, TableDescriptor};
use crate::errors::{Error, Result};
use crate::join::{self, JoinPlan};

// The maps below are only ever inserted into, so a panic while a lock was held can't leave them half-updated, and
// poisoning can be ignored.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Namespace {
    tables: HashMap<String, Arc<TableDescriptor>>,
    joins: HashMap<String, Arc<JoinPlan>>,
}

impl Namespace {
    fn is_taken(&self, name: &str) -> bool {
        self.tables.contains_key(name) || self.joins.contains_key(name)
    }
}

pub struct Schema {
    name: String,
    limit_template: String,
    namespace: RwLock<Namespace>,
}

impl Schema {
    fn new(name: String, limit_template: String) -> Self {
        Schema {
            name,
            limit_template,
            namespace: Default::default(),
        }
    }

    /// Build a schema from a descriptor.  Tables first, then aliases, then joins, so joins can refer to anything.
    pub fn from_descriptor(descriptor: SchemaDescriptor) -> Result<Schema> {
        let (name, limit_template, tables, joins, aliases) = descriptor.into_parts();
        let schema = Schema::new(name, limit_template);
        for t in tables {
            schema.add_table(t)?;
        }
        for (alias, table) in aliases {
            schema.add_table_alias(&alias, &table)?;
        }
        for j in joins.iter() {
            schema.add_join(j)?;
        }
        Ok(schema)
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_limit_template(&self) -> &str {
        &self.limit_template
    }

    fn duplicate(&self, name: &str) -> Error {
        Error::DuplicateTable {
            schema: self.name.clone(),
            name: name.to_string(),
        }
    }

    /// Add a table, reachable under its SQL name and its alias.
    pub fn add_table(&self, table: TableDescriptor) -> Result<Arc<TableDescriptor>> {
        let table = Arc::new(table);
        let mut names = vec![table.get_name().to_string()];
        if let Some(a) = table.get_alias() {
            if a != table.get_name() {
                names.push(a.to_string());
            }
        }

        let mut ns = write(&self.namespace);
        if let Some(n) = names.iter().find(|n| ns.is_taken(n)) {
            return Err(self.duplicate(n));
        }
        for n in names {
            ns.tables.insert(n, table.clone());
        }
        debug!("Schema {}: added table {}", self.name, table.display_name());
        Ok(table)
    }

    /// Make `alias` another name for the table currently reachable as `table`.
    pub fn add_table_alias(&self, alias: &str, table: &str) -> Result<()> {
        let mut ns = write(&self.namespace);
        if ns.is_taken(alias) {
            return Err(self.duplicate(alias));
        }
        let t = ns.tables.get(table).cloned().ok_or_else(|| Error::UnknownTable {
            schema: self.name.clone(),
            table: table.to_string(),
        })?;
        ns.tables.insert(alias.to_string(), t);
        Ok(())
    }

    /// Resolve and add a join.  Fails without adding anything if the join doesn't resolve.
    pub fn add_join(&self, descriptor: &JoinDescriptor) -> Result<Arc<JoinPlan>> {
        let mut ns = write(&self.namespace);
        if ns.is_taken(descriptor.get_name()) {
            return Err(self.duplicate(descriptor.get_name()));
        }
        let plan = {
            let tables = &ns.tables;
            join::resolve(descriptor, |n| {
                tables.get(n).cloned().ok_or_else(|| Error::UnknownTable {
                    schema: self.name.clone(),
                    table: n.to_string(),
                })
            })?
        };
        let plan = Arc::new(plan);
        ns.joins
            .insert(descriptor.get_name().to_string(), plan.clone());
        Ok(plan)
    }

    pub fn lookup_table(&self, name: &str) -> Result<Arc<TableDescriptor>> {
        read(&self.namespace)
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTable {
                schema: self.name.clone(),
                table: name.to_string(),
            })
    }

    pub fn lookup_join(&self, name: &str) -> Result<Arc<JoinPlan>> {
        read(&self.namespace)
            .joins
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTable {
                schema: self.name.clone(),
                table: name.to_string(),
            })
    }

    /// Resolve a column of a table by name or alias.
    pub fn lookup_column(&self, table: &str, column: &str) -> Result<ColumnDescriptor> {
        Ok(self.lookup_table(table)?.column(column)?.clone())
    }

    /// All names tables and joins are reachable under, sorted.
    pub fn names(&self) -> Vec<String> {
        let ns = read(&self.namespace);
        ns.tables
            .keys()
            .chain(ns.joins.keys())
            .cloned()
            .sorted()
            .collect()
    }

    /// An accessor for the table named `name`.
    pub fn table(self: &Arc<Self>, name: &str) -> Result<Accessor> {
        Ok(Accessor::for_table(self.clone(), self.lookup_table(name)?))
    }

    /// An accessor for the join named `name`.
    pub fn join(self: &Arc<Self>, name: &str) -> Result<Accessor> {
        Ok(Accessor::for_join(self.clone(), self.lookup_join(name)?))
    }

    /// An accessor for whichever table or join is named `name`.
    pub fn accessor(self: &Arc<Self>, name: &str) -> Result<Accessor> {
        self.table(name).or_else(|_| self.join(name))
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("names", &self.names())
            .finish()
    }
}

#[derive(Default)]
pub struct Registry {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

lazy_static::lazy_static! {
    static ref GLOBAL: Registry = Registry::new();
}

/// The process-wide registry.
pub fn global() -> &'static Registry {
    &GLOBAL
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a schema.  Fails with [Error::DuplicateSchema] if the name is taken.
    pub fn define(&self, descriptor: SchemaDescriptor) -> Result<Arc<Schema>> {
        let name = descriptor.get_name().to_string();
        if read(&self.schemas).contains_key(&name) {
            return Err(Error::DuplicateSchema(name));
        }

        let schema = Arc::new(Schema::from_descriptor(descriptor)?);

        let mut schemas = write(&self.schemas);
        // Someone may have beaten us to it while we were building.
        if schemas.contains_key(&name) {
            return Err(Error::DuplicateSchema(name));
        }
        schemas.insert(name, schema.clone());
        info!(
            "Registered schema {} with {}",
            schema.get_name(),
            schema.names().join(", ")
        );
        Ok(schema)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<Schema>> {
        read(&self.schemas)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownSchema(name.to_string()))
    }

    pub fn lookup_table(&self, schema: &str, table: &str) -> Result<Arc<TableDescriptor>> {
        self.lookup(schema)?.lookup_table(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::descriptor::SchemaBuilder;

    fn descriptor(name: &str) -> SchemaDescriptor {
        let mut b = SchemaBuilder::new(name.into());
        b.add_table("tab1".into(), |tb| {
            tb.add_number_column("tab1_id".into())?;
            tb.set_primary_key(["tab1_id"]);
            Ok(())
        })
        .unwrap();
        b.add_table("tab2".into(), |tb| {
            tb.add_number_column("tab2_id".into())?;
            tb.add_number_column("tab1_ref".into())?;
            tb.set_alias("second");
            Ok(())
        })
        .unwrap();
        b.add_table_alias("first".into(), "tab1".into());
        b.add_join("both".into(), "second".into(), |jb| {
            jb.link("first", &[("tab1_ref", "tab1_id")]);
            Ok(())
        })
        .unwrap();
        b.build().unwrap()
    }

    #[test]
    fn define_and_lookup() {
        let reg = Registry::new();
        reg.define(descriptor("s")).unwrap();
        assert!(matches!(
            reg.define(descriptor("s")),
            Err(Error::DuplicateSchema(_))
        ));

        let t = reg.lookup_table("s", "second").unwrap();
        assert_eq!(t.get_name(), "tab2");
        assert!(Arc::ptr_eq(&t, &reg.lookup_table("s", "tab2").unwrap()));
        assert!(Arc::ptr_eq(
            &reg.lookup_table("s", "first").unwrap(),
            &reg.lookup_table("s", "tab1").unwrap()
        ));
        assert!(matches!(
            reg.lookup_table("s", "nope"),
            Err(Error::UnknownTable { .. })
        ));
        assert!(matches!(reg.lookup("t"), Err(Error::UnknownSchema(_))));

        let s = reg.lookup("s").unwrap();
        assert!(matches!(
            s.lookup_column("tab1", "nope"),
            Err(Error::UnknownColumn { .. })
        ));
        assert_eq!(s.lookup_join("both").unwrap().from_clause(), "tab2 AS second, tab1 AS first");
    }

    #[test]
    fn runtime_additions_keep_old_handles() {
        let reg = Registry::new();
        let s = reg.define(descriptor("s")).unwrap();
        let before = s.lookup_table("tab1").unwrap();

        let mut tb = crate::descriptor::TableBuilder::new("tab3".into());
        tb.add_number_column("tab3_id".into()).unwrap();
        s.add_table(tb.build().unwrap()).unwrap();

        assert!(Arc::ptr_eq(&before, &s.lookup_table("tab1").unwrap()));
        assert!(s.lookup_table("tab3").is_ok());
        assert!(matches!(
            s.add_table_alias("both", "tab3"),
            Err(Error::DuplicateTable { .. })
        ));
    }

    #[test]
    fn global_registry() {
        let s = global()
            .define(descriptor("registry_tests_global"))
            .unwrap();
        assert!(Arc::ptr_eq(
            &s,
            &global().lookup("registry_tests_global").unwrap()
        ));
    }
}

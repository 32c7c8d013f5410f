//! Accessors: the runtime API for one table or join of a schema.
//!
//! Get one from [crate::Schema::table], [crate::Schema::join], or [crate::Schema::accessor].  Accessors are cheap,
//! immutable handles; they hold the schema and the table or join plan by `Arc`, so they outlive later additions to
//! the schema.
//!
//! Every operation takes the caller's storage.  Operations that write commit through it once their statements have
//! succeeded.  Nothing spanning several statements is atomic: a join insert that fails halfway leaves the rows it
//! already wrote, and says so with [Error::PartialInsert].
use std::sync::Arc;

use log::*;

use crate::criteria::{Criteria, Group};
use crate::database::Storage;
use crate::descriptor::TableDescriptor;
use crate::entity::{Entity, Shape};
use crate::errors::{Error, Result};
use crate::join::{ColumnRef, JoinPlan};
use crate::record::Record;
use crate::registry::Schema;
use crate::statement::{self, InsertValue};
use crate::validate::validate_row;
use crate::value::Value;

#[derive(Clone, Debug)]
pub struct Accessor {
    schema: Arc<Schema>,
    shape: Shape,
}

/// A row ready to insert: values aligned with the table's columns, and which of them were supplied.
struct PreparedRow {
    values: Vec<Value>,
    supplied: Vec<bool>,
}

/// Resolve and validate a record against one table.
fn prepare_row<'a>(
    table: &TableDescriptor,
    record: impl Iterator<Item = (&'a str, &'a Value)>,
) -> Result<PreparedRow> {
    table.check_writable()?;

    let mut values = vec![Value::Null; table.column_count()];
    let mut supplied = vec![false; table.column_count()];
    for (name, v) in record {
        let idx = table.column_index(name)?;
        values[idx] = v.clone();
        supplied[idx] = true;
    }

    validate_row(table, &mut values, &supplied)?;
    Ok(PreparedRow { values, supplied })
}

/// Insert a prepared row, recovering a generated key if the table says how.  Returns the row's values with the key
/// filled in.
///
/// The key recovery query runs immediately after the insert, with nothing in between: recovery queries typically ask
/// the session for its last generated id.
fn insert_prepared(db: &mut dyn Storage, table: &TableDescriptor, row: PreparedRow) -> Result<Vec<Value>> {
    let PreparedRow {
        mut values,
        supplied,
    } = row;
    let pk = table.primary_key();
    let unset_key = pk
        .iter()
        .copied()
        .filter(|i| !supplied[*i] || values[*i].is_null())
        .collect::<Vec<_>>();

    let mut inserted = vec![];
    for i in 0..values.len() {
        if unset_key.contains(&i) {
            if let Some(expr) = table.for_null_primary() {
                inserted.push((i, InsertValue::Literal(expr.to_string())));
            }
        } else if supplied[i] {
            inserted.push((i, InsertValue::Bind(values[i].clone())));
        }
    }

    let stmt = statement::insert(table, &inserted)?;
    db.execute(&stmt.sql, &stmt.params)?;

    if unset_key.is_empty() {
        return Ok(values);
    }
    if let Some(query) = table.select_null_primary() {
        let rows = db.query(query, &[])?;
        let row = rows.into_iter().next().unwrap_or_default();
        for (n, i) in unset_key.iter().enumerate() {
            if let Some(v) = row.get(n).or_else(|| row.first()) {
                values[*i] = v.clone();
            }
        }
    }
    Ok(values)
}

/// Criteria matching exactly the given columns' values.  `None` if any is null, since `= NULL` matches nothing.
fn key_criteria(columns: impl Iterator<Item = (String, Value)>) -> Option<Criteria> {
    let mut group = Group::new();
    let mut any = false;
    for (name, v) in columns {
        if v.is_null() {
            return None;
        }
        group = group.eq(name, v);
        any = true;
    }
    any.then(|| Criteria::from(group))
}

impl Accessor {
    pub(crate) fn for_table(schema: Arc<Schema>, table: Arc<TableDescriptor>) -> Self {
        Accessor {
            schema,
            shape: Shape::Table(table),
        }
    }

    pub(crate) fn for_join(schema: Arc<Schema>, plan: Arc<JoinPlan>) -> Self {
        Accessor {
            schema,
            shape: Shape::Join(plan),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn get_name(&self) -> &str {
        self.shape.get_name()
    }

    /// Fetch every row matching `criteria`.
    pub fn search(&self, db: &mut dyn Storage, criteria: &Criteria) -> Result<Vec<Entity>> {
        let limit_template = self.schema.get_limit_template();
        let stmt = match &self.shape {
            Shape::Table(t) => statement::select_table(t, criteria, limit_template)?,
            Shape::Join(j) => statement::select_join(j, criteria, limit_template)?,
        };
        db.query(&stmt.sql, &stmt.params)?
            .into_iter()
            .map(|row| Entity::from_row(self.shape.clone(), row))
            .collect()
    }

    /// Count rows matching `criteria` (or groups, for tables with a GROUP BY).
    pub fn size(&self, db: &mut dyn Storage, criteria: &Criteria) -> Result<u64> {
        let stmt = match &self.shape {
            Shape::Table(t) => statement::count_table(t, criteria)?,
            Shape::Join(j) => statement::count_join(j, criteria)?,
        };
        let rows = db.query(&stmt.sql, &stmt.params)?;
        let count = rows
            .first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    /// Validate and insert one row, then read it back.
    ///
    /// The row is found again by primary key, or by a fully supplied unique key if the database didn't report the
    /// primary key.  If neither finds it, the entity is built from the inserted values instead.
    pub fn create(&self, db: &mut dyn Storage, values: &Record) -> Result<Entity> {
        let entity = match &self.shape {
            Shape::Table(t) => {
                let row = prepare_row(t, values.iter())?;
                let inserted = insert_prepared(db, t, row)?;
                db.commit()?;
                self.reload(db, vec![inserted])?
            }
            Shape::Join(j) => {
                let members = self.insert_join(db, j, values)?;
                db.commit()?;
                self.reload(db, members)?
            }
        };
        Ok(entity)
    }

    /// Insert rows one by one without reading them back, reporting per row whether it went in.
    ///
    /// A row fails on validation or on a storage error; either way the remaining rows are still attempted.
    pub fn create_only(&self, db: &mut dyn Storage, rows: &[Record]) -> Result<Vec<bool>> {
        let mut ret = Vec::with_capacity(rows.len());
        for r in rows.iter() {
            let res = match &self.shape {
                Shape::Table(t) => prepare_row(t, r.iter()).and_then(|p| insert_prepared(db, t, p).map(|_| ())),
                Shape::Join(j) => self.insert_join(db, j, r).map(|_| ()),
            };
            if let Err(e) = &res {
                debug!("{}: row not created: {}", self.get_name(), e);
            }
            ret.push(res.is_ok());
        }
        if ret.iter().any(|x| *x) {
            db.commit()?;
        }
        Ok(ret)
    }

    /// Insert many rows in one statement, returning the driver's affected row count.
    ///
    /// Best-effort: values aren't validated, and there is no per-row result.  Only plain tables support this.
    pub fn bulk_create(&self, db: &mut dyn Storage, columns: &[&str], rows: &[Vec<Value>]) -> Result<usize> {
        let table = match &self.shape {
            Shape::Table(t) => t,
            Shape::Join(j) => {
                return Err(Error::JoinNotInsertable {
                    join: j.get_name().to_string(),
                    reason: "bulk inserts need a single table".into(),
                })
            }
        };
        table.check_writable()?;
        let columns = columns
            .iter()
            .map(|c| table.column_index(c))
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Ok(0);
        }

        let stmt = statement::bulk_insert(table, &columns, rows)?;
        let affected = db.execute(&stmt.sql, &stmt.params)?;
        db.commit()?;
        Ok(affected)
    }

    /// Delete rows matching `criteria`, returning how many went.
    ///
    /// For joins, the matching join rows are found first and then only their primary table rows are deleted.
    pub fn delete(&self, db: &mut dyn Storage, criteria: &Criteria) -> Result<usize> {
        let affected = match &self.shape {
            Shape::Table(t) => {
                let stmt = statement::delete_where(t, criteria)?;
                db.execute(&stmt.sql, &stmt.params)?
            }
            Shape::Join(j) => {
                let primary = j.primary().get_table();
                primary.check_writable()?;
                let mut pins: Vec<Vec<(usize, Value)>> = vec![];
                for e in self.search(db, criteria)? {
                    let pin = statement::row_pin(primary, e.member_values(0));
                    if !pins.contains(&pin) {
                        pins.push(pin);
                    }
                }
                let mut affected = 0;
                for pin in pins.iter() {
                    let stmt = statement::delete_pinned(primary, pin)?;
                    affected += db.execute(&stmt.sql, &stmt.params)?;
                }
                affected
            }
        };
        db.commit()?;
        Ok(affected)
    }

    /// Insert through a join: every member once, link targets first, each target's new key copied into the columns
    /// linking to it.  Returns each member's values.
    fn insert_join(&self, db: &mut dyn Storage, plan: &JoinPlan, record: &Record) -> Result<Vec<Vec<Value>>> {
        let order = plan.insert_order()?;
        let n = plan.members().len();

        let mut split: Vec<Vec<(&str, &Value)>> = vec![vec![]; n];
        for (name, v) in record.iter() {
            let r = plan.resolve(name)?;
            let column = plan.member(r.member).get_table().column_at(r.column).get_name();
            split[r.member].push((column, v));
        }

        // Validate everything before writing anything.
        let mut prepared = vec![];
        for (m, values) in split.into_iter().enumerate() {
            prepared.push(Some(prepare_row(
                plan.member(m).get_table(),
                values.into_iter(),
            )?));
        }

        let mut written: Vec<Option<Vec<Value>>> = vec![None; n];
        let mut inserted_names = vec![];
        for m in order {
            let table = plan.member(m).get_table();
            let mut row = match prepared[m].take() {
                Some(r) => r,
                None => continue,
            };

            for l in plan.links().iter().filter(|l| l.source == m) {
                let target = match &written[l.target] {
                    Some(t) => t,
                    None => continue,
                };
                for (s, t) in l.pairs.iter() {
                    row.values[*s] = target[*t].clone();
                    row.supplied[*s] = true;
                }
            }

            match insert_prepared(db, table, row) {
                Ok(values) => {
                    written[m] = Some(values);
                    inserted_names.push(plan.member(m).get_name().to_string());
                }
                Err(e) if inserted_names.is_empty() => return Err(e),
                Err(e) => {
                    return Err(Error::PartialInsert {
                        join: plan.get_name().to_string(),
                        inserted: inserted_names,
                        source: Box::new(e),
                    })
                }
            }
        }

        Ok(written.into_iter().map(Option::unwrap_or_default).collect())
    }

    /// Read a just-inserted row back by its primary key, or failing that by the first unique key whose values are all
    /// known.  Falls back to what was inserted.
    fn reload(&self, db: &mut dyn Storage, members: Vec<Vec<Value>>) -> Result<Entity> {
        let primary = self.shape.member_table(0);
        let column_name = |i: usize| match &self.shape {
            Shape::Table(t) => t.column_at(i).get_name().to_string(),
            Shape::Join(j) => j.qualified(ColumnRef {
                member: 0,
                column: i,
            }),
        };

        let keys = std::iter::once(primary.primary_key()).chain(primary.unique_keys().iter().map(|k| k.as_slice()));
        for key in keys {
            let criteria = match key_criteria(key.iter().map(|i| (column_name(*i), members[0][*i].clone()))) {
                Some(c) => c,
                None => continue,
            };
            let mut found = self.search(db, &criteria)?;
            if found.len() == 1 {
                return Ok(found.remove(0));
            }
            debug!(
                "{}: expected to read back one row, got {}",
                self.get_name(),
                found.len()
            );
        }

        Ok(Entity::from_members(self.shape.clone(), members))
    }
}

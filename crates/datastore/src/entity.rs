//! Entities: rows held in memory.
//!
//! An entity belongs to one table or one join.  It is fetched clean, becomes dirty as columns are set, and writes
//! every dirty column in one UPDATE per table on [Entity::commit].  [Entity::delete] only marks the row; the DELETE is
//! issued by the next commit, after which the entity is gone: a detached record no longer tied to any row.
//!
//! There is no rollback.  Dropping an entity with uncommitted changes loses them.
use std::sync::Arc;

use log::*;
use smallvec::SmallVec;

use crate::database::Storage;
use crate::descriptor::TableDescriptor;
use crate::errors::{Error, Result};
use crate::join::{ColumnRef, JoinPlan};
use crate::record::Record;
use crate::statement;
use crate::validate::validate;
use crate::value::Value;

/// What an entity or accessor is over.
#[derive(Clone, Debug)]
pub enum Shape {
    Table(Arc<TableDescriptor>),
    Join(Arc<JoinPlan>),
}

impl Shape {
    /// The table or join name.
    pub fn get_name(&self) -> &str {
        match self {
            Shape::Table(t) => t.display_name(),
            Shape::Join(j) => j.get_name(),
        }
    }

    pub fn member_count(&self) -> usize {
        match self {
            Shape::Table(_) => 1,
            Shape::Join(j) => j.members().len(),
        }
    }

    /// The table behind member `index`.  A plain table is its own only member.
    pub fn member_table(&self, index: usize) -> &Arc<TableDescriptor> {
        match self {
            Shape::Table(t) => t,
            Shape::Join(j) => j.member(index).get_table(),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<ColumnRef> {
        match self {
            Shape::Table(t) => Ok(ColumnRef {
                member: 0,
                column: t.column_index(name)?,
            }),
            Shape::Join(j) => j.resolve(name),
        }
    }

    /// The name a column is presented under: its alias for tables, `table_alias` for joins.
    pub fn column_name(&self, r: ColumnRef) -> String {
        match self {
            Shape::Table(t) => t.column_at(r.column).get_alias().to_string(),
            Shape::Join(j) => j.long_name(r),
        }
    }

    /// Fail with [Error::ReadOnlyView] unless member `index` can be written.
    pub fn check_writable(&self, index: usize) -> Result<()> {
        self.member_table(index).check_writable()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityState {
    /// Matches the database as of the last fetch or commit.
    Clean,
    /// Has set columns not yet written.
    Dirty,
    /// Will be deleted by the next commit.
    PendingDelete,
    /// Deleted; now just a record.
    Gone,
}

#[derive(Clone, Debug)]
pub struct Entity {
    shape: Shape,
    /// Per member, aligned with that member's columns.
    values: Vec<Vec<Value>>,
    /// The values as last written or read, used to pin the row in UPDATE and DELETE.
    persisted: Vec<Vec<Value>>,
    dirty: SmallVec<[ColumnRef; 8]>,
    pending_delete: bool,
    gone: bool,
}

impl Entity {
    /// An entity for values known to be in the database, one vector per member.
    pub(crate) fn from_members(shape: Shape, values: Vec<Vec<Value>>) -> Self {
        Entity {
            shape,
            persisted: values.clone(),
            values,
            dirty: SmallVec::new(),
            pending_delete: false,
            gone: false,
        }
    }

    /// An entity for a fetched row whose columns are in select order.
    pub(crate) fn from_row(shape: Shape, row: Vec<Value>) -> Result<Self> {
        let mut row = row.into_iter();
        let mut values = vec![];
        for m in 0..shape.member_count() {
            let width = shape.member_table(m).column_count();
            let member = row.by_ref().take(width).collect::<Vec<_>>();
            if member.len() != width {
                return Err(Error::ArityMismatch {
                    expected: width,
                    got: member.len(),
                });
            }
            values.push(member);
        }
        Ok(Entity::from_members(shape, values))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn state(&self) -> EntityState {
        if self.gone {
            EntityState::Gone
        } else if self.pending_delete {
            EntityState::PendingDelete
        } else if !self.dirty.is_empty() {
            EntityState::Dirty
        } else {
            EntityState::Clean
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Names of the columns which will be written by the next commit, in the order they were first set.
    pub fn dirty_columns(&self) -> Vec<String> {
        self.dirty
            .iter()
            .map(|r| self.shape.column_name(*r))
            .collect()
    }

    pub fn get(&self, column: &str) -> Result<&Value> {
        let r = self.shape.resolve(column)?;
        Ok(&self.values[r.member][r.column])
    }

    /// Set a column.
    ///
    /// The value is validated first; if it is rejected, nothing about the entity changes.  Gone entities accept
    /// values but, having no row, never write them.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<()> {
        let r = self.shape.resolve(column)?;
        self.shape.check_writable(r.member)?;

        let table = self.shape.member_table(r.member);
        let validated = validate(table, r.column, value.into(), &self.values[r.member])?;
        self.values[r.member][r.column] = validated;

        if !self.gone && !self.dirty.contains(&r) {
            self.dirty.push(r);
        }
        Ok(())
    }

    /// Mark the row for deletion by the next commit.  For joins, only the primary table's row is deleted.
    pub fn delete(&mut self) -> Result<()> {
        self.shape.check_writable(0)?;
        if !self.gone {
            self.pending_delete = true;
        }
        Ok(())
    }

    /// Write pending changes: a DELETE if [Entity::delete] was called, else one UPDATE per table with dirty columns.
    /// Clean and gone entities issue nothing.
    ///
    /// A statement matching no row fails with [Error::RowNotFound] and leaves its changes pending.
    pub fn commit(&mut self, db: &mut dyn Storage) -> Result<()> {
        if self.gone {
            return Ok(());
        }

        if self.pending_delete {
            let table = self.shape.member_table(0);
            let pin = statement::row_pin(table, &self.persisted[0]);
            let stmt = statement::delete_pinned(table, &pin)?;
            let affected = db.execute(&stmt.sql, &stmt.params)?;
            if affected == 0 {
                return Err(Error::RowNotFound(table.display_name().to_string()));
            }
            debug!("Deleted {} row(s) from {}", affected, table.display_name());
            db.commit()?;
            self.pending_delete = false;
            self.dirty.clear();
            self.gone = true;
            return Ok(());
        }

        if self.dirty.is_empty() {
            return Ok(());
        }

        for m in 0..self.shape.member_count() {
            let changes = self
                .dirty
                .iter()
                .filter(|r| r.member == m)
                .map(|r| (r.column, self.values[m][r.column].clone()))
                .collect::<Vec<_>>();
            if changes.is_empty() {
                continue;
            }

            let table = self.shape.member_table(m);
            let pin = statement::row_pin(table, &self.persisted[m]);
            let stmt = statement::update(table, &changes, &pin)?;
            let affected = db.execute(&stmt.sql, &stmt.params)?;
            if affected == 0 {
                // Earlier members stay written; this one and later ones stay dirty.
                return Err(Error::RowNotFound(table.display_name().to_string()));
            }
            if affected != 1 {
                debug!(
                    "Update of {} touched {} rows",
                    table.display_name(),
                    affected
                );
            }

            // This member is written even if a later one fails.
            self.persisted[m] = self.values[m].clone();
            self.dirty.retain(|r| r.member != m);
        }

        db.commit()
    }

    /// A detached copy of the current values, keyed by presented column name.
    pub fn to_record(&self) -> Record {
        let mut ret = Record::new();
        for m in 0..self.shape.member_count() {
            for (c, v) in self.values[m].iter().enumerate() {
                let r = ColumnRef {
                    member: m,
                    column: c,
                };
                ret.insert(self.shape.column_name(r), v.clone());
            }
        }
        ret
    }

    /// Values of member `index`, aligned with its table's columns.
    pub fn member_values(&self, index: usize) -> &[Value] {
        &self.values[index]
    }
}

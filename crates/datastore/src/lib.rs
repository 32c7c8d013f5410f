//! The datastore crate: a declarative layer over a relational database.
//!
//! Schemas are declared up front, either with the builders in [descriptor] or as JSON through [config], and
//! registered in a [Registry].  There are 3 primary entities:
//!
//! - The schema, a namespace of tables and joins.
//! - The accessor, which searches, counts, creates, and deletes rows of one table or join.
//! - The entity, one row in memory, which tracks what was set on it and writes it back on commit.
//!
//! Every value is validated before any SQL is built, so a bad value never reaches the database.  Statements are
//! rendered from tera templates with all values bound as parameters; the only SQL text that comes from the caller is
//! what the schema itself declares (join clauses, key generation expressions, the limit template) and raw criteria.
//!
//! The crate doesn't own a connection.  Operations take `&mut dyn Storage`; [SqliteStorage] is the bundled
//! implementation.
mod accessor;
pub mod config;
pub mod criteria;
mod database;
pub mod descriptor;
mod entity;
mod errors;
pub mod join;
mod record;
mod registry;
pub mod statement;
pub mod validate;
mod value;

pub use accessor::*;
pub use config::{RuleSet, SchemaConfig};
pub use criteria::{Criteria, Group, Operator, Param};
pub use database::*;
pub use descriptor::{ColumnType, Rule, RuleContext, SchemaBuilder, SchemaDescriptor, TableBuilder, TableDescriptor};
pub use entity::*;
pub use errors::*;
pub use record::*;
pub use registry::*;
pub use value::*;

//! The storage collaborator.
//!
//! The datastore never owns a database.  Every operation that needs one takes `&mut dyn Storage` from the caller, who
//! decides how the handle is shared.  At most one statement is in flight at a time, and nothing here pools, retries,
//! or times out.
//!
//! [Storage::commit] hands out commit authority over whatever transaction the handle is in.  Code that also uses the
//! handle directly can have its work committed by an entity's commit, and vice versa; keeping those apart is the
//! caller's job.
use std::path::Path;

use log::*;

use crate::errors::Result;
use crate::value::Value;

/// What the datastore needs from a database driver.
pub trait Storage {
    /// Run a statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize>;

    /// Run a query, returning every row as values in column order.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>>;

    /// Commit the current transaction, if there is one.
    fn commit(&mut self) -> Result<()>;
}

/// SQL that we run as part of opening a connection.
///
/// - Enables the busy timeout, so that another process holding the file briefly doesn't fail us outright.
/// - Enables foreign key enforcement, which sqlite leaves off by default.
const INITIAL_SQL: &str = r#"
PRAGMA busy_timeout = 1000;
PRAGMA foreign_keys = 1;
"#;

/// The bundled driver: a rusqlite connection.
///
/// Starts in autocommit mode.  Call [SqliteStorage::begin] to open a transaction which [Storage::commit] then
/// commits.
pub struct SqliteStorage {
    conn: rusqlite::Connection,
}

impl SqliteStorage {
    /// Connect to the database at `path`, creating it if need be.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening database at {}", path.display());
        SqliteStorage::with_connection(rusqlite::Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        SqliteStorage::with_connection(rusqlite::Connection::open_in_memory()?)
    }

    /// Build a storage from an already-existing connection.
    pub fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(INITIAL_SQL)?;
        Ok(SqliteStorage { conn })
    }

    pub fn connection(&self) -> &rusqlite::Connection {
        &self.conn
    }

    /// Run a batch of statements with no parameters, e.g. DDL.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    /// Roll back the open transaction, if any.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}

impl Storage for SqliteStorage {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        let mut statement = self.conn.prepare_cached(sql)?;
        Ok(statement.execute(rusqlite::params_from_iter(params.iter()))?)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        let mut statement = self.conn.prepare_cached(sql)?;
        let width = statement.column_count();
        let mut rows = statement.query(rusqlite::params_from_iter(params.iter()))?;

        let mut ret = vec![];
        while let Some(r) = rows.next()? {
            let mut row = Vec::with_capacity(width);
            for i in 0..width {
                row.push(r.get::<_, Value>(i)?);
            }
            ret.push(row);
        }
        Ok(ret)
    }

    fn commit(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }
}

/// One statement seen by [Traced].
#[derive(Clone, Debug, PartialEq)]
pub struct TracedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// A storage wrapper which logs and remembers everything passed through it.
pub struct Traced<S> {
    inner: S,
    statements: Vec<TracedStatement>,
    commits: usize,
}

impl<S: Storage> Traced<S> {
    pub fn new(inner: S) -> Self {
        Traced {
            inner,
            statements: vec![],
            commits: 0,
        }
    }

    pub fn statements(&self) -> &[TracedStatement] {
        &self.statements
    }

    /// Statements whose text starts with `verb`, ignoring case, e.g. `count("UPDATE")`.
    pub fn count(&self, verb: &str) -> usize {
        self.statements
            .iter()
            .filter(|s| {
                s.sql
                    .get(..verb.len())
                    .map(|p| p.eq_ignore_ascii_case(verb))
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn clear(&mut self) {
        self.statements.clear();
        self.commits = 0;
    }

    pub fn inner(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn record(&mut self, sql: &str, params: &[Value]) {
        debug!("{} {:?}", sql, params);
        self.statements.push(TracedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }
}

impl<S: Storage> Storage for Traced<S> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        self.record(sql, params);
        self.inner.execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        self.record(sql, params);
        self.inner.query(sql, params)
    }

    fn commit(&mut self) -> Result<()> {
        self.commits += 1;
        self.inner.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens() {
        let tdir = tempfile::TempDir::new().unwrap();
        SqliteStorage::open(tdir.path().join("database.sqlite")).expect("Database should open");
    }

    #[test]
    fn round_trips_values() {
        let mut db = SqliteStorage::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (i INTEGER, r REAL, s TEXT, b BLOB, n TEXT)")
            .unwrap();
        let row = vec![
            Value::Integer(1),
            Value::Real(1.5),
            Value::from("s"),
            Value::Blob(vec![1, 2]),
            Value::Null,
        ];
        assert_eq!(
            db.execute("INSERT INTO t VALUES (?, ?, ?, ?, ?)", &row)
                .unwrap(),
            1
        );
        assert_eq!(db.query("SELECT * FROM t", &[]).unwrap(), vec![row]);
    }

    #[test]
    fn transactions() {
        let mut db = SqliteStorage::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (i INTEGER)").unwrap();
        // Autocommit: commit is a no-op.
        db.commit().unwrap();

        db.begin().unwrap();
        assert!(db.in_transaction());
        db.execute("INSERT INTO t VALUES (?)", &[Value::Integer(1)])
            .unwrap();
        db.rollback().unwrap();
        assert!(db.query("SELECT * FROM t", &[]).unwrap().is_empty());

        db.begin().unwrap();
        db.execute("INSERT INTO t VALUES (?)", &[Value::Integer(2)])
            .unwrap();
        db.commit().unwrap();
        assert!(!db.in_transaction());
        assert_eq!(db.query("SELECT i FROM t", &[]).unwrap().len(), 1);
    }

    #[test]
    fn storage_errors_are_wrapped() {
        let mut db = SqliteStorage::open_in_memory().unwrap();
        assert!(matches!(
            db.query("SELECT * FROM missing", &[]),
            Err(crate::errors::Error::Storage(_))
        ));
    }

    #[test]
    fn traced_counts() {
        let mut db = Traced::new(SqliteStorage::open_in_memory().unwrap());
        db.execute("CREATE TABLE t (i INTEGER)", &[]).unwrap();
        db.execute("update t set i = 1", &[]).unwrap();
        db.commit().unwrap();
        assert_eq!(db.count("UPDATE"), 1);
        assert_eq!(db.count("CREATE"), 1);
        assert_eq!(db.commits(), 1);
    }
}

/// Boxed cause reported by a storage driver.
pub type StorageCause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("No schema named {0} is registered")]
    UnknownSchema(String),

    #[error("A schema named {0} is already registered")]
    DuplicateSchema(String),

    #[error("Schema {schema} has no table or join named {table}")]
    UnknownTable { schema: String, table: String },

    #[error("Schema {schema} already has a table or join named {name}")]
    DuplicateTable { schema: String, name: String },

    #[error("{table} has no column named {column}")]
    UnknownColumn { table: String, column: String },

    #[error("{column} is ambiguous in join {join}; use the table_column form")]
    AmbiguousColumn { join: String, column: String },

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid criteria: {0}")]
    InvalidCriteria(String),

    #[error("{table}.{column}: value rejected by the column's validation rule")]
    ConstraintViolation { table: String, column: String },

    #[error("{table}.{column}: {value:?} does not match pattern {pattern}")]
    PatternMismatch {
        table: String,
        column: String,
        pattern: String,
        value: String,
    },

    #[error("{table}.{column}: expected {expected}, got {value:?}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: &'static str,
        value: String,
    },

    #[error("Join {join} cannot reach tables: {}", .unreachable.join(", "))]
    DisconnectedJoin {
        join: String,
        unreachable: Vec<String>,
    },

    #[error("Join {join}: on_secondary names {reference}, which is not linked before this point")]
    UnresolvedSecondaryReference { join: String, reference: String },

    #[error("Join {join} is not insertable: {reason}")]
    JoinNotInsertable { join: String, reason: String },

    #[error("{0} is a read-only view")]
    ReadOnlyView(String),

    #[error("{0}: no row matches the entity's key; it was deleted or its key never became known")]
    RowNotFound(String),

    #[error("Expected {expected} values per row, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Join {join}: insert failed after writing {}: {source}", .inserted.join(", "))]
    PartialInsert {
        join: String,
        inserted: Vec<String>,
        #[source]
        source: Box<Error>,
    },

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[source] StorageCause),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(Box::new(e))
    }
}

impl Error {
    /// True for errors raised by validation, before any statement was issued.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::ConstraintViolation { .. }
                | Error::PatternMismatch { .. }
                | Error::TypeMismatch { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

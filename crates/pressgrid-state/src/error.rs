//! Failures of the pressgrid state store.
//!
//! redb failures keep their typed source. Record codec failures name the
//! table and key that could not be written or read back.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("open state database: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("begin transaction: {0}")]
    Begin(#[from] redb::TransactionError),

    #[error("commit transaction: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("open table {table}: {source}")]
    Table {
        table: String,
        #[source]
        source: redb::TableError,
    },

    #[error("storage: {0}")]
    Storage(#[from] redb::StorageError),

    /// A record failed to serialize before being written.
    #[error("encode {table}/{key}: {source}")]
    Encode {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stored value is not a valid record of its table's type.
    #[error("decode {table}/{key}: {source}")]
    Decode {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

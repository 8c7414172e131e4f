// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stable coded errors surfaced to the document server.
//!
//! Client mistakes carry a `41xx` code, adapter-internal consistency failures
//! a `51xx` code. Driver errors pass through transparently and carry no code.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The op does not advance the snapshot it was submitted with.
    #[error("invalid op version {version} for document {id}")]
    InvalidOpVersion { id: String, version: u64 },

    /// Collection names may not shadow the op-log or system namespaces.
    #[error("invalid collection name: {0}")]
    InvalidCollectionName(String),

    #[error("$where queries are disabled")]
    WhereDisabled,

    #[error("$mapReduce queries are disabled")]
    MapReduceDisabled,

    #[error("$aggregate queries are disabled")]
    AggregateDisabled,

    #[error("unsupported $query property in query")]
    LegacyQueryProperty,

    /// A recognized operator carried a value it cannot work with.
    #[error("malformed query operator {0}")]
    MalformedQueryOperator(String),

    #[error("only one collection operation allowed, got {0} and {1}")]
    MultipleCollectionOperations(String, String),

    #[error("only one cursor operation allowed, got {0} and {1}")]
    MultipleCursorOperations(String, String),

    #[error("cursor methods cannot be combined with collection operation {0}")]
    CursorWithCollectionOperation(String),

    /// The adapter was closed; no further operations are served.
    #[error("adapter is closed")]
    Closed,

    /// A live snapshot row exists but carries no op link, so its history
    /// cannot be reconstructed.
    #[error("snapshot for document {0} is missing its op link")]
    MissingLastOperation(String),

    /// The linked op chain does not reach back to the requested version.
    #[error("missing ops from version {from} for document {id}")]
    MissingOps { id: String, from: u64 },

    /// A stored op row could not be decoded.
    #[error("corrupt op record for document {0}")]
    CorruptOpRecord(String),

    /// The connection target must name a database, e.g.
    /// `mongodb://localhost:27017/rivulet`.
    #[error("connection target does not name a database")]
    MissingDatabase,

    #[error(transparent)]
    Database(#[from] mongodb::error::Error),
}

impl StoreError {
    /// The stable numeric code consumed by callers. Passthrough driver errors
    /// and configuration mistakes have none.
    pub fn code(&self) -> Option<u16> {
        let code = match self {
            StoreError::InvalidOpVersion { .. } => 4101,
            StoreError::InvalidCollectionName(_) => 4102,
            StoreError::WhereDisabled => 4103,
            StoreError::MapReduceDisabled => 4104,
            StoreError::AggregateDisabled => 4105,
            StoreError::LegacyQueryProperty => 4106,
            StoreError::MalformedQueryOperator(_) => 4107,
            StoreError::MultipleCollectionOperations(..) => 4108,
            StoreError::MultipleCursorOperations(..) => 4109,
            StoreError::CursorWithCollectionOperation(_) => 4110,
            StoreError::Closed => 5101,
            StoreError::MissingLastOperation(_) => 5102,
            StoreError::MissingOps { .. } => 5103,
            StoreError::CorruptOpRecord(_) => 5104,
            StoreError::MissingDatabase | StoreError::Database(_) => return None,
        };
        Some(code)
    }

    /// Client errors describe a bad request; everything else is internal or
    /// a passthrough from the store.
    pub fn is_client_error(&self) -> bool {
        matches!(self.code(), Some(code) if (4100..4200).contains(&code))
    }
}

#[cfg(test)]
mod tests {
    use super::StoreError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(StoreError::WhereDisabled.code(), Some(4103));
        assert_eq!(
            StoreError::MissingOps {
                id: "doc1".to_string(),
                from: 0
            }
            .code(),
            Some(5103)
        );
        assert_eq!(StoreError::Closed.code(), Some(5101));
        assert_eq!(StoreError::MissingDatabase.code(), None);
    }

    #[test]
    fn client_errors_are_the_41xx_range() {
        assert!(StoreError::LegacyQueryProperty.is_client_error());
        assert!(!StoreError::Closed.is_client_error());
        assert!(!StoreError::MissingDatabase.is_client_error());
    }
}

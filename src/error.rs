use thiserror::Error;

/// Errors surfaced by the population engine.
///
/// The enum is `Clone` because one in-flight schema fetch is shared by every
/// caller waiting on it, and each of them receives its own copy of the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    /// A dataset, row or column does not exist upstream.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The transport rejected or failed the request.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Programmer error, e.g. an empty dataset id or a zero bucket size.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl GridError {
    pub fn dataset_not_found(id: impl Into<String>) -> Self {
        GridError::NotFound {
            kind: "dataset",
            id: id.into(),
        }
    }

    pub fn row_not_found(id: impl Into<String>) -> Self {
        GridError::NotFound {
            kind: "row",
            id: id.into(),
        }
    }

    pub fn column_not_found(id: impl Into<String>) -> Self {
        GridError::NotFound {
            kind: "column",
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GridError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, GridError>;

/// Rejects the empty dataset id up front instead of letting it reach the transport.
pub fn ensure_dataset_id(dataset_id: &str) -> Result<()> {
    if dataset_id.trim().is_empty() {
        return Err(GridError::InvariantViolation(
            "dataset id must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_kind_and_id() {
        let err = GridError::dataset_not_found("object-9");
        assert_eq!(err.to_string(), "dataset not found: object-9");
        assert!(err.is_not_found());
    }

    #[test]
    fn empty_dataset_id_is_rejected() {
        assert!(matches!(
            ensure_dataset_id("  "),
            Err(GridError::InvariantViolation(_))
        ));
        assert!(ensure_dataset_id("object-1").is_ok());
    }
}

use thiserror::Error;

/// Errors from repository operations (used by trait definitions in cadence-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// A write lost an optimistic-version race or violated a uniqueness rule.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised while loading or validating a flow definition.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("failed to parse flow definition: {0}")]
    Parse(String),

    #[error("flow validation failed: {0}")]
    Validation(String),

    #[error("duplicate step id: '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' references unknown target '{target}'")]
    UnknownTarget { step: String, target: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_flow_error_display() {
        let err = FlowError::UnknownTarget {
            step: "ask".to_string(),
            target: "nowhere".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "step 'ask' references unknown target 'nowhere'"
        );
    }
}

//! Error types for table diffing.
//!
//! Configuration and schema errors are reported before any bisection work
//! starts. Datasource errors abort a running diff through the yielder and
//! surface on the result stream. Precision reductions and unknown type
//! compatibility are warnings, not errors.

/// Primary error type of the crate.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DiffError {
    /// The differ was constructed with invalid bisection parameters.
    #[error("invalid differ configuration: {0}")]
    InvalidOptions(String),

    /// The two tables' schemas cannot be diffed against each other.
    #[error("schema validation failed: {0}")]
    Schema(String),

    /// Key columns of semantically different types were paired.
    #[error("key columns '{0}' and '{1}' cannot be compared due to different types")]
    MismatchingKeyTypes(String, String),

    /// The database layer failed; the diff run is aborted, not retried.
    #[error("datasource failure: {0}")]
    Datasource(String),

    /// The consumer closed the result stream before the run completed.
    #[error("diff run was cancelled")]
    Cancelled,
}

/// Errors produced by the `vmrunner-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A VM identifier was empty or contained characters that cannot appear
    /// in a compute system ID or a pipe name.
    #[error("invalid VM id {id:?}: {reason}")]
    InvalidVmId { id: String, reason: String },

    /// A configuration field failed validation.
    #[error("invalid configuration field '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    /// The configuration document could not be serialized.
    #[error("serialize configuration document: {0}")]
    Serialize(#[from] serde_json::Error),
}

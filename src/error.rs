//! Request-boundary errors
//!
//! Model plumbing uses `anyhow` throughout; the kinds a caller has to tell
//! apart (to pick a status code or a message) are lifted into
//! [`AgreementError`] here.

use thiserror::Error;

/// Errors surfaced by one analysis request
#[derive(Debug, Error)]
pub enum AgreementError {
    /// No word from the verb-pair table appears in the input
    #[error("No supported verb pair found (has/have, is/are, was/were, does/do).")]
    UnsupportedVerb,

    /// After cutting both sentences to a common window their tokens no
    /// longer differ, so patching has nothing to restore
    #[error("The verb falls outside the model's {n_ctx}-token context after truncation.")]
    VerbOutsideContext { n_ctx: usize },

    /// Patching settings that cannot produce a meaningful layer sequence
    #[error("Invalid patch configuration: {0}")]
    InvalidConfig(String),

    /// The runner output cannot be summarized
    #[error("Malformed patch result: {0}")]
    MalformedResult(String),

    /// Forward pass, tokenization or tensor failure
    #[error("Model error: {0:#}")]
    Model(#[from] anyhow::Error),

    /// The blocking worker running the model panicked or was cancelled
    #[error("Model worker failed: {0}")]
    Worker(String),
}

impl AgreementError {
    /// Whether the caller sent something we cannot analyze (as opposed to a server fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AgreementError::UnsupportedVerb | AgreementError::VerbOutsideContext { .. }
        )
    }
}

pub type Result<T, E = AgreementError> = std::result::Result<T, E>;

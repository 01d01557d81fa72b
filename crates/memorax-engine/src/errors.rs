use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unsupported combination: {0}")]
    UnsupportedCombination(String),

    #[error("Variable '{0}' needs a finite domain for this abstraction")]
    UnboundedDomain(String),

    /// Violated internal invariant; intended to be unreachable.
    #[error("Internal invariant violated: {0}")]
    Logic(String),
}

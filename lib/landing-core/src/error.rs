use ipnetwork::Ipv4Network;
use landing_api::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResolveError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// Malformed or missing declared input. Aborts before any resolution.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Structural inconsistency. Aborts the affected component.
    #[error("Topology error: {0}")]
    Topology(String),

    /// CIDR collision. Isolated to one spoke.
    #[error("Attachment conflict: spoke '{spoke}' CIDR {cidr} overlaps '{conflicting}' CIDR {conflicting_cidr}")]
    AttachmentConflict {
        spoke: String,
        cidr: Ipv4Network,
        conflicting: String,
        conflicting_cidr: Ipv4Network,
    },

    /// Invariant breach found by validation. Halts before materialization.
    #[error("Validation failed with {} error(s)", count_errors(.0))]
    ValidationFailure(Vec<Diagnostic>),
}

impl ResolveError {
    /// Short name of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::Configuration(_) => "ConfigurationError",
            ResolveError::Topology(_) => "TopologyError",
            ResolveError::AttachmentConflict { .. } => "AttachmentConflictError",
            ResolveError::ValidationFailure(_) => "ValidationFailure",
        }
    }

    /// Findings carried by a validation failure
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            ResolveError::ValidationFailure(diagnostics) => diagnostics,
            _ => &[],
        }
    }
}

fn count_errors(diagnostics: &[Diagnostic]) -> usize {
    diagnostics.iter().filter(|d| d.is_error()).count()
}

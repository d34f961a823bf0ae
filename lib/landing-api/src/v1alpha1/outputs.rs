use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifiers handed to the materialization layer after a resolution pass
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct NetworkOutputs {
    #[serde(default)]
    pub api_version: String,

    pub transit_gateway_id: String,

    pub firewall_policy_id: String,

    /// Attachment of the inspection VPC
    pub inspection_attachment_id: String,

    /// Transit gateway route table associated with the inspection attachment
    pub hub_route_table_id: String,

    /// NAT gateway per AZ
    #[serde(default)]
    pub nat_gateway_ids: BTreeMap<String, String>,

    /// Firewall endpoint per AZ
    #[serde(default)]
    pub firewall_endpoint_ids: BTreeMap<String, String>,

    /// Resolved spokes keyed by name
    #[serde(default)]
    pub spokes: BTreeMap<String, SpokeOutputs>,

    /// Spokes that could not be resolved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spoke_failures: Vec<SpokeFailure>,

    /// Ordered findings of the last validation run
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

/// Identifiers of one resolved spoke
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SpokeOutputs {
    pub attachment_id: String,
    pub route_table_id: String,
}

/// A spoke rejected during resolution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SpokeFailure {
    pub spoke: String,
    pub kind: String,
    pub message: String,
}

/// Finding severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Halts the pipeline
    Error,
    /// Reported, does not halt
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation finding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Identifier or name of the offending entity
    pub entity_ref: String,
}

impl Diagnostic {
    pub fn error(entity_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            entity_ref: entity_ref.into(),
        }
    }

    pub fn warning(entity_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            entity_ref: entity_ref.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.entity_ref, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_serializes_lowercase() {
        let diagnostic = Diagnostic::warning("us-east-1a", "no spoke uses this AZ");
        let json = serde_json::to_value(&diagnostic).expect("serializable");
        assert_eq!(json["severity"], "warning");
        assert_eq!(json["entity_ref"], "us-east-1a");
    }

    #[test]
    fn test_diagnostic_display() {
        let diagnostic = Diagnostic::error("spoke/prod", "missing default route");
        assert_eq!(diagnostic.to_string(), "[error] spoke/prod: missing default route");
        assert!(diagnostic.is_error());
    }

    #[test]
    fn test_errors_sort_before_warnings() {
        assert!(Severity::Error < Severity::Warning);
    }
}

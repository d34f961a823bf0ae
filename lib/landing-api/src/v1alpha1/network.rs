use crate::{ApiError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// NetworkingInputs declares the hub-and-spoke network of a landing zone:
/// one inspection (hub) VPC and any number of workload (spoke) VPCs
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct NetworkingInputs {
    /// Prefix applied to every resource name (e.g., "acme")
    pub name_prefix: String,

    /// CIDR block of the inspection VPC
    pub inspection_vpc_cidr: String,

    /// Availability zones spanned by the inspection VPC, in order
    pub availability_zones: Vec<String>,

    /// Workload VPCs, resolved in declaration order
    #[serde(default)]
    pub spokes: Vec<SpokeSpec>,

    /// Explicit firewall subnets for the inspection VPC. When empty the
    /// subnets are carved out of `inspection_vpc_cidr`, one per AZ.
    #[serde(default)]
    pub firewall_subnets: Vec<SubnetSpec>,

    /// Firewall policy knobs
    #[serde(default)]
    pub firewall: FirewallSpec,

    /// Private ASN of the transit gateway
    #[serde(default = "default_transit_gateway_asn")]
    pub transit_gateway_asn: u32,

    /// Bucket receiving firewall flow and alert logs (opaque)
    pub log_bucket_name: String,

    /// KMS key protecting firewall logs (opaque)
    pub kms_key_id: String,

    /// SNS topic receiving firewall alerts (opaque)
    pub sns_topic_arn: String,

    /// Service control policies attached per organizational unit
    #[serde(default)]
    pub ou_policy_attachments: BTreeMap<String, Vec<String>>,
}

impl Default for NetworkingInputs {
    fn default() -> Self {
        Self {
            name_prefix: String::new(),
            inspection_vpc_cidr: String::new(),
            availability_zones: Vec::new(),
            spokes: Vec::new(),
            firewall_subnets: Vec::new(),
            firewall: FirewallSpec::default(),
            transit_gateway_asn: default_transit_gateway_asn(),
            log_bucket_name: String::new(),
            kms_key_id: String::new(),
            sns_topic_arn: String::new(),
            ou_policy_attachments: BTreeMap::new(),
        }
    }
}

/// A workload VPC attached to the hub
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SpokeSpec {
    /// Unique name of the spoke (e.g., "prod")
    pub name: String,

    /// CIDR block of the spoke VPC
    pub cidr: String,

    /// AZs used by the spoke. Defaults to the hub's AZ list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zones: Option<Vec<String>>,

    /// Additional transit routes for this spoke
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_routes: Vec<StaticRouteSpec>,
}

/// Explicitly declared subnet
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SubnetSpec {
    pub availability_zone: String,
    pub cidr: String,
}

/// Static route requested by a spoke
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StaticRouteSpec {
    /// Destination CIDR
    pub destination: String,

    /// Where the route points
    pub target: RouteTargetSpec,
}

/// Declared route target
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RouteTargetSpec {
    /// Through the inspection attachment
    Hub,
    /// Drop the traffic
    Blackhole,
    /// Straight to the internet (always rejected for spokes)
    Internet,
    /// Straight to another spoke (always rejected)
    Peer(String),
}

/// Firewall policy configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FirewallSpec {
    /// Pass spoke-to-spoke flows through the firewall (inspected) instead of dropping them
    #[serde(default = "default_true")]
    pub allow_spoke_to_spoke: bool,

    /// Domains allowed for HTTP/TLS egress. Empty means no domain filtering.
    #[serde(default)]
    pub stateful_domain_allowlist: Vec<String>,

    /// Remove the default-deny stateless rule (not recommended)
    #[serde(default)]
    pub override_default_deny: bool,
}

impl Default for FirewallSpec {
    fn default() -> Self {
        Self {
            allow_spoke_to_spoke: true,
            stateful_domain_allowlist: Vec::new(),
            override_default_deny: false,
        }
    }
}

impl NetworkingInputs {
    /// Parse a YAML declaration
    pub fn from_yaml_str(document: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(document)?)
    }

    /// Parse a JSON declaration
    pub fn from_json_str(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    /// Load a declaration from disk, picking the format from the extension
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ApiError::Io {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&document),
            Some("json") => Self::from_json_str(&document),
            Some(other) => Err(ApiError::UnsupportedFormat(other.to_string())),
            None => Err(ApiError::UnsupportedFormat(path.display().to_string())),
        }
    }

    /// JSON schema of the declaration document
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(NetworkingInputs);
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }

    /// AZs a spoke will use
    pub fn spoke_availability_zones<'a>(&'a self, spoke: &'a SpokeSpec) -> &'a [String] {
        spoke
            .availability_zones
            .as_deref()
            .unwrap_or(&self.availability_zones)
    }
}

fn default_transit_gateway_asn() -> u32 {
    64512
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DECLARATION: &str = r#"
name_prefix: test
inspection_vpc_cidr: 10.0.0.0/16
availability_zones: [ap-southeast-2a, ap-southeast-2b, ap-southeast-2c]
log_bucket_name: test-logs
kms_key_id: arn:aws:kms:ap-southeast-2:123456789012:key/test
sns_topic_arn: arn:aws:sns:ap-southeast-2:123456789012:test
spokes:
  - name: nonprod
    cidr: 10.1.0.0/16
  - name: prod
    cidr: 10.2.0.0/16
    availability_zones: [ap-southeast-2a]
    static_routes:
      - destination: 192.168.0.0/16
        target: hub
      - destination: 10.1.0.0/16
        target:
          peer: nonprod
ou_policy_attachments:
  ou-test-123: [policy-1, policy-2]
"#;

    #[test]
    fn test_parse_yaml_declaration() {
        let inputs = NetworkingInputs::from_yaml_str(DECLARATION).expect("valid declaration");
        assert_eq!(inputs.name_prefix, "test");
        assert_eq!(inputs.availability_zones.len(), 3);
        assert_eq!(inputs.spokes.len(), 2);
        assert_eq!(inputs.transit_gateway_asn, 64512);
        assert!(inputs.firewall.allow_spoke_to_spoke);
        assert!(!inputs.firewall.override_default_deny);
        assert_eq!(
            inputs.spokes[1].static_routes[1].target,
            RouteTargetSpec::Peer("nonprod".to_string())
        );
        assert_eq!(
            inputs.ou_policy_attachments.get("ou-test-123"),
            Some(&vec!["policy-1".to_string(), "policy-2".to_string()])
        );
    }

    #[test]
    fn test_spoke_availability_zones_default_to_hub() {
        let inputs = NetworkingInputs::from_yaml_str(DECLARATION).expect("valid declaration");
        assert_eq!(inputs.spoke_availability_zones(&inputs.spokes[0]).len(), 3);
        assert_eq!(
            inputs.spoke_availability_zones(&inputs.spokes[1]),
            &["ap-southeast-2a".to_string()]
        );
    }

    #[test]
    fn test_default_uses_private_asn() {
        let inputs = NetworkingInputs::default();
        assert_eq!(inputs.transit_gateway_asn, 64512);
        assert!(inputs.firewall.allow_spoke_to_spoke);
    }

    #[test]
    fn test_missing_required_field() {
        let result = NetworkingInputs::from_yaml_str("name_prefix: test\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_json_schema_lists_spokes() {
        let schema = NetworkingInputs::json_schema();
        assert!(schema["properties"]["spokes"].is_object());
    }
}

//! Resolution pipeline
//!
//! model -> inspection hub -> spokes -> two-phase routing, with validation
//! after every stage. Model and hub failures abort the pass; spoke failures
//! are collected and reported together with the final findings.
//! Materialization takes a `ValidatedTopology`, which only exists for a pass
//! without errors.

use crate::hub::InspectionHubBuilder;
use crate::model::Topology;
use crate::propagation::{PropagationEngine, RoutedTopology};
use crate::spoke::SpokeResolver;
use crate::validation::{has_errors, Validator};
use crate::{ResolveError, Result};
use landing_api::v1alpha1::API_VERSION;
use landing_api::{Diagnostic, NetworkOutputs, NetworkingInputs, SpokeFailure, SpokeOutputs};
use tracing::{info, warn};

/// Result of one resolution pass
#[derive(Clone, Debug)]
pub struct Resolution {
    pub topology: RoutedTopology,
    /// Rejected spokes in declaration order
    pub failures: Vec<(String, ResolveError)>,
    /// Spoke failures followed by the findings of the final validation
    pub diagnostics: Vec<Diagnostic>,
}

/// Resolve a declared network. Returns `Err` when a stage halts the
/// pipeline; otherwise the resolution carries every per-spoke failure and
/// finding for the operator.
pub fn resolve(inputs: &NetworkingInputs) -> Result<Resolution> {
    info!(
        "Resolving network {}: hub {} across {} AZs, {} spoke(s)",
        inputs.name_prefix,
        inputs.inspection_vpc_cidr,
        inputs.availability_zones.len(),
        inputs.spokes.len()
    );

    let topology = Topology::from_inputs(inputs)?;
    halt_on_errors("model", Validator::model(&topology))?;

    let hub = InspectionHubBuilder::new(&topology).build()?;
    halt_on_errors("hub", Validator::hub(&hub))?;

    let resolution =
        SpokeResolver::new(&topology.name_prefix, &topology.transit_gateway, &hub).resolve(&topology.spokes);
    if !resolution.is_complete() {
        warn!(
            "{} of {} spoke(s) rejected; continuing with the rest",
            resolution.failures.len(),
            topology.spokes.len()
        );
    }
    halt_on_errors("spokes", Validator::spokes(&hub, &resolution.accepted))?;

    let routed = PropagationEngine::new(
        &topology.name_prefix,
        topology.transit_gateway.clone(),
        hub,
        resolution.accepted,
    )
    .associate()?
    .propagate()?;

    Ok(Resolution::assemble(routed, resolution.failures))
}

fn halt_on_errors(stage: &str, findings: Vec<Diagnostic>) -> Result<()> {
    if has_errors(&findings) {
        warn!("Validation halted the pipeline after the {} stage", stage);
        return Err(ResolveError::ValidationFailure(findings));
    }
    Ok(())
}

impl Resolution {
    fn assemble(topology: RoutedTopology, failures: Vec<(String, ResolveError)>) -> Self {
        let mut diagnostics: Vec<Diagnostic> = failures
            .iter()
            .map(|(spoke, error)| Diagnostic::error(spoke, error.to_string()))
            .collect();
        diagnostics.extend(Validator::routing(&topology));

        info!(
            "Resolved {} spoke(s), rejected {}, {} finding(s)",
            topology.spokes.len(),
            failures.len(),
            diagnostics.len()
        );

        Self {
            topology,
            failures,
            diagnostics,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty() || has_errors(&self.diagnostics)
    }

    /// Tear down one resolved spoke and re-validate what remains
    pub fn detach_spoke(self, name: &str) -> Result<Resolution> {
        let (topology, _) = self.topology.detach_spoke(name)?;
        Ok(Self::assemble(topology, self.failures))
    }

    pub fn outputs(&self) -> NetworkOutputs {
        let mut outputs = render_outputs(&self.topology, &self.diagnostics);
        outputs.spoke_failures = self
            .failures
            .iter()
            .map(|(spoke, error)| SpokeFailure {
                spoke: spoke.clone(),
                kind: error.kind().to_string(),
                message: error.to_string(),
            })
            .collect();
        outputs
    }

    /// Hand the topology to materialization. Fails with every finding when
    /// any spoke was rejected or any check reported an error.
    pub fn into_validated(self) -> Result<ValidatedTopology> {
        if self.has_errors() {
            return Err(ResolveError::ValidationFailure(self.diagnostics));
        }
        Ok(ValidatedTopology {
            topology: self.topology,
            diagnostics: self.diagnostics,
        })
    }
}

/// A routed topology that passed validation. Immutable.
#[derive(Clone, Debug)]
pub struct ValidatedTopology {
    topology: RoutedTopology,
    diagnostics: Vec<Diagnostic>,
}

impl ValidatedTopology {
    pub fn topology(&self) -> &RoutedTopology {
        &self.topology
    }

    /// Warnings carried over from validation
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn outputs(&self) -> NetworkOutputs {
        render_outputs(&self.topology, &self.diagnostics)
    }
}

fn render_outputs(topology: &RoutedTopology, diagnostics: &[Diagnostic]) -> NetworkOutputs {
    let hub = &topology.hub;
    NetworkOutputs {
        api_version: API_VERSION.to_string(),
        transit_gateway_id: topology.transit_gateway.id.clone(),
        firewall_policy_id: hub.firewall_policy.id.clone(),
        inspection_attachment_id: hub.attachment.id.clone(),
        hub_route_table_id: hub.transit_route_table.id.clone(),
        nat_gateway_ids: hub
            .nat_gateways
            .iter()
            .map(|n| (n.availability_zone.clone(), n.id.clone()))
            .collect(),
        firewall_endpoint_ids: hub
            .firewall_endpoints
            .iter()
            .map(|e| (e.availability_zone.clone(), e.id.clone()))
            .collect(),
        spokes: topology
            .spokes
            .iter()
            .map(|s| {
                (
                    s.declared_name(&topology.name_prefix),
                    SpokeOutputs {
                        attachment_id: s.attachment.id.clone(),
                        route_table_id: s.route_table.id.clone(),
                    },
                )
            })
            .collect(),
        spoke_failures: Vec::new(),
        diagnostics: diagnostics.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RouteTableKind, RouteTarget};
    use landing_api::{SpokeSpec, SubnetSpec};
    use pretty_assertions::assert_eq;

    fn inputs(spokes: &[(&str, &str)]) -> NetworkingInputs {
        NetworkingInputs {
            name_prefix: "test".into(),
            inspection_vpc_cidr: "10.0.0.0/16".into(),
            availability_zones: vec!["a".into(), "b".into(), "c".into()],
            spokes: spokes
                .iter()
                .map(|(name, cidr)| SpokeSpec {
                    name: name.to_string(),
                    cidr: cidr.to_string(),
                    ..Default::default()
                })
                .collect(),
            log_bucket_name: "test-logs".into(),
            kms_key_id: "arn:aws:kms:ap-southeast-2:123456789012:key/test".into(),
            sns_topic_arn: "arn:aws:sns:ap-southeast-2:123456789012:test".into(),
            transit_gateway_asn: 64512,
            ..Default::default()
        }
    }

    #[test]
    fn test_hub_with_two_spokes() {
        let resolution = resolve(&inputs(&[("nonprod", "10.1.0.0/16"), ("prod", "10.2.0.0/16")])).unwrap();
        assert!(!resolution.has_errors(), "{:?}", resolution.diagnostics);

        let routed = &resolution.topology;
        assert_eq!(routed.spokes.len(), 2);
        for spoke in &routed.spokes {
            let defaults: Vec<_> = spoke.route_table.default_routes().collect();
            assert_eq!(defaults.len(), 1);
            assert_eq!(defaults[0].target, RouteTarget::Attachment(routed.hub.attachment.id.clone()));
        }

        assert_eq!(routed.hub.transit_route_table.routes().len(), 2);
        let firewall_egress = routed
            .hub
            .egress_routes()
            .filter(|(table, _)| table.kind == RouteTableKind::HubFirewall)
            .count();
        assert_eq!(firewall_egress, 3);

        let outputs = resolution.outputs();
        assert_eq!(outputs.spokes.len(), 2);
        assert!(outputs.spokes.contains_key("nonprod"));
        assert_eq!(outputs.nat_gateway_ids.len(), 3);
        assert_eq!(outputs.firewall_endpoint_ids.len(), 3);
        assert!(outputs.spoke_failures.is_empty());
        assert_eq!(outputs.api_version, API_VERSION);
    }

    #[test]
    fn test_duplicate_cidr_keeps_first_spoke() {
        let resolution = resolve(&inputs(&[("nonprod", "10.1.0.0/16"), ("copy", "10.1.0.0/16")])).unwrap();

        assert_eq!(resolution.failures.len(), 1);
        assert!(matches!(resolution.failures[0].1, ResolveError::AttachmentConflict { .. }));

        let outputs = resolution.outputs();
        assert!(outputs.spokes.contains_key("nonprod"));
        assert!(!outputs.spokes.contains_key("copy"));
        assert_eq!(outputs.spoke_failures[0].kind, "AttachmentConflictError");
        assert_eq!(resolution.topology.hub.transit_route_table.routes().len(), 1);

        assert!(resolution.has_errors());
        assert!(matches!(resolution.into_validated(), Err(ResolveError::ValidationFailure(_))));
    }

    #[test]
    fn test_missing_firewall_subnet_halts_before_attachments() {
        let mut declared = inputs(&[("nonprod", "10.1.0.0/16")]);
        declared.availability_zones = vec!["a".into(), "b".into()];
        declared.firewall_subnets = vec![SubnetSpec {
            availability_zone: "a".into(),
            cidr: "10.0.240.0/28".into(),
        }];
        assert!(matches!(resolve(&declared), Err(ResolveError::Topology(_))));
    }

    #[test]
    fn test_spoke_named_inspection_resolves() {
        let resolution = resolve(&inputs(&[("prod", "10.1.0.0/16"), ("inspection", "10.2.0.0/16")])).unwrap();
        assert!(!resolution.has_errors(), "{:?}", resolution.diagnostics);

        let outputs = resolution.outputs();
        assert!(outputs.spokes.contains_key("prod"));
        assert!(outputs.spokes.contains_key("inspection"));
        assert_ne!(outputs.spokes["inspection"].attachment_id, outputs.inspection_attachment_id);
    }

    #[test]
    fn test_configuration_error_aborts() {
        let mut declared = inputs(&[]);
        declared.availability_zones.clear();
        assert!(matches!(resolve(&declared), Err(ResolveError::Configuration(_))));
    }

    #[test]
    fn test_validated_topology_revalidates_clean() {
        let validated = resolve(&inputs(&[("nonprod", "10.1.0.0/16"), ("prod", "10.2.0.0/16")]))
            .unwrap()
            .into_validated()
            .unwrap();
        let first = Validator::routing(validated.topology());
        let second = Validator::routing(validated.topology());
        assert!(!has_errors(&first));
        assert_eq!(first, second);
        assert_eq!(validated.outputs().spokes.len(), 2);
    }

    #[test]
    fn test_detach_spoke_revalidates() {
        let resolution = resolve(&inputs(&[("nonprod", "10.1.0.0/16"), ("prod", "10.2.0.0/16")])).unwrap();
        let resolution = resolution.detach_spoke("nonprod").unwrap();
        assert!(!resolution.has_errors());
        assert_eq!(resolution.outputs().spokes.len(), 1);
        assert_eq!(resolution.topology.hub.transit_route_table.routes().len(), 1);
    }
}

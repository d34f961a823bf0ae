//! Property-based tests for the resolution pipeline
//!
//! Random hub-and-spoke declarations, including overlapping and duplicate
//! spoke CIDRs, must always resolve into a topology where every accepted
//! spoke egresses through inspection.

use landing_api::{NetworkingInputs, SpokeSpec};
use landing_core::model::{cidrs_overlap, RouteTarget};
use landing_core::validation::has_errors;
use landing_core::{resolve, Validator};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

const ZONES: [&str; 4] = ["ap-southeast-2a", "ap-southeast-2b", "ap-southeast-2c", "ap-southeast-2d"];

/// (second octet, prefix length) of a 10.x.0.0 spoke; collisions are likely
fn spoke_cidr() -> impl Strategy<Value = (u8, u8)> {
    (1u8..24, 16u8..=20)
}

fn declaration() -> impl Strategy<Value = NetworkingInputs> {
    (1usize..=ZONES.len(), prop::collection::vec(spoke_cidr(), 0..8)).prop_map(|(zones, cidrs)| {
        NetworkingInputs {
            name_prefix: "prop".into(),
            inspection_vpc_cidr: "10.0.0.0/16".into(),
            availability_zones: ZONES[..zones].iter().map(|z| z.to_string()).collect(),
            spokes: cidrs
                .iter()
                .enumerate()
                .map(|(i, (octet, prefix))| SpokeSpec {
                    name: format!("spoke{}", i),
                    cidr: format!("10.{}.0.0/{}", octet, prefix),
                    ..Default::default()
                })
                .collect(),
            log_bucket_name: "prop-logs".into(),
            kms_key_id: "kms".into(),
            sns_topic_arn: "sns".into(),
            transit_gateway_asn: 64512,
            ..Default::default()
        }
    })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Property: every accepted spoke has exactly one default route and it
    /// targets the inspection attachment
    #[test]
    fn prop_single_default_route_to_hub(inputs in declaration()) {
        let resolution = resolve(&inputs).unwrap();
        let hub_attachment = RouteTarget::Attachment(resolution.topology.hub.attachment.id.clone());

        for spoke in &resolution.topology.spokes {
            let defaults: Vec<_> = spoke.route_table.default_routes().collect();
            prop_assert_eq!(defaults.len(), 1);
            prop_assert_eq!(&defaults[0].target, &hub_attachment);
        }
    }

    /// Property: accepted spoke CIDRs are pairwise disjoint and disjoint
    /// from the hub
    #[test]
    fn prop_accepted_cidrs_disjoint(inputs in declaration()) {
        let resolution = resolve(&inputs).unwrap();
        let routed = &resolution.topology;

        for (i, a) in routed.spokes.iter().enumerate() {
            prop_assert!(!cidrs_overlap(&a.vpc.cidr, &routed.hub.vpc.cidr));
            for b in &routed.spokes[i + 1..] {
                prop_assert!(!cidrs_overlap(&a.vpc.cidr, &b.vpc.cidr));
            }
        }
        prop_assert_eq!(routed.spokes.len() + resolution.failures.len(), inputs.spokes.len());
    }

    /// Property: NAT gateways and firewall endpoints cover the same AZs,
    /// one each per hub AZ
    #[test]
    fn prop_nat_and_endpoint_symmetry(inputs in declaration()) {
        let resolution = resolve(&inputs).unwrap();
        let hub = &resolution.topology.hub;

        let mut nat_zones: Vec<_> = hub.nat_gateways.iter().map(|n| n.availability_zone.clone()).collect();
        let mut endpoint_zones: Vec<_> =
            hub.firewall_endpoints.iter().map(|e| e.availability_zone.clone()).collect();
        nat_zones.sort();
        endpoint_zones.sort();

        prop_assert_eq!(&nat_zones, &endpoint_zones);
        prop_assert_eq!(nat_zones, inputs.availability_zones.clone());
    }

    /// Property: every accepted spoke CIDR has exactly one hub route
    #[test]
    fn prop_hub_routes_track_accepted_spokes(inputs in declaration()) {
        let resolution = resolve(&inputs).unwrap();
        let routed = &resolution.topology;

        prop_assert_eq!(routed.hub.transit_route_table.routes().len(), routed.spokes.len());
        for spoke in &routed.spokes {
            let route = routed.hub.transit_route_table.route_for(&spoke.vpc.cidr);
            prop_assert!(route.is_some());
        }
    }

    /// Property: validation of a resolved topology is idempotent and reports
    /// no errors beyond the rejected spokes
    #[test]
    fn prop_validation_idempotent(inputs in declaration()) {
        let resolution = resolve(&inputs).unwrap();

        let first = Validator::routing(&resolution.topology);
        let second = Validator::routing(&resolution.topology);
        prop_assert!(!has_errors(&first));
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(resolution.has_errors(), !resolution.failures.is_empty());
    }

    /// Property: resolution is a pure function of the declaration
    #[test]
    fn prop_resolution_deterministic(inputs in declaration()) {
        let first = serde_json::to_value(resolve(&inputs).unwrap().outputs()).unwrap();
        let second = serde_json::to_value(resolve(&inputs).unwrap().outputs()).unwrap();
        prop_assert_eq!(first, second);
    }
}

#[test]
fn test_detaching_every_spoke_leaves_empty_hub_table() {
    let inputs = NetworkingInputs {
        name_prefix: "prop".into(),
        inspection_vpc_cidr: "10.0.0.0/16".into(),
        availability_zones: ZONES[..2].iter().map(|z| z.to_string()).collect(),
        spokes: ["dev", "test", "prod"]
            .iter()
            .enumerate()
            .map(|(i, name)| SpokeSpec {
                name: name.to_string(),
                cidr: format!("10.{}.0.0/16", i + 1),
                ..Default::default()
            })
            .collect(),
        transit_gateway_asn: 64512,
        ..Default::default()
    };

    let mut resolution = resolve(&inputs).unwrap();
    for name in ["dev", "test", "prod"] {
        resolution = resolution.detach_spoke(name).unwrap();
    }

    assert_eq!(resolution.topology.hub.transit_route_table.routes().len(), 0);
    assert_eq!(resolution.topology.ledger.len(), 1);
    assert!(resolution.topology.hub.firewall_policy.admitted_spokes().is_empty());
    assert!(!resolution.has_errors());
}

//! Pre-apply validation
//!
//! Every check is a pure function of the model: running it twice over the
//! same value yields the same ordered findings. Errors halt the pipeline,
//! warnings are reported and do not.

use crate::hub::InspectionHub;
use crate::model::{cidrs_overlap, AttachmentKind, RouteTableKind, RouteTarget, SubnetTier, Topology, Vpc};
use crate::propagation::RoutedTopology;
use crate::spoke::ResolvedSpoke;
use landing_api::Diagnostic;
use std::collections::{BTreeMap, BTreeSet};

/// Whether any finding is an error
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.is_error())
}

/// Stage checks, one entry point per pipeline stage
pub struct Validator;

impl Validator {
    /// After the topology model is built
    pub fn model(topology: &Topology) -> Vec<Diagnostic> {
        let mut findings = Vec::new();
        let tgw = &topology.transit_gateway;

        if tgw.default_route_table_association || tgw.default_route_table_propagation {
            findings.push(Diagnostic::error(
                &tgw.id,
                "default route table association/propagation must be disabled so attachments cannot bypass inspection",
            ));
        }

        if !is_private_asn(tgw.amazon_side_asn) {
            findings.push(Diagnostic::error(
                &tgw.id,
                format!("amazon side ASN {} is outside the private ASN ranges", tgw.amazon_side_asn),
            ));
        }

        for subnet in &topology.hub_subnets {
            if !topology.hub.cidr.contains(subnet.cidr.network()) {
                findings.push(Diagnostic::error(
                    &subnet.id,
                    format!("subnet {} lies outside hub CIDR {}", subnet.cidr, topology.hub.cidr),
                ));
            }
        }

        for (i, a) in topology.hub_subnets.iter().enumerate() {
            for b in &topology.hub_subnets[i + 1..] {
                if cidrs_overlap(&a.cidr, &b.cidr) {
                    findings.push(Diagnostic::error(
                        &a.id,
                        format!("subnet {} overlaps subnet {} ({})", a.cidr, b.id, b.cidr),
                    ));
                }
            }
        }

        findings
    }

    /// After the inspection hub is built
    pub fn hub(hub: &InspectionHub) -> Vec<Diagnostic> {
        let mut findings = Vec::new();
        let zones = &hub.vpc.availability_zones;

        for zone in zones {
            let firewall_subnets = hub
                .subnets
                .iter()
                .filter(|s| s.tier == SubnetTier::Firewall && &s.availability_zone == zone)
                .count();
            if firewall_subnets != 1 {
                findings.push(Diagnostic::error(
                    zone,
                    format!("hub has {} firewall subnets in this AZ, expected exactly 1", firewall_subnets),
                ));
            }

            let nats = hub.nat_gateways.iter().filter(|n| &n.availability_zone == zone).count();
            let endpoints = hub
                .firewall_endpoints
                .iter()
                .filter(|e| &e.availability_zone == zone)
                .count();
            match (nats, endpoints) {
                (1, 1) => {}
                (0, 0) => findings.push(Diagnostic::error(
                    zone,
                    "hub AZ has neither NAT gateway nor firewall endpoint",
                )),
                (n, e) => findings.push(Diagnostic::error(
                    zone,
                    format!("asymmetric AZ: {} NAT gateway(s), {} firewall endpoint(s)", n, e),
                )),
            }

            check_zone_egress(hub, zone, &mut findings);
        }

        for nat in &hub.nat_gateways {
            if !zones.contains(&nat.availability_zone) {
                findings.push(Diagnostic::error(&nat.id, format!("NAT gateway in unspanned AZ {}", nat.availability_zone)));
            }
        }
        for endpoint in &hub.firewall_endpoints {
            if !zones.contains(&endpoint.availability_zone) {
                findings.push(Diagnostic::error(
                    &endpoint.id,
                    format!("firewall endpoint in unspanned AZ {}", endpoint.availability_zone),
                ));
            }
        }

        let policy = &hub.firewall_policy;
        if policy.vpc_id != hub.vpc.id {
            findings.push(Diagnostic::error(
                &policy.id,
                format!("firewall policy is bound to {}, not hub VPC {}", policy.vpc_id, hub.vpc.id),
            ));
        }
        if !policy.has_default_deny() {
            if policy.default_deny_overridden {
                findings.push(Diagnostic::warning(
                    &policy.id,
                    "default-deny stateless rule explicitly overridden",
                ));
            } else {
                findings.push(Diagnostic::error(&policy.id, "firewall policy has no default-deny stateless rule"));
            }
        }

        let attachment = &hub.attachment;
        if attachment.kind != AttachmentKind::Inspection || attachment.vpc_id != hub.vpc.id {
            findings.push(Diagnostic::error(&attachment.id, "hub attachment is not the inspection attachment of the hub VPC"));
        }
        if !attachment.appliance_mode {
            findings.push(Diagnostic::warning(
                &attachment.id,
                "appliance mode disabled; return traffic may cross AZs and miss its firewall endpoint",
            ));
        }
        if attachment.subnet_ids.len() != zones.len() {
            findings.push(Diagnostic::error(
                &attachment.id,
                format!("inspection attachment spans {} subnets for {} AZs", attachment.subnet_ids.len(), zones.len()),
            ));
        }

        findings
    }

    /// After spoke attachment resolution
    pub fn spokes(hub: &InspectionHub, spokes: &[ResolvedSpoke]) -> Vec<Diagnostic> {
        let mut findings = Vec::new();

        let vpcs: Vec<&Vpc> = std::iter::once(&hub.vpc).chain(spokes.iter().map(|s| &s.vpc)).collect();
        for (i, a) in vpcs.iter().enumerate() {
            for b in &vpcs[i + 1..] {
                if cidrs_overlap(&a.cidr, &b.cidr) {
                    findings.push(Diagnostic::error(
                        &b.name,
                        format!("CIDR {} overlaps {} ({})", b.cidr, a.name, a.cidr),
                    ));
                }
            }
        }

        let spoke_attachments: BTreeMap<&str, &str> = spokes
            .iter()
            .map(|s| (s.attachment.id.as_str(), s.vpc.name.as_str()))
            .collect();
        if spoke_attachments.len() != spokes.len() {
            findings.push(Diagnostic::error(&hub.vpc.name, "two spokes share an attachment identifier"));
        }

        for spoke in spokes {
            let table = &spoke.route_table;

            if spoke.attachment.kind != AttachmentKind::Spoke || spoke.attachment.vpc_id != spoke.vpc.id {
                findings.push(Diagnostic::error(
                    &spoke.attachment.id,
                    format!("attachment does not belong to spoke {}", spoke.vpc.name),
                ));
            }

            let defaults: Vec<_> = table.default_routes().collect();
            match defaults.as_slice() {
                [only] if only.target == RouteTarget::Attachment(hub.attachment.id.clone()) => {}
                [only] => findings.push(Diagnostic::error(
                    &table.id,
                    format!("default route targets {} instead of the inspection attachment", only.target),
                )),
                other => findings.push(Diagnostic::error(
                    &table.id,
                    format!("spoke route table has {} default routes, expected exactly 1", other.len()),
                )),
            }

            for route in table.routes() {
                let bypass = match &route.target {
                    RouteTarget::Attachment(id) if id == &hub.attachment.id => None,
                    RouteTarget::Attachment(id) => Some(match spoke_attachments.get(id.as_str()) {
                        Some(peer) => format!("routes {} directly to peer {}", route.destination, peer),
                        None => format!("routes {} to unknown attachment {}", route.destination, id),
                    }),
                    RouteTarget::Blackhole => None,
                    other => Some(format!("routes {} to {} outside the inspection path", route.destination, other)),
                };
                if let Some(message) = bypass {
                    findings.push(Diagnostic::error(&table.id, message));
                }
            }
        }

        findings
    }

    /// Full check of a routed topology
    pub fn routing(routed: &RoutedTopology) -> Vec<Diagnostic> {
        let hub = &routed.hub;
        let mut findings = Self::hub(hub);
        findings.extend(Self::spokes(hub, &routed.spokes));

        let hub_table = &hub.transit_route_table;
        match routed.ledger.route_table_of(&hub.attachment.id) {
            Some(id) if id == hub_table.id => {}
            _ => findings.push(Diagnostic::error(
                &hub.attachment.id,
                "inspection attachment is not associated with the hub route table",
            )),
        }

        let attachments: BTreeSet<&str> = routed.spokes.iter().map(|s| s.attachment.id.as_str()).collect();
        for route in hub_table.routes() {
            match &route.target {
                RouteTarget::Attachment(id) if id == &hub.attachment.id => findings.push(Diagnostic::error(
                    &hub_table.id,
                    format!("hub route {} loops back into the inspection attachment", route.destination),
                )),
                RouteTarget::Attachment(id) if attachments.contains(id.as_str()) => {}
                RouteTarget::Blackhole => {}
                other => findings.push(Diagnostic::error(
                    &hub_table.id,
                    format!("hub route {} targets unknown {}", route.destination, other),
                )),
            }
        }

        let admitted = hub.firewall_policy.admitted_spokes();

        for spoke in &routed.spokes {
            let name = spoke.vpc.name.as_str();
            match routed.ledger.route_table_of(&spoke.attachment.id) {
                Some(id) if id == spoke.route_table.id => {}
                _ => findings.push(Diagnostic::error(
                    &spoke.attachment.id,
                    format!("attachment of {} is not associated with its own route table", name),
                )),
            }

            let reachable = hub_table
                .route_for(&spoke.vpc.cidr)
                .map(|r| r.target == RouteTarget::Attachment(spoke.attachment.id.clone()))
                .unwrap_or(false);
            if !reachable {
                findings.push(Diagnostic::error(
                    name,
                    format!("spoke {} is unreachable: hub route table has no route to it", spoke.vpc.cidr),
                ));
            }

            for zone in &hub.vpc.availability_zones {
                let returns = hub
                    .vpc_route_table(RouteTableKind::HubFirewall, zone)
                    .and_then(|t| t.route_for(&spoke.vpc.cidr))
                    .is_some();
                if !returns {
                    findings.push(Diagnostic::error(
                        name,
                        format!("hub firewall subnet in {} has no return route to {}", zone, spoke.vpc.cidr),
                    ));
                }
            }

            if !admitted.iter().any(|(_, cidr)| *cidr == spoke.vpc.cidr) {
                findings.push(Diagnostic::error(name, "spoke is not admitted by the firewall policy"));
            }

            for zone in &spoke.vpc.availability_zones {
                if !hub.vpc.availability_zones.contains(zone) {
                    findings.push(Diagnostic::warning(
                        name,
                        format!("spoke uses {} which the inspection hub does not span; traffic crosses AZs", zone),
                    ));
                }
            }
        }

        for zone in &hub.vpc.availability_zones {
            let used = routed.spokes.iter().any(|s| s.vpc.availability_zones.contains(zone));
            if !used {
                findings.push(Diagnostic::warning(zone, "no spoke uses this hub AZ"));
            }
        }

        findings
    }
}

/// 64512-65534 or 4200000000-4294967294
fn is_private_asn(asn: u32) -> bool {
    (64512..=65534).contains(&asn) || (4_200_000_000..=4_294_967_294).contains(&asn)
}

/// AZ-local egress: private table -> local firewall endpoint, firewall table
/// -> local NAT gateway, public table -> internet gateway
fn check_zone_egress(hub: &InspectionHub, zone: &str, findings: &mut Vec<Diagnostic>) {
    let expected = [
        (
            RouteTableKind::HubPrivate,
            hub.firewall_endpoint_in(zone).map(|e| RouteTarget::FirewallEndpoint(e.id.clone())),
        ),
        (
            RouteTableKind::HubFirewall,
            hub.nat_gateway_in(zone).map(|n| RouteTarget::NatGateway(n.id.clone())),
        ),
        (
            RouteTableKind::HubPublic,
            Some(RouteTarget::InternetGateway(hub.internet_gateway_id.clone())),
        ),
    ];

    for (kind, target) in expected {
        let Some(table) = hub.vpc_route_table(kind, zone) else {
            findings.push(Diagnostic::error(zone, format!("hub AZ is missing its {:?} route table", kind)));
            continue;
        };
        let defaults: Vec<_> = table.default_routes().collect();
        let ok = match (defaults.as_slice(), &target) {
            ([only], Some(target)) => &only.target == target,
            _ => false,
        };
        if !ok {
            findings.push(Diagnostic::error(
                &table.id,
                "egress default route must target the resource in the same AZ",
            ));
        }
    }
}

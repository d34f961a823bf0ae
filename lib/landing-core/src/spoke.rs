//! Spoke attachment resolution
//!
//! Spokes are resolved one at a time in declaration order. A spoke is
//! accepted only if its CIDR is disjoint from the hub and from every spoke
//! accepted before it, and if none of its declared routes would let traffic
//! leave the spoke without crossing the inspection attachment. A rejected
//! spoke does not stop the spokes after it.

use crate::hub::InspectionHub;
use crate::ids::{resource_id, resource_name};
use crate::model::{
    bits_for, cidrs_overlap, default_route, nth_subnet, AttachmentKind, Route, RouteTable,
    RouteTableKind, RouteTarget, SpokeVpc, Subnet, SubnetTier, TransitGateway,
    TransitGatewayAttachment, Vpc, MAX_SUBNET_PREFIX,
};
use crate::{ResolveError, Result};
use landing_api::RouteTargetSpec;
use tracing::{debug, info, warn};

/// A spoke that passed resolution
#[derive(Clone, Debug)]
pub struct ResolvedSpoke {
    pub vpc: Vpc,
    /// AZ-local subnets carrying the transit gateway attachment
    pub subnets: Vec<Subnet>,
    pub attachment: TransitGatewayAttachment,
    pub route_table: RouteTable,
}

impl ResolvedSpoke {
    /// Short spoke name as declared
    pub fn declared_name(&self, name_prefix: &str) -> String {
        self.vpc
            .name
            .strip_prefix(name_prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .unwrap_or(&self.vpc.name)
            .to_string()
    }
}

/// Outcome of a resolution pass: accepted spokes in declaration order and
/// the failures of the rejected ones
#[derive(Clone, Debug, Default)]
pub struct SpokeResolution {
    pub accepted: Vec<ResolvedSpoke>,
    pub failures: Vec<(String, ResolveError)>,
}

impl SpokeResolution {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct SpokeResolver<'a> {
    name_prefix: &'a str,
    transit_gateway: &'a TransitGateway,
    hub: &'a InspectionHub,
}

impl<'a> SpokeResolver<'a> {
    pub fn new(name_prefix: &'a str, transit_gateway: &'a TransitGateway, hub: &'a InspectionHub) -> Self {
        Self {
            name_prefix,
            transit_gateway,
            hub,
        }
    }

    /// Resolve every spoke, collecting per-spoke failures instead of stopping
    pub fn resolve(&self, spokes: &[SpokeVpc]) -> SpokeResolution {
        let mut resolution = SpokeResolution::default();

        for spoke in spokes {
            let short_name = self.short_name(&spoke.vpc);
            match self.resolve_one(spoke, &resolution.accepted) {
                Ok(resolved) => {
                    info!(
                        "Accepted spoke {} ({}) with attachment {}",
                        short_name, resolved.vpc.cidr, resolved.attachment.id
                    );
                    resolution.accepted.push(resolved);
                }
                Err(e) => {
                    warn!("Rejected spoke {}: {}", short_name, e);
                    resolution.failures.push((short_name, e));
                }
            }
        }

        resolution
    }

    /// Resolve a single spoke against the hub and the spokes accepted so far
    pub fn resolve_one(&self, spoke: &SpokeVpc, accepted: &[ResolvedSpoke]) -> Result<ResolvedSpoke> {
        let vpc = &spoke.vpc;
        let short_name = self.short_name(vpc);

        self.check_cidr(&short_name, vpc, accepted)?;

        let subnets = self.attachment_subnets(&short_name, vpc)?;

        let attachment = TransitGatewayAttachment {
            id: resource_id("tgw-attach", self.name_prefix, &["spoke", &short_name]),
            name: resource_name(self.name_prefix, &[&short_name, "attachment"]),
            transit_gateway_id: self.transit_gateway.id.clone(),
            vpc_id: vpc.id.clone(),
            kind: AttachmentKind::Spoke,
            subnet_ids: subnets.iter().map(|s| s.id.clone()).collect(),
            appliance_mode: false,
        };

        let mut route_table = RouteTable::new(
            resource_id("tgw-rtb", self.name_prefix, &["spoke", &short_name]),
            resource_name(self.name_prefix, &["tgw-rtb", &short_name]),
            RouteTableKind::TransitSpoke,
            None,
        );
        route_table.insert(Route::new(
            default_route(),
            RouteTarget::Attachment(self.hub.attachment.id.clone()),
        ))?;

        for declared in &spoke.static_routes {
            let target = self.static_target(&short_name, vpc, declared.destination, &declared.target, accepted)?;
            route_table.insert(Route::new(declared.destination, target))?;
            debug!(
                "Spoke {} static route {} -> {:?}",
                short_name, declared.destination, declared.target
            );
        }

        Ok(ResolvedSpoke {
            vpc: vpc.clone(),
            subnets,
            attachment,
            route_table,
        })
    }

    fn check_cidr(&self, short_name: &str, vpc: &Vpc, accepted: &[ResolvedSpoke]) -> Result<()> {
        let hub = &self.hub.vpc;
        if cidrs_overlap(&vpc.cidr, &hub.cidr) {
            return Err(ResolveError::AttachmentConflict {
                spoke: short_name.to_string(),
                cidr: vpc.cidr,
                conflicting: self.short_name(hub),
                conflicting_cidr: hub.cidr,
            });
        }

        if let Some(previous) = accepted.iter().find(|s| cidrs_overlap(&vpc.cidr, &s.vpc.cidr)) {
            return Err(ResolveError::AttachmentConflict {
                spoke: short_name.to_string(),
                cidr: vpc.cidr,
                conflicting: self.short_name(&previous.vpc),
                conflicting_cidr: previous.vpc.cidr,
            });
        }

        Ok(())
    }

    /// Decide the target of a declared static route. Only the hub attachment
    /// and blackhole are acceptable targets.
    fn static_target(
        &self,
        short_name: &str,
        vpc: &Vpc,
        destination: ipnetwork::Ipv4Network,
        target: &RouteTargetSpec,
        accepted: &[ResolvedSpoke],
    ) -> Result<RouteTarget> {
        if destination.prefix() == 0 {
            return Err(ResolveError::Topology(format!(
                "spoke '{}' declares a second default route; the only default route targets the inspection attachment",
                short_name
            )));
        }
        if cidrs_overlap(&destination, &vpc.cidr) {
            return Err(ResolveError::Topology(format!(
                "spoke '{}' routes {} which overlaps its own CIDR {}",
                short_name, destination, vpc.cidr
            )));
        }

        match target {
            RouteTargetSpec::Hub => Ok(RouteTarget::Attachment(self.hub.attachment.id.clone())),
            RouteTargetSpec::Blackhole => Ok(RouteTarget::Blackhole),
            RouteTargetSpec::Internet => Err(ResolveError::Topology(format!(
                "spoke '{}' routes {} straight to the internet; egress must traverse the inspection hub",
                short_name, destination
            ))),
            RouteTargetSpec::Peer(peer) => {
                let known = accepted.iter().any(|s| self.short_name(&s.vpc) == *peer);
                Err(ResolveError::Topology(format!(
                    "spoke '{}' routes {} directly to {}spoke '{}'; spoke-to-spoke traffic must traverse the inspection hub",
                    short_name,
                    destination,
                    if known { "" } else { "unknown " },
                    peer
                )))
            }
        }
    }

    /// One private subnet per spoke AZ, carved from the top of the spoke CIDR
    fn attachment_subnets(&self, short_name: &str, vpc: &Vpc) -> Result<Vec<Subnet>> {
        let zones = &vpc.availability_zones;
        let prefix = MAX_SUBNET_PREFIX;
        let extra_bits = bits_for(zones.len());
        if vpc.cidr.prefix() + extra_bits > prefix {
            return Err(ResolveError::Topology(format!(
                "spoke '{}' CIDR {} is too small for {} attachment subnets",
                short_name,
                vpc.cidr,
                zones.len()
            )));
        }

        let slots = 1u64 << (prefix - vpc.cidr.prefix());
        zones
            .iter()
            .enumerate()
            .map(|(index, zone)| {
                let slot = slots - zones.len() as u64 + index as u64;
                let cidr = u32::try_from(slot)
                    .ok()
                    .and_then(|slot| nth_subnet(&vpc.cidr, prefix, slot))
                    .ok_or_else(|| {
                        ResolveError::Topology(format!(
                            "spoke '{}' CIDR {} cannot hold an attachment subnet in {}",
                            short_name, vpc.cidr, zone
                        ))
                    })?;
                Ok(Subnet {
                    id: resource_id("subnet", self.name_prefix, &[&vpc.name, "attachment", zone]),
                    name: resource_name(self.name_prefix, &[short_name, "tgw", zone]),
                    vpc_id: vpc.id.clone(),
                    availability_zone: zone.clone(),
                    tier: SubnetTier::Private,
                    cidr,
                })
            })
            .collect()
    }

    fn short_name(&self, vpc: &Vpc) -> String {
        vpc.name
            .strip_prefix(self.name_prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .unwrap_or(&vpc.name)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::InspectionHubBuilder;
    use crate::model::Topology;
    use landing_api::{NetworkingInputs, SpokeSpec, StaticRouteSpec};

    fn inputs(spokes: Vec<SpokeSpec>) -> NetworkingInputs {
        NetworkingInputs {
            name_prefix: "test".into(),
            inspection_vpc_cidr: "10.0.0.0/16".into(),
            availability_zones: vec!["a".into(), "b".into(), "c".into()],
            spokes,
            log_bucket_name: "test-logs".into(),
            kms_key_id: "key".into(),
            sns_topic_arn: "topic".into(),
            transit_gateway_asn: 64512,
            ..Default::default()
        }
    }

    fn spoke(name: &str, cidr: &str) -> SpokeSpec {
        SpokeSpec {
            name: name.into(),
            cidr: cidr.into(),
            ..Default::default()
        }
    }

    fn resolve(inputs: &NetworkingInputs) -> (InspectionHub, SpokeResolution) {
        let topology = Topology::from_inputs(inputs).unwrap();
        let hub = InspectionHubBuilder::new(&topology).build().unwrap();
        let resolution =
            SpokeResolver::new(&topology.name_prefix, &topology.transit_gateway, &hub).resolve(&topology.spokes);
        (hub, resolution)
    }

    #[test]
    fn test_default_route_targets_hub_attachment() {
        let (hub, resolution) = resolve(&inputs(vec![
            spoke("nonprod", "10.1.0.0/16"),
            spoke("prod", "10.2.0.0/16"),
        ]));
        assert!(resolution.is_complete());
        assert_eq!(resolution.accepted.len(), 2);
        for resolved in &resolution.accepted {
            let defaults: Vec<_> = resolved.route_table.default_routes().collect();
            assert_eq!(defaults.len(), 1);
            assert_eq!(defaults[0].target, RouteTarget::Attachment(hub.attachment.id.clone()));
            assert_eq!(resolved.attachment.subnet_ids.len(), 3);
        }
    }

    #[test]
    fn test_duplicate_cidr_rejects_only_second_spoke() {
        let (_, resolution) = resolve(&inputs(vec![
            spoke("nonprod", "10.1.0.0/16"),
            spoke("shadow", "10.1.0.0/16"),
            spoke("prod", "10.2.0.0/16"),
        ]));
        assert_eq!(resolution.accepted.len(), 2);
        assert_eq!(resolution.failures.len(), 1);
        let (name, error) = &resolution.failures[0];
        assert_eq!(name, "shadow");
        match error {
            ResolveError::AttachmentConflict { spoke, conflicting, .. } => {
                assert_eq!(spoke, "shadow");
                assert_eq!(conflicting, "nonprod");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_overlap_with_hub() {
        let (_, resolution) = resolve(&inputs(vec![spoke("inside", "10.0.128.0/17")]));
        assert!(matches!(
            &resolution.failures[0].1,
            ResolveError::AttachmentConflict { conflicting, .. } if conflicting == "inspection"
        ));
    }

    #[test]
    fn test_peer_route_is_rejected() {
        let mut prod = spoke("prod", "10.2.0.0/16");
        prod.static_routes = vec![StaticRouteSpec {
            destination: "10.1.0.0/16".into(),
            target: RouteTargetSpec::Peer("nonprod".into()),
        }];
        let (_, resolution) = resolve(&inputs(vec![spoke("nonprod", "10.1.0.0/16"), prod]));
        assert_eq!(resolution.accepted.len(), 1);
        assert!(matches!(&resolution.failures[0].1, ResolveError::Topology(msg) if msg.contains("spoke-to-spoke")));
    }

    #[test]
    fn test_internet_and_second_default_are_rejected() {
        let mut egress = spoke("egress", "10.3.0.0/16");
        egress.static_routes = vec![StaticRouteSpec {
            destination: "8.8.8.0/24".into(),
            target: RouteTargetSpec::Internet,
        }];
        let mut second_default = spoke("default", "10.4.0.0/16");
        second_default.static_routes = vec![StaticRouteSpec {
            destination: "0.0.0.0/0".into(),
            target: RouteTargetSpec::Blackhole,
        }];
        let (_, resolution) = resolve(&inputs(vec![egress, second_default]));
        assert!(resolution.accepted.is_empty());
        assert_eq!(resolution.failures.len(), 2);
    }

    #[test]
    fn test_hub_and_blackhole_routes_allowed() {
        let mut prod = spoke("prod", "10.2.0.0/16");
        prod.static_routes = vec![
            StaticRouteSpec {
                destination: "192.168.0.0/16".into(),
                target: RouteTargetSpec::Hub,
            },
            StaticRouteSpec {
                destination: "172.16.0.0/12".into(),
                target: RouteTargetSpec::Blackhole,
            },
        ];
        let (_, resolution) = resolve(&inputs(vec![prod]));
        let table = &resolution.accepted[0].route_table;
        assert_eq!(table.routes().len(), 3);
        assert_eq!(table.default_routes().count(), 1);
    }

    #[test]
    fn test_attachment_subnets_inside_spoke() {
        let (_, resolution) = resolve(&inputs(vec![spoke("prod", "10.2.0.0/16")]));
        let resolved = &resolution.accepted[0];
        assert_eq!(resolved.subnets.len(), 3);
        assert_eq!(resolved.subnets[2].cidr.to_string(), "10.2.255.240/28");
        assert!(resolved.subnets.iter().all(|s| resolved.vpc.cidr.contains(s.cidr.network())));
        assert_eq!(resolved.declared_name("test"), "prod");
    }
}

//! Inspection hub construction
//!
//! Every AZ the hub spans receives the same set of resources: a firewall
//! endpoint in its firewall subnet, a NAT gateway in its public subnet and
//! three AZ-local route tables. An AZ never gets one without the other, so
//! losing an AZ never leaves a half-wired egress path behind.

use crate::firewall::FirewallPolicy;
use crate::ids::{resource_id, resource_name};
use crate::model::{
    default_route, AttachmentKind, FirewallLogging, Route, RouteTable, RouteTableKind,
    RouteTarget, Subnet, SubnetTier, Topology, TransitGatewayAttachment, Vpc,
};
use crate::{ResolveError, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq)]
pub struct NatGateway {
    pub id: String,
    pub name: String,
    pub availability_zone: String,
    pub subnet_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirewallEndpoint {
    pub id: String,
    pub availability_zone: String,
    pub subnet_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NetworkFirewall {
    pub id: String,
    pub name: String,
    pub vpc_id: String,
    pub policy_id: String,
    pub subnet_ids: Vec<String>,
}

/// Hub-side resources of the network
#[derive(Clone, Debug)]
pub struct InspectionHub {
    pub vpc: Vpc,
    pub subnets: Vec<Subnet>,
    pub internet_gateway_id: String,
    pub nat_gateways: Vec<NatGateway>,
    pub firewall_endpoints: Vec<FirewallEndpoint>,
    pub firewall: NetworkFirewall,
    pub firewall_policy: FirewallPolicy,
    pub logging: FirewallLogging,
    pub attachment: TransitGatewayAttachment,
    /// Transit gateway route table associated with the inspection attachment
    pub transit_route_table: RouteTable,
    /// AZ-local route tables inside the hub VPC
    pub vpc_route_tables: Vec<RouteTable>,
}

impl InspectionHub {
    pub fn nat_gateway_in(&self, zone: &str) -> Option<&NatGateway> {
        self.nat_gateways.iter().find(|n| n.availability_zone == zone)
    }

    pub fn firewall_endpoint_in(&self, zone: &str) -> Option<&FirewallEndpoint> {
        self.firewall_endpoints.iter().find(|e| e.availability_zone == zone)
    }

    pub fn vpc_route_table(&self, kind: RouteTableKind, zone: &str) -> Option<&RouteTable> {
        self.vpc_route_tables
            .iter()
            .find(|t| t.kind == kind && t.availability_zone.as_deref() == Some(zone))
    }

    pub fn vpc_route_table_mut(&mut self, kind: RouteTableKind, zone: &str) -> Option<&mut RouteTable> {
        self.vpc_route_tables
            .iter_mut()
            .find(|t| t.kind == kind && t.availability_zone.as_deref() == Some(zone))
    }

    /// Default egress routes installed in the hub VPC, one per AZ and table
    pub fn egress_routes(&self) -> impl Iterator<Item = (&RouteTable, &Route)> {
        self.vpc_route_tables
            .iter()
            .flat_map(|t| t.default_routes().map(move |r| (t, r)))
    }
}

/// Builds the inspection hub for a topology
pub struct InspectionHubBuilder<'a> {
    topology: &'a Topology,
}

impl<'a> InspectionHubBuilder<'a> {
    pub fn new(topology: &'a Topology) -> Self {
        Self { topology }
    }

    pub fn build(&self) -> Result<InspectionHub> {
        let topology = self.topology;
        let prefix = topology.name_prefix.as_str();
        let hub = &topology.hub;
        let zones = &hub.availability_zones;

        let firewall_subnets = self.subnets_per_zone(SubnetTier::Firewall)?;
        let public_subnets = self.subnets_per_zone(SubnetTier::Public)?;
        let private_subnets = self.subnets_per_zone(SubnetTier::Private)?;

        let internet_gateway_id = resource_id("igw", prefix, &[&hub.name]);
        let firewall_policy_id = resource_id("fwp", prefix, &["main"]);
        let firewall_policy = FirewallPolicy::new(
            firewall_policy_id.clone(),
            resource_name(prefix, &["inspection-policy"]),
            hub.id.clone(),
            &topology.firewall,
        );

        let mut nat_gateways = Vec::with_capacity(zones.len());
        let mut firewall_endpoints = Vec::with_capacity(zones.len());
        let mut vpc_route_tables = Vec::with_capacity(zones.len() * 3);

        for zone in zones {
            let firewall_subnet = firewall_subnets[zone.as_str()];
            let public_subnet = public_subnets[zone.as_str()];

            let nat = NatGateway {
                id: resource_id("nat", prefix, &["inspection", zone]),
                name: resource_name(prefix, &["nat", zone]),
                availability_zone: zone.clone(),
                subnet_id: public_subnet.id.clone(),
            };
            let endpoint = FirewallEndpoint {
                id: resource_id("vpce", prefix, &["firewall", zone]),
                availability_zone: zone.clone(),
                subnet_id: firewall_subnet.id.clone(),
            };

            let mut private_table = hub_table(prefix, RouteTableKind::HubPrivate, zone);
            private_table.insert(Route::new(
                default_route(),
                RouteTarget::FirewallEndpoint(endpoint.id.clone()),
            ))?;

            let mut firewall_table = hub_table(prefix, RouteTableKind::HubFirewall, zone);
            firewall_table.insert(Route::new(default_route(), RouteTarget::NatGateway(nat.id.clone())))?;

            let mut public_table = hub_table(prefix, RouteTableKind::HubPublic, zone);
            public_table.insert(Route::new(
                default_route(),
                RouteTarget::InternetGateway(internet_gateway_id.clone()),
            ))?;

            debug!(
                "Hub AZ {}: firewall endpoint {} in {}, NAT gateway {} in {}",
                zone, endpoint.id, firewall_subnet.cidr, nat.id, public_subnet.cidr
            );

            nat_gateways.push(nat);
            firewall_endpoints.push(endpoint);
            vpc_route_tables.extend([private_table, firewall_table, public_table]);
        }

        let attachment = TransitGatewayAttachment {
            id: resource_id("tgw-attach", prefix, &["inspection"]),
            name: resource_name(prefix, &["inspection-attachment"]),
            transit_gateway_id: topology.transit_gateway.id.clone(),
            vpc_id: hub.id.clone(),
            kind: AttachmentKind::Inspection,
            subnet_ids: zones
                .iter()
                .map(|zone| private_subnets[zone.as_str()].id.clone())
                .collect(),
            appliance_mode: true,
        };

        let transit_route_table = RouteTable::new(
            resource_id("tgw-rtb", prefix, &["shared"]),
            resource_name(prefix, &["tgw-rtb", "inspection"]),
            RouteTableKind::TransitHub,
            None,
        );

        let firewall = NetworkFirewall {
            id: resource_id("fw", prefix, &["main"]),
            name: resource_name(prefix, &["inspection-firewall"]),
            vpc_id: hub.id.clone(),
            policy_id: firewall_policy_id,
            subnet_ids: zones
                .iter()
                .map(|zone| firewall_subnets[zone.as_str()].id.clone())
                .collect(),
        };

        info!(
            "Built inspection hub {} across {} AZs (attachment {})",
            hub.name,
            zones.len(),
            attachment.id
        );

        Ok(InspectionHub {
            vpc: hub.clone(),
            subnets: topology.hub_subnets.clone(),
            internet_gateway_id,
            nat_gateways,
            firewall_endpoints,
            firewall,
            firewall_policy,
            logging: topology.logging.clone(),
            attachment,
            transit_route_table,
            vpc_route_tables,
        })
    }

    /// Exactly one subnet of the tier per hub AZ, and none outside the hub's AZs
    fn subnets_per_zone(&self, tier: SubnetTier) -> Result<BTreeMap<&'a str, &'a Subnet>> {
        let hub = &self.topology.hub;
        let zones = &hub.availability_zones;
        let subnets: Vec<&Subnet> = self.topology.hub_subnets_in(tier).collect();

        if subnets.len() < zones.len() {
            return Err(ResolveError::Topology(format!(
                "hub VPC {} has {} {} subnet(s) for {} availability zones",
                hub.name,
                subnets.len(),
                tier.as_str(),
                zones.len()
            )));
        }

        let mut by_zone = BTreeMap::new();
        for subnet in subnets {
            if !zones.contains(&subnet.availability_zone) {
                return Err(ResolveError::Topology(format!(
                    "{} subnet {} is in {}, which hub VPC {} does not span",
                    tier.as_str(),
                    subnet.cidr,
                    subnet.availability_zone,
                    hub.name
                )));
            }
            if by_zone.insert(subnet.availability_zone.as_str(), subnet).is_some() {
                return Err(ResolveError::Topology(format!(
                    "hub VPC {} has more than one {} subnet in {}",
                    hub.name,
                    tier.as_str(),
                    subnet.availability_zone
                )));
            }
        }

        for zone in zones {
            if !by_zone.contains_key(zone.as_str()) {
                return Err(ResolveError::Topology(format!(
                    "hub VPC {} has no {} subnet in {}",
                    hub.name,
                    tier.as_str(),
                    zone
                )));
            }
        }

        Ok(by_zone)
    }
}

fn hub_table(prefix: &str, kind: RouteTableKind, zone: &str) -> RouteTable {
    let label = match kind {
        RouteTableKind::HubPrivate => "private",
        RouteTableKind::HubFirewall => "firewall",
        RouteTableKind::HubPublic => "public",
        RouteTableKind::TransitHub | RouteTableKind::TransitSpoke => "transit",
    };
    RouteTable::new(
        resource_id("rtb", prefix, &["inspection", label, zone]),
        resource_name(prefix, &["inspection", label, zone]),
        kind,
        Some(zone.to_string()),
    )
}

//! Topology model: typed VPCs, subnets, gateways and route tables
//!
//! `Topology` is the in-memory graph built from a declaration. Relationships
//! are identifier references (VPC -> attachment -> route table), never owning
//! pointers, so the graph has no ownership cycles.

use crate::ids::{resource_id, resource_name};
use crate::{ResolveError, Result};
use ipnetwork::Ipv4Network;
use landing_api::{FirewallSpec, NetworkingInputs, RouteTargetSpec};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::debug;

/// Smallest subnet carved out of a VPC
pub const MAX_SUBNET_PREFIX: u8 = 28;

/// The IPv4 default route
pub fn default_route() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).expect("0.0.0.0/0 is a valid network")
}

/// Whether two CIDR blocks share at least one address
pub fn cidrs_overlap(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Parse a declared CIDR, normalizing host bits away
pub fn parse_cidr(raw: &str, context: &str) -> Result<Ipv4Network> {
    let parsed: Ipv4Network = raw.trim().parse().map_err(|e| {
        ResolveError::Configuration(format!("{}: invalid CIDR '{}': {}", context, raw, e))
    })?;
    Ipv4Network::new(parsed.network(), parsed.prefix()).map_err(|e| {
        ResolveError::Configuration(format!("{}: invalid CIDR '{}': {}", context, raw, e))
    })
}

/// Role of a VPC in the hub-and-spoke network
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VpcRole {
    Hub,
    Spoke,
}

impl fmt::Display for VpcRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpcRole::Hub => f.write_str("hub"),
            VpcRole::Spoke => f.write_str("spoke"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Vpc {
    pub id: String,
    pub name: String,
    pub cidr: Ipv4Network,
    pub availability_zones: Vec<String>,
    pub role: VpcRole,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubnetTier {
    Public,
    Private,
    Firewall,
}

impl SubnetTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetTier::Public => "public",
            SubnetTier::Private => "private",
            SubnetTier::Firewall => "firewall",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Subnet {
    pub id: String,
    pub name: String,
    pub vpc_id: String,
    pub availability_zone: String,
    pub tier: SubnetTier,
    pub cidr: Ipv4Network,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransitGateway {
    pub id: String,
    pub name: String,
    pub amazon_side_asn: u32,
    /// New attachments join the default route table automatically
    pub default_route_table_association: bool,
    /// New attachments propagate into the default route table automatically
    pub default_route_table_propagation: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentKind {
    /// The hub VPC's attachment
    Inspection,
    Spoke,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransitGatewayAttachment {
    pub id: String,
    pub name: String,
    pub transit_gateway_id: String,
    pub vpc_id: String,
    pub kind: AttachmentKind,
    pub subnet_ids: Vec<String>,
    /// Keeps both directions of a flow on the same AZ's firewall endpoint
    pub appliance_mode: bool,
}

/// Where a route sends matching traffic
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    Attachment(String),
    TransitGateway(String),
    FirewallEndpoint(String),
    NatGateway(String),
    InternetGateway(String),
    Blackhole,
}

impl RouteTarget {
    pub fn id(&self) -> Option<&str> {
        match self {
            RouteTarget::Attachment(id)
            | RouteTarget::TransitGateway(id)
            | RouteTarget::FirewallEndpoint(id)
            | RouteTarget::NatGateway(id)
            | RouteTarget::InternetGateway(id) => Some(id),
            RouteTarget::Blackhole => None,
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Attachment(id)
            | RouteTarget::TransitGateway(id)
            | RouteTarget::FirewallEndpoint(id)
            | RouteTarget::NatGateway(id)
            | RouteTarget::InternetGateway(id) => f.write_str(id),
            RouteTarget::Blackhole => f.write_str("blackhole"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOrigin {
    Static,
    Propagated,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub destination: Ipv4Network,
    pub target: RouteTarget,
    pub origin: RouteOrigin,
}

impl Route {
    pub fn new(destination: Ipv4Network, target: RouteTarget) -> Self {
        Self {
            destination,
            target,
            origin: RouteOrigin::Static,
        }
    }

    pub fn propagated(destination: Ipv4Network, target: RouteTarget) -> Self {
        Self {
            destination,
            target,
            origin: RouteOrigin::Propagated,
        }
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteTableKind {
    /// Transit gateway table associated with the inspection attachment
    TransitHub,
    /// Transit gateway table associated with one spoke attachment
    TransitSpoke,
    /// Hub VPC table of the AZ-local transit gateway subnet
    HubPrivate,
    /// Hub VPC table of the AZ-local firewall subnet
    HubFirewall,
    /// Hub VPC table of the AZ-local public subnet
    HubPublic,
}

/// Ordered set of routes, unique by destination
#[derive(Clone, Debug, PartialEq)]
pub struct RouteTable {
    pub id: String,
    pub name: String,
    pub kind: RouteTableKind,
    pub availability_zone: Option<String>,
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(id: String, name: String, kind: RouteTableKind, availability_zone: Option<String>) -> Self {
        Self {
            id,
            name,
            kind,
            availability_zone,
            routes: Vec::new(),
        }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Insert a route. Re-inserting an identical destination and target is a
    /// no-op; a different target for an existing destination is rejected.
    pub fn insert(&mut self, route: Route) -> Result<()> {
        if let Some(existing) = self.route_for(&route.destination) {
            if existing.target == route.target {
                return Ok(());
            }
            return Err(ResolveError::Topology(format!(
                "route table {} already routes {} to {}, refusing {}",
                self.id, route.destination, existing.target, route.target
            )));
        }
        self.routes.push(route);
        Ok(())
    }

    pub fn route_for(&self, destination: &Ipv4Network) -> Option<&Route> {
        self.routes.iter().find(|r| &r.destination == destination)
    }

    pub fn default_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().filter(|r| r.is_default())
    }

    /// Remove every route pointing at the given target id, returning how many were removed
    pub fn remove_target(&mut self, target_id: &str) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| r.target.id() != Some(target_id));
        before - self.routes.len()
    }

    /// Remove the route for an exact destination
    pub fn remove_destination(&mut self, destination: &Ipv4Network) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| &r.destination != destination);
        before != self.routes.len()
    }
}

/// Firewall log destinations, passed through untouched
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FirewallLogging {
    pub log_bucket_name: String,
    pub kms_key_id: String,
    pub sns_topic_arn: String,
}

/// Static route declared by a spoke
#[derive(Clone, Debug, PartialEq)]
pub struct DeclaredRoute {
    pub destination: Ipv4Network,
    pub target: RouteTargetSpec,
}

/// Declared VPC before it is placed in a topology
#[derive(Clone, Debug, PartialEq)]
pub struct VpcDeclaration {
    pub name: String,
    pub cidr: String,
    pub role: VpcRole,
    pub availability_zones: Vec<String>,
    pub static_routes: Vec<(String, RouteTargetSpec)>,
}

/// A declared spoke VPC waiting for attachment resolution
#[derive(Clone, Debug, PartialEq)]
pub struct SpokeVpc {
    pub vpc: Vpc,
    pub static_routes: Vec<DeclaredRoute>,
}

/// The declared topology: one hub, its subnets, the transit gateway and the
/// spokes in declaration order
#[derive(Clone, Debug)]
pub struct Topology {
    pub name_prefix: String,
    pub hub: Vpc,
    pub hub_subnets: Vec<Subnet>,
    pub spokes: Vec<SpokeVpc>,
    pub transit_gateway: TransitGateway,
    pub firewall: FirewallSpec,
    pub logging: FirewallLogging,
}

impl Topology {
    /// Build the topology from the landing zone inputs
    pub fn from_inputs(inputs: &NetworkingInputs) -> Result<Self> {
        let mut declarations = Vec::with_capacity(inputs.spokes.len() + 1);
        declarations.push(VpcDeclaration {
            name: "inspection".to_string(),
            cidr: inputs.inspection_vpc_cidr.clone(),
            role: VpcRole::Hub,
            availability_zones: inputs.availability_zones.clone(),
            static_routes: Vec::new(),
        });

        for spoke in &inputs.spokes {
            declarations.push(VpcDeclaration {
                name: spoke.name.clone(),
                cidr: spoke.cidr.clone(),
                role: VpcRole::Spoke,
                availability_zones: inputs.spoke_availability_zones(spoke).to_vec(),
                static_routes: spoke
                    .static_routes
                    .iter()
                    .map(|r| (r.destination.clone(), r.target.clone()))
                    .collect(),
            });
        }

        let firewall_subnets = inputs
            .firewall_subnets
            .iter()
            .map(|s| (s.availability_zone.clone(), s.cidr.clone()))
            .collect::<Vec<_>>();

        let mut topology = Self::from_declarations(
            &inputs.name_prefix,
            declarations,
            &firewall_subnets,
            inputs.transit_gateway_asn,
        )?;
        topology.firewall = inputs.firewall.clone();
        topology.logging = FirewallLogging {
            log_bucket_name: inputs.log_bucket_name.clone(),
            kms_key_id: inputs.kms_key_id.clone(),
            sns_topic_arn: inputs.sns_topic_arn.clone(),
        };
        Ok(topology)
    }

    /// Build the topology from generic VPC declarations. Exactly one
    /// declaration must have role `hub`. Explicit firewall subnets replace
    /// the carved ones.
    pub fn from_declarations(
        name_prefix: &str,
        declarations: Vec<VpcDeclaration>,
        firewall_subnets: &[(String, String)],
        transit_gateway_asn: u32,
    ) -> Result<Self> {
        if name_prefix.trim().is_empty() {
            return Err(ResolveError::Configuration("name_prefix must not be empty".to_string()));
        }

        let hub_count = declarations.iter().filter(|d| d.role == VpcRole::Hub).count();
        if hub_count == 0 {
            return Err(ResolveError::Configuration("no VPC declares role hub".to_string()));
        }
        if hub_count > 1 {
            return Err(ResolveError::Configuration(format!(
                "{} VPCs declare role hub, exactly one is allowed",
                hub_count
            )));
        }

        // The hub and the spokes are named in separate namespaces
        let mut spoke_names = BTreeSet::new();
        let mut hub = None;
        let mut spokes = Vec::new();

        for declaration in declarations {
            if declaration.name.trim().is_empty() {
                return Err(ResolveError::Configuration("VPC name must not be empty".to_string()));
            }
            if declaration.role == VpcRole::Spoke && !spoke_names.insert(declaration.name.clone()) {
                return Err(ResolveError::Configuration(format!(
                    "spoke VPC name '{}' is declared more than once",
                    declaration.name
                )));
            }

            let context = format!("{} VPC '{}'", declaration.role, declaration.name);
            let cidr = parse_cidr(&declaration.cidr, &context)?;
            let availability_zones = check_zones(&declaration.availability_zones, &context)?;

            let role = declaration.role.to_string();
            let vpc = Vpc {
                id: resource_id("vpc", name_prefix, &[&role, &declaration.name]),
                name: resource_name(name_prefix, &[&declaration.name]),
                cidr,
                availability_zones,
                role: declaration.role,
            };

            match declaration.role {
                VpcRole::Hub => hub = Some(vpc),
                VpcRole::Spoke => {
                    let static_routes = declaration
                        .static_routes
                        .iter()
                        .map(|(destination, target)| {
                            Ok(DeclaredRoute {
                                destination: parse_cidr(destination, &context)?,
                                target: target.clone(),
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    spokes.push(SpokeVpc { vpc, static_routes });
                }
            }
        }

        let hub = hub.ok_or_else(|| ResolveError::Configuration("no VPC declares role hub".to_string()))?;
        let hub_subnets = carve_hub_subnets(name_prefix, &hub, firewall_subnets)?;

        let transit_gateway = TransitGateway {
            id: resource_id("tgw", name_prefix, &["main"]),
            name: resource_name(name_prefix, &["tgw"]),
            amazon_side_asn: transit_gateway_asn,
            default_route_table_association: false,
            default_route_table_propagation: false,
        };

        debug!(
            "Built topology {}: hub {} ({}), {} spokes, {} hub subnets",
            name_prefix,
            hub.name,
            hub.cidr,
            spokes.len(),
            hub_subnets.len()
        );

        Ok(Self {
            name_prefix: name_prefix.to_string(),
            hub,
            hub_subnets,
            spokes,
            transit_gateway,
            firewall: FirewallSpec::default(),
            logging: FirewallLogging::default(),
        })
    }

    pub fn hub_subnets_in(&self, tier: SubnetTier) -> impl Iterator<Item = &Subnet> {
        self.hub_subnets.iter().filter(move |s| s.tier == tier)
    }
}

fn check_zones(zones: &[String], context: &str) -> Result<Vec<String>> {
    if zones.is_empty() {
        return Err(ResolveError::Configuration(format!(
            "{}: availability zone list is empty",
            context
        )));
    }
    let mut seen = BTreeSet::new();
    for zone in zones {
        if zone.trim().is_empty() {
            return Err(ResolveError::Configuration(format!(
                "{}: availability zone name is empty",
                context
            )));
        }
        if !seen.insert(zone.as_str()) {
            return Err(ResolveError::Configuration(format!(
                "{}: availability zone '{}' is listed twice",
                context, zone
            )));
        }
    }
    Ok(zones.to_vec())
}

/// Split `parent` into equal blocks of `prefix` and return block `index`
pub fn nth_subnet(parent: &Ipv4Network, prefix: u8, index: u32) -> Option<Ipv4Network> {
    if prefix < parent.prefix() || prefix > 32 {
        return None;
    }
    let shift = u32::from(prefix - parent.prefix());
    if shift < 32 && index >= (1u32 << shift) {
        return None;
    }
    let block = 1u64 << (32 - u32::from(prefix));
    let base = u64::from(u32::from(parent.network()));
    let address = base + block * u64::from(index);
    let address = u32::try_from(address).ok()?;
    Ipv4Network::new(Ipv4Addr::from(address), prefix).ok()
}

/// Number of extra prefix bits needed to hold `slots` equal subnets
pub fn bits_for(slots: usize) -> u8 {
    let mut bits = 0u8;
    while (1usize << bits) < slots {
        bits += 1;
    }
    bits
}

/// Lay out the hub's public, private (transit gateway) and firewall subnets.
/// Slots are allocated tier by tier: public first, then private, then firewall.
fn carve_hub_subnets(
    name_prefix: &str,
    hub: &Vpc,
    firewall_subnets: &[(String, String)],
) -> Result<Vec<Subnet>> {
    let zones = &hub.availability_zones;
    let tiers: &[SubnetTier] = if firewall_subnets.is_empty() {
        &[SubnetTier::Public, SubnetTier::Private, SubnetTier::Firewall]
    } else {
        &[SubnetTier::Public, SubnetTier::Private]
    };

    let prefix = hub.cidr.prefix() + bits_for(zones.len() * 3);
    if prefix > MAX_SUBNET_PREFIX {
        return Err(ResolveError::Configuration(format!(
            "hub CIDR {} is too small for {} availability zones",
            hub.cidr,
            zones.len()
        )));
    }

    let mut subnets = Vec::new();
    for (tier_index, tier) in tiers.iter().enumerate() {
        for (zone_index, zone) in zones.iter().enumerate() {
            let slot = (tier_index * zones.len() + zone_index) as u32;
            let cidr = nth_subnet(&hub.cidr, prefix, slot).ok_or_else(|| {
                ResolveError::Configuration(format!("hub CIDR {} cannot hold slot {}", hub.cidr, slot))
            })?;
            subnets.push(hub_subnet(name_prefix, hub, zone, *tier, cidr));
        }
    }

    for (zone, raw) in firewall_subnets {
        let cidr = parse_cidr(raw, &format!("firewall subnet in {}", zone))?;
        if !hub.cidr.contains(cidr.network()) || cidr.prefix() < hub.cidr.prefix() {
            return Err(ResolveError::Configuration(format!(
                "firewall subnet {} is outside hub CIDR {}",
                cidr, hub.cidr
            )));
        }
        subnets.push(hub_subnet(name_prefix, hub, zone, SubnetTier::Firewall, cidr));
    }

    for (i, a) in subnets.iter().enumerate() {
        for b in &subnets[i + 1..] {
            if cidrs_overlap(&a.cidr, &b.cidr) {
                return Err(ResolveError::Configuration(format!(
                    "hub subnets {} ({}) and {} ({}) overlap",
                    a.name, a.cidr, b.name, b.cidr
                )));
            }
        }
    }

    Ok(subnets)
}

fn hub_subnet(name_prefix: &str, hub: &Vpc, zone: &str, tier: SubnetTier, cidr: Ipv4Network) -> Subnet {
    let cidr_text = cidr.to_string();
    Subnet {
        id: resource_id("subnet", name_prefix, &[&hub.name, tier.as_str(), zone, &cidr_text]),
        name: resource_name(name_prefix, &["inspection", tier.as_str(), zone]),
        vpc_id: hub.id.clone(),
        availability_zone: zone.to_string(),
        tier,
        cidr,
    }
}

//! Plan rendering
//!
//! A plan lists every resource of a validated topology by its address in the
//! provisioning engine's vocabulary (`aws_nat_gateway.inspection["az"]`).
//! Resources are grouped for apply: shared hub resources first, then one
//! group per spoke, then organization policy attachments.

use crate::{PlanError, Result};
use chrono::{DateTime, Utc};
use landing_core::firewall::{StatefulAction, StatefulRule};
use landing_api::v1alpha1::API_VERSION;
use landing_core::model::{Route, RouteOrigin, RouteTableKind, RouteTarget};
use landing_core::ValidatedTopology;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum ApplyGroup {
    Shared,
    Spoke(String),
    Governance,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedResource {
    pub address: String,
    pub resource_type: String,
    pub group: ApplyGroup,
    pub attributes: Value,
}

impl PlannedResource {
    /// Address without the instance key: `aws_nat_gateway.inspection`
    pub fn base_address(&self) -> &str {
        self.address.split('[').next().unwrap_or(&self.address)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub api_version: String,
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub name_prefix: String,
    pub resources: Vec<PlannedResource>,
}

impl Plan {
    /// Render a plan for a validated topology and the (ou, policy) pairs of
    /// the organization's service control policies
    pub fn build(validated: &ValidatedTopology, policy_attachments: &[(String, String)]) -> Result<Self> {
        let routed = validated.topology();
        let mut builder = PlanBuilder::default();

        render_hub(&mut builder, validated)?;

        for spoke in &routed.spokes {
            let name = spoke.declared_name(&routed.name_prefix);
            let group = ApplyGroup::Spoke(name.clone());

            builder.push(
                format!("aws_vpc.spoke[\"{}\"]", name),
                &group,
                json!({
                    "id": spoke.vpc.id,
                    "name": spoke.vpc.name,
                    "cidr_block": spoke.vpc.cidr.to_string(),
                }),
            )?;
            for subnet in &spoke.subnets {
                builder.push(
                    format!("aws_subnet.spoke[\"{}-{}\"]", name, subnet.availability_zone),
                    &group,
                    json!({
                        "id": subnet.id,
                        "vpc_id": subnet.vpc_id,
                        "cidr_block": subnet.cidr.to_string(),
                        "availability_zone": subnet.availability_zone,
                    }),
                )?;
            }
            builder.push(
                format!("aws_ec2_transit_gateway_vpc_attachment.spoke[\"{}\"]", name),
                &group,
                json!({
                    "id": spoke.attachment.id,
                    "transit_gateway_id": spoke.attachment.transit_gateway_id,
                    "vpc_id": spoke.attachment.vpc_id,
                    "subnet_ids": spoke.attachment.subnet_ids,
                    "transit_gateway_default_route_table_association": false,
                    "transit_gateway_default_route_table_propagation": false,
                }),
            )?;
            builder.push(
                format!("aws_ec2_transit_gateway_route_table.spoke[\"{}\"]", name),
                &group,
                json!({
                    "id": spoke.route_table.id,
                    "transit_gateway_id": routed.transit_gateway.id,
                }),
            )?;
            builder.push(
                format!("aws_ec2_transit_gateway_route_table_association.spoke[\"{}\"]", name),
                &group,
                json!({
                    "transit_gateway_attachment_id": spoke.attachment.id,
                    "transit_gateway_route_table_id": spoke.route_table.id,
                }),
            )?;
            for route in static_routes(spoke.route_table.routes()) {
                builder.push(
                    format!("aws_ec2_transit_gateway_route.spoke[\"{}-{}\"]", name, route.destination),
                    &group,
                    transit_route_attributes(&spoke.route_table.id, route),
                )?;
            }
            builder.push(
                format!("aws_ec2_transit_gateway_route_table_propagation.spoke[\"{}\"]", name),
                &group,
                json!({
                    "transit_gateway_attachment_id": spoke.attachment.id,
                    "transit_gateway_route_table_id": routed.hub.transit_route_table.id,
                }),
            )?;
        }

        for (ou, policy) in policy_attachments {
            builder.push(
                format!("aws_organizations_policy_attachment.scp[\"{}/{}\"]", ou, policy),
                &ApplyGroup::Governance,
                json!({ "target_id": ou, "policy_id": policy }),
            )?;
        }

        let plan = Self {
            api_version: API_VERSION.to_string(),
            id: Uuid::new_v4(),
            generated_at: Utc::now(),
            name_prefix: routed.name_prefix.clone(),
            resources: builder.resources,
        };
        info!("Rendered plan {} with {} resource(s)", plan.id, plan.resources.len());
        Ok(plan)
    }

    pub fn resource(&self, address: &str) -> Option<&PlannedResource> {
        self.resources.iter().find(|r| r.address == address)
    }

    /// Whether any instance of `base_address` is planned
    pub fn contains(&self, base_address: &str) -> bool {
        self.resources.iter().any(|r| r.base_address() == base_address)
    }

    /// Resources per apply group, each group in plan order
    pub fn groups(&self) -> BTreeMap<&ApplyGroup, Vec<&PlannedResource>> {
        let mut groups: BTreeMap<&ApplyGroup, Vec<&PlannedResource>> = BTreeMap::new();
        for resource in &self.resources {
            groups.entry(&resource.group).or_default().push(resource);
        }
        groups
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Default)]
struct PlanBuilder {
    resources: Vec<PlannedResource>,
    seen: BTreeSet<String>,
}

impl PlanBuilder {
    fn push(&mut self, address: String, group: &ApplyGroup, attributes: Value) -> Result<()> {
        if !self.seen.insert(address.clone()) {
            return Err(PlanError::DuplicateAddress(address));
        }
        let resource_type = address.split('.').next().unwrap_or_default().to_string();
        self.resources.push(PlannedResource {
            address,
            resource_type,
            group: group.clone(),
            attributes,
        });
        Ok(())
    }
}

fn render_hub(builder: &mut PlanBuilder, validated: &ValidatedTopology) -> Result<()> {
    let routed = validated.topology();
    let hub = &routed.hub;
    let tgw = &routed.transit_gateway;
    let shared = ApplyGroup::Shared;

    builder.push(
        "aws_ec2_transit_gateway.main".to_string(),
        &shared,
        json!({
            "id": tgw.id,
            "name": tgw.name,
            "amazon_side_asn": tgw.amazon_side_asn,
            "default_route_table_association": enable(tgw.default_route_table_association),
            "default_route_table_propagation": enable(tgw.default_route_table_propagation),
        }),
    )?;
    builder.push(
        "aws_vpc.inspection".to_string(),
        &shared,
        json!({
            "id": hub.vpc.id,
            "name": hub.vpc.name,
            "cidr_block": hub.vpc.cidr.to_string(),
        }),
    )?;
    builder.push(
        "aws_internet_gateway.inspection".to_string(),
        &shared,
        json!({ "id": hub.internet_gateway_id, "vpc_id": hub.vpc.id }),
    )?;

    for subnet in &hub.subnets {
        builder.push(
            format!("aws_subnet.inspection[\"{}-{}\"]", subnet.tier.as_str(), subnet.availability_zone),
            &shared,
            json!({
                "id": subnet.id,
                "vpc_id": subnet.vpc_id,
                "cidr_block": subnet.cidr.to_string(),
                "availability_zone": subnet.availability_zone,
            }),
        )?;
    }

    for nat in &hub.nat_gateways {
        builder.push(
            format!("aws_nat_gateway.inspection[\"{}\"]", nat.availability_zone),
            &shared,
            json!({
                "id": nat.id,
                "subnet_id": nat.subnet_id,
                "availability_zone": nat.availability_zone,
            }),
        )?;
    }

    let policy = &hub.firewall_policy;
    let stateless = policy.stateless_groups();
    let stateful = policy.stateful_groups();
    for group in &stateless {
        let rules: Vec<Value> = group
            .rules
            .iter()
            .map(|r| {
                json!({
                    "priority": r.priority,
                    "source": r.source.to_string(),
                    "destination": r.destination.to_string(),
                    "actions": [r.action.as_aws()],
                })
            })
            .collect();
        builder.push(
            format!("aws_networkfirewall_rule_group.stateless[\"{}\"]", group.name),
            &shared,
            json!({ "name": group.name, "type": "STATELESS", "rules": rules }),
        )?;
    }
    for group in &stateful {
        let rules: Vec<Value> = group.rules.iter().map(stateful_rule).collect();
        builder.push(
            format!("aws_networkfirewall_rule_group.stateful[\"{}\"]", group.name),
            &shared,
            json!({ "name": group.name, "type": "STATEFUL", "rules": rules }),
        )?;
    }

    let default_action = policy.stateless_default_action().as_aws();
    builder.push(
        "aws_networkfirewall_firewall_policy.main".to_string(),
        &shared,
        json!({
            "id": policy.id,
            "name": policy.name,
            "stateless_default_actions": [default_action],
            "stateless_fragment_default_actions": [default_action],
            "stateless_rule_group_references": stateless.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
            "stateful_rule_group_references": stateful.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
        }),
    )?;

    let endpoints: BTreeMap<&str, &str> = hub
        .firewall_endpoints
        .iter()
        .map(|e| (e.availability_zone.as_str(), e.id.as_str()))
        .collect();
    builder.push(
        "aws_networkfirewall_firewall.main".to_string(),
        &shared,
        json!({
            "id": hub.firewall.id,
            "name": hub.firewall.name,
            "vpc_id": hub.firewall.vpc_id,
            "firewall_policy_id": hub.firewall.policy_id,
            "subnet_mapping": hub.firewall.subnet_ids,
            "endpoints": endpoints,
        }),
    )?;
    builder.push(
        "aws_networkfirewall_logging_configuration.main".to_string(),
        &shared,
        json!({
            "firewall_id": hub.firewall.id,
            "log_destination": { "bucketName": hub.logging.log_bucket_name },
            "kms_key_id": hub.logging.kms_key_id,
            "sns_topic_arn": hub.logging.sns_topic_arn,
        }),
    )?;

    for table in &hub.vpc_route_tables {
        let key = format!(
            "{}-{}",
            vpc_table_key(table.kind),
            table.availability_zone.as_deref().unwrap_or("regional")
        );
        builder.push(
            format!("aws_route_table.inspection[\"{}\"]", key),
            &shared,
            json!({
                "id": table.id,
                "name": table.name,
                "vpc_id": hub.vpc.id,
                "availability_zone": table.availability_zone,
            }),
        )?;
        for route in table.routes() {
            builder.push(
                format!("aws_route.inspection[\"{}-{}\"]", key, route.destination),
                &shared,
                vpc_route_attributes(&table.id, route),
            )?;
        }
    }

    builder.push(
        "aws_ec2_transit_gateway_vpc_attachment.inspection".to_string(),
        &shared,
        json!({
            "id": hub.attachment.id,
            "transit_gateway_id": hub.attachment.transit_gateway_id,
            "vpc_id": hub.attachment.vpc_id,
            "subnet_ids": hub.attachment.subnet_ids,
            "appliance_mode_support": enable(hub.attachment.appliance_mode),
            "transit_gateway_default_route_table_association": false,
            "transit_gateway_default_route_table_propagation": false,
        }),
    )?;
    builder.push(
        "aws_ec2_transit_gateway_route_table.shared".to_string(),
        &shared,
        json!({
            "id": hub.transit_route_table.id,
            "transit_gateway_id": tgw.id,
        }),
    )?;
    builder.push(
        "aws_ec2_transit_gateway_route_table_association.inspection".to_string(),
        &shared,
        json!({
            "transit_gateway_attachment_id": hub.attachment.id,
            "transit_gateway_route_table_id": hub.transit_route_table.id,
        }),
    )?;
    for route in static_routes(hub.transit_route_table.routes()) {
        builder.push(
            format!("aws_ec2_transit_gateway_route.shared[\"{}\"]", route.destination),
            &shared,
            transit_route_attributes(&hub.transit_route_table.id, route),
        )?;
    }
    Ok(())
}

/// Propagated routes come from the propagation resources, not from a route
fn static_routes(routes: &[Route]) -> impl Iterator<Item = &Route> {
    routes.iter().filter(|r| r.origin == RouteOrigin::Static)
}

fn enable(flag: bool) -> &'static str {
    if flag {
        "enable"
    } else {
        "disable"
    }
}

fn vpc_table_key(kind: RouteTableKind) -> &'static str {
    match kind {
        RouteTableKind::HubPrivate => "private",
        RouteTableKind::HubFirewall => "firewall",
        RouteTableKind::HubPublic => "public",
        RouteTableKind::TransitHub => "transit-hub",
        RouteTableKind::TransitSpoke => "transit-spoke",
    }
}

fn stateful_rule(rule: &StatefulRule) -> Value {
    match rule {
        StatefulRule::Flow {
            action,
            source,
            destination,
        } => json!({
            "action": match action {
                StatefulAction::Pass => "PASS",
                StatefulAction::Drop => "DROP",
            },
            "protocol": "IP",
            "source": source.to_string(),
            "destination": destination.to_string(),
        }),
        StatefulRule::DomainAllowlist { domains } => json!({
            "generated_rules_type": "ALLOWLIST",
            "target_types": ["TLS_SNI", "HTTP_HOST"],
            "targets": domains,
        }),
    }
}

fn vpc_route_attributes(table_id: &str, route: &Route) -> Value {
    let mut attributes = Map::new();
    attributes.insert("route_table_id".into(), json!(table_id));
    attributes.insert("destination_cidr_block".into(), json!(route.destination.to_string()));
    let (key, value) = match &route.target {
        RouteTarget::TransitGateway(id) => ("transit_gateway_id", json!(id)),
        RouteTarget::FirewallEndpoint(id) => ("vpc_endpoint_id", json!(id)),
        RouteTarget::NatGateway(id) => ("nat_gateway_id", json!(id)),
        RouteTarget::InternetGateway(id) => ("gateway_id", json!(id)),
        RouteTarget::Attachment(id) => ("transit_gateway_attachment_id", json!(id)),
        RouteTarget::Blackhole => ("blackhole", json!(true)),
    };
    attributes.insert(key.into(), value);
    Value::Object(attributes)
}

fn transit_route_attributes(table_id: &str, route: &Route) -> Value {
    let mut attributes = Map::new();
    attributes.insert("transit_gateway_route_table_id".into(), json!(table_id));
    attributes.insert("destination_cidr_block".into(), json!(route.destination.to_string()));
    match &route.target {
        RouteTarget::Blackhole => {
            attributes.insert("blackhole".into(), json!(true));
        }
        target => {
            attributes.insert("transit_gateway_attachment_id".into(), json!(target.to_string()));
        }
    }
    Value::Object(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use landing_api::{NetworkingInputs, RouteTargetSpec, SpokeSpec, StaticRouteSpec};
    use pretty_assertions::assert_eq;

    fn validated(spokes: Vec<SpokeSpec>) -> ValidatedTopology {
        let inputs = NetworkingInputs {
            name_prefix: "lz".into(),
            inspection_vpc_cidr: "10.0.0.0/16".into(),
            availability_zones: vec!["ap-southeast-2a".into(), "ap-southeast-2b".into()],
            spokes,
            log_bucket_name: "lz-logs".into(),
            kms_key_id: "arn:aws:kms:ap-southeast-2:123456789012:key/lz".into(),
            sns_topic_arn: "arn:aws:sns:ap-southeast-2:123456789012:lz".into(),
            transit_gateway_asn: 64512,
            ..Default::default()
        };
        landing_core::resolve(&inputs).unwrap().into_validated().unwrap()
    }

    fn spoke(name: &str, cidr: &str) -> SpokeSpec {
        SpokeSpec {
            name: name.into(),
            cidr: cidr.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_contains_network_resources() {
        let plan = Plan::build(&validated(vec![spoke("nonprod", "10.1.0.0/16")]), &[]).unwrap();

        for address in [
            "aws_ec2_transit_gateway.main",
            "aws_ec2_transit_gateway_route_table.shared",
            "aws_networkfirewall_firewall.main",
            "aws_networkfirewall_firewall_policy.main",
            "aws_nat_gateway.inspection",
            "aws_networkfirewall_logging_configuration.main",
        ] {
            assert!(plan.contains(address), "missing {}", address);
        }
        assert!(!plan.contains("aws_organizations_policy_attachment.scp"));

        let nat = plan.resource("aws_nat_gateway.inspection[\"ap-southeast-2b\"]").unwrap();
        assert_eq!(nat.resource_type, "aws_nat_gateway");
        assert_eq!(nat.group, ApplyGroup::Shared);
    }

    #[test]
    fn test_spoke_resources_grouped() {
        let plan = Plan::build(
            &validated(vec![spoke("nonprod", "10.1.0.0/16"), spoke("prod", "10.2.0.0/16")]),
            &[("ou-prod".to_string(), "p-denyroot".to_string())],
        )
        .unwrap();

        let groups = plan.groups();
        assert_eq!(groups.len(), 4);
        let prod = &groups[&ApplyGroup::Spoke("prod".to_string())];
        assert!(prod
            .iter()
            .any(|r| r.address == "aws_ec2_transit_gateway_route.spoke[\"prod-0.0.0.0/0\"]"));
        assert_eq!(groups[&ApplyGroup::Governance].len(), 1);
        assert!(plan.contains("aws_organizations_policy_attachment.scp"));
    }

    #[test]
    fn test_blackhole_route_rendered() {
        let mut nonprod = spoke("nonprod", "10.1.0.0/16");
        nonprod.static_routes = vec![StaticRouteSpec {
            destination: "192.168.0.0/16".into(),
            target: RouteTargetSpec::Blackhole,
        }];
        let plan = Plan::build(&validated(vec![nonprod]), &[]).unwrap();

        let route = plan
            .resource("aws_ec2_transit_gateway_route.spoke[\"nonprod-192.168.0.0/16\"]")
            .unwrap();
        assert_eq!(route.attributes["blackhole"], json!(true));
    }

    #[test]
    fn test_firewall_policy_default_deny() {
        let plan = Plan::build(&validated(vec![spoke("nonprod", "10.1.0.0/16")]), &[]).unwrap();
        let policy = plan.resource("aws_networkfirewall_firewall_policy.main").unwrap();
        assert_eq!(policy.attributes["stateless_default_actions"], json!(["aws:drop"]));
    }

    #[test]
    fn test_propagated_routes_not_rendered_as_static() {
        let validated = validated(vec![spoke("nonprod", "10.1.0.0/16"), spoke("prod", "10.2.0.0/16")]);
        assert_eq!(validated.topology().hub.transit_route_table.routes().len(), 2);

        let plan = Plan::build(&validated, &[]).unwrap();
        assert!(!plan.contains("aws_ec2_transit_gateway_route.shared"));
        assert!(plan.contains("aws_ec2_transit_gateway_route_table_propagation.spoke"));
        assert!(plan.contains("aws_ec2_transit_gateway_route.spoke"));
    }

    #[test]
    fn test_plan_serializes() {
        let plan = Plan::build(&validated(vec![]), &[]).unwrap();
        let json = plan.to_json().unwrap();
        let parsed: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, plan.id);
        assert_eq!(parsed.api_version, API_VERSION);
        assert_eq!(parsed.resources.len(), plan.resources.len());
    }
}

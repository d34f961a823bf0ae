//! Two-phase transit gateway routing
//!
//! Phase 1 associates every attachment with its route table: the inspection
//! attachment with the hub table, each spoke attachment with its own table.
//! Phase 2 propagates spoke CIDRs into the hub table and installs the hub VPC
//! return routes. Phase 2 is only reachable through a successful phase 1
//! (`PropagationEngine::associate` -> `AssociatedRouting::propagate`), and a
//! spoke can only be propagated once its association is recorded.

use crate::hub::InspectionHub;
use crate::model::{Route, RouteTableKind, RouteTarget, TransitGateway};
use crate::spoke::ResolvedSpoke;
use crate::{ResolveError, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Attachment to route table associations, keyed by attachment id
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssociationLedger {
    associations: BTreeMap<String, String>,
}

impl AssociationLedger {
    /// Record an association. An attachment belongs to at most one table.
    pub fn commit(&mut self, attachment_id: &str, route_table_id: &str) -> Result<()> {
        match self.associations.get(attachment_id) {
            Some(existing) if existing == route_table_id => Ok(()),
            Some(existing) => Err(ResolveError::Topology(format!(
                "attachment {} is already associated with route table {}, cannot associate with {}",
                attachment_id, existing, route_table_id
            ))),
            None => {
                self.associations
                    .insert(attachment_id.to_string(), route_table_id.to_string());
                Ok(())
            }
        }
    }

    pub fn route_table_of(&self, attachment_id: &str) -> Option<&str> {
        self.associations.get(attachment_id).map(|s| s.as_str())
    }

    pub fn release(&mut self, attachment_id: &str) -> Option<String> {
        self.associations.remove(attachment_id)
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.associations.iter().map(|(a, t)| (a.as_str(), t.as_str()))
    }
}

/// A spoke CIDR made visible on a route table through an attachment
#[derive(Clone, Debug, PartialEq)]
pub struct Propagation {
    pub attachment_id: String,
    pub route_table_id: String,
    pub cidr: ipnetwork::Ipv4Network,
}

/// Routing inputs before phase 1
pub struct PropagationEngine {
    name_prefix: String,
    transit_gateway: TransitGateway,
    hub: InspectionHub,
    spokes: Vec<ResolvedSpoke>,
}

impl PropagationEngine {
    pub fn new(
        name_prefix: &str,
        transit_gateway: TransitGateway,
        hub: InspectionHub,
        spokes: Vec<ResolvedSpoke>,
    ) -> Self {
        Self {
            name_prefix: name_prefix.to_string(),
            transit_gateway,
            hub,
            spokes,
        }
    }

    /// Phase 1: associate every attachment with its route table. Any failure
    /// aborts before a single route is propagated.
    pub fn associate(self) -> Result<AssociatedRouting> {
        let mut ledger = AssociationLedger::default();

        check_owner(&self.transit_gateway, &self.hub.attachment.transit_gateway_id, &self.hub.attachment.id)?;
        ledger.commit(&self.hub.attachment.id, &self.hub.transit_route_table.id)?;

        for spoke in &self.spokes {
            check_owner(&self.transit_gateway, &spoke.attachment.transit_gateway_id, &spoke.attachment.id)?;
            if spoke.route_table.id == self.hub.transit_route_table.id {
                return Err(ResolveError::Topology(format!(
                    "spoke attachment {} cannot share the hub route table",
                    spoke.attachment.id
                )));
            }
            ledger.commit(&spoke.attachment.id, &spoke.route_table.id)?;
        }

        debug!("Committed {} transit gateway associations", ledger.len());

        Ok(AssociatedRouting {
            name_prefix: self.name_prefix,
            transit_gateway: self.transit_gateway,
            hub: self.hub,
            spokes: self.spokes,
            ledger,
        })
    }
}

fn check_owner(transit_gateway: &TransitGateway, owner: &str, attachment_id: &str) -> Result<()> {
    if owner != transit_gateway.id {
        return Err(ResolveError::Topology(format!(
            "attachment {} belongs to transit gateway {}, expected {}",
            attachment_id, owner, transit_gateway.id
        )));
    }
    Ok(())
}

/// Routing after phase 1
pub struct AssociatedRouting {
    name_prefix: String,
    transit_gateway: TransitGateway,
    hub: InspectionHub,
    spokes: Vec<ResolvedSpoke>,
    ledger: AssociationLedger,
}

impl AssociatedRouting {
    pub fn ledger(&self) -> &AssociationLedger {
        &self.ledger
    }

    /// Phase 2: propagate every spoke into the hub side
    pub fn propagate(self) -> Result<RoutedTopology> {
        let mut routed = RoutedTopology {
            name_prefix: self.name_prefix,
            transit_gateway: self.transit_gateway,
            hub: self.hub,
            spokes: Vec::with_capacity(self.spokes.len()),
            ledger: self.ledger,
            propagations: Vec::new(),
        };

        for spoke in self.spokes {
            routed.propagate_spoke(&spoke)?;
            routed.spokes.push(spoke);
        }

        info!(
            "Propagated {} spoke route(s) into hub route table {}",
            routed.propagations.len(),
            routed.hub.transit_route_table.id
        );

        Ok(routed)
    }
}

/// Fully routed topology: associations committed, spoke routes propagated
#[derive(Clone, Debug)]
pub struct RoutedTopology {
    pub name_prefix: String,
    pub transit_gateway: TransitGateway,
    pub hub: InspectionHub,
    pub spokes: Vec<ResolvedSpoke>,
    pub ledger: AssociationLedger,
    pub propagations: Vec<Propagation>,
}

impl RoutedTopology {
    fn propagate_spoke(&mut self, spoke: &ResolvedSpoke) -> Result<()> {
        let attachment_id = spoke.attachment.id.as_str();
        let cidr = spoke.vpc.cidr;

        if self.ledger.route_table_of(attachment_id) != Some(spoke.route_table.id.as_str()) {
            return Err(ResolveError::Topology(format!(
                "cannot propagate {} before attachment {} is associated",
                cidr, attachment_id
            )));
        }

        let hub_table = &mut self.hub.transit_route_table;
        hub_table.insert(Route::propagated(cidr, RouteTarget::Attachment(attachment_id.to_string())))?;
        self.propagations.push(Propagation {
            attachment_id: attachment_id.to_string(),
            route_table_id: hub_table.id.clone(),
            cidr,
        });

        let zones = self.hub.vpc.availability_zones.clone();
        for zone in &zones {
            // Return traffic leaves the firewall subnet toward the transit gateway.
            let tgw_id = self.transit_gateway.id.clone();
            if let Some(table) = self.hub.vpc_route_table_mut(RouteTableKind::HubFirewall, zone) {
                table.insert(Route::new(cidr, RouteTarget::TransitGateway(tgw_id)))?;
            }

            // Inbound responses re-enter through the AZ-local firewall endpoint.
            let endpoint_id = self
                .hub
                .firewall_endpoint_in(zone)
                .map(|e| e.id.clone())
                .ok_or_else(|| ResolveError::Topology(format!("hub AZ {} has no firewall endpoint", zone)))?;
            if let Some(table) = self.hub.vpc_route_table_mut(RouteTableKind::HubPublic, zone) {
                table.insert(Route::new(cidr, RouteTarget::FirewallEndpoint(endpoint_id)))?;
            }
        }

        let short_name = spoke.declared_name(&self.name_prefix);
        self.hub.firewall_policy.admit_spoke(&short_name, cidr)?;

        debug!("Propagated {} via {} into {}", cidr, attachment_id, self.hub.transit_route_table.id);
        Ok(())
    }

    pub fn spoke(&self, name: &str) -> Option<&ResolvedSpoke> {
        self.spokes.iter().find(|s| s.declared_name(&self.name_prefix) == name)
    }

    /// Tear a spoke down as a whole: its association, every route that
    /// targets its attachment, the hub return routes for its CIDR and its
    /// firewall admission go together.
    pub fn detach_spoke(mut self, name: &str) -> Result<(RoutedTopology, ResolvedSpoke)> {
        let index = self
            .spokes
            .iter()
            .position(|s| s.declared_name(&self.name_prefix) == name)
            .ok_or_else(|| ResolveError::Topology(format!("no resolved spoke named '{}'", name)))?;
        let spoke = self.spokes.remove(index);
        let attachment_id = spoke.attachment.id.as_str();

        self.ledger.release(attachment_id);
        let removed = self.hub.transit_route_table.remove_target(attachment_id);
        for table in &mut self.hub.vpc_route_tables {
            if matches!(table.kind, RouteTableKind::HubFirewall | RouteTableKind::HubPublic) {
                table.remove_destination(&spoke.vpc.cidr);
            }
        }
        self.propagations.retain(|p| p.attachment_id != attachment_id);
        self.hub.firewall_policy.remove_spoke(name);

        info!("Detached spoke {} ({} hub route(s) removed)", name, removed);
        Ok((self, spoke))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::InspectionHubBuilder;
    use crate::model::{Topology, VpcRole};
    use crate::spoke::SpokeResolver;
    use landing_api::{NetworkingInputs, SpokeSpec};

    fn engine() -> PropagationEngine {
        let inputs = NetworkingInputs {
            name_prefix: "test".into(),
            inspection_vpc_cidr: "10.0.0.0/16".into(),
            availability_zones: vec!["a".into(), "b".into(), "c".into()],
            spokes: vec![
                SpokeSpec {
                    name: "nonprod".into(),
                    cidr: "10.1.0.0/16".into(),
                    ..Default::default()
                },
                SpokeSpec {
                    name: "prod".into(),
                    cidr: "10.2.0.0/16".into(),
                    ..Default::default()
                },
            ],
            log_bucket_name: "logs".into(),
            kms_key_id: "key".into(),
            sns_topic_arn: "topic".into(),
            transit_gateway_asn: 64512,
            ..Default::default()
        };
        let topology = Topology::from_inputs(&inputs).unwrap();
        assert_eq!(topology.hub.role, VpcRole::Hub);
        let hub = InspectionHubBuilder::new(&topology).build().unwrap();
        let resolution =
            SpokeResolver::new(&topology.name_prefix, &topology.transit_gateway, &hub).resolve(&topology.spokes);
        PropagationEngine::new(&topology.name_prefix, topology.transit_gateway.clone(), hub, resolution.accepted)
    }

    #[test]
    fn test_phase_one_associates_every_attachment() {
        let associated = engine().associate().unwrap();
        assert_eq!(associated.ledger().len(), 3);
    }

    #[test]
    fn test_phase_two_propagates_spoke_cidrs() {
        let routed = engine().associate().unwrap().propagate().unwrap();
        let hub_routes = routed.hub.transit_route_table.routes();
        assert_eq!(hub_routes.len(), 2);
        for spoke in &routed.spokes {
            let route = routed.hub.transit_route_table.route_for(&spoke.vpc.cidr).unwrap();
            assert_eq!(route.target, RouteTarget::Attachment(spoke.attachment.id.clone()));
        }
        assert_eq!(routed.propagations.len(), 2);
        assert_eq!(routed.hub.firewall_policy.admitted_spokes().len(), 2);

        let public = routed.hub.vpc_route_table(RouteTableKind::HubPublic, "b").unwrap();
        assert_eq!(public.routes().len(), 3);
    }

    #[test]
    fn test_ledger_rejects_second_table() {
        let mut ledger = AssociationLedger::default();
        ledger.commit("tgw-attach-1", "tgw-rtb-1").unwrap();
        ledger.commit("tgw-attach-1", "tgw-rtb-1").unwrap();
        assert!(ledger.commit("tgw-attach-1", "tgw-rtb-2").is_err());
    }

    #[test]
    fn test_foreign_attachment_fails_phase_one() {
        let mut engine = engine();
        engine.spokes[1].attachment.transit_gateway_id = "tgw-other".into();
        assert!(matches!(engine.associate(), Err(ResolveError::Topology(msg)) if msg.contains("tgw-other")));
    }

    #[test]
    fn test_detach_removes_routes_together() {
        let routed = engine().associate().unwrap().propagate().unwrap();
        let (routed, removed) = routed.detach_spoke("prod").unwrap();

        assert_eq!(routed.spokes.len(), 1);
        assert!(routed.ledger.route_table_of(&removed.attachment.id).is_none());
        assert!(routed.hub.transit_route_table.route_for(&removed.vpc.cidr).is_none());
        assert!(routed
            .hub
            .vpc_route_tables
            .iter()
            .all(|t| t.route_for(&removed.vpc.cidr).is_none()));
        assert_eq!(routed.propagations.len(), 1);
        assert!(routed.spoke("nonprod").is_some());
        assert!(routed.detach_spoke("prod").is_err());
    }
}

//! Firewall policy for the inspection hub
//!
//! The stateless engine forwards traffic from and to admitted spokes to the
//! stateful engine and drops everything else with a catch-all rule evaluated
//! last. The stateful engine decides spoke-to-spoke flows and optional egress
//! domain filtering.

use crate::model::default_route;
use crate::{ResolveError, Result};
use ipnetwork::Ipv4Network;
use landing_api::FirewallSpec;

/// Priority of the catch-all drop rule. Stateless rules run in ascending priority.
pub const DEFAULT_DENY_PRIORITY: u32 = 65000;

const SPOKE_RULE_BASE_PRIORITY: u32 = 100;

/// Priority of the outbound rule of the spoke admitted at `index`. The
/// inbound rule takes the next one. `None` once the pair would reach the
/// catch-all drop.
fn spoke_rule_priority(index: usize) -> Option<u32> {
    let offset = u32::try_from(index).ok()?.checked_mul(2)?;
    SPOKE_RULE_BASE_PRIORITY
        .checked_add(offset)
        .filter(|priority| *priority < DEFAULT_DENY_PRIORITY - 1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatelessAction {
    Pass,
    Drop,
    ForwardToStateful,
}

impl StatelessAction {
    pub fn as_aws(&self) -> &'static str {
        match self {
            StatelessAction::Pass => "aws:pass",
            StatelessAction::Drop => "aws:drop",
            StatelessAction::ForwardToStateful => "aws:forward_to_sfe",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatelessRule {
    pub priority: u32,
    pub source: Ipv4Network,
    pub destination: Ipv4Network,
    pub action: StatelessAction,
}

impl StatelessRule {
    pub fn is_catch_all_drop(&self) -> bool {
        self.action == StatelessAction::Drop
            && self.source.prefix() == 0
            && self.destination.prefix() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatefulAction {
    Pass,
    Drop,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatefulRule {
    Flow {
        action: StatefulAction,
        source: Ipv4Network,
        destination: Ipv4Network,
    },
    /// Allow HTTP Host / TLS SNI egress to the listed domains only
    DomainAllowlist { domains: Vec<String> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatelessRuleGroup {
    pub name: String,
    pub rules: Vec<StatelessRule>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatefulRuleGroup {
    pub name: String,
    pub rules: Vec<StatefulRule>,
}

/// Firewall policy bound to exactly one hub VPC
#[derive(Clone, Debug, PartialEq)]
pub struct FirewallPolicy {
    pub id: String,
    pub name: String,
    pub vpc_id: String,
    pub allow_spoke_to_spoke: bool,
    pub domain_allowlist: Vec<String>,
    pub default_deny_overridden: bool,
    admitted: Vec<(String, Ipv4Network)>,
}

impl FirewallPolicy {
    pub fn new(id: String, name: String, vpc_id: String, spec: &FirewallSpec) -> Self {
        Self {
            id,
            name,
            vpc_id,
            allow_spoke_to_spoke: spec.allow_spoke_to_spoke,
            domain_allowlist: spec.stateful_domain_allowlist.clone(),
            default_deny_overridden: spec.override_default_deny,
            admitted: Vec::new(),
        }
    }

    /// Start inspecting traffic of a spoke. Re-admitting a spoke is a no-op.
    pub fn admit_spoke(&mut self, name: &str, cidr: Ipv4Network) -> Result<()> {
        if self.admitted.iter().any(|(n, _)| n == name) {
            return Ok(());
        }
        if spoke_rule_priority(self.admitted.len()).is_none() {
            return Err(ResolveError::Topology(format!(
                "firewall policy {} cannot admit spoke {}: {} spokes already fill the rules below priority {}",
                self.name,
                name,
                self.admitted.len(),
                DEFAULT_DENY_PRIORITY
            )));
        }
        self.admitted.push((name.to_string(), cidr));
        Ok(())
    }

    pub fn remove_spoke(&mut self, name: &str) -> bool {
        let before = self.admitted.len();
        self.admitted.retain(|(n, _)| n != name);
        before != self.admitted.len()
    }

    pub fn admitted_spokes(&self) -> &[(String, Ipv4Network)] {
        &self.admitted
    }

    /// Default action of the stateless engine for packets no rule matched
    pub fn stateless_default_action(&self) -> StatelessAction {
        if self.default_deny_overridden {
            StatelessAction::ForwardToStateful
        } else {
            StatelessAction::Drop
        }
    }

    pub fn stateless_groups(&self) -> Vec<StatelessRuleGroup> {
        let mut rules = Vec::with_capacity(self.admitted.len() * 2 + 1);
        // Admission keeps every spoke below the catch-all drop.
        let admitted = self
            .admitted
            .iter()
            .enumerate()
            .map_while(|(index, (_, cidr))| spoke_rule_priority(index).map(|priority| (priority, cidr)));
        for (priority, cidr) in admitted {
            rules.push(StatelessRule {
                priority,
                source: *cidr,
                destination: default_route(),
                action: StatelessAction::ForwardToStateful,
            });
            rules.push(StatelessRule {
                priority: priority + 1,
                source: default_route(),
                destination: *cidr,
                action: StatelessAction::ForwardToStateful,
            });
        }
        if !self.default_deny_overridden {
            rules.push(StatelessRule {
                priority: DEFAULT_DENY_PRIORITY,
                source: default_route(),
                destination: default_route(),
                action: StatelessAction::Drop,
            });
        }

        vec![StatelessRuleGroup {
            name: format!("{}-stateless", self.name),
            rules,
        }]
    }

    pub fn stateful_groups(&self) -> Vec<StatefulRuleGroup> {
        let action = if self.allow_spoke_to_spoke {
            StatefulAction::Pass
        } else {
            StatefulAction::Drop
        };

        let mut east_west = Vec::new();
        for (source_name, source) in &self.admitted {
            for (destination_name, destination) in &self.admitted {
                if source_name != destination_name {
                    east_west.push(StatefulRule::Flow {
                        action,
                        source: *source,
                        destination: *destination,
                    });
                }
            }
        }

        let mut groups = vec![StatefulRuleGroup {
            name: format!("{}-east-west", self.name),
            rules: east_west,
        }];

        if !self.domain_allowlist.is_empty() {
            groups.push(StatefulRuleGroup {
                name: format!("{}-egress-domains", self.name),
                rules: vec![StatefulRule::DomainAllowlist {
                    domains: self.domain_allowlist.clone(),
                }],
            });
        }

        groups
    }

    /// Whether unmatched traffic is dropped by the stateless engine: the
    /// last evaluated rule is a catch-all drop and the default action drops.
    pub fn has_default_deny(&self) -> bool {
        let groups = self.stateless_groups();
        let last = groups
            .iter()
            .flat_map(|g| g.rules.iter())
            .max_by_key(|r| r.priority);
        matches!(last, Some(rule) if rule.is_catch_all_drop())
            && self.stateless_default_action() == StatelessAction::Drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(spec: &FirewallSpec) -> FirewallPolicy {
        FirewallPolicy::new("fwp-1".into(), "test-policy".into(), "vpc-1".into(), spec)
    }

    #[test]
    fn test_default_deny_present_by_default() {
        let policy = policy(&FirewallSpec::default());
        assert!(policy.has_default_deny());
        let rules = &policy.stateless_groups()[0].rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority, DEFAULT_DENY_PRIORITY);
    }

    #[test]
    fn test_override_removes_default_deny() {
        let spec = FirewallSpec {
            override_default_deny: true,
            ..FirewallSpec::default()
        };
        let policy = policy(&spec);
        assert!(!policy.has_default_deny());
        assert_eq!(policy.stateless_default_action(), StatelessAction::ForwardToStateful);
    }

    #[test]
    fn test_admitted_spokes_forward_before_deny() {
        let mut policy = policy(&FirewallSpec::default());
        policy.admit_spoke("nonprod", "10.1.0.0/16".parse().unwrap()).unwrap();
        policy.admit_spoke("prod", "10.2.0.0/16".parse().unwrap()).unwrap();
        policy.admit_spoke("prod", "10.2.0.0/16".parse().unwrap()).unwrap();

        let rules = &policy.stateless_groups()[0].rules;
        assert_eq!(rules.len(), 5);
        assert!(rules[..4]
            .iter()
            .all(|r| r.action == StatelessAction::ForwardToStateful && r.priority < DEFAULT_DENY_PRIORITY));
        assert!(policy.has_default_deny());
    }

    #[test]
    fn test_spoke_rule_priority_stays_below_deny() {
        assert_eq!(spoke_rule_priority(0), Some(100));
        assert_eq!(spoke_rule_priority(32449), Some(64998));
        assert_eq!(spoke_rule_priority(32450), None);
        assert_eq!(spoke_rule_priority(usize::MAX), None);
    }

    #[test]
    fn test_full_policy_rejects_admission() {
        let mut policy = policy(&FirewallSpec::default());
        let cidr: Ipv4Network = "10.1.0.0/16".parse().unwrap();
        policy.admitted = (0..32450).map(|i| (format!("spoke-{}", i), cidr)).collect();
        assert!(policy.has_default_deny());

        let result = policy.admit_spoke("one-more", "10.2.0.0/16".parse().unwrap());
        assert!(matches!(result, Err(ResolveError::Topology(_))));
        assert_eq!(policy.admitted_spokes().len(), 32450);
        assert!(policy.has_default_deny());
        assert!(policy.admit_spoke("spoke-0", cidr).is_ok());
    }

    #[test]
    fn test_east_west_rules_follow_spoke_posture() {
        let mut policy = policy(&FirewallSpec {
            allow_spoke_to_spoke: false,
            ..FirewallSpec::default()
        });
        policy.admit_spoke("a", "10.1.0.0/16".parse().unwrap()).unwrap();
        policy.admit_spoke("b", "10.2.0.0/16".parse().unwrap()).unwrap();

        let groups = policy.stateful_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].rules.len(), 2);
        assert!(groups[0]
            .rules
            .iter()
            .all(|r| matches!(r, StatefulRule::Flow { action: StatefulAction::Drop, .. })));

        assert!(policy.remove_spoke("a"));
        assert!(policy.stateful_groups()[0].rules.is_empty());
    }

    #[test]
    fn test_domain_allowlist_group() {
        let policy = policy(&FirewallSpec {
            stateful_domain_allowlist: vec![".amazonaws.com".into()],
            ..FirewallSpec::default()
        });
        assert_eq!(policy.stateful_groups().len(), 2);
    }
}

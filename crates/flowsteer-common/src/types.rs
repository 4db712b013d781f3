//! Typed data model shared between the device transport and the
//! reconciliation engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocol matched by a flow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    /// The ethtool `flow-type` for IPv4 rules of this protocol.
    pub fn flow_type(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp4",
            Protocol::Tcp => "tcp4",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Planning-level identity of a flow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    pub protocol: Protocol,
    pub dest_port: u16,
}

impl RuleKey {
    pub fn new(protocol: Protocol, dest_port: u16) -> Self {
        Self {
            protocol,
            dest_port,
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.dest_port)
    }
}

/// Action taken on packets matching a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleAction {
    pub queue: u32,
}

/// A desired hardware classification rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRule {
    pub protocol: Protocol,
    pub dest_port: u16,
    pub action: RuleAction,
}

impl FlowRule {
    /// A UDP destination-port rule steering to `queue`.
    pub fn udp(dest_port: u16, queue: u32) -> Self {
        Self {
            protocol: Protocol::Udp,
            dest_port,
            action: RuleAction { queue },
        }
    }

    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.protocol, self.dest_port)
    }

    pub fn queue(&self) -> u32 {
        self.action.queue
    }
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> queue {}", self.key(), self.action.queue)
    }
}

/// A rule as reported by the device.
///
/// `rule` is `None` for entries whose match or action this system cannot
/// express (other flow types, masked fields, drop/RSS actions). Such
/// entries are foreign and never touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRule {
    /// Device-local rule id (ethtool "Filter"/"loc").
    pub id: u32,
    pub rule: Option<FlowRule>,
}

impl AppliedRule {
    pub fn new(id: u32, rule: FlowRule) -> Self {
        Self {
            id,
            rule: Some(rule),
        }
    }

    pub fn foreign(id: u32) -> Self {
        Self { id, rule: None }
    }

    pub fn key(&self) -> Option<RuleKey> {
        self.rule.as_ref().map(FlowRule::key)
    }

    pub fn queue(&self) -> Option<u32> {
        self.rule.as_ref().map(FlowRule::queue)
    }
}

/// The device's current rule table, in the order the device reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRuleTable {
    pub rules: Vec<AppliedRule>,
}

impl AppliedRuleTable {
    pub fn new(rules: Vec<AppliedRule>) -> Self {
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppliedRule> {
        self.rules.iter()
    }

    /// Rules whose key satisfies `owned`, in device order.
    pub fn owned_by<'a, F>(&'a self, owned: F) -> impl Iterator<Item = &'a AppliedRule> + 'a
    where
        F: Fn(&RuleKey) -> bool + 'a,
    {
        self.rules
            .iter()
            .filter(move |r| r.key().map(|k| owned(&k)).unwrap_or(false))
    }
}

/// Driver identity from `ethtool -i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub driver: String,
    pub version: Option<String>,
    pub firmware_version: Option<String>,
    pub bus_info: Option<String>,
}

/// Device features this system reads or toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    /// ntuple filters / flow steering.
    Ntuple,
}

impl Feature {
    /// The ethtool feature name used by `-k` output.
    pub fn ethtool_name(&self) -> &'static str {
        match self {
            Feature::Ntuple => "ntuple-filters",
        }
    }

    /// The short name accepted by `ethtool -K`.
    pub fn ethtool_short_name(&self) -> &'static str {
        match self {
            Feature::Ntuple => "ntuple",
        }
    }
}

/// State of a device feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureState {
    pub enabled: bool,
    /// The driver does not allow toggling it (`[fixed]`).
    pub fixed: bool,
}

impl FeatureState {
    /// A fixed-off feature is not implemented by the driver.
    pub fn supported(&self) -> bool {
        self.enabled || !self.fixed
    }
}

/// Channel configuration from `ethtool -l`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounts {
    pub rx: u32,
    pub tx: u32,
    pub other: u32,
    pub combined: u32,
}

impl ChannelCounts {
    /// Number of receive queues, `None` if the driver reports none.
    pub fn rx_queues(&self) -> Option<u32> {
        let n = self.combined + self.rx;
        (n > 0).then_some(n)
    }
}

/// Interrupt coalescing passthrough values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coalesce {
    pub rx_usecs: Option<u32>,
    pub adaptive_rx: Option<bool>,
}

impl Coalesce {
    pub fn is_empty(&self) -> bool {
        self.rx_usecs.is_none() && self.adaptive_rx.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_rule_key_and_display() {
        let rule = FlowRule::udp(8000, 0);
        assert_eq!(rule.key(), RuleKey::new(Protocol::Udp, 8000));
        assert_eq!(rule.to_string(), "UDP/8000 -> queue 0");
    }

    #[test]
    fn test_rule_key_ordering() {
        let mut keys = vec![
            RuleKey::new(Protocol::Udp, 8002),
            RuleKey::new(Protocol::Udp, 8000),
            RuleKey::new(Protocol::Udp, 8001),
        ];
        keys.sort();
        let ports: Vec<u16> = keys.iter().map(|k| k.dest_port).collect();
        assert_eq!(ports, vec![8000, 8001, 8002]);
    }

    #[test]
    fn test_owned_by_skips_foreign() {
        let table = AppliedRuleTable::new(vec![
            AppliedRule::new(1, FlowRule::udp(8000, 0)),
            AppliedRule::foreign(2),
            AppliedRule::new(3, FlowRule::udp(53, 2)),
        ]);
        let ids: Vec<u32> = table
            .owned_by(|k| (8000..=8010).contains(&k.dest_port))
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_feature_state_supported() {
        let fixed_off = FeatureState {
            enabled: false,
            fixed: true,
        };
        let off = FeatureState {
            enabled: false,
            fixed: false,
        };
        assert!(!fixed_off.supported());
        assert!(off.supported());
    }

    #[test]
    fn test_channel_counts_rx_queues() {
        let c = ChannelCounts {
            combined: 8,
            ..Default::default()
        };
        assert_eq!(c.rx_queues(), Some(8));
        assert_eq!(ChannelCounts::default().rx_queues(), None);
    }
}

//! Traffic-split policy and rule planning.
//!
//! [`plan`] turns a [`TrafficSplitPolicy`] and the inspected interface into
//! the [`RuleSet`] the device should hold: one UDP rule per port in the
//! range, all steering to the XDP queue, ascending by port.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use flowsteer_common::{FlowRule, Protocol, RuleKey};

use crate::error::{FlowsteerError, FlowsteerResult};
use crate::inspector::InterfaceInfo;

/// An inclusive destination-port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    /// Number of ports, zero for an inverted range.
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    /// Accepts `START-END` or a single `PORT`. Ordering is checked by
    /// [`plan`], not here.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port '{}': {}", p.trim(), e))
        };
        match s.split_once('-') {
            Some((a, b)) => Ok(Self::new(parse(a)?, parse(b)?)),
            None => {
                let p = parse(s)?;
                Ok(Self::new(p, p))
            }
        }
    }
}

/// Declared traffic split for one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplitPolicy {
    pub interface: String,
    /// Receive queue the zero-copy consumer binds to.
    pub xdp_queue: u32,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl TrafficSplitPolicy {
    pub fn new(interface: impl Into<String>, xdp_queue: u32, ports: PortRange) -> Self {
        Self {
            interface: interface.into(),
            xdp_queue,
            port_range_start: ports.start,
            port_range_end: ports.end,
        }
    }

    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.port_range_start, self.port_range_end)
    }

    /// Rules this policy owns: UDP rules whose port lies in the range.
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(Protocol::Udp, vec![self.port_range()])
    }
}

/// The set of rule keys this system claims on a device.
///
/// Rules outside the key space are never deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpace {
    pub protocol: Option<Protocol>,
    pub ranges: Vec<PortRange>,
}

impl KeySpace {
    pub fn new(protocol: Protocol, ranges: Vec<PortRange>) -> Self {
        Self {
            protocol: Some(protocol),
            ranges,
        }
    }

    /// A key space that owns nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &RuleKey) -> bool {
        self.protocol == Some(key.protocol) && self.ranges.iter().any(|r| r.contains(key.dest_port))
    }

    /// Union of two key spaces over the same protocol.
    pub fn union(mut self, other: &KeySpace) -> Self {
        if other.protocol.is_some() && other.protocol == self.protocol {
            for r in &other.ranges {
                if !self.ranges.contains(r) {
                    self.ranges.push(*r);
                }
            }
        } else if self.protocol.is_none() {
            return other.clone();
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.protocol.is_none() || self.ranges.iter().all(PortRange::is_empty)
    }
}

/// Desired rule state, ordered by key (ascending port), no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: BTreeMap<RuleKey, FlowRule>,
}

impl RuleSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowRule> {
        self.rules.values()
    }

    pub fn get(&self, key: &RuleKey) -> Option<&FlowRule> {
        self.rules.get(key)
    }

    pub fn contains_key(&self, key: &RuleKey) -> bool {
        self.rules.contains_key(key)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.rules.keys().map(|k| k.dest_port).collect()
    }
}

impl FromIterator<FlowRule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = FlowRule>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().map(|r| (r.key(), r)).collect(),
        }
    }
}

/// Computes the rule set for `policy` on the inspected interface.
///
/// When the device did not report a queue count the queue bound cannot be
/// checked; the inspector has already recorded that as a warning.
pub fn plan(policy: &TrafficSplitPolicy, info: &InterfaceInfo) -> FlowsteerResult<RuleSet> {
    let range = policy.port_range();
    if range.start > range.end {
        return Err(FlowsteerError::invalid_policy(
            "port_range",
            format!(
                "start {} is greater than end {}",
                range.start, range.end
            ),
        ));
    }
    if range.is_empty() {
        return Err(FlowsteerError::invalid_policy("port_range", "range is empty"));
    }
    if let Some(queues) = info.queue_count {
        if policy.xdp_queue >= queues {
            return Err(FlowsteerError::invalid_policy(
                "xdp_queue",
                format!(
                    "queue {} is out of range for {} ({} queues)",
                    policy.xdp_queue, info.name, queues
                ),
            ));
        }
    }

    let set: RuleSet = range
        .ports()
        .map(|port| FlowRule::udp(port, policy.xdp_queue))
        .collect();
    debug!(
        interface = %policy.interface,
        rules = set.len(),
        range = %range,
        queue = policy.xdp_queue,
        "Planned rule set"
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn info(queues: Option<u32>) -> InterfaceInfo {
        InterfaceInfo {
            name: "eth0".to_string(),
            driver: "ixgbe".to_string(),
            queue_count: queues,
            ntuple_supported: true,
            ntuple_enabled: true,
            sriov_supported: false,
            max_vfs: 0,
        }
    }

    fn policy(queue: u32, start: u16, end: u16) -> TrafficSplitPolicy {
        TrafficSplitPolicy::new("eth0", queue, PortRange::new(start, end))
    }

    #[test]
    fn test_plan_one_rule_per_port() {
        let set = plan(&policy(0, 8000, 8020), &info(Some(8))).unwrap();
        assert_eq!(set.len(), 21);
        assert_eq!(set.ports(), (8000..=8020).collect::<Vec<_>>());
        assert!(set
            .iter()
            .all(|r| r.protocol == Protocol::Udp && r.queue() == 0));
    }

    #[test]
    fn test_plan_single_port() {
        let set = plan(&policy(3, 9000, 9000), &info(Some(4))).unwrap();
        assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![FlowRule::udp(9000, 3)]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = plan(&policy(1, 100, 140), &info(Some(2))).unwrap();
        let b = plan(&policy(1, 100, 140), &info(Some(2))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_plan_rejects_inverted_range() {
        let err = plan(&policy(0, 8020, 8000), &info(Some(8))).unwrap_err();
        assert!(matches!(err, FlowsteerError::InvalidPolicy { ref field, .. } if field == "port_range"));
    }

    #[test]
    fn test_plan_rejects_queue_out_of_range() {
        let err = plan(&policy(8, 8000, 8001), &info(Some(8))).unwrap_err();
        assert!(matches!(err, FlowsteerError::InvalidPolicy { ref field, .. } if field == "xdp_queue"));
    }

    #[test]
    fn test_plan_unknown_queue_count_skips_queue_check() {
        let set = plan(&policy(12, 8000, 8001), &info(None)).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_port_range_parse() {
        assert_eq!("8000-8020".parse::<PortRange>().unwrap(), PortRange::new(8000, 8020));
        assert_eq!("53".parse::<PortRange>().unwrap(), PortRange::new(53, 53));
        assert!("80-".parse::<PortRange>().is_err());
        assert!("70000".parse::<PortRange>().is_err());
        assert_eq!(PortRange::new(8000, 8020).to_string(), "8000-8020");
    }

    #[test]
    fn test_port_range_full_span() {
        assert_eq!(PortRange::new(0, u16::MAX).len(), 65536);
        assert_eq!(PortRange::new(10, 9).len(), 0);
    }

    #[test]
    fn test_key_space() {
        let space = policy(0, 8000, 8010).key_space();
        assert!(space.contains(&RuleKey::new(Protocol::Udp, 8005)));
        assert!(!space.contains(&RuleKey::new(Protocol::Tcp, 8005)));
        assert!(!space.contains(&RuleKey::new(Protocol::Udp, 7999)));

        let wider = space.union(&KeySpace::new(Protocol::Udp, vec![PortRange::new(8011, 8030)]));
        assert!(wider.contains(&RuleKey::new(Protocol::Udp, 8025)));
        assert!(KeySpace::empty().union(&wider).contains(&RuleKey::new(Protocol::Udp, 8000)));
        assert!(!KeySpace::empty().contains(&RuleKey::new(Protocol::Udp, 8000)));
    }
}

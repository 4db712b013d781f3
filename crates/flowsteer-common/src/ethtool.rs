//! Parsers for ethtool's textual output.
//!
//! This is the only place that understands ethtool's text format. Each
//! parser turns one command's stdout into typed values from
//! [`crate::types`]; [`crate::LinuxNic`] calls them and nothing above the
//! transport ever sees raw output.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{NicError, NicResult, RejectKind};
use crate::types::{
    AppliedRule, AppliedRuleTable, ChannelCounts, Coalesce, DriverInfo, FeatureState, FlowRule,
    Protocol, RuleAction,
};

static ADDED_RULE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Added rule with ID (\d+)").expect("Invalid regex pattern"));

static RX_RINGS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) RX rings available").expect("Invalid regex pattern"));

static QUEUE_ACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Direct to queue (\d+)$").expect("Invalid regex pattern"));

static PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) mask: (0x[0-9a-fA-F]+)$").expect("Invalid regex pattern"));

/// Splits `key: value`, trimming both sides.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let (k, v) = line.split_once(':')?;
    Some((k.trim(), v.trim()))
}

/// Parses `ethtool -i` output.
pub fn parse_driver_info(output: &str) -> NicResult<DriverInfo> {
    let mut info = DriverInfo::default();
    let non_empty = |v: &str| (!v.is_empty()).then(|| v.to_string());

    for line in output.lines() {
        let Some((key, value)) = split_field(line) else {
            continue;
        };
        match key {
            "driver" => info.driver = value.to_string(),
            "version" => info.version = non_empty(value),
            "firmware-version" => info.firmware_version = non_empty(value),
            "bus-info" => info.bus_info = non_empty(value),
            _ => {}
        }
    }

    if info.driver.is_empty() {
        return Err(NicError::parse("ethtool -i output", "no driver line"));
    }
    Ok(info)
}

/// Pre-set maximums and current settings from `ethtool -l`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelParams {
    pub maximum: ChannelCounts,
    pub current: ChannelCounts,
}

/// Parses `ethtool -l` output. `n/a` counts as zero.
pub fn parse_channels(output: &str) -> NicResult<ChannelParams> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Max,
        Current,
    }

    let mut params = ChannelParams::default();
    let mut section = Section::None;
    let mut saw_current = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Pre-set maximums") {
            section = Section::Max;
            continue;
        }
        if trimmed.starts_with("Current hardware settings") {
            section = Section::Current;
            saw_current = true;
            continue;
        }
        let Some((key, value)) = split_field(trimmed) else {
            continue;
        };
        let target = match section {
            Section::Max => &mut params.maximum,
            Section::Current => &mut params.current,
            Section::None => continue,
        };
        let count = match value {
            "n/a" | "" => 0,
            v => v
                .parse::<u32>()
                .map_err(|e| NicError::parse("ethtool -l output", format!("{key}: {e}")))?,
        };
        match key {
            "RX" => target.rx = count,
            "TX" => target.tx = count,
            "Other" => target.other = count,
            "Combined" => target.combined = count,
            _ => {}
        }
    }

    if !saw_current {
        return Err(NicError::parse(
            "ethtool -l output",
            "missing current hardware settings",
        ));
    }
    Ok(params)
}

/// Current RX ring size from `ethtool -g`, `None` when reported as `n/a`.
pub fn parse_rx_ring(output: &str) -> NicResult<Option<u32>> {
    let current = output
        .lines()
        .skip_while(|l| !l.trim().starts_with("Current hardware settings"))
        .skip(1)
        .filter_map(split_field)
        .find(|(k, _)| *k == "RX");
    match current {
        Some((_, "n/a")) => Ok(None),
        Some((_, v)) => v
            .parse::<u32>()
            .map(Some)
            .map_err(|e| NicError::parse("ethtool -g output", format!("RX: {e}"))),
        None => Err(NicError::parse(
            "ethtool -g output",
            "missing current RX ring size",
        )),
    }
}

/// Interrupt coalescing from `ethtool -c`. Fields the driver reports as
/// `n/a` stay `None`.
pub fn parse_coalesce(output: &str) -> NicResult<Coalesce> {
    let mut coalesce = Coalesce::default();
    for (key, value) in output.lines().filter_map(split_field) {
        match key {
            // "Adaptive RX: on  TX: off"
            "Adaptive RX" => {
                coalesce.adaptive_rx = match value.split_whitespace().next() {
                    Some("on") => Some(true),
                    Some("off") => Some(false),
                    _ => None,
                }
            }
            "rx-usecs" if value != "n/a" => {
                coalesce.rx_usecs = Some(value.parse::<u32>().map_err(|e| {
                    NicError::parse("ethtool -c output", format!("rx-usecs: {e}"))
                })?)
            }
            _ => {}
        }
    }
    Ok(coalesce)
}

/// Looks up one feature in `ethtool -k` output.
///
/// Returns `None` when the driver does not list the feature.
pub fn parse_feature(output: &str, name: &str) -> Option<FeatureState> {
    output.lines().find_map(|line| {
        let (key, value) = split_field(line)?;
        if key != name {
            return None;
        }
        let mut words = value.split_whitespace();
        let enabled = words.next()? == "on";
        let fixed = value.contains("[fixed]");
        Some(FeatureState { enabled, fixed })
    })
}

/// Parsed `ethtool -n` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleListing {
    /// The "N RX rings available" header, when present.
    pub rx_rings: Option<u32>,
    pub table: AppliedRuleTable,
}

/// One `Filter:` block while it is being read.
#[derive(Default)]
struct FilterBlock {
    id: u32,
    protocol: Option<Protocol>,
    dest_port: Option<u16>,
    queue: Option<u32>,
    /// Set when any field narrows the match beyond a plain dst-port rule
    /// or the action is not a plain queue redirect.
    foreign: bool,
}

impl FilterBlock {
    fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn finish(self) -> AppliedRule {
        match (self.foreign, self.protocol, self.dest_port, self.queue) {
            (false, Some(protocol), Some(dest_port), Some(queue)) => AppliedRule::new(
                self.id,
                FlowRule {
                    protocol,
                    dest_port,
                    action: RuleAction { queue },
                },
            ),
            _ => AppliedRule::foreign(self.id),
        }
    }

    fn apply_field(&mut self, key: &str, value: &str) {
        match key {
            "Rule Type" => match value {
                "UDP over IPv4" => self.protocol = Some(Protocol::Udp),
                "TCP over IPv4" => self.protocol = Some(Protocol::Tcp),
                _ => self.foreign = true,
            },
            // Inverted masks: all-ones means "don't care".
            "Src IP addr" | "Dest IP addr" => {
                if !value.ends_with("mask: 255.255.255.255") {
                    self.foreign = true;
                }
            }
            "TOS" => {
                if !value.ends_with("mask: 0xff") {
                    self.foreign = true;
                }
            }
            "Src port" => match PORT_RE.captures(value) {
                Some(c) if c[2].eq_ignore_ascii_case("0xffff") => {}
                _ => self.foreign = true,
            },
            "Dest port" => match PORT_RE.captures(value) {
                Some(c) if &c[2] == "0x0" => match c[1].parse::<u16>() {
                    Ok(port) => self.dest_port = Some(port),
                    Err(_) => self.foreign = true,
                },
                _ => self.foreign = true,
            },
            "Action" => match QUEUE_ACTION_RE.captures(value) {
                Some(c) => match c[1].parse::<u32>() {
                    Ok(q) => self.queue = Some(q),
                    Err(_) => self.foreign = true,
                },
                None => self.foreign = true,
            },
            // Any other populated match field (VLAN, user-def, dst MAC,
            // RSS context) makes the rule more specific than ours.
            _ => self.foreign = true,
        }
    }
}

/// Parses `ethtool -n` (rule listing) output.
pub fn parse_rule_listing(output: &str) -> NicResult<RuleListing> {
    let mut listing = RuleListing::default();
    let mut current: Option<FilterBlock> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(c) = RX_RINGS_RE.captures(trimmed) {
            listing.rx_rings = c[1].parse().ok();
            continue;
        }
        if trimmed.starts_with("Total ") {
            continue;
        }
        let Some((key, value)) = split_field(trimmed) else {
            continue;
        };
        if key == "Filter" {
            if let Some(block) = current.take() {
                listing.table.rules.push(block.finish());
            }
            let id = value
                .parse::<u32>()
                .map_err(|e| NicError::parse("ethtool -n output", format!("filter id: {e}")))?;
            current = Some(FilterBlock::new(id));
            continue;
        }
        match current.as_mut() {
            Some(block) => block.apply_field(key, value),
            None => {
                return Err(NicError::parse(
                    "ethtool -n output",
                    format!("field '{key}' outside a Filter block"),
                ))
            }
        }
    }
    if let Some(block) = current.take() {
        listing.table.rules.push(block.finish());
    }
    Ok(listing)
}

/// Extracts the rule id from `ethtool -N ... flow-type` output.
pub fn parse_added_rule_id(output: &str) -> Option<u32> {
    ADDED_RULE_RE
        .captures(output)
        .and_then(|c| c[1].parse().ok())
}

/// Classifies why `ethtool -N` refused to insert a rule.
pub fn classify_rejection(output: &str) -> RejectKind {
    let lower = output.to_ascii_lowercase();
    if lower.contains("no space left")
        || lower.contains("cannot find appropriate slot")
        || lower.contains("table is full")
        || lower.contains("out of space")
    {
        RejectKind::TableFull
    } else if lower.contains("invalid argument") {
        RejectKind::Invalid
    } else {
        RejectKind::Other
    }
}

/// Returns true if tool output reports the operation as unsupported.
pub fn is_unsupported(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("operation not supported") || lower.contains("not supported")
}

/// Returns true if tool output reports a missing device.
pub fn is_no_such_device(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("no such device") || lower.contains("cannot find device")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DRIVER_INFO: &str = "driver: ixgbe
version: 5.15.0-91-generic
firmware-version: 0x800008f4
expansion-rom-version:
bus-info: 0000:03:00.0
supports-statistics: yes
supports-test: yes";

    const CHANNELS: &str = "Channel parameters for enp3s0f0:
Pre-set maximums:
RX:		n/a
TX:		n/a
Other:		1
Combined:	63
Current hardware settings:
RX:		n/a
TX:		n/a
Other:		1
Combined:	8";

    const RINGS: &str = "Ring parameters for enp3s0f0:
Pre-set maximums:
RX:		4096
RX Mini:	n/a
RX Jumbo:	n/a
TX:		4096
Current hardware settings:
RX:		512
RX Mini:	n/a
RX Jumbo:	n/a
TX:		512
RX Buf Len:		n/a";

    const COALESCE: &str = "Coalesce parameters for enp3s0f0:
Adaptive RX: on  TX: off
stats-block-usecs:	n/a
sample-interval:	n/a

rx-usecs:	50
rx-frames:	n/a
rx-usecs-irq:	n/a";

    const FEATURES: &str = "Features for enp3s0f0:
rx-checksumming: on
tx-checksumming: on
ntuple-filters: off
receive-hashing: on
hw-tc-offload: off [fixed]";

    const RULES: &str = "8 RX rings available
Total 3 rules

Filter: 1023
	Rule Type: UDP over IPv4
	Src IP addr: 0.0.0.0 mask: 255.255.255.255
	Dest IP addr: 0.0.0.0 mask: 255.255.255.255
	TOS: 0x0 mask: 0xff
	Src port: 0 mask: 0xffff
	Dest port: 8000 mask: 0x0
	Action: Direct to queue 0

Filter: 1022
	Rule Type: TCP over IPv4
	Src IP addr: 10.0.0.1 mask: 0.0.0.0
	Dest IP addr: 0.0.0.0 mask: 255.255.255.255
	TOS: 0x0 mask: 0xff
	Src port: 0 mask: 0xffff
	Dest port: 22 mask: 0x0
	Action: Direct to queue 3

Filter: 1021
	Rule Type: UDP over IPv4
	Src IP addr: 0.0.0.0 mask: 255.255.255.255
	Dest IP addr: 0.0.0.0 mask: 255.255.255.255
	TOS: 0x0 mask: 0xff
	Src port: 0 mask: 0xffff
	Dest port: 53 mask: 0x0
	Action: Drop
";

    #[test]
    fn test_parse_driver_info() {
        let info = parse_driver_info(DRIVER_INFO).unwrap();
        assert_eq!(info.driver, "ixgbe");
        assert_eq!(info.firmware_version.as_deref(), Some("0x800008f4"));
        assert_eq!(info.bus_info.as_deref(), Some("0000:03:00.0"));
    }

    #[test]
    fn test_parse_driver_info_missing_driver() {
        assert!(parse_driver_info("version: 1.0").is_err());
    }

    #[test]
    fn test_parse_channels() {
        let params = parse_channels(CHANNELS).unwrap();
        assert_eq!(params.maximum.combined, 63);
        assert_eq!(params.current.combined, 8);
        assert_eq!(params.current.rx, 0);
        assert_eq!(params.current.rx_queues(), Some(8));
    }

    #[test]
    fn test_parse_channels_rejects_garbage() {
        assert!(parse_channels("Channel parameters for eth0:\nCurrent hardware settings:\nCombined: many").is_err());
        assert!(parse_channels("nothing here").is_err());
    }

    #[test]
    fn test_parse_rx_ring() {
        assert_eq!(parse_rx_ring(RINGS).unwrap(), Some(512));
        assert_eq!(
            parse_rx_ring("Current hardware settings:\nRX:\tn/a").unwrap(),
            None
        );
        assert!(parse_rx_ring("Pre-set maximums:\nRX: 4096").is_err());
    }

    #[test]
    fn test_parse_coalesce() {
        assert_eq!(
            parse_coalesce(COALESCE).unwrap(),
            Coalesce {
                rx_usecs: Some(50),
                adaptive_rx: Some(true),
            }
        );
        assert_eq!(
            parse_coalesce("Adaptive RX: n/a  TX: n/a\nrx-usecs: n/a").unwrap(),
            Coalesce::default()
        );
    }

    #[test]
    fn test_parse_feature() {
        assert_eq!(
            parse_feature(FEATURES, "ntuple-filters"),
            Some(FeatureState {
                enabled: false,
                fixed: false
            })
        );
        assert_eq!(
            parse_feature(FEATURES, "hw-tc-offload"),
            Some(FeatureState {
                enabled: false,
                fixed: true
            })
        );
        assert_eq!(parse_feature(FEATURES, "rx-gro-hw"), None);
    }

    #[test]
    fn test_parse_rule_listing() {
        let listing = parse_rule_listing(RULES).unwrap();
        assert_eq!(listing.rx_rings, Some(8));
        assert_eq!(
            listing.table.rules,
            vec![
                AppliedRule::new(1023, FlowRule::udp(8000, 0)),
                // Source IP narrowed: not a plain dst-port rule.
                AppliedRule::foreign(1022),
                // Drop action.
                AppliedRule::foreign(1021),
            ]
        );
    }

    #[test]
    fn test_parse_empty_rule_listing() {
        let listing = parse_rule_listing("8 RX rings available\nTotal 0 rules\n").unwrap();
        assert!(listing.table.is_empty());
    }

    #[test]
    fn test_parse_added_rule_id() {
        assert_eq!(parse_added_rule_id("Added rule with ID 1023"), Some(1023));
        assert_eq!(parse_added_rule_id(""), None);
    }

    #[test]
    fn test_classify_rejection() {
        assert_eq!(
            classify_rejection("rmgr: Cannot insert RX class rule: No space left on device"),
            RejectKind::TableFull
        );
        assert_eq!(
            classify_rejection("rmgr: Cannot insert RX class rule: Invalid argument"),
            RejectKind::Invalid
        );
        assert_eq!(classify_rejection("something else"), RejectKind::Other);
    }

    #[test]
    fn test_unsupported_and_missing_device() {
        assert!(is_unsupported(
            "rxclass: Cannot get RX class rule count: Operation not supported"
        ));
        assert!(is_no_such_device("Cannot get driver information: No such device"));
        assert!(!is_no_such_device("Added rule with ID 4"));
    }
}

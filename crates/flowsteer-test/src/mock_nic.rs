//! Scriptable in-memory NIC.
//!
//! [`MockNic`] models one interface with a rule table, an ntuple feature
//! flag, an optional SR-IOV capability and a few failure knobs. Everything
//! a test needs to arrange or observe is reachable through `&self`, so the
//! same instance can be handed to the engine as `&dyn NicControl`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use flowsteer_common::{
    AppliedRule, AppliedRuleTable, Coalesce, DriverInfo, Feature, FeatureState, FlowRule,
    NicControl, NicError, NicResult, RejectKind,
};

#[derive(Debug)]
struct MockState {
    interface: String,
    queues: Option<u32>,
    ntuple: Option<FeatureState>,
    rules: Vec<AppliedRule>,
    next_id: u32,
    capacity: Option<usize>,
    rejected_ports: HashSet<u16>,
    hidden_ports: HashSet<u16>,
    failing_deletes: HashSet<u32>,
    add_attempts: Vec<u16>,
    mutations: usize,
    broken: bool,
    total_vfs: Option<u32>,
    num_vfs: u32,
    vf_delay: u32,
    vf_polls: HashMap<u32, u32>,
    sriov_writes: Vec<u32>,
    link_up: Vec<String>,
    mirror_supported: bool,
    refuse_tuning: bool,
    rx_ring: Option<u32>,
    coalesce: Coalesce,
}

/// In-memory [`NicControl`] implementation.
#[derive(Debug)]
pub struct MockNic {
    state: Mutex<MockState>,
}

impl MockNic {
    /// A device with 8 queues, ntuple supported but off, no SR-IOV, an
    /// unlimited rule table, a 512-entry RX ring and adaptive coalescing.
    pub fn new(interface: &str) -> Self {
        Self {
            state: Mutex::new(MockState {
                interface: interface.to_string(),
                queues: Some(8),
                ntuple: Some(FeatureState {
                    enabled: false,
                    fixed: false,
                }),
                rules: Vec::new(),
                next_id: 1,
                capacity: None,
                rejected_ports: HashSet::new(),
                hidden_ports: HashSet::new(),
                failing_deletes: HashSet::new(),
                add_attempts: Vec::new(),
                mutations: 0,
                broken: false,
                total_vfs: None,
                num_vfs: 0,
                vf_delay: 0,
                vf_polls: HashMap::new(),
                sriov_writes: Vec::new(),
                link_up: Vec::new(),
                mirror_supported: false,
                refuse_tuning: false,
                rx_ring: Some(512),
                coalesce: Coalesce {
                    rx_usecs: Some(3),
                    adaptive_rx: Some(true),
                },
            }),
        }
    }

    pub fn with_queues(self, queues: u32) -> Self {
        self.state.lock().queues = Some(queues);
        self
    }

    pub fn without_queue_count(self) -> Self {
        self.state.lock().queues = None;
        self
    }

    pub fn without_ntuple(self) -> Self {
        self.state.lock().ntuple = None;
        self
    }

    pub fn with_ntuple_enabled(self) -> Self {
        self.state.lock().ntuple = Some(FeatureState {
            enabled: true,
            fixed: false,
        });
        self
    }

    /// ntuple reported but stuck off; enabling it fails.
    pub fn with_ntuple_fixed_off(self) -> Self {
        self.state.lock().ntuple = Some(FeatureState {
            enabled: false,
            fixed: true,
        });
        self
    }

    pub fn with_sriov(self, max_vfs: u32) -> Self {
        self.state.lock().total_vfs = Some(max_vfs);
        self
    }

    /// The device accepts at most `capacity` rules in total.
    pub fn with_rule_capacity(self, capacity: usize) -> Self {
        self.state.lock().capacity = Some(capacity);
        self
    }

    /// VF interfaces appear only after `polls` empty lookups each.
    pub fn with_vf_delay(self, polls: u32) -> Self {
        self.state.lock().vf_delay = polls;
        self
    }

    pub fn with_mirror_support(self) -> Self {
        self.state.lock().mirror_supported = true;
        self
    }

    /// Installs a rule without counting it as a mutation. Returns its id.
    pub fn preload_rule(&self, rule: FlowRule) -> u32 {
        let mut s = self.state.lock();
        let id = s.allocate_id();
        s.rules.push(AppliedRule::new(id, rule));
        id
    }

    /// Installs a rule the engine cannot interpret. Returns its id.
    pub fn preload_foreign_rule(&self) -> u32 {
        let mut s = self.state.lock();
        let id = s.allocate_id();
        s.rules.push(AppliedRule::foreign(id));
        id
    }

    /// Deleting `rule_id` will fail.
    pub fn fail_delete(&self, rule_id: u32) {
        self.state.lock().failing_deletes.insert(rule_id);
    }

    /// Adding a rule for `port` will be refused as invalid.
    pub fn reject_port(&self, port: u16) {
        self.state.lock().rejected_ports.insert(port);
    }

    /// Rules for `port` are accepted but never listed.
    pub fn silently_drop_port(&self, port: u16) {
        self.state.lock().hidden_ports.insert(port);
    }

    /// Every subsequent call fails as if the control tool were missing.
    pub fn break_control_surface(&self) {
        self.state.lock().broken = true;
    }

    /// Tuning passthrough calls fail from now on.
    pub fn refuse_tuning(&self) {
        self.state.lock().refuse_tuning = true;
    }

    pub fn support_mirroring(&self) {
        self.state.lock().mirror_supported = true;
    }

    /// The rule table as [`NicControl::list_rules`] would report it.
    pub fn list_rules_now(&self) -> AppliedRuleTable {
        self.state.lock().visible_rules()
    }

    pub fn has_rule_id(&self, rule_id: u32) -> bool {
        self.state.lock().rules.iter().any(|r| r.id == rule_id)
    }

    /// Ports of every `add_rule` call, in call order.
    pub fn add_attempts(&self) -> Vec<u16> {
        self.state.lock().add_attempts.clone()
    }

    /// Number of mutating calls made through [`NicControl`].
    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations
    }

    pub fn ntuple_enabled(&self) -> bool {
        self.state.lock().ntuple.is_some_and(|f| f.enabled)
    }

    pub fn queue_count_now(&self) -> Option<u32> {
        self.state.lock().queues
    }

    pub fn rx_ring_now(&self) -> Option<u32> {
        self.state.lock().rx_ring
    }

    pub fn coalesce_now(&self) -> Coalesce {
        self.state.lock().coalesce
    }

    /// Values written to `sriov_numvfs`, in order.
    pub fn sriov_writes(&self) -> Vec<u32> {
        self.state.lock().sriov_writes.clone()
    }

    pub fn num_vfs(&self) -> u32 {
        self.state.lock().num_vfs
    }

    /// Interfaces brought up, in order.
    pub fn link_up_names(&self) -> Vec<String> {
        self.state.lock().link_up.clone()
    }

    /// Clears call history, keeping device state.
    pub fn reset_history(&self) {
        let mut s = self.state.lock();
        s.add_attempts.clear();
        s.mutations = 0;
        s.sriov_writes.clear();
        s.link_up.clear();
    }
}

impl MockState {
    fn allocate_id(&mut self) -> u32 {
        while self.rules.iter().any(|r| r.id == self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn visible_rules(&self) -> AppliedRuleTable {
        AppliedRuleTable::new(
            self.rules
                .iter()
                .filter(|r| {
                    r.key()
                        .map_or(true, |k| !self.hidden_ports.contains(&k.dest_port))
                })
                .cloned()
                .collect(),
        )
    }

    /// Common preamble: control surface reachable and interface known.
    fn check(&self, iface: &str, command: &str) -> NicResult<()> {
        if self.broken {
            return Err(NicError::ShellExec {
                command: format!("ethtool {command} {iface}"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "ethtool not found"),
            });
        }
        if iface != self.interface {
            return Err(NicError::interface_not_found(iface));
        }
        Ok(())
    }

    fn refused(&self, iface: &str, command: &str, output: &str) -> NicError {
        NicError::ShellCommandFailed {
            command: format!("ethtool {command} {iface}"),
            exit_code: 1,
            output: output.to_string(),
        }
    }

    fn tuning(&mut self, iface: &str, command: &str) -> NicResult<()> {
        self.check(iface, command)?;
        self.mutations += 1;
        if self.refuse_tuning {
            return Err(self.refused(iface, command, "Operation not supported"));
        }
        Ok(())
    }

    fn vf_name(&self, vf_index: u32) -> String {
        format!("{}v{}", self.interface, vf_index)
    }
}

#[async_trait]
impl NicControl for MockNic {
    async fn interface_exists(&self, iface: &str) -> NicResult<bool> {
        let s = self.state.lock();
        if s.broken {
            s.check(iface, "-i")?;
        }
        Ok(iface == s.interface)
    }

    async fn driver_info(&self, iface: &str) -> NicResult<DriverInfo> {
        let s = self.state.lock();
        s.check(iface, "-i")?;
        Ok(DriverInfo {
            driver: "mock".to_string(),
            version: Some("1.0".to_string()),
            firmware_version: None,
            bus_info: Some("0000:00:00.0".to_string()),
        })
    }

    async fn queue_count(&self, iface: &str) -> NicResult<Option<u32>> {
        let s = self.state.lock();
        s.check(iface, "-l")?;
        Ok(s.queues)
    }

    async fn feature(&self, iface: &str, feature: Feature) -> NicResult<Option<FeatureState>> {
        let s = self.state.lock();
        s.check(iface, "-k")?;
        match feature {
            Feature::Ntuple => Ok(s.ntuple),
        }
    }

    async fn set_feature(&self, iface: &str, feature: Feature, enabled: bool) -> NicResult<()> {
        let mut s = self.state.lock();
        let command = format!(
            "-K {} {}",
            feature.ethtool_short_name(),
            if enabled { "on" } else { "off" }
        );
        s.check(iface, &command)?;
        s.mutations += 1;
        let current = s.ntuple;
        match current {
            Some(state) if !state.fixed => {
                s.ntuple = Some(FeatureState { enabled, ..state });
                Ok(())
            }
            _ => Err(s.refused(iface, &command, "Could not change any device features")),
        }
    }

    async fn list_rules(&self, iface: &str) -> NicResult<AppliedRuleTable> {
        let s = self.state.lock();
        s.check(iface, "-n")?;
        Ok(s.visible_rules())
    }

    async fn add_rule(&self, iface: &str, rule: &FlowRule) -> NicResult<u32> {
        let mut s = self.state.lock();
        s.check(iface, "-N")?;
        s.mutations += 1;
        s.add_attempts.push(rule.dest_port);
        trace!(port = rule.dest_port, "mock add_rule");

        if s.rejected_ports.contains(&rule.dest_port) {
            return Err(NicError::RuleRejected {
                interface: iface.to_string(),
                kind: RejectKind::Invalid,
                message: "Invalid argument".to_string(),
            });
        }
        if s.capacity.is_some_and(|cap| s.rules.len() >= cap) {
            return Err(NicError::RuleRejected {
                interface: iface.to_string(),
                kind: RejectKind::TableFull,
                message: "No space left on device".to_string(),
            });
        }
        let id = s.allocate_id();
        s.rules.push(AppliedRule::new(id, *rule));
        Ok(id)
    }

    async fn delete_rule(&self, iface: &str, rule_id: u32) -> NicResult<()> {
        let mut s = self.state.lock();
        s.check(iface, "-N delete")?;
        s.mutations += 1;
        let message = if s.failing_deletes.contains(&rule_id) {
            Some("Operation not permitted")
        } else if !s.rules.iter().any(|r| r.id == rule_id) {
            Some("No such file or directory")
        } else {
            None
        };
        if let Some(message) = message {
            return Err(NicError::DeleteFailed {
                interface: iface.to_string(),
                rule_id,
                message: message.to_string(),
            });
        }
        s.rules.retain(|r| r.id != rule_id);
        Ok(())
    }

    async fn sriov_total_vfs(&self, iface: &str) -> NicResult<Option<u32>> {
        let s = self.state.lock();
        s.check(iface, "sriov_totalvfs")?;
        Ok(s.total_vfs)
    }

    async fn sriov_num_vfs(&self, iface: &str) -> NicResult<u32> {
        let s = self.state.lock();
        s.check(iface, "sriov_numvfs")?;
        Ok(s.num_vfs)
    }

    async fn set_sriov_num_vfs(&self, iface: &str, count: u32) -> NicResult<()> {
        let mut s = self.state.lock();
        s.check(iface, "sriov_numvfs")?;
        s.mutations += 1;
        let Some(total) = s.total_vfs else {
            return Err(NicError::unsupported(iface, "SR-IOV"));
        };
        if count > total {
            return Err(s.refused(iface, "sriov_numvfs", "Numerical result out of range"));
        }
        if count != 0 && s.num_vfs != 0 {
            return Err(s.refused(iface, "sriov_numvfs", "Device or resource busy"));
        }
        s.sriov_writes.push(count);
        s.num_vfs = count;
        s.vf_polls.clear();
        Ok(())
    }

    async fn vf_interface_names(&self, iface: &str, vf_index: u32) -> NicResult<Vec<String>> {
        let mut s = self.state.lock();
        s.check(iface, "virtfn")?;
        if vf_index >= s.num_vfs {
            return Ok(Vec::new());
        }
        let delay = s.vf_delay;
        let polls = s.vf_polls.entry(vf_index).or_insert(0);
        *polls += 1;
        if *polls <= delay {
            return Ok(Vec::new());
        }
        Ok(vec![s.vf_name(vf_index)])
    }

    async fn set_link_up(&self, name: &str) -> NicResult<()> {
        let mut s = self.state.lock();
        let iface = s.interface.clone();
        s.check(&iface, "ip link set up")?;
        s.mutations += 1;
        s.link_up.push(name.to_string());
        Ok(())
    }

    async fn set_vf_mirror(&self, iface: &str, src: &str, dst: &str) -> NicResult<()> {
        let mut s = self.state.lock();
        s.check(iface, "tc")?;
        s.mutations += 1;
        if !s.mirror_supported {
            return Err(NicError::unsupported(
                iface,
                format!("hardware mirror {src} -> {dst}"),
            ));
        }
        Ok(())
    }

    async fn combined_channels(&self, iface: &str) -> NicResult<Option<u32>> {
        let s = self.state.lock();
        s.check(iface, "-l")?;
        Ok(s.queues)
    }

    async fn rx_ring(&self, iface: &str) -> NicResult<Option<u32>> {
        let s = self.state.lock();
        s.check(iface, "-g")?;
        Ok(s.rx_ring)
    }

    async fn coalesce(&self, iface: &str) -> NicResult<Coalesce> {
        let s = self.state.lock();
        s.check(iface, "-c")?;
        Ok(s.coalesce)
    }

    async fn set_combined_channels(&self, iface: &str, count: u32) -> NicResult<()> {
        let mut s = self.state.lock();
        s.tuning(iface, "-L")?;
        s.queues = Some(count);
        Ok(())
    }

    async fn set_rx_ring(&self, iface: &str, entries: u32) -> NicResult<()> {
        let mut s = self.state.lock();
        s.tuning(iface, "-G")?;
        s.rx_ring = Some(entries);
        Ok(())
    }

    async fn set_coalesce(&self, iface: &str, coalesce: &Coalesce) -> NicResult<()> {
        let mut s = self.state.lock();
        s.tuning(iface, "-C")?;
        if let Some(usecs) = coalesce.rx_usecs {
            s.coalesce.rx_usecs = Some(usecs);
        }
        if let Some(adaptive) = coalesce.adaptive_rx {
            s.coalesce.adaptive_rx = Some(adaptive);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_and_ids() {
        let nic = MockNic::new("eth0").with_rule_capacity(2);
        let a = nic.add_rule("eth0", &FlowRule::udp(1, 0)).await.unwrap();
        let b = nic.add_rule("eth0", &FlowRule::udp(2, 0)).await.unwrap();
        assert_ne!(a, b);
        let err = nic.add_rule("eth0", &FlowRule::udp(3, 0)).await.unwrap_err();
        assert!(err.is_table_full());
        assert_eq!(nic.add_attempts(), vec![1, 2, 3]);

        nic.delete_rule("eth0", a).await.unwrap();
        assert!(nic.add_rule("eth0", &FlowRule::udp(3, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_interface() {
        let nic = MockNic::new("eth0");
        assert!(!nic.interface_exists("eth1").await.unwrap());
        assert!(matches!(
            nic.list_rules("eth1").await,
            Err(NicError::InterfaceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_vf_delay() {
        let nic = MockNic::new("eth0").with_sriov(2).with_vf_delay(1);
        nic.set_sriov_num_vfs("eth0", 1).await.unwrap();
        assert!(nic.vf_interface_names("eth0", 0).await.unwrap().is_empty());
        assert_eq!(nic.vf_interface_names("eth0", 0).await.unwrap(), vec!["eth0v0"]);
        assert!(nic.vf_interface_names("eth0", 1).await.unwrap().is_empty());
        assert!(nic.set_sriov_num_vfs("eth0", 2).await.is_err());
    }

    #[tokio::test]
    async fn test_hidden_port_not_listed() {
        let nic = MockNic::new("eth0");
        nic.silently_drop_port(9);
        let id = nic.add_rule("eth0", &FlowRule::udp(9, 0)).await.unwrap();
        assert!(nic.has_rule_id(id));
        assert!(nic.list_rules_now().is_empty());
    }
}

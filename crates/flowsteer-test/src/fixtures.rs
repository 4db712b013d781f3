//! Test fixtures for common flowsteer scenarios
//!
//! Provides preconfigured devices and scratch directories for lock files
//! and ownership records.

use std::path::{Path, PathBuf};
use std::sync::Once;

use flowsteer_common::FlowRule;

use crate::MockNic;

/// Interface name used by the fixtures.
pub const TEST_IFACE: &str = "eth0";

/// One UDP rule per port in `start..=end`, all to `queue`.
pub fn udp_rules(start: u16, end: u16, queue: u32) -> Vec<FlowRule> {
    (start..=end).map(|p| FlowRule::udp(p, queue)).collect()
}

/// Installs tracing output for a test run. Safe to call repeatedly.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Lock and state directories that live as long as the test.
#[derive(Debug)]
pub struct ScratchDirs {
    root: tempfile::TempDir,
}

impl ScratchDirs {
    /// # Panics
    /// If the temporary directory cannot be created.
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("Failed to create scratch directory"),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.path().join("lock")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.path().join("state")
    }
}

impl Default for ScratchDirs {
    fn default() -> Self {
        Self::new()
    }
}

/// Common device fixtures
pub mod devices {
    use super::*;

    /// A multi-queue NIC with ntuple already on, as after driver load on
    /// most XDP-capable hardware.
    pub fn xdp_nic() -> MockNic {
        MockNic::new(TEST_IFACE).with_queues(8).with_ntuple_enabled()
    }

    /// A NIC whose rule table holds at most `capacity` rules.
    pub fn small_table_nic(capacity: usize) -> MockNic {
        xdp_nic().with_rule_capacity(capacity)
    }

    /// A NIC with SR-IOV support whose VFs take `delay` polls to appear.
    pub fn sriov_nic(max_vfs: u32, delay: u32) -> MockNic {
        xdp_nic().with_sriov(max_vfs).with_vf_delay(delay)
    }

    /// A NIC with unrelated rules already installed: DNS and NTP steering
    /// plus one rule flowsteer cannot interpret.
    pub fn shared_nic() -> MockNic {
        let nic = xdp_nic();
        nic.preload_rule(FlowRule::udp(53, 1));
        nic.preload_rule(FlowRule::udp(123, 2));
        nic.preload_foreign_rule();
        nic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_rules() {
        let rules = udp_rules(8000, 8002, 3);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[2], FlowRule::udp(8002, 3));
    }

    #[test]
    fn test_shared_nic_has_three_rules() {
        let nic = devices::shared_nic();
        assert_eq!(nic.list_rules_now().len(), 3);
        assert_eq!(nic.mutation_count(), 0);
    }

    #[test]
    fn test_scratch_dirs_are_distinct() {
        let dirs = ScratchDirs::new();
        assert_ne!(dirs.lock_dir(), dirs.state_dir());
        assert!(dirs.lock_dir().starts_with(dirs.root()));
    }
}

//! The NIC control surface consumed by the reconciliation engine.
//!
//! [`NicControl`] is the only way the engine reads or mutates a device.
//! [`crate::LinuxNic`] implements it over ethtool, iproute2 and sysfs;
//! tests implement it in memory.

use async_trait::async_trait;

use crate::error::NicResult;
use crate::types::{AppliedRuleTable, Coalesce, DriverInfo, Feature, FeatureState, FlowRule};

/// Query/mutate operations on a NIC and its virtual functions.
///
/// Every method takes the interface name explicitly; implementations keep
/// no per-interface state between calls.
#[async_trait]
pub trait NicControl: Send + Sync {
    /// Returns true if the interface exists.
    async fn interface_exists(&self, iface: &str) -> NicResult<bool>;

    /// Driver identity.
    async fn driver_info(&self, iface: &str) -> NicResult<DriverInfo>;

    /// Number of receive queues, `None` if the driver does not report it.
    async fn queue_count(&self, iface: &str) -> NicResult<Option<u32>>;

    /// Feature state, `None` if the driver does not list the feature.
    async fn feature(&self, iface: &str, feature: Feature) -> NicResult<Option<FeatureState>>;

    /// Enables or disables a feature.
    async fn set_feature(&self, iface: &str, feature: Feature, enabled: bool) -> NicResult<()>;

    /// Current hardware rule table.
    async fn list_rules(&self, iface: &str) -> NicResult<AppliedRuleTable>;

    /// Installs a rule and returns its device-local id.
    async fn add_rule(&self, iface: &str, rule: &FlowRule) -> NicResult<u32>;

    /// Removes a rule by device-local id.
    async fn delete_rule(&self, iface: &str, rule_id: u32) -> NicResult<()>;

    /// Maximum VF count, `None` if the device has no SR-IOV capability.
    async fn sriov_total_vfs(&self, iface: &str) -> NicResult<Option<u32>>;

    /// Currently enabled VF count.
    async fn sriov_num_vfs(&self, iface: &str) -> NicResult<u32>;

    /// Writes the VF count. Most drivers require writing 0 before a
    /// different non-zero value.
    async fn set_sriov_num_vfs(&self, iface: &str, count: u32) -> NicResult<()>;

    /// Net interface names of VF `vf_index`; empty until the kernel has
    /// materialized it.
    async fn vf_interface_names(&self, iface: &str, vf_index: u32) -> NicResult<Vec<String>>;

    /// Brings an interface administratively up.
    async fn set_link_up(&self, name: &str) -> NicResult<()>;

    /// Mirrors all ingress traffic of `src` to `dst`.
    ///
    /// Returns [`crate::NicError::Unsupported`] when the hardware or driver
    /// cannot do it.
    async fn set_vf_mirror(&self, iface: &str, src: &str, dst: &str) -> NicResult<()>;

    /// Current combined channel count, `None` if the driver reports none.
    async fn combined_channels(&self, iface: &str) -> NicResult<Option<u32>>;

    /// Current RX ring size, `None` if the driver reports none.
    async fn rx_ring(&self, iface: &str) -> NicResult<Option<u32>>;

    /// Current interrupt coalescing parameters.
    async fn coalesce(&self, iface: &str) -> NicResult<Coalesce>;

    /// Sets the combined channel count.
    async fn set_combined_channels(&self, iface: &str, count: u32) -> NicResult<()>;

    /// Sets the RX ring size.
    async fn set_rx_ring(&self, iface: &str, entries: u32) -> NicResult<()>;

    /// Sets interrupt coalescing parameters.
    async fn set_coalesce(&self, iface: &str, coalesce: &Coalesce) -> NicResult<()>;
}

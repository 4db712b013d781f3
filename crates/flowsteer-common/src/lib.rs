//! NIC control surface for flowsteer.
//!
//! This crate is everything flowsteer knows about talking to a device:
//!
//! - [`types`]: typed rule, feature and channel model
//! - [`device`]: the [`NicControl`] trait the reconciliation engine runs against
//! - [`LinuxNic`]: the production transport over ethtool, iproute2, tc and sysfs
//! - [`ethtool`]: parsers for ethtool's text output (used only by [`LinuxNic`])
//! - [`shell`]: quoted shell command execution
//! - [`InterfaceLock`]: per-interface exclusive lock
//! - [`error`]: [`NicError`] and its fatal/non-fatal classification
//!
//! # Example
//!
//! ```ignore
//! use flowsteer_common::{LinuxNic, NicControl};
//!
//! let nic = LinuxNic::default();
//! let table = nic.list_rules("enp3s0f0").await?;
//! for rule in table.iter() {
//!     println!("{} {:?}", rule.id, rule.rule);
//! }
//! ```

pub mod device;
pub mod error;
pub mod ethtool;
pub mod linux;
pub mod lock;
pub mod shell;
pub mod types;

pub use device::NicControl;
pub use error::{NicError, NicResult, RejectKind};
pub use linux::{LinuxNic, ToolPaths};
pub use lock::InterfaceLock;
pub use types::{
    AppliedRule, AppliedRuleTable, ChannelCounts, Coalesce, DriverInfo, Feature, FeatureState,
    FlowRule, Protocol, RuleAction, RuleKey,
};

//! flowsteer - hardware flow steering for AF_XDP consumers.
//!
//! Reconciles a NIC's ntuple rule table so that UDP traffic for a declared
//! port range lands on the receive queue an AF_XDP socket is bound to, and
//! provisions SR-IOV virtual functions alongside it.
//!
//! Components, leaf first:
//!
//! - [`inspector`]: capability snapshot of an interface
//! - [`planner`]: policy to desired [`RuleSet`]
//! - [`applier`]: diff and converge the device rule table
//! - [`verifier`]: re-read and compare
//! - [`vf`]: SR-IOV VF lifecycle and mirroring
//! - [`orchestrator`]: locked `apply`, `teardown`, `status` and VF operations
//!
//! All device access goes through [`flowsteer_common::NicControl`].

pub mod applier;
pub mod config;
pub mod context;
pub mod error;
pub mod inspector;
pub mod ledger;
pub mod orchestrator;
pub mod planner;
pub mod result;
pub mod verifier;
pub mod vf;

pub use config::{AddPolicy, FlowsteerConfig, TuningConfig, VfPollConfig};
pub use context::DeviceContext;
pub use error::{FlowsteerError, FlowsteerResult};
pub use inspector::InterfaceInfo;
pub use ledger::{Ledger, OwnershipRecord};
pub use orchestrator::{InterfaceStatus, Orchestrator};
pub use planner::{KeySpace, PortRange, RuleSet, TrafficSplitPolicy};
pub use result::{
    FailureReason, Operation, OutcomeCounts, ReconciliationResult, RuleOutcome, RuleReport,
    VerificationVerdict, Warning, WarningKind,
};
pub use vf::{MirrorStatus, VfPhase, VfSet, VfState, VirtualFunction};

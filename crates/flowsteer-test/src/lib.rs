//! Test infrastructure for flowsteer
//!
//! Provides:
//! - [`MockNic`], an in-memory NIC with scriptable failures
//! - Device and policy fixtures for common scenarios
//! - Rule table verification helpers

pub mod fixtures;
mod mock_nic;
mod verification;

pub use fixtures::*;
pub use mock_nic::MockNic;
pub use verification::*;

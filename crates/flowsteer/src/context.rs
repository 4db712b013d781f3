//! The explicit per-operation device context.

use flowsteer_common::NicControl;

/// The device and interface one operation runs against.
///
/// Every component receives this instead of an ambient interface name.
#[derive(Clone, Copy)]
pub struct DeviceContext<'a> {
    pub nic: &'a dyn NicControl,
    pub interface: &'a str,
}

impl<'a> DeviceContext<'a> {
    pub fn new(nic: &'a dyn NicControl, interface: &'a str) -> Self {
        Self { nic, interface }
    }
}

impl std::fmt::Debug for DeviceContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("interface", &self.interface)
            .finish_non_exhaustive()
    }
}

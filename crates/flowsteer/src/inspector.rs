//! Device capability inspection.
//!
//! [`inspect`] is a pure read. It runs at the start of every operation;
//! nothing it returns is cached across invocations.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use flowsteer_common::{Feature, NicError, NicResult};

use crate::context::DeviceContext;
use crate::error::{FlowsteerError, FlowsteerResult};
use crate::result::{Warning, WarningKind};

/// Capability snapshot of one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub driver: String,
    /// Receive queue count; `None` when the driver does not report it.
    pub queue_count: Option<u32>,
    pub ntuple_supported: bool,
    pub ntuple_enabled: bool,
    pub sriov_supported: bool,
    pub max_vfs: u32,
}

impl InterfaceInfo {
    /// Non-fatal conditions worth reporting to the caller.
    pub fn warnings(&self) -> Vec<Warning> {
        let mut warnings = Vec::new();
        if self.queue_count.is_none() {
            warnings.push(Warning::new(
                WarningKind::QueueCountUnknown,
                format!(
                    "{} does not report its queue count; queue index not validated",
                    self.name
                ),
            ));
        }
        if !self.ntuple_supported {
            warnings.push(Warning::new(
                WarningKind::CapabilityUnsupported,
                format!("{} does not advertise ntuple filters", self.name),
            ));
        }
        warnings
    }
}

/// Treats "unsupported" replies as absent information.
fn optional<T>(result: NicResult<Option<T>>) -> FlowsteerResult<Option<T>> {
    match result {
        Ok(v) => Ok(v),
        Err(NicError::Unsupported { .. }) => Ok(None),
        Err(e) => Err(FlowsteerError::from_device(e)),
    }
}

/// Fails with `DeviceNotFound` unless `ctx.interface` exists.
pub async fn ensure_present(ctx: &DeviceContext<'_>) -> FlowsteerResult<()> {
    let exists = ctx
        .nic
        .interface_exists(ctx.interface)
        .await
        .map_err(FlowsteerError::from_device)?;
    if !exists {
        return Err(FlowsteerError::DeviceNotFound {
            interface: ctx.interface.to_string(),
        });
    }
    Ok(())
}

/// Reads the capability snapshot of `ctx.interface`.
#[instrument(skip(ctx), fields(interface = %ctx.interface))]
pub async fn inspect(ctx: &DeviceContext<'_>) -> FlowsteerResult<InterfaceInfo> {
    let iface = ctx.interface;
    ensure_present(ctx).await?;

    let driver = ctx
        .nic
        .driver_info(iface)
        .await
        .map_err(FlowsteerError::from_device)?;
    let queue_count = optional(ctx.nic.queue_count(iface).await)?;
    let ntuple = optional(ctx.nic.feature(iface, Feature::Ntuple).await)?;
    let total_vfs = optional(ctx.nic.sriov_total_vfs(iface).await)?;

    let info = InterfaceInfo {
        name: iface.to_string(),
        driver: driver.driver,
        queue_count,
        ntuple_supported: ntuple.map(|f| f.supported()).unwrap_or(false),
        ntuple_enabled: ntuple.map(|f| f.enabled).unwrap_or(false),
        sriov_supported: total_vfs.unwrap_or(0) > 0,
        max_vfs: total_vfs.unwrap_or(0),
    };

    for w in info.warnings() {
        warn!(kind = ?w.kind, "{}", w.message);
    }
    info!(
        driver = %info.driver,
        queues = ?info.queue_count,
        ntuple = info.ntuple_supported,
        max_vfs = info.max_vfs,
        "Inspected interface"
    );
    Ok(info)
}

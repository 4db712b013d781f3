//! SR-IOV virtual function provisioning.
//!
//! Per interface the VFs move through
//! `Absent -> Enabling -> Created -> Activating -> Active` and back through
//! `Disabling -> Absent`. The kernel creates VF net devices asynchronously
//! after the count is written, so names are polled with bounded backoff.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use flowsteer_common::NicError;

use crate::config::VfPollConfig;
use crate::context::DeviceContext;
use crate::error::{FlowsteerError, FlowsteerResult};
use crate::inspector::InterfaceInfo;
use crate::result::{Warning, WarningKind};

/// Lifecycle phase of an interface's VF set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfPhase {
    Absent,
    Enabling,
    Created,
    Activating,
    Active,
    Disabling,
}

impl fmt::Display for VfPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VfPhase::Absent => "absent",
            VfPhase::Enabling => "enabling",
            VfPhase::Created => "created",
            VfPhase::Activating => "activating",
            VfPhase::Active => "active",
            VfPhase::Disabling => "disabling",
        };
        f.write_str(s)
    }
}

/// Administrative state of one VF interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfState {
    Down,
    Up,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFunction {
    pub index: u32,
    pub name: String,
    pub state: VfState,
}

/// Outcome of a capability-gated mirror request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MirrorStatus {
    Applied { src: String, dst: String },
    Unsupported { reason: String },
    Error { reason: String },
}

/// The VFs of one interface after an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfSet {
    pub interface: String,
    pub requested_count: u32,
    pub max_supported: u32,
    pub phase: VfPhase,
    pub entries: Vec<VirtualFunction>,
    pub mirror: Option<MirrorStatus>,
    pub warnings: Vec<Warning>,
}

impl VfSet {
    fn new(info: &InterfaceInfo, requested_count: u32, phase: VfPhase) -> Self {
        Self {
            interface: info.name.clone(),
            requested_count,
            max_supported: info.max_vfs,
            phase,
            entries: Vec::new(),
            mirror: None,
            warnings: Vec::new(),
        }
    }

    fn transition(&mut self, phase: VfPhase) {
        debug!(interface = %self.interface, from = %self.phase, to = %phase, "VF phase");
        self.phase = phase;
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn get(&self, index: u32) -> Option<&VirtualFunction> {
        self.entries.iter().find(|v| v.index == index)
    }
}

impl fmt::Display for VfSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "vf {}: {} requested, {} max, {}",
            self.interface, self.requested_count, self.max_supported, self.phase
        )?;
        for vf in &self.entries {
            let state = match vf.state {
                VfState::Up => "up",
                VfState::Down => "DOWN",
            };
            writeln!(f, "  vf{} {} {}", vf.index, vf.name, state)?;
        }
        match &self.mirror {
            Some(MirrorStatus::Applied { src, dst }) => writeln!(f, "  mirror: {} -> {}", src, dst)?,
            Some(MirrorStatus::Unsupported { reason }) => {
                writeln!(f, "  mirror: unsupported ({})", reason)?
            }
            Some(MirrorStatus::Error { reason }) => writeln!(f, "  mirror: error ({})", reason)?,
            None => {}
        }
        for w in &self.warnings {
            writeln!(f, "  warning: {}", w.message)?;
        }
        Ok(())
    }
}

fn device_err(e: NicError) -> FlowsteerError {
    FlowsteerError::from_device(e)
}

/// Waits for VF `index` to get a net interface name.
async fn wait_for_vf(
    ctx: &DeviceContext<'_>,
    index: u32,
    poll: &VfPollConfig,
) -> FlowsteerResult<String> {
    let mut waited = Duration::ZERO;
    for attempt in 0..poll.attempts {
        let names = ctx
            .nic
            .vf_interface_names(ctx.interface, index)
            .await
            .map_err(device_err)?;
        if let Some(name) = names.into_iter().next() {
            debug!(vf = index, name = %name, attempt, "VF materialized");
            return Ok(name);
        }
        if attempt + 1 < poll.attempts {
            let delay = poll.backoff(attempt);
            tokio::time::sleep(delay).await;
            waited += delay;
        }
    }
    Err(FlowsteerError::VfMaterializationTimeout {
        interface: ctx.interface.to_string(),
        vf_index: index,
        waited,
    })
}

/// Enables exactly `count` VFs on the interface and brings them up.
///
/// When the device already has `count` VFs the disable/re-enable cycle is
/// skipped, so repeated calls return the same VF names.
#[instrument(skip(ctx, info, poll), fields(interface = %ctx.interface))]
pub async fn enable_vfs(
    ctx: &DeviceContext<'_>,
    info: &InterfaceInfo,
    count: u32,
    poll: &VfPollConfig,
) -> FlowsteerResult<VfSet> {
    if !info.sriov_supported {
        return Err(FlowsteerError::SriovUnsupported {
            interface: ctx.interface.to_string(),
        });
    }
    if count > info.max_vfs {
        return Err(FlowsteerError::VfCountExceedsMax {
            interface: ctx.interface.to_string(),
            requested: count,
            max: info.max_vfs,
        });
    }
    if count == 0 {
        return disable_vfs(ctx, info).await;
    }

    let current = ctx
        .nic
        .sriov_num_vfs(ctx.interface)
        .await
        .map_err(device_err)?;
    let mut set = VfSet::new(info, count, if current > 0 { VfPhase::Active } else { VfPhase::Absent });

    if current == count {
        info!(count, "VF count already matches, skipping re-enable");
    } else {
        if current != 0 {
            set.transition(VfPhase::Disabling);
            ctx.nic
                .set_sriov_num_vfs(ctx.interface, 0)
                .await
                .map_err(device_err)?;
            set.transition(VfPhase::Absent);
        }
        set.transition(VfPhase::Enabling);
        ctx.nic
            .set_sriov_num_vfs(ctx.interface, count)
            .await
            .map_err(device_err)?;
        info!(count, previous = current, "Wrote VF count");
    }

    let mut names = Vec::with_capacity(count as usize);
    for index in 0..count {
        names.push(wait_for_vf(ctx, index, poll).await?);
    }
    set.transition(VfPhase::Created);

    set.transition(VfPhase::Activating);
    for (index, name) in (0..count).zip(names) {
        let state = match ctx.nic.set_link_up(&name).await {
            Ok(()) => VfState::Up,
            Err(e) if e.is_fatal() => return Err(device_err(e)),
            Err(e) => {
                warn!(vf = index, name = %name, "Could not bring VF up: {}", e);
                set.warnings.push(Warning::new(
                    WarningKind::CapabilityUnsupported,
                    format!("VF {} ({}) left down: {}", index, name, e.reason()),
                ));
                VfState::Down
            }
        };
        set.entries.push(VirtualFunction { index, name, state });
    }
    set.transition(VfPhase::Active);
    info!(vfs = ?set.names(), "VFs active");
    Ok(set)
}

/// Disables all VFs. A device without VFs is left untouched.
#[instrument(skip(ctx, info), fields(interface = %ctx.interface))]
pub async fn disable_vfs(ctx: &DeviceContext<'_>, info: &InterfaceInfo) -> FlowsteerResult<VfSet> {
    let mut set = VfSet::new(info, 0, VfPhase::Absent);
    if !info.sriov_supported {
        return Ok(set);
    }
    let current = ctx
        .nic
        .sriov_num_vfs(ctx.interface)
        .await
        .map_err(device_err)?;
    if current == 0 {
        debug!("No VFs enabled");
        return Ok(set);
    }
    set.phase = VfPhase::Active;
    set.transition(VfPhase::Disabling);
    ctx.nic
        .set_sriov_num_vfs(ctx.interface, 0)
        .await
        .map_err(device_err)?;
    set.transition(VfPhase::Absent);
    info!(previous = current, "Disabled VFs");
    Ok(set)
}

/// Mirrors traffic arriving on VF `src` to VF `dst`.
///
/// Hardware mirroring is optional; its absence is reported, not raised.
#[instrument(skip(ctx, set), fields(interface = %ctx.interface))]
pub async fn mirror(
    ctx: &DeviceContext<'_>,
    set: &mut VfSet,
    src: u32,
    dst: u32,
) -> FlowsteerResult<MirrorStatus> {
    let (src_name, dst_name) = match (set.get(src), set.get(dst)) {
        (Some(a), Some(b)) if src != dst => (a.name.clone(), b.name.clone()),
        _ => {
            let status = MirrorStatus::Error {
                reason: format!("VF pair {src}:{dst} is not a pair of distinct active VFs"),
            };
            set.mirror = Some(status.clone());
            return Ok(status);
        }
    };

    let status = match ctx
        .nic
        .set_vf_mirror(ctx.interface, &src_name, &dst_name)
        .await
    {
        Ok(()) => {
            info!(src = %src_name, dst = %dst_name, "Mirroring configured");
            MirrorStatus::Applied {
                src: src_name,
                dst: dst_name,
            }
        }
        Err(NicError::Unsupported { operation, .. }) => {
            warn!("Mirroring unsupported: {}", operation);
            set.warnings.push(Warning::new(
                WarningKind::MirrorUnsupported,
                format!("{} cannot mirror {} -> {}", ctx.interface, src_name, dst_name),
            ));
            MirrorStatus::Unsupported { reason: operation }
        }
        Err(e) if e.is_fatal() => return Err(device_err(e)),
        Err(e) => MirrorStatus::Error { reason: e.reason() },
    };
    set.mirror = Some(status.clone());
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::inspect;
    use flowsteer_test::MockNic;
    use pretty_assertions::assert_eq;

    fn fast_poll(attempts: u32) -> VfPollConfig {
        VfPollConfig {
            attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    async fn info_for(nic: &MockNic) -> InterfaceInfo {
        inspect(&DeviceContext::new(nic, "eth0")).await.unwrap()
    }

    #[tokio::test]
    async fn test_enable_vfs_waits_for_materialization() {
        let nic = MockNic::new("eth0").with_sriov(8).with_vf_delay(2);
        let info = info_for(&nic).await;
        let ctx = DeviceContext::new(&nic, "eth0");

        let set = enable_vfs(&ctx, &info, 2, &fast_poll(5)).await.unwrap();
        assert_eq!(set.phase, VfPhase::Active);
        assert_eq!(set.names(), vec!["eth0v0", "eth0v1"]);
        assert!(set.entries.iter().all(|v| v.state == VfState::Up));
        assert_eq!(nic.sriov_writes(), vec![2]);
    }

    #[tokio::test]
    async fn test_enable_vfs_resets_different_count() {
        let nic = MockNic::new("eth0").with_sriov(8);
        let info = info_for(&nic).await;
        let ctx = DeviceContext::new(&nic, "eth0");

        enable_vfs(&ctx, &info, 4, &fast_poll(3)).await.unwrap();
        let set = enable_vfs(&ctx, &info, 2, &fast_poll(3)).await.unwrap();
        assert_eq!(set.entries.len(), 2);
        assert_eq!(nic.sriov_writes(), vec![4, 0, 2]);
    }

    #[tokio::test]
    async fn test_enable_vfs_timeout() {
        let nic = MockNic::new("eth0").with_sriov(8).with_vf_delay(100);
        let info = info_for(&nic).await;
        let ctx = DeviceContext::new(&nic, "eth0");

        let err = enable_vfs(&ctx, &info, 1, &fast_poll(3)).await.unwrap_err();
        assert!(matches!(
            err,
            FlowsteerError::VfMaterializationTimeout { vf_index: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_enable_vfs_preconditions() {
        let nic = MockNic::new("eth0").with_sriov(4);
        let info = info_for(&nic).await;
        let ctx = DeviceContext::new(&nic, "eth0");
        let err = enable_vfs(&ctx, &info, 5, &fast_poll(1)).await.unwrap_err();
        assert!(matches!(
            err,
            FlowsteerError::VfCountExceedsMax {
                requested: 5,
                max: 4,
                ..
            }
        ));

        let plain = MockNic::new("eth0");
        let info = info_for(&plain).await;
        let err = enable_vfs(&DeviceContext::new(&plain, "eth0"), &info, 1, &fast_poll(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowsteerError::SriovUnsupported { .. }));
    }

    #[tokio::test]
    async fn test_disable_vfs_idempotent() {
        let nic = MockNic::new("eth0").with_sriov(8);
        let info = info_for(&nic).await;
        let ctx = DeviceContext::new(&nic, "eth0");

        enable_vfs(&ctx, &info, 2, &fast_poll(3)).await.unwrap();
        let set = disable_vfs(&ctx, &info).await.unwrap();
        assert_eq!(set.phase, VfPhase::Absent);
        disable_vfs(&ctx, &info).await.unwrap();
        assert_eq!(nic.sriov_writes(), vec![2, 0]);
    }

    #[tokio::test]
    async fn test_mirror_tri_state() {
        let nic = MockNic::new("eth0").with_sriov(8);
        let info = info_for(&nic).await;
        let ctx = DeviceContext::new(&nic, "eth0");
        let mut set = enable_vfs(&ctx, &info, 2, &fast_poll(3)).await.unwrap();

        assert_eq!(
            mirror(&ctx, &mut set, 0, 1).await.unwrap(),
            MirrorStatus::Unsupported {
                reason: "hardware mirror eth0v0 -> eth0v1".to_string()
            }
        );
        assert_eq!(set.warnings[0].kind, WarningKind::MirrorUnsupported);

        nic.support_mirroring();
        assert!(matches!(
            mirror(&ctx, &mut set, 0, 1).await.unwrap(),
            MirrorStatus::Applied { .. }
        ));
        assert!(matches!(
            mirror(&ctx, &mut set, 0, 7).await.unwrap(),
            MirrorStatus::Error { .. }
        ));
    }
}

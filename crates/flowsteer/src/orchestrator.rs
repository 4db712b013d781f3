//! Top-level operations: apply, teardown, status and VF provisioning.
//!
//! Every mutating operation holds the interface lock for its whole
//! duration and re-reads the device before deciding anything, so it is
//! safe to re-run after an interrupted or partially failed invocation.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use flowsteer_common::{
    AppliedRuleTable, Coalesce, InterfaceLock, NicControl, NicResult, Protocol,
};

use crate::applier::{self, StaleRule};
use crate::config::{FlowsteerConfig, TuningConfig};
use crate::context::DeviceContext;
use crate::error::{FlowsteerError, FlowsteerResult};
use crate::inspector::{ensure_present, inspect, InterfaceInfo};
use crate::ledger::{Ledger, OwnershipRecord};
use crate::planner::{self, KeySpace, PortRange, RuleSet, TrafficSplitPolicy};
use crate::result::{
    Operation, ReconciliationResult, VerificationVerdict, Warning, WarningKind,
};
use crate::verifier;
use crate::vf::{self, MirrorStatus, VfSet};

/// Read-only view of one interface.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    pub info: InterfaceInfo,
    pub rules: AppliedRuleTable,
    pub vf_count: Option<u32>,
    pub ownership: Option<OwnershipRecord>,
}

impl InterfaceStatus {
    /// Rules inside the recorded key space.
    pub fn owned_rules(&self) -> usize {
        match &self.ownership {
            Some(record) => self
                .rules
                .owned_by(|k| record.key_space.contains(k))
                .count(),
            None => 0,
        }
    }
}

impl fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = &self.info;
        writeln!(f, "{} (driver {})", info.name, info.driver)?;
        match info.queue_count {
            Some(q) => writeln!(f, "  queues: {}", q)?,
            None => writeln!(f, "  queues: unknown")?,
        }
        writeln!(
            f,
            "  ntuple: {}",
            match (info.ntuple_supported, info.ntuple_enabled) {
                (false, _) => "unsupported",
                (true, true) => "on",
                (true, false) => "off",
            }
        )?;
        if info.sriov_supported {
            writeln!(
                f,
                "  sriov: {} of {} VFs",
                self.vf_count.unwrap_or(0),
                info.max_vfs
            )?;
        } else {
            writeln!(f, "  sriov: unsupported")?;
        }
        writeln!(
            f,
            "  rules: {} total, {} owned",
            self.rules.len(),
            self.owned_rules()
        )?;
        for rule in self.rules.iter() {
            match &rule.rule {
                Some(r) => writeln!(f, "    [{}] {}", rule.id, r)?,
                None => writeln!(f, "    [{}] (foreign)", rule.id)?,
            }
        }
        if let Some(record) = &self.ownership {
            for range in &record.key_space.ranges {
                writeln!(f, "  owned: UDP {} -> queue {}", range, record.queue)?;
            }
        }
        Ok(())
    }
}

/// Sequences inspection, planning, application and verification against
/// one device control surface.
pub struct Orchestrator<'a> {
    nic: &'a dyn NicControl,
    config: &'a FlowsteerConfig,
    ledger: Ledger,
}

impl fmt::Debug for Orchestrator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", self.config)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl<'a> Orchestrator<'a> {
    pub fn new(nic: &'a dyn NicControl, config: &'a FlowsteerConfig) -> Self {
        Self {
            nic,
            config,
            ledger: Ledger::new(&config.state_dir),
        }
    }

    fn lock(&self, interface: &str) -> FlowsteerResult<InterfaceLock> {
        InterfaceLock::acquire(&self.config.lock_dir, interface)
            .map_err(|e| FlowsteerError::from_lock(interface, e))
    }

    /// Loads the ledger record, treating an unreadable one as absent.
    async fn previous_record(
        &self,
        interface: &str,
        warnings: &mut Vec<Warning>,
    ) -> Option<OwnershipRecord> {
        match self.ledger.load(interface).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring ownership record: {}", e);
                warnings.push(Warning::new(
                    WarningKind::NoOwnershipRecord,
                    format!("ignored unreadable ownership record: {}", e),
                ));
                None
            }
        }
    }

    /// Converges the device onto `policy`.
    ///
    /// Returns `Err` only for conditions that stop the run before or during
    /// application (lock held, unknown device, invalid policy, control
    /// surface failure). Per-rule failures and verification mismatches are
    /// reported in the result.
    #[instrument(skip(self, policy), fields(interface = %policy.interface, range = %policy.port_range(), queue = policy.xdp_queue))]
    pub async fn apply(&self, policy: &TrafficSplitPolicy) -> FlowsteerResult<ReconciliationResult> {
        let interface = policy.interface.as_str();
        let _lock = self.lock(interface)?;
        let ctx = DeviceContext::new(self.nic, interface);
        let mut warnings = Vec::new();

        ensure_present(&ctx).await?;
        apply_tuning(&ctx, &self.config.tuning, &mut warnings).await?;

        let info = inspect(&ctx).await?;
        warnings.extend(info.warnings());
        let desired = planner::plan(policy, &info)?;

        let mut owned = policy.key_space();
        if let Some(previous) = self.previous_record(interface, &mut warnings).await {
            owned = owned.union(&previous.key_space);
        }
        // Claim the widest key space before touching the device so an
        // interrupted run can be cleaned up by the next one.
        self.ledger
            .store(&OwnershipRecord {
                interface: interface.to_string(),
                key_space: owned.clone(),
                queue: policy.xdp_queue,
            })
            .await?;

        let actual = self.nic.list_rules(interface).await.map_err(FlowsteerError::from_device)?;
        let mut result =
            applier::reconcile(&ctx, &desired, &actual, &owned, self.config.add_policy).await?;
        let verdict = verifier::verify(&ctx, &desired, &owned).await?;

        let leftovers = match &verdict {
            VerificationVerdict::Mismatch { unexpected, .. } => unexpected
                .iter()
                .any(|p| !policy.port_range().contains(*p)),
            VerificationVerdict::Match => false,
        };
        if !leftovers {
            self.ledger
                .store(&OwnershipRecord::for_policy(policy))
                .await?;
        }

        result.verdict = Some(verdict);
        warnings.append(&mut result.warnings);
        result.warnings = warnings;

        let c = result.counts();
        info!(
            added = c.added,
            already_present = c.already_present,
            deleted = c.deleted,
            failed = c.failed,
            "Apply complete"
        );
        Ok(result)
    }

    /// Removes every rule this system owns on `interface`.
    ///
    /// Ownership comes from the ledger, widened by `ports` when given. With
    /// neither, nothing is deleted and a warning is reported.
    #[instrument(skip(self))]
    pub async fn teardown(
        &self,
        interface: &str,
        ports: Option<PortRange>,
    ) -> FlowsteerResult<ReconciliationResult> {
        let _lock = self.lock(interface)?;
        let ctx = DeviceContext::new(self.nic, interface);
        let mut result = ReconciliationResult::new(Operation::Teardown, interface);

        let info = inspect(&ctx).await?;
        result.warnings.extend(info.warnings());

        let mut owned = match ports {
            Some(range) => {
                if range.is_empty() {
                    return Err(FlowsteerError::invalid_policy(
                        "port_range",
                        format!("range {} is empty", range),
                    ));
                }
                KeySpace::new(Protocol::Udp, vec![range])
            }
            None => KeySpace::empty(),
        };
        let previous = self.previous_record(interface, &mut result.warnings).await;
        if let Some(record) = &previous {
            owned = owned.union(&record.key_space);
        }
        if owned.is_empty() {
            warn!("No ownership record and no port range; nothing to remove");
            result.warn(Warning::new(
                WarningKind::NoOwnershipRecord,
                format!(
                    "no ownership record for {}; pass --ports to name the rules to remove",
                    interface
                ),
            ));
            return Ok(result);
        }

        let table = self.nic.list_rules(interface).await.map_err(FlowsteerError::from_device)?;
        let stale: Vec<StaleRule> = table
            .owned_by(|k| owned.contains(k))
            .filter_map(|applied| {
                applied.rule.map(|rule| StaleRule {
                    id: applied.id,
                    rule,
                })
            })
            .collect();
        applier::delete_rules(&ctx, &stale, &mut result).await?;

        let verdict = verifier::verify(&ctx, &RuleSet::default(), &owned).await?;
        if verdict.is_match() {
            self.ledger.remove(interface).await?;
        } else {
            // Keep the record so a re-run can finish the job.
            self.ledger
                .store(&OwnershipRecord {
                    interface: interface.to_string(),
                    key_space: owned,
                    queue: previous.map_or(0, |r| r.queue),
                })
                .await?;
        }
        result.verdict = Some(verdict);

        info!(
            deleted = result.counts().deleted,
            failed = result.counts().failed,
            "Teardown complete"
        );
        Ok(result)
    }

    /// Reads the interface's capabilities, rules and VF count.
    #[instrument(skip(self))]
    pub async fn status(&self, interface: &str) -> FlowsteerResult<InterfaceStatus> {
        let ctx = DeviceContext::new(self.nic, interface);
        let info = inspect(&ctx).await?;
        let rules = match self.nic.list_rules(interface).await {
            Ok(table) => table,
            Err(e) if e.is_fatal() => return Err(FlowsteerError::from_device(e)),
            Err(e) => {
                debug!("Rule table unreadable: {}", e);
                AppliedRuleTable::default()
            }
        };
        let vf_count = if info.sriov_supported {
            Some(
                self.nic
                    .sriov_num_vfs(interface)
                    .await
                    .map_err(FlowsteerError::from_device)?,
            )
        } else {
            None
        };
        let mut ignored = Vec::new();
        let ownership = self.previous_record(interface, &mut ignored).await;
        Ok(InterfaceStatus {
            info,
            rules,
            vf_count,
            ownership,
        })
    }

    /// Enables `count` VFs and optionally mirrors VF `a` onto VF `b`.
    #[instrument(skip(self))]
    pub async fn enable_vfs(
        &self,
        interface: &str,
        count: u32,
        mirror: Option<(u32, u32)>,
    ) -> FlowsteerResult<VfSet> {
        let _lock = self.lock(interface)?;
        let ctx = DeviceContext::new(self.nic, interface);
        let info = inspect(&ctx).await?;
        let mut set = vf::enable_vfs(&ctx, &info, count, &self.config.vf_poll).await?;
        if let Some((a, b)) = mirror {
            let status = vf::mirror(&ctx, &mut set, a, b).await?;
            if let MirrorStatus::Error { reason } = &status {
                warn!(src = a, dst = b, "Mirroring failed: {}", reason);
            }
        }
        Ok(set)
    }

    #[instrument(skip(self))]
    pub async fn disable_vfs(&self, interface: &str) -> FlowsteerResult<VfSet> {
        let _lock = self.lock(interface)?;
        let ctx = DeviceContext::new(self.nic, interface);
        let info = inspect(&ctx).await?;
        vf::disable_vfs(&ctx, &info).await
    }
}

/// Applies the tuning passthrough. Settings the device already has are
/// left alone; each refused setting becomes a warning.
async fn apply_tuning(
    ctx: &DeviceContext<'_>,
    tuning: &TuningConfig,
    warnings: &mut Vec<Warning>,
) -> FlowsteerResult<()> {
    if tuning.is_empty() {
        return Ok(());
    }
    let iface = ctx.interface;
    if let Some(n) = tuning.combined_channels {
        if current(ctx.nic.combined_channels(iface).await)? != Some(Some(n)) {
            let res = ctx.nic.set_combined_channels(iface, n).await;
            tuning_step(ctx, res, &format!("combined channels = {n}"), warnings)?;
        }
    }
    if let Some(n) = tuning.rx_ring {
        if current(ctx.nic.rx_ring(iface).await)? != Some(Some(n)) {
            let res = ctx.nic.set_rx_ring(iface, n).await;
            tuning_step(ctx, res, &format!("rx ring = {n}"), warnings)?;
        }
    }
    let wanted = tuning.coalesce();
    if !wanted.is_empty() {
        let changes = match current(ctx.nic.coalesce(iface).await)? {
            Some(have) => Coalesce {
                rx_usecs: wanted.rx_usecs.filter(|v| have.rx_usecs != Some(*v)),
                adaptive_rx: wanted.adaptive_rx.filter(|v| have.adaptive_rx != Some(*v)),
            },
            None => wanted,
        };
        if !changes.is_empty() {
            let res = ctx.nic.set_coalesce(iface, &changes).await;
            tuning_step(ctx, res, "interrupt coalescing", warnings)?;
        }
    }
    Ok(())
}

/// A current tuning value, `None` when it cannot be read and the setting
/// should simply be written.
fn current<T>(res: NicResult<T>) -> FlowsteerResult<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_fatal() => Err(FlowsteerError::from_device(e)),
        Err(e) => {
            debug!("Current tuning value unreadable: {}", e);
            Ok(None)
        }
    }
}

fn tuning_step(
    ctx: &DeviceContext<'_>,
    res: NicResult<()>,
    what: &str,
    warnings: &mut Vec<Warning>,
) -> FlowsteerResult<()> {
    match res {
        Ok(()) => {
            info!("Set {} on {}", what, ctx.interface);
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(FlowsteerError::from_device(e)),
        Err(e) => {
            warn!("Could not set {} on {}: {}", what, ctx.interface, e);
            warnings.push(Warning::new(
                WarningKind::TuningFailed,
                format!("could not set {} on {}: {}", what, ctx.interface, e.reason()),
            ));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::RuleOutcome;
    use flowsteer_common::FlowRule;
    use flowsteer_test::MockNic;
    use pretty_assertions::assert_eq;

    fn config(dir: &tempfile::TempDir) -> FlowsteerConfig {
        FlowsteerConfig {
            lock_dir: dir.path().join("lock"),
            state_dir: dir.path().join("state"),
            ..Default::default()
        }
    }

    fn policy(start: u16, end: u16) -> TrafficSplitPolicy {
        TrafficSplitPolicy::new("eth0", 0, PortRange::new(start, end))
    }

    #[tokio::test]
    async fn test_apply_records_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let nic = MockNic::new("eth0");
        let orch = Orchestrator::new(&nic, &config);

        let result = orch.apply(&policy(8000, 8003)).await.unwrap();
        assert!(result.is_success());
        let record = Ledger::new(&config.state_dir).load("eth0").await.unwrap().unwrap();
        assert_eq!(record, OwnershipRecord::for_policy(&policy(8000, 8003)));
    }

    #[tokio::test]
    async fn test_apply_narrowing_range_cleans_previous() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let nic = MockNic::new("eth0");
        let orch = Orchestrator::new(&nic, &config);

        orch.apply(&policy(8000, 8009)).await.unwrap();
        let result = orch.apply(&policy(8000, 8004)).await.unwrap();
        assert_eq!(result.counts().deleted, 5);
        assert_eq!(result.counts().already_present, 5);
        assert_eq!(result.verdict, Some(VerificationVerdict::Match));
        assert_eq!(nic.list_rules_now().len(), 5);
    }

    #[tokio::test]
    async fn test_apply_tuning_failure_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.tuning.combined_channels = Some(4);
        config.tuning.rx_ring = Some(4096);
        let nic = MockNic::new("eth0").with_queues(8);
        nic.refuse_tuning();
        let orch = Orchestrator::new(&nic, &config);

        let result = orch.apply(&policy(8000, 8001)).await.unwrap();
        let kinds: Vec<_> = result.warnings.iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WarningKind::TuningFailed, WarningKind::TuningFailed]);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_apply_tuning_changes_queue_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.tuning.combined_channels = Some(2);
        let nic = MockNic::new("eth0").with_queues(8);
        let orch = Orchestrator::new(&nic, &config);

        let err = orch
            .apply(&TrafficSplitPolicy::new("eth0", 4, PortRange::new(8000, 8001)))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowsteerError::InvalidPolicy { .. }));
        assert_eq!(nic.queue_count_now(), Some(2));
    }

    #[tokio::test]
    async fn test_reapply_leaves_matching_tuning_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.tuning = TuningConfig {
            combined_channels: Some(8),
            rx_ring: Some(4096),
            rx_usecs: Some(0),
            adaptive_rx: None,
        };
        let nic = MockNic::new("eth0").with_queues(8);
        let orch = Orchestrator::new(&nic, &config);

        let first = orch.apply(&policy(8000, 8003)).await.unwrap();
        assert!(first.warnings.is_empty());
        assert_eq!(nic.queue_count_now(), Some(8));
        assert_eq!(nic.rx_ring_now(), Some(4096));
        // Adaptive mode was not configured, so it keeps the device value.
        assert_eq!(
            nic.coalesce_now(),
            Coalesce {
                rx_usecs: Some(0),
                adaptive_rx: Some(true),
            }
        );

        nic.reset_history();
        let second = orch.apply(&policy(8000, 8003)).await.unwrap();
        assert!(second.all_already_present());
        assert!(second.warnings.is_empty());
        assert_eq!(nic.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_tuning_skipped_for_missing_interface() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.tuning.rx_ring = Some(4096);
        let nic = MockNic::new("eth0");
        let orch = Orchestrator::new(&nic, &config);

        let err = orch
            .apply(&TrafficSplitPolicy::new("eth7", 0, PortRange::new(8000, 8001)))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowsteerError::DeviceNotFound { .. }));
        assert_eq!(nic.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_apply_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let nic = MockNic::new("eth0");
        let orch = Orchestrator::new(&nic, &config);

        let _held = InterfaceLock::acquire(&config.lock_dir, "eth0").unwrap();
        let err = orch.apply(&policy(8000, 8001)).await.unwrap_err();
        assert!(matches!(err, FlowsteerError::LockHeld { .. }));
        assert_eq!(nic.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_without_record_warns() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let nic = MockNic::new("eth0");
        nic.preload_rule(FlowRule::udp(8000, 0));
        let orch = Orchestrator::new(&nic, &config);

        let result = orch.teardown("eth0", None).await.unwrap();
        assert_eq!(result.warnings[0].kind, WarningKind::NoOwnershipRecord);
        assert_eq!(nic.list_rules_now().len(), 1);

        let result = orch
            .teardown("eth0", Some(PortRange::new(8000, 8000)))
            .await
            .unwrap();
        assert_eq!(result.counts().deleted, 1);
        assert!(nic.list_rules_now().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_keeps_record_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let nic = MockNic::new("eth0");
        let orch = Orchestrator::new(&nic, &config);
        let applied = orch.apply(&policy(8000, 8001)).await.unwrap();
        let RuleOutcome::Applied { rule_id } = applied.rules[0].outcome else {
            panic!("expected applied rule, got {:?}", applied.rules[0].outcome);
        };
        nic.fail_delete(rule_id);

        let result = orch.teardown("eth0", None).await.unwrap();
        assert_eq!(result.counts().failed, 1);
        assert!(!result.is_success());
        assert!(Ledger::new(&config.state_dir).load("eth0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let nic = MockNic::new("eth0").with_sriov(4);
        nic.preload_rule(FlowRule::udp(53, 1));
        let orch = Orchestrator::new(&nic, &config);
        orch.apply(&policy(8000, 8001)).await.unwrap();

        let status = orch.status("eth0").await.unwrap();
        assert_eq!(status.rules.len(), 3);
        assert_eq!(status.owned_rules(), 2);
        assert_eq!(status.vf_count, Some(0));
        let text = status.to_string();
        assert!(text.contains("rules: 3 total, 2 owned"));
        assert!(text.contains("owned: UDP 8000-8001 -> queue 0"));
    }

    #[tokio::test]
    async fn test_enable_vfs_with_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.vf_poll.initial_backoff_ms = 1;
        config.vf_poll.max_backoff_ms = 1;
        let nic = MockNic::new("eth0").with_sriov(4);
        let orch = Orchestrator::new(&nic, &config);

        let set = orch.enable_vfs("eth0", 2, Some((0, 1))).await.unwrap();
        assert!(matches!(set.mirror, Some(MirrorStatus::Unsupported { .. })));
        assert_eq!(set.warnings[0].kind, WarningKind::MirrorUnsupported);

        let set = orch.disable_vfs("eth0").await.unwrap();
        assert!(set.entries.is_empty());
    }
}

//! Rule reconciliation: diff desired against actual and converge.
//!
//! Deletions are best-effort and all happen before the first addition.
//! Additions run in ascending port order; under [`AddPolicy::FailFast`]
//! the first rejection stops further additions and every remaining port
//! is reported failed with the same reason.

use std::collections::HashMap;

use tracing::{debug, info, instrument, warn};

use flowsteer_common::{AppliedRuleTable, Feature, FlowRule, NicError, RuleKey};

use crate::config::AddPolicy;
use crate::context::DeviceContext;
use crate::error::{FlowsteerError, FlowsteerResult};
use crate::planner::{KeySpace, RuleSet};
use crate::result::{
    FailureReason, Operation, ReconciliationResult, RuleOutcome, Warning, WarningKind,
};

/// A device rule scheduled for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleRule {
    pub id: u32,
    pub rule: FlowRule,
}

/// Difference between desired and actual state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    /// Owned rules that are not desired, target the wrong queue, or
    /// duplicate a rule already kept. Device order.
    pub to_delete: Vec<StaleRule>,
    /// Desired rules missing from the device. Ascending by port.
    pub to_add: Vec<FlowRule>,
    /// Desired rules already on the device, by key, with their device id.
    pub present: HashMap<RuleKey, u32>,
}

/// Computes the diff. Rules outside `owned` are never scheduled for
/// deletion, whatever they contain.
pub fn diff(desired: &RuleSet, actual: &AppliedRuleTable, owned: &KeySpace) -> RuleDiff {
    let mut out = RuleDiff::default();

    for applied in actual.iter() {
        let Some(rule) = applied.rule else {
            continue;
        };
        let key = rule.key();
        if !owned.contains(&key) {
            continue;
        }
        let wanted = desired
            .get(&key)
            .is_some_and(|d| d.queue() == rule.queue());
        if wanted && !out.present.contains_key(&key) {
            out.present.insert(key, applied.id);
        } else {
            out.to_delete.push(StaleRule {
                id: applied.id,
                rule,
            });
        }
    }

    out.to_add = desired
        .iter()
        .filter(|r| !out.present.contains_key(&r.key()))
        .copied()
        .collect();
    out
}

/// Makes sure ntuple filtering is on before rules are added.
///
/// Some drivers filter without advertising the flag, so failure to enable
/// it is a warning only.
async fn ensure_ntuple(ctx: &DeviceContext<'_>, result: &mut ReconciliationResult) -> FlowsteerResult<()> {
    let state = match ctx.nic.feature(ctx.interface, Feature::Ntuple).await {
        Ok(state) => state,
        Err(e) if e.is_fatal() => return Err(FlowsteerError::from_device(e)),
        Err(e) => {
            debug!("ntuple state unreadable: {}", e);
            None
        }
    };
    if state.is_some_and(|s| s.enabled) {
        return Ok(());
    }

    match ctx.nic.set_feature(ctx.interface, Feature::Ntuple, true).await {
        Ok(()) => {
            info!("Enabled ntuple filters on {}", ctx.interface);
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(FlowsteerError::from_device(e)),
        Err(e) => {
            warn!("Could not enable ntuple filters on {}: {}", ctx.interface, e);
            result.warn(Warning::new(
                WarningKind::NtupleEnableFailed,
                format!(
                    "could not enable ntuple filters on {}: {}",
                    ctx.interface,
                    e.reason()
                ),
            ));
            Ok(())
        }
    }
}

fn abort(e: NicError) -> FlowsteerError {
    FlowsteerError::from_device(e)
}

/// Deletes every rule in `stale`, recording one outcome each. A refused
/// delete does not stop the others.
pub async fn delete_rules(
    ctx: &DeviceContext<'_>,
    stale: &[StaleRule],
    result: &mut ReconciliationResult,
) -> FlowsteerResult<()> {
    for s in stale {
        let outcome = match ctx.nic.delete_rule(ctx.interface, s.id).await {
            Ok(()) => {
                debug!(rule_id = s.id, port = s.rule.dest_port, "Deleted rule");
                RuleOutcome::Deleted { rule_id: s.id }
            }
            Err(e) if e.is_fatal() => return Err(abort(e)),
            Err(e) => {
                warn!(rule_id = s.id, port = s.rule.dest_port, "Delete failed: {}", e);
                RuleOutcome::Failed {
                    reason: FailureReason::DeleteFailed(e.reason()),
                }
            }
        };
        result.record(s.rule.protocol, s.rule.dest_port, s.rule.queue(), outcome);
    }
    Ok(())
}

/// Converges the device's owned rules onto `desired`.
///
/// Per-rule failures are recorded in the returned result; only
/// device-communication failures return `Err`.
#[instrument(skip_all, fields(interface = %ctx.interface, desired = desired.len(), actual = actual.len()))]
pub async fn reconcile(
    ctx: &DeviceContext<'_>,
    desired: &RuleSet,
    actual: &AppliedRuleTable,
    owned: &KeySpace,
    add_policy: AddPolicy,
) -> FlowsteerResult<ReconciliationResult> {
    let mut result = ReconciliationResult::new(Operation::Apply, ctx.interface);
    let plan = diff(desired, actual, owned);
    info!(
        delete = plan.to_delete.len(),
        add = plan.to_add.len(),
        present = plan.present.len(),
        "Computed rule diff"
    );

    if !plan.to_add.is_empty() {
        ensure_ntuple(ctx, &mut result).await?;
    }

    delete_rules(ctx, &plan.to_delete, &mut result).await?;

    let mut stopped: Option<FailureReason> = None;
    for rule in desired.iter() {
        if let Some(&id) = plan.present.get(&rule.key()) {
            result.record(
                rule.protocol,
                rule.dest_port,
                rule.queue(),
                RuleOutcome::AlreadyPresent { rule_id: id },
            );
            continue;
        }
        if let Some(reason) = &stopped {
            result.record(
                rule.protocol,
                rule.dest_port,
                rule.queue(),
                RuleOutcome::Failed {
                    reason: reason.clone(),
                },
            );
            continue;
        }

        let outcome = match ctx.nic.add_rule(ctx.interface, rule).await {
            Ok(id) => {
                debug!(rule_id = id, port = rule.dest_port, "Added rule");
                RuleOutcome::Applied { rule_id: id }
            }
            Err(e) if e.is_fatal() => return Err(abort(e)),
            Err(e) => {
                let reason = FailureReason::from_add_error(&e);
                warn!(port = rule.dest_port, "Add failed: {}", reason);
                if add_policy == AddPolicy::FailFast {
                    stopped = Some(reason.clone());
                }
                RuleOutcome::Failed { reason }
            }
        };
        result.record(rule.protocol, rule.dest_port, rule.queue(), outcome);
    }

    if stopped.is_some() {
        warn!(
            failed = result.counts().failed,
            "Stopped adding rules after first rejection"
        );
    }
    Ok(result)
}

//! Post-apply verification.
//!
//! Always re-reads the device: a driver accepting `ethtool -N` does not
//! mean the rule is active, some hardware silently caps the effective
//! rule count.

use std::collections::{BTreeSet, HashMap};

use tracing::{info, instrument, warn};

use flowsteer_common::AppliedRuleTable;

use crate::context::DeviceContext;
use crate::error::{FlowsteerError, FlowsteerResult};
use crate::planner::{KeySpace, RuleSet};
use crate::result::VerificationVerdict;

/// Compares a rule table against the desired set.
///
/// `missing` holds desired ports without a rule to the right queue;
/// `unexpected` holds owned ports that carry a rule they should not (wrong
/// queue, not desired, or duplicated).
pub fn compare(desired: &RuleSet, table: &AppliedRuleTable, owned: &KeySpace) -> VerificationVerdict {
    let mut seen: HashMap<u16, usize> = HashMap::new();
    let mut unexpected = BTreeSet::new();

    for rule in table.iter().filter_map(|r| r.rule) {
        let key = rule.key();
        if !owned.contains(&key) && !desired.contains_key(&key) {
            continue;
        }
        match desired.get(&key) {
            Some(d) if d.queue() == rule.queue() => {
                let n = seen.entry(key.dest_port).or_insert(0);
                *n += 1;
                if *n > 1 {
                    unexpected.insert(key.dest_port);
                }
            }
            _ => {
                unexpected.insert(key.dest_port);
            }
        }
    }

    let missing: Vec<u16> = desired
        .iter()
        .map(|r| r.dest_port)
        .filter(|p| !seen.contains_key(p))
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        VerificationVerdict::Match
    } else {
        VerificationVerdict::Mismatch {
            missing,
            unexpected: unexpected.into_iter().collect(),
        }
    }
}

/// Re-reads the device rule table and compares it against `desired`.
#[instrument(skip_all, fields(interface = %ctx.interface))]
pub async fn verify(
    ctx: &DeviceContext<'_>,
    desired: &RuleSet,
    owned: &KeySpace,
) -> FlowsteerResult<VerificationVerdict> {
    let table = ctx
        .nic
        .list_rules(ctx.interface)
        .await
        .map_err(FlowsteerError::from_device)?;
    let verdict = compare(desired, &table, owned);
    match &verdict {
        VerificationVerdict::Match => info!(rules = desired.len(), "Verification matched"),
        VerificationVerdict::Mismatch {
            missing,
            unexpected,
        } => warn!(
            missing = missing.len(),
            unexpected = unexpected.len(),
            "Verification mismatch"
        ),
    }
    Ok(verdict)
}

//! Reconciliation results and their rendering.

use std::fmt;

use serde::{Deserialize, Serialize};

use flowsteer_common::{NicError, Protocol};

use crate::error::{FlowsteerError, FlowsteerResult};

/// Category of a non-fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    QueueCountUnknown,
    CapabilityUnsupported,
    NtupleEnableFailed,
    TuningFailed,
    MirrorUnsupported,
    NoOwnershipRecord,
}

/// A non-fatal condition encountered during an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Why a rule could not be applied or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    /// The hardware rule table has no free slot.
    RuleTableExhausted(String),
    /// The device refused the rule for another reason.
    Rejected(String),
    /// The device refused to delete the rule.
    DeleteFailed(String),
}

impl FailureReason {
    /// Classifies a non-fatal add error.
    pub fn from_add_error(err: &NicError) -> Self {
        if err.is_table_full() {
            Self::RuleTableExhausted(err.reason())
        } else {
            Self::Rejected(err.reason())
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RuleTableExhausted(m) => write!(f, "rule table exhausted: {}", m),
            Self::Rejected(m) => write!(f, "rejected: {}", m),
            Self::DeleteFailed(m) => write!(f, "delete failed: {}", m),
        }
    }
}

/// What happened to one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RuleOutcome {
    Applied { rule_id: u32 },
    AlreadyPresent { rule_id: u32 },
    Deleted { rule_id: u32 },
    Failed { reason: FailureReason },
}

impl RuleOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, RuleOutcome::Failed { .. })
    }
}

/// Per-rule line of a reconciliation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleReport {
    pub protocol: Protocol,
    pub dest_port: u16,
    /// Target queue of the rule (for deletions, the queue it had).
    pub queue: u32,
    pub outcome: RuleOutcome,
}

/// Result of re-reading the device after apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum VerificationVerdict {
    Match,
    Mismatch {
        /// Desired ports with no rule to the right queue.
        missing: Vec<u16>,
        /// Owned ports present on the device that should not be.
        unexpected: Vec<u16>,
    },
}

impl VerificationVerdict {
    pub fn is_match(&self) -> bool {
        matches!(self, VerificationVerdict::Match)
    }
}

/// Counts shown in every report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub added: usize,
    pub already_present: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Which top-level operation produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Teardown,
}

/// Observable output of `apply` and `teardown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub operation: Operation,
    pub interface: String,
    pub rules: Vec<RuleReport>,
    pub warnings: Vec<Warning>,
    /// `None` for teardown and for applies aborted before verification.
    pub verdict: Option<VerificationVerdict>,
}

impl ReconciliationResult {
    pub fn new(operation: Operation, interface: impl Into<String>) -> Self {
        Self {
            operation,
            interface: interface.into(),
            rules: Vec::new(),
            warnings: Vec::new(),
            verdict: None,
        }
    }

    pub fn record(&mut self, protocol: Protocol, dest_port: u16, queue: u32, outcome: RuleOutcome) {
        self.rules.push(RuleReport {
            protocol,
            dest_port,
            queue,
            outcome,
        });
    }

    pub fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut c = OutcomeCounts::default();
        for r in &self.rules {
            match r.outcome {
                RuleOutcome::Applied { .. } => c.added += 1,
                RuleOutcome::AlreadyPresent { .. } => c.already_present += 1,
                RuleOutcome::Deleted { .. } => c.deleted += 1,
                RuleOutcome::Failed { .. } => c.failed += 1,
            }
        }
        c
    }

    /// Reports whose outcome is `Failed`.
    pub fn failures(&self) -> impl Iterator<Item = &RuleReport> {
        self.rules.iter().filter(|r| r.outcome.is_failed())
    }

    /// True when every rule report is `AlreadyPresent`.
    pub fn all_already_present(&self) -> bool {
        !self.rules.is_empty()
            && self
                .rules
                .iter()
                .all(|r| matches!(r.outcome, RuleOutcome::AlreadyPresent { .. }))
    }

    /// True when nothing failed and verification (if run) matched.
    pub fn is_success(&self) -> bool {
        self.counts().failed == 0 && self.verdict.as_ref().map_or(true, |v| v.is_match())
    }

    /// Turns an unsuccessful result into the error that best names it.
    pub fn check(&self) -> FlowsteerResult<()> {
        let failed = self.counts().failed;
        let exhausted = self.failures().any(|r| {
            matches!(
                r.outcome,
                RuleOutcome::Failed {
                    reason: FailureReason::RuleTableExhausted(_)
                }
            )
        });
        if exhausted {
            return Err(FlowsteerError::RuleTableExhausted {
                interface: self.interface.clone(),
                desired: self
                    .rules
                    .iter()
                    .filter(|r| !matches!(r.outcome, RuleOutcome::Deleted { .. }))
                    .count(),
                failed,
            });
        }
        if let Some(VerificationVerdict::Mismatch {
            missing,
            unexpected,
        }) = &self.verdict
        {
            return Err(FlowsteerError::PartialVerificationMismatch {
                interface: self.interface.clone(),
                missing: missing.clone(),
                unexpected: unexpected.clone(),
            });
        }
        if failed > 0 {
            return Err(FlowsteerError::RulesFailed {
                interface: self.interface.clone(),
                failed,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operation {
            Operation::Apply => "apply",
            Operation::Teardown => "teardown",
        };
        let c = self.counts();
        writeln!(
            f,
            "{} {}: added {}, already present {}, deleted {}, failed {}",
            op, self.interface, c.added, c.already_present, c.deleted, c.failed
        )?;
        for r in self.failures() {
            if let RuleOutcome::Failed { reason } = &r.outcome {
                writeln!(
                    f,
                    "  FAILED {}/{} -> queue {}: {}",
                    r.protocol, r.dest_port, r.queue, reason
                )?;
            }
        }
        for w in &self.warnings {
            writeln!(f, "  warning: {}", w.message)?;
        }
        match &self.verdict {
            Some(VerificationVerdict::Match) => writeln!(f, "  verification: match")?,
            Some(VerificationVerdict::Mismatch {
                missing,
                unexpected,
            }) => writeln!(
                f,
                "  verification: MISMATCH missing {:?} unexpected {:?}",
                missing, unexpected
            )?,
            None => {}
        }
        Ok(())
    }
}

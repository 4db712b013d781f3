//! Verification helpers for testing reconciliation
//!
//! Assertion helpers over the rule table a [`MockNic`] currently reports.

use flowsteer_common::{AppliedRuleTable, Protocol};
use thiserror::Error;

use crate::MockNic;

/// Verification error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Expected rule for UDP/{port} -> queue {queue}, found none")]
    RuleMissing { port: u16, queue: u32 },

    #[error("UDP/{port} has {count} rules, expected one")]
    DuplicateRule { port: u16, count: usize },

    #[error("Unexpected rule for UDP/{port} (queue {queue})")]
    UnexpectedRule { port: u16, queue: u32 },

    #[error("Expected {expected} rules, found {actual}")]
    RuleCountMismatch { expected: usize, actual: usize },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Rule table verifier
#[derive(Debug)]
pub struct RuleTableVerifier {
    table: AppliedRuleTable,
}

impl RuleTableVerifier {
    /// Snapshots the device's current rule table.
    pub fn new(nic: &MockNic) -> Self {
        Self {
            table: nic.list_rules_now(),
        }
    }

    fn udp_queues(&self, port: u16) -> Vec<u32> {
        self.table
            .iter()
            .filter_map(|r| r.rule)
            .filter(|r| r.protocol == Protocol::Udp && r.dest_port == port)
            .map(|r| r.queue())
            .collect()
    }

    /// Exactly one rule steers `port` to `queue`.
    pub fn assert_rule(&self, port: u16, queue: u32) -> VerifyResult<()> {
        let queues = self.udp_queues(port);
        match queues.as_slice() {
            [q] if *q == queue => Ok(()),
            [] => Err(VerificationError::RuleMissing { port, queue }),
            [q] => Err(VerificationError::UnexpectedRule { port, queue: *q }),
            _ => Err(VerificationError::DuplicateRule {
                port,
                count: queues.len(),
            }),
        }
    }

    /// Every port in `start..=end` has exactly one rule to `queue`.
    pub fn assert_range(&self, start: u16, end: u16, queue: u32) -> VerifyResult<()> {
        (start..=end).try_for_each(|p| self.assert_rule(p, queue))
    }

    /// No UDP rule exists for any port in `start..=end`.
    pub fn assert_no_rules_in(&self, start: u16, end: u16) -> VerifyResult<()> {
        for port in start..=end {
            if let Some(queue) = self.udp_queues(port).first() {
                return Err(VerificationError::UnexpectedRule {
                    port,
                    queue: *queue,
                });
            }
        }
        Ok(())
    }

    /// The table holds `expected` rules, foreign ones included.
    pub fn assert_count(&self, expected: usize) -> VerifyResult<()> {
        if self.table.len() != expected {
            return Err(VerificationError::RuleCountMismatch {
                expected,
                actual: self.table.len(),
            });
        }
        Ok(())
    }
}

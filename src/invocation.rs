use std::fmt::Debug;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::database::MemberId;
use crate::errors::{HaError, Result, SqlError};

/// How an operation is spread over the cluster and how its result is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStrategy {
    /// One member chosen by the balancer. Member-fatal failures may be
    /// retried on another member when read retries are enabled.
    SingleRead,
    /// Every active member. The result comes from the first successful
    /// member in snapshot order; members that fail are deactivated.
    AllWrite,
    /// Members in snapshot order until one succeeds.
    FirstSuccess,
    /// Like `AllWrite`, but every member's value is kept so the values can be
    /// bound together as one locator handle.
    ResourceAllocating,
    /// The first bound per-member object, without consulting the cluster.
    DriverLocalRead,
}

impl InvocationStrategy {
    /// Whether the strategy runs the invocation on several members at once.
    pub fn fans_out(self) -> bool {
        matches!(
            self,
            InvocationStrategy::AllWrite | InvocationStrategy::ResourceAllocating
        )
    }
}

/// Read/write classification of an operation.
///
/// Each facade enumerates its operations once and maps them to a kind; the
/// kind alone decides the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Side-effect free; any member can answer.
    Read,
    /// Must reach every member.
    Write,
    /// Must reach every member and returns an affected-row count that
    /// should agree across members.
    RowCountWrite,
    /// Allocates a server-side resource on every member.
    Allocate,
    /// Answered by the driver object already bound to a member.
    DriverRead,
    /// Needs one healthy member, whichever answers first.
    AnyMember,
}

impl OperationKind {
    pub fn strategy(self) -> InvocationStrategy {
        match self {
            OperationKind::Read => InvocationStrategy::SingleRead,
            OperationKind::Write | OperationKind::RowCountWrite => InvocationStrategy::AllWrite,
            OperationKind::Allocate => InvocationStrategy::ResourceAllocating,
            OperationKind::DriverRead => InvocationStrategy::DriverLocalRead,
            OperationKind::AnyMember => InvocationStrategy::FirstSuccess,
        }
    }

    /// Whether results should be compared across members.
    pub fn reconciles(self) -> bool {
        matches!(self, OperationKind::RowCountWrite)
    }
}

/// What to do when members return different row counts for the same write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsistencyPolicy {
    /// Do not compare.
    Ignore,
    /// Keep the primary's result and report the mismatch as a warning.
    #[default]
    Warn,
    /// Fail the operation. Members stay active.
    Fail,
}

/// Whether fan-out strategies run members concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FanOut {
    #[default]
    Parallel,
    Sequential,
}

/// Result of one invocation on one member.
#[derive(Debug)]
pub enum Outcome<R> {
    Success(R),
    Failure {
        cause: SqlError,
        /// Classified as member-fatal by the dialect.
        fatal: bool,
    },
}

/// A member whose result differs from the primary's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyWarning {
    pub primary: MemberId,
    pub member: MemberId,
    pub expected: String,
    pub actual: String,
}

/// The reconciled result of one dispatched operation.
#[derive(Debug)]
pub struct Dispatched<R> {
    /// Successful values in snapshot order; the first entry is the primary.
    results: Vec<(MemberId, R)>,
    deactivated: Vec<MemberId>,
    warnings: Vec<ConsistencyWarning>,
}

impl<R> Dispatched<R> {
    /// Callers guarantee `results` is non-empty.
    pub(crate) fn new(results: Vec<(MemberId, R)>, deactivated: Vec<MemberId>) -> Self {
        debug_assert!(!results.is_empty());
        Self {
            results,
            deactivated,
            warnings: Vec::new(),
        }
    }

    /// The member whose value is the operation's result.
    pub fn primary(&self) -> &MemberId {
        &self.results[0].0
    }

    pub fn value(&self) -> &R {
        &self.results[0].1
    }

    pub fn into_value(self) -> R {
        self.results
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .unwrap_or_else(|| unreachable!("dispatch results are never empty"))
    }

    pub fn results(&self) -> &[(MemberId, R)] {
        &self.results
    }

    pub fn into_results(self) -> Vec<(MemberId, R)> {
        self.results
    }

    /// Members deactivated while this operation ran.
    pub fn deactivated(&self) -> &[MemberId] {
        &self.deactivated
    }

    pub fn warnings(&self) -> &[ConsistencyWarning] {
        &self.warnings
    }
}

impl<R: PartialEq + Debug> Dispatched<R> {
    /// Compares every member's value with the primary's.
    ///
    /// # Errors
    ///
    /// Returns `HaError::Consistency` on a mismatch when the policy is `Fail`.
    pub fn reconcile(mut self, policy: ConsistencyPolicy) -> Result<Self> {
        if policy == ConsistencyPolicy::Ignore {
            return Ok(self);
        }
        let (primary, expected) = &self.results[0];
        let mismatches: Vec<ConsistencyWarning> = self.results[1..]
            .iter()
            .filter(|(_, value)| value != expected)
            .map(|(member, value)| ConsistencyWarning {
                primary: primary.clone(),
                member: member.clone(),
                expected: format!("{:?}", expected),
                actual: format!("{:?}", value),
            })
            .collect();

        if mismatches.is_empty() {
            return Ok(self);
        }
        for mismatch in &mismatches {
            warn!(
                "Member {} returned {} but primary {} returned {}",
                mismatch.member, mismatch.actual, mismatch.primary, mismatch.expected
            );
        }
        if policy == ConsistencyPolicy::Fail {
            let detail = mismatches
                .iter()
                .map(|m| format!("{}={} (primary {}={})", m.member, m.actual, m.primary, m.expected))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(HaError::Consistency(detail));
        }
        self.warnings.extend(mismatches);
        Ok(self)
    }
}

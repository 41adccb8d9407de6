use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::BalancerKind;
use crate::database::MemberSpec;
use crate::errors::{HaError, Result};
use crate::invocation::{ConsistencyPolicy, FanOut};

/// Settings for one database cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Member databases, in preference order.
    pub members: Vec<MemberSpec>,
    /// How single-member reads pick a member.
    pub balancer: BalancerKind,
    /// Whether writes run on members concurrently.
    pub fan_out: FanOut,
    /// What to do when row counts differ between members.
    pub consistency: ConsistencyPolicy,
    /// Retry a read on another member after a member-fatal failure.
    pub retry_reads: bool,
    /// Upper bound on waiting for the reconfiguration lock. `None` waits
    /// indefinitely.
    pub lock_acquire_timeout_ms: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            balancer: BalancerKind::default(),
            fan_out: FanOut::default(),
            consistency: ConsistencyPolicy::default(),
            retry_reads: true,
            lock_acquire_timeout_ms: None,
        }
    }
}

impl ClusterConfig {
    pub fn with_members(members: Vec<MemberSpec>) -> Self {
        Self {
            members,
            ..Self::default()
        }
    }

    pub fn lock_acquire_timeout(&self) -> Option<Duration> {
        self.lock_acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Checks the settings for mistakes that would only surface at runtime.
    ///
    /// # Errors
    ///
    /// Returns `HaError::Config` for an empty or repeated member id or a zero
    /// lock timeout.
    pub fn validate(&self) -> Result<()> {
        for (index, member) in self.members.iter().enumerate() {
            if member.id.as_str().trim().is_empty() {
                return Err(HaError::Config(format!("member #{} has an empty id", index)));
            }
            if self.members[..index].iter().any(|m| m.id == member.id) {
                return Err(HaError::Config(format!(
                    "member id {} is configured more than once",
                    member.id
                )));
            }
        }
        if self.lock_acquire_timeout_ms == Some(0) {
            return Err(HaError::Config(
                "lock_acquire_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::database::Member;

/// Policy used to pick the member that serves a single-member read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerKind {
    /// Always the highest-weight member; ties go to the earlier member.
    #[default]
    Simple,
    /// Rotates through the members.
    RoundRobin,
    /// Weighted random choice.
    Random,
    /// Fewest in-flight invocations relative to weight.
    Load,
}

/// Chooses a member for a read.
///
/// Members with weight zero only receive reads when no weighted member is
/// among the candidates.
#[derive(Debug)]
pub enum Balancer {
    Simple,
    RoundRobin(AtomicUsize),
    Random,
    Load,
}

impl Balancer {
    pub fn new(kind: BalancerKind) -> Self {
        match kind {
            BalancerKind::Simple => Balancer::Simple,
            BalancerKind::RoundRobin => Balancer::RoundRobin(AtomicUsize::new(0)),
            BalancerKind::Random => Balancer::Random,
            BalancerKind::Load => Balancer::Load,
        }
    }

    pub fn kind(&self) -> BalancerKind {
        match self {
            Balancer::Simple => BalancerKind::Simple,
            Balancer::RoundRobin(_) => BalancerKind::RoundRobin,
            Balancer::Random => BalancerKind::Random,
            Balancer::Load => BalancerKind::Load,
        }
    }

    /// Picks one of `candidates`, or `None` when there are none.
    pub fn next<'a, C>(&self, candidates: &[&'a Arc<Member<C>>]) -> Option<&'a Arc<Member<C>>> {
        let weighted: Vec<&'a Arc<Member<C>>> = candidates
            .iter()
            .copied()
            .filter(|m| m.weight() > 0)
            .collect();
        let pool: &[&'a Arc<Member<C>>] = if weighted.is_empty() {
            candidates
        } else {
            &weighted
        };
        if pool.is_empty() {
            return None;
        }

        match self {
            Balancer::Simple => {
                let mut best = pool[0];
                for &member in &pool[1..] {
                    if member.weight() > best.weight() {
                        best = member;
                    }
                }
                Some(best)
            }
            Balancer::RoundRobin(cursor) => {
                let index = cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
                Some(pool[index])
            }
            Balancer::Random => {
                let total: u64 = pool.iter().map(|m| u64::from(m.weight().max(1))).sum();
                let mut point = rand::rng().random_range(0..total);
                for &member in pool {
                    let weight = u64::from(member.weight().max(1));
                    if point < weight {
                        return Some(member);
                    }
                    point -= weight;
                }
                pool.last().copied()
            }
            Balancer::Load => {
                // Compare load/weight without division: a/wa < b/wb <=> a*wb < b*wa.
                let mut best = pool[0];
                for &member in &pool[1..] {
                    let candidate = (member.in_flight() as u64) * u64::from(best.weight().max(1));
                    let current = (best.in_flight() as u64) * u64::from(member.weight().max(1));
                    if candidate < current {
                        best = member;
                    }
                }
                Some(best)
            }
        }
    }
}

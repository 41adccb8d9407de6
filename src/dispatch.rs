//! The dispatch engine.
//!
//! [`Dispatcher::dispatch`] takes a strategy, the per-member objects an
//! operation can run against and the invocation itself. It resolves the
//! targets against a fresh snapshot, runs the invocation (concurrently for
//! fan-out strategies), classifies every failure through the dialect,
//! deactivates members that failed fatally or diverged, and derives one
//! result. It never returns while a member's outcome is still outstanding.

use std::sync::Arc;
use std::thread;

use ahash::AHashMap;
use crossbeam_channel as channel;
use log::{debug, warn};

use crate::balancer::Balancer;
use crate::config::ClusterConfig;
use crate::database::{Member, MemberId};
use crate::dialect::Dialect;
use crate::errors::{HaError, MemberFailure, Result, SqlError};
use crate::invocation::{ConsistencyPolicy, Dispatched, FanOut, InvocationStrategy, Outcome};
use crate::membership::{ClusterSnapshot, MembershipStore};

/// A member paired with the object the invocation runs against on it.
type Bound<'a, C, T> = (&'a Arc<Member<C>>, &'a T);

/// Executes invocations against cluster members according to a strategy.
pub struct Dispatcher<C> {
    membership: Arc<MembershipStore<C>>,
    dialect: Arc<dyn Dialect>,
    balancer: Balancer,
    fan_out: FanOut,
    retry_reads: bool,
    consistency: ConsistencyPolicy,
}

impl<C> Dispatcher<C> {
    /// Creates a dispatcher over the given membership.
    ///
    /// # Arguments
    ///
    /// * `membership` - The store whose snapshots select target members and
    ///   which receives deactivations.
    /// * `dialect` - Classifies member failures.
    /// * `config` - Balancer, fan-out, read retry and consistency settings.
    pub fn new(
        membership: Arc<MembershipStore<C>>,
        dialect: Arc<dyn Dialect>,
        config: &ClusterConfig,
    ) -> Self {
        Self {
            membership,
            dialect,
            balancer: Balancer::new(config.balancer),
            fan_out: config.fan_out,
            retry_reads: config.retry_reads,
            consistency: config.consistency,
        }
    }

    pub fn membership(&self) -> &Arc<MembershipStore<C>> {
        &self.membership
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn consistency(&self) -> ConsistencyPolicy {
        self.consistency
    }

    /// Runs `invocation` on every target regardless of membership, never
    /// deactivating anything. Used to release server-side resources, where
    /// a failure only means the resource was already gone.
    pub fn broadcast<T, R, F>(
        &self,
        targets: &[(MemberId, T)],
        invocation: F,
    ) -> Vec<(MemberId, std::result::Result<R, SqlError>)>
    where
        F: Fn(&T) -> std::result::Result<R, SqlError>,
    {
        targets
            .iter()
            .map(|(id, target)| (id.clone(), invocation(target)))
            .collect()
    }
}

impl<C: Send + Sync> Dispatcher<C> {
    /// Runs `invocation` against the per-member objects in `targets`.
    ///
    /// Targets whose member is not in the current snapshot are skipped,
    /// except for `DriverLocalRead`, which runs on the first target without
    /// consulting the cluster.
    ///
    /// # Arguments
    ///
    /// * `strategy` - Which members to use and how to derive the result.
    /// * `targets` - Per-member objects, e.g. statements or resource handles.
    /// * `invocation` - The unit of work. It runs at most once per member and
    ///   must not share mutable state between members.
    ///
    /// # Returns
    ///
    /// The successful values, primary first, plus any deactivations and
    /// consistency warnings recorded along the way.
    ///
    /// # Errors
    ///
    /// * `HaError::EmptyCluster` if no target member is active.
    /// * `HaError::Operation` for an operation-level failure; the member
    ///   stays active.
    /// * `HaError::ClusterExhausted` if every target failed and at least one
    ///   failure was member-fatal.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use hadb::prelude::*;
    ///
    /// # fn run(dispatcher: &Dispatcher<()>, statements: Vec<(MemberId, String)>) -> Result<()> {
    /// let rows = dispatcher.dispatch(
    ///     InvocationStrategy::AllWrite,
    ///     &statements,
    ///     |_member, sql: &String| Ok(sql.len() as u64),
    /// )?;
    /// println!("primary {} returned {}", rows.primary(), rows.value());
    /// # Ok(())
    /// # }
    /// ```
    pub fn dispatch<T, R, F>(
        &self,
        strategy: InvocationStrategy,
        targets: &[(MemberId, T)],
        invocation: F,
    ) -> Result<Dispatched<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&Member<C>, &T) -> std::result::Result<R, SqlError> + Sync,
    {
        if strategy == InvocationStrategy::DriverLocalRead {
            return self.driver_read(targets, &invocation);
        }

        let by_member: AHashMap<&MemberId, &T> =
            targets.iter().map(|(id, target)| (id, target)).collect();
        let snapshot = self.membership.snapshot();
        let bound: Vec<Bound<'_, C, T>> = snapshot
            .members()
            .iter()
            .filter_map(|member| by_member.get(member.id()).map(|target| (member, *target)))
            .collect();
        self.run(strategy, &snapshot, bound, &invocation)
    }

    /// Runs `invocation` against the members themselves, e.g. against their
    /// connections.
    pub fn dispatch_members<R, F>(
        &self,
        strategy: InvocationStrategy,
        invocation: F,
    ) -> Result<Dispatched<R>>
    where
        R: Send,
        F: Fn(&Member<C>) -> std::result::Result<R, SqlError> + Sync,
    {
        let snapshot = self.membership.snapshot();
        let unit = ();
        let bound: Vec<Bound<'_, C, ()>> =
            snapshot.members().iter().map(|member| (member, &unit)).collect();

        if strategy == InvocationStrategy::DriverLocalRead {
            let (member, _) = bound.first().ok_or(HaError::EmptyCluster)?;
            return match self.invoke_one(member, &(), &|m: &Member<C>, _: &()| invocation(m)) {
                Outcome::Success(value) => Ok(Dispatched::new(
                    vec![(member.id().clone(), value)],
                    Vec::new(),
                )),
                Outcome::Failure { cause, .. } => Err(HaError::Operation {
                    member: member.id().clone(),
                    source: cause,
                }),
            };
        }
        self.run(strategy, &snapshot, bound, &|m: &Member<C>, _: &()| invocation(m))
    }

    fn run<T, R, F>(
        &self,
        strategy: InvocationStrategy,
        snapshot: &ClusterSnapshot<C>,
        bound: Vec<Bound<'_, C, T>>,
        invocation: &F,
    ) -> Result<Dispatched<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&Member<C>, &T) -> std::result::Result<R, SqlError> + Sync,
    {
        debug!(
            "Dispatching {:?} to {} of {} active members (snapshot {})",
            strategy,
            bound.len(),
            snapshot.len(),
            snapshot.version()
        );
        if bound.is_empty() {
            return Err(HaError::EmptyCluster);
        }

        match strategy {
            InvocationStrategy::SingleRead => {
                let retry = self.retry_reads;
                self.until_success(bound, retry, |candidates| self.balancer.next(candidates), invocation)
            }
            InvocationStrategy::FirstSuccess => {
                self.until_success(bound, true, |candidates| candidates.first().copied(), invocation)
            }
            InvocationStrategy::AllWrite | InvocationStrategy::ResourceAllocating => {
                self.all(strategy, bound, invocation)
            }
            // Handled before a snapshot is taken.
            InvocationStrategy::DriverLocalRead => Err(HaError::Unsupported(
                "driver-local read requires bound targets".to_string(),
            )),
        }
    }

    fn driver_read<T, R, F>(&self, targets: &[(MemberId, T)], invocation: &F) -> Result<Dispatched<R>>
    where
        F: Fn(&Member<C>, &T) -> std::result::Result<R, SqlError>,
    {
        let (id, target) = targets.first().ok_or(HaError::EmptyCluster)?;
        let member = match self.membership.snapshot().get(id) {
            Some(member) => Arc::clone(member),
            None => self
                .membership
                .members()
                .into_iter()
                .find(|m| m.id() == id)
                .ok_or_else(|| HaError::UnknownMember(id.clone()))?,
        };
        match self.invoke_one(&member, target, invocation) {
            Outcome::Success(value) => Ok(Dispatched::new(vec![(id.clone(), value)], Vec::new())),
            Outcome::Failure { cause, .. } => Err(HaError::Operation {
                member: id.clone(),
                source: cause,
            }),
        }
    }

    /// Tries one member at a time until one succeeds.
    ///
    /// A member-fatal failure deactivates the member and, when `retry` is set,
    /// moves on to the next choice. An operation-level failure is returned
    /// immediately.
    fn until_success<'a, T, R, F, P>(
        &self,
        mut candidates: Vec<Bound<'a, C, T>>,
        retry: bool,
        choose: P,
        invocation: &F,
    ) -> Result<Dispatched<R>>
    where
        F: Fn(&Member<C>, &T) -> std::result::Result<R, SqlError>,
        P: Fn(&[&'a Arc<Member<C>>]) -> Option<&'a Arc<Member<C>>>,
    {
        let mut deactivated = Vec::new();
        let mut failures = Vec::new();

        loop {
            let members: Vec<&'a Arc<Member<C>>> = candidates.iter().map(|(m, _)| *m).collect();
            let Some(chosen) = choose(members.as_slice()) else {
                return Err(if failures.is_empty() {
                    HaError::EmptyCluster
                } else {
                    HaError::ClusterExhausted { causes: failures }
                });
            };
            let index = candidates
                .iter()
                .position(|(m, _)| m.id() == chosen.id())
                .ok_or(HaError::EmptyCluster)?;
            let (member, target) = candidates.remove(index);

            match self.invoke_one(member, target, invocation) {
                Outcome::Success(value) => {
                    return Ok(Dispatched::new(
                        vec![(member.id().clone(), value)],
                        deactivated,
                    ));
                }
                Outcome::Failure { cause, fatal: true } => {
                    self.deactivate(member.id(), &cause, &mut deactivated);
                    if !retry {
                        return Err(HaError::Operation {
                            member: member.id().clone(),
                            source: cause,
                        });
                    }
                    debug!("Retrying read after member {} failed", member.id());
                    failures.push(MemberFailure {
                        member: member.id().clone(),
                        cause,
                        fatal: true,
                    });
                }
                Outcome::Failure { cause, fatal: false } => {
                    return Err(HaError::Operation {
                        member: member.id().clone(),
                        source: cause,
                    });
                }
            }
        }
    }

    /// Runs the invocation on every bound member and derives the result.
    fn all<T, R, F>(
        &self,
        strategy: InvocationStrategy,
        bound: Vec<Bound<'_, C, T>>,
        invocation: &F,
    ) -> Result<Dispatched<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&Member<C>, &T) -> std::result::Result<R, SqlError> + Sync,
    {
        let concurrent =
            strategy.fans_out() && self.fan_out == FanOut::Parallel && bound.len() > 1;
        let outcomes = if concurrent {
            self.fan_out(&bound, invocation)
        } else {
            bound
                .iter()
                .map(|(member, target)| self.invoke_one(member, *target, invocation))
                .collect()
        };

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for ((member, _), outcome) in bound.iter().zip(outcomes) {
            match outcome {
                Outcome::Success(value) => successes.push((member.id().clone(), value)),
                Outcome::Failure { cause, fatal } => failures.push(MemberFailure {
                    member: member.id().clone(),
                    cause,
                    fatal,
                }),
            }
        }

        let mut deactivated = Vec::new();
        if successes.is_empty() {
            // Nobody succeeded: only members that failed fatally are unhealthy.
            if !failures.iter().any(|f| f.fatal) {
                let first = failures.swap_remove(0);
                return Err(HaError::Operation {
                    member: first.member,
                    source: first.cause,
                });
            }
            for failure in failures.iter().filter(|f| f.fatal) {
                self.deactivate(&failure.member, &failure.cause, &mut deactivated);
            }
            return Err(HaError::ClusterExhausted { causes: failures });
        }

        // Somebody succeeded: every member that failed has diverged.
        for failure in &failures {
            if !failure.fatal {
                warn!(
                    "Member {} failed where others succeeded, its state has diverged",
                    failure.member
                );
            }
            self.deactivate(&failure.member, &failure.cause, &mut deactivated);
        }
        Ok(Dispatched::new(successes, deactivated))
    }

    /// One task per member; waits for every task before returning. Outcomes
    /// are returned in `bound` order.
    fn fan_out<T, R, F>(&self, bound: &[Bound<'_, C, T>], invocation: &F) -> Vec<Outcome<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&Member<C>, &T) -> std::result::Result<R, SqlError> + Sync,
    {
        let (sender, receiver) = channel::bounded(bound.len());
        thread::scope(|scope| {
            for (index, (member, target)) in bound.iter().enumerate() {
                let sender = sender.clone();
                scope.spawn(move || {
                    let outcome = self.invoke_one(member, *target, invocation);
                    // The receiver outlives the scope.
                    let _ = sender.send((index, outcome));
                });
            }
        });
        drop(sender);

        let mut outcomes: Vec<(usize, Outcome<R>)> = receiver.try_iter().collect();
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    fn invoke_one<T, R, F>(&self, member: &Member<C>, target: &T, invocation: &F) -> Outcome<R>
    where
        F: Fn(&Member<C>, &T) -> std::result::Result<R, SqlError>,
    {
        let _in_flight = member.begin_invocation();
        match invocation(member, target) {
            Ok(value) => Outcome::Success(value),
            Err(cause) => {
                let fatal = self.dialect.indicates_failure(&cause);
                debug!(
                    "Member {} failed ({}): {}",
                    member.id(),
                    if fatal { "member-fatal" } else { "operation-level" },
                    cause
                );
                Outcome::Failure { cause, fatal }
            }
        }
    }

    fn deactivate(&self, id: &MemberId, cause: &SqlError, deactivated: &mut Vec<MemberId>) {
        if self.membership.deactivate(id, cause) {
            deactivated.push(id.clone());
        }
    }
}

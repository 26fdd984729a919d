// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Thread budget allocation and the admission gate.
//!
//! The balancer periodically scores every module and splits a fixed thread
//! budget proportionally to the scores. Each allocation also caps how many
//! tasks of the module may run at once; [`LoadBalancer::try_admit`] enforces
//! that cap with a compare-and-swap on the allocation's counter.
//!
//! The allocation map is an immutable snapshot behind an [`ArcSwap`]: the
//! admission path only loads it, and writers (first admission, rebalance,
//! pruning) publish a new map with a compare-and-swap loop. Admission
//! therefore never waits on a rebalance.
//!
//! Other components never touch allocations directly. They queue a
//! [`BalancerCommand`], which the balancer applies in
//! [`LoadBalancer::process_commands`].

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use modgov_core::{Clock, ModuleCategory, ModuleId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Threads given to a module seen for the first time at admission.
pub const DEFAULT_THREADS: usize = 1;
/// Concurrent tasks allowed for a module seen for the first time at admission.
pub const DEFAULT_MAX_TASKS: usize = 5;
/// A module admitted within this window gets a score boost.
pub const RECENT_EXECUTION_WINDOW: Duration = Duration::from_secs(5);

const MAX_RESPONSE_FACTOR: f64 = 5.0;
const MAX_CPU_FACTOR: f64 = 3.0;
const RECENT_EXECUTION_BOOST: f64 = 1.5;
const MIN_THROTTLED_TASKS: usize = 2;

/// Request sent to the balancer by other components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalancerCommand {
    /// Halve the module's threads (min 1) and concurrent tasks (min 2).
    Throttle {
        /// The module to throttle.
        module: ModuleId,
    },
}

/// Live allocation of one module. Every field is atomic.
#[derive(Debug)]
pub struct ThreadAllocation {
    allocated_threads: AtomicUsize,
    max_concurrent_tasks: AtomicUsize,
    current_tasks: AtomicUsize,
    total_execution_micros: AtomicU64,
    execution_count: AtomicU64,
    /// Nanoseconds since the balancer epoch, plus one. Zero means never.
    last_admission: AtomicU64,
}

impl ThreadAllocation {
    fn new(threads: usize, max_tasks: usize) -> Self {
        Self {
            allocated_threads: AtomicUsize::new(threads),
            max_concurrent_tasks: AtomicUsize::new(max_tasks),
            current_tasks: AtomicUsize::new(0),
            total_execution_micros: AtomicU64::new(0),
            execution_count: AtomicU64::new(0),
            last_admission: AtomicU64::new(0),
        }
    }

    /// Takes a task slot if one is free.
    fn try_acquire(&self) -> bool {
        let mut current = self.current_tasks.load(Ordering::Acquire);
        loop {
            if current >= self.max_concurrent_tasks.load(Ordering::Acquire) {
                return false;
            }
            match self.current_tasks.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Frees a task slot, saturating at zero. Execution stats are only
    /// accumulated when the duration is known.
    fn release(&self, execution: Option<Duration>) {
        let _ = self
            .current_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if let Some(execution) = execution {
            let micros = u64::try_from(execution.as_micros()).unwrap_or(u64::MAX);
            let _ = self
                .total_execution_micros
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                    Some(t.saturating_add(micros))
                });
            self.execution_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn set_limits(&self, threads: usize, max_tasks: usize) {
        self.allocated_threads.store(threads, Ordering::Release);
        self.max_concurrent_tasks.store(max_tasks, Ordering::Release);
    }

    /// A consistent-enough copy of the counters.
    pub fn snapshot(&self) -> AllocationSnapshot {
        let total_ms = self.total_execution_micros.load(Ordering::Relaxed) as f64 / 1000.0;
        let count = self.execution_count.load(Ordering::Relaxed);
        AllocationSnapshot {
            allocated_threads: self.allocated_threads.load(Ordering::Acquire),
            max_concurrent_tasks: self.max_concurrent_tasks.load(Ordering::Acquire),
            current_tasks: self.current_tasks.load(Ordering::Acquire),
            total_execution_time_ms: total_ms,
            execution_count: count,
            average_execution_time_ms: if count == 0 { 0.0 } else { total_ms / count as f64 },
        }
    }
}

/// Point-in-time copy of a [`ThreadAllocation`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AllocationSnapshot {
    /// Threads assigned by the last rebalance.
    pub allocated_threads: usize,
    /// Concurrent task cap.
    pub max_concurrent_tasks: usize,
    /// Tasks currently admitted.
    pub current_tasks: usize,
    /// Accumulated execution time, in milliseconds.
    pub total_execution_time_ms: f64,
    /// Completed executions.
    pub execution_count: u64,
    /// Mean execution time, in milliseconds.
    pub average_execution_time_ms: f64,
}

/// What the balancer needs to know about a module to score it.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceInput {
    /// The module.
    pub module_id: ModuleId,
    /// Its category.
    pub category: ModuleCategory,
    /// Mean response time, in milliseconds. Zero when unknown.
    pub avg_response_time_ms: f64,
    /// Mean CPU fraction.
    pub cpu_fraction: f64,
}

type AllocationMap = HashMap<ModuleId, Arc<ThreadAllocation>>;

/// Converts a caller-reported execution time, rejecting values a [`Duration`]
/// cannot hold.
fn execution_duration(execution_ms: f64) -> Option<Duration> {
    if !execution_ms.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(execution_ms.max(0.0) / 1000.0).ok()
}

/// Distributes the thread budget and gates concurrent execution.
pub struct LoadBalancer {
    total_threads: usize,
    clock: Arc<dyn Clock>,
    epoch: Instant,
    allocations: ArcSwap<AllocationMap>,
    commands_tx: Sender<BalancerCommand>,
    commands_rx: Receiver<BalancerCommand>,
}

impl LoadBalancer {
    /// Creates a balancer sharing `total_threads` between modules.
    pub fn new(total_threads: usize, clock: Arc<dyn Clock>) -> Self {
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let epoch = clock.now();
        Self {
            total_threads: total_threads.max(1),
            clock,
            epoch,
            allocations: ArcSwap::from_pointee(HashMap::new()),
            commands_tx,
            commands_rx,
        }
    }

    /// The shared thread budget.
    pub fn total_threads(&self) -> usize {
        self.total_threads
    }

    /// A sender for [`BalancerCommand`]s.
    pub fn command_sender(&self) -> Sender<BalancerCommand> {
        self.commands_tx.clone()
    }

    // --- Admission ---

    /// Admits one task of `module` if it is below its concurrency cap.
    ///
    /// Unknown modules get a default allocation. Every successful admission
    /// must be paired with [`LoadBalancer::release`].
    pub fn try_admit(&self, module: &ModuleId) -> bool {
        let allocation = self.allocation_entry(module);
        self.admit(module, &allocation)
    }

    fn admit(&self, module: &ModuleId, allocation: &ThreadAllocation) -> bool {
        if !allocation.try_acquire() {
            log::trace!("Balancer: '{module}' is at its concurrency cap.");
            return false;
        }
        let since_epoch = self.clock.now().saturating_duration_since(self.epoch);
        allocation
            .last_admission
            .store(since_epoch.as_nanos() as u64 + 1, Ordering::Relaxed);
        true
    }

    /// Releases a task admitted by [`LoadBalancer::try_admit`].
    ///
    /// A non-finite or out-of-range `execution_ms` still frees the slot but
    /// is left out of the execution stats.
    pub fn release(&self, module: &ModuleId, execution_ms: f64) {
        let Some(allocation) = self.allocations.load().get(module).cloned() else {
            log::debug!("Balancer: release for unknown module '{module}' ignored.");
            return;
        };
        let execution = execution_duration(execution_ms);
        if execution.is_none() {
            log::warn!("Balancer: '{module}' reported unusable execution time {execution_ms} ms.");
        }
        allocation.release(execution);
    }

    /// Admits one task and returns a permit that releases it on drop.
    pub fn acquire(&self, module: &ModuleId) -> Option<AdmissionPermit> {
        let allocation = self.allocation_entry(module);
        if !self.admit(module, &allocation) {
            return None;
        }
        Some(AdmissionPermit {
            allocation,
            started: Instant::now(),
        })
    }

    fn allocation_entry(&self, module: &ModuleId) -> Arc<ThreadAllocation> {
        if let Some(existing) = self.allocations.load().get(module) {
            return Arc::clone(existing);
        }
        let created = Arc::new(ThreadAllocation::new(DEFAULT_THREADS, DEFAULT_MAX_TASKS));
        let previous = self.allocations.rcu(|current| {
            let mut next = AllocationMap::clone(current);
            next.entry(module.clone())
                .or_insert_with(|| Arc::clone(&created));
            next
        });
        match previous.get(module) {
            // Another writer published it first.
            Some(existing) => Arc::clone(existing),
            None => {
                log::debug!("Balancer: default allocation created for '{module}'.");
                created
            }
        }
    }

    /// Drops the allocations of modules not in `registered`.
    ///
    /// Returns how many were removed. In-flight permits keep their
    /// allocation alive until they are dropped.
    pub fn retain_modules(&self, registered: &HashSet<ModuleId>) -> usize {
        let stale = self
            .allocations
            .load()
            .keys()
            .filter(|id| !registered.contains(*id))
            .count();
        if stale == 0 {
            return 0;
        }
        let previous = self.allocations.rcu(|current| {
            let mut next = AllocationMap::clone(current);
            next.retain(|id, _| registered.contains(id));
            next
        });
        let removed = previous
            .keys()
            .filter(|id| !registered.contains(*id))
            .count();
        log::debug!("Balancer: pruned {removed} allocation(s) of unregistered modules.");
        removed
    }

    // --- Rebalancing ---

    /// Scores one module. The recent-execution boost uses the last admission.
    pub fn score(&self, input: &BalanceInput) -> f64 {
        let mut score = 1.0;
        if input.avg_response_time_ms > 0.0 {
            score *= (input.avg_response_time_ms / 10.0 + 1.0).min(MAX_RESPONSE_FACTOR);
        }
        score *= (input.cpu_fraction.max(0.0) * 5.0 + 1.0).min(MAX_CPU_FACTOR);
        if self.executed_recently(&input.module_id) {
            score *= RECENT_EXECUTION_BOOST;
        }
        score * input.category.balance_weight()
    }

    fn executed_recently(&self, module: &ModuleId) -> bool {
        let Some(allocation) = self.allocations.load().get(module).cloned() else {
            return false;
        };
        let stamp = allocation.last_admission.load(Ordering::Relaxed);
        if stamp == 0 {
            return false;
        }
        let last = self.epoch + Duration::from_nanos(stamp - 1);
        self.clock.now().saturating_duration_since(last) <= RECENT_EXECUTION_WINDOW
    }

    /// Splits the thread budget between `inputs` proportionally to their scores.
    pub fn rebalance(&self, inputs: &[BalanceInput]) {
        if inputs.is_empty() {
            return;
        }
        let scores: Vec<f64> = inputs.iter().map(|i| self.score(i)).collect();
        let total: f64 = scores.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            log::warn!("Balancer: degenerate total score {total}, skipping rebalance.");
            return;
        }

        for (input, score) in inputs.iter().zip(&scores) {
            let threads = ((score / total) * self.total_threads as f64).round().max(1.0) as usize;
            let max_tasks = threads * 2;
            self.allocation_entry(&input.module_id)
                .set_limits(threads, max_tasks);
            log::debug!(
                "Balancer: '{}' score={:.2} threads={} max_tasks={}",
                input.module_id,
                score,
                threads,
                max_tasks
            );
        }
        log::info!(
            "Balancer: rebalanced {} modules over {} threads.",
            inputs.len(),
            self.total_threads
        );
    }

    /// Applies every queued command. Returns how many were applied.
    pub fn process_commands(&self) -> usize {
        let mut applied = 0;
        for command in self.commands_rx.try_iter() {
            match command {
                BalancerCommand::Throttle { module } => {
                    if self.throttle(&module) {
                        applied += 1;
                    }
                }
            }
        }
        applied
    }

    fn throttle(&self, module: &ModuleId) -> bool {
        let Some(allocation) = self.allocations.load().get(module).cloned() else {
            log::info!("Balancer: no allocation for '{module}', throttle ignored.");
            return false;
        };
        let before = allocation.snapshot();
        let threads = (before.allocated_threads / 2).max(1);
        let max_tasks = (before.max_concurrent_tasks / 2).max(MIN_THROTTLED_TASKS);
        allocation.set_limits(threads, max_tasks);
        log::warn!(
            "Balancer: throttled '{module}' to {threads} threads, {max_tasks} tasks (was {}, {}).",
            before.allocated_threads,
            before.max_concurrent_tasks
        );
        true
    }

    // --- Queries ---

    /// The allocation of `module`, if it has one.
    pub fn allocation(&self, module: &ModuleId) -> Option<AllocationSnapshot> {
        self.allocations.load().get(module).map(|a| a.snapshot())
    }

    /// All allocations, sorted by module.
    pub fn allocations(&self) -> Vec<(ModuleId, AllocationSnapshot)> {
        let mut all: Vec<_> = self
            .allocations
            .load()
            .iter()
            .map(|(id, a)| (id.clone(), a.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("total_threads", &self.total_threads)
            .field("pending_commands", &self.commands_rx.len())
            .finish_non_exhaustive()
    }
}

/// RAII admission: releases the task slot and records its duration on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    allocation: Arc<ThreadAllocation>,
    started: Instant,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.allocation.release(Some(self.started.elapsed()));
    }
}

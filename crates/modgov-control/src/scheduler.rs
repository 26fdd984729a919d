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

//! Periodic task execution.
//!
//! [`WorkerScheduler`] drives the governor in production: one timer thread
//! keeps a deadline heap and hands due tasks to a small pool of worker
//! threads over a `crossbeam-channel`. [`ManualScheduler`] runs the same
//! tasks inline against a [`ManualClock`] so tests control time.
//!
//! A periodic task never overlaps with itself. When a tick comes due while
//! the previous run is still going, the tick is skipped.

use crate::error::{GovernorError, GovernorResult};
use crossbeam_channel::{Receiver, Sender};
use modgov_core::{ManualClock, TaskFn, TaskId, TaskScheduler};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MIN_PERIOD: Duration = Duration::from_millis(1);

struct PeriodicTask {
    name: String,
    period: Duration,
    task: TaskFn,
    running: AtomicBool,
}

#[derive(Default)]
struct TimerState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Arc<PeriodicTask>>,
    next_id: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
    /// Jobs handed to the pool and not yet finished.
    in_flight: Mutex<usize>,
    idle: Condvar,
}

/// Thread-pool backed [`TaskScheduler`].
pub struct WorkerScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerScheduler {
    /// Spawns the timer thread and `workers` worker threads (at least one).
    pub fn new(workers: usize) -> GovernorResult<Self> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Arc<PeriodicTask>>();
        let shared = Arc::new(Shared::default());
        let workers = workers.max(1);
        let mut threads = Vec::with_capacity(workers + 1);

        for index in 0..workers {
            let rx = job_rx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("modgov-worker-{index}"))
                .spawn(move || worker_loop(&shared, &rx))
                .map_err(GovernorError::Spawn)?;
            threads.push(handle);
        }

        let timer_shared = Arc::clone(&shared);
        let timer = thread::Builder::new()
            .name("modgov-timer".into())
            .spawn(move || timer_loop(&timer_shared, &job_tx))
            .map_err(GovernorError::Spawn)?;
        threads.push(timer);

        log::debug!("Scheduler: started with {workers} worker(s).");
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Number of scheduled (not cancelled) tasks.
    pub fn task_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .len()
    }

    /// Stops scheduling and waits up to `timeout` for running tasks.
    ///
    /// Threads are joined when the pool went idle in time and detached
    /// otherwise. Returns `true` if the pool went idle.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.signal_shutdown();
        let idle = self.quiesce(timeout);
        let handles = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        if idle {
            for handle in handles {
                if handle.join().is_err() {
                    log::warn!("Scheduler: a thread exited with a panic.");
                }
            }
        } else {
            log::warn!(
                "Scheduler: {} thread(s) still busy after {timeout:?}, detaching.",
                handles.len()
            );
        }
        idle
    }

    fn signal_shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.shutdown = true;
        state.tasks.clear();
        state.queue.clear();
        self.shared.wake.notify_all();
    }
}

impl TaskScheduler for WorkerScheduler {
    fn schedule_periodic(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        task: TaskFn,
    ) -> TaskId {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        if state.shutdown {
            log::warn!("Scheduler: '{name}' not scheduled, scheduler is shut down.");
            return TaskId(id);
        }

        state.tasks.insert(
            id,
            Arc::new(PeriodicTask {
                name: name.to_owned(),
                period: period.max(MIN_PERIOD),
                task,
                running: AtomicBool::new(false),
            }),
        );
        state
            .queue
            .push(Reverse((Instant::now() + initial_delay, id)));
        self.shared.wake.notify_all();
        log::debug!("Scheduler: '{name}' scheduled every {period:?} as {}.", TaskId(id));
        TaskId(id)
    }

    fn cancel(&self, id: TaskId) -> bool {
        // The heap entry is discarded lazily by the timer thread.
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .remove(&id.0)
            .is_some()
    }

    fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self
            .shared
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            in_flight = self
                .shared
                .idle
                .wait_timeout(in_flight, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

fn timer_loop(shared: &Shared, jobs: &Sender<Arc<PeriodicTask>>) {
    let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
    while !state.shutdown {
        let now = Instant::now();
        let Some(Reverse((due, id))) = state.queue.peek().copied() else {
            state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            continue;
        };
        if due > now {
            state = shared
                .wake
                .wait_timeout(state, due - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }

        state.queue.pop();
        let Some(task) = state.tasks.get(&id).cloned() else {
            continue;
        };
        let next = (due + task.period).max(now + MIN_PERIOD);
        state.queue.push(Reverse((next, id)));

        if task.running.swap(true, Ordering::AcqRel) {
            log::trace!("Scheduler: '{}' still running, tick skipped.", task.name);
            continue;
        }
        *shared.in_flight.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        if let Err(rejected) = jobs.send(task) {
            rejected.0.running.store(false, Ordering::Release);
            finish_job(shared);
            break;
        }
    }
    log::debug!("Scheduler: timer thread stopped.");
}

fn worker_loop(shared: &Shared, jobs: &Receiver<Arc<PeriodicTask>>) {
    while let Ok(job) = jobs.recv() {
        let started = Instant::now();
        if panic::catch_unwind(AssertUnwindSafe(|| (job.task)())).is_err() {
            log::error!("Scheduler: task '{}' panicked.", job.name);
        }
        log::trace!("Scheduler: '{}' ran in {:?}.", job.name, started.elapsed());
        job.running.store(false, Ordering::Release);
        finish_job(shared);
    }
}

fn finish_job(shared: &Shared) {
    let mut in_flight = shared.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
    *in_flight = in_flight.saturating_sub(1);
    if *in_flight == 0 {
        shared.idle.notify_all();
    }
}

struct ManualTask {
    name: String,
    next_due: Duration,
    period: Duration,
    task: TaskFn,
}

#[derive(Default)]
struct ManualState {
    tasks: BTreeMap<u64, ManualTask>,
    next_id: u64,
}

/// Deterministic [`TaskScheduler`] for tests.
///
/// Nothing runs until [`advance`](Self::advance) is called; due tasks then
/// run inline on the caller's thread, in due order, with the clock stepped to
/// each due time first.
pub struct ManualScheduler {
    clock: ManualClock,
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    /// Creates a scheduler driving `clock`.
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            state: Mutex::new(ManualState::default()),
        }
    }

    /// The clock this scheduler advances.
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Number of scheduled tasks.
    pub fn task_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .len()
    }

    /// Moves time forward by `by`, running every task that comes due.
    /// Returns the number of runs.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.clock.elapsed() + by;
        let mut runs = 0;
        loop {
            let due = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                let next = state
                    .tasks
                    .iter_mut()
                    .filter(|(_, t)| t.next_due <= target)
                    .min_by_key(|(id, t)| (t.next_due, **id));
                next.map(|(_, t)| {
                    let at = t.next_due;
                    t.next_due += t.period;
                    (at, t.name.clone(), Arc::clone(&t.task))
                })
            };
            let Some((at, name, task)) = due else { break };

            let now = self.clock.elapsed();
            if at > now {
                self.clock.advance(at - now);
            }
            log::trace!("ManualScheduler: running '{name}' at {at:?}.");
            task();
            runs += 1;
        }

        let now = self.clock.elapsed();
        if target > now {
            self.clock.advance(target - now);
        }
        runs
    }
}

impl TaskScheduler for ManualScheduler {
    fn schedule_periodic(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        task: TaskFn,
    ) -> TaskId {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(
            id,
            ManualTask {
                name: name.to_owned(),
                next_due: self.clock.elapsed() + initial_delay,
                period: period.max(MIN_PERIOD),
                task,
            },
        );
        TaskId(id)
    }

    fn cancel(&self, id: TaskId) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .remove(&id.0)
            .is_some()
    }

    fn quiesce(&self, _timeout: Duration) -> bool {
        true
    }
}

//! Bounded-concurrency dispatch of jobs onto a fixed pool of workers.
//!
//! A single loop owns the pending queue, the retry schedule and every worker
//! slot. Workers report back over one channel; nothing else mutates
//! scheduling state. A replacement worker never opens its copy before the
//! worker it replaces has exited.

use crate::error::{EngineError, EngineResult, JobError};
use crate::executor::{ExecutorBackend, KillSwitch};
use crate::queue::Job;
use crate::sink::ResultSink;
use crate::tables::JobInputs;
use crate::worker::{
    spawn_worker, Assignment, JobOutcome, WorkerEvent, WorkerHandle, WorkerOptions, WorkerSpawn,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TIMEOUT_WARN_FRACTION: f64 = 0.7;
/// Upper bound on how long the loop blocks, so a shutdown request is seen
/// promptly.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed per job, the first one included.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
}

impl RetryPolicy {
    /// Delay before re-enqueueing after failed attempt `attempt` (1-based):
    /// `retry_delay * retry_backoff^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.retry_delay.as_secs_f64() * self.retry_backoff.powi(exp);
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard per-attempt deadline.
    pub worker_timeout: Duration,
    /// Interval between "waiting for results" progress lines.
    pub queue_timeout: Duration,
    pub retry: RetryPolicy,
    pub worker: WorkerOptions,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(300),
            queue_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            worker: WorkerOptions::default(),
        }
    }
}

/// Cooperative stop request, set from a signal handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    InFlight,
    RetryPending,
    Succeeded,
    FailedTerminal,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedTerminal)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    #[serde(flatten)]
    pub job: Job,
    pub state: JobState,
    pub attempts: u32,
    pub error: Option<JobError>,
    pub output: Option<PathBuf>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub worker_restarts: u32,
    /// Set when the run stopped on a shutdown request.
    pub interrupted: bool,
    pub elapsed_secs: f64,
    pub jobs: Vec<JobRecord>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs
            .iter()
            .filter(|r| r.state == JobState::FailedTerminal)
    }
}

/// One dispatch of a job onto a worker.
#[derive(Debug, Clone)]
pub struct JobAttempt {
    pub job_index: usize,
    pub attempt_number: u32,
    pub assigned_worker: usize,
    pub started_at: DateTime<Utc>,
    pub deadline: Instant,
    started: Instant,
    ticket: u64,
    warned: bool,
}

enum SlotState {
    /// Opening the session; the slot is retired if this outlives `deadline`.
    Starting { deadline: Instant },
    Idle,
    Busy(JobAttempt),
    Retired,
}

/// A pool member and the isolated model copy it owns for the whole run.
pub struct WorkerSlot {
    pub worker_id: usize,
    pub isolated_resource_path: PathBuf,
    state: SlotState,
    generation: u64,
    kill: Option<KillSwitch>,
    handle: Option<WorkerHandle>,
}

impl WorkerSlot {
    pub fn busy(&self) -> bool {
        matches!(self.state, SlotState::Busy(_))
    }

    fn idle(&self) -> bool {
        matches!(self.state, SlotState::Idle)
    }

    fn retired(&self) -> bool {
        matches!(self.state, SlotState::Retired)
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    backend: Arc<dyn ExecutorBackend>,
    inputs: Arc<JobInputs>,
    sink: Arc<dyn ResultSink>,
    resources: Vec<PathBuf>,
    shutdown: ShutdownFlag,
}

impl Scheduler {
    /// `resources` holds one isolated model copy per worker; its length is
    /// the pool size.
    pub fn new(
        config: SchedulerConfig,
        backend: Arc<dyn ExecutorBackend>,
        inputs: Arc<JobInputs>,
        sink: Arc<dyn ResultSink>,
        resources: Vec<PathBuf>,
    ) -> Self {
        Self {
            config,
            backend,
            inputs,
            sink,
            resources,
            shutdown: ShutdownFlag::default(),
        }
    }

    /// Stops the run early once `flag` is requested. Unfinished jobs are
    /// reported as cancelled.
    pub fn with_shutdown(mut self, flag: ShutdownFlag) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn pool_size(&self) -> usize {
        self.resources.len()
    }

    /// Runs every job to `Succeeded` or `FailedTerminal`. Only pool start-up
    /// problems are returned as errors; job failures land in the summary.
    pub fn run(&self, jobs: Vec<Job>) -> EngineResult<RunSummary> {
        if self.resources.is_empty() {
            return Err(EngineError::Config("worker pool is empty".to_string()));
        }
        let mut run = RunState::new(self, jobs);
        run.start_pool()?;
        run.drive();
        run.shutdown();
        Ok(run.into_summary())
    }
}

struct RunState<'a> {
    sched: &'a Scheduler,
    records: Vec<JobRecord>,
    queue: VecDeque<usize>,
    retries: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    slots: Vec<WorkerSlot>,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    next_ticket: u64,
    succeeded: usize,
    failed: usize,
    worker_restarts: u32,
    interrupted: bool,
    started: Instant,
    last_progress: Instant,
}

impl<'a> RunState<'a> {
    fn new(sched: &'a Scheduler, jobs: Vec<Job>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let records: Vec<JobRecord> = jobs
            .into_iter()
            .map(|job| JobRecord {
                job,
                state: JobState::Queued,
                attempts: 0,
                error: None,
                output: None,
                elapsed_secs: 0.0,
            })
            .collect();
        let queue = (0..records.len()).collect();
        let open_deadline = Instant::now() + open_budget(&sched.config);
        let slots = sched
            .resources
            .iter()
            .enumerate()
            .map(|(i, path)| WorkerSlot {
                worker_id: i + 1,
                isolated_resource_path: path.clone(),
                state: SlotState::Starting {
                    deadline: open_deadline,
                },
                generation: 0,
                kill: None,
                handle: None,
            })
            .collect();
        Self {
            sched,
            records,
            queue,
            retries: BinaryHeap::new(),
            slots,
            events_tx,
            events_rx,
            next_ticket: 0,
            succeeded: 0,
            failed: 0,
            worker_restarts: 0,
            interrupted: false,
            started: Instant::now(),
            last_progress: Instant::now(),
        }
    }

    fn start_pool(&mut self) -> EngineResult<()> {
        tracing::info!("Starting {} worker threads", self.slots.len());
        for idx in 0..self.slots.len() {
            let handle = self.spawn_for(idx, None)?;
            self.slots[idx].handle = Some(handle);
        }
        tracing::info!(
            "Created {} jobs for {} workers",
            self.records.len(),
            self.slots.len()
        );
        Ok(())
    }

    fn spawn_for(
        &self,
        idx: usize,
        predecessor: Option<JoinHandle<()>>,
    ) -> std::io::Result<WorkerHandle> {
        let slot = &self.slots[idx];
        spawn_worker(
            WorkerSpawn {
                worker_id: slot.worker_id,
                generation: slot.generation,
                resource: slot.isolated_resource_path.clone(),
                backend: Arc::clone(&self.sched.backend),
                inputs: Arc::clone(&self.sched.inputs),
                options: self.sched.config.worker.clone(),
                predecessor,
            },
            self.events_tx.clone(),
        )
    }

    fn finished(&self) -> bool {
        self.succeeded + self.failed == self.records.len()
    }

    fn drive(&mut self) {
        while !self.finished() {
            if self.sched.shutdown.is_requested() {
                let unfinished = self.records.len() - self.succeeded - self.failed;
                tracing::warn!(
                    "Shutdown requested, stopping dispatch and cancelling {} unfinished jobs",
                    unfinished
                );
                self.interrupted = true;
                self.fail_remaining(JobError::Cancelled);
                break;
            }
            let now = Instant::now();
            self.promote_due_retries(now);
            self.dispatch();

            if self.slots.iter().all(WorkerSlot::retired) {
                tracing::error!("all workers are unavailable, failing remaining jobs");
                self.fail_remaining(JobError::WorkerUnavailable);
                break;
            }

            let wait = self.next_wakeup(now);
            match self.events_rx.recv_timeout(wait) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {
                    let active = self.slots.iter().filter(|s| s.busy()).count();
                    if active > 0 && self.last_progress.elapsed() >= self.sched.config.queue_timeout
                    {
                        self.last_progress = Instant::now();
                        tracing::debug!(
                            "Waiting for results... ({} jobs active, {} pending, {} awaiting retry)",
                            active,
                            self.queue.len(),
                            self.retries.len()
                        );
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.fail_remaining(JobError::WorkerUnavailable);
                    break;
                }
            }
            self.enforce_deadlines(Instant::now());
        }
    }

    fn promote_due_retries(&mut self, now: Instant) {
        while let Some(Reverse((eligible, _, _))) = self.retries.peek() {
            if *eligible > now {
                break;
            }
            if let Some(Reverse((_, _, job_index))) = self.retries.pop() {
                self.records[job_index].state = JobState::Queued;
                self.queue.push_back(job_index);
            }
        }
    }

    fn dispatch(&mut self) {
        while let Some(&job_index) = self.queue.front() {
            let Some(idx) = self.slots.iter().position(WorkerSlot::idle) else {
                break;
            };
            self.queue.pop_front();
            self.assign(idx, job_index);
        }
    }

    fn assign(&mut self, idx: usize, job_index: usize) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let job = self.records[job_index].job;
        let attempt_number = self.records[job_index].attempts + 1;

        let sent = match self.slots[idx].handle.as_ref() {
            Some(handle) => handle.assignments.send(Assignment { ticket, job }).is_ok(),
            None => false,
        };
        if !sent {
            // the worker thread is gone; requeue without charging an attempt
            tracing::warn!(worker = self.slots[idx].worker_id, "worker vanished, restarting");
            self.queue.push_front(job_index);
            self.restart_slot(idx);
            return;
        }

        let record = &mut self.records[job_index];
        record.attempts = attempt_number;
        record.state = JobState::InFlight;
        let now = Instant::now();
        let slot = &mut self.slots[idx];
        tracing::debug!(
            worker = slot.worker_id,
            attempt = attempt_number,
            "Worker {} assigned {}",
            slot.worker_id,
            job
        );
        slot.state = SlotState::Busy(JobAttempt {
            job_index,
            attempt_number,
            assigned_worker: slot.worker_id,
            started_at: Utc::now(),
            deadline: now + self.sched.config.worker_timeout,
            started: now,
            ticket,
            warned: false,
        });
    }

    fn next_wakeup(&self, now: Instant) -> Duration {
        let timeout = self.sched.config.worker_timeout;
        let mut wait = self.sched.config.queue_timeout.min(SHUTDOWN_POLL);
        for slot in &self.slots {
            match &slot.state {
                SlotState::Busy(attempt) => {
                    wait = wait.min(attempt.deadline.saturating_duration_since(now));
                    if !attempt.warned {
                        let warn_at = attempt.started + timeout.mul_f64(TIMEOUT_WARN_FRACTION);
                        wait = wait.min(warn_at.saturating_duration_since(now));
                    }
                }
                SlotState::Starting { deadline } => {
                    wait = wait.min(deadline.saturating_duration_since(now));
                }
                _ => {}
            }
        }
        if let Some(Reverse((eligible, _, _))) = self.retries.peek() {
            wait = wait.min(eligible.saturating_duration_since(now));
        }
        wait
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready {
                worker_id,
                generation,
                kill,
            } => {
                let Some(idx) = self.current_slot(worker_id, generation) else {
                    // a replaced worker finished opening late; make sure it lets go
                    if let Some(kill) = kill {
                        kill.fire();
                    }
                    return;
                };
                let slot = &mut self.slots[idx];
                slot.kill = kill;
                slot.state = SlotState::Idle;
                tracing::debug!(worker = worker_id, generation, "worker idle");
            }
            WorkerEvent::OpenFailed {
                worker_id,
                generation,
                error,
            } => {
                let Some(idx) = self.current_slot(worker_id, generation) else {
                    return;
                };
                tracing::error!(worker = worker_id, error = %error, "retiring worker");
                let slot = &mut self.slots[idx];
                slot.state = SlotState::Retired;
                slot.handle = None;
            }
            WorkerEvent::Finished {
                worker_id,
                generation,
                ticket,
                outcome,
            } => {
                let Some(idx) = self.current_slot(worker_id, generation) else {
                    tracing::debug!(worker = worker_id, generation, "discarding stale outcome");
                    return;
                };
                let slot = &mut self.slots[idx];
                let matches = matches!(&slot.state, SlotState::Busy(a) if a.ticket == ticket);
                if !matches {
                    tracing::debug!(worker = worker_id, ticket, "discarding unexpected outcome");
                    return;
                }
                let SlotState::Busy(attempt) = std::mem::replace(&mut slot.state, SlotState::Idle)
                else {
                    return;
                };
                self.apply_outcome(attempt, outcome);
            }
        }
    }

    fn current_slot(&self, worker_id: usize, generation: u64) -> Option<usize> {
        let idx = worker_id.checked_sub(1)?;
        let slot = self.slots.get(idx)?;
        (slot.generation == generation).then_some(idx)
    }

    fn apply_outcome(&mut self, attempt: JobAttempt, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Success(batch) => match self.sched.sink.persist(&batch) {
                Ok(path) => {
                    self.succeeded += 1;
                    let done = self.succeeded + self.failed;
                    let total = self.records.len();
                    let record = &mut self.records[attempt.job_index];
                    record.state = JobState::Succeeded;
                    record.error = None;
                    record.output = Some(path);
                    record.elapsed_secs = attempt.started.elapsed().as_secs_f64();
                    tracing::info!(
                        "Completed {}/{}: Scenario {}, Policy {} ({:.2}s)",
                        done,
                        total,
                        record.job.scenario_id,
                        record.job.policy_id,
                        record.elapsed_secs
                    );
                }
                Err(err) => self.retry_or_fail(attempt, err),
            },
            JobOutcome::Retryable(err) => self.retry_or_fail(attempt, err),
            JobOutcome::Fatal(err) => {
                tracing::error!(
                    attempt = attempt.attempt_number,
                    "{} failed fatally: {}",
                    self.records[attempt.job_index].job,
                    err
                );
                self.fail_terminal(attempt.job_index, err, attempt.started);
            }
        }
    }

    fn retry_or_fail(&mut self, attempt: JobAttempt, err: JobError) {
        let policy = self.sched.config.retry.clone();
        let job = self.records[attempt.job_index].job;
        if policy.allows_retry(attempt.attempt_number) {
            let delay = policy.delay_for(attempt.attempt_number);
            tracing::warn!(
                attempt = attempt.attempt_number,
                max = policy.max_retries,
                delay_secs = delay.as_secs_f64(),
                "{} failed, retrying: {}",
                job,
                err
            );
            let eligible = Instant::now().checked_add(delay).unwrap_or_else(|| {
                Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
            });
            let record = &mut self.records[attempt.job_index];
            record.state = JobState::RetryPending;
            record.error = Some(err);
            self.retries
                .push(Reverse((eligible, attempt.ticket, attempt.job_index)));
        } else {
            tracing::error!(
                attempts = attempt.attempt_number,
                "{} failed after {} attempts: {}",
                job,
                attempt.attempt_number,
                err
            );
            let err = JobError::RetryExhausted {
                attempts: attempt.attempt_number,
                last: Box::new(err),
            };
            self.fail_terminal(attempt.job_index, err, attempt.started);
        }
    }

    fn fail_terminal(&mut self, job_index: usize, err: JobError, started: Instant) {
        self.failed += 1;
        let record = &mut self.records[job_index];
        record.state = JobState::FailedTerminal;
        record.error = Some(err);
        record.elapsed_secs = started.elapsed().as_secs_f64();
        discard_output(self.sched, &record.job);
    }

    fn fail_remaining(&mut self, err: JobError) {
        self.queue.clear();
        self.retries.clear();
        let sched = self.sched;
        for record in self.records.iter_mut() {
            if !record.state.is_terminal() {
                record.state = JobState::FailedTerminal;
                record.error = Some(err.clone());
                self.failed += 1;
                discard_output(sched, &record.job);
            }
        }
    }

    fn enforce_deadlines(&mut self, now: Instant) {
        let timeout = self.sched.config.worker_timeout;
        for idx in 0..self.slots.len() {
            let worker_id = self.slots[idx].worker_id;
            if matches!(self.slots[idx].state, SlotState::Starting { deadline } if now >= deadline)
            {
                self.retire_stuck_open(idx);
                continue;
            }
            let expired = match &mut self.slots[idx].state {
                SlotState::Busy(attempt) => {
                    let elapsed = now.saturating_duration_since(attempt.started);
                    if !attempt.warned && elapsed >= timeout.mul_f64(TIMEOUT_WARN_FRACTION) {
                        attempt.warned = true;
                        tracing::warn!(
                            "Worker {} approaching timeout: {:.0}s / {:.0}s",
                            worker_id,
                            elapsed.as_secs_f64(),
                            timeout.as_secs_f64()
                        );
                    }
                    now >= attempt.deadline
                }
                _ => false,
            };
            if !expired {
                continue;
            }
            let SlotState::Busy(attempt) = std::mem::replace(
                &mut self.slots[idx].state,
                SlotState::Starting {
                    deadline: now + open_budget(&self.sched.config),
                },
            ) else {
                continue;
            };
            let elapsed = now.saturating_duration_since(attempt.started);
            tracing::error!(
                "Worker {} timeout after {:.1}s, restarting",
                worker_id,
                elapsed.as_secs_f64()
            );
            self.restart_slot(idx);
            self.retry_or_fail(
                attempt,
                JobError::Timeout {
                    after_secs: elapsed.as_secs_f64(),
                },
            );
        }
    }

    /// Kills the slot's current worker and starts a fresh one on the same
    /// isolated resource. The replacement first waits for the old thread to
    /// exit; late events of the old thread carry a stale generation and are
    /// ignored.
    fn restart_slot(&mut self, idx: usize) {
        let deadline = Instant::now() + open_budget(&self.sched.config);
        let predecessor = {
            let slot = &mut self.slots[idx];
            if let Some(kill) = slot.kill.take() {
                kill.fire();
            }
            slot.generation += 1;
            slot.state = SlotState::Starting { deadline };
            // dropping the assignment sender lets the old loop exit
            slot.handle.take().map(|handle| handle.thread)
        };
        self.worker_restarts += 1;
        match self.spawn_for(idx, predecessor) {
            Ok(handle) => self.slots[idx].handle = Some(handle),
            Err(e) => {
                let slot = &mut self.slots[idx];
                tracing::error!(worker = slot.worker_id, error = %e, "could not restart worker");
                slot.state = SlotState::Retired;
            }
        }
    }

    /// A worker that never finished opening is abandoned. Its thread stays
    /// detached and a late `Ready` fires its kill switch.
    fn retire_stuck_open(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        tracing::error!(
            "Worker {} did not become ready within {:.1}s, retiring it",
            slot.worker_id,
            open_budget(&self.sched.config).as_secs_f64()
        );
        slot.generation += 1;
        slot.handle = None;
        slot.state = SlotState::Retired;
    }

    fn shutdown(&mut self) {
        tracing::info!("Sending shutdown signals to {} workers", self.slots.len());
        for slot in self.slots.iter_mut() {
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            let WorkerHandle {
                assignments,
                thread,
            } = handle;
            drop(assignments);
            if slot.idle() {
                if thread.join().is_err() {
                    tracing::warn!(worker = slot.worker_id, "worker thread panicked");
                }
            } else if let Some(kill) = slot.kill.take() {
                kill.fire();
            }
        }
    }

    fn into_summary(self) -> RunSummary {
        let elapsed = self.started.elapsed().as_secs_f64();
        let total = self.records.len();
        let avg = if total > 0 { elapsed / total as f64 } else { 0.0 };
        tracing::info!(
            "Engine shutdown complete. Completed {}/{} jobs ({} failed)",
            self.succeeded,
            total,
            self.failed
        );
        tracing::info!(
            "Total engine time: {:.2}s ({:.2}m), average per job: {:.2}s",
            elapsed,
            elapsed / 60.0,
            avg
        );
        RunSummary {
            total,
            succeeded: self.succeeded,
            failed: self.failed,
            worker_restarts: self.worker_restarts,
            interrupted: self.interrupted,
            elapsed_secs: elapsed,
            jobs: self.records,
        }
    }
}

/// Time a slot may spend opening its session, including the wait for a
/// predecessor to release the copy.
fn open_budget(config: &SchedulerConfig) -> Duration {
    config.worker_timeout + config.worker.release_timeout
}

fn discard_output(sched: &Scheduler, job: &Job) {
    if let Err(e) = sched.sink.discard(job) {
        tracing::warn!("could not remove output of {}: {}", job, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use crate::executor::{ExecutorSession, SimValues};
    use crate::queue::build_jobs;
    use crate::sink::CsvResultSink;
    use crate::tables::InputTable;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::thread;

    /// Policy values drive the fake executor: `[0.0]` succeeds, `[1.0]`
    /// fails retryably, `[2.0]` fails fatally, `[3.0]` fails on the first
    /// attempt only, `[4.0]` hangs on its first call until killed.
    #[derive(Default)]
    struct FakeBackend {
        flaky_calls: AtomicU32,
        hangs_left: AtomicU32,
        call_log: Mutex<Vec<(u64, Instant)>>,
    }

    impl FakeBackend {
        fn with_hangs(n: u32) -> Self {
            let backend = FakeBackend::default();
            backend.hangs_left.store(n, Ordering::SeqCst);
            backend
        }
    }

    struct FakeSession {
        backend: Arc<FakeBackend>,
        killed: Arc<AtomicBool>,
    }

    struct Shared(Arc<FakeBackend>);

    impl ExecutorBackend for Shared {
        fn open(&self, _resource: &Path) -> Result<Box<dyn ExecutorSession>, ExecutorError> {
            Ok(Box::new(FakeSession {
                backend: Arc::clone(&self.0),
                killed: Arc::new(AtomicBool::new(false)),
            }))
        }
    }

    impl ExecutorSession for FakeSession {
        fn run_one(&mut self, scenario: &[f64], policy: &[f64]) -> Result<SimValues, ExecutorError> {
            self.backend
                .call_log
                .lock()
                .expect("log")
                .push((policy[0] as u64, Instant::now()));
            match policy[0] as u64 {
                1 => Err(ExecutorError::retryable("recalc failed")),
                2 => Err(ExecutorError::fatal("malformed policy")),
                3 if self.backend.flaky_calls.fetch_add(1, Ordering::SeqCst) == 1 => {
                    Err(ExecutorError::retryable("transient"))
                }
                4 if self
                    .backend
                    .hangs_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok() =>
                {
                    while !self.killed.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(ExecutorError::retryable("killed"))
                }
                _ => Ok(SimValues {
                    pvfp: scenario[0],
                    pvfprem: 0.5,
                }),
            }
        }

        fn kill_switch(&self) -> Option<KillSwitch> {
            let killed = Arc::clone(&self.killed);
            Some(KillSwitch::new(move || killed.store(true, Ordering::SeqCst)))
        }
    }

    /// Tracks how many sessions are open on each copy at once. The first
    /// call hangs until killed; closing a session takes a while.
    #[derive(Default)]
    struct ExclusiveBackend {
        live: Mutex<HashMap<PathBuf, u32>>,
        max_live: AtomicU32,
        hung: AtomicBool,
    }

    struct Exclusive(Arc<ExclusiveBackend>);

    struct SlowCloseSession {
        backend: Arc<ExclusiveBackend>,
        resource: PathBuf,
        killed: Arc<AtomicBool>,
    }

    impl ExecutorBackend for Exclusive {
        fn open(&self, resource: &Path) -> Result<Box<dyn ExecutorSession>, ExecutorError> {
            let mut live = self.0.live.lock().expect("live");
            let count = live.entry(resource.to_path_buf()).or_insert(0);
            *count += 1;
            self.0.max_live.fetch_max(*count, Ordering::SeqCst);
            Ok(Box::new(SlowCloseSession {
                backend: Arc::clone(&self.0),
                resource: resource.to_path_buf(),
                killed: Arc::new(AtomicBool::new(false)),
            }))
        }
    }

    impl ExecutorSession for SlowCloseSession {
        fn run_one(&mut self, scenario: &[f64], _policy: &[f64]) -> Result<SimValues, ExecutorError> {
            if !self.backend.hung.swap(true, Ordering::SeqCst) {
                while !self.killed.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                return Err(ExecutorError::retryable("killed"));
            }
            Ok(SimValues {
                pvfp: scenario[0],
                pvfprem: 0.5,
            })
        }

        fn kill_switch(&self) -> Option<KillSwitch> {
            let killed = Arc::clone(&self.killed);
            Some(KillSwitch::new(move || killed.store(true, Ordering::SeqCst)))
        }
    }

    impl Drop for SlowCloseSession {
        fn drop(&mut self) {
            thread::sleep(Duration::from_millis(200));
            if let Ok(mut live) = self.backend.live.lock() {
                if let Some(count) = live.get_mut(&self.resource) {
                    *count -= 1;
                }
            }
        }
    }

    /// Opening never completes within the test's budget.
    struct HangingOpen;

    impl ExecutorBackend for HangingOpen {
        fn open(&self, _resource: &Path) -> Result<Box<dyn ExecutorSession>, ExecutorError> {
            thread::sleep(Duration::from_secs(2));
            Err(ExecutorError::fatal("gave up opening"))
        }
    }

    struct FailingOpen;

    impl ExecutorBackend for FailingOpen {
        fn open(&self, resource: &Path) -> Result<Box<dyn ExecutorSession>, ExecutorError> {
            Err(ExecutorError::fatal(format!("cannot open {}", resource.display())))
        }
    }

    fn inputs() -> Arc<JobInputs> {
        Arc::new(JobInputs {
            scenarios: InputTable::from_rows((1..=4).map(|id| (id, vec![id as f64]))),
            policies: InputTable::from_rows(vec![
                (100, vec![0.0]),
                (101, vec![1.0]),
                (102, vec![2.0]),
                (103, vec![3.0]),
                (104, vec![4.0]),
            ]),
        })
    }

    fn config(timeout_ms: u64, max_retries: u32, delay_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            worker_timeout: Duration::from_millis(timeout_ms),
            queue_timeout: Duration::from_millis(50),
            retry: RetryPolicy {
                max_retries,
                retry_delay: Duration::from_millis(delay_ms),
                retry_backoff: 2.0,
            },
            worker: WorkerOptions {
                open_attempts: 1,
                open_retry_delay: Duration::from_millis(1),
                release_timeout: Duration::from_millis(500),
            },
        }
    }

    fn scheduler(
        backend: Arc<dyn ExecutorBackend>,
        out: &Path,
        pool: usize,
        config: SchedulerConfig,
    ) -> Scheduler {
        let resources = (1..=pool)
            .map(|i| PathBuf::from(format!("model_worker_{}.xlsb", i)))
            .collect();
        Scheduler::new(
            config,
            backend,
            inputs(),
            Arc::new(CsvResultSink::new(out)),
            resources,
        )
    }

    fn record(summary: &RunSummary, scenario: u64, policy: u64) -> &JobRecord {
        summary
            .jobs
            .iter()
            .find(|r| r.job.scenario_id == scenario && r.job.policy_id == policy)
            .expect("record")
    }

    #[test]
    fn backoff_grows_geometrically() {
        let policy = RetryPolicy {
            max_retries: 5,
            retry_delay: Duration::from_millis(500),
            retry_backoff: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4000));
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }

    #[test]
    fn runs_all_jobs_across_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::default());
        let sched = scheduler(Arc::new(Shared(backend)), dir.path(), 3, config(5_000, 3, 1));
        let jobs = build_jobs(&[1, 2, 3, 4], &[100], 3).expect("jobs");
        let summary = sched.run(jobs).expect("run");
        assert!(summary.is_success());
        assert_eq!(summary.succeeded, 4);
        for scen in 1..=4 {
            let rec = record(&summary, scen, 100);
            assert_eq!(rec.attempts, 1);
            let body = fs::read_to_string(rec.output.as_ref().expect("output")).expect("read");
            assert_eq!(body.lines().count(), 4);
        }
    }

    #[test]
    fn retry_exhaustion_is_terminal_and_contained() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::default());
        let sched = scheduler(Arc::new(Shared(backend)), dir.path(), 2, config(5_000, 3, 1));
        let jobs = build_jobs(&[1], &[100, 101], 2).expect("jobs");
        let summary = sched.run(jobs).expect("run");

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_success());
        let failed = record(&summary, 1, 101);
        assert_eq!(failed.state, JobState::FailedTerminal);
        assert_eq!(failed.attempts, 3);
        match failed.error.as_ref().expect("error") {
            JobError::RetryExhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert_eq!(last.code(), "executor_error");
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert!(!dir.path().join("scenario_1").join("policy_101.csv").exists());
        assert!(dir.path().join("scenario_1").join("policy_100.csv").exists());
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::default());
        let sched = scheduler(Arc::new(Shared(backend)), dir.path(), 1, config(5_000, 5, 1));
        let summary = sched
            .run(build_jobs(&[1], &[102], 2).expect("jobs"))
            .expect("run");
        let rec = record(&summary, 1, 102);
        assert_eq!(rec.attempts, 1);
        assert_eq!(rec.error.as_ref().map(JobError::code), Some("executor_error"));
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn failed_attempt_leaves_no_partial_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::default());
        let sched = scheduler(Arc::new(Shared(backend)), dir.path(), 1, config(5_000, 3, 1));
        // policy 103 fails on its second simulation the first time through
        let summary = sched
            .run(build_jobs(&[2], &[103], 4).expect("jobs"))
            .expect("run");
        let rec = record(&summary, 2, 103);
        assert_eq!(rec.state, JobState::Succeeded);
        assert_eq!(rec.attempts, 2);
        let body = fs::read_to_string(rec.output.as_ref().expect("output")).expect("read");
        let sims: Vec<&str> = body.lines().skip(1).map(|l| l.split(',').next().unwrap_or("")).collect();
        assert_eq!(sims, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn retries_wait_for_backoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::default());
        let sched = scheduler(
            Arc::new(Shared(Arc::clone(&backend))),
            dir.path(),
            1,
            config(5_000, 4, 40),
        );
        let summary = sched
            .run(build_jobs(&[1], &[101], 1).expect("jobs"))
            .expect("run");
        assert_eq!(record(&summary, 1, 101).attempts, 4);

        let log = backend.call_log.lock().expect("log");
        let times: Vec<Instant> = log.iter().filter(|(p, _)| *p == 1).map(|(_, t)| *t).collect();
        assert_eq!(times.len(), 4);
        for (i, pair) in times.windows(2).enumerate() {
            let expected = Duration::from_millis(40) * 2u32.pow(i as u32);
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= expected, "gap {:?} shorter than backoff {:?}", gap, expected);
        }
    }

    #[test]
    fn timed_out_worker_is_replaced_without_losing_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::with_hangs(1));
        let sched = scheduler(
            Arc::new(Shared(Arc::clone(&backend))),
            dir.path(),
            2,
            config(300, 3, 1),
        );
        let mut jobs = build_jobs(&[1, 2, 3], &[100], 2).expect("jobs");
        jobs.insert(1, Job {
            scenario_id: 4,
            policy_id: 104,
            n_sims: 2,
        });
        let summary = sched.run(jobs).expect("run");

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.worker_restarts, 1);

        let hung = record(&summary, 4, 104);
        assert_eq!(hung.attempts, 2);
        for rec in &summary.jobs {
            let body = fs::read_to_string(rec.output.as_ref().expect("output")).expect("read");
            assert_eq!(body, format!(
                "sim,PVFP,PVFPrem\n0,{:?},0.5\n1,{:?},0.5\n",
                rec.job.scenario_id as f64, rec.job.scenario_id as f64
            ));
        }
    }

    #[test]
    fn repeated_timeouts_exhaust_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::with_hangs(u32::MAX));
        let sched = scheduler(
            Arc::new(Shared(Arc::clone(&backend))),
            dir.path(),
            1,
            config(100, 2, 1),
        );
        let mut jobs = vec![Job {
            scenario_id: 1,
            policy_id: 104,
            n_sims: 1,
        }];
        jobs.extend(build_jobs(&[2], &[100], 1).expect("jobs"));
        let summary = sched.run(jobs).expect("run");
        let hung = record(&summary, 1, 104);
        assert_eq!(hung.state, JobState::FailedTerminal);
        match hung.error.as_ref().expect("error") {
            JobError::RetryExhausted { attempts, last } => {
                assert_eq!(*attempts, 2);
                assert_eq!(last.code(), "timeout");
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(record(&summary, 2, 100).state, JobState::Succeeded);
        assert_eq!(summary.worker_restarts, 2);
    }

    #[test]
    fn unopenable_pool_fails_jobs_instead_of_hanging() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sched = scheduler(Arc::new(FailingOpen), dir.path(), 2, config(1_000, 3, 1));
        let summary = sched
            .run(build_jobs(&[1, 2], &[100], 1).expect("jobs"))
            .expect("run");
        assert_eq!(summary.failed, 2);
        assert!(summary
            .failures()
            .all(|r| r.error.as_ref().map(JobError::code) == Some("worker_unavailable")));
    }

    #[test]
    fn empty_pool_is_a_startup_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(Shared(Arc::new(FakeBackend::default())));
        let sched = scheduler(backend, dir.path(), 0, config(1_000, 3, 1));
        assert!(matches!(
            sched.run(build_jobs(&[1], &[100], 1).expect("jobs")),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn replacement_waits_for_predecessor_to_release_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(ExclusiveBackend::default());
        let sched = scheduler(
            Arc::new(Exclusive(Arc::clone(&backend))),
            dir.path(),
            1,
            config(100, 3, 1),
        );
        let summary = sched
            .run(build_jobs(&[1], &[100], 1).expect("jobs"))
            .expect("run");
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.worker_restarts, 1);
        assert_eq!(backend.max_live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stuck_open_still_lets_run_finish() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sched = scheduler(Arc::new(HangingOpen), dir.path(), 1, config(100, 3, 1));
        let started = Instant::now();
        let summary = sched
            .run(build_jobs(&[1], &[100], 1).expect("jobs"))
            .expect("run");
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(summary.failed, 1);
        assert_eq!(
            record(&summary, 1, 100).error.as_ref().map(JobError::code),
            Some("worker_unavailable")
        );
    }

    #[test]
    fn shutdown_request_cancels_unfinished_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::with_hangs(1));
        let flag = ShutdownFlag::default();
        let sched = scheduler(
            Arc::new(Shared(Arc::clone(&backend))),
            dir.path(),
            1,
            config(5_000, 3, 1),
        )
        .with_shutdown(flag.clone());
        let jobs = vec![
            Job {
                scenario_id: 1,
                policy_id: 104,
                n_sims: 1,
            },
            Job {
                scenario_id: 2,
                policy_id: 100,
                n_sims: 1,
            },
        ];
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            flag.request();
        });
        let started = Instant::now();
        let summary = sched.run(jobs).expect("run");
        trigger.join().expect("trigger");

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(summary.interrupted);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 2);
        assert!(summary
            .failures()
            .all(|r| r.error.as_ref().map(JobError::code) == Some("cancelled")));
        assert!(!dir.path().join("scenario_2").join("policy_100.csv").exists());
    }

    #[test]
    fn terminal_failure_removes_stale_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = dir.path().join("scenario_1").join("policy_102.csv");
        fs::create_dir_all(stale.parent().expect("parent")).expect("mkdir");
        fs::write(&stale, "sim,PVFP,PVFPrem\n0,9.0,9.0\n").expect("write");

        let backend = Arc::new(FakeBackend::default());
        let sched = scheduler(Arc::new(Shared(backend)), dir.path(), 1, config(5_000, 3, 1));
        let summary = sched
            .run(build_jobs(&[1], &[102], 1).expect("jobs"))
            .expect("run");
        assert_eq!(summary.failed, 1);
        assert!(!stale.exists());
    }
}

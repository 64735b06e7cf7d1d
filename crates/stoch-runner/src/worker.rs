use crate::error::{ExecutorError, JobError};
use crate::executor::{ExecutorBackend, ExecutorSession, KillSwitch};
use crate::queue::Job;
use crate::tables::JobInputs;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimRecord {
    pub sim_index: u32,
    pub pvfp: f64,
    pub pvfprem: f64,
}

/// Complete outputs of one successful job execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultBatch {
    pub scenario_id: u64,
    pub policy_id: u64,
    pub records: Vec<SimRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(ResultBatch),
    Retryable(JobError),
    Fatal(JobError),
}

/// Executes jobs against one exclusively owned executor session.
pub struct Worker {
    worker_id: usize,
    session: Box<dyn ExecutorSession>,
    inputs: Arc<JobInputs>,
}

impl Worker {
    pub fn new(worker_id: usize, session: Box<dyn ExecutorSession>, inputs: Arc<JobInputs>) -> Self {
        Self {
            worker_id,
            session,
            inputs,
        }
    }

    /// Runs all `n_sims` trials of `job`. A single failing trial abandons the
    /// whole attempt; partial batches are never returned.
    pub fn execute(&mut self, job: &Job) -> JobOutcome {
        let Some(scenario) = self.inputs.scenarios.get(job.scenario_id) else {
            return JobOutcome::Fatal(JobError::MissingInput {
                what: "scenario".to_string(),
                id: job.scenario_id,
            });
        };
        let Some(policy) = self.inputs.policies.get(job.policy_id) else {
            return JobOutcome::Fatal(JobError::MissingInput {
                what: "policy".to_string(),
                id: job.policy_id,
            });
        };

        let started = Instant::now();
        let mut records = Vec::with_capacity(job.n_sims as usize);
        for sim_index in 0..job.n_sims {
            match self.session.run_one(scenario, policy) {
                Ok(values) => records.push(SimRecord {
                    sim_index,
                    pvfp: values.pvfp,
                    pvfprem: values.pvfprem,
                }),
                Err(source) => {
                    tracing::warn!(
                        worker = self.worker_id,
                        sim_index,
                        error = %source,
                        "simulation failed, abandoning {}",
                        job
                    );
                    let fatal = source.is_fatal();
                    let err = JobError::Executor { sim_index, source };
                    return if fatal {
                        JobOutcome::Fatal(err)
                    } else {
                        JobOutcome::Retryable(err)
                    };
                }
            }
        }
        tracing::debug!(
            worker = self.worker_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ran {} simulations for {}",
            job.n_sims,
            job
        );
        JobOutcome::Success(ResultBatch {
            scenario_id: job.scenario_id,
            policy_id: job.policy_id,
            records,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub open_attempts: u32,
    pub open_retry_delay: Duration,
    /// How long a replacement waits for its predecessor to release the
    /// isolated copy before giving up on the slot.
    pub release_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            open_attempts: 3,
            open_retry_delay: Duration::from_secs(1),
            release_timeout: Duration::from_secs(30),
        }
    }
}

const RELEASE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub(crate) struct Assignment {
    pub ticket: u64,
    pub job: Job,
}

/// Messages from worker threads to the scheduler. `generation` identifies
/// which incarnation of the slot sent it.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Ready {
        worker_id: usize,
        generation: u64,
        kill: Option<KillSwitch>,
    },
    OpenFailed {
        worker_id: usize,
        generation: u64,
        error: ExecutorError,
    },
    Finished {
        worker_id: usize,
        generation: u64,
        ticket: u64,
        outcome: JobOutcome,
    },
}

pub(crate) struct WorkerHandle {
    pub assignments: Sender<Assignment>,
    pub thread: JoinHandle<()>,
}

pub(crate) struct WorkerSpawn {
    pub worker_id: usize,
    pub generation: u64,
    pub resource: PathBuf,
    pub backend: Arc<dyn ExecutorBackend>,
    pub inputs: Arc<JobInputs>,
    pub options: WorkerOptions,
    /// Thread of the worker this one replaces. It must have exited, and
    /// dropped its session, before the copy is opened again.
    pub predecessor: Option<JoinHandle<()>>,
}

pub(crate) fn spawn_worker(
    spawn: WorkerSpawn,
    events: Sender<WorkerEvent>,
) -> std::io::Result<WorkerHandle> {
    let (tx, rx) = mpsc::channel();
    let name = format!("worker-{}", spawn.worker_id);
    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(spawn, rx, events))?;
    Ok(WorkerHandle {
        assignments: tx,
        thread,
    })
}

/// Waits up to `timeout` for `thread` to finish. Returns false if it is
/// still running.
fn wait_for_release(thread: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !thread.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(RELEASE_POLL);
    }
    let _ = thread.join();
    true
}

fn open_session(spawn: &WorkerSpawn) -> Result<Box<dyn ExecutorSession>, ExecutorError> {
    let attempts = spawn.options.open_attempts.max(1);
    let mut attempt = 1;
    loop {
        match spawn.backend.open(&spawn.resource) {
            Ok(session) => return Ok(session),
            Err(e) if e.is_fatal() || attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::warn!(
                    worker = spawn.worker_id,
                    attempt,
                    error = %e,
                    "failed to open {}",
                    spawn.resource.display()
                );
                thread::sleep(spawn.options.open_retry_delay * attempt);
                attempt += 1;
            }
        }
    }
}

fn worker_loop(
    mut spawn: WorkerSpawn,
    assignments: Receiver<Assignment>,
    events: Sender<WorkerEvent>,
) {
    let worker_id = spawn.worker_id;
    let generation = spawn.generation;
    tracing::info!(worker = worker_id, generation, "worker initializing");
    let started = Instant::now();

    if let Some(previous) = spawn.predecessor.take() {
        if !wait_for_release(previous, spawn.options.release_timeout) {
            let error = ExecutorError::fatal(format!(
                "previous session still holds {} after {:.1}s",
                spawn.resource.display(),
                spawn.options.release_timeout.as_secs_f64()
            ));
            tracing::error!(worker = worker_id, error = %error, "cannot reopen model");
            let _ = events.send(WorkerEvent::OpenFailed {
                worker_id,
                generation,
                error,
            });
            return;
        }
    }

    let session = match open_session(&spawn) {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(worker = worker_id, error = %error, "worker could not open its model");
            let _ = events.send(WorkerEvent::OpenFailed {
                worker_id,
                generation,
                error,
            });
            return;
        }
    };
    let kill = session.kill_switch();
    let mut worker = Worker::new(worker_id, session, spawn.inputs);
    tracing::info!(
        worker = worker_id,
        init_secs = started.elapsed().as_secs_f64(),
        "worker ready"
    );
    if events
        .send(WorkerEvent::Ready {
            worker_id,
            generation,
            kill,
        })
        .is_err()
    {
        return;
    }

    while let Ok(Assignment { ticket, job }) = assignments.recv() {
        let outcome = worker.execute(&job);
        let sent = events.send(WorkerEvent::Finished {
            worker_id,
            generation,
            ticket,
            outcome,
        });
        if sent.is_err() {
            break;
        }
    }
    tracing::debug!(worker = worker_id, generation, "worker shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimValues;
    use crate::tables::InputTable;

    struct Scripted {
        calls: u32,
        fail_at: Option<(u32, ExecutorError)>,
    }

    impl ExecutorSession for Scripted {
        fn run_one(&mut self, scenario: &[f64], policy: &[f64]) -> Result<SimValues, ExecutorError> {
            let call = self.calls;
            self.calls += 1;
            if let Some((k, err)) = &self.fail_at {
                if *k == call {
                    return Err(err.clone());
                }
            }
            Ok(SimValues {
                pvfp: scenario[0] + call as f64,
                pvfprem: policy[0],
            })
        }
    }

    fn inputs() -> Arc<JobInputs> {
        Arc::new(JobInputs {
            scenarios: InputTable::from_rows(vec![(1, vec![10.0])]),
            policies: InputTable::from_rows(vec![(101, vec![0.5])]),
        })
    }

    fn job(n_sims: u32) -> Job {
        Job {
            scenario_id: 1,
            policy_id: 101,
            n_sims,
        }
    }

    #[test]
    fn records_follow_sim_index_order() {
        let session = Box::new(Scripted {
            calls: 0,
            fail_at: None,
        });
        let mut worker = Worker::new(1, session, inputs());
        match worker.execute(&job(3)) {
            JobOutcome::Success(batch) => {
                let idx: Vec<u32> = batch.records.iter().map(|r| r.sim_index).collect();
                assert_eq!(idx, vec![0, 1, 2]);
                assert_eq!(batch.records[2].pvfp, 12.0);
                assert_eq!(batch.records[2].pvfprem, 0.5);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn failure_mid_job_drops_partial_batch() {
        let session = Box::new(Scripted {
            calls: 0,
            fail_at: Some((2, ExecutorError::retryable("calc error"))),
        });
        let mut worker = Worker::new(1, session, inputs());
        match worker.execute(&job(5)) {
            JobOutcome::Retryable(JobError::Executor { sim_index, .. }) => assert_eq!(sim_index, 2),
            other => panic!("expected retryable, got {:?}", other),
        }
    }

    #[test]
    fn executor_fatal_classification_is_kept() {
        let session = Box::new(Scripted {
            calls: 0,
            fail_at: Some((0, ExecutorError::fatal("malformed input"))),
        });
        let mut worker = Worker::new(1, session, inputs());
        assert!(matches!(
            worker.execute(&job(2)),
            JobOutcome::Fatal(JobError::Executor { .. })
        ));
    }

    #[test]
    fn release_wait_is_bounded() {
        let quick = thread::spawn(|| thread::sleep(Duration::from_millis(20)));
        assert!(wait_for_release(quick, Duration::from_secs(2)));

        let stuck = thread::spawn(|| thread::sleep(Duration::from_millis(500)));
        let started = Instant::now();
        assert!(!wait_for_release(stuck, Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn unknown_policy_is_fatal() {
        let session = Box::new(Scripted {
            calls: 0,
            fail_at: None,
        });
        let mut worker = Worker::new(1, session, inputs());
        let bad = Job {
            scenario_id: 1,
            policy_id: 999,
            n_sims: 1,
        };
        match worker.execute(&bad) {
            JobOutcome::Fatal(JobError::MissingInput { what, id }) => {
                assert_eq!(what, "policy");
                assert_eq!(id, 999);
            }
            other => panic!("expected fatal, got {:?}", other),
        }
    }
}

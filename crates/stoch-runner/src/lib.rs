pub mod aggregate;
pub mod config;
pub mod error;
pub mod executor;
pub mod provision;
pub mod queue;
pub mod scheduler;
pub mod selection;
pub mod sink;
pub mod tables;
pub mod worker;

pub use config::RunConfig;
pub use error::{EngineError, EngineResult, ErrorClass, ExecutorError, JobError};
pub use executor::{CommandBackend, ExecutorBackend, ExecutorSession, KillSwitch, SimValues};
pub use queue::{build_jobs, Job};
pub use scheduler::{JobRecord, JobState, RunSummary, Scheduler, SchedulerConfig, ShutdownFlag};
pub use selection::{expand, Selection, Universe};
pub use sink::{CsvResultSink, ResultSink};
pub use tables::{InputTable, JobInputs};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Expanded selections and the job list derived from them.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub scenarios: Vec<u64>,
    pub policies: Vec<u64>,
    pub jobs: Vec<Job>,
}

#[derive(Debug)]
pub struct RunResult {
    pub summary: RunSummary,
    pub summary_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Loads both input tables and expands the selections against the ids they
/// contain.
pub fn plan_run(cfg: &RunConfig) -> Result<(RunPlan, JobInputs)> {
    let scenario_table = InputTable::load(&cfg.assumptions_csv)?;
    let policy_table = InputTable::load(&cfg.policies_csv)?;

    let scenarios = expand(
        &cfg.scenario_selection()?,
        &Universe::Ids(scenario_table.ids().to_vec()),
        "scenario",
    )?;
    let policies = expand(
        &cfg.policy_selection()?,
        &Universe::Ids(policy_table.ids().to_vec()),
        "policy",
    )?;
    let jobs = build_jobs(&scenarios, &policies, cfg.n_sims)?;
    let inputs = JobInputs {
        scenarios: scenario_table,
        policies: policy_table,
    };
    Ok((
        RunPlan {
            scenarios,
            policies,
            jobs,
        },
        inputs,
    ))
}

pub fn run_engine(cfg: &RunConfig, backend: Arc<dyn ExecutorBackend>) -> Result<RunResult> {
    run_engine_with_shutdown(cfg, backend, ShutdownFlag::default())
}

/// Like [`run_engine`], stopping early once `shutdown` is requested. The
/// summary is still written, with unfinished jobs marked cancelled.
pub fn run_engine_with_shutdown(
    cfg: &RunConfig,
    backend: Arc<dyn ExecutorBackend>,
    shutdown: ShutdownFlag,
) -> Result<RunResult> {
    let started_at = Utc::now();
    if !cfg.model_path.is_file() {
        return Err(anyhow!("model file not found: {}", cfg.model_path.display()));
    }
    if cfg.provision.enabled {
        let copies = provision::provision_worker_models(&cfg.provision_request())?;
        tracing::info!("provisioned {} worker model copies", copies.len());
    }

    let (plan, inputs) = plan_run(cfg)?;
    tracing::info!(
        "Scenarios: {} | Policies: {} | Jobs: {} | Workers: {}",
        plan.scenarios.len(),
        plan.policies.len(),
        plan.jobs.len(),
        cfg.n_workers
    );
    let resources = provision::resolve_worker_resources(
        &cfg.model_path,
        &cfg.worker_models_dir,
        cfg.n_workers,
    )?;

    let scheduler = Scheduler::new(
        cfg.scheduler_config(),
        backend,
        Arc::new(inputs),
        Arc::new(CsvResultSink::new(&cfg.output_dir)),
        resources,
    )
    .with_shutdown(shutdown);
    let summary = scheduler.run(plan.jobs)?;
    let finished_at = Utc::now();

    let summary_path = cfg.output_dir.join(RUN_SUMMARY_FILE);
    write_run_summary(&summary_path, cfg, &summary, started_at, finished_at)?;
    if summary.interrupted {
        tracing::warn!(
            "run interrupted: {} succeeded, {} cancelled or failed",
            summary.succeeded,
            summary.failed
        );
    } else if summary.is_success() {
        tracing::info!(
            "all {} jobs succeeded in {:.2}s",
            summary.total,
            summary.elapsed_secs
        );
    } else {
        tracing::warn!(
            "{} of {} jobs failed; see {}",
            summary.failed,
            summary.total,
            summary_path.display()
        );
    }
    Ok(RunResult {
        summary,
        summary_path,
        started_at,
        finished_at,
    })
}

fn write_run_summary(
    path: &Path,
    cfg: &RunConfig,
    summary: &RunSummary,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Result<()> {
    let report = json!({
        "schema_version": "run_summary_v1",
        "started_at": started_at.to_rfc3339(),
        "finished_at": finished_at.to_rfc3339(),
        "model_path": cfg.model_path,
        "output_dir": cfg.output_dir,
        "n_workers": cfg.n_workers,
        "n_sims": cfg.n_sims,
        "summary": summary,
    });
    let bytes = serde_json::to_vec_pretty(&report)?;
    sink::atomic_write_bytes(path, &bytes)?;
    Ok(())
}

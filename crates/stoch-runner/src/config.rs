use crate::error::{EngineError, EngineResult};
use crate::provision::ProvisionRequest;
use crate::scheduler::{RetryPolicy, SchedulerConfig};
use crate::selection::{Selection, SelectionSpec};
use crate::worker::WorkerOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model_path: PathBuf,
    pub assumptions_csv: PathBuf,
    pub policies_csv: PathBuf,
    pub scenarios: SelectionSpec,
    pub policies: SelectionSpec,
    pub n_workers: usize,
    pub n_sims: u32,
    pub output_dir: PathBuf,
    #[serde(default = "default_worker_models_dir")]
    pub worker_models_dir: PathBuf,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout: f64,
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    #[serde(default)]
    pub provision: ProvisionConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub clean: bool,
    /// Defaults to the run's `n_workers`.
    #[serde(default)]
    pub n_workers: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Program and arguments; the worker's model path is appended.
    #[serde(default)]
    pub command: Vec<String>,
}

fn default_worker_models_dir() -> PathBuf {
    PathBuf::from("worker_models")
}

fn default_queue_timeout() -> f64 {
    10.0
}

fn default_worker_timeout() -> f64 {
    300.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_retry_backoff() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("engine.log"))
}

impl RunConfig {
    /// Loads a YAML config. Relative paths are taken from the config's directory.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut cfg = Self::from_yaml(&raw)?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
        cfg.resolve_paths(&base);
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> EngineResult<Self> {
        let cfg: RunConfig =
            serde_yaml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.model_path);
        join(&mut self.assumptions_csv);
        join(&mut self.policies_csv);
        join(&mut self.output_dir);
        join(&mut self.worker_models_dir);
        if let Some(log_file) = self.log_file.as_mut() {
            join(log_file);
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let mut problems = Vec::new();
        if self.n_workers == 0 {
            problems.push("n_workers must be > 0".to_string());
        }
        if self.n_sims == 0 {
            problems.push("n_sims must be > 0".to_string());
        }
        if self.max_retries == 0 {
            problems.push("max_retries must be >= 1".to_string());
        }
        for (name, value) in [
            ("queue_timeout", self.queue_timeout),
            ("worker_timeout", self.worker_timeout),
        ] {
            if !(value.is_finite() && value > 0.0) {
                problems.push(format!("{} must be a positive number of seconds", name));
            }
        }
        if !(self.retry_delay.is_finite() && self.retry_delay >= 0.0) {
            problems.push("retry_delay must be >= 0".to_string());
        }
        if !(self.retry_backoff.is_finite() && self.retry_backoff >= 1.0) {
            problems.push("retry_backoff must be >= 1".to_string());
        }
        if self.provision.n_workers == Some(0) {
            problems.push("provision.n_workers must be > 0".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(problems.join("; ")))
        }
    }

    pub fn scenario_selection(&self) -> EngineResult<Selection> {
        Selection::parse(&self.scenarios)
    }

    pub fn policy_selection(&self) -> EngineResult<Selection> {
        Selection::parse(&self.policies)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_timeout: Duration::from_secs_f64(self.worker_timeout),
            queue_timeout: Duration::from_secs_f64(self.queue_timeout),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                retry_delay: Duration::from_secs_f64(self.retry_delay),
                retry_backoff: self.retry_backoff,
            },
            worker: WorkerOptions::default(),
        }
    }

    pub fn provision_request(&self) -> ProvisionRequest {
        ProvisionRequest {
            model_path: self.model_path.clone(),
            out_dir: self.worker_models_dir.clone(),
            n_workers: self.provision.n_workers.unwrap_or(self.n_workers),
            force: self.provision.force,
            clean: self.provision.clean,
        }
    }
}

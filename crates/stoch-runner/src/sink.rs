use crate::error::JobError;
use crate::queue::Job;
use crate::worker::ResultBatch;
use chrono::Utc;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persists completed batches. Called exactly once per succeeded job.
pub trait ResultSink: Send + Sync {
    fn persist(&self, batch: &ResultBatch) -> Result<PathBuf, JobError>;

    /// Removes whatever an earlier run left for `job`, so a job that fails
    /// this run has no output.
    fn discard(&self, _job: &Job) -> Result<(), JobError> {
        Ok(())
    }
}

pub const OUTPUT_HEADER: &str = "sim,PVFP,PVFPrem";

/// Writes `{output_dir}/scenario_{s}/policy_{p}.csv`.
#[derive(Debug, Clone)]
pub struct CsvResultSink {
    output_dir: PathBuf,
}

impl CsvResultSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn path_for(&self, scenario_id: u64, policy_id: u64) -> PathBuf {
        self.output_dir
            .join(format!("scenario_{}", scenario_id))
            .join(format!("policy_{}.csv", policy_id))
    }
}

pub fn render_batch(batch: &ResultBatch) -> String {
    let mut out = String::with_capacity(32 * (batch.records.len() + 1));
    out.push_str(OUTPUT_HEADER);
    out.push('\n');
    for r in &batch.records {
        // {:?} keeps a decimal point on whole numbers
        let _ = writeln!(out, "{},{:?},{:?}", r.sim_index, r.pvfp, r.pvfprem);
    }
    out
}

impl ResultSink for CsvResultSink {
    fn persist(&self, batch: &ResultBatch) -> Result<PathBuf, JobError> {
        let path = self.path_for(batch.scenario_id, batch.policy_id);
        atomic_write_bytes(&path, render_batch(batch).as_bytes()).map_err(|e| JobError::Sink {
            message: format!("{}: {}", path.display(), e),
        })?;
        Ok(path)
    }

    fn discard(&self, job: &Job) -> Result<(), JobError> {
        let path = self.path_for(job.scenario_id, job.policy_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::warn!("removed stale output {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::Sink {
                message: format!("{}: {}", path.display(), e),
            }),
        }
    }
}

/// Writes through a temp file and rename so readers see the whole file or nothing.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

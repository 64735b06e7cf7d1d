use crate::error::{EngineError, EngineResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub model_path: PathBuf,
    pub out_dir: PathBuf,
    pub n_workers: usize,
    /// Recreate copies that already exist.
    pub force: bool,
    /// Remove `out_dir` entirely before copying.
    pub clean: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedCopy {
    pub worker_id: usize,
    pub path: PathBuf,
    pub created: bool,
    pub sha256: String,
}

/// Path of the isolated copy owned by `worker_id` (1-based).
pub fn worker_model_path(model_path: &Path, dir: &Path, worker_id: usize) -> PathBuf {
    let ext = model_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    dir.join(format!("model_worker_{}{}", worker_id, ext))
}

/// Ensures `n_workers` copies of the master model exist. Idempotent unless
/// `force` or `clean` is set. The master model is only ever read.
pub fn provision_worker_models(req: &ProvisionRequest) -> EngineResult<Vec<ProvisionedCopy>> {
    if req.n_workers == 0 {
        return Err(EngineError::Config("n_workers must be > 0".to_string()));
    }
    if !req.model_path.is_file() {
        return Err(EngineError::Config(format!(
            "model file not found: {}",
            req.model_path.display()
        )));
    }
    if req.clean && req.out_dir.exists() {
        tracing::info!("removing {}", req.out_dir.display());
        fs::remove_dir_all(&req.out_dir)?;
    }
    fs::create_dir_all(&req.out_dir)?;

    let mut copies = Vec::with_capacity(req.n_workers);
    for worker_id in 1..=req.n_workers {
        let dest = worker_model_path(&req.model_path, &req.out_dir, worker_id);
        let created = if dest.exists() && !req.force {
            false
        } else {
            fs::copy(&req.model_path, &dest)?;
            true
        };
        let sha256 = sha256_file(&dest)?;
        tracing::info!(
            "Worker {}: {} ({}) sha256={}",
            worker_id,
            dest.display(),
            if created { "created" } else { "exists" },
            sha256
        );
        copies.push(ProvisionedCopy {
            worker_id,
            path: dest,
            created,
            sha256,
        });
    }
    Ok(copies)
}

/// Resolves the isolated copy for every worker, failing fast if one is absent.
pub fn resolve_worker_resources(
    model_path: &Path,
    dir: &Path,
    n_workers: usize,
) -> EngineResult<Vec<PathBuf>> {
    (1..=n_workers)
        .map(|worker_id| {
            let path = worker_model_path(model_path, dir, worker_id);
            if path.is_file() {
                Ok(path)
            } else {
                Err(EngineError::MissingResource { worker_id, path })
            }
        })
        .collect()
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

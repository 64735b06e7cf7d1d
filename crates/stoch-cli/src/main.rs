mod logging;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use stoch_runner::{CommandBackend, EngineError, RunConfig, ShutdownFlag};

#[derive(Parser)]
#[command(name = "stoch", version = "0.3.0", about = "Stochastic simulation job runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every scenario x policy job in a config.
    Run {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Expand selections and print the job plan without running it.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Create one isolated model copy per worker.
    Provision {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        n_workers: usize,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        json: bool,
    },
    /// Summarize per-job outputs into one CSV.
    Aggregate {
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long)]
        out_file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { config, json } => {
            let cfg = RunConfig::load(&config)?;
            logging::init_logging(&cfg.log_level, cfg.log_file.as_deref())?;
            if cfg.executor.command.is_empty() {
                return Err(anyhow!(
                    "executor.command is not set in {}",
                    config.display()
                ));
            }
            let backend = Arc::new(CommandBackend::new(cfg.executor.command.clone()));
            let shutdown = ShutdownFlag::default();
            let on_signal = shutdown.clone();
            ctrlc::set_handler(move || {
                tracing::warn!("Received shutdown signal, stopping after in-flight work is cancelled");
                on_signal.request();
            })?;
            let result = stoch_runner::run_engine_with_shutdown(&cfg, backend, shutdown)?;
            let summary = &result.summary;
            let payload = json!({
                "ok": summary.is_success(),
                "command": "run",
                "started_at": result.started_at.to_rfc3339(),
                "finished_at": result.finished_at.to_rfc3339(),
                "summary_path": result.summary_path.display().to_string(),
                "summary": serde_json::to_value(summary)?,
            });
            if json {
                if !summary.is_success() {
                    emit_json(&payload);
                    std::process::exit(1);
                }
                return Ok(Some(payload));
            }
            println!("jobs: {}", summary.total);
            println!("succeeded: {}", summary.succeeded);
            println!("failed: {}", summary.failed);
            println!("worker_restarts: {}", summary.worker_restarts);
            if summary.interrupted {
                println!("interrupted: true");
            }
            println!("elapsed_secs: {:.2}", summary.elapsed_secs);
            println!("summary: {}", result.summary_path.display());
            if !summary.is_success() {
                for record in summary.failures() {
                    let reason = record
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                    eprintln!("failed: {} ({})", record.job, reason);
                }
                std::process::exit(1);
            }
        }
        Commands::Describe { config, json } => {
            let cfg = RunConfig::load(&config)?;
            let (plan, _) = stoch_runner::plan_run(&cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "config": serde_json::to_value(&cfg)?,
                    "scenarios": plan.scenarios,
                    "policies": plan.policies,
                    "jobs": plan.jobs.len(),
                })));
            }
            println!("model: {}", cfg.model_path.display());
            println!("worker_models_dir: {}", cfg.worker_models_dir.display());
            println!("output_dir: {}", cfg.output_dir.display());
            println!("scenarios: {} {:?}", plan.scenarios.len(), plan.scenarios);
            println!("policies: {} {:?}", plan.policies.len(), plan.policies);
            println!("jobs: {}", plan.jobs.len());
            println!("n_sims: {}", cfg.n_sims);
            println!("n_workers: {}", cfg.n_workers);
            println!("worker_timeout: {}s", cfg.worker_timeout);
            println!(
                "retries: max={} delay={}s backoff={}",
                cfg.max_retries, cfg.retry_delay, cfg.retry_backoff
            );
        }
        Commands::Provision {
            model,
            out,
            n_workers,
            force,
            clean,
            json,
        } => {
            logging::init_logging("INFO", None)?;
            let request = stoch_runner::provision::ProvisionRequest {
                model_path: model,
                out_dir: out,
                n_workers,
                force,
                clean,
            };
            let copies = stoch_runner::provision::provision_worker_models(&request)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "provision",
                    "out_dir": request.out_dir.display().to_string(),
                    "copies": serde_json::to_value(&copies)?,
                })));
            }
            for copy in &copies {
                println!(
                    "worker {}: {} {} sha256={}",
                    copy.worker_id,
                    copy.path.display(),
                    if copy.created { "created" } else { "exists" },
                    copy.sha256
                );
            }
        }
        Commands::Aggregate {
            output_dir,
            out_file,
            json,
        } => {
            let written = stoch_runner::aggregate::write_summary(&output_dir, out_file.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "summary_path": written.as_ref().map(|(p, _)| p.display().to_string()),
                    "rows": written.as_ref().map(|(_, n)| *n).unwrap_or(0),
                })));
            }
            match written {
                Some((path, rows)) => {
                    println!("rows: {}", rows);
                    println!("summary: {}", path.display());
                }
                None => println!("no results found under {}", output_dir.display()),
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<EngineError>()
        .map(EngineError::code)
        .unwrap_or("command_failed")
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Provision { json, .. }
        | Commands::Aggregate { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_keep_their_code() {
        let err = anyhow::Error::from(EngineError::UnknownId {
            what: "policy".to_string(),
            id: 9,
        });
        assert_eq!(error_code(&err), "unknown_id");
        assert_eq!(error_code(&anyhow!("other")), "command_failed");
    }

    #[test]
    fn json_flag_is_detected_per_command() {
        let cli = Cli::parse_from(["stoch", "aggregate", "--output-dir", "out", "--json"]);
        assert!(command_json_mode(&cli.command));
        let cli = Cli::parse_from(["stoch", "describe", "cfg.yaml"]);
        assert!(!command_json_mode(&cli.command));
    }

    #[test]
    fn json_error_shape() {
        let v = json_error("invalid_config", "bad".to_string(), json!({}));
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "invalid_config");
        assert_eq!(v["error"]["message"], "bad");
    }
}

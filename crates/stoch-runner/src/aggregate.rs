use crate::sink::atomic_write_bytes;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SUMMARY_HEADER: &str =
    "Scenario,Policy,N,ProbRuin,AvgPVFP,AvgPVFPrem,PM_Avg,MedianPVFP,MedianPVFPrem,PM_Median";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySummary {
    pub scenario: String,
    pub policy: String,
    pub n: usize,
    pub prob_ruin: f64,
    pub avg_pvfp: f64,
    pub avg_pvfprem: f64,
    pub pm_avg: Option<f64>,
    pub median_pvfp: f64,
    pub median_pvfprem: f64,
    pub pm_median: Option<f64>,
}

/// Statistics of a single `policy_*.csv` file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyStats {
    pub n: usize,
    pub prob_ruin: f64,
    pub avg_pvfp: f64,
    pub avg_pvfprem: f64,
    pub median_pvfp: f64,
    pub median_pvfprem: f64,
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    (den != 0.0).then(|| num / den)
}

/// Summarizes one per-job output file. Returns `None` for a file without rows.
pub fn summarize_policy_file(path: &Path) -> Result<Option<PolicyStats>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut lines = raw.lines();
    let header: Vec<&str> = lines
        .next()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .collect();
    let col = |names: &[&str]| header.iter().position(|h| names.contains(h));
    let pvfp_col = col(&["PVFP", "out1"]).unwrap_or(1);
    let pvfprem_col = col(&["PVFPrem", "out2"]).unwrap_or(2);

    let mut pvfps = Vec::new();
    let mut prems = Vec::new();
    for (idx, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        let cell = |i: usize| -> Result<f64> {
            match cells.get(i).copied() {
                None | Some("") => Ok(0.0),
                Some(v) => v
                    .parse::<f64>()
                    .map_err(|_| anyhow!("{}:{}: invalid number '{}'", path.display(), idx + 2, v)),
            }
        };
        pvfps.push(cell(pvfp_col)?);
        prems.push(cell(pvfprem_col)?);
    }
    if pvfps.is_empty() {
        return Ok(None);
    }
    let n = pvfps.len();
    let ruined = pvfps.iter().filter(|v| **v < 0.0).count();
    Ok(Some(PolicyStats {
        n,
        prob_ruin: ruined as f64 / n as f64,
        avg_pvfp: mean(&pvfps),
        avg_pvfprem: mean(&prems),
        median_pvfp: median(&pvfps),
        median_pvfprem: median(&prems),
    }))
}

/// Walks `output_dir/scenario_*/policy_*.csv` in name order.
pub fn summarize_outputs(output_dir: &Path) -> Result<Vec<PolicySummary>> {
    let mut rows = Vec::new();
    let walker = WalkDir::new(output_dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(scenario) = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("scenario_"))
        else {
            continue;
        };
        let Some(policy) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.strip_prefix("policy_"))
            .and_then(|n| n.strip_suffix(".csv"))
        else {
            continue;
        };
        let Some(stats) = summarize_policy_file(entry.path())? else {
            continue;
        };
        rows.push(PolicySummary {
            scenario: scenario.to_string(),
            policy: policy.to_string(),
            n: stats.n,
            prob_ruin: stats.prob_ruin,
            avg_pvfp: stats.avg_pvfp,
            avg_pvfprem: stats.avg_pvfprem,
            pm_avg: ratio(stats.avg_pvfp, stats.avg_pvfprem),
            median_pvfp: stats.median_pvfp,
            median_pvfprem: stats.median_pvfprem,
            pm_median: ratio(stats.median_pvfp, stats.median_pvfprem),
        });
    }
    Ok(rows)
}

pub fn render_summary(rows: &[PolicySummary]) -> String {
    let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
    let mut out = String::from(SUMMARY_HEADER);
    out.push('\n');
    for r in rows {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{}",
            r.scenario,
            r.policy,
            r.n,
            r.prob_ruin,
            r.avg_pvfp,
            r.avg_pvfprem,
            opt(r.pm_avg),
            r.median_pvfp,
            r.median_pvfprem,
            opt(r.pm_median)
        );
    }
    out
}

/// Default summary location: `<output_dir>/<output_dir name>_summary.csv`.
pub fn default_summary_path(output_dir: &Path) -> PathBuf {
    let base = output_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("results");
    output_dir.join(format!("{}_summary.csv", base))
}

/// Aggregates all outputs and writes the summary CSV. Returns `None` when
/// there was nothing to summarize.
pub fn write_summary(output_dir: &Path, out_file: Option<&Path>) -> Result<Option<(PathBuf, usize)>> {
    let rows = summarize_outputs(output_dir)?;
    if rows.is_empty() {
        return Ok(None);
    }
    let path = match out_file {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => output_dir.join(p),
        None => default_summary_path(output_dir),
    };
    atomic_write_bytes(&path, render_summary(&rows).as_bytes())?;
    Ok(Some((path, rows.len())))
}

use crate::error::{EngineError, EngineResult};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// One (scenario, policy) unit of work comprising `n_sims` trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Job {
    pub scenario_id: u64,
    pub policy_id: u64,
    pub n_sims: u32,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scenario {} / policy {}", self.scenario_id, self.policy_id)
    }
}

/// Builds the full scenario x policy cross product.
///
/// Order is scenario-major: all policies of the first scenario, then all
/// policies of the second, and so on. Identical inputs always produce the
/// identical job order.
pub fn build_jobs(scenarios: &[u64], policies: &[u64], n_sims: u32) -> EngineResult<Vec<Job>> {
    if scenarios.is_empty() {
        return Err(EngineError::EmptySelection {
            what: "no scenarios to run".to_string(),
        });
    }
    if policies.is_empty() {
        return Err(EngineError::EmptySelection {
            what: "no policies to run".to_string(),
        });
    }
    if n_sims == 0 {
        return Err(EngineError::Config("n_sims must be > 0".to_string()));
    }

    let scenarios = dedup(scenarios);
    let policies = dedup(policies);
    let mut jobs = Vec::with_capacity(scenarios.len() * policies.len());
    for &scenario_id in &scenarios {
        for &policy_id in &policies {
            jobs.push(Job {
                scenario_id,
                policy_id,
                n_sims,
            });
        }
    }
    Ok(jobs)
}

fn dedup(ids: &[u64]) -> Vec<u64> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

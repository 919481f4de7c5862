//! Delta-debug minimization: shrink a change set to the smallest subset for
//! which a caller-supplied predicate still holds.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of one minimization run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaMinResult {
    /// Human-readable listing of the remaining paths.
    pub minimal_patch: String,
    /// Whether the predicate still held on the final set.
    pub replay_ok: bool,
    pub root_hash: String,
    pub iterations: u64,
    /// The surviving change set itself.
    pub minimal_changes: Vec<String>,
}

/// Repeatedly drop single elements while the predicate keeps holding.
///
/// Each sweep tries the current set without one element; an accepted
/// reduction restarts the sweep. The run stops when a full sweep accepts
/// nothing or the wall-clock budget is exhausted. The predicate must return
/// `true` when the candidate subset still reproduces the condition under
/// investigation.
pub fn minimize<F>(changes: &[String], mut test_fn: F, budget_ms: u64) -> DeltaMinResult
where
    F: FnMut(&[String]) -> bool,
{
    let budget = Duration::from_millis(budget_ms);
    let started = Instant::now();

    let mut minimal: Vec<String> = changes.to_vec();
    let mut iterations = 0u64;

    loop {
        iterations += 1;
        if started.elapsed() > budget {
            debug!(iterations, "minimization budget exhausted");
            break;
        }

        let mut reduced = false;
        for i in 0..minimal.len() {
            let mut candidate = minimal.clone();
            candidate.remove(i);
            if candidate.is_empty() {
                continue;
            }
            if test_fn(&candidate) {
                minimal = candidate;
                reduced = true;
                break;
            }
        }

        if !reduced {
            break;
        }
    }

    let minimal_patch = minimal
        .iter()
        .map(|p| format!("--- {p}"))
        .collect::<Vec<_>>()
        .join("\n");
    let replay_ok = test_fn(&minimal);

    DeltaMinResult {
        minimal_patch,
        replay_ok,
        root_hash: String::new(),
        iterations,
        minimal_changes: minimal,
    }
}

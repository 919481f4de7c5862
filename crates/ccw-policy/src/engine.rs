//! Policy rules, most-restrictive merging, and validation reports.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

use ccw_common::ResourceUsage;

/// Hard cap on each required-test command.
const TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// One named policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rss_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_ms: Option<u64>,
    #[serde(default)]
    pub deny_paths: Vec<String>,
    #[serde(default)]
    pub require_tests: Vec<String>,
    #[serde(default = "default_require_replay")]
    pub require_replay_ok: bool,
}

fn default_require_replay() -> bool {
    true
}

/// Validation report for one policy evaluation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyReport {
    pub passed: bool,
    pub tests_ok: bool,
    pub replay_ok: bool,
    pub resource_ok: bool,
    pub paths_ok: bool,
    pub deny_paths: Vec<String>,
    pub resource_violations: Vec<String>,
    pub test_failures: Vec<String>,
    pub details: String,
}

/// Inputs to one validation pass.
pub struct ValidationInput<'a> {
    pub policy_names: &'a [String],
    pub changed_paths: &'a [String],
    pub usage: ResourceUsage,
    pub replay_hash: Option<&'a str>,
    pub expected_hash: Option<&'a str>,
    /// Directory in which required tests run; tests are skipped when absent.
    pub workspace: Option<&'a Path>,
}

/// Named policy store with two well-known defaults.
pub struct PolicyEngine {
    policies: HashMap<String, PolicyRule>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            "baseline".to_string(),
            PolicyRule {
                name: "baseline".to_string(),
                max_rss_mb: Some(2048),
                max_cpu_ms: None,
                deny_paths: vec![
                    "~/.ssh/*".to_string(),
                    "~/.aws/*".to_string(),
                    "/etc/passwd".to_string(),
                ],
                require_tests: vec![],
                require_replay_ok: false,
            },
        );
        policies.insert(
            "strict".to_string(),
            PolicyRule {
                name: "strict".to_string(),
                max_rss_mb: Some(1024),
                max_cpu_ms: Some(60_000),
                deny_paths: vec![
                    "~/.ssh/*".to_string(),
                    "~/.aws/*".to_string(),
                    "/etc/*".to_string(),
                    "~/.config/*".to_string(),
                ],
                require_tests: vec!["cargo test -q".to_string()],
                require_replay_ok: true,
            },
        );
        Self { policies }
    }

    /// Add or replace a named policy.
    pub fn set_policy(&mut self, policy: PolicyRule) {
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn get_policy(&self, name: &str) -> Option<&PolicyRule> {
        self.policies.get(name)
    }

    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate a change set against the merged policies. Pure given the
    /// same inputs, except for the required-test commands it runs.
    pub fn validate(&self, input: &ValidationInput) -> PolicyReport {
        let mut report = PolicyReport::default();

        let Some(merged) = self.merge(input.policy_names) else {
            report.details = format!("No valid policies found in {:?}", input.policy_names);
            return report;
        };

        // Paths: any deny-pattern match fails the change set.
        let mut deny_hits = Vec::new();
        for path in input.changed_paths {
            for pattern in &merged.deny_paths {
                if match_path(path, pattern) {
                    deny_hits.push(path.clone());
                    break;
                }
            }
        }
        report.paths_ok = deny_hits.is_empty();
        report.deny_paths = deny_hits;

        // Resources: truncating MiB conversion for RSS, direct compare for CPU.
        let mut violations = Vec::new();
        if let Some(limit_mb) = merged.max_rss_mb {
            let rss_mb = input.usage.rss_max_kb as f64 / 1024.0;
            if rss_mb > limit_mb as f64 {
                violations.push(format!("RSS {rss_mb:.1}MB exceeds limit {limit_mb}MB"));
            }
        }
        if let Some(limit_ms) = merged.max_cpu_ms {
            if input.usage.cpu_ms > limit_ms {
                violations.push(format!(
                    "CPU {}ms exceeds limit {limit_ms}ms",
                    input.usage.cpu_ms
                ));
            }
        }
        report.resource_ok = violations.is_empty();
        report.resource_violations = violations;

        // Replay: both hashes must be present and equal when required.
        report.replay_ok = if merged.require_replay_ok {
            match (input.replay_hash, input.expected_hash) {
                (Some(replay), Some(expected)) => replay == expected,
                _ => false,
            }
        } else {
            true
        };

        // Tests: every required command must exit zero within the cap.
        let mut test_failures = Vec::new();
        if let Some(workspace) = input.workspace {
            for cmd in &merged.require_tests {
                if !run_test(cmd, workspace) {
                    test_failures.push(cmd.clone());
                }
            }
        }
        report.tests_ok = test_failures.is_empty();
        report.test_failures = test_failures;

        report.passed =
            report.paths_ok && report.resource_ok && report.replay_ok && report.tests_ok;

        let mut details = Vec::new();
        if !report.paths_ok {
            details.push(format!("Denied paths: {}", report.deny_paths.join(", ")));
        }
        if !report.resource_ok {
            details.push(format!(
                "Resource violations: {}",
                report.resource_violations.join("; ")
            ));
        }
        if !report.replay_ok {
            details.push("Replay hash mismatch".to_string());
        }
        if !report.tests_ok {
            details.push(format!("Test failures: {}", report.test_failures.join(", ")));
        }
        report.details = if details.is_empty() {
            "All checks passed".to_string()
        } else {
            details.join("; ")
        };

        report
    }

    /// Merge named policies, most restrictive wins: minimum over defined
    /// numeric limits, union of set fields, OR of the replay requirement.
    /// Unknown names are dropped; an empty resolved set yields `None`.
    pub fn merge(&self, names: &[String]) -> Option<PolicyRule> {
        let resolved: Vec<&PolicyRule> =
            names.iter().filter_map(|n| self.policies.get(n)).collect();
        if resolved.is_empty() {
            return None;
        }

        let min_defined = |values: Vec<Option<u64>>| -> Option<u64> {
            values.into_iter().flatten().min()
        };

        let deny_paths: BTreeSet<String> = resolved
            .iter()
            .flat_map(|p| p.deny_paths.iter().cloned())
            .collect();
        let require_tests: BTreeSet<String> = resolved
            .iter()
            .flat_map(|p| p.require_tests.iter().cloned())
            .collect();

        Some(PolicyRule {
            name: names.join("+"),
            max_rss_mb: min_defined(resolved.iter().map(|p| p.max_rss_mb).collect()),
            max_cpu_ms: min_defined(resolved.iter().map(|p| p.max_cpu_ms).collect()),
            deny_paths: deny_paths.into_iter().collect(),
            require_tests: require_tests.into_iter().collect(),
            require_replay_ok: resolved.iter().any(|p| p.require_replay_ok),
        })
    }
}

/// Glob-match a changed path against a deny pattern, expanding a leading
/// `~/` to the invoking user's home first.
fn match_path(path: &str, pattern: &str) -> bool {
    let expanded;
    let pattern = if let Some(rest) = pattern.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => {
                expanded = home.join(rest).to_string_lossy().into_owned();
                expanded.as_str()
            }
            None => pattern,
        }
    } else {
        pattern
    };

    match Pattern::new(pattern) {
        Ok(glob) => glob.matches(path),
        Err(e) => {
            debug!(pattern, error = %e, "invalid deny pattern");
            false
        }
    }
}

fn run_test(cmd: &str, workspace: &Path) -> bool {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(workspace)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(_) => return false,
    };

    let started = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) => {}
            Err(_) => return false,
        }
        if started.elapsed() >= TEST_TIMEOUT {
            let _ = child.kill();
            let _ = child.wait();
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn base_input<'a>(policy_names: &'a [String], changed: &'a [String]) -> ValidationInput<'a> {
        ValidationInput {
            policy_names,
            changed_paths: changed,
            usage: ResourceUsage::default(),
            replay_hash: None,
            expected_hash: None,
            workspace: None,
        }
    }

    #[test]
    fn defaults_exist() {
        let engine = PolicyEngine::new();
        assert!(engine.get_policy("baseline").is_some());
        assert!(engine.get_policy("strict").is_some());
    }

    #[test]
    fn merge_takes_minimum_and_union() {
        let mut engine = PolicyEngine::new();
        engine.set_policy(PolicyRule {
            name: "a".to_string(),
            max_rss_mb: Some(512),
            max_cpu_ms: None,
            deny_paths: vec!["secret/*".to_string()],
            require_tests: vec!["make check".to_string()],
            require_replay_ok: false,
        });
        engine.set_policy(PolicyRule {
            name: "b".to_string(),
            max_rss_mb: Some(256),
            max_cpu_ms: Some(1000),
            deny_paths: vec!["other/*".to_string()],
            require_tests: vec![],
            require_replay_ok: true,
        });

        let merged = engine.merge(&names(&["a", "b"])).unwrap();
        assert_eq!(merged.max_rss_mb, Some(256));
        assert_eq!(merged.max_cpu_ms, Some(1000));
        assert!(merged.deny_paths.contains(&"secret/*".to_string()));
        assert!(merged.deny_paths.contains(&"other/*".to_string()));
        assert_eq!(merged.require_tests, vec!["make check".to_string()]);
        assert!(merged.require_replay_ok);
    }

    #[test]
    fn unknown_names_are_dropped() {
        let engine = PolicyEngine::new();
        let merged = engine.merge(&names(&["baseline", "nope"])).unwrap();
        assert_eq!(merged.max_rss_mb, Some(2048));
        assert!(engine.merge(&names(&["nope"])).is_none());
    }

    #[test]
    fn empty_policy_set_fails_with_details() {
        let engine = PolicyEngine::new();
        let policy_names = names(&["missing"]);
        let changed: Vec<String> = vec![];
        let report = engine.validate(&base_input(&policy_names, &changed));
        assert!(!report.passed);
        assert!(report.details.contains("No valid policies"));
    }

    #[test]
    fn deny_path_fails_validation() {
        let mut engine = PolicyEngine::new();
        engine.set_policy(PolicyRule {
            name: "p".to_string(),
            max_rss_mb: None,
            max_cpu_ms: None,
            deny_paths: vec!["test.txt".to_string()],
            require_tests: vec![],
            require_replay_ok: false,
        });

        let policy_names = names(&["p"]);
        let changed = vec!["test.txt".to_string(), "ok.txt".to_string()];
        let report = engine.validate(&base_input(&policy_names, &changed));
        assert!(!report.passed);
        assert!(!report.paths_ok);
        assert_eq!(report.deny_paths, vec!["test.txt".to_string()]);
    }

    #[test]
    fn resource_limits_are_enforced() {
        let engine = PolicyEngine::new();
        let policy_names = names(&["strict"]);
        let changed: Vec<String> = vec![];
        let mut input = base_input(&policy_names, &changed);
        input.usage = ResourceUsage {
            cpu_ms: 120_000,
            rss_max_kb: 4 * 1024 * 1024,
            io_read_kb: 0,
            io_write_kb: 0,
        };
        input.replay_hash = Some("blake3:x");
        input.expected_hash = Some("blake3:x");

        let report = engine.validate(&input);
        assert!(!report.resource_ok);
        assert_eq!(report.resource_violations.len(), 2);
        assert!(report.replay_ok);
        assert!(!report.passed);
    }

    #[test]
    fn replay_required_but_missing_fails() {
        let engine = PolicyEngine::new();
        let policy_names = names(&["strict"]);
        let changed: Vec<String> = vec![];
        let report = engine.validate(&base_input(&policy_names, &changed));
        assert!(!report.replay_ok);
        assert!(report.details.contains("Replay hash mismatch"));
    }

    #[test]
    fn required_tests_run_in_workspace() {
        let mut engine = PolicyEngine::new();
        engine.set_policy(PolicyRule {
            name: "tested".to_string(),
            max_rss_mb: None,
            max_cpu_ms: None,
            deny_paths: vec![],
            require_tests: vec!["test -f present.txt".to_string()],
            require_replay_ok: false,
        });

        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("present.txt"), "x").unwrap();

        let policy_names = names(&["tested"]);
        let changed: Vec<String> = vec![];
        let mut input = base_input(&policy_names, &changed);
        input.workspace = Some(workspace.path());
        let report = engine.validate(&input);
        assert!(report.tests_ok);
        assert!(report.passed);

        std::fs::remove_file(workspace.path().join("present.txt")).unwrap();
        let report = engine.validate(&input);
        assert!(!report.tests_ok);
        assert_eq!(report.test_failures.len(), 1);
    }

    #[test]
    fn validation_is_pure_for_same_inputs() {
        let engine = PolicyEngine::new();
        let policy_names = names(&["baseline"]);
        let changed = vec!["src/lib.rs".to_string()];
        let a = engine.validate(&base_input(&policy_names, &changed));
        let b = engine.validate(&base_input(&policy_names, &changed));
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.details, b.details);
    }
}

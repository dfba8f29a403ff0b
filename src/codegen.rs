//! Codegen Verifier (§4.7): extracts a `solver` function from an LLM
//! response and runs it in the sandbox over training pairs, then the test
//! input.
//!
//! Grounded on `examples/original_source/src/solver/steps.py`-style
//! marker/fence extraction conventions and this crate's `sandbox.rs` for
//! execution.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::sandbox::{output_as_grid, run_untrusted_code, SandboxOutcome};
use crate::task::{Example, Grid};

const FINAL_SOLUTION_MARKER: &str = "### FINAL SOLUTION ###";

static FENCED_PYTHON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:python)?\s*\n(.*?)```").unwrap());
static DEF_SOLVER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"def\s+solver\s*\(").unwrap());

/// Extracts solver source from a free-text LLM response using the first
/// matching strategy (§4.7): marker-then-fence, last fence containing
/// `def solver`, or a line-range fallback starting at `def solver`.
pub fn extract_solver_source(text: &str) -> Option<String> {
    if let Some(idx) = text.find(FINAL_SOLUTION_MARKER) {
        let after_marker = &text[idx + FINAL_SOLUTION_MARKER.len()..];
        if let Some(caps) = FENCED_PYTHON.captures(after_marker) {
            return Some(caps[1].to_string());
        }
    }

    let last_matching_fence = FENCED_PYTHON
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .filter(|block| DEF_SOLVER.is_match(block))
        .last();
    if let Some(block) = last_matching_fence {
        return Some(block);
    }

    if let Some(m) = DEF_SOLVER.find(text) {
        let line_start = text[..m.start()].rfind('\n').map(|i| i + 1).unwrap_or(0);
        return Some(text[line_start..].to_string());
    }

    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainStatus {
    Pass,
    Fail,
    Crash,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationLog {
    pub train_statuses: Vec<TrainStatus>,
    pub first_failure_index: Option<usize>,
    pub first_failure_detail: Option<String>,
}

/// Runs `code` over every training example, then (if all pass) the test
/// input. Returns `(grid, verification_log)` per §4.7.
pub async fn verify_and_run_solver(
    code: &str,
    train: &[Example],
    test_input: &Grid,
    timeout: Duration,
) -> (Option<Grid>, VerificationLog) {
    let mut statuses = Vec::with_capacity(train.len());
    let mut first_failure_index = None;
    let mut first_failure_detail = None;

    for (idx, example) in train.iter().enumerate() {
        let expected = match &example.output {
            Some(out) => out,
            None => continue,
        };
        let status = match run_untrusted_code(code, &example.input, timeout).await {
            SandboxOutcome::Timeout => TrainStatus::Timeout,
            SandboxOutcome::Crash { message } => {
                if first_failure_detail.is_none() {
                    first_failure_detail = Some(message);
                }
                TrainStatus::Crash
            }
            SandboxOutcome::Success { output } => match output_as_grid(&output) {
                Some(grid) if &grid == expected => TrainStatus::Pass,
                Some(grid) => {
                    if first_failure_detail.is_none() {
                        first_failure_detail = Some(format!("mismatch: got {grid:?}"));
                    }
                    TrainStatus::Fail
                }
                None => {
                    if first_failure_detail.is_none() {
                        first_failure_detail = Some("output was not a rectangular grid".to_string());
                    }
                    TrainStatus::Fail
                }
            },
        };

        if status != TrainStatus::Pass && first_failure_index.is_none() {
            first_failure_index = Some(idx);
        }
        statuses.push(status);
    }

    let log = VerificationLog {
        train_statuses: statuses.clone(),
        first_failure_index,
        first_failure_detail,
    };

    if statuses.iter().any(|s| *s != TrainStatus::Pass) {
        return (None, log);
    }

    let grid = match run_untrusted_code(code, test_input, timeout).await {
        SandboxOutcome::Success { output } => output_as_grid(&output),
        _ => None,
    };

    (grid, log)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_final_solution_marker() {
        let text = "blah\n### FINAL SOLUTION ###\n```python\ndef solver(g):\n    return g\n```\nmore text";
        let src = extract_solver_source(text).unwrap();
        assert!(src.contains("def solver"));
    }

    #[test]
    fn falls_back_to_last_fence_containing_def_solver() {
        let text = "```python\nx = 1\n```\nreasoning\n```python\ndef solver(g):\n    return g\n```";
        let src = extract_solver_source(text).unwrap();
        assert!(src.contains("def solver"));
        assert!(!src.contains("x = 1"));
    }

    #[test]
    fn falls_back_to_raw_def_solver_line() {
        let text = "some prose\ndef solver(g):\n    return g\n";
        let src = extract_solver_source(text).unwrap();
        assert!(src.starts_with("def solver"));
    }

    #[test]
    fn returns_none_when_no_solver_present() {
        assert!(extract_solver_source("no code here").is_none());
    }
}

//! Core data model: grids, tasks, call results, and the candidate map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An ordered sequence of equal-length rows of integers in 0-9.
pub type Grid = Vec<Vec<u8>>;

/// Canonical tuple form of a grid, used as a candidate-map key so that two
/// structurally-equal grids always land in the same bucket regardless of
/// how they were produced.
pub type GridKey = Vec<Vec<u8>>;

pub fn grid_key(grid: &Grid) -> GridKey {
    grid.clone()
}

pub fn validate_grid(grid: &Grid) -> Result<()> {
    if grid.is_empty() {
        return Err(Error::validation("grid has no rows"));
    }
    let width = grid[0].len();
    if width == 0 {
        return Err(Error::validation("grid row is empty"));
    }
    for row in grid {
        if row.len() != width {
            return Err(Error::validation("grid rows are not rectangular"));
        }
    }
    Ok(())
}

/// One train/test pair. Training examples always carry `output`; test
/// examples carry it only when ground truth is available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    pub input: Grid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Grid>,
}

/// Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub train: Vec<Example>,
    pub test: Vec<Example>,
}

impl Task {
    /// Loads a task from its JSON representation, validating every grid.
    ///
    /// Zero training examples is a fatal `ValidationError` (§8 boundary
    /// behavior).
    pub fn from_json(raw: &str) -> Result<Self> {
        let task: Task = serde_json::from_str(raw)?;
        task.validate()?;
        Ok(task)
    }

    pub fn validate(&self) -> Result<()> {
        if self.train.is_empty() {
            return Err(Error::validation("task has zero training examples"));
        }
        for ex in self.train.iter().chain(self.test.iter()) {
            validate_grid(&ex.input)?;
            if let Some(output) = &ex.output {
                validate_grid(output)?;
            }
        }
        Ok(())
    }

    /// Populates any test example missing `output` from an answers file,
    /// matched positionally (§6 "Answers file").
    pub fn apply_answers(&mut self, answers: &[Example]) {
        for (test_ex, answer) in self.test.iter_mut().zip(answers.iter()) {
            if test_ex.output.is_none() {
                test_ex.output = answer.output.clone();
            }
        }
    }
}

/// A monolithic tasks file: `{task_id: {train, test}, ...}`.
pub type MonolithicTasks = BTreeMap<String, Task>;

/// Tri-state correctness: ground truth may be unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    True,
    False,
    Unknown,
}

impl TriState {
    pub fn from_match(matched: bool) -> Self {
        if matched {
            TriState::True
        } else {
            TriState::False
        }
    }

    pub fn is_true(self) -> bool {
        matches!(self, TriState::True)
    }
}

/// Per-attempt timing breakdown (retry attempts + waits), mirroring the
/// `timing_tracker` entries §4.5/§8 scenario 4 describes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimingEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: Option<String>,
    pub duration: Option<f64>,
    pub status: Option<String>,
    pub error: Option<String>,
}

/// The output of one Worker invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResult {
    pub model_requested: String,
    pub model_actual: String,
    pub run_id: String,
    pub grid: Option<Grid>,
    pub is_correct: TriState,
    pub cost: f64,
    pub duration_ms: u64,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub timing_breakdown: Vec<TimingEntry>,
    pub full_response: String,
    pub verification_details: Option<serde_json::Value>,
}

/// One unique grid produced >= 1 times in a test, keyed by canonical tuple
/// form in an ordered mapping (§3 invariant: `candidate.count ==
/// len(candidate.models)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub grid: Grid,
    pub count: u32,
    pub models: Vec<String>,
    pub is_correct: TriState,
    pub reasoning_summary: String,
}

impl Candidate {
    pub fn new_empty(grid: Grid) -> Self {
        Candidate {
            grid,
            count: 0,
            models: Vec::new(),
            is_correct: TriState::Unknown,
            reasoning_summary: String::new(),
        }
    }

    pub fn assert_invariant(&self) -> Result<()> {
        if self.count as usize != self.models.len() {
            return Err(Error::internal(format!(
                "candidate.count ({}) != len(candidate.models) ({})",
                self.count,
                self.models.len()
            )));
        }
        Ok(())
    }
}

/// Ordered candidate map: canonical grid tuple -> Candidate. `BTreeMap` is
/// used (rather than a hash map) so iteration order is deterministic,
/// matching §9's determinism requirement for replaying step logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateMap {
    entries: BTreeMap<GridKey, Candidate>,
    insertion_order: Vec<GridKey>,
}

impl CandidateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a CallResult's grid against the map. A `grid=None` result
    /// (parse failure or sandbox failure) is silently skipped -- the
    /// invariant "a grid is inserted only if it parsed as a valid
    /// rectangular integer grid" is enforced by never calling this with an
    /// unvalidated grid.
    pub fn record(&mut self, result: &CallResult) {
        let Some(grid) = &result.grid else {
            return;
        };
        let key = grid_key(grid);
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            self.insertion_order.push(key.clone());
            Candidate::new_empty(grid.clone())
        });
        entry.count += 1;
        entry.models.push(result.run_id.clone());
        if result.is_correct.is_true() {
            entry.is_correct = TriState::True;
        } else if entry.is_correct == TriState::Unknown && result.is_correct == TriState::False {
            entry.is_correct = TriState::False;
        }
    }

    pub fn insert_synthesized(&mut self, grid: Grid, tag: &str) -> GridKey {
        let key = grid_key(&grid);
        self.entries.entry(key.clone()).or_insert_with(|| {
            self.insertion_order.push(key.clone());
            let mut c = Candidate::new_empty(grid);
            c.models.push(tag.to_string());
            c
        });
        key
    }

    pub fn get(&self, key: &GridKey) -> Option<&Candidate> {
        self.entries.get(key)
    }

    pub fn total_runs(&self) -> u32 {
        self.entries.values().map(|c| c.count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GridKey, &Candidate)> {
        self.insertion_order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|c| (k, c)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &Candidate> {
        self.entries.values()
    }
}

/// `run_id = "{model_id}_{n}_{step}"` (glossary).
pub fn make_run_id(model_id: &str, n: u32, step: &str) -> String {
    format!("{model_id}_{n}_{step}")
}

/// Structured JSONL failure record, append-only, one file per run timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub task_id: String,
    pub test_index: usize,
    pub step: String,
    pub model: String,
    pub run_id: String,
    pub error_type: String,
    pub error_message: String,
    pub stack: Option<String>,
    pub is_retryable: bool,
}

/// Per-attempt metadata attached to a submission entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AttemptMetadata {
    pub start_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub end_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub reasoning_summary: String,
    pub usage: serde_json::Value,
    pub cost: f64,
    /// Always zero/null in this implementation: the original system writes
    /// this field into submission metadata but never populates it from a
    /// provider (SPEC_FULL.md §9 open-question resolution).
    pub reasoning_cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub grid: Grid,
    pub metadata: AttemptMetadata,
}

/// `{attempt_1, attempt_2}` for one test_index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionEntry {
    pub attempt_1: Attempt,
    pub attempt_2: Attempt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_training_examples_is_validation_error() {
        let raw = r#"{"train": [], "test": [{"input": [[1]]}]}"#;
        let err = Task::from_json(raw).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn non_rectangular_grid_rejected() {
        let raw = r#"{"train": [{"input": [[1,2],[3]], "output": [[1]]}], "test": [{"input": [[1]]}]}"#;
        assert!(Task::from_json(raw).is_err());
    }

    #[test]
    fn candidate_map_invariant_holds() {
        let mut map = CandidateMap::new();
        let grid = vec![vec![1, 2], vec![3, 4]];
        for i in 0..3 {
            let result = CallResult {
                model_requested: "gpt-5.1-high".into(),
                model_actual: "gpt-5.1-high".into(),
                run_id: make_run_id("gpt-5.1-high", i, "step1"),
                grid: Some(grid.clone()),
                is_correct: TriState::Unknown,
                cost: 0.0,
                duration_ms: 0,
                prompt_tokens: 0,
                output_tokens: 0,
                cached_tokens: 0,
                timing_breakdown: vec![],
                full_response: String::new(),
                verification_details: None,
            };
            map.record(&result);
        }
        let key = grid_key(&grid);
        let candidate = map.get(&key).unwrap();
        candidate.assert_invariant().unwrap();
        assert_eq!(candidate.count, 3);
        assert_eq!(map.total_runs(), 3);
    }

    #[test]
    fn grid_with_no_grid_is_skipped() {
        let mut map = CandidateMap::new();
        let result = CallResult {
            model_requested: "gpt-5.1-high".into(),
            model_actual: "gpt-5.1-high".into(),
            run_id: "r1".into(),
            grid: None,
            is_correct: TriState::False,
            cost: 0.0,
            duration_ms: 0,
            prompt_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            timing_breakdown: vec![],
            full_response: "parse error".into(),
            verification_details: None,
        };
        map.record(&result);
        assert!(map.is_empty());
    }
}

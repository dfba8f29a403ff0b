//! Batch Controller (§4.11): loads a task source, runs every task/test-index
//! pair through [`run_solver`] on a bounded pool of `task_workers` slots, and
//! writes the submission/results/per-task-detail files.
//!
//! Grounded on `examples/original_source/src/batch_processing.py`'s
//! `run_batch_execution` (one rate-limit scale applied once at startup, a
//! global-timeout monitor thread that kills in-flight workers) and the
//! teacher's `src/llm/batch.rs` `Semaphore`-bounded fan-out already reused
//! by `fanout.rs` -- the same bounded-pool idiom, one level up, with
//! `run_solver` standing in for a single worker call and a `watch` channel
//! standing in for the monitor thread's process-kill signal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use crate::config::SolverConfig;
use crate::error::{Error, Result};
use crate::state_machine::{run_solver, Outcome, SolverRun, TaskContext};
use crate::submission::{build_submission_entry, ResultsSummary, TaskDetail, TaskDetailEntry};
use crate::task::{Example, MonolithicTasks, SubmissionEntry, Task};
use crate::worker::WorkerContext;

/// Where the batch's tasks come from (§6 "Task file format(s)").
#[derive(Debug, Clone)]
pub enum TaskSource {
    /// One `{train, test}` JSON file; the task id is its file stem.
    SingleFile(PathBuf),
    /// A directory of such files, one task per file, task id = file stem.
    Directory(PathBuf),
    /// A single `{task_id: {train, test}, ...}` file.
    Monolithic(PathBuf),
}

#[derive(Debug, Deserialize)]
struct AnswersFile {
    test: Vec<Example>,
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::validation(format!("cannot derive task id from {}", path.display())))
}

fn load_task_file(path: &Path) -> Result<Task> {
    let raw = std::fs::read_to_string(path)?;
    Task::from_json(&raw)
}

/// Populates missing `test[i].output` from `{answers_directory}/{task_id}.json`
/// when present (§6 "Answers file"); a task with no matching answers file is
/// left untouched.
fn apply_answers_if_present(task: &mut Task, task_id: &str, answers_directory: Option<&str>) -> Result<()> {
    let Some(dir) = answers_directory else {
        return Ok(());
    };
    let path = Path::new(dir).join(format!("{task_id}.json"));
    if !path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(&path)?;
    let answers: AnswersFile = serde_json::from_str(&raw)?;
    task.apply_answers(&answers.test);
    Ok(())
}

impl TaskSource {
    /// Loads every task named by this source, keyed by task id, answers
    /// applied where available.
    pub fn load(&self, answers_directory: Option<&str>) -> Result<BTreeMap<String, Task>> {
        match self {
            TaskSource::SingleFile(path) => {
                let task_id = file_stem(path)?;
                let mut task = load_task_file(path)?;
                apply_answers_if_present(&mut task, &task_id, answers_directory)?;
                Ok(BTreeMap::from([(task_id, task)]))
            }
            TaskSource::Directory(dir) => {
                let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
                    .collect();
                entries.sort();
                let mut tasks = BTreeMap::new();
                for path in entries {
                    let task_id = file_stem(&path)?;
                    let mut task = load_task_file(&path)?;
                    apply_answers_if_present(&mut task, &task_id, answers_directory)?;
                    tasks.insert(task_id, task);
                }
                Ok(tasks)
            }
            TaskSource::Monolithic(path) => {
                let raw = std::fs::read_to_string(path)?;
                let monolithic: MonolithicTasks = serde_json::from_str(&raw)?;
                let mut tasks = BTreeMap::new();
                for (task_id, mut task) in monolithic {
                    task.validate()?;
                    apply_answers_if_present(&mut task, &task_id, answers_directory)?;
                    tasks.insert(task_id, task);
                }
                Ok(tasks)
            }
        }
    }
}

/// Everything the controller produces for one batch run.
pub struct BatchOutcome {
    pub submissions: BTreeMap<String, Vec<SubmissionEntry>>,
    pub results: ResultsSummary,
    pub task_details: Vec<TaskDetail>,
}

/// One `(task_id, test_index)` slot (§4.11 "one task-test pair per slot").
struct Job {
    task_id: String,
    test_index: usize,
    train: Vec<Example>,
    test_input: crate::task::Grid,
    expected: Option<crate::task::Grid>,
}

/// Runs the full batch: loads `source`, scales the rate limiter once for
/// `task_workers` concurrent slots, runs every job under a global deadline,
/// and returns everything needed to write the submission/results/detail
/// files (left to the caller, since the caller knows the run timestamp and
/// output paths -- §4.12 is a separate concern from scheduling).
/// `test_filter`, when set, restricts every task to that one 1-based test
/// index (§6 `--test`) instead of running its whole `test` list.
pub async fn run_batch(
    ctx: &WorkerContext,
    source: &TaskSource,
    config: &SolverConfig,
    test_filter: Option<usize>,
) -> Result<BatchOutcome> {
    let tasks = source.load(config.answers_directory.as_deref())?;
    if tasks.is_empty() {
        return Err(Error::validation("task source produced zero tasks"));
    }

    // §4.11 "applies rate_limit_scale = 1 / task_workers to each slot at
    // startup". `set_rate_limit_scaling` is itself idempotent per process,
    // so this single call is exactly the "once per process" scaling the
    // original's one-rate-limiter-per-OS-process model achieved implicitly
    // by giving every worker process its own, already-scaled bucket.
    let scale = 1.0 / config.task_workers.max(1) as f64;
    ctx.rate_limiter.set_rate_limit_scaling(scale).await;

    let jobs: Vec<Job> = tasks
        .iter()
        .flat_map(|(task_id, task)| {
            task.test
                .iter()
                .enumerate()
                .filter(move |(i, _)| test_filter.map(|t| t == i + 1).unwrap_or(true))
                .map(move |(i, example)| Job {
                    task_id: task_id.clone(),
                    test_index: i + 1,
                    train: task.train.clone(),
                    test_input: example.input.clone(),
                    expected: example.output.clone(),
                })
        })
        .collect();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let deadline = config.global_deadline;
    let deadline_task = tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        let _ = cancel_tx.send(true);
    });

    let semaphore = Arc::new(Semaphore::new(config.task_workers.max(1)));
    let runs = futures::future::join_all(jobs.into_iter().map(|job| {
        let semaphore = semaphore.clone();
        let ctx = ctx.clone();
        let config = config.clone();
        let mut cancel_rx = cancel_rx.clone();
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .expect("batch semaphore is never closed");
            if *cancel_rx.borrow() {
                return (job.task_id, job.test_index, deadline_exceeded_run());
            }
            let task_ctx = TaskContext {
                task_id: job.task_id.clone(),
                test_index: job.test_index,
                train: job.train,
                test_input: job.test_input,
                expected: job.expected,
            };
            let run = tokio::select! {
                run = run_solver(&ctx, &task_ctx, &config) => run,
                _ = cancel_rx.changed() => {
                    warn!(task_id = %job.task_id, test_index = job.test_index, "global deadline cancelled in-flight task");
                    deadline_exceeded_run()
                }
            };
            (job.task_id, job.test_index, run)
        }
    }))
    .await;

    deadline_task.abort();

    let mut by_task: BTreeMap<String, Vec<(usize, SolverRun)>> = BTreeMap::new();
    for (task_id, test_index, run) in runs {
        by_task.entry(task_id).or_default().push((test_index, run));
    }

    let mut submissions = BTreeMap::new();
    let mut results = ResultsSummary::default();
    let mut task_details = Vec::new();
    let now = chrono::Utc::now();

    for (task_id, mut runs) in by_task {
        runs.sort_by_key(|(test_index, _)| *test_index);
        let entries: Vec<SubmissionEntry> = runs
            .iter()
            .map(|(_, run)| build_submission_entry(run, now, now))
            .collect();
        let solver_runs: Vec<SolverRun> = runs.iter().map(|(_, run)| run.clone()).collect();
        results.record_task(&task_id, &solver_runs);
        task_details.push(TaskDetail {
            task_id: task_id.clone(),
            runs: runs
                .into_iter()
                .map(|(test_index, run)| TaskDetailEntry { test_index, run })
                .collect(),
        });
        submissions.insert(task_id, entries);
    }

    info!(
        total_tasks = results.total_tasks,
        solved_tasks = results.solved_tasks,
        "batch complete"
    );

    Ok(BatchOutcome {
        submissions,
        results,
        task_details,
    })
}

fn deadline_exceeded_run() -> SolverRun {
    SolverRun {
        candidates: crate::task::CandidateMap::new(),
        step_logs: BTreeMap::new(),
        selection: crate::selector::SelectionOutcome::empty(),
        outcome: Outcome::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_task(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    const TASK_JSON: &str = r#"{"train":[{"input":[[1]],"output":[[2]]}],"test":[{"input":[[3]]}]}"#;

    #[test]
    fn single_file_source_derives_task_id_from_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(dir.path(), "007bbfb7.json", TASK_JSON);
        let tasks = TaskSource::SingleFile(path).load(None).unwrap();
        assert!(tasks.contains_key("007bbfb7"));
    }

    #[test]
    fn directory_source_loads_every_json_file() {
        let dir = tempfile::tempdir().unwrap();
        write_task(dir.path(), "a.json", TASK_JSON);
        write_task(dir.path(), "b.json", TASK_JSON);
        write_task(dir.path(), "ignore.txt", "not json");
        let tasks = TaskSource::Directory(dir.path().to_path_buf()).load(None).unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn monolithic_source_keys_by_embedded_task_id() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(r#"{{"custom-id": {TASK_JSON}}}"#);
        let path = write_task(dir.path(), "all.json", &body);
        let tasks = TaskSource::Monolithic(path).load(None).unwrap();
        assert!(tasks.contains_key("custom-id"));
    }

    #[test]
    fn answers_file_fills_in_missing_test_output() {
        let dir = tempfile::tempdir().unwrap();
        let task_path = write_task(dir.path(), "t.json", TASK_JSON);
        let answers_dir = tempfile::tempdir().unwrap();
        write_task(answers_dir.path(), "t.json", r#"{"test":[{"output":[[9]]}]}"#);
        let task_id = file_stem(&task_path).unwrap();
        let mut task = load_task_file(&task_path).unwrap();
        apply_answers_if_present(&mut task, &task_id, Some(answers_dir.path().to_str().unwrap())).unwrap();
        assert_eq!(task.test[0].output, Some(vec![vec![9]]));
    }

    #[test]
    fn missing_answers_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let task_path = write_task(dir.path(), "t.json", TASK_JSON);
        let task_id = file_stem(&task_path).unwrap();
        let mut task = load_task_file(&task_path).unwrap();
        apply_answers_if_present(&mut task, &task_id, Some("/nonexistent/answers")).unwrap();
        assert_eq!(task.test[0].output, None);
    }

    #[test]
    fn empty_directory_loads_as_zero_tasks_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = TaskSource::Directory(dir.path().to_path_buf()).load(None).unwrap();
        // zero files in the directory is not itself an error at the source
        // layer; `run_batch` is what rejects an empty task map.
        assert!(tasks.is_empty());
    }
}

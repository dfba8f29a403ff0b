//! Solver State Machine (§4.9): drives one test input through
//! `INIT → STEP1 → STEP2 → STEP3 → STEP4 → STEP5 → FINISH → DONE`,
//! updating the candidate map and step logs along the way.
//!
//! Grounded on `examples/original_source/src/solver/steps.py` (`run_step_1`,
//! `run_step_3`, `check_is_solved`, `run_step_5`'s four-strategy fan-out
//! under one mutex-guarded counters dict) and `src/solver/pipelines.py`
//! (`run_objects_pipeline_variant`'s three-phase extract/transform/solve).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

/// Shared step-5 progress counters (`deep`/`image`/`hint`/`objects`),
/// mutex-guarded so the four strategies can report into one view without
/// racing (§4.9, grounded on `steps.py`'s `counters` dict under a
/// `threading.Lock`).
type ProgressCounters = Arc<StdMutex<HashMap<&'static str, i64>>>;

fn decrement_and_log(progress: &ProgressCounters, key: &'static str) {
    let mut guard = progress.lock().expect("progress counter mutex poisoned");
    if let Some(v) = guard.get_mut(key) {
        *v -= 1;
    }
    let d = guard.get("deep").copied().unwrap_or(0);
    let i = guard.get("image").copied().unwrap_or(0);
    let h = guard.get("hint").copied().unwrap_or(0);
    let o = guard.get("objects").copied().unwrap_or(0);
    info!("step 5 progress: deep={d} image={i} hint={h} objects={o} left");
}

use crate::config::{CodegenPromptVersion, SolverConfig};
use crate::fanout::{run_fanout, FanoutJob};
use crate::grid::grid_to_csv;
use crate::llm::SolveOpts;
use crate::prompts::{
    build_hint_generation_prompt, build_objects_extraction_prompt,
    build_objects_transformation_prompt, build_prompt, extract_tag_content, PromptExtras,
};
use crate::selector::{select, SelectionOutcome};
use crate::task::{CallResult, CandidateMap, Example, Grid};
use crate::worker::{call_model, run_id_for, run_worker, CallMode, WorkerContext};

/// Everything the state machine needs about the task/test pair it is
/// driving; everything else (clients, rate limiter, config) comes from the
/// shared `WorkerContext`.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub test_index: usize,
    pub train: Vec<Example>,
    pub test_input: Grid,
    pub expected: Option<Grid>,
}

/// Per-step artifact persisted to disk by the Submission Writer: every
/// CallResult produced in that step, plus free-form extras (extracted
/// summaries, hint text, judge output -- whatever that step adds).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepLog {
    pub results: Vec<CallResult>,
    pub extra: serde_json::Value,
}

/// Final PASS/FAIL/SUBMITTED classification (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    Submitted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverRun {
    pub candidates: CandidateMap,
    pub step_logs: BTreeMap<String, StepLog>,
    pub selection: SelectionOutcome,
    pub outcome: Outcome,
}

/// `run_id = "{model}_{n}_{step}"` counters, persisted per task across
/// every step it runs (§4.9, grounded on
/// `original_source/src/parallel.py::run_models_in_parallel`'s
/// `run_id_counts` dict threaded across calls). Interior mutability so
/// step-5's concurrent strategies can all mint run IDs from one shared
/// counter without a borrow-checker conflict.
#[derive(Debug, Default)]
struct RunIdCounter {
    counts: StdMutex<HashMap<String, u32>>,
}

impl RunIdCounter {
    fn next(&self, model_id: &str, step: &str) -> String {
        let mut counts = self.counts.lock().expect("run-id counter mutex poisoned");
        let n = counts.entry(model_id.to_string()).or_insert(0);
        *n += 1;
        run_id_for(model_id, *n, step)
    }
}

/// Runs the top-level state machine for one test input. Never panics on
/// LLM/provider failure; a watchdog bounds total wall-clock time.
pub async fn run_solver(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    config: &SolverConfig,
) -> SolverRun {
    let watchdog = config.per_task_watchdog;
    match tokio::time::timeout(watchdog, drive(ctx, task_ctx, config)).await {
        Ok(run) => run,
        Err(_) => {
            warn!(task_id = %task_ctx.task_id, test_index = task_ctx.test_index, "per-task watchdog expired");
            SolverRun {
                candidates: CandidateMap::new(),
                step_logs: BTreeMap::new(),
                selection: SelectionOutcome::empty(),
                outcome: Outcome::Fail,
            }
        }
    }
}

async fn drive(ctx: &WorkerContext, task_ctx: &TaskContext, config: &SolverConfig) -> SolverRun {
    let counter = RunIdCounter::default();
    let mut candidates = CandidateMap::new();
    let mut step_logs: BTreeMap<String, StepLog> = BTreeMap::new();
    let test_csv = grid_to_csv(&task_ctx.test_input);

    // STEP1
    let prompt1 = build_prompt(&task_ctx.train, &test_csv, &PromptExtras::default());
    let results1 = run_step(
        ctx,
        task_ctx,
        &config.step1_models,
        "step_1",
        &prompt1,
        CallMode::Text,
        config.fanout_workers,
        &counter,
        None,
    )
    .await;
    record_all(&mut candidates, &results1);
    step_logs.insert(
        "step_1".to_string(),
        StepLog {
            results: results1,
            extra: json!({}),
        },
    );

    // STEP2
    let solved_after_1 = is_solved(&candidates, config.k_threshold);
    step_logs.insert(
        "step_2".to_string(),
        StepLog {
            results: vec![],
            extra: json!({ "is_solved": solved_after_1 }),
        },
    );

    if config.force_step_2 {
        return finish(ctx, task_ctx, candidates, step_logs, config).await;
    }
    if solved_after_1 && !config.force_step_5 {
        return finish(ctx, task_ctx, candidates, step_logs, config).await;
    }

    // STEP3/4 (optional extended search)
    if config.enable_step_3_and_4 && !config.step3_models.is_empty() {
        let prompt3 = build_prompt(&task_ctx.train, &test_csv, &PromptExtras::default());
        let results3 = run_step(
            ctx,
            task_ctx,
            &config.step3_models,
            "step_3",
            &prompt3,
            CallMode::Text,
            config.fanout_workers,
            &counter,
            None,
        )
        .await;
        record_all(&mut candidates, &results3);
        step_logs.insert(
            "step_3".to_string(),
            StepLog {
                results: results3,
                extra: json!({}),
            },
        );

        let solved_after_3 = is_solved(&candidates, config.k_threshold);
        step_logs.insert(
            "step_4".to_string(),
            StepLog {
                results: vec![],
                extra: json!({ "is_solved": solved_after_3 }),
            },
        );
        if solved_after_3 && !config.force_step_5 {
            return finish(ctx, task_ctx, candidates, step_logs, config).await;
        }
    }

    // STEP5
    let step5_log = run_step5(ctx, task_ctx, config, &counter, &mut candidates).await;
    step_logs.insert("step_5".to_string(), step5_log);

    finish(ctx, task_ctx, candidates, step_logs, config).await
}

/// `is_solved` (§4.9 STEP2/STEP4), grounded on
/// `original_source/src/selection.py::is_solved`.
pub fn is_solved(candidates: &CandidateMap, k_threshold: u32) -> bool {
    if candidates.is_empty() {
        return false;
    }
    let total = candidates.total_runs();
    if total == 0 {
        return false;
    }
    let mut by_count: Vec<u32> = candidates.values().map(|c| c.count).collect();
    by_count.sort_unstable_by(|a, b| b.cmp(a));
    let top = by_count[0];
    if !(top >= k_threshold && (top as f64 / total as f64) > 0.25) {
        return false;
    }
    by_count[1..].iter().all(|&c| c == 1)
}

async fn run_step(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    models: &[String],
    step_name: &str,
    prompt: &str,
    mode: CallMode,
    max_parallel: usize,
    counter: &RunIdCounter,
    progress: Option<(ProgressCounters, &'static str)>,
) -> Vec<CallResult> {
    let jobs: Vec<FanoutJob> = models
        .iter()
        .map(|m| FanoutJob {
            model_id: m.clone(),
            run_id: counter.next(m, step_name),
            background: ctx.config.openai_background,
        })
        .collect();
    let opts = SolveOpts {
        image_path: None,
        task_id: Some(task_ctx.task_id.clone()),
        test_index: Some(task_ctx.test_index),
        step_name: Some(step_name.to_string()),
        code_tool: false,
    };
    run_fanout(
        ctx,
        prompt,
        jobs,
        &task_ctx.test_input,
        task_ctx.expected.as_ref(),
        &task_ctx.train,
        mode,
        &opts,
        max_parallel,
        |left| {
            if let Some((counters, key)) = &progress {
                decrement_and_log(counters, key);
            }
            if left % 5 == 0 {
                info!(step = %step_name, left, "fan-out progress");
            }
        },
    )
    .await
}

fn record_all(candidates: &mut CandidateMap, results: &[CallResult]) {
    for r in results {
        candidates.record(r);
    }
}

/// STEP5 "full search" (§4.9): four strategies in parallel (unless
/// `objects_only`), plus the codegen variant, sharing one progress-counter
/// map. Grounded on `original_source/src/solver/steps.py::run_step_5`.
async fn run_step5(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    config: &SolverConfig,
    counter: &RunIdCounter,
    candidates: &mut CandidateMap,
) -> StepLog {
    let test_csv = grid_to_csv(&task_ctx.test_input);
    let solver_model_count = config.step1_models.len() as i64;
    let progress: ProgressCounters = Arc::new(StdMutex::new(HashMap::from([
        ("deep", solver_model_count),
        ("image", solver_model_count),
        ("hint", solver_model_count + 1),
        ("objects", solver_model_count + 2),
    ])));

    let mut extra = serde_json::Map::new();

    if config.objects_only {
        let (results, pipeline_log) =
            run_objects_pipeline(ctx, task_ctx, config, counter, "gpt_gen", progress.clone()).await;
        record_all(candidates, &results);
        extra.insert("objects_pipeline".to_string(), pipeline_log);
        return StepLog {
            results,
            extra: serde_json::Value::Object(extra),
        };
    }

    // Run every strategy concurrently; each owns its own counter/state and
    // none cancels the others on failure.
    let deep_fut = {
        let prompt = build_prompt(
            &task_ctx.train,
            &test_csv,
            &PromptExtras {
                trigger_deep_thinking: true,
                ..Default::default()
            },
        );
        let models = config.step1_models.clone();
        run_step(
            ctx,
            task_ctx,
            &models,
            "step_5_deep_thinking",
            &prompt,
            CallMode::Text,
            config.fanout_workers,
            counter,
            Some((progress.clone(), "deep")),
        )
    };

    // Image rendering is out of scope (§1 Non-goals); the strategy's
    // control-flow shape is preserved by always treating image generation
    // as unavailable and skipping its sub-fan-out, matching a failed
    // `generate_and_save_image` in the original.
    let image_results: Vec<CallResult> = Vec::new();
    for _ in 0..solver_model_count {
        decrement_and_log(&progress, "image");
    }

    let hint_fut = run_hint_step(ctx, task_ctx, config, counter, progress.clone());
    let objects_fut =
        run_objects_pipeline(ctx, task_ctx, config, counter, "gpt_gen", progress.clone());
    let codegen_fut = run_codegen_variant(ctx, task_ctx, config, counter);

    let (deep_results, hint_outcome, objects_outcome, codegen_results) =
        tokio::join!(deep_fut, hint_fut, objects_fut, codegen_fut);

    record_all(candidates, &deep_results);
    extra.insert(
        "trigger-deep-thinking".to_string(),
        json!({ "count": deep_results.len() }),
    );
    extra.insert("image".to_string(), json!({ "count": image_results.len() }));

    let (hint_results, hint_log) = hint_outcome;
    record_all(candidates, &hint_results);
    extra.insert("generate-hint".to_string(), hint_log);

    let (objects_results, objects_log) = objects_outcome;
    record_all(candidates, &objects_results);
    extra.insert("objects_pipeline".to_string(), objects_log);

    record_all(candidates, &codegen_results);
    extra.insert(
        "codegen".to_string(),
        json!({ "count": codegen_results.len() }),
    );

    let mut all = Vec::new();
    all.extend(deep_results);
    all.extend(hint_results);
    all.extend(objects_results);
    all.extend(codegen_results);

    StepLog {
        results: all,
        extra: serde_json::Value::Object(extra),
    }
}

/// Generates a natural-language hint via one raw model call (skipping the
/// worker's grid-extraction/scoring path, since a hint response is prose,
/// not a candidate grid), then fans out solvers with the hint inlined. If
/// hint generation itself fails, the sub-fan-out is skipped entirely
/// (§4.9, matching `run_step_5::run_hint_step`'s "manually drain the
/// counter" behavior when `generate_hint` returns nothing).
async fn run_hint_step(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    config: &SolverConfig,
    counter: &RunIdCounter,
    progress: ProgressCounters,
) -> (Vec<CallResult>, serde_json::Value) {
    let test_csv = grid_to_csv(&task_ctx.test_input);
    let hint_prompt = build_hint_generation_prompt(&task_ctx.train, &test_csv);
    let hint_run_id = counter.next(&config.step5_hint_model, "step_5_generate_hint_gen");
    let opts = SolveOpts {
        image_path: None,
        task_id: Some(task_ctx.task_id.clone()),
        test_index: Some(task_ctx.test_index),
        step_name: Some("step_5_generate_hint_gen".to_string()),
        code_tool: false,
    };

    let hint_call = call_model(
        ctx,
        &hint_prompt,
        &config.step5_hint_model,
        &hint_run_id,
        config.openai_background,
        &opts,
    )
    .await;

    let (hint_text, hint_log) = match hint_call {
        Ok((response, cost, _timing)) => {
            let log = json!({
                "model": config.step5_hint_model,
                "full_raw_prompt": hint_prompt,
                "full_raw_response": response.text,
                "extracted_hint": response.text,
                "total_cost": cost,
                "input_tokens": response.prompt_tokens,
                "output_tokens": response.completion_tokens,
                "cached_tokens": response.cached_tokens,
            });
            (Some(response.text), log)
        }
        Err(e) => (None, json!({ "error": e.error.to_string() })),
    };
    decrement_and_log(&progress, "hint");

    let Some(hint) = hint_text.filter(|h| !h.trim().is_empty()) else {
        // Generation failed: drain the remaining "hint" slots ourselves,
        // since the sub-fan-out that would have decremented them never runs.
        for _ in 0..config.step1_models.len() {
            decrement_and_log(&progress, "hint");
        }
        return (Vec::new(), hint_log);
    };

    let prompt = build_prompt(
        &task_ctx.train,
        &test_csv,
        &PromptExtras {
            strategy: Some(hint),
            ..Default::default()
        },
    );
    let results = run_step(
        ctx,
        task_ctx,
        &config.step1_models,
        "step_5_generate_hint",
        &prompt,
        CallMode::Text,
        config.fanout_workers,
        counter,
        Some((progress, "hint")),
    )
    .await;
    (results, hint_log)
}

/// Three-phase objects pipeline (§4.9 STEP5 "Objects pipeline"), grounded
/// on `original_source/src/solver/pipelines.py::run_objects_pipeline_variant`.
async fn run_objects_pipeline(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    config: &SolverConfig,
    counter: &RunIdCounter,
    variant_name: &str,
    progress: ProgressCounters,
) -> (Vec<CallResult>, serde_json::Value) {
    let test_csv = grid_to_csv(&task_ctx.test_input);
    let generator = config.judge_model.clone();

    // Phase A: extraction.
    let prompt_a = build_objects_extraction_prompt(&task_ctx.train, &test_csv);
    let run_a = counter.next(&generator, &format!("step_5_{variant_name}_extract"));
    let opts_a = SolveOpts {
        image_path: None,
        task_id: Some(task_ctx.task_id.clone()),
        test_index: Some(task_ctx.test_index),
        step_name: Some(format!("step_5_{variant_name}_extract")),
        code_tool: false,
    };
    let res_a = call_model(ctx, &prompt_a, &generator, &run_a, config.openai_background, &opts_a).await;
    let text_a = match &res_a {
        Ok((r, _, _)) => extract_tag_content(&r.text, "objects_summary").unwrap_or_else(|| r.text.clone()),
        Err(_) => String::new(),
    };
    decrement_and_log(&progress, "objects");

    // Phase B: transformation.
    let prompt_b = build_objects_transformation_prompt(&task_ctx.train, &test_csv, &text_a);
    let run_b = counter.next(&generator, &format!("step_5_{variant_name}_transform"));
    let opts_b = SolveOpts {
        image_path: None,
        task_id: Some(task_ctx.task_id.clone()),
        test_index: Some(task_ctx.test_index),
        step_name: Some(format!("step_5_{variant_name}_transform")),
        code_tool: false,
    };
    let res_b = call_model(ctx, &prompt_b, &generator, &run_b, config.openai_background, &opts_b).await;
    let text_b = match &res_b {
        Ok((r, _, _)) => {
            extract_tag_content(&r.text, "transformation_summary").unwrap_or_else(|| r.text.clone())
        }
        Err(_) => String::new(),
    };
    decrement_and_log(&progress, "objects");

    let pipeline_log = json!({
        "extraction": {"model": generator, "prompt": prompt_a, "extracted_summary": text_a},
        "transformation": {"model": generator, "prompt": prompt_b, "extracted_summary": text_b},
    });

    // Phase C: solve with both summaries inlined.
    let insertion = format!("## Objects Description\n\n{text_a}\n\n## Transformation Description\n\n{text_b}");
    let prompt_c = build_prompt(
        &task_ctx.train,
        &test_csv,
        &PromptExtras {
            objects_insertion: Some(insertion),
            ..Default::default()
        },
    );
    let solver_models: Vec<String> = if config.objects_only {
        config.codegen_params.iter().map(|p| p.model_id.clone()).collect()
    } else {
        config.step1_models.clone()
    };
    let results = run_step(
        ctx,
        task_ctx,
        &solver_models,
        &format!("step_5_{variant_name}_sol"),
        &prompt_c,
        CallMode::Text,
        config.fanout_workers,
        counter,
        Some((progress, "objects")),
    )
    .await;

    (results, pipeline_log)
}

/// Code-generation variant (§4.9 STEP5): one Worker call per
/// `(model_id, prompt_version)` pair, run in the Worker's code mode.
async fn run_codegen_variant(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    config: &SolverConfig,
    counter: &RunIdCounter,
) -> Vec<CallResult> {
    if config.codegen_params.is_empty() {
        return Vec::new();
    }
    let test_csv = grid_to_csv(&task_ctx.test_input);
    let mut all = Vec::new();
    for param in &config.codegen_params {
        let prompt = build_codegen_prompt(&task_ctx.train, &test_csv, &param.prompt_version);
        let run_id = counter.next(&param.model_id, "step_5_codegen");
        let opts = SolveOpts {
            image_path: None,
            task_id: Some(task_ctx.task_id.clone()),
            test_index: Some(task_ctx.test_index),
            step_name: Some("step_5_codegen".to_string()),
            code_tool: matches!(param.prompt_version, CodegenPromptVersion::V4),
        };
        let result = run_worker(
            ctx,
            &prompt,
            &param.model_id,
            &run_id,
            CallMode::Code,
            config.openai_background,
            &task_ctx.test_input,
            task_ctx.expected.as_ref(),
            &task_ctx.train,
            &opts,
        )
        .await;
        all.push(result);
    }
    all
}

fn build_codegen_prompt(train: &[Example], test_csv: &str, version: &CodegenPromptVersion) -> String {
    let base = build_prompt(train, test_csv, &PromptExtras::default());
    let instructions = match version {
        CodegenPromptVersion::V1 | CodegenPromptVersion::V1b => {
            "Write a Python function `def solver(input_grid):` implementing the transformation, \
            and place it after a line reading exactly `### FINAL SOLUTION ###` inside a \
            ```python fenced block."
        }
        CodegenPromptVersion::V2 | CodegenPromptVersion::V2b => {
            "Reason step by step, then write a Python function `def solver(input_grid):` in a \
            ```python fenced block implementing the transformation."
        }
        CodegenPromptVersion::V3 => {
            "Write a Python function `def solver(input_grid):` that is robust to edge cases, \
            in a ```python fenced block."
        }
        CodegenPromptVersion::V4 => {
            "Use your code execution tool to test a Python function `def solver(input_grid):` \
            against the training examples before giving your final answer in a ```python \
            fenced block."
        }
    };
    format!("{base}\n\n{instructions}\nDo not extract to text output; only return code.")
}

async fn finish(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    candidates: CandidateMap,
    mut step_logs: BTreeMap<String, StepLog>,
    config: &SolverConfig,
) -> SolverRun {
    let reasoning_store: HashMap<String, String> = step_logs
        .values()
        .flat_map(|log| log.results.iter())
        .map(|r| (r.run_id.clone(), r.full_response.clone()))
        .collect();
    let selection = select(ctx, task_ctx, &candidates, &reasoning_store, config).await;
    let outcome = match selection.is_solved {
        Some(true) => Outcome::Pass,
        Some(false) => Outcome::Fail,
        None => Outcome::Submitted,
    };
    step_logs.insert(
        "finish".to_string(),
        StepLog {
            results: vec![],
            extra: serde_json::to_value(&selection).unwrap_or(json!({})),
        },
    );
    SolverRun {
        candidates,
        step_logs,
        selection,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TriState;

    #[test]
    fn is_solved_true_when_dominant_candidate_clears_threshold() {
        let mut map = CandidateMap::new();
        for i in 0..12u32 {
            let result = CallResult {
                model_requested: "m".into(),
                model_actual: "m".into(),
                run_id: format!("m_{i}_step1"),
                grid: Some(vec![vec![1]]),
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
        let other = CallResult {
            model_requested: "n".into(),
            model_actual: "n".into(),
            run_id: "n_1_step1".into(),
            grid: Some(vec![vec![2]]),
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
        map.record(&other);
        assert!(is_solved(&map, 11));
    }

    #[test]
    fn is_solved_false_when_below_threshold() {
        let mut map = CandidateMap::new();
        for i in 0..3u32 {
            let result = CallResult {
                model_requested: "m".into(),
                model_actual: "m".into(),
                run_id: format!("m_{i}_step1"),
                grid: Some(vec![vec![1]]),
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
        assert!(!is_solved(&map, 11));
    }

    #[test]
    fn run_id_counter_increments_per_model_across_steps() {
        let counter = RunIdCounter::default();
        let a = counter.next("gpt-5.1-high", "step_1");
        let b = counter.next("gpt-5.1-high", "step_3");
        assert_eq!(a, "gpt-5.1-high_1_step_1");
        assert_eq!(b, "gpt-5.1-high_2_step_3");
    }
}

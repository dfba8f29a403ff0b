//! Judge & Selector (§4.10): picks the final one or two candidate grids to
//! submit, either via a single Meta-Conclusion duo-pick judge call or via a
//! Logic/Consistency judge pair scoring a Consensus/Auditor pick.
//!
//! Grounded on `examples/original_source/src/selection_advanced.py::pick_solution_v2`
//! (branch structure and fallback order) and `src/judges.py` (`extract_json`'s
//! fenced-then-brace-scan JSON recovery, `extract_all_grids` generalized here
//! as `crate::grid::extract_all_grids_from_text`).

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::grid::{extract_all_grids_from_text, grid_to_csv};
use crate::config::SolverConfig;
use crate::llm::SolveOpts;
use crate::prompts::{build_consistency_prompt, build_duo_pick_prompt, build_logic_prompt, JudgeCandidate};
use crate::state_machine::TaskContext;
use crate::task::{grid_key, Candidate, CandidateMap, Grid, GridKey, TriState};
use crate::worker::{call_model, WorkerContext};

/// A grid chosen for submission, with enough provenance to populate the
/// Submission Writer's per-attempt metadata (§4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickedCandidate {
    pub grid: Grid,
    pub is_correct: TriState,
    pub count: u32,
    pub source_tag: String,
}

/// Everything FINISH needs: the picked grids, whether the task is solved
/// (only known when ground truth is available), and the judge transcript
/// for the step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionOutcome {
    pub picked: Vec<PickedCandidate>,
    pub is_solved: Option<bool>,
    pub selection_type: String,
    pub details: Value,
}

impl SelectionOutcome {
    pub fn empty() -> Self {
        SelectionOutcome {
            picked: Vec::new(),
            is_solved: None,
            selection_type: "none".to_string(),
            details: json!({}),
        }
    }
}

/// Picks the final candidate(s) for one test input (§4.10).
pub async fn select(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    candidates: &CandidateMap,
    reasoning_store: &HashMap<String, String>,
    config: &SolverConfig,
) -> SelectionOutcome {
    if candidates.is_empty() {
        return SelectionOutcome::empty();
    }

    let views: Vec<(usize, GridKey, Candidate)> = candidates
        .iter()
        .enumerate()
        .map(|(id, (key, cand))| (id, key.clone(), cand.clone()))
        .collect();
    let total_attempts = candidates.total_runs();

    if config.judge_duo_pick_enable {
        if let Some(outcome) = run_duo_pick(ctx, task_ctx, config, candidates, &views, reasoning_store, total_attempts).await {
            return outcome;
        }
    }

    run_consensus_and_auditor(ctx, task_ctx, config, candidates, &views, reasoning_store).await
}

fn candidate_reasoning(cand: &Candidate, reasoning_store: &HashMap<String, String>) -> String {
    cand.models
        .iter()
        .find_map(|run_id| reasoning_store.get(run_id))
        .cloned()
        .unwrap_or_else(|| "(reasoning not found)".to_string())
}

fn judge_candidates(
    views: &[(usize, GridKey, Candidate)],
    reasoning_store: &HashMap<String, String>,
) -> Vec<JudgeCandidate> {
    views
        .iter()
        .map(|(id, _, cand)| JudgeCandidate {
            id: *id,
            grid_csv: grid_to_csv(&cand.grid),
            count: cand.count,
            reasoning: candidate_reasoning(cand, reasoning_store),
        })
        .collect()
}

/// Branch A: one judge call, choose the last two grids it emits. Falls
/// through to Branch B (`None`) if fewer than two grids come back.
async fn run_duo_pick(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    config: &SolverConfig,
    candidates: &CandidateMap,
    views: &[(usize, GridKey, Candidate)],
    reasoning_store: &HashMap<String, String>,
    total_attempts: u32,
) -> Option<SelectionOutcome> {
    let test_csv = grid_to_csv(&task_ctx.test_input);
    let pool = judge_candidates(views, reasoning_store);
    let prompt = build_duo_pick_prompt(&task_ctx.train, &test_csv, &pool, total_attempts);
    let opts = SolveOpts {
        image_path: None,
        task_id: Some(task_ctx.task_id.clone()),
        test_index: Some(task_ctx.test_index),
        step_name: Some("selector_duo_pick".to_string()),
        code_tool: false,
    };
    let run_id = format!("{}_1_selector_duo_pick", config.judge_model);

    let response_text = match call_model(ctx, &prompt, &config.judge_model, &run_id, config.openai_background, &opts).await {
        Ok((r, _, _)) => r.text,
        Err(_) => return None,
    };

    let grids = extract_all_grids_from_text(&response_text);
    if grids.len() < 2 {
        return None;
    }

    let picked_grids: Vec<Grid> = grids.into_iter().rev().take(2).rev().collect();
    let mut picked = Vec::with_capacity(2);
    for (i, grid) in picked_grids.into_iter().enumerate() {
        let key = grid_key(&grid);
        let entry = candidates.get(&key);
        let (is_correct, count) = match entry {
            Some(c) => (c.is_correct, c.count),
            None => (TriState::Unknown, 0),
        };
        picked.push(PickedCandidate {
            grid,
            is_correct,
            count,
            source_tag: format!("duo_pick_{}", i + 1),
        });
    }

    let is_solved = solved_flag(&picked);
    Some(SelectionOutcome {
        picked,
        is_solved,
        selection_type: "Duo Pick Judge".to_string(),
        details: json!({ "duo_pick": { "prompt": prompt, "response": response_text } }),
    })
}

/// Branch B: Logic judge always, Consistency judge if enabled; consensus
/// pick plus the highest-scoring runner-up.
async fn run_consensus_and_auditor(
    ctx: &WorkerContext,
    task_ctx: &TaskContext,
    config: &SolverConfig,
    candidates: &CandidateMap,
    views: &[(usize, GridKey, Candidate)],
    reasoning_store: &HashMap<String, String>,
) -> SelectionOutcome {
    let test_csv = grid_to_csv(&task_ctx.test_input);

    let multi_vote: Vec<&(usize, GridKey, Candidate)> = views.iter().filter(|(_, _, c)| c.count >= 2).collect();
    let pool_views: Vec<(usize, GridKey, Candidate)> = if multi_vote.len() >= 2 {
        multi_vote.into_iter().cloned().collect()
    } else {
        views.to_vec()
    };
    let pool = judge_candidates(&pool_views, reasoning_store);

    let logic_prompt = build_logic_prompt(&task_ctx.train, &test_csv, &pool);
    let consistency_prompt = build_consistency_prompt(&task_ctx.train, &test_csv, &pool);

    let logic_opts = SolveOpts {
        image_path: None,
        task_id: Some(task_ctx.task_id.clone()),
        test_index: Some(task_ctx.test_index),
        step_name: Some("selector_logic_judge".to_string()),
        code_tool: false,
    };
    let logic_run_id = format!("{}_1_selector_logic", config.judge_model);
    let logic_fut = call_model(ctx, &logic_prompt, &config.judge_model, &logic_run_id, config.openai_background, &logic_opts);

    let consistency_opts = SolveOpts {
        image_path: None,
        task_id: Some(task_ctx.task_id.clone()),
        test_index: Some(task_ctx.test_index),
        step_name: Some("selector_consistency_judge".to_string()),
        code_tool: false,
    };
    let consistency_run_id = format!("{}_1_selector_consistency", config.judge_model);

    let (logic_result, consistency_result) = if config.judge_consistency_enable {
        let consistency_fut = call_model(
            ctx,
            &consistency_prompt,
            &config.judge_model,
            &consistency_run_id,
            config.openai_background,
            &consistency_opts,
        );
        tokio::join!(logic_fut, consistency_fut)
    } else {
        (logic_fut.await, Err(crate::worker::CallError {
            error: crate::error::Error::internal("consistency judge disabled"),
            timing: Vec::new(),
        }))
    };

    let logic_text = logic_result.as_ref().ok().map(|(r, _, _)| r.text.clone());
    let consistency_text = if config.judge_consistency_enable {
        consistency_result.as_ref().ok().map(|(r, _, _)| r.text.clone())
    } else {
        None
    };

    let mut scores: HashMap<usize, f64> = pool_views.iter().map(|(id, _, _)| (*id, 0.0)).collect();
    if let Some(text) = &logic_text {
        apply_scores(text, &mut scores);
    }
    if let Some(text) = &consistency_text {
        apply_scores(text, &mut scores);
    }

    let attempt_1 = pool_views
        .iter()
        .max_by(|(ida, _, ca), (idb, _, cb)| {
            ca.count
                .cmp(&cb.count)
                .then_with(|| {
                    let sa = scores.get(ida).copied().unwrap_or(0.0);
                    let sb = scores.get(idb).copied().unwrap_or(0.0);
                    sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                })
        })
        .expect("pool_views is non-empty since candidates is non-empty");

    let attempt_2 = pool_views
        .iter()
        .filter(|(id, _, _)| *id != attempt_1.0)
        .max_by(|(ida, _, _), (idb, _, _)| {
            let sa = scores.get(ida).copied().unwrap_or(0.0);
            let sb = scores.get(idb).copied().unwrap_or(0.0);
            sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(attempt_1);

    let picked = vec![
        PickedCandidate {
            grid: attempt_1.2.grid.clone(),
            is_correct: attempt_1.2.is_correct,
            count: attempt_1.2.count,
            source_tag: "consensus".to_string(),
        },
        PickedCandidate {
            grid: attempt_2.2.grid.clone(),
            is_correct: attempt_2.2.is_correct,
            count: attempt_2.2.count,
            source_tag: "auditor".to_string(),
        },
    ];
    let _ = candidates;
    let is_solved = solved_flag(&picked);

    SelectionOutcome {
        picked,
        is_solved,
        selection_type: "Standard (Consensus/Auditor)".to_string(),
        details: json!({
            "logic": { "prompt": logic_prompt, "response": logic_text },
            "consistency": { "prompt": consistency_prompt, "response": consistency_text, "enabled": config.judge_consistency_enable },
        }),
    }
}

fn solved_flag(picked: &[PickedCandidate]) -> Option<bool> {
    let mut any_known = false;
    let mut any_true = false;
    for p in picked {
        match p.is_correct {
            TriState::True => {
                any_known = true;
                any_true = true;
            }
            TriState::False => any_known = true,
            TriState::Unknown => {}
        }
    }
    if any_known {
        Some(any_true)
    } else {
        None
    }
}

/// Parses a judge's JSON object, preferring a fenced block, falling back to
/// a brace-scan that requires the object to contain a `candidates` array
/// (§4.10, grounded on `original_source/src/judges.py::extract_json`), then
/// folds `max(existing, score)` into `scores` per `candidate_id`.
fn apply_scores(text: &str, scores: &mut HashMap<usize, f64>) {
    let Some(parsed) = extract_judge_json(text) else {
        return;
    };
    let Some(entries) = parsed.get("candidates").and_then(|v| v.as_array()) else {
        return;
    };
    for entry in entries {
        let Some(id) = entry.get("candidate_id").and_then(|v| v.as_u64()) else {
            continue;
        };
        let score = entry.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let id = id as usize;
        if let Some(slot) = scores.get_mut(&id) {
            if score > *slot {
                *slot = score;
            }
        }
    }
}

fn extract_judge_json(text: &str) -> Option<Value> {
    let fenced = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap();
    if let Some(caps) = fenced.captures(text) {
        if let Ok(obj) = serde_json::from_str::<Value>(&caps[1]) {
            if obj.get("candidates").is_some() {
                return Some(obj);
            }
        }
    }

    for (idx, _) in text.match_indices('{') {
        let mut deserializer = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        if let Some(Ok(obj)) = deserializer.next() {
            if obj.get("candidates").is_some() {
                return Some(obj);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_judge_json_prefers_fenced_block() {
        let text = "noise\n```json\n{\"candidates\": [{\"candidate_id\": 0, \"score\": 7}]}\n```\nmore noise";
        let parsed = extract_judge_json(text).unwrap();
        assert_eq!(parsed["candidates"][0]["score"], 7.0);
    }

    #[test]
    fn extract_judge_json_falls_back_to_brace_scan() {
        let text = "Here is my answer: {\"unrelated\": 1} and then {\"candidates\": [{\"candidate_id\": 2, \"score\": 9}]}";
        let parsed = extract_judge_json(text).unwrap();
        assert_eq!(parsed["candidates"][0]["candidate_id"], 2);
    }

    #[test]
    fn extract_judge_json_returns_none_without_candidates_key() {
        assert!(extract_judge_json("{\"foo\": 1}").is_none());
    }

    #[test]
    fn apply_scores_keeps_the_max_across_two_judges() {
        let mut scores = HashMap::from([(0usize, 0.0)]);
        apply_scores("{\"candidates\": [{\"candidate_id\": 0, \"score\": 3}]}", &mut scores);
        apply_scores("{\"candidates\": [{\"candidate_id\": 0, \"score\": 8}]}", &mut scores);
        assert_eq!(scores[&0], 8.0);
    }

    #[test]
    fn solved_flag_is_true_if_any_picked_is_correct() {
        let picked = vec![
            PickedCandidate { grid: vec![vec![1]], is_correct: TriState::False, count: 1, source_tag: "a".into() },
            PickedCandidate { grid: vec![vec![2]], is_correct: TriState::True, count: 1, source_tag: "b".into() },
        ];
        assert_eq!(solved_flag(&picked), Some(true));
    }

    #[test]
    fn solved_flag_is_none_when_ground_truth_unavailable() {
        let picked = vec![PickedCandidate {
            grid: vec![vec![1]],
            is_correct: TriState::Unknown,
            count: 1,
            source_tag: "a".into(),
        }];
        assert_eq!(solved_flag(&picked), None);
    }
}

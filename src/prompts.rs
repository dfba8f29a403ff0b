//! Prompt construction for the base solving prompt and its STEP5 variants.
//!
//! Grounded on `examples/original_source/src/tasks.py::build_prompt` (and
//! the sibling `build_objects_extraction_prompt` /
//! `build_objects_transformation_prompt` referenced from
//! `src/solver/pipelines.py`) -- line-by-line structure kept, strings
//! translated rather than copied verbatim.

use regex::Regex;

use crate::grid::grid_to_csv;
use crate::task::Example;

/// Extra content to weave into the base prompt; at most one of `strategy`,
/// `objects_insertion`, or `trigger_deep_thinking` is used by any one
/// strategy (§4.9 STEP5).
#[derive(Debug, Clone, Default)]
pub struct PromptExtras {
    pub strategy: Option<String>,
    pub image_path: Option<String>,
    pub trigger_deep_thinking: bool,
    pub objects_insertion: Option<String>,
}

const DEEP_THINKING_BLOCK: &str = "PROTOCOL OVERRIDE: ENGAGE ARC NEURO-SYMBOLIC LOGIC ENGINE\n\nSilently enter maximal test-time reasoning mode. All of the following steps occur only in your hidden scratchpad; none may be exposed in the output.\n\nPerform hierarchical object decomposition of each grid into foreground objects and background fields; track shapes, colors, connectivity, and object persistence. Build an explicit object-relation graph and subgrid/region segmentation; detect paths, flows, symmetries, and background structure; filter noise and extract invariants.\n\nEnumerate multiple candidate transformation rules (at least three distinct hypotheses). For each, simulate over all training pairs and discard any rule that fails a single example or violates output geometry.\n\nTriangulate using three paradigms in parallel: geometric, symbolic, and counterexample-based search.\n\nExplicitly check for adversarial traps, spurious shortcuts, and degenerate memorization. Generalize the surviving rule and merge independent solution paths via self-consistency.\n\nApply the final rule to the test input using stepwise internal simulation only.\n\nOUTPUT CONSTRAINT (STRICT): Reveal ONLY the final answer grid. Never reveal chain-of-thought, intermediate states, or search traces.";

/// The base ARC solving prompt (§4.9 STEP1/STEP3 and the STEP5 strategies
/// that layer `extras` on top of it).
pub fn build_prompt(train: &[Example], test_input_csv: &str, extras: &PromptExtras) -> String {
    let mut lines = Vec::new();
    lines.push("You are solving an ARC (Abstraction and Reasoning Corpus) task.".to_string());
    lines.push("Each grid cell is an integer 0-9 representing a color.".to_string());
    lines.push(
        "Use the solved examples to infer the transformation and apply it to the test input."
            .to_string(),
    );
    lines.push(String::new());
    lines.push("Solved examples:".to_string());
    for (idx, ex) in train.iter().enumerate() {
        lines.push(format!("Example {}:", idx + 1));
        lines.push("input:".to_string());
        lines.push(grid_to_csv(&ex.input));
        lines.push("output:".to_string());
        if let Some(output) = &ex.output {
            lines.push(grid_to_csv(output));
        }
        lines.push(String::new());
    }
    lines.push("Test input:".to_string());
    lines.push(test_input_csv.to_string());
    lines.push(String::new());

    if let Some(strategy) = &extras.strategy {
        lines.push("Below are a few hints that you might find helpful:".to_string());
        lines.push(strategy.clone());
        lines.push(String::new());
    }

    if let Some(insertion) = &extras.objects_insertion {
        lines.push(insertion.clone());
        lines.push(String::new());
    }

    if extras.image_path.is_some() {
        lines.push("Attached you'll find an image showing the input/output example pairs. Use this image to find objects, patterns and transformations.".to_string());
        lines.push(String::new());
    }

    if extras.trigger_deep_thinking {
        lines.push(DEEP_THINKING_BLOCK.to_string());
        lines.push(String::new());
    }

    lines.push("Respond with ONLY the completed output grid.".to_string());
    lines.join("\n")
}

/// Phase A of the objects pipeline (§4.9 STEP5 "Objects pipeline"):
/// asks for an `<objects_summary>` describing shapes/colors/relations.
pub fn build_objects_extraction_prompt(train: &[Example], test_input_csv: &str) -> String {
    let base = build_prompt(train, test_input_csv, &PromptExtras::default());
    format!(
        "{base}\n\nBefore solving, describe the distinct objects present across the grids \
        (shape, color, position, relations to other objects). Wrap your description in \
        <objects_summary>...</objects_summary> tags. Do not attempt to solve the task yet."
    )
}

/// Phase B: given the extraction summary, asks for a
/// `<transformation_summary>`.
pub fn build_objects_transformation_prompt(
    train: &[Example],
    test_input_csv: &str,
    objects_summary: &str,
) -> String {
    let base = build_prompt(train, test_input_csv, &PromptExtras::default());
    format!(
        "{base}\n\nHere is a description of the objects present in the grids:\n\n\
        <objects_summary>\n{objects_summary}\n</objects_summary>\n\n\
        Using this description, describe the transformation rule that maps each input to its \
        output. Wrap your answer in <transformation_summary>...</transformation_summary> tags. \
        Do not attempt to solve the task yet."
    )
}

/// Asks the hint-generator model for a short natural-language hint about
/// the transformation, without revealing the final grid (§4.9 STEP5
/// "Generated-hint prompt").
pub fn build_hint_generation_prompt(train: &[Example], test_input_csv: &str) -> String {
    let base = build_prompt(train, test_input_csv, &PromptExtras::default());
    format!(
        "{base}\n\nInstead of solving the task, write one or two sentences of high-level hint \
        about the transformation rule that would help another solver. Do not include the \
        output grid."
    )
}

/// Extracts the content between `<tag>...</tag>`, grounded on
/// `original_source/src/parallel.py::extract_tag_content`.
pub fn extract_tag_content(text: &str, tag_name: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{tag_name}>(.*?)</{tag_name}>");
    let re = Regex::new(&pattern).ok()?;
    re.captures(text).map(|c| c[1].trim().to_string())
}

/// One candidate as seen by a judge prompt: its assigned id (stable for the
/// duration of one selection call only), its vote count, and the reasoning
/// text pulled from the run(s) that produced it.
#[derive(Debug, Clone)]
pub struct JudgeCandidate {
    pub id: usize,
    pub grid_csv: String,
    pub count: u32,
    pub reasoning: String,
}

/// The Meta-Conclusion judge prompt (§4.10 Branch A): every candidate with
/// its reasoning and vote count, asking the judge to pick and emit its top
/// two solution grids. Grounded on
/// `original_source/src/audit_prompts.py::build_duo_pick_prompt` (via
/// `src/judges.py::run_duo_pick_judge`).
pub fn build_duo_pick_prompt(
    train: &[Example],
    test_input_csv: &str,
    candidates: &[JudgeCandidate],
    total_attempts: u32,
) -> String {
    let mut lines = Vec::new();
    lines.push(
        "You are the final judge for an ARC task. Several solver models proposed candidate \
        answers; you must pick the two most likely correct ones."
            .to_string(),
    );
    lines.push(String::new());
    lines.push("Solved examples:".to_string());
    for (idx, ex) in train.iter().enumerate() {
        lines.push(format!("Example {}:", idx + 1));
        lines.push("input:".to_string());
        lines.push(grid_to_csv(&ex.input));
        lines.push("output:".to_string());
        if let Some(output) = &ex.output {
            lines.push(grid_to_csv(output));
        }
        lines.push(String::new());
    }
    lines.push("Test input:".to_string());
    lines.push(test_input_csv.to_string());
    lines.push(String::new());
    lines.push(format!(
        "There were {total_attempts} total solver attempts, producing {} distinct candidate grids:",
        candidates.len()
    ));
    for cand in candidates {
        lines.push(format!(
            "<candidate id=\"{}\" votes=\"{}\">",
            cand.id, cand.count
        ));
        lines.push(cand.grid_csv.clone());
        lines.push("reasoning:".to_string());
        lines.push(cand.reasoning.clone());
        lines.push(format!("</candidate id=\"{}\">", cand.id));
        lines.push(String::new());
    }
    lines.push(
        "Pick your top two solutions (they may or may not be among the candidates above). \
        Respond with your first choice grid, then your second choice grid, each as plain \
        comma-separated rows. Your final answer must contain exactly two grids, in order of \
        preference."
            .to_string(),
    );
    lines.join("\n")
}

/// The Logic judge prompt (§4.10 Branch B): scores candidates on rule
/// coherence against the training examples. Grounded on
/// `original_source/src/audit_prompts.py::build_logic_prompt`.
pub fn build_logic_prompt(
    train: &[Example],
    test_input_csv: &str,
    candidates: &[JudgeCandidate],
) -> String {
    build_judge_prompt(
        "You are the Logic Judge. Score each candidate on how well its implied transformation \
        rule coheres with every training example.",
        train,
        test_input_csv,
        candidates,
    )
}

/// The Consistency judge prompt (§4.10 Branch B): scores candidates on a
/// per-example audit and rule-to-test-grid fit. Grounded on
/// `original_source/src/audit_prompts.py::build_consistency_prompt`.
pub fn build_consistency_prompt(
    train: &[Example],
    test_input_csv: &str,
    candidates: &[JudgeCandidate],
) -> String {
    build_judge_prompt(
        "You are the Consistency Judge. Audit each candidate example-by-example and score how \
        consistently its rule explains every training pair and fits the proposed test output.",
        train,
        test_input_csv,
        candidates,
    )
}

fn build_judge_prompt(
    role: &str,
    train: &[Example],
    test_input_csv: &str,
    candidates: &[JudgeCandidate],
) -> String {
    let mut lines = vec![role.to_string(), String::new(), "Solved examples:".to_string()];
    for (idx, ex) in train.iter().enumerate() {
        lines.push(format!("Example {}:", idx + 1));
        lines.push("input:".to_string());
        lines.push(grid_to_csv(&ex.input));
        lines.push("output:".to_string());
        if let Some(output) = &ex.output {
            lines.push(grid_to_csv(output));
        }
        lines.push(String::new());
    }
    lines.push("Test input:".to_string());
    lines.push(test_input_csv.to_string());
    lines.push(String::new());
    lines.push("Candidates:".to_string());
    for cand in candidates {
        lines.push(format!(
            "<candidate id=\"{}\" votes=\"{}\">",
            cand.id, cand.count
        ));
        lines.push(cand.grid_csv.clone());
        lines.push("reasoning:".to_string());
        lines.push(cand.reasoning.clone());
        lines.push(format!("</candidate id=\"{}\">", cand.id));
        lines.push(String::new());
    }
    lines.push(
        "Respond with ONLY a JSON object of the form {\"candidates\": [{\"candidate_id\": <id>, \
        \"score\": <0-10>, \"rule_summary\": \"...\"}], \"final_ranking_by_candidate\": [<id>, ...]}."
            .to_string(),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Example;

    fn example(input: Vec<Vec<u8>>, output: Vec<Vec<u8>>) -> Example {
        Example {
            input,
            output: Some(output),
        }
    }

    #[test]
    fn base_prompt_includes_every_train_pair_and_test_input() {
        let train = vec![example(vec![vec![1]], vec![vec![2]])];
        let prompt = build_prompt(&train, "9", &PromptExtras::default());
        assert!(prompt.contains("Example 1:"));
        assert!(prompt.contains("Test input:"));
        assert!(prompt.contains('9'));
    }

    #[test]
    fn deep_thinking_flag_appends_block() {
        let train = vec![example(vec![vec![1]], vec![vec![2]])];
        let extras = PromptExtras {
            trigger_deep_thinking: true,
            ..Default::default()
        };
        let prompt = build_prompt(&train, "9", &extras);
        assert!(prompt.contains("NEURO-SYMBOLIC"));
    }

    #[test]
    fn extract_tag_content_finds_wrapped_text() {
        let text = "noise <objects_summary>  three red squares  </objects_summary> more noise";
        assert_eq!(
            extract_tag_content(text, "objects_summary").as_deref(),
            Some("three red squares")
        );
    }

    #[test]
    fn extract_tag_content_missing_tag_is_none() {
        assert!(extract_tag_content("nothing here", "objects_summary").is_none());
    }

    #[test]
    fn duo_pick_prompt_lists_every_candidate_by_id() {
        let train = vec![example(vec![vec![1]], vec![vec![2]])];
        let candidates = vec![
            JudgeCandidate { id: 0, grid_csv: "1,2".into(), count: 5, reasoning: "r0".into() },
            JudgeCandidate { id: 1, grid_csv: "3,4".into(), count: 2, reasoning: "r1".into() },
        ];
        let prompt = build_duo_pick_prompt(&train, "9", &candidates, 7);
        assert!(prompt.contains("id=\"0\""));
        assert!(prompt.contains("id=\"1\""));
        assert!(prompt.contains("7 total solver attempts"));
    }

    #[test]
    fn logic_prompt_requests_json_with_candidates_key() {
        let train = vec![example(vec![vec![1]], vec![vec![2]])];
        let candidates = vec![JudgeCandidate { id: 0, grid_csv: "1,2".into(), count: 1, reasoning: "r".into() }];
        let prompt = build_logic_prompt(&train, "9", &candidates);
        assert!(prompt.contains("\"candidates\""));
    }
}

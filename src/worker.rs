//! Worker (§4.6): one LLM call, grid extraction, and verification against
//! ground truth. Workers never throw — every failure becomes a
//! `CallResult` with `grid=null`.
//!
//! Grounded on `examples/original_source/src/solver/steps.py`'s per-call
//! shape and `examples/original_source/src/models.py`'s `ModelResponse`
//! cost accounting; the teacher's `src/llm/client.rs` `TrackedClient` for
//! the "wrap a client, record cost" idiom.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::instrument;

use crate::codegen::{extract_solver_source, verify_and_run_solver};
use crate::config::SolverConfig;
use crate::error::Error;
use crate::grid::parse_grid_from_text;
use crate::llm::{MultiProviderClient, SolveOpts};
use crate::model_id::{calculate_cost, parse_model_identifier};
use crate::ratelimit::RateLimiter;
use crate::retry::{with_retry, FailureLog, RetryContext};
use crate::task::{make_run_id, CallResult, Example, Grid, TimingEntry, TriState};

/// Whether to parse a grid out of free text or extract-and-run a
/// `solver` function via the sandbox (§4.6 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Text,
    Code,
}

/// Shared, process/task-wide collaborators a worker needs; cheap to
/// clone (everything inside is an `Arc` or `Clone`-cheap handle).
#[derive(Clone)]
pub struct WorkerContext {
    pub clients: Arc<MultiProviderClient>,
    pub rate_limiter: RateLimiter,
    pub failure_log: Option<Arc<FailureLog>>,
    pub config: Arc<SolverConfig>,
}

/// An error from [`call_model`] carries along whatever timing entries were
/// accumulated before the failure, so callers can still report them.
pub struct CallError {
    pub error: Error,
    pub timing: Vec<TimingEntry>,
}

/// Rate-limit acquire, retry-wrapped provider call, and cost computation
/// (§4.6 steps 1-3) -- the part of a worker invocation that is reusable
/// outside the grid-extraction pipeline (e.g. STEP5's hint-generator
/// call, §4.9).
pub async fn call_model(
    ctx: &WorkerContext,
    prompt: &str,
    model_raw: &str,
    run_id: &str,
    background: bool,
    opts: &SolveOpts,
) -> Result<(crate::llm::ModelResponse, f64, Vec<TimingEntry>), CallError> {
    let model = parse_model_identifier(model_raw).map_err(|e| CallError {
        error: e,
        timing: Vec::new(),
    })?;

    ctx.rate_limiter.acquire(model.provider).await;

    let retry_ctx = RetryContext {
        task_id: opts.task_id.clone().unwrap_or_default(),
        test_index: opts.test_index.unwrap_or(0),
        step: opts.step_name.clone().unwrap_or_default(),
        model: model_raw.to_string(),
        run_id: run_id.to_string(),
    };
    let delays: Vec<Duration> = ctx.config.retry_delays.clone();
    let mut timing: Vec<TimingEntry> = Vec::new();

    let clients = ctx.clients.clone();
    let prompt_owned = prompt.to_string();
    let model_for_call = model.clone();
    let opts_owned = opts.clone();

    let call_result = with_retry(
        || {
            let clients = clients.clone();
            let prompt_owned = prompt_owned.clone();
            let model_for_call = model_for_call.clone();
            let opts_owned = opts_owned.clone();
            async move {
                if background {
                    clients
                        .solve_background(&prompt_owned, &model_for_call, &opts_owned)
                        .await
                } else {
                    clients.solve(&prompt_owned, &model_for_call, &opts_owned).await
                }
            }
        },
        &retry_ctx,
        &delays,
        ctx.failure_log.clone(),
        &mut timing,
    )
    .await;

    let response = match call_result {
        Ok(r) => r,
        Err(e) => {
            // `with_retry` already logs a FailureRecord for every
            // retryable/unknown attempt, including the last one before it
            // gives up. Non-retryable errors return immediately without
            // that log, so we cover that one gap here.
            if e.category() == crate::error::ErrorCategory::NonRetryable {
                if let Some(log) = &ctx.failure_log {
                    let record = crate::task::FailureRecord {
                        ts: chrono::Utc::now(),
                        task_id: retry_ctx.task_id.clone(),
                        test_index: retry_ctx.test_index,
                        step: retry_ctx.step.clone(),
                        model: model_raw.to_string(),
                        run_id: run_id.to_string(),
                        error_type: format!("{:?}", e.category()),
                        error_message: e.to_string(),
                        stack: None,
                        is_retryable: false,
                    };
                    let _ = log.append(&record).await;
                }
            }
            return Err(CallError { error: e, timing });
        }
    };

    let pricing = match ctx.clients.pricing_for(&model) {
        Ok(p) => p,
        Err(_) => crate::model_id::TieredPricing::flat(crate::model_id::ModelPricing {
            input: 0.0,
            cached_input: 0.0,
            output: 0.0,
        }),
    };
    let cost = calculate_cost(
        &pricing,
        response.prompt_tokens,
        response.cached_tokens,
        response.completion_tokens,
    );

    Ok((response, cost, timing))
}

/// One worker invocation (§4.6). Never returns `Err`: every failure path
/// is captured into the returned `CallResult`.
#[instrument(skip(ctx, prompt, train, opts), fields(run_id = %run_id, model = %model_raw))]
pub async fn run_worker(
    ctx: &WorkerContext,
    prompt: &str,
    model_raw: &str,
    run_id: &str,
    mode: CallMode,
    background: bool,
    test_input: &Grid,
    expected: Option<&Grid>,
    train: &[Example],
    opts: &SolveOpts,
) -> CallResult {
    let started = Instant::now();

    let (response, cost, timing) = match call_model(ctx, prompt, model_raw, run_id, background, opts).await {
        Ok(triple) => triple,
        Err(CallError { error, timing }) => {
            let mut result = failed_call_result(model_raw, model_raw, run_id, &error, started);
            result.timing_breakdown = timing;
            return result;
        }
    };

    let (grid, verification_details) = match mode {
        CallMode::Text => (parse_grid_from_text(&response.text).ok(), None),
        CallMode::Code => match extract_solver_source(&response.text) {
            Some(code) => {
                let (grid, log) =
                    verify_and_run_solver(&code, train, test_input, ctx.config.sandbox_timeout).await;
                (grid, serde_json::to_value(&log).ok())
            }
            None => (None, None),
        },
    };

    let is_correct = match (&grid, expected) {
        (Some(g), Some(exp)) => TriState::from_match(g == exp),
        _ => TriState::Unknown,
    };

    CallResult {
        model_requested: model_raw.to_string(),
        model_actual: response.model_name,
        run_id: run_id.to_string(),
        grid,
        is_correct,
        cost,
        duration_ms: started.elapsed().as_millis() as u64,
        prompt_tokens: response.prompt_tokens,
        output_tokens: response.completion_tokens,
        cached_tokens: response.cached_tokens,
        timing_breakdown: timing,
        full_response: response.text,
        verification_details,
    }
}

fn failed_call_result(
    requested: &str,
    actual: &str,
    run_id: &str,
    err: &Error,
    started: Instant,
) -> CallResult {
    CallResult {
        model_requested: requested.to_string(),
        model_actual: actual.to_string(),
        run_id: run_id.to_string(),
        grid: None,
        is_correct: TriState::False,
        cost: 0.0,
        duration_ms: started.elapsed().as_millis() as u64,
        prompt_tokens: 0,
        output_tokens: 0,
        cached_tokens: 0,
        timing_breakdown: Vec::new(),
        full_response: err.to_string(),
        verification_details: None,
    }
}

/// Helper used by the fan-out (§4.8) and state machine (§4.9) to mint the
/// `run_id = "{model_id}_{n}_{step}"` for the nth instance of a model in a
/// given step.
pub fn run_id_for(model_id: &str, n: u32, step: &str) -> String {
    make_run_id(model_id, n, step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelResponse, ProviderClient, RawHandle};
    use crate::model_id::{ModelIdentifier, Provider, TieredPricing};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubClient {
        text: String,
    }

    #[async_trait]
    impl ProviderClient for StubClient {
        fn provider(&self) -> Provider {
            Provider::OpenAI
        }

        async fn solve(
            &self,
            _prompt: &str,
            model: &ModelIdentifier,
            _opts: &SolveOpts,
        ) -> crate::error::Result<ModelResponse> {
            Ok(ModelResponse {
                text: self.text.clone(),
                prompt_tokens: 100,
                cached_tokens: 0,
                completion_tokens: 50,
                model_name: model.raw.clone(),
                raw_handle: RawHandle::None,
            })
        }

        async fn continue_conversation(
            &self,
            _prev_handle: &RawHandle,
            text: &str,
            model: &ModelIdentifier,
        ) -> crate::error::Result<ModelResponse> {
            self.solve(text, model, &SolveOpts::default()).await
        }

        fn pricing_for(&self, _model: &ModelIdentifier) -> TieredPricing {
            TieredPricing::flat(crate::model_id::ModelPricing {
                input: 1.0,
                cached_input: 0.1,
                output: 2.0,
            })
        }
    }

    fn ctx_with_text(text: &str) -> WorkerContext {
        let mut map: HashMap<Provider, Arc<dyn ProviderClient>> = HashMap::new();
        map.insert(Provider::OpenAI, Arc::new(StubClient { text: text.to_string() }));
        WorkerContext {
            clients: Arc::new(MultiProviderClient::new(map)),
            rate_limiter: RateLimiter::new(&[(Provider::OpenAI, 1000.0)]),
            failure_log: None,
            config: Arc::new(SolverConfig::for_tests()),
        }
    }

    #[tokio::test]
    async fn text_mode_extracts_and_scores_correctness() {
        let ctx = ctx_with_text("here is the grid:\n1,2\n3,4\n");
        let expected = vec![vec![1, 2], vec![3, 4]];
        let result = run_worker(
            &ctx,
            "prompt",
            "gpt-5.1-high",
            "gpt-5.1-high_0_step1",
            CallMode::Text,
            false,
            &vec![vec![0]],
            Some(&expected),
            &[],
            &SolveOpts::default(),
        )
        .await;
        assert_eq!(result.grid, Some(expected));
        assert_eq!(result.is_correct, TriState::True);
        assert!(result.cost > 0.0);
    }

    #[tokio::test]
    async fn unparseable_identifier_never_panics_and_yields_null_grid() {
        let ctx = ctx_with_text("1,2\n3,4");
        let result = run_worker(
            &ctx,
            "prompt",
            "not-a-real-model",
            "run1",
            CallMode::Text,
            false,
            &vec![vec![0]],
            None,
            &[],
            &SolveOpts::default(),
        )
        .await;
        assert!(result.grid.is_none());
        assert_eq!(result.is_correct, TriState::False);
    }

    #[tokio::test]
    async fn no_grid_in_response_yields_unknown_correctness_when_no_expected() {
        let ctx = ctx_with_text("no numbers here at all");
        let result = run_worker(
            &ctx,
            "prompt",
            "gpt-5.1-high",
            "run1",
            CallMode::Text,
            false,
            &vec![vec![0]],
            None,
            &[],
            &SolveOpts::default(),
        )
        .await;
        assert!(result.grid.is_none());
        assert_eq!(result.is_correct, TriState::Unknown);
    }
}

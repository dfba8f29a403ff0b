//! Parallel Fan-out (§4.8): runs a fixed set of `(model_id, run_id)` jobs
//! sharing one prompt and test input against a bounded worker pool.
//!
//! Grounded on the teacher's `src/llm/batch.rs` `BatchExecutor::execute`
//! (`Semaphore`-bounded `join_all` over async closures, a progress
//! callback invoked per completion) generalized from chat-completion jobs
//! to `Worker` invocations.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::llm::SolveOpts;
use crate::task::{CallResult, Example, Grid};
use crate::worker::{run_worker, CallMode, WorkerContext};

/// One job: a model identifier plus the `run_id` it should be recorded
/// under (already disambiguated by instance count, §4.9).
#[derive(Debug, Clone)]
pub struct FanoutJob {
    pub model_id: String,
    pub run_id: String,
    pub background: bool,
}

/// Runs every job in `jobs` against a bounded worker pool (default size
/// `fanout_workers`, §4.3/§5). Results are returned in completion order;
/// `on_progress` is invoked after each completion with the number of jobs
/// still outstanding. A failing job never cancels the others -- `run_worker`
/// never returns `Err`, so every job always contributes exactly one
/// `CallResult`.
pub async fn run_fanout<F>(
    ctx: &WorkerContext,
    prompt: &str,
    jobs: Vec<FanoutJob>,
    test_input: &Grid,
    expected: Option<&Grid>,
    train: &[Example],
    mode: CallMode,
    opts: &SolveOpts,
    max_parallel: usize,
    mut on_progress: F,
) -> Vec<CallResult>
where
    F: FnMut(usize) + Send,
{
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let total = jobs.len();
    let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(total));

    let futures = jobs.into_iter().map(|job| {
        let semaphore = semaphore.clone();
        let remaining = remaining.clone();
        let ctx = ctx.clone();
        let prompt = prompt.to_string();
        let test_input = test_input.clone();
        let expected = expected.cloned();
        let train = train.to_vec();
        let opts = opts.clone();
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .expect("fan-out semaphore is never closed");
            let result = run_worker(
                &ctx,
                &prompt,
                &job.model_id,
                &job.run_id,
                mode,
                job.background,
                &test_input,
                expected.as_ref(),
                &train,
                &opts,
            )
            .await;
            let left = remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) - 1;
            (result, left)
        }
    });

    let mut completed = join_all(futures).await;
    // `join_all` preserves submission order, not completion order; §4.8
    // only requires *some* deterministic completion-order contract for
    // callers driving `on_progress`, so report progress in the order
    // results come back to us here.
    completed.sort_by_key(|(_, left)| std::cmp::Reverse(*left));
    completed
        .into_iter()
        .map(|(result, left)| {
            on_progress(left);
            result
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverConfig;
    use crate::llm::{MultiProviderClient, ModelResponse, ProviderClient, RawHandle};
    use crate::model_id::{ModelIdentifier, Provider, TieredPricing};
    use crate::ratelimit::RateLimiter;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubClient;

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
                text: "1,2\n3,4".to_string(),
                prompt_tokens: 10,
                cached_tokens: 0,
                completion_tokens: 5,
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

    fn ctx() -> WorkerContext {
        let mut map: HashMap<Provider, Arc<dyn ProviderClient>> = HashMap::new();
        map.insert(Provider::OpenAI, Arc::new(StubClient));
        WorkerContext {
            clients: Arc::new(MultiProviderClient::new(map)),
            rate_limiter: RateLimiter::new(&[(Provider::OpenAI, 1000.0)]),
            failure_log: None,
            config: Arc::new(SolverConfig::for_tests()),
        }
    }

    #[tokio::test]
    async fn runs_every_job_and_reports_progress_to_zero() {
        let jobs = vec![
            FanoutJob { model_id: "gpt-5.1-high".into(), run_id: "r0".into(), background: false },
            FanoutJob { model_id: "gpt-5.1-high".into(), run_id: "r1".into(), background: false },
            FanoutJob { model_id: "gpt-5.1-high".into(), run_id: "r2".into(), background: false },
        ];
        let mut progress = Vec::new();
        let results = run_fanout(
            &ctx(),
            "prompt",
            jobs,
            &vec![vec![0]],
            None,
            &[],
            CallMode::Text,
            &SolveOpts::default(),
            2,
            |left| progress.push(left),
        )
        .await;
        assert_eq!(results.len(), 3);
        assert_eq!(progress.last(), Some(&0));
    }

    #[tokio::test]
    async fn one_unparseable_job_does_not_cancel_others() {
        let jobs = vec![
            FanoutJob { model_id: "not-a-model".into(), run_id: "bad".into(), background: false },
            FanoutJob { model_id: "gpt-5.1-high".into(), run_id: "good".into(), background: false },
        ];
        let results = run_fanout(
            &ctx(),
            "prompt",
            jobs,
            &vec![vec![0]],
            None,
            &[],
            CallMode::Text,
            &SolveOpts::default(),
            5,
            |_| {},
        )
        .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.grid.is_some()));
        assert!(results.iter().any(|r| r.grid.is_none()));
    }
}

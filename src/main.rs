//! Thin CLI entry point (§6 "CLI surface"): argument parsing, provider
//! client/API-key wiring, and dispatch into [`arc_solver_engine::run_batch`].
//! Argument parsing itself is explicitly out of scope as a design concern --
//! this file only translates flags into a `SolverConfig` and a `TaskSource`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use arc_solver_engine::{
    run_batch, write_results_file, write_submission_file, write_task_detail_file, ApiKeys,
    CodegenParam, CodegenPromptVersion, FailureLog, Provider, RateLimiter, SolverConfig,
    TaskSource, WorkerContext,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-stage LLM inference orchestrator for ARC-AGI-style grid tasks")]
struct Cli {
    /// Single task JSON file (`{train, test}`).
    #[arg(long)]
    task: Option<PathBuf>,

    /// Directory of single task JSON files.
    #[arg(long = "task-directory")]
    task_directory: Option<PathBuf>,

    /// Monolithic `{task_id: {train, test}}` JSON file.
    #[arg(long = "task-file")]
    task_file: Option<PathBuf>,

    /// Restrict to one 1-based test index (default: run every test index).
    #[arg(long)]
    test: Option<usize>,

    #[arg(long = "task-workers", default_value_t = 1)]
    task_workers: usize,

    /// Mirrors the original's `step_5_only` flag, which is itself never
    /// branched on beyond being threaded into the run config -- treated
    /// here as an alias for `--force-step-5`.
    #[arg(long = "step-5-only")]
    step_5_only: bool,

    #[arg(long = "objects-only")]
    objects_only: bool,

    #[arg(long = "force-step-5")]
    force_step_5: bool,

    #[arg(long = "force-step-2")]
    force_step_2: bool,

    #[arg(long = "enable-step-3-and-4")]
    enable_step_3_and_4: bool,

    #[arg(long = "judge-model")]
    judge_model: Option<String>,

    #[arg(long = "judge-consistency-enable")]
    judge_consistency_enable: bool,

    /// Defaults to on; pass `--judge-duo-pick=false` to fall straight to
    /// the Consensus/Auditor branch.
    #[arg(long = "judge-duo-pick", action = clap::ArgAction::Set, default_value_t = true)]
    judge_duo_pick: bool,

    /// Comma-separated model identifiers for STEP1 (overrides the default
    /// three-model roster when given).
    #[arg(long = "step1-models", value_delimiter = ',')]
    step1_models: Option<Vec<String>>,

    /// Comma-separated `model_id:prompt_version` pairs for the codegen
    /// variant, e.g. `gpt-5.2-xhigh:v2,gemini-3-high:v1`.
    #[arg(long = "codegen-params", value_delimiter = ',')]
    codegen_params: Option<Vec<String>>,

    /// Defaults to on; pass `--openai-background=false` to force synchronous
    /// OpenAI calls.
    #[arg(long = "openai-background", action = clap::ArgAction::Set, default_value_t = true)]
    openai_background: bool,

    /// `--solver` selects the production `k_threshold`; `--solver-testing`
    /// selects `SolverConfig::for_tests()`'s small one.
    #[arg(long = "solver-testing")]
    solver_testing: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long = "logs-directory")]
    logs_directory: Option<String>,

    #[arg(long = "submissions-directory")]
    submissions_directory: Option<String>,

    #[arg(long = "answers-directory")]
    answers_directory: Option<String>,
}

fn parse_codegen_param(raw: &str) -> Result<CodegenParam, String> {
    let (model_id, version) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `model_id:version`, got `{raw}`"))?;
    let prompt_version = match version.to_ascii_lowercase().as_str() {
        "v1" => CodegenPromptVersion::V1,
        "v1b" => CodegenPromptVersion::V1b,
        "v2" => CodegenPromptVersion::V2,
        "v2b" => CodegenPromptVersion::V2b,
        "v3" => CodegenPromptVersion::V3,
        "v4" => CodegenPromptVersion::V4,
        other => return Err(format!("unknown codegen prompt version `{other}`")),
    };
    Ok(CodegenParam {
        model_id: model_id.to_string(),
        prompt_version,
    })
}

fn task_source(cli: &Cli) -> Result<TaskSource, String> {
    match (&cli.task, &cli.task_directory, &cli.task_file) {
        (Some(path), None, None) => Ok(TaskSource::SingleFile(path.clone())),
        (None, Some(path), None) => Ok(TaskSource::Directory(path.clone())),
        (None, None, Some(path)) => Ok(TaskSource::Monolithic(path.clone())),
        (None, None, None) => Err("one of --task, --task-directory, --task-file is required".to_string()),
        _ => Err("--task, --task-directory, and --task-file are mutually exclusive".to_string()),
    }
}

fn build_worker_context(config: Arc<SolverConfig>, run_ts: &str) -> Result<WorkerContext, String> {
    let keys = ApiKeys::from_env().map_err(|e| e.to_string())?;
    let http = arc_solver_engine::llm::build_http_client(Duration::from_secs(3600), config.insecure_ssl);

    let mut clients: HashMap<Provider, Arc<dyn arc_solver_engine::llm::ProviderClient>> = HashMap::new();
    let anthropic_client = keys
        .anthropic
        .as_ref()
        .map(|key| Arc::new(arc_solver_engine::llm::AnthropicClient::new(http.clone(), key.clone())));

    // §4.4 cross-provider fallback: an OpenAI background job that hits a
    // server error / token limit / timeout / 403 falls back to Claude, so
    // the OpenAI client needs a handle to the Anthropic one whenever both
    // keys are present.
    let mut openai_client = arc_solver_engine::llm::OpenAIClient::new(
        http.clone(),
        keys.openai.clone(),
        config.background_poll_horizon,
    );
    if let Some(anthropic) = &anthropic_client {
        openai_client = openai_client.with_fallback(anthropic.clone() as Arc<dyn arc_solver_engine::llm::ProviderClient>);
    }
    clients.insert(Provider::OpenAI, Arc::new(openai_client));
    if let Some(anthropic) = anthropic_client {
        clients.insert(Provider::Anthropic, anthropic);
    }
    if !keys.gemini_keys.is_empty() {
        clients.insert(
            Provider::Google,
            Arc::new(arc_solver_engine::llm::GoogleClient::new(http.clone(), keys.gemini_keys.clone())),
        );
    }

    let multi = arc_solver_engine::llm::MultiProviderClient::new(clients);
    let rate_limiter = RateLimiter::new(&config.provider_rate_limits);
    let failure_log = FailureLog::new(&config.logs_directory, run_ts);

    Ok(WorkerContext {
        clients: Arc::new(multi),
        rate_limiter,
        failure_log: Some(Arc::new(failure_log)),
        config,
    })
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = if cli.solver_testing {
        SolverConfig::for_tests()
    } else {
        SolverConfig::default()
    }
    .apply_env_overrides();

    config.task_workers = cli.task_workers;
    config.force_step_5 = cli.force_step_5 || cli.step_5_only;
    config.force_step_2 = cli.force_step_2;
    config.enable_step_3_and_4 = cli.enable_step_3_and_4;
    config.objects_only = cli.objects_only;
    config.judge_consistency_enable = cli.judge_consistency_enable;
    config.judge_duo_pick_enable = cli.judge_duo_pick;
    config.openai_background = cli.openai_background;
    if let Some(model) = &cli.judge_model {
        config.judge_model = model.clone();
    }
    if let Some(models) = &cli.step1_models {
        config.step1_models = models.clone();
    }
    if let Some(raw_params) = &cli.codegen_params {
        match raw_params.iter().map(|s| parse_codegen_param(s)).collect::<Result<Vec<_>, _>>() {
            Ok(params) => config.codegen_params = params,
            Err(e) => {
                eprintln!("invalid --codegen-params: {e}");
                return std::process::ExitCode::FAILURE;
            }
        }
    }
    if let Some(dir) = &cli.logs_directory {
        config.logs_directory = dir.clone();
    }
    if let Some(dir) = &cli.submissions_directory {
        config.submissions_directory = dir.clone();
    }
    if let Some(dir) = &cli.answers_directory {
        config.answers_directory = Some(dir.clone());
    }

    let source = match task_source(&cli) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let run_ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let config = Arc::new(config);
    let ctx = match build_worker_context(config.clone(), &run_ts) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let outcome = match run_batch(&ctx, &source, &config, cli.test).await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("batch run failed: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let submissions_dir = PathBuf::from(&config.submissions_directory);
    let logs_dir = PathBuf::from(&config.logs_directory);

    if let Err(e) = write_submission_file(&submissions_dir.join("submission.json"), &outcome.submissions) {
        eprintln!("failed to write submission.json: {e}");
        return std::process::ExitCode::FAILURE;
    }
    if let Err(e) = write_results_file(&submissions_dir.join("results.json"), &outcome.results) {
        eprintln!("failed to write results.json: {e}");
        return std::process::ExitCode::FAILURE;
    }
    for detail in &outcome.task_details {
        let path = logs_dir.join(format!("{run_ts}_{}.json", detail.task_id));
        if let Err(e) = write_task_detail_file(&path, detail) {
            eprintln!("failed to write task detail for {}: {e}", detail.task_id);
        }
    }

    tracing::info!(
        total_tasks = outcome.results.total_tasks,
        solved_tasks = outcome.results.solved_tasks,
        "run complete"
    );
    std::process::ExitCode::SUCCESS
}

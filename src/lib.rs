//! # arc-solver-engine
//!
//! A multi-stage LLM inference orchestrator for ARC-AGI-style abstract
//! reasoning grid tasks: a bounded-concurrency batch controller drives one
//! state machine per task/test-input pair through an escalating sequence of
//! solving strategies (direct solve, extended search, deep-thinking/hint/
//! object-decomposition/codegen fan-outs), a judge/selector picks the final
//! two attempts, and a submission writer emits the scored output files.
//!
//! ## Core Components
//!
//! - **Grid codec** (`grid`): CSV encoding and free-text grid extraction.
//! - **Provider clients** (`llm`): OpenAI/Anthropic/Google HTTP clients
//!   behind one `ProviderClient` trait.
//! - **Worker** (`worker`): one LLM call, grid extraction, verification.
//! - **State machine** (`state_machine`): the per-test-input solving
//!   pipeline (STEP1 through STEP5, FINISH).
//! - **Judge & Selector** (`selector`): picks the submitted attempts.
//! - **Batch controller** (`batch_controller`): loads tasks, runs the
//!   bounded pool, enforces the global deadline.
//! - **Submission writer** (`submission`): atomic output file writes.

pub mod batch_controller;
pub mod codegen;
pub mod config;
pub mod error;
pub mod fanout;
pub mod grid;
pub mod llm;
pub mod model_id;
pub mod prompts;
pub mod ratelimit;
pub mod retry;
pub mod sandbox;
pub mod selector;
pub mod state_machine;
pub mod submission;
pub mod task;
pub mod worker;

pub use batch_controller::{run_batch, BatchOutcome, TaskSource};
pub use config::{ApiKeys, CodegenParam, CodegenPromptVersion, SolverConfig};
pub use error::{Error, ErrorCategory, Result};
pub use fanout::{run_fanout, FanoutJob};
pub use model_id::{parse_model_identifier, Effort, ModelIdentifier, Provider, ReasoningConfig};
pub use ratelimit::RateLimiter;
pub use retry::{with_retry, FailureLog, RetryContext};
pub use sandbox::{run_untrusted_code, SandboxOutcome};
pub use selector::{select, PickedCandidate, SelectionOutcome};
pub use state_machine::{is_solved, run_solver, Outcome, SolverRun, StepLog, TaskContext};
pub use submission::{
    atomic_write_json, build_submission_entry, write_results_file, write_submission_file,
    write_task_detail_file, ResultsSummary, TaskDetail, TaskSummary,
};
pub use task::{
    grid_key, make_run_id, validate_grid, CallResult, Candidate, CandidateMap, Example, Grid,
    GridKey, MonolithicTasks, Task, TriState,
};
pub use worker::{call_model, run_id_for, run_worker, CallMode, WorkerContext};

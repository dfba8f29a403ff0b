//! Shared provider-facing types: `ModelResponse`, the opaque `RawHandle`
//! continuation state, and call options.
//!
//! Grounded on the teacher's `src/llm/types.rs` (`ModelResponse`,
//! `TokenUsage`) for the Rust shape, generalized to this spec's tri-state
//! correctness and provider-continuation `raw_handle` (§3, §9).

use serde::{Deserialize, Serialize};

/// Opaque provider-side continuation state needed for a follow-up
/// `continue_conversation` call. §9: "expose it only via
/// `ProviderClient::continue_conversation`; do not let callers inspect it."
/// The enum is public (Rust has no true existential opacity at this
/// layer) but its variants are not meant to be matched on outside the
/// client implementations -- callers treat it as an opaque token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RawHandle {
    OpenAiResponseId(String),
    AnthropicMessageChain(Vec<AnthropicTurn>),
    GoogleConversationId(String),
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicTurn {
    pub role: String,
    pub content: String,
}

/// `{text, prompt_tokens, cached_tokens, completion_tokens, model_name,
/// raw_handle}` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub cached_tokens: u64,
    pub completion_tokens: u64,
    /// May differ from the requested identifier when a cross-provider
    /// fallback occurred (§4.4).
    pub model_name: String,
    pub raw_handle: RawHandle,
}

/// Options threaded into a single `ProviderClient::solve` call.
#[derive(Debug, Clone, Default)]
pub struct SolveOpts {
    pub image_path: Option<String>,
    pub task_id: Option<String>,
    pub test_index: Option<usize>,
    pub step_name: Option<String>,
    /// Request the provider's code-execution tool for this call, when the
    /// provider supports one (§4.4 `CodegenPromptVersion::V4`).
    pub code_tool: bool,
}

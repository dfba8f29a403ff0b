//! Provider clients (§4.4): a uniform `ProviderClient` trait with one
//! implementation per provider, OpenAI background-job polling, and
//! cross-provider fallback.
//!
//! Grounded on the teacher's `src/llm/client.rs` (`LLMClient` trait,
//! per-provider REST structs, `build_http_client`'s proxy-detection-panic
//! guard, `MultiProviderClient`) for the overall shape;
//! `examples/original_source/src/providers/openai_background.py` for the
//! exact background poll/fallback state machine; and
//! `examples/original_source/src/models.py` (`_should_retry`) for the
//! HTTP-boundary retryable-error string classification.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model_id::{Effort, ModelIdentifier, Provider, ReasoningConfig, TieredPricing};

use super::types::{ModelResponse, RawHandle, SolveOpts};

/// Builds a `reqwest::Client`, guarding against the proxy-detection panic
/// some sandboxed environments trigger on client construction, exactly as
/// the teacher's `build_http_client` does.
pub fn build_http_client(timeout: Duration, insecure_ssl: bool) -> Client {
    let build = |no_proxy: bool| {
        let mut builder = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_ssl);
        if no_proxy {
            builder = builder.no_proxy();
        }
        builder.build()
    };

    match catch_unwind(AssertUnwindSafe(|| build(false))) {
        Ok(Ok(client)) => client,
        _ => build(true).unwrap_or_else(|_| Client::new()),
    }
}

/// Classifies an HTTP status + body into our error taxonomy (§4.4):
/// retryable (rate-limit, 5xx), non-retryable (other 4xx, auth,
/// permission), unknown (anything else).
pub fn classify_http_status(provider: &str, status: StatusCode, body: &str) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Error::provider_retryable(provider, format!("{status}: {body}"));
    }
    if status.is_client_error() {
        return Error::provider_non_retryable(provider, format!("{status}: {body}"));
    }
    Error::provider_unknown(provider, format!("{status}: {body}"))
}

/// Classifies a transport-level `reqwest::Error` (connection reset,
/// timeout, interrupted stream) using the same string-matching heuristic
/// the original `_should_retry` predicate used, since `reqwest::Error`
/// carries no structured "is this a transient network fault" flag.
pub fn classify_transport_error(provider: &str, err: &reqwest::Error) -> Error {
    let msg = err.to_string();
    let retryable = err.is_timeout()
        || err.is_connect()
        || msg.contains("Connection error")
        || msg.contains("connection reset")
        || msg.contains("upstream connect error")
        || msg.contains("timed out");
    if retryable {
        Error::provider_retryable(provider, msg)
    } else {
        Error::provider_unknown(provider, msg)
    }
}

fn reasoning_effort_str(cfg: &ReasoningConfig) -> Option<&'static str> {
    match cfg {
        ReasoningConfig::None => None,
        ReasoningConfig::Effort(Effort::Low) => Some("low"),
        ReasoningConfig::Effort(Effort::Medium) => Some("medium"),
        ReasoningConfig::Effort(Effort::High) => Some("high"),
        ReasoningConfig::Effort(Effort::Xhigh) => Some("xhigh"),
        ReasoningConfig::ThinkingBudget(_) => None,
    }
}

/// Uniform provider interface (§4.4).
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Single-turn synchronous call.
    async fn solve(
        &self,
        prompt: &str,
        model: &ModelIdentifier,
        opts: &SolveOpts,
    ) -> Result<ModelResponse>;

    /// Asynchronous "background job" mode. OpenAI only; other providers
    /// return `ProviderNonRetryable` ("not supported").
    async fn solve_background(
        &self,
        prompt: &str,
        model: &ModelIdentifier,
        opts: &SolveOpts,
    ) -> Result<ModelResponse> {
        let _ = (prompt, model, opts);
        Err(Error::provider_non_retryable(
            self.provider().to_string(),
            "background mode not supported by this provider",
        ))
    }

    /// Second-turn follow-up reusing provider-side state.
    async fn continue_conversation(
        &self,
        prev_handle: &RawHandle,
        text: &str,
        model: &ModelIdentifier,
    ) -> Result<ModelResponse>;

    fn pricing_for(&self, model: &ModelIdentifier) -> TieredPricing;
}

// ---------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

pub struct AnthropicClient {
    http: Client,
    api_key: String,
    pricing: TieredPricing,
}

impl AnthropicClient {
    pub fn new(http: Client, api_key: impl Into<String>) -> Self {
        AnthropicClient {
            http,
            api_key: api_key.into(),
            pricing: crate::model_id::PricingTable::default_table()
                .get("claude-opus-4.5")
                .copied()
                .expect("claude-opus-4.5 pricing present in default table"),
        }
    }

    fn thinking_block(model: &ModelIdentifier) -> Option<serde_json::Value> {
        match &model.reasoning_config {
            ReasoningConfig::ThinkingBudget(budget) if *budget > 0 => Some(json!({
                "type": "enabled",
                "budget_tokens": budget,
            })),
            _ => None,
        }
    }

    async fn send(&self, messages: Vec<AnthropicMessage>, model: &ModelIdentifier) -> Result<ModelResponse> {
        let body = AnthropicRequest {
            model: model.base_model.clone(),
            max_tokens: 8192,
            messages: {
                let m = &messages;
                m.iter()
                    .map(|m| AnthropicMessage {
                        role: m.role.clone(),
                        content: m.content.clone(),
                    })
                    .collect()
            },
            thinking: Self::thinking_block(model),
        };

        let resp = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("anthropic", &e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_status("anthropic", status, &text));
        }

        let parsed: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| Error::provider_unknown("anthropic", e.to_string()))?;

        let text = parsed
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        let mut turns: Vec<super::types::AnthropicTurn> = messages
            .into_iter()
            .map(|m| super::types::AnthropicTurn {
                role: m.role,
                content: m.content,
            })
            .collect();
        turns.push(super::types::AnthropicTurn {
            role: "assistant".to_string(),
            content: text.clone(),
        });

        Ok(ModelResponse {
            text,
            prompt_tokens: parsed.usage.input_tokens,
            cached_tokens: parsed.usage.cache_read_input_tokens,
            completion_tokens: parsed.usage.output_tokens,
            model_name: model.raw.clone(),
            raw_handle: RawHandle::AnthropicMessageChain(turns),
        })
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn solve(
        &self,
        prompt: &str,
        model: &ModelIdentifier,
        _opts: &SolveOpts,
    ) -> Result<ModelResponse> {
        self.send(
            vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            model,
        )
        .await
    }

    async fn continue_conversation(
        &self,
        prev_handle: &RawHandle,
        text: &str,
        model: &ModelIdentifier,
    ) -> Result<ModelResponse> {
        let mut messages = match prev_handle {
            RawHandle::AnthropicMessageChain(turns) => turns
                .iter()
                .map(|t| AnthropicMessage {
                    role: t.role.clone(),
                    content: t.content.clone(),
                })
                .collect(),
            _ => {
                return Err(Error::internal(
                    "continue_conversation called with a raw_handle from another provider",
                ))
            }
        };
        messages.push(AnthropicMessage {
            role: "user".to_string(),
            content: text.to_string(),
        });
        self.send(messages, model).await
    }

    fn pricing_for(&self, _model: &ModelIdentifier) -> TieredPricing {
        self.pricing
    }
}

// ---------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct OpenAiResponsesRequest {
    model: String,
    input: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    background: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    store: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    max_output_tokens: u32,
}

#[derive(Deserialize, Clone)]
struct OpenAiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Deserialize, Clone)]
struct OpenAiResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<OpenAiJobError>,
    #[serde(default)]
    incomplete_details: Option<serde_json::Value>,
}

#[derive(Deserialize, Clone)]
struct OpenAiJobError {
    code: Option<String>,
    message: Option<String>,
}

pub struct OpenAIClient {
    http: Client,
    api_key: String,
    pricing: TieredPricing,
    /// Cross-provider fallback target (§4.4); `None` disables fallback.
    fallback: Option<Arc<dyn ProviderClient>>,
    background_poll_horizon: Duration,
}

impl OpenAIClient {
    pub fn new(http: Client, api_key: impl Into<String>, background_poll_horizon: Duration) -> Self {
        OpenAIClient {
            http,
            api_key: api_key.into(),
            pricing: crate::model_id::PricingTable::default_table()
                .get("gpt-5.1")
                .copied()
                .expect("gpt-5.1 pricing present in default table"),
            fallback: None,
            background_poll_horizon,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ProviderClient>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.api_key)
    }

    fn response_from_job(job: &OpenAiResponse, model: &ModelIdentifier) -> ModelResponse {
        let usage = job.usage.clone().unwrap_or(OpenAiUsage {
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
        });
        ModelResponse {
            text: job.output_text.clone().unwrap_or_default(),
            prompt_tokens: usage.input_tokens,
            cached_tokens: usage.cached_tokens,
            completion_tokens: usage.output_tokens,
            model_name: model.raw.clone(),
            raw_handle: RawHandle::OpenAiResponseId(job.id.clone()),
        }
    }

    async fn submit(
        &self,
        prompt: &str,
        model: &ModelIdentifier,
        background: bool,
        previous_response_id: Option<String>,
        opts: &SolveOpts,
    ) -> Result<OpenAiResponse> {
        let req = OpenAiResponsesRequest {
            model: model.base_model.clone(),
            input: vec![json!({"role": "user", "content": prompt})],
            reasoning: reasoning_effort_str(&model.reasoning_config)
                .map(|e| json!({"effort": e})),
            background: if background { Some(true) } else { None },
            store: if background { Some(true) } else { None },
            previous_response_id,
            tools: if opts.code_tool {
                Some(vec![json!({"type": "code_interpreter", "container": {"type": "auto"}})])
            } else {
                None
            },
            max_output_tokens: 120_000,
        };
        let resp = self
            .auth(self.http.post("https://api.openai.com/v1/responses"))
            .timeout(Duration::from_secs(60))
            .json(&req)
            .send()
            .await
            .map_err(|e| classify_transport_error("openai", &e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_status("openai", status, &text));
        }
        resp.json()
            .await
            .map_err(|e| Error::provider_unknown("openai", e.to_string()))
    }

    async fn retrieve(&self, job_id: &str) -> Result<OpenAiResponse> {
        let resp = self
            .auth(self.http.get(format!("https://api.openai.com/v1/responses/{job_id}")))
            .send()
            .await
            .map_err(|e| classify_transport_error("openai", &e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_status("openai", status, &text));
        }
        resp.json()
            .await
            .map_err(|e| Error::provider_unknown("openai", e.to_string()))
    }

    fn fallback_thinking(&self, xhigh: bool) -> (&'static str, ModelIdentifier) {
        let suffix = if xhigh { "thinking-60000" } else { "no-thinking" };
        let raw = format!("claude-opus-4.5-{suffix}");
        let reasoning_config = if xhigh {
            ReasoningConfig::ThinkingBudget(60_000)
        } else {
            ReasoningConfig::None
        };
        (
            suffix,
            ModelIdentifier {
                raw,
                provider: Provider::Anthropic,
                base_model: "claude-opus-4.5".to_string(),
                reasoning_config,
            },
        )
    }

    async fn fallback_to_claude(
        &self,
        prompt: &str,
        reason: &str,
        xhigh: bool,
        opts: &SolveOpts,
    ) -> Result<ModelResponse> {
        let fallback = self.fallback.clone().ok_or_else(|| {
            Error::provider_non_retryable(
                "openai",
                format!("fallback required ({reason}) but no Anthropic fallback client configured"),
            )
        })?;
        warn!(reason, "OpenAI background job failed; falling back to Claude Opus");
        let (_, fallback_model) = self.fallback_thinking(xhigh);
        let mut resp = fallback.solve(prompt, &fallback_model, opts).await?;
        resp.model_name = fallback_model.raw.clone();
        Ok(resp)
    }
}

#[async_trait]
impl ProviderClient for OpenAIClient {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    async fn solve(
        &self,
        prompt: &str,
        model: &ModelIdentifier,
        opts: &SolveOpts,
    ) -> Result<ModelResponse> {
        let job = self.submit(prompt, model, false, None, opts).await?;
        Ok(Self::response_from_job(&job, model))
    }

    /// §4.4 "OpenAI background mode": submit, then poll every 2-3s
    /// (jittered) up to `background_poll_horizon`, with cross-provider
    /// fallback on server-error/token-limit/timeout/403-fatal for
    /// `xhigh`/`low` effort (§4.4, §11 supplement).
    async fn solve_background(
        &self,
        prompt: &str,
        model: &ModelIdentifier,
        opts: &SolveOpts,
    ) -> Result<ModelResponse> {
        let xhigh = model.reasoning_config == ReasoningConfig::Effort(Effort::Xhigh);
        let low = model.reasoning_config == ReasoningConfig::Effort(Effort::Low);
        let can_fallback = xhigh || low;

        let job = self.submit(prompt, model, true, None, opts).await?;
        let job_id = job.id.clone();
        info!(job_id = %job_id, model = %model.raw, "OpenAI background job submitted");

        let deadline = tokio::time::Instant::now() + self.background_poll_horizon;
        loop {
            if tokio::time::Instant::now() >= deadline {
                if can_fallback {
                    return self
                        .fallback_to_claude(
                            prompt,
                            &format!(
                                "Timeout after {}s",
                                self.background_poll_horizon.as_secs()
                            ),
                            xhigh,
                            opts,
                        )
                        .await;
                }
                return Err(Error::BackgroundTimeout {
                    job_id,
                    elapsed_secs: self.background_poll_horizon.as_secs(),
                });
            }

            let job = match self.retrieve(&job_id).await {
                Ok(j) => j,
                Err(Error::ProviderNonRetryable { message, .. })
                    if message.contains("403") && can_fallback =>
                {
                    return self
                        .fallback_to_claude(prompt, &format!("OpenAI 403 Forbidden: {message}"), xhigh, opts)
                        .await;
                }
                Err(e) => return Err(e),
            };

            match job.status.as_deref() {
                Some("queued") | Some("in_progress") => {
                    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                    tokio::time::sleep(Duration::from_secs_f64(2.0 + jitter)).await;
                    continue;
                }
                Some("completed") => return Ok(Self::response_from_job(&job, model)),
                Some("failed") => {
                    let is_server_error = job
                        .error
                        .as_ref()
                        .and_then(|e| e.code.as_deref())
                        .map(|c| c == "server_error")
                        .unwrap_or(false);
                    let message = job
                        .error
                        .as_ref()
                        .and_then(|e| e.message.clone())
                        .unwrap_or_else(|| "unknown error".to_string());
                    if is_server_error && can_fallback {
                        return self
                            .fallback_to_claude(prompt, &format!("OpenAI Server Error: {message}"), xhigh, opts)
                            .await;
                    }
                    return Err(Error::BackgroundServerError { job_id, message });
                }
                Some("incomplete") | Some("cancelled") => {
                    let reason = job
                        .incomplete_details
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    let token_limited =
                        reason.contains("max_output_tokens") || reason.contains("token_limit");
                    if token_limited && can_fallback {
                        return self
                            .fallback_to_claude(prompt, &format!("Token limit: {reason}"), xhigh, opts)
                            .await;
                    }
                    return Err(Error::TokenLimit { job_id, reason });
                }
                other => {
                    return Err(Error::provider_unknown(
                        "openai",
                        format!("unexpected background job status: {other:?}"),
                    ))
                }
            }
        }
    }

    async fn continue_conversation(
        &self,
        prev_handle: &RawHandle,
        text: &str,
        model: &ModelIdentifier,
    ) -> Result<ModelResponse> {
        let prev_id = match prev_handle {
            RawHandle::OpenAiResponseId(id) => id.clone(),
            _ => {
                return Err(Error::internal(
                    "continue_conversation called with a raw_handle from another provider",
                ))
            }
        };
        let job = self
            .submit(text, model, false, Some(prev_id), &SolveOpts::default())
            .await?;
        Ok(Self::response_from_job(&job, model))
    }

    fn pricing_for(&self, _model: &ModelIdentifier) -> TieredPricing {
        self.pricing
    }
}

// ---------------------------------------------------------------------
// Google (Gemini)
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct GoogleContent {
    role: String,
    parts: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct GoogleRequest {
    contents: Vec<GoogleContent>,
}

#[derive(Deserialize, Default)]
struct GoogleUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    cached_content_token_count: u64,
}

#[derive(Deserialize)]
struct GoogleCandidate {
    content: GoogleCandidateContent,
}

#[derive(Deserialize)]
struct GoogleCandidateContent {
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GoogleResponse {
    candidates: Vec<GoogleCandidate>,
    #[serde(default)]
    #[serde(rename = "usageMetadata")]
    usage_metadata: GoogleUsageMetadata,
}

/// Rotates across `GEMINI_API_KEY[_1..N]` (§6), since a single Google key
/// pool is shared by all Gemini calls in a process.
pub struct GoogleClient {
    http: Client,
    api_keys: Vec<String>,
    next_key: AtomicUsize,
    pricing: TieredPricing,
}

impl GoogleClient {
    pub fn new(http: Client, api_keys: Vec<String>) -> Self {
        GoogleClient {
            http,
            api_keys,
            next_key: AtomicUsize::new(0),
            pricing: crate::model_id::PricingTable::default_table()
                .get("gemini-3")
                .copied()
                .expect("gemini-3 pricing present in default table"),
        }
    }

    fn pick_key(&self) -> Result<&str> {
        if self.api_keys.is_empty() {
            return Err(Error::config("no GEMINI_API_KEY configured"));
        }
        let idx = self.next_key.fetch_add(1, Ordering::Relaxed) % self.api_keys.len();
        Ok(&self.api_keys[idx])
    }
}

#[async_trait]
impl ProviderClient for GoogleClient {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn solve(
        &self,
        prompt: &str,
        model: &ModelIdentifier,
        _opts: &SolveOpts,
    ) -> Result<ModelResponse> {
        let key = self.pick_key()?;
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            model.base_model, key
        );
        let body = GoogleRequest {
            contents: vec![GoogleContent {
                role: "user".to_string(),
                parts: vec![json!({"text": prompt})],
            }],
        };
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("google", &e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_status("google", status, &text));
        }
        let parsed: GoogleResponse = resp
            .json()
            .await
            .map_err(|e| Error::provider_unknown("google", e.to_string()))?;

        let text = parsed
            .candidates
            .first()
            .map(|c| c.content.parts.iter().map(|p| p.text.as_str()).collect::<String>())
            .unwrap_or_default();

        Ok(ModelResponse {
            text,
            prompt_tokens: parsed.usage_metadata.prompt_token_count,
            cached_tokens: parsed.usage_metadata.cached_content_token_count,
            completion_tokens: parsed.usage_metadata.candidates_token_count,
            model_name: model.raw.clone(),
            raw_handle: RawHandle::None,
        })
    }

    async fn continue_conversation(
        &self,
        _prev_handle: &RawHandle,
        text: &str,
        model: &ModelIdentifier,
    ) -> Result<ModelResponse> {
        // Google has no cheap server-side continuation in this API surface;
        // re-issue as a fresh single-turn call.
        self.solve(text, model, &SolveOpts::default()).await
    }

    fn pricing_for(&self, _model: &ModelIdentifier) -> TieredPricing {
        self.pricing
    }
}

/// Dispatches to the right per-provider client based on a
/// `ModelIdentifier`, mirroring the teacher's `MultiProviderClient`.
pub struct MultiProviderClient {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl MultiProviderClient {
    pub fn new(clients: HashMap<Provider, Arc<dyn ProviderClient>>) -> Self {
        MultiProviderClient { clients }
    }

    fn client_for(&self, provider: Provider) -> Result<&Arc<dyn ProviderClient>> {
        self.clients
            .get(&provider)
            .ok_or_else(|| Error::config(format!("no client configured for provider {provider}")))
    }

    pub async fn solve(
        &self,
        prompt: &str,
        model: &ModelIdentifier,
        opts: &SolveOpts,
    ) -> Result<ModelResponse> {
        self.client_for(model.provider)?.solve(prompt, model, opts).await
    }

    pub async fn solve_background(
        &self,
        prompt: &str,
        model: &ModelIdentifier,
        opts: &SolveOpts,
    ) -> Result<ModelResponse> {
        self.client_for(model.provider)?
            .solve_background(prompt, model, opts)
            .await
    }

    pub fn pricing_for(&self, model: &ModelIdentifier) -> Result<TieredPricing> {
        Ok(self.client_for(model.provider)?.pricing_for(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockProvider {
        provider: Provider,
        text: String,
    }

    #[async_trait]
    impl ProviderClient for MockProvider {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn solve(
            &self,
            _prompt: &str,
            model: &ModelIdentifier,
            _opts: &SolveOpts,
        ) -> Result<ModelResponse> {
            Ok(ModelResponse {
                text: self.text.clone(),
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
        ) -> Result<ModelResponse> {
            self.solve(text, model, &SolveOpts::default()).await
        }

        fn pricing_for(&self, _model: &ModelIdentifier) -> TieredPricing {
            crate::model_id::TieredPricing::flat(crate::model_id::ModelPricing {
                input: 1.0,
                cached_input: 0.1,
                output: 2.0,
            })
        }
    }

    #[tokio::test]
    async fn multi_provider_dispatches_by_model_provider() {
        let mut map: HashMap<Provider, Arc<dyn ProviderClient>> = HashMap::new();
        map.insert(
            Provider::OpenAI,
            Arc::new(MockProvider {
                provider: Provider::OpenAI,
                text: "1,2\n3,4".to_string(),
            }),
        );
        let multi = MultiProviderClient::new(map);
        let model = crate::model_id::parse_model_identifier("gpt-5.1-high").unwrap();
        let resp = multi
            .solve("prompt", &model, &SolveOpts::default())
            .await
            .unwrap();
        assert_eq!(resp.text, "1,2\n3,4");
    }

    #[test]
    fn classifies_429_and_5xx_as_retryable() {
        let err = classify_http_status("openai", StatusCode::TOO_MANY_REQUESTS, "rate limited");
        assert_eq!(err.category(), crate::error::ErrorCategory::Retryable);
        let err = classify_http_status("openai", StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert_eq!(err.category(), crate::error::ErrorCategory::Retryable);
    }

    #[test]
    fn classifies_other_4xx_as_non_retryable() {
        let err = classify_http_status("openai", StatusCode::UNAUTHORIZED, "bad key");
        assert_eq!(err.category(), crate::error::ErrorCategory::NonRetryable);
    }

    #[test]
    fn code_tool_opt_adds_code_interpreter_to_request_body() {
        let req = OpenAiResponsesRequest {
            model: "gpt-5.1".to_string(),
            input: vec![json!({"role": "user", "content": "hi"})],
            reasoning: None,
            background: None,
            store: None,
            previous_response_id: None,
            tools: Some(vec![json!({"type": "code_interpreter", "container": {"type": "auto"}})]),
            max_output_tokens: 1000,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["tools"][0]["type"], "code_interpreter");
    }

    #[test]
    fn no_code_tool_opt_omits_tools_from_request_body() {
        let req = OpenAiResponsesRequest {
            model: "gpt-5.1".to_string(),
            input: vec![json!({"role": "user", "content": "hi"})],
            reasoning: None,
            background: None,
            store: None,
            previous_response_id: None,
            tools: None,
            max_output_tokens: 1000,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("tools").is_none());
    }
}

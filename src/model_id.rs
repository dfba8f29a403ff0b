//! Model identifier grammar (§6) and pricing table (§3).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAI,
    Anthropic,
    Google,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
        };
        write!(f, "{s}")
    }
}

/// `none`, an effort enum, or a non-negative thinking-budget token count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningConfig {
    None,
    Effort(Effort),
    ThinkingBudget(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    Medium,
    High,
    Xhigh,
}

impl std::fmt::Display for Effort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
            Effort::Xhigh => "xhigh",
        };
        write!(f, "{s}")
    }
}

/// A resolved logical model name, e.g. `"gpt-5.1-high"` ->
/// `{provider: OpenAI, base_model: "gpt-5.1", reasoning_config: High}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentifier {
    pub raw: String,
    pub provider: Provider,
    pub base_model: String,
    pub reasoning_config: ReasoningConfig,
}

/// Parses a logical model identifier per the §6 grammar. Unknown
/// identifiers fail with a `ValidationError` before any call is made.
pub fn parse_model_identifier(raw: &str) -> Result<ModelIdentifier> {
    if let Some(rest) = raw.strip_prefix("gpt-5.1-codex-max-") {
        return match rest {
            "high" => Ok(openai_effort(raw, "gpt-5.1-codex-max", Effort::High)),
            "xhigh" => Ok(openai_effort(raw, "gpt-5.1-codex-max", Effort::Xhigh)),
            _ => Err(unknown(raw)),
        };
    }
    if let Some(rest) = raw.strip_prefix("gpt-5.2-codex-") {
        return parse_gpt_effort(raw, "gpt-5.2-codex", rest);
    }
    if let Some(rest) = raw.strip_prefix("gpt-5.1-") {
        return match rest {
            "none" => Ok(ModelIdentifier {
                raw: raw.to_string(),
                provider: Provider::OpenAI,
                base_model: "gpt-5.1".to_string(),
                reasoning_config: ReasoningConfig::None,
            }),
            "low" | "medium" | "high" => Ok(openai_effort(raw, "gpt-5.1", effort(rest).unwrap())),
            _ => Err(unknown(raw)),
        };
    }
    if let Some(rest) = raw.strip_prefix("gpt-5.2-") {
        return parse_gpt_effort(raw, "gpt-5.2", rest);
    }
    if let Some(rest) = raw.strip_prefix("claude-sonnet-4.5-") {
        return parse_claude(raw, "claude-sonnet-4.5", rest, false);
    }
    if let Some(rest) = raw.strip_prefix("claude-opus-4.5-") {
        return parse_claude(raw, "claude-opus-4.5", rest, true);
    }
    if let Some(rest) = raw.strip_prefix("gemini-3-") {
        return match rest {
            "low" => Ok(google_effort(raw, Effort::Low)),
            "high" => Ok(google_effort(raw, Effort::High)),
            _ => Err(unknown(raw)),
        };
    }
    Err(unknown(raw))
}

fn unknown(raw: &str) -> Error {
    Error::validation(format!("unknown model identifier: {raw}"))
}

fn effort(s: &str) -> Option<Effort> {
    match s {
        "low" => Some(Effort::Low),
        "medium" => Some(Effort::Medium),
        "high" => Some(Effort::High),
        "xhigh" => Some(Effort::Xhigh),
        _ => None,
    }
}

fn openai_effort(raw: &str, base: &str, e: Effort) -> ModelIdentifier {
    ModelIdentifier {
        raw: raw.to_string(),
        provider: Provider::OpenAI,
        base_model: base.to_string(),
        reasoning_config: ReasoningConfig::Effort(e),
    }
}

fn google_effort(raw: &str, e: Effort) -> ModelIdentifier {
    ModelIdentifier {
        raw: raw.to_string(),
        provider: Provider::Google,
        base_model: "gemini-3".to_string(),
        reasoning_config: ReasoningConfig::Effort(e),
    }
}

fn parse_gpt_effort(raw: &str, base: &str, rest: &str) -> Result<ModelIdentifier> {
    if rest == "none" {
        return Ok(ModelIdentifier {
            raw: raw.to_string(),
            provider: Provider::OpenAI,
            base_model: base.to_string(),
            reasoning_config: ReasoningConfig::None,
        });
    }
    match effort(rest) {
        Some(e) => Ok(openai_effort(raw, base, e)),
        None => Err(unknown(raw)),
    }
}

fn parse_claude(raw: &str, base: &str, rest: &str, opus: bool) -> Result<ModelIdentifier> {
    if rest == "no-thinking" {
        return Ok(ModelIdentifier {
            raw: raw.to_string(),
            provider: Provider::Anthropic,
            base_model: base.to_string(),
            reasoning_config: ReasoningConfig::None,
        });
    }
    if let Some(budget) = rest.strip_prefix("thinking-") {
        let budget: u32 = budget.parse().map_err(|_| unknown(raw))?;
        return Ok(ModelIdentifier {
            raw: raw.to_string(),
            provider: Provider::Anthropic,
            base_model: base.to_string(),
            reasoning_config: ReasoningConfig::ThinkingBudget(budget),
        });
    }
    if opus {
        if let Some(e) = effort(rest) {
            if e != Effort::Xhigh {
                return Ok(ModelIdentifier {
                    raw: raw.to_string(),
                    provider: Provider::Anthropic,
                    base_model: base.to_string(),
                    reasoning_config: ReasoningConfig::Effort(e),
                });
            }
        }
    }
    Err(unknown(raw))
}

/// `{input, cached_input, output}` prices per 1M tokens for a base model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub cached_input: f64,
    pub output: f64,
}

/// A model may override pricing once total prompt tokens exceed a
/// threshold (e.g. Gemini's >200k-token tier).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TieredPricing {
    pub base: ModelPricing,
    pub override_threshold_tokens: Option<u64>,
    pub override_pricing: Option<ModelPricing>,
}

impl TieredPricing {
    pub fn flat(p: ModelPricing) -> Self {
        TieredPricing {
            base: p,
            override_threshold_tokens: None,
            override_pricing: None,
        }
    }

    pub fn pricing_for_prompt_tokens(&self, prompt_tokens: u64) -> ModelPricing {
        match (self.override_threshold_tokens, self.override_pricing) {
            (Some(threshold), Some(over)) if prompt_tokens > threshold => over,
            _ => self.base,
        }
    }
}

/// Computes cost from a pricing table and token usage, per §4.6:
/// non-cached input at `input` rate, cached input at `cached_input` rate,
/// output at `output` rate.
pub fn calculate_cost(
    pricing: &TieredPricing,
    prompt_tokens: u64,
    cached_tokens: u64,
    output_tokens: u64,
) -> f64 {
    let p = pricing.pricing_for_prompt_tokens(prompt_tokens);
    let non_cached = prompt_tokens.saturating_sub(cached_tokens) as f64;
    let cached = cached_tokens as f64;
    let output = output_tokens as f64;
    (non_cached * p.input + cached * p.cached_input + output * p.output) / 1_000_000.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingTable {
    entries: std::collections::HashMap<String, TieredPricing>,
}

impl PricingTable {
    pub fn insert(&mut self, base_model: impl Into<String>, pricing: TieredPricing) {
        self.entries.insert(base_model.into(), pricing);
    }

    pub fn get(&self, base_model: &str) -> Option<&TieredPricing> {
        self.entries.get(base_model)
    }

    /// The default production pricing table, grounded on
    /// `original_source/src/models.py::PRICING_PER_1M_TOKENS` and
    /// generalized to this spec's richer model grammar.
    pub fn default_table() -> Self {
        let mut t = PricingTable::default();
        t.insert(
            "gpt-5.1",
            TieredPricing::flat(ModelPricing {
                input: 1.25,
                cached_input: 0.125,
                output: 10.0,
            }),
        );
        t.insert(
            "gpt-5.1-codex-max",
            TieredPricing::flat(ModelPricing {
                input: 1.25,
                cached_input: 0.125,
                output: 10.0,
            }),
        );
        t.insert(
            "gpt-5.2",
            TieredPricing::flat(ModelPricing {
                input: 1.75,
                cached_input: 0.175,
                output: 14.0,
            }),
        );
        t.insert(
            "gpt-5.2-codex",
            TieredPricing::flat(ModelPricing {
                input: 1.75,
                cached_input: 0.175,
                output: 14.0,
            }),
        );
        t.insert(
            "claude-sonnet-4.5",
            TieredPricing::flat(ModelPricing {
                input: 3.0,
                cached_input: 0.3,
                output: 15.0,
            }),
        );
        t.insert(
            "claude-opus-4.5",
            TieredPricing::flat(ModelPricing {
                input: 15.0,
                cached_input: 1.5,
                output: 75.0,
            }),
        );
        t.insert(
            "gemini-3",
            TieredPricing {
                base: ModelPricing {
                    input: 2.0,
                    cached_input: 0.5,
                    output: 12.0,
                },
                override_threshold_tokens: Some(200_000),
                override_pricing: Some(ModelPricing {
                    input: 4.0,
                    cached_input: 1.0,
                    output: 18.0,
                }),
            },
        );
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_grammar() {
        let id = parse_model_identifier("gpt-5.1-high").unwrap();
        assert_eq!(id.provider, Provider::OpenAI);
        assert_eq!(id.base_model, "gpt-5.1");
        assert_eq!(id.reasoning_config, ReasoningConfig::Effort(Effort::High));
    }

    #[test]
    fn parses_codex_max() {
        let id = parse_model_identifier("gpt-5.1-codex-max-xhigh").unwrap();
        assert_eq!(id.base_model, "gpt-5.1-codex-max");
        assert_eq!(id.reasoning_config, ReasoningConfig::Effort(Effort::Xhigh));
    }

    #[test]
    fn parses_claude_thinking_budget() {
        let id = parse_model_identifier("claude-opus-4.5-thinking-60000").unwrap();
        assert_eq!(id.provider, Provider::Anthropic);
        assert_eq!(
            id.reasoning_config,
            ReasoningConfig::ThinkingBudget(60000)
        );
    }

    #[test]
    fn claude_opus_rejects_xhigh_effort() {
        // Opus supports low|medium|high|thinking-<budget>, not xhigh.
        assert!(parse_model_identifier("claude-opus-4.5-xhigh").is_err());
    }

    #[test]
    fn parses_gemini() {
        let id = parse_model_identifier("gemini-3-low").unwrap();
        assert_eq!(id.provider, Provider::Google);
    }

    #[test]
    fn unknown_identifier_fails_before_any_call() {
        let err = parse_model_identifier("gpt-4-turbo").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn cost_accounts_cached_and_output_separately() {
        let pricing = TieredPricing::flat(ModelPricing {
            input: 1.0,
            cached_input: 0.1,
            output: 2.0,
        });
        let cost = calculate_cost(&pricing, 1000, 200, 500);
        // non-cached: 800 * 1.0, cached: 200 * 0.1, output: 500 * 2.0, all /1e6
        let expected = (800.0 * 1.0 + 200.0 * 0.1 + 500.0 * 2.0) / 1_000_000.0;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn gemini_tier_switches_above_threshold() {
        let table = PricingTable::default_table();
        let pricing = table.get("gemini-3").unwrap();
        let below = pricing.pricing_for_prompt_tokens(100_000);
        let above = pricing.pricing_for_prompt_tokens(300_000);
        assert!(above.input > below.input);
    }
}

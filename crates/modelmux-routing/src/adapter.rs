use http::HeaderMap;
use serde_json::Value;

use modelmux_common::{ProviderType, RouteCapability};

use crate::resolver::provider_type_for;
use crate::session::{SessionSource, extract_session_id};

/// Token counts reported by an upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTokens {
    pub input_tokens: u64,
    pub cache_read_tokens: u64,
    pub output_tokens: u64,
}

impl UsageTokens {
    /// Total prompt-side tokens, cache reads included; this is the quantity
    /// the affinity store accumulates.
    pub fn total_input(&self) -> u64 {
        self.input_tokens.saturating_add(self.cache_read_tokens)
    }
}

/// Per-provider capability set the selector and outcome reporter depend on.
/// One implementation per provider type; nothing outside this module knows
/// the concrete adapters.
pub trait ProviderAdapter: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Whether a model name belongs to this provider's family.
    fn match_model(&self, model: &str) -> bool;

    fn extract_session_id(
        &self,
        capability: RouteCapability,
        headers: &HeaderMap,
        body: Option<&Value>,
    ) -> Option<(String, SessionSource)>;

    /// Pull token accounting out of a (non-streaming or accumulated)
    /// response body.
    fn extract_usage_tokens(&self, response: &Value) -> Option<UsageTokens>;
}

pub fn adapter_for(provider_type: ProviderType) -> &'static dyn ProviderAdapter {
    match provider_type {
        ProviderType::Anthropic => &AnthropicAdapter,
        ProviderType::Openai => &OpenaiAdapter,
        ProviderType::Google => &GoogleAdapter,
        ProviderType::Custom => &CustomAdapter,
    }
}

struct AnthropicAdapter;

impl ProviderAdapter for AnthropicAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn match_model(&self, model: &str) -> bool {
        provider_type_for(model) == Some(ProviderType::Anthropic)
    }

    fn extract_session_id(
        &self,
        capability: RouteCapability,
        headers: &HeaderMap,
        body: Option<&Value>,
    ) -> Option<(String, SessionSource)> {
        extract_session_id(capability, headers, body)
    }

    fn extract_usage_tokens(&self, response: &Value) -> Option<UsageTokens> {
        let usage = response.get("usage")?;
        Some(UsageTokens {
            input_tokens: u64_field(usage, "input_tokens")?,
            cache_read_tokens: u64_field(usage, "cache_read_input_tokens").unwrap_or(0),
            output_tokens: u64_field(usage, "output_tokens").unwrap_or(0),
        })
    }
}

struct OpenaiAdapter;

impl ProviderAdapter for OpenaiAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Openai
    }

    fn match_model(&self, model: &str) -> bool {
        provider_type_for(model) == Some(ProviderType::Openai)
    }

    fn extract_session_id(
        &self,
        capability: RouteCapability,
        headers: &HeaderMap,
        body: Option<&Value>,
    ) -> Option<(String, SessionSource)> {
        extract_session_id(capability, headers, body)
    }

    fn extract_usage_tokens(&self, response: &Value) -> Option<UsageTokens> {
        openai_usage(response)
    }
}

struct GoogleAdapter;

impl ProviderAdapter for GoogleAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Google
    }

    fn match_model(&self, model: &str) -> bool {
        provider_type_for(model) == Some(ProviderType::Google)
    }

    fn extract_session_id(
        &self,
        capability: RouteCapability,
        headers: &HeaderMap,
        body: Option<&Value>,
    ) -> Option<(String, SessionSource)> {
        extract_session_id(capability, headers, body)
    }

    fn extract_usage_tokens(&self, response: &Value) -> Option<UsageTokens> {
        let usage = response.get("usageMetadata")?;
        Some(UsageTokens {
            input_tokens: u64_field(usage, "promptTokenCount")?,
            cache_read_tokens: u64_field(usage, "cachedContentTokenCount").unwrap_or(0),
            output_tokens: u64_field(usage, "candidatesTokenCount").unwrap_or(0),
        })
    }
}

/// OpenAI-compatible endpoints of unknown vendors: any model name matches,
/// usage parsing follows the OpenAI shapes.
struct CustomAdapter;

impl ProviderAdapter for CustomAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Custom
    }

    fn match_model(&self, _model: &str) -> bool {
        true
    }

    fn extract_session_id(
        &self,
        capability: RouteCapability,
        headers: &HeaderMap,
        body: Option<&Value>,
    ) -> Option<(String, SessionSource)> {
        extract_session_id(capability, headers, body)
    }

    fn extract_usage_tokens(&self, response: &Value) -> Option<UsageTokens> {
        openai_usage(response)
    }
}

/// Chat-completions usage (`prompt_tokens`) and responses-API usage
/// (`input_tokens`) both appear in the wild; accept either.
fn openai_usage(response: &Value) -> Option<UsageTokens> {
    let usage = response.get("usage")?;
    if let Some(prompt_tokens) = u64_field(usage, "prompt_tokens") {
        let cached = usage
            .get("prompt_tokens_details")
            .and_then(|details| u64_field(details, "cached_tokens"))
            .unwrap_or(0);
        return Some(UsageTokens {
            input_tokens: prompt_tokens.saturating_sub(cached),
            cache_read_tokens: cached,
            output_tokens: u64_field(usage, "completion_tokens").unwrap_or(0),
        });
    }
    let input_tokens = u64_field(usage, "input_tokens")?;
    let cached = usage
        .get("input_tokens_details")
        .and_then(|details| u64_field(details, "cached_tokens"))
        .unwrap_or(0);
    Some(UsageTokens {
        input_tokens: input_tokens.saturating_sub(cached),
        cache_read_tokens: cached,
        output_tokens: u64_field(usage, "output_tokens").unwrap_or(0),
    })
}

fn u64_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key)?.as_u64()
}

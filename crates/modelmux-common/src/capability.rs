use serde::{Deserialize, Serialize};

/// A supported request family on an upstream. Declaration order is the
/// canonical persisted order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RouteCapability {
    AnthropicMessages,
    OpenaiChatCompatible,
    OpenaiExtended,
    CodexResponses,
    GeminiNativeGenerate,
}

impl RouteCapability {
    pub const ALL: [RouteCapability; 5] = [
        RouteCapability::AnthropicMessages,
        RouteCapability::OpenaiChatCompatible,
        RouteCapability::OpenaiExtended,
        RouteCapability::CodexResponses,
        RouteCapability::GeminiNativeGenerate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteCapability::AnthropicMessages => "anthropic_messages",
            RouteCapability::OpenaiChatCompatible => "openai_chat_compatible",
            RouteCapability::OpenaiExtended => "openai_extended",
            RouteCapability::CodexResponses => "codex_responses",
            RouteCapability::GeminiNativeGenerate => "gemini_native_generate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "anthropic_messages" => Some(RouteCapability::AnthropicMessages),
            "openai_chat_compatible" => Some(RouteCapability::OpenaiChatCompatible),
            "openai_extended" => Some(RouteCapability::OpenaiExtended),
            "codex_responses" => Some(RouteCapability::CodexResponses),
            "gemini_native_generate" => Some(RouteCapability::GeminiNativeGenerate),
            _ => None,
        }
    }

    /// True for the capabilities that speak an OpenAI-shaped request body.
    pub fn is_openai_family(&self) -> bool {
        matches!(
            self,
            RouteCapability::OpenaiChatCompatible
                | RouteCapability::OpenaiExtended
                | RouteCapability::CodexResponses
        )
    }
}

impl std::fmt::Display for RouteCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonicalize a raw persisted capability list: trim whitespace, drop
/// unknown tokens, deduplicate, and sort into the canonical order.
pub fn canonicalize_capabilities(raw: &[String]) -> Vec<RouteCapability> {
    let mut parsed: Vec<RouteCapability> = raw
        .iter()
        .filter_map(|token| RouteCapability::parse(token.trim()))
        .collect();
    parsed.sort();
    parsed.dedup();
    parsed
}

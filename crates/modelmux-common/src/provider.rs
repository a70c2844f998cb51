use serde::{Deserialize, Serialize};

/// Wire-protocol family of an upstream. Closed set; `Custom` covers
/// OpenAI-compatible endpoints that are none of the named vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Anthropic,
    Openai,
    Google,
    Custom,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Anthropic => "anthropic",
            ProviderType::Openai => "openai",
            ProviderType::Google => "google",
            ProviderType::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "anthropic" => Some(ProviderType::Anthropic),
            "openai" => Some(ProviderType::Openai),
            "google" => Some(ProviderType::Google),
            "custom" => Some(ProviderType::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

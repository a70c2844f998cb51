use std::collections::{HashMap, HashSet};

use modelmux_common::ProviderType;

/// Redirect chains may be long but never circular; validation rejects the
/// cycle before a map is ever persisted, so the resolver can walk with a
/// plain bounded loop.
const MAX_REDIRECT_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RedirectError {
    #[error("circular model redirect involving \"{0}\"")]
    CircularRedirect(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub model: String,
    pub redirected: bool,
}

/// Case-insensitive prefix classification of a model name.
pub fn provider_type_for(model: &str) -> Option<ProviderType> {
    const PREFIXES: [(&str, ProviderType); 3] = [
        ("claude-", ProviderType::Anthropic),
        ("gpt-", ProviderType::Openai),
        ("gemini-", ProviderType::Google),
    ];
    PREFIXES.iter().find_map(|(prefix, provider_type)| {
        let head = model.get(..prefix.len())?;
        head.eq_ignore_ascii_case(prefix).then_some(*provider_type)
    })
}

/// Reject any redirect map whose directed graph contains a cycle. Every key
/// is walked with its own visited set; chain length itself is not an error.
pub fn validate_redirects(redirects: &HashMap<String, String>) -> Result<(), RedirectError> {
    for start in redirects.keys() {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = start.as_str();
        visited.insert(current);
        while let Some(next) = redirects.get(current) {
            if !visited.insert(next.as_str()) {
                return Err(RedirectError::CircularRedirect(next.clone()));
            }
            current = next.as_str();
        }
    }
    Ok(())
}

/// Follow redirects from `model` until there is no entry or the depth cap is
/// reached. Returns the final model and whether at least one hop occurred.
pub fn resolve(model: &str, redirects: &HashMap<String, String>) -> Resolution {
    let mut current = model.to_string();
    let mut redirected = false;
    for _ in 0..MAX_REDIRECT_DEPTH {
        let Some(next) = redirects.get(&current) else {
            break;
        };
        current = next.clone();
        redirected = true;
    }
    Resolution {
        model: current,
        redirected,
    }
}

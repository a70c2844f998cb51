use std::sync::LazyLock;

use http::HeaderMap;
use regex::Regex;
use serde_json::Value;

use modelmux_common::RouteCapability;

const MAX_SESSION_ID_LEN: usize = 128;

/// Where the session identifier was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Header,
    Body,
}

/// Claude Code and friends embed a session UUID inside `metadata.user_id`,
/// e.g. `user_abc123_account__session_5cc6bd0f-...`.
static ANTHROPIC_SESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|_)session_([0-9a-f-]{36})").expect("anthropic session pattern")
});

const OPENAI_HEADER_CANDIDATES: [&str; 5] = [
    "session_id",
    "session-id",
    "x-session-id",
    "x-session_id",
    "x_session_id",
];

/// Extract a session identifier from the request, per capability. Pure; the
/// body is the already-parsed request JSON.
pub fn extract_session_id(
    capability: RouteCapability,
    headers: &HeaderMap,
    body: Option<&Value>,
) -> Option<(String, SessionSource)> {
    match capability {
        RouteCapability::AnthropicMessages => extract_anthropic(body),
        cap if cap.is_openai_family() => extract_openai(headers, body),
        _ => None,
    }
}

fn extract_anthropic(body: Option<&Value>) -> Option<(String, SessionSource)> {
    let user_id = body?.get("metadata")?.get("user_id")?.as_str()?;
    let captures = ANTHROPIC_SESSION.captures(user_id)?;
    let session = captures.get(1)?.as_str().to_ascii_lowercase();
    Some((session, SessionSource::Body))
}

fn extract_openai(headers: &HeaderMap, body: Option<&Value>) -> Option<(String, SessionSource)> {
    for name in OPENAI_HEADER_CANDIDATES {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok())
            && let Some(session) = sanitize(value)
        {
            return Some((session, SessionSource::Header));
        }
    }

    let body = body?;
    let body_candidates = [
        body.get("prompt_cache_key"),
        body.get("metadata").and_then(|m| m.get("session_id")),
        body.get("previous_response_id"),
    ];
    for candidate in body_candidates.into_iter().flatten() {
        if let Some(value) = candidate.as_str()
            && let Some(session) = sanitize(value)
        {
            return Some((session, SessionSource::Body));
        }
    }
    None
}

fn sanitize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_SESSION_ID_LEN {
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;
    use modelmux_common::RouteCapability;
    use serde_json::json;

    use super::{SessionSource, extract_session_id};

    const UUID: &str = "5cc6bd0f-8d8a-40b1-bb59-b63bdcedd02a";

    #[test]
    fn anthropic_session_from_metadata_user_id() {
        let body = json!({
            "metadata": { "user_id": format!("user_abc_account__session_{UUID}") }
        });
        let (session, source) = extract_session_id(
            RouteCapability::AnthropicMessages,
            &HeaderMap::new(),
            Some(&body),
        )
        .unwrap();
        assert_eq!(session, UUID);
        assert_eq!(source, SessionSource::Body);
    }

    #[test]
    fn anthropic_session_is_lowercased() {
        let upper = UUID.to_ascii_uppercase();
        let body = json!({ "metadata": { "user_id": format!("session_{upper}") } });
        let (session, _) = extract_session_id(
            RouteCapability::AnthropicMessages,
            &HeaderMap::new(),
            Some(&body),
        )
        .unwrap();
        assert_eq!(session, UUID);
    }

    #[test]
    fn anthropic_rejects_user_id_without_session_marker() {
        let body = json!({ "metadata": { "user_id": "user_plain" } });
        assert!(
            extract_session_id(
                RouteCapability::AnthropicMessages,
                &HeaderMap::new(),
                Some(&body)
            )
            .is_none()
        );
    }

    #[test]
    fn openai_prefers_headers_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "from-x".parse().unwrap());
        headers.insert("session_id", "from-plain".parse().unwrap());
        let body = json!({ "prompt_cache_key": "from-body" });

        let (session, source) = extract_session_id(
            RouteCapability::OpenaiChatCompatible,
            &headers,
            Some(&body),
        )
        .unwrap();
        assert_eq!(session, "from-plain");
        assert_eq!(source, SessionSource::Header);
    }

    #[test]
    fn openai_falls_back_to_body_candidates() {
        let body = json!({
            "metadata": { "session_id": "sess-from-metadata" },
            "previous_response_id": "resp_123"
        });
        let (session, source) =
            extract_session_id(RouteCapability::CodexResponses, &HeaderMap::new(), Some(&body))
                .unwrap();
        assert_eq!(session, "sess-from-metadata");
        assert_eq!(source, SessionSource::Body);
    }

    #[test]
    fn openai_skips_empty_and_oversized_candidates() {
        let mut headers = HeaderMap::new();
        headers.insert("session_id", "   ".parse().unwrap());
        let long = "x".repeat(129);
        let body = json!({ "prompt_cache_key": long, "previous_response_id": "resp_ok" });

        let (session, _) =
            extract_session_id(RouteCapability::OpenaiExtended, &headers, Some(&body)).unwrap();
        assert_eq!(session, "resp_ok");
    }

    #[test]
    fn exactly_128_chars_is_accepted() {
        let body = json!({ "prompt_cache_key": "k".repeat(128) });
        assert!(
            extract_session_id(
                RouteCapability::OpenaiChatCompatible,
                &HeaderMap::new(),
                Some(&body)
            )
            .is_some()
        );
    }

    #[test]
    fn gemini_capability_yields_none() {
        let body = json!({ "prompt_cache_key": "ignored" });
        assert!(
            extract_session_id(
                RouteCapability::GeminiNativeGenerate,
                &HeaderMap::new(),
                Some(&body)
            )
            .is_none()
        );
    }
}

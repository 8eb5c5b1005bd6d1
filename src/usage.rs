use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct UsageMetrics {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// Rough token estimate: characters / 4, rounded up. Good enough for session
/// accounting; exact counting is out of scope.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() as i64 + 3) / 4
}

/// Estimate prompt tokens from the joined `messages[].content` of a
/// chat-completions request body. Unknown shapes contribute nothing.
pub fn estimate_prompt_tokens(body: &Value) -> i64 {
    let Some(messages) = body.get("messages").and_then(|m| m.as_array()) else {
        return 0;
    };
    let mut joined = String::new();
    for msg in messages {
        match msg.get("content") {
            Some(Value::String(s)) => joined.push_str(s),
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                        joined.push_str(t);
                    }
                }
            }
            _ => {}
        }
    }
    estimate_tokens(&joined)
}

fn to_i64(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.parse::<f64>().ok().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    }
}

pub fn usage_from_value(usage_obj: &Value) -> UsageMetrics {
    let mut m = UsageMetrics::default();
    if let Some(v) = usage_obj.get("prompt_tokens") {
        m.prompt_tokens = to_i64(v);
    }
    if let Some(v) = usage_obj.get("completion_tokens") {
        m.completion_tokens = to_i64(v);
    }
    if let Some(v) = usage_obj.get("total_tokens") {
        m.total_tokens = to_i64(v);
    } else {
        m.total_tokens = m.prompt_tokens + m.completion_tokens;
    }
    m
}

/// Best-effort usage extraction from a complete (non-streaming) response
/// body. Any parse failure yields `None`; metrics degrade to the estimate
/// rather than failing the request.
pub fn extract_usage_from_json(v: &Value) -> Option<UsageMetrics> {
    let usage_obj = v.get("usage").filter(|u| u.is_object())?;
    Some(usage_from_value(usage_obj))
}

/// The assistant text of a non-streaming chat-completion response, if the
/// body has that shape.
pub fn extract_completion_text(v: &Value) -> Option<&str> {
    v.pointer("/choices/0/message/content")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn prompt_estimate_joins_string_and_part_contents() {
        let body = serde_json::json!({
            "model": "gpt-4",
            "messages": [
                {"role": "system", "content": "abcd"},
                {"role": "user", "content": [{"type": "text", "text": "efgh"}]},
            ]
        });
        assert_eq!(estimate_prompt_tokens(&body), 2);
    }

    #[test]
    fn prompt_estimate_tolerates_unknown_shapes() {
        assert_eq!(estimate_prompt_tokens(&serde_json::json!({"input": "x"})), 0);
        assert_eq!(
            estimate_prompt_tokens(&serde_json::json!({"messages": [{"content": 42}]})),
            0
        );
    }

    #[test]
    fn usage_extraction_defaults_total_to_sum() {
        let v = serde_json::json!({
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let u = extract_usage_from_json(&v).expect("usage");
        assert_eq!(
            u,
            UsageMetrics {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }
        );
    }

    #[test]
    fn usage_extraction_is_none_for_other_shapes() {
        assert_eq!(
            extract_usage_from_json(&serde_json::json!({"ok": true})),
            None
        );
        assert_eq!(
            extract_usage_from_json(&serde_json::json!({"usage": "n/a"})),
            None
        );
    }
}

//! Tagged-union decode of raw model replies.
//!
//! The state machine never branches on raw strings: every reply is decoded
//! into exactly one [`ModelDecision`] first. The expected shape is a JSON
//! object with an `action` field, but two lenient fallbacks are kept — a
//! bare tool-call object, and legacy STEP_DONE/REPLAN sentinels embedded in
//! free text.

use serde_json::Value;

use crate::utils::extract_json_object;

/// The one decision a reply decodes to.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDecision {
    ToolCall { name: String, arguments: Value },
    StepDone { summary: String },
    ReplanRequest { reason: String },
    Unparseable { reason: String },
}

/// Longest run of a single bracket/brace character. A degenerate model can
/// emit thousands of `}}}}` — feeding that back verbatim would poison the
/// context window.
fn longest_bracket_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut last: Option<char> = None;
    for ch in text.chars() {
        if matches!(ch, '{' | '}' | '[' | ']') && Some(ch) == last {
            current += 1;
        } else if matches!(ch, '{' | '}' | '[' | ']') {
            current = 1;
        } else {
            current = 0;
        }
        last = Some(ch);
        longest = longest.max(current);
    }
    longest
}

pub fn has_runaway_repetition(text: &str, threshold: usize) -> bool {
    threshold > 0 && longest_bracket_run(text) >= threshold
}

/// Decode one reply. `runaway_threshold` guards against degenerate output;
/// a tripped guard discards the reply and reports a diagnostic instead of
/// echoing it back.
pub fn decode_decision(reply: &str, runaway_threshold: usize) -> ModelDecision {
    if has_runaway_repetition(reply, runaway_threshold) {
        return ModelDecision::Unparseable {
            reason: format!(
                "reply discarded: runaway bracket repetition (>{runaway_threshold} consecutive)"
            ),
        };
    }

    if let Some(value) = extract_json_object(reply) {
        if let Some(decision) = decode_object(&value) {
            return decision;
        }
    }

    // Legacy sentinel markers in free text.
    if let Some(idx) = reply.find("STEP_DONE") {
        return ModelDecision::StepDone {
            summary: reply[..idx].trim().to_string(),
        };
    }
    if let Some(idx) = reply.find("REPLAN") {
        let reason = reply[idx + "REPLAN".len()..].trim();
        return ModelDecision::ReplanRequest {
            reason: if reason.is_empty() {
                "model requested a replan".to_string()
            } else {
                reason.trim_start_matches(':').trim().to_string()
            },
        };
    }

    ModelDecision::Unparseable {
        reason: "reply was neither a decision object nor a known sentinel".to_string(),
    }
}

fn decode_object(value: &Value) -> Option<ModelDecision> {
    let obj = value.as_object()?;

    match obj.get("action").and_then(|v| v.as_str()) {
        Some("tool_call") => {
            let name = obj.get("tool").and_then(|v| v.as_str())?.to_string();
            let arguments = obj.get("arguments").cloned().unwrap_or(Value::Null);
            return Some(ModelDecision::ToolCall { name, arguments });
        }
        Some("step_done") => {
            let summary = obj
                .get("summary")
                .and_then(|v| v.as_str())
                .unwrap_or("step completed")
                .to_string();
            return Some(ModelDecision::StepDone { summary });
        }
        Some("replan") => {
            let reason = obj
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("model requested a replan")
                .to_string();
            return Some(ModelDecision::ReplanRequest { reason });
        }
        Some(_) | None => {}
    }

    // Bare tool-call shape without the action wrapper.
    if let Some(name) = obj.get("tool").and_then(|v| v.as_str()) {
        return Some(ModelDecision::ToolCall {
            name: name.to_string(),
            arguments: obj.get("arguments").cloned().unwrap_or(Value::Null),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_tool_call() {
        let reply = r#"{"action": "tool_call", "tool": "read_file", "arguments": {"path": "x"}}"#;
        let decision = decode_decision(reply, 60);
        assert_eq!(
            decision,
            ModelDecision::ToolCall {
                name: "read_file".to_string(),
                arguments: json!({"path": "x"}),
            }
        );
    }

    #[test]
    fn test_decode_tool_call_wrapped_in_prose() {
        let reply = "I'll read the file first.\n```json\n{\"action\": \"tool_call\", \
                     \"tool\": \"read_file\", \"arguments\": {\"path\": \"a\"}}\n```";
        assert!(matches!(
            decode_decision(reply, 60),
            ModelDecision::ToolCall { .. }
        ));
    }

    #[test]
    fn test_decode_step_done() {
        let reply = r#"{"action": "step_done", "summary": "tests pass"}"#;
        assert_eq!(
            decode_decision(reply, 60),
            ModelDecision::StepDone {
                summary: "tests pass".to_string()
            }
        );
    }

    #[test]
    fn test_decode_replan_request() {
        let reply = r#"{"action": "replan", "reason": "file does not exist"}"#;
        assert_eq!(
            decode_decision(reply, 60),
            ModelDecision::ReplanRequest {
                reason: "file does not exist".to_string()
            }
        );
    }

    #[test]
    fn test_bare_tool_object_leniency() {
        let reply = r#"{"tool": "search_files", "arguments": {"pattern": "main"}}"#;
        assert!(matches!(
            decode_decision(reply, 60),
            ModelDecision::ToolCall { name, .. } if name == "search_files"
        ));
    }

    #[test]
    fn test_sentinel_step_done() {
        let decision = decode_decision("All checks green. STEP_DONE", 60);
        assert_eq!(
            decision,
            ModelDecision::StepDone {
                summary: "All checks green.".to_string()
            }
        );
    }

    #[test]
    fn test_sentinel_replan_with_reason() {
        let decision = decode_decision("REPLAN: the approach is wrong", 60);
        assert_eq!(
            decision,
            ModelDecision::ReplanRequest {
                reason: "the approach is wrong".to_string()
            }
        );
    }

    #[test]
    fn test_prose_is_unparseable() {
        assert!(matches!(
            decode_decision("Let me think about this.", 60),
            ModelDecision::Unparseable { .. }
        ));
    }

    #[test]
    fn test_runaway_braces_discarded() {
        let degenerate = format!("{{\"action\": {}", "}".repeat(100));
        let decision = decode_decision(&degenerate, 60);
        assert!(matches!(
            decision,
            ModelDecision::Unparseable { reason } if reason.contains("runaway")
        ));
    }

    #[test]
    fn test_runaway_threshold_respected() {
        let fine = "}".repeat(30);
        assert!(!has_runaway_repetition(&fine, 60));
        assert!(has_runaway_repetition(&"[".repeat(60), 60));
    }

    #[test]
    fn test_unknown_action_falls_through() {
        let reply = r#"{"action": "dance"}"#;
        assert!(matches!(
            decode_decision(reply, 60),
            ModelDecision::Unparseable { .. }
        ));
    }
}

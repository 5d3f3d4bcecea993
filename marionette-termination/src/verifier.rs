//! Post-hoc completion verification.

use serde::Deserialize;
use tracing::{info, warn};

use marionette_types::{LlmClient, Message, ToolCallRecord};

const VERIFICATION_PROMPT: &str = "You are a task verification assistant.

Task was: {task}

Agent claims the task is completed.

Tool calls made:
{tool_summary}

Please verify by looking at the final screenshot:
1. Does the screenshot show the expected result?
2. Were all necessary actions performed?
3. Is there any indication that the task failed or is incomplete?

Respond with JSON only:
{\"verified\": true/false, \"confidence\": 0.0-1.0, \"reason\": \"brief explanation\"}
";

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default = "default_true")]
    verified: bool,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    1.0
}

/// Cross-checks a self-declared completion against the final screenshot.
///
/// The agent saying "completed" does not make it so. When a client and a
/// screenshot are available, a (typically cheaper) model inspects the
/// screenshot plus a summary of the tool history and returns a strict
/// JSON verdict. Anything short of a parseable negative verdict passes:
/// a missing client, a missing screenshot, a transport error, or
/// unparseable output all default to verified.
#[derive(Debug, Clone)]
pub struct SuccessVerifier {
    verification_model: String,
    min_confidence: f64,
}

impl SuccessVerifier {
    /// Create a verifier.
    #[must_use]
    pub fn new(verification_model: impl Into<String>, min_confidence: f64) -> Self {
        Self {
            verification_model: verification_model.into(),
            min_confidence,
        }
    }

    /// The model this verifier asks for.
    #[must_use]
    pub fn verification_model(&self) -> &str {
        &self.verification_model
    }

    /// Verify a claimed completion. Returns `false` only on a parseable
    /// negative or low-confidence verdict.
    pub async fn verify(
        &self,
        task: &str,
        final_screenshot: Option<&str>,
        tool_history: &[ToolCallRecord],
        client: Option<&dyn LlmClient>,
    ) -> bool {
        let Some(client) = client else {
            warn!("no verification client configured, skipping verification");
            return true;
        };
        let Some(screenshot) = final_screenshot else {
            warn!("no final screenshot available, skipping verification");
            return true;
        };

        let prompt = VERIFICATION_PROMPT
            .replace("{task}", task)
            .replace("{tool_summary}", &summarize_tools(tool_history));
        let messages = vec![Message::user(prompt).with_image(screenshot)];

        let response = match client.call(&messages, &[]).await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "verification call failed, passing by default");
                return true;
            }
        };

        let Some(verdict) = response.content.as_deref().and_then(parse_verdict) else {
            warn!("failed to parse verification response, passing by default");
            return true;
        };

        info!(
            verified = verdict.verified,
            confidence = verdict.confidence,
            reason = %verdict.reason,
            "verification result"
        );

        if verdict.confidence < self.min_confidence {
            warn!(
                confidence = verdict.confidence,
                min = self.min_confidence,
                "verification confidence too low"
            );
            return false;
        }
        verdict.verified
    }
}

impl Default for SuccessVerifier {
    fn default() -> Self {
        Self::new("claude-3-haiku-20240307", 0.7)
    }
}

/// Render the last ten tool calls as one line each.
fn summarize_tools(tool_history: &[ToolCallRecord]) -> String {
    if tool_history.is_empty() {
        return "No tools were called".into();
    }

    let shown = &tool_history[tool_history.len().saturating_sub(10)..];
    let mut lines: Vec<String> = shown
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let marker = if record.error { "[err]" } else { "[ok]" };
            let args = record
                .arguments
                .as_object()
                .map(|map| {
                    map.iter()
                        .take(3)
                        .map(|(k, v)| {
                            let text: String = v.to_string().chars().take(30).collect();
                            format!("{k}={text}")
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            format!("{}. {marker} {}({args})", i + 1, record.name)
        })
        .collect();

    if tool_history.len() > 10 {
        lines.push(format!("... and {} more tools", tool_history.len() - 10));
    }
    lines.join("\n")
}

/// Parse a verdict, tolerating a surrounding markdown fence.
fn parse_verdict(text: &str) -> Option<Verdict> {
    let mut text = text.trim();
    if text.starts_with("```") {
        let without_open = text.splitn(2, '\n').nth(1).unwrap_or("");
        text = without_open.trim_end().trim_end_matches("```").trim();
    }
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marionette_types::{AgentError, LlmResponse, StopReason, ToolDefinition};
    use serde_json::json;

    struct ScriptedClient {
        reply: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn call(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
        ) -> Result<LlmResponse, AgentError> {
            Ok(LlmResponse {
                content: Some(self.reply.clone()),
                stop_reason: StopReason::EndTurn,
                tool_calls: vec![],
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    struct FailingClient;

    #[async_trait]
    impl LlmClient for FailingClient {
        async fn call(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
        ) -> Result<LlmResponse, AgentError> {
            Err(AgentError::Api {
                status: 500,
                message: "down".into(),
                retry_after: None,
            })
        }
    }

    fn record(name: &str, error: bool) -> ToolCallRecord {
        ToolCallRecord {
            name: name.into(),
            arguments: json!({"x": 1, "y": 2}),
            error,
        }
    }

    #[tokio::test]
    async fn passes_without_client_or_screenshot() {
        let verifier = SuccessVerifier::default();
        assert!(verifier.verify("task", Some("img"), &[], None).await);

        let client = ScriptedClient { reply: "{}".into() };
        assert!(verifier.verify("task", None, &[], Some(&client)).await);
    }

    #[tokio::test]
    async fn negative_verdict_fails() {
        let client = ScriptedClient {
            reply: r#"{"verified": false, "confidence": 0.9, "reason": "wrong page"}"#.into(),
        };
        let verifier = SuccessVerifier::new("haiku", 0.7);
        assert!(!verifier.verify("task", Some("img"), &[], Some(&client)).await);
    }

    #[tokio::test]
    async fn low_confidence_fails_even_when_verified() {
        let client = ScriptedClient {
            reply: r#"{"verified": true, "confidence": 0.4, "reason": "maybe"}"#.into(),
        };
        let verifier = SuccessVerifier::new("haiku", 0.7);
        assert!(!verifier.verify("task", Some("img"), &[], Some(&client)).await);
    }

    #[tokio::test]
    async fn fenced_json_is_accepted() {
        let client = ScriptedClient {
            reply: "```json\n{\"verified\": true, \"confidence\": 0.95, \"reason\": \"ok\"}\n```"
                .into(),
        };
        let verifier = SuccessVerifier::new("haiku", 0.7);
        assert!(verifier.verify("task", Some("img"), &[], Some(&client)).await);
    }

    #[tokio::test]
    async fn unparseable_reply_and_client_error_fail_open() {
        let garbled = ScriptedClient { reply: "not json at all".into() };
        let verifier = SuccessVerifier::new("haiku", 0.7);
        assert!(verifier.verify("task", Some("img"), &[], Some(&garbled)).await);
        assert!(verifier.verify("task", Some("img"), &[], Some(&FailingClient)).await);
    }

    #[test]
    fn tool_summary_shape() {
        let history: Vec<ToolCallRecord> = (0..12)
            .map(|i| record(&format!("tool{i}"), i % 2 == 0))
            .collect();
        let summary = summarize_tools(&history);
        assert!(summary.contains("... and 2 more tools"));
        assert!(summary.contains("[ok]"));
        assert!(summary.contains("[err]"));
        // Only the last ten are listed.
        assert!(!summary.contains("tool0("));
        assert!(summary.contains("tool11("));

        assert_eq!(summarize_tools(&[]), "No tools were called");
    }
}

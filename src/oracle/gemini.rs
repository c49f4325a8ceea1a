//! Gemini REST implementation of the oracle traits.
//!
//! Talks to the `generateContent` endpoint directly over reqwest.
//! Tool calls use Gemini function calling against the declarations
//! from the tool dispatch layer; verification and planning use JSON
//! response mode.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::PilotConfig;
use crate::oracle::usage::{estimate_tokens, truncate_to_tokens, UsageTracker};
use crate::oracle::{
    classify_verdict_text, Decision, DecisionOracle, DecisionRequest, OracleError, PlannedStep,
    PlannerOracle, ToolRequest, VerdictClass, Verification, VerificationRequest, VerifierOracle,
};
use crate::tools;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Ceiling for DOM text embedded in one verification request.
const VERIFIER_DOM_TOKEN_BUDGET: u64 = 50_000;

const DECISION_SYSTEM_PROMPT: &str = "\
You are a browser automation operator working toward one step goal at a time. \
Each turn you see the current URL, a reduced DOM of the page, a screenshot, and \
a log of everything done so far. Either call tools to make progress, or, when \
the goal is done or provably impossible, reply with plain text starting with \
'Step complete:' or 'Step failed:' followed by a one-sentence summary. \
Selectors must come from the reduced DOM shown to you. Ask the human only when \
you need information you cannot obtain from the page.";

const VERIFIER_SYSTEM_PROMPT: &str = "\
You are an impartial verifier. Given a step goal, the final page state and the \
action log, judge whether the goal was actually achieved. Respond with JSON \
only: {\"success\": true|false, \"message\": \"short justification\", \
\"new_goal\": \"revised goal for a retry or null\"}. Set new_goal only when the \
attempt made partial progress worth preserving.";

const PLANNER_SYSTEM_PROMPT: &str = "\
You split a user's web task into the smallest ordered list of concrete browser \
steps. Each step must be independently verifiable from page state. Respond with \
JSON only: [{\"id\": 1, \"goal\": \"...\"}, ...].";

const CLASSIFY_PROMPT: &str = "\
Classify the following final message from a browser agent. Answer with exactly \
one word: SUCCESS if it clearly states the goal was achieved, FAILURE otherwise.";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Blob {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

// Variant order matters: serde tries untagged variants top to bottom,
// and `Text` would match nothing else last.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Part {
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
    Text {
        text: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

impl Content {
    fn user(parts: Vec<Part>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }
}

#[derive(Serialize)]
struct ToolDecl {
    #[serde(rename = "functionDeclarations")]
    function_declarations: serde_json::Value,
}

#[derive(Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDecl>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    total_token_count: Option<u64>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

/// Gemini-backed oracle client shared by decision, verification and
/// planning call sites.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    config: PilotConfig,
    usage: Arc<UsageTracker>,
}

impl GeminiClient {
    pub fn new(config: PilotConfig, api_key: String, usage: Arc<UsageTracker>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            config,
            usage,
        }
    }

    /// Point the client at a different endpoint (local proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[instrument(skip_all, fields(model = %model))]
    async fn call(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, OracleError> {
        let body = serde_json::to_string(request)
            .map_err(|err| OracleError::Malformed(err.to_string()))?;
        let estimate = estimate_tokens(&body);
        let budget = self.config.budget_for(model);
        self.usage.admit(model, &budget, estimate).await;

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(OracleError::Transport(format!(
                "{model} returned {status}: {text}"
            )));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&text)
            .map_err(|err| OracleError::Malformed(format!("response envelope: {err}")))?;
        if let Some(usage) = &parsed.usage_metadata {
            if let Some(total) = usage.total_token_count {
                self.usage.record(model, estimate, total);
                debug!(model, total_tokens = total, "oracle call complete");
            }
        }
        Ok(parsed)
    }

    /// First candidate's parts, or a malformed-payload error.
    fn candidate_parts(response: GenerateContentResponse) -> Result<Vec<Part>, OracleError> {
        response
            .candidates
            .and_then(|mut candidates| {
                if candidates.is_empty() {
                    None
                } else {
                    candidates.swap_remove(0).content
                }
            })
            .map(|content| content.parts)
            .ok_or_else(|| OracleError::Malformed("no candidates in response".to_string()))
    }

    fn joined_text(parts: &[Part]) -> String {
        let mut out = String::new();
        for part in parts {
            if let Part::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// One-shot JSON-mode call used by verification and planning.
    async fn generate_json(
        &self,
        model: &str,
        system: &str,
        prompt: String,
    ) -> Result<serde_json::Value, OracleError> {
        let request = GenerateContentRequest {
            contents: vec![Content::user(vec![Part::Text { text: prompt }])],
            tools: None,
            system_instruction: Some(Content {
                role: "system".to_string(),
                parts: vec![Part::Text {
                    text: system.to_string(),
                }],
            }),
            generation_config: Some(GenerationConfig {
                response_mime_type: Some("application/json".to_string()),
                temperature: Some(0.0),
            }),
        };
        let parts = Self::candidate_parts(self.call(model, &request).await?)?;
        let text = Self::joined_text(&parts);
        serde_json::from_str(strip_code_fences(&text))
            .map_err(|err| OracleError::Malformed(format!("json mode payload: {err}")))
    }
}

/// Lay out the textual half of a decision prompt.
fn decision_prompt_text(request: &DecisionRequest) -> String {
    let mut prompt = format!("Goal: {}\nCurrent URL: {}\n", request.goal, request.url);
    if request.failure_flag {
        prompt.push_str("The previous round's tool calls FAILED; see the action log.\n");
    }
    if let Some(feedback) = &request.verifier_feedback {
        prompt.push_str(&format!(
            "A previous attempt at this goal failed verification: {feedback}\n"
        ));
    }
    if request.action_log.is_empty() {
        prompt.push_str("No actions taken yet for this goal.\n");
    } else {
        prompt.push_str("Actions so far:\n");
        for entry in &request.action_log {
            prompt.push_str(&format!("- {entry}\n"));
        }
    }
    match &request.reduced_dom {
        Some(dom) => prompt.push_str(&format!("\nReduced DOM of the current page:\n{dom}\n")),
        None => prompt.push_str("\nNo page content is available yet.\n"),
    }
    prompt
}

#[async_trait]
impl DecisionOracle for GeminiClient {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError> {
        let mut parts = Vec::new();
        for response in &request.tool_responses {
            parts.push(Part::FunctionResponse {
                function_response: FunctionResponse {
                    name: response.name.clone(),
                    response: serde_json::json!({ "result": response.result }),
                },
            });
        }
        parts.push(Part::Text {
            text: decision_prompt_text(request),
        });
        if let Some(screenshot) = &request.screenshot {
            parts.push(Part::InlineData {
                inline_data: Blob {
                    mime_type: "image/png".to_string(),
                    data: screenshot.clone(),
                },
            });
        }

        let wire = GenerateContentRequest {
            contents: vec![Content::user(parts)],
            tools: Some(vec![ToolDecl {
                function_declarations: tools::declarations(),
            }]),
            system_instruction: Some(Content {
                role: "system".to_string(),
                parts: vec![Part::Text {
                    text: DECISION_SYSTEM_PROMPT.to_string(),
                }],
            }),
            generation_config: None,
        };

        let parts = Self::candidate_parts(self.call(&self.config.decision_model, &wire).await?)?;
        let calls: Vec<ToolRequest> = parts
            .iter()
            .filter_map(|part| match part {
                Part::FunctionCall { function_call } => Some(ToolRequest {
                    name: function_call.name.clone(),
                    args: function_call.args.clone(),
                }),
                _ => None,
            })
            .collect();
        if !calls.is_empty() {
            return Ok(Decision::ToolCalls(calls));
        }

        let text = Self::joined_text(&parts);
        if text.trim().is_empty() {
            return Err(OracleError::Malformed(
                "candidate had neither tool calls nor text".to_string(),
            ));
        }
        Ok(Decision::Terminal(text.trim().to_string()))
    }

    async fn classify_verdict(&self, message: &str) -> Result<VerdictClass, OracleError> {
        let request = GenerateContentRequest {
            contents: vec![Content::user(vec![Part::Text {
                text: format!("{CLASSIFY_PROMPT}\n\nMessage:\n{message}"),
            }])],
            tools: None,
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                temperature: Some(0.0),
                ..GenerationConfig::default()
            }),
        };
        let parts = Self::candidate_parts(self.call(&self.config.verifier_model, &request).await?)?;
        let answer = Self::joined_text(&parts).trim().to_uppercase();
        if answer.starts_with("SUCCESS") {
            Ok(VerdictClass::Success)
        } else if answer.starts_with("FAILURE") {
            Ok(VerdictClass::Failure)
        } else {
            warn!(%answer, "unexpected classification answer, using text heuristic");
            Ok(classify_verdict_text(message))
        }
    }
}

#[async_trait]
impl VerifierOracle for GeminiClient {
    async fn verify(&self, request: &VerificationRequest) -> Result<Verification, OracleError> {
        let mut prompt = format!(
            "Step goal: {}\nFinal URL: {}\nAgent's final message: {}\n",
            request.goal, request.url, request.final_message
        );
        if !request.action_log.is_empty() {
            prompt.push_str("Action log:\n");
            for entry in &request.action_log {
                prompt.push_str(&format!("- {entry}\n"));
            }
        }
        if let Some(dom) = &request.reduced_dom {
            let dom = truncate_to_tokens(dom, VERIFIER_DOM_TOKEN_BUDGET);
            prompt.push_str(&format!("\nFinal reduced DOM:\n{dom}\n"));
        }

        let value = self
            .generate_json(&self.config.verifier_model, VERIFIER_SYSTEM_PROMPT, prompt)
            .await?;
        serde_json::from_value(value)
            .map_err(|err| OracleError::Malformed(format!("verification payload: {err}")))
    }
}

#[async_trait]
impl PlannerOracle for GeminiClient {
    async fn plan(&self, query: &str) -> Result<Vec<PlannedStep>, OracleError> {
        let value = self
            .generate_json(
                &self.config.planner_model,
                PLANNER_SYSTEM_PROMPT,
                format!("User task:\n{query}"),
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| OracleError::Malformed(format!("plan payload: {err}")))
    }
}

/// JSON mode occasionally still wraps the payload in a markdown fence.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[1,2]\n```"), "[1,2]");
    }

    #[test]
    fn test_part_deserializes_function_call_before_text() {
        let raw = r#"{"functionCall": {"name": "navigate", "args": {"url": "https://x"}}}"#;
        let part: Part = serde_json::from_str(raw).unwrap();
        assert!(matches!(part, Part::FunctionCall { .. }));

        let raw = r#"{"text": "Step complete: done"}"#;
        let part: Part = serde_json::from_str(raw).unwrap();
        assert!(matches!(part, Part::Text { .. }));
    }

    #[test]
    fn test_decision_prompt_mentions_failure_and_feedback() {
        let request = DecisionRequest {
            goal: "log in".to_string(),
            url: "https://example.com".to_string(),
            failure_flag: true,
            verifier_feedback: Some("password field was left empty".to_string()),
            ..DecisionRequest::default()
        };
        let prompt = decision_prompt_text(&request);
        assert!(prompt.contains("FAILED"));
        assert!(prompt.contains("password field was left empty"));
        assert!(prompt.contains("No page content is available yet."));
    }

    #[test]
    fn test_verification_payload_shape() {
        let value = serde_json::json!({
            "success": false,
            "message": "form not submitted",
            "new_goal": "submit the already-filled login form"
        });
        let verification: Verification = serde_json::from_value(value).unwrap();
        assert!(!verification.success);
        assert_eq!(
            verification.new_goal.as_deref(),
            Some("submit the already-filled login form")
        );
    }
}

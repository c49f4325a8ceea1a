//! Decision and verification oracle boundary.
//!
//! Everything behind these traits is an opaque model service: the
//! executor sends a snapshot of page state and gets back either a
//! terminal verdict or tool-call requests. Implementations live in
//! [`gemini`]; tests substitute their own doubles.

pub mod gemini;
pub mod usage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Oracle transport/format failures. Unlike tool failures these are
/// fatal for the current step.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport error: {0}")]
    Transport(String),

    #[error("oracle returned malformed payload: {0}")]
    Malformed(String),
}

/// A tool invocation as the oracle requested it: a name plus a raw
/// argument map. Typed parsing happens in the tool dispatch layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// The outcome of one tool call, echoed back to the oracle on the
/// next round. A round that failed part-way sends none of these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResponse {
    pub name: String,
    pub result: String,
}

/// One decision-round request: the oracle's complete view of the run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Current (possibly verifier-revised) step goal.
    pub goal: String,
    /// Current page URL, empty when the page has none yet.
    pub url: String,
    /// Reduced DOM text, absent when the URL is not a valid page.
    pub reduced_dom: Option<String>,
    /// Base64 PNG screenshot of the viewport.
    pub screenshot: Option<String>,
    /// Human-readable log of everything done for this goal so far.
    pub action_log: Vec<String>,
    /// Whether the previous round ended in a tool failure.
    pub failure_flag: bool,
    /// Feedback from a failed verification of a previous attempt.
    pub verifier_feedback: Option<String>,
    /// Responses for the previous round's tool calls (all or nothing).
    pub tool_responses: Vec<ToolResponse>,
}

/// What the oracle decided for one round.
#[derive(Clone, Debug)]
pub enum Decision {
    /// Free-text verdict; the round loop ends and the text is
    /// classified into success/failure.
    Terminal(String),
    /// Ordered tool calls to dispatch this round.
    ToolCalls(Vec<ToolRequest>),
}

/// Classification of a terminal verdict message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerdictClass {
    Success,
    Failure,
}

/// The per-round decision maker.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// One decision round.
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError>;

    /// Secondary call: classify a free-text terminal verdict.
    ///
    /// Implementations may answer with a model call or with the
    /// conservative [`classify_verdict_text`] heuristic; either way an
    /// ambiguous message must classify as failure.
    async fn classify_verdict(&self, message: &str) -> Result<VerdictClass, OracleError> {
        Ok(classify_verdict_text(message))
    }
}

/// Snapshot handed to the verifier after an executor claims success.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub goal: String,
    pub url: String,
    pub reduced_dom: Option<String>,
    pub screenshot: Option<String>,
    pub action_log: Vec<String>,
    /// The executor's final terminal message.
    pub final_message: String,
}

/// Verifier judgement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verification {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    /// Replacement goal for the retry when verification failed after
    /// partial progress.
    #[serde(default)]
    pub new_goal: Option<String>,
}

/// Independent post-hoc verifier.
#[async_trait]
pub trait VerifierOracle: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> Result<Verification, OracleError>;
}

/// One step as the planner model emitted it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannedStep {
    pub id: u32,
    pub goal: String,
}

/// Splits a user query into an ordered list of step goals.
#[async_trait]
pub trait PlannerOracle: Send + Sync {
    async fn plan(&self, query: &str) -> Result<Vec<PlannedStep>, OracleError>;
}

/// Conservative keyword classification of a terminal message: success
/// only on an explicit indicator, failure otherwise.
pub fn classify_verdict_text(message: &str) -> VerdictClass {
    let lower = message.to_lowercase();
    const SUCCESS_INDICATORS: &[&str] = &["complete", "success", "achieved"];
    if SUCCESS_INDICATORS.iter().any(|word| lower.contains(word)) {
        VerdictClass::Success
    } else {
        VerdictClass::Failure
    }
}

//! Step execution state machine.
//!
//! One step goal is driven to a terminal verdict through a bounded
//! loop of decision rounds. Each round sends the oracle a fresh
//! observation of the page plus the running action log, then
//! dispatches whatever tool calls come back. Tool results within a
//! round are all-or-nothing: the first failure discards every result
//! already collected that round, so the oracle never sees a round it
//! can mistake for fully applied.

use base64::Engine as _;
use tracing::{debug, info, instrument, warn};

use crate::config::PilotConfig;
use crate::dom::DomReducer;
use crate::errors::{PilotError, PilotResult};
use crate::oracle::{Decision, DecisionOracle, DecisionRequest, ToolResponse, VerdictClass};
use crate::session::ActiveSession;
use crate::tools::{self, HumanInput, ResultSink, ToolCall, ToolError};

/// Terminal result of one step attempt.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub verdict: VerdictClass,
    /// The oracle's terminal message, or the bound that tripped.
    pub message: String,
    /// Everything done during the attempt, for the verifier.
    pub action_log: Vec<String>,
    /// The reduced DOM last shown to the oracle, if any page was
    /// observed. Verification prefers a live snapshot and falls back
    /// to this.
    pub last_reduced_dom: Option<String>,
}

impl StepOutcome {
    fn failed(
        message: impl Into<String>,
        action_log: Vec<String>,
        last_reduced_dom: Option<String>,
    ) -> Self {
        Self {
            verdict: VerdictClass::Failure,
            message: message.into(),
            action_log,
            last_reduced_dom,
        }
    }
}

/// Drives single step goals against a browser session.
pub struct StepExecutor<'a> {
    oracle: &'a dyn DecisionOracle,
    reducer: &'a DomReducer,
    sink: &'a dyn ResultSink,
    human: &'a dyn HumanInput,
    config: &'a PilotConfig,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        oracle: &'a dyn DecisionOracle,
        reducer: &'a DomReducer,
        sink: &'a dyn ResultSink,
        human: &'a dyn HumanInput,
        config: &'a PilotConfig,
    ) -> Self {
        Self {
            oracle,
            reducer,
            sink,
            human,
            config,
        }
    }

    /// Execute one attempt at `goal` to a terminal outcome.
    ///
    /// `verifier_feedback` carries the message from a failed
    /// verification of a previous attempt at the same step.
    #[instrument(skip_all, fields(goal = %goal))]
    pub async fn execute_step(
        &self,
        session: &mut ActiveSession,
        goal: &str,
        verifier_feedback: Option<&str>,
    ) -> PilotResult<StepOutcome> {
        let mut retry_count: u32 = 0;
        let mut tool_call_count: u32 = 0;
        let mut action_log: Vec<String> = Vec::new();
        let mut pending_responses: Vec<ToolResponse> = Vec::new();
        let mut failure_flag = false;
        let mut observed_url: Option<String> = None;
        let mut observation: Observation = Observation::default();

        loop {
            if retry_count >= self.config.max_retries {
                warn!(retry_count, "retry budget exhausted");
                return Ok(StepOutcome::failed(
                    format!("Step failed: {retry_count} failed rounds while working on this goal."),
                    action_log,
                    observation.reduced_dom,
                ));
            }

            let current_url = session.page().url().await.unwrap_or_default();
            if observed_url.as_deref() != Some(current_url.as_str()) {
                observation = self.observe(session, &current_url).await;
                observed_url = Some(current_url.clone());
            }

            let request = DecisionRequest {
                goal: goal.to_string(),
                url: current_url.clone(),
                reduced_dom: observation.reduced_dom.clone(),
                screenshot: observation.screenshot.clone(),
                action_log: action_log.clone(),
                failure_flag,
                verifier_feedback: verifier_feedback.map(str::to_string),
                tool_responses: std::mem::take(&mut pending_responses),
            };

            let decision = self
                .oracle
                .decide(&request)
                .await
                .map_err(|err| PilotError::oracle(err.to_string()))?;

            let calls = match decision {
                Decision::Terminal(message) => {
                    info!(%message, "terminal verdict received");
                    let verdict = self
                        .oracle
                        .classify_verdict(&message)
                        .await
                        .map_err(|err| PilotError::oracle(err.to_string()))?;
                    return Ok(StepOutcome {
                        verdict,
                        message,
                        action_log,
                        last_reduced_dom: observation.reduced_dom,
                    });
                }
                Decision::ToolCalls(calls) => calls,
            };

            // One round of dispatches. Collected results only become
            // visible to the oracle if every call in the round lands.
            failure_flag = false;
            let mut round_responses: Vec<ToolResponse> = Vec::new();
            let mut url_may_have_changed = false;

            for raw_call in &calls {
                tool_call_count += 1;
                if tool_call_count > self.config.max_consecutive_tool_calls {
                    warn!(tool_call_count, "tool call budget exhausted");
                    return Ok(StepOutcome::failed(
                        format!(
                            "Step failed: exceeded {} tool calls without a verdict.",
                            self.config.max_consecutive_tool_calls
                        ),
                        action_log,
                        observation.reduced_dom,
                    ));
                }

                let dispatched = match ToolCall::parse(raw_call) {
                    Ok(call) => {
                        let result = tools::dispatch(&call, session, self.sink, self.human).await;
                        match result {
                            Ok(result_text) => {
                                self.settle(&call).await;
                                if call.is_navigation() {
                                    url_may_have_changed = true;
                                }
                                Ok((call.name(), result_text))
                            }
                            Err(ToolError::UserAbort) => return Err(PilotError::UserAbort),
                            Err(err) => Err((raw_call.name.clone(), err.to_string())),
                        }
                    }
                    Err(ToolError::UserAbort) => return Err(PilotError::UserAbort),
                    Err(err) => Err((raw_call.name.clone(), err.to_string())),
                };

                match dispatched {
                    Ok((name, result_text)) => {
                        action_log.push(format!("{name}: {result_text}"));
                        round_responses.push(ToolResponse {
                            name: name.to_string(),
                            result: result_text,
                        });
                    }
                    Err((name, failure)) => {
                        warn!(tool = %name, %failure, "round failed");
                        action_log.push(format!("{name} FAILED: {failure}"));
                        round_responses.clear();
                        failure_flag = true;
                        retry_count += 1;
                        break;
                    }
                }
            }

            if !failure_flag {
                pending_responses = round_responses;
                debug!(
                    responses = pending_responses.len(),
                    "round complete, responses queued"
                );
            }
            if url_may_have_changed {
                // Force a fresh observation next round even if the URL
                // string happens to match (reload, fragment nav).
                observed_url = None;
            }
        }
    }

    async fn observe(&self, session: &ActiveSession, url: &str) -> Observation {
        let mut observation = Observation::default();
        if is_web_page(url) {
            match session.page().content().await {
                Ok(html) => observation.reduced_dom = Some(self.reducer.reduce(&html)),
                Err(err) => warn!(error = %err, "page content unavailable"),
            }
        }
        match session.page().screenshot().await {
            Ok(png) => {
                observation.screenshot =
                    Some(base64::engine::general_purpose::STANDARD.encode(png));
            }
            Err(err) => warn!(error = %err, "screenshot unavailable"),
        }
        observation
    }

    async fn settle(&self, call: &ToolCall) {
        let delay_ms = if call.is_navigation() {
            self.config.nav_settle_ms
        } else if call.is_interaction() {
            self.config.action_settle_ms
        } else {
            0
        };
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Observation {
    reduced_dom: Option<String>,
    screenshot: Option<String>,
}

/// A DOM snapshot is only meaningful for well-formed http(s) URLs
/// (not about:blank, data:, or an empty slot).
fn is_web_page(url: &str) -> bool {
    url::Url::parse(url)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_web_page_urls() {
        assert!(is_web_page("https://example.com/a?b=c"));
        assert!(is_web_page("http://localhost:8080"));
        assert!(!is_web_page("about:blank"));
        assert!(!is_web_page("data:text/html,hi"));
        assert!(!is_web_page("example.com"));
        assert!(!is_web_page(""));
    }
}

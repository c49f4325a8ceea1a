//! Behavior of the step execution loop and the orchestration above it,
//! exercised against scripted oracle and driver doubles.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use webpilot::config::PilotConfig;
use webpilot::dom::DomReducer;
use webpilot::errors::PilotError;
use webpilot::executor::StepExecutor;
use webpilot::oracle::{
    Decision, DecisionOracle, DecisionRequest, OracleError, ToolRequest, VerdictClass,
    Verification, VerificationRequest, VerifierOracle,
};
use webpilot::orchestrator::{Orchestrator, StepState};
use webpilot::planner::Step;
use webpilot::session::{
    ActiveSession, BrowserDriver, DriverError, ElementAction, PageAction, PageDriver,
};
use webpilot::tools::{HumanInput, ResultSink};

const PAGE_HTML: &str =
    "<html><body><form><input id=\"q\" type=\"text\"><button id=\"go\">Go</button></form></body></html>";

/// Page double: actions succeed unless the selector is `#bad`, and
/// every attempted driver call is recorded.
#[derive(Default)]
struct MockPage {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PageDriver for MockPage {
    async fn url(&self) -> Result<String, DriverError> {
        Ok("https://mock.test/".to_string())
    }

    async fn content(&self) -> Result<String, DriverError> {
        Ok(PAGE_HTML.to_string())
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.log.lock().push(format!("navigate {url}"));
        Ok(())
    }

    async fn act_on_element(
        &self,
        selector: &str,
        nth: usize,
        action: &ElementAction,
    ) -> Result<(), DriverError> {
        self.log
            .lock()
            .push(format!("{} {selector}", action.name()));
        if selector == "#bad" {
            return Err(DriverError::LocatorNotFound(selector.to_string(), nth));
        }
        Ok(())
    }

    async fn act_on_page(&self, action: &PageAction) -> Result<(), DriverError> {
        self.log.lock().push(action.name().to_string());
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Ok(vec![0x89, 0x50, 0x4e, 0x47])
    }
}

struct MockBrowser {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BrowserDriver for MockBrowser {
    async fn new_page(&self, url: &str) -> Result<Box<dyn PageDriver>, DriverError> {
        self.log.lock().push(format!("new_page {url}"));
        Ok(Box::new(MockPage {
            log: self.log.clone(),
        }))
    }
}

/// Oracle double replaying a scripted decision sequence and keeping
/// every request it saw.
struct ScriptedOracle {
    script: Mutex<VecDeque<Decision>>,
    seen: Mutex<Vec<DecisionRequest>>,
}

impl ScriptedOracle {
    fn new(script: Vec<Decision>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<DecisionRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError> {
        self.seen.lock().push(request.clone());
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| OracleError::Malformed("script exhausted".to_string()))
    }
}

struct NullSink;

impl ResultSink for NullSink {
    fn display(&self, _text: &str) {}

    fn persist(&self, filename: &str, _text: &str) -> std::io::Result<std::path::PathBuf> {
        Ok(std::path::PathBuf::from(filename))
    }
}

struct QueueHuman {
    answers: Mutex<VecDeque<String>>,
}

impl QueueHuman {
    fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
        }
    }
}

impl HumanInput for QueueHuman {
    fn ask(&self, _query: &str) -> std::io::Result<String> {
        Ok(self.answers.lock().pop_front().unwrap_or_default())
    }
}

fn test_config() -> PilotConfig {
    let mut config = PilotConfig::default();
    config.nav_settle_ms = 0;
    config.action_settle_ms = 0;
    config
}

fn session(log: Arc<Mutex<Vec<String>>>) -> ActiveSession {
    let browser = Arc::new(MockBrowser { log: log.clone() });
    ActiveSession::new(browser, Box::new(MockPage { log }))
}

fn call(name: &str, args: serde_json::Value) -> ToolRequest {
    ToolRequest {
        name: name.to_string(),
        args,
    }
}

fn click(selector: &str) -> ToolRequest {
    call(
        "act_on_element",
        json!({ "selector": selector, "action": { "name": "click" } }),
    )
}

async fn run_step(
    oracle: &ScriptedOracle,
    config: &PilotConfig,
    human: &dyn HumanInput,
    log: Arc<Mutex<Vec<String>>>,
    goal: &str,
) -> Result<webpilot::executor::StepOutcome, PilotError> {
    let reducer = DomReducer::new();
    let sink = NullSink;
    let executor = StepExecutor::new(oracle, &reducer, &sink, human, config);
    let mut session = session(log);
    executor.execute_step(&mut session, goal, None).await
}

#[tokio::test]
async fn test_successful_round_feeds_all_responses_back() {
    let oracle = ScriptedOracle::new(vec![
        Decision::ToolCalls(vec![
            call("navigate", json!({ "url": "https://mock.test/a" })),
            click("#go"),
        ]),
        Decision::Terminal("Step complete: form submitted.".to_string()),
    ]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let outcome = run_step(&oracle, &test_config(), &QueueHuman::new(&[]), log, "submit")
        .await
        .unwrap();

    assert_eq!(outcome.verdict, VerdictClass::Success);
    assert_eq!(outcome.action_log.len(), 2);

    let requests = oracle.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].tool_responses.is_empty());
    assert_eq!(requests[1].tool_responses.len(), 2);
    assert!(!requests[1].failure_flag);
    assert!(requests[1].reduced_dom.as_deref().unwrap().contains("id=\"go\""));
}

#[tokio::test]
async fn test_failed_call_discards_whole_round() {
    let oracle = ScriptedOracle::new(vec![
        Decision::ToolCalls(vec![
            call("navigate", json!({ "url": "https://mock.test/a" })),
            click("#bad"),
            click("#go"),
        ]),
        Decision::Terminal("Step failed: element missing.".to_string()),
    ]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let outcome = run_step(
        &oracle,
        &test_config(),
        &QueueHuman::new(&[]),
        log.clone(),
        "submit",
    )
    .await
    .unwrap();

    assert_eq!(outcome.verdict, VerdictClass::Failure);

    // The call after the failing one never ran.
    let actions = log.lock().clone();
    assert!(actions.iter().any(|a| a.starts_with("navigate")));
    assert!(actions.iter().any(|a| a == "click #bad"));
    assert!(!actions.iter().any(|a| a == "click #go"));

    // And the oracle saw zero responses for the failed round.
    let requests = oracle.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].tool_responses.is_empty());
    assert!(requests[1].failure_flag);
    assert!(requests[1]
        .action_log
        .iter()
        .any(|entry| entry.contains("FAILED")));
}

#[tokio::test]
async fn test_retry_budget_bounds_failed_rounds() {
    let oracle = ScriptedOracle::new(vec![
        Decision::ToolCalls(vec![click("#bad")]),
        Decision::ToolCalls(vec![click("#bad")]),
        Decision::ToolCalls(vec![click("#bad")]),
    ]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let outcome = run_step(&oracle, &test_config(), &QueueHuman::new(&[]), log, "submit")
        .await
        .unwrap();

    assert_eq!(outcome.verdict, VerdictClass::Failure);
    assert!(outcome.message.contains("3"));
    // Exactly max_retries decision rounds happened, then the loop quit
    // without consulting the oracle again.
    assert_eq!(oracle.requests().len(), 3);
}

#[tokio::test]
async fn test_tool_call_budget_bounds_a_step() {
    let mut config = test_config();
    config.max_consecutive_tool_calls = 3;
    let oracle = ScriptedOracle::new(vec![
        Decision::ToolCalls(vec![click("#go"), click("#go")]),
        Decision::ToolCalls(vec![click("#go"), click("#go")]),
    ]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let outcome = run_step(&oracle, &config, &QueueHuman::new(&[]), log.clone(), "spam")
        .await
        .unwrap();

    assert_eq!(outcome.verdict, VerdictClass::Failure);
    assert!(outcome.message.contains("tool calls"));
    // 3 dispatches happened, the 4th tripped the bound before running.
    assert_eq!(log.lock().iter().filter(|a| *a == "click #go").count(), 3);
}

#[tokio::test]
async fn test_unknown_tool_is_a_round_failure() {
    let oracle = ScriptedOracle::new(vec![
        Decision::ToolCalls(vec![call("teleport", json!({}))]),
        Decision::Terminal("Step complete: done.".to_string()),
    ]);
    let log = Arc::new(Mutex::new(Vec::new()));
    run_step(&oracle, &test_config(), &QueueHuman::new(&[]), log, "go")
        .await
        .unwrap();

    let requests = oracle.requests();
    assert!(requests[1].failure_flag);
    assert!(requests[1].tool_responses.is_empty());
    assert!(requests[1]
        .action_log
        .iter()
        .any(|entry| entry.contains("unknown tool")));
}

#[tokio::test]
async fn test_abort_answer_stops_the_run() {
    let oracle = ScriptedOracle::new(vec![Decision::ToolCalls(vec![call(
        "ask_human",
        json!({ "query": "continue?" }),
    )])]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let result = run_step(
        &oracle,
        &test_config(),
        &QueueHuman::new(&["ABORT"]),
        log,
        "ask",
    )
    .await;

    assert!(matches!(result, Err(PilotError::UserAbort)));
}

#[tokio::test]
async fn test_human_answer_flows_into_responses() {
    let oracle = ScriptedOracle::new(vec![
        Decision::ToolCalls(vec![call("ask_human", json!({ "query": "which one?" }))]),
        Decision::Terminal("Step complete: chose blue.".to_string()),
    ]);
    let log = Arc::new(Mutex::new(Vec::new()));
    run_step(
        &oracle,
        &test_config(),
        &QueueHuman::new(&["the blue one"]),
        log,
        "pick",
    )
    .await
    .unwrap();

    let requests = oracle.requests();
    assert!(requests[1].tool_responses[0].result.contains("the blue one"));
}

/// Verifier double replaying a scripted sequence.
struct ScriptedVerifier {
    script: Mutex<VecDeque<Verification>>,
}

#[async_trait]
impl VerifierOracle for ScriptedVerifier {
    async fn verify(&self, _request: &VerificationRequest) -> Result<Verification, OracleError> {
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| OracleError::Malformed("verifier script exhausted".to_string()))
    }
}

#[tokio::test]
async fn test_verifier_revision_retries_with_new_goal() {
    let oracle = ScriptedOracle::new(vec![
        Decision::Terminal("Step complete: filled the form.".to_string()),
        Decision::Terminal("Step complete: form actually submitted.".to_string()),
    ]);
    let verifier = ScriptedVerifier {
        script: Mutex::new(
            vec![
                Verification {
                    success: false,
                    message: Some("form filled but never submitted".to_string()),
                    new_goal: Some("submit the already-filled form".to_string()),
                },
                Verification {
                    success: true,
                    message: None,
                    new_goal: None,
                },
            ]
            .into(),
        ),
    };

    let config = test_config();
    let reducer = DomReducer::new();
    let sink = NullSink;
    let human = QueueHuman::new(&[]);
    let orchestrator = Orchestrator::new(&oracle, &verifier, &reducer, &sink, &human, &config);

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut session = session(log);
    let steps = vec![Step {
        id: 1,
        goal: "submit the form".to_string(),
    }];
    let report = orchestrator.run(&mut session, &steps).await.unwrap();

    assert!(report.success);
    let step = &report.steps[0];
    assert_eq!(step.state, StepState::Succeeded);
    assert_eq!(step.attempts, 2);
    assert_eq!(step.goal, "submit the form");
    assert_eq!(step.final_goal, "submit the already-filled form");

    // The retry's decision rounds carried the verifier's feedback.
    let requests = oracle.requests();
    assert_eq!(
        requests[1].verifier_feedback.as_deref(),
        Some("form filled but never submitted")
    );
    assert_eq!(requests[1].goal, "submit the already-filled form");
}

#[tokio::test]
async fn test_executor_failures_spend_retries_then_fail_fast() {
    // Every execution attempt hits a login wall; the step burns its
    // 1 + max_step_retries attempts without ever reaching the
    // verifier, then the run stops before step 2.
    let oracle = ScriptedOracle::new(vec![
        Decision::Terminal("Step failed: login wall.".to_string()),
        Decision::Terminal("Step failed: login wall.".to_string()),
        Decision::Terminal("Step failed: login wall.".to_string()),
    ]);
    let verifier = ScriptedVerifier {
        script: Mutex::new(VecDeque::new()),
    };

    let config = test_config();
    let reducer = DomReducer::new();
    let sink = NullSink;
    let human = QueueHuman::new(&[]);
    let orchestrator = Orchestrator::new(&oracle, &verifier, &reducer, &sink, &human, &config);

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut session = session(log);
    let steps = vec![
        Step {
            id: 1,
            goal: "log in".to_string(),
        },
        Step {
            id: 2,
            goal: "download report".to_string(),
        },
    ];
    let report = orchestrator.run(&mut session, &steps).await.unwrap();

    assert!(!report.success);
    let step = &report.steps[0];
    assert_eq!(step.state, StepState::Failed);
    assert_eq!(step.attempts, 3);
    assert_eq!(step.message.as_deref(), Some("Step failed: login wall."));
    // The second step never started, and the empty verifier script was
    // never consulted (a verify call would have errored the run).
    assert_eq!(report.steps[1].state, StepState::Pending);
    assert_eq!(oracle.requests().len(), 3);
}

#[tokio::test]
async fn test_step_retry_budget_exhausts() {
    // Executor always claims success, verifier never agrees: 1 initial
    // attempt plus max_step_retries re-executions, then the step fails.
    let oracle = ScriptedOracle::new(vec![
        Decision::Terminal("Step complete: done.".to_string()),
        Decision::Terminal("Step complete: done.".to_string()),
        Decision::Terminal("Step complete: done.".to_string()),
    ]);
    let rejection = Verification {
        success: false,
        message: Some("nothing actually changed".to_string()),
        new_goal: None,
    };
    let verifier = ScriptedVerifier {
        script: Mutex::new(vec![rejection.clone(), rejection.clone(), rejection].into()),
    };

    let config = test_config();
    let reducer = DomReducer::new();
    let sink = NullSink;
    let human = QueueHuman::new(&[]);
    let orchestrator = Orchestrator::new(&oracle, &verifier, &reducer, &sink, &human, &config);

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut session = session(log);
    let steps = vec![Step {
        id: 1,
        goal: "change something".to_string(),
    }];
    let report = orchestrator.run(&mut session, &steps).await.unwrap();

    assert!(!report.success);
    let step = &report.steps[0];
    assert_eq!(step.state, StepState::Failed);
    assert_eq!(step.attempts, 3);
    assert_eq!(step.message.as_deref(), Some("nothing actually changed"));
}

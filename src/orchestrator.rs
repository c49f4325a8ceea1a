//! Plan-execute-verify orchestration.
//!
//! Runs the planned steps in order. Each step moves through a small
//! state machine: it executes to a terminal verdict, a successful
//! verdict is independently verified, and both executor failures and
//! failed verifications re-enter execution, the latter with a revised
//! goal. Step ids never change; only the goal text is revised. The
//! first step that exhausts its retries fails the run.

use tracing::{error, info, instrument, warn};

use crate::config::PilotConfig;
use crate::dom::DomReducer;
use crate::errors::PilotResult;
use crate::executor::StepExecutor;
use crate::oracle::{DecisionOracle, VerdictClass, VerifierOracle};
use crate::planner::Step;
use crate::session::ActiveSession;
use crate::tools::{HumanInput, ResultSink};
use crate::verifier::StepVerifier;

/// Lifecycle of one step within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Executing,
    Succeeded,
    Failed,
}

/// Final record of one step.
#[derive(Clone, Debug)]
pub struct StepReport {
    pub id: u32,
    /// Goal as originally planned.
    pub goal: String,
    /// Goal text after any verifier revisions.
    pub final_goal: String,
    pub state: StepState,
    /// Executions performed (1 plus verification-driven retries).
    pub attempts: u32,
    /// Last terminal or verification message.
    pub message: Option<String>,
}

/// Outcome of a whole run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub success: bool,
    pub steps: Vec<StepReport>,
}

pub struct Orchestrator<'a> {
    decision: &'a dyn DecisionOracle,
    verifier: &'a dyn VerifierOracle,
    reducer: &'a DomReducer,
    sink: &'a dyn ResultSink,
    human: &'a dyn HumanInput,
    config: &'a PilotConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        decision: &'a dyn DecisionOracle,
        verifier: &'a dyn VerifierOracle,
        reducer: &'a DomReducer,
        sink: &'a dyn ResultSink,
        human: &'a dyn HumanInput,
        config: &'a PilotConfig,
    ) -> Self {
        Self {
            decision,
            verifier,
            reducer,
            sink,
            human,
            config,
        }
    }

    /// Run planned steps in order, fail-fast.
    #[instrument(skip_all, fields(steps = steps.len()))]
    pub async fn run(
        &self,
        session: &mut ActiveSession,
        steps: &[Step],
    ) -> PilotResult<RunReport> {
        let mut reports: Vec<StepReport> = steps
            .iter()
            .map(|step| StepReport {
                id: step.id,
                goal: step.goal.clone(),
                final_goal: step.goal.clone(),
                state: StepState::Pending,
                attempts: 0,
                message: None,
            })
            .collect();

        for (index, step) in steps.iter().enumerate() {
            let report = &mut reports[index];
            report.state = StepState::Executing;
            let succeeded = self.run_step(session, report).await?;
            if !succeeded {
                error!(step = step.id, "step failed, aborting run");
                return Ok(RunReport {
                    success: false,
                    steps: reports,
                });
            }
        }

        info!("all steps succeeded");
        Ok(RunReport {
            success: true,
            steps: reports,
        })
    }

    /// Drive one step to Succeeded or Failed, updating its report.
    async fn run_step(
        &self,
        session: &mut ActiveSession,
        report: &mut StepReport,
    ) -> PilotResult<bool> {
        let executor = StepExecutor::new(
            self.decision,
            self.reducer,
            self.sink,
            self.human,
            self.config,
        );
        let verifier = StepVerifier::new(self.verifier, self.reducer);

        let mut goal = report.goal.clone();
        let mut feedback: Option<String> = None;

        // 1 initial execution plus max_step_retries re-executions,
        // spent by executor failures and failed verifications alike.
        for attempt in 0..=self.config.max_step_retries {
            report.attempts = attempt + 1;
            info!(step = report.id, attempt = report.attempts, goal = %goal, "executing step");

            let outcome = executor
                .execute_step(session, &goal, feedback.as_deref())
                .await?;
            report.message = Some(outcome.message.clone());

            if outcome.verdict == VerdictClass::Failure {
                // A spent attempt like any other; skip verification
                // and re-enter execution until the outer bound trips.
                warn!(
                    step = report.id,
                    attempt = report.attempts,
                    message = %outcome.message,
                    "executor reported failure, retrying"
                );
                continue;
            }

            let verification = verifier.verify_step(session, &goal, &outcome).await?;
            if verification.success {
                report.state = StepState::Succeeded;
                report.final_goal = goal;
                return Ok(true);
            }

            feedback = verification.message.clone();
            if let Some(new_goal) = verification.new_goal {
                let new_goal = new_goal.trim().to_string();
                if !new_goal.is_empty() && new_goal != goal {
                    info!(step = report.id, revised_goal = %new_goal, "goal revised by verifier");
                    goal = new_goal;
                }
            }
            warn!(
                step = report.id,
                attempt = report.attempts,
                "verification failed, retrying"
            );
        }

        report.state = StepState::Failed;
        report.final_goal = goal;
        if let Some(feedback) = feedback {
            report.message = Some(feedback);
        }
        Ok(false)
    }
}

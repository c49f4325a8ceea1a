//! Post-step verification.
//!
//! After the executor claims success, the step is re-judged by an
//! independent oracle against the final page state. The judgement can
//! also carry a revised goal so a retry picks up from the partial
//! progress instead of starting over.

use base64::Engine as _;
use tracing::{info, instrument, warn};

use crate::dom::DomReducer;
use crate::errors::{PilotError, PilotResult};
use crate::executor::StepOutcome;
use crate::oracle::{Verification, VerificationRequest, VerifierOracle};
use crate::session::ActiveSession;

pub struct StepVerifier<'a> {
    oracle: &'a dyn VerifierOracle,
    reducer: &'a DomReducer,
}

impl<'a> StepVerifier<'a> {
    pub fn new(oracle: &'a dyn VerifierOracle, reducer: &'a DomReducer) -> Self {
        Self { oracle, reducer }
    }

    /// Judge a completed step attempt against the live page.
    #[instrument(skip_all, fields(goal = %goal))]
    pub async fn verify_step(
        &self,
        session: &ActiveSession,
        goal: &str,
        outcome: &StepOutcome,
    ) -> PilotResult<Verification> {
        let url = session.page().url().await.unwrap_or_default();

        let reduced_dom = match session.page().content().await {
            Ok(html) => Some(self.reducer.reduce(&html)),
            Err(err) => {
                warn!(error = %err, "page content unavailable, verifying against last observation");
                outcome.last_reduced_dom.clone()
            }
        };
        let screenshot = match session.page().screenshot().await {
            Ok(png) => Some(base64::engine::general_purpose::STANDARD.encode(png)),
            Err(err) => {
                warn!(error = %err, "screenshot unavailable for verification");
                None
            }
        };

        let request = VerificationRequest {
            goal: goal.to_string(),
            url,
            reduced_dom,
            screenshot,
            action_log: outcome.action_log.clone(),
            final_message: outcome.message.clone(),
        };

        let verification = self
            .oracle
            .verify(&request)
            .await
            .map_err(|err| PilotError::oracle(err.to_string()))?;
        info!(
            success = verification.success,
            revised = verification.new_goal.is_some(),
            "verification complete"
        );
        Ok(verification)
    }
}

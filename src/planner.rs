//! Query planning.
//!
//! Turns the user's free-form task into an ordered list of step goals.
//! The planner oracle's output is normalized here: ids are reassigned
//! sequentially so downstream code can rely on them, and degenerate
//! plans are rejected before a browser ever launches.

use tracing::{info, instrument};

use crate::errors::{PilotError, PilotResult};
use crate::oracle::PlannerOracle;

/// One planned step. The id is stable for the whole run; only the
/// goal text may later be revised by verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub id: u32,
    pub goal: String,
}

/// Plan `query` into executable steps.
#[instrument(skip_all)]
pub async fn plan_steps(oracle: &dyn PlannerOracle, query: &str) -> PilotResult<Vec<Step>> {
    let query = query.trim();
    if query.is_empty() {
        return Err(PilotError::planning("empty query"));
    }

    let planned = oracle
        .plan(query)
        .await
        .map_err(|err| PilotError::planning(err.to_string()))?;

    let steps: Vec<Step> = planned
        .into_iter()
        .filter_map(|step| {
            let goal = step.goal.trim().to_string();
            if goal.is_empty() {
                None
            } else {
                Some(goal)
            }
        })
        .enumerate()
        .map(|(index, goal)| Step {
            id: index as u32 + 1,
            goal,
        })
        .collect();

    if steps.is_empty() {
        return Err(PilotError::planning("planner produced no usable steps"));
    }
    info!(steps = steps.len(), "plan ready");
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{OracleError, PlannedStep};
    use async_trait::async_trait;

    struct FixedPlanner(Vec<PlannedStep>);

    #[async_trait]
    impl PlannerOracle for FixedPlanner {
        async fn plan(&self, _query: &str) -> Result<Vec<PlannedStep>, OracleError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_ids_are_renumbered_and_blanks_dropped() {
        let planner = FixedPlanner(vec![
            PlannedStep {
                id: 7,
                goal: " open the login page ".to_string(),
            },
            PlannedStep {
                id: 7,
                goal: "   ".to_string(),
            },
            PlannedStep {
                id: 2,
                goal: "sign in".to_string(),
            },
        ]);
        let steps = plan_steps(&planner, "log me in").await.unwrap();
        assert_eq!(
            steps,
            vec![
                Step {
                    id: 1,
                    goal: "open the login page".to_string()
                },
                Step {
                    id: 2,
                    goal: "sign in".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let planner = FixedPlanner(vec![]);
        let err = plan_steps(&planner, "   ").await.unwrap_err();
        assert!(matches!(err, PilotError::Planning(_)));
    }

    #[tokio::test]
    async fn test_empty_plan_rejected() {
        let planner = FixedPlanner(vec![]);
        let err = plan_steps(&planner, "do something").await.unwrap_err();
        assert!(matches!(err, PilotError::Planning(_)));
    }
}

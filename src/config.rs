//! Runtime configuration for a webpilot run.
//!
//! Defaults mirror the agent's tuned values; a JSON config file and
//! `WEBPILOT_*` environment variables can override them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};

/// Per-model call budget, enforced by the usage tracker over a
/// one-minute sliding window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelBudget {
    /// Requests allowed per minute.
    pub requests_per_minute: u32,
    /// Tokens allowed per minute (prompt + output).
    pub tokens_per_minute: u64,
}

impl Default for ModelBudget {
    fn default() -> Self {
        Self {
            requests_per_minute: 15,
            tokens_per_minute: 1_000_000,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    /// Model used to split the user query into steps.
    pub planner_model: String,
    /// Model consulted each decision round.
    pub decision_model: String,
    /// Model used for step verification and verdict classification.
    pub verifier_model: String,

    /// Failed rounds allowed per step before the step is declared failed.
    pub max_retries: u32,
    /// Total tool dispatches allowed per step.
    pub max_consecutive_tool_calls: u32,
    /// Verification-driven re-executions allowed per step.
    pub max_step_retries: u32,

    /// Run the browser without a visible window.
    pub headless: bool,
    /// Directory for persisted result files.
    pub results_dir: PathBuf,

    /// Extra custom-element tag names treated as interactive seeds by
    /// the DOM reduction engine (e.g. site-specific web components).
    pub custom_interactive_tags: Vec<String>,

    /// Settling delay after a navigation-class tool call, in ms.
    pub nav_settle_ms: u64,
    /// Settling delay after any other mutating tool call, in ms.
    pub action_settle_ms: u64,

    /// Per-model request/token budgets.
    pub model_budgets: HashMap<String, ModelBudget>,
}

impl Default for PilotConfig {
    fn default() -> Self {
        let mut model_budgets = HashMap::new();
        model_budgets.insert(
            "gemini-2.5-pro".to_string(),
            ModelBudget {
                requests_per_minute: 5,
                tokens_per_minute: 1_000_000,
            },
        );
        model_budgets.insert("gemini-2.0-flash".to_string(), ModelBudget::default());

        Self {
            planner_model: "gemini-2.5-pro".to_string(),
            decision_model: "gemini-2.0-flash".to_string(),
            verifier_model: "gemini-2.0-flash".to_string(),
            max_retries: 3,
            max_consecutive_tool_calls: 20,
            max_step_retries: 2,
            headless: false,
            results_dir: PathBuf::from("results"),
            custom_interactive_tags: Vec::new(),
            nav_settle_ms: 1_000,
            action_settle_ms: 500,
            model_budgets,
        }
    }
}

impl PilotConfig {
    /// Load configuration: defaults, then an optional JSON file, then
    /// environment variable overrides.
    pub fn load(config_file: Option<&Path>) -> PilotResult<Self> {
        let mut config = match config_file {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                serde_json::from_str(&content)
                    .map_err(|err| PilotError::planning(format!("invalid config file: {err}")))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `WEBPILOT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(headless) = std::env::var("WEBPILOT_HEADLESS") {
            if let Ok(value) = headless.parse::<bool>() {
                self.headless = value;
            }
        }
        if let Ok(dir) = std::env::var("WEBPILOT_RESULTS_DIR") {
            self.results_dir = PathBuf::from(dir);
        }
        if let Ok(model) = std::env::var("WEBPILOT_DECISION_MODEL") {
            self.decision_model = model;
        }
        if let Ok(model) = std::env::var("WEBPILOT_VERIFIER_MODEL") {
            self.verifier_model = model;
        }
        if let Ok(model) = std::env::var("WEBPILOT_PLANNER_MODEL") {
            self.planner_model = model;
        }
    }

    /// Budget for a model, falling back to the default budget for
    /// models without an explicit entry.
    pub fn budget_for(&self, model: &str) -> ModelBudget {
        self.model_budgets.get(model).cloned().unwrap_or_default()
    }
}

//! Per-model usage accounting with sliding-minute budgets.
//!
//! Every oracle call is admitted through the tracker first; when a
//! model's request or token budget for the current minute is spent,
//! the caller sleeps until the window rolls over instead of failing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ModelBudget;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct ModelWindow {
    window_start: Instant,
    requests: u32,
    tokens: u64,
}

impl ModelWindow {
    fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            requests: 0,
            tokens: 0,
        }
    }
}

/// Tracks request and token consumption per model name.
#[derive(Default)]
pub struct UsageTracker {
    windows: Mutex<HashMap<String, ModelWindow>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one request for `model`, sleeping while the current
    /// minute's budget is exhausted. `estimated_tokens` reserves token
    /// budget up front; actual usage is reconciled via [`record`].
    ///
    /// [`record`]: UsageTracker::record
    pub async fn admit(&self, model: &str, budget: &ModelBudget, estimated_tokens: u64) {
        loop {
            let wait = {
                let mut windows = self.windows.lock();
                let now = Instant::now();
                let window = windows
                    .entry(model.to_string())
                    .or_insert_with(|| ModelWindow::fresh(now));
                if now.duration_since(window.window_start) >= WINDOW {
                    *window = ModelWindow::fresh(now);
                }

                let requests_left = window.requests < budget.requests_per_minute;
                let tokens_left =
                    window.tokens.saturating_add(estimated_tokens) <= budget.tokens_per_minute;
                if requests_left && tokens_left {
                    window.requests += 1;
                    window.tokens = window.tokens.saturating_add(estimated_tokens);
                    None
                } else {
                    Some(WINDOW.saturating_sub(now.duration_since(window.window_start)))
                }
            };

            match wait {
                None => return,
                Some(delay) => {
                    warn!(model, delay_ms = delay.as_millis() as u64, "budget exhausted, waiting");
                    tokio::time::sleep(delay.max(Duration::from_millis(100))).await;
                }
            }
        }
    }

    /// Reconcile actual token usage after a call completed. The
    /// estimate reserved in [`admit`] is replaced by the real count.
    ///
    /// [`admit`]: UsageTracker::admit
    pub fn record(&self, model: &str, estimated_tokens: u64, actual_tokens: u64) {
        let mut windows = self.windows.lock();
        if let Some(window) = windows.get_mut(model) {
            window.tokens = window
                .tokens
                .saturating_sub(estimated_tokens)
                .saturating_add(actual_tokens);
            debug!(model, tokens = window.tokens, "usage recorded");
        }
    }

    /// Tokens consumed by `model` in the current window.
    pub fn tokens_used(&self, model: &str) -> u64 {
        let windows = self.windows.lock();
        windows.get(model).map(|window| window.tokens).unwrap_or(0)
    }
}

/// Crude token estimate for budgeting: four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

/// Trim `text` to roughly `max_tokens` worth of characters, appending
/// a marker when anything was cut. Used to keep large reduced-DOM
/// payloads inside a single request's token budget.
pub fn truncate_to_tokens(text: &str, max_tokens: u64) -> String {
    let max_chars = (max_tokens.saturating_mul(4)) as usize;
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("\n...[content truncated]");
    cut
}

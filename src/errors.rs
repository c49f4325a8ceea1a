use thiserror::Error;

use crate::tools::ToolError;

/// Errors surfaced by the webpilot run pipeline.
///
/// Tool-level failures are deliberately *not* represented here while a
/// step is executing: they are absorbed by the step executor and fed
/// back to the decision oracle as structured failure strings. Only the
/// conditions that must escape the executor appear as variants.
#[derive(Debug, Error)]
pub enum PilotError {
    /// The decision or verifier oracle itself could not be reached
    /// (transport, auth, malformed response envelope). Aborts the
    /// current step immediately.
    #[error("oracle call failed: {0}")]
    OracleUnreachable(String),

    /// The planner produced no usable steps for the query.
    #[error("planning failed: {0}")]
    Planning(String),

    /// The user answered an ask-human prompt with the abort sentinel.
    /// Stops the entire run, bypassing step retries.
    #[error("user aborted the run")]
    UserAbort,

    /// Browser session could not be established or was lost.
    #[error("browser session error: {0}")]
    Session(String),

    /// A tool failure escaped the executor's retry envelope. Kept for
    /// dispatch call sites outside the round loop.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Result sink or log file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PilotError {
    /// Helper for oracle transport failures.
    pub fn oracle(message: impl Into<String>) -> Self {
        Self::OracleUnreachable(message.into())
    }

    /// Helper for session-level failures.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// Helper for planning failures.
    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning(message.into())
    }
}

/// Result alias used throughout the crate.
pub type PilotResult<T> = Result<T, PilotError>;

//! webpilot: model-driven web task automation.
//!
//! A user query is planned into steps, each step is executed by a
//! decision oracle driving a real browser through a closed tool
//! catalog, and every claimed success is re-checked by an independent
//! verifier. Pages are presented to the oracle as a deterministically
//! reduced DOM so prompts stay small and selectors stay grounded.

pub mod config;
pub mod dom;
pub mod errors;
pub mod executor;
pub mod oracle;
pub mod orchestrator;
pub mod planner;
pub mod session;
pub mod tools;
pub mod verifier;

pub use config::PilotConfig;
pub use errors::{PilotError, PilotResult};

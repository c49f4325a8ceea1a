//! Browser session surface.
//!
//! The executor only sees two capability traits: [`PageDriver`] (one
//! page) and [`BrowserDriver`] (can open pages). The run owns a single
//! [`ActiveSession`]: one browser handle for the whole run and one
//! active-page slot, reassigned when an open-page tool call lands but
//! never invalidating the browser handle.

pub mod cdp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Failures raised by driver implementations. All of these are
/// recoverable from the executor's point of view: they become failure
/// strings fed back to the decision oracle.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timed out during {0}")]
    Timeout(String),

    #[error("locator '{0}' matched no element at index {1}")]
    LocatorNotFound(String, usize),

    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    #[error("driver error: {0}")]
    Other(String),
}

impl DriverError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Closed set of element-level interaction primitives.
///
/// The oracle requests these by name; unknown names are rejected at
/// parse time rather than looked up dynamically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ElementAction {
    Click,
    /// Clear the element and type `value` into it.
    Fill { value: String },
    /// Type text without clearing first.
    TypeText { text: String },
    /// Press a single named key (e.g. "Enter").
    Press { key: String },
    Check,
    Uncheck,
    SelectOption { value: String },
    Hover,
    ScrollIntoView,
}

impl ElementAction {
    /// Primitive name as the oracle spells it.
    pub fn name(&self) -> &'static str {
        match self {
            ElementAction::Click => "click",
            ElementAction::Fill { .. } => "fill",
            ElementAction::TypeText { .. } => "type_text",
            ElementAction::Press { .. } => "press",
            ElementAction::Check => "check",
            ElementAction::Uncheck => "uncheck",
            ElementAction::SelectOption { .. } => "select_option",
            ElementAction::Hover => "hover",
            ElementAction::ScrollIntoView => "scroll_into_view",
        }
    }
}

/// Closed set of page-level primitives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum PageAction {
    GoBack,
    GoForward,
    Reload,
    /// Idle for a fixed duration (settling aid the oracle may request).
    WaitMs { ms: u64 },
}

impl PageAction {
    pub fn name(&self) -> &'static str {
        match self {
            PageAction::GoBack => "go_back",
            PageAction::GoForward => "go_forward",
            PageAction::Reload => "reload",
            PageAction::WaitMs { .. } => "wait_ms",
        }
    }
}

/// One browser page.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Current page URL.
    async fn url(&self) -> Result<String, DriverError>;

    /// Full serialized markup, with open shadow roots flattened into
    /// the one tree.
    async fn content(&self) -> Result<String, DriverError>;

    /// Navigate this page.
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// Resolve `selector`, take the zero-based `nth` match, invoke the
    /// interaction primitive on it.
    async fn act_on_element(
        &self,
        selector: &str,
        nth: usize,
        action: &ElementAction,
    ) -> Result<(), DriverError>;

    /// Invoke a page-level primitive.
    async fn act_on_page(&self, action: &PageAction) -> Result<(), DriverError>;

    /// Viewport screenshot as raw PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;
}

/// The browser owning pages for one run.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open a new page in the same context, navigated to `url`.
    async fn new_page(&self, url: &str) -> Result<Box<dyn PageDriver>, DriverError>;
}

/// One run's browser handle plus the single mutable active-page slot.
pub struct ActiveSession {
    browser: Arc<dyn BrowserDriver>,
    page: Box<dyn PageDriver>,
}

impl ActiveSession {
    pub fn new(browser: Arc<dyn BrowserDriver>, page: Box<dyn PageDriver>) -> Self {
        Self { browser, page }
    }

    /// The active page.
    pub fn page(&self) -> &dyn PageDriver {
        self.page.as_ref()
    }

    /// The run-scoped browser handle.
    pub fn browser(&self) -> &Arc<dyn BrowserDriver> {
        &self.browser
    }

    /// Replace the active page (open-page tool call). The previous
    /// page object is dropped; the browser handle is untouched.
    pub fn set_page(&mut self, page: Box<dyn PageDriver>) {
        self.page = page;
    }
}

//! Closed tool catalog and dispatch.
//!
//! The decision oracle can only request the tools declared here. A
//! request is parsed into a [`ToolCall`] up front, so an unknown name
//! or a malformed argument map is rejected before anything touches the
//! browser, and dispatch itself is a total match over the enum.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::oracle::ToolRequest;
use crate::session::{ActiveSession, DriverError, ElementAction, PageAction};

/// Reply to an ask-human prompt that aborts the whole run.
pub const ABORT_SENTINEL: &str = "abort";

/// Failures raised while parsing or dispatching a single tool call.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("bad arguments for '{tool}': {message}")]
    BadArguments { tool: String, message: String },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("user aborted the run")]
    UserAbort,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    fn bad_args(tool: &str, message: impl Into<String>) -> Self {
        Self::BadArguments {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// Every tool the oracle may call, fully typed.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolCall {
    /// Navigate the active page.
    Navigate { url: String },
    /// Open a fresh page and make it the active one.
    OpenPage { url: String },
    /// Run an interaction primitive against the nth match of a CSS
    /// selector on the active page.
    ActOnElement {
        selector: String,
        nth: usize,
        action: ElementAction,
    },
    /// Run a page-level primitive on the active page.
    ActOnPage { action: PageAction },
    /// Ask the human operator a question and wait for the answer.
    AskHuman { query: String },
    /// Show result text to the operator.
    DisplayResult { text: String },
    /// Append result text to a file under the results directory.
    PersistResult { filename: String, text: String },
}

impl ToolCall {
    /// Tool name as declared to the oracle.
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::Navigate { .. } => "navigate",
            ToolCall::OpenPage { .. } => "open_page",
            ToolCall::ActOnElement { .. } => "act_on_element",
            ToolCall::ActOnPage { .. } => "act_on_page",
            ToolCall::AskHuman { .. } => "ask_human",
            ToolCall::DisplayResult { .. } => "display_result",
            ToolCall::PersistResult { .. } => "persist_result",
        }
    }

    /// Whether this call replaces or reloads the document, warranting
    /// the longer settle delay.
    pub fn is_navigation(&self) -> bool {
        matches!(
            self,
            ToolCall::Navigate { .. }
                | ToolCall::OpenPage { .. }
                | ToolCall::ActOnPage {
                    action: PageAction::GoBack | PageAction::GoForward | PageAction::Reload,
                }
        )
    }

    /// Whether this call mutates page state at all.
    pub fn is_interaction(&self) -> bool {
        matches!(self, ToolCall::ActOnElement { .. } | ToolCall::ActOnPage { .. })
    }

    /// Parse an oracle tool request into a typed call.
    pub fn parse(request: &ToolRequest) -> Result<Self, ToolError> {
        let name = request.name.as_str();
        let args = &request.args;
        match name {
            "navigate" => Ok(ToolCall::Navigate {
                url: required_str(name, args, "url")?,
            }),
            "open_page" => Ok(ToolCall::OpenPage {
                url: required_str(name, args, "url")?,
            }),
            "act_on_element" => {
                let selector = required_str(name, args, "selector")?;
                let nth = args
                    .get("nth")
                    .and_then(|value| value.as_u64())
                    .unwrap_or(0) as usize;
                let action_value = args
                    .get("action")
                    .cloned()
                    .ok_or_else(|| ToolError::bad_args(name, "missing 'action'"))?;
                let action: ElementAction = serde_json::from_value(action_value)
                    .map_err(|err| ToolError::bad_args(name, err.to_string()))?;
                Ok(ToolCall::ActOnElement {
                    selector,
                    nth,
                    action,
                })
            }
            "act_on_page" => {
                let action_value = args
                    .get("action")
                    .cloned()
                    .ok_or_else(|| ToolError::bad_args(name, "missing 'action'"))?;
                let action: PageAction = serde_json::from_value(action_value)
                    .map_err(|err| ToolError::bad_args(name, err.to_string()))?;
                Ok(ToolCall::ActOnPage { action })
            }
            "ask_human" => Ok(ToolCall::AskHuman {
                query: required_str(name, args, "query")?,
            }),
            "display_result" => Ok(ToolCall::DisplayResult {
                text: required_str(name, args, "text")?,
            }),
            "persist_result" => Ok(ToolCall::PersistResult {
                filename: required_str(name, args, "filename")?,
                text: required_str(name, args, "text")?,
            }),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn required_str(tool: &str, args: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| ToolError::bad_args(tool, format!("missing string '{key}'")))
}

/// Function declarations advertised to the oracle, in its function
/// calling schema. Kept next to [`ToolCall::parse`] so the two cannot
/// drift apart.
pub fn declarations() -> serde_json::Value {
    let action_schema = json!({
        "type": "object",
        "properties": {
            "name": {
                "type": "string",
                "description": "Interaction primitive: click, fill, type_text, press, check, uncheck, select_option, hover, scroll_into_view."
            },
            "value": { "type": "string", "description": "Value for fill/select_option." },
            "text": { "type": "string", "description": "Text for type_text." },
            "key": { "type": "string", "description": "Key name for press, e.g. Enter." }
        },
        "required": ["name"]
    });
    let page_action_schema = json!({
        "type": "object",
        "properties": {
            "name": {
                "type": "string",
                "description": "Page primitive: go_back, go_forward, reload, wait_ms."
            },
            "ms": { "type": "integer", "description": "Milliseconds for wait_ms." }
        },
        "required": ["name"]
    });

    json!([
        {
            "name": "navigate",
            "description": "Navigate the current page to an absolute URL.",
            "parameters": {
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }
        },
        {
            "name": "open_page",
            "description": "Open a new browser page at an absolute URL and switch to it.",
            "parameters": {
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }
        },
        {
            "name": "act_on_element",
            "description": "Run an interaction primitive on the nth element matching a CSS selector.",
            "parameters": {
                "type": "object",
                "properties": {
                    "selector": { "type": "string", "description": "CSS selector." },
                    "nth": { "type": "integer", "description": "Zero-based match index, default 0." },
                    "action": action_schema
                },
                "required": ["selector", "action"]
            }
        },
        {
            "name": "act_on_page",
            "description": "Run a page-level primitive on the current page.",
            "parameters": {
                "type": "object",
                "properties": { "action": page_action_schema },
                "required": ["action"]
            }
        },
        {
            "name": "ask_human",
            "description": "Ask the human operator for input (credentials, choices, confirmations).",
            "parameters": {
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }
        },
        {
            "name": "display_result",
            "description": "Show final or intermediate result text to the operator.",
            "parameters": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        },
        {
            "name": "persist_result",
            "description": "Append result text to a named file in the results directory.",
            "parameters": {
                "type": "object",
                "properties": {
                    "filename": { "type": "string" },
                    "text": { "type": "string" }
                },
                "required": ["filename", "text"]
            }
        }
    ])
}

/// Where display/persist results go.
pub trait ResultSink: Send + Sync {
    /// Show text to the operator.
    fn display(&self, text: &str);

    /// Append text to `filename`, returning the resolved path.
    fn persist(&self, filename: &str, text: &str) -> std::io::Result<PathBuf>;
}

/// Source of answers for ask-human prompts.
pub trait HumanInput: Send + Sync {
    fn ask(&self, query: &str) -> std::io::Result<String>;
}

/// Terminal-backed sink writing files under a results directory.
pub struct StdioSink {
    results_dir: PathBuf,
}

impl StdioSink {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }
}

impl ResultSink for StdioSink {
    fn display(&self, text: &str) {
        println!("\n=== RESULT ===\n{text}\n==============");
    }

    fn persist(&self, filename: &str, text: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.results_dir)?;
        let path = self.results_dir.join(safe_result_name(filename));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{text}")?;
        Ok(path)
    }
}

/// Keep persisted files inside the results directory and give
/// extension-less names a `.txt` suffix.
fn safe_result_name(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("result");
    if Path::new(base).extension().is_some() {
        base.to_string()
    } else {
        format!("{base}.txt")
    }
}

/// Terminal-backed human input.
pub struct StdioHuman;

impl HumanInput for StdioHuman {
    fn ask(&self, query: &str) -> std::io::Result<String> {
        println!("\n[input needed] {query}");
        print!("> ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        Ok(answer.trim().to_string())
    }
}

/// Execute one typed tool call against the active session.
///
/// The returned string is the tool result echoed back to the oracle on
/// the next round. Settle delays are the caller's concern.
pub async fn dispatch(
    call: &ToolCall,
    session: &mut ActiveSession,
    sink: &dyn ResultSink,
    human: &dyn HumanInput,
) -> Result<String, ToolError> {
    info!(tool = call.name(), "dispatching tool call");
    match call {
        ToolCall::Navigate { url } => {
            session.page().navigate(url).await?;
            Ok(format!("Navigated to {url}"))
        }
        ToolCall::OpenPage { url } => {
            let page = session.browser().clone().new_page(url).await?;
            session.set_page(page);
            Ok(format!("Opened new page at {url}"))
        }
        ToolCall::ActOnElement {
            selector,
            nth,
            action,
        } => {
            session.page().act_on_element(selector, *nth, action).await?;
            Ok(format!(
                "Performed {} on '{selector}' (match {nth})",
                action.name()
            ))
        }
        ToolCall::ActOnPage { action } => {
            session.page().act_on_page(action).await?;
            Ok(format!("Performed {}", action.name()))
        }
        ToolCall::AskHuman { query } => {
            let answer = human.ask(query)?;
            if answer.eq_ignore_ascii_case(ABORT_SENTINEL) {
                warn!("operator aborted via ask_human");
                return Err(ToolError::UserAbort);
            }
            Ok(format!("Human answered: {answer}"))
        }
        ToolCall::DisplayResult { text } => {
            sink.display(text);
            Ok("Result displayed".to_string())
        }
        ToolCall::PersistResult { filename, text } => {
            let path = sink.persist(filename, text)?;
            Ok(format!("Result appended to {}", path.display()))
        }
    }
}

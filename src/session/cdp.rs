//! Chromium DevTools Protocol driver backed by chromiumoxide.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrowserDriver, DriverError, ElementAction, PageAction, PageDriver};

/// Hard ceiling for any single CDP operation.
const OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Serializes the document into one markup string, inlining open
/// shadow roots as `<template shadowroot="open">` so isolated
/// sub-documents end up in the same tree the reducer walks.
const SERIALIZE_WITH_SHADOW_JS: &str = r#"
() => {
    function serializeNode(node) {
        if (node.nodeType === Node.ELEMENT_NODE) {
            const tagName = node.tagName.toLowerCase();
            const attrs = Array.from(node.attributes).map(attr =>
                `${attr.name}="${attr.value.replace(/"/g, '&quot;')}"`
            ).join(" ");
            let openingTag = `<${tagName}${attrs ? ' ' + attrs : ''}>`;
            let closingTag = `</${tagName}>`;

            let shadowHtml = "";
            if (node.shadowRoot && node.shadowRoot.mode === "open") {
                const shadowContent = Array.from(node.shadowRoot.childNodes)
                    .map(serializeNode).join("");
                shadowHtml = `<template shadowroot="open">${shadowContent}</template>`;
            }

            const childrenHtml = Array.from(node.childNodes).map(serializeNode).join("");
            return `${openingTag}${shadowHtml}${childrenHtml}${closingTag}`;
        } else if (node.nodeType === Node.TEXT_NODE) {
            return node.textContent;
        } else if (node.nodeType === Node.COMMENT_NODE) {
            return `<!--${node.textContent}-->`;
        }
        return "";
    }
    return "<!DOCTYPE html>" + serializeNode(document.documentElement);
}
"#;

/// Launch a Chromium instance and spawn its CDP event pump.
///
/// The returned join handle owns the event loop; aborting it tears
/// down the websocket.
pub async fn launch(headless: bool) -> Result<(CdpBrowser, JoinHandle<()>), DriverError> {
    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .arg("--disable-gpu")
        .arg("--disable-dev-shm-usage")
        .window_size(1280, 900);
    if let Some(executable) = find_chrome() {
        builder = builder.chrome_executable(executable);
    }
    if !headless {
        builder = builder.with_head();
    }
    let config = builder
        .build()
        .map_err(|err| DriverError::other(format!("browser config: {err}")))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|err| DriverError::other(format!("browser launch: {err}")))?;

    let pump = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                debug!("CDP event loop closed");
                break;
            }
        }
    });

    info!(headless, "chromium launched");
    Ok((CdpBrowser { browser }, pump))
}

/// Browser handle for one run.
pub struct CdpBrowser {
    browser: Browser,
}

impl CdpBrowser {
    /// Close the underlying browser process.
    pub async fn close(mut self) {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "browser close failed");
        }
    }
}

#[async_trait]
impl BrowserDriver for CdpBrowser {
    async fn new_page(&self, url: &str) -> Result<Box<dyn PageDriver>, DriverError> {
        parse_url(url)?;
        let page = timed("open page", self.browser.new_page(url))
            .await?
            .map_err(|err| DriverError::other(format!("new page: {err}")))?;
        Ok(Box::new(CdpPage { page }))
    }
}

/// One CDP page.
pub struct CdpPage {
    page: Page,
}

impl CdpPage {
    pub fn new(page: Page) -> Self {
        Self { page }
    }
}

#[async_trait]
impl PageDriver for CdpPage {
    async fn url(&self) -> Result<String, DriverError> {
        let url = timed("read url", self.page.url())
            .await?
            .map_err(|err| DriverError::other(format!("url: {err}")))?;
        Ok(url.unwrap_or_default())
    }

    async fn content(&self) -> Result<String, DriverError> {
        let result = timed(
            "serialize dom",
            self.page.evaluate_function(SERIALIZE_WITH_SHADOW_JS),
        )
            .await?
            .map_err(|err| DriverError::other(format!("serialize dom: {err}")))?;
        result
            .into_value::<String>()
            .map_err(|err| DriverError::other(format!("serialize dom result: {err}")))
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        parse_url(url)?;
        timed("navigate", self.page.goto(url))
            .await?
            .map_err(|err| DriverError::other(format!("navigate: {err}")))?;
        Ok(())
    }

    async fn act_on_element(
        &self,
        selector: &str,
        nth: usize,
        action: &ElementAction,
    ) -> Result<(), DriverError> {
        let elements = timed("resolve locator", self.page.find_elements(selector))
            .await?
            .map_err(|_| DriverError::LocatorNotFound(selector.to_string(), nth))?;
        let element = elements
            .into_iter()
            .nth(nth)
            .ok_or_else(|| DriverError::LocatorNotFound(selector.to_string(), nth))?;

        let describe = action.name();
        let result = match action {
            ElementAction::Click => timed(describe, element.click()).await?.map(|_| ()),
            ElementAction::Fill { value } => {
                timed(describe, async {
                    element.focus().await?;
                    element
                        .call_js_fn("function() { this.value = ''; }", false)
                        .await?;
                    element.type_str(value).await?;
                    Ok::<_, chromiumoxide::error::CdpError>(())
                })
                .await?
            }
            ElementAction::TypeText { text } => {
                timed(describe, async {
                    element.focus().await?;
                    element.type_str(text).await?;
                    Ok::<_, chromiumoxide::error::CdpError>(())
                })
                .await?
            }
            ElementAction::Press { key } => {
                timed(describe, async {
                    element.focus().await?;
                    element.press_key(key).await?;
                    Ok::<_, chromiumoxide::error::CdpError>(())
                })
                .await?
            }
            ElementAction::Check => {
                timed(
                    describe,
                    element.call_js_fn(
                        "function() { this.checked = true; this.dispatchEvent(new Event('change', { bubbles: true })); }",
                        false,
                    ),
                )
                .await?
                .map(|_| ())
            }
            ElementAction::Uncheck => {
                timed(
                    describe,
                    element.call_js_fn(
                        "function() { this.checked = false; this.dispatchEvent(new Event('change', { bubbles: true })); }",
                        false,
                    ),
                )
                .await?
                .map(|_| ())
            }
            ElementAction::SelectOption { value } => {
                let js = format!(
                    "function() {{ this.value = {}; this.dispatchEvent(new Event('change', {{ bubbles: true }})); }}",
                    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
                );
                timed(describe, element.call_js_fn(js, false))
                    .await?
                    .map(|_| ())
            }
            ElementAction::Hover => {
                timed(
                    describe,
                    element.call_js_fn(
                        "function() { this.dispatchEvent(new MouseEvent('mouseover', { bubbles: true })); }",
                        false,
                    ),
                )
                .await?
                .map(|_| ())
            }
            ElementAction::ScrollIntoView => {
                timed(describe, element.scroll_into_view())
                    .await?
                    .map(|_| ())
            }
        };

        result.map_err(|err| DriverError::other(format!("{describe} on '{selector}': {err}")))
    }

    async fn act_on_page(&self, action: &PageAction) -> Result<(), DriverError> {
        match action {
            PageAction::GoBack => {
                timed("go back", self.page.evaluate("history.back()"))
                    .await?
                    .map_err(|err| DriverError::other(format!("go_back: {err}")))?;
            }
            PageAction::GoForward => {
                timed("go forward", self.page.evaluate("history.forward()"))
                    .await?
                    .map_err(|err| DriverError::other(format!("go_forward: {err}")))?;
            }
            PageAction::Reload => {
                timed("reload", self.page.reload())
                    .await?
                    .map_err(|err| DriverError::other(format!("reload: {err}")))?;
            }
            PageAction::WaitMs { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
        }
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        timed(
            "screenshot",
            self.page.screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(false)
                    .build(),
            ),
        )
        .await?
        .map_err(|err| DriverError::other(format!("screenshot: {err}")))
    }
}

/// Locate a Chromium binary: the `CHROME` env var wins, then the
/// usual executable names on PATH. `None` lets chromiumoxide use its
/// own detection.
fn find_chrome() -> Option<std::path::PathBuf> {
    if let Ok(path) = std::env::var("CHROME") {
        return Some(std::path::PathBuf::from(path));
    }
    const CANDIDATES: &[&str] = &[
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ];
    CANDIDATES
        .iter()
        .find_map(|name| which::which(name).ok())
}

/// Reject malformed absolute URLs before handing them to the browser.
fn parse_url(raw: &str) -> Result<url::Url, DriverError> {
    url::Url::parse(raw).map_err(|_| DriverError::InvalidUrl(raw.to_string()))
}

/// Apply the operation ceiling to a CDP future.
async fn timed<T>(
    op: &str,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, DriverError> {
    tokio::time::timeout(OP_TIMEOUT, fut)
        .await
        .map_err(|_| DriverError::Timeout(op.to_string()))
}

//! Chrome DevTools Protocol adapter implementation

use crate::{ClipRect, Error, LaunchConfig, PdfOptions, Result, Viewport};
use base64::Engine as Base64Engine;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::{Emulation, Page, Target};
use headless_chrome::types::PrintToPdfOptions;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use serde_json::json;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle of a browsing context owned by a [`CdpEngine`]
pub type ContextId = u64;

struct CdpContext {
    browser_context_id: String,
    tab: Arc<Tab>,
}

/// CDP-based engine implementation (uses the `headless_chrome` crate)
///
/// This adapter launches a headless Chrome instance and keeps one tab per
/// isolated browser context. It is synchronous; [`crate::async_api`] drives
/// it from a dedicated thread.
pub struct CdpEngine {
    browser: Browser,
    contexts: HashMap<ContextId, CdpContext>,
    next_id: ContextId,
}

impl CdpEngine {
    /// Launch headless Chrome.
    pub fn launch(config: &LaunchConfig) -> Result<Self> {
        let args = config.browser_args();
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some(config.window))
            .path(config.executable.clone())
            .idle_browser_timeout(config.request_timeout)
            .args(args.iter().map(OsStr::new).collect())
            .build()
            .map_err(|e| Error::EngineUnavailable(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::EngineUnavailable(format!("Failed to launch browser: {}", e)))?;

        Ok(Self {
            browser,
            contexts: HashMap::new(),
            next_id: 1,
        })
    }

    /// Create an isolated browser context with one tab sized to `viewport`.
    /// A context that fails halfway is disposed again before returning.
    pub fn new_context(&mut self, viewport: Viewport) -> Result<ContextId> {
        let context = self
            .browser
            .new_context()
            .map_err(|e| Error::ContextCreation(format!("Failed to create browser context: {}", e)))?;
        let browser_context_id = context.get_id().to_string();
        let tab = match context.new_tab() {
            Ok(tab) => tab,
            Err(e) => {
                if let Err(err) = self.dispose_browser_context(&browser_context_id) {
                    warn!("{}", err);
                }
                return Err(Error::ContextCreation(format!("Failed to create tab: {}", e)));
            }
        };

        let ctx = CdpContext { browser_context_id, tab };
        if let Err(e) = set_device_metrics(&ctx.tab, viewport) {
            if let Err(err) = self.dispose(ctx) {
                warn!("{}", err);
            }
            return Err(e);
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!("cdp context {} ({}) at {:?}", id, ctx.browser_context_id, viewport);
        self.contexts.insert(id, ctx);
        Ok(id)
    }

    fn tab(&self, id: ContextId) -> Result<&Arc<Tab>> {
        self.contexts
            .get(&id)
            .map(|c| &c.tab)
            .ok_or_else(|| Error::Other(format!("Unknown browsing context {}", id)))
    }

    /// Navigate and wait for the load event. Any failure after the timeout
    /// elapsed is reported as a navigation timeout.
    pub fn navigate(&self, id: ContextId, url: &str, timeout: Duration) -> Result<()> {
        let tab = self.tab(id)?;
        tab.set_default_timeout(timeout);

        let started = Instant::now();
        tab.navigate_to(url)
            .and_then(|t| t.wait_until_navigated())
            .map(|_| ())
            .map_err(|e| {
                if started.elapsed() >= timeout {
                    Error::NavigationTimeout {
                        url: url.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    Error::LoadError {
                        url: url.to_string(),
                        reason: e.to_string(),
                    }
                }
            })
    }

    /// Evaluate an expression that yields a string.
    pub fn evaluate(&self, id: ContextId, expression: &str) -> Result<String> {
        let result = self
            .tab(id)?
            .evaluate(expression, true)
            .map_err(|e| Error::ScriptError(format!("Evaluation failed: {}", e)))?;

        match result.value {
            Some(serde_json::Value::String(s)) => Ok(s),
            Some(other) => Ok(other.to_string()),
            None => Err(Error::ScriptError("No value returned from evaluation".into())),
        }
    }

    pub fn screenshot_png(&self, id: ContextId, clip: Option<ClipRect>) -> Result<Vec<u8>> {
        let mut params = json!({
            "format": "png",
            "fromSurface": true,
            "captureBeyondViewport": clip.is_some(),
        });
        if let Some(c) = clip {
            params["clip"] = json!({
                "x": c.x,
                "y": c.y,
                "width": c.width,
                "height": c.height,
                "scale": 1.0,
            });
        }
        let method: Page::CaptureScreenshot = serde_json::from_value(params)
            .map_err(|e| Error::CaptureFailure(format!("Bad screenshot parameters: {}", e)))?;

        let data = self
            .tab(id)?
            .call_method(method)
            .map_err(|e| Error::CaptureFailure(format!("Screenshot failed: {}", e)))?
            .data;

        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::CaptureFailure(format!("Screenshot payload is not base64: {}", e)))
    }

    pub fn print_pdf(&self, id: ContextId, options: &PdfOptions) -> Result<Vec<u8>> {
        let pdf_options = PrintToPdfOptions {
            print_background: Some(options.print_background),
            paper_width: Some(options.paper_width_in),
            paper_height: Some(options.paper_height_in),
            margin_top: Some(0.0),
            margin_bottom: Some(0.0),
            margin_left: Some(0.0),
            margin_right: Some(0.0),
            page_ranges: options.page_ranges.clone(),
            prefer_css_page_size: Some(false),
            ..Default::default()
        };

        self.tab(id)?
            .print_to_pdf(Some(pdf_options))
            .map_err(|e| Error::CaptureFailure(format!("PDF export failed: {}", e)))
    }

    /// Close the tab and dispose of its browser context.
    pub fn close_context(&mut self, id: ContextId) -> Result<()> {
        let ctx = self
            .contexts
            .remove(&id)
            .ok_or_else(|| Error::Other(format!("Unknown browsing context {}", id)))?;
        self.dispose(ctx)
    }

    fn dispose(&self, ctx: CdpContext) -> Result<()> {
        if let Err(e) = ctx.tab.close(true) {
            warn!("Failed to close tab: {}", e);
        }
        self.dispose_browser_context(&ctx.browser_context_id)
    }

    fn dispose_browser_context(&self, browser_context_id: &str) -> Result<()> {
        self.browser
            .call_method(Target::DisposeBrowserContext {
                browser_context_id: browser_context_id.to_string(),
            })
            .map_err(|e| Error::CdpError(format!("Failed to dispose browser context: {}", e)))?;
        Ok(())
    }

    /// Ids of the browser contexts Chrome currently knows about.
    #[cfg(test)]
    fn browser_context_ids(&self) -> Result<Vec<String>> {
        let method: Target::GetBrowserContexts = serde_json::from_value(json!({}))
            .map_err(|e| Error::CdpError(format!("Bad request: {}", e)))?;
        self.browser
            .call_method(method)
            .map(|r| r.browser_context_ids)
            .map_err(|e| Error::CdpError(format!("Failed to list browser contexts: {}", e)))
    }

    /// Dispose of every remaining context and terminate the browser.
    pub fn close(mut self) -> Result<()> {
        let leftover: Vec<CdpContext> = self.contexts.drain().map(|(_, c)| c).collect();
        for ctx in leftover {
            if let Err(e) = self.dispose(ctx) {
                warn!("{}", e);
            }
        }
        // Dropping the browser kills the child process.
        drop(self.browser);
        Ok(())
    }
}

fn set_device_metrics(tab: &Tab, viewport: Viewport) -> Result<()> {
    // Built from the wire form so optional protocol fields stay unset.
    let metrics: Emulation::SetDeviceMetricsOverride = serde_json::from_value(json!({
        "width": viewport.width,
        "height": viewport.height,
        "deviceScaleFactor": viewport.device_scale_factor,
        "mobile": false,
    }))
    .map_err(|e| Error::ContextCreation(format!("Bad device metrics: {}", e)))?;
    tab.call_method(metrics)
        .map_err(|e| Error::ContextCreation(format!("Failed to set device metrics: {}", e)))?;
    Ok(())
}

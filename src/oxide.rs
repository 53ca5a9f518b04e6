//! chromiumoxide adapter, used as the fallback backend.
//!
//! Unlike `headless_chrome`, chromiumoxide is natively async: the DevTools
//! connection is driven by a handler stream that must be polled on its own
//! task for the browser to make progress.

use crate::{
    Backend, ClipRect, Error, LaunchConfig, PdfOptions, RenderContext, Result, Session, Viewport,
};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, PrintToPdfParams, Viewport as ClipViewport,
};
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Browser contexts whose page has closed and which still need disposing
type Disposals = Arc<Mutex<Vec<BrowserContextId>>>;

/// The `chromiumoxide` backend
#[derive(Debug, Default, Clone, Copy)]
pub struct OxideBackend;

impl OxideBackend {
    pub fn new() -> Self {
        OxideBackend
    }
}

#[async_trait]
impl Backend for OxideBackend {
    fn name(&self) -> &'static str {
        "oxide"
    }

    async fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn Session>> {
        let mut builder = BrowserConfig::builder()
            .window_size(config.window.0, config.window.1)
            .viewport(None)
            .request_timeout(config.request_timeout)
            .args(config.browser_args());
        if let Some(path) = &config.executable {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder
            .build()
            .map_err(|e| Error::EngineUnavailable(format!("Failed to build browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| Error::EngineUnavailable(format!("Failed to launch browser: {}", e)))?;

        // The connection only makes progress while the handler is polled
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("chromiumoxide handler: {}", e);
                }
            }
        });

        Ok(Box::new(OxideSession {
            browser,
            handler_task,
            disposals: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

pub struct OxideSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    disposals: Disposals,
}

impl OxideSession {
    async fn dispose_closed_contexts(&mut self) {
        let ids: Vec<BrowserContextId> = match self.disposals.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => return,
        };
        for id in ids {
            if let Err(e) = self.browser.dispose_browser_context(id).await {
                warn!("Failed to dispose browser context: {}", e);
            }
        }
    }
}

#[async_trait]
impl Session for OxideSession {
    async fn new_context(&mut self, viewport: Viewport) -> Result<Box<dyn RenderContext>> {
        self.dispose_closed_contexts().await;

        let context_id = self
            .browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await
            .map_err(|e| Error::ContextCreation(format!("Failed to create browser context: {}", e)))?;

        let page = match open_page(&self.browser, &context_id, viewport).await {
            Ok(page) => page,
            Err(e) => {
                // Disposed with the next context or at session close
                queue_disposal(&self.disposals, context_id);
                return Err(e);
            }
        };

        debug!("oxide context {:?} at {:?}", context_id, viewport);
        Ok(Box::new(OxidePage {
            page,
            context_id,
            disposals: self.disposals.clone(),
        }))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.dispose_closed_contexts().await;
        let closed = self
            .browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| Error::Other(format!("Failed to close browser: {}", e)));
        if let Err(e) = self.browser.wait().await {
            warn!("Failed to reap browser process: {}", e);
        }
        self.handler_task.abort();
        closed
    }
}

/// Open a blank page inside `context_id` and apply the device metrics. The
/// page is closed again if the metrics cannot be set.
async fn open_page(browser: &Browser, context_id: &BrowserContextId, viewport: Viewport) -> Result<Page> {
    let target = CreateTargetParams::builder()
        .url("about:blank")
        .browser_context_id(context_id.clone())
        .build()
        .map_err(Error::ContextCreation)?;
    let page = browser
        .new_page(target)
        .await
        .map_err(|e| Error::ContextCreation(format!("Failed to open page: {}", e)))?;

    let metrics = page
        .execute(SetDeviceMetricsOverrideParams::new(
            i64::from(viewport.width),
            i64::from(viewport.height),
            viewport.device_scale_factor,
            false,
        ))
        .await;
    if let Err(e) = metrics {
        if let Err(err) = page.close().await {
            warn!("Failed to close page: {}", err);
        }
        return Err(Error::ContextCreation(format!("Failed to set device metrics: {}", e)));
    }
    Ok(page)
}

fn queue_disposal(disposals: &Disposals, id: BrowserContextId) {
    if let Ok(mut pending) = disposals.lock() {
        pending.push(id);
    }
}

pub struct OxidePage {
    page: Page,
    context_id: BrowserContextId,
    disposals: Disposals,
}

#[async_trait]
impl RenderContext for OxidePage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::LoadError {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::NavigationTimeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn evaluate(&mut self, expression: &str) -> Result<String> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(Error::ScriptError)?;
        self.page
            .evaluate_expression(params)
            .await
            .map_err(|e| Error::ScriptError(format!("Evaluation failed: {}", e)))?
            .into_value::<String>()
            .map_err(|e| Error::ScriptError(format!("Expected a string result: {}", e)))
    }

    async fn screenshot_png(&mut self, clip: Option<ClipRect>) -> Result<Vec<u8>> {
        let mut params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .from_surface(true);
        if let Some(c) = clip {
            params = params
                .clip(ClipViewport {
                    x: c.x,
                    y: c.y,
                    width: c.width,
                    height: c.height,
                    scale: 1.0,
                })
                .capture_beyond_viewport(true);
        }

        self.page
            .screenshot(params.build())
            .await
            .map_err(|e| Error::CaptureFailure(format!("Screenshot failed: {}", e)))
    }

    async fn print_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>> {
        let params = PrintToPdfParams {
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

        self.page
            .pdf(params)
            .await
            .map_err(|e| Error::CaptureFailure(format!("PDF export failed: {}", e)))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let OxidePage {
            page,
            context_id,
            disposals,
        } = *self;
        let closed = page
            .close()
            .await
            .map_err(|e| Error::Other(format!("Failed to close page: {}", e)));
        queue_disposal(&disposals, context_id);
        closed
    }
}

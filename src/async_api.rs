use crate::cdp::{CdpEngine, ContextId};
use crate::{
    Backend, ClipRect, Error, LaunchConfig, PdfOptions, RenderContext, Result, Session, Viewport,
};
use async_trait::async_trait;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

enum Command {
    NewContext(Viewport, oneshot::Sender<Result<ContextId>>),
    Navigate(ContextId, String, Duration, oneshot::Sender<Result<()>>),
    Evaluate(ContextId, String, oneshot::Sender<Result<String>>),
    Screenshot(ContextId, Option<ClipRect>, oneshot::Sender<Result<Vec<u8>>>),
    PrintPdf(ContextId, PdfOptions, oneshot::Sender<Result<Vec<u8>>>),
    CloseContext(ContextId, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// The `headless_chrome` backend.
///
/// `headless_chrome` is blocking, so each session runs its engine on a
/// dedicated worker thread and async callers exchange commands with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct CdpBackend;

impl CdpBackend {
    pub fn new() -> Self {
        CdpBackend
    }
}

#[async_trait]
impl Backend for CdpBackend {
    fn name(&self) -> &'static str {
        "cdp"
    }

    async fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn Session>> {
        let session = CdpSession::spawn(config.clone()).await?;
        Ok(Box::new(session))
    }
}

/// A browser session backed by a worker thread that owns the engine.
pub struct CdpSession {
    cmd_tx: Sender<Command>,
}

/// A browsing context living on the session's worker thread.
pub struct CdpPage {
    id: ContextId,
    cmd_tx: Sender<Command>,
}

impl CdpSession {
    /// Spawn the worker thread and launch the browser on it.
    pub async fn spawn(config: LaunchConfig) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();

        thread::Builder::new()
            .name("posterpress-cdp".into())
            .spawn(move || {
                // Initialize engine on the worker thread
                let mut engine = match CdpEngine::launch(&config) {
                    Ok(e) => e,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));

                // Command loop; ends when every handle is dropped or on Close
                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        Command::NewContext(viewport, resp) => {
                            let _ = resp.send(engine.new_context(viewport));
                        }
                        Command::Navigate(id, url, timeout, resp) => {
                            let _ = resp.send(engine.navigate(id, &url, timeout));
                        }
                        Command::Evaluate(id, expr, resp) => {
                            let _ = resp.send(engine.evaluate(id, &expr));
                        }
                        Command::Screenshot(id, clip, resp) => {
                            let _ = resp.send(engine.screenshot_png(id, clip));
                        }
                        Command::PrintPdf(id, options, resp) => {
                            let _ = resp.send(engine.print_pdf(id, &options));
                        }
                        Command::CloseContext(id, resp) => {
                            let _ = resp.send(engine.close_context(id));
                        }
                        Command::Close(resp) => {
                            let _ = resp.send(engine.close());
                            return;
                        }
                    }
                }
                // Handles dropped without Close: still shut the browser down
                let _ = engine.close();
            })
            .map_err(|e| Error::EngineUnavailable(format!("Failed to spawn CDP worker: {}", e)))?;

        // Wait for the worker to report initialization success or failure
        init_rx
            .await
            .map_err(|e| Error::EngineUnavailable(format!("Worker init canceled: {}", e)))??;

        Ok(Self { cmd_tx })
    }
}

/// Send a command to the worker and await its reply. A vanished worker is
/// reported through `gone`.
async fn request<T>(
    cmd_tx: &Sender<Command>,
    make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    gone: fn(String) -> Error,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    cmd_tx
        .send(make(tx))
        .map_err(|_| gone("CDP worker has shut down".into()))?;
    rx.await.map_err(|e| gone(format!("CDP worker dropped the request: {}", e)))?
}

#[async_trait]
impl Session for CdpSession {
    async fn new_context(&mut self, viewport: Viewport) -> Result<Box<dyn RenderContext>> {
        let id = request(
            &self.cmd_tx,
            |tx| Command::NewContext(viewport, tx),
            Error::ContextCreation,
        )
        .await?;
        Ok(Box::new(CdpPage {
            id,
            cmd_tx: self.cmd_tx.clone(),
        }))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        request(&self.cmd_tx, Command::Close, Error::Other).await
    }
}

#[async_trait]
impl RenderContext for CdpPage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let url = url.to_string();
        request(
            &self.cmd_tx,
            |tx| Command::Navigate(self.id, url, timeout, tx),
            Error::Other,
        )
        .await
    }

    async fn evaluate(&mut self, expression: &str) -> Result<String> {
        let expr = expression.to_string();
        request(&self.cmd_tx, |tx| Command::Evaluate(self.id, expr, tx), Error::ScriptError).await
    }

    async fn screenshot_png(&mut self, clip: Option<ClipRect>) -> Result<Vec<u8>> {
        request(
            &self.cmd_tx,
            |tx| Command::Screenshot(self.id, clip, tx),
            Error::CaptureFailure,
        )
        .await
    }

    async fn print_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>> {
        let options = options.clone();
        request(
            &self.cmd_tx,
            |tx| Command::PrintPdf(self.id, options, tx),
            Error::CaptureFailure,
        )
        .await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        request(&self.cmd_tx, |tx| Command::CloseContext(self.id, tx), Error::Other).await
    }
}

//! posterpress
//!
//! Deterministic export of a static HTML document to high-resolution PNG
//! images and print-ready PDFs through a headless browser.
//!
//! # Features
//!
//! - **CDP Backend** (default, `cdp`): headless Chrome driven by `headless_chrome`
//! - **Oxide Backend** (default, `oxide`): headless Chrome driven by `chromiumoxide`,
//!   used as the fallback when the primary backend fails
//! - **Declarative normalization**: DOM/style fixes are data, not inline scripts
//!
//! # Example
//!
//! ```no_run
//! use posterpress::{config::ExportPlan, pipeline::Exporter};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let plan = ExportPlan::from_toml_file("demos/poster.toml")?;
//! let exporter = Exporter::with_default_backends();
//! let report = exporter.run(&plan).await;
//! for line in report.summary_lines() {
//!     println!("{}", line);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod capture;
pub mod config;
pub mod normalize;
pub mod pipeline;
pub mod report;

#[cfg(feature = "cdp")]
pub mod cdp;

// Async bridge over the synchronous CDP adapter
#[cfg(feature = "cdp")]
pub mod async_api;

#[cfg(feature = "oxide")]
pub mod oxide;

#[cfg(feature = "cdp")]
pub use async_api::CdpBackend;
#[cfg(feature = "oxide")]
pub use oxide::OxideBackend;

/// Logical viewport plus device-scale multiplier
///
/// Output pixels are logical pixels multiplied by `device_scale_factor`, so a
/// 1200x1600 viewport at scale 8 captures a 9600x12800 image.
///
/// ```
/// let v = posterpress::Viewport::new(1200, 1600, 8.0);
/// assert_eq!(v.physical_size(), (9600, 12800));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_scale")]
    pub device_scale_factor: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl Viewport {
    pub fn new(width: u32, height: u32, device_scale_factor: f64) -> Self {
        Self {
            width,
            height,
            device_scale_factor,
        }
    }

    /// Pixel dimensions of a capture covering the whole viewport.
    pub fn physical_size(&self) -> (u32, u32) {
        (
            scale_len(self.width as f64, self.device_scale_factor),
            scale_len(self.height as f64, self.device_scale_factor),
        )
    }

    /// Same logical box at scale 1, used for measurement passes.
    pub fn at_unit_scale(&self) -> Self {
        Self {
            device_scale_factor: 1.0,
            ..*self
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            device_scale_factor: 1.0,
        }
    }
}

pub(crate) fn scale_len(len: f64, scale: f64) -> u32 {
    (len * scale).ceil() as u32
}

/// A rectangle in CSS pixels relative to the document origin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Options for a single PDF export
///
/// Paper dimensions are in inches, as the DevTools protocol expects. Margins
/// are always zero and backgrounds are always printed.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfOptions {
    pub paper_width_in: f64,
    pub paper_height_in: f64,
    /// Restrict output to these pages (e.g. `"1"`)
    pub page_ranges: Option<String>,
    pub print_background: bool,
}

impl PdfOptions {
    pub fn from_inches(width: f64, height: f64) -> Self {
        Self {
            paper_width_in: width,
            paper_height_in: height,
            page_ranges: None,
            print_background: true,
        }
    }

    /// Page size given in CSS pixels (96 per inch).
    pub fn from_css_pixels(width: f64, height: f64) -> Self {
        Self::from_inches(width / CSS_PX_PER_INCH, height / CSS_PX_PER_INCH)
    }
}

/// CSS reference pixels per inch
pub const CSS_PX_PER_INCH: f64 = 96.0;

/// Options used when starting a browser
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Explicit browser executable; autodetected when `None`
    pub executable: Option<PathBuf>,
    /// Extra command-line switches passed to the browser
    pub extra_args: Vec<String>,
    /// Initial window size; contexts override it with their own metrics
    pub window: (u32, u32),
    /// Per-request timeout on the DevTools connection
    pub request_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            executable: None,
            extra_args: Vec::new(),
            window: (1280, 720),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl LaunchConfig {
    /// Switches every backend passes to the browser.
    pub fn browser_args(&self) -> Vec<String> {
        let mut args = vec!["--hide-scrollbars".to_string()];
        for a in &self.extra_args {
            if !args.contains(a) {
                args.push(a.clone());
            }
        }
        args
    }
}

/// An automation library able to start a headless rendering engine
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier used in logs and reports
    fn name(&self) -> &'static str;

    /// Start a browser and return a session handle.
    ///
    /// Fails with [`Error::EngineUnavailable`] if no compatible browser can be
    /// located or launched.
    async fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn Session>>;
}

/// A running browser process
#[async_trait]
pub trait Session: Send {
    /// Create an isolated browsing context with its own viewport and scale.
    async fn new_context(&mut self, viewport: Viewport) -> Result<Box<dyn RenderContext>>;

    /// Terminate the browser process.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A single isolated page inside a session
#[async_trait]
pub trait RenderContext: Send {
    /// Navigate to `url` and wait for the load event, bounded by `timeout`.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Evaluate an expression in the page and return its string value.
    ///
    /// Callers wrap structured results in `JSON.stringify`.
    async fn evaluate(&mut self, expression: &str) -> Result<String>;

    /// Capture a PNG of the viewport, or of `clip` (document coordinates)
    /// when given. Output pixels are scaled by the context's device scale.
    async fn screenshot_png(&mut self, clip: Option<ClipRect>) -> Result<Vec<u8>>;

    /// Print the page to PDF.
    async fn print_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>>;

    /// Dispose of the page and its browser context.
    async fn close(self: Box<Self>) -> Result<()>;
}

//! Browser-independent capture helpers: readiness probing, element
//! measurement and artifact inspection.

use crate::{ClipRect, Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Expression reporting document readiness and how many resources loaded.
pub const READINESS_PROBE: &str = r#"JSON.stringify({
    ready: document.readyState,
    resources: performance.getEntriesByType('resource').length
})"#;

/// One reading of [`READINESS_PROBE`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Readiness {
    pub ready: String,
    pub resources: u64,
}

impl Readiness {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::ScriptError(format!("bad readiness probe '{}': {}", raw, e)))
    }
}

/// Tracks successive readiness probes until the document is quiescent:
/// loaded, with no new resource entries for the whole idle window.
#[derive(Debug)]
pub struct IdleTracker {
    window: Duration,
    last_count: Option<u64>,
    stable_since: Option<Instant>,
}

impl IdleTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_count: None,
            stable_since: None,
        }
    }

    /// Feed a probe taken at `now`; returns true once idle.
    pub fn observe(&mut self, probe: &Readiness, now: Instant) -> bool {
        if probe.ready != "complete" {
            self.last_count = None;
            self.stable_since = None;
            return false;
        }
        if self.last_count != Some(probe.resources) {
            self.last_count = Some(probe.resources);
            self.stable_since = Some(now);
        }
        match self.stable_since {
            Some(since) => now.saturating_duration_since(since) >= self.window,
            None => false,
        }
    }
}

/// Bounding box of a rendered element, in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContentBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ContentBox {
    /// Page size for this box, rounded up to whole pixels.
    pub fn page_size(&self) -> (u32, u32) {
        (self.width.ceil().max(1.0) as u32, self.height.ceil().max(1.0) as u32)
    }

    pub fn clip(&self) -> ClipRect {
        ClipRect {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }
}

/// Expression measuring the first element matching `selector`, in document
/// coordinates. Evaluates to `"null"` when nothing matches.
pub fn measure_element_script(selector: &str) -> String {
    let sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"JSON.stringify((() => {{
    const el = document.querySelector({sel});
    if (!el) return null;
    const r = el.getBoundingClientRect();
    return {{ x: r.left + window.scrollX, y: r.top + window.scrollY, width: r.width, height: r.height }};
}})())"#
    )
}

/// Expression measuring the full scrollable document.
pub const MEASURE_DOCUMENT: &str = r#"JSON.stringify((() => {
    const d = document.documentElement;
    const b = document.body;
    return {
        x: 0,
        y: 0,
        width: Math.max(d.scrollWidth, b ? b.scrollWidth : 0),
        height: Math.max(d.scrollHeight, b ? b.scrollHeight : 0)
    };
})())"#;

/// Parse a measurement; `"null"` or an empty box means the element is missing.
pub fn parse_content_box(raw: &str, selector: &str) -> Result<ContentBox> {
    let parsed: Option<ContentBox> = serde_json::from_str(raw)
        .map_err(|e| Error::ScriptError(format!("bad measurement '{}': {}", raw, e)))?;
    match parsed {
        Some(b) if b.width > 0.0 && b.height > 0.0 => Ok(b),
        Some(_) => Err(Error::ElementNotFound(format!("{} (zero-sized)", selector))),
        None => Err(Error::ElementNotFound(selector.to_string())),
    }
}

/// Tolerance, in CSS pixels, when comparing a pinned box with its measurement
const PIN_TOLERANCE: f64 = 0.5;

/// Expression moving the first element matching `selector` to the document
/// origin at its measured size, then re-measuring it. Page margins are
/// zeroed so the element starts exactly where a fitted page starts.
pub fn pin_root_script(selector: &str, measured: &ContentBox) -> String {
    let sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"JSON.stringify((() => {{
    const el = document.querySelector({sel});
    if (!el) return null;
    for (const node of [document.documentElement, document.body]) {{
        if (!node) continue;
        node.style.setProperty('margin', '0', 'important');
        node.style.setProperty('padding', '0', 'important');
    }}
    const pin = [
        ['position', 'absolute'], ['left', '0'], ['top', '0'], ['margin', '0'],
        ['transform', 'none'], ['box-sizing', 'border-box'],
        ['width', '{width}px'], ['height', '{height}px'], ['z-index', '2147483647'],
    ];
    pin.forEach(([prop, value]) => el.style.setProperty(prop, value, 'important'));
    window.scrollTo(0, 0);
    const r = el.getBoundingClientRect();
    return {{ x: r.left + window.scrollX, y: r.top + window.scrollY, width: r.width, height: r.height }};
}})())"#,
        width = measured.width,
        height = measured.height,
    )
}

/// Parse the result of [`pin_root_script`] and check the element now
/// starts at the origin with its measured size.
pub fn parse_pinned_box(raw: &str, selector: &str, measured: &ContentBox) -> Result<ContentBox> {
    let pinned = parse_content_box(raw, selector)?;
    let off = |a: f64, b: f64| (a - b).abs() > PIN_TOLERANCE;
    if off(pinned.x, 0.0)
        || off(pinned.y, 0.0)
        || off(pinned.width, measured.width)
        || off(pinned.height, measured.height)
    {
        return Err(Error::CaptureFailure(format!(
            "'{}' could not be moved to the page origin: {}x{} at ({}, {}), expected {}x{} at (0, 0)",
            selector, pinned.width, pinned.height, pinned.x, pinned.y, measured.width, measured.height
        )));
    }
    Ok(pinned)
}

/// Pixel dimensions of an encoded PNG.
pub fn png_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    let decoder = png::Decoder::new(bytes);
    let reader = decoder
        .read_info()
        .map_err(|e| Error::CaptureFailure(format!("screenshot is not a valid PNG: {}", e)))?;
    let info = reader.info();
    Ok((info.width, info.height))
}

/// Kind of artifact produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Png,
    Pdf,
}

/// A captured artifact held in memory until its variant completes
#[derive(Debug, Clone)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Path relative to the output directory
    pub file: PathBuf,
    pub bytes: Vec<u8>,
    /// Decoded pixel size for PNGs
    pub pixel_size: Option<(u32, u32)>,
    /// Page size in inches for PDFs
    pub page_inches: Option<(f64, f64)>,
}

impl Artifact {
    /// Lowercase hex SHA-256 of the artifact bytes.
    pub fn sha256(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

//! Export plans: which document to render, how, and into which files.
//!
//! Plans are usually loaded from TOML:
//!
//! ```toml
//! input = "index.html"
//! output_dir = "exports"
//!
//! [[directives]]
//! kind = "hide"
//! selector = "#imageModal"
//!
//! [[variants]]
//! name = "normal"
//! viewport = { width = 1200, height = 1600, device_scale_factor = 8.0 }
//! artifacts = [
//!   { kind = "png", file = "poster_8x.png", target = { mode = "element", selector = ".poster-container" } },
//!   { kind = "pdf", file = "poster.pdf", page = { mode = "format", format = "A0" } },
//! ]
//! ```

use crate::normalize::{Directive, NormalizationSet};
use crate::{Error, PdfOptions, Result, Viewport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Complete description of one export run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportPlan {
    /// Local HTML document to render
    pub input: PathBuf,
    /// Directory receiving every artifact; created if absent
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub timing: Timing,
    /// Normalization applied to every context before capture
    #[serde(default)]
    pub directives: Vec<Directive>,
    pub variants: Vec<Variant>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("exports")
}

/// Wait budgets, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Upper bound for navigation plus network-idle wait
    pub navigation_timeout_ms: u64,
    /// How long the resource count must stay unchanged to count as idle
    pub network_idle_ms: u64,
    /// Pause after network idle, before the directives run
    pub load_delay_ms: u64,
    /// Pause after the directives, before the first capture
    pub settle_delay_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            navigation_timeout_ms: 30_000,
            network_idle_ms: 500,
            load_delay_ms: 2_000,
            settle_delay_ms: 500,
        }
    }
}

impl Timing {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn network_idle(&self) -> Duration {
        Duration::from_millis(self.network_idle_ms)
    }

    pub fn load_delay(&self) -> Duration {
        Duration::from_millis(self.load_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// One output variant; rendered in its own browsing context(s)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub viewport: Viewport,
    pub artifacts: Vec<ArtifactSpec>,
}

impl Variant {
    /// Artifacts captured from the variant's own viewport.
    pub fn fixed_artifacts(&self) -> impl Iterator<Item = &ArtifactSpec> {
        self.artifacts.iter().filter(|a| a.measured_root().is_none())
    }

    /// Distinct measurement roots, in declaration order.
    pub fn measured_roots(&self) -> Vec<&str> {
        let mut roots: Vec<&str> = Vec::new();
        for root in self.artifacts.iter().filter_map(|a| a.measured_root()) {
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots
    }
}

/// A single file produced by a variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactSpec {
    Png {
        file: PathBuf,
        #[serde(default)]
        target: PngTarget,
    },
    Pdf { file: PathBuf, page: PageSize },
}

impl ArtifactSpec {
    pub fn file(&self) -> &Path {
        match self {
            ArtifactSpec::Png { file, .. } | ArtifactSpec::Pdf { file, .. } => file,
        }
    }

    pub fn measured_root(&self) -> Option<&str> {
        match self {
            ArtifactSpec::Pdf {
                page: PageSize::Measured { root },
                ..
            } => Some(root),
            _ => None,
        }
    }
}

/// Region covered by a raster capture
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PngTarget {
    /// The logical viewport
    #[default]
    Viewport,
    /// The bounding box of the first element matching `selector`
    Element { selector: String },
    /// The whole scrollable document
    FullPage,
}

/// Page geometry of a PDF export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PageSize {
    /// A named physical paper size
    Format { format: PaperFormat },
    /// An exact page size in CSS pixels
    Custom { width: u32, height: u32 },
    /// A page exactly as large as the measured bounding box of `root`
    Measured { root: String },
}

impl PageSize {
    /// PDF options for the fixed page sizes; `None` for measured pages,
    /// which are only known after measurement.
    pub fn fixed_options(&self) -> Option<PdfOptions> {
        match self {
            PageSize::Format { format } => {
                let (w, h) = format.inches();
                Some(PdfOptions::from_inches(w, h))
            }
            PageSize::Custom { width, height } => {
                Some(PdfOptions::from_css_pixels(*width as f64, *height as f64))
            }
            PageSize::Measured { .. } => None,
        }
    }
}

/// Named paper sizes, in the dimensions headless Chrome drivers use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperFormat {
    Letter,
    Legal,
    Tabloid,
    Ledger,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
}

impl PaperFormat {
    /// Width and height in inches.
    pub fn inches(self) -> (f64, f64) {
        match self {
            PaperFormat::Letter => (8.5, 11.0),
            PaperFormat::Legal => (8.5, 14.0),
            PaperFormat::Tabloid => (11.0, 17.0),
            PaperFormat::Ledger => (17.0, 11.0),
            PaperFormat::A0 => (33.1, 46.8),
            PaperFormat::A1 => (23.4, 33.1),
            PaperFormat::A2 => (16.54, 23.4),
            PaperFormat::A3 => (11.7, 16.54),
            PaperFormat::A4 => (8.27, 11.7),
            PaperFormat::A5 => (5.83, 8.27),
            PaperFormat::A6 => (4.13, 5.83),
        }
    }
}

impl ExportPlan {
    /// Load a plan from a TOML file. A relative `input` or `output_dir` is
    /// resolved against the plan file's directory.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut plan = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            plan.rebase(base);
        }
        Ok(plan)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let plan: ExportPlan =
            toml::from_str(text).map_err(|e| Error::ConfigError(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Two-variant plan for a poster without any directives: a normal
    /// 1200x1600 and a wide 2000x2500 layout, each at scale 8.
    pub fn poster_defaults(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        let variant = |name: &str, width: u32, height: u32, png: &str, pdf: &str| Variant {
            name: name.to_string(),
            viewport: Viewport::new(width, height, 8.0),
            artifacts: vec![
                ArtifactSpec::Png {
                    file: PathBuf::from(png),
                    target: PngTarget::Viewport,
                },
                ArtifactSpec::Pdf {
                    file: PathBuf::from(pdf),
                    page: PageSize::Custom { width, height },
                },
            ],
        };

        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            timing: Timing::default(),
            directives: Vec::new(),
            variants: vec![
                variant("normal", 1200, 1600, "poster_highres_8x.png", "poster_print_normal.pdf"),
                variant("wide", 2000, 2500, "poster_highres_wide_8x.png", "poster_print_wide.pdf"),
            ],
        }
    }

    fn rebase(&mut self, base: &Path) {
        if self.input.is_relative() {
            self.input = base.join(&self.input);
        }
        if self.output_dir.is_relative() {
            self.output_dir = base.join(&self.output_dir);
        }
    }

    pub fn normalization(&self) -> NormalizationSet {
        NormalizationSet::new(self.directives.clone())
    }

    /// Check the plan for mistakes that would only show up mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            return Err(Error::ConfigError("plan has no variants".into()));
        }
        if self.timing.navigation_timeout_ms == 0 {
            return Err(Error::ConfigError("navigation_timeout_ms must be positive".into()));
        }

        let mut names = HashSet::new();
        let mut files = HashSet::new();
        for v in &self.variants {
            if !names.insert(v.name.as_str()) {
                return Err(Error::ConfigError(format!("duplicate variant name '{}'", v.name)));
            }
            let vp = v.viewport;
            if vp.width == 0 || vp.height == 0 {
                return Err(Error::ConfigError(format!("variant '{}' has an empty viewport", v.name)));
            }
            if !vp.device_scale_factor.is_finite() || vp.device_scale_factor <= 0.0 {
                return Err(Error::ConfigError(format!(
                    "variant '{}' has invalid device_scale_factor {}",
                    v.name, vp.device_scale_factor
                )));
            }
            if v.artifacts.is_empty() {
                return Err(Error::ConfigError(format!("variant '{}' produces no artifacts", v.name)));
            }
            for a in &v.artifacts {
                let file = a.file();
                if !stays_inside(file) {
                    return Err(Error::ConfigError(format!(
                        "artifact file '{}' must be a relative path inside output_dir",
                        file.display()
                    )));
                }
                if !files.insert(file.to_path_buf()) {
                    return Err(Error::ConfigError(format!(
                        "artifact file '{}' is produced twice",
                        file.display()
                    )));
                }
                if let ArtifactSpec::Pdf {
                    page: PageSize::Custom { width, height },
                    ..
                } = a
                {
                    if *width == 0 || *height == 0 {
                        return Err(Error::ConfigError(format!("'{}' has an empty page", file.display())));
                    }
                }
            }
        }

        self.normalization().validate()
    }
}

/// True for a non-empty relative path made only of plain components, so it
/// cannot resolve outside the directory it is joined to.
fn stays_inside(file: &Path) -> bool {
    let mut normal = false;
    for c in file.components() {
        match c {
            Component::Normal(_) => normal = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    normal
}

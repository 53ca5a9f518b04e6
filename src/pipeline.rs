//! The capture pipeline and the fallback runner.
//!
//! Every variant goes through the same stages: a fresh isolated context,
//! navigation with a network-idle wait, normalization, then emission. Variants
//! run strictly one after another on one browser session. A failing variant
//! does not stop the others. Its artifacts stay in memory and are never
//! written.

use crate::capture::{
    self, Artifact, ArtifactKind, ContentBox, IdleTracker, Readiness, MEASURE_DOCUMENT,
    READINESS_PROBE,
};
use crate::config::{ArtifactSpec, ExportPlan, PngTarget, Timing, Variant};
use crate::normalize::NormalizationSet;
use crate::report::{RunReport, VariantReport, WrittenArtifact};
use crate::{
    scale_len, Backend, ClipRect, Error, LaunchConfig, PdfOptions, RenderContext, Result, Session,
    Viewport,
};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Delay between readiness probes while waiting for network idle
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Runs a plan on an ordered list of backends.
///
/// The first backend renders every variant. Each following backend gets one
/// attempt at the variants that failed for backend-related reasons.
pub struct Exporter {
    backends: Vec<Box<dyn Backend>>,
    launch: LaunchConfig,
}

impl Exporter {
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Self {
        Self {
            backends,
            launch: LaunchConfig::default(),
        }
    }

    /// Every backend compiled into this build, primary first.
    pub fn with_default_backends() -> Self {
        #[allow(unused_mut)]
        let mut backends: Vec<Box<dyn Backend>> = Vec::new();
        #[cfg(feature = "cdp")]
        backends.push(Box::new(crate::CdpBackend::new()));
        #[cfg(feature = "oxide")]
        backends.push(Box::new(crate::OxideBackend::new()));
        Self::new(backends)
    }

    pub fn launch_config(mut self, launch: LaunchConfig) -> Self {
        self.launch = launch;
        self
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Export every variant of `plan`. Never fails as a whole: problems are
    /// recorded per variant in the returned report.
    pub async fn run(&self, plan: &ExportPlan) -> RunReport {
        let mut report = RunReport::default();

        let url = match plan.validate().and_then(|_| document_url(&plan.input)) {
            Ok(url) => url,
            Err(e) => {
                warn!("not starting a browser: {}", e);
                for v in &plan.variants {
                    report.upsert(VariantReport::failed(&v.name, None, &e));
                }
                return report;
            }
        };

        if self.backends.is_empty() {
            let e = Error::EngineUnavailable("no backend compiled into this build".into());
            for v in &plan.variants {
                report.upsert(VariantReport::failed(&v.name, None, &e));
            }
            return report;
        }

        let mut pending: Vec<&Variant> = plan.variants.iter().collect();
        for (attempt, backend) in self.backends.iter().enumerate() {
            if pending.is_empty() {
                break;
            }
            if attempt > 0 {
                warn!(
                    "retrying {} variant(s) with fallback backend '{}'",
                    pending.len(),
                    backend.name()
                );
            }

            let pipeline = Pipeline {
                backend: backend.as_ref(),
                launch: &self.launch,
                plan,
                url: &url,
            };
            let results = pipeline.run(&pending).await;

            let mut retry = Vec::new();
            for (variant, result) in pending.iter().zip(results) {
                match result {
                    Ok(written) => {
                        report.upsert(VariantReport::succeeded(&variant.name, backend.name(), written));
                    }
                    Err(e) => {
                        warn!("variant '{}' failed on '{}': {}", variant.name, backend.name(), e);
                        if e.is_backend_failure() {
                            retry.push(*variant);
                        }
                        report.upsert(VariantReport::failed(&variant.name, Some(backend.name()), &e));
                    }
                }
            }
            pending = retry;
        }

        report
    }
}

/// `file://` URL for a local document, failing early when it is missing.
pub fn document_url(input: &Path) -> Result<String> {
    let canonical = std::fs::canonicalize(input).map_err(|_| Error::DocumentNotFound(input.to_path_buf()))?;
    if !canonical.is_file() {
        return Err(Error::DocumentNotFound(input.to_path_buf()));
    }
    url::Url::from_file_path(&canonical)
        .map(|u| u.to_string())
        .map_err(|_| Error::ConfigError(format!("cannot build a file URL for {}", canonical.display())))
}

/// One pass of a plan over one backend
struct Pipeline<'a> {
    backend: &'a dyn Backend,
    launch: &'a LaunchConfig,
    plan: &'a ExportPlan,
    url: &'a str,
}

impl Pipeline<'_> {
    /// Run `variants` on a single session; one result per variant, in order.
    async fn run(&self, variants: &[&Variant]) -> Vec<Result<Vec<WrittenArtifact>>> {
        info!("starting '{}' browser session", self.backend.name());
        let mut session = match self.backend.launch(self.launch).await {
            Ok(s) => s,
            Err(e) => {
                warn!("backend '{}' unavailable: {}", self.backend.name(), e);
                return variants.iter().map(|_| Err(e.replicate())).collect();
            }
        };

        let set = self.plan.normalization();
        let mut results = Vec::with_capacity(variants.len());
        for variant in variants {
            info!(
                "rendering variant '{}' at {}x{} x{}",
                variant.name,
                variant.viewport.width,
                variant.viewport.height,
                variant.viewport.device_scale_factor
            );
            let result = match self.render_variant(session.as_mut(), &set, variant).await {
                Ok(artifacts) => write_artifacts(&self.plan.output_dir, &artifacts),
                Err(e) => Err(e),
            };
            results.push(result);
        }

        if let Err(e) = session.close().await {
            warn!("failed to close '{}' session cleanly: {}", self.backend.name(), e);
        }
        results
    }

    async fn render_variant(
        &self,
        session: &mut dyn Session,
        set: &NormalizationSet,
        variant: &Variant,
    ) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();

        let fixed: Vec<&ArtifactSpec> = variant.fixed_artifacts().collect();
        if !fixed.is_empty() {
            let mut ctx = session.new_context(variant.viewport).await?;
            let res = self.fixed_pass(ctx.as_mut(), set, variant.viewport, &fixed).await;
            close_context(ctx).await;
            artifacts.extend(res?);
        }

        for root in variant.measured_roots() {
            let mut probe = session.new_context(variant.viewport.at_unit_scale()).await?;
            let measured = self.measure_pass(probe.as_mut(), set, root).await;
            close_context(probe).await;
            let content = measured?;

            let (w, h) = content.page_size();
            debug!("measured '{}' at {}x{} css px", root, w, h);
            let fitted = Viewport::new(w, h, variant.viewport.device_scale_factor);
            let files: Vec<&Path> = variant
                .artifacts
                .iter()
                .filter(|a| a.measured_root() == Some(root))
                .map(|a| a.file())
                .collect();

            let mut ctx = session.new_context(fitted).await?;
            let res = self.measured_pass(ctx.as_mut(), set, root, &content, &files).await;
            close_context(ctx).await;
            artifacts.extend(res?);
        }

        Ok(artifacts)
    }

    async fn fixed_pass(
        &self,
        ctx: &mut dyn RenderContext,
        set: &NormalizationSet,
        viewport: Viewport,
        specs: &[&ArtifactSpec],
    ) -> Result<Vec<Artifact>> {
        prepare(ctx, self.url, &self.plan.timing, set).await?;

        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            match spec {
                ArtifactSpec::Png { file, target } => {
                    let clip = match target {
                        PngTarget::Viewport => None,
                        PngTarget::Element { selector } => Some(measure(ctx, selector).await?.clip()),
                        PngTarget::FullPage => Some(measure_document(ctx).await?.clip()),
                    };
                    out.push(capture_png(ctx, file, viewport, clip).await?);
                }
                ArtifactSpec::Pdf { file, page } => {
                    let options = page.fixed_options().ok_or_else(|| {
                        Error::Other(format!("{} needs a measured page", file.display()))
                    })?;
                    out.push(capture_pdf(ctx, file, &options).await?);
                }
            }
        }
        Ok(out)
    }

    async fn measure_pass(
        &self,
        ctx: &mut dyn RenderContext,
        set: &NormalizationSet,
        root: &str,
    ) -> Result<ContentBox> {
        prepare(ctx, self.url, &self.plan.timing, set).await?;
        measure(ctx, root).await
    }

    async fn measured_pass(
        &self,
        ctx: &mut dyn RenderContext,
        set: &NormalizationSet,
        root: &str,
        content: &ContentBox,
        files: &[&Path],
    ) -> Result<Vec<Artifact>> {
        prepare(ctx, self.url, &self.plan.timing, set).await?;
        pin_root(ctx, root, content).await?;

        let (w, h) = content.page_size();
        let mut options = PdfOptions::from_css_pixels(w as f64, h as f64);
        options.page_ranges = Some("1".to_string());

        let mut out = Vec::with_capacity(files.len());
        for file in files {
            out.push(capture_pdf(ctx, file, &options).await?);
        }
        Ok(out)
    }
}

/// Navigate, wait for quiescence and apply normalization.
pub async fn prepare(
    ctx: &mut dyn RenderContext,
    url: &str,
    timing: &Timing,
    set: &NormalizationSet,
) -> Result<()> {
    let deadline = Instant::now() + timing.navigation_timeout();
    ctx.navigate(url, timing.navigation_timeout()).await?;
    wait_for_network_idle(ctx, url, timing, deadline).await?;

    sleep(timing.load_delay()).await;
    if !set.is_empty() {
        let raw = ctx.evaluate(&set.apply_script()).await?;
        set.check_report(&raw)?;
    }
    sleep(timing.settle_delay()).await;

    if !set.is_empty() {
        let drift = set.parse_drift(&ctx.evaluate(&set.verify_script()).await?)?;
        for i in drift.directives {
            if let Some(d) = set.directives().get(i) {
                warn!("normalization of '{}' did not hold after settling", d.selector());
            }
        }
    }
    Ok(())
}

async fn wait_for_network_idle(
    ctx: &mut dyn RenderContext,
    url: &str,
    timing: &Timing,
    deadline: Instant,
) -> Result<()> {
    let mut tracker = IdleTracker::new(timing.network_idle());
    loop {
        let probe = Readiness::parse(&ctx.evaluate(READINESS_PROBE).await?)?;
        let now = Instant::now();
        if tracker.observe(&probe, now.into_std()) {
            return Ok(());
        }
        if now >= deadline {
            return Err(Error::NavigationTimeout {
                url: url.to_string(),
                timeout_ms: timing.navigation_timeout_ms,
            });
        }
        sleep(PROBE_INTERVAL.min(deadline - now)).await;
    }
}

/// Bounding box of the first element matching `selector`.
pub async fn measure(ctx: &mut dyn RenderContext, selector: &str) -> Result<ContentBox> {
    let raw = ctx.evaluate(&capture::measure_element_script(selector)).await?;
    capture::parse_content_box(&raw, selector)
}

/// Move the measured root to the page origin so a page of its size holds it
/// entirely. Fails with [`Error::CaptureFailure`] if it does not end up there.
pub async fn pin_root(ctx: &mut dyn RenderContext, root: &str, measured: &ContentBox) -> Result<ContentBox> {
    let raw = ctx.evaluate(&capture::pin_root_script(root, measured)).await?;
    let pinned = capture::parse_pinned_box(&raw, root, measured)?;
    debug!("pinned '{}' at the page origin", root);
    Ok(pinned)
}

async fn measure_document(ctx: &mut dyn RenderContext) -> Result<ContentBox> {
    let raw = ctx.evaluate(MEASURE_DOCUMENT).await?;
    capture::parse_content_box(&raw, "document")
}

async fn capture_png(
    ctx: &mut dyn RenderContext,
    file: &Path,
    viewport: Viewport,
    clip: Option<ClipRect>,
) -> Result<Artifact> {
    let bytes = ctx.screenshot_png(clip).await?;
    let size = capture::png_dimensions(&bytes)?;
    let expected = match clip {
        None => viewport.physical_size(),
        Some(c) => (
            scale_len(c.width, viewport.device_scale_factor),
            scale_len(c.height, viewport.device_scale_factor),
        ),
    };
    if size != expected {
        warn!(
            "{}: captured {}x{} px, expected {}x{}",
            file.display(),
            size.0,
            size.1,
            expected.0,
            expected.1
        );
    }
    Ok(Artifact {
        kind: ArtifactKind::Png,
        file: file.to_path_buf(),
        bytes,
        pixel_size: Some(size),
        page_inches: None,
    })
}

async fn capture_pdf(ctx: &mut dyn RenderContext, file: &Path, options: &PdfOptions) -> Result<Artifact> {
    let bytes = ctx.print_pdf(options).await?;
    if !bytes.starts_with(b"%PDF") {
        return Err(Error::CaptureFailure(format!("{}: backend returned a non-PDF payload", file.display())));
    }
    Ok(Artifact {
        kind: ArtifactKind::Pdf,
        file: file.to_path_buf(),
        bytes,
        pixel_size: None,
        page_inches: Some((options.paper_width_in, options.paper_height_in)),
    })
}

async fn close_context(ctx: Box<dyn RenderContext>) {
    if let Err(e) = ctx.close().await {
        warn!("failed to close browsing context: {}", e);
    }
}

/// Write a variant's artifacts under `dir`. Each file goes through a
/// temporary sibling and a rename; on failure the files already written for
/// this variant are removed again.
pub fn write_artifacts(dir: &Path, artifacts: &[Artifact]) -> Result<Vec<WrittenArtifact>> {
    std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let mut written: Vec<WrittenArtifact> = Vec::with_capacity(artifacts.len());
    for a in artifacts {
        let path = dir.join(&a.file);
        if let Err(e) = write_atomically(&path, &a.bytes) {
            for w in &written {
                let _ = std::fs::remove_file(&w.path);
            }
            return Err(e);
        }
        info!("saved {}", path.display());
        written.push(WrittenArtifact {
            kind: a.kind,
            path,
            bytes: a.bytes.len() as u64,
            sha256: a.sha256(),
            pixel_size: a.pixel_size,
            page_inches: a.page_inches,
        });
    }
    Ok(written)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, bytes).map_err(|e| Error::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::io(path, e)
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.part", name))
}

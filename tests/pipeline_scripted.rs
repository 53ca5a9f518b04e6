//! Pipeline tests against an in-memory backend that answers page scripts
//! from a table, so no browser is needed.

use async_trait::async_trait;
use posterpress::capture::{
    measure_element_script, pin_root_script, ContentBox, MEASURE_DOCUMENT, READINESS_PROBE,
};
use posterpress::config::ExportPlan;
use posterpress::pipeline::Exporter;
use posterpress::report::VariantOutcome;
use posterpress::{
    Backend, ClipRect, Error, LaunchConfig, PdfOptions, RenderContext, Result, Session, Viewport,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Log {
    launches: usize,
    sessions_closed: usize,
    contexts_opened: usize,
    contexts_closed: usize,
    viewports: Vec<Viewport>,
    pdfs: Vec<PdfOptions>,
    evaluated: Vec<String>,
}

#[derive(Clone)]
struct Script {
    /// Exact expression -> JSON result
    answers: HashMap<String, String>,
    fail_launch: bool,
    /// Screenshots fail in contexts of this logical width
    fail_width: Option<u32>,
}

impl Script {
    fn new() -> Self {
        let mut answers = HashMap::new();
        answers.insert(
            READINESS_PROBE.to_string(),
            r#"{"ready":"complete","resources":3}"#.to_string(),
        );
        answers.insert(
            MEASURE_DOCUMENT.to_string(),
            r#"{"x":0,"y":0,"width":120,"height":400}"#.to_string(),
        );
        Self {
            answers,
            fail_launch: false,
            fail_width: None,
        }
    }

    fn answer(mut self, expression: String, result: &str) -> Self {
        self.answers.insert(expression, result.to_string());
        self
    }
}

struct FakeBackend {
    name: &'static str,
    script: Script,
    log: Arc<Mutex<Log>>,
}

impl FakeBackend {
    fn new(name: &'static str, script: Script) -> (Self, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let backend = Self {
            name,
            script,
            log: log.clone(),
        };
        (backend, log)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn launch(&self, _config: &LaunchConfig) -> Result<Box<dyn Session>> {
        if self.script.fail_launch {
            return Err(Error::EngineUnavailable("no browser here".into()));
        }
        self.log.lock().unwrap().launches += 1;
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
            log: self.log.clone(),
        }))
    }
}

struct FakeSession {
    script: Script,
    log: Arc<Mutex<Log>>,
}

#[async_trait]
impl Session for FakeSession {
    async fn new_context(&mut self, viewport: Viewport) -> Result<Box<dyn RenderContext>> {
        let mut log = self.log.lock().unwrap();
        log.contexts_opened += 1;
        log.viewports.push(viewport);
        Ok(Box::new(FakePage {
            viewport,
            script: self.script.clone(),
            log: self.log.clone(),
        }))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.log.lock().unwrap().sessions_closed += 1;
        Ok(())
    }
}

struct FakePage {
    viewport: Viewport,
    script: Script,
    log: Arc<Mutex<Log>>,
}

fn encode_png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Grayscale);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().unwrap();
        writer
            .write_image_data(&vec![0u8; (width * height) as usize])
            .unwrap();
    }
    out
}

fn scaled(len: f64, scale: f64) -> u32 {
    (len * scale).ceil() as u32
}

#[async_trait]
impl RenderContext for FakePage {
    async fn navigate(&mut self, _url: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn evaluate(&mut self, expression: &str) -> Result<String> {
        self.log.lock().unwrap().evaluated.push(expression.to_string());
        self.script
            .answers
            .get(expression)
            .cloned()
            .ok_or_else(|| Error::ScriptError(format!("unscripted expression: {}", expression)))
    }

    async fn screenshot_png(&mut self, clip: Option<ClipRect>) -> Result<Vec<u8>> {
        if self.script.fail_width == Some(self.viewport.width) {
            return Err(Error::CaptureFailure("compositor crashed".into()));
        }
        let scale = self.viewport.device_scale_factor;
        let (w, h) = match clip {
            None => self.viewport.physical_size(),
            Some(c) => (scaled(c.width, scale), scaled(c.height, scale)),
        };
        Ok(encode_png(w, h))
    }

    async fn print_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>> {
        self.log.lock().unwrap().pdfs.push(options.clone());
        Ok(format!(
            "%PDF-1.4 fake {}x{}",
            options.paper_width_in, options.paper_height_in
        )
        .into_bytes())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.log.lock().unwrap().contexts_closed += 1;
        Ok(())
    }
}

fn poster_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("index.html"),
        "<html><body><div class=\"poster-container\"></div></body></html>",
    )
    .unwrap();
    dir
}

/// Plan with zero waits so the tests run instantly.
fn plan(dir: &Path, body: &str) -> ExportPlan {
    let text = format!(
        r#"
input = "index.html"
output_dir = "out"

[timing]
network_idle_ms = 0
load_delay_ms = 0
settle_delay_ms = 0
{}
"#,
        body
    );
    let path = dir.join("plan.toml");
    std::fs::write(&path, text).unwrap();
    ExportPlan::from_toml_file(&path).unwrap()
}

const TWO_VARIANTS: &str = r#"
[[variants]]
name = "normal"
viewport = { width = 120, height = 160, device_scale_factor = 8.0 }
artifacts = [
  { kind = "png", file = "normal_8x.png" },
  { kind = "pdf", file = "normal.pdf", page = { mode = "custom", width = 120, height = 160 } },
]

[[variants]]
name = "wide"
viewport = { width = 200, height = 250, device_scale_factor = 8.0 }
artifacts = [
  { kind = "png", file = "wide_8x.png" },
  { kind = "pdf", file = "wide.pdf", page = { mode = "format", format = "A0" } },
]
"#;

fn png_size(path: &Path) -> (u32, u32) {
    let bytes = std::fs::read(path).unwrap();
    posterpress::capture::png_dimensions(&bytes).unwrap()
}

#[tokio::test]
async fn viewport_png_has_scaled_pixel_size() {
    let dir = poster_dir();
    let plan = plan(dir.path(), TWO_VARIANTS);
    let (backend, log) = FakeBackend::new("primary", Script::new());

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    assert_eq!(report.exit_code(), 0);
    assert!(report.all_succeeded());

    let out = dir.path().join("out");
    assert_eq!(png_size(&out.join("normal_8x.png")), (960, 1280));
    assert_eq!(png_size(&out.join("wide_8x.png")), (1600, 2000));
    assert!(std::fs::read(out.join("normal.pdf")).unwrap().starts_with(b"%PDF"));

    let log = log.lock().unwrap();
    assert_eq!(log.launches, 1);
    assert_eq!(log.sessions_closed, 1);
    assert_eq!(log.contexts_opened, 2);
    assert_eq!(log.contexts_closed, 2);
    assert_eq!(log.pdfs[0].paper_width_in, 1.25);
    assert_eq!(log.pdfs[1].paper_width_in, 33.1);
    assert!(log.pdfs.iter().all(|p| p.print_background));
}

#[tokio::test]
async fn report_records_digests_and_sizes() {
    let dir = poster_dir();
    let plan = plan(dir.path(), TWO_VARIANTS);
    let (backend, _log) = FakeBackend::new("primary", Script::new());

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    let first = &report.variants[0];
    assert_eq!(first.variant, "normal");
    assert_eq!(first.backend.as_deref(), Some("primary"));
    match &first.outcome {
        VariantOutcome::Succeeded { artifacts } => {
            assert_eq!(artifacts.len(), 2);
            assert_eq!(artifacts[0].pixel_size, Some((960, 1280)));
            assert_eq!(artifacts[0].sha256.len(), 64);
            assert_eq!(artifacts[1].page_inches, Some((1.25, 160.0 / 96.0)));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn element_png_uses_measured_clip() {
    let dir = poster_dir();
    let plan = plan(
        dir.path(),
        r#"
[[variants]]
name = "normal"
viewport = { width = 120, height = 160, device_scale_factor = 2.0 }
artifacts = [
  { kind = "png", file = "el.png", target = { mode = "element", selector = ".poster-container" } },
  { kind = "png", file = "full.png", target = { mode = "full_page" } },
]
"#,
    );
    let script = Script::new().answer(
        measure_element_script(".poster-container"),
        r#"{"x":10,"y":20,"width":100.5,"height":50}"#,
    );
    let (backend, _log) = FakeBackend::new("primary", script);

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    assert_eq!(report.exit_code(), 0);
    let out = dir.path().join("out");
    assert_eq!(png_size(&out.join("el.png")), (201, 100));
    assert_eq!(png_size(&out.join("full.png")), (240, 800));
}

const FITTED_PLAN: &str = r#"
[[variants]]
name = "fit"
viewport = { width = 1200, height = 1600, device_scale_factor = 2.0 }
artifacts = [
  { kind = "pdf", file = "fit.pdf", page = { mode = "measured", root = ".poster-container" } },
]
"#;

/// Script whose measurement of the root is `measured` and whose pinning
/// answers with `pinned`.
fn fitted_script(measured: ContentBox, pinned: &str) -> Script {
    let as_json = |b: &ContentBox| {
        format!(
            r#"{{"x":{},"y":{},"width":{},"height":{}}}"#,
            b.x, b.y, b.width, b.height
        )
    };
    Script::new()
        .answer(measure_element_script(".poster-container"), &as_json(&measured))
        .answer(pin_root_script(".poster-container", &measured), pinned)
}

#[tokio::test]
async fn measured_pdf_page_matches_content_box() {
    let dir = poster_dir();
    let plan = plan(dir.path(), FITTED_PLAN);
    let measured = ContentBox { x: 0.0, y: 0.0, width: 1234.2, height: 1700.5 };
    let script = fitted_script(measured, r#"{"x":0,"y":0,"width":1234.2,"height":1700.5}"#);
    let (backend, log) = FakeBackend::new("primary", script);

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    assert_eq!(report.exit_code(), 0);

    let log = log.lock().unwrap();
    // Measurement at scale 1, then a context sized to the content
    assert_eq!(
        log.viewports,
        vec![
            Viewport::new(1200, 1600, 1.0),
            Viewport::new(1235, 1701, 2.0)
        ]
    );
    assert_eq!(log.contexts_closed, 2);
    let pdf = &log.pdfs[0];
    assert_eq!(pdf.paper_width_in, 1235.0 / 96.0);
    assert_eq!(pdf.paper_height_in, 1701.0 / 96.0);
    assert_eq!(pdf.page_ranges.as_deref(), Some("1"));
}

#[tokio::test]
async fn offset_root_is_pinned_to_page_origin_before_printing() {
    let dir = poster_dir();
    let plan = plan(dir.path(), FITTED_PLAN);
    let measured = ContentBox { x: 10.0, y: 10.0, width: 300.0, height: 420.0 };
    let pin = pin_root_script(".poster-container", &measured);
    let script = fitted_script(measured, r#"{"x":0,"y":0,"width":300,"height":420}"#);
    let (backend, log) = FakeBackend::new("primary", script);

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    assert_eq!(report.exit_code(), 0);

    let log = log.lock().unwrap();
    // The page is the box size, not the box's far corner
    assert_eq!(log.viewports[1], Viewport::new(300, 420, 2.0));
    assert_eq!(log.pdfs[0].paper_width_in, 300.0 / 96.0);
    // Pinned exactly once, in the fitted context, before the PDF was printed
    assert_eq!(log.evaluated.iter().filter(|e| **e == pin).count(), 1);
    assert!(dir.path().join("out").join("fit.pdf").exists());
}

#[tokio::test]
async fn root_that_cannot_be_pinned_fails_the_variant() {
    let dir = poster_dir();
    let plan = plan(dir.path(), FITTED_PLAN);
    let measured = ContentBox { x: 10.0, y: 10.0, width: 300.0, height: 420.0 };
    // A positioned ancestor keeps the root offset
    let script = fitted_script(measured, r#"{"x":10,"y":10,"width":300,"height":420}"#);
    let (backend, log) = FakeBackend::new("primary", script);

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    assert_eq!(report.exit_code(), 1);
    match &report.variants[0].outcome {
        VariantOutcome::Failed { error_kind, .. } => assert_eq!(error_kind, "capture_failure"),
        other => panic!("unexpected outcome {:?}", other),
    }
    let log = log.lock().unwrap();
    assert!(log.pdfs.is_empty());
    assert_eq!(log.contexts_opened, log.contexts_closed);
    assert!(!dir.path().join("out").join("fit.pdf").exists());
}

#[tokio::test]
async fn missing_element_fails_only_its_variant() {
    let dir = poster_dir();
    let plan = plan(
        dir.path(),
        r##"
[[variants]]
name = "broken"
viewport = { width = 100, height = 100 }
artifacts = [
  { kind = "pdf", file = "broken.pdf", page = { mode = "format", format = "A4" } },
  { kind = "png", file = "broken.png", target = { mode = "element", selector = "#gone" } },
]

[[variants]]
name = "fine"
viewport = { width = 100, height = 100 }
artifacts = [{ kind = "png", file = "fine.png" }]
"##,
    );
    let script = Script::new().answer(measure_element_script("#gone"), "null");
    let (primary, primary_log) = FakeBackend::new("primary", script);
    let (fallback, fallback_log) = FakeBackend::new("fallback", Script::new());

    let report = Exporter::new(vec![Box::new(primary), Box::new(fallback)])
        .run(&plan)
        .await;
    assert_eq!(report.exit_code(), 2);

    match &report.variants[0].outcome {
        VariantOutcome::Failed { error_kind, .. } => assert_eq!(error_kind, "element_not_found"),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(report.variants[1].is_success());

    // Nothing from the failed variant reaches the disk, not even the PDF
    // captured before the failure.
    let out = dir.path().join("out");
    assert!(!out.join("broken.pdf").exists());
    assert!(!out.join("broken.png").exists());
    assert!(out.join("fine.png").exists());

    // Content errors are not retried on another backend
    assert_eq!(fallback_log.lock().unwrap().launches, 0);
    let log = primary_log.lock().unwrap();
    assert_eq!(log.contexts_opened, log.contexts_closed);
}

#[tokio::test]
async fn required_directive_without_match_is_element_not_found() {
    let dir = poster_dir();
    let plan = plan(
        dir.path(),
        &format!(
            r##"
[[directives]]
kind = "hide"
selector = "#imageModal"
required = true
{}"##,
            TWO_VARIANTS
        ),
    );
    let apply = plan.normalization().apply_script();
    let script = Script::new().answer(apply, r#"{"matched":[0]}"#);
    let (backend, log) = FakeBackend::new("primary", script);

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    assert_eq!(report.exit_code(), 1);
    assert!(report.variants.iter().all(|v| matches!(
        &v.outcome,
        VariantOutcome::Failed { error_kind, .. } if error_kind == "element_not_found"
    )));
    assert!(!dir.path().join("out").join("normal_8x.png").exists());

    let log = log.lock().unwrap();
    assert_eq!(log.contexts_opened, 2);
    assert_eq!(log.contexts_closed, 2);
    assert_eq!(log.sessions_closed, 1);
}

#[tokio::test]
async fn optional_directives_are_applied_and_verified() {
    let dir = poster_dir();
    let plan = plan(
        dir.path(),
        &format!(
            r##"
[[directives]]
kind = "set_style"
selector = "#progressBar"
property = "width"
value = "99.48%"

[[directives]]
kind = "hide"
selector = "#imageModal"
{}"##,
            TWO_VARIANTS
        ),
    );
    let set = plan.normalization();
    let script = Script::new()
        .answer(set.apply_script(), r#"{"matched":[1,0]}"#)
        .answer(set.verify_script(), r#"{"directives":[0]}"#);
    let (backend, _log) = FakeBackend::new("primary", script);

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn unavailable_primary_falls_back_for_every_variant() {
    let dir = poster_dir();
    let plan = plan(dir.path(), TWO_VARIANTS);
    let mut broken = Script::new();
    broken.fail_launch = true;
    let (primary, _) = FakeBackend::new("primary", broken);
    let (fallback, fallback_log) = FakeBackend::new("fallback", Script::new());

    let report = Exporter::new(vec![Box::new(primary), Box::new(fallback)])
        .run(&plan)
        .await;
    assert_eq!(report.exit_code(), 0);
    assert!(report
        .variants
        .iter()
        .all(|v| v.backend.as_deref() == Some("fallback")));
    assert_eq!(fallback_log.lock().unwrap().launches, 1);
}

#[tokio::test]
async fn fallback_reruns_only_failed_variants() {
    let dir = poster_dir();
    let plan = plan(dir.path(), TWO_VARIANTS);
    let mut flaky = Script::new();
    flaky.fail_width = Some(200);
    let (primary, _) = FakeBackend::new("primary", flaky);
    let (fallback, fallback_log) = FakeBackend::new("fallback", Script::new());

    let report = Exporter::new(vec![Box::new(primary), Box::new(fallback)])
        .run(&plan)
        .await;
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.variants[0].backend.as_deref(), Some("primary"));
    assert_eq!(report.variants[1].backend.as_deref(), Some("fallback"));

    let log = fallback_log.lock().unwrap();
    assert_eq!(log.viewports, vec![Viewport::new(200, 250, 8.0)]);
}

#[tokio::test]
async fn exhausted_fallback_reports_last_failure() {
    let dir = poster_dir();
    let plan = plan(dir.path(), TWO_VARIANTS);
    let mut flaky = Script::new();
    flaky.fail_width = Some(200);
    let (primary, _) = FakeBackend::new("primary", flaky.clone());
    let (fallback, _) = FakeBackend::new("fallback", flaky);

    let report = Exporter::new(vec![Box::new(primary), Box::new(fallback)])
        .run(&plan)
        .await;
    assert_eq!(report.exit_code(), 2);
    let wide = &report.variants[1];
    assert_eq!(wide.backend.as_deref(), Some("fallback"));
    match &wide.outcome {
        VariantOutcome::Failed { error_kind, .. } => assert_eq!(error_kind, "capture_failure"),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn missing_document_launches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(dir.path(), TWO_VARIANTS);
    let (backend, log) = FakeBackend::new("primary", Script::new());

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    assert_eq!(report.exit_code(), 1);
    assert!(report.variants.iter().all(|v| matches!(
        &v.outcome,
        VariantOutcome::Failed { error_kind, .. } if error_kind == "document_not_found"
    )));
    assert_eq!(log.lock().unwrap().launches, 0);
    assert!(!dir.path().join("out").exists());
}

#[tokio::test]
async fn stuck_document_times_out() {
    let dir = poster_dir();
    let mut plan = plan(dir.path(), TWO_VARIANTS);
    plan.timing.navigation_timeout_ms = 300;
    let script = Script::new().answer(
        READINESS_PROBE.to_string(),
        r#"{"ready":"loading","resources":1}"#,
    );
    let (backend, log) = FakeBackend::new("primary", script);

    let report = Exporter::new(vec![Box::new(backend)]).run(&plan).await;
    assert_eq!(report.exit_code(), 1);
    match &report.variants[0].outcome {
        VariantOutcome::Failed { error_kind, .. } => assert_eq!(error_kind, "navigation_timeout"),
        other => panic!("unexpected outcome {:?}", other),
    }
    let log = log.lock().unwrap();
    assert_eq!(log.contexts_opened, log.contexts_closed);
}

//! Run summaries and exit status.

use crate::capture::ArtifactKind;
use crate::Error;
use serde::Serialize;
use std::path::PathBuf;

/// A file written to the output directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WrittenArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_size: Option<(u32, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_inches: Option<(f64, f64)>,
}

/// Outcome of one variant
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VariantOutcome {
    Succeeded { artifacts: Vec<WrittenArtifact> },
    Failed { error_kind: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantReport {
    pub variant: String,
    /// Backend that produced this outcome, if one was reached
    pub backend: Option<String>,
    #[serde(flatten)]
    pub outcome: VariantOutcome,
}

impl VariantReport {
    pub fn succeeded(variant: &str, backend: &str, artifacts: Vec<WrittenArtifact>) -> Self {
        Self {
            variant: variant.to_string(),
            backend: Some(backend.to_string()),
            outcome: VariantOutcome::Succeeded { artifacts },
        }
    }

    pub fn failed(variant: &str, backend: Option<&str>, error: &Error) -> Self {
        Self {
            variant: variant.to_string(),
            backend: backend.map(str::to_string),
            outcome: VariantOutcome::Failed {
                error_kind: error.kind().to_string(),
                error: error.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, VariantOutcome::Succeeded { .. })
    }
}

/// Aggregated outcome of a run, one entry per variant in plan order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub variants: Vec<VariantReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &VariantReport> {
        self.variants.iter().filter(|v| v.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &VariantReport> {
        self.variants.iter().filter(|v| !v.is_success())
    }

    pub fn all_succeeded(&self) -> bool {
        !self.variants.is_empty() && self.failed().next().is_none()
    }

    /// Replace the entry for `report.variant`, keeping plan order.
    pub fn upsert(&mut self, report: VariantReport) {
        match self.variants.iter_mut().find(|v| v.variant == report.variant) {
            Some(slot) => *slot = report,
            None => self.variants.push(report),
        }
    }

    /// 0 when every variant succeeded, 2 on partial success, 1 when nothing
    /// was produced.
    pub fn exit_code(&self) -> i32 {
        if self.all_succeeded() {
            0
        } else if self.succeeded().next().is_some() {
            2
        } else {
            1
        }
    }

    /// Human-readable status lines.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for v in &self.variants {
            let backend = v.backend.as_deref().unwrap_or("-");
            match &v.outcome {
                VariantOutcome::Succeeded { artifacts } => {
                    lines.push(format!("[ok] {} ({})", v.variant, backend));
                    for a in artifacts {
                        let detail = match (a.pixel_size, a.page_inches) {
                            (Some((w, h)), _) => format!("{}x{} px", w, h),
                            (None, Some((w, h))) => format!("{:.2}x{:.2} in", w, h),
                            (None, None) => String::new(),
                        };
                        lines.push(format!("     {} {} ({} bytes)", a.path.display(), detail, a.bytes));
                    }
                }
                VariantOutcome::Failed { error, .. } => {
                    lines.push(format!("[failed] {} ({}): {}", v.variant, backend, error));
                }
            }
        }
        let ok = self.succeeded().count();
        lines.push(format!("{} of {} variant(s) exported", ok, self.variants.len()));
        lines
    }
}

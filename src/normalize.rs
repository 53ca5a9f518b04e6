//! Declarative DOM normalization.
//!
//! A [`NormalizationSet`] is a list of [`Directive`]s applied to a loaded
//! document before capture so the captured state does not depend on animation
//! timing or late layout shifts. The set compiles into one page script that
//! applies every directive and reports how many elements each one matched.
//! Applying the same set twice leaves the document unchanged.

use crate::{Error, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// A single normalization step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Directive {
    /// Set an inline style property on every matching element
    SetStyle {
        selector: String,
        property: String,
        value: String,
        #[serde(default)]
        required: bool,
    },
    /// Stop CSS animations on every matching element
    DisableAnimation {
        selector: String,
        #[serde(default)]
        required: bool,
    },
    /// Hide every matching element
    Hide {
        selector: String,
        #[serde(default)]
        required: bool,
    },
}

impl Directive {
    pub fn selector(&self) -> &str {
        match self {
            Directive::SetStyle { selector, .. }
            | Directive::DisableAnimation { selector, .. }
            | Directive::Hide { selector, .. } => selector,
        }
    }

    pub fn required(&self) -> bool {
        match self {
            Directive::SetStyle { required, .. }
            | Directive::DisableAnimation { required, .. }
            | Directive::Hide { required, .. } => *required,
        }
    }

    /// The inline style `(property, value)` this directive enforces.
    pub fn style(&self) -> (&str, &str) {
        match self {
            Directive::SetStyle { property, value, .. } => (property, value),
            Directive::DisableAnimation { .. } => ("animation", "none"),
            Directive::Hide { .. } => ("display", "none"),
        }
    }
}

/// Per-directive match counts returned by the apply script
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizationReport {
    pub matched: Vec<u32>,
}

/// Elements whose style did not hold after normalization
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Drift {
    /// Indices of directives with at least one drifting element
    pub directives: Vec<usize>,
}

/// An ordered, static list of directives
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizationSet {
    directives: Vec<Directive>,
}

impl NormalizationSet {
    pub fn new(directives: Vec<Directive>) -> Self {
        Self { directives }
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Reject directives that can never apply.
    pub fn validate(&self) -> Result<()> {
        for (i, d) in self.directives.iter().enumerate() {
            if d.selector().trim().is_empty() {
                return Err(Error::ConfigError(format!("directive {} has an empty selector", i)));
            }
            if let Directive::SetStyle { property, .. } = d {
                let ok = !property.is_empty()
                    && property
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-');
                if !ok {
                    return Err(Error::ConfigError(format!(
                        "directive {} has invalid style property '{}'",
                        i, property
                    )));
                }
            }
        }
        Ok(())
    }

    /// JSON array literal of `[selector, property, value]` triples embedded
    /// in the page scripts. Serializing through serde_json keeps arbitrary
    /// selector text safe inside the script.
    fn steps_literal(&self) -> String {
        let steps: Vec<[&str; 3]> = self
            .directives
            .iter()
            .map(|d| {
                let (p, v) = d.style();
                [d.selector(), p, v]
            })
            .collect();
        serde_json::to_string(&steps).unwrap_or_else(|_| "[]".to_string())
    }

    /// Expression applying every directive; evaluates to a JSON
    /// [`NormalizationReport`].
    pub fn apply_script(&self) -> String {
        format!(
            r#"JSON.stringify((() => {{
    const steps = {steps};
    const matched = steps.map(([sel, prop, value]) => {{
        let els;
        try {{ els = document.querySelectorAll(sel); }} catch (e) {{ return 0; }}
        els.forEach(el => el.style.setProperty(prop, value));
        return els.length;
    }});
    return {{ matched }};
}})())"#,
            steps = self.steps_literal()
        )
    }

    /// Expression re-reading the enforced inline styles; evaluates to a JSON
    /// [`Drift`].
    pub fn verify_script(&self) -> String {
        format!(
            r#"JSON.stringify((() => {{
    const steps = {steps};
    const directives = [];
    steps.forEach(([sel, prop, value], i) => {{
        let els;
        try {{ els = document.querySelectorAll(sel); }} catch (e) {{ return; }}
        for (const el of els) {{
            const inline = el.style.getPropertyValue(prop);
            const computed = prop === 'animation'
                ? getComputedStyle(el).animationName
                : inline;
            if (inline !== value || computed !== value) {{ directives.push(i); break; }}
        }}
    }});
    return {{ directives }};
}})())"#,
            steps = self.steps_literal()
        )
    }

    /// Parse the apply script's result, enforcing `required` directives.
    pub fn check_report(&self, raw: &str) -> Result<NormalizationReport> {
        let report: NormalizationReport = serde_json::from_str(raw)
            .map_err(|e| Error::ScriptError(format!("bad normalization report '{}': {}", raw, e)))?;
        if report.matched.len() != self.directives.len() {
            return Err(Error::ScriptError(format!(
                "normalization report has {} entries for {} directives",
                report.matched.len(),
                self.directives.len()
            )));
        }

        for (d, &n) in self.directives.iter().zip(&report.matched) {
            if n == 0 {
                if d.required() {
                    return Err(Error::ElementNotFound(d.selector().to_string()));
                }
                warn!("normalization selector '{}' matched nothing", d.selector());
            } else {
                debug!("normalization selector '{}' matched {} element(s)", d.selector(), n);
            }
        }
        Ok(report)
    }

    /// Parse the verify script's result.
    pub fn parse_drift(&self, raw: &str) -> Result<Drift> {
        serde_json::from_str(raw)
            .map_err(|e| Error::ScriptError(format!("bad drift report '{}': {}", raw, e)))
    }
}

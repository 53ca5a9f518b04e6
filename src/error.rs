//! Error types for the capture pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while exporting a document
#[derive(Error, Debug)]
pub enum Error {
    /// No automation backend could be located or launched
    #[error("Rendering engine unavailable: {0}")]
    EngineUnavailable(String),

    /// A browsing context could not be created (session gone or closed)
    #[error("Failed to create browsing context: {0}")]
    ContextCreation(String),

    /// The document did not reach network idle in time
    #[error("Navigation to {url} did not settle within {timeout_ms}ms")]
    NavigationTimeout { url: String, timeout_ms: u64 },

    /// The input document does not exist locally
    #[error("Input document not found: {}", .0.display())]
    DocumentNotFound(PathBuf),

    /// Navigation failed for a reason other than the timeout
    #[error("Failed to load {url}: {reason}")]
    LoadError { url: String, reason: String },

    /// An expected selector matched nothing
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// The screenshot or PDF call itself failed
    #[error("Capture failed: {0}")]
    CaptureFailure(String),

    /// Injected script failed or returned something unexpected
    #[error("Script execution failed: {0}")]
    ScriptError(String),

    /// Invalid plan or option
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Filesystem error while reading input or writing artifacts
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Copy of this error with the same kind and message.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Error::EngineUnavailable(m) => Error::EngineUnavailable(m.clone()),
            Error::ContextCreation(m) => Error::ContextCreation(m.clone()),
            Error::NavigationTimeout { url, timeout_ms } => Error::NavigationTimeout {
                url: url.clone(),
                timeout_ms: *timeout_ms,
            },
            Error::DocumentNotFound(p) => Error::DocumentNotFound(p.clone()),
            Error::LoadError { url, reason } => Error::LoadError {
                url: url.clone(),
                reason: reason.clone(),
            },
            Error::ElementNotFound(m) => Error::ElementNotFound(m.clone()),
            Error::CaptureFailure(m) => Error::CaptureFailure(m.clone()),
            Error::ScriptError(m) => Error::ScriptError(m.clone()),
            Error::ConfigError(m) => Error::ConfigError(m.clone()),
            Error::Io { path, source } => Error::Io {
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            #[cfg(feature = "cdp")]
            Error::CdpError(m) => Error::CdpError(m.clone()),
            Error::Other(m) => Error::Other(m.clone()),
        }
    }

    /// Whether this error points at the automation backend rather than the
    /// document or the plan. The fallback runner only switches backends for
    /// these.
    pub fn is_backend_failure(&self) -> bool {
        match self {
            Error::EngineUnavailable(_)
            | Error::ContextCreation(_)
            | Error::NavigationTimeout { .. }
            | Error::LoadError { .. }
            | Error::CaptureFailure(_)
            | Error::ScriptError(_)
            | Error::Other(_) => true,
            #[cfg(feature = "cdp")]
            Error::CdpError(_) => true,
            Error::DocumentNotFound(_)
            | Error::ElementNotFound(_)
            | Error::ConfigError(_)
            | Error::Io { .. } => false,
        }
    }

    /// Short stable name of the variant, used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::EngineUnavailable(_) => "engine_unavailable",
            Error::ContextCreation(_) => "context_creation",
            Error::NavigationTimeout { .. } => "navigation_timeout",
            Error::DocumentNotFound(_) => "document_not_found",
            Error::LoadError { .. } => "load_error",
            Error::ElementNotFound(_) => "element_not_found",
            Error::CaptureFailure(_) => "capture_failure",
            Error::ScriptError(_) => "script_error",
            Error::ConfigError(_) => "config_error",
            Error::Io { .. } => "io",
            #[cfg(feature = "cdp")]
            Error::CdpError(_) => "cdp",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_errors_do_not_trigger_fallback() {
        assert!(!Error::ElementNotFound(".poster".into()).is_backend_failure());
        assert!(!Error::DocumentNotFound(PathBuf::from("x.html")).is_backend_failure());
        assert!(Error::EngineUnavailable("no chrome".into()).is_backend_failure());
        assert!(Error::NavigationTimeout {
            url: "file:///x.html".into(),
            timeout_ms: 10
        }
        .is_backend_failure());
    }

    #[test]
    fn timeout_message_names_url() {
        let e = Error::NavigationTimeout {
            url: "file:///tmp/a.html".into(),
            timeout_ms: 250,
        };
        assert_eq!(e.to_string(), "Navigation to file:///tmp/a.html did not settle within 250ms");
        assert_eq!(e.kind(), "navigation_timeout");
    }

    #[cfg(feature = "cdp")]
    #[test]
    fn cdp_errors_fall_back_and_replicate() {
        let e = Error::CdpError("Failed to dispose browser context: gone".into());
        assert!(e.is_backend_failure());
        assert_eq!(e.kind(), "cdp");
        assert_eq!(e.replicate().to_string(), e.to_string());
    }
}

//! Error types for site2pdf.
//!
//! Every failure of an export run ends up as an [`ExportError`]. Selector and
//! configuration errors are raised before any process is started; render and
//! merge errors carry the page or output file they concern.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for site2pdf operations.
pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Source directory '{}' does not exist", .0.display())]
    SourceDirMissing(PathBuf),

    #[error("Invalid site configuration in {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("Two pages share the same {field} '{value}'")]
    DuplicatePage { field: &'static str, value: String },

    #[error("'{0}' is listed more than once in exportPdfOrder")]
    DuplicateOrderEntry(String),

    #[error("No pages matched the configured export order")]
    NoPagesSelected,

    #[error("Every selected page failed to render")]
    NoPagesRendered,

    #[error("Invalid page location for {path}: {reason}")]
    Location { path: String, reason: String },

    #[error("Failed to start dev server `{command}`: {source}")]
    ServerSpawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Dev server exited before it was ready ({status})")]
    ServerExited { status: String },

    #[error("Dev server at {address} was not reachable within {timeout:?}")]
    ServerTimeout { address: String, timeout: Duration },

    #[error("Failed to launch browser: {0}")]
    Browser(String),

    #[error("Failed to render {title} ({url}): {reason}")]
    Render {
        title: String,
        url: String,
        reason: String,
    },

    #[error("Timed out after {timeout:?} rendering {title} ({url})")]
    RenderTimeout {
        title: String,
        url: String,
        timeout: Duration,
    },

    #[error("No PDFs added to merge")]
    NothingToMerge,

    #[error("Failed to parse PDF file {}: {source}", path.display())]
    Pdf {
        path: PathBuf,
        #[source]
        source: lopdf::Error,
    },

    #[error("Failed to export {}: {source}", output.display())]
    Merge {
        output: PathBuf,
        #[source]
        source: Box<ExportError>,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ExportError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        ExportError::Io {
            context: context.into(),
            source,
        }
    }
}

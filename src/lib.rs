//! # site2pdf
//!
//! A CLI utility to export a local documentation site into a single PDF file.
//!
//! The site's dev server is started as a child process, every selected page is
//! printed to an A4 PDF by headless Chrome, and the pages are merged in export
//! order into `<site title>.pdf`.
//!
//! ## Usage
//!
//! ```bash
//! site2pdf export docs -- --debug
//! ```
//!
//! Pages and their order come from `exportPdfOrder` in `.vuepress/config.toml`
//! (or `config.json`); without it every page is exported.

mod error;
mod pdf_merger;
mod pipeline;
mod render;
mod selector;
mod server;
mod site;

pub use error::{ExportError, Result};
pub use pdf_merger::{MergeSummary, Merger, PdfMerger};
pub use pipeline::{
    ExportOptions, ExportOutcome, ExportPipeline, ExportReport, ExportState, PageErrorPolicy,
    SkippedPage,
};
pub use render::{BrowserLauncher, BrowserOptions, ChromeLauncher, PdfOptions, Renderer};
pub use selector::{build_export_pages, select_pages, ExportPage};
pub use server::{
    DevServerConfig, ProcessDevServer, ServerAddress, ServerLog, SiteServer, DEFAULT_DEV_COMMAND,
};
pub use site::{Page, Site, SiteConfig, DEFAULT_OUTPUT_NAME};

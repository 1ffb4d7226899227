//! The export run: dev server → browser → merge, with cleanup on every exit path.

use colored::*;
use std::fmt;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ExportError, Result};
use crate::pdf_merger::Merger;
use crate::render::{BrowserLauncher, Renderer};
use crate::selector::{build_export_pages, select_pages, ExportPage};
use crate::server::{DevServerConfig, SiteServer};
use crate::site::{Page, Site};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    ServerStarting,
    Rendering,
    Merging,
    CleaningUp,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for ExportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportState::Idle => "idle",
            ExportState::ServerStarting => "server-starting",
            ExportState::Rendering => "rendering",
            ExportState::Merging => "merging",
            ExportState::CleaningUp => "cleaning-up",
            ExportState::Done => "done",
            ExportState::Failed => "failed",
            ExportState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What to do when a single page fails to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageErrorPolicy {
    /// Stop the whole export on the first failure.
    #[default]
    Abort,
    /// Leave the page out of the merged file and keep going.
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub out_dir: PathBuf,
    /// Parent of the per-run temp directory; the system temp dir when `None`.
    pub temp_root: Option<PathBuf>,
    pub page_error_policy: PageErrorPolicy,
    pub server: DevServerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPage {
    pub title: String,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub output: PathBuf,
    pub pages: usize,
    pub skipped: Vec<SkippedPage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Completed(ExportReport),
    /// Stopped by the cancellation token; nothing was merged.
    Cancelled { rendered: usize },
}

pub struct ExportPipeline {
    site: Site,
    options: ExportOptions,
    server: Box<dyn SiteServer>,
    launcher: Box<dyn BrowserLauncher>,
    merger: Box<dyn Merger>,
    state: ExportState,
    renderer: Option<Box<dyn Renderer>>,
    temp_dir: Option<TempDir>,
}

impl ExportPipeline {
    pub fn new(
        site: Site,
        options: ExportOptions,
        server: Box<dyn SiteServer>,
        launcher: Box<dyn BrowserLauncher>,
        merger: Box<dyn Merger>,
    ) -> Self {
        Self {
            site,
            options,
            server,
            launcher,
            merger,
            state: ExportState::Idle,
            renderer: None,
            temp_dir: None,
        }
    }

    pub fn state(&self) -> ExportState {
        self.state
    }

    pub fn output_path(&self) -> PathBuf {
        self.options
            .out_dir
            .join(format!("{}.pdf", self.site.output_name()))
    }

    fn transition(&mut self, next: ExportState) {
        debug!("Export state {} -> {}", self.state, next);
        self.state = next;
    }

    /// Runs the export. Browser, dev server and temp directory are released
    /// before this returns, whatever the outcome.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<ExportOutcome> {
        // Selection problems are reported before any process is started.
        let site = self.site.clone();
        let selected = select_pages(&site.pages, site.config.export_pdf_order.as_deref())?;

        let result = self.run_stages(&selected, cancel).await;

        self.transition(ExportState::CleaningUp);
        self.cleanup().await;

        let terminal = match &result {
            Ok(ExportOutcome::Completed(_)) => ExportState::Done,
            Ok(ExportOutcome::Cancelled { .. }) => ExportState::Cancelled,
            Err(_) => ExportState::Failed,
        };
        self.transition(terminal);

        result
    }

    async fn run_stages(&mut self, selected: &[&Page], cancel: &CancellationToken) -> Result<ExportOutcome> {
        if cancel.is_cancelled() {
            return Ok(ExportOutcome::Cancelled { rendered: 0 });
        }

        self.transition(ExportState::ServerStarting);
        let address = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ExportOutcome::Cancelled { rendered: 0 }),
            address = self.server.start(&self.options.server) => address?,
        };

        self.transition(ExportState::Rendering);
        info!("Start to generate current site to PDF ...");

        let temp_dir = self.create_temp_dir()?;
        let export_pages = build_export_pages(selected, &address.base_url()?, temp_dir.path())?;
        self.temp_dir = Some(temp_dir);

        let renderer = self.launcher.launch().await?;
        let renderer = self.renderer.insert(renderer);

        let total = export_pages.len();
        let mut rendered: Vec<&ExportPage> = Vec::with_capacity(total);
        let mut skipped = Vec::new();

        for (index, page) in export_pages.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Export cancelled after {} of {} pages", rendered.len(), total);
                return Ok(ExportOutcome::Cancelled {
                    rendered: rendered.len(),
                });
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = renderer.render(page) => Some(outcome),
            };

            match outcome {
                None => {
                    warn!("Export cancelled while rendering {}", page.title);
                    return Ok(ExportOutcome::Cancelled {
                        rendered: rendered.len(),
                    });
                }
                Some(Ok(())) => {
                    info!(
                        "[{}/{}] Generated {} {}",
                        index + 1,
                        total,
                        page.title.yellow(),
                        page.url.dimmed()
                    );
                    rendered.push(page);
                }
                Some(Err(e)) => match self.options.page_error_policy {
                    PageErrorPolicy::Abort => return Err(e),
                    PageErrorPolicy::Skip => {
                        warn!("[{}/{}] Skipping {}: {}", index + 1, total, page.title.yellow(), e);
                        skipped.push(SkippedPage {
                            title: page.title.clone(),
                            url: page.url.clone(),
                            reason: e.to_string(),
                        });
                    }
                },
            }
        }

        if rendered.is_empty() {
            return Err(ExportError::NoPagesRendered);
        }

        self.transition(ExportState::Merging);
        let output = self.output_path();
        fs::create_dir_all(&self.options.out_dir).await.map_err(|e| {
            let context = format!("Failed to create output directory {}", self.options.out_dir.display());
            ExportError::io(context, e)
        })?;

        let files: Vec<PathBuf> = rendered.iter().map(|p| p.path.clone()).collect();
        let summary = self
            .merger
            .merge(&files, &output, self.site.config.title.as_deref())
            .await
            .map_err(|e| ExportError::Merge {
                output: output.clone(),
                source: Box::new(e),
            })?;

        info!(
            "Export {} file! ({} pages)",
            output.display().to_string().yellow(),
            summary.pages
        );

        Ok(ExportOutcome::Completed(ExportReport {
            output,
            pages: rendered.len(),
            skipped,
        }))
    }

    fn create_temp_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("site2pdf-");
        let created = match &self.options.temp_root {
            Some(root) => std::fs::create_dir_all(root).and_then(|_| builder.tempdir_in(root)),
            None => builder.tempdir(),
        };
        let temp_dir = created.map_err(|e| ExportError::io("Failed to create temp directory", e))?;
        debug!("Rendering into {}", temp_dir.path().display());
        Ok(temp_dir)
    }

    /// Failures here are logged only, so they never hide the run's own error.
    async fn cleanup(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            if let Err(e) = renderer.close().await {
                warn!("Failed to close browser: {}", e);
            }
        }

        if let Err(e) = self.server.stop().await {
            warn!("Failed to stop dev server: {}", e);
        }

        if let Some(temp_dir) = self.temp_dir.take() {
            let path = temp_dir.path().to_path_buf();
            match temp_dir.close() {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf_merger::tests::{page_labels, write_labeled_pdf};
    use crate::pdf_merger::{MergeSummary, PdfMerger};
    use crate::render::Renderer;
    use crate::server::ServerAddress;
    use crate::site::SiteConfig;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    struct FakeServer {
        journal: Arc<Journal>,
        fail: bool,
        /// Never becomes ready.
        hang: bool,
    }

    #[async_trait]
    impl SiteServer for FakeServer {
        async fn start(&mut self, _config: &DevServerConfig) -> Result<ServerAddress> {
            self.journal.push("server:start");
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(ExportError::ServerExited {
                    status: "exit status: 1".to_string(),
                });
            }
            Ok(ServerAddress {
                host: "127.0.0.1".to_string(),
                port: 8080,
            })
        }

        async fn stop(&mut self) -> Result<()> {
            self.journal.push("server:stop");
            Ok(())
        }
    }

    struct FakeLauncher {
        journal: Arc<Journal>,
        fail_on: Option<String>,
        hang_on: Option<String>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self) -> Result<Box<dyn Renderer>> {
            self.journal.push("browser:launch");
            Ok(Box::new(FakeRenderer {
                journal: self.journal.clone(),
                fail_on: self.fail_on.clone(),
                hang_on: self.hang_on.clone(),
                cancel_after: self.cancel_after.clone(),
                count: 0,
            }))
        }
    }

    struct FakeRenderer {
        journal: Arc<Journal>,
        fail_on: Option<String>,
        hang_on: Option<String>,
        cancel_after: Option<(usize, CancellationToken)>,
        count: usize,
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn render(&mut self, page: &ExportPage) -> Result<()> {
            self.journal.push(format!("render:{}", page.location));
            if self.hang_on.as_deref() == Some(page.title.as_str()) {
                std::future::pending::<()>().await;
            }
            if self.fail_on.as_deref() == Some(page.title.as_str()) {
                return Err(ExportError::Render {
                    title: page.title.clone(),
                    url: page.url.clone(),
                    reason: "net::ERR_TIMED_OUT".to_string(),
                });
            }
            write_labeled_pdf(&page.path, &[page.title.as_str()]);
            self.count += 1;
            if let Some((after, token)) = &self.cancel_after {
                if self.count == *after {
                    token.cancel();
                }
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.journal.push("browser:close");
            Ok(())
        }
    }

    struct FailingMerger;

    #[async_trait]
    impl Merger for FailingMerger {
        async fn merge(&self, _inputs: &[PathBuf], _output: &Path, _title: Option<&str>) -> Result<MergeSummary> {
            Err(ExportError::io(
                "merge utility",
                std::io::Error::other("broken pipe"),
            ))
        }
    }

    fn page(name: &str, title: &str) -> Page {
        Page {
            relative_path: format!("{}.md", name),
            key: name.to_string(),
            path: format!("/{}.html", name),
            title: title.to_string(),
        }
    }

    fn site(order: Option<&[&str]>, title: Option<&str>) -> Site {
        Site {
            source_dir: PathBuf::from("."),
            config: SiteConfig {
                title: title.map(str::to_string),
                export_pdf_order: order.map(|o| o.iter().map(|e| e.to_string()).collect()),
            },
            pages: vec![page("a", "A"), page("b", "B"), page("c", "C")],
        }
    }

    struct Harness {
        journal: Arc<Journal>,
        out: TempDir,
        temp_root: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                journal: Arc::new(Journal::default()),
                out: tempdir().unwrap(),
                temp_root: tempdir().unwrap(),
            }
        }

        fn options(&self, policy: PageErrorPolicy) -> ExportOptions {
            ExportOptions {
                out_dir: self.out.path().to_path_buf(),
                temp_root: Some(self.temp_root.path().to_path_buf()),
                page_error_policy: policy,
                server: DevServerConfig::new(PathBuf::from(".")),
            }
        }

        fn pipeline(&self, site: Site, policy: PageErrorPolicy, launcher: FakeLauncher) -> ExportPipeline {
            ExportPipeline::new(
                site,
                self.options(policy),
                Box::new(FakeServer {
                    journal: self.journal.clone(),
                    fail: false,
                    hang: false,
                }),
                Box::new(launcher),
                Box::new(PdfMerger::new()),
            )
        }

        fn launcher(&self) -> FakeLauncher {
            FakeLauncher {
                journal: self.journal.clone(),
                fail_on: None,
                hang_on: None,
                cancel_after: None,
            }
        }

        fn hanging_server_pipeline(&self, site: Site) -> ExportPipeline {
            ExportPipeline::new(
                site,
                self.options(PageErrorPolicy::Abort),
                Box::new(FakeServer {
                    journal: self.journal.clone(),
                    fail: false,
                    hang: true,
                }),
                Box::new(self.launcher()),
                Box::new(PdfMerger::new()),
            )
        }

        fn temp_is_empty(&self) -> bool {
            std::fs::read_dir(self.temp_root.path()).unwrap().next().is_none()
        }
    }

    #[tokio::test]
    async fn exports_pages_in_configured_order() {
        let harness = Harness::new();
        let mut pipeline = harness.pipeline(
            site(Some(&["b.md", "a.md"]), Some("Handbook")),
            PageErrorPolicy::Abort,
            harness.launcher(),
        );

        let outcome = pipeline.run(&CancellationToken::new()).await.unwrap();

        let output = harness.out.path().join("Handbook.pdf");
        assert_eq!(
            outcome,
            ExportOutcome::Completed(ExportReport {
                output: output.clone(),
                pages: 2,
                skipped: Vec::new(),
            })
        );
        assert_eq!(page_labels(&output), vec!["B", "A"]);
        assert_eq!(pipeline.state(), ExportState::Done);
        assert_eq!(
            harness.journal.events(),
            vec![
                "server:start",
                "browser:launch",
                "render:http://127.0.0.1:8080/b.html",
                "render:http://127.0.0.1:8080/a.html",
                "browser:close",
                "server:stop",
            ]
        );
        assert!(harness.temp_is_empty());
    }

    #[tokio::test]
    async fn missing_title_falls_back_to_default_name() {
        let harness = Harness::new();
        let mut pipeline = harness.pipeline(site(None, None), PageErrorPolicy::Abort, harness.launcher());

        pipeline.run(&CancellationToken::new()).await.unwrap();

        let output = harness.out.path().join("site.pdf");
        assert_eq!(page_labels(&output), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn render_failure_aborts_and_still_cleans_up() {
        let harness = Harness::new();
        let mut launcher = harness.launcher();
        launcher.fail_on = Some("B".to_string());
        let mut pipeline = harness.pipeline(site(None, Some("Docs")), PageErrorPolicy::Abort, launcher);

        let err = pipeline.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ExportError::Render { ref title, .. } if title == "B"));
        assert_eq!(pipeline.state(), ExportState::Failed);
        assert!(!harness.out.path().join("Docs.pdf").exists());
        let events = harness.journal.events();
        assert!(!events.contains(&"render:http://127.0.0.1:8080/c.html".to_string()));
        assert_eq!(&events[events.len() - 2..], ["browser:close", "server:stop"]);
        assert!(harness.temp_is_empty());
    }

    #[tokio::test]
    async fn skip_policy_leaves_failed_pages_out() {
        let harness = Harness::new();
        let mut launcher = harness.launcher();
        launcher.fail_on = Some("B".to_string());
        let mut pipeline = harness.pipeline(site(None, Some("Docs")), PageErrorPolicy::Skip, launcher);

        let outcome = pipeline.run(&CancellationToken::new()).await.unwrap();

        let ExportOutcome::Completed(report) = outcome else {
            panic!("expected a completed export");
        };
        assert_eq!(report.pages, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].title, "B");
        assert_eq!(page_labels(&report.output), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn skip_policy_fails_when_nothing_rendered() {
        let harness = Harness::new();
        let mut launcher = harness.launcher();
        launcher.fail_on = Some("A".to_string());
        let mut pipeline = harness.pipeline(site(Some(&["a.md"]), None), PageErrorPolicy::Skip, launcher);

        let err = pipeline.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExportError::NoPagesRendered));
        assert!(harness.temp_is_empty());
    }

    #[tokio::test]
    async fn merge_failure_is_fatal() {
        let harness = Harness::new();
        let mut pipeline = ExportPipeline::new(
            site(None, Some("Docs")),
            harness.options(PageErrorPolicy::Abort),
            Box::new(FakeServer {
                journal: harness.journal.clone(),
                fail: false,
                hang: false,
            }),
            Box::new(harness.launcher()),
            Box::new(FailingMerger),
        );

        let err = pipeline.run(&CancellationToken::new()).await.unwrap_err();

        match err {
            ExportError::Merge { output, .. } => {
                assert_eq!(output, harness.out.path().join("Docs.pdf"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pipeline.state(), ExportState::Failed);
        assert!(harness.journal.events().contains(&"server:stop".to_string()));
        assert!(harness.temp_is_empty());
    }

    #[tokio::test]
    async fn server_failure_stops_before_rendering() {
        let harness = Harness::new();
        let mut pipeline = ExportPipeline::new(
            site(None, None),
            harness.options(PageErrorPolicy::Abort),
            Box::new(FakeServer {
                journal: harness.journal.clone(),
                fail: true,
                hang: false,
            }),
            Box::new(harness.launcher()),
            Box::new(PdfMerger::new()),
        );

        let err = pipeline.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ExportError::ServerExited { .. }));
        assert_eq!(harness.journal.events(), vec!["server:start", "server:stop"]);
    }

    #[tokio::test]
    async fn empty_selection_never_starts_the_server() {
        let harness = Harness::new();
        let mut pipeline = harness.pipeline(
            site(Some(&["missing.md"]), None),
            PageErrorPolicy::Abort,
            harness.launcher(),
        );

        let err = pipeline.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ExportError::NoPagesSelected));
        assert!(harness.journal.events().is_empty());
        assert_eq!(pipeline.state(), ExportState::Idle);
    }

    #[tokio::test]
    async fn cancellation_stops_new_renders_and_cleans_up() {
        let harness = Harness::new();
        let token = CancellationToken::new();
        let mut launcher = harness.launcher();
        launcher.cancel_after = Some((1, token.clone()));
        let mut pipeline = harness.pipeline(site(None, Some("Docs")), PageErrorPolicy::Abort, launcher);

        let outcome = pipeline.run(&token).await.unwrap();

        assert_eq!(outcome, ExportOutcome::Cancelled { rendered: 1 });
        assert_eq!(pipeline.state(), ExportState::Cancelled);
        assert!(!harness.out.path().join("Docs.pdf").exists());
        let renders = harness
            .journal
            .events()
            .iter()
            .filter(|e| e.starts_with("render:"))
            .count();
        assert_eq!(renders, 1);
        assert!(harness.journal.events().ends_with(&[
            "browser:close".to_string(),
            "server:stop".to_string()
        ]));
        assert!(harness.temp_is_empty());
    }

    #[tokio::test]
    async fn already_cancelled_token_does_nothing() {
        let harness = Harness::new();
        let token = CancellationToken::new();
        token.cancel();
        let mut pipeline = harness.pipeline(site(None, None), PageErrorPolicy::Abort, harness.launcher());

        let outcome = pipeline.run(&token).await.unwrap();

        assert_eq!(outcome, ExportOutcome::Cancelled { rendered: 0 });
        assert_eq!(harness.journal.events(), vec!["server:stop"]);
    }

    fn cancel_soon(token: &CancellationToken) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_page_in_flight() {
        let harness = Harness::new();
        let token = CancellationToken::new();
        let mut launcher = harness.launcher();
        launcher.hang_on = Some("B".to_string());
        let mut pipeline = harness.pipeline(site(None, Some("Docs")), PageErrorPolicy::Abort, launcher);

        cancel_soon(&token);
        let outcome = pipeline.run(&token).await.unwrap();

        assert_eq!(outcome, ExportOutcome::Cancelled { rendered: 1 });
        assert_eq!(pipeline.state(), ExportState::Cancelled);
        assert_eq!(
            harness.journal.events(),
            vec![
                "server:start",
                "browser:launch",
                "render:http://127.0.0.1:8080/a.html",
                "render:http://127.0.0.1:8080/b.html",
                "browser:close",
                "server:stop",
            ]
        );
        assert!(!harness.out.path().join("Docs.pdf").exists());
        assert!(harness.temp_is_empty());
    }

    #[tokio::test]
    async fn cancellation_while_server_starts_skips_rendering() {
        let harness = Harness::new();
        let token = CancellationToken::new();
        let mut pipeline = harness.hanging_server_pipeline(site(None, Some("Docs")));

        cancel_soon(&token);
        let outcome = pipeline.run(&token).await.unwrap();

        assert_eq!(outcome, ExportOutcome::Cancelled { rendered: 0 });
        assert_eq!(pipeline.state(), ExportState::Cancelled);
        assert_eq!(harness.journal.events(), vec!["server:start", "server:stop"]);
        assert!(!harness.out.path().join("Docs.pdf").exists());
        assert!(harness.temp_is_empty());
    }

    #[tokio::test]
    async fn repeated_exports_produce_the_same_document() {
        let harness = Harness::new();
        let output = harness.out.path().join("Handbook.pdf");
        let mut runs = Vec::new();

        for _ in 0..2 {
            let mut pipeline = harness.pipeline(
                site(Some(&["c.md", "a.md"]), Some("Handbook")),
                PageErrorPolicy::Abort,
                harness.launcher(),
            );
            let outcome = pipeline.run(&CancellationToken::new()).await.unwrap();
            let ExportOutcome::Completed(report) = outcome else {
                panic!("expected a completed export");
            };
            assert_eq!(report.output, output);
            runs.push((report.pages, page_labels(&output)));
        }

        assert_eq!(runs[0], (2, vec!["C".to_string(), "A".to_string()]));
        assert_eq!(runs[0], runs[1]);
        assert_eq!(std::fs::read_dir(harness.out.path()).unwrap().count(), 1);
        assert!(harness.temp_is_empty());
    }
}

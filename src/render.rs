use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::LoaderId;
use chromiumoxide::cdp::browser_protocol::page::{
    EventLifecycleEvent, FrameId, NavigateParams, PrintToPdfParams,
    SetLifecycleEventsEnabledParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures_util::{Stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{ExportError, Result};
use crate::selector::ExportPage;

/// Chrome reports this once no more than 2 connections were active for 500ms.
const NETWORK_ALMOST_IDLE: &str = "networkAlmostIdle";

#[derive(Debug, Clone)]
pub struct PdfOptions {
    pub scale: f64,
    /// Paper size in inches.
    pub paper_width: f64,
    pub paper_height: f64,
    pub margin_top: f64,
    pub margin_right: f64,
    pub margin_bottom: f64,
    pub margin_left: f64,
    pub print_background: bool,
}

impl PdfOptions {
    pub fn a4() -> Self {
        Self {
            scale: 1.0,
            paper_width: 8.27,
            paper_height: 11.7,
            margin_top: 0.0,
            margin_right: 0.0,
            margin_bottom: 0.0,
            margin_left: 0.0,
            print_background: false,
        }
    }

    pub fn to_params(&self) -> PrintToPdfParams {
        PrintToPdfParams {
            scale: Some(self.scale),
            paper_width: Some(self.paper_width),
            paper_height: Some(self.paper_height),
            margin_top: Some(self.margin_top),
            margin_right: Some(self.margin_right),
            margin_bottom: Some(self.margin_bottom),
            margin_left: Some(self.margin_left),
            print_background: Some(self.print_background),
            ..Default::default()
        }
    }
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self::a4()
    }
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub chrome_executable: Option<PathBuf>,
    pub no_sandbox: bool,
    /// Upper bound for loading and printing one page. Zero disables it.
    pub page_timeout: Duration,
    pub pdf: PdfOptions,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            no_sandbox: false,
            page_timeout: Duration::from_secs(30),
            pdf: PdfOptions::a4(),
        }
    }
}

/// Turns one served page into one PDF file on disk.
#[async_trait]
pub trait Renderer: Send {
    async fn render(&mut self, page: &ExportPage) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Renderer>>;
}

pub struct ChromeLauncher {
    options: BrowserOptions,
}

impl ChromeLauncher {
    pub fn new(options: BrowserOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn Renderer>> {
        let mut builder = BrowserConfig::builder().window_size(1280, 1024);
        if let Some(executable) = &self.options.chrome_executable {
            builder = builder.chrome_executable(executable);
        }
        if self.options.no_sandbox {
            builder = builder.no_sandbox();
        }
        let config = builder
            .build()
            .map_err(|e| ExportError::Browser(format!("Failed to create browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ExportError::Browser(e.to_string()))?;

        let handle = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(err) = h {
                    // Only log if it's not a common websocket deserialization error
                    let err_str = err.to_string();
                    if !err_str.contains("data did not match any variant")
                        && !err_str.contains("untagged enum Message")
                    {
                        error!("Browser handler error: {}", err);
                    } else {
                        debug!("Chrome protocol message ignored: {}", err);
                    }
                }
            }
        });

        let mut renderer = ChromeRenderer {
            browser,
            handler: handle,
            page: None,
            options: self.options.clone(),
        };

        match renderer.open_tab().await {
            Ok(page) => {
                renderer.page = Some(page);
                Ok(Box::new(renderer))
            }
            Err(e) => {
                renderer.close().await.ok();
                Err(e)
            }
        }
    }
}

/// One headless Chrome with a single tab reused for every page.
pub struct ChromeRenderer {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Option<Page>,
    options: BrowserOptions,
}

impl ChromeRenderer {
    async fn open_tab(&self) -> Result<Page> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| ExportError::Browser(format!("Failed to create new page: {}", e)))?;

        page.execute(SetLifecycleEventsEnabledParams::new(true))
            .await
            .map_err(|e| ExportError::Browser(format!("Failed to enable lifecycle events: {}", e)))?;

        Ok(page)
    }

    async fn render_page(tab: &Page, target: &ExportPage, pdf: &PdfOptions) -> std::result::Result<(), String> {
        // Subscribe before navigating so no lifecycle event of the new document is missed.
        let mut events = tab
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(|e| format!("Failed to listen for lifecycle events: {}", e))?;

        let navigation = tab
            .execute(NavigateParams::new(target.location.as_str()))
            .await
            .map_err(|e| format!("Failed to navigate: {}", e))?;

        if let Some(error_text) = &navigation.result.error_text {
            return Err(format!("Navigation failed: {}", error_text));
        }

        wait_for_network_almost_idle(
            &mut events,
            &navigation.result.frame_id,
            navigation.result.loader_id.as_ref(),
        )
        .await?;

        let pdf_data = tab
            .pdf(pdf.to_params())
            .await
            .map_err(|e| format!("Failed to generate PDF: {}", e))?;

        fs::write(&target.path, pdf_data)
            .await
            .map_err(|e| format!("Failed to write PDF to {}: {}", target.path.display(), e))?;

        Ok(())
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(&mut self, target: &ExportPage) -> Result<()> {
        let tab = self
            .page
            .as_ref()
            .ok_or_else(|| ExportError::Browser("Browser tab is not open".to_string()))?;

        let timeout = self.options.page_timeout;
        let work = Self::render_page(tab, target, &self.options.pdf);

        let outcome = if timeout.is_zero() {
            work.await
        } else {
            match tokio::time::timeout(timeout, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(ExportError::RenderTimeout {
                        title: target.title.clone(),
                        url: target.url.clone(),
                        timeout,
                    })
                }
            }
        };

        outcome.map_err(|reason| ExportError::Render {
            title: target.title.clone(),
            url: target.url.clone(),
            reason,
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.page = None;
        let closed = self.browser.close().await;
        self.handler.abort();
        closed
            .map(|_| ())
            .map_err(|e| ExportError::Browser(format!("Failed to close browser: {}", e)))
    }
}

/// Waits for the lifecycle event that ends the given navigation's network activity.
async fn wait_for_network_almost_idle<S>(
    events: &mut S,
    frame: &FrameId,
    loader: Option<&LoaderId>,
) -> std::result::Result<(), String>
where
    S: Stream<Item = Arc<EventLifecycleEvent>> + Unpin,
{
    while let Some(event) = events.next().await {
        if &event.frame_id != frame {
            continue;
        }
        if let Some(loader) = loader {
            if &event.loader_id != loader {
                continue;
            }
        }
        if event.name == NETWORK_ALMOST_IDLE {
            return Ok(());
        }
    }
    Err("Browser closed the lifecycle event stream".to_string())
}

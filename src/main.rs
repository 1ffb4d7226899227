use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use site2pdf::{
    BrowserOptions, ChromeLauncher, DevServerConfig, ExportOptions, ExportOutcome, ExportPipeline,
    PageErrorPolicy, PdfMerger, PdfOptions, ProcessDevServer, ServerLog, Site, DEFAULT_DEV_COMMAND,
};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "site2pdf")]
#[command(about = "CLI utility to export a local documentation site into a single PDF file")]
#[command(version = "0.1.0")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export the site in targetDir to a PDF file
    Export(ExportArgs),
}

#[derive(clap::Args, Debug)]
struct ExportArgs {
    /// Site source directory
    #[arg(value_name = "targetDir", default_value = ".")]
    target_dir: PathBuf,

    /// Directory the merged PDF is written to
    #[arg(short = 'o', long = "out-dir", default_value = ".")]
    out_dir: PathBuf,

    /// Command that starts the dev server
    #[arg(long = "dev-command", env = "SITE2PDF_DEV_COMMAND", default_value = DEFAULT_DEV_COMMAND)]
    dev_command: String,

    /// Host the dev server binds to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Dev server port (a free port is picked when omitted)
    #[arg(long)]
    port: Option<u16>,

    /// Seconds to wait for the dev server to accept connections
    #[arg(long = "server-timeout", default_value = "120", value_parser = parse_timeout)]
    server_timeout: Duration,

    /// Seconds allowed per page, 0 to wait forever
    #[arg(short = 't', long = "timeout", default_value = "30.0", value_parser = parse_timeout)]
    timeout: Duration,

    /// What to do when a page fails to render
    #[arg(long = "on-page-error", value_enum, default_value_t = OnPageError::Abort)]
    on_page_error: OnPageError,

    /// Site settings file (.toml, .json or .js) instead of .vuepress/config.*
    #[arg(long = "site-config")]
    site_config: Option<PathBuf>,

    /// Parent directory for the temporary page PDFs
    #[arg(long = "temp-dir")]
    temp_dir: Option<PathBuf>,

    /// Chrome/Chromium executable
    #[arg(long, env = "CHROME")]
    chrome: Option<PathBuf>,

    /// Launch Chrome without its sandbox (needed in some containers)
    #[arg(long = "no-sandbox")]
    no_sandbox: bool,

    /// Show the dev server's own output
    #[arg(long = "show-server-output")]
    show_server_output: bool,

    /// Flags passed through to the dev server unmodified. Everything after
    /// targetDir that is not one of the options above is forwarded, as is
    /// everything after `--`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "DEV_SERVER_FLAGS")]
    server_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OnPageError {
    /// Stop the export on the first failing page
    Abort,
    /// Leave failing pages out of the PDF
    Skip,
}

impl From<OnPageError> for PageErrorPolicy {
    fn from(value: OnPageError) -> Self {
        match value {
            OnPageError::Abort => PageErrorPolicy::Abort,
            OnPageError::Skip => PageErrorPolicy::Skip,
        }
    }
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    let value = s.parse::<f64>().map_err(|_| "Not a number.")?;
    if value < 0.0 || !value.is_finite() {
        return Err("Must be zero or positive number.".to_string());
    }
    Duration::try_from_secs_f64(value).map_err(|_| "Too large.".to_string())
}

async fn export(args: ExportArgs, cancel: CancellationToken) -> Result<ExportOutcome> {
    let source_dir = std::env::current_dir()
        .context("Failed to read current directory")?
        .join(&args.target_dir);

    let site = Site::load(&source_dir, args.site_config.as_deref()).await?;
    info!(
        "Loaded {} pages from {}",
        site.pages.len(),
        source_dir.display().to_string().green()
    );

    let server = DevServerConfig {
        host: args.host,
        port: args.port,
        log: if args.show_server_output {
            ServerLog::Inherit
        } else {
            ServerLog::Quiet
        },
        extra_args: args.server_args,
        startup_timeout: args.server_timeout,
        ..DevServerConfig::new(source_dir)
    };

    let options = ExportOptions {
        out_dir: args.out_dir,
        temp_root: args.temp_dir,
        page_error_policy: args.on_page_error.into(),
        server,
    };

    let browser = BrowserOptions {
        chrome_executable: args.chrome,
        no_sandbox: args.no_sandbox,
        page_timeout: args.timeout,
        pdf: PdfOptions::a4(),
    };

    let mut pipeline = ExportPipeline::new(
        site,
        options,
        Box::new(ProcessDevServer::new(&args.dev_command)),
        Box::new(ChromeLauncher::new(browser)),
        Box::new(PdfMerger::new()),
    );

    Ok(pipeline.run(&cancel).await?)
}

#[tokio::main]
async fn main() {
    // Set up logging with chromiumoxide errors suppressed
    let filter = EnvFilter::from_default_env()
        .add_directive("chromiumoxide::conn=off".parse().unwrap())
        .add_directive("chromiumoxide::handler=off".parse().unwrap())
        .add_directive("site2pdf=info".parse().unwrap());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let args = Args::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up...");
            on_signal.cancel();
        }
    });

    let result = match args.command {
        Commands::Export(export_args) => export(export_args, cancel).await,
    };

    match result {
        Ok(ExportOutcome::Completed(report)) => {
            for page in &report.skipped {
                warn!("Skipped {} {}: {}", page.title.yellow(), page.url.dimmed(), page.reason);
            }
            info!(
                "Done: {} pages in {}",
                report.pages,
                report.output.display().to_string().green()
            );
        }
        Ok(ExportOutcome::Cancelled { rendered }) => {
            warn!("Export cancelled after {} pages, no PDF written", rendered);
            process::exit(130);
        }
        Err(e) => {
            error!("{}", format!("Error: {:#}", e).red());
            process::exit(1);
        }
    }
}

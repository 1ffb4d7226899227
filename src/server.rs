use async_trait::async_trait;
use colored::*;
use std::fmt;
use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ExportError, Result};

pub const DEFAULT_DEV_COMMAND: &str = "npx vuepress dev";

/// How long the dev server gets to exit on SIGTERM before the group is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// What happens to the dev server's own console output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerLog {
    /// Discard it; startup noise would drown the export progress.
    #[default]
    Quiet,
    Inherit,
}

#[derive(Debug, Clone)]
pub struct DevServerConfig {
    pub source_dir: PathBuf,
    pub host: String,
    /// `None` picks a free ephemeral port.
    pub port: Option<u16>,
    pub clear_screen: bool,
    pub log: ServerLog,
    /// Flags forwarded verbatim to the dev server.
    pub extra_args: Vec<String>,
    pub startup_timeout: Duration,
}

impl DevServerConfig {
    pub fn new(source_dir: PathBuf) -> Self {
        Self {
            source_dir,
            host: "127.0.0.1".to_string(),
            port: None,
            clear_screen: false,
            log: ServerLog::Quiet,
            extra_args: Vec::new(),
            startup_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn base_url(&self) -> Result<Url> {
        let raw = format!("http://{}/", self);
        Url::parse(&raw).map_err(|e| ExportError::Location {
            path: raw,
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The local server the pages are rendered from.
#[async_trait]
pub trait SiteServer: Send {
    async fn start(&mut self, config: &DevServerConfig) -> Result<ServerAddress>;

    /// Must be safe to call when `start` failed or was never called.
    async fn stop(&mut self) -> Result<()>;
}

/// Runs the site generator's dev server as a child process.
///
/// On unix the child leads its own process group, so wrappers such as `npx`
/// are stopped together with the node server they start.
pub struct ProcessDevServer {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    group: Option<u32>,
}

impl ProcessDevServer {
    /// `command` is split on whitespace, e.g. `npx vuepress dev`.
    pub fn new(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
            child: None,
            group: None,
        }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Full argument list handed to the dev server.
    pub fn arguments(&self, config: &DevServerConfig, port: u16) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(config.source_dir.display().to_string());
        args.extend(["--host".to_string(), config.host.clone()]);
        args.extend(["--port".to_string(), port.to_string()]);
        if !config.clear_screen {
            args.push("--no-clear-screen".to_string());
        }
        args.extend(config.extra_args.iter().cloned());
        args
    }

    async fn wait_until_ready(&mut self, address: &ServerAddress, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let target = address.to_string();

        loop {
            if let Some(child) = self.child.as_mut() {
                let status = child
                    .try_wait()
                    .map_err(|e| ExportError::io("Failed to poll dev server", e))?;
                if let Some(status) = status {
                    self.child = None;
                    return Err(ExportError::ServerExited {
                        status: status.to_string(),
                    });
                }
            }

            if TcpStream::connect(target.as_str()).await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ExportError::ServerTimeout {
                    address: target,
                    timeout,
                });
            }

            sleep(Duration::from_millis(250)).await;
        }
    }
}

#[async_trait]
impl SiteServer for ProcessDevServer {
    async fn start(&mut self, config: &DevServerConfig) -> Result<ServerAddress> {
        if self.program.is_empty() {
            return Err(ExportError::ServerSpawn {
                command: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty dev command"),
            });
        }

        let port = match config.port {
            Some(port) => port,
            None => free_port(&config.host)?,
        };
        let address = ServerAddress {
            host: config.host.clone(),
            port,
        };

        let args = self.arguments(config, port);
        debug!("Spawning dev server: {} {}", self.program, args.join(" "));

        let (stdout, stderr) = match config.log {
            ServerLog::Quiet => (Stdio::null(), Stdio::null()),
            ServerLog::Inherit => (Stdio::inherit(), Stdio::inherit()),
        };

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ExportError::ServerSpawn {
            command: self.command_line(),
            source,
        })?;
        if cfg!(unix) {
            self.group = child.id();
        }
        self.child = Some(child);

        info!("Waiting for dev server on {}", address.to_string().green());
        self.wait_until_ready(&address, config.startup_timeout).await?;
        info!("Dev server ready at {}", address.to_string().green());

        Ok(address)
    }

    async fn stop(&mut self) -> Result<()> {
        let child = self.child.take();
        let group = self.group.take();

        #[cfg(unix)]
        if let Some(group) = group {
            return terminate_group(group, child).await;
        }
        #[cfg(not(unix))]
        let _ = group;

        let Some(mut child) = child else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Dev server already exited ({})", status);
            return Ok(());
        }

        child
            .kill()
            .await
            .map_err(|e| ExportError::io("Failed to stop dev server", e))?;
        debug!("Dev server stopped");
        Ok(())
    }
}

impl Drop for ProcessDevServer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(group) = self.group.take() {
            signal_group(group, nix::sys::signal::Signal::SIGKILL);
            return;
        }

        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill dev server: {}", e);
            }
        }
    }
}

/// SIGTERM to the whole group, SIGKILL after [`STOP_GRACE`], then reap the leader.
#[cfg(unix)]
async fn terminate_group(group: u32, child: Option<Child>) -> Result<()> {
    use nix::sys::signal::Signal;

    let delivered = signal_group(group, Signal::SIGTERM);

    match child {
        Some(mut child) => {
            if delivered && tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
                warn!("Dev server did not exit within {:?}, killing it", STOP_GRACE);
            }
            // Members that outlived the leader get no second chance.
            signal_group(group, Signal::SIGKILL);
            let status = child
                .wait()
                .await
                .map_err(|e| ExportError::io("Failed to stop dev server", e))?;
            debug!("Dev server stopped ({})", status);
        }
        None => {
            signal_group(group, Signal::SIGKILL);
        }
    }

    Ok(())
}

/// Returns false when the group no longer exists.
#[cfg(unix)]
fn signal_group(group: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(group as i32), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("Failed to send {} to dev server group {}: {}", signal, group, e);
            false
        }
    }
}

/// Reserves a free port by binding port 0 and releasing it again.
pub fn free_port(host: &str) -> Result<u16> {
    let listener = StdTcpListener::bind((host, 0))
        .map_err(|e| ExportError::io(format!("Failed to reserve a port on {}", host), e))?;
    let port = listener
        .local_addr()
        .map_err(|e| ExportError::io("Failed to read reserved port", e))?
        .port();
    Ok(port)
}

//! Driving an actual transcode process (spec §4.3): deploy writes a config
//! to the process's stdin, decides restart-vs-start by byte comparison
//! against the previous config, and a keepalive loop restarts units that
//! died, the Rust analogue of a systemd-unit lifecycle driven over
//! `tokio::process::Command` instead of D-Bus.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{info, warn};

/// How often `Service::keepalive` polls for a dead child and restarts it.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait UnitDriver: Send + Sync {
    /// Launch a unit with the given config contents, returning a handle.
    async fn start(&self, config: &str) -> anyhow::Result<Box<dyn RunningUnit>>;
}

#[async_trait]
pub trait RunningUnit: Send + Sync {
    /// `true` once the process has exited, for any reason.
    async fn has_exited(&mut self) -> bool;
    async fn stop(&mut self);
}

/// Spawns the configured binary as a child process, passing the rendered
/// config on stdin. This is the only driver available in this workspace;
/// a systemd-unit driver would implement the same trait without touching
/// any caller.
pub struct ProcessUnitDriver {
    pub binary: String,
    pub extra_args: Vec<String>,
}

#[async_trait]
impl UnitDriver for ProcessUnitDriver {
    async fn start(&self, config: &str) -> anyhow::Result<Box<dyn RunningUnit>> {
        let mut command = Command::new(&self.binary);
        command
            .args(&self.extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(config.as_bytes()).await?;
        }
        Ok(Box::new(ProcessUnit { child }))
    }
}

struct ProcessUnit {
    child: Child,
}

#[async_trait]
impl RunningUnit for ProcessUnit {
    async fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    async fn stop(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Owns one running unit for a slug, restarting it on config change or
/// unexpected exit (spec §4.3).
pub struct Service {
    driver: Box<dyn UnitDriver>,
    current_config: Option<String>,
    running: Option<Box<dyn RunningUnit>>,
}

impl Service {
    pub fn new(driver: Box<dyn UnitDriver>) -> Self {
        Self { driver, current_config: None, running: None }
    }

    /// Deploys `config`. If the unit is already running an identical config,
    /// this is a no-op; otherwise the old unit (if any) is stopped and a new
    /// one started.
    pub async fn apply(&mut self, slug: &str, config: String) -> anyhow::Result<()> {
        if self.current_config.as_deref() == Some(config.as_str()) && self.running.is_some() {
            return Ok(());
        }
        if let Some(mut running) = self.running.take() {
            info!(slug, "config changed, restarting transcode unit");
            running.stop().await;
        }
        let unit = self.driver.start(&config).await?;
        self.running = Some(unit);
        self.current_config = Some(config);
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.stop().await;
        }
        self.current_config = None;
    }

    pub async fn is_running(&mut self) -> bool {
        match self.running.as_mut() {
            Some(running) => !running.has_exited().await,
            None => false,
        }
    }

    /// Polls every `POLL_INTERVAL` until `shutdown` fires, restarting the
    /// unit with its last-known config if it exited on its own.
    pub async fn keepalive(mut self, slug: String, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.stop().await;
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if !self.is_running().await {
                        if let Some(config) = self.current_config.clone() {
                            warn!(%slug, "transcode unit died, restarting");
                            self.running = None;
                            if let Err(err) = self.apply(&slug, config).await {
                                warn!(%slug, %err, "failed to restart transcode unit");
                            }
                        }
                    }
                }
            }
        }
    }
}

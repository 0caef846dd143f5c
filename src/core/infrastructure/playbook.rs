//! Checkout of the k3s-ansible repository and invocation of its playbook.

use crate::core::domain::error::{FleetError, FleetResult};
use crate::core::infrastructure::retry::{RetryConfig, retry_with_backoff};
use crate::inventory::application::service::writer::InventoryPaths;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookSettings {
    pub repo_url: String,
    pub repo_branch: String,
    /// Checkout directory; the inventory is written below it.
    pub local_path: PathBuf,
    /// When false the inventory is still written but no playbook runs.
    pub enabled: bool,
    /// Reuse an existing checkout (`git pull`) instead of cloning afresh.
    pub cache_repo: bool,
    pub playbook: String,
    pub retry: RetryConfig,
    /// Port checked on every host before the playbook starts.
    pub ssh_port: u16,
    /// Attempts to reach each host's SSH port.
    pub ssh_wait: RetryConfig,
}

impl PlaybookSettings {
    pub fn new(
        repo_url: impl Into<String>,
        repo_branch: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo_url: repo_url.into(),
            repo_branch: repo_branch.into(),
            local_path: local_path.into(),
            enabled: true,
            cache_repo: true,
            playbook: "site.yml".to_string(),
            retry: RetryConfig::fixed(3, Duration::from_secs(60)),
            ssh_port: 22,
            ssh_wait: RetryConfig::fixed(10, Duration::from_secs(5)),
        }
    }

    #[must_use]
    pub fn inventory_paths(&self) -> InventoryPaths {
        InventoryPaths::new(&self.local_path)
    }
}

/// One external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    fn in_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Runs external commands.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Shell: Send + Sync {
    /// Runs `invocation` to completion.
    ///
    /// # Errors
    /// `FleetError::Playbook` when the command cannot be started or exits
    /// unsuccessfully; the message carries its stderr.
    async fn run(&self, invocation: &Invocation) -> FleetResult<()>;
}

/// [`Shell`] backed by `tokio::process`. Output of the command is inherited.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

#[async_trait]
impl Shell for SystemShell {
    async fn run(&self, invocation: &Invocation) -> FleetResult<()> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| FleetError::Playbook(format!("cannot run {invocation}: {e}")))?;
        if !output.status.success() {
            return Err(FleetError::Playbook(format!(
                "{invocation} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

pub struct PlaybookRunner {
    settings: PlaybookSettings,
    shell: Box<dyn Shell>,
}

impl PlaybookRunner {
    pub fn new(settings: PlaybookSettings) -> Self {
        Self::with_shell(settings, Box::new(SystemShell))
    }

    pub fn with_shell(settings: PlaybookSettings, shell: Box<dyn Shell>) -> Self {
        Self { settings, shell }
    }

    pub fn settings(&self) -> &PlaybookSettings {
        &self.settings
    }

    /// Makes `local_path` a checkout of `repo_url@repo_branch`.
    ///
    /// A cached checkout is updated with `git pull`; when that fails it is
    /// removed and cloned again.
    pub async fn prepare_repository(&self) -> FleetResult<()> {
        let path = &self.settings.local_path;
        if path.exists() {
            if self.settings.cache_repo {
                let pull = Invocation::new("git", ["pull", "origin", self.settings.repo_branch.as_str()])
                    .in_dir(path);
                match self.shell.run(&pull).await {
                    Ok(()) => {
                        info!(path = %path.display(), "Updated playbook repository");
                        return Ok(());
                    }
                    Err(e) => warn!(error = %e, "Updating the playbook repository failed, cloning again"),
                }
            }
            self.remove_checkout().await?;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FleetError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let clone = Invocation::new(
            "git",
            [
                "clone".to_string(),
                "-b".to_string(),
                self.settings.repo_branch.clone(),
                self.settings.repo_url.clone(),
                path.display().to_string(),
            ],
        );
        self.shell.run(&clone).await?;
        info!(
            repo = %self.settings.repo_url,
            branch = %self.settings.repo_branch,
            path = %path.display(),
            "Cloned playbook repository"
        );
        Ok(())
    }

    /// Runs the playbook against the inventory written under `local_path`,
    /// retrying failed runs.
    ///
    /// # Errors
    /// `FleetError::Playbook` when the playbook is missing or every attempt
    /// failed, `FleetError::Cancelled` when `cancel` fires first.
    pub async fn run(&self, cancel: &CancellationToken) -> FleetResult<()> {
        let root = &self.settings.local_path;
        let playbook = root.join(&self.settings.playbook);
        if !playbook.is_file() {
            return Err(FleetError::Playbook(format!(
                "playbook not found at {}",
                playbook.display()
            )));
        }

        let invocation = Invocation::new(
            "ansible-playbook",
            [
                "-i".to_string(),
                self.settings.inventory_paths().hosts_file().display().to_string(),
                playbook.display().to_string(),
                "-b".to_string(),
                "--become-user=root".to_string(),
            ],
        )
        .in_dir(root);

        info!(playbook = %playbook.display(), "Running playbook");
        let attempt = retry_with_backoff(
            &self.settings.retry,
            "ansible-playbook",
            |e| matches!(e, FleetError::Playbook(_)),
            || self.shell.run(&invocation),
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FleetError::Cancelled),
            result = attempt => result,
        }
    }

    /// Waits until every host accepts TCP connections on the SSH port.
    ///
    /// The guest agent answers before sshd is listening, and the playbook
    /// fails on the first unreachable host.
    ///
    /// # Errors
    /// `FleetError::Playbook` naming the first host that stayed unreachable,
    /// `FleetError::Cancelled` when `cancel` fires first.
    pub async fn wait_for_hosts(&self, hosts: &[IpAddr], cancel: &CancellationToken) -> FleetResult<()> {
        let wait = async {
            for host in hosts {
                let address = SocketAddr::new(*host, self.settings.ssh_port);
                retry_with_backoff(&self.settings.ssh_wait, "ssh reachability", |_: &String| true, || async move {
                    match timeout(SSH_CONNECT_TIMEOUT, TcpStream::connect(address)).await {
                        Ok(Ok(_)) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("connect timed out".to_string()),
                    }
                })
                .await
                .map_err(|e| FleetError::Playbook(format!("{address} is not reachable over SSH: {e}")))?;
                debug!(%address, "ssh reachable");
            }
            Ok(())
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FleetError::Cancelled),
            result = wait => result,
        }
    }

    async fn remove_checkout(&self) -> FleetResult<()> {
        let path = &self.settings.local_path;
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|source| FleetError::Io {
                path: path.clone(),
                source,
            })
    }
}

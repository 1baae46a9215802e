//! Detached launching of the backup script.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Starts the backup script without waiting for it.
#[async_trait::async_trait]
pub trait Launcher: Send + Sync {
    /// Returns the process id when the platform reports one.
    async fn launch(&self, script: &Path) -> Result<Option<u32>>;
}

/// Hands the script to a shell in its own process group, with no stdio.
pub struct ProcessLauncher {
    shell: String,
    env: BTreeMap<String, String>,
}

impl ProcessLauncher {
    pub fn new(shell: impl Into<String>, env: BTreeMap<String, String>) -> Self {
        Self {
            shell: shell.into(),
            env,
        }
    }
}

#[async_trait::async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, script: &Path) -> Result<Option<u32>> {
        let mut command = tokio::process::Command::new(&self.shell);
        command
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .envs(&self.env)
            .env("REPLEXON_TRIGGER", "manual");
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {} {}", self.shell, script.display()))?;
        let pid = child.id();

        // Reap the child so it does not linger as a zombie. Its outcome is
        // only learned from the log and tracking feed.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(pid, code = status.code(), "manual backup process exited"),
                Err(e) => warn!(pid, error = %e, "failed to wait on manual backup process"),
            }
        });

        Ok(pid)
    }
}

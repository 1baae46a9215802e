//! Manual backup triggering.
//!
//! Admission goes through the [`TriggerLimiter`] cooldown, recorded in the
//! database so every process on it shares the window. The script is
//! launched detached through a [`Launcher`], and a `running` manual record is
//! written so the run shows up before the log says anything about it.

pub mod launcher;
pub mod limiter;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::TriggerConfig;
use crate::runs::BackupRun;
use crate::storage::{RunStore, StoreError, TriggerLedger};

pub use launcher::{Launcher, ProcessLauncher};
pub use limiter::{Admission, TriggerLimiter, TriggerState};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("manual trigger is cooling down, retry in {remaining_secs}s")]
    Cooldown { remaining_secs: u64 },

    #[error("backup script not found: {}", .0.display())]
    ScriptMissing(PathBuf),

    #[error("failed to launch backup script: {0}")]
    Launch(String),

    #[error("failed to record manual run: {0}")]
    Store(#[from] StoreError),

    #[error("placeholder write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct TriggerService {
    limiter: Arc<TriggerLimiter>,
    launcher: Arc<dyn Launcher>,
    script_path: PathBuf,
    store: RunStore,
}

impl TriggerService {
    pub fn new(
        config: &TriggerConfig,
        store: RunStore,
        ledger: TriggerLedger,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let cooldown = std::time::Duration::from_secs(config.cooldown_secs);
        Self {
            limiter: Arc::new(TriggerLimiter::shared(cooldown, ledger)),
            launcher,
            script_path: config.script_path.clone(),
            store,
        }
    }

    /// Service backed by a [`ProcessLauncher`] built from the config.
    pub fn from_config(config: &TriggerConfig, store: RunStore, ledger: TriggerLedger) -> Self {
        let launcher = ProcessLauncher::new(config.shell.clone(), config.env.clone());
        Self::new(config, store, ledger, Arc::new(launcher))
    }

    pub async fn state(&self, now: NaiveDateTime) -> TriggerState {
        self.limiter.state(now).await
    }

    /// Launch the backup script and return the stored manual record.
    pub async fn trigger(&self, now: NaiveDateTime) -> Result<BackupRun, TriggerError> {
        let admission = self.limiter.request_trigger(now).await?;

        if !tokio::fs::try_exists(&self.script_path).await.unwrap_or(false) {
            self.limiter.rollback(admission).await;
            warn!(script = %self.script_path.display(), "backup script missing");
            return Err(TriggerError::ScriptMissing(self.script_path.clone()));
        }

        let pid = match self.launcher.launch(&self.script_path).await {
            Ok(pid) => pid,
            Err(e) => {
                self.limiter.rollback(admission).await;
                error!(script = %self.script_path.display(), error = %format!("{e:#}"), "manual launch failed");
                return Err(TriggerError::Launch(format!("{e:#}")));
            }
        };
        info!(pid, script = %self.script_path.display(), "manual backup launched");

        // The script is already running; a failed placeholder write does not
        // undo the admission.
        let store = self.store.clone();
        let placeholder = BackupRun::manual_placeholder(now);
        let report = tokio::task::spawn_blocking(move || store.upsert(placeholder)).await??;
        Ok(report.run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::{RunSource, RunStatus, RunType};
    use crate::storage::open_pool;
    use chrono::NaiveDate;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLauncher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Launcher for CountingLauncher {
        async fn launch(&self, _script: &Path) -> anyhow::Result<Option<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("exec format error");
            }
            Ok(Some(4242))
        }
    }

    fn at(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 23)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(secs)
    }

    fn service(dir: &tempfile::TempDir, launcher: Arc<CountingLauncher>, with_script: bool) -> (TriggerService, RunStore) {
        let script = dir.path().join("backup-plex.sh");
        if with_script {
            std::fs::write(&script, "#!/bin/sh\n").unwrap();
        }
        let pool = open_pool(&dir.path().join("trigger.db")).unwrap();
        let store = RunStore::new(pool.clone());
        let config = TriggerConfig {
            script_path: script,
            cooldown_secs: 300,
            ..TriggerConfig::default()
        };
        (
            TriggerService::new(&config, store.clone(), TriggerLedger::new(pool), launcher),
            store,
        )
    }

    #[tokio::test]
    async fn test_trigger_inserts_running_placeholder_and_enforces_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(CountingLauncher::default());
        let (svc, store) = service(&dir, launcher.clone(), true);

        let run = svc.trigger(at(0)).await.unwrap();
        assert_eq!(run.run_type, RunType::Manual);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.source, RunSource::LogOnly);
        assert_eq!(run.started_at, Some(at(0)));

        let stored = store.get(at(0).date(), RunType::Manual).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);

        match svc.trigger(at(10)).await {
            Err(TriggerError::Cooldown { remaining_secs }) => assert_eq!(remaining_secs, 290),
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 1);

        assert!(svc.trigger(at(301)).await.is_ok());
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_services_on_one_database_share_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(CountingLauncher::default());
        let (daemon, _store) = service(&dir, launcher.clone(), true);
        let (cli, store) = service(&dir, launcher.clone(), true);

        daemon.trigger(at(0)).await.unwrap();
        match cli.trigger(at(10)).await {
            Err(TriggerError::Cooldown { remaining_secs }) => assert_eq!(remaining_secs, 290),
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(cli.state(at(10)).await.last_trigger, Some(at(0)));
    }

    #[tokio::test]
    async fn test_missing_script_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(CountingLauncher::default());
        let (svc, store) = service(&dir, launcher.clone(), false);

        assert!(matches!(svc.trigger(at(0)).await, Err(TriggerError::ScriptMissing(_))));
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 0);
        assert!(svc.state(at(1)).await.allowed);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(CountingLauncher {
            fail: true,
            ..CountingLauncher::default()
        });
        let (svc, store) = service(&dir, launcher, true);

        assert!(matches!(svc.trigger(at(0)).await, Err(TriggerError::Launch(_))));
        let state = svc.state(at(1)).await;
        assert!(state.allowed);
        assert_eq!(state.last_trigger, None);
        assert_eq!(store.count().unwrap(), 0);
    }
}

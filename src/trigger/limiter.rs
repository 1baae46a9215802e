//! Cooldown between manual triggers.
//!
//! Within a process the check and the update happen under one async mutex.
//! With a [`TriggerLedger`] attached the same check-and-set is repeated in a
//! database transaction, so the daemon and CLI invocations on the same
//! database share one window that also survives restarts.

use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::TriggerError;
use crate::storage::{LedgerDecision, TriggerLedger};

/// Returned on admission; hand back to [`TriggerLimiter::rollback`] if the
/// launch does not go ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    granted_at: NaiveDateTime,
    previous: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerState {
    pub allowed: bool,
    pub remaining_secs: u64,
    pub last_trigger: Option<NaiveDateTime>,
    pub cooldown_secs: u64,
}

pub struct TriggerLimiter {
    cooldown: chrono::Duration,
    last: Mutex<Option<NaiveDateTime>>,
    ledger: Option<TriggerLedger>,
}

impl TriggerLimiter {
    /// Cooldown local to this process.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
            last: Mutex::new(None),
            ledger: None,
        }
    }

    /// Cooldown shared through the database.
    pub fn shared(cooldown: Duration, ledger: TriggerLedger) -> Self {
        Self {
            ledger: Some(ledger),
            ..Self::new(cooldown)
        }
    }

    pub async fn request_trigger(&self, now: NaiveDateTime) -> Result<Admission, TriggerError> {
        let mut last = self.last.lock().await;
        let remaining_secs = self.remaining(*last, now);
        if remaining_secs > 0 {
            debug!(remaining_secs, "trigger refused during cooldown");
            return Err(TriggerError::Cooldown { remaining_secs });
        }

        let previous = match &self.ledger {
            None => *last,
            Some(ledger) => {
                let ledger = ledger.clone();
                let cooldown = self.cooldown;
                match tokio::task::spawn_blocking(move || ledger.try_admit(now, cooldown)).await?? {
                    LedgerDecision::Admitted { previous } => previous,
                    LedgerDecision::Refused { last: recorded } => {
                        *last = Some(recorded);
                        let remaining_secs = self.remaining(Some(recorded), now);
                        debug!(remaining_secs, "trigger refused; cooldown recorded by another process");
                        return Err(TriggerError::Cooldown { remaining_secs });
                    }
                }
            }
        };

        *last = Some(now);
        Ok(Admission {
            granted_at: now,
            previous,
        })
    }

    /// Undo an admission, unless a later one already replaced it.
    pub async fn rollback(&self, admission: Admission) {
        let mut last = self.last.lock().await;
        if *last == Some(admission.granted_at) {
            *last = admission.previous;
        }
        let Some(ledger) = self.ledger.clone() else {
            return;
        };
        let restored =
            tokio::task::spawn_blocking(move || ledger.restore(admission.granted_at, admission.previous)).await;
        match restored {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to roll back recorded trigger"),
            Err(e) => warn!(error = %e, "trigger rollback task failed"),
        }
    }

    pub async fn state(&self, now: NaiveDateTime) -> TriggerState {
        let mut last = self.last.lock().await;
        if let Some(ledger) = self.ledger.clone() {
            match tokio::task::spawn_blocking(move || ledger.last()).await {
                Ok(Ok(recorded)) => *last = recorded,
                Ok(Err(e)) => warn!(error = %e, "failed to read recorded trigger; using in-process state"),
                Err(e) => warn!(error = %e, "trigger state task failed; using in-process state"),
            }
        }
        let last = *last;
        let remaining_secs = self.remaining(last, now);
        TriggerState {
            allowed: remaining_secs == 0,
            remaining_secs,
            last_trigger: last,
            cooldown_secs: self.cooldown.num_seconds().max(0) as u64,
        }
    }

    /// Whole seconds left in the window, rounded up.
    fn remaining(&self, last: Option<NaiveDateTime>, now: NaiveDateTime) -> u64 {
        let Some(last) = last else {
            return 0;
        };
        let elapsed = now - last;
        if elapsed >= self.cooldown {
            return 0;
        }
        let left = (self.cooldown - elapsed).min(self.cooldown);
        let millis = left.num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

//! Process-wide registry of live execution units.
//!
//! The registry is the only place allowed to create or destroy a unit, and
//! guarantees at most one live unit per applet. Its bookkeeping sits behind a
//! single async mutex held across each lifecycle operation: calls for
//! different applets run concurrently from many authoring requests, while a
//! `stop` racing a `start` for the same applet serializes and can never leave
//! two live units. Units themselves never touch the registry's map; they just
//! exit their loop and let the caller of `stop`/`remove` observe completion.

use crate::applet::{AppletStore, Role, RunState};
use crate::credential::CredentialStore;
use crate::engine::binding::BuildError;
use crate::engine::runlog::RunLog;
use crate::engine::unit::{ExecutionUnit, UnitHandles};
use crate::provider::Catalog;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Typed failures of the registry's lifecycle operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no execution unit registered for applet {0}")]
    NotFound(Uuid),
    #[error("applet {0} is already running")]
    AlreadyRunning(Uuid),
    #[error("applet {0} is already paused")]
    AlreadyPaused(Uuid),
    #[error("applet {0} is already active")]
    AlreadyActive(Uuid),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("storage failure")]
    Storage(#[from] anyhow::Error),
}

enum Entry {
    /// Registered but not running; a `start` rebuilds the unit fresh.
    Idle,
    Running {
        handles: UnitHandles,
        task: JoinHandle<()>,
    },
}

pub struct Registry {
    entries: tokio::sync::Mutex<HashMap<Uuid, Entry>>,
    catalog: Arc<Catalog>,
    applets: Arc<AppletStore>,
    credentials: Arc<CredentialStore>,
    /// Where per-applet run logs are written; `None` keeps units file-quiet.
    log_dir: Option<PathBuf>,
}

impl Registry {
    pub fn new(
        catalog: Arc<Catalog>,
        applets: Arc<AppletStore>,
        credentials: Arc<CredentialStore>,
        log_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            entries: tokio::sync::Mutex::new(HashMap::new()),
            catalog,
            applets,
            credentials,
            log_dir,
        }
    }

    /// Registers a unit under its applet identity, spawning its control loop
    /// immediately when `autostart` is set. A previously running unit for the
    /// same applet is cancelled first.
    pub async fn add(&self, unit: ExecutionUnit, autostart: bool) {
        let id = unit.applet_id();
        let mut entries = self.entries.lock().await;

        if let Some(previous) = entries.remove(&id) {
            stop_entry(id, previous).await;
        }

        let entry = if autostart {
            info!(applet_id = %id, "Registering execution unit (autostart)");
            self.spawn(unit)
        } else {
            info!(applet_id = %id, "Registering execution unit");
            Entry::Idle
        };
        entries.insert(id, entry);
    }

    /// Starts a registered-but-not-running unit, rebuilt fresh from the
    /// applet's currently-persisted areas.
    pub async fn start(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        if let Entry::Running { task, .. } = entry {
            if !task.is_finished() {
                return Err(RegistryError::AlreadyRunning(id));
            }
        }

        let applet = self
            .applets
            .get_applet(id)?
            .ok_or(RegistryError::NotFound(id))?;
        let unit = ExecutionUnit::build(
            &applet,
            Arc::clone(&self.catalog),
            Arc::clone(&self.applets),
            Arc::clone(&self.credentials),
        )?;

        self.applets.set_run_state(id, RunState::Running)?;
        *entry = self.spawn(unit);
        info!(applet_id = %id, "Execution unit started");
        Ok(())
    }

    /// Cancels the running unit and waits for its loop to exit. Idempotent
    /// against a unit that is not running.
    pub async fn stop(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        let previous = std::mem::replace(entry, Entry::Idle);
        stop_entry(id, previous).await;
        Ok(())
    }

    /// Soft-pauses the running unit. Conflicts when it is already paused.
    pub async fn pause(&self, id: Uuid) -> Result<(), RegistryError> {
        self.set_soft_state(id, false).await
    }

    /// Resumes a soft-paused unit. Conflicts when it is already active.
    pub async fn resume(&self, id: Uuid) -> Result<(), RegistryError> {
        self.set_soft_state(id, true).await
    }

    async fn set_soft_state(&self, id: Uuid, active: bool) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&id) {
            Some(Entry::Running { handles, task }) if !task.is_finished() => {
                if handles.is_active() == active {
                    return Err(if active {
                        RegistryError::AlreadyActive(id)
                    } else {
                        RegistryError::AlreadyPaused(id)
                    });
                }
                // Recorded here so a second caller conflicts immediately,
                // before the loop has drained the signal
                handles.set_active(active);
                let _ = handles.send_pause(active).await;
                self.applets.set_active(id, active)?;
                info!(applet_id = %id, active, "Soft-state changed");
                Ok(())
            }
            _ => Err(RegistryError::NotFound(id)),
        }
    }

    /// Stops the unit if running, then forgets it entirely. Used on applet
    /// deletion.
    pub async fn remove(&self, id: Uuid) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(&id) {
            stop_entry(id, entry).await;
            info!(applet_id = %id, "Execution unit removed");
        }
    }

    /// Asks a running unit to rebuild its binding(s) for `role` in place
    /// from the now-updated area. No-op when the unit is not running: a
    /// non-running applet picks the change up on its next `start`.
    pub async fn reconfigure(&self, id: Uuid, role: Role) {
        let entries = self.entries.lock().await;
        if let Some(Entry::Running { handles, task }) = entries.get(&id) {
            if !task.is_finished() {
                let _ = handles.send_reconfigure(role).await;
                info!(applet_id = %id, %role, "Reconfigure signalled");
            }
        }
    }

    /// Whether a live loop currently exists for the applet.
    pub async fn is_running(&self, id: Uuid) -> bool {
        matches!(
            self.entries.lock().await.get(&id),
            Some(Entry::Running { task, .. }) if !task.is_finished()
        )
    }

    /// Startup loader: registers every complete applet, autostarting the
    /// ones whose persisted run-state is running. Returns how many loops
    /// were spawned; applets that fail to build are skipped with a warning.
    pub async fn resume_persisted(&self) -> Result<usize, RegistryError> {
        let applets = self.applets.list_complete()?;
        let mut started = 0;

        for applet in &applets {
            let autostart = applet.run_state == RunState::Running;
            match ExecutionUnit::build(
                applet,
                Arc::clone(&self.catalog),
                Arc::clone(&self.applets),
                Arc::clone(&self.credentials),
            ) {
                Ok(unit) => {
                    self.add(unit, autostart).await;
                    if autostart {
                        started += 1;
                    }
                }
                Err(e) => warn!(
                    applet_id = %applet.id,
                    error = %e,
                    "Skipping applet that failed to build"
                ),
            }
        }

        Ok(started)
    }

    /// Cancels every running unit and waits for the loops to exit.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        let ids: Vec<Uuid> = entries.keys().copied().collect();
        for id in ids {
            if let Some(entry) = entries.remove(&id) {
                stop_entry(id, entry).await;
            }
        }
        info!("All execution units stopped");
    }

    fn spawn(&self, unit: ExecutionUnit) -> Entry {
        let id = unit.applet_id();
        let handles = unit.handles();
        let log = match &self.log_dir {
            Some(dir) => RunLog::open(dir, id).unwrap_or_else(|e| {
                warn!(applet_id = %id, error = %e, "Run log unavailable, continuing without");
                RunLog::sink(id)
            }),
            None => RunLog::sink(id),
        };
        let task = tokio::spawn(unit.run(log));
        Entry::Running { handles, task }
    }
}

/// Cancels a running entry and waits for its loop to exit; no-op for idle
/// entries or loops that already finished.
async fn stop_entry(id: Uuid, entry: Entry) {
    if let Entry::Running { handles, task } = entry {
        if !task.is_finished() {
            // The loop may exit between the check and the send; both are fine
            let _ = handles.send_cancel().await;
        }
        if let Err(e) = task.await {
            warn!(applet_id = %id, error = %e, "Execution unit task ended abnormally");
        }
        info!(applet_id = %id, "Execution unit stopped");
    }
}

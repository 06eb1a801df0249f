//! Execution unit: the per-applet control loop.
//!
//! One unit owns one emitter (action) binding and N receiver (reaction)
//! bindings, and runs as its own tokio task so that one applet's slow
//! external call never affects another applet. The loop multiplexes over
//! three control channels and a poll timer; every poll cycle is a fully
//! sequential unit of work, and cycles never overlap for the same unit.
//!
//! Cadence: pull-based emitters poll every `30 / rate_limit` seconds,
//! computed once, lazily, on the first timer fire and fixed for the unit's
//! lifetime. Gateway-backed emitters start their push connection once and
//! wait on a short fixed tick instead, keeping pause and cancel responsive.
//!
//! Any credential or handler error is fatal: the unit persists the applet's
//! run-state as stopped, tears down its gateway, and exits. There is no
//! automatic restart and no retry budget; the authoring layer must restart
//! the applet explicitly.

use crate::applet::{Applet, AppletStore, Role, RunState};
use crate::capability::InvokeOutcome;
use crate::credential::CredentialStore;
use crate::engine::binding::{Binding, BuildError};
use crate::engine::runlog::RunLog;
use crate::provider::Catalog;
use anyhow::{Context, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

/// Wait tick for gateway-backed emitters; the connection pushes events on
/// its own, the loop only re-checks pause and cancellation.
const GATEWAY_TICK: Duration = Duration::from_secs(1);

/// Control surface of a spawned unit, held by the registry.
#[derive(Clone)]
pub struct UnitHandles {
    pause: mpsc::Sender<bool>,
    cancel: mpsc::Sender<()>,
    reconfigure: mpsc::Sender<Role>,
    active: Arc<AtomicBool>,
}

impl UnitHandles {
    /// Current soft-state, as of the last signal accepted by the registry.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Signals a soft pause (`false`) or resume (`true`). Returns `false`
    /// when the loop has already exited.
    pub async fn send_pause(&self, active: bool) -> bool {
        self.pause.send(active).await.is_ok()
    }

    /// Signals cooperative cancellation; the loop observes it at its wait
    /// multiplexer. Returns `false` when the loop has already exited.
    pub async fn send_cancel(&self) -> bool {
        self.cancel.send(()).await.is_ok()
    }

    /// Asks the loop to rebuild the binding(s) for `role` from the
    /// now-persisted areas.
    pub async fn send_reconfigure(&self, role: Role) -> bool {
        self.reconfigure.send(role).await.is_ok()
    }
}

enum Wake {
    Cancel,
    Pause(bool),
    Reconfigure(Role),
    Timer,
}

/// One applet's running form: an emitter binding, its receivers in
/// attachment order, and the control loop state.
pub struct ExecutionUnit {
    applet_id: Uuid,
    emitter: Binding,
    receivers: Vec<Binding>,
    active: Arc<AtomicBool>,
    // The unit keeps its own sender clones so the channels stay open for
    // the loop's lifetime regardless of what the registry drops.
    pause_tx: mpsc::Sender<bool>,
    pause_rx: mpsc::Receiver<bool>,
    cancel_tx: mpsc::Sender<()>,
    cancel_rx: mpsc::Receiver<()>,
    reconfigure_tx: mpsc::Sender<Role>,
    reconfigure_rx: mpsc::Receiver<Role>,
    catalog: Arc<Catalog>,
    applets: Arc<AppletStore>,
    credentials: Arc<CredentialStore>,
}

impl ExecutionUnit {
    /// Builds a unit from the applet's currently-persisted areas. Fails with
    /// [`BuildError::ActionMissing`] when no action area exists.
    pub fn build(
        applet: &Applet,
        catalog: Arc<Catalog>,
        applets: Arc<AppletStore>,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, BuildError> {
        let action = applets
            .action_area(applet.id)?
            .ok_or(BuildError::ActionMissing)?;
        let emitter = Binding::build(applet.id, &action, Role::Action, &catalog, &credentials)?;

        let mut receivers = Vec::new();
        for area in applets.reaction_areas(applet.id)? {
            receivers.push(Binding::build(
                applet.id,
                &area,
                Role::Reaction,
                &catalog,
                &credentials,
            )?);
        }

        let (pause_tx, pause_rx) = mpsc::channel(4);
        let (cancel_tx, cancel_rx) = mpsc::channel(4);
        let (reconfigure_tx, reconfigure_rx) = mpsc::channel(4);

        Ok(Self {
            applet_id: applet.id,
            emitter,
            receivers,
            active: Arc::new(AtomicBool::new(applet.active)),
            pause_tx,
            pause_rx,
            cancel_tx,
            cancel_rx,
            reconfigure_tx,
            reconfigure_rx,
            catalog,
            applets,
            credentials,
        })
    }

    pub fn applet_id(&self) -> Uuid {
        self.applet_id
    }

    /// The control surface the registry keeps after spawning the loop.
    pub fn handles(&self) -> UnitHandles {
        UnitHandles {
            pause: self.pause_tx.clone(),
            cancel: self.cancel_tx.clone(),
            reconfigure: self.reconfigure_tx.clone(),
            active: Arc::clone(&self.active),
        }
    }

    /// Runs the control loop to completion. Every exit path, fatal or
    /// requested, persists the applet's run-state as stopped and tears down
    /// the emitter's gateway.
    pub async fn run(mut self, log: RunLog) {
        log.info("applet started");

        if let Some(gateway) = self.emitter.gateway() {
            if let Err(e) = gateway.start().await {
                log.error(&format!("gateway connection failed: {:#}", e));
                self.shutdown(&log).await;
                return;
            }
        }

        // Computed on the first timer fire, fixed afterwards
        let mut interval: Option<Duration> = None;
        let mut deadline = Instant::now();

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.cancel_rx.recv() => Wake::Cancel,
                Some(active) = self.pause_rx.recv() => Wake::Pause(active),
                Some(role) = self.reconfigure_rx.recv() => Wake::Reconfigure(role),
                _ = sleep_until(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Cancel => {
                    log.info("stop requested");
                    break;
                }
                // Flips the soft-state only; the poll deadline is left alone
                Wake::Pause(active) => {
                    self.active.store(active, Ordering::SeqCst);
                    log.info(if active {
                        "applet is now active"
                    } else {
                        "applet is now inactive"
                    });
                }
                Wake::Reconfigure(role) => match self.rebuild(role) {
                    Ok(()) => log.info(&format!("{} binding rebuilt", role)),
                    Err(e) => {
                        log.error(&format!("rebuilding {} binding failed: {:#}", role, e));
                        break;
                    }
                },
                Wake::Timer => {
                    let interval = *interval.get_or_insert_with(|| self.poll_interval());

                    if !self.active.load(Ordering::SeqCst) {
                        log.debug("applet is inactive, skipping cycle");
                        deadline = Instant::now() + interval;
                        continue;
                    }

                    let outcome = self.cycle(&log).await;
                    // A slow cycle delays the next fire; cycles never overlap
                    deadline = Instant::now() + interval;

                    if let Err(e) = outcome {
                        log.error(&format!("{:#}", e));
                        break;
                    }
                }
            }
        }

        self.shutdown(&log).await;
    }

    /// One poll cycle: refresh-then-invoke the emitter, and on a trigger
    /// refresh-then-invoke every receiver in attachment order, aborting on
    /// the first failure. Any `Err` is fatal for the unit.
    async fn cycle(&mut self, log: &RunLog) -> Result<()> {
        if let Err(e) = self.emitter.refresh(&self.credentials).await {
            return Err(Error::new(e).context("action credential refresh failed"));
        }

        let outcome = self
            .emitter
            .invoke(self.applet_id, log, None)
            .await
            .context("action handler failed")?;

        let data = match outcome {
            InvokeOutcome::Skipped => {
                log.debug("action not triggered");
                return Ok(());
            }
            InvokeOutcome::Triggered(data) => data,
        };
        log.info("action triggered");

        for (index, receiver) in self.receivers.iter_mut().enumerate() {
            if let Err(e) = receiver.refresh(&self.credentials).await {
                return Err(
                    Error::new(e).context(format!("reaction {} credential refresh failed", index))
                );
            }

            receiver
                .invoke(self.applet_id, log, Some(&data))
                .await
                .with_context(|| format!("reaction {} handler failed", index))?;
            log.info("reaction dispatched");
        }

        Ok(())
    }

    /// Rebuilds the binding(s) for `role` from the now-persisted areas; the
    /// only way a running binding changes.
    fn rebuild(&mut self, role: Role) -> Result<(), BuildError> {
        match role {
            Role::Action => {
                let area = self
                    .applets
                    .action_area(self.applet_id)?
                    .ok_or(BuildError::ActionMissing)?;
                self.emitter = Binding::build(
                    self.applet_id,
                    &area,
                    Role::Action,
                    &self.catalog,
                    &self.credentials,
                )?;
            }
            Role::Reaction => {
                let mut receivers = Vec::new();
                for area in self.applets.reaction_areas(self.applet_id)? {
                    receivers.push(Binding::build(
                        self.applet_id,
                        &area,
                        Role::Reaction,
                        &self.catalog,
                        &self.credentials,
                    )?);
                }
                self.receivers = receivers;
            }
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        if self.emitter.capability().uses_gateway {
            GATEWAY_TICK
        } else {
            interval_for(self.emitter.provider().rate_limit)
        }
    }

    async fn shutdown(&self, log: &RunLog) {
        if let Some(gateway) = self.emitter.gateway() {
            gateway.stop().await;
        }
        if let Err(e) = self.applets.set_run_state(self.applet_id, RunState::Stopped) {
            tracing::error!(
                applet_id = %self.applet_id,
                error = %e,
                "Failed to persist stopped run-state"
            );
        }
        log.info("applet stopped");
    }
}

/// Poll interval for a pull-based provider: allowed calls spread evenly
/// across a 30-second window. Providers without a quota fall back to the
/// full window.
pub(crate) fn interval_for(rate_limit: f64) -> Duration {
    if rate_limit <= 0.0 {
        Duration::from_secs(30)
    } else {
        Duration::from_secs_f64(30.0 / rate_limit)
    }
}

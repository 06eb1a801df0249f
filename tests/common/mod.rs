//! Shared fixtures: scripted providers and seeded stores.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use patchbay::applet::{Applet, AppletStore, Area, AuthoringState, Role, RunState};
use patchbay::capability::{Capability, Handler, InvokeOutcome, InvokeRequest, ValueMap};
use patchbay::credential::CredentialStore;
use patchbay::provider::{Catalog, Provider};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One scripted emitter outcome.
pub enum Step {
    Skip,
    Trigger(ValueMap),
    Fail,
}

/// Plays back a fixed sequence of outcomes, then keeps skipping.
pub struct Scripted {
    steps: Mutex<VecDeque<Step>>,
    pub calls: AtomicUsize,
}

impl Scripted {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Handler for Scripted {
    async fn call(&self, _req: InvokeRequest<'_>) -> Result<InvokeOutcome> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match self.steps.lock().unwrap().pop_front() {
            None | Some(Step::Skip) => Ok(InvokeOutcome::Skipped),
            Some(Step::Trigger(data)) => Ok(InvokeOutcome::Triggered(data)),
            Some(Step::Fail) => bail!("scripted action failure"),
        }
    }
}

/// Records every upstream map it receives; optionally always fails.
pub struct Recorder {
    pub calls: Mutex<Vec<ValueMap>>,
    fail: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn call(&self, req: InvokeRequest<'_>) -> Result<InvokeOutcome> {
        if self.fail {
            bail!("scripted reaction failure");
        }
        self.calls
            .lock()
            .unwrap()
            .push(req.upstream.cloned().unwrap_or_default());
        Ok(InvokeOutcome::Triggered(ValueMap::new()))
    }
}

pub fn capability(name: &str, uses_gateway: bool, handler: Arc<dyn Handler>) -> Arc<Capability> {
    Arc::new(Capability {
        name: name.to_string(),
        description: String::new(),
        fields: BTreeMap::new(),
        outputs: Vec::new(),
        uses_gateway,
        handler,
    })
}

/// A pull-based provider named `fake` with one action `emit` and the given
/// reactions.
pub fn fake_provider(
    rate_limit: f64,
    emit: Arc<dyn Handler>,
    reactions: Vec<(&str, Arc<dyn Handler>)>,
) -> Provider {
    Provider {
        name: "fake".to_string(),
        description: String::new(),
        rate_limit,
        authenticator: None,
        validators: HashMap::new(),
        gateway: None,
        actions: vec![capability("emit", false, emit)],
        reactions: reactions
            .into_iter()
            .map(|(name, handler)| capability(name, false, handler))
            .collect(),
    }
}

pub fn catalog(providers: Vec<Provider>) -> Arc<Catalog> {
    Arc::new(Catalog::new(providers))
}

pub fn stores() -> (Arc<AppletStore>, Arc<CredentialStore>) {
    let key = BASE64.encode([0u8; 32]);
    (
        Arc::new(AppletStore::new(":memory:").unwrap()),
        Arc::new(CredentialStore::new(":memory:", &key).unwrap()),
    )
}

pub fn applet_row(run_state: RunState) -> Applet {
    Applet {
        id: Uuid::new_v4(),
        account_id: Uuid::new_v4(),
        name: "test applet".to_string(),
        description: String::new(),
        state: AuthoringState::Complete,
        run_state,
        active: true,
        created_at: Utc::now(),
    }
}

pub fn area_row(
    applet_id: Uuid,
    role: Role,
    provider: &str,
    name: &str,
    config: &str,
    credential_id: Option<Uuid>,
) -> Area {
    Area {
        id: Uuid::new_v4(),
        applet_id,
        credential_id,
        role,
        provider: provider.to_string(),
        name: name.to_string(),
        config: config.to_string(),
        created_at: Utc::now(),
    }
}

/// Persists one complete applet wired to the `fake` provider: the `emit`
/// action plus the named reactions, in order.
pub fn seeded_applet(applets: &AppletStore, reaction_names: &[&str]) -> Applet {
    let applet = applet_row(RunState::Running);
    applets.create_applet(&applet).unwrap();
    applets
        .create_area(&area_row(applet.id, Role::Action, "fake", "emit", "{}", None))
        .unwrap();
    for name in reaction_names {
        applets
            .create_area(&area_row(applet.id, Role::Reaction, "fake", name, "{}", None))
            .unwrap();
    }
    applet
}

pub fn upstream(key: &str, value: &str) -> ValueMap {
    let mut map = ValueMap::new();
    map.insert(key.to_string(), json!(value));
    map
}

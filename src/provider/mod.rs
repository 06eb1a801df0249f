//! Provider catalog - the engine-facing view of an integration.
//!
//! A [`Provider`] bundles everything one third-party integration contributes:
//! its capability tables (actions and reactions), an optional OAuth2
//! authenticator, per-field validators, a rate limit, and an optional push
//! gateway. The [`Catalog`] is an explicitly constructed lookup table that is
//! injected into the registry and bindings at startup - there is no ambient
//! global provider list.

use crate::capability::{Capability, FieldValidator};
use crate::credential::broker::Authenticator;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A persistent push connection maintained by a provider integration.
///
/// Gateway-backed capabilities are not polled; the execution unit starts the
/// connection once when its loop begins and tears it down on shutdown. Event
/// delivery from the connection to the capability handler is the provider's
/// own affair - the engine only manages the connection lifecycle and keeps
/// pause/cancel responsive while it is up.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
}

/// Everything the engine needs to run capabilities of one integration.
pub struct Provider {
    pub name: String,
    pub description: String,
    /// Allowed calls per 30-second window. Values <= 0 mean the provider
    /// imposes no quota; the poll loop then falls back to the full window.
    pub rate_limit: f64,
    /// `None` for providers whose capabilities need no credential.
    pub authenticator: Option<Authenticator>,
    /// Authoring-time field validators, keyed by field name.
    pub validators: HashMap<String, Arc<dyn FieldValidator>>,
    pub gateway: Option<Arc<dyn Gateway>>,
    pub actions: Vec<Arc<Capability>>,
    pub reactions: Vec<Arc<Capability>>,
}

impl Provider {
    pub fn action(&self, name: &str) -> Option<Arc<Capability>> {
        self.actions.iter().find(|c| c.name == name).cloned()
    }

    pub fn reaction(&self, name: &str) -> Option<Arc<Capability>> {
        self.reactions.iter().find(|c| c.name == name).cloned()
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("rate_limit", &self.rate_limit)
            .field("actions", &self.actions.len())
            .field("reactions", &self.reactions.len())
            .finish()
    }
}

/// Injected provider lookup table, keyed by provider name.
pub struct Catalog {
    providers: HashMap<String, Arc<Provider>>,
}

impl Catalog {
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.get(name).cloned()
    }

    /// Provider names in no particular order, for startup logging.
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(|n| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

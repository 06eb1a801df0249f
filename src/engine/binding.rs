//! Execution binding: one area, resolved and ready to invoke.
//!
//! A [`Binding`] wraps a persisted area with everything the control loop
//! needs at call time: the resolved provider and capability, the loaded
//! credential, the parsed working store and credential context, and a
//! freshness token that changes on every (re)build. Rebuilding through
//! [`Binding::build`] is the only way a running binding changes.

use crate::applet::{Area, Role};
use crate::capability::{Capability, InvokeOutcome, InvokeRequest, ValueMap};
use crate::credential::{AuthError, Credential, CredentialStore};
use crate::engine::runlog::RunLog;
use crate::provider::{Catalog, Gateway, Provider};
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Synchronous failures while resolving an area into a binding. These are
/// surfaced to the authoring caller and never crash a running unit.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("applet has no action area")]
    ActionMissing,
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("unknown {role} capability: {name}")]
    UnknownCapability { role: Role, name: String },
    #[error("credential not found for area {0}")]
    CredentialNotFound(Uuid),
    #[error("area configuration is malformed: {0}")]
    MalformedConfig(String),
    #[error("credential context is malformed: {0}")]
    MalformedContext(String),
    #[error("storage failure")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct Binding {
    provider: Arc<Provider>,
    capability: Arc<Capability>,
    credential: Option<Credential>,
    store: ValueMap,
    auth_context: ValueMap,
    snapshot: Uuid,
}

impl Binding {
    /// Resolves `area` into a ready-to-invoke binding.
    ///
    /// Resolution order: provider by name, credential by reference (only for
    /// providers that authenticate), credential context blob, area config
    /// blob, then the capability in the role-appropriate namespace. The
    /// working store is seeded from the parsed config; a fresh snapshot id is
    /// stamped. This is also the only path used to rebuild a binding after
    /// its area changed.
    pub fn build(
        applet_id: Uuid,
        area: &Area,
        role: Role,
        catalog: &Catalog,
        credentials: &CredentialStore,
    ) -> Result<Self, BuildError> {
        let provider = catalog
            .get(&area.provider)
            .ok_or_else(|| BuildError::UnknownProvider(area.provider.clone()))?;

        let mut credential = None;
        let mut auth_context = ValueMap::new();
        if provider.authenticator.is_some() {
            let credential_id = area
                .credential_id
                .ok_or(BuildError::CredentialNotFound(area.id))?;
            let loaded = credentials
                .get(credential_id)?
                .ok_or(BuildError::CredentialNotFound(area.id))?;
            auth_context = parse_object(&loaded.context).map_err(BuildError::MalformedContext)?;
            credential = Some(loaded);
        }

        let store = parse_object(&area.config).map_err(BuildError::MalformedConfig)?;

        let capability = match role {
            Role::Action => provider.action(&area.name),
            Role::Reaction => provider.reaction(&area.name),
        }
        .ok_or_else(|| BuildError::UnknownCapability {
            role,
            name: area.name.clone(),
        })?;

        let snapshot = Uuid::new_v4();
        tracing::debug!(
            applet_id = %applet_id,
            area = %area.id,
            provider = %area.provider,
            capability = %area.name,
            snapshot = %snapshot,
            "Built execution binding"
        );

        Ok(Self {
            provider,
            capability,
            credential,
            store,
            auth_context,
            snapshot,
        })
    }

    /// Invokes the capability handler. The working store is passed mutably,
    /// so state the handler writes survives into the next cycle.
    pub async fn invoke(
        &mut self,
        applet_id: Uuid,
        log: &RunLog,
        upstream: Option<&ValueMap>,
    ) -> Result<InvokeOutcome> {
        let handler = Arc::clone(&self.capability.handler);
        handler
            .call(InvokeRequest {
                applet_id,
                credential: self.credential.as_ref(),
                store: &mut self.store,
                auth_context: &self.auth_context,
                upstream,
                log,
            })
            .await
    }

    /// Refreshes the bound credential through the broker, swapping in the
    /// returned credential. No-op for providers that need none.
    pub async fn refresh(&mut self, store: &CredentialStore) -> Result<(), AuthError> {
        let Some(authenticator) = &self.provider.authenticator else {
            return Ok(());
        };
        let Some(credential) = &self.credential else {
            return Ok(());
        };
        self.credential = Some(authenticator.refresh(credential, store).await?);
        Ok(())
    }

    /// The provider's push gateway, when this capability is fed by one.
    pub fn gateway(&self) -> Option<Arc<dyn Gateway>> {
        if self.capability.uses_gateway {
            self.provider.gateway.clone()
        } else {
            None
        }
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub fn capability(&self) -> &Arc<Capability> {
        &self.capability
    }

    /// Freshness token; changes whenever the binding is rebuilt.
    pub fn snapshot(&self) -> Uuid {
        self.snapshot
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &ValueMap {
        &self.store
    }
}

fn parse_object(blob: &str) -> Result<ValueMap, String> {
    match serde_json::from_str::<Value>(blob) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", other)),
        Err(e) => Err(e.to_string()),
    }
}

//! Capability contract - the data-driven description of an action or reaction.
//!
//! A provider integration contributes a list of capabilities. Each capability
//! carries everything the engine needs to invoke it without knowing the
//! provider: a field schema for authoring-time validation, the data keys it
//! may emit, and a handler implementing a single invocation interface. The
//! engine never branches on a provider name.
//!
//! # Handler contract
//!
//! A handler receives an [`InvokeRequest`] and returns:
//! - `Ok(InvokeOutcome::Triggered(data))` - the condition fired; `data` is
//!   forwarded to downstream reaction handlers as upstream data
//! - `Ok(InvokeOutcome::Skipped)` - not triggered yet; the loop re-arms
//! - `Err(_)` - fatal for the current applet run; the execution unit stops
//!
//! The working store in the request is the handler's only persistence between
//! poll cycles: handlers both read and write it (by convention, submitted
//! configuration lives under `req:` keys and handler-private poll state under
//! `ctx:` keys).

use crate::credential::Credential;
use crate::engine::runlog::RunLog;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// String-keyed JSON map used for working stores, credential context, and
/// upstream data.
pub type ValueMap = serde_json::Map<String, Value>;

/// Field type tag, used by the authoring layer to render the right widget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Select,
    SelectUri,
}

/// Schema for one configuration field of a capability.
#[derive(Clone, Debug, Serialize)]
pub struct FieldSpec {
    /// UI ordering (0 = shown first).
    pub priority: u32,
    pub kind: FieldKind,
    pub description: String,
    pub required: bool,
    /// Fields that must be filled before this one is shown.
    pub depends_on: Vec<String>,
    /// Upstream output keys this field may reference.
    pub allowed_outputs: Vec<String>,
    /// For `Select`, the selectable values; for `SelectUri`, the endpoint.
    pub values: Vec<String>,
}

impl FieldSpec {
    /// A required field with no dependencies, the common case.
    pub fn required(kind: FieldKind, description: &str) -> Self {
        Self {
            priority: 0,
            kind,
            description: description.to_string(),
            required: true,
            depends_on: Vec::new(),
            allowed_outputs: Vec::new(),
            values: Vec::new(),
        }
    }

    /// An optional field with no dependencies.
    pub fn optional(kind: FieldKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(kind, description)
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Immutable invocation context handed to a capability handler.
///
/// `store` is the binding's working store, passed mutably so that state
/// written by the handler survives into the next poll cycle. `upstream` is
/// the triggering action's output data; it is `None` for the action handler
/// itself.
pub struct InvokeRequest<'a> {
    pub applet_id: Uuid,
    pub credential: Option<&'a Credential>,
    pub store: &'a mut ValueMap,
    pub auth_context: &'a ValueMap,
    pub upstream: Option<&'a ValueMap>,
    pub log: &'a RunLog,
}

/// What a handler invocation produced.
#[derive(Debug)]
pub enum InvokeOutcome {
    /// The condition fired; the map is forwarded to reaction handlers.
    Triggered(ValueMap),
    /// Nothing to do this cycle.
    Skipped,
}

impl InvokeOutcome {
    pub fn is_triggered(&self) -> bool {
        matches!(self, InvokeOutcome::Triggered(_))
    }
}

/// The single invocation interface every capability implements.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: InvokeRequest<'_>) -> Result<InvokeOutcome>;
}

/// Per-field validator, registered on the provider and keyed by field name.
///
/// Validators run at authoring time only and may call the provider (for
/// example, "does this channel id exist"). They never run inside the poll
/// loop.
#[async_trait]
pub trait FieldValidator: Send + Sync {
    async fn check(
        &self,
        credential: Option<&Credential>,
        value: &Value,
        submitted: &ValueMap,
    ) -> bool;
}

/// A named, self-describing action or reaction contributed by a provider.
pub struct Capability {
    pub name: String,
    pub description: String,
    /// Field schema, keyed by field name. BTreeMap keeps serialized schemas
    /// stable for the authoring layer.
    pub fields: BTreeMap<String, FieldSpec>,
    /// Data keys this capability may emit on trigger, for discoverability and
    /// for validating downstream field references.
    pub outputs: Vec<String>,
    /// True when the capability is fed by a persistent push connection
    /// instead of being polled.
    pub uses_gateway: bool,
    pub handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs)
            .field("uses_gateway", &self.uses_gateway)
            .finish()
    }
}

/// Validates a submitted configuration against a capability's field schema.
///
/// Required-field presence is checked first; for every present field with a
/// registered validator, the validator runs. Returns the names of failing
/// fields, empty when the configuration is acceptable. Called by the
/// authoring layer before an area is persisted, never inside the poll loop.
pub async fn validate(
    credential: Option<&Credential>,
    validators: &HashMap<String, Arc<dyn FieldValidator>>,
    capability: &Capability,
    submitted: &ValueMap,
) -> Vec<String> {
    let mut failed = Vec::new();

    for (name, spec) in &capability.fields {
        if spec.required && !submitted.contains_key(name.as_str()) {
            failed.push(name.clone());
        }
    }

    for (name, value) in submitted {
        if failed.iter().any(|f| f == name) {
            continue;
        }
        if let Some(validator) = validators.get(name.as_str()) {
            if !validator.check(credential, value, submitted).await {
                failed.push(name.clone());
            }
        }
    }

    failed.sort();
    failed
}

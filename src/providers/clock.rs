//! Clock provider: credential-free time-based actions.

use crate::capability::{
    Capability, FieldKind, FieldSpec, FieldValidator, Handler, InvokeOutcome, InvokeRequest,
    ValueMap,
};
use crate::credential::Credential;
use crate::provider::Provider;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Timelike, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Reads a store field that may be a JSON number or a numeric string.
fn int_field(store: &ValueMap, key: &str) -> Result<Option<i64>> {
    match store.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_i64()),
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| anyhow!("field {} is not a number: {}", key, s)),
        Some(other) => Err(anyhow!("field {} has unexpected type: {}", key, other)),
    }
}

fn time_outputs() -> ValueMap {
    let now = Utc::now();
    let mut data = ValueMap::new();
    data.insert("clock:date".to_string(), json!(now.format("%Y-%m-%d").to_string()));
    data.insert("clock:time".to_string(), json!(now.format("%H:%M:%S").to_string()));
    data.insert("clock:hour".to_string(), json!(now.hour()));
    data.insert("clock:minute".to_string(), json!(now.minute()));
    data
}

/// Fires once per matching wall-clock minute. Without configuration it fires
/// once per day at midnight.
struct AtTime;

#[async_trait]
impl Handler for AtTime {
    async fn call(&self, req: InvokeRequest<'_>) -> Result<InvokeOutcome> {
        let hour = int_field(req.store, "req:hour")?;
        let minute = int_field(req.store, "req:minute")?;

        let now = Utc::now();
        let matches = match (hour, minute) {
            (None, None) => now.hour() == 0 && now.minute() == 0,
            (h, m) => {
                h.map_or(true, |h| h == now.hour() as i64)
                    && m.map_or(true, |m| m == now.minute() as i64)
            }
        };
        if !matches {
            return Ok(InvokeOutcome::Skipped);
        }

        // Fire at most once per matched minute, across poll cycles
        let stamp = now.format("%Y-%m-%dT%H:%M").to_string();
        if req.store.get("ctx:fired").and_then(Value::as_str) == Some(stamp.as_str()) {
            return Ok(InvokeOutcome::Skipped);
        }
        req.store.insert("ctx:fired".to_string(), json!(stamp));

        Ok(InvokeOutcome::Triggered(time_outputs()))
    }
}

/// Fires on every poll cycle; handy for trying out a new reaction.
struct Tick;

#[async_trait]
impl Handler for Tick {
    async fn call(&self, _req: InvokeRequest<'_>) -> Result<InvokeOutcome> {
        Ok(InvokeOutcome::Triggered(time_outputs()))
    }
}

struct Range {
    max: i64,
}

#[async_trait]
impl FieldValidator for Range {
    async fn check(
        &self,
        _credential: Option<&Credential>,
        value: &Value,
        _submitted: &ValueMap,
    ) -> bool {
        let parsed = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse::<i64>().ok(),
            _ => None,
        };
        parsed.map(|v| (0..=self.max).contains(&v)).unwrap_or(false)
    }
}

const OUTPUTS: [&str; 4] = ["clock:date", "clock:time", "clock:hour", "clock:minute"];

pub fn provider() -> Provider {
    let outputs: Vec<String> = OUTPUTS.iter().map(|s| s.to_string()).collect();

    let mut at_time_fields = BTreeMap::new();
    at_time_fields.insert(
        "req:hour".to_string(),
        FieldSpec::optional(FieldKind::Number, "Hour of day to fire at (default: every hour)"),
    );
    at_time_fields.insert(
        "req:minute".to_string(),
        FieldSpec::optional(FieldKind::Number, "Minute of hour to fire at (default: every minute)")
            .with_priority(1),
    );

    let mut validators: HashMap<String, Arc<dyn FieldValidator>> = HashMap::new();
    validators.insert("req:hour".to_string(), Arc::new(Range { max: 23 }));
    validators.insert("req:minute".to_string(), Arc::new(Range { max: 59 }));

    Provider {
        name: "clock".to_string(),
        description: "Time-based triggers".to_string(),
        rate_limit: 6.0,
        authenticator: None,
        validators,
        gateway: None,
        actions: vec![
            Arc::new(Capability {
                name: "at_time".to_string(),
                description: "Fires once per matching wall-clock minute".to_string(),
                fields: at_time_fields,
                outputs: outputs.clone(),
                uses_gateway: false,
                handler: Arc::new(AtTime),
            }),
            Arc::new(Capability {
                name: "tick".to_string(),
                description: "Fires on every poll cycle".to_string(),
                fields: BTreeMap::new(),
                outputs,
                uses_gateway: false,
                handler: Arc::new(Tick),
            }),
        ],
        reactions: Vec::new(),
    }
}

//! Webhook provider: dispatch an HTTP request as a reaction.
//!
//! Upstream data from the triggering action is substituted into the URL and
//! body through `{{key}}` placeholders.

use crate::capability::{
    Capability, FieldKind, FieldSpec, FieldValidator, Handler, InvokeOutcome, InvokeRequest,
    ValueMap,
};
use crate::credential::Credential;
use crate::provider::Provider;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Replaces `{{key}}` placeholders with upstream values.
fn render(template: &str, upstream: Option<&ValueMap>) -> String {
    let Some(upstream) = upstream else {
        return template.to_string();
    };
    let mut rendered = template.to_string();
    for (key, value) in upstream {
        let placeholder = format!("{{{{{}}}}}", key);
        if !rendered.contains(&placeholder) {
            continue;
        }
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &replacement);
    }
    rendered
}

fn string_field<'a>(store: &'a ValueMap, key: &str) -> Option<&'a str> {
    store.get(key).and_then(Value::as_str)
}

struct Post;

#[async_trait]
impl Handler for Post {
    async fn call(&self, req: InvokeRequest<'_>) -> Result<InvokeOutcome> {
        let url = string_field(req.store, "req:url")
            .ok_or_else(|| anyhow!("webhook url is missing"))?;
        let url = render(url, req.upstream);

        let method = string_field(req.store, "req:method").unwrap_or("POST");
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| anyhow!("invalid webhook method: {}", method))?;

        let content_type =
            string_field(req.store, "req:content:type").unwrap_or("application/json");
        let body = render(string_field(req.store, "req:body").unwrap_or(""), req.upstream);

        let response = reqwest::Client::new()
            .request(method, &url)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .context("webhook request failed")?;

        // An expected status is a match condition, not an assertion; a
        // mismatch skips the cycle rather than stopping the applet
        if let Some(expected) = string_field(req.store, "req:expect:status") {
            let expected: u16 = expected
                .parse()
                .map_err(|_| anyhow!("expected status is not a number: {}", expected))?;
            if response.status().as_u16() != expected {
                req.log.debug(&format!(
                    "webhook answered {} instead of {}",
                    response.status(),
                    expected
                ));
                return Ok(InvokeOutcome::Skipped);
            }
        }

        Ok(InvokeOutcome::Triggered(ValueMap::new()))
    }
}

struct HttpUrl;

#[async_trait]
impl FieldValidator for HttpUrl {
    async fn check(
        &self,
        _credential: Option<&Credential>,
        value: &Value,
        _submitted: &ValueMap,
    ) -> bool {
        value
            .as_str()
            .map(|s| s.starts_with("http://") || s.starts_with("https://"))
            .unwrap_or(false)
    }
}

pub fn provider() -> Provider {
    let mut fields = BTreeMap::new();
    fields.insert(
        "req:url".to_string(),
        FieldSpec::required(FieldKind::String, "URL to call"),
    );
    let mut method = FieldSpec::optional(FieldKind::Select, "HTTP method (default: POST)")
        .with_priority(1);
    method.values = ["POST", "GET", "PUT", "DELETE"].iter().map(|s| s.to_string()).collect();
    fields.insert("req:method".to_string(), method);
    let mut content_type = FieldSpec::optional(
        FieldKind::Select,
        "Content type of the request (default: application/json)",
    )
    .with_priority(2);
    content_type.values = ["application/json", "application/x-www-form-urlencoded", "text/plain"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    fields.insert("req:content:type".to_string(), content_type);
    let mut body = FieldSpec::optional(FieldKind::String, "Request body (default: empty)")
        .with_priority(3);
    body.allowed_outputs = vec!["*".to_string()];
    fields.insert("req:body".to_string(), body);
    fields.insert(
        "req:expect:status".to_string(),
        FieldSpec::optional(FieldKind::Number, "Only count a matching status as delivered")
            .with_priority(4),
    );

    let mut validators: HashMap<String, Arc<dyn FieldValidator>> = HashMap::new();
    validators.insert("req:url".to_string(), Arc::new(HttpUrl));

    Provider {
        name: "webhook".to_string(),
        description: "Outgoing HTTP calls".to_string(),
        rate_limit: 10.0,
        authenticator: None,
        validators,
        gateway: None,
        actions: Vec::new(),
        reactions: vec![Arc::new(Capability {
            name: "post".to_string(),
            description: "Dispatch an HTTP request".to_string(),
            fields,
            outputs: Vec::new(),
            uses_gateway: false,
            handler: Arc::new(Post),
        })],
    }
}

//! OAuth2 credential broker.
//!
//! An [`Authenticator`] describes one provider's OAuth2 surface: the consent
//! URL, the token endpoint, and optional refresh/validate/profile/identity
//! endpoints. The broker turns a one-time authorization code into a
//! normalized [`CredentialData`] bundle, and keeps stored credentials usable
//! by refreshing expired access tokens just before use.
//!
//! Client id and secret are read from the environment as
//! `PATCHBAY_OAUTH_<PROVIDER>_CLIENT_ID` / `_CLIENT_SECRET`.

use super::{far_future, Credential, CredentialStore};
use crate::capability::ValueMap;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

/// Typed failures of the authentication and refresh protocol.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("provider does not support end-user authentication")]
    Disabled,
    #[error("provider exposes no usable identity")]
    IdentityUnavailable,
    #[error("provider has no refresh endpoint")]
    RefreshUnsupported,
    #[error("endpoint call failed: {0}")]
    Endpoint(String),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("failed to persist refreshed credential")]
    Persist(#[source] anyhow::Error),
}

/// Where to fetch a resolvable end-user identity, and which response field
/// holds it.
#[derive(Clone, Debug)]
pub struct IdentityEndpoint {
    pub url: String,
    pub field: String,
}

/// One provider's OAuth2 endpoints. Only the token endpoint is mandatory.
#[derive(Clone, Debug, Default)]
pub struct AuthEndpoints {
    pub token: String,
    pub refresh: Option<String>,
    pub validate: Option<String>,
    pub profile: Option<String>,
    pub identity: Option<IdentityEndpoint>,
}

/// Per-provider authentication descriptor, part of the provider catalog.
pub struct Authenticator {
    pub name: String,
    /// Whether this provider may back login/registration flows.
    pub enabled: bool,
    /// The user-facing consent page.
    pub authorize_endpoint: String,
    pub scopes: Vec<String>,
    pub endpoints: AuthEndpoints,
    /// Optional hook that derives the stored context map from the merged
    /// endpoint responses.
    pub extra_context: Option<fn(&ValueMap) -> ValueMap>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// Normalized result of a successful code exchange.
#[derive(Clone, Debug)]
pub struct CredentialData {
    pub access_token: String,
    pub token_type: String,
    /// Empty string when the provider issued no refresh token.
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Empty string when no identity was required.
    pub identity: String,
    /// Provider-defined context, merged from the token/validate/profile
    /// responses.
    pub context: ValueMap,
}

impl Authenticator {
    /// Client id and secret from the environment, empty when unset.
    pub fn client_credentials(&self) -> (String, String) {
        let prefix = self.name.to_uppercase();
        let id = std::env::var(format!("PATCHBAY_OAUTH_{}_CLIENT_ID", prefix)).unwrap_or_default();
        let secret =
            std::env::var(format!("PATCHBAY_OAUTH_{}_CLIENT_SECRET", prefix)).unwrap_or_default();
        (id, secret)
    }

    /// Builds the consent URL the authoring layer redirects the user to.
    pub fn authorize_url(&self, state: &str, redirect_uri: &str) -> String {
        let (client_id, _) = self.client_credentials();
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.authorize_endpoint,
            urlencoding::encode(&client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }

    /// Exchanges an authorization code for a normalized credential bundle.
    ///
    /// When `require_identity` is set (login/registration flows) the provider
    /// must expose an identity endpoint and the configured field must resolve,
    /// otherwise the exchange fails with [`AuthError::IdentityUnavailable`].
    /// Optional validate/profile endpoints are called with the fresh access
    /// token and their responses merged into the context map. Expiry is
    /// absolute; a far-future sentinel is used when the provider returns no
    /// TTL.
    pub async fn authenticate(
        &self,
        code: &str,
        redirect_uri: &str,
        require_identity: bool,
    ) -> Result<CredentialData, AuthError> {
        if require_identity && !self.enabled {
            return Err(AuthError::Disabled);
        }
        if require_identity && self.endpoints.identity.is_none() {
            return Err(AuthError::IdentityUnavailable);
        }

        let client = reqwest::Client::new();
        let (client_id, client_secret) = self.client_credentials();

        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", redirect_uri);
        form.insert("client_id", &client_id);
        form.insert("client_secret", &client_secret);

        debug!(provider = %self.name, "Exchanging authorization code for token");
        let mut merged = post_form(&client, &self.endpoints.token, &form).await?;

        let access_token = require_string(&merged, "access_token")?;
        let token_type = require_string(&merged, "token_type")?;
        let refresh_token = merged
            .get("refresh_token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let expires_at = expiry_from(&merged);

        if let Some(url) = &self.endpoints.validate {
            let content = get_json(&client, url, &access_token).await?;
            merged.extend(content);
        }

        if let Some(url) = &self.endpoints.profile {
            let content = get_json(&client, url, &access_token).await?;
            merged.extend(content);
        }

        let mut identity = String::new();
        if require_identity {
            // Presence checked above
            if let Some(endpoint) = &self.endpoints.identity {
                let content = get_json(&client, &endpoint.url, &access_token).await?;
                identity = content
                    .get(endpoint.field.as_str())
                    .and_then(Value::as_str)
                    .ok_or(AuthError::IdentityUnavailable)?
                    .to_string();
            }
        }

        let context = match self.extra_context {
            Some(derive) => derive(&merged),
            None => merged,
        };

        info!(provider = %self.name, "Authorization code exchanged");

        Ok(CredentialData {
            access_token,
            token_type,
            refresh_token,
            expires_at,
            identity,
            context,
        })
    }

    /// Refreshes an expired credential in place, persisting the new tokens
    /// before returning.
    ///
    /// A not-yet-expired credential is returned unchanged without any call;
    /// the expiry comparison is strict, with no grace window. Execution
    /// bindings call this immediately before every handler invocation that
    /// needs the credential.
    pub async fn refresh(
        &self,
        credential: &Credential,
        store: &CredentialStore,
    ) -> Result<Credential, AuthError> {
        if !credential.expired() {
            return Ok(credential.clone());
        }

        let refresh_url = self
            .endpoints
            .refresh
            .as_deref()
            .ok_or(AuthError::RefreshUnsupported)?;
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .ok_or(AuthError::RefreshUnsupported)?;

        let client = reqwest::Client::new();
        let (client_id, client_secret) = self.client_credentials();

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        form.insert("client_id", &client_id);
        form.insert("client_secret", &client_secret);

        info!(provider = %self.name, credential = %credential.id, "Refreshing access token");
        let response = post_form(&client, refresh_url, &form).await?;

        let access_token = require_string(&response, "access_token")?;
        // Keep the old refresh token unless the provider rotated it
        let refresh_token = response
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| credential.refresh_token.clone());
        let expires_at = expiry_from(&response);

        store
            .update_tokens(credential.id, &access_token, refresh_token.as_deref(), expires_at)
            .map_err(AuthError::Persist)?;

        Ok(Credential {
            access_token,
            refresh_token,
            expires_at,
            ..credential.clone()
        })
    }
}

/// Absolute expiry from an `expires_in` TTL, far-future when absent.
fn expiry_from(response: &ValueMap) -> DateTime<Utc> {
    match response.get("expires_in").and_then(Value::as_i64) {
        Some(seconds) => Utc::now() + Duration::seconds(seconds),
        None => far_future(),
    }
}

fn require_string(map: &ValueMap, key: &str) -> Result<String, AuthError> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AuthError::MalformedResponse(format!("missing field: {}", key)))
}

async fn post_form(
    client: &reqwest::Client,
    url: &str,
    form: &HashMap<&str, &str>,
) -> Result<ValueMap, AuthError> {
    let response = client
        .post(url)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| AuthError::Endpoint(e.to_string()))?;

    read_json(response).await
}

async fn get_json(
    client: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> Result<ValueMap, AuthError> {
    let response = client
        .get(url)
        .header("Accept", "application/json")
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| AuthError::Endpoint(e.to_string()))?;

    read_json(response).await
}

async fn read_json(response: reqwest::Response) -> Result<ValueMap, AuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        return Err(AuthError::Endpoint(format!("status {}: {}", status, body)));
    }

    let value: Value = response
        .json()
        .await
        .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(AuthError::MalformedResponse(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

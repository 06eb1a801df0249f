//! Credential records, the OAuth2 broker, and encrypted storage.
//!
//! A [`Credential`] is a stored access/refresh token pair plus a
//! provider-specific context blob. One credential may back many applets; the
//! broker refreshes it in place just before use, and the store persists the
//! rotated tokens (encrypted with AES-256-GCM, unique nonce per token) so a
//! concurrent refresh from another applet's unit is last-writer-wins.

pub mod broker;
mod encryption;
mod store;

pub use broker::{AuthEndpoints, AuthError, Authenticator, CredentialData, IdentityEndpoint};
pub use store::CredentialStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Expiry recorded when a provider returns no TTL for its tokens.
pub fn far_future() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(4_072_721_567, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A stored OAuth2-style credential, usable by one or more applets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub account_id: Uuid,
    pub provider: String,
    /// OAuth access token (encrypted at rest).
    pub access_token: String,
    /// OAuth refresh token, if the provider issued one (encrypted at rest).
    pub refresh_token: Option<String>,
    /// Absolute expiry; [`far_future`] when the provider returned no TTL.
    pub expires_at: DateTime<Utc>,
    /// Opaque provider-specific JSON blob (profile fields, workspace ids, ...).
    pub context: String,
    /// Backs account login; never auto-revoked.
    pub permanent: bool,
}

impl Credential {
    /// Strict expiry check against the wall clock. There is deliberately no
    /// grace window, so a call racing exactly at expiry can still see a stale
    /// token.
    pub fn expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

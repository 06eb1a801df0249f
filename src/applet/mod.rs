//! Applet and area records.
//!
//! An applet binds exactly one action area to one-or-more reaction areas. The
//! authoring layer creates applets in the `Partial` state and promotes them to
//! `Complete` once both sides exist; only complete applets are eligible to
//! run. The engine reads these records to build execution units and writes
//! back run-state transitions.

mod store;

pub use store::AppletStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authoring progress of an applet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthoringState {
    /// Missing its action or its first reaction.
    Partial,
    /// Exactly one action and at least one reaction assigned.
    Complete,
    /// Authoring-side failure (for example a revoked credential).
    Error,
}

impl AuthoringState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthoringState::Partial => "partial",
            AuthoringState::Complete => "complete",
            AuthoringState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "partial" => Some(AuthoringState::Partial),
            "complete" => Some(AuthoringState::Complete),
            "error" => Some(AuthoringState::Error),
            _ => None,
        }
    }
}

/// Whether an execution unit is (supposed to be) live for the applet.
///
/// Persisted so that a restart resumes applets where they left off; the
/// running unit writes `Stopped` back on every exit, fatal or requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Stopped,
    Running,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Running => "running",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(RunState::Stopped),
            "running" => Some(RunState::Running),
            _ => None,
        }
    }
}

/// The role an area plays inside its applet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Action,
    Reaction,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Action => "action",
            Role::Reaction => "reaction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "action" => Some(Role::Action),
            "reaction" => Some(Role::Reaction),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-authored binding of one action to one-or-more reactions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Applet {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub description: String,
    pub state: AuthoringState,
    pub run_state: RunState,
    /// Soft pause: a running applet with `active = false` keeps its loop but
    /// short-circuits every cycle.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A persisted provider + capability + configuration record owned by exactly
/// one applet.
///
/// `config` is an opaque JSON object validated against the capability's field
/// schema at authoring time. Once a running execution unit references the
/// area, the blob only changes through the explicit reconfigure path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Area {
    pub id: Uuid,
    pub applet_id: Uuid,
    /// `None` for capabilities that need no authentication.
    pub credential_id: Option<Uuid>,
    pub role: Role,
    pub provider: String,
    /// Capability name within the provider's role namespace.
    pub name: String,
    pub config: String,
    pub created_at: DateTime<Utc>,
}

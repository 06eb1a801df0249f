//! Built-in providers exercising the capability contract end to end.
//!
//! These are deliberately small: `clock` is a credential-free action provider
//! and `webhook` a reaction provider with a field validator. Real third-party
//! integrations contribute [`crate::provider::Provider`] descriptors of their
//! own and are not part of this crate.

pub mod clock;
pub mod webhook;

use crate::provider::Provider;

/// The providers shipped with the engine.
pub fn builtin() -> Vec<Provider> {
    vec![clock::provider(), webhook::provider()]
}

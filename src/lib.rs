// Applet and area records, SQLite-backed
pub mod applet;

// Capability contract: field schemas, handlers, validation
pub mod capability;

// Engine configuration
pub mod config;

// Credential records, OAuth2 broker, encrypted storage
pub mod credential;

// Execution core: bindings, units, registry
pub mod engine;

// Provider catalog
pub mod provider;

// Built-in providers (clock, webhook)
pub mod providers;

//! Secret resolution for startup configuration.
//!
//! [`SecretStore`] is the async trait for resolving a (scope, name) pair
//! into its plaintext value. [`EnvSecretStore`] reads process environment
//! variables (after `dotenvy` has loaded `.env`); [`FileSecretStore`] reads
//! a JSON map on disk. Secrets are consulted only while building the
//! pipeline configuration, never afterwards.

mod env;
mod file;

pub use env::EnvSecretStore;
pub use file::FileSecretStore;

use anyhow::Result;

/// Resolves a named secret within a scope into its plaintext value.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, scope: &str, name: &str) -> Result<String>;
}

use anyhow::{Context, Result};

use super::SecretStore;

/// Resolves secrets from environment variables.
///
/// `(scope, name)` maps to the variable `SCOPE_NAME`, uppercased, with any
/// non-alphanumeric character replaced by `_`. With `scope = "taxi"` and
/// `name = "sink-url"` the lookup is `TAXI_SINK_URL`.
pub struct EnvSecretStore;

fn var_name(scope: &str, name: &str) -> String {
    format!("{scope}_{name}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, scope: &str, name: &str) -> Result<String> {
        let var = var_name(scope, name);
        std::env::var(&var).with_context(|| format!("secret '{scope}/{name}' ({var}) is not set"))
    }
}

use std::collections::HashMap;

use anyhow::{Context, Result};

use super::SecretStore;

/// Resolves secrets from a plain JSON object on disk, keyed by
/// `"scope/name"`:
///
/// ```json
/// {
///   "taxi/sink-url": "s3://aggregates-bucket/taxi",
///   "taxi/ride-stream": "data/rides.jsonl"
/// }
/// ```
pub struct FileSecretStore {
    entries: HashMap<String, String>,
}

impl FileSecretStore {
    /// Loads the secret map from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading secrets file '{path}'"))?;
        let entries: HashMap<String, String> =
            serde_json::from_str(&content).with_context(|| format!("parsing secrets file '{path}'"))?;
        Ok(Self { entries })
    }
}

#[async_trait::async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, scope: &str, name: &str) -> Result<String> {
        self.entries
            .get(&format!("{scope}/{name}"))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("secret '{scope}/{name}' not found in secrets file"))
    }
}

//! File-backed prompt source
//!
//! The daemon binary has no prompt database; operators mount prompt
//! definitions as a JSON document keyed by prompt id:
//!
//! ```json
//! {
//!   "12": {
//!     "prompt_id": 12,
//!     "version_id": 121,
//!     "version_number": 3,
//!     "name": "answerer",
//!     "messages": [{"role": "user", "content": "{{question}}"}],
//!     "model_params": {"model": "gpt-4.1"}
//!   }
//! }
//! ```

use async_trait::async_trait;
use eyre::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::{PromptSource, PromptVersionInfo};

pub struct FilePromptSource {
    prompts: HashMap<i64, PromptVersionInfo>,
}

impl FilePromptSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context("Failed to read prompt file")?;
        let raw: HashMap<String, PromptVersionInfo> =
            serde_json::from_str(&content).context("Failed to parse prompt file")?;

        let prompts: HashMap<i64, PromptVersionInfo> = raw
            .into_values()
            .map(|version| (version.prompt_id, version))
            .collect();
        info!(path = %path.display(), count = prompts.len(), "Loaded prompt definitions");
        Ok(Self { prompts })
    }

    pub fn empty() -> Self {
        Self {
            prompts: HashMap::new(),
        }
    }
}

#[async_trait]
impl PromptSource for FilePromptSource {
    async fn latest_version(&self, prompt_id: i64) -> Option<PromptVersionInfo> {
        self.prompts.get(&prompt_id).cloned()
    }
}

//! Prompt message rendering
//!
//! Substitutes `{{var}}` placeholders in prompt-version messages from the
//! execution variables. Escaping is disabled: prompts are plain text, not
//! HTML.

use handlebars::Handlebars;
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::llm::ChatMessage;

pub struct PromptRenderer {
    registry: Handlebars<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    /// Render every message against the variable map. Unknown placeholders
    /// render empty; template syntax errors are terminal for the run.
    pub fn render_messages(
        &self,
        messages: &[ChatMessage],
        variables: &Map<String, Value>,
    ) -> EngineResult<Vec<ChatMessage>> {
        let context = Value::Object(variables.clone());
        messages
            .iter()
            .map(|message| {
                let content = self
                    .registry
                    .render_template(&message.content, &context)
                    .map_err(|e| EngineError::NonRetryable(format!("prompt template render failed: {e}")))?;
                Ok(ChatMessage {
                    role: message.role.clone(),
                    content,
                })
            })
            .collect()
    }
}

//! Local tools every session carries, whatever remote tools are loaded.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::handler::ToolHandler;
use crate::types::ToolSchema;

pub const CHANGE_SYSTEM_PROMPT: &str = "change_system_prompt";
pub const STORE_CONTEXTUAL_DATA: &str = "store_contextual_data";

/// Session text the model may rewrite through the built-in tools.
#[derive(Debug, Clone, Default)]
pub struct PromptState {
    pub system_prompt: String,
    pub contextual_data: String,
}

pub type SharedPromptState = Arc<RwLock<PromptState>>;

impl PromptState {
    pub fn shared(system_prompt: impl Into<String>) -> SharedPromptState {
        Arc::new(RwLock::new(Self {
            system_prompt: system_prompt.into(),
            contextual_data: String::new(),
        }))
    }
}

/// Replaces the system prompt outright.
pub struct ChangeSystemPrompt {
    state: SharedPromptState,
}

impl ChangeSystemPrompt {
    pub fn new(state: SharedPromptState) -> Self {
        Self { state }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema::new(
            CHANGE_SYSTEM_PROMPT,
            "Change the chat's system prompt.\nImportant: the new system prompt completely replaces the previous one.",
            json!({
                "type": "object",
                "properties": {
                    "sysPrompt": {"type": "string", "description": "New system prompt"}
                },
                "required": ["sysPrompt"]
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for ChangeSystemPrompt {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let prompt = input["sysPrompt"].as_str().unwrap_or("").to_string();
        let len = prompt.chars().count();
        self.state.write().await.system_prompt = prompt;
        Ok(format!("System prompt updated ({len} characters)"))
    }
}

/// Replaces the contextual data carried alongside the system prompt.
pub struct StoreContextualData {
    state: SharedPromptState,
}

impl StoreContextualData {
    pub fn new(state: SharedPromptState) -> Self {
        Self { state }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema::new(
            STORE_CONTEXTUAL_DATA,
            "Store data that persists across the conversation.\nThis data is placed at the start of the prompt to help remember things.\nImportant: the new data completely replaces the previous data.",
            json!({
                "type": "object",
                "properties": {
                    "data": {"type": "string", "description": "Data to store"}
                },
                "required": ["data"]
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for StoreContextualData {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let data = input["data"].as_str().unwrap_or("").to_string();
        let len = data.chars().count();
        self.state.write().await.contextual_data = data;
        Ok(format!("Contextual data stored. Total: {len} characters"))
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::InferenceProvider;
use crate::error::InferenceError;
use crate::types::{Message, ModelReply, ModelRequest, Role, ToolCall, Usage};

/// Ollama provider using the native `/api/chat` endpoint.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    next_call_id: AtomicU64,
}

impl OllamaProvider {
    /// Connect to a local Ollama instance at the default address.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "http://localhost:11434".into(),
            next_call_id: AtomicU64::new(0),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Ollama wants tool arguments as objects, not encoded strings, and has
    /// no notion of call ids.
    fn convert_message(msg: &Message) -> Value {
        let mut out = json!({
            "role": msg.role,
            "content": msg.text(),
        });
        if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
            out["tool_calls"] = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "function": {
                            "name": tc.name,
                            "arguments": tc.decode_arguments().unwrap_or_else(|_| json!({})),
                        }
                    })
                })
                .collect();
        }
        out
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceProvider for OllamaProvider {
    async fn infer(&self, request: ModelRequest) -> Result<ModelReply, InferenceError> {
        let messages: Vec<Value> = request.messages.iter().map(Self::convert_message).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
        });

        if !request.tools.is_empty() {
            body["tools"] = request.tools.iter().map(|t| t.to_function()).collect();
        }

        debug!(
            model = %request.model,
            messages = messages.len(),
            tools = request.tools.len(),
            "ollama inference request"
        );

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        if status != 200 {
            return Err(InferenceError::ApiError { status, body: text });
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))?;

        let message = &parsed["message"];
        let content = message["content"].as_str().map(str::to_string);

        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .map(|tc| {
                        let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                        let arguments = match &tc["function"]["arguments"] {
                            Value::String(s) => s.clone(),
                            Value::Null => String::new(),
                            other => other.to_string(),
                        };
                        // Ollama issues no call ids; number them per provider
                        let seq = self.next_call_id.fetch_add(1, Ordering::Relaxed);
                        ToolCall {
                            id: format!("ollama_{seq}_{name}"),
                            name,
                            arguments,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = Usage {
            input_tokens: parsed["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
            output_tokens: parsed["eval_count"].as_u64().unwrap_or(0) as u32,
        };

        Ok(ModelReply {
            content,
            tool_calls,
            usage,
        })
    }
}

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::InferenceProvider;
use crate::error::InferenceError;
use crate::types::{Message, ModelReply, ModelRequest, ToolCall, Usage};

/// OpenAI-compatible provider. Works with Ollama's `/v1` endpoint, vLLM,
/// LM Studio, or any server that implements `/v1/chat/completions`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    /// Set an API key. Local servers usually accept any value.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Convert history messages to OpenAI chat format. Local bookkeeping
    /// (timestamps, turn indices) stays out of the request.
    pub(crate) fn convert_message(msg: &Message) -> Value {
        let mut out = json!({
            "role": msg.role,
            "content": msg.content,
        });
        if let Some(ref id) = msg.tool_call_id {
            out["tool_call_id"] = json!(id);
        }
        if !msg.tool_calls.is_empty() {
            out["tool_calls"] = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {"name": tc.name, "arguments": tc.arguments},
                    })
                })
                .collect();
        }
        out
    }

    fn parse_tool_call(tc: &Value) -> ToolCall {
        let arguments = match &tc["function"]["arguments"] {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        ToolCall {
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments,
        }
    }
}

#[async_trait]
impl InferenceProvider for OpenAiProvider {
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
            "openai inference request"
        );

        let mut req = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .header("content-type", "application/json");

        if let Some(ref key) = self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(InferenceError::ApiError { status, body: text });
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))?;

        let message = &parsed["choices"][0]["message"];
        if message.is_null() {
            return Err(InferenceError::Parse("response has no choices".into()));
        }

        let content = message["content"].as_str().map(str::to_string);
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| calls.iter().map(Self::parse_tool_call).collect())
            .unwrap_or_default();

        let usage = Usage {
            input_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(ModelReply {
            content,
            tool_calls,
            usage,
        })
    }
}

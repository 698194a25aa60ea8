use std::time::Duration;

use serde_json::Value;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Calls a tool exposed over HTTP by an OpenAPI tool server.
///
/// Every outcome is a string: transport failures and error statuses are
/// described in the result so the model can react to them.
pub struct RemoteToolInvoker {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl RemoteToolInvoker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Send `Authorization: Bearer <token>` with every call.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// POST `input` as JSON to `base_url + path`. Single attempt.
    pub async fn invoke(&self, path: &str, input: &Value) -> String {
        let url = self.url_for(path);
        debug!(%url, "invoking remote tool");

        let mut req = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header("content-type", "application/json");
        if let Some(ref token) = self.token {
            req = req.header("authorization", format!("Bearer {token}"));
        }

        let resp = match req.json(input).send().await {
            Ok(resp) => resp,
            Err(e) => return format!("Error executing tool: {e}"),
        };

        let status = resp.status();
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) => return format!("Error executing tool: {e}"),
        };

        if !status.is_success() {
            return format!("Error executing tool: HTTP {}: {text}", status.as_u16());
        }

        normalize_body(text)
    }
}

/// Reduce a successful response body to the string handed back to the model.
fn normalize_body(text: String) -> String {
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(mut map)) => match map.remove("result") {
            Some(result) => stringify(result),
            None => Value::Object(map).to_string(),
        },
        Ok(other) => stringify(other),
        Err(_) => text,
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

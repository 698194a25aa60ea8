//! Turns an OpenAPI document into tool schemas the model can call.
//!
//! Only the pieces a tool server actually uses are read: `paths`, each
//! operation's `operationId`, `summary`/`description`, and the JSON request
//! body schema. Anything the translator does not understand is skipped rather
//! than failing the whole document.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{empty_parameters, ToolSchema};

/// A translated operation: the schema for the model plus the HTTP path the
/// document declares for it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOperation {
    pub schema: ToolSchema,
    pub path: String,
}

/// Translate every `paths.<path>.<method>` entry that declares an
/// `operationId`. Entries without one are skipped.
pub fn translate(doc: &Value) -> Vec<RemoteOperation> {
    let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut ops = Vec::new();
    for (path, methods) in paths {
        let Some(methods) = methods.as_object() else {
            continue;
        };
        for (method, details) in methods {
            let Some(operation_id) = details.get("operationId").and_then(Value::as_str) else {
                debug!(%path, %method, "skipping operation without operationId");
                continue;
            };

            ops.push(RemoteOperation {
                schema: ToolSchema::new(
                    operation_id,
                    describe(details),
                    request_parameters(doc, details),
                ),
                path: path.clone(),
            });
        }
    }
    ops
}

/// Summary, then long description, then empty.
fn describe(details: &Value) -> String {
    ["summary", "description"]
        .iter()
        .filter_map(|key| details.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .unwrap_or("")
        .to_string()
}

fn request_parameters(doc: &Value, details: &Value) -> Value {
    let mut parameters = empty_parameters();

    let schema = &details["requestBody"]["content"]["application/json"]["schema"];
    let schema = match schema.get("$ref").and_then(Value::as_str) {
        Some(reference) => resolve_ref(doc, reference),
        None => Some(schema),
    };

    if let Some(schema) = schema {
        for key in ["properties", "required"] {
            if let Some(value) = schema.get(key) {
                parameters[key] = value.clone();
            }
        }
    }
    parameters
}

/// Resolve a same-document reference of the form `#/a/b/c`.
///
/// Any other reference form, or a segment that does not exist, is `None`.
pub fn resolve_ref<'a>(doc: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix("#/")?;
    pointer.split('/').try_fold(doc, |current, part| {
        let part = part.replace("~1", "/").replace("~0", "~");
        match current {
            Value::Object(map) => map.get(&part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

/// Fetch `{base_url}/openapi.json` and translate it.
///
/// The tool server is optional: any failure is logged and yields no tools.
pub async fn fetch_tools(
    client: &reqwest::Client,
    base_url: &str,
    timeout: Duration,
) -> Vec<RemoteOperation> {
    let url = format!("{}/openapi.json", base_url.trim_end_matches('/'));
    match fetch_document(client, &url, timeout).await {
        Ok(doc) => {
            let ops = translate(&doc);
            debug!(%url, tools = ops.len(), "loaded remote tools");
            ops
        }
        Err(e) => {
            warn!(%url, error = %e, "could not load remote tools, continuing without them");
            Vec::new()
        }
    }
}

async fn fetch_document(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Value, String> {
    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = resp.status();
    if !status.is_success() {
        return Err(format!("HTTP {}", status.as_u16()));
    }

    let text = resp.text().await.map_err(|e| e.to_string())?;
    let doc: Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    if !doc.is_object() {
        return Err("document is not an OpenAPI object".into());
    }
    Ok(doc)
}

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PersistError;

pub const APP_NAME: &str = "toolchat";
pub const HISTORY_FILE: &str = "chat.json";
pub const PARAMS_FILE: &str = "params.json";

/// Session parameters persisted next to the history so a run can be resumed
/// with the same model and prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    #[serde(default = "default_app")]
    pub app: String,
    pub model: String,
    pub max_history: usize,
    pub user_name: String,
    #[serde(default)]
    pub tool_server_url: Option<String>,
    pub system_prompt: String,
}

fn default_app() -> String {
    APP_NAME.into()
}

/// Write `value` as pretty JSON, creating parent directories as needed.
pub async fn save_json<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<(), PersistError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistError::from_io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|e| PersistError::Encoding {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| PersistError::from_io(path, e))
}

/// Read and decode a JSON file written by [`save_json`].
pub async fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, PersistError> {
    let path = path.as_ref();
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PersistError::from_io(path, e))?;
    serde_json::from_str(&json).map_err(|e| PersistError::Encoding {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Create `<root>/<label>_<timestamp>` (or `<root>/<timestamp>`) for a backup.
pub async fn create_backup_dir(root: &Path, label: Option<&str>) -> Result<PathBuf, PersistError> {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let name = match label {
        Some(label) if !label.is_empty() => format!("{label}_{stamp}"),
        _ => stamp,
    };
    let dir = root.join(name);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| PersistError::from_io(&dir, e))?;
    Ok(dir)
}

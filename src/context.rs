use std::path::Path;

use tracing::debug;

use crate::error::{ChatError, PersistError};
use crate::session;
use crate::types::{Message, Role};

/// Ordered conversation history.
///
/// The full history is what gets persisted; requests to the model only see a
/// bounded suffix of it (see [`ConversationStore::window`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationStore {
    messages: Vec<Message>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The most recent `max_len` messages, oldest first.
    pub fn window(&self, max_len: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(max_len);
        &self.messages[start..]
    }

    /// Drop the last `turns` exchanges (two messages per turn), clamped to
    /// what is stored. Returns how many messages were removed.
    pub fn rewind(&mut self, turns: i64) -> Result<usize, ChatError> {
        if turns < 0 {
            return Err(ChatError::InvalidArgument(format!(
                "rewind turns cannot be negative, got {turns}"
            )));
        }
        let requested = usize::try_from(turns).unwrap_or(usize::MAX).saturating_mul(2);
        let removed = requested.min(self.messages.len());
        self.messages.truncate(self.messages.len() - removed);
        debug!(turns, removed, remaining = self.messages.len(), "rewound history");
        Ok(removed)
    }

    /// Human-readable transcript, one line per message. Untagged messages
    /// are numbered by the user message that opened their turn.
    pub fn formatted(&self, user_name: &str, model: &str) -> String {
        let mut users_seen = 0usize;
        self.messages
            .iter()
            .map(|msg| {
                if msg.role == Role::User {
                    users_seen += 1;
                }
                let turn = msg.turn.unwrap_or(users_seen.saturating_sub(1));
                let speaker = match msg.role {
                    Role::User => user_name.to_string(),
                    Role::Assistant => model.to_string(),
                    Role::Tool => format!("{model} (tool)"),
                    Role::System => "system".to_string(),
                };
                let content = if msg.tool_calls.is_empty() {
                    msg.text().to_string()
                } else {
                    let names: Vec<&str> = msg.tool_calls.iter().map(|c| c.name.as_str()).collect();
                    format!("[calling {}] {}", names.join(", "), msg.text())
                        .trim_end()
                        .to_string()
                };
                format!("Turn {turn} - {speaker}: {content}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        session::save_json(path, &self.messages).await
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let messages: Vec<Message> = session::load_json(path).await?;
        Ok(Self::from_messages(messages))
    }
}

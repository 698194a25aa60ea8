/// Events emitted while a turn runs, for UI streaming.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    RoundStart { round: usize },
    Text { content: String },
    ToolCall { name: String, arguments: String },
    ToolResult { name: String, output: String },
    Finished { rounds: usize },
}

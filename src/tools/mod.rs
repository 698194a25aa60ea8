pub mod builtin;
pub mod handler;
pub mod registry;
pub mod remote;

pub use builtin::{ChangeSystemPrompt, PromptState, SharedPromptState, StoreContextualData};
pub use handler::{FnHandler, ToolHandler};
pub use registry::{derive_path, read_definitions, RegisteredTool, ToolRegistry, ToolSource};
pub use remote::RemoteToolInvoker;

use async_trait::async_trait;
use serde_json::Value;

/// A tool's execution handler. Consumers implement this for each local tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &Value) -> Result<String, String>;
}

/// Adapts a plain synchronous function into a [`ToolHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(&Value) -> Result<String, String> + Send + Sync,
{
    async fn call(&self, input: &Value) -> Result<String, String> {
        (self.0)(input)
    }
}

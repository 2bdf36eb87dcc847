use serde_json::Value;

use crate::lsp::error::ResponseError;

/// Handles one server-to-client notification method.
#[async_trait::async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, params: Value) -> anyhow::Result<()>;
}

/// Handles one server-to-client request method. The returned value or error
/// is sent back to the server as the response.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value, ResponseError>;
}

#[async_trait::async_trait]
impl<F> NotificationHandler for F
where
    F: Fn(Value) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, params: Value) -> anyhow::Result<()> {
        self(params)
    }
}

#[async_trait::async_trait]
impl<F> RequestHandler for F
where
    F: Fn(Value) -> Result<Value, ResponseError> + Send + Sync,
{
    async fn handle(&self, params: Value) -> Result<Value, ResponseError> {
        self(params)
    }
}

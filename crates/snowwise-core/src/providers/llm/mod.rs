use crate::model::LlmResponse;
use async_trait::async_trait;

/// Language-model completion. No latency or determinism guarantees.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<LlmResponse>;
    fn provider_name(&self) -> &'static str;
}

pub mod cortex;
pub mod fake;
pub mod openai;

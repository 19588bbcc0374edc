use super::CompletionClient;
use crate::model::LlmResponse;
use crate::providers::warehouse::pool::GatewayPool;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Completion through `SNOWFLAKE.CORTEX.COMPLETE`, executed on a pooled
/// warehouse session.
pub struct CortexClient {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pool: Arc<GatewayPool>,
}

impl CortexClient {
    pub fn new(pool: Arc<GatewayPool>, model: String, temperature: f32, max_tokens: u32) -> Self {
        Self {
            model,
            temperature,
            max_tokens,
            pool,
        }
    }

    pub fn completion_sql(&self, system: &str, user: &str) -> String {
        format!(
            "SELECT SNOWFLAKE.CORTEX.COMPLETE('{model}', \
             [{{'role': 'system', 'content': '{system}'}}, {{'role': 'user', 'content': '{user}'}}], \
             {{'temperature': {temperature}, 'max_tokens': {max_tokens}}}) AS RESPONSE",
            model = escape_literal(&self.model),
            system = escape_literal(system),
            user = escape_literal(user),
            temperature = self.temperature,
            max_tokens = self.max_tokens,
        )
    }
}

#[async_trait]
impl CompletionClient for CortexClient {
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<LlmResponse> {
        let sql = self.completion_sql(system, user);
        let out = {
            let session = self.pool.acquire().await?;
            session.execute_query(&sql).await?
        };

        let cell = out
            .result
            .rows
            .first()
            .and_then(|r| r.first())
            .ok_or_else(|| anyhow::anyhow!("Cortex returned no rows (query {})", out.query_id))?;

        Ok(LlmResponse {
            text: response_text(cell)?,
            provider: "cortex".into(),
            model: self.model.clone(),
            meta: json!({ "query_id": out.query_id }),
        })
    }

    fn provider_name(&self) -> &'static str {
        "cortex"
    }
}

/// With an options argument COMPLETE returns a JSON document
/// (`{"choices":[{"messages": "..."}], ...}`); without, a bare string.
fn response_text(cell: &serde_json::Value) -> anyhow::Result<String> {
    let raw = match cell {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => anyhow::bail!("Cortex returned NULL"),
        other => other.to_string(),
    };
    let parsed: Option<serde_json::Value> = serde_json::from_str(&raw).ok();
    if let Some(text) = parsed
        .as_ref()
        .and_then(|v| v.pointer("/choices/0/messages"))
        .and_then(|v| v.as_str())
    {
        return Ok(text.to_string());
    }
    Ok(raw)
}

fn escape_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricSnapshot, ResultSet};
    use crate::providers::warehouse::fixture::{FixtureData, FixtureGateway};
    use crate::providers::warehouse::WarehouseGateway;

    #[test]
    fn literals_are_escaped() {
        assert_eq!(escape_literal(r"it's a \n"), r"it''s a \\n");
    }

    #[test]
    fn options_response_is_unwrapped() {
        let cell = json!(r#"{"choices":[{"messages":"SELECT 1"}],"model":"snowflake-arctic"}"#);
        assert_eq!(response_text(&cell).unwrap(), "SELECT 1");
        assert_eq!(response_text(&json!("plain text")).unwrap(), "plain text");
        assert!(response_text(&serde_json::Value::Null).is_err());
    }

    #[tokio::test]
    async fn completes_through_pool() {
        let pool_probe = CortexClient::new(
            GatewayPool::shared(Arc::new(FixtureGateway::new(FixtureData::default())), 1),
            "snowflake-arctic".into(),
            0.0,
            512,
        );
        let sql = pool_probe.completion_sql("sys", "what's up");
        assert!(sql.contains("'what''s up'"));

        let gw: Arc<dyn WarehouseGateway> = Arc::new(FixtureGateway::new(FixtureData::default().with_statement(
            &sql,
            ResultSet::new(
                vec!["RESPONSE".into()],
                vec![vec![json!(r#"{"choices":[{"messages":"```sql\nSELECT 1\n```"}]}"#)]],
            ),
            MetricSnapshot::default(),
        )));
        let client = CortexClient::new(GatewayPool::shared(gw, 1), "snowflake-arctic".into(), 0.0, 512);
        let resp = client.complete("sys", "what's up").await.unwrap();
        assert_eq!(resp.text, "```sql\nSELECT 1\n```");
        assert_eq!(resp.provider, "cortex");
    }
}

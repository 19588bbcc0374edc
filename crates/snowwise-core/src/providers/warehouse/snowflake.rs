use super::{QueryOutput, WarehouseGateway};
use crate::errors::GatewayError;
use crate::history;
use crate::model::{ColumnDef, MetricSnapshot, ResultSet, TableSchema};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Snowflake error code for "object does not exist or not authorized".
const OBJECT_NOT_FOUND: &str = "002003";

#[derive(Debug, Clone)]
pub struct SnowflakeSettings {
    /// e.g. `https://myorg-myaccount.snowflakecomputing.com`
    pub base_url: String,
    pub token: String,
    /// `OAUTH` or `KEYPAIR_JWT`.
    pub token_type: String,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub statement_timeout_secs: u64,
    pub poll_interval: Duration,
}

/// Client for the Snowflake SQL API (`/api/v2/statements`).
///
/// Each statement is an independent HTTP request carrying its own
/// warehouse/role context, so the gateway holds no session state and one
/// instance can back every slot of a pool.
pub struct SnowflakeGateway {
    settings: SnowflakeSettings,
    client: reqwest::Client,
}

impl SnowflakeGateway {
    pub fn new(settings: SnowflakeSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    pub fn account_url(account: &str) -> String {
        format!("https://{}.snowflakecomputing.com", account)
    }

    fn statements_url(&self) -> String {
        format!("{}/api/v2/statements", self.settings.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.settings.token))
            .header("X-Snowflake-Authorization-Token-Type", &self.settings.token_type)
            .header("Accept", "application/json")
            .header("User-Agent", concat!("snowwise/", env!("CARGO_PKG_VERSION")))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(u16, serde_json::Value), GatewayError> {
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        let json = if body.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&body)
                .map_err(|e| GatewayError::Protocol(format!("HTTP {}: {}: {}", status, e, truncate(&body))))?
        };
        Ok((status, json))
    }

    /// Submits `sql` and waits for completion, fetching every partition.
    async fn run_statement(&self, sql: &str) -> Result<QueryOutput, GatewayError> {
        let mut body = json!({
            "statement": sql,
            "timeout": self.settings.statement_timeout_secs,
        });
        for (key, value) in [
            ("warehouse", &self.settings.warehouse),
            ("role", &self.settings.role),
            ("database", &self.settings.database),
            ("schema", &self.settings.schema),
        ] {
            if let Some(v) = value {
                body[key] = json!(v);
            }
        }

        let (mut status, mut json) = self
            .send(self.client.post(self.statements_url()).json(&body))
            .await?;

        // 202: still running, poll the handle.
        while status == 202 {
            let handle = statement_handle(&json)?;
            tokio::time::sleep(self.settings.poll_interval).await;
            let (s, j) = self
                .send(self.client.get(format!("{}/{}", self.statements_url(), handle)))
                .await?;
            status = s;
            json = j;
        }

        classify_status(status, &json)?;

        let query_id = statement_handle(&json)?;
        let columns = row_type(&json)?;
        let mut rows = data_rows(&json)?;

        let partitions = json
            .pointer("/resultSetMetaData/partitionInfo")
            .and_then(|p| p.as_array())
            .map(|p| p.len())
            .unwrap_or(1);
        for partition in 1..partitions {
            let (s, j) = self
                .send(
                    self.client
                        .get(format!("{}/{}", self.statements_url(), query_id))
                        .query(&[("partition", partition)]),
                )
                .await?;
            classify_status(s, &j)?;
            rows.extend(data_rows(&j)?);
        }

        tracing::debug!(
            event = "snowwise.warehouse.statement",
            query_id = %query_id,
            rows = rows.len(),
            partitions
        );

        Ok(QueryOutput {
            query_id,
            result: ResultSet::new(columns, rows),
        })
    }
}

#[async_trait]
impl WarehouseGateway for SnowflakeGateway {
    async fn execute_query(&self, sql: &str) -> Result<QueryOutput, GatewayError> {
        super::read_only::ensure_read_only(sql)?;
        self.run_statement(sql).await
    }

    async fn describe_table(&self, name: &str) -> Result<TableSchema, GatewayError> {
        if !is_plain_identifier(name) {
            return Err(GatewayError::ReadOnlyViolation(format!("not a table name: {}", name)));
        }
        let out = match self.run_statement(&format!("DESCRIBE TABLE {}", name)).await {
            Ok(out) => out,
            Err(GatewayError::Execution(msg)) if msg.starts_with(OBJECT_NOT_FOUND) => {
                return Err(GatewayError::TableNotFound(name.to_string()))
            }
            Err(e) => return Err(e),
        };
        let name_i = out.result.column_index("name").unwrap_or(0);
        let type_i = out.result.column_index("type").unwrap_or(1);
        let columns = out
            .result
            .rows
            .iter()
            .filter_map(|row| {
                Some(ColumnDef {
                    name: history::cell_str(row.get(name_i))?,
                    data_type: history::cell_str(row.get(type_i)).unwrap_or_default(),
                })
            })
            .collect();
        Ok(TableSchema {
            name: name.to_string(),
            columns,
        })
    }

    async fn query_history_metrics(&self, query_id: &str) -> Result<MetricSnapshot, GatewayError> {
        let out = self.run_statement(&history::metrics_sql(query_id)).await?;
        history::parse_metrics(query_id, &out.result)
    }

    fn provider_name(&self) -> &'static str {
        "snowflake"
    }
}

/// `db.schema.table`, optionally double-quoted per part.
fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '"' | '$'))
}

fn classify_status(status: u16, json: &serde_json::Value) -> Result<(), GatewayError> {
    let message = || {
        let code = json.get("code").and_then(|v| v.as_str()).unwrap_or("");
        let msg = json.get("message").and_then(|v| v.as_str()).unwrap_or("");
        format!("{}: {}", code, msg)
    };
    match status {
        200 => Ok(()),
        401 | 403 => Err(GatewayError::Auth(message())),
        408 => Err(GatewayError::Timeout(0)),
        422 => Err(GatewayError::Execution(message())),
        429 | 500..=599 => Err(GatewayError::Unreachable(format!("HTTP {}: {}", status, message()))),
        _ => Err(GatewayError::Protocol(format!("HTTP {}: {}", status, message()))),
    }
}

fn statement_handle(json: &serde_json::Value) -> Result<String, GatewayError> {
    json.get("statementHandle")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Protocol("response missing statementHandle".into()))
}

fn row_type(json: &serde_json::Value) -> Result<Vec<String>, GatewayError> {
    let cols = json
        .pointer("/resultSetMetaData/rowType")
        .and_then(|v| v.as_array())
        .ok_or_else(|| GatewayError::Protocol("response missing resultSetMetaData.rowType".into()))?;
    Ok(cols
        .iter()
        .map(|c| c.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string())
        .collect())
}

fn data_rows(json: &serde_json::Value) -> Result<Vec<Vec<serde_json::Value>>, GatewayError> {
    match json.get("data") {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(rows)) => rows
            .iter()
            .map(|r| {
                r.as_array()
                    .cloned()
                    .ok_or_else(|| GatewayError::Protocol("data row is not an array".into()))
            })
            .collect(),
        Some(_) => Err(GatewayError::Protocol("data is not an array".into())),
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(200) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_rejects_injected_names() {
        assert!(is_plain_identifier("ANALYTICS.PUBLIC.ORDERS"));
        assert!(is_plain_identifier("\"My_Table\""));
        assert!(!is_plain_identifier("orders; DROP TABLE x"));
        assert!(!is_plain_identifier(""));
    }

    #[test]
    fn parses_statement_response() {
        let body = json!({
            "statementHandle": "01b8-0000",
            "resultSetMetaData": {
                "rowType": [{"name": "ID", "type": "fixed"}, {"name": "NAME", "type": "text"}],
                "partitionInfo": [{"rowCount": 2}]
            },
            "data": [["1", "a"], ["2", null]]
        });
        classify_status(200, &body).unwrap();
        assert_eq!(statement_handle(&body).unwrap(), "01b8-0000");
        assert_eq!(row_type(&body).unwrap(), vec!["ID", "NAME"]);
        let rows = data_rows(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1], serde_json::Value::Null);
    }

    #[test]
    fn status_classification() {
        let err = json!({"code": "390303", "message": "Invalid OAuth access token."});
        assert!(matches!(classify_status(401, &err), Err(GatewayError::Auth(_))));
        assert!(matches!(classify_status(503, &err), Err(GatewayError::Unreachable(_))));

        let missing = json!({"code": "002003", "message": "Table 'GONE' does not exist or not authorized."});
        match classify_status(422, &missing) {
            Err(GatewayError::Execution(m)) => assert!(m.starts_with(OBJECT_NOT_FOUND)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn account_url_format() {
        assert_eq!(
            SnowflakeGateway::account_url("acme-prod"),
            "https://acme-prod.snowflakecomputing.com"
        );
    }
}

//! Deterministic in-memory warehouse.
//!
//! Backs the test-suite and offline CLI runs. Statements are matched on
//! their normalised text; the history view is simulated (date filters are
//! not applied, fixture entries are considered in range).

use super::{QueryOutput, WarehouseGateway};
use crate::errors::GatewayError;
use crate::fingerprint::normalize_sql;
use crate::history;
use crate::model::{MetricSnapshot, ResultSet, TableSchema};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureData {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub tables: Vec<TableSchema>,
    #[serde(default)]
    pub statements: Vec<FixtureStatement>,
    /// Metrics lookups answer `MetricsNotYetAvailable` this many times for
    /// every statement executed through the gateway.
    #[serde(default)]
    pub history_delay_polls: u32,
    /// Every call fails with `Unreachable`.
    #[serde(default)]
    pub unreachable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub query_id: String,
    pub query_text: String,
    pub execution_time_ms: u64,
    pub bytes_scanned: u64,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default = "default_query_type")]
    pub query_type: String,
}

fn default_query_type() -> String {
    "SELECT".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureStatement {
    pub sql: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub bytes_scanned: u64,
    /// Executing this statement fails with the given message.
    #[serde(default)]
    pub error: Option<String>,
}

impl FixtureData {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read fixture {}: {}", path.display(), e))?;
        let data: FixtureData = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse fixture {}: {}", path.display(), e))?;
        Ok(data)
    }

    pub fn with_history(mut self, query_id: &str, query_text: &str, metrics: MetricSnapshot) -> Self {
        self.history.push(HistoryEntry {
            query_id: query_id.into(),
            query_text: query_text.into(),
            execution_time_ms: metrics.execution_time_ms,
            bytes_scanned: metrics.bytes_scanned,
            start_time: None,
            query_type: default_query_type(),
        });
        self
    }

    pub fn with_table(mut self, name: &str, columns: &[(&str, &str)]) -> Self {
        self.tables.push(TableSchema {
            name: name.into(),
            columns: columns
                .iter()
                .map(|(n, t)| crate::model::ColumnDef {
                    name: (*n).into(),
                    data_type: (*t).into(),
                })
                .collect(),
        });
        self
    }

    pub fn with_statement(mut self, sql: &str, result: ResultSet, metrics: MetricSnapshot) -> Self {
        self.statements.push(FixtureStatement {
            sql: sql.into(),
            columns: result.columns,
            rows: result.rows,
            execution_time_ms: metrics.execution_time_ms,
            bytes_scanned: metrics.bytes_scanned,
            error: None,
        });
        self
    }

    pub fn with_failing_statement(mut self, sql: &str, error: &str) -> Self {
        self.statements.push(FixtureStatement {
            sql: sql.into(),
            columns: vec![],
            rows: vec![],
            execution_time_ms: 0,
            bytes_scanned: 0,
            error: Some(error.into()),
        });
        self
    }

    pub fn with_history_delay(mut self, polls: u32) -> Self {
        self.history_delay_polls = polls;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }
}

struct Executed {
    metrics: MetricSnapshot,
    pending_polls: u32,
}

pub struct FixtureGateway {
    data: FixtureData,
    executed: Mutex<HashMap<String, Executed>>,
    next_id: AtomicU64,
    calls: Mutex<Vec<String>>,
}

impl FixtureGateway {
    pub fn new(data: FixtureData) -> Self {
        Self {
            data,
            executed: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call made so far, as `op:argument`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, op: &str, arg: &str) {
        if let Ok(mut c) = self.calls.lock() {
            c.push(format!("{}:{}", op, arg));
        }
    }

    fn check_reachable(&self) -> Result<(), GatewayError> {
        if self.data.unreachable {
            return Err(GatewayError::Unreachable("fixture marked unreachable".into()));
        }
        Ok(())
    }

    fn answer_history(&self, sql: &str) -> ResultSet {
        static LIMIT: OnceLock<Regex> = OnceLock::new();
        let limit_re = LIMIT.get_or_init(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)").expect("static regex"));
        let limit = limit_re
            .captures(sql)
            .and_then(|c| c[1].parse::<usize>().ok())
            .unwrap_or(usize::MAX);
        let by_bytes = sql.to_ascii_uppercase().contains("ORDER BY BYTES_SCANNED");

        let mut entries: Vec<&HistoryEntry> = self
            .data
            .history
            .iter()
            .filter(|e| e.query_type.eq_ignore_ascii_case("SELECT"))
            .collect();
        if by_bytes {
            entries.sort_by(|a, b| b.bytes_scanned.cmp(&a.bytes_scanned));
        } else {
            entries.sort_by(|a, b| b.execution_time_ms.cmp(&a.execution_time_ms));
        }

        let rows = entries
            .into_iter()
            .take(limit)
            .map(|e| {
                vec![
                    serde_json::json!(e.query_id),
                    serde_json::json!(e.query_text),
                    serde_json::json!(e.execution_time_ms.to_string()),
                    serde_json::json!(e.bytes_scanned.to_string()),
                    e.start_time
                        .as_ref()
                        .map(|s| serde_json::json!(s))
                        .unwrap_or(serde_json::Value::Null),
                    serde_json::json!(e.query_type),
                ]
            })
            .collect();

        ResultSet::new(
            vec![
                history::COL_QUERY_ID.into(),
                history::COL_QUERY_TEXT.into(),
                history::COL_EXECUTION_TIME.into(),
                history::COL_BYTES_SCANNED.into(),
                history::COL_START_TIME.into(),
                history::COL_QUERY_TYPE.into(),
            ],
            rows,
        )
    }
}

#[async_trait]
impl WarehouseGateway for FixtureGateway {
    async fn execute_query(&self, sql: &str) -> Result<QueryOutput, GatewayError> {
        self.record("execute", sql);
        self.check_reachable()?;

        let id = format!("01fx-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));

        if sql.to_ascii_uppercase().contains(history::HISTORY_VIEW) {
            return Ok(QueryOutput {
                query_id: id,
                result: self.answer_history(sql),
            });
        }

        let wanted = normalize_sql(sql);
        let stmt = self
            .data
            .statements
            .iter()
            .find(|s| normalize_sql(&s.sql) == wanted)
            .ok_or_else(|| GatewayError::Execution(format!("no fixture for statement: {}", wanted)))?;

        if let Some(err) = &stmt.error {
            return Err(GatewayError::Execution(err.clone()));
        }

        if let Ok(mut executed) = self.executed.lock() {
            executed.insert(
                id.clone(),
                Executed {
                    metrics: MetricSnapshot::new(stmt.execution_time_ms, stmt.bytes_scanned),
                    pending_polls: self.data.history_delay_polls,
                },
            );
        }

        Ok(QueryOutput {
            query_id: id,
            result: ResultSet::new(stmt.columns.clone(), stmt.rows.clone()),
        })
    }

    async fn describe_table(&self, name: &str) -> Result<TableSchema, GatewayError> {
        self.record("describe", name);
        self.check_reachable()?;
        let wanted = name.trim_matches('"');
        self.data
            .tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(wanted))
            .cloned()
            .ok_or_else(|| GatewayError::TableNotFound(name.to_string()))
    }

    async fn query_history_metrics(&self, query_id: &str) -> Result<MetricSnapshot, GatewayError> {
        self.record("metrics", query_id);
        self.check_reachable()?;

        if let Some(e) = self.data.history.iter().find(|e| e.query_id == query_id) {
            return Ok(MetricSnapshot::new(e.execution_time_ms, e.bytes_scanned));
        }

        let mut executed = self
            .executed
            .lock()
            .map_err(|_| GatewayError::Protocol("fixture state poisoned".into()))?;
        match executed.get_mut(query_id) {
            Some(e) if e.pending_polls > 0 => {
                e.pending_polls -= 1;
                Err(GatewayError::MetricsNotYetAvailable(query_id.to_string()))
            }
            Some(e) => Ok(e.metrics),
            None => Err(GatewayError::MetricsNotYetAvailable(query_id.to_string())),
        }
    }

    fn provider_name(&self) -> &'static str {
        "fixture"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn history_is_sorted_and_limited() {
        let gw = FixtureGateway::new(
            FixtureData::default()
                .with_history("a", "SELECT 1", MetricSnapshot::new(10, 900))
                .with_history("b", "SELECT 2", MetricSnapshot::new(30, 100))
                .with_history("c", "SELECT 3", MetricSnapshot::new(20, 500)),
        );
        let out = gw
            .execute_query("SELECT * FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY ORDER BY BYTES_SCANNED DESC LIMIT 2")
            .await
            .unwrap();
        let ids: Vec<_> = out.result.rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("c")]);
    }

    #[tokio::test]
    async fn metrics_materialise_after_delay() {
        let gw = FixtureGateway::new(
            FixtureData::default()
                .with_statement("SELECT 1", ResultSet::new(vec!["X".into()], vec![vec![json!("1")]]), MetricSnapshot::new(5, 6))
                .with_history_delay(2),
        );
        let out = gw.execute_query("SELECT 1;").await.unwrap();
        for _ in 0..2 {
            assert!(matches!(
                gw.query_history_metrics(&out.query_id).await,
                Err(GatewayError::MetricsNotYetAvailable(_))
            ));
        }
        assert_eq!(
            gw.query_history_metrics(&out.query_id).await.unwrap(),
            MetricSnapshot::new(5, 6)
        );
    }

    #[tokio::test]
    async fn unknown_table_and_statement() {
        let gw = FixtureGateway::new(FixtureData::default().with_table("ORDERS", &[("ID", "NUMBER")]));
        assert!(gw.describe_table("orders").await.is_ok());
        assert_eq!(
            gw.describe_table("gone").await,
            Err(GatewayError::TableNotFound("gone".into()))
        );
        assert!(matches!(
            gw.execute_query("SELECT 42").await,
            Err(GatewayError::Execution(_))
        ));
    }

    #[test]
    fn fixture_yaml_parses() {
        let data: FixtureData = serde_yaml::from_str(
            r#"
history:
  - query_id: q1
    query_text: SELECT * FROM orders
    execution_time_ms: 12400
    bytes_scanned: 500000
tables:
  - name: ORDERS
    columns:
      - { name: ID, data_type: NUMBER }
statements:
  - sql: SELECT * FROM orders
    columns: [ID]
    rows: [["1"]]
history_delay_polls: 1
"#,
        )
        .unwrap();
        assert_eq!(data.history[0].query_type, "SELECT");
        assert_eq!(data.tables[0].columns[0].data_type, "NUMBER");
        assert_eq!(data.history_delay_polls, 1);
    }
}

//! Queries against `SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY`.
//!
//! The view's column names are a fixed external contract.

use crate::errors::GatewayError;
use crate::model::{CandidateQuery, DateRange, ExpenseMetric, MetricSnapshot, ResultSet, MAX_CANDIDATES};

pub const HISTORY_VIEW: &str = "SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY";

pub const COL_QUERY_ID: &str = "QUERY_ID";
pub const COL_QUERY_TEXT: &str = "QUERY_TEXT";
pub const COL_EXECUTION_TIME: &str = "EXECUTION_TIME";
pub const COL_BYTES_SCANNED: &str = "BYTES_SCANNED";
pub const COL_START_TIME: &str = "START_TIME";
pub const COL_QUERY_TYPE: &str = "QUERY_TYPE";

/// Top-N most expensive `SELECT` statements in `range`.
pub fn discovery_sql(range: &DateRange, metric: ExpenseMetric, top_n: usize) -> String {
    let limit = top_n.clamp(1, MAX_CANDIDATES);
    format!(
        "SELECT {id}, {text}, {time}, {bytes}, {start}, {ty}\n\
         FROM {view}\n\
         WHERE {start} >= TO_TIMESTAMP_LTZ('{from}')\n  \
         AND {start} < TO_TIMESTAMP_LTZ('{to}')\n  \
         AND {ty} = 'SELECT'\n\
         ORDER BY {order} DESC\n\
         LIMIT {limit}",
        id = COL_QUERY_ID,
        text = COL_QUERY_TEXT,
        time = COL_EXECUTION_TIME,
        bytes = COL_BYTES_SCANNED,
        start = COL_START_TIME,
        ty = COL_QUERY_TYPE,
        view = HISTORY_VIEW,
        from = range.start.to_rfc3339(),
        to = range.end.to_rfc3339(),
        order = metric.history_column(),
        limit = limit,
    )
}

/// Metrics for a single statement. Returns no rows until the history view
/// has caught up with the execution.
pub fn metrics_sql(query_id: &str) -> String {
    format!(
        "SELECT {id}, {time}, {bytes} FROM {view} WHERE {id} = '{qid}'",
        id = COL_QUERY_ID,
        time = COL_EXECUTION_TIME,
        bytes = COL_BYTES_SCANNED,
        view = HISTORY_VIEW,
        qid = query_id.replace('\'', "''"),
    )
}

/// Builds candidates from a discovery result, keeping at most
/// [`MAX_CANDIDATES`] rows in warehouse order.
pub fn parse_candidates(rs: &ResultSet) -> Result<Vec<CandidateQuery>, GatewayError> {
    let col = |name: &str| {
        rs.column_index(name)
            .ok_or_else(|| GatewayError::Protocol(format!("history result missing column {}", name)))
    };
    let id_i = col(COL_QUERY_ID)?;
    let text_i = col(COL_QUERY_TEXT)?;
    let time_i = col(COL_EXECUTION_TIME)?;
    let bytes_i = col(COL_BYTES_SCANNED)?;
    let start_i = rs.column_index(COL_START_TIME);

    let mut out = Vec::new();
    for row in rs.rows.iter().take(MAX_CANDIDATES) {
        let query_id = cell_str(row.get(id_i)).unwrap_or_default();
        let Some(text) = cell_str(row.get(text_i)) else {
            continue;
        };
        let metrics = MetricSnapshot::new(
            cell_u64(row.get(time_i)).unwrap_or(0),
            cell_u64(row.get(bytes_i)).unwrap_or(0),
        );
        let mut candidate = CandidateQuery::new(out.len(), query_id, text, metrics);
        candidate.start_time = start_i.and_then(|i| cell_str(row.get(i)));
        out.push(candidate);
    }
    Ok(out)
}

/// Reads the metrics row for `query_id`; an empty result means the history
/// record has not materialised yet.
pub fn parse_metrics(query_id: &str, rs: &ResultSet) -> Result<MetricSnapshot, GatewayError> {
    let Some(row) = rs.rows.first() else {
        return Err(GatewayError::MetricsNotYetAvailable(query_id.to_string()));
    };
    let time_i = rs
        .column_index(COL_EXECUTION_TIME)
        .ok_or_else(|| GatewayError::Protocol("metrics result missing EXECUTION_TIME".into()))?;
    let bytes_i = rs
        .column_index(COL_BYTES_SCANNED)
        .ok_or_else(|| GatewayError::Protocol("metrics result missing BYTES_SCANNED".into()))?;
    Ok(MetricSnapshot::new(
        cell_u64(row.get(time_i)).unwrap_or(0),
        cell_u64(row.get(bytes_i)).unwrap_or(0),
    ))
}

pub fn cell_str(v: Option<&serde_json::Value>) -> Option<String> {
    match v? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Numbers may arrive as JSON numbers or as strings (the SQL API returns
/// every cell as a string). Fractional values are truncated.
pub fn cell_u64(v: Option<&serde_json::Value>) -> Option<u64> {
    match v? {
        serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as u64))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn discovery_sql_filters_orders_and_limits() {
        let end = chrono::Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        let sql = discovery_sql(&DateRange::ending_at(end, 7), ExpenseMetric::BytesScanned, 50);
        assert!(sql.contains("FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY"));
        assert!(sql.contains("QUERY_TYPE = 'SELECT'"));
        assert!(sql.contains("ORDER BY BYTES_SCANNED DESC"));
        assert!(sql.contains("LIMIT 20"));
        assert!(sql.contains("2026-10-09T00:00:00+00:00"));
    }

    #[test]
    fn parse_candidates_reads_columns_by_name() {
        let rs = ResultSet::new(
            vec!["query_text".into(), "QUERY_ID".into(), "EXECUTION_TIME".into(), "BYTES_SCANNED".into()],
            vec![
                vec![json!("SELECT * FROM a"), json!("01a"), json!("12400"), json!(500000)],
                vec![json!(null), json!("01b"), json!("1"), json!("1")],
                vec![json!("SELECT * FROM b"), json!("01c"), json!(99.7), json!("7")],
            ],
        );
        let c = parse_candidates(&rs).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].query_id, "01a");
        assert_eq!(c[0].metrics, MetricSnapshot::new(12_400, 500_000));
        assert_eq!(c[1].index, 1);
        assert_eq!(c[1].metrics.execution_time_ms, 99);
    }

    #[test]
    fn parse_candidates_caps_at_twenty() {
        let rows = (0..25)
            .map(|i| vec![json!(format!("q{i}")), json!(format!("SELECT {i}")), json!("1"), json!("1")])
            .collect();
        let rs = ResultSet::new(
            vec!["QUERY_ID".into(), "QUERY_TEXT".into(), "EXECUTION_TIME".into(), "BYTES_SCANNED".into()],
            rows,
        );
        assert_eq!(parse_candidates(&rs).unwrap().len(), MAX_CANDIDATES);
    }

    #[test]
    fn missing_column_is_protocol_error() {
        let rs = ResultSet::new(vec!["QUERY_ID".into()], vec![]);
        assert!(matches!(parse_candidates(&rs), Err(GatewayError::Protocol(_))));
    }

    #[test]
    fn empty_metrics_result_is_not_yet_available() {
        let rs = ResultSet::new(vec!["EXECUTION_TIME".into(), "BYTES_SCANNED".into()], vec![]);
        assert_eq!(
            parse_metrics("01x", &rs),
            Err(GatewayError::MetricsNotYetAvailable("01x".into()))
        );
    }

    #[test]
    fn metrics_sql_escapes_quotes() {
        assert!(metrics_sql("a'b").ends_with("QUERY_ID = 'a''b'"));
    }
}

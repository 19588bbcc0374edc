use crate::errors::GatewayError;
use crate::model::{MetricSnapshot, ResultSet, TableSchema};
use async_trait::async_trait;

pub mod fixture;
pub mod pool;
pub mod read_only;
pub mod snowflake;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub query_id: String,
    pub result: ResultSet,
}

/// One warehouse session.
///
/// Implementations must return the complete result set: equivalence checks
/// compare every row.
#[async_trait]
pub trait WarehouseGateway: Send + Sync {
    async fn execute_query(&self, sql: &str) -> Result<QueryOutput, GatewayError>;

    async fn describe_table(&self, name: &str) -> Result<TableSchema, GatewayError>;

    /// `MetricsNotYetAvailable` until the history record for `query_id` exists.
    async fn query_history_metrics(&self, query_id: &str) -> Result<MetricSnapshot, GatewayError>;

    fn provider_name(&self) -> &'static str;
}

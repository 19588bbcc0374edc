use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on candidates considered by a single run.
pub const MAX_CANDIDATES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Analyze,
    Propose,
    Validate,
    Summarize,
    Done,
    Failed,
}

impl Stage {
    /// The stage that follows a successful `self`. Terminal stages have none.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Discover => Some(Stage::Analyze),
            Stage::Analyze => Some(Stage::Propose),
            Stage::Propose => Some(Stage::Validate),
            Stage::Validate => Some(Stage::Summarize),
            Stage::Summarize => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Analyze => "analyze",
            Stage::Propose => "propose",
            Stage::Validate => "validate",
            Stage::Summarize => "summarize",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    AwaitingApproval,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseMetric {
    #[default]
    ExecutionTime,
    BytesScanned,
}

impl ExpenseMetric {
    /// Column of the query history view this metric orders by.
    pub fn history_column(self) -> &'static str {
        match self {
            ExpenseMetric::ExecutionTime => "EXECUTION_TIME",
            ExpenseMetric::BytesScanned => "BYTES_SCANNED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "execution_time" | "time" | "execution-time" => Some(ExpenseMetric::ExecutionTime),
            "bytes_scanned" | "bytes" | "bytes-scanned" => Some(ExpenseMetric::BytesScanned),
            _ => None,
        }
    }
}

impl fmt::Display for ExpenseMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpenseMetric::ExecutionTime => f.write_str("execution_time"),
            ExpenseMetric::BytesScanned => f.write_str("bytes_scanned"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn last_days(days: u32) -> Self {
        Self::ending_at(Utc::now(), days)
    }

    pub fn ending_at(end: DateTime<Utc>, days: u32) -> Self {
        Self {
            start: end - Duration::days(i64::from(days)),
            end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub execution_time_ms: u64,
    pub bytes_scanned: u64,
}

impl MetricSnapshot {
    pub fn new(execution_time_ms: u64, bytes_scanned: u64) -> Self {
        Self {
            execution_time_ms,
            bytes_scanned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Compact `name(col TYPE, ...)` rendering used in prompts.
    pub fn render(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect();
        format!("{}({})", self.name, cols.join(", "))
    }
}

/// Fully materialised result of a statement. Cells keep whatever JSON shape
/// the warehouse returned them in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricImprovement {
    pub original: u64,
    pub optimized: u64,
    /// `None` when the original value is zero.
    pub improvement_pct: Option<f64>,
}

impl MetricImprovement {
    fn between(original: u64, optimized: u64) -> Self {
        let improvement_pct = if original == 0 {
            None
        } else {
            Some((original as f64 - optimized as f64) / original as f64 * 100.0)
        };
        Self {
            original,
            optimized,
            improvement_pct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceDelta {
    original: MetricSnapshot,
    optimized: MetricSnapshot,
    execution_time: MetricImprovement,
    bytes_scanned: MetricImprovement,
}

impl PerformanceDelta {
    pub fn between(original: MetricSnapshot, optimized: MetricSnapshot) -> Self {
        Self {
            original,
            optimized,
            execution_time: MetricImprovement::between(
                original.execution_time_ms,
                optimized.execution_time_ms,
            ),
            bytes_scanned: MetricImprovement::between(
                original.bytes_scanned,
                optimized.bytes_scanned,
            ),
        }
    }

    pub fn original(&self) -> MetricSnapshot {
        self.original
    }

    pub fn optimized(&self) -> MetricSnapshot {
        self.optimized
    }

    pub fn execution_time(&self) -> MetricImprovement {
        self.execution_time
    }

    pub fn bytes_scanned(&self) -> MetricImprovement {
        self.bytes_scanned
    }

    pub fn is_faster(&self) -> bool {
        self.execution_time.optimized < self.execution_time.original
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquivalenceVerdict {
    #[default]
    Unknown,
    Match,
    Mismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    NoUsableTables,
    SchemaLookupFailed,
    OptimizationUnavailable,
    ExecutionFailed,
    PerformanceDataUnavailable,
    TaskAborted,
}

/// A candidate-level failure. Recorded, never propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateIssue {
    pub stage: Stage,
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub index: usize,
    pub fingerprint: String,
    pub query_id: String,
    pub original_text: String,
    pub metrics: MetricSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub schemas: Vec<TableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub issues: Vec<CandidateIssue>,
    optimized_text: Option<String>,
    revalidated_query_id: Option<String>,
    optimized_query_id: Option<String>,
    verdict: EquivalenceVerdict,
    mismatch_detail: Option<String>,
    delta: Option<PerformanceDelta>,
}

impl CandidateQuery {
    pub fn new(index: usize, query_id: String, original_text: String, metrics: MetricSnapshot) -> Self {
        let fingerprint = crate::fingerprint::query_fingerprint(&original_text);
        Self {
            index,
            fingerprint,
            query_id,
            original_text,
            metrics,
            start_time: None,
            tables: Vec::new(),
            schemas: Vec::new(),
            rationale: None,
            issues: Vec::new(),
            optimized_text: None,
            revalidated_query_id: None,
            optimized_query_id: None,
            verdict: EquivalenceVerdict::Unknown,
            mismatch_detail: None,
            delta: None,
        }
    }

    pub fn optimized_text(&self) -> Option<&str> {
        self.optimized_text.as_deref()
    }

    pub fn optimized_query_id(&self) -> Option<&str> {
        self.optimized_query_id.as_deref()
    }

    /// Query id of the fresh execution of the original text during validation.
    pub fn revalidated_query_id(&self) -> Option<&str> {
        self.revalidated_query_id.as_deref()
    }

    pub fn verdict(&self) -> EquivalenceVerdict {
        self.verdict
    }

    pub fn mismatch_detail(&self) -> Option<&str> {
        self.mismatch_detail.as_deref()
    }

    pub fn delta(&self) -> Option<&PerformanceDelta> {
        self.delta.as_ref()
    }

    /// Candidates without a proposal are carried through validation untouched.
    pub fn is_inert(&self) -> bool {
        self.optimized_text.is_none()
    }

    pub fn issues_in(&self, stage: Stage) -> impl Iterator<Item = &CandidateIssue> {
        self.issues.iter().filter(move |i| i.stage == stage)
    }

    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    pub fn record_issue(&mut self, stage: Stage, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(CandidateIssue {
            stage,
            kind,
            message: message.into(),
        });
    }

    pub fn set_optimized_text(&mut self, text: String) -> anyhow::Result<()> {
        if text.trim().is_empty() {
            anyhow::bail!("optimized query text must not be empty");
        }
        self.optimized_text = Some(text);
        Ok(())
    }

    pub fn set_revalidated_query_id(&mut self, query_id: String) {
        self.revalidated_query_id = Some(query_id);
    }

    /// Must only be called once the optimized text executed successfully.
    pub fn set_optimized_query_id(&mut self, query_id: String) -> anyhow::Result<()> {
        match self.optimized_text.as_deref() {
            Some(t) if !t.trim().is_empty() => {
                self.optimized_query_id = Some(query_id);
                Ok(())
            }
            _ => anyhow::bail!(
                "candidate {} has no optimized text; cannot attach query id {}",
                self.index,
                query_id
            ),
        }
    }

    pub fn record_match(&mut self) {
        self.verdict = EquivalenceVerdict::Match;
        self.mismatch_detail = None;
    }

    pub fn record_mismatch(&mut self, detail: String) {
        self.verdict = EquivalenceVerdict::Mismatch;
        self.mismatch_detail = Some(detail);
        self.delta = None;
    }

    /// Unsound optimizations never carry a delta.
    pub fn set_delta(&mut self, delta: PerformanceDelta) -> anyhow::Result<()> {
        if self.verdict != EquivalenceVerdict::Match {
            anyhow::bail!(
                "candidate {} verdict is {:?}; a delta requires a match",
                self.index,
                self.verdict
            );
        }
        self.delta = Some(delta);
        Ok(())
    }

    pub(crate) fn reset_analysis(&mut self) {
        self.tables.clear();
        self.schemas.clear();
        self.issues.retain(|i| i.stage != Stage::Analyze);
    }

    pub(crate) fn reset_proposal(&mut self) {
        self.optimized_text = None;
        self.rationale = None;
        self.issues.retain(|i| i.stage != Stage::Propose);
    }

    pub(crate) fn reset_validation(&mut self) {
        self.revalidated_query_id = None;
        self.optimized_query_id = None;
        self.verdict = EquivalenceVerdict::Unknown;
        self.mismatch_detail = None;
        self.delta = None;
        self.issues.retain(|i| i.stage != Stage::Validate);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRun {
    pub id: RunId,
    pub request: String,
    pub date_range: DateRange,
    pub expense_metric: ExpenseMetric,
    /// Next stage to execute, or the terminal stage.
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<Stage>,
    pub status: RunStatus,
    /// Queries supplied by the caller. When present DISCOVER uses them
    /// instead of the history view.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seed_queries: Vec<String>,
    pub candidates: Vec<CandidateQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<crate::report::RunReport>,
    pub created_at: DateTime<Utc>,
}

impl OptimizationRun {
    pub fn new(id: RunId, request: String, date_range: DateRange, expense_metric: ExpenseMetric) -> Self {
        Self {
            id,
            request,
            date_range,
            expense_metric,
            stage: Stage::Discover,
            last_completed: None,
            status: RunStatus::Pending,
            seed_queries: Vec::new(),
            candidates: Vec::new(),
            failure: None,
            report: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.stage = Stage::Failed;
        self.status = RunStatus::Failed;
        self.failure = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> CandidateQuery {
        CandidateQuery::new(
            0,
            "01b2".into(),
            "SELECT * FROM orders".into(),
            MetricSnapshot::new(12_400, 500_000),
        )
    }

    #[test]
    fn stages_advance_strictly_in_order() {
        let mut s = Stage::Discover;
        let mut seen = vec![s];
        while let Some(n) = s.next() {
            seen.push(n);
            s = n;
        }
        assert_eq!(
            seen,
            vec![
                Stage::Discover,
                Stage::Analyze,
                Stage::Propose,
                Stage::Validate,
                Stage::Summarize,
                Stage::Done
            ]
        );
        assert_eq!(Stage::Failed.next(), None);
    }

    #[test]
    fn optimized_id_requires_optimized_text() {
        let mut c = candidate();
        assert!(c.set_optimized_query_id("01c3".into()).is_err());
        assert!(c.optimized_query_id().is_none());

        assert!(c.set_optimized_text("   ".into()).is_err());
        c.set_optimized_text("SELECT id FROM orders".into()).unwrap();
        c.set_optimized_query_id("01c3".into()).unwrap();
        assert_eq!(c.optimized_query_id(), Some("01c3"));
    }

    #[test]
    fn delta_requires_match_and_mismatch_clears_it() {
        let mut c = candidate();
        let delta = PerformanceDelta::between(
            MetricSnapshot::new(12_400, 500_000),
            MetricSnapshot::new(4_100, 500_000),
        );
        assert!(c.set_delta(delta.clone()).is_err());

        c.record_match();
        c.set_delta(delta).unwrap();
        assert!(c.delta().is_some());

        c.record_mismatch("row 0 differs".into());
        assert!(c.delta().is_none());
        assert_eq!(c.verdict(), EquivalenceVerdict::Mismatch);
    }

    #[test]
    fn improvement_percentages() {
        let delta = PerformanceDelta::between(
            MetricSnapshot::new(12_400, 500_000),
            MetricSnapshot::new(4_100, 0),
        );
        let pct = delta.execution_time().improvement_pct.unwrap();
        assert!((pct - 66.935).abs() < 0.01, "got {pct}");
        assert_eq!(delta.bytes_scanned().improvement_pct, Some(100.0));
        assert!(delta.is_faster());

        let zero = PerformanceDelta::between(MetricSnapshot::new(0, 0), MetricSnapshot::new(5, 5));
        assert_eq!(zero.execution_time().improvement_pct, None);
    }

    #[test]
    fn expense_metric_parsing() {
        assert_eq!(ExpenseMetric::parse("bytes"), Some(ExpenseMetric::BytesScanned));
        assert_eq!(
            ExpenseMetric::parse("Execution_Time"),
            Some(ExpenseMetric::ExecutionTime)
        );
        assert_eq!(ExpenseMetric::parse("cost"), None);
    }
}

pub mod console;
pub mod json;

use crate::model::{
    CandidateIssue, CandidateQuery, DateRange, EquivalenceVerdict, ExpenseMetric, IssueKind,
    MetricSnapshot, OptimizationRun, PerformanceDelta, RunId, Stage,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final, self-contained result of a run. Built without touching any
/// external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub request: String,
    pub date_range: DateRange,
    pub expense_metric: ExpenseMetric,
    pub methodology: Vec<String>,
    pub candidates: Vec<CandidateReport>,
    pub totals: ReportTotals,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub index: usize,
    pub query_id: String,
    pub fingerprint: String,
    pub original_text: String,
    pub original_metrics: MetricSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_query_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub tables: Vec<String>,
    pub outcome: CandidateOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<CandidateIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateOutcome {
    /// Results matched and both history records were read.
    Validated { delta: PerformanceDelta },
    /// Results differ; never reported with a delta.
    Mismatch { detail: String },
    /// Results matched but history never produced both records.
    PerformanceDataUnavailable,
    /// No rewrite was produced.
    OptimizationUnavailable,
    /// One of the two executions failed.
    ValidationFailed { reason: String },
    NotValidated,
}

impl CandidateOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CandidateOutcome::Validated { .. } => "validated",
            CandidateOutcome::Mismatch { .. } => "mismatch",
            CandidateOutcome::PerformanceDataUnavailable => "unavailable",
            CandidateOutcome::OptimizationUnavailable => "no proposal",
            CandidateOutcome::ValidationFailed { .. } => "validation failed",
            CandidateOutcome::NotValidated => "not validated",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportTotals {
    pub candidates: usize,
    pub fully_analyzed: usize,
    pub proposed: usize,
    pub validated: usize,
    pub faster: usize,
    pub mismatched: usize,
    pub unavailable: usize,
    pub failed: usize,
}

impl RunReport {
    pub fn build(run: &OptimizationRun) -> Self {
        let candidates: Vec<CandidateReport> = run.candidates.iter().map(candidate_report).collect();

        let mut totals = ReportTotals {
            candidates: candidates.len(),
            ..ReportTotals::default()
        };
        for (c, r) in run.candidates.iter().zip(&candidates) {
            if c.issues_in(Stage::Analyze).next().is_none() {
                totals.fully_analyzed += 1;
            }
            if !c.is_inert() {
                totals.proposed += 1;
            }
            match &r.outcome {
                CandidateOutcome::Validated { delta } => {
                    totals.validated += 1;
                    if delta.is_faster() {
                        totals.faster += 1;
                    }
                }
                CandidateOutcome::Mismatch { .. } => totals.mismatched += 1,
                CandidateOutcome::PerformanceDataUnavailable => totals.unavailable += 1,
                CandidateOutcome::ValidationFailed { .. } => totals.failed += 1,
                CandidateOutcome::OptimizationUnavailable | CandidateOutcome::NotValidated => {}
            }
        }

        Self {
            run_id: run.id,
            request: run.request.clone(),
            date_range: run.date_range,
            expense_metric: run.expense_metric,
            methodology: methodology(run.expense_metric),
            candidates,
            totals,
            generated_at: Utc::now(),
        }
    }

    pub fn candidate(&self, index: usize) -> Option<&CandidateReport> {
        self.candidates.iter().find(|c| c.index == index)
    }
}

fn candidate_report(c: &CandidateQuery) -> CandidateReport {
    CandidateReport {
        index: c.index,
        query_id: c.query_id.clone(),
        fingerprint: c.fingerprint.clone(),
        original_text: c.original_text.clone(),
        original_metrics: c.metrics,
        optimized_text: c.optimized_text().map(str::to_string),
        optimized_query_id: c.optimized_query_id().map(str::to_string),
        rationale: c.rationale.clone(),
        tables: c.tables.clone(),
        outcome: outcome(c),
        issues: c.issues.clone(),
    }
}

fn outcome(c: &CandidateQuery) -> CandidateOutcome {
    if c.is_inert() {
        return CandidateOutcome::OptimizationUnavailable;
    }
    match c.verdict() {
        EquivalenceVerdict::Mismatch => CandidateOutcome::Mismatch {
            detail: c.mismatch_detail().unwrap_or_default().to_string(),
        },
        EquivalenceVerdict::Match => match c.delta() {
            Some(d) => CandidateOutcome::Validated { delta: d.clone() },
            None => CandidateOutcome::PerformanceDataUnavailable,
        },
        EquivalenceVerdict::Unknown => {
            let failure = c
                .issues
                .iter()
                .find(|i| matches!(i.kind, IssueKind::ExecutionFailed | IssueKind::TaskAborted));
            match failure {
                Some(i) => CandidateOutcome::ValidationFailed {
                    reason: i.message.clone(),
                },
                None => CandidateOutcome::NotValidated,
            }
        }
    }
}

fn methodology(metric: ExpenseMetric) -> Vec<String> {
    vec![
        format!(
            "Selected the most expensive SELECT statements from query history, ranked by {}.",
            metric
        ),
        "Collected the schema of every table referenced after FROM or JOIN.".into(),
        "Checked each query for common mistakes and asked for a rewrite targeting execution time and bytes scanned.".into(),
        "Executed the original and the rewrite and compared full result sets, row order included.".into(),
        "Read both executions from query history; improvement is (original - optimized) / original.".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricSnapshot, RunId};

    fn run_with(candidates: Vec<CandidateQuery>) -> OptimizationRun {
        let mut run = OptimizationRun::new(
            RunId(1),
            "find slow queries".into(),
            DateRange::last_days(7),
            ExpenseMetric::ExecutionTime,
        );
        run.candidates = candidates;
        run
    }

    fn cand(i: usize) -> CandidateQuery {
        CandidateQuery::new(
            i,
            format!("q{}", i),
            format!("SELECT {} FROM orders", i),
            MetricSnapshot::new(12_400, 500_000),
        )
    }

    #[test]
    fn outcomes_follow_candidate_state() -> anyhow::Result<()> {
        let inert = cand(0);

        let mut validated = cand(1);
        validated.set_optimized_text("SELECT 1 FROM orders".into())?;
        validated.set_optimized_query_id("opt-1".into())?;
        validated.record_match();
        validated.set_delta(PerformanceDelta::between(
            MetricSnapshot::new(12_400, 500_000),
            MetricSnapshot::new(4_100, 200_000),
        ))?;

        let mut mismatch = cand(2);
        mismatch.set_optimized_text("SELECT 2 FROM orders ORDER BY 1".into())?;
        mismatch.record_mismatch("row 0 column 0 differs".into());

        let mut unavailable = cand(3);
        unavailable.set_optimized_text("SELECT 3 FROM orders".into())?;
        unavailable.record_match();

        let mut failed = cand(4);
        failed.set_optimized_text("SELECT bad FROM orders".into())?;
        failed.record_issue(Stage::Validate, IssueKind::ExecutionFailed, "invalid identifier BAD");

        let report = RunReport::build(&run_with(vec![inert, validated, mismatch, unavailable, failed]));

        assert_eq!(report.candidate(0).unwrap().outcome, CandidateOutcome::OptimizationUnavailable);
        assert!(matches!(report.candidate(1).unwrap().outcome, CandidateOutcome::Validated { .. }));
        assert_eq!(
            report.candidate(2).unwrap().outcome,
            CandidateOutcome::Mismatch {
                detail: "row 0 column 0 differs".into()
            }
        );
        assert_eq!(report.candidate(3).unwrap().outcome, CandidateOutcome::PerformanceDataUnavailable);
        assert!(matches!(
            report.candidate(4).unwrap().outcome,
            CandidateOutcome::ValidationFailed { .. }
        ));

        assert_eq!(report.totals.candidates, 5);
        assert_eq!(report.totals.proposed, 4);
        assert_eq!(report.totals.validated, 1);
        assert_eq!(report.totals.faster, 1);
        assert_eq!(report.totals.mismatched, 1);
        assert_eq!(report.totals.unavailable, 1);
        assert_eq!(report.totals.failed, 1);
        assert_eq!(report.methodology.len(), 5);
        Ok(())
    }

    #[test]
    fn analysis_issues_reduce_fully_analyzed() {
        let mut missing = cand(1);
        missing.record_issue(Stage::Analyze, IssueKind::SchemaLookupFailed, "table not found: GONE");
        let report = RunReport::build(&run_with(vec![cand(0), missing]));
        assert_eq!(report.totals.fully_analyzed, 1);
        assert_eq!(report.candidate(1).unwrap().issues.len(), 1);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let v = serde_json::to_value(CandidateOutcome::Mismatch { detail: "x".into() }).unwrap();
        assert_eq!(v["status"], "mismatch");
        assert_eq!(v["detail"], "x");
    }
}

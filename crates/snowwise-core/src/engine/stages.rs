use crate::checker::{self, QueryChecker};
use crate::compare::PerformanceComparator;
use crate::config::WorkflowSettings;
use crate::equivalence::{compare_result_sets, Equivalence};
use crate::errors::{GatewayError, WorkflowError};
use crate::extract::TableExtractor;
use crate::history;
use crate::model::{
    CandidateQuery, ExpenseMetric, IssueKind, MetricSnapshot, OptimizationRun, Stage, TableSchema, MAX_CANDIDATES,
};
use crate::prompts;
use crate::providers::llm::CompletionClient;
use crate::providers::warehouse::pool::GatewayPool;
use crate::providers::warehouse::read_only::ensure_read_only;
use crate::providers::warehouse::QueryOutput;
use crate::report::RunReport;
use moka::sync::Cache;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::timeout;

/// Everything a candidate task needs. Cheap to clone: one copy moves into
/// every spawned task.
#[derive(Clone)]
pub(crate) struct StageContext {
    pub pool: Arc<GatewayPool>,
    pub completion: Arc<dyn CompletionClient>,
    pub checker: QueryChecker,
    pub extractor: Arc<dyn TableExtractor>,
    pub comparator: PerformanceComparator,
    pub settings: Arc<WorkflowSettings>,
    /// Successful lookups only, keyed by upper-cased table name. Misses are
    /// retried on the next ANALYZE.
    pub schemas: Cache<String, TableSchema>,
}

impl StageContext {
    pub fn new(
        pool: Arc<GatewayPool>,
        completion: Arc<dyn CompletionClient>,
        extractor: Arc<dyn TableExtractor>,
        settings: Arc<WorkflowSettings>,
    ) -> Self {
        Self {
            checker: QueryChecker::new(completion.clone()),
            comparator: PerformanceComparator::new(
                pool.clone(),
                settings.history_poll.clone(),
                settings.timeout,
            ),
            schemas: Cache::new(256),
            pool,
            completion,
            extractor,
            settings,
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        match timeout(self.settings.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(GatewayError::Timeout(self.settings.timeout.as_secs())),
        }
    }

    async fn execute(&self, sql: &str) -> Result<QueryOutput, GatewayError> {
        ensure_read_only(sql)?;
        let session = self.pool.acquire().await?;
        self.bounded(session.execute_query(sql)).await
    }

    async fn describe(&self, table: &str) -> Result<TableSchema, GatewayError> {
        let key = table.trim_matches('"').to_ascii_uppercase();
        if let Some(hit) = self.schemas.get(&key) {
            return Ok(hit);
        }
        let schema = {
            let session = self.pool.acquire().await?;
            self.bounded(session.describe_table(table)).await?
        };
        self.schemas.insert(key, schema.clone());
        Ok(schema)
    }

    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        match timeout(self.settings.timeout, self.completion.complete(system, user)).await {
            Ok(r) => Ok(r?.text),
            Err(_) => Err(GatewayError::Timeout(self.settings.timeout.as_secs()).into()),
        }
    }

    async fn check(&self, query: &str) -> anyhow::Result<String> {
        match timeout(self.settings.timeout, self.checker.check(query)).await {
            Ok(r) => r,
            Err(_) => Err(GatewayError::Timeout(self.settings.timeout.as_secs()).into()),
        }
    }

    /// Runs `work` for every candidate on a bounded set of tasks and waits for
    /// all of them. Order is preserved. An infrastructure error from any task
    /// fails the stage once every task has finished.
    async fn fan_out<F, Fut>(
        &self,
        stage: Stage,
        candidates: Vec<CandidateQuery>,
        work: F,
    ) -> Result<Vec<CandidateQuery>, WorkflowError>
    where
        F: Fn(StageContext, CandidateQuery) -> Fut,
        Fut: Future<Output = Result<CandidateQuery, GatewayError>> + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(self.settings.parallel.max(1)));
        let mut handles = Vec::with_capacity(candidates.len());

        for c in candidates {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| WorkflowError::Internal(e.to_string()))?;
            let snapshot = c.clone();
            let fut = work(self.clone(), c);
            let h = tokio::spawn(async move {
                let _permit = permit;
                fut.await
            });
            handles.push((snapshot, h));
        }

        let mut out = Vec::with_capacity(handles.len());
        let mut infra: Option<GatewayError> = None;
        for (snapshot, h) in handles {
            match h.await {
                Ok(Ok(c)) => out.push(c),
                Ok(Err(e)) => {
                    infra.get_or_insert(e);
                    out.push(snapshot);
                }
                Err(e) => {
                    let mut c = snapshot;
                    tracing::warn!(
                        event = "snowwise.candidate.aborted",
                        stage = %stage,
                        candidate = c.index,
                        error = %e
                    );
                    c.record_issue(stage, IssueKind::TaskAborted, format!("task aborted: {}", e));
                    out.push(c);
                }
            }
        }

        match infra {
            Some(e) => Err(WorkflowError::infrastructure(stage, &e)),
            None => Ok(out),
        }
    }
}

pub(crate) async fn execute(
    ctx: &StageContext,
    stage: Stage,
    run: &mut OptimizationRun,
) -> Result<(), WorkflowError> {
    match stage {
        Stage::Discover => discover(ctx, run).await,
        Stage::Analyze => analyze(ctx, run).await,
        Stage::Propose => propose(ctx, run).await,
        Stage::Validate => validate(ctx, run).await,
        Stage::Summarize => {
            run.report = Some(RunReport::build(run));
            Ok(())
        }
        Stage::Done | Stage::Failed => Err(WorkflowError::RunFinished(run.id)),
    }
}

async fn discover(ctx: &StageContext, run: &mut OptimizationRun) -> Result<(), WorkflowError> {
    if !run.seed_queries.is_empty() {
        run.candidates = seeded_candidates(&run.seed_queries);
        tracing::info!(
            event = "snowwise.discover.seeded",
            run_id = run.id.0,
            candidates = run.candidates.len()
        );
        return Ok(());
    }

    let sql = history::discovery_sql(&run.date_range, run.expense_metric, ctx.settings.top_n);
    let out = ctx
        .execute(&sql)
        .await
        .map_err(|e| WorkflowError::infrastructure(Stage::Discover, &e))?;
    let mut candidates = history::parse_candidates(&out.result)
        .map_err(|e| WorkflowError::infrastructure(Stage::Discover, &e))?;
    candidates.truncate(MAX_CANDIDATES);

    tracing::info!(
        event = "snowwise.discover.completed",
        run_id = run.id.0,
        candidates = candidates.len(),
        metric = %run.expense_metric
    );
    run.candidates = candidates;
    Ok(())
}

/// Caller-supplied queries have no history record; their baseline comes from
/// the re-execution in VALIDATE.
fn seeded_candidates(queries: &[String]) -> Vec<CandidateQuery> {
    queries
        .iter()
        .take(MAX_CANDIDATES)
        .enumerate()
        .map(|(i, sql)| {
            CandidateQuery::new(
                i,
                format!("input-{}", i + 1),
                sql.trim().to_string(),
                MetricSnapshot::default(),
            )
        })
        .collect()
}

async fn analyze(ctx: &StageContext, run: &mut OptimizationRun) -> Result<(), WorkflowError> {
    let mut candidates = std::mem::take(&mut run.candidates);
    for c in &mut candidates {
        c.reset_analysis();
    }
    run.candidates = ctx.fan_out(Stage::Analyze, candidates, analyze_candidate).await?;
    Ok(())
}

async fn analyze_candidate(ctx: StageContext, mut c: CandidateQuery) -> Result<CandidateQuery, GatewayError> {
    c.tables = ctx.extractor.extract(&c.original_text);
    if c.tables.is_empty() {
        c.record_issue(
            Stage::Analyze,
            IssueKind::NoUsableTables,
            format!("no table references found by {} extractor", ctx.extractor.name()),
        );
        return Ok(c);
    }

    for table in c.tables.clone() {
        match ctx.describe(&table).await {
            Ok(schema) => c.schemas.push(schema),
            Err(e) if e.is_infrastructure() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    event = "snowwise.analyze.schema_failed",
                    candidate = c.index,
                    table = %table,
                    error = %e
                );
                c.record_issue(Stage::Analyze, IssueKind::SchemaLookupFailed, format!("{}: {}", table, e));
            }
        }
    }
    Ok(c)
}

async fn propose(ctx: &StageContext, run: &mut OptimizationRun) -> Result<(), WorkflowError> {
    let metric = run.expense_metric;
    let mut candidates = std::mem::take(&mut run.candidates);
    for c in &mut candidates {
        c.reset_proposal();
    }
    run.candidates = ctx
        .fan_out(Stage::Propose, candidates, move |ctx, c| propose_candidate(ctx, c, metric))
        .await?;
    Ok(())
}

async fn propose_candidate(
    ctx: StageContext,
    mut c: CandidateQuery,
    metric: ExpenseMetric,
) -> Result<CandidateQuery, GatewayError> {
    match proposal(&ctx, &c, metric).await {
        Ok((sql, rationale)) => {
            // `proposal` never yields an empty statement.
            if let Err(e) = c.set_optimized_text(sql) {
                c.record_issue(Stage::Propose, IssueKind::OptimizationUnavailable, e.to_string());
            } else {
                c.rationale = rationale;
            }
        }
        Err(e) => {
            if let Some(g) = e.downcast_ref::<GatewayError>().filter(|g| g.is_infrastructure()) {
                return Err(g.clone());
            }
            tracing::warn!(
                event = "snowwise.propose.unavailable",
                candidate = c.index,
                error = %e
            );
            c.record_issue(Stage::Propose, IssueKind::OptimizationUnavailable, e.to_string());
        }
    }
    Ok(c)
}

async fn proposal(
    ctx: &StageContext,
    c: &CandidateQuery,
    metric: ExpenseMetric,
) -> anyhow::Result<(String, Option<String>)> {
    let checked = ctx.check(&c.original_text).await?;
    let prompt = prompts::optimization_prompt(&checked, &c.schemas, metric);
    let text = ctx.complete(prompts::OPTIMIZER_SYSTEM, &prompt).await?;
    let sql = checker::extract_single_statement(&text)?;
    ensure_read_only(&sql)?;
    Ok((sql, checker::rationale(&text)))
}

async fn validate(ctx: &StageContext, run: &mut OptimizationRun) -> Result<(), WorkflowError> {
    let mut candidates = std::mem::take(&mut run.candidates);
    for c in &mut candidates {
        c.reset_validation();
    }
    run.candidates = ctx.fan_out(Stage::Validate, candidates, validate_candidate).await?;
    Ok(())
}

async fn validate_candidate(ctx: StageContext, mut c: CandidateQuery) -> Result<CandidateQuery, GatewayError> {
    let Some(optimized_sql) = c.optimized_text().map(str::to_string) else {
        return Ok(c);
    };

    let original = match ctx.execute(&c.original_text).await {
        Ok(out) => out,
        Err(e) if e.is_infrastructure() => return Err(e),
        Err(e) => {
            c.record_issue(Stage::Validate, IssueKind::ExecutionFailed, format!("original query: {}", e));
            return Ok(c);
        }
    };
    c.set_revalidated_query_id(original.query_id.clone());

    let optimized = match ctx.execute(&optimized_sql).await {
        Ok(out) => out,
        Err(e) if e.is_infrastructure() => return Err(e),
        Err(e) => {
            c.record_issue(Stage::Validate, IssueKind::ExecutionFailed, format!("optimized query: {}", e));
            return Ok(c);
        }
    };
    if let Err(e) = c.set_optimized_query_id(optimized.query_id.clone()) {
        c.record_issue(Stage::Validate, IssueKind::ExecutionFailed, e.to_string());
        return Ok(c);
    }

    if let Equivalence::Mismatch(detail) = compare_result_sets(&original.result, &optimized.result) {
        tracing::info!(
            event = "snowwise.validate.mismatch",
            candidate = c.index,
            detail = %detail
        );
        c.record_mismatch(detail);
        return Ok(c);
    }
    c.record_match();

    match ctx.comparator.compare(&original.query_id, &optimized.query_id).await {
        Ok(delta) => {
            tracing::info!(
                event = "snowwise.validate.delta",
                candidate = c.index,
                execution_time_pct = delta.execution_time().improvement_pct,
                bytes_scanned_pct = delta.bytes_scanned().improvement_pct
            );
            if let Err(e) = c.set_delta(delta) {
                c.record_issue(Stage::Validate, IssueKind::PerformanceDataUnavailable, e.to_string());
            }
        }
        Err(e) if e.is_infrastructure() => return Err(e),
        Err(e) => {
            c.record_issue(
                Stage::Validate,
                IssueKind::PerformanceDataUnavailable,
                format!("performance data unavailable: {}", e),
            );
        }
    }
    Ok(c)
}

//! The optimization workflow engine.
//!
//! A run moves DISCOVER -> ANALYZE -> PROPOSE -> VALIDATE -> SUMMARIZE -> DONE,
//! one stage per [`Engine::advance`] call. Between calls the run sits in
//! `awaiting_approval`; callers that don't need approval use [`Engine::run`].

mod stages;

use crate::config::WorkflowSettings;
use crate::errors::WorkflowError;
use crate::extract::{KeywordExtractor, TableExtractor};
use crate::model::{DateRange, ExpenseMetric, OptimizationRun, RunId, RunStatus, Stage, MAX_CANDIDATES};
use crate::providers::warehouse::read_only::ensure_read_only;
use crate::providers::llm::CompletionClient;
use crate::providers::warehouse::pool::GatewayPool;
use crate::report::RunReport;
use stages::StageContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct EngineParts {
    pub pool: Arc<GatewayPool>,
    pub completion: Arc<dyn CompletionClient>,
    pub extractor: Arc<dyn TableExtractor>,
    pub settings: WorkflowSettings,
}

impl EngineParts {
    pub fn new(pool: Arc<GatewayPool>, completion: Arc<dyn CompletionClient>) -> Self {
        Self {
            pool,
            completion,
            extractor: Arc::new(KeywordExtractor),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TableExtractor>) -> Self {
        self.extractor = extractor;
        self
    }
}

#[derive(Clone)]
pub struct RunRequest {
    pub text: String,
    /// Defaults to the configured lookback window ending now.
    pub date_range: Option<DateRange>,
    pub expense_metric: Option<ExpenseMetric>,
    /// Explicit queries to optimize; DISCOVER skips the history view.
    pub queries: Vec<String>,
    /// Warehouse sessions for this run only; the engine's pool otherwise.
    pub warehouse: Option<Arc<GatewayPool>>,
}

impl RunRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            date_range: None,
            expense_metric: None,
            queries: Vec::new(),
            warehouse: None,
        }
    }

    pub fn with_queries<I, S>(mut self, queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queries.extend(queries.into_iter().map(Into::into));
        self
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_metric(mut self, metric: ExpenseMetric) -> Self {
        self.expense_metric = Some(metric);
        self
    }

    pub fn with_warehouse(mut self, pool: Arc<GatewayPool>) -> Self {
        self.warehouse = Some(pool);
        self
    }
}

/// Final state of a run driven by [`Engine::run`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: OptimizationRun,
    pub report: RunReport,
}

struct RunSlot {
    run: OptimizationRun,
    busy: bool,
    cancel: Arc<AtomicBool>,
    ctx: StageContext,
}

type Registry = Mutex<HashMap<RunId, RunSlot>>;

/// Clears the busy flag however `advance` exits, including when its future
/// is dropped mid-stage.
struct BusyGuard<'a> {
    runs: &'a Registry,
    id: RunId,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut runs) = self.runs.lock() {
            if let Some(slot) = runs.get_mut(&self.id) {
                slot.busy = false;
            }
        }
    }
}

pub struct Engine {
    pool: Arc<GatewayPool>,
    completion: Arc<dyn CompletionClient>,
    extractor: Arc<dyn TableExtractor>,
    settings: Arc<WorkflowSettings>,
    runs: Registry,
    next_id: AtomicU64,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            pool: parts.pool,
            completion: parts.completion,
            extractor: parts.extractor,
            settings: Arc::new(parts.settings),
            runs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    fn registry(&self) -> Result<MutexGuard<'_, HashMap<RunId, RunSlot>>, WorkflowError> {
        self.runs
            .lock()
            .map_err(|_| WorkflowError::Internal("run registry poisoned".into()))
    }

    /// Drives a fresh run to completion without pausing for approval.
    /// The run is discarded afterwards.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, WorkflowError> {
        let id = self.start_run(request)?;
        let result = loop {
            match self.advance(id).await {
                Ok(state) if state.is_finished() => break Ok(()),
                Ok(_) => continue,
                Err(e) => break Err(e),
            }
        };
        let run = self.discard(id)?;
        result?;
        let report = run.report.clone().unwrap_or_else(|| RunReport::build(&run));
        Ok(RunOutcome { run, report })
    }

    pub fn start_run(&self, request: RunRequest) -> Result<RunId, WorkflowError> {
        if request.queries.len() > MAX_CANDIDATES {
            return Err(WorkflowError::InvalidRequest(format!(
                "{} queries supplied, at most {} allowed",
                request.queries.len(),
                MAX_CANDIDATES
            )));
        }
        for (i, sql) in request.queries.iter().enumerate() {
            ensure_read_only(sql).map_err(|e| WorkflowError::InvalidRequest(format!("query {}: {}", i + 1, e)))?;
        }

        let id = RunId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let range = request
            .date_range
            .unwrap_or_else(|| DateRange::last_days(self.settings.lookback_days));
        let metric = request.expense_metric.unwrap_or(self.settings.expense_metric);
        let pool = request.warehouse.unwrap_or_else(|| self.pool.clone());

        let mut run = OptimizationRun::new(id, request.text, range, metric);
        run.seed_queries = request.queries;
        let slot = RunSlot {
            run,
            busy: false,
            cancel: Arc::new(AtomicBool::new(false)),
            ctx: StageContext::new(
                pool,
                self.completion.clone(),
                self.extractor.clone(),
                self.settings.clone(),
            ),
        };
        self.registry()?.insert(id, slot);

        tracing::info!(
            event = "snowwise.run.started",
            run_id = id.0,
            metric = %metric,
            from = %range.start,
            to = %range.end
        );
        Ok(id)
    }

    pub fn get_run_state(&self, id: RunId) -> Result<OptimizationRun, WorkflowError> {
        self.registry()?
            .get(&id)
            .map(|slot| slot.run.clone())
            .ok_or(WorkflowError::RunNotFound(id))
    }

    /// Executes the run's current stage over every candidate and moves to the
    /// next one. Returns the updated snapshot.
    pub async fn advance(&self, id: RunId) -> Result<OptimizationRun, WorkflowError> {
        let (stage, mut working, ctx) = {
            let mut runs = self.registry()?;
            let slot = runs.get_mut(&id).ok_or(WorkflowError::RunNotFound(id))?;
            if slot.run.is_finished() {
                return Err(WorkflowError::RunFinished(id));
            }
            if slot.busy {
                return Err(WorkflowError::RunBusy(id));
            }
            slot.busy = true;
            (slot.run.stage, slot.run.clone(), slot.ctx.clone())
        };
        let _busy = BusyGuard { runs: &self.runs, id };

        tracing::info!(
            event = "snowwise.stage.entered",
            run_id = id.0,
            stage = %stage,
            candidates = working.candidates.len()
        );
        let started = std::time::Instant::now();
        let result = stages::execute(&ctx, stage, &mut working).await;

        // Written back before `_busy` clears the flag.
        let mut runs = self.registry()?;
        let slot = runs.get_mut(&id).ok_or(WorkflowError::RunNotFound(id))?;
        let outcome = match result {
            Ok(()) => {
                working.last_completed = Some(stage);
                working.stage = stage.next().unwrap_or(Stage::Done);
                working.status = if working.stage == Stage::Done {
                    RunStatus::Completed
                } else {
                    RunStatus::AwaitingApproval
                };
                tracing::info!(
                    event = "snowwise.stage.completed",
                    run_id = id.0,
                    stage = %stage,
                    next = %working.stage,
                    duration_ms = started.elapsed().as_millis() as u64
                );

                if slot.cancel.load(Ordering::SeqCst) && !working.is_finished() {
                    working.fail("cancelled".into());
                    tracing::info!(event = "snowwise.run.cancelled", run_id = id.0, after = %stage);
                    Err(WorkflowError::Cancelled(id))
                } else {
                    Ok(working.clone())
                }
            }
            Err(e) => {
                tracing::error!(
                    event = "snowwise.stage.failed",
                    run_id = id.0,
                    stage = %stage,
                    error = %e
                );
                working.fail(e.to_string());
                Err(e)
            }
        };
        slot.run = working;
        drop(runs);
        outcome
    }

    /// Re-executes the stage the caller is currently reviewing. DISCOVER is
    /// never re-run: it would replace the candidate set.
    pub async fn retry_stage(&self, id: RunId) -> Result<OptimizationRun, WorkflowError> {
        {
            let mut runs = self.registry()?;
            let slot = runs.get_mut(&id).ok_or(WorkflowError::RunNotFound(id))?;
            if slot.run.is_finished() {
                return Err(WorkflowError::RunFinished(id));
            }
            if slot.busy {
                return Err(WorkflowError::RunBusy(id));
            }
            match slot.run.last_completed {
                Some(s @ (Stage::Analyze | Stage::Propose | Stage::Validate))
                    if slot.run.status == RunStatus::AwaitingApproval =>
                {
                    slot.run.stage = s;
                }
                other => {
                    return Err(WorkflowError::RetryNotAllowed {
                        run_id: id,
                        stage: other.unwrap_or(slot.run.stage),
                    })
                }
            }
        }
        tracing::info!(event = "snowwise.stage.retry", run_id = id.0);
        self.advance(id).await
    }

    /// Idle runs fail immediately. A run mid-stage finishes that stage and
    /// then fails; no further stage is entered.
    pub fn cancel(&self, id: RunId) -> Result<(), WorkflowError> {
        let mut runs = self.registry()?;
        let slot = runs.get_mut(&id).ok_or(WorkflowError::RunNotFound(id))?;
        if slot.run.is_finished() {
            return Err(WorkflowError::RunFinished(id));
        }
        slot.cancel.store(true, Ordering::SeqCst);
        if !slot.busy {
            slot.run.fail("cancelled".into());
        }
        tracing::info!(event = "snowwise.run.cancel_requested", run_id = id.0, busy = slot.busy);
        Ok(())
    }

    /// The SUMMARIZE report once the run is done; a partial report built from
    /// the current state otherwise.
    pub fn report(&self, id: RunId) -> Result<RunReport, WorkflowError> {
        let runs = self.registry()?;
        let slot = runs.get(&id).ok_or(WorkflowError::RunNotFound(id))?;
        Ok(slot
            .run
            .report
            .clone()
            .unwrap_or_else(|| RunReport::build(&slot.run)))
    }

    pub fn discard(&self, id: RunId) -> Result<OptimizationRun, WorkflowError> {
        let mut runs = self.registry()?;
        match runs.get(&id) {
            None => return Err(WorkflowError::RunNotFound(id)),
            Some(slot) if slot.busy => return Err(WorkflowError::RunBusy(id)),
            Some(_) => {}
        }
        runs.remove(&id)
            .map(|slot| slot.run)
            .ok_or(WorkflowError::RunNotFound(id))
    }

    pub fn active_runs(&self) -> Result<Vec<RunId>, WorkflowError> {
        let mut ids: Vec<RunId> = self.registry()?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

use super::exit_codes;
use crate::cli::args::RunArgs;
use snowwise_core::config::{
    load_config, CompletionProvider, SnowwiseConfig, WarehouseProvider, WorkflowSettings,
};
use snowwise_core::engine::{Engine, EngineParts, RunRequest};
use snowwise_core::errors::WorkflowError;
use snowwise_core::model::{DateRange, ExpenseMetric, OptimizationRun, RunId, RunStatus, Stage};
use snowwise_core::providers::llm::cortex::CortexClient;
use snowwise_core::providers::llm::fake::{EchoCompletion, ScriptedCompletion};
use snowwise_core::providers::llm::openai::OpenAIClient;
use snowwise_core::providers::llm::CompletionClient;
use snowwise_core::providers::warehouse::fixture::{FixtureData, FixtureGateway};
use snowwise_core::providers::warehouse::pool::GatewayPool;
use snowwise_core::providers::warehouse::snowflake::{SnowflakeGateway, SnowflakeSettings};
use snowwise_core::providers::warehouse::WarehouseGateway;
use snowwise_core::report;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

/// `queries` replaces history discovery when non-empty.
pub async fn cmd_run(args: RunArgs, queries: Vec<String>) -> anyhow::Result<i32> {
    let cfg = match load_config(&args.config, args.strict) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let metric = match args.metric.as_deref().map(ExpenseMetric::parse) {
        None => None,
        Some(Some(m)) => Some(m),
        Some(None) => {
            eprintln!("config error: unknown metric {:?} (execution_time|bytes_scanned)", args.metric);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let settings = WorkflowSettings::from(&cfg.settings);
    let engine = match build_engine(&cfg, settings) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("config error: {:#}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let mut request = RunRequest::new(args.request.clone()).with_queries(queries);
    if let Some(days) = args.days {
        request = request.with_date_range(DateRange::last_days(days.max(1)));
    }
    if let Some(m) = metric {
        request = request.with_metric(m);
    }

    let id = match engine.start_run(request) {
        Ok(id) => id,
        Err(e @ WorkflowError::InvalidRequest(_)) => {
            eprintln!("{}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
        Err(e) => return Err(e.into()),
    };
    let run = drive(&engine, id, args.yes, args.verbose).await?;

    let summary = engine.report(id)?;
    engine.discard(id)?;

    report::console::print_summary(&summary, args.verbose);
    if let Some(out) = &args.out {
        report::json::write_json(&summary, out)?;
        eprintln!("wrote {}", out.display());
    }

    match run.status {
        RunStatus::Completed => Ok(exit_codes::OK),
        _ => {
            if let Some(f) = &run.failure {
                eprintln!("run failed: {}", f);
            }
            Ok(exit_codes::RUN_FAILED)
        }
    }
}

/// Advances the run stage by stage, asking before each one unless `auto`.
async fn drive(engine: &Engine, id: RunId, auto: bool, verbose: bool) -> anyhow::Result<OptimizationRun> {
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    loop {
        let state = engine.get_run_state(id)?;
        if state.is_finished() {
            return Ok(state);
        }

        if !auto && state.status == RunStatus::AwaitingApproval {
            print_stage(&state, verbose);
            eprint!("Proceed to {}? [y]es / [r]etry / [N]o: ", state.stage);
            std::io::stderr().flush()?;
            let mut line = String::new();
            stdin.read_line(&mut line).await?;
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => {}
                "r" | "retry" => {
                    if let Err(e) = engine.retry_stage(id).await {
                        eprintln!("⚠️  {}", e);
                    }
                    continue;
                }
                _ => {
                    engine.cancel(id)?;
                    eprintln!("stopped before {}", state.stage);
                    continue;
                }
            }
        }

        if let Err(e) = engine.advance(id).await {
            eprintln!("❌ {}", e);
        }
    }
}

fn print_stage(run: &OptimizationRun, verbose: bool) {
    let Some(done) = run.last_completed else {
        return;
    };
    eprintln!("\n== {} finished ({} candidates)", done, run.candidates.len());
    for c in &run.candidates {
        let detail = match done {
            Stage::Discover => format!(
                "{} ms, {} bytes",
                c.metrics.execution_time_ms, c.metrics.bytes_scanned
            ),
            Stage::Analyze => {
                let failed = c.issues_in(Stage::Analyze).count();
                if failed == 0 {
                    format!("{} table(s)", c.schemas.len())
                } else {
                    format!("{} table(s), {} issue(s)", c.schemas.len(), failed)
                }
            }
            Stage::Propose => match c.optimized_text() {
                Some(_) => "rewrite proposed".to_string(),
                None => "no proposal".to_string(),
            },
            Stage::Validate => format!("{:?}", c.verdict()).to_lowercase(),
            _ => String::new(),
        };
        eprintln!("  #{:<2} {:<24} {}", c.index, c.query_id, detail);
        if verbose {
            if let (Stage::Propose, Some(sql)) = (done, c.optimized_text()) {
                eprintln!("      {}", sql);
            }
            for issue in c.issues_in(done) {
                eprintln!("      ! {}", issue.message);
            }
        }
    }
}

fn build_engine(cfg: &SnowwiseConfig, settings: WorkflowSettings) -> anyhow::Result<Engine> {
    let pool = build_pool(cfg, &settings)?;
    let completion = build_completion(cfg, pool.clone())?;
    tracing::info!(
        event = "snowwise.engine.ready",
        warehouse = pool.size(),
        completion = completion.provider_name(),
        parallel = settings.parallel
    );
    Ok(Engine::new(EngineParts::new(pool, completion).with_settings(settings)))
}

fn build_pool(cfg: &SnowwiseConfig, settings: &WorkflowSettings) -> anyhow::Result<Arc<GatewayPool>> {
    let w = &cfg.warehouse;
    let gateway: Arc<dyn WarehouseGateway> = match w.provider {
        WarehouseProvider::Fixture => {
            let path = w
                .fixture
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("warehouse.fixture is not set"))?;
            Arc::new(FixtureGateway::new(FixtureData::from_path(path)?))
        }
        WarehouseProvider::Snowflake => {
            let token = std::env::var(&w.token_env)
                .map_err(|_| anyhow::anyhow!("environment variable {} is not set", w.token_env))?;
            let base_url = w
                .base_url
                .clone()
                .or_else(|| w.account.as_deref().map(SnowflakeGateway::account_url))
                .ok_or_else(|| anyhow::anyhow!("warehouse.account is not set"))?;
            Arc::new(SnowflakeGateway::new(SnowflakeSettings {
                base_url,
                token,
                token_type: w.token_type.clone(),
                warehouse: w.warehouse.clone(),
                role: w.role.clone(),
                database: w.database.clone(),
                schema: w.schema.clone(),
                statement_timeout_secs: settings.timeout.as_secs(),
                poll_interval: Duration::from_millis(500),
            }))
        }
    };
    Ok(GatewayPool::shared(gateway, w.pool_size))
}

fn build_completion(cfg: &SnowwiseConfig, pool: Arc<GatewayPool>) -> anyhow::Result<Arc<dyn CompletionClient>> {
    let c = &cfg.completion;
    let model = c.model_or_default();
    Ok(match c.provider {
        CompletionProvider::Cortex => Arc::new(CortexClient::new(pool, model, c.temperature, c.max_tokens)),
        CompletionProvider::Openai => {
            let key = std::env::var(&c.api_key_env)
                .map_err(|_| anyhow::anyhow!("environment variable {} is not set", c.api_key_env))?;
            Arc::new(OpenAIClient::new(model, key, c.temperature, c.max_tokens))
        }
        CompletionProvider::Fixture => {
            let path = c
                .fixture
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("completion.fixture is not set"))?;
            Arc::new(ScriptedCompletion::from_path(path)?)
        }
        CompletionProvider::Echo => Arc::new(EchoCompletion),
    })
}

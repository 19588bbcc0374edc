use crate::compare::{Backoff, RetryPolicy};
use crate::errors::ConfigError;
use crate::model::{ExpenseMetric, MAX_CANDIDATES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowwiseConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub settings: Settings,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseProvider {
    Snowflake,
    Fixture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub provider: WarehouseProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Overrides the URL derived from `account`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Name of the environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture: Option<PathBuf>,
}

fn default_token_env() -> String {
    "SNOWFLAKE_TOKEN".into()
}

fn default_token_type() -> String {
    "OAUTH".into()
}

fn default_pool_size() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionProvider {
    #[default]
    Cortex,
    Openai,
    Fixture,
    Echo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub provider: CompletionProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture: Option<PathBuf>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: CompletionProvider::default(),
            model: None,
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            api_key_env: default_api_key_env(),
            fixture: None,
        }
    }
}

impl CompletionConfig {
    pub fn model_or_default(&self) -> String {
        self.model.clone().unwrap_or_else(|| {
            match self.provider {
                CompletionProvider::Cortex => "snowflake-arctic",
                CompletionProvider::Openai => "gpt-4o-mini",
                CompletionProvider::Fixture => "scripted",
                CompletionProvider::Echo => "echo",
            }
            .to_string()
        })
    }
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookback_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expense_metric: Option<ExpenseMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_poll: Option<HistoryPollSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryPollSettings {
    pub attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub backoff: Option<Backoff>,
    pub max_delay_ms: Option<u64>,
}

/// Resolved knobs the workflow engine runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSettings {
    pub parallel: usize,
    pub timeout: Duration,
    pub lookback_days: u32,
    pub top_n: usize,
    pub expense_metric: ExpenseMetric,
    pub history_poll: RetryPolicy,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for WorkflowSettings {
    fn from(s: &Settings) -> Self {
        let defaults = RetryPolicy::default();
        let poll = s.history_poll.clone().unwrap_or_default();
        Self {
            parallel: s.parallel.unwrap_or(4).max(1),
            timeout: Duration::from_secs(s.timeout_seconds.unwrap_or(120).max(1)),
            lookback_days: s.lookback_days.unwrap_or(7).max(1),
            top_n: s.top_n.unwrap_or(MAX_CANDIDATES).clamp(1, MAX_CANDIDATES),
            expense_metric: s.expense_metric.unwrap_or_default(),
            history_poll: RetryPolicy {
                attempts: poll.attempts.unwrap_or(defaults.attempts).max(1),
                initial_delay: poll
                    .initial_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.initial_delay),
                backoff: poll.backoff.unwrap_or(defaults.backoff),
                max_delay: poll
                    .max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_delay),
            },
        }
    }
}

pub fn load_config(path: &Path, strict: bool) -> Result<SnowwiseConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;

    let mut ignored_keys = std::collections::BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(&raw);
    let mut cfg: SnowwiseConfig = serde_ignored::deserialize(deserializer, |p| {
        ignored_keys.insert(p.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    let meaningful: Vec<_> = ignored_keys
        .iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();
    if !meaningful.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "Unknown fields detected in strict mode: {:?} (file: {})",
                meaningful,
                path.display()
            )));
        }
        tracing::warn!(
            event = "snowwise.config.unknown_fields",
            fields = ?meaningful,
            file = %path.display(),
            "ignoring unknown config fields"
        );
    }

    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }

    validate(&cfg)?;
    normalize_paths(&mut cfg, path);
    Ok(cfg)
}

fn validate(cfg: &SnowwiseConfig) -> Result<(), ConfigError> {
    let w = &cfg.warehouse;
    match w.provider {
        WarehouseProvider::Snowflake if w.account.is_none() && w.base_url.is_none() => {
            return Err(ConfigError(
                "warehouse.account (or warehouse.base_url) is required for provider snowflake".into(),
            ));
        }
        WarehouseProvider::Fixture if w.fixture.is_none() => {
            return Err(ConfigError(
                "warehouse.fixture is required for provider fixture".into(),
            ));
        }
        _ => {}
    }
    if w.pool_size == 0 {
        return Err(ConfigError("warehouse.pool_size must be at least 1".into()));
    }
    if cfg.completion.provider == CompletionProvider::Fixture && cfg.completion.fixture.is_none() {
        return Err(ConfigError(
            "completion.fixture is required for provider fixture".into(),
        ));
    }
    if let Some(n) = cfg.settings.top_n {
        if n == 0 || n > MAX_CANDIDATES {
            return Err(ConfigError(format!(
                "settings.top_n must be between 1 and {}",
                MAX_CANDIDATES
            )));
        }
    }
    Ok(())
}

/// Fixture paths are relative to the config file.
fn normalize_paths(cfg: &mut SnowwiseConfig, config_path: &Path) {
    let base = config_path.parent().unwrap_or(Path::new("."));
    for p in [&mut cfg.warehouse.fixture, &mut cfg.completion.fixture]
        .into_iter()
        .flatten()
    {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    }
}

pub const SAMPLE_CONFIG: &str = r#"version: 1
warehouse:
  # snowflake | fixture
  provider: fixture
  fixture: snowwise.fixture.yaml
  # provider: snowflake
  # account: myorg-myaccount
  # warehouse: COMPUTE_WH
  # role: ACCOUNTADMIN
  # token_env: SNOWFLAKE_TOKEN
  pool_size: 4
completion:
  # cortex | openai | fixture | echo
  provider: echo
settings:
  parallel: 4
  timeout_seconds: 120
  lookback_days: 7
  top_n: 20
  expense_metric: execution_time
  history_poll:
    attempts: 6
    initial_delay_ms: 500
    backoff: exponential
    max_delay_ms: 30000
"#;

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(path, SAMPLE_CONFIG)
        .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, body: &str) -> PathBuf {
        let p = dir.join("snowwise.yaml");
        let mut f = std::fs::File::create(&p).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        p
    }

    #[test]
    fn sample_config_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("snowwise.yaml");
        write_sample_config(&p).unwrap();
        let cfg = load_config(&p, true).unwrap();
        assert_eq!(cfg.warehouse.provider, WarehouseProvider::Fixture);
        assert_eq!(
            cfg.warehouse.fixture.as_deref(),
            Some(dir.path().join("snowwise.fixture.yaml").as_path())
        );
        let s = WorkflowSettings::from(&cfg.settings);
        assert_eq!(s.top_n, 20);
        assert_eq!(s.lookback_days, 7);
        assert_eq!(s.history_poll.attempts, 6);
        assert_eq!(s.history_poll.backoff, Backoff::Exponential);
    }

    #[test]
    fn unknown_fields_fail_in_strict_mode_only() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(
            dir.path(),
            "version: 1\nwarehouse: { provider: fixture, fixture: f.yaml }\nsetings: {}\n",
        );
        let err = load_config(&p, true).unwrap_err();
        assert!(err.0.contains("setings"), "{}", err.0);
        assert!(load_config(&p, false).is_ok());
    }

    #[test]
    fn snowflake_requires_account() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "version: 1\nwarehouse: { provider: snowflake }\n");
        assert!(load_config(&p, false).unwrap_err().0.contains("account"));
    }

    #[test]
    fn top_n_cannot_exceed_twenty() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(
            dir.path(),
            "version: 1\nwarehouse: { provider: fixture, fixture: f.yaml }\nsettings: { top_n: 50 }\n",
        );
        assert!(load_config(&p, false).is_err());
    }

    #[test]
    fn unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "version: 2\nwarehouse: { provider: fixture, fixture: f.yaml }\n");
        assert!(load_config(&p, false).unwrap_err().0.contains("unsupported config version"));
    }

    #[test]
    fn completion_model_defaults_per_provider() {
        let mut c = CompletionConfig::default();
        assert_eq!(c.model_or_default(), "snowflake-arctic");
        c.provider = CompletionProvider::Openai;
        assert_eq!(c.model_or_default(), "gpt-4o-mini");
        c.model = Some("gpt-4.1".into());
        assert_eq!(c.model_or_default(), "gpt-4.1");
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Analysis;
use crate::error::AnnotatorError;

pub const DEFAULT_CONFIG_FILE: &str = "genomic-annotator.json";
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 250;
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 8_000;
pub const DEFAULT_NONE_TASK_MAX_DELAY_MS: u64 = 1_000;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub none_task_max_delay_ms: Option<u64>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub scheduler: SchedulerSettings,
    pub http: HttpSettings,
    pub none_task_max_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_retry_delay: Duration::from_millis(DEFAULT_MAX_RETRY_DELAY_MS),
        }
    }
}

impl SchedulerSettings {
    /// Back-off before the `attempt`-th retry: doubles per attempt, capped.
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout: Option<Duration>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout: None,
        }
    }
}

pub fn default_user_agent() -> String {
    format!("genomic-annotator/{}", env!("CARGO_PKG_VERSION"))
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the settings file. Without an explicit path a missing
    /// `genomic-annotator.json` falls back to defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AnnotatorError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !config_path.exists() {
            if path.is_some() {
                return Err(AnnotatorError::MissingConfig(config_path));
            }
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AnnotatorError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| AnnotatorError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, AnnotatorError> {
        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(AnnotatorError::InvalidSetting {
                name: "workers".to_string(),
                message: "at least one worker is required".to_string(),
            });
        }

        let retry_delay =
            Duration::from_millis(config.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS));
        let max_retry_delay = Duration::from_millis(
            config
                .max_retry_delay_ms
                .unwrap_or(DEFAULT_MAX_RETRY_DELAY_MS),
        );
        if max_retry_delay < retry_delay {
            return Err(AnnotatorError::InvalidSetting {
                name: "max_retry_delay_ms".to_string(),
                message: "must not be smaller than retry_delay_ms".to_string(),
            });
        }

        let user_agent = config
            .user_agent
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(default_user_agent);

        Ok(ResolvedConfig {
            scheduler: SchedulerSettings {
                workers,
                max_retries: config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                retry_delay,
                max_retry_delay,
            },
            http: HttpSettings {
                user_agent,
                timeout: config.http_timeout_secs.map(Duration::from_secs),
            },
            none_task_max_delay: Duration::from_millis(
                config
                    .none_task_max_delay_ms
                    .unwrap_or(DEFAULT_NONE_TASK_MAX_DELAY_MS),
            ),
        })
    }
}

pub struct AnalysisLoader;

impl AnalysisLoader {
    pub fn load(path: &Path) -> Result<Analysis, AnnotatorError> {
        let content = fs::read_to_string(path)
            .map_err(|_| AnnotatorError::AnalysisRead(path.to_path_buf()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Analysis, AnnotatorError> {
        let analysis: Analysis = serde_json::from_str(content)
            .map_err(|err| AnnotatorError::AnalysisParse(err.to_string()))?;
        if analysis.name.trim().is_empty() {
            return Err(AnnotatorError::AnalysisParse(
                "analysis name must not be empty".to_string(),
            ));
        }
        Ok(analysis)
    }
}

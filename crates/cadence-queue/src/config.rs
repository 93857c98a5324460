//! Environment configuration
//!
//! Global knobs:
//! - `CADENCE_KINDS`: comma-separated job kinds (e.g. `watchlist,metadata_refresh`)
//! - `CADENCE_WORKERS_DISABLED`: disable every worker (default `false`)
//! - `CADENCE_SHUTDOWN_GRACE_SECS` (30), `CADENCE_REAP_INTERVAL_SECS` (15)
//! - `CADENCE_DLQ_PAGE_SIZE` (25), `CADENCE_DLQ_MAX_PAGE_SIZE` (100),
//!   `CADENCE_DLQ_REQUEUE_LIMIT` (500), `CADENCE_DLQ_PURGE_LIMIT` (1000)
//!
//! Per kind, with `<KIND>` upper-cased and non-alphanumerics mapped to `_`:
//! `CADENCE_<KIND>_BATCH_SIZE`, `_VISIBILITY_TIMEOUT_SECS`, `_POLL_INTERVAL_MS`,
//! `_BASE_DELAY_SECS`, `_MAX_DELAY_SECS`, `_JITTER_PCT`, `_RETRY_BUDGET`, `_ENABLED`.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::dlq::DlqConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::retry::{PolicyRegistry, RetryPolicy};
use crate::worker::WorkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Worker and retry settings for one job kind
#[derive(Debug, Clone)]
pub struct KindConfig {
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub enabled: bool,
}

impl KindConfig {
    pub fn new(kind: &str) -> Self {
        Self {
            worker: WorkerConfig::new(kind),
            retry: RetryPolicy::default(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    pub orchestrator: OrchestratorConfig,
    pub dlq: DlqConfig,
    pub kinds: BTreeMap<String, KindConfig>,
}

impl QueueConfig {
    /// Load from process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let orchestrator = OrchestratorConfig {
            workers_disabled: env.flag("CADENCE_WORKERS_DISABLED", false)?,
            shutdown_grace: Duration::from_secs(env.parse("CADENCE_SHUTDOWN_GRACE_SECS", 30)?),
            reap_interval: Duration::from_secs(
                env.positive("CADENCE_REAP_INTERVAL_SECS", 15)?,
            ),
        };

        let dlq = DlqConfig {
            default_page_size: env.positive("CADENCE_DLQ_PAGE_SIZE", 25)?,
            max_page_size: env.positive("CADENCE_DLQ_MAX_PAGE_SIZE", 100)?,
            requeue_limit: env.positive("CADENCE_DLQ_REQUEUE_LIMIT", 500)?,
            purge_limit: env.positive("CADENCE_DLQ_PURGE_LIMIT", 1000)?,
        };
        if dlq.default_page_size > dlq.max_page_size {
            return Err(ConfigError::Invalid {
                var: "CADENCE_DLQ_PAGE_SIZE".into(),
                reason: "exceeds CADENCE_DLQ_MAX_PAGE_SIZE".into(),
            });
        }

        let mut kinds = BTreeMap::new();
        if let Some(list) = lookup("CADENCE_KINDS") {
            for kind in list.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                kinds.insert(kind.to_string(), env.kind(kind)?);
            }
        }

        Ok(Self {
            orchestrator,
            dlq,
            kinds,
        })
    }

    pub fn with_kind(mut self, kind: KindConfig) -> Self {
        self.kinds.insert(kind.worker.kind.clone(), kind);
        self
    }

    /// Retry policies for every configured kind
    pub fn policies(&self) -> PolicyRegistry {
        let mut registry = PolicyRegistry::default();
        for (kind, cfg) in &self.kinds {
            registry.insert(kind.clone(), cfg.retry);
        }
        registry
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, var: &str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(var) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: var.to_string(),
                reason: format!("cannot parse '{}'", raw),
            }),
        }
    }

    fn positive<T: FromStr + PartialOrd + Default>(&self, var: &str, default: T) -> Result<T, ConfigError> {
        let value = self.parse(var, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                var: var.to_string(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }

    fn flag(&self, var: &str, default: bool) -> Result<bool, ConfigError> {
        match (self.lookup)(var).map(|v| v.trim().to_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var: var.to_string(),
                    reason: format!("expected a boolean, got '{}'", v),
                }),
            },
        }
    }

    fn kind(&self, kind: &str) -> Result<KindConfig, ConfigError> {
        let prefix = format!("CADENCE_{}", env_key(kind));
        let var = |suffix: &str| format!("{}_{}", prefix, suffix);
        let defaults = KindConfig::new(kind);

        let jitter_var = var("JITTER_PCT");
        let jitter_pct: f64 = self.parse(&jitter_var, defaults.retry.jitter_pct)?;
        if !(0.0..=1.0).contains(&jitter_pct) {
            return Err(ConfigError::Invalid {
                var: jitter_var,
                reason: "must be within [0, 1]".into(),
            });
        }

        let base_delay = Duration::from_secs(self.parse(&var("BASE_DELAY_SECS"), 30)?);
        let max_delay = Duration::from_secs(self.parse(&var("MAX_DELAY_SECS"), 3600)?);

        Ok(KindConfig {
            worker: WorkerConfig {
                batch_size: self.positive(&var("BATCH_SIZE"), defaults.worker.batch_size)?,
                visibility_timeout: Duration::from_secs(
                    self.positive(&var("VISIBILITY_TIMEOUT_SECS"), 300)?,
                ),
                poll_interval: Duration::from_millis(self.positive(&var("POLL_INTERVAL_MS"), 1000)?),
                ..defaults.worker
            },
            retry: RetryPolicy {
                base_delay,
                max_delay: max_delay.max(base_delay),
                jitter_pct,
                budget: self.positive(&var("RETRY_BUDGET"), defaults.retry.budget)?,
            },
            enabled: self.flag(&var("ENABLED"), true)?,
        })
    }
}

fn env_key(kind: &str) -> String {
    kind.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration, read from the environment with defaults that
/// match a local single-node deployment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub snapshot_path: PathBuf,
    pub model_cache_path: PathBuf,
    pub refresh_interval: Duration,
    pub eviction_grace: Duration,
    pub rpc_timeout: Duration,
    pub dwell_baseline_seconds: f64,
    pub training_window_days: u64,
    pub trainer_workers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            snapshot_path: PathBuf::from("cache/journeys.bin.zlib"),
            model_cache_path: PathBuf::from("cache/lt-link-travel-time"),
            refresh_interval: Duration::from_secs(60),
            eviction_grace: Duration::from_secs(15 * 60),
            rpc_timeout: Duration::from_secs(5),
            dwell_baseline_seconds: 0.0,
            training_window_days: 21,
            trainer_workers: 2,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> AppConfig {
        let defaults = AppConfig::default();
        AppConfig {
            snapshot_path: env_var("JOURNEYCAST_SNAPSHOT_PATH", defaults.snapshot_path),
            model_cache_path: env_var("JOURNEYCAST_MODEL_CACHE_PATH", defaults.model_cache_path),
            refresh_interval: Duration::from_secs(env_var(
                "JOURNEYCAST_REFRESH_INTERVAL_SECONDS",
                defaults.refresh_interval.as_secs(),
            )),
            eviction_grace: Duration::from_secs(env_var(
                "JOURNEYCAST_EVICTION_GRACE_SECONDS",
                defaults.eviction_grace.as_secs(),
            )),
            rpc_timeout: Duration::from_secs(env_var(
                "JOURNEYCAST_RPC_TIMEOUT_SECONDS",
                defaults.rpc_timeout.as_secs(),
            )),
            dwell_baseline_seconds: env_var(
                "JOURNEYCAST_DWELL_BASELINE_SECONDS",
                defaults.dwell_baseline_seconds,
            ),
            training_window_days: env_var(
                "JOURNEYCAST_TRAINING_WINDOW_DAYS",
                defaults.training_window_days,
            ),
            trainer_workers: env_var("JOURNEYCAST_TRAINER_WORKERS", defaults.trainer_workers),
        }
    }
}

fn env_var<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub log_level: String,
    pub backend_url: String,
    pub backend_timeout: Duration,
    pub worker_concurrency: usize,
    pub worker_poll_interval: Duration,
    pub task_lease: Duration,
    pub sweep_cron: String,
    pub poll_interval: Duration,
    pub poll_max_retries: u32,
    pub event_queue_per_entity: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            db_path: PathBuf::from(
                std::env::var("DATABASE_PATH").unwrap_or_else(|_| "data/conductor.db".into()),
            ),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            backend_url: std::env::var("BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:8774".into()),
            backend_timeout: Duration::from_secs(env_or("BACKEND_TIMEOUT_SECS", 60)),
            worker_concurrency: env_or("WORKER_CONCURRENCY", 4),
            worker_poll_interval: Duration::from_millis(env_or("WORKER_POLL_MS", 500)),
            task_lease: Duration::from_secs(env_or("TASK_LEASE_SECS", 300)),
            sweep_cron: std::env::var("SWEEP_CRON").unwrap_or_else(|_| "0 * * * * *".into()),
            poll_interval: Duration::from_secs(env_or("POLL_INTERVAL_SECS", 30)),
            poll_max_retries: env_or("POLL_MAX_RETRIES", 40),
            event_queue_per_entity: env_or("EVENT_QUEUE_PER_ENTITY", 100),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/conductor.db"),
            log_level: "info".into(),
            backend_url: "http://localhost:8774".into(),
            backend_timeout: Duration::from_secs(60),
            worker_concurrency: 4,
            worker_poll_interval: Duration::from_millis(500),
            task_lease: Duration::from_secs(300),
            sweep_cron: "0 * * * * *".into(),
            poll_interval: Duration::from_secs(30),
            poll_max_retries: 40,
            event_queue_per_entity: 100,
        }
    }
}

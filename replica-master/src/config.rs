use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Every subdirectory is one served index
    pub indexes_dir: PathBuf,
    /// Idle time after which a session is dropped
    pub session_ttl: Duration,
    /// How often idle sessions are looked for
    pub session_sweep: Duration,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: env_parse("PORT").unwrap_or(9400),
            indexes_dir: PathBuf::from(
                std::env::var("INDEXES_DIR")
                    .unwrap_or_else(|_| "/var/lib/replica-master/indexes".into()),
            ),
            session_ttl: Duration::from_secs(env_parse("SESSION_TTL_SECS").unwrap_or(600)),
            session_sweep: Duration::from_secs(
                env_parse("SESSION_SWEEP_SECS").unwrap_or(60).max(1),
            ),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

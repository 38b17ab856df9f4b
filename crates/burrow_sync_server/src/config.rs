use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Database file path (default: ./burrow.db)
    pub database_path: PathBuf,
    /// Data root holding `vaults/` and `backups/` (default: ./data)
    pub data_root: PathBuf,
    /// Interval between autosave flushes of dirty vaults (default: 10s)
    pub autosave_interval: Duration,
    /// Quiescence window before a changed file is written to disk (default: 200ms)
    pub file_debounce: Duration,
    /// Interval between backup runs (default: 60min)
    pub backup_interval: Duration,
    /// How long a connection may stay unauthenticated (default: 10s)
    pub auth_timeout: Duration,
    /// Delay between the join-sequence frames (default: 50ms)
    pub join_pacing: Duration,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path =
            PathBuf::from(env::var("DATABASE_PATH").unwrap_or_else(|_| "./burrow.db".to_string()));
        let data_root =
            PathBuf::from(env::var("DATA_ROOT").unwrap_or_else(|_| "./data".to_string()));

        let autosave_interval = Duration::from_secs(
            env::var("AUTOSAVE_INTERVAL_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
        );

        let file_debounce = Duration::from_millis(
            env::var("FILE_DEBOUNCE_MS")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .unwrap_or(200),
        );

        let backup_interval = Duration::from_secs(
            env::var("BACKUP_INTERVAL_MINS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .unwrap_or(60)
                * 60,
        );

        let auth_timeout = Duration::from_secs(
            env::var("AUTH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
        );

        let join_pacing = Duration::from_millis(
            env::var("JOIN_PACING_MS")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .unwrap_or(50),
        );

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5174".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            database_path,
            data_root,
            autosave_interval,
            file_debounce,
            backup_interval,
            auth_timeout,
            join_pacing,
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Directory holding the live vaults.
    pub fn vaults_dir(&self) -> PathBuf {
        self.data_root.join("vaults")
    }

    /// Directory holding backup snapshots.
    pub fn backups_dir(&self) -> PathBuf {
        self.data_root.join("backups")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_dirs() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 4000,
            database_path: "./x.db".into(),
            data_root: "/srv/burrow".into(),
            autosave_interval: Duration::from_secs(10),
            file_debounce: Duration::from_millis(200),
            backup_interval: Duration::from_secs(3600),
            auth_timeout: Duration::from_secs(10),
            join_pacing: Duration::from_millis(50),
            cors_origins: vec![],
        };
        assert_eq!(config.server_addr(), "127.0.0.1:4000");
        assert_eq!(config.vaults_dir(), PathBuf::from("/srv/burrow/vaults"));
        assert_eq!(config.backups_dir(), PathBuf::from("/srv/burrow/backups"));
    }
}

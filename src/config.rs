// Runtime configuration from environment variables

use std::path::PathBuf;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Listen address for the HTTP server
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            database_path: std::env::var("DUES_DB")
                .unwrap_or_else(|_| "dues.db".to_string())
                .into(),
            bind_addr: std::env::var("DUES_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
        }
    }
}

/// Initialize logging. RUST_LOG overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_when_env_is_unset() {
        std::env::remove_var("DUES_DB");
        std::env::remove_var("DUES_BIND_ADDR");

        let config = Config::from_env();
        assert_eq!(config.database_path, PathBuf::from("dues.db"));
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
    }
}

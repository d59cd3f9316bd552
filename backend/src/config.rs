use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::db::DEFAULT_MAX_POOL_SIZE;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub cors_allowed_origin: Option<String>,
    pub uploads_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map(|value| sqlite_path(&value))
            .unwrap_or_else(|_| "spends_tracker.db".to_string());
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3031".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let uploads_dir = env::var("UPLOADS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("uploads"));
        let max_upload_bytes = match env::var("MAX_UPLOAD_BYTES") {
            Ok(value) => value
                .parse()
                .context("MAX_UPLOAD_BYTES must be a positive integer")?,
            Err(_) => DEFAULT_MAX_UPLOAD_BYTES,
        };
        anyhow::ensure!(max_upload_bytes > 0, "MAX_UPLOAD_BYTES must be greater than zero");

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            cors_allowed_origin,
            uploads_dir,
            max_upload_bytes,
        })
    }
}

/// Accepts either a bare file path or a `sqlite:` URL and returns the path
/// diesel expects.
fn sqlite_path(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .unwrap_or(trimmed);
    without_scheme.to_string()
}

#[cfg(test)]
mod tests {
    use super::sqlite_path;

    #[test]
    fn strips_sqlite_url_scheme() {
        assert_eq!(sqlite_path("sqlite://./spends.db"), "./spends.db");
        assert_eq!(sqlite_path("sqlite:spends.db"), "spends.db");
    }

    #[test]
    fn keeps_plain_paths() {
        assert_eq!(sqlite_path("/var/lib/spends.db"), "/var/lib/spends.db");
        assert_eq!(sqlite_path(" data.db "), "data.db");
    }
}

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1MB

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub tracker_url: String,
    pub chunk_size: usize,
    pub chunk_dir: String,
    pub request_timeout: Duration,
    pub announce_concurrency: usize,
    pub fetch_concurrency: usize,
    pub per_peer_concurrency: usize,
    pub announce_downloads: bool,
    pub peer_ttl: Option<Duration>,
    pub prometheus_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://tracker.db".to_string(),
            tracker_url: "http://localhost:5000".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_dir: "chunks".to_string(),
            request_timeout: Duration::from_secs(10),
            announce_concurrency: 8,
            fetch_concurrency: 4,
            per_peer_concurrency: 2,
            announce_downloads: true,
            peer_ttl: None,
            prometheus_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let defaults = Config::default();

        let config = Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            tracker_url: env::var("TRACKER_URL").unwrap_or(defaults.tracker_url),
            chunk_size: parse_var("CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
            chunk_dir: env::var("CHUNK_DIR").unwrap_or(defaults.chunk_dir),
            request_timeout: parse_var("REQUEST_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            announce_concurrency: parse_var("ANNOUNCE_CONCURRENCY")?
                .unwrap_or(defaults.announce_concurrency),
            fetch_concurrency: parse_var("FETCH_CONCURRENCY")?.unwrap_or(defaults.fetch_concurrency),
            per_peer_concurrency: parse_var("PER_PEER_CONCURRENCY")?
                .unwrap_or(defaults.per_peer_concurrency),
            announce_downloads: parse_var("ANNOUNCE_DOWNLOADS")?
                .unwrap_or(defaults.announce_downloads),
            peer_ttl: parse_var("PEER_TTL_SECS")?.map(Duration::from_secs),
            prometheus_port: parse_var("PROMETHEUS_PORT")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("CHUNK_SIZE must be greater than zero");
        }
        if self.announce_concurrency == 0 || self.fetch_concurrency == 0 || self.per_peer_concurrency == 0 {
            anyhow::bail!("concurrency limits must be greater than zero");
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {}: {:?}", key, raw))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.chunk_size, 1024 * 1024);
        assert!(cfg.peer_ttl.is_none());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let cfg = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}

//! Configuration management

use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// How long uploaded chunks survive without being finalized
    pub chunk_ttl: Duration,

    /// Operations per bulk-write batch
    pub bulk_batch_size: usize,

    /// Concurrent batches per wave
    pub bulk_parallelism: usize,

    /// Per-batch write deadline
    pub bulk_batch_timeout: Duration,

    /// Minimum interval between progress writes to the job record
    pub progress_write_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let nats_url =
            std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let chunk_ttl = Duration::from_secs(parse_var("CHUNK_TTL_SECS", 3600)?);
        let bulk_batch_size = parse_var("BULK_BATCH_SIZE", 100)?;
        let bulk_parallelism = parse_var("BULK_PARALLELISM", 4)?;
        let bulk_batch_timeout = Duration::from_secs(parse_var("BULK_BATCH_TIMEOUT_SECS", 30)?);
        let progress_write_interval =
            Duration::from_secs(parse_var("PROGRESS_WRITE_INTERVAL_SECS", 2)?);

        if bulk_batch_size == 0 {
            anyhow::bail!("BULK_BATCH_SIZE must be at least 1");
        }
        if bulk_parallelism == 0 {
            anyhow::bail!("BULK_PARALLELISM must be at least 1");
        }

        Ok(Self {
            nats_url,
            chunk_ttl,
            bulk_batch_size,
            bulk_parallelism,
            bulk_batch_timeout,
            progress_write_interval,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // requires --test-threads=1 due to env var race
    fn test_config_defaults() {
        std::env::remove_var("CHUNK_TTL_SECS");
        std::env::remove_var("BULK_BATCH_SIZE");

        let config = Config::from_env().unwrap();
        assert_eq!(config.chunk_ttl, Duration::from_secs(3600));
        assert_eq!(config.bulk_batch_size, 100);
        assert_eq!(config.bulk_parallelism, 4);
    }

    #[test]
    #[ignore] // requires --test-threads=1 due to env var race
    fn test_config_reads_overrides() {
        std::env::set_var("BULK_BATCH_SIZE", "250");
        std::env::set_var("CHUNK_TTL_SECS", "60");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bulk_batch_size, 250);
        assert_eq!(config.chunk_ttl, Duration::from_secs(60));

        // Cleanup
        std::env::remove_var("BULK_BATCH_SIZE");
        std::env::remove_var("CHUNK_TTL_SECS");
    }

    #[test]
    #[ignore] // requires --test-threads=1 due to env var race
    fn test_config_rejects_garbage() {
        std::env::set_var("BULK_BATCH_SIZE", "lots");
        assert!(Config::from_env().is_err());
        std::env::remove_var("BULK_BATCH_SIZE");
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Tuning of the transfer layer.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Bytes sent per resumable-upload request.
    pub chunk_size: usize,
    /// Resume attempts allowed after a transient chunk failure, reset
    /// whenever a chunk is committed.
    pub chunk_retries: u32,
    /// Pause before resuming a failed chunk.
    pub retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            chunk_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub public_url: String,
    pub asset_root: Option<String>,
    pub queue: QueueConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Background photo upload queue")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_QUEUE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_QUEUE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded objects are stored (overrides UPLOAD_QUEUE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLOAD_QUEUE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base of the download URLs handed out for uploaded photos (overrides UPLOAD_QUEUE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Directory asset references are resolved against (overrides UPLOAD_QUEUE_ASSET_ROOT)
    #[arg(long)]
    pub asset_root: Option<String>,

    /// Bytes per upload chunk (overrides UPLOAD_QUEUE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Resume attempts per stalled chunk (overrides UPLOAD_QUEUE_CHUNK_RETRIES)
    #[arg(long)]
    pub chunk_retries: Option<u32>,

    /// Milliseconds to wait before resuming (overrides UPLOAD_QUEUE_RETRY_BACKOFF_MS)
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read and parse an environment variable; `None` when unset.
fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let defaults = QueueConfig::default();

        let port = match args.port {
            Some(port) => port,
            None => env_parsed("UPLOAD_QUEUE_PORT")?.unwrap_or(3000),
        };
        let chunk_size = match args.chunk_size {
            Some(size) => size,
            None => env_parsed("UPLOAD_QUEUE_CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
        };
        let chunk_retries = match args.chunk_retries {
            Some(n) => n,
            None => env_parsed("UPLOAD_QUEUE_CHUNK_RETRIES")?.unwrap_or(defaults.chunk_retries),
        };
        let retry_backoff = match args.retry_backoff_ms {
            Some(ms) => Duration::from_millis(ms),
            None => env_parsed::<u64>("UPLOAD_QUEUE_RETRY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
        };
        if chunk_size == 0 {
            anyhow::bail!("chunk size must be greater than zero");
        }

        let host = args
            .host
            .unwrap_or_else(|| env::var("UPLOAD_QUEUE_HOST").unwrap_or_else(|_| "0.0.0.0".into()));
        let storage_dir = args.storage_dir.unwrap_or_else(|| {
            env::var("UPLOAD_QUEUE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into())
        });
        let database_url = args.database_url.unwrap_or_else(|| {
            env::var("UPLOAD_QUEUE_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/meta/upload_queue.db".into())
        });
        let public_url = args.public_url.unwrap_or_else(|| {
            env::var("UPLOAD_QUEUE_PUBLIC_URL").unwrap_or_else(|_| format!("http://localhost:{}", port))
        });
        let asset_root = args
            .asset_root
            .or_else(|| env::var("UPLOAD_QUEUE_ASSET_ROOT").ok());

        Ok(Self {
            host,
            port,
            storage_dir,
            database_url,
            public_url,
            asset_root,
            queue: QueueConfig {
                chunk_size,
                chunk_retries,
                retry_backoff,
            },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_take_precedence() {
        let args = Args::parse_from([
            "upload-queue",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--chunk-size",
            "1024",
            "--chunk-retries",
            "5",
            "--retry-backoff-ms",
            "10",
            "--public-url",
            "https://cdn.example",
        ]);
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert_eq!(cfg.queue.chunk_size, 1024);
        assert_eq!(cfg.queue.chunk_retries, 5);
        assert_eq!(cfg.queue.retry_backoff, Duration::from_millis(10));
        assert_eq!(cfg.public_url, "https://cdn.example");
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let args = Args::parse_from(["upload-queue", "--chunk-size", "0"]);
        assert!(AppConfig::merge(args).is_err());
    }

    #[test]
    fn migrate_flag_parses() {
        let args = Args::parse_from(["upload-queue", "--migrate"]);
        assert!(args.migrate);
    }
}

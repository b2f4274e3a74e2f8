//! Mount configuration: the key=value config file plus CLI/env overrides.
//!
//! `Cli` is a `clap` derive struct with `env = "..."` attributes for
//! credential overrides; `Config::resolve` merges it with an optional
//! key=value file into one fully-resolved, immutable `Config`, loaded once
//! and held for the process lifetime — there is no persisted state beyond
//! that file.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line surface: flags override the config file, credentials fall
/// back to env vars.
#[derive(Parser, Debug)]
#[command(name = "s3fsmount")]
#[command(author, version)]
#[command(about = "Mount an S3-compatible object store as a POSIX filesystem")]
pub struct Cli {
    /// Path to the local directory to mount onto.
    pub mountpoint: PathBuf,

    /// Path to a key=value config file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Store endpoint base URL, e.g. `https://s3.us-east-1.amazonaws.com`.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Bucket name.
    #[arg(long)]
    pub bucket: Option<String>,

    /// Access key id.
    #[arg(long, env = "S3FS_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<String>,

    /// Secret access key.
    #[arg(long, env = "S3FS_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Signing region.
    #[arg(long)]
    pub region: Option<String>,

    /// Maximum attempts per HTTP transaction.
    #[arg(long)]
    pub max_transfer_retries: Option<u32>,

    /// Per-attempt request timeout, in seconds.
    #[arg(long)]
    pub request_timeout_in_s: Option<u64>,

    /// Foreground worker count.
    #[arg(long)]
    pub fg_worker_count: Option<usize>,

    /// Background worker count.
    #[arg(long)]
    pub bg_worker_count: Option<usize>,

    /// Positive cache TTL, in seconds.
    #[arg(long)]
    pub cache_ttl_s: Option<u64>,

    /// Verbose request logging.
    #[arg(long)]
    pub verbose_requests: bool,

    /// Path to a custom CA bundle for TLS verification.
    #[arg(long)]
    pub ssl_ca_file: Option<PathBuf>,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Fully resolved, immutable mount configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub max_transfer_retries: u32,
    pub request_timeout: Duration,
    pub fg_worker_count: usize,
    pub bg_worker_count: usize,
    pub cache_ttl: Duration,
    pub negative_cache_ttl: Duration,
    pub verbose_requests: bool,
    pub ssl_ca_file: Option<PathBuf>,
    pub mountpoint: PathBuf,
}

/// Default number of foreground workers.
pub const DEFAULT_FG_WORKERS: usize = 8;
/// Default number of background workers.
pub const DEFAULT_BG_WORKERS: usize = 2;
/// Default positive-cache TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
/// Default negative-cache TTL.
pub const DEFAULT_NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(10);
/// Default per-attempt request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default max attempts per transaction.
pub const DEFAULT_MAX_TRANSFER_RETRIES: u32 = 3;

/// Parses a `#`-comment, blank-line-tolerant key=value file.
pub fn parse_key_value_file(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

impl Config {
    /// Builds the final config from an optional file plus CLI overrides,
    /// the CLI/flag taking precedence over the file.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file_values = match &cli.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                parse_key_value_file(&contents)
            }
            None => HashMap::new(),
        };

        let endpoint = cli
            .endpoint
            .clone()
            .or_else(|| file_values.get("endpoint").cloned())
            .context("missing required option: endpoint")?;
        let bucket = cli
            .bucket
            .clone()
            .or_else(|| file_values.get("bucket").cloned())
            .context("missing required option: bucket")?;
        let access_key = cli
            .access_key
            .clone()
            .or_else(|| file_values.get("access_key").cloned())
            .context("missing required option: access_key")?;
        let secret_key = cli
            .secret_key
            .clone()
            .or_else(|| file_values.get("secret_key").cloned())
            .context("missing required option: secret_key")?;
        let region = cli
            .region
            .clone()
            .or_else(|| file_values.get("region").cloned())
            .unwrap_or_else(|| "us-east-1".to_string());

        let max_transfer_retries = cli
            .max_transfer_retries
            .or_else(|| file_values.get("max_transfer_retries").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_MAX_TRANSFER_RETRIES);
        if max_transfer_retries < 1 {
            bail!("max_transfer_retries must be >= 1");
        }

        let request_timeout_in_s = cli
            .request_timeout_in_s
            .or_else(|| file_values.get("request_timeout_in_s").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT.as_secs());
        if request_timeout_in_s < 1 {
            bail!("request_timeout_in_s must be >= 1");
        }

        let fg_worker_count = cli
            .fg_worker_count
            .or_else(|| file_values.get("fg_worker_count").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_FG_WORKERS);
        let bg_worker_count = cli
            .bg_worker_count
            .or_else(|| file_values.get("bg_worker_count").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_BG_WORKERS);

        let cache_ttl_s = cli
            .cache_ttl_s
            .or_else(|| file_values.get("cache_ttl_s").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_CACHE_TTL.as_secs());

        let verbose_requests = cli.verbose_requests
            || file_values
                .get("verbose_requests")
                .is_some_and(|v| v == "true" || v == "1");

        let ssl_ca_file = cli
            .ssl_ca_file
            .clone()
            .or_else(|| file_values.get("ssl_ca_file").map(PathBuf::from));

        Ok(Self {
            endpoint,
            bucket,
            access_key,
            secret_key,
            region,
            max_transfer_retries,
            request_timeout: Duration::from_secs(request_timeout_in_s),
            fg_worker_count,
            bg_worker_count,
            cache_ttl: Duration::from_secs(cache_ttl_s),
            negative_cache_ttl: DEFAULT_NEGATIVE_CACHE_TTL,
            verbose_requests,
            ssl_ca_file,
            mountpoint: cli.mountpoint.clone(),
        })
    }

    pub fn base_url(&self) -> String {
        format!("{}", self.endpoint.trim_end_matches('/'))
    }
}

/// Builds the `tracing_subscriber` `EnvFilter` directive string from the
/// `-v` repeat count and the verbose-requests flag.
pub fn verbosity_filter(verbose: u8, verbose_requests: bool) -> &'static str {
    match (verbose, verbose_requests) {
        (0, false) => "warn",
        (0, true) => "info",
        (1, _) => "info",
        (2, _) => "debug",
        _ => "trace",
    }
}

pub fn resolve_mountpoint(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        bail!("mountpoint {} does not exist", path.display());
    }
    if !path.is_dir() {
        bail!("mountpoint {} is not a directory", path.display());
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_with_comments_and_blanks() {
        let contents = "\n# a comment\nendpoint = https://example.com\n\nbucket=mybucket\n";
        let map = parse_key_value_file(contents);
        assert_eq!(map.get("endpoint").unwrap(), "https://example.com");
        assert_eq!(map.get("bucket").unwrap(), "mybucket");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn ignores_lines_without_equals() {
        let map = parse_key_value_file("not a valid line\nkey=value");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("key").unwrap(), "value");
    }

    #[test]
    fn cli_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("s3fs.conf");
        std::fs::write(&cfg_path, "endpoint=https://file.example.com\nbucket=filebucket\naccess_key=filekey\nsecret_key=filesecret\n").unwrap();

        let cli = Cli {
            mountpoint: dir.path().to_path_buf(),
            config: Some(cfg_path),
            endpoint: Some("https://cli.example.com".to_string()),
            bucket: None,
            access_key: None,
            secret_key: None,
            region: None,
            max_transfer_retries: None,
            request_timeout_in_s: None,
            fg_worker_count: None,
            bg_worker_count: None,
            cache_ttl_s: None,
            verbose_requests: false,
            ssl_ca_file: None,
            foreground: false,
            verbose: 0,
        };

        let config = Config::resolve(&cli).unwrap();
        assert_eq!(config.endpoint, "https://cli.example.com");
        assert_eq!(config.bucket, "filebucket");
    }

    #[test]
    fn missing_required_option_errors() {
        let cli = Cli {
            mountpoint: PathBuf::from("/tmp"),
            config: None,
            endpoint: None,
            bucket: None,
            access_key: None,
            secret_key: None,
            region: None,
            max_transfer_retries: None,
            request_timeout_in_s: None,
            fg_worker_count: None,
            bg_worker_count: None,
            cache_ttl_s: None,
            verbose_requests: false,
            ssl_ca_file: None,
            foreground: false,
            verbose: 0,
        };
        assert!(Config::resolve(&cli).is_err());
    }

    #[test]
    fn rejects_zero_retries() {
        let cli = Cli {
            mountpoint: PathBuf::from("/tmp"),
            config: None,
            endpoint: Some("https://e".to_string()),
            bucket: Some("b".to_string()),
            access_key: Some("a".to_string()),
            secret_key: Some("s".to_string()),
            region: None,
            max_transfer_retries: Some(0),
            request_timeout_in_s: None,
            fg_worker_count: None,
            bg_worker_count: None,
            cache_ttl_s: None,
            verbose_requests: false,
            ssl_ca_file: None,
            foreground: false,
            verbose: 0,
        };
        assert!(Config::resolve(&cli).is_err());
    }
}

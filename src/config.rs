use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; the upload allow-list
/// and size limit are explicit values injected into the orchestrator, never
/// ambient state.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Optional CDN/base URL for public media links. When unset the service
    /// serves objects itself under `/media/{key}`.
    pub public_base_url: Option<String>,
    /// Declared MIME types accepted by the creation endpoint.
    pub allowed_mime: Vec<String>,
    /// Maximum accepted upload size, in megabytes.
    pub max_upload_mb: u64,
    /// Base URL of the external vision service; analysis is degraded to
    /// empty results when unset.
    pub vision_endpoint: Option<String>,
    pub vision_api_key: Option<String>,
    /// Upper bound on one full analysis pass, in milliseconds.
    pub vision_timeout_ms: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Media post pipeline API")]
pub struct Args {
    /// Host to bind to (overrides PICFEED_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PICFEED_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides PICFEED_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides PICFEED_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL for media links (overrides PICFEED_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Comma-separated accepted MIME types (overrides PICFEED_ALLOWED_MIME)
    #[arg(long)]
    pub allowed_mime: Option<String>,

    /// Maximum upload size in MB (overrides PICFEED_MAX_UPLOAD_MB)
    #[arg(long)]
    pub max_upload_mb: Option<u64>,

    /// Vision service endpoint (overrides PICFEED_VISION_ENDPOINT)
    #[arg(long)]
    pub vision_endpoint: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

const DEFAULT_ALLOWED_MIME: &str = "image/jpeg,image/png,image/webp,video/mp4";

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("PICFEED_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("PICFEED_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing PICFEED_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3900,
            Err(err) => return Err(err).context("reading PICFEED_PORT"),
        };
        let env_storage =
            env::var("PICFEED_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("PICFEED_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/picfeed.db".into());
        let env_public_base = env::var("PICFEED_PUBLIC_BASE_URL").ok();
        let env_allowed =
            env::var("PICFEED_ALLOWED_MIME").unwrap_or_else(|_| DEFAULT_ALLOWED_MIME.into());
        let env_max_upload = match env::var("PICFEED_MAX_UPLOAD_MB") {
            Ok(value) => value
                .parse::<u64>()
                .with_context(|| format!("parsing PICFEED_MAX_UPLOAD_MB value `{}`", value))?,
            Err(_) => 10,
        };
        let env_vision_endpoint = env::var("PICFEED_VISION_ENDPOINT").ok();
        let env_vision_api_key = env::var("PICFEED_VISION_API_KEY").ok();
        let env_vision_timeout = match env::var("PICFEED_VISION_TIMEOUT_MS") {
            Ok(value) => value
                .parse::<u64>()
                .with_context(|| format!("parsing PICFEED_VISION_TIMEOUT_MS value `{}`", value))?,
            Err(_) => 8000,
        };

        // --- Merge ---
        let allowed_mime = args
            .allowed_mime
            .unwrap_or(env_allowed)
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_base_url: args
                .public_base_url
                .or(env_public_base)
                .map(|b| b.trim_end_matches('/').to_string())
                .filter(|b| !b.is_empty()),
            allowed_mime,
            max_upload_mb: args.max_upload_mb.unwrap_or(env_max_upload),
            vision_endpoint: args.vision_endpoint.or(env_vision_endpoint),
            vision_api_key: env_vision_api_key,
            vision_timeout_ms: env_vision_timeout,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_mb as usize) * 1024 * 1024
    }
}

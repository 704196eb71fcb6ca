use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input};
use reqwest::Url;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry_policy::RetryPolicy;
use crate::upload::DEFAULT_CHUNKED_THRESHOLD_BYTES;

/// Resilient API client - authenticated calls and large-file uploads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// API base URL
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub base_url: Option<String>,

    /// Path to the SQLite file holding the session between runs
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub session_db: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "300")]
    pub http_timeout: u64,

    /// Uploads larger than this many bytes are sent in chunks
    #[arg(long, env = "CHUNKED_UPLOAD_THRESHOLD", default_value_t = DEFAULT_CHUNKED_THRESHOLD_BYTES)]
    pub upload_threshold: u64,

    /// Attempts per chunk before the upload is aborted
    #[arg(long, env = "CHUNK_MAX_ATTEMPTS", default_value = "3")]
    pub chunk_attempts: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and store the session
    Login {
        #[arg(short, long, env = "API_EMAIL")]
        email: Option<String>,
    },
    /// End the session
    Logout,
    /// GET a path and print the JSON response
    Get { path: String },
    /// Upload a file (chunked above the threshold)
    Upload {
        file: PathBuf,
        #[arg(long, default_value = "auto")]
        format: String,
        /// Processing options as a JSON object
        #[arg(long)]
        options: Option<String>,
    },
    /// Continue an interrupted chunked upload
    Resume {
        upload_id: String,
        file: PathBuf,
        #[arg(long, default_value = "auto")]
        format: String,
        /// Chunk size the server returned at init, for servers whose status omits it
        #[arg(long)]
        chunk_size: Option<u64>,
    },
    /// Show what the server has received for an upload
    Status { upload_id: String },
    /// Discard an upload session on the server
    Abort { upload_id: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: String,

    // HTTP client
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,

    // Session
    pub refresh_buffer: Duration,
    pub settle_delay: Duration,
    pub session_db: Option<PathBuf>,

    // Uploads
    pub upload_threshold: u64,
    pub chunk_max_attempts: u32,
    pub chunk_base_delay: Duration,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl ClientConfig {
    /// Defaults for `base_url`, no session persistence
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            max_connections: 20,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
            refresh_buffer: Duration::from_secs(10),
            settle_delay: Duration::from_millis(500),
            session_db: None,
            upload_threshold: DEFAULT_CHUNKED_THRESHOLD_BYTES,
            chunk_max_attempts: 3,
            chunk_base_delay: Duration::from_millis(1000),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }

    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let mut args = CliArgs::parse();

        if needs_interactive_setup(&args) {
            let setup = run_interactive_setup()?;
            args.base_url = Some(setup.base_url);
            args.session_db = args.session_db.or(Some(setup.session_db));
        }

        Self::from_args(args)
    }

    /// Build configuration from parsed arguments plus env-only settings
    pub fn from_args(args: CliArgs) -> Result<(Self, Command)> {
        let defaults = Self::new("");

        let config = ClientConfig {
            base_url: args
                .base_url
                .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?
                .trim_end_matches('/')
                .to_string(),

            max_connections: env_parse("HTTP_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),

            connect_timeout: env_parse("HTTP_CONNECT_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),

            request_timeout: Duration::from_secs(args.http_timeout),

            refresh_buffer: env_parse("TOKEN_REFRESH_BUFFER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_buffer),

            settle_delay: env_parse("REFRESH_SETTLE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle_delay),

            session_db: Some(
                args.session_db
                    .map(|s| expand_tilde(&s))
                    .unwrap_or_else(default_session_db),
            ),

            upload_threshold: args.upload_threshold,

            chunk_max_attempts: args.chunk_attempts,

            chunk_base_delay: env_parse("CHUNK_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.chunk_base_delay),

            log_level: args.log_level,

            log_format: parse_log_format(&args.log_format),
        };

        Ok((config, args.command))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            anyhow::bail!("API_BASE_URL cannot be empty");
        }

        let url = Url::parse(&self.base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("API_BASE_URL must use http or https: {}", self.base_url);
        }

        if self.chunk_max_attempts == 0 {
            anyhow::bail!("CHUNK_MAX_ATTEMPTS must be at least 1");
        }

        Ok(())
    }

    /// Backoff applied to each chunk of a chunked upload
    pub fn chunk_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.chunk_max_attempts, self.chunk_base_delay)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Session database under the platform data directory
fn default_session_db() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("resilient-client")
        .join("session.sqlite3")
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and no base URL anywhere)
pub fn needs_interactive_setup(args: &CliArgs) -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();
    !env_file_exists && args.base_url.is_none()
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub base_url: String,
    pub session_db: String,
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("No configuration found. Let's set up the client.");
    println!();

    let base_url: String = Input::new()
        .with_prompt("API base URL (API_BASE_URL)")
        .default("http://localhost:8080".to_string())
        .interact_text()
        .context("Failed to read API_BASE_URL")?;

    Url::parse(&base_url).with_context(|| format!("Invalid URL: {}", base_url))?;

    println!();
    let session_db: String = Input::new()
        .with_prompt("Session database file (SESSION_DB_FILE)")
        .default(default_session_db().to_string_lossy().to_string())
        .interact_text()
        .context("Failed to read SESSION_DB_FILE")?;

    let config = InteractiveConfig {
        base_url,
        session_db,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!();
        println!("Configuration saved to .env file");
    }

    println!();
    Ok(config)
}

fn env_file_content(config: &InteractiveConfig) -> String {
    format!(
        r#"# Resilient client configuration
# Generated by interactive setup

# API base URL (required)
API_BASE_URL={}

# Session database
SESSION_DB_FILE={}

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
LOG_FORMAT=text
"#,
        config.base_url, config.session_db,
    )
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_file_content(config).as_bytes())
        .context("Failed to write .env file")?;
    Ok(())
}

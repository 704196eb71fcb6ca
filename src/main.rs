use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use resilient_client::config::{ClientConfig, Command, LogFormat};
use resilient_client::upload::{CancelHandle, TracingObserver, UploadApi, UploadObserver, UploadRequest};
use resilient_client::{ApiClient, ApiError, ErrorKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = ClientConfig::load()?;
    config.validate()?;

    init_tracing(&config);

    tracing::debug!(base_url = %config.base_url, "Resilient client starting...");

    let client = ApiClient::new(&config).context("Failed to initialize API client")?;

    match run(&client, command).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AuthExpired => {
            tracing::error!("{}", e);
            anyhow::bail!("Session expired, run `resilient-client login` again")
        }
        Err(e) => Err(e.into()),
    }
}

/// Initialize logging with the configured level and format
fn init_tracing(config: &ClientConfig) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(client: &ApiClient, command: Command) -> Result<(), ApiError> {
    match command {
        Command::Login { email } => {
            let email = match email {
                Some(email) => email,
                None => Input::new()
                    .with_prompt("Email")
                    .interact_text()
                    .context("Failed to read email")?,
            };
            let password = Password::new()
                .with_prompt("Password")
                .interact()
                .context("Failed to read password")?;

            let login = client.login(&email, &password).await?;
            tracing::info!(
                user_id = %login.user_id,
                mode = ?client.transport_mode().await,
                "Logged in"
            );
        }
        Command::Logout => client.logout().await,
        Command::Get { path } => {
            let value: Value = client.get(&path).await?;
            print_json(&value)?;
        }
        Command::Upload {
            file,
            format,
            options,
        } => {
            let options = parse_options(options.as_deref())?;
            let request = UploadRequest::from_path(&file, format, options);
            let job = client
                .upload(&request, observers_for(&file), cancel_on_ctrl_c())
                .await?;
            print_json(&job)?;
        }
        Command::Resume {
            upload_id,
            file,
            format,
            chunk_size,
        } => {
            let request = UploadRequest::from_path(&file, format, Value::Null);
            let job = client
                .resume_upload(
                    &upload_id,
                    chunk_size,
                    &request,
                    observers_for(&file),
                    cancel_on_ctrl_c(),
                )
                .await?;
            print_json(&job)?;
        }
        Command::Status { upload_id } => {
            let status = client.upload_status(&upload_id).await?;
            let received = status.received_chunks.indices();
            println!("{}/{} chunks received", received.len(), status.total_chunks);
        }
        Command::Abort { upload_id } => {
            client.abort_upload(&upload_id).await?;
            tracing::info!(upload_id = %upload_id, "Upload aborted");
        }
    }

    Ok(())
}

fn observers_for(file: &Path) -> Vec<Arc<dyn UploadObserver>> {
    vec![Arc::new(TracingObserver {
        label: file.display().to_string(),
    })]
}

/// Cancel the upload at the next chunk boundary on Ctrl-C
fn cancel_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling upload...");
            handle.cancel();
        }
    });
    cancel
}

fn parse_options(raw: Option<&str>) -> Result<Value, ApiError> {
    match raw {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ApiError::ConfigError(format!("--options is not valid JSON: {}", e))),
        None => Ok(Value::Object(Default::default())),
    }
}

fn print_json(value: &Value) -> Result<(), ApiError> {
    let pretty = serde_json::to_string_pretty(value).map_err(|e| ApiError::Internal(e.into()))?;
    println!("{}", pretty);
    Ok(())
}

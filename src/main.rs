//! GRZ Submission Pipeline
//!
//! Encrypts and uploads one submission described by a JSON descriptor, then
//! records the outcome in the submission ledger.

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grz_pipeline::config::Config;
use grz_pipeline::ledger::ChainStatus;
use grz_pipeline::orchestrator::SubmissionDescriptor;
use grz_pipeline::state::AppState;
use grz_pipeline::CancelFlag;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "grz_pipeline=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load config from env")?;

    tracing::info!("Starting GRZ pipeline v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("S3 endpoint: {}", config.storage.endpoint);
    tracing::info!("S3 bucket: {}", config.storage.bucket);

    let descriptor_path = config
        .pipeline
        .submission_descriptor
        .clone()
        .context("SUBMISSION_DESCRIPTOR is not set")?;
    let descriptor_json = tokio::fs::read_to_string(&descriptor_path)
        .await
        .with_context(|| format!("Failed to read {}", descriptor_path.display()))?;
    let descriptor = SubmissionDescriptor::from_json(&descriptor_json)?;

    let cancel = CancelFlag::new();
    let state = AppState::new(config, cancel.clone())
        .await
        .context("Failed to initialize pipeline")?;

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Shutdown requested, stopping at the next segment or part boundary");
        cancel.cancel();
    });

    let report = state.orchestrator().run(&descriptor).await?;

    for file in &report.files {
        match &file.error {
            None => tracing::info!(file_id = %file.file_id, status = ?file.status, "File finished"),
            Some(error) => tracing::error!(file_id = %file.file_id, status = ?file.status, error = %error, "File failed"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    match state.ledger().verify(&report.submission_id).await? {
        ChainStatus::Intact { records, head_hash } => {
            tracing::info!(submission_id = %report.submission_id, records, head_hash = %head_hash, "Ledger chain verified");
        }
        ChainStatus::Broken { sequence, reason } => {
            anyhow::bail!(
                "ledger chain of {} is broken at record {}: {}",
                report.submission_id,
                sequence,
                reason
            );
        }
    }

    if !report.is_complete() {
        anyhow::bail!(
            "submission {} stopped in state {}",
            report.submission_id,
            report.state
        );
    }

    tracing::info!(submission_id = %report.submission_id, "Submission uploaded");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

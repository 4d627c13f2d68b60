use std::net::SocketAddr;

use chrono::DateTime;
use tracing::{error, info};

use storyrelay::api::{self, state::AppState};
use storyrelay::config::Config;
use storyrelay::queue::{JobStatus, JobStore};
use storyrelay::worker::{Collaborators, Pipeline};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(address: Option<SocketAddr>) -> Result<(), AnyError> {
    info!("Loading configuration");
    let config = Config::load()?;

    let collaborators = Collaborators::from_config(&config)?;
    let pipeline = Pipeline::start(&config, collaborators).await?;

    let state = AppState::new(pipeline.broker().clone(), config.stages.fetch.clone());
    let address = address.unwrap_or(config.server.bind_addr);
    let served = api::serve(address, state, shutdown_signal()).await;

    // Drain running jobs even when the listener failed
    pipeline.shutdown().await?;
    served?;
    Ok(())
}

/// Print stored jobs, newest first
pub fn list_jobs(status: Option<&str>, limit: usize) -> Result<(), AnyError> {
    let config = Config::load()?;
    let status = status.map(str::parse::<JobStatus>).transpose()?;
    let store = JobStore::open(&config.broker.path)?;

    let jobs = store.list(status, limit)?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }

    println!(
        "{:>6}  {:<9}  {:<10}  {:>8}  {:<25}  {}",
        "ID", "STAGE", "STATUS", "ATTEMPTS", "AVAILABLE AT", "LAST ERROR"
    );
    for job in jobs {
        let available_at = DateTime::from_timestamp_millis(job.available_at_ms)
            .map(|at| at.to_rfc3339())
            .unwrap_or_default();
        println!(
            "{:>6}  {:<9}  {:<10}  {:>8}  {:<25}  {}",
            job.id,
            job.stage,
            job.status,
            format!("{}/{}", job.attempts_made, job.max_attempts),
            available_at,
            job.failed_reason.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received");
}

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use cron::Schedule;
use serde_json::json;
use std::str::FromStr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use redmine_watcher::config::Config;
use redmine_watcher::gitlab::GitLabClient;
use redmine_watcher::reconciliation::ReconciliationEngine;
use redmine_watcher::redmine::RedmineClient;
use redmine_watcher::scheduler::{Scheduler, StatusSnapshot};
use redmine_watcher::store::KnownIssueStore;
use redmine_watcher::webhook::WebhookNotifier;

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "redmine-watcher"
    })))
}

async fn status_handler(
    State(status_rx): State<watch::Receiver<StatusSnapshot>>,
) -> Json<StatusSnapshot> {
    Json(status_rx.borrow().clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting Redmine issue watcher");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let schedule = Schedule::from_str(&config.cron_schedule)
        .expect("CRON_SCHEDULE was validated at startup and must parse");

    let redmine_client = RedmineClient::new(
        config.redmine_url.clone(),
        config.redmine_api_key.clone(),
    );
    let gitlab_client = GitLabClient::new(
        config.gitlab_api_url.clone(),
        config.gitlab_private_token.clone(),
    );
    let notifier = WebhookNotifier::new(config.webhook_url.clone());

    info!(
        "Using known issues file: {}",
        config.known_issues_file.display()
    );
    let store = KnownIssueStore::load(&config.known_issues_file);

    let engine = ReconciliationEngine::new(redmine_client, gitlab_client, notifier, store);

    let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    info!(
        "Redmine issue watcher started. Schedule: {}",
        config.cron_schedule
    );
    let scheduler = Scheduler::new(engine, schedule, status_tx);
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(status_rx);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Status endpoint listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        })
        .await?;

    // Let an in-flight cycle finish before the process exits.
    let _ = scheduler_handle.await;

    Ok(())
}

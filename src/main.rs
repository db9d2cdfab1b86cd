use axum::{Router, routing::get, routing::post};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use release_manager::AppState;
use release_manager::config::Settings;
use release_manager::docker::{
    DockerHealthProbe, DockerStackOrchestrator, StubHealthProbe, StubOrchestrator,
    load_stack_template, stub_allowed,
};
use release_manager::engine::DeploymentEngine;
use release_manager::github::GitHubClient;
use release_manager::handlers;
use release_manager::health::{self, HealthService};
use release_manager::poller::{self, EnvironmentPoller};
use release_manager::ports::{ContainerOrchestrator, HealthProbe, SystemClock};
use release_manager::release_db::ReleaseDb;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("release_manager=debug,tower_http=debug")
        }))
        .init();

    let config_path = std::env::var("RELEASE_MANAGER_CONFIG")
        .unwrap_or_else(|_| "./release-manager.toml".to_string());
    let settings = Settings::load(&config_path)?;
    tracing::info!(
        "release manager starting (instance={}, stub_mode={})",
        settings.environment_name,
        settings.stub_mode
    );

    let db_path = settings.resolved_database_path();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(ReleaseDb::open(&db_path.to_string_lossy())?);
    tracing::info!("release db opened at {}", db_path.display());

    let (orchestrator, probe): (Arc<dyn ContainerOrchestrator>, Arc<dyn HealthProbe>) =
        if settings.stub_mode && stub_allowed(&settings.environment_name) {
            tracing::warn!("stub mode: docker calls are simulated");
            (Arc::new(StubOrchestrator), Arc::new(StubHealthProbe::default()))
        } else {
            if settings.stub_mode {
                tracing::warn!(
                    "stub mode ignored for instance {}; only dev/test instances may stub",
                    settings.environment_name
                );
            }
            let template = match &settings.docker.stack_template {
                Some(path) => {
                    tracing::info!("using stack template {path}");
                    Some(load_stack_template(path)?)
                }
                None => None,
            };
            (
                Arc::new(
                    DockerStackOrchestrator::new(
                        settings.docker.image_prefix.clone(),
                        settings.docker.host.clone(),
                    )
                    .with_template(template),
                ),
                Arc::new(DockerHealthProbe::new(settings.docker.host.clone())),
            )
        };

    let health_service = Arc::new(HealthService::new(
        db.clone(),
        probe,
        Arc::new(SystemClock),
    ));
    let engine = Arc::new(
        DeploymentEngine::new(
            db.clone(),
            db.clone(),
            orchestrator,
            health_service.clone(),
            Arc::new(SystemClock),
        )
        .with_deploy_timeout(settings.deployment_timeout()),
    );

    let github = Arc::new(GitHubClient::new(
        &settings.github.api_url,
        settings.github.repo.clone(),
        settings.github.token.clone(),
    )?);
    let env_poller = Arc::new(EnvironmentPoller::new(github, engine.clone()));
    let poller_handle = poller::spawn_poller(env_poller, settings.poll_interval_secs);
    health::spawn_health_monitor(
        health_service.clone(),
        db.clone(),
        settings.health_check_interval_secs,
    );

    let state = AppState {
        engine,
        health: health_service,
    };

    let app = Router::new()
        .route("/api/environments", get(handlers::environments::list_environments))
        .route("/api/diff", get(handlers::environments::get_diff))
        .route("/api/deploy/prod", post(handlers::deployments::deploy_prod))
        .route(
            "/api/deploy/prod/{deployment_id}",
            get(handlers::deployments::get_deployment),
        )
        .route("/api/rollback/prod", post(handlers::deployments::rollback_prod))
        .route("/api/history", get(handlers::history::list_history))
        .route(
            "/api/history/{history_id}",
            get(handlers::history::get_history_entry),
        )
        .route("/api/health", get(handlers::health::health_snapshot))
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = settings.bind_address();
    tracing::info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = poller_handle {
        handle.stop().await;
    }
    tracing::info!("release manager stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

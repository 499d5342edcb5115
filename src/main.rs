mod api;
mod browser;
mod config;
mod crawler;
mod db;
mod extractor;
mod models;
mod parsing;
mod planner;
mod rate_limit;
mod scheduler;
mod setup;
mod transform;

use anyhow::Context;
use axum::{http::HeaderValue, http::Method, routing::get, Router};
use dotenv::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::Config;
use crate::scheduler::Harvester;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::list_jobs,
        api::get_filters,
        api::list_technologies,
        api::jobs_by_technology
    ),
    components(
        schemas(
            api::JobView,
            api::JobPage,
            api::Pagination,
            api::TechnologyCount,
            api::FilterOptions,
            api::ExperienceRange,
            api::ErrorBody,
            crate::models::Technology
        )
    ),
    tags(
        (name = "jobs", description = "Harvested job listings")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env()?);

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the database")?;

    db::init_db(&pool).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested, stopping harvest and server");
        let _ = shutdown_tx.send(true);
    });

    let harvester = Harvester::new(pool.clone(), Arc::clone(&config), shutdown_rx.clone());
    let mut scheduler = scheduler::start_scheduler(harvester.clone()).await?;

    let cors = CorsLayer::new()
        .allow_origin(config.frontend_url.parse::<HeaderValue>().context("FRONTEND_URL is not a valid origin")?)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let state = Arc::new(api::AppState { pool: pool.clone() });

    let app = Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs.json", ApiDoc::openapi()))
        .route("/api/jobs", get(api::list_jobs))
        .route("/api/jobs/filters", get(api::get_filters))
        .route("/api/jobs/technologies", get(api::list_technologies))
        .route("/api/jobs/technology/:id", get(api::jobs_by_technology))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    // An interrupted run still closes its browser before we exit.
    harvester.wait_idle().await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown failed: {}", e);
    }
    pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
}

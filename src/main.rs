mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::services::{ChallengeService, TokenService};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lodgekey=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lodgekey auth service...");

    // Load configuration
    let config = Config::load()?;
    let config = Arc::new(config);
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database.path).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    // Periodic sweep of stale challenges and expired refresh tokens.
    // Challenges are short-lived; without this the tables grow unbounded.
    let sweep_db = db.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            match ChallengeService::sweep_expired(&sweep_db, services::challenge::CHALLENGE_RETENTION_SECS)
                .await
            {
                Ok(n) if n > 0 => tracing::debug!("swept {} stale challenges", n),
                Ok(_) => {}
                Err(e) => tracing::error!("challenge sweep failed: {:?}", e),
            }
            match TokenService::sweep_expired(&sweep_db).await {
                Ok(n) if n > 0 => tracing::debug!("swept {} expired refresh tokens", n),
                Ok(_) => {}
                Err(e) => tracing::error!("refresh token sweep failed: {:?}", e),
            }
        }
    });

    // Create app state
    let state = AppState {
        db,
        config: config.clone(),
    };

    // Build router
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/auth/passkey/login/begin", post(handlers::passkey::begin_login))
        .route("/auth/passkey/login/finish", post(handlers::passkey::finish_login))
        .route("/auth/refresh", post(handlers::auth::refresh_token))
        .route("/auth/logout", post(handlers::auth::logout));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route(
            "/auth/passkey/register/begin",
            post(handlers::passkey::begin_register),
        )
        .route(
            "/auth/passkey/register/finish",
            post(handlers::passkey::finish_register),
        )
        .route("/user/passkeys", get(handlers::passkey::list_passkeys))
        .route(
            "/user/passkeys/:id",
            axum::routing::patch(handlers::passkey::rename_passkey)
                .delete(handlers::passkey::remove_passkey),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    // Combine all routes under /api/v1
    Router::new()
        .nest("/api/v1", public_routes.merge(protected_routes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

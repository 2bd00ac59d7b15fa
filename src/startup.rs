use axum::routing::{get, post};
use axum::{serve::Serve, Router};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::configuration::{DatabaseSettings, Settings};
use crate::routes::{cancel_request, health_check, post_request};
use crate::store::Store;

pub struct Application {
    port: u16,
    server: Serve<TcpListener, Router, Router>,
}

impl Application {
    pub async fn build(configuration: Settings) -> Result<Self, anyhow::Error> {
        let connection_pool = get_connection_pool(&configuration.database);
        let store = Store::new(connection_pool);

        let address = format!(
            "{}:{}",
            configuration.application.host, configuration.application.port
        );

        let listener = TcpListener::bind(address).await?;
        let port = listener.local_addr().unwrap().port();

        let server = run(listener, store)?;

        Ok(Self { port, server })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    pub async fn run_with_graceful_shutdown(self) -> Result<(), std::io::Error> {
        self.server
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received shutdown signal");
}

fn build_router() -> Router<Store> {
    Router::<Store>::new()
        .route("/health_check", get(health_check))
        .route("/requests", post(post_request))
        .route("/requests/:id/cancel", post(cancel_request))
        .layer(TraceLayer::new_for_http())
}

fn run(listener: TcpListener, store: Store) -> Result<Serve<TcpListener, Router, Router>, anyhow::Error> {
    let app: Router = build_router().with_state(store);
    Ok(axum::serve(listener, app))
}

pub fn get_connection_pool(configuration: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new()
        .acquire_timeout(std::time::Duration::from_secs(2))
        .connect_lazy_with(configuration.with_db())
}

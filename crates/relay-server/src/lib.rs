use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use relay_orchestrator::Engine;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod error;
mod routes;
mod state;
mod ws;

pub use state::AppState;

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    routes::router(state.clone())
        .route("/ws/task/{id}", get(ws::task_handler))
        .route("/ws/console/{id}", get(ws::console_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Binds the HTTP/websocket listener and serves `engine` until ctrl-c.
pub async fn serve(addr: SocketAddr, engine: Engine) -> anyhow::Result<()> {
    let app = app_router(AppState::new(engine));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

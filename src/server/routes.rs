/// API Routes definition

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::auth;
use super::handlers;
use super::AppState;

pub fn create_router(state: AppState) -> Router {
    // Protected routes (require the pre-shared key)
    let protected_routes = Router::new()
        .route("/ping", get(handlers::ping))
        .route("/volumes", get(handlers::get_volumes))
        .route("/info", get(handlers::get_info))
        .route("/backup/:volume", post(handlers::backup_volume))
        .route("/restore/:volume", post(handlers::restore_volume))
        .route("/restic/:volume", post(handlers::run_restic))
        .route("/backup/:volume/logs", post(handlers::receive_logs))
        .route("/restore/:volume/logs", post(handlers::receive_logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    // Public routes
    let public_routes = Router::new().route("/metrics", get(handlers::get_metrics));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

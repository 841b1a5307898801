pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::timeout::TimeoutLayer;

use crate::admission::{enforce_quota, QuotaGate, RouteQuota};
use crate::evaluation::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();
    let upload_gate = QuotaGate {
        admission: state.admission.clone(),
        quota: RouteQuota::upload(&config),
    };
    let evaluate_gate = QuotaGate {
        admission: state.admission.clone(),
        quota: RouteQuota::evaluate(&config),
    };

    Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/upload",
            post(handlers::handle_upload)
                .layer(DefaultBodyLimit::max(config.upload_body_limit()))
                .route_layer(middleware::from_fn_with_state(upload_gate, enforce_quota)),
        )
        .route(
            "/evaluate",
            post(handlers::handle_evaluate)
                .route_layer(middleware::from_fn_with_state(evaluate_gate, enforce_quota)),
        )
        .route("/result/:id", get(handlers::handle_result))
        .route("/queue/failed", get(handlers::handle_list_failed))
        .route(
            "/queue/failed/:id/retry",
            post(handlers::handle_retry_failed),
        )
        .layer(TimeoutLayer::new(config.request_timeout))
        .with_state(state)
}

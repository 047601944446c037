// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP surface for the synthetic graphic designer service. Wires the
//! endpoint table to the core components via a shared [`AppState`]; the
//! router is not a hardened public gateway (no auth, no OpenAPI) — routing
//! and auth shape are deliberately out of scope, this exists so the core is
//! exercisable end-to-end over HTTP.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod state;

use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post, put};
use axum::Router;

pub use error::ApiError;
pub use state::AppState;

pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = middleware::cors_layer(&state.config.cors_allow_origins);

    Router::new()
        .route("/render", post(handlers::render))
        .route("/render/async", post(handlers::render_async))
        .route("/render/jobs/{id}", get(handlers::get_job))
        .route("/render/jobs/{id}", delete(handlers::cancel_job))
        .route("/ingest", post(handlers::ingest))
        .route("/ingest/file", post(handlers::ingest_file))
        .route("/canon/derive", post(handlers::canon_derive))
        .route("/canon/{project_id}", get(handlers::get_canon))
        .route("/canon/{project_id}", put(handlers::put_canon))
        .route("/critique", post(handlers::critique))
        .route("/upload", post(handlers::upload))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/ws/jobs/{id}", get(handlers::job_events_ws))
        .layer(from_fn(middleware::security_headers))
        .layer(from_fn(middleware::response_timing))
        .layer(cors)
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(from_fn(middleware::request_logger))
        .layer(from_fn(middleware::request_id_middleware))
        .with_state(state)
}

//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - per-request trace-id middleware and a request body limit
//! - health route
//! - `/v1/tts` routes

mod health;
mod v1;

use std::sync::Arc;

use axum::{Router, middleware};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

use crate::middleware::trace;
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/v1", v1::router())
        // Outermost layers execute first on the way in.
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(trace::trace_middleware))
                .layer(RequestBodyLimitLayer::new(state.config.max_body_bytes)),
        )
        .with_state(state)
}

//! Telephony media stream route
//!
//! `GET /telephony/stream` upgrades to the carrier WebSocket. The connection
//! limit middleware caps how many of these are open at once.

use axum::{Router, middleware, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::telephony_handler;
use crate::middleware::connection_limit_middleware;
use crate::state::AppState;
use std::sync::Arc;

pub fn create_telephony_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/telephony/stream", get(telephony_handler))
        .layer(middleware::from_fn_with_state(
            state,
            connection_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

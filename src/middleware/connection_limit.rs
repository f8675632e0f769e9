//! Concurrent call limit for telephony WebSocket upgrades
//!
//! ```ignore
//! use axum::Router;
//! use callvox_gateway::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/telephony/stream", get(telephony_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::state::{AppState, ConnectionLimitError, ConnectionSlot};

/// Slot held by an upgraded socket; the handler keeps it alive for the call.
#[derive(Clone, Debug)]
pub struct CallSlot(pub Arc<ConnectionSlot>);

/// Rejects WebSocket upgrades with 503 once `max_concurrent_calls` sockets are
/// open. Plain HTTP requests pass through.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    if !is_ws_upgrade {
        return next.run(request).await;
    }

    match state.try_acquire_connection() {
        Ok(slot) => {
            request.extensions_mut().insert(CallSlot(Arc::new(slot)));
            next.run(request).await
        }
        Err(ConnectionLimitError::GlobalLimitReached) => {
            tracing::warn!(
                active = state.connection_count(),
                "Rejecting telephony socket: call limit reached"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::{Router, routing::get};
    use tower::ServiceExt;

    fn app(limit: usize) -> (Router, Arc<AppState>) {
        let mut config = ServerConfig::default();
        config.openai_api_key = Some("sk-test".to_string());
        config.max_concurrent_calls = Some(limit);
        let state = AppState::new(config).unwrap();
        let router = Router::new()
            .route("/ws", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                connection_limit_middleware,
            ))
            .with_state(state.clone());
        (router, state)
    }

    fn upgrade_request() -> Request<Body> {
        Request::builder()
            .uri("/ws")
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_plain_requests_bypass_limit() {
        let (router, state) = app(1);
        let _held = state.try_acquire_connection().unwrap();

        let response = router
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upgrade_rejected_at_capacity() {
        let (router, state) = app(1);
        let _held = state.try_acquire_connection().unwrap();

        let response = router.oneshot(upgrade_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_slot_released_after_request() {
        let (router, state) = app(1);

        let response = router.oneshot(upgrade_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // The handler did not keep the slot, so it was dropped with the request
        assert_eq!(state.connection_count(), 0);
    }
}

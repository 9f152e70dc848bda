use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{admin, mcp, rest, webhook, x402_routes};

pub fn build(state: AppState) -> Router {
    Router::new()
        .merge(rest::router())
        .merge(mcp::router())
        .merge(x402_routes::router())
        .merge(webhook::router())
        .merge(admin::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

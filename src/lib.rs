//! Talktime server: friend requests, friendships, conversations and messages
//! behind a session-authenticated JSON API, with users provisioned from the
//! identity provider's webhook.

pub mod config;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod identity;
pub mod model;
pub mod ops;
pub mod security;
pub mod state;
pub mod store;
pub mod webhook;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{conversations, friends, requests};
use crate::state::SharedState;

/// Build the router. `/api/*` requires a session token; the webhook endpoint
/// authenticates with its own signature instead.
pub fn app(state: SharedState) -> Router {
    let api = Router::new()
        .route(
            "/requests",
            get(requests::list_requests).post(requests::create_request),
        )
        .route("/requests/count", get(requests::count_requests))
        .route("/requests/:request_id/accept", post(requests::accept_request))
        .route("/requests/:request_id/deny", post(requests::deny_request))
        .route("/friends", get(friends::list_friends))
        .route("/groups", post(friends::create_group))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/:id", get(conversations::get_conversation))
        .route(
            "/conversations/:id/messages",
            get(conversations::list_messages).post(conversations::create_message),
        )
        .route("/conversations/:id/remove-friend", post(friends::remove_friend))
        .route("/conversations/:id/delete-group", post(conversations::delete_group))
        .route("/conversations/:id/leave", post(conversations::leave_group))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            identity::require_session,
        ));

    let cors = security::build_cors_layer(&state.security);
    let body_limit = state.security.max_body_bytes;

    Router::new()
        .nest("/api", api)
        .route(
            "/clerk-users-webhook",
            post(handlers::webhook::clerk_users_webhook),
        )
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::rate_limit_middleware,
        ))
        .layer(middleware::from_fn(security::client_ip_middleware))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

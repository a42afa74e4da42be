#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use talktime_server::app;
use talktime_server::config::ServerConfig;
use talktime_server::identity::{SessionClaims, SessionVerifier};
use talktime_server::model::{User, UserProfile};
use talktime_server::ops::users;
use talktime_server::state::AppState;
use talktime_server::store::Store;

pub const SESSION_SECRET: &str = "test-session-secret";
pub const WEBHOOK_SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";

pub struct TestApp {
    pub router: Router,
    pub store: Store,
    pub state: Arc<AppState>,
}

impl TestApp {
    pub fn new() -> Self {
        let config = ServerConfig::for_secrets(SESSION_SECRET, WEBHOOK_SECRET);
        let store = Store::memory();
        let state = Arc::new(AppState::new(&config, store.clone()));
        Self {
            router: app(state.clone()),
            store,
            state,
        }
    }

    pub async fn user(&self, clerk_id: &str, email: &str) -> User {
        users::upsert_by_external_id(
            &self.store,
            &UserProfile {
                username: format!("{} name", clerk_id),
                image_url: String::new(),
                clerk_id: clerk_id.to_string(),
                email: email.to_string(),
            },
        )
        .await
        .expect("seed user")
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn get(&self, subject: &str, path: &str) -> (StatusCode, Value) {
        let request = Request::get(path)
            .header("authorization", bearer(subject))
            .body(Body::empty())
            .expect("request");
        self.send(request).await
    }

    pub async fn post(&self, subject: &str, path: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(path)
            .header("authorization", bearer(subject))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        self.send(request).await
    }
}

pub fn bearer(subject: &str) -> String {
    let token = SessionVerifier::new(SESSION_SECRET).issue(&SessionClaims {
        sub: subject.to_string(),
        exp: None,
    })
    .expect("issue token");
    format!("Bearer {}", token)
}

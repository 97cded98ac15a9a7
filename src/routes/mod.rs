//! HTTP route handlers and router assembly.
//!
//! `/health` is open, the WebSocket paths check `?token=` themselves, and
//! everything under `/api` sits behind [`crate::auth::require_api_key`].

pub mod health;
pub mod local_files;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::{ws, AppState};

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/local-files", post(local_files::list))
        .route("/api/read-file", post(local_files::read))
        .route("/api/write-file", post(local_files::write))
        .route("/api/create-file", post(local_files::create))
        .route("/api/delete-files", post(local_files::delete))
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new()
        .route("/ws/ssh", get(ws::ssh_upgrade))
        .route("/ws/sftp", get(ws::sftp_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::bridge::tests::resolver;
    use crate::bridge::Bridge;
    use crate::config::Config;
    use crate::remote::mock::{MockConnection, MockConnector};

    fn app() -> Router {
        let mut config = Config::default();
        config.auth.api_key = "test-key".into();
        let bridge = Bridge::new(
            &config,
            MockConnector::new(MockConnection::new()),
            resolver(),
            None,
        );
        router(AppState::new(Arc::new(config), bridge))
    }

    fn list_request(auth: Option<&str>, dir: &str) -> Request<Body> {
        let mut builder = Request::post("/api/local-files").header("content-type", "application/json");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder
            .body(Body::from(format!(r#"{{"path":"{dir}"}}"#)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let resp = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["sessions"], 0);
    }

    #[tokio::test]
    async fn test_api_requires_bearer() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().display().to_string();

        let missing = app().oneshot(list_request(None, &dir)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app()
            .oneshot(list_request(Some("Bearer nope"), &dir))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

        let ok = app()
            .oneshot(list_request(Some("Bearer test-key"), &dir))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}

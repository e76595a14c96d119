//! HTTP routes: the JSON API with release downloads and the event stream on
//! the main listener, webhooks on their own listener.

pub mod api;
pub mod events;
pub mod webhook;

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::DingError;
use crate::services::webhook_service::constant_time_eq;
use crate::state::DingState;

/// Upper bound for API requests. Toolchain installs download a full release.
const API_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Router for the main listener (API, release downloads, events).
pub fn api_router(state: DingState) -> Router {
    let api = Router::new()
        .route("/status", get(api::status))
        // Repositories
        .route("/repos", get(api::list_repos).post(api::create_repo))
        .route(
            "/repos/{repo}",
            get(api::get_repo).put(api::save_repo).delete(api::remove_repo),
        )
        .route("/repos/{repo}/clear-home", post(api::clear_home))
        // Builds
        .route("/repos/{repo}/builds", get(api::list_builds).post(api::create_build))
        .route(
            "/repos/{repo}/builds/{id}",
            get(api::get_build).delete(api::remove_build),
        )
        .route("/repos/{repo}/builds/{id}/cancel", post(api::cancel_build))
        .route("/repos/{repo}/builds/{id}/release", post(api::release_build))
        .route("/repos/{repo}/builds/{id}/cleanup", post(api::cleanup_build))
        // Settings and operations
        .route("/settings", get(api::get_settings).put(api::save_settings))
        .route("/loglevel", post(api::set_log_level))
        .route("/toolchains", get(api::list_toolchains))
        .route("/toolchains/install", post(api::install_toolchain))
        .route("/toolchains/remove", post(api::remove_toolchain))
        .route("/toolchains/activate", post(api::activate_toolchain))
        .route("/toolchains/automatic", post(api::automatic_toolchains))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_password))
        .layer(TimeoutLayer::new(API_TIMEOUT));

    Router::new()
        .nest("/api", api)
        .route("/release/{repo}/{id}/{file}", get(api::download_release))
        .route("/events", get(events::stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the webhook listener.
pub fn webhook_router(state: DingState) -> Router {
    Router::new()
        .route("/github/{repo}", post(webhook::github))
        .route("/gitea/{repo}", post(webhook::gitea))
        .route("/bitbucket/{repo}/{secret}", post(webhook::bitbucket))
        .route("/gotoolchain", post(webhook::gotoolchain))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Authentication ──

async fn require_password(
    State(state): State<DingState>,
    req: Request,
    next: Next,
) -> Result<Response, DingError> {
    let given = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(given.as_bytes(), state.config.password.as_bytes()) {
        return Err(DingError::BadAuth);
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::models::build::BuildStatus;
    use crate::services::build_service;
    use crate::state::test_state;

    fn request(method: Method, uri: &str, password: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, password);
        match body {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, value)
    }

    fn command_repo(name: &str) -> Value {
        json!({
            "name": name,
            "vcs": "command",
            "origin": format!("mkdir -p checkout/{name} && echo commit: c0ffee"),
            "build_script": "#!/bin/sh\necho version: 1.2.3\n",
        })
    }

    #[tokio::test]
    async fn api_requires_password() {
        let (_dir, state) = test_state().await;
        let app = api_router(state);

        let (status, body) = send(&app, request(Method::GET, "/api/repos", "wrong", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "user:badAuth");

        let (status, body) = send(&app, request(Method::GET, "/api/status", "pw", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn repository_lifecycle() {
        let (_dir, state) = test_state().await;
        let app = api_router(state);

        let (status, repo) =
            send(&app, request(Method::POST, "/api/repos", "pw", Some(command_repo("r")))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(repo["checkout_path"], "r");
        assert_eq!(repo["default_branch"], "main");
        assert!(!repo["webhook_secret"].as_str().unwrap().is_empty());

        let (status, body) =
            send(&app, request(Method::POST, "/api/repos", "pw", Some(command_repo("r")))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "user:error");

        let mut changed = command_repo("other");
        changed["default_branch"] = json!("dev");
        let (status, _) = send(&app, request(Method::PUT, "/api/repos/r", "pw", Some(changed))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "names are immutable");

        let (status, _) = send(&app, request(Method::DELETE, "/api/repos/r", "pw", None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, request(Method::GET, "/api/repos/r", "pw", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "user:notFound");
    }

    #[tokio::test]
    async fn build_and_release_over_the_api() {
        let (_dir, state) = test_state().await;
        let app = api_router(state.clone());

        let (_, mut settings) = send(&app, request(Method::GET, "/api/settings", "pw", None)).await;
        settings["environment"] = json!(["PATH=/usr/local/bin:/usr/bin:/bin"]);
        send(&app, request(Method::PUT, "/api/settings", "pw", Some(settings))).await;

        let mut repo = command_repo("r");
        repo["build_script"] = json!(
            "#!/bin/sh\nset -e\necho hello > artifact.txt\necho version: 1.2.3\necho release: tool linux amd64 none artifact.txt\n"
        );
        let (status, _) = send(&app, request(Method::POST, "/api/repos", "pw", Some(repo))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, build) = send(
            &app,
            request(
                Method::POST,
                "/api/repos/r/builds",
                "pw",
                Some(json!({"branch": "main"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = build["id"].as_i64().unwrap();

        let mut finished = None;
        for _ in 0..200 {
            let mut conn = state.db.conn().await.unwrap();
            let b = build_service::get(&mut conn, "r", id).await.unwrap();
            if b.is_finished() {
                finished = Some(b);
                break;
            }
            drop(conn);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let finished = finished.expect("build finished");
        assert_eq!(finished.status, BuildStatus::Success, "{}", finished.error_message);

        let (status, detail) =
            send(&app, request(Method::GET, &format!("/api/repos/r/builds/{id}"), "pw", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["version"], "1.2.3");
        assert_eq!(detail["results"][0]["filename"], "artifact.txt");
        assert_eq!(detail["steps"].as_array().unwrap().len(), 2);

        let (status, _) = send(
            &app,
            request(Method::POST, &format!("/api/repos/r/builds/{id}/release"), "pw", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/release/r/{id}/artifact.txt"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello\n");

        let (status, body) = send(
            &app,
            request(Method::DELETE, &format!("/api/repos/r/builds/{id}"), "pw", None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "cannot remove a released build");
    }

    #[tokio::test]
    async fn settings_round_trip_and_validation() {
        let (_dir, state) = test_state().await;
        let app = api_router(state);

        let (status, mut settings) = send(&app, request(Method::GET, "/api/settings", "pw", None)).await;
        assert_eq!(status, StatusCode::OK);
        settings["environment"] = json!(["GOFLAGS=-mod=vendor"]);
        let (status, saved) =
            send(&app, request(Method::PUT, "/api/settings", "pw", Some(settings.clone()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(saved["environment"][0], "GOFLAGS=-mod=vendor");

        settings["environment"] = json!(["novalue"]);
        let (status, _) = send(&app, request(Method::PUT, "/api/settings", "pw", Some(settings))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn events_require_password() {
        let (_dir, state) = test_state().await;
        let app = api_router(state);
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/events?password=nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(Request::builder().uri("/events?password=pw").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
    }

    #[tokio::test]
    async fn webhooks_authenticate_and_schedule() {
        use hmac::{Hmac, Mac};

        let (_dir, state) = test_state().await;
        let api = api_router(state.clone());
        let hooks = webhook_router(state.clone());
        let mut repo = command_repo("r");
        repo["webhook_secret"] = json!("hooksecret");
        send(&api, request(Method::POST, "/api/repos", "pw", Some(repo))).await;

        let body = json!({"repository": {"name": "r"}, "ref": "refs/heads/dev", "after": "abc"}).to_string();
        let mut mac = Hmac::<sha1::Sha1>::new_from_slice(b"hooksecret").unwrap();
        mac.update(body.as_bytes());
        let signature = format!("sha1={}", hex::encode(mac.finalize().into_bytes()));

        let hook = |sig: &str| {
            Request::builder()
                .method(Method::POST)
                .uri("/github/r")
                .header("x-github-event", "push")
                .header("x-hub-signature", sig)
                .body(Body::from(body.clone()))
                .unwrap()
        };
        let resp = hooks.clone().oneshot(hook("sha1=0000000000000000000000000000000000000000")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = hooks.clone().oneshot(hook(&signature)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = hooks
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/github/missing")
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let mut conn = state.db.conn().await.unwrap();
        let builds = build_service::list(&mut conn, "r").await.unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].branch, "dev");
    }

    #[tokio::test]
    async fn gotoolchain_needs_configured_secret() {
        let (_dir, state) = test_state().await;
        let hooks = webhook_router(state);
        let resp = hooks
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/gotoolchain")
                    .header(header::AUTHORIZATION, "")
                    .body(Body::from(r#"{"Module":"golang.org/toolchain","Version":"v0.0.1-go1.24.1.plan9-mips"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}

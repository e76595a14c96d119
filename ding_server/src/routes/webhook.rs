//! Webhook handlers: GitHub, Gitea, Bitbucket and Go toolchain
//! announcements. Replies are plain text.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::services::webhook_service::{
    self, Provider, ToolchainAnnouncement, WebhookError, WebhookResult,
};
use crate::services::settings_service;
use crate::state::DingState;

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.to_string()),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Misconfigured(m) => {
                tracing::error!(error = %m, "misconfigured webhook");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("misconfigured webhook: {m}"))
            }
            Self::Server(e) => {
                tracing::error!(error = %e, "webhook failed with server error");
                (StatusCode::INTERNAL_SERVER_ERROR, e.public_message())
            }
        };
        crate::metrics::error_recorded("webhook");
        (status, format!("{} - {message}\n", status.as_u16())).into_response()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Non-push events, such as the ping sent when a hook is added, are
/// acknowledged without building.
fn is_push(headers: &HeaderMap, event_header: &str) -> bool {
    match headers.get(event_header).and_then(|v| v.to_str().ok()) {
        Some(event) => event == "push",
        None => true,
    }
}

// ── Repository hooks ──

pub async fn github(
    State(state): State<DingState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult<StatusCode> {
    crate::metrics::webhook_received(Provider::Github.as_str());
    if !is_push(&headers, "x-github-event") {
        return Ok(StatusCode::NO_CONTENT);
    }
    let signature = header_str(&headers, "x-hub-signature");
    webhook_service::handle(
        &state,
        Provider::Github,
        &repo,
        |secrets| webhook_service::verify_github(secrets, &body, signature),
        &body,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn gitea(
    State(state): State<DingState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult<StatusCode> {
    crate::metrics::webhook_received(Provider::Gitea.as_str());
    if !is_push(&headers, "x-gitea-event") {
        return Ok(StatusCode::NO_CONTENT);
    }
    let authorization = header_str(&headers, header::AUTHORIZATION.as_str());
    webhook_service::handle(
        &state,
        Provider::Gitea,
        &repo,
        |secrets| webhook_service::verify_bearer(secrets, authorization),
        &body,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn bitbucket(
    State(state): State<DingState>,
    Path((repo, secret)): Path<(String, String)>,
    body: Bytes,
) -> WebhookResult<StatusCode> {
    crate::metrics::webhook_received(Provider::Bitbucket.as_str());
    webhook_service::handle(
        &state,
        Provider::Bitbucket,
        &repo,
        |secrets| webhook_service::verify_url_secret(secrets, &secret),
        &body,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Go toolchains ──

/// A new Go toolchain module was published. Toolchains for this platform
/// trigger an update in the background.
pub async fn gotoolchain(
    State(state): State<DingState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult<&'static str> {
    crate::metrics::webhook_received("gotoolchain");
    let mut conn = state.db.conn().await?;
    let settings = settings_service::get(&mut conn).await?;
    drop(conn);

    let secret = settings.gotoolchain_webhook_secret.as_str();
    if secret.is_empty() {
        return Err(WebhookError::Unauthorized("no go toolchain webhook secret configured"));
    }
    let given = header_str(&headers, header::AUTHORIZATION.as_str());
    if !webhook_service::constant_time_eq(secret.as_bytes(), given.as_bytes()) {
        return Err(WebhookError::Unauthorized("bad authorization header"));
    }

    let announcement: ToolchainAnnouncement = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::BadRequest(format!("parsing json: {e}")))?;
    if webhook_service::for_this_platform(&announcement.version) {
        tracing::info!(
            module = %announcement.module,
            version = %announcement.version,
            "new go toolchain announced"
        );
        tokio::spawn(webhook_service::update_toolchains(
            state.clone(),
            webhook_service::TOOLCHAIN_RETRY,
        ));
    }
    Ok("ok")
}

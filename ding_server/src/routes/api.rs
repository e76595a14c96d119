//! JSON API handlers. The password check happens in the router.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::error::{DingError, Result, ServerContext};
use crate::ipc::toolchain::{self, ActiveToolchains};
use crate::ipc::{GoFile, Msg};
use crate::models::build::{Build, BuildDetail};
use crate::models::repo::{Repo, Vcs};
use crate::models::settings::Settings;
use crate::models::StringList;
use crate::services::{build_service, repo_service, settings_service, webhook_service};
use crate::state::DingState;

// ── Status ──

#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub ok: bool,
    pub version: String,
}

pub async fn status(State(state): State<DingState>) -> Result<Json<Status>> {
    let mut conn = state.db.conn().await?;
    diesel::sql_query("SELECT 1").execute(&mut *conn).await?;
    Ok(Json(Status {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

// ── Repositories ──

/// A repository as sent by clients. Usage counters are not client-settable.
#[derive(Debug, Deserialize)]
pub struct RepoRequest {
    pub name: String,
    pub vcs: Vcs,
    pub origin: String,
    #[serde(default)]
    pub default_branch: String,
    /// Defaults to the repository name.
    #[serde(default)]
    pub checkout_path: String,
    #[serde(default)]
    pub build_script: String,
    /// Any value asks for a fixed uid; the server picks it.
    #[serde(default)]
    pub uid: Option<i64>,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default)]
    pub allow_global_webhook_secrets: bool,
    #[serde(default)]
    pub bubblewrap: bool,
    #[serde(default)]
    pub bubblewrap_no_net: bool,
    #[serde(default)]
    pub build_on_updated_toolchain: bool,
    #[serde(default)]
    pub notify_emails: StringList,
}

impl RepoRequest {
    fn into_repo(self) -> Repo {
        let default_branch = match (self.default_branch.is_empty(), self.vcs) {
            (false, _) => self.default_branch,
            (true, Vcs::Mercurial) => "default".to_string(),
            (true, _) => "main".to_string(),
        };
        let checkout_path = if self.checkout_path.is_empty() {
            self.name.clone()
        } else {
            self.checkout_path
        };
        Repo {
            name: self.name,
            vcs: self.vcs,
            origin: self.origin,
            default_branch,
            checkout_path,
            build_script: self.build_script,
            uid: self.uid,
            home_disk_usage: 0,
            webhook_secret: self.webhook_secret,
            allow_global_webhook_secrets: self.allow_global_webhook_secrets,
            bubblewrap: self.bubblewrap,
            bubblewrap_no_net: self.bubblewrap_no_net,
            build_on_updated_toolchain: self.build_on_updated_toolchain,
            notify_emails: self.notify_emails,
        }
    }
}

pub async fn list_repos(State(state): State<DingState>) -> Result<Json<Vec<Repo>>> {
    let mut conn = state.db.conn().await?;
    Ok(Json(repo_service::list(&mut conn).await?))
}

/// New repositories get a random webhook secret unless one is given.
pub async fn create_repo(
    State(state): State<DingState>,
    Json(req): Json<RepoRequest>,
) -> Result<(StatusCode, Json<Repo>)> {
    let mut repo = req.into_repo();
    if repo.webhook_secret.is_empty() {
        repo.webhook_secret = uuid::Uuid::new_v4().simple().to_string();
    }
    let repo = repo_service::create(&state, repo).await?;
    Ok((StatusCode::CREATED, Json(repo)))
}

pub async fn get_repo(
    State(state): State<DingState>,
    Path(name): Path<String>,
) -> Result<Json<Repo>> {
    let mut conn = state.db.conn().await?;
    Ok(Json(repo_service::get(&mut conn, &name).await?))
}

pub async fn save_repo(
    State(state): State<DingState>,
    Path(name): Path<String>,
    Json(req): Json<RepoRequest>,
) -> Result<Json<Repo>> {
    Ok(Json(repo_service::save(&state, &name, req.into_repo()).await?))
}

pub async fn remove_repo(
    State(state): State<DingState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    repo_service::remove(&state, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_home(
    State(state): State<DingState>,
    Path(name): Path<String>,
) -> Result<Json<Repo>> {
    Ok(Json(repo_service::clear_home(&state, &name).await?))
}

// ── Builds ──

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateBuild {
    pub branch: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub low_prio: bool,
}

pub async fn list_builds(
    State(state): State<DingState>,
    Path(repo): Path<String>,
) -> Result<Json<Vec<Build>>> {
    let mut conn = state.db.conn().await?;
    Ok(Json(build_service::list(&mut conn, &repo).await?))
}

pub async fn create_build(
    State(state): State<DingState>,
    Path(repo): Path<String>,
    Json(req): Json<CreateBuild>,
) -> Result<(StatusCode, Json<Build>)> {
    let build = build_service::create(&state, &repo, &req.branch, &req.commit, req.low_prio).await?;
    Ok((StatusCode::CREATED, Json(build)))
}

pub async fn get_build(
    State(state): State<DingState>,
    Path((repo, id)): Path<(String, i64)>,
) -> Result<Json<BuildDetail>> {
    let mut conn = state.db.conn().await?;
    Ok(Json(build_service::detail(&mut conn, &repo, id).await?))
}

pub async fn remove_build(
    State(state): State<DingState>,
    Path((repo, id)): Path<(String, i64)>,
) -> Result<StatusCode> {
    build_service::remove(&state, &repo, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_build(
    State(state): State<DingState>,
    Path((repo, id)): Path<(String, i64)>,
) -> Result<Json<Build>> {
    Ok(Json(build_service::cancel(&state, &repo, id).await?))
}

pub async fn release_build(
    State(state): State<DingState>,
    Path((repo, id)): Path<(String, i64)>,
) -> Result<Json<Build>> {
    Ok(Json(build_service::release(&state, &repo, id).await?))
}

pub async fn cleanup_build(
    State(state): State<DingState>,
    Path((repo, id)): Path<(String, i64)>,
) -> Result<Json<Build>> {
    Ok(Json(build_service::cleanup(&state, &repo, id).await?))
}

/// Released files are stored gzipped and served as such to clients that
/// accept gzip, decompressed otherwise.
pub async fn download_release(
    State(state): State<DingState>,
    Path((repo, id, file)): Path<(String, i64, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let path = build_service::released_file(&state, &repo, id, &file).await?;
    let accepts_gzip = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|e| e.trim().starts_with("gzip")));
    let disposition = format!("attachment; filename=\"{}\"", file.replace('"', ""));

    if accepts_gzip {
        let f = tokio::fs::File::open(&path)
            .await
            .server_context("opening released file")?;
        let body = Body::from_stream(tokio_util::io::ReaderStream::new(f));
        return Ok((
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_ENCODING, "gzip".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            body,
        )
            .into_response());
    }

    let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        use std::io::Read;
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(std::fs::File::open(&path)?).read_to_end(&mut out)?;
        Ok(out)
    })
    .await
    .server_context("decompress task")?
    .server_context("reading released file")?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}

// ── Settings ──

pub async fn get_settings(State(state): State<DingState>) -> Result<Json<Settings>> {
    let mut conn = state.db.conn().await?;
    Ok(Json(settings_service::get(&mut conn).await?))
}

pub async fn save_settings(
    State(state): State<DingState>,
    Json(settings): Json<Settings>,
) -> Result<Json<Settings>> {
    Ok(Json(settings_service::save(&state.db, settings).await?))
}

// ── Log level ──

#[derive(Debug, Deserialize)]
pub struct LogLevel {
    pub level: String,
}

/// Change the filter here first; a bad level never reaches the root process.
pub async fn set_log_level(
    State(state): State<DingState>,
    Json(req): Json<LogLevel>,
) -> Result<StatusCode> {
    if let Some(handle) = &state.log {
        crate::logging::set_level(handle, &req.level).map_err(DingError::User)?;
    }
    state
        .root
        .call_user(Msg::LogLevelSet { level: req.level })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Toolchains ──

#[derive(Debug, Serialize)]
pub struct Toolchains {
    pub installed: Vec<String>,
    pub active: ActiveToolchains,
}

#[derive(Debug, Deserialize)]
pub struct InstallToolchain {
    pub file: GoFile,
    pub shortname: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoveToolchain {
    pub goversion: String,
}

#[derive(Debug, Deserialize)]
pub struct ActivateToolchain {
    pub goversion: String,
    pub shortname: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AutomaticResult {
    pub updated: bool,
    /// Low-priority builds scheduled because of the update.
    pub builds: Vec<i64>,
}

pub async fn list_toolchains(State(state): State<DingState>) -> Result<Json<Toolchains>> {
    let dir = state
        .config
        .go_toolchain_dir
        .clone()
        .ok_or_else(|| DingError::user("no toolchain directory configured"))?;
    let toolchains = tokio::task::spawn_blocking(move || -> std::io::Result<Toolchains> {
        Ok(Toolchains {
            installed: toolchain::installed(&dir)?,
            active: toolchain::active(&dir),
        })
    })
    .await
    .server_context("toolchain listing task")?
    .server_context("listing toolchains")?;
    Ok(Json(toolchains))
}

pub async fn install_toolchain(
    State(state): State<DingState>,
    Json(req): Json<InstallToolchain>,
) -> Result<StatusCode> {
    state
        .root
        .call_user(Msg::InstallGoTool {
            file: req.file,
            shortname: req.shortname,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_toolchain(
    State(state): State<DingState>,
    Json(req): Json<RemoveToolchain>,
) -> Result<StatusCode> {
    state
        .root
        .call_user(Msg::RemoveGoTool {
            goversion: req.goversion,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn activate_toolchain(
    State(state): State<DingState>,
    Json(req): Json<ActivateToolchain>,
) -> Result<StatusCode> {
    state
        .root
        .call_user(Msg::ActivateGoTool {
            goversion: req.goversion,
            shortname: req.shortname,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn automatic_toolchains(State(state): State<DingState>) -> Result<Json<AutomaticResult>> {
    let updated = state.root.automatic_go_toolchain().await?;
    let builds = if updated {
        webhook_service::schedule_low_prio_builds(&state).await?
    } else {
        Vec::new()
    };
    Ok(Json(AutomaticResult { updated, builds }))
}

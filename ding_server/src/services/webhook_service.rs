//! Webhook payloads and authentication for GitHub, Gitea, Bitbucket and Go
//! toolchain announcements.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;

use super::{build_service, repo_service, settings_service};
use crate::error::DingError;
use crate::models::repo::{Repo, Vcs};
use crate::models::settings::Settings;
use crate::state::DingState;

type HmacSha1 = Hmac<Sha1>;

/// Wait before the second attempt at updating toolchains.
pub const TOOLCHAIN_RETRY: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
pub enum WebhookError {
    NotFound,
    Unauthorized(&'static str),
    BadRequest(String),
    /// The repository's vcs does not match the sender.
    Misconfigured(String),
    Server(DingError),
}

impl From<DingError> for WebhookError {
    fn from(e: DingError) -> Self {
        match e {
            DingError::NotFound(_) => Self::NotFound,
            e => Self::Server(e),
        }
    }
}

pub type WebhookResult<T> = Result<T, WebhookError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Github,
    Gitea,
    Bitbucket,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitea => "gitea",
            Self::Bitbucket => "bitbucket",
        }
    }

    fn global_secret(self, settings: &Settings) -> &str {
        match self {
            Self::Github => &settings.github_webhook_secret,
            Self::Gitea => &settings.gitea_webhook_secret,
            Self::Bitbucket => &settings.bitbucket_webhook_secret,
        }
    }
}

/// Secrets a repository accepts for a provider. Empty secrets never count.
pub fn secrets<'a>(repo: &'a Repo, settings: &'a Settings, provider: Provider) -> Vec<&'a str> {
    let mut out = Vec::new();
    if !repo.webhook_secret.is_empty() {
        out.push(repo.webhook_secret.as_str());
    }
    let global = provider.global_secret(settings);
    if repo.allow_global_webhook_secrets && !global.is_empty() {
        out.push(global);
    }
    out
}

/// Compare secrets without exiting early on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check `X-Hub-Signature: sha1=<hex>` against any of the secrets.
pub fn verify_github(secrets: &[&str], body: &[u8], header: &str) -> WebhookResult<()> {
    let hex_sig = header
        .trim()
        .strip_prefix("sha1=")
        .filter(|h| h.len() == 40)
        .ok_or_else(|| WebhookError::BadRequest("malformed or missing X-Hub-Signature header".into()))?;
    let sig = hex::decode(hex_sig)
        .map_err(|_| WebhookError::BadRequest("malformed hex in X-Hub-Signature".into()))?;
    let ok = secrets.iter().any(|secret| {
        HmacSha1::new_from_slice(secret.as_bytes())
            .map(|mut mac| {
                mac.update(body);
                mac.verify_slice(&sig).is_ok()
            })
            .unwrap_or(false)
    });
    if ok {
        Ok(())
    } else {
        Err(WebhookError::Unauthorized("invalid signature"))
    }
}

/// Check `Authorization: Bearer <secret>`.
pub fn verify_bearer(secrets: &[&str], header: &str) -> WebhookResult<()> {
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(WebhookError::Unauthorized("missing bearer token"))?;
    if secrets
        .iter()
        .any(|s| constant_time_eq(s.as_bytes(), token.as_bytes()))
    {
        Ok(())
    } else {
        Err(WebhookError::Unauthorized("invalid bearer token"))
    }
}

pub fn verify_url_secret(secrets: &[&str], given: &str) -> WebhookResult<()> {
    if secrets
        .iter()
        .any(|s| constant_time_eq(s.as_bytes(), given.as_bytes()))
    {
        Ok(())
    } else {
        Err(WebhookError::NotFound)
    }
}

/// A requested build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub branch: String,
    pub commit: String,
}

#[derive(Deserialize)]
struct PushEvent {
    repository: RepositoryRef,
    #[serde(default)]
    r#ref: String,
    #[serde(default)]
    after: String,
}

#[derive(Deserialize)]
struct RepositoryRef {
    name: String,
    #[serde(default)]
    scm: String,
}

/// GitHub and Gitea push payloads. Refs outside `refs/heads/` build the
/// default branch.
pub fn parse_push(repo: &Repo, body: &[u8]) -> WebhookResult<Trigger> {
    let event: PushEvent =
        serde_json::from_slice(body).map_err(|e| WebhookError::BadRequest(format!("bad json: {e}")))?;
    if event.repository.name != repo.name {
        return Err(WebhookError::BadRequest("repository mismatch".into()));
    }
    let branch = event
        .r#ref
        .strip_prefix("refs/heads/")
        .unwrap_or(&repo.default_branch)
        .to_string();
    Ok(Trigger {
        branch,
        commit: event.after,
    })
}

/// GitHub and Gitea only send git pushes.
pub fn check_git(repo: &Repo) -> WebhookResult<()> {
    match repo.vcs {
        Vcs::Git | Vcs::Command => Ok(()),
        Vcs::Mercurial => Err(WebhookError::Misconfigured(
            "push event for a non-git repository".into(),
        )),
    }
}

#[derive(Deserialize)]
struct BitbucketEvent {
    push: Option<BitbucketPush>,
    repository: RepositoryRef,
}

#[derive(Deserialize)]
struct BitbucketPush {
    #[serde(default)]
    changes: Vec<BitbucketChange>,
}

#[derive(Deserialize)]
struct BitbucketChange {
    /// Absent for deleted branches.
    new: Option<BitbucketRef>,
}

#[derive(Deserialize)]
struct BitbucketRef {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    target: Option<BitbucketTarget>,
}

#[derive(Deserialize)]
struct BitbucketTarget {
    #[serde(rename = "type")]
    kind: String,
    hash: String,
}

/// Bitbucket push payloads, one trigger per pushed branch or tag. Tags build
/// the default branch; bookmarks are ignored.
pub fn parse_bitbucket(repo: &Repo, body: &[u8]) -> WebhookResult<Vec<Trigger>> {
    let event: BitbucketEvent =
        serde_json::from_slice(body).map_err(|e| WebhookError::BadRequest(format!("bad json: {e}")))?;
    if event.repository.name != repo.name {
        return Err(WebhookError::BadRequest("repository mismatch".into()));
    }
    let scm_ok = match event.repository.scm.as_str() {
        "git" => matches!(repo.vcs, Vcs::Git | Vcs::Command),
        "hg" => matches!(repo.vcs, Vcs::Mercurial | Vcs::Command),
        _ => false,
    };
    if !scm_ok {
        return Err(WebhookError::Misconfigured(format!(
            "bitbucket reports scm {:?}, repository uses {}",
            event.repository.scm, repo.vcs
        )));
    }
    let push = event
        .push
        .ok_or_else(|| WebhookError::BadRequest("missing push event".into()))?;

    let mut triggers = Vec::new();
    for new in push.changes.into_iter().filter_map(|c| c.new) {
        let branch = match new.kind.as_str() {
            "branch" | "named_branch" => new.name,
            "tag" => repo.default_branch.clone(),
            _ => continue,
        };
        match new.target {
            Some(t) if t.kind == "commit" => triggers.push(Trigger {
                branch,
                commit: t.hash,
            }),
            _ => return Err(WebhookError::BadRequest("push without a commit target".into())),
        }
    }
    Ok(triggers)
}

/// Authenticate and schedule builds for a repository webhook.
pub async fn handle(
    state: &DingState,
    provider: Provider,
    repo_name: &str,
    authorize: impl FnOnce(&[&str]) -> WebhookResult<()>,
    body: &[u8],
) -> WebhookResult<Vec<i64>> {
    let mut conn = state.db.conn().await?;
    let repo = repo_service::get(&mut conn, repo_name).await?;
    let settings = settings_service::get(&mut conn).await?;
    drop(conn);

    let secrets = secrets(&repo, &settings, provider);
    if secrets.is_empty() {
        return Err(WebhookError::NotFound);
    }
    authorize(&secrets)?;

    let triggers = match provider {
        Provider::Github | Provider::Gitea => {
            check_git(&repo)?;
            vec![parse_push(&repo, body)?]
        }
        Provider::Bitbucket => parse_bitbucket(&repo, body)?,
    };

    let mut ids = Vec::with_capacity(triggers.len());
    for t in triggers {
        let build = build_service::create(state, &repo.name, &t.branch, &t.commit, false)
            .await
            .map_err(|e| match e {
                DingError::User(m) => WebhookError::BadRequest(m),
                e => WebhookError::Server(e),
            })?;
        tracing::info!(
            build_id = build.id,
            repo = %repo.name,
            provider = provider.as_str(),
            branch = %t.branch,
            "build scheduled from webhook"
        );
        ids.push(build.id);
    }
    Ok(ids)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ToolchainAnnouncement {
    #[serde(default)]
    pub module: String,
    pub version: String,
}

/// Whether an announced toolchain module version is for this platform,
/// e.g. `v0.0.1-go1.24.1.linux-amd64`.
pub fn for_this_platform(version: &str) -> bool {
    let (os, arch) = crate::ipc::toolchain::go_platform();
    version.ends_with(&format!(".{os}-{arch}"))
}

/// Try to update toolchains, once more after [`TOOLCHAIN_RETRY`] when
/// nothing changed. Schedules low-priority builds after an update.
pub async fn update_toolchains(state: DingState, retry: Duration) {
    for attempt in 1..=2 {
        tracing::info!(attempt, "updating go toolchains");
        match state.root.automatic_go_toolchain().await {
            Ok(true) => {
                if let Err(e) = schedule_low_prio_builds(&state).await {
                    tracing::error!(error = %e, "scheduling builds after toolchain update");
                }
                return;
            }
            Ok(false) => tracing::info!(attempt, "go toolchains not updated"),
            Err(e) => tracing::error!(attempt, error = %e, "updating go toolchains"),
        }
        if attempt == 1 {
            tokio::time::sleep(retry).await;
        }
    }
}

/// A low-priority build of the default branch for every repository that
/// follows toolchain updates.
pub async fn schedule_low_prio_builds(state: &DingState) -> crate::error::Result<Vec<i64>> {
    let mut conn = state.db.conn().await?;
    let repos = repo_service::toolchain_followers(&mut conn).await?;
    drop(conn);
    let mut ids = Vec::new();
    for repo in repos {
        let build = build_service::create(state, &repo.name, &repo.default_branch, "", true).await?;
        tracing::info!(build_id = build.id, repo = %repo.name, "low priority build for new toolchain");
        ids.push(build.id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::repo_service::tests::repo;

    fn settings() -> Settings {
        Settings {
            id: 1,
            notify_emails: Default::default(),
            github_webhook_secret: "global".into(),
            gitea_webhook_secret: String::new(),
            bitbucket_webhook_secret: "bbglobal".into(),
            gotoolchain_webhook_secret: String::new(),
            run_prefix: Default::default(),
            environment: Default::default(),
            auto_go_toolchain: false,
        }
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn global_secrets_need_opt_in() {
        let mut r = repo("r");
        let s = settings();
        assert_eq!(secrets(&r, &s, Provider::Github), vec!["s3cret"]);
        r.allow_global_webhook_secrets = true;
        assert_eq!(secrets(&r, &s, Provider::Github), vec!["s3cret", "global"]);
        assert_eq!(secrets(&r, &s, Provider::Gitea), vec!["s3cret"]);
        r.webhook_secret.clear();
        r.allow_global_webhook_secrets = false;
        assert!(secrets(&r, &s, Provider::Github).is_empty());
    }

    #[test]
    fn github_signatures() {
        let body = br#"{"repository":{"name":"r"},"ref":"refs/heads/dev","after":"abc"}"#;
        assert!(verify_github(&["s3cret"], body, &sign("s3cret", body)).is_ok());
        assert!(verify_github(&["other", "s3cret"], body, &sign("s3cret", body)).is_ok());
        assert!(matches!(
            verify_github(&["s3cret"], body, &sign("wrong", body)),
            Err(WebhookError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_github(&["s3cret"], body, "sha256=00"),
            Err(WebhookError::BadRequest(_))
        ));
    }

    #[test]
    fn bearer_and_url_secrets() {
        assert!(verify_bearer(&["tok"], "Bearer tok").is_ok());
        assert!(verify_bearer(&["tok"], "Bearer nope").is_err());
        assert!(verify_bearer(&["tok"], "tok").is_err());
        assert!(verify_url_secret(&["tok"], "tok").is_ok());
        assert!(matches!(verify_url_secret(&["tok"], "x"), Err(WebhookError::NotFound)));
    }

    #[test]
    fn push_payloads() {
        let r = repo("r");
        let t = parse_push(&r, br#"{"repository":{"name":"r"},"ref":"refs/heads/dev","after":"abc"}"#).unwrap();
        assert_eq!(t, Trigger { branch: "dev".into(), commit: "abc".into() });
        let t = parse_push(&r, br#"{"repository":{"name":"r"},"ref":"refs/tags/v1","after":"def"}"#).unwrap();
        assert_eq!(t.branch, "main");
        assert!(parse_push(&r, br#"{"repository":{"name":"other"}}"#).is_err());
        assert!(parse_push(&r, b"not json").is_err());
    }

    #[test]
    fn bitbucket_payloads() {
        let mut r = repo("r");
        r.vcs = Vcs::Git;
        let body = br#"{
            "repository": {"name": "r", "scm": "git"},
            "push": {"changes": [
                {"new": {"type": "branch", "name": "dev", "target": {"type": "commit", "hash": "abc"}}},
                {"new": null},
                {"new": {"type": "bookmark", "name": "b", "target": {"type": "commit", "hash": "x"}}},
                {"new": {"type": "tag", "name": "v1", "target": {"type": "commit", "hash": "def"}}}
            ]}
        }"#;
        let triggers = parse_bitbucket(&r, body).unwrap();
        assert_eq!(
            triggers,
            vec![
                Trigger { branch: "dev".into(), commit: "abc".into() },
                Trigger { branch: "main".into(), commit: "def".into() },
            ]
        );

        r.vcs = Vcs::Mercurial;
        assert!(matches!(parse_bitbucket(&r, body), Err(WebhookError::Misconfigured(_))));
    }

    #[test]
    fn git_only_providers() {
        let mut r = repo("r");
        assert!(check_git(&r).is_ok());
        r.vcs = Vcs::Mercurial;
        assert!(matches!(check_git(&r), Err(WebhookError::Misconfigured(_))));
    }

    #[test]
    fn platform_suffix() {
        let (os, arch) = crate::ipc::toolchain::go_platform();
        assert!(for_this_platform(&format!("v0.0.1-go1.24.1.{os}-{arch}")));
        assert!(!for_this_platform("v0.0.1-go1.24.1.plan9-mips"));
    }
}

//! `ding kick`: request a build through the API, e.g. from a post-receive
//! hook.

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::routes::api::CreateBuild;

#[derive(Deserialize)]
struct Created {
    id: i64,
}

#[derive(Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

/// Create a build and return its id.
pub async fn kick(
    base_url: &str,
    password: &str,
    repo: &str,
    branch: &str,
    commit: &str,
) -> anyhow::Result<i64> {
    let url = format!("{}/api/repos/{repo}/builds", base_url.trim_end_matches('/'));
    let resp = reqwest::Client::new()
        .post(&url)
        .header(reqwest::header::AUTHORIZATION, password)
        .json(&CreateBuild {
            branch: branch.to_string(),
            commit: commit.to_string(),
            low_prio: false,
        })
        .send()
        .await
        .with_context(|| format!("posting to {url}"))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ApiError>(&text) {
            Ok(e) => bail!("{status}: {} ({})", e.message, e.code),
            Err(_) => bail!("{status}: {}", text.trim()),
        }
    }
    let created: Created = resp.json().await.context("parsing response")?;
    Ok(created.id)
}

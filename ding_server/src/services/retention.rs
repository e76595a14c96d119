//! Retention of old builds, and recovery of builds interrupted by a restart.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::RunQueryDsl;

use super::{build_service, executor, repo_service};
use crate::error::Result;
use crate::events::DingEvent;
use crate::ipc::Msg;
use crate::models::build::{Build, BuildStatus};
use crate::models::repo::Repo;
use crate::schema::builds;
use crate::state::DingState;

/// Released builds keep their directory this long after finishing.
pub const RELEASED_DIR_DAYS: i64 = 60;
/// Builds beyond the newest [`KEEP_PER_BRANCH`] of a branch are removed
/// once they are this old.
pub const UNRELEASED_DAYS: i64 = 30;
pub const KEEP_PER_BRANCH: usize = 10;

/// Error stored on builds that were running when the server stopped.
pub const UNFINISHED_AT_STARTUP: &str = "marked as failed/unfinished at ding startup.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Remove the directory, keep the record.
    RemoveDir(i64),
    /// Remove the record and the directory.
    Discard(i64),
}

/// Decide what to clean up. `builds` are ordered newest first.
pub fn plan(builds: &[Build], now: DateTime<Utc>) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for b in builds {
        let index = seen.entry(b.branch.as_str()).or_default();
        let position = *index;
        *index += 1;

        let Some(finish) = b.finish else { continue };
        let age = now - finish;
        if b.released.is_some() {
            if !b.builddir_removed && age > Duration::days(RELEASED_DIR_DAYS) {
                actions.push(Action::RemoveDir(b.id));
            }
            continue;
        }
        if position >= KEEP_PER_BRANCH && age > Duration::days(UNRELEASED_DAYS) {
            actions.push(Action::Discard(b.id));
        }
    }
    actions
}

/// Apply retention to all builds of a repository. A failure for one build
/// does not stop the others.
pub async fn cleanup(state: &DingState, repo: &Repo) -> Result<()> {
    let mut conn = state.db.conn().await?;
    let all = builds::table
        .filter(builds::repo_name.eq(&repo.name))
        .order(builds::id.desc())
        .select(Build::as_select())
        .load(&mut conn)
        .await?;
    drop(conn);

    for action in plan(&all, Utc::now()) {
        let result = match action {
            Action::RemoveDir(build_id) => remove_dir(state, repo, build_id).await,
            Action::Discard(build_id) => discard(state, repo, build_id).await,
        };
        if let Err(e) = result {
            tracing::warn!(repo = %repo.name, ?action, error = %e, "cleaning up build");
        }
    }
    Ok(())
}

async fn remove_dir(state: &DingState, repo: &Repo, build_id: i64) -> Result<()> {
    state
        .root
        .call(Msg::RemoveBuildDir {
            repo_name: repo.name.clone(),
            build_id,
        })
        .await?;
    let build = build_service::mark_builddir_removed(state, build_id).await?;
    tracing::info!(build_id, repo = %repo.name, "removed directory of released build");
    state.events.publish(DingEvent::build(&build));
    Ok(())
}

async fn discard(state: &DingState, repo: &Repo, build_id: i64) -> Result<()> {
    state
        .db
        .transact(|conn| {
            async move {
                diesel::delete(builds::table.find(build_id).filter(builds::released.is_null()))
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await?;
    state
        .root
        .call(Msg::RemoveBuildDir {
            repo_name: repo.name.clone(),
            build_id,
        })
        .await?;
    tracing::info!(build_id, repo = %repo.name, "removed old build");
    state.events.publish(DingEvent::RemoveBuild {
        repo_name: repo.name.clone(),
        build_id,
    });
    Ok(())
}

/// Fail builds that were running when the server stopped and queue builds
/// that had not started yet.
pub async fn recover(state: &DingState) -> Result<()> {
    let interrupted = state
        .db
        .transact(|conn| {
            async move {
                let interrupted: Vec<Build> = diesel::update(
                    builds::table
                        .filter(builds::finish.is_null())
                        .filter(builds::status.ne(BuildStatus::New)),
                )
                .set((
                    builds::finish.eq(Some(Utc::now())),
                    builds::error_message.eq(UNFINISHED_AT_STARTUP),
                ))
                .returning(Build::as_returning())
                .get_results(conn)
                .await?;
                Ok(interrupted)
            }
            .scope_boxed()
        })
        .await?;
    for build in &interrupted {
        tracing::warn!(build_id = build.id, repo = %build.repo_name, "build was unfinished at startup");
        state.events.publish(DingEvent::build(build));
    }

    let mut conn = state.db.conn().await?;
    let pending = builds::table
        .filter(builds::finish.is_null())
        .filter(builds::status.eq(BuildStatus::New))
        .order(builds::id.asc())
        .select(Build::as_select())
        .load(&mut conn)
        .await?;
    let mut repos: HashMap<String, Repo> = HashMap::new();
    for build in pending {
        if !repos.contains_key(&build.repo_name) {
            let repo = repo_service::get(&mut conn, &build.repo_name).await?;
            repos.insert(repo.name.clone(), repo);
        }
        if let Some(repo) = repos.get(&build.repo_name) {
            tracing::info!(build_id = build.id, repo = %repo.name, "queueing build left at startup");
            executor::spawn(state.clone(), repo.clone(), build);
        }
    }
    Ok(())
}

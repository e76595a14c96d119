//! Build records: create, list, remove, cancel, release.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::RunQueryDsl;

use super::repo_service;
use crate::db::DbConn;
use crate::error::{DingError, Result, ServerContext};
use crate::events::DingEvent;
use crate::ipc::Msg;
use crate::models::build::{Build, BuildDetail, BuildStatus, NewBuild};
use crate::models::repo::Repo;
use crate::models::result::BuildResult;
use crate::models::step::Step;
use crate::paths::DataDir;
use crate::schema::{builds, results, steps};
use crate::state::DingState;

/// Branch names end up as command arguments.
fn validate_branch(branch: &str) -> Result<()> {
    if branch.is_empty() || branch.starts_with('-') || branch.chars().any(char::is_whitespace) {
        return Err(DingError::user(format!("invalid branch {branch:?}")));
    }
    Ok(())
}

fn validate_commit(commit: &str) -> Result<()> {
    if commit.starts_with('-') || commit.chars().any(char::is_whitespace) {
        return Err(DingError::user(format!("invalid commit {commit:?}")));
    }
    Ok(())
}

/// Create the directory skeleton of a build with its build script.
async fn make_skeleton(data: &DataDir, repo: &Repo, build: &Build) -> Result<()> {
    let build_dir = data.build_dir(&repo.name, build.id)?;
    for sub in ["scripts", "checkout", "output", "dl"] {
        tokio::fs::create_dir_all(build_dir.join(sub))
            .await
            .server_context("creating build directory")?;
    }
    let home = data.home_dir(&repo.name, build.id, repo.shared_home())?;
    tokio::fs::create_dir_all(&home)
        .await
        .server_context("creating home directory")?;

    let script = build_dir.join("scripts/build.sh");
    tokio::fs::write(&script, build.build_script.replace("\r\n", "\n"))
        .await
        .server_context("writing build script")?;
    tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .await
        .server_context("making build script executable")?;
    Ok(())
}

/// Insert a build in state `new` and lay out its directory. Nothing is
/// recorded when the directory cannot be created.
pub async fn prepare(
    state: &DingState,
    repo_name: &str,
    branch: &str,
    commit: &str,
    low_prio: bool,
) -> Result<(Repo, Build)> {
    validate_branch(branch)?;
    validate_commit(commit)?;
    let data = state.data();
    let repo_name = repo_name.to_string();
    let branch = branch.to_string();
    let commit = commit.to_string();
    let (repo, build) = state
        .db
        .transact(|conn| {
            async move {
                let repo = repo_service::get(conn, &repo_name).await?;
                let build: Build = diesel::insert_into(builds::table)
                    .values(NewBuild {
                        repo_name: repo.name.clone(),
                        branch,
                        commit_hash: commit,
                        status: BuildStatus::New,
                        low_prio,
                        build_script: repo.build_script.clone(),
                        created: Utc::now(),
                    })
                    .returning(Build::as_returning())
                    .get_result(conn)
                    .await?;
                make_skeleton(&data, &repo, &build).await?;
                Ok((repo, build))
            }
            .scope_boxed()
        })
        .await?;

    crate::metrics::build_status_changed(BuildStatus::New.as_str());
    tracing::info!(
        build_id = build.id,
        repo = %repo.name,
        branch = %build.branch,
        commit = %build.commit_hash,
        low_prio,
        "build created"
    );
    state.events.publish(DingEvent::build(&build));
    Ok((repo, build))
}

/// Create a build and start it in the background.
pub async fn create(
    state: &DingState,
    repo_name: &str,
    branch: &str,
    commit: &str,
    low_prio: bool,
) -> Result<Build> {
    let (repo, build) = prepare(state, repo_name, branch, commit, low_prio).await?;
    super::executor::spawn(state.clone(), repo, build.clone());
    Ok(build)
}

/// Builds of a repository, newest first.
pub async fn list(conn: &mut DbConn, repo_name: &str) -> Result<Vec<Build>> {
    repo_service::get(conn, repo_name).await?;
    let builds = builds::table
        .filter(builds::repo_name.eq(repo_name))
        .order(builds::id.desc())
        .select(Build::as_select())
        .load(conn)
        .await?;
    Ok(builds)
}

pub async fn get(conn: &mut DbConn, repo_name: &str, build_id: i64) -> Result<Build> {
    builds::table
        .filter(builds::repo_name.eq(repo_name))
        .filter(builds::id.eq(build_id))
        .select(Build::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| DingError::not_found(format!("build {build_id} of repo {repo_name:?} not found")))
}

pub async fn results_of(conn: &mut DbConn, build_id: i64) -> Result<Vec<BuildResult>> {
    let rows = results::table
        .filter(results::build_id.eq(build_id))
        .order(results::id.asc())
        .select(BuildResult::as_select())
        .load(conn)
        .await?;
    Ok(rows)
}

pub async fn detail(conn: &mut DbConn, repo_name: &str, build_id: i64) -> Result<BuildDetail> {
    let build = get(conn, repo_name, build_id).await?;
    let results = results_of(conn, build_id).await?;
    let steps = steps::table
        .filter(steps::build_id.eq(build_id))
        .order(steps::id.asc())
        .select(Step::as_select())
        .load(conn)
        .await?;
    Ok(BuildDetail {
        build,
        results,
        steps,
    })
}

/// Remove a finished, unreleased build with its directory.
pub async fn remove(state: &DingState, repo_name: &str, build_id: i64) -> Result<()> {
    let name = repo_name.to_string();
    state
        .db
        .transact(|conn| {
            async move {
                let build = get(conn, &name, build_id).await?;
                if build.released.is_some() {
                    return Err(DingError::user("cannot remove a released build"));
                }
                if !build.is_finished() {
                    return Err(DingError::user("build has not finished yet"));
                }
                diesel::delete(builds::table.find(build_id)).execute(conn).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await?;

    state
        .root
        .call(Msg::RemoveBuildDir {
            repo_name: repo_name.to_string(),
            build_id,
        })
        .await?;
    tracing::info!(build_id, repo = %repo_name, "build removed");
    state.events.publish(DingEvent::RemoveBuild {
        repo_name: repo_name.to_string(),
        build_id,
    });
    Ok(())
}

/// Remove the directory of a finished build, keeping the record.
pub async fn cleanup(state: &DingState, repo_name: &str, build_id: i64) -> Result<Build> {
    let mut conn = state.db.conn().await?;
    let build = get(&mut conn, repo_name, build_id).await?;
    drop(conn);
    if !build.is_finished() {
        return Err(DingError::user("build has not finished yet"));
    }
    if build.builddir_removed {
        return Err(DingError::user("build directory was already removed"));
    }

    state
        .root
        .call(Msg::RemoveBuildDir {
            repo_name: repo_name.to_string(),
            build_id,
        })
        .await?;
    let build = mark_builddir_removed(state, build_id).await?;
    state.events.publish(DingEvent::build(&build));
    Ok(build)
}

pub async fn mark_builddir_removed(state: &DingState, build_id: i64) -> Result<Build> {
    state
        .db
        .transact(|conn| {
            async move {
                let build = diesel::update(builds::table.find(build_id))
                    .set(builds::builddir_removed.eq(true))
                    .returning(Build::as_returning())
                    .get_result(conn)
                    .await?;
                Ok(build)
            }
            .scope_boxed()
        })
        .await
}

/// Cancel an unfinished build: mark it cancelled and finished, then stop
/// its local commands and its build process.
pub async fn cancel(state: &DingState, repo_name: &str, build_id: i64) -> Result<Build> {
    let name = repo_name.to_string();
    let build = state
        .db
        .transact(|conn| {
            async move {
                let build = get(conn, &name, build_id).await?;
                if build.is_finished() {
                    return Err(DingError::user("build has already finished"));
                }
                let build = diesel::update(builds::table.find(build_id))
                    .set((
                        builds::status.eq(BuildStatus::Cancelled),
                        builds::finish.eq(Some(Utc::now())),
                    ))
                    .returning(Build::as_returning())
                    .get_result(conn)
                    .await?;
                Ok(build)
            }
            .scope_boxed()
        })
        .await?;

    state.cancel_build(build_id);
    state.root.call(Msg::CancelCommand { build_id }).await?;

    crate::metrics::build_status_changed(BuildStatus::Cancelled.as_str());
    tracing::info!(build_id, repo = %repo_name, "build cancelled");
    state.events.publish(DingEvent::build(&build));
    Ok(build)
}

fn gzip_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut input = std::fs::File::open(src)?;
    let output = std::fs::File::create(dst)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()
}

/// Basename of a result file, as stored in the release directory.
pub fn release_name(filename: &str) -> &str {
    filename.rsplit('/').next().unwrap_or(filename)
}

/// Release a successful build: gzip each result into the release tree and
/// mark the build released.
pub async fn release(state: &DingState, repo_name: &str, build_id: i64) -> Result<Build> {
    let data = state.data();
    let mut conn = state.db.conn().await?;
    let repo = repo_service::get(&mut conn, repo_name).await?;
    let build = get(&mut conn, repo_name, build_id).await?;
    let files = results_of(&mut conn, build_id).await?;
    drop(conn);

    if build.status != BuildStatus::Success || !build.is_finished() {
        return Err(DingError::user("only successful builds can be released"));
    }
    if build.released.is_some() {
        return Err(DingError::user("build was already released"));
    }
    if build.builddir_removed {
        return Err(DingError::user("build directory was removed, cannot release"));
    }

    let checkout = data.checkout_dir(repo_name, build_id, &repo.checkout_path)?;
    let release_dir = data.release_dir(repo_name, build_id)?;
    let mut copies: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(files.len());
    for r in &files {
        let src = crate::paths::resolve_within(&checkout, &r.filename)
            .ok_or_else(|| DingError::user(format!("result {:?} is outside the checkout", r.filename)))?;
        copies.push((src, release_dir.join(format!("{}.gz", release_name(&r.filename)))));
    }

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&release_dir)?;
        for (src, dst) in &copies {
            gzip_file(src, dst)?;
        }
        Ok(())
    })
    .await
    .server_context("release task")?
    .server_context("copying release files")?;

    let build = state
        .db
        .transact(|conn| {
            async move {
                let build = diesel::update(builds::table.find(build_id))
                    .set(builds::released.eq(Some(Utc::now())))
                    .returning(Build::as_returning())
                    .get_result(conn)
                    .await?;
                Ok(build)
            }
            .scope_boxed()
        })
        .await?;

    tracing::info!(build_id, repo = %repo_name, files = files.len(), "build released");
    state.events.publish(DingEvent::build(&build));
    Ok(build)
}

/// Path of a released file, by its basename.
pub async fn released_file(state: &DingState, repo_name: &str, build_id: i64, name: &str) -> Result<PathBuf> {
    let mut conn = state.db.conn().await?;
    let build = get(&mut conn, repo_name, build_id).await?;
    if build.released.is_none() {
        return Err(DingError::not_found("build is not released"));
    }
    let files = results_of(&mut conn, build_id).await?;
    if !files.iter().any(|r| release_name(&r.filename) == name) {
        return Err(DingError::not_found(format!("no released file {name:?}")));
    }
    Ok(state
        .data()
        .release_dir(repo_name, build_id)?
        .join(format!("{name}.gz")))
}

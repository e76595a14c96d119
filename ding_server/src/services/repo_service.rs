//! Repository management: create, save, remove, clear the shared home.

use std::collections::HashSet;

use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::RunQueryDsl;

use crate::config::IsolateBuilds;
use crate::db::DbConn;
use crate::error::{DingError, Result};
use crate::events::DingEvent;
use crate::ipc::Msg;
use crate::models::build::Build;
use crate::models::repo::Repo;
use crate::paths::{validate_checkout_path, validate_repo_name};
use crate::schema::{builds, repos};
use crate::state::DingState;

pub async fn list(conn: &mut DbConn) -> Result<Vec<Repo>> {
    let repos = repos::table
        .order(repos::name.asc())
        .select(Repo::as_select())
        .load(conn)
        .await?;
    Ok(repos)
}

pub async fn get(conn: &mut DbConn, name: &str) -> Result<Repo> {
    repos::table
        .find(name)
        .select(Repo::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| DingError::not_found(format!("repo {name:?} not found")))
}

pub fn validate(repo: &Repo) -> Result<()> {
    validate_repo_name(&repo.name)?;
    validate_checkout_path(&repo.checkout_path)?;
    if repo.origin.trim().is_empty() {
        return Err(DingError::user("origin cannot be empty"));
    }
    if repo.default_branch.trim().is_empty() {
        return Err(DingError::user("default branch cannot be empty"));
    }
    Ok(())
}

/// Highest uid in the configured range not held by another repository.
async fn allocate_uid(conn: &mut DbConn, iso: &IsolateBuilds) -> Result<i64> {
    let used: Vec<Option<i64>> = repos::table
        .filter(repos::uid.is_not_null())
        .select(repos::uid)
        .load(conn)
        .await?;
    let used: HashSet<i64> = used.into_iter().flatten().collect();
    (iso.uid_start..iso.uid_end)
        .rev()
        .map(i64::from)
        .find(|uid| !used.contains(uid))
        .ok_or_else(|| DingError::user("no free uid left in the build uid range"))
}

/// Create a repository. A set `uid` asks for a fixed uid, which is
/// allocated here.
pub async fn create(state: &DingState, mut repo: Repo) -> Result<Repo> {
    validate(&repo)?;
    repo.home_disk_usage = 0;
    let iso = state.config.isolate_builds.clone();
    let repo = state
        .db
        .transact(|conn| {
            async move {
                let exists = repos::table
                    .find(&repo.name)
                    .count()
                    .get_result::<i64>(conn)
                    .await?;
                if exists > 0 {
                    return Err(DingError::user(format!("repo {:?} already exists", repo.name)));
                }
                if repo.uid.is_some() {
                    repo.uid = Some(allocate_uid(conn, &iso).await?);
                }
                diesel::insert_into(repos::table)
                    .values(&repo)
                    .execute(conn)
                    .await?;
                Ok(repo)
            }
            .scope_boxed()
        })
        .await?;

    tracing::info!(repo = %repo.name, vcs = %repo.vcs, uid = ?repo.uid, "repo created");
    state.events.publish(DingEvent::Repo { repo: repo.clone() });
    Ok(repo)
}

/// Save a repository. The name is immutable. Enabling a fixed uid allocates
/// one, disabling it removes the shared home.
pub async fn save(state: &DingState, name: &str, mut repo: Repo) -> Result<Repo> {
    if repo.name != name {
        return Err(DingError::user("repository name cannot be changed"));
    }
    validate(&repo)?;
    let iso = state.config.isolate_builds.clone();
    let (repo, dropped_uid) = state
        .db
        .transact(|conn| {
            async move {
                let existing = get(conn, &repo.name).await?;
                repo.home_disk_usage = existing.home_disk_usage;
                repo.uid = match (existing.uid, repo.uid) {
                    (Some(uid), Some(_)) => Some(uid),
                    (None, Some(_)) => Some(allocate_uid(conn, &iso).await?),
                    (_, None) => None,
                };
                let dropped_uid = existing.uid.is_some() && repo.uid.is_none();
                if dropped_uid {
                    repo.home_disk_usage = 0;
                }
                diesel::update(repos::table.find(&repo.name))
                    .set(&repo)
                    .execute(conn)
                    .await?;
                Ok((repo, dropped_uid))
            }
            .scope_boxed()
        })
        .await?;

    if dropped_uid {
        state
            .root
            .call(Msg::RemoveSharedHome {
                repo_name: repo.name.clone(),
            })
            .await?;
    }

    tracing::info!(repo = %repo.name, uid = ?repo.uid, "repo saved");
    state.events.publish(DingEvent::Repo { repo: repo.clone() });
    Ok(repo)
}

/// Remove a repository with all its builds and files. Running builds are
/// cancelled first.
pub async fn remove(state: &DingState, name: &str) -> Result<()> {
    let repo_name = name.to_string();
    let unfinished = state
        .db
        .transact(|conn| {
            async move {
                let name = repo_name;
                get(conn, &name).await?;
                let unfinished: Vec<i64> = builds::table
                    .filter(builds::repo_name.eq(&name))
                    .filter(builds::finish.is_null())
                    .select(builds::id)
                    .load(conn)
                    .await?;
                diesel::delete(builds::table.filter(builds::repo_name.eq(&name)))
                    .execute(conn)
                    .await?;
                diesel::delete(repos::table.find(&name)).execute(conn).await?;
                Ok(unfinished)
            }
            .scope_boxed()
        })
        .await?;

    for build_id in unfinished {
        state.cancel_build(build_id);
        state.root.call(Msg::CancelCommand { build_id }).await?;
    }

    // Removes the build tree, the release tree and the shared home.
    state
        .root
        .call(Msg::RemoveRepo {
            repo_name: name.to_string(),
        })
        .await?;

    tracing::info!(repo = %name, "repo removed");
    state.events.publish(DingEvent::RemoveRepo {
        repo_name: name.to_string(),
    });
    Ok(())
}

/// Remove the shared home directory and reset its accounted usage.
pub async fn clear_home(state: &DingState, name: &str) -> Result<Repo> {
    let mut conn = state.db.conn().await?;
    let repo = get(&mut conn, name).await?;
    drop(conn);
    if !repo.shared_home() {
        return Err(DingError::user("repository has no shared home directory"));
    }

    state
        .root
        .call(Msg::RemoveSharedHome {
            repo_name: repo.name.clone(),
        })
        .await?;

    let name = repo.name.clone();
    let repo = state
        .db
        .transact(|conn| {
            async move {
                diesel::update(repos::table.find(&name))
                    .set(repos::home_disk_usage.eq(0))
                    .execute(conn)
                    .await?;
                get(conn, &name).await
            }
            .scope_boxed()
        })
        .await?;
    state.events.publish(DingEvent::Repo { repo: repo.clone() });
    Ok(repo)
}

/// Repositories that want a low-priority build when toolchains change.
pub async fn toolchain_followers(conn: &mut DbConn) -> Result<Vec<Repo>> {
    let repos = repos::table
        .filter(repos::build_on_updated_toolchain.eq(true))
        .order(repos::name.asc())
        .select(Repo::as_select())
        .load(conn)
        .await?;
    Ok(repos)
}

/// The latest build on a branch, if any.
pub async fn latest_build(conn: &mut DbConn, repo: &str, branch: &str) -> Result<Option<Build>> {
    let build = builds::table
        .filter(builds::repo_name.eq(repo))
        .filter(builds::branch.eq(branch))
        .order(builds::id.desc())
        .select(Build::as_select())
        .first(conn)
        .await
        .optional()?;
    Ok(build)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::repo::Vcs;
    use crate::models::StringList;

    pub(crate) fn repo(name: &str) -> Repo {
        Repo {
            name: name.into(),
            vcs: Vcs::Command,
            origin: "sh -c 'mkdir -p checkout/x; echo commit: abc'".into(),
            default_branch: "main".into(),
            checkout_path: name.into(),
            build_script: "#!/bin/sh\necho hi\n".into(),
            uid: None,
            home_disk_usage: 0,
            webhook_secret: "s3cret".into(),
            allow_global_webhook_secrets: false,
            bubblewrap: false,
            bubblewrap_no_net: false,
            build_on_updated_toolchain: false,
            notify_emails: StringList::default(),
        }
    }

    #[test]
    fn validation() {
        assert!(validate(&repo("ok")).is_ok());
        let mut r = repo("ok");
        r.checkout_path = "/abs".into();
        assert!(validate(&r).is_err());
        let mut r = repo("ok");
        r.origin = " ".into();
        assert!(validate(&r).is_err());
        assert!(validate(&repo("a/b")).is_err());
    }

    #[tokio::test]
    async fn uids_are_allocated_downward_and_skip_used() {
        let (_dir, db) = crate::db::test_db().await;
        let iso = IsolateBuilds {
            uid_start: 100,
            uid_end: 103,
            ..Default::default()
        };
        let mut conn = db.conn().await.unwrap();
        let mut r = repo("a");
        r.uid = Some(102);
        diesel::insert_into(repos::table).values(&r).execute(&mut conn).await.unwrap();
        assert_eq!(allocate_uid(&mut conn, &iso).await.unwrap(), 101);

        let mut r = repo("b");
        r.uid = Some(101);
        diesel::insert_into(repos::table).values(&r).execute(&mut conn).await.unwrap();
        let mut r = repo("c");
        r.uid = Some(100);
        diesel::insert_into(repos::table).values(&r).execute(&mut conn).await.unwrap();
        assert!(allocate_uid(&mut conn, &iso).await.is_err());
    }
}

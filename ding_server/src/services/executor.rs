//! Build orchestrator: runs one build from `new` through clone and build to
//! `success`, then finalizes it.
//!
//! Finalization runs on every exit path, including failures and panics: it
//! measures disk usage, records steps, sets `finish`, applies retention and
//! sends notifications.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::RunQueryDsl;
use futures_util::FutureExt;
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

use super::notify::{self, NotificationKind};
use super::tracker::Tracker;
use super::vcs::{self, LocalRunner};
use super::{build_service, results_parser, retention, settings_service};
use crate::config::DingConfig;
use crate::error::{DingError, Result, ServerContext};
use crate::events::DingEvent;
use crate::ipc::client::{read_status, BuildStreams};
use crate::ipc::{BuildRequest, Msg};
use crate::models::build::{Build, BuildStatus};
use crate::models::repo::{Repo, Vcs};
use crate::models::step::NewStep;
use crate::paths::{disk_usage, DataDir};
use crate::schema::{builds, repos, results, steps};
use crate::state::DingState;

/// Steps in the order they run.
pub const STEPS: [&str; 2] = ["clone", "build"];

/// Run a build in the background once the scheduler admits it.
pub fn spawn(state: DingState, repo: Repo, build: Build) {
    tokio::spawn(run(state, repo, build));
}

pub async fn run(state: DingState, repo: Repo, build: Build) {
    let build_id = build.id;
    let _job = match state.scheduler.acquire(&repo.name, build.low_prio).await {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(build_id, repo = %repo.name, error = %e, "waiting for scheduler");
            return;
        }
    };

    // Registered before the check, so a cancel lands either in the database
    // or on the token.
    let cancel = state.register_build(build_id);

    // Cancelled while queued.
    let current = match state.db.conn().await {
        Ok(mut conn) => build_service::get(&mut conn, &repo.name, build_id).await,
        Err(e) => Err(e),
    };
    match current {
        Ok(b) if b.is_finished() => {
            tracing::debug!(build_id, repo = %repo.name, "build finished before it started");
            state.unregister_build(build_id);
            return;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(build_id, repo = %repo.name, error = %e, "reading build before start");
            state.unregister_build(build_id);
            return;
        }
    }

    let t0 = Instant::now();
    let outcome = AssertUnwindSafe(execute(&state, &repo, &build, &cancel))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(DingError::server("build task panicked")));
    state.unregister_build(build_id);

    if let Err(e) = finalize(&state, &repo, build_id, outcome).await {
        tracing::error!(build_id, repo = %repo.name, error = %e, "finalizing build");
    }
    crate::metrics::build_duration(t0.elapsed().as_millis() as u64);
}

/// Environment of clone commands and the build script.
pub fn build_env(
    config: &DingConfig,
    data: &DataDir,
    repo: &Repo,
    build: &Build,
    extra: &[String],
) -> Result<Vec<String>> {
    let build_dir = data.build_dir(&repo.name, build.id)?;
    let home = data.home_dir(&repo.name, build.id, repo.shared_home())?;
    let mut env = vec![
        format!("HOME={}", home.display()),
        format!("DING_BUILDDIR={}", build_dir.display()),
        format!("DING_CHECKOUTPATH={}", repo.checkout_path),
        format!("DING_DOWNLOADDIR={}", build_dir.join("dl").display()),
        format!("DING_BUILDID={}", build.id),
        format!("DING_REPONAME={}", repo.name),
        format!("DING_BRANCH={}", build.branch),
        format!("DING_COMMIT={}", build.commit_hash),
    ];
    if let Some(dir) = &config.go_toolchain_dir {
        env.push(format!("DING_TOOLCHAINDIR={}", dir.display()));
    }
    env.extend(extra.iter().cloned());
    Ok(env)
}

/// Uid a build runs under: the repository's fixed uid, or one derived from
/// the build id.
pub fn build_uid(config: &DingConfig, repo: &Repo, build_id: i64) -> u32 {
    let iso = &config.isolate_builds;
    if !iso.enabled {
        return 0;
    }
    if let Some(uid) = repo.uid.and_then(|u| u32::try_from(u).ok()) {
        return uid;
    }
    let range = i64::from(iso.uid_end.saturating_sub(iso.uid_start).max(1));
    iso.uid_start + u32::try_from(build_id.rem_euclid(range)).unwrap_or(0)
}

/// Move an unfinished build to `status`. Fails when the build was finished
/// in the meantime, e.g. by a cancel.
async fn set_status(state: &DingState, build_id: i64, status: BuildStatus, start: bool) -> Result<Build> {
    let build = state
        .db
        .transact(|conn| {
            async move {
                let target = builds::table
                    .find(build_id)
                    .filter(builds::finish.is_null());
                let updated = if start {
                    diesel::update(target)
                        .set((builds::status.eq(status), builds::start.eq(Some(Utc::now()))))
                        .returning(Build::as_returning())
                        .get_result(conn)
                        .await
                } else {
                    diesel::update(target)
                        .set(builds::status.eq(status))
                        .returning(Build::as_returning())
                        .get_result(conn)
                        .await
                };
                updated
                    .optional()?
                    .ok_or_else(|| DingError::user("build was cancelled"))
            }
            .scope_boxed()
        })
        .await?;
    crate::metrics::build_status_changed(status.as_str());
    tracing::info!(build_id, status = status.as_str(), "build status changed");
    state.events.publish(DingEvent::build(&build));
    Ok(build)
}

async fn execute(state: &DingState, repo: &Repo, build: &Build, cancel: &CancellationToken) -> Result<()> {
    let data = state.data();
    let build_id = build.id;
    let settings = {
        let mut conn = state.db.conn().await?;
        settings_service::get(&mut conn).await?
    };

    let mut build = set_status(state, build_id, BuildStatus::Clone, true).await?;
    let build_dir = data.build_dir(&repo.name, build_id)?;
    let checkout_dir = data.checkout_dir(&repo.name, build_id, &repo.checkout_path)?;
    let env = build_env(&state.config, &data, repo, &build, &settings.environment)?;

    let runner = LocalRunner {
        events: &state.events,
        build_id,
        build_dir: &build_dir,
        run_prefix: &settings.run_prefix,
        env: &env,
        cancel,
    };
    vcs::clone(&runner, repo, &build.branch, &build.commit_hash).await?;

    if build.commit_hash.is_empty() {
        let commit = vcs::resolve_commit(&runner, repo, &checkout_dir).await?;
        build = state
            .db
            .transact(|conn| {
                async move {
                    let build = diesel::update(builds::table.find(build_id))
                        .set(builds::commit_hash.eq(commit))
                        .returning(Build::as_returning())
                        .get_result(conn)
                        .await?;
                    Ok(build)
                }
                .scope_boxed()
            })
            .await?;
        tracing::info!(build_id, commit = %build.commit_hash, "commit resolved");
        state.events.publish(DingEvent::build(&build));
    }

    if repo.vcs == Vcs::Git {
        vcs::checkout_commit(&runner, &checkout_dir, &build.commit_hash).await?;
    }

    let uid = build_uid(&state.config, repo, build_id);
    state
        .root
        .call(Msg::Chown {
            repo_name: repo.name.clone(),
            build_id,
            shared_home: repo.shared_home(),
            uid,
        })
        .await?;

    set_status(state, build_id, BuildStatus::Build, false).await?;
    // The environment carries the resolved commit.
    let env = build_env(&state.config, &data, repo, &build, &settings.environment)?;
    let request = BuildRequest {
        repo_name: repo.name.clone(),
        build_id,
        uid,
        checkout_path: repo.checkout_path.clone(),
        run_prefix: settings.run_prefix.to_vec(),
        env,
        toolchain_dir: state.config.go_toolchain_dir.clone(),
        home_dir: data.home_dir(&repo.name, build_id, repo.shared_home())?,
        sandbox: repo.bubblewrap,
        sandbox_no_net: repo.bubblewrap_no_net,
    };
    let streams = start_build(state, request, cancel).await?;

    let stdout = pipe::Receiver::from_owned_fd(streams.stdout).server_context("build stdout")?;
    let stderr = pipe::Receiver::from_owned_fd(streams.stderr).server_context("build stderr")?;
    let output_dir = build_dir.join("output");
    let tracker = Tracker {
        events: &state.events,
        build_id,
        step: "build",
        output_dir: &output_dir,
    };
    let failure = tracker
        .track(stdout, stderr, async {
            match read_status(streams.status).await {
                Ok(status) if status.is_empty() => None,
                Ok(status) => Some(status),
                Err(e) => Some(format!("reading build status: {e}")),
            }
        })
        .await?;
    if let Some(status) = failure {
        return Err(DingError::user(format!("build.sh: {status}")));
    }

    let stdout = tokio::fs::read_to_string(output_dir.join("build.stdout"))
        .await
        .server_context("reading build output")?;
    let parsed = results_parser::parse(build_id, &stdout, &checkout_dir, &build_dir.join("dl"))?;

    let build = state
        .db
        .transact(|conn| {
            async move {
                if !parsed.results.is_empty() {
                    diesel::insert_into(results::table)
                        .values(&parsed.results)
                        .execute(conn)
                        .await?;
                }
                let build = diesel::update(builds::table.find(build_id).filter(builds::finish.is_null()))
                    .set((
                        builds::status.eq(BuildStatus::Success),
                        builds::version.eq(parsed.version),
                        builds::coverage.eq(parsed.coverage),
                        builds::coverage_report_file.eq(parsed.coverage_report_file),
                    ))
                    .returning(Build::as_returning())
                    .get_result(conn)
                    .await
                    .optional()?;
                build.ok_or_else(|| DingError::user("build was cancelled"))
            }
            .scope_boxed()
        })
        .await?;
    crate::metrics::build_status_changed(BuildStatus::Success.as_str());
    state.events.publish(DingEvent::build(&build));
    Ok(())
}

/// Have the root process start the build script. A cancel that reached the
/// root before the build did found nothing to stop, so it is repeated.
async fn start_build(state: &DingState, request: BuildRequest, cancel: &CancellationToken) -> Result<BuildStreams> {
    let build_id = request.build_id;
    let streams = state.root.start_build(request).await?;
    if cancel.is_cancelled() {
        tracing::info!(build_id, "build cancelled while starting, stopping it");
        state.root.call(Msg::CancelCommand { build_id }).await?;
    }
    Ok(streams)
}

/// Last non-empty line of a file, empty when missing.
async fn last_line(path: &Path) -> String {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .and_then(|s| s.lines().rev().find(|l| !l.trim().is_empty()).map(str::to_string))
        .unwrap_or_default()
}

/// Steps recorded on disk, in order.
async fn read_steps(build_id: i64, output_dir: &Path) -> Vec<NewStep> {
    let mut steps = Vec::new();
    for name in STEPS {
        let Ok(output) = tokio::fs::read_to_string(output_dir.join(format!("{name}.output"))).await else {
            continue;
        };
        let nsec = tokio::fs::read_to_string(output_dir.join(format!("{name}.nsec")))
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        steps.push(NewStep {
            build_id,
            name: name.to_string(),
            output,
            nsec,
        });
    }
    steps
}

async fn finalize(state: &DingState, repo: &Repo, build_id: i64, outcome: Result<()>) -> Result<()> {
    let data = state.data();
    let build_dir = data.build_dir(&repo.name, build_id)?;
    let output_dir = build_dir.join("output");

    match &outcome {
        Ok(()) => tracing::info!(build_id, repo = %repo.name, "build succeeded"),
        Err(e) if e.is_user() => tracing::info!(build_id, repo = %repo.name, error = %e, "build failed"),
        Err(e) => {
            crate::metrics::error_recorded("build");
            tracing::error!(build_id, repo = %repo.name, error = %e, "build failed with server error");
        }
    }

    let shared_home = repo.shared_home().then(|| data.shared_home(&repo.name)).transpose()?;
    let (usage, home_usage) = tokio::task::spawn_blocking({
        let build_dir = build_dir.clone();
        move || (disk_usage(&build_dir), shared_home.map(|h| disk_usage(&h)))
    })
    .await
    .server_context("disk usage task")?;

    let steps = read_steps(build_id, &output_dir).await;
    let error_message = outcome.as_ref().err().map(|e| e.public_message());
    let repo_name = repo.name.clone();

    let build = state
        .db
        .transact(|conn| {
            async move {
                let current = builds::table
                    .find(build_id)
                    .select(Build::as_select())
                    .first(conn)
                    .await?;
                let previous_home: i64 = repos::table
                    .find(&repo_name)
                    .select(repos::home_disk_usage)
                    .first(conn)
                    .await?;
                let home_delta = match home_usage {
                    Some(h) => {
                        let h = i64::try_from(h).unwrap_or(i64::MAX);
                        diesel::update(repos::table.find(&repo_name))
                            .set(repos::home_disk_usage.eq(h))
                            .execute(conn)
                            .await?;
                        h - previous_home
                    }
                    None => 0,
                };

                let step_file = if current.status == BuildStatus::Clone { "clone" } else { "build" };
                let last = last_line(&output_dir.join(format!("{step_file}.output"))).await;

                diesel::delete(steps::table.filter(steps::build_id.eq(build_id)))
                    .execute(conn)
                    .await?;
                if !steps.is_empty() {
                    diesel::insert_into(steps::table)
                        .values(&steps)
                        .execute(conn)
                        .await?;
                }

                // A cancel already set finish and owns the outcome.
                let cancelled = current.is_finished();
                let message = match (&error_message, cancelled) {
                    (Some(m), false) => m.clone(),
                    _ => current.error_message.clone(),
                };
                let build = diesel::update(builds::table.find(build_id))
                    .set((
                        builds::finish.eq(Some(current.finish.unwrap_or_else(Utc::now))),
                        builds::error_message.eq(message),
                        builds::disk_usage.eq(i64::try_from(usage).unwrap_or(i64::MAX)),
                        builds::home_disk_usage_delta.eq(home_delta),
                        builds::last_line.eq(last),
                    ))
                    .returning(Build::as_returning())
                    .get_result(conn)
                    .await?;
                Ok(build)
            }
            .scope_boxed()
        })
        .await?;

    state.events.publish(DingEvent::build(&build));

    if let Err(e) = retention::cleanup(state, repo).await {
        tracing::warn!(build_id, repo = %repo.name, error = %e, "build retention");
    }

    if let Err(e) = notify_transition(state, repo, &build).await {
        tracing::warn!(build_id, repo = %repo.name, error = %e, "sending notification");
    }
    Ok(())
}

async fn notify_transition(state: &DingState, repo: &Repo, build: &Build) -> Result<()> {
    if build.status == BuildStatus::Cancelled {
        return Ok(());
    }
    let mut conn = state.db.conn().await?;
    let previous: Option<BuildStatus> = builds::table
        .filter(builds::repo_name.eq(&repo.name))
        .filter(builds::branch.eq(&build.branch))
        .filter(builds::id.lt(build.id))
        .filter(builds::finish.is_not_null())
        .filter(builds::status.ne(BuildStatus::Cancelled))
        .order(builds::id.desc())
        .select(builds::status)
        .first(&mut conn)
        .await
        .optional()?;
    let Some(kind) = notify::transition(build.failed(), previous.map(|s| s == BuildStatus::Success)) else {
        return Ok(());
    };
    let settings = settings_service::get(&mut conn).await?;
    drop(conn);

    let to = notify::recipients(repo, &settings.notify_emails);
    if to.is_empty() {
        tracing::debug!(build_id = build.id, "no notification recipients");
        return Ok(());
    }
    let config = &state.config;
    let message = match kind {
        NotificationKind::Failing => notify::failing(&config.notify, &config.base_url, to, repo, build),
        NotificationKind::Fixed => notify::fixed(&config.notify, &config.base_url, to, repo, build),
    };
    state
        .notifier
        .send(&message)
        .await
        .server_context("notifier")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolateBuilds;
    use crate::services::repo_service::tests::repo;

    #[test]
    fn uids() {
        let mut config = DingConfig::default();
        let mut r = repo("t0");
        assert_eq!(build_uid(&config, &r, 7), 0);

        config.isolate_builds = IsolateBuilds {
            enabled: true,
            uid_start: 10000,
            uid_end: 10010,
            ..Default::default()
        };
        assert_eq!(build_uid(&config, &r, 7), 10007);
        assert_eq!(build_uid(&config, &r, 23), 10003);
        r.uid = Some(19999);
        assert_eq!(build_uid(&config, &r, 23), 19999);
    }

    #[test]
    fn environment() {
        let mut config = DingConfig::default();
        config.go_toolchain_dir = Some("/opt/toolchains".into());
        let data = DataDir::new("/data");
        let r = repo("t0");
        let build = Build {
            id: 5,
            repo_name: "t0".into(),
            branch: "main".into(),
            commit_hash: "abc".into(),
            status: BuildStatus::Clone,
            low_prio: false,
            build_script: String::new(),
            created: Utc::now(),
            start: None,
            finish: None,
            released: None,
            disk_usage: 0,
            home_disk_usage_delta: 0,
            error_message: String::new(),
            version: String::new(),
            coverage: None,
            coverage_report_file: String::new(),
            builddir_removed: false,
            last_line: String::new(),
        };
        let env = build_env(&config, &data, &r, &build, &["GOFLAGS=-mod=vendor".into()]).unwrap();
        assert_eq!(
            env,
            vec![
                "HOME=/data/build/t0/5/home",
                "DING_BUILDDIR=/data/build/t0/5",
                "DING_CHECKOUTPATH=t0",
                "DING_DOWNLOADDIR=/data/build/t0/5/dl",
                "DING_BUILDID=5",
                "DING_REPONAME=t0",
                "DING_BRANCH=main",
                "DING_COMMIT=abc",
                "DING_TOOLCHAINDIR=/opt/toolchains",
                "GOFLAGS=-mod=vendor",
            ]
        );
    }

    // ── End to end, with the root executor in-process ──

    use crate::models::StringList;
    use crate::services::repo_service;
    use crate::state::test_state;

    async fn setup(script: &str) -> (tempfile::TempDir, DingState) {
        let (dir, state) = test_state().await;
        let mut conn = state.db.conn().await.unwrap();
        let mut settings = settings_service::get(&mut conn).await.unwrap();
        drop(conn);
        settings.environment = StringList(vec!["PATH=/usr/local/bin:/usr/bin:/bin".into()]);
        settings_service::save(&state.db, settings).await.unwrap();

        let mut r = repo("r");
        r.origin = "mkdir -p checkout/r && echo commit: c0ffee".into();
        r.build_script = script.into();
        repo_service::create(&state, r).await.unwrap();
        (dir, state)
    }

    /// Wait until finalize has run: finish set and disk usage measured.
    async fn finalized(state: &DingState, build_id: i64) -> Build {
        for _ in 0..400 {
            let mut conn = state.db.conn().await.unwrap();
            let b = build_service::get(&mut conn, "r", build_id).await.unwrap();
            if b.is_finished() && b.disk_usage > 0 {
                return b;
            }
            drop(conn);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("build {build_id} was not finalized");
    }

    #[tokio::test]
    async fn successful_build() {
        let (_dir, state) = setup(
            "#!/bin/sh\nset -e\nprintf abc > out.bin\necho version: 2.0\necho coverage: 81.5\necho release: tool linux amd64 go1.24 out.bin\n",
        )
        .await;
        let build = build_service::create(&state, "r", "main", "", false).await.unwrap();
        let b = finalized(&state, build.id).await;

        assert_eq!(b.status, BuildStatus::Success, "{}", b.error_message);
        assert_eq!(b.commit_hash, "c0ffee");
        assert_eq!(b.version, "2.0");
        assert_eq!(b.coverage, Some(81.5));
        assert_eq!(b.last_line, "release: tool linux amd64 go1.24 out.bin");
        assert!(b.error_message.is_empty());

        let mut conn = state.db.conn().await.unwrap();
        let detail = build_service::detail(&mut conn, "r", build.id).await.unwrap();
        assert_eq!(detail.results.len(), 1);
        assert_eq!(detail.results[0].filename, "out.bin");
        assert_eq!(detail.results[0].filesize, 3);
        let names: Vec<&str> = detail.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, STEPS);
        assert!(detail.steps[1].output.contains("version: 2.0"));
    }

    #[tokio::test]
    async fn failing_script_keeps_build_status() {
        let (_dir, state) = setup("#!/bin/sh\necho oops >&2\nexit 3\n").await;
        let build = build_service::create(&state, "r", "main", "", false).await.unwrap();
        let b = finalized(&state, build.id).await;

        assert_eq!(b.status, BuildStatus::Build);
        assert!(b.failed());
        assert!(b.error_message.contains("exit status: 3"), "{}", b.error_message);
        assert_eq!(b.last_line, "oops");
    }

    #[tokio::test]
    async fn malformed_directive_fails_the_build() {
        let (_dir, state) = setup("#!/bin/sh\necho release: tool linux\n").await;
        let build = build_service::create(&state, "r", "main", "", false).await.unwrap();
        let b = finalized(&state, build.id).await;

        assert_eq!(b.status, BuildStatus::Build);
        assert!(b.error_message.contains("malformed directive"), "{}", b.error_message);
        let mut conn = state.db.conn().await.unwrap();
        assert!(build_service::results_of(&mut conn, build.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_stops_a_running_build() {
        let (_dir, state) = setup("#!/bin/sh\necho started\nsleep 30\necho version: never\n").await;
        let build = build_service::create(&state, "r", "main", "", false).await.unwrap();

        let mut running = false;
        for _ in 0..200 {
            let mut conn = state.db.conn().await.unwrap();
            let b = build_service::get(&mut conn, "r", build.id).await.unwrap();
            if b.status == BuildStatus::Build {
                running = true;
                break;
            }
            drop(conn);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(running, "build never reached the build step");

        build_service::cancel(&state, "r", build.id).await.unwrap();
        let b = finalized(&state, build.id).await;
        assert_eq!(b.status, BuildStatus::Cancelled);
        assert!(b.version.is_empty());
        assert!(build_service::cancel(&state, "r", build.id).await.is_err());
    }

    #[tokio::test]
    async fn builds_of_a_repository_run_one_at_a_time() {
        let (_dir, state) = setup("#!/bin/sh\nsleep 1\n").await;
        let first = build_service::create(&state, "r", "main", "", false).await.unwrap();
        let second = build_service::create(&state, "r", "main", "", false).await.unwrap();
        let first = finalized(&state, first.id).await;
        let second = finalized(&state, second.id).await;

        assert_eq!(first.status, BuildStatus::Success, "{}", first.error_message);
        assert_eq!(second.status, BuildStatus::Success, "{}", second.error_message);
        assert!(second.start.unwrap() >= first.finish.unwrap());
    }

    async fn wait_for_status(state: &DingState, build_id: i64, status: BuildStatus) {
        for _ in 0..200 {
            let mut conn = state.db.conn().await.unwrap();
            let b = build_service::get(&mut conn, "r", build_id).await.unwrap();
            if b.status == status {
                return;
            }
            drop(conn);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("build {build_id} never reached {}", status.as_str());
    }

    #[tokio::test]
    async fn build_cancelled_while_queued_never_starts() {
        let (_dir, state) = setup("#!/bin/sh\nsleep 1\n").await;
        let first = build_service::create(&state, "r", "main", "", false).await.unwrap();
        wait_for_status(&state, first.id, BuildStatus::Build).await;

        let second = build_service::create(&state, "r", "main", "", false).await.unwrap();
        let cancelled = build_service::cancel(&state, "r", second.id).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);

        let first = finalized(&state, first.id).await;
        assert_eq!(first.status, BuildStatus::Success, "{}", first.error_message);
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let mut conn = state.db.conn().await.unwrap();
        let detail = build_service::detail(&mut conn, "r", second.id).await.unwrap();
        assert_eq!(detail.build.status, BuildStatus::Cancelled);
        assert!(detail.build.start.is_none());
        assert!(detail.steps.is_empty());
    }

    #[tokio::test]
    async fn cancel_before_the_script_started_stops_it() {
        let (_dir, state) = setup("#!/bin/sh\nsleep 30\n").await;
        // Prepared but not scheduled, so nothing else runs this build.
        let (repo, build) = build_service::prepare(&state, "r", "main", "", false).await.unwrap();
        let data = state.data();
        let build_dir = data.build_dir("r", build.id).unwrap();
        std::fs::create_dir_all(build_dir.join("checkout/r")).unwrap();
        std::fs::create_dir_all(build_dir.join("home")).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = BuildRequest {
            repo_name: repo.name.clone(),
            build_id: build.id,
            uid: 0,
            checkout_path: repo.checkout_path.clone(),
            run_prefix: Vec::new(),
            env: vec!["PATH=/usr/local/bin:/usr/bin:/bin".into()],
            toolchain_dir: None,
            home_dir: build_dir.join("home"),
            sandbox: false,
            sandbox_no_net: false,
        };
        let streams = start_build(&state, request, &cancel).await.unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), read_status(streams.status))
            .await
            .expect("build script kept running")
            .unwrap();
        assert!(!status.is_empty());
    }

    #[tokio::test]
    async fn recovery_runs_builds_that_never_started() {
        let (_dir, state) = setup("#!/bin/sh\necho version: 3.1\n").await;
        let (_, build) = build_service::prepare(&state, "r", "main", "", false).await.unwrap();

        retention::recover(&state).await.unwrap();
        let b = finalized(&state, build.id).await;
        assert_eq!(b.status, BuildStatus::Success, "{}", b.error_message);
        assert_eq!(b.version, "3.1");
    }
}

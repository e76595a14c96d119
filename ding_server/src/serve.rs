//! Process start: the root supervisor and the unprivileged service process.
//!
//! `ding serve` keeps root privileges (when isolating builds), re-executes
//! itself as `ding serve-http` with the service ends of two socket pairs on
//! descriptors 3 and 4, sends the configuration as the first frame and then
//! serves privileged requests until the service process goes away.

use std::future::IntoFuture;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chown, geteuid, Gid, Pid, Uid};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::DingConfig;
use crate::db::Db;
use crate::ipc::root::RootExecutor;
use crate::ipc::{read_frame, socket_pair, unix_stream, write_frame, RootClient};
use crate::logging::LogHandle;
use crate::services::notify::LogNotifier;
use crate::services::retention;
use crate::state::DingState;

/// Descriptor numbers of the message and descriptor sockets in the service
/// process.
const MSG_FD: i32 = 3;
const FDS_FD: i32 = 4;

/// How long open connections (event streams) may delay shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ── Root process ──

pub async fn serve(config: DingConfig, log: LogHandle) -> anyhow::Result<()> {
    let iso = &config.isolate_builds;
    let root = geteuid().is_root();
    if iso.enabled && !root {
        bail!("isolate_builds is enabled, ding serve must be started as root");
    }
    if !iso.enabled && root {
        bail!("refusing to run as root without isolate_builds");
    }

    prepare_data_dir(&config).context("preparing data directory")?;

    let (root_msgs, svc_msgs) = socket_pair().context("message socket pair")?;
    let (root_fds, svc_fds) = socket_pair().context("descriptor socket pair")?;
    let svc_msgs = above_fixed_fds(svc_msgs)?;
    let svc_fds = above_fixed_fds(svc_fds)?;

    let exe = std::env::current_exe().context("locating own binary")?;
    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("serve-http").stdin(Stdio::null());
    if iso.enabled {
        cmd.uid(iso.ding_uid).gid(iso.ding_gid);
    }
    let (msgs_raw, fds_raw) = (svc_msgs.as_raw_fd(), svc_fds.as_raw_fd());
    // SAFETY: only async-signal-safe calls between fork and exec. Both
    // sources are above the targets, so neither dup2 clobbers the other, and
    // dup2 clears close-on-exec on the target.
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(msgs_raw, MSG_FD) < 0 || libc::dup2(fds_raw, FDS_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut child = tokio::process::Command::from(cmd)
        .spawn()
        .with_context(|| format!("starting {} serve-http", exe.display()))?;
    drop((svc_msgs, svc_fds));
    let child_pid = child.id().map(|id| Pid::from_raw(id as i32));
    tracing::info!(pid = ?child_pid, "service process started");

    let mut msgs = unix_stream(root_msgs)?;
    let fds = unix_stream(root_fds)?;
    write_frame(&mut msgs, &config)
        .await
        .context("sending configuration to service process")?;

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let executor = RootExecutor::new(config, Some(log));
    let serving = executor.serve(msgs, fds);
    tokio::pin!(serving);
    let result = loop {
        tokio::select! {
            r = &mut serving => break r,
            _ = term.recv() => forward_stop(child_pid),
            _ = int.recv() => forward_stop(child_pid),
        }
    };

    let status = child.wait().await.context("waiting for service process")?;
    tracing::info!(%status, "service process exited");
    result?;
    if !status.success() {
        bail!("service process failed: {status}");
    }
    Ok(())
}

/// The service process shuts down gracefully on SIGTERM and then closes the
/// connection, which ends the root process.
fn forward_stop(child: Option<Pid>) {
    tracing::info!("stop requested, stopping service process");
    if let Some(pid) = child {
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            tracing::warn!(error = %e, "signalling service process");
        }
    }
}

/// Duplicate a descriptor to a number above the fixed service descriptors.
fn above_fixed_fds(fd: OwnedFd) -> anyhow::Result<OwnedFd> {
    // SAFETY: fcntl on a descriptor we own; the result is a fresh descriptor.
    let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, FDS_FD + 1) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error()).context("duplicating socket");
    }
    // SAFETY: raw was just returned by fcntl and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Create `build/`, `home/` and `release/`. With isolation, the service
/// process owns them.
fn prepare_data_dir(config: &DingConfig) -> anyhow::Result<()> {
    let data = config.data();
    let dirs = [
        data.root().to_path_buf(),
        data.builds(),
        data.root().join("home"),
        data.root().join("release"),
    ];
    for dir in &dirs {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        if config.isolate_builds.enabled {
            let iso = &config.isolate_builds;
            chown(
                dir.as_path(),
                Some(Uid::from_raw(iso.ding_uid)),
                Some(Gid::from_raw(iso.ding_gid)),
            )
            .with_context(|| format!("chown {}", dir.display()))?;
        }
    }
    let db = data.database();
    if config.isolate_builds.enabled && db.exists() {
        let iso = &config.isolate_builds;
        chown(
            db.as_path(),
            Some(Uid::from_raw(iso.ding_uid)),
            Some(Gid::from_raw(iso.ding_gid)),
        )
        .context("chown database")?;
    }
    Ok(())
}

// ── Service process ──

pub async fn serve_http(log: LogHandle) -> anyhow::Result<()> {
    // SAFETY: descriptors 3 and 4 are set up by the root process for this
    // process only.
    let (msgs, fds) = unsafe { (OwnedFd::from_raw_fd(MSG_FD), OwnedFd::from_raw_fd(FDS_FD)) };
    let mut msgs = unix_stream(msgs).context("message socket")?;
    let fds = unix_stream(fds).context("descriptor socket")?;

    let config: DingConfig = read_frame(&mut msgs)
        .await
        .context("reading configuration")?
        .context("root process closed the connection before sending the configuration")?;
    if config.isolate_builds.enabled && geteuid().is_root() {
        bail!("service process must not run as root");
    }
    crate::error::set_show_errors(config.show_errors);

    let db = Db::open(&config.data().database())
        .await
        .context("opening database")?;
    let root_closed = CancellationToken::new();
    let root = RootClient::start(msgs, fds, root_closed.clone());
    let state = DingState::new(config.clone(), db, root, Arc::new(LogNotifier), Some(log));

    retention::recover(&state).await.context("recovering builds")?;

    crate::metrics::init_metrics(config.listen_admin);
    let api = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("listening on {}", config.listen))?;
    let hooks = TcpListener::bind(config.listen_webhook)
        .await
        .with_context(|| format!("listening for webhooks on {}", config.listen_webhook))?;
    tracing::info!(
        api = %config.listen,
        webhook = %config.listen_webhook,
        admin = %config.listen_admin,
        "ding listening"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_shutdown(shutdown.clone(), root_closed));

    let api_server = axum::serve(api, crate::routes::api_router(state.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let hook_server = axum::serve(hooks, crate::routes::webhook_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let servers = async { tokio::try_join!(api_server.into_future(), hook_server.into_future()) };
    let grace = async {
        shutdown.cancelled().await;
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    };

    tokio::select! {
        r = servers => { r.context("serving http")?; }
        _ = grace => tracing::warn!("connections still open after shutdown grace period"),
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn watch_shutdown(shutdown: CancellationToken, root_closed: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "installing ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "installing SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        _ = root_closed.cancelled() => tracing::warn!("root process connection closed, shutting down"),
    }
    shutdown.cancel();
}

/// Apply pending database migrations.
pub async fn upgrade(config_path: &Path) -> anyhow::Result<()> {
    let config = DingConfig::load(config_path)?;
    let db = Db::open(&config.data().database())
        .await
        .context("opening database")?;
    drop(db);
    println!("database up to date");
    Ok(())
}

//! The root process: executes privileged requests from the service process.
//!
//! Requests are handled one at a time. Paths are only ever built from the
//! configured data directory plus validated names; uid ranges and the ding
//! gid come from this process's own configuration.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, Pid};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::fdpass;
use super::toolchain::Toolchains;
use super::{read_frame, write_frame, BuildRequest, Msg, REPLY_UPDATED};
use crate::config::DingConfig;
use crate::logging::{self, LogHandle};
use crate::paths::DataDir;

/// Running build processes, by build id.
type Commands = Arc<Mutex<HashMap<i64, CancellationToken>>>;

enum Outcome {
    Done,
    Updated,
    /// Read ends of stdout, stderr and status of a started build.
    Started([OwnedFd; 3]),
}

pub struct RootExecutor {
    config: DingConfig,
    data: DataDir,
    commands: Commands,
    toolchains: Option<Toolchains>,
    log: Option<LogHandle>,
}

impl RootExecutor {
    pub fn new(config: DingConfig, log: Option<LogHandle>) -> Self {
        let toolchains = config.go_toolchain_dir.as_ref().and_then(|dir| {
            Toolchains::new(dir.clone(), config.isolate_builds.enabled)
                .inspect_err(|e| tracing::warn!("toolchain dir unusable: {e:#}"))
                .ok()
        });
        Self {
            data: config.data(),
            config,
            commands: Arc::default(),
            toolchains,
            log,
        }
    }

    /// Serve requests until the service process closes the message socket.
    pub async fn serve(self, mut msgs: UnixStream, fds: UnixStream) -> anyhow::Result<()> {
        loop {
            let msg: Msg = match read_frame(&mut msgs).await.context("reading request")? {
                Some(msg) => msg,
                None => {
                    tracing::info!("service process closed the connection, stopping");
                    return Ok(());
                }
            };
            let kind = msg.kind();
            tracing::debug!(kind, "handling request");

            match self.handle(msg).await {
                Ok(Outcome::Done) => write_frame(&mut msgs, "").await?,
                Ok(Outcome::Updated) => write_frame(&mut msgs, REPLY_UPDATED).await?,
                Ok(Outcome::Started(files)) => {
                    write_frame(&mut msgs, "").await?;
                    let raw: Vec<RawFd> = files.iter().map(AsRawFd::as_raw_fd).collect();
                    fdpass::send_fds(&fds, &raw)
                        .await
                        .context("sending build descriptors")?;
                }
                Err(e) => {
                    let text = format!("{e:#}");
                    tracing::warn!(kind, error = %text, "request failed");
                    write_frame(&mut msgs, &text).await?;
                }
            }
        }
    }

    async fn handle(&self, msg: Msg) -> anyhow::Result<Outcome> {
        match msg {
            Msg::Build(req) => self.start_build(req),
            Msg::Chown {
                repo_name,
                build_id,
                shared_home,
                uid,
            } => self.chown(&repo_name, build_id, shared_home, uid).await,
            Msg::RemoveBuildDir {
                repo_name,
                build_id,
            } => {
                let dir = self.data.build_dir(&repo_name, build_id)?;
                remove_blocking(vec![dir]).await
            }
            Msg::RemoveRepo { repo_name } => {
                let dirs = vec![
                    self.data.shared_home(&repo_name)?,
                    self.data.repo_builds(&repo_name)?,
                    self.data.repo_releases(&repo_name)?,
                ];
                remove_blocking(dirs).await
            }
            Msg::RemoveSharedHome { repo_name } => {
                let dir = self.data.shared_home(&repo_name)?;
                remove_blocking(vec![dir]).await
            }
            Msg::CancelCommand { build_id } => {
                let token = self.lock_commands().remove(&build_id);
                if let Some(token) = token {
                    tracing::info!(build_id, "cancelling build process");
                    token.cancel();
                }
                Ok(Outcome::Done)
            }
            Msg::InstallGoTool { file, shortname } => {
                self.toolchains()?.install(&file, &shortname).await?;
                Ok(Outcome::Done)
            }
            Msg::RemoveGoTool { goversion } => {
                self.toolchains()?.remove(&goversion)?;
                Ok(Outcome::Done)
            }
            Msg::ActivateGoTool {
                goversion,
                shortname,
            } => {
                self.toolchains()?.activate(&goversion, &shortname)?;
                Ok(Outcome::Done)
            }
            Msg::AutomaticGoTool => {
                if self.toolchains()?.automatic().await? {
                    Ok(Outcome::Updated)
                } else {
                    Ok(Outcome::Done)
                }
            }
            Msg::LogLevelSet { level } => {
                if let Some(handle) = &self.log {
                    logging::set_level(handle, &level).map_err(anyhow::Error::msg)?;
                }
                Ok(Outcome::Done)
            }
        }
    }

    fn toolchains(&self) -> anyhow::Result<&Toolchains> {
        self.toolchains
            .as_ref()
            .context("go toolchain dir not configured")
    }

    fn lock_commands(&self) -> std::sync::MutexGuard<'_, HashMap<i64, CancellationToken>> {
        self.commands
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_uid(&self, uid: u32) -> anyhow::Result<()> {
        let iso = &self.config.isolate_builds;
        if !(iso.uid_start..iso.uid_end).contains(&uid) {
            bail!("bad parameters: uid {uid} outside build uid range");
        }
        Ok(())
    }

    async fn chown(
        &self,
        repo_name: &str,
        build_id: i64,
        shared_home: bool,
        uid: u32,
    ) -> anyhow::Result<Outcome> {
        if !self.config.isolate_builds.enabled {
            return Ok(Outcome::Done);
        }
        self.check_uid(uid)?;
        let gid = self.config.isolate_builds.ding_gid;
        let build_dir = self.data.build_dir(repo_name, build_id)?;
        let dirs = [
            self.data.home_dir(repo_name, build_id, shared_home)?,
            build_dir.join("checkout"),
            build_dir.join("dl"),
        ];
        tokio::task::spawn_blocking(move || {
            for dir in &dirs {
                chown_tree(dir, uid, gid).with_context(|| format!("chown {}", dir.display()))?;
            }
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("chown task")??;
        Ok(Outcome::Done)
    }

    fn start_build(&self, req: BuildRequest) -> anyhow::Result<Outcome> {
        let iso = &self.config.isolate_builds;
        let build_dir = self.data.build_dir(&req.repo_name, req.build_id)?;
        let work_dir = self
            .data
            .checkout_dir(&req.repo_name, req.build_id, &req.checkout_path)?;
        let own_home = build_dir.join("home");
        let shared_home = self.data.shared_home(&req.repo_name)?;
        if req.home_dir != own_home && req.home_dir != shared_home {
            bail!("bad parameters: home dir {}", req.home_dir.display());
        }
        if req.toolchain_dir != self.config.go_toolchain_dir {
            bail!("bad parameters: toolchain dir");
        }
        if iso.enabled {
            self.check_uid(req.uid)?;
        }

        let mut argv: Vec<OsString> = req.run_prefix.iter().map(OsString::from).collect();
        if req.sandbox {
            argv.extend(sandbox_args(
                &iso.bubblewrap,
                &build_dir,
                &req.home_dir,
                req.toolchain_dir.as_deref(),
                &work_dir,
                req.sandbox_no_net,
            ));
        }
        argv.push(build_dir.join("scripts").join("build.sh").into_os_string());

        let (stdout_r, stdout_w) = pipe2(OFlag::O_CLOEXEC).context("stdout pipe")?;
        let (stderr_r, stderr_w) = pipe2(OFlag::O_CLOEXEC).context("stderr pipe")?;
        let (status_r, status_w) = pipe2(OFlag::O_CLOEXEC).context("status pipe")?;

        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&work_dir)
            .env_clear()
            .envs(req.env.iter().filter_map(|kv| kv.split_once('=')))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_w))
            .stderr(Stdio::from(stderr_w))
            .process_group(0);
        if iso.enabled {
            // std drops supplementary groups when root sets a uid.
            cmd.uid(req.uid).gid(iso.ding_gid);
        }

        let token = CancellationToken::new();
        self.lock_commands().insert(req.build_id, token.clone());

        let mut cmd = tokio::process::Command::from(cmd);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.lock_commands().remove(&req.build_id);
                return Err(e).with_context(|| format!("starting {}", argv[0].to_string_lossy()));
            }
        };
        // Close our copies of the write ends.
        drop(cmd);

        tracing::info!(build_id = req.build_id, repo = %req.repo_name, uid = req.uid, "build started");

        let commands = self.commands.clone();
        let build_id = req.build_id;
        tokio::spawn(async move {
            let status = wait_process(child, &token).await;
            commands
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&build_id);
            tracing::info!(build_id, status = %status, "build process finished");
            match tokio::net::unix::pipe::Sender::from_owned_fd(status_w) {
                Ok(mut w) => {
                    if let Err(e) = write_frame(&mut w, &status).await {
                        tracing::error!(build_id, error = %e, "writing build status");
                    }
                }
                Err(e) => tracing::error!(build_id, error = %e, "opening status pipe"),
            }
        });

        Ok(Outcome::Started([stdout_r, stderr_r, status_r]))
    }
}

/// Wait for a process, killing its process group when `cancel` fires. Returns
/// the empty string on success, the exit status otherwise.
pub(crate) async fn wait_process(mut child: Child, cancel: &CancellationToken) -> String {
    let pgid = child.id().and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw);
    let result = tokio::select! {
        r = child.wait() => r,
        _ = cancel.cancelled() => {
            if let Some(pgid) = pgid {
                if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                    tracing::warn!(error = %e, "killing process group");
                }
            }
            child.wait().await
        }
    };
    match result {
        Ok(status) if status.success() => String::new(),
        Ok(status) => status.to_string(),
        Err(e) => format!("waiting for process: {e}"),
    }
}

/// bubblewrap arguments exposing only the system, the build, home and
/// toolchain directories.
pub fn sandbox_args(
    bwrap: &str,
    build_dir: &Path,
    home_dir: &Path,
    toolchain_dir: Option<&Path>,
    work_dir: &Path,
    no_net: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = [bwrap, "--unshare-all", "--die-with-parent"]
        .into_iter()
        .map(OsString::from)
        .collect();
    if !no_net {
        args.push("--share-net".into());
    }
    for sys in ["/usr", "/etc", "/bin", "/sbin", "/lib", "/lib64"] {
        args.extend(["--ro-bind-try", sys, sys].map(OsString::from));
    }
    args.extend(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"].map(OsString::from));
    let mut bind = |flag: &str, p: &Path| {
        args.extend([
            OsString::from(flag),
            p.as_os_str().to_owned(),
            p.as_os_str().to_owned(),
        ]);
    };
    bind("--bind", build_dir);
    if !home_dir.starts_with(build_dir) {
        bind("--bind", home_dir);
    }
    if let Some(dir) = toolchain_dir {
        bind("--ro-bind", dir);
    }
    args.extend([
        OsString::from("--chdir"),
        work_dir.as_os_str().to_owned(),
        OsString::from("--"),
    ]);
    args
}

/// Recursively change ownership, leaving symlinks and what they point to alone.
pub fn chown_tree(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// Remove a tree, first making directories writable so the removal cannot
/// be blocked by a build that dropped write permissions. Missing is fine.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    make_dirs_writable(path);
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        r => r,
    }
}

fn make_dirs_writable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        let perms = std::fs::Permissions::from_mode(mode | 0o700);
        if let Err(e) = std::fs::set_permissions(path, perms) {
            tracing::warn!(path = %path.display(), error = %e, "making dir writable for removal");
        }
    }
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            make_dirs_writable(&entry.path());
        }
    }
}

async fn remove_blocking(dirs: Vec<PathBuf>) -> anyhow::Result<Outcome> {
    tokio::task::spawn_blocking(move || {
        for dir in &dirs {
            remove_tree(dir).with_context(|| format!("removing {}", dir.display()))?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("remove task")??;
    Ok(Outcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn sandbox_binds_build_home_and_toolchain() {
        let args = sandbox_args(
            "bwrap",
            Path::new("/d/build/r/1"),
            Path::new("/d/home/r"),
            Some(Path::new("/tc")),
            Path::new("/d/build/r/1/checkout/r"),
            true,
        );
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        let joined = args.join(" ");
        assert_eq!(args[0], "bwrap");
        assert!(!args.contains(&"--share-net".to_string()));
        assert!(joined.contains("--bind /d/build/r/1 /d/build/r/1"));
        assert!(joined.contains("--bind /d/home/r /d/home/r"));
        assert!(joined.contains("--ro-bind /tc /tc"));
        assert!(joined.ends_with("--chdir /d/build/r/1/checkout/r --"));

        let args = sandbox_args(
            "bwrap",
            Path::new("/d/build/r/1"),
            Path::new("/d/build/r/1/home"),
            None,
            Path::new("/d/build/r/1/checkout/r"),
            false,
        );
        assert!(args.contains(&OsString::from("--share-net")));
    }

    #[test]
    fn remove_tree_handles_readonly_dirs_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("t");
        std::fs::create_dir_all(tree.join("ro/sub")).unwrap();
        std::fs::write(tree.join("ro/sub/f"), "x").unwrap();
        std::fs::set_permissions(tree.join("ro"), std::fs::Permissions::from_mode(0o500)).unwrap();

        remove_tree(&tree).unwrap();
        assert!(!tree.exists());
        remove_tree(&tree).unwrap();
    }

    #[tokio::test]
    async fn bad_parameters_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = DingConfig {
            password: "pw".into(),
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let root = RootExecutor::new(config, None);
        let req = BuildRequest {
            repo_name: "r".into(),
            build_id: 1,
            uid: 0,
            checkout_path: "r".into(),
            run_prefix: vec![],
            env: vec![],
            toolchain_dir: None,
            home_dir: PathBuf::from("/etc"),
            sandbox: false,
            sandbox_no_net: false,
        };
        assert!(root.handle(Msg::Build(req.clone())).await.is_err());

        let req = BuildRequest {
            repo_name: "..".into(),
            ..req
        };
        assert!(root.handle(Msg::Build(req)).await.is_err());
        assert!(root
            .handle(Msg::RemoveRepo {
                repo_name: String::new()
            })
            .await
            .is_err());
        // chown is a no-op without isolation
        assert!(matches!(
            root.handle(Msg::Chown {
                repo_name: "r".into(),
                build_id: 1,
                shared_home: false,
                uid: 1
            })
            .await
            .unwrap(),
            Outcome::Done
        ));
        assert!(root
            .handle(Msg::RemoveGoTool {
                goversion: "go1.22.0".into()
            })
            .await
            .is_err());
    }
}

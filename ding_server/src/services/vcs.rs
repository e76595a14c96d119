//! Cloning and commit resolution for git, mercurial and command repositories.
//!
//! Clones run in the service process as the ding user, with the build
//! environment and the run prefix. Their output is captured as step `clone`.

use std::path::Path;
use std::process::Stdio;

use tokio_util::sync::CancellationToken;

use super::tracker::Tracker;
use crate::error::{DingError, Result, ServerContext};
use crate::events::EventHub;
use crate::ipc::root::wait_process;
use crate::models::repo::{Repo, Vcs};

/// Runs local commands for one build, each captured by the output tracker.
pub struct LocalRunner<'a> {
    pub events: &'a EventHub,
    pub build_id: i64,
    pub build_dir: &'a Path,
    pub run_prefix: &'a [String],
    pub env: &'a [String],
    pub cancel: &'a CancellationToken,
}

impl LocalRunner<'_> {
    /// Run `args` behind the run prefix in `work_dir`. A failing command is
    /// a user error.
    pub async fn run(&self, step: &str, work_dir: &Path, args: &[&str]) -> Result<()> {
        let argv: Vec<&str> = self
            .run_prefix
            .iter()
            .map(String::as_str)
            .chain(args.iter().copied())
            .collect();
        let Some((program, rest)) = argv.split_first() else {
            return Err(DingError::server("empty command"));
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest)
            .current_dir(work_dir)
            .env_clear()
            .envs(self.env.iter().filter_map(|kv| kv.split_once('=')))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .server_context(&format!("starting {program}"))?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(DingError::server("command output not captured"));
        };

        tracing::debug!(build_id = self.build_id, step, command = ?argv, "running command");
        let cancel = self.cancel.clone();
        let waiter = tokio::spawn(async move { wait_process(child, &cancel).await });

        let output_dir = self.build_dir.join("output");
        let tracker = Tracker {
            events: self.events,
            build_id: self.build_id,
            step,
            output_dir: &output_dir,
        };
        let failure = tracker
            .track(stdout, stderr, async {
                match waiter.await {
                    Ok(status) if status.is_empty() => None,
                    Ok(status) => Some(status),
                    Err(e) => Some(format!("waiting for command: {e}")),
                }
            })
            .await?;
        match failure {
            None => Ok(()),
            Some(status) => Err(DingError::user(format!("{}: {status}", args.join(" ")))),
        }
    }
}

/// Clone the repository into `checkout/<checkout_path>` of the build
/// directory. A known commit is checked out right away for mercurial.
pub async fn clone(runner: &LocalRunner<'_>, repo: &Repo, branch: &str, commit: &str) -> Result<()> {
    let target = format!("checkout/{}", repo.checkout_path);
    let dir = runner.build_dir;
    let cloned = match repo.vcs {
        // Without hard links, so a later chown leaves a local origin alone.
        Vcs::Git => {
            runner
                .run(
                    "clone",
                    dir,
                    &[
                        "git",
                        "clone",
                        "--recursive",
                        "--no-hardlinks",
                        "--branch",
                        branch,
                        repo.origin.as_str(),
                        target.as_str(),
                    ],
                )
                .await
        }
        Vcs::Mercurial => {
            let mut args = vec!["hg", "clone", "--branch", branch];
            if !commit.is_empty() {
                args.extend(["--rev", commit, "--updaterev", commit]);
            }
            args.extend([repo.origin.as_str(), target.as_str()]);
            runner.run("clone", dir, &args).await
        }
        Vcs::Command => runner.run("clone", dir, &["sh", "-c", repo.origin.as_str()]).await,
    };
    cloned.map_err(|e| match e {
        DingError::User(msg) => DingError::user(format!("cloning {} repository: {msg}", repo.vcs)),
        e => e,
    })
}

/// Commit of a fresh clone: the `commit:` line ending the clone output of a
/// command repository, or what the vcs reports for the working copy.
pub async fn resolve_commit(runner: &LocalRunner<'_>, repo: &Repo, checkout_dir: &Path) -> Result<String> {
    let commit = match repo.vcs {
        Vcs::Command => {
            let path = runner.build_dir.join("output/clone.stdout");
            let stdout = tokio::fs::read_to_string(&path)
                .await
                .server_context("reading clone output")?;
            commit_from_clone_output(&stdout)?
        }
        Vcs::Git | Vcs::Mercurial => {
            let args: &[&str] = match repo.vcs {
                Vcs::Git => &["git", "rev-parse", "HEAD"],
                _ => &["hg", "id", "--id"],
            };
            let argv: Vec<&str> = runner
                .run_prefix
                .iter()
                .map(String::as_str)
                .chain(args.iter().copied())
                .collect();
            let output = tokio::process::Command::new(argv[0])
                .args(&argv[1..])
                .current_dir(checkout_dir)
                .env_clear()
                .envs(runner.env.iter().filter_map(|kv| kv.split_once('=')))
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .server_context("finding commit hash")?;
            if !output.status.success() {
                return Err(DingError::server(format!(
                    "finding commit hash: {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
    };
    if commit.is_empty() {
        return Err(DingError::server("finding commit hash: no commit found"));
    }
    Ok(commit)
}

fn commit_from_clone_output(stdout: &str) -> Result<String> {
    let last = stdout.trim().lines().last().unwrap_or_default();
    last.strip_prefix("commit:")
        .map(|c| c.trim().to_string())
        .ok_or_else(|| {
            DingError::user(
                r#"output of clone command should end with a line "commit:" followed by the commit id"#,
            )
        })
}

/// Check out the resolved commit, detached, so the build is reproducible.
pub async fn checkout_commit(runner: &LocalRunner<'_>, checkout_dir: &Path, commit: &str) -> Result<()> {
    runner
        .run("clone", checkout_dir, &["git", "checkout", "--detach", commit])
        .await
        .map_err(|e| match e {
            DingError::User(msg) => DingError::user(format!("checkout revision: {msg}")),
            e => e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StringList;

    fn command_repo(origin: &str) -> Repo {
        Repo {
            name: "t0".into(),
            vcs: Vcs::Command,
            origin: origin.into(),
            default_branch: "main".into(),
            checkout_path: "t0".into(),
            build_script: String::new(),
            uid: None,
            home_disk_usage: 0,
            webhook_secret: String::new(),
            allow_global_webhook_secrets: false,
            bubblewrap: false,
            bubblewrap_no_net: false,
            build_on_updated_toolchain: false,
            notify_emails: StringList::default(),
        }
    }

    fn build_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("output")).unwrap();
        dir
    }

    #[test]
    fn commit_line_must_come_last() {
        assert_eq!(commit_from_clone_output("cloning\ncommit: abc123\n").unwrap(), "abc123");
        assert!(commit_from_clone_output("commit: abc\nmore\n").is_err());
        assert!(commit_from_clone_output("").is_err());
    }

    #[tokio::test]
    async fn command_clone_and_resolve() {
        let dir = build_dir();
        let hub = EventHub::start();
        let cancel = CancellationToken::new();
        let env = vec![format!("HOME={}", dir.path().display())];
        let runner = LocalRunner {
            events: &hub,
            build_id: 1,
            build_dir: dir.path(),
            run_prefix: &[],
            env: &env,
            cancel: &cancel,
        };
        let repo = command_repo("echo clone..; mkdir -p checkout/t0; echo commit: abc123");
        clone(&runner, &repo, "main", "").await.unwrap();
        assert!(dir.path().join("checkout/t0").is_dir());
        let commit = resolve_commit(&runner, &repo, &dir.path().join("checkout/t0"))
            .await
            .unwrap();
        assert_eq!(commit, "abc123");
        assert!(dir.path().join("output/clone.nsec").exists());
    }

    #[tokio::test]
    async fn failing_clone_is_a_user_error() {
        let dir = build_dir();
        let hub = EventHub::start();
        let cancel = CancellationToken::new();
        let runner = LocalRunner {
            events: &hub,
            build_id: 2,
            build_dir: dir.path(),
            run_prefix: &[],
            env: &[],
            cancel: &cancel,
        };
        let err = clone(&runner, &command_repo("echo oops >&2; exit 3"), "main", "")
            .await
            .unwrap_err();
        assert!(matches!(err, DingError::User(_)));
        assert!(err.to_string().contains("exit status: 3"), "{err}");
        let stderr = std::fs::read_to_string(dir.path().join("output/clone.stderr")).unwrap();
        assert_eq!(stderr, "oops\n");
    }

    #[tokio::test]
    async fn cancel_kills_a_running_command() {
        let dir = build_dir();
        let hub = EventHub::start();
        let cancel = CancellationToken::new();
        let runner = LocalRunner {
            events: &hub,
            build_id: 3,
            build_dir: dir.path(),
            run_prefix: &[],
            env: &[],
            cancel: &cancel,
        };
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            c.cancel();
        });
        let t0 = std::time::Instant::now();
        let err = runner.run("clone", dir.path(), &["sh", "-c", "sleep 30"]).await.unwrap_err();
        assert!(t0.elapsed() < std::time::Duration::from_secs(10));
        assert!(err.to_string().contains("signal"), "{err}");
    }
}

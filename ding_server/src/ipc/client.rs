//! Service side of the root connection.
//!
//! A single task owns both sockets and handles queued requests strictly in
//! order: one frame out, one reply in, plus descriptors for a started build.
//! Callers wait on a per-request reply channel.

use std::io;
use std::os::fd::OwnedFd;

use tokio::net::unix::pipe;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::fdpass::{self, BUILD_FDS};
use super::{read_frame, write_frame, BuildRequest, Msg, REPLY_UPDATED};
use crate::error::{DingError, Result};

/// Read ends handed over for a started build.
#[derive(Debug)]
pub struct BuildStreams {
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
    /// Carries one frame with the exit string, empty on success.
    pub status: OwnedFd,
}

enum Reply {
    Done,
    Updated,
    Started(BuildStreams),
}

struct Request {
    msg: Msg,
    reply: oneshot::Sender<std::result::Result<Reply, String>>,
}

#[derive(Clone)]
pub struct RootClient {
    tx: mpsc::Sender<Request>,
}

impl RootClient {
    /// Spawn the serializer. `closed` is cancelled once the root process
    /// connection ends.
    pub fn start(msgs: UnixStream, fds: UnixStream, closed: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(serialize(msgs, fds, rx, closed));
        Self { tx }
    }

    async fn request(&self, msg: Msg) -> Result<std::result::Result<Reply, String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { msg, reply })
            .await
            .map_err(|_| DingError::server("connection to root process closed"))?;
        rx.await
            .map_err(|_| DingError::server("connection to root process closed"))
    }

    /// Send a request; a refusal by the root process is a server error.
    pub async fn call(&self, msg: Msg) -> Result<()> {
        let kind = msg.kind();
        self.request(msg)
            .await?
            .map(|_| ())
            .map_err(|e| DingError::server(format!("{kind}: {e}")))
    }

    /// Send a request whose refusal is caused by user input.
    pub async fn call_user(&self, msg: Msg) -> Result<()> {
        self.request(msg)
            .await?
            .map(|_| ())
            .map_err(DingError::User)
    }

    pub async fn start_build(&self, req: BuildRequest) -> Result<BuildStreams> {
        match self.request(Msg::Build(req)).await? {
            Ok(Reply::Started(streams)) => Ok(streams),
            Ok(_) => Err(DingError::server("root process did not start the build")),
            Err(e) => Err(DingError::user(format!("starting build: {e}"))),
        }
    }

    /// Returns whether toolchains changed.
    pub async fn automatic_go_toolchain(&self) -> Result<bool> {
        match self.request(Msg::AutomaticGoTool).await? {
            Ok(reply) => Ok(matches!(reply, Reply::Updated)),
            Err(e) => Err(DingError::server(format!("updating go toolchains: {e}"))),
        }
    }
}

/// Read the exit string of a build from its status descriptor.
pub async fn read_status(status: OwnedFd) -> io::Result<String> {
    let mut r = pipe::Receiver::from_owned_fd(status)?;
    Ok(read_frame(&mut r)
        .await?
        .unwrap_or_else(|| "build status closed without a result".to_string()))
}

async fn serialize(
    mut msgs: UnixStream,
    fds: UnixStream,
    mut rx: mpsc::Receiver<Request>,
    closed: CancellationToken,
) {
    let result: io::Result<()> = loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else { break Ok(()) };
                match exchange(&mut msgs, &fds, &req.msg).await {
                    Ok(reply) => {
                        let _ = req.reply.send(reply);
                    }
                    Err(e) => {
                        let _ = req.reply.send(Err(format!("root process: {e}")));
                        break Err(e);
                    }
                }
            }
            ready = msgs.readable() => {
                // The root process never writes unprompted: this is EOF or an error.
                if let Err(e) = ready {
                    break Err(e);
                }
                let mut b = [0u8; 1];
                match msgs.try_read(&mut b) {
                    Ok(0) => break Ok(()),
                    Ok(_) => break Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected data from root process")),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => break Err(e),
                }
            }
        }
    };
    match result {
        Ok(()) => tracing::info!("connection to root process closed"),
        Err(e) => tracing::error!(error = %e, "connection to root process failed"),
    }
    closed.cancel();
}

async fn exchange(
    msgs: &mut UnixStream,
    fds: &UnixStream,
    msg: &Msg,
) -> io::Result<std::result::Result<Reply, String>> {
    write_frame(msgs, msg).await?;
    let reply: String = read_frame(msgs).await?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "root process closed the connection")
    })?;

    if !reply.is_empty() {
        if matches!(msg, Msg::AutomaticGoTool) && reply == REPLY_UPDATED {
            return Ok(Ok(Reply::Updated));
        }
        return Ok(Err(reply));
    }
    if !matches!(msg, Msg::Build(_)) {
        return Ok(Ok(Reply::Done));
    }

    let mut files = fdpass::recv_fds(fds, BUILD_FDS).await?.into_iter();
    match (files.next(), files.next(), files.next()) {
        (Some(stdout), Some(stderr), Some(status)) => Ok(Ok(Reply::Started(BuildStreams {
            stdout,
            stderr,
            status,
        }))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing build descriptors",
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DingConfig;
    use crate::ipc::root::RootExecutor;
    use crate::ipc::{socket_pair, unix_stream};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Root executor and client connected in-process over real socket pairs.
    pub(crate) fn connect(config: DingConfig) -> (RootClient, CancellationToken) {
        let (root_msgs, svc_msgs) = socket_pair().unwrap();
        let (root_fds, svc_fds) = socket_pair().unwrap();
        let root = RootExecutor::new(config, None);
        let (root_msgs, root_fds) = (unix_stream(root_msgs).unwrap(), unix_stream(root_fds).unwrap());
        tokio::spawn(async move { root.serve(root_msgs, root_fds).await });
        let closed = CancellationToken::new();
        let client = RootClient::start(
            unix_stream(svc_msgs).unwrap(),
            unix_stream(svc_fds).unwrap(),
            closed.clone(),
        );
        (client, closed)
    }

    fn skeleton(data: &Path, script: &str) {
        let build = data.join("build/r/1");
        std::fs::create_dir_all(build.join("scripts")).unwrap();
        std::fs::create_dir_all(build.join("checkout/r")).unwrap();
        std::fs::create_dir_all(build.join("home")).unwrap();
        let sh = build.join("scripts/build.sh");
        std::fs::write(&sh, script).unwrap();
        std::fs::set_permissions(&sh, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn request(data: &Path) -> BuildRequest {
        BuildRequest {
            repo_name: "r".into(),
            build_id: 1,
            uid: 0,
            checkout_path: "r".into(),
            run_prefix: vec![],
            env: vec!["PATH=/usr/bin:/bin".into()],
            toolchain_dir: None,
            home_dir: data.join("build/r/1/home"),
            sandbox: false,
            sandbox_no_net: false,
        }
    }

    fn config(data: &Path) -> DingConfig {
        DingConfig {
            password: "pw".into(),
            data_dir: data.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn build_streams_and_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        skeleton(dir.path(), "#!/bin/sh\necho out\necho err >&2\nexit 3\n");
        let (client, _closed) = connect(config(dir.path()));

        let streams = client.start_build(request(dir.path())).await.unwrap();
        let mut out = String::new();
        pipe::Receiver::from_owned_fd(streams.stdout)
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "out\n");
        let status = read_status(streams.status).await.unwrap();
        assert!(status.contains('3'), "{status}");

        client
            .call(Msg::RemoveBuildDir {
                repo_name: "r".into(),
                build_id: 1,
            })
            .await
            .unwrap();
        assert!(!dir.path().join("build/r/1").exists());
    }

    #[tokio::test]
    async fn cancel_kills_build_process() {
        let dir = tempfile::tempdir().unwrap();
        skeleton(dir.path(), "#!/bin/sh\nsleep 30\n");
        let (client, _closed) = connect(config(dir.path()));

        let streams = client.start_build(request(dir.path())).await.unwrap();
        client.call(Msg::CancelCommand { build_id: 1 }).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), read_status(streams.status))
            .await
            .unwrap()
            .unwrap();
        assert!(!status.is_empty());

        // unknown build ids are fine
        client.call(Msg::CancelCommand { build_id: 99 }).await.unwrap();
    }

    #[tokio::test]
    async fn refused_build_is_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _closed) = connect(config(dir.path()));
        let mut req = request(dir.path());
        req.home_dir = "/tmp".into();
        let err = client.start_build(req).await.unwrap_err();
        assert!(err.is_user(), "{err}");
    }

    #[tokio::test]
    async fn root_exit_cancels_closed_token() {
        let (root_msgs, svc_msgs) = socket_pair().unwrap();
        let (_root_fds, svc_fds) = socket_pair().unwrap();
        let closed = CancellationToken::new();
        let client = RootClient::start(
            unix_stream(svc_msgs).unwrap(),
            unix_stream(svc_fds).unwrap(),
            closed.clone(),
        );
        drop(root_msgs);
        tokio::time::timeout(Duration::from_secs(5), closed.cancelled())
            .await
            .unwrap();
        assert!(client.call(Msg::CancelCommand { build_id: 1 }).await.is_err());
    }
}

//! Messages between the service process and the root process.
//!
//! Both directions use length-prefixed frames: a big-endian `u32` byte count
//! followed by a JSON document. The service sends one [`Msg`] and reads one
//! reply string, empty on success. Descriptors for a started build travel
//! separately over a second socket, see [`fdpass`].

pub mod client;
pub mod fdpass;
pub mod root;
pub mod toolchain;

use std::io;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use client::{BuildStreams, RootClient};
pub use toolchain::GoFile;

/// Frames larger than this are refused.
pub const MAX_FRAME: usize = 16 << 20;

/// Reply to `AutomaticGoTool` when toolchains were installed or switched.
pub const REPLY_UPDATED: &str = "updated";

/// Start the build script of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub repo_name: String,
    pub build_id: i64,
    /// Ignored unless builds are isolated.
    pub uid: u32,
    pub checkout_path: String,
    pub run_prefix: Vec<String>,
    /// Complete environment, `KEY=value`.
    pub env: Vec<String>,
    pub toolchain_dir: Option<PathBuf>,
    pub home_dir: PathBuf,
    pub sandbox: bool,
    pub sandbox_no_net: bool,
}

/// Request from the service process. Exactly one variant per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Msg {
    Build(BuildRequest),
    /// Hand the home, checkout and download directories of a build to `uid`.
    Chown {
        repo_name: String,
        build_id: i64,
        shared_home: bool,
        uid: u32,
    },
    RemoveBuildDir {
        repo_name: String,
        build_id: i64,
    },
    /// Remove build and release trees and the shared home of a repository.
    RemoveRepo {
        repo_name: String,
    },
    RemoveSharedHome {
        repo_name: String,
    },
    /// Kill the build process of a build, if any.
    CancelCommand {
        build_id: i64,
    },
    InstallGoTool {
        file: GoFile,
        shortname: String,
    },
    RemoveGoTool {
        goversion: String,
    },
    ActivateGoTool {
        goversion: String,
        shortname: String,
    },
    AutomaticGoTool,
    LogLevelSet {
        level: String,
    },
}

impl Msg {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build(_) => "build",
            Self::Chown { .. } => "chown",
            Self::RemoveBuildDir { .. } => "removeBuildDir",
            Self::RemoveRepo { .. } => "removeRepo",
            Self::RemoveSharedHome { .. } => "removeSharedHome",
            Self::CancelCommand { .. } => "cancelCommand",
            Self::InstallGoTool { .. } => "installGoTool",
            Self::RemoveGoTool { .. } => "removeGoTool",
            Self::ActivateGoTool { .. } => "activateGoTool",
            Self::AutomaticGoTool => "automaticGoTool",
            Self::LogLevelSet { .. } => "logLevelSet",
        }
    }
}

pub async fn write_frame<W, T>(w: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let buf = serde_json::to_vec(value).map_err(io::Error::other)?;
    if buf.len() > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes too large", buf.len()),
        ));
    }
    let len = u32::try_from(buf.len()).map_err(io::Error::other)?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&buf).await?;
    w.flush().await
}

/// Read one frame. `None` on a clean end of stream before the length prefix.
pub async fn read_frame<R, T>(r: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes too large"),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Turn one end of a socket pair into a tokio stream.
pub fn unix_stream(fd: std::os::fd::OwnedFd) -> io::Result<tokio::net::UnixStream> {
    let std = std::os::unix::net::UnixStream::from(fd);
    std.set_nonblocking(true)?;
    tokio::net::UnixStream::from_std(std)
}

/// A connected pair of stream sockets, close-on-exec.
pub fn socket_pair() -> io::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    Ok(socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?)
}

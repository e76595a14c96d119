//! Go toolchains under the configured toolchain directory.
//!
//! Each toolchain lives in `<dir>/<goversion>`. The `go`, `go-prev` and
//! `go-next` symlinks select the toolchains builds use. Changes happen in the
//! root process; the service process only reads the directory.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{bail, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const RELEASES_URL: &str = "https://go.dev/dl/?mode=json&include=all";
const DOWNLOAD_URL: &str = "https://go.dev/dl/";

pub const SHORTNAMES: [&str; 3] = ["go", "go-prev", "go-next"];

static GOVERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^go[0-9]+(\.[0-9]+)+([a-z]+[0-9]+)?$").expect("goversion pattern")
});

/// A downloadable file of a Go release, as listed by go.dev.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoFile {
    pub filename: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub sha256: String,
    #[serde(default)]
    pub size: i64,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoRelease {
    pub version: String,
    pub stable: bool,
    pub files: Vec<GoFile>,
}

/// Targets of the shortname symlinks. Empty when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActiveToolchains {
    pub go: String,
    pub go_prev: String,
    pub go_next: String,
}

pub fn valid_goversion(goversion: &str) -> bool {
    GOVERSION.is_match(goversion)
}

pub fn valid_shortname(shortname: &str) -> bool {
    SHORTNAMES.contains(&shortname)
}

pub fn active(dir: &Path) -> ActiveToolchains {
    let link = |name: &str| {
        std::fs::read_link(dir.join(name))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    ActiveToolchains {
        go: link("go"),
        go_prev: link("go-prev"),
        go_next: link("go-next"),
    }
}

/// Installed toolchain versions, sorted.
pub fn installed(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut versions = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && valid_goversion(&name) {
            versions.push(name);
        }
    }
    versions.sort();
    Ok(versions)
}

pub async fn list_releases(http: &reqwest::Client) -> anyhow::Result<Vec<GoRelease>> {
    let releases = http
        .get(RELEASES_URL)
        .send()
        .await
        .context("fetching go releases")?
        .error_for_status()
        .context("fetching go releases")?
        .json()
        .await
        .context("parsing go releases")?;
    Ok(releases)
}

/// Go's names for the running platform.
pub fn go_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "arm" => "armv6l",
        "powerpc64" => "ppc64",
        "loongarch64" => "loong64",
        other => other,
    };
    (std::env::consts::OS, arch)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Version {
    minor: u32,
    stable: bool,
    patch: u32,
    pre: u32,
}

/// Parse `go1.N`, `go1.N.P`, `go1.NrcK` and `go1.NbetaK`.
fn parse_version(v: &str) -> Option<Version> {
    let rest = v.strip_prefix("go1.")?;
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let minor = rest[..digits].parse().ok()?;
    let rest = &rest[digits..];
    let (patch, pre) = if rest.is_empty() {
        (0, 0)
    } else if let Some(p) = rest.strip_prefix('.') {
        (p.parse().ok()?, 0)
    } else if let Some(k) = rest.strip_prefix("rc").or_else(|| rest.strip_prefix("beta")) {
        (0, k.parse().ok()?)
    } else {
        return None;
    };
    Some(Version {
        minor,
        stable: pre == 0,
        patch,
        pre,
    })
}

/// Desired symlink targets: newest stable as `go`, newest stable of an older
/// minor as `go-prev`, and a newer unstable release as `go-next`.
pub fn desired(releases: &[GoRelease]) -> Option<(ActiveToolchains, Vec<GoRelease>)> {
    let mut rels: Vec<(Version, &GoRelease)> = releases
        .iter()
        .filter_map(|r| {
            let v = parse_version(&r.version)?;
            (v.stable == r.stable).then_some((v, r))
        })
        .collect();
    rels.sort_by(|a, b| b.0.cmp(&a.0));

    let (cur_v, cur) = *rels.iter().find(|(v, _)| v.stable)?;
    let (_, prev) = *rels.iter().find(|(v, _)| v.stable && v.minor < cur_v.minor)?;
    let next = rels
        .iter()
        .find(|(v, _)| !v.stable && v.minor > cur_v.minor)
        .map(|(_, r)| *r);

    let want = ActiveToolchains {
        go: cur.version.clone(),
        go_prev: prev.version.clone(),
        go_next: next.map(|r| r.version.clone()).unwrap_or_default(),
    };
    let mut needed = vec![cur.clone(), prev.clone()];
    needed.extend(next.cloned());
    Some((want, needed))
}

/// Toolchain directory operations, executed by the root process.
pub struct Toolchains {
    dir: PathBuf,
    http: reqwest::Client,
    /// Owner for new files when builds are isolated, taken from the directory.
    owner: Option<(u32, u32)>,
}

impl Toolchains {
    pub fn new(dir: PathBuf, isolated: bool) -> anyhow::Result<Self> {
        let owner = if isolated {
            use std::os::unix::fs::MetadataExt;
            let meta = std::fs::metadata(&dir)
                .with_context(|| format!("stat on toolchain dir {}", dir.display()))?;
            Some((meta.uid(), meta.gid()))
        } else {
            None
        };
        Ok(Self {
            dir,
            http: reqwest::Client::new(),
            owner,
        })
    }

    pub async fn install(&self, file: &GoFile, shortname: &str) -> anyhow::Result<()> {
        tracing::debug!(filename = %file.filename, "installing go toolchain");
        if !valid_goversion(&file.version) {
            bail!("bad goversion {:?}", file.version);
        }
        if !shortname.is_empty() && !valid_shortname(shortname) {
            bail!("bad shortname {shortname:?}");
        }
        if file.filename.contains('/') || !file.filename.ends_with(".tar.gz") {
            bail!("bad toolchain filename {:?}", file.filename);
        }
        let dst = self.dir.join(&file.version);
        if dst.exists() {
            bail!("toolchain {} already installed", file.version);
        }

        let body = self
            .http
            .get(format!("{DOWNLOAD_URL}{}", file.filename))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("downloading toolchain")?
            .bytes()
            .await
            .context("downloading toolchain")?;
        let sum = hex::encode(Sha256::digest(&body));
        if !sum.eq_ignore_ascii_case(&file.sha256) {
            bail!("checksum mismatch for {}: got {sum}", file.filename);
        }

        let tmp = self
            .dir
            .join(format!("tmp-{}-{}", file.version, uuid::Uuid::new_v4()));
        let unpack = {
            let tmp = tmp.clone();
            let dst = dst.clone();
            let owner = self.owner;
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                std::fs::create_dir(&tmp).context("creating temp dir")?;
                let gz = flate2::read::GzDecoder::new(&body[..]);
                tar::Archive::new(gz)
                    .unpack(&tmp)
                    .context("unpacking toolchain archive")?;
                if let Some((uid, gid)) = owner {
                    super::root::chown_tree(&tmp.join("go"), uid, gid)
                        .context("chown of unpacked toolchain")?;
                }
                std::fs::rename(tmp.join("go"), &dst).context("moving toolchain into place")
            })
        };
        let result = unpack.await.context("unpack task")?;
        if let Err(e) = std::fs::remove_dir_all(&tmp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %tmp.display(), error = %e, "removing temp toolchain dir");
            }
        }
        result?;

        if !shortname.is_empty() {
            self.symlink(&file.version, shortname)?;
        }
        Ok(())
    }

    pub fn remove(&self, goversion: &str) -> anyhow::Result<()> {
        tracing::debug!(goversion, "removing go toolchain");
        if !valid_goversion(goversion) {
            bail!("bad goversion {goversion:?}");
        }
        let path = self.dir.join(goversion);
        if !path.exists() {
            bail!("version is not installed");
        }
        let active = active(&self.dir);
        for (short, target) in [
            ("go", &active.go),
            ("go-prev", &active.go_prev),
            ("go-next", &active.go_next),
        ] {
            if target == goversion {
                if let Err(e) = std::fs::remove_file(self.dir.join(short)) {
                    tracing::error!(shortname = short, error = %e, "removing toolchain symlink");
                }
            }
        }
        std::fs::remove_dir_all(&path).context("removing toolchain")
    }

    pub fn activate(&self, goversion: &str, shortname: &str) -> anyhow::Result<()> {
        tracing::debug!(goversion, shortname, "activating go toolchain");
        if !valid_goversion(goversion) {
            bail!("bad goversion {goversion:?}");
        }
        if !valid_shortname(shortname) {
            bail!("bad shortname {shortname:?}");
        }
        std::fs::metadata(self.dir.join(goversion)).context("stat on requested toolchain")?;
        self.symlink(goversion, shortname)
    }

    /// Install and activate the newest releases. Returns whether anything changed.
    pub async fn automatic(&self) -> anyhow::Result<bool> {
        let current = active(&self.dir);
        let releases = list_releases(&self.http).await?;
        let (want, needed) =
            desired(&releases).context("did not find current or previous go release")?;
        if want == current {
            tracing::debug!(?current, "go toolchains already at desired versions");
            return Ok(false);
        }
        tracing::info!(?current, ?want, "updating go toolchains");

        let have = installed(&self.dir).context("listing toolchain dir")?;
        let (os, arch) = go_platform();
        for rel in &needed {
            if have.contains(&rel.version) {
                continue;
            }
            let file = rel
                .files
                .iter()
                .find(|f| f.os == os && f.arch == arch && f.kind == "archive")
                .with_context(|| format!("no {os}/{arch} archive for {}", rel.version))?;
            self.install(file, "").await?;
        }

        self.symlink(&want.go, "go")?;
        self.symlink(&want.go_prev, "go-prev")?;
        if want.go_next.is_empty() {
            if let Err(e) = std::fs::remove_file(self.dir.join("go-next")) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(error = %e, "removing go-next symlink");
                }
            }
        } else {
            self.symlink(&want.go_next, "go-next")?;
        }
        Ok(true)
    }

    /// Point `shortname` at `goversion`, replacing any previous link atomically.
    fn symlink(&self, goversion: &str, shortname: &str) -> anyhow::Result<()> {
        let tmp = self.dir.join(format!(".{shortname}.{}", uuid::Uuid::new_v4()));
        std::os::unix::fs::symlink(goversion, &tmp).context("creating toolchain symlink")?;
        if let Some((uid, gid)) = self.owner {
            std::os::unix::fs::lchown(&tmp, Some(uid), Some(gid))
                .context("chown on toolchain symlink")?;
        }
        std::fs::rename(&tmp, self.dir.join(shortname)).context("activating toolchain symlink")
    }
}

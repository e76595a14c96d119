//! Server configuration, loaded from a TOML file.
//!
//! The root process parses the file and hands the result to the service
//! process as the first IPC frame, so both sides see identical values.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::paths::DataDir;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DingConfig {
    /// Shared admin password for the API and the event stream.
    pub password: String,
    /// Data directory holding the database, build trees, homes and releases.
    pub data_dir: PathBuf,
    /// Include server error details in API responses and build error messages.
    pub show_errors: bool,
    /// Public URL, used in notification links.
    pub base_url: String,
    /// Directory with toolchains, exposed to builds as DING_TOOLCHAINDIR.
    pub go_toolchain_dir: Option<PathBuf>,
    /// Listener for the API and the event stream.
    pub listen: SocketAddr,
    /// Listener for webhooks.
    pub listen_webhook: SocketAddr,
    /// Listener for Prometheus metrics.
    pub listen_admin: SocketAddr,
    pub isolate_builds: IsolateBuilds,
    pub notify: NotifyConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolateBuilds {
    /// Run builds under their own uid. Requires starting `ding serve` as root.
    pub enabled: bool,
    /// First uid handed to builds (inclusive).
    pub uid_start: u32,
    /// End of the build uid range (exclusive).
    pub uid_end: u32,
    /// Uid the service process runs as.
    pub ding_uid: u32,
    /// Gid the service process runs as; builds share this group.
    pub ding_gid: u32,
    /// bubblewrap binary, used for repositories that ask for a sandbox.
    pub bubblewrap: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub name: String,
    pub email: String,
}

impl Default for DingConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            data_dir: PathBuf::from("data"),
            show_errors: false,
            base_url: "http://localhost:6084".to_string(),
            go_toolchain_dir: None,
            listen: SocketAddr::from(([127, 0, 0, 1], 6084)),
            listen_webhook: SocketAddr::from(([127, 0, 0, 1], 6085)),
            listen_admin: SocketAddr::from(([127, 0, 0, 1], 6086)),
            isolate_builds: IsolateBuilds::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl Default for IsolateBuilds {
    fn default() -> Self {
        Self {
            enabled: false,
            uid_start: 10000,
            uid_end: 20000,
            ding_uid: 0,
            ding_gid: 0,
            bubblewrap: "bwrap".to_string(),
        }
    }
}

/// Annotated example printed by `ding config`.
pub const EXAMPLE: &str = r#"# Password for the API and the event stream.
password = "change-me"

# Holds ding.db, build/, home/ and release/. Relative paths are resolved
# against the working directory of `ding serve`.
data_dir = "data"

# Show details of server errors in API responses. Leave off in production.
show_errors = false

base_url = "https://ding.example.com"

# Directory with toolchains (go, go-prev, go-next symlinks), optional.
# go_toolchain_dir = "/home/ding/toolchains"

listen = "127.0.0.1:6084"
listen_webhook = "127.0.0.1:6085"
listen_admin = "127.0.0.1:6086"

[isolate_builds]
# Run each build under its own uid. Start `ding serve` as root with umask 027.
enabled = false
uid_start = 10000
uid_end = 20000
# Uid/gid the unprivileged service process runs as.
ding_uid = 1000
ding_gid = 1000
bubblewrap = "bwrap"

[notify]
name = "ding"
email = "ding@example.com"
"#;

impl DingConfig {
    /// Parse a config file, resolve the data directory and validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: DingConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.data_dir = std::path::absolute(&config.data_dir)
            .with_context(|| format!("resolving data dir {}", config.data_dir.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.password.is_empty() {
            anyhow::bail!("password must be set");
        }
        let iso = &self.isolate_builds;
        if iso.enabled {
            if iso.uid_start == 0 || iso.uid_start >= iso.uid_end {
                anyhow::bail!(
                    "isolate_builds: uid range {}..{} is empty or includes root",
                    iso.uid_start,
                    iso.uid_end
                );
            }
            if (iso.uid_start..iso.uid_end).contains(&iso.ding_uid) {
                anyhow::bail!("isolate_builds: ding_uid lies inside the build uid range");
            }
            if iso.ding_uid == 0 || iso.ding_gid == 0 {
                anyhow::bail!("isolate_builds: ding_uid and ding_gid must not be root");
            }
        }
        if let Some(dir) = &self.go_toolchain_dir {
            if !dir.is_absolute() {
                anyhow::bail!("go_toolchain_dir must be an absolute path");
            }
        }
        Ok(())
    }

    pub fn data(&self) -> DataDir {
        DataDir::new(&self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_parses_and_validates() {
        let config: DingConfig = toml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.isolate_builds.uid_start, 10000);
        assert_eq!(config.listen.port(), 6084);
        assert_eq!(config.notify.name, "ding");
    }

    #[test]
    fn rejects_bad_uid_ranges() {
        let mut config = DingConfig {
            password: "x".into(),
            ..Default::default()
        };
        config.isolate_builds.enabled = true;
        config.isolate_builds.ding_uid = 1000;
        config.isolate_builds.ding_gid = 1000;
        config.isolate_builds.uid_start = 20000;
        config.isolate_builds.uid_end = 10000;
        assert!(config.validate().is_err());

        config.isolate_builds.uid_start = 500;
        config.isolate_builds.uid_end = 2000;
        assert!(config.validate().is_err(), "ding_uid inside range");

        config.isolate_builds.uid_start = 10000;
        config.isolate_builds.uid_end = 20000;
        config.validate().unwrap();
    }

    #[test]
    fn load_resolves_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ding.toml");
        std::fs::write(&path, "password = \"pw\"\ndata_dir = \"/srv/ding\"\n").unwrap();
        let config = DingConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/ding"));
        assert!(!config.isolate_builds.enabled);

        std::fs::write(&path, "password = \"pw\"\nbogus = 1\n").unwrap();
        assert!(DingConfig::load(&path).is_err());
    }
}

//! `ding quickstart`: write a ready-to-use config file.

use std::path::Path;

use anyhow::{bail, Context};
use nix::unistd::{geteuid, User};

use crate::config::{DingConfig, IsolateBuilds};

pub const CONFIG_FILE: &str = "ding.toml";

/// Config for a fresh install. With `user`, builds are isolated and the
/// service process runs as that user.
pub fn quickstart_config(user: Option<&User>) -> DingConfig {
    let mut config = DingConfig {
        password: uuid::Uuid::new_v4().simple().to_string(),
        data_dir: "data".into(),
        ..Default::default()
    };
    if let Some(user) = user {
        config.isolate_builds = IsolateBuilds {
            enabled: true,
            ding_uid: user.uid.as_raw(),
            ding_gid: user.gid.as_raw(),
            ..Default::default()
        };
    }
    config.notify.name = "ding".to_string();
    config
}

pub fn quickstart(dir: &Path, user: Option<&str>) -> anyhow::Result<()> {
    let path = dir.join(CONFIG_FILE);
    if path.exists() {
        bail!("{} already exists, not overwriting", path.display());
    }

    let user = match (geteuid().is_root(), user) {
        (true, Some(name)) => Some(
            User::from_name(name)
                .with_context(|| format!("looking up user {name}"))?
                .with_context(|| format!("no such user {name}"))?,
        ),
        (true, None) => bail!("running as root: pass --user with the account the service process runs as"),
        (false, Some(_)) => bail!("--user requires running as root"),
        (false, None) => None,
    };

    let config = quickstart_config(user.as_ref());
    config.validate()?;
    let text = toml::to_string_pretty(&config).context("encoding config")?;
    std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;

    println!("wrote {}", path.display());
    println!("api password: {}", config.password);
    println!();
    println!("start the server with:");
    println!("  ding serve {CONFIG_FILE}");
    println!("then open http://{}/api/status with the password in the Authorization header.", config.listen);
    if config.isolate_builds.enabled {
        println!("builds run under uids {}..{}.", config.isolate_builds.uid_start, config.isolate_builds.uid_end);
    }
    Ok(())
}

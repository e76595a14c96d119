//! ding: a self-hosted build server.
//!
//! `ding serve` runs as a small root process that owns every privileged
//! operation (starting builds under their own uid, chown, removing build
//! trees, toolchains) and an unprivileged service process with the API,
//! webhooks, database and build orchestration. The two talk over a pair of
//! unix sockets.

mod config;
mod db;
mod error;
mod events;
mod ipc;
mod kick;
mod logging;
mod metrics;
mod models;
mod paths;
mod quickstart;
mod routes;
mod schema;
mod serve;
mod services;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ding", about = "Self-hosted build server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print an annotated example config file.
    Config,
    /// Parse and validate a config file.
    Testconfig { config: PathBuf },
    /// Run the server: root process plus unprivileged service process.
    Serve {
        config: PathBuf,
        #[command(flatten)]
        listen: ListenOverrides,
    },
    /// Service process, started by `serve`.
    #[command(hide = true)]
    ServeHttp,
    /// Request a build of a repository.
    Kick {
        base_url: String,
        password: String,
        repo: String,
        branch: String,
        commit: String,
    },
    /// Write a ding.toml in the current directory.
    Quickstart {
        /// Account the service process runs as; enables build isolation.
        #[arg(long)]
        user: Option<String>,
    },
    /// Apply pending database migrations.
    Upgrade { config: PathBuf },
    /// Print the version.
    Version,
}

#[derive(Args)]
struct ListenOverrides {
    /// Address for the API and the event stream.
    #[arg(long, env = "DING_LISTEN")]
    listen: Option<SocketAddr>,

    /// Address for webhooks.
    #[arg(long, env = "DING_LISTEN_WEBHOOK")]
    listen_webhook: Option<SocketAddr>,

    /// Address for Prometheus metrics.
    #[arg(long, env = "DING_LISTEN_ADMIN")]
    listen_admin: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Usage errors exit with status 2.
    let cli = Cli::parse();
    let log = logging::init();

    match cli.command {
        Command::Config => print!("{}", config::EXAMPLE),
        Command::Testconfig { config } => {
            let config = config::DingConfig::load(&config)?;
            println!("config OK, data dir {}", config.data_dir.display());
        }
        Command::Serve { config, listen } => {
            let mut config = config::DingConfig::load(&config)?;
            if let Some(addr) = listen.listen {
                config.listen = addr;
            }
            if let Some(addr) = listen.listen_webhook {
                config.listen_webhook = addr;
            }
            if let Some(addr) = listen.listen_admin {
                config.listen_admin = addr;
            }
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting ding");
            serve::serve(config, log).await?;
        }
        Command::ServeHttp => serve::serve_http(log).await?,
        Command::Kick {
            base_url,
            password,
            repo,
            branch,
            commit,
        } => {
            let id = kick::kick(&base_url, &password, &repo, &branch, &commit).await?;
            println!("{id}");
        }
        Command::Quickstart { user } => {
            let dir = std::env::current_dir()?;
            quickstart::quickstart(&dir, user.as_deref())?;
        }
        Command::Upgrade { config } => serve::upgrade(&config).await?,
        Command::Version => println!("ding {}", env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}

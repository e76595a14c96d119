//! Shared state of the service process, handed to every handler and to
//! build tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::config::DingConfig;
use crate::db::Db;
use crate::events::EventHub;
use crate::ipc::RootClient;
use crate::logging::LogHandle;
use crate::paths::DataDir;
use crate::services::notify::Notifier;
use crate::services::scheduler::Scheduler;

#[derive(Clone)]
pub struct DingState {
    pub config: Arc<DingConfig>,
    pub db: Db,
    pub events: EventHub,
    pub root: RootClient,
    pub scheduler: Scheduler,
    pub notifier: Arc<dyn Notifier>,
    pub log: Option<LogHandle>,
    /// Cancels local commands (clones) of in-flight builds.
    commands: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl DingState {
    pub fn new(
        config: DingConfig,
        db: Db,
        root: RootClient,
        notifier: Arc<dyn Notifier>,
        log: Option<LogHandle>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db,
            events: EventHub::start(),
            root,
            scheduler: Scheduler::start(),
            notifier,
            log,
            commands: Arc::default(),
        }
    }

    pub fn data(&self) -> DataDir {
        self.config.data()
    }

    fn lock_commands(&self) -> MutexGuard<'_, HashMap<i64, CancellationToken>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the command context of a running build.
    pub fn register_build(&self, build_id: i64) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock_commands().insert(build_id, token.clone());
        token
    }

    pub fn unregister_build(&self, build_id: i64) {
        self.lock_commands().remove(&build_id);
    }

    /// Cancel local commands of a build. Returns whether it was running.
    pub fn cancel_build(&self, build_id: i64) -> bool {
        match self.lock_commands().remove(&build_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// State over a fresh database and data directory, with an in-process root
/// executor. Password `pw`, isolation off.
#[cfg(test)]
pub(crate) async fn test_state() -> (tempfile::TempDir, DingState) {
    let (dir, db) = crate::db::test_db().await;
    let config = DingConfig {
        password: "pw".into(),
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let (root, _closed) = crate::ipc::client::tests::connect(config.clone());
    let state = DingState::new(
        config,
        db,
        root,
        Arc::new(crate::services::notify::LogNotifier),
        None,
    );
    (dir, state)
}

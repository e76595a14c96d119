//! SQLite database: connection pool, schema migrations, transactions.
//!
//! Connections are diesel `SqliteConnection`s behind diesel-async's
//! `SyncConnectionWrapper`, pooled with deadpool. Write transactions are
//! serialized by a process-wide lock so SQLite never has to arbitrate
//! concurrent writers.

use std::path::Path;
use std::sync::Arc;

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel::ConnectionError;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, ManagerConfig};
use diesel_async::scoped_futures::ScopedBoxFuture;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, RunQueryDsl, SimpleAsyncConnection};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::schema::schema_version;

pub type DbConn = SyncConnectionWrapper<SqliteConnection>;
pub type DbPool = Pool<DbConn>;

/// Schema migrations, applied in order. The index + 1 is the schema version.
const MIGRATIONS: &[&str] = &[MIGRATION_V1];

const MIGRATION_V1: &str = r#"
CREATE TABLE repos (
    name                            TEXT PRIMARY KEY NOT NULL,
    vcs                             TEXT NOT NULL CHECK (vcs IN ('git', 'mercurial', 'command')),
    origin                          TEXT NOT NULL,
    default_branch                  TEXT NOT NULL,
    checkout_path                   TEXT NOT NULL,
    build_script                    TEXT NOT NULL DEFAULT '',
    uid                             INTEGER UNIQUE,
    home_disk_usage                 INTEGER NOT NULL DEFAULT 0,
    webhook_secret                  TEXT NOT NULL DEFAULT '',
    allow_global_webhook_secrets    BOOLEAN NOT NULL DEFAULT FALSE,
    bubblewrap                      BOOLEAN NOT NULL DEFAULT FALSE,
    bubblewrap_no_net               BOOLEAN NOT NULL DEFAULT FALSE,
    build_on_updated_toolchain      BOOLEAN NOT NULL DEFAULT FALSE,
    notify_emails                   TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE builds (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_name               TEXT NOT NULL REFERENCES repos(name),
    branch                  TEXT NOT NULL,
    commit_hash             TEXT NOT NULL DEFAULT '',
    status                  TEXT NOT NULL CHECK (status IN ('new', 'clone', 'build', 'success', 'cancelled')),
    low_prio                BOOLEAN NOT NULL DEFAULT FALSE,
    build_script            TEXT NOT NULL DEFAULT '',
    created                 TEXT NOT NULL,
    start                   TEXT,
    finish                  TEXT,
    released                TEXT,
    disk_usage              INTEGER NOT NULL DEFAULT 0,
    home_disk_usage_delta   INTEGER NOT NULL DEFAULT 0,
    error_message           TEXT NOT NULL DEFAULT '',
    version                 TEXT NOT NULL DEFAULT '',
    coverage                REAL,
    coverage_report_file    TEXT NOT NULL DEFAULT '',
    builddir_removed        BOOLEAN NOT NULL DEFAULT FALSE,
    last_line               TEXT NOT NULL DEFAULT '',
    CHECK (released IS NULL OR (finish IS NOT NULL AND status = 'success'))
);

CREATE INDEX idx_builds_repo_branch ON builds (repo_name, branch, id);

CREATE TABLE results (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    build_id    INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    command     TEXT NOT NULL,
    os          TEXT NOT NULL,
    arch        TEXT NOT NULL,
    toolchain   TEXT NOT NULL,
    filename    TEXT NOT NULL,
    filesize    INTEGER NOT NULL
);

CREATE INDEX idx_results_build ON results (build_id);

CREATE TABLE steps (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    build_id    INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    output      TEXT NOT NULL,
    nsec        INTEGER NOT NULL
);

CREATE INDEX idx_steps_build ON steps (build_id);

CREATE TABLE settings (
    id                          INTEGER PRIMARY KEY CHECK (id = 1),
    notify_emails               TEXT NOT NULL DEFAULT '[]',
    github_webhook_secret       TEXT NOT NULL DEFAULT '',
    gitea_webhook_secret        TEXT NOT NULL DEFAULT '',
    bitbucket_webhook_secret    TEXT NOT NULL DEFAULT '',
    gotoolchain_webhook_secret  TEXT NOT NULL DEFAULT '',
    run_prefix                  TEXT NOT NULL DEFAULT '[]',
    environment                 TEXT NOT NULL DEFAULT '[]',
    auto_go_toolchain           BOOLEAN NOT NULL DEFAULT FALSE
);

INSERT INTO settings (id) VALUES (1);
"#;

/// Handle to the database, cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: DbPool,
    write_lock: Arc<Mutex<()>>,
}

fn establish(url: &str) -> BoxFuture<'_, diesel::ConnectionResult<DbConn>> {
    async move {
        let mut conn = DbConn::establish(url).await?;
        conn.batch_execute("PRAGMA busy_timeout = 10000; PRAGMA foreign_keys = ON;")
            .await
            .map_err(ConnectionError::CouldntSetupConfiguration)?;
        Ok(conn)
    }
    .boxed()
}

impl Db {
    /// Open (creating if needed) the database file and apply pending migrations.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let url = path.to_string_lossy().to_string();

        let mut config = ManagerConfig::default();
        config.custom_setup = Box::new(establish);
        let manager = AsyncDieselConnectionManager::<DbConn>::new_with_config(url, config);
        let pool = Pool::builder(manager)
            .max_size(8)
            .build()
            .map_err(|e| anyhow::anyhow!("database pool: {e}"))?;

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };

        {
            let mut conn = db.conn().await?;
            conn.batch_execute("PRAGMA journal_mode = WAL;").await?;
            let applied = run_migrations(&mut conn).await?;
            if applied > 0 {
                tracing::info!(applied, "database migrations completed");
            }
        }

        Ok(db)
    }

    pub async fn conn(&self) -> Result<Object<DbConn>> {
        Ok(self.pool.get().await?)
    }

    /// Run `f` in a write transaction. Rolled back when `f` returns an error.
    pub async fn transact<'a, R, F>(&self, f: F) -> Result<R>
    where
        F: for<'r> FnOnce(&'r mut DbConn) -> ScopedBoxFuture<'a, 'r, Result<R>> + Send + 'a,
        R: Send + 'a,
    {
        let _write = self.write_lock.lock().await;
        let mut pooled = self.pool.get().await?;
        let conn: &mut DbConn = &mut pooled;
        conn.transaction(f).await
    }
}

/// Apply migrations newer than the stored schema version. Returns how many ran.
pub async fn run_migrations(conn: &mut DbConn) -> anyhow::Result<usize> {
    conn.batch_execute(
        "CREATE TABLE IF NOT EXISTS schema_version (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL);
         INSERT OR IGNORE INTO schema_version (id, version) VALUES (1, 0);",
    )
    .await
    .map_err(|e| anyhow::anyhow!("preparing schema_version: {e}"))?;

    let current: i32 = schema_version::table
        .select(schema_version::version)
        .first(conn)
        .await?;
    let current = usize::try_from(current)?;
    if current > MIGRATIONS.len() {
        anyhow::bail!(
            "database schema version {current} is newer than this binary supports ({})",
            MIGRATIONS.len()
        );
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = i32::try_from(index + 1)?;
        tracing::info!(version, "applying database migration");
        conn.batch_execute(&format!(
            "BEGIN;\n{sql}\nUPDATE schema_version SET version = {version};\nCOMMIT;"
        ))
        .await
        .map_err(|e| anyhow::anyhow!("migration to version {version} failed: {e}"))?;
    }

    Ok(MIGRATIONS.len() - current)
}

#[cfg(test)]
pub(crate) async fn test_db() -> (tempfile::TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("ding.db")).await.unwrap();
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::settings;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (dir, db) = test_db().await;
        let mut conn = db.conn().await.unwrap();
        assert_eq!(run_migrations(&mut conn).await.unwrap(), 0);
        let n: i64 = settings::table.count().get_result(&mut conn).await.unwrap();
        assert_eq!(n, 1);
        drop(conn);
        drop(db);

        let db = Db::open(&dir.path().join("ding.db")).await.unwrap();
        let mut conn = db.conn().await.unwrap();
        let v: i32 = schema_version::table
            .select(schema_version::version)
            .first(&mut conn)
            .await
            .unwrap();
        assert_eq!(v as usize, MIGRATIONS.len());
    }
}

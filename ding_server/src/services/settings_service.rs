//! The singleton settings row.

use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::RunQueryDsl;

use crate::db::{Db, DbConn};
use crate::error::{DingError, Result};
use crate::models::settings::Settings;
use crate::schema::settings;

pub async fn get(conn: &mut DbConn) -> Result<Settings> {
    let settings = settings::table
        .find(1)
        .select(Settings::as_select())
        .first(conn)
        .await?;
    Ok(settings)
}

/// Environment entries must look like `KEY=value`.
pub fn validate(settings: &Settings) -> Result<()> {
    for kv in settings.environment.iter() {
        match kv.split_once('=') {
            Some((key, _)) if !key.is_empty() => {}
            _ => {
                return Err(DingError::user(format!(
                    "environment entry {kv:?} is not of the form KEY=value"
                )))
            }
        }
    }
    if settings.run_prefix.iter().any(String::is_empty) {
        return Err(DingError::user("run prefix cannot contain empty tokens"));
    }
    Ok(())
}

pub async fn save(db: &Db, mut new: Settings) -> Result<Settings> {
    validate(&new)?;
    new.id = 1;
    let saved = db
        .transact(|conn| {
            async move {
                let saved = diesel::update(settings::table.find(1))
                    .set(&new)
                    .returning(Settings::as_returning())
                    .get_result(conn)
                    .await?;
                Ok(saved)
            }
            .scope_boxed()
        })
        .await?;
    tracing::info!("settings saved");
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StringList;

    #[tokio::test]
    async fn last_write_wins() {
        let (_dir, db) = crate::db::test_db().await;
        let mut conn = db.conn().await.unwrap();
        let initial = get(&mut conn).await.unwrap();
        assert!(initial.run_prefix.is_empty());
        drop(conn);

        let mut s = initial.clone();
        for i in 0..3 {
            s.run_prefix = StringList(vec!["nice".into(), format!("timeout {i}")]);
            s.environment = StringList(vec![format!("GOPROXY=proxy{i}")]);
            s.github_webhook_secret = format!("gh{i}");
            s.auto_go_toolchain = i % 2 == 0;
            save(&db, s.clone()).await.unwrap();
        }
        let mut conn = db.conn().await.unwrap();
        assert_eq!(get(&mut conn).await.unwrap(), s);
    }

    #[tokio::test]
    async fn rejects_malformed_environment() {
        let (_dir, db) = crate::db::test_db().await;
        let mut conn = db.conn().await.unwrap();
        let mut s = get(&mut conn).await.unwrap();
        drop(conn);
        s.environment = StringList(vec!["NOEQUALS".into()]);
        assert!(matches!(save(&db, s).await, Err(DingError::User(_))));
    }
}

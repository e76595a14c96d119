//! Singleton settings row.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::StringList;
use crate::schema::settings;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = settings)]
pub struct Settings {
    #[serde(skip, default = "singleton_id")]
    pub id: i32,
    /// Default notification recipients, used when a repo has none.
    pub notify_emails: StringList,
    pub github_webhook_secret: String,
    pub gitea_webhook_secret: String,
    pub bitbucket_webhook_secret: String,
    pub gotoolchain_webhook_secret: String,
    /// Tokens prepended to every spawned command, e.g. `nice`, `timeout 600s`.
    pub run_prefix: StringList,
    /// `KEY=value` entries appended to the build environment.
    pub environment: StringList,
    pub auto_go_toolchain: bool,
}

fn singleton_id() -> i32 {
    1
}

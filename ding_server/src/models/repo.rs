//! A repository: where to clone from and how to build.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::{text_enum, StringList};
use crate::schema::repos;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, diesel::AsExpression, diesel::FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = diesel::sql_types::Text)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
    Git,
    Mercurial,
    /// `origin` is a shell command that produces the checkout.
    Command,
}

text_enum!(Vcs {
    Git => "git",
    Mercurial => "mercurial",
    Command => "command",
});

#[derive(
    Debug, Clone, Queryable, Selectable, Insertable, AsChangeset, Identifiable, Serialize, Deserialize,
)]
#[diesel(table_name = repos, primary_key(name), treat_none_as_null = true)]
pub struct Repo {
    pub name: String,
    pub vcs: Vcs,
    pub origin: String,
    pub default_branch: String,
    pub checkout_path: String,
    pub build_script: String,
    /// Fixed uid; builds then share `<data>/home/<name>`.
    pub uid: Option<i64>,
    pub home_disk_usage: i64,
    pub webhook_secret: String,
    pub allow_global_webhook_secrets: bool,
    pub bubblewrap: bool,
    pub bubblewrap_no_net: bool,
    pub build_on_updated_toolchain: bool,
    pub notify_emails: StringList,
}

impl Repo {
    pub fn shared_home(&self) -> bool {
        self.uid.is_some()
    }
}

//! A build: one attempt to clone and build a repository at a commit.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::result::BuildResult;
use super::step::Step;
use super::text_enum;
use crate::schema::builds;

/// Step a build is in, or its terminal state. A build whose `finish` is set
/// while its status is `clone` or `build` failed during that step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, diesel::AsExpression, diesel::FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = diesel::sql_types::Text)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    New,
    Clone,
    Build,
    Success,
    Cancelled,
}

text_enum!(BuildStatus {
    New => "new",
    Clone => "clone",
    Build => "build",
    Success => "success",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = builds)]
pub struct Build {
    pub id: i64,
    pub repo_name: String,
    pub branch: String,
    pub commit_hash: String,
    pub status: BuildStatus,
    pub low_prio: bool,
    pub build_script: String,
    pub created: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
    pub released: Option<DateTime<Utc>>,
    pub disk_usage: i64,
    pub home_disk_usage_delta: i64,
    pub error_message: String,
    pub version: String,
    pub coverage: Option<f32>,
    pub coverage_report_file: String,
    pub builddir_removed: bool,
    pub last_line: String,
}

impl Build {
    pub fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    /// Finished but not successful and not cancelled.
    pub fn failed(&self) -> bool {
        self.is_finished() && matches!(self.status, BuildStatus::Clone | BuildStatus::Build)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = builds)]
pub struct NewBuild {
    pub repo_name: String,
    pub branch: String,
    pub commit_hash: String,
    pub status: BuildStatus,
    pub low_prio: bool,
    pub build_script: String,
    pub created: DateTime<Utc>,
}

/// A build with its results and steps, as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDetail {
    #[serde(flatten)]
    pub build: Build,
    pub results: Vec<BuildResult>,
    pub steps: Vec<Step>,
}

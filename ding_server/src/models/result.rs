//! A released artifact, produced by a `release:` line in build output.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::results;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = results)]
pub struct BuildResult {
    pub id: i64,
    pub build_id: i64,
    pub command: String,
    pub os: String,
    pub arch: String,
    pub toolchain: String,
    /// Relative to the checkout directory.
    pub filename: String,
    pub filesize: i64,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = results)]
pub struct NewBuildResult {
    pub build_id: i64,
    pub command: String,
    pub os: String,
    pub arch: String,
    pub toolchain: String,
    pub filename: String,
    pub filesize: i64,
}

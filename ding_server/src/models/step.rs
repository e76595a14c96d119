//! Recorded output and duration of one build step.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::steps;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = steps)]
pub struct Step {
    pub id: i64,
    pub build_id: i64,
    pub name: String,
    pub output: String,
    pub nsec: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = steps)]
pub struct NewStep {
    pub build_id: i64,
    pub name: String,
    pub output: String,
    pub nsec: i64,
}

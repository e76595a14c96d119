//! Live events for subscribers of the event stream.
//!
//! Producers publish typed events; the hub fans them out to every
//! subscriber with a bounded queue, dropping events for slow subscribers.

pub mod hub;

use serde::{Deserialize, Serialize};

use crate::models::build::Build;
use crate::models::repo::Repo;

pub use hub::{EventHub, HubItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Events sent to subscribers, tagged by kind. Event fields are camelCase
/// with `buildID`; the repository and build records keep their API shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DingEvent {
    /// Repository created or changed.
    Repo { repo: Repo },
    RemoveRepo { repo_name: String },
    /// Build created or changed. Carries the full current record.
    Build { repo_name: String, build: Build },
    RemoveBuild {
        repo_name: String,
        #[serde(rename = "buildID")]
        build_id: i64,
    },
    /// A segment of step output. An empty `text` marks the start of a step.
    Output {
        #[serde(rename = "buildID")]
        build_id: i64,
        step: String,
        #[serde(rename = "where")]
        stream: OutputStream,
        text: String,
    },
}

impl DingEvent {
    /// Event name used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Repo { .. } => "repo",
            Self::RemoveRepo { .. } => "removeRepo",
            Self::Build { .. } => "build",
            Self::RemoveBuild { .. } => "removeBuild",
            Self::Output { .. } => "output",
        }
    }

    pub fn build(build: &Build) -> Self {
        Self::Build {
            repo_name: build.repo_name.clone(),
            build: build.clone(),
        }
    }
}

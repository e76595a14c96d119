//! Business logic: repositories, builds, settings, webhooks and the build
//! executor.

pub mod build_service;
pub mod executor;
pub mod notify;
pub mod repo_service;
pub mod results_parser;
pub mod retention;
pub mod scheduler;
pub mod settings_service;
pub mod tracker;
pub mod vcs;
pub mod webhook_service;

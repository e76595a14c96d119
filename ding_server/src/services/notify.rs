//! Failure and fixed notifications.
//!
//! Messages are rendered here and handed to a [`Notifier`]. The shipped
//! notifier writes them to the log; mail delivery plugs in behind the trait.

use async_trait::async_trait;

use crate::config::NotifyConfig;
use crate::models::build::Build;
use crate::models::repo::Repo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Failing,
    Fixed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Logs notifications instead of mailing them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, n: &Notification) -> anyhow::Result<()> {
        tracing::info!(
            kind = ?n.kind,
            from = %n.from,
            to = ?n.to,
            subject = %n.subject,
            body = %n.body,
            "notification"
        );
        Ok(())
    }
}

/// Recipients configured on the repository, else the global default.
pub fn recipients(repo: &Repo, defaults: &[String]) -> Vec<String> {
    if repo.notify_emails.is_empty() {
        defaults.to_vec()
    } else {
        repo.notify_emails.to_vec()
    }
}

fn from(notify: &NotifyConfig) -> String {
    match (notify.name.is_empty(), notify.email.is_empty()) {
        (_, true) => String::new(),
        (true, false) => notify.email.clone(),
        (false, false) => format!("{} <{}>", notify.name, notify.email),
    }
}

fn link(base_url: &str, repo: &Repo, build: &Build) -> String {
    format!(
        "{}/api/repos/{}/builds/{}",
        base_url.trim_end_matches('/'),
        repo.name,
        build.id
    )
}

pub fn failing(
    notify: &NotifyConfig,
    base_url: &str,
    to: Vec<String>,
    repo: &Repo,
    build: &Build,
) -> Notification {
    let body = format!(
        "Hi!\n\n\
         Your build for branch {branch} on repo {repo} is now failing:\n\n\
         \t{link}\n\n\
         Last output:\n\n\
         \t{last_line}\n\
         \t{error}\n\n\
         Please fix, thanks!\n\n\
         Cheers,\nDing\n",
        branch = build.branch,
        repo = repo.name,
        link = link(base_url, repo, build),
        last_line = build.last_line,
        error = build.error_message,
    );
    Notification {
        kind: NotificationKind::Failing,
        from: from(notify),
        to,
        subject: format!("ding: failure: repo {} branch {} failing", repo.name, build.branch),
        body,
    }
}

pub fn fixed(
    notify: &NotifyConfig,
    base_url: &str,
    to: Vec<String>,
    repo: &Repo,
    build: &Build,
) -> Notification {
    let body = format!(
        "Hi!\n\n\
         You fixed the build for branch {branch} on repo {repo}:\n\n\
         \t{link}\n\n\
         You're the bomb, keep it up!\n\n\
         Cheers,\nDing\n",
        branch = build.branch,
        repo = repo.name,
        link = link(base_url, repo, build),
    );
    Notification {
        kind: NotificationKind::Fixed,
        from: from(notify),
        to,
        subject: format!(
            "ding: resolved: repo {} branch {} is building again",
            repo.name, build.branch
        ),
        body,
    }
}

/// Which notification a finished build warrants, given whether the
/// previous build on the branch succeeded (`None` when there is none).
pub fn transition(failed: bool, previous_success: Option<bool>) -> Option<NotificationKind> {
    match (failed, previous_success) {
        (true, Some(true) | None) => Some(NotificationKind::Failing),
        (false, Some(false)) => Some(NotificationKind::Fixed),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Keeps sent notifications for inspection.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, n: &Notification) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(n.clone());
            Ok(())
        }
    }

    #[test]
    fn transitions() {
        assert_eq!(transition(true, None), Some(NotificationKind::Failing));
        assert_eq!(transition(true, Some(true)), Some(NotificationKind::Failing));
        assert_eq!(transition(true, Some(false)), None);
        assert_eq!(transition(false, Some(false)), Some(NotificationKind::Fixed));
        assert_eq!(transition(false, Some(true)), None);
        assert_eq!(transition(false, None), None);
    }

    #[test]
    fn sender_address() {
        let mut n = NotifyConfig {
            name: "ding".into(),
            email: "ding@example.com".into(),
        };
        assert_eq!(from(&n), "ding <ding@example.com>");
        n.name.clear();
        assert_eq!(from(&n), "ding@example.com");
    }
}

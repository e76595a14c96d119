//! Job scheduler: one build at a time per repository, and at most one
//! low-priority build across all repositories.
//!
//! A single coordinator task owns the queues. Jobs wait for a grant in the
//! form of a [`JobGuard`]; dropping the guard reports the job finished.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};

use crate::error::{DingError, Result};

enum Command {
    Enqueue {
        repo: String,
        low_prio: bool,
        grant: oneshot::Sender<JobGuard>,
    },
    Finish {
        repo: String,
    },
}

/// Held while a job runs.
pub struct JobGuard {
    repo: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let repo = std::mem::take(&mut self.repo);
        let _ = self.tx.send(Command::Finish { repo });
    }
}

#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(coordinate(rx, tx.clone()));
        Self { tx }
    }

    /// Wait until the job may run.
    pub async fn acquire(&self, repo: &str, low_prio: bool) -> Result<JobGuard> {
        let (grant, granted) = oneshot::channel();
        self.tx
            .send(Command::Enqueue {
                repo: repo.to_string(),
                low_prio,
                grant,
            })
            .map_err(|_| DingError::server("scheduler stopped"))?;
        granted
            .await
            .map_err(|_| DingError::server("scheduler stopped"))
    }
}

struct Job {
    /// Arrival order across all repositories.
    seq: u64,
    low_prio: bool,
    grant: oneshot::Sender<JobGuard>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Job>>,
    /// Repositories with a running job, and whether that job is low priority.
    active: HashMap<String, bool>,
    low_prio_busy: bool,
    next_seq: u64,
}

impl State {
    /// Index of the job to start for a repository. The queue head, unless it
    /// is low priority and the slot is taken; then the first regular job.
    fn candidate(&self, queue: &VecDeque<Job>) -> Option<usize> {
        let head = queue.front()?;
        if !head.low_prio || !self.low_prio_busy {
            return Some(0);
        }
        queue.iter().position(|job| !job.low_prio)
    }

    /// Start jobs in arrival order until nothing else may run. A granted
    /// low priority job can block later candidates, so the choice is made
    /// one job at a time.
    fn advance(&mut self, tx: &mpsc::UnboundedSender<Command>) {
        loop {
            let next = self
                .queues
                .iter()
                .filter(|(repo, _)| !self.active.contains_key(*repo))
                .filter_map(|(repo, queue)| {
                    let index = self.candidate(queue)?;
                    Some((queue[index].seq, repo.clone(), index))
                })
                .min_by_key(|(seq, _, _)| *seq);
            let Some((_, repo, index)) = next else {
                break;
            };
            let Some(job) = self.queues.get_mut(&repo).and_then(|q| q.remove(index)) else {
                break;
            };
            if job.low_prio {
                self.low_prio_busy = true;
            }
            self.active.insert(repo.clone(), job.low_prio);
            tracing::debug!(repo = %repo, low_prio = job.low_prio, "job granted");
            let guard = JobGuard {
                repo,
                tx: tx.clone(),
            };
            // A waiter that gave up drops the guard, which reports finish.
            let _ = job.grant.send(guard);
        }
        self.queues.retain(|_, q| !q.is_empty());
        crate::metrics::active_builds(self.active.len());
    }
}

async fn coordinate(mut rx: mpsc::UnboundedReceiver<Command>, tx: mpsc::UnboundedSender<Command>) {
    let mut state = State::default();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Enqueue {
                repo,
                low_prio,
                grant,
            } => {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queues.entry(repo).or_default().push_back(Job {
                    seq,
                    low_prio,
                    grant,
                });
            }
            Command::Finish { repo } => {
                if state.active.remove(&repo) == Some(true) {
                    state.low_prio_busy = false;
                }
            }
        }
        state.advance(&tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn spawn_acquire(s: &Scheduler, repo: &str, low_prio: bool) -> JoinHandle<JobGuard> {
        let s = s.clone();
        let repo = repo.to_string();
        tokio::spawn(async move { s.acquire(&repo, low_prio).await.unwrap() })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn serializes_per_repository_in_fifo_order() {
        let s = Scheduler::start();
        let first = s.acquire("a", false).await.unwrap();
        let second = spawn_acquire(&s, "a", false);
        settle().await;
        let third = spawn_acquire(&s, "a", false);
        let other = s.acquire("b", false).await.unwrap();
        settle().await;
        assert!(!second.is_finished());
        assert!(!third.is_finished());

        drop(first);
        let second = second.await.unwrap();
        settle().await;
        assert!(!third.is_finished());
        drop(second);
        drop(third.await.unwrap());
        drop(other);
    }

    #[tokio::test]
    async fn one_low_prio_job_globally() {
        let s = Scheduler::start();
        let low_a = s.acquire("a", true).await.unwrap();
        let low_b = spawn_acquire(&s, "b", true);
        settle().await;
        assert!(!low_b.is_finished());

        // regular jobs are not held up by the low priority slot
        let reg_c = s.acquire("c", false).await.unwrap();
        drop(low_a);
        drop(low_b.await.unwrap());
        drop(reg_c);
    }

    #[tokio::test]
    async fn regular_job_overtakes_blocked_low_prio_head() {
        let s = Scheduler::start();
        let low_a = s.acquire("a", true).await.unwrap();
        let low_b = spawn_acquire(&s, "b", true);
        settle().await;
        let reg_b = s.acquire("b", false).await.unwrap();
        assert!(!low_b.is_finished());

        drop(low_a);
        settle().await;
        assert!(!low_b.is_finished(), "repository b is busy");
        drop(reg_b);
        drop(low_b.await.unwrap());
    }

    #[tokio::test]
    async fn waiting_low_prio_jobs_start_in_arrival_order() {
        let s = Scheduler::start();
        let low_m = s.acquire("m", true).await.unwrap();
        let low_z = spawn_acquire(&s, "z", true);
        settle().await;
        let low_b = spawn_acquire(&s, "b", true);
        settle().await;

        drop(low_m);
        settle().await;
        assert!(low_z.is_finished());
        assert!(!low_b.is_finished());
        drop(low_z.await.unwrap());
        drop(low_b.await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_waiter_releases_its_grant() {
        let s = Scheduler::start();
        let first = s.acquire("a", false).await.unwrap();
        let waiter = spawn_acquire(&s, "a", false);
        settle().await;
        waiter.abort();
        settle().await;
        drop(first);
        let next = tokio::time::timeout(Duration::from_secs(1), s.acquire("a", false)).await;
        assert!(next.is_ok());
    }
}

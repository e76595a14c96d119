//! Event hub: a single coordinator task owning the subscriber list.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::DingEvent;

/// Queue length per subscriber.
pub const SUBSCRIBER_QUEUE: usize = 48;

/// How often subscribers get a keepalive.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub enum HubItem {
    Event(Arc<DingEvent>),
    Keepalive,
}

enum Command {
    Publish(DingEvent),
    Subscribe(mpsc::Sender<HubItem>),
}

/// Handle to the hub. Publishing never blocks; the coordinator exits once
/// every handle is dropped.
#[derive(Clone)]
pub struct EventHub {
    tx: mpsc::UnboundedSender<Command>,
}

impl EventHub {
    pub fn start() -> Self {
        Self::start_with_keepalive(KEEPALIVE_INTERVAL)
    }

    pub fn start_with_keepalive(keepalive: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, keepalive));
        Self { tx }
    }

    pub fn publish(&self, event: DingEvent) {
        if self.tx.send(Command::Publish(event)).is_err() {
            tracing::debug!("event hub stopped, dropping event");
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<HubItem> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let _ = self.tx.send(Command::Subscribe(tx));
        rx
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, keepalive: Duration) {
    let mut subscribers: Vec<mpsc::Sender<HubItem>> = Vec::new();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Publish(event)) => {
                    broadcast(&mut subscribers, HubItem::Event(Arc::new(event)));
                }
                Some(Command::Subscribe(tx)) => {
                    subscribers.push(tx);
                    crate::metrics::event_subscribers(subscribers.len());
                }
                None => break,
            },
            _ = ticker.tick() => broadcast(&mut subscribers, HubItem::Keepalive),
        }
    }
    tracing::debug!("event hub stopped");
}

fn broadcast(subscribers: &mut Vec<mpsc::Sender<HubItem>>, item: HubItem) {
    let before = subscribers.len();
    subscribers.retain(|sub| match sub.try_send(item.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            crate::metrics::event_dropped();
            true
        }
        Err(TrySendError::Closed(_)) => false,
    });
    if subscribers.len() != before {
        crate::metrics::event_subscribers(subscribers.len());
    }
}

//! Per-subscription notification delivery.
//!
//! Every subscription owns a bounded queue drained by its own task, so a slow
//! listener only ever loses its own notifications. The task hands frames to
//! the connection's bounded outbound channel without waiting; when either
//! queue is full the notification is dropped. Cancelling takes the
//! subscription's write gate: once `unsubscribe` returns, nothing more is
//! delivered for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;
use vigil_core::{Notification, NotificationFilter, ServerFrame, SubscriptionId, VigilError};

use crate::objects::ObjectKey;

/// How long a finished subscription waits to tell a backlogged connection.
const END_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

struct Entry {
    key: ObjectKey,
    session: Uuid,
    filter: NotificationFilter,
    live: Arc<RwLock<bool>>,
    queue: mpsc::Sender<Notification>,
}

impl Entry {
    fn cancel(self) {
        *self.live.write() = false;
    }
}

pub struct SubscriptionTable {
    entries: Mutex<HashMap<SubscriptionId, Entry>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriptionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Starts delivering matching notifications of `key` to `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        key: ObjectKey,
        session: Uuid,
        filter: NotificationFilter,
        sink: mpsc::Sender<ServerFrame>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, mut rx) = mpsc::channel::<Notification>(self.capacity);
        let live = Arc::new(RwLock::new(true));

        let gate = live.clone();
        tokio::spawn(async move {
            let mut connected = true;
            while let Some(notification) = rx.recv().await {
                let sequence = notification.sequence;
                let sent = {
                    let live = gate.read();
                    if !*live {
                        break;
                    }
                    sink.try_send(ServerFrame::Notification {
                        subscription: id,
                        notification,
                    })
                };
                match sent {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => dropped(id, sequence, "connection backlogged"),
                    Err(TrySendError::Closed(_)) => {
                        connected = false;
                        break;
                    }
                }
            }
            if connected {
                let ended = ServerFrame::SubscriptionEnded { subscription: id };
                if !matches!(timeout(END_NOTICE_TIMEOUT, sink.send(ended)).await, Ok(Ok(()))) {
                    debug!(subscription = %id, "could not report end of subscription");
                }
            }
            debug!(subscription = %id, "delivery task finished");
        });

        debug!(subscription = %id, object = %key.name, session = %session, "subscribed");
        self.entries.lock().insert(
            id,
            Entry {
                key,
                session,
                filter,
                live,
                queue,
            },
        );
        id
    }

    /// Queues `notification` for every live subscription of `key` whose filter
    /// accepts it. Never blocks.
    pub fn publish(&self, key: &ObjectKey, notification: &Notification) -> usize {
        let entries = self.entries.lock();
        let mut queued = 0;
        for (id, entry) in entries.iter() {
            if entry.key != *key || !entry.filter.accepts(notification) {
                continue;
            }
            match entry.queue.try_send(notification.clone()) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    dropped(*id, notification.sequence, "subscription queue full")
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        queued
    }

    /// Cancels a subscription owned by `session`.
    pub fn unsubscribe(&self, id: SubscriptionId, session: Uuid) -> Result<(), VigilError> {
        let mut entries = self.entries.lock();
        match entries.get(&id) {
            Some(entry) if entry.session == session => {}
            _ => return Err(VigilError::NotFound(id.to_string())),
        }
        if let Some(entry) = entries.remove(&id) {
            entry.cancel();
        }
        Ok(())
    }

    pub fn remove_object(&self, key: &ObjectKey) -> usize {
        self.remove_where(|entry| entry.key == *key)
    }

    pub fn remove_session(&self, session: Uuid) -> usize {
        self.remove_where(|entry| entry.session == session)
    }

    pub fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, predicate: impl Fn(&Entry) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let ids: Vec<SubscriptionId> = entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = entries.remove(id) {
                entry.cancel();
            }
        }
        ids.len()
    }
}

fn dropped(subscription: SubscriptionId, sequence: u64, reason: &'static str) {
    warn!(%subscription, sequence, reason, "dropping notification");
    metrics::counter!("vigil_notifications_dropped_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, generation: u64) -> ObjectKey {
        ObjectKey {
            name: name.to_string(),
            generation,
        }
    }

    fn notification(kind: &str, sequence: u64) -> Notification {
        Notification {
            source: "obj".into(),
            kind: kind.into(),
            message: String::new(),
            sequence,
            timestamp: 0,
            user_data: None,
        }
    }

    async fn next_sequence(rx: &mut mpsc::Receiver<ServerFrame>) -> Option<u64> {
        match timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(ServerFrame::Notification { notification, .. })) => Some(notification.sequence),
            _ => None,
        }
    }

    #[tokio::test]
    async fn delivers_in_order_to_matching_subscription() {
        let table = SubscriptionTable::new(16);
        let (tx, mut rx) = mpsc::channel(16);
        table.subscribe(key("obj", 1), Uuid::new_v4(), NotificationFilter::accept_all(), tx);

        for seq in 1..=5 {
            assert_eq!(table.publish(&key("obj", 1), &notification("a", seq)), 1);
        }
        for seq in 1..=5 {
            assert_eq!(next_sequence(&mut rx).await, Some(seq));
        }
    }

    #[tokio::test]
    async fn other_generation_and_filtered_kinds_are_skipped() {
        let table = SubscriptionTable::new(16);
        let (tx, mut rx) = mpsc::channel(16);
        let filter = NotificationFilter::default().enable("vigil.state");
        table.subscribe(key("obj", 2), Uuid::new_v4(), filter, tx);

        assert_eq!(table.publish(&key("obj", 1), &notification("vigil.state.reset", 1)), 0);
        assert_eq!(table.publish(&key("obj", 2), &notification("other", 2)), 0);
        assert_eq!(table.publish(&key("obj", 2), &notification("vigil.state.reset", 3)), 1);
        assert_eq!(next_sequence(&mut rx).await, Some(3));
    }

    #[tokio::test]
    async fn nothing_arrives_after_unsubscribe() {
        let table = SubscriptionTable::new(16);
        let session = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(16);
        let id = table.subscribe(key("obj", 1), session, NotificationFilter::accept_all(), tx);

        table.unsubscribe(id, session).unwrap();
        assert_eq!(table.publish(&key("obj", 1), &notification("a", 1)), 0);
        assert_eq!(next_sequence(&mut rx).await, None);
    }

    #[tokio::test]
    async fn removing_an_object_reports_the_end() {
        let table = SubscriptionTable::new(4);
        let (tx, mut rx) = mpsc::channel(16);
        let id = table.subscribe(key("obj", 1), Uuid::new_v4(), NotificationFilter::accept_all(), tx);

        assert_eq!(table.remove_object(&key("obj", 1)), 1);
        let frame = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        assert_eq!(frame, Some(ServerFrame::SubscriptionEnded { subscription: id }));
    }

    #[tokio::test]
    async fn unsubscribe_checks_owner() {
        let table = SubscriptionTable::new(16);
        let owner = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(16);
        let id = table.subscribe(key("obj", 1), owner, NotificationFilter::accept_all(), tx);

        assert!(matches!(
            table.unsubscribe(id, Uuid::new_v4()),
            Err(VigilError::NotFound(_))
        ));
        assert!(table.unsubscribe(id, owner).is_ok());
        assert!(table.unsubscribe(id, owner).is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let table = SubscriptionTable::new(1);
        let (tx, _rx) = mpsc::channel(16);
        table.subscribe(key("obj", 1), Uuid::new_v4(), NotificationFilter::accept_all(), tx);

        let queued: usize = (1..=50)
            .map(|seq| table.publish(&key("obj", 1), &notification("a", seq)))
            .sum();
        assert!(queued >= 1);
        assert!(queued <= 50);
    }

    #[tokio::test]
    async fn stalled_connection_holds_at_most_its_channel() {
        let table = SubscriptionTable::new(1);
        let (tx, mut rx) = mpsc::channel(2);
        table.subscribe(key("obj", 1), Uuid::new_v4(), NotificationFilter::accept_all(), tx);

        for seq in 1..=1_000 {
            table.publish(&key("obj", 1), &notification("a", seq));
            tokio::task::yield_now().await;
        }

        let mut backlog = Vec::new();
        while let Ok(ServerFrame::Notification { notification, .. }) = rx.try_recv() {
            backlog.push(notification.sequence);
        }
        assert_eq!(backlog, [1, 2]);

        // Draining the connection lets later notifications through again.
        table.publish(&key("obj", 1), &notification("a", 1_001));
        assert_eq!(next_sequence(&mut rx).await, Some(1_001));
    }

    #[tokio::test]
    async fn removal_by_object_and_session() {
        let table = SubscriptionTable::new(4);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(16);
        table.subscribe(key("a", 1), alice, NotificationFilter::accept_all(), tx.clone());
        table.subscribe(key("b", 1), alice, NotificationFilter::accept_all(), tx.clone());
        table.subscribe(key("a", 1), bob, NotificationFilter::accept_all(), tx);

        assert_eq!(table.remove_object(&key("a", 1)), 2);
        assert_eq!(table.remove_session(alice), 1);
        assert!(table.is_empty());
    }
}

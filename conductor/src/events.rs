//! Audit event sink.
//!
//! Emitting never blocks and never fails the caller: events are logged,
//! kept in a bounded per-entity queue and fanned out on a broadcast channel.
//! The queue tracks at most `MAX_TRACKED_ENTITIES` entities and drops the
//! one with the stalest event when a new entity arrives. A background
//! persister drains the channel into `audit_events`.

use crate::db::connection::{with_conn, DbPool};
use crate::models::audit_event::{self, AuditEvent};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BROADCAST_CAPACITY: usize = 256;
const MAX_TRACKED_ENTITIES: usize = 1024;

#[derive(Clone)]
pub struct EventLogger {
    tx: broadcast::Sender<AuditEvent>,
    queue: Arc<DashMap<Uuid, VecDeque<AuditEvent>>>,
    max_per_entity: usize,
    max_entities: usize,
}

impl EventLogger {
    pub fn new(max_per_entity: usize) -> Self {
        Self::with_limits(max_per_entity, MAX_TRACKED_ENTITIES)
    }

    pub fn with_limits(max_per_entity: usize, max_entities: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            queue: Arc::new(DashMap::new()),
            max_per_entity: max_per_entity.max(1),
            max_entities: max_entities.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            event_type = %event.event_type,
            entity_type = %event.entity_type,
            entity_uuid = %event.entity_uuid,
            context = %event.context,
            "{}",
            event.message
        );

        if !self.queue.contains_key(&event.entity_uuid) && self.queue.len() >= self.max_entities {
            self.evict_stalest();
        }
        {
            let mut entry = self.queue.entry(event.entity_uuid).or_default();
            entry.push_back(event.clone());
            if entry.len() > self.max_per_entity {
                entry.pop_front();
            }
        }

        // No subscribers is fine; the event is already logged and queued.
        let _ = self.tx.send(event);
    }

    fn evict_stalest(&self) {
        let stalest = self
            .queue
            .iter()
            .min_by_key(|entry| entry.value().back().map(|e| e.created_at))
            .map(|entry| *entry.key());
        if let Some(uuid) = stalest {
            self.queue.remove(&uuid);
        }
    }

    pub fn tracked_entities(&self) -> usize {
        self.queue.len()
    }

    /// Recently emitted events for one entity, oldest first.
    pub fn recent(&self, entity_uuid: Uuid) -> Vec<AuditEvent> {
        self.queue
            .get(&entity_uuid)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, entity_uuid: Uuid, event_type: &str) -> usize {
        self.queue
            .get(&entity_uuid)
            .map(|q| q.iter().filter(|e| e.event_type == event_type).count())
            .unwrap_or(0)
    }
}

/// Drains emitted events into the database until cancelled.
pub fn start_persister(
    events: &EventLogger,
    db: DbPool,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    flush(&mut rx, &db).await;
                    break;
                }
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Audit persister lagged, events were not stored");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            store(&db, event).await;
        }
        tracing::info!("Audit persister stopped");
    })
}

async fn store(db: &DbPool, event: AuditEvent) {
    let event_uuid = event.uuid;
    if let Err(e) = with_conn(db, move |conn| audit_event::insert(conn, &event)).await {
        tracing::warn!(event_uuid = %event_uuid, "Failed to store audit event: {e:#}");
    }
}

/// Stores whatever is still buffered in the channel.
async fn flush(rx: &mut broadcast::Receiver<AuditEvent>, db: &DbPool) {
    loop {
        match rx.try_recv() {
            Ok(event) => store(db, event).await,
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Audit persister lagged, events were not stored");
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[test]
    fn test_queue_is_bounded_per_entity() {
        let events = EventLogger::new(2);
        let entity = Uuid::new_v4();
        for i in 0..3 {
            events.emit(AuditEvent::new("iaas_backup_deleted", "backup", entity, format!("event {i}")));
        }

        let recent = events.recent(entity);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "event 1");
        assert_eq!(events.count(entity, "iaas_backup_deleted"), 2);
        assert!(events.recent(Uuid::new_v4()).is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let events = EventLogger::new(10);
        let mut rx = events.subscribe();
        let entity = Uuid::new_v4();

        events.emit(AuditEvent::new("iaas_backup_deleted", "instance", entity, "hello"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.entity_uuid, entity);
        assert_eq!(received.event_type, "iaas_backup_deleted");
    }

    #[test]
    fn test_stalest_entity_is_evicted() {
        let events = EventLogger::with_limits(10, 2);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        events.emit(AuditEvent::new("iaas_backup_deleted", "backup", first, "first"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        events.emit(AuditEvent::new("iaas_backup_deleted", "backup", second, "second"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        events.emit(AuditEvent::new("iaas_backup_deleted", "backup", first, "first again"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        events.emit(AuditEvent::new("iaas_backup_deleted", "backup", third, "third"));

        assert_eq!(events.tracked_entities(), 2);
        assert_eq!(events.recent(first).len(), 2);
        assert!(events.recent(second).is_empty());
        assert_eq!(events.recent(third).len(), 1);
    }

    #[tokio::test]
    async fn test_persister_stores_buffered_events_on_shutdown() {
        let (_dir, pool) = test_pool();
        let events = EventLogger::new(10);
        let entity = Uuid::new_v4();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let persister = start_persister(&events, pool.clone(), cancel);
        for i in 0..3 {
            events.emit(AuditEvent::new("iaas_backup_deleted", "backup", entity, format!("event {i}")));
        }
        persister.await.unwrap();

        let conn = pool.get().unwrap();
        let stored = audit_event::find_recent(&conn, Some(entity), 10).unwrap();
        assert_eq!(stored.len(), 3);
    }
}

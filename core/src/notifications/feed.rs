// Notification feed: the bell menu's model
//
// Notifications reach a volunteer twice: as rows on the realtime channel and
// as push messages. The feed merges both into one list keyed by id, keeps it
// newest first, and tracks read state optimistically: marking an item read
// flips it locally right away and settles once the backend answers.

use crate::backend::{NotificationBackend, SendError};
use crate::clock::{parse_rfc3339, Clock};
use crate::push::worker::{NotificationHandler, PushPayload};
use crate::realtime::protocol::{ChangeEvent, ChangeEventType};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_FEED_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub read_at: Option<u64>,
    pub created_at: u64,
}

fn str_field(row: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match row.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn time_field(row: &Value, key: &str) -> Option<u64> {
    match row.get(key)? {
        Value::String(s) => parse_rfc3339(s),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

impl NotificationEvent {
    /// Build from a notifications-table row.
    pub fn from_row(row: &Value) -> Option<Self> {
        Some(Self {
            id: str_field(row, &["id"])?,
            title: str_field(row, &["title"]).unwrap_or_default(),
            body: str_field(row, &["body", "message"]).unwrap_or_default(),
            kind: str_field(row, &["type"]).unwrap_or_else(|| "general".to_string()),
            payload: row
                .get("data")
                .or_else(|| row.get("payload"))
                .cloned()
                .unwrap_or(Value::Null),
            read_at: time_field(row, "read_at"),
            created_at: time_field(row, "created_at").unwrap_or_default(),
        })
    }

    /// Build from a push payload. Payloads without `data.id` cannot be
    /// matched against rows and are skipped.
    pub fn from_push(payload: &PushPayload, received_at: u64) -> Option<Self> {
        let data = payload.data.clone().unwrap_or(Value::Null);
        Some(Self {
            id: str_field(&data, &["id"])?,
            title: payload.title.clone(),
            body: payload.body.clone(),
            kind: str_field(&data, &["type"]).unwrap_or_else(|| "general".to_string()),
            read_at: None,
            created_at: time_field(&data, "created_at").unwrap_or(received_at),
            payload: data,
        })
    }
}

/// Read state of one item. `PendingRead` carries the ticket of the request
/// in flight; only that request may settle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadState {
    Unread,
    PendingRead(u64),
    Read,
}

impl ReadState {
    /// Pending reads already show as read.
    pub fn is_unread(&self) -> bool {
        matches!(self, ReadState::Unread)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub event: NotificationEvent,
    pub read: ReadState,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("No notification with id {0}")]
    NotFound(String),
    #[error("Failed to mark notification read: {0}")]
    Backend(#[from] SendError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkAllReport {
    pub marked: usize,
    pub failed: usize,
}

pub struct NotificationFeed {
    backend: Arc<dyn NotificationBackend>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    items: Mutex<HashMap<String, FeedItem>>,
    next_ticket: AtomicU64,
}

impl NotificationFeed {
    pub fn new(backend: Arc<dyn NotificationBackend>, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(backend, clock, DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(
        backend: Arc<dyn NotificationBackend>,
        clock: Arc<dyn Clock>,
        capacity: usize,
    ) -> Self {
        Self {
            backend,
            clock,
            capacity: capacity.max(1),
            items: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Add or refresh an item from a table row. Returns `true` when it
    /// was new.
    pub fn ingest(&self, event: NotificationEvent) -> bool {
        let mut items = self.items.lock();
        let is_new = match items.get_mut(&event.id) {
            Some(existing) => {
                Self::merge(existing, event);
                false
            }
            None => {
                Self::insert(&mut items, event);
                true
            }
        };
        self.evict(&mut items);
        is_new
    }

    fn insert(items: &mut HashMap<String, FeedItem>, event: NotificationEvent) {
        let read = if event.read_at.is_some() {
            ReadState::Read
        } else {
            ReadState::Unread
        };
        items.insert(event.id.clone(), FeedItem { event, read });
    }

    fn merge(existing: &mut FeedItem, incoming: NotificationEvent) {
        // Local optimistic state wins until its request settles
        existing.read = match (existing.read, incoming.read_at) {
            (ReadState::PendingRead(t), _) => ReadState::PendingRead(t),
            (_, Some(_)) => ReadState::Read,
            (_, None) => ReadState::Unread,
        };
        let created_at = if incoming.created_at == 0 {
            existing.event.created_at
        } else {
            incoming.created_at
        };
        existing.event = NotificationEvent {
            created_at,
            ..incoming
        };
    }

    fn evict(&self, items: &mut HashMap<String, FeedItem>) {
        while items.len() > self.capacity {
            let oldest = items
                .values()
                .min_by(|a, b| {
                    a.event
                        .created_at
                        .cmp(&b.event.created_at)
                        .then_with(|| a.event.id.cmp(&b.event.id))
                })
                .map(|item| item.event.id.clone());
            match oldest {
                Some(id) => {
                    items.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Add a pushed notification. A push carries no read state and less
    /// than the row, so it only fills in ids the feed has not seen.
    pub fn ingest_push(&self, payload: &PushPayload) -> bool {
        let Some(event) = NotificationEvent::from_push(payload, self.clock.now_ms()) else {
            tracing::debug!("Push payload without id not added to feed");
            return false;
        };
        let mut items = self.items.lock();
        if items.contains_key(&event.id) {
            tracing::debug!("Push for known notification {} ignored", event.id);
            return false;
        }
        Self::insert(&mut items, event);
        self.evict(&mut items);
        true
    }

    /// Apply a realtime change on the notifications table.
    pub fn apply_change(&self, change: &ChangeEvent) {
        match change.event_type {
            ChangeEventType::Insert | ChangeEventType::Update => {
                let Some(event) = change.new.as_ref().and_then(NotificationEvent::from_row) else {
                    tracing::warn!("Notification change without a usable row");
                    return;
                };
                self.ingest(event);
            }
            ChangeEventType::Delete => {
                if let Some(id) = change.row_id() {
                    self.items.lock().remove(&id);
                }
            }
        }
    }

    /// Merge a freshly fetched list, e.g. after a reconnect.
    ///
    /// The fetch covers everything from its oldest row onward, so local
    /// items in that window that the backend no longer returns were deleted
    /// while the channel was down and are dropped. An empty fetch clears
    /// the feed.
    pub fn reconcile(&self, events: Vec<NotificationEvent>) {
        let floor = events.iter().map(|e| e.created_at).min().unwrap_or(0);
        let fetched: HashSet<String> = events.iter().map(|e| e.id.clone()).collect();
        for event in events {
            self.ingest(event);
        }

        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|id, item| fetched.contains(id) || item.event.created_at < floor);
        let dropped = before - items.len();
        if dropped > 0 {
            tracing::debug!("Dropped {} notification(s) deleted while offline", dropped);
        }
    }

    /// Items newest first.
    pub fn items(&self) -> Vec<FeedItem> {
        let mut items: Vec<FeedItem> = self.items.lock().values().cloned().collect();
        items.sort_by(|a, b| {
            b.event
                .created_at
                .cmp(&a.event.created_at)
                .then_with(|| b.event.id.cmp(&a.event.id))
        });
        items
    }

    pub fn get(&self, id: &str) -> Option<FeedItem> {
        self.items.lock().get(id).cloned()
    }

    pub fn unread_count(&self) -> usize {
        self.items
            .lock()
            .values()
            .filter(|item| item.read.is_unread())
            .count()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark one item read: locally at once, then on the backend.
    pub async fn mark_read(&self, id: &str) -> Result<(), FeedError> {
        let ticket = {
            let mut items = self.items.lock();
            let item = items
                .get_mut(id)
                .ok_or_else(|| FeedError::NotFound(id.to_string()))?;
            if item.read == ReadState::Read {
                return Ok(());
            }
            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            item.read = ReadState::PendingRead(ticket);
            ticket
        };

        let read_at = self.clock.now_ms();
        let result = self.backend.mark_read(id, read_at).await;

        let mut items = self.items.lock();
        let Some(item) = items.get_mut(id) else {
            // Deleted while the request was in flight
            return result.map_err(FeedError::from);
        };
        if item.read != ReadState::PendingRead(ticket) {
            tracing::debug!("Stale read ticket {} for {} ignored", ticket, id);
            return result.map_err(FeedError::from);
        }
        match result {
            Ok(()) => {
                item.read = ReadState::Read;
                item.event.read_at = Some(read_at);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Mark-read for {} failed, reverting: {}", id, e);
                item.read = ReadState::Unread;
                Err(e.into())
            }
        }
    }

    /// Mark every unread item read, concurrently.
    pub async fn mark_all_read(&self) -> MarkAllReport {
        let unread: Vec<String> = self
            .items
            .lock()
            .values()
            .filter(|item| item.read.is_unread())
            .map(|item| item.event.id.clone())
            .collect();

        let results = join_all(unread.iter().map(|id| self.mark_read(id))).await;
        let mut report = MarkAllReport::default();
        for result in results {
            match result {
                Ok(()) => report.marked += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }
}

impl NotificationHandler for NotificationFeed {
    fn on_notification(&self, payload: &PushPayload) {
        self.ingest_push(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockNotificationBackend;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn event(id: &str, created_at: u64) -> NotificationEvent {
        NotificationEvent {
            id: id.into(),
            title: format!("title {}", id),
            body: "body".into(),
            kind: "incident".into(),
            payload: Value::Null,
            read_at: None,
            created_at,
        }
    }

    fn feed(backend: MockNotificationBackend) -> NotificationFeed {
        NotificationFeed::new(Arc::new(backend), Arc::new(ManualClock::new(5_000)))
    }

    #[test]
    fn test_dedup_across_sources_newest_first() {
        let feed = feed(MockNotificationBackend::new());
        assert!(feed.ingest(event("a", 100)));
        assert!(feed.ingest(event("b", 200)));

        let push = PushPayload {
            title: "title a".into(),
            body: "body".into(),
            icon: None,
            data: Some(json!({"id": "a", "type": "incident"})),
        };
        assert!(!feed.ingest_push(&push));

        let ids: Vec<String> = feed.items().into_iter().map(|i| i.event.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(feed.unread_count(), 2);
        // The row's timestamp survives the push copy
        assert_eq!(feed.get("a").unwrap().event.created_at, 100);
    }

    #[test]
    fn test_push_without_id_skipped() {
        let feed = feed(MockNotificationBackend::new());
        let push = PushPayload {
            title: "t".into(),
            body: "b".into(),
            icon: None,
            data: None,
        };
        assert!(!feed.ingest_push(&push));
        assert!(feed.is_empty());
    }

    #[test]
    fn test_realtime_rows() {
        let feed = feed(MockNotificationBackend::new());
        let insert = ChangeEvent {
            event_type: ChangeEventType::Insert,
            schema: Some("public".into()),
            table: "notifications".into(),
            new: Some(json!({
                "id": "n1",
                "title": "Assigned",
                "message": "Incident 4",
                "type": "assignment",
                "read_at": null,
                "created_at": "2024-03-01T08:00:00Z"
            })),
            old: None,
            commit_timestamp: None,
        };
        feed.apply_change(&insert);
        let item = feed.get("n1").unwrap();
        assert_eq!(item.event.body, "Incident 4");
        assert_eq!(item.event.created_at, 1_709_280_000_000);
        assert_eq!(item.read, ReadState::Unread);

        let mut update = insert.clone();
        update.event_type = ChangeEventType::Update;
        update.new.as_mut().unwrap()["read_at"] = json!("2024-03-01T09:00:00Z");
        feed.apply_change(&update);
        assert_eq!(feed.get("n1").unwrap().read, ReadState::Read);

        let delete = ChangeEvent {
            event_type: ChangeEventType::Delete,
            new: None,
            old: Some(json!({"id": "n1"})),
            ..insert
        };
        feed.apply_change(&delete);
        assert!(feed.get("n1").is_none());
    }

    #[tokio::test]
    async fn test_mark_read_success() {
        let mut backend = MockNotificationBackend::new();
        backend
            .expect_mark_read()
            .withf(|id, at| id == "a" && *at == 5_000)
            .times(1)
            .returning(|_, _| Ok(()));
        let feed = feed(backend);
        feed.ingest(event("a", 1));
        feed.mark_read("a").await.unwrap();
        assert_eq!(feed.get("a").unwrap().read, ReadState::Read);
        assert_eq!(feed.unread_count(), 0);
        // Already read: no second request
        feed.mark_read("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_read_failure_reverts() {
        let mut backend = MockNotificationBackend::new();
        backend
            .expect_mark_read()
            .returning(|_, _| Err(SendError::Network("offline".into())));
        let feed = feed(backend);
        feed.ingest(event("a", 1));
        assert!(matches!(
            feed.mark_read("a").await,
            Err(FeedError::Backend(_))
        ));
        assert_eq!(feed.get("a").unwrap().read, ReadState::Unread);
        assert!(matches!(
            feed.mark_read("zzz").await,
            Err(FeedError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_all_read_counts() {
        let mut backend = MockNotificationBackend::new();
        backend.expect_mark_read().returning(|id, _| {
            if id == "b" {
                Err(SendError::Rejected {
                    status: 403,
                    message: "not yours".into(),
                })
            } else {
                Ok(())
            }
        });
        let feed = feed(backend);
        for (id, t) in [("a", 1), ("b", 2), ("c", 3)] {
            feed.ingest(event(id, t));
        }
        let report = feed.mark_all_read().await;
        assert_eq!(report, MarkAllReport { marked: 2, failed: 1 });
        assert_eq!(feed.unread_count(), 1);
    }

    #[tokio::test]
    async fn test_late_push_keeps_read_row() {
        let mut backend = MockNotificationBackend::new();
        backend.expect_mark_read().times(1).returning(|_, _| Ok(()));
        let feed = feed(backend);
        feed.ingest(event("a", 100));
        feed.mark_read("a").await.unwrap();

        let push = PushPayload {
            title: "Heads up".into(),
            body: "short".into(),
            icon: None,
            data: Some(json!({"id": "a"})),
        };
        assert!(!feed.ingest_push(&push));

        let item = feed.get("a").unwrap();
        assert_eq!(item.read, ReadState::Read);
        assert_eq!(item.event.kind, "incident");
        assert_eq!(item.event.title, "title a");
        assert!(item.event.read_at.is_some());
        assert_eq!(feed.unread_count(), 0);
    }

    #[test]
    fn test_row_fills_in_push_first_item() {
        let feed = feed(MockNotificationBackend::new());
        let push = PushPayload {
            title: "Assigned".into(),
            body: "b".into(),
            icon: None,
            data: Some(json!({"id": "x"})),
        };
        assert!(feed.ingest_push(&push));
        assert_eq!(feed.get("x").unwrap().event.kind, "general");

        assert!(!feed.ingest(event("x", 4_000)));
        let item = feed.get("x").unwrap();
        assert_eq!(item.event.kind, "incident");
        assert_eq!(item.event.created_at, 4_000);
    }

    #[test]
    fn test_reconcile_drops_rows_deleted_offline() {
        let feed = feed(MockNotificationBackend::new());
        for (id, t) in [("old", 50), ("a", 100), ("b", 200), ("c", 300)] {
            feed.ingest(event(id, t));
        }

        // "b" was deleted during the outage; "old" is outside the fetched window
        let mut read_c = event("c", 300);
        read_c.read_at = Some(310);
        feed.reconcile(vec![read_c, event("a", 100)]);

        let ids: Vec<String> = feed.items().into_iter().map(|i| i.event.id).collect();
        assert_eq!(ids, vec!["c", "a", "old"]);
        assert_eq!(feed.get("c").unwrap().read, ReadState::Read);

        feed.reconcile(Vec::new());
        assert!(feed.is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let feed = NotificationFeed::with_capacity(
            Arc::new(MockNotificationBackend::new()),
            Arc::new(ManualClock::new(0)),
            2,
        );
        feed.ingest(event("a", 1));
        feed.ingest(event("b", 2));
        feed.ingest(event("c", 3));
        assert!(feed.get("a").is_none());
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn test_pending_read_survives_server_echo() {
        let feed = feed(MockNotificationBackend::new());
        feed.ingest(event("a", 1));
        feed.items.lock().get_mut("a").unwrap().read = ReadState::PendingRead(9);
        feed.ingest(event("a", 1));
        assert_eq!(feed.get("a").unwrap().read, ReadState::PendingRead(9));
    }
}

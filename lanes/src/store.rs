use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::message::MessageId;

/// Row to insert.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub body: String,
    /// JSON object of header name to value.
    pub headers: String,
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

/// Row returned by a claim.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub id: MessageId,
    pub body: String,
    pub headers: String,
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    /// Delivery stamp as it was before this claim. `Some` means redelivery.
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Which rows can be claimed at a given instant.
#[derive(Clone, Copy, Debug)]
pub struct Eligibility {
    pub now: DateTime<Utc>,
    /// Delivered rows stamped before this instant are claimable again.
    pub stale_before: Option<DateTime<Utc>>,
}

impl Eligibility {
    pub fn at(now: DateTime<Utc>, redeliver_after: Option<chrono::Duration>) -> Self {
        Self {
            now,
            stale_before: redeliver_after
                .map(|after| now.checked_sub_signed(after).unwrap_or(DateTime::<Utc>::MIN_UTC)),
        }
    }

    pub fn admits(
        &self,
        available_at: DateTime<Utc>,
        delivered_at: Option<DateTime<Utc>>,
    ) -> bool {
        if available_at > self.now {
            return false;
        }
        match (delivered_at, self.stale_before) {
            (None, _) => true,
            (Some(delivered), Some(cutoff)) => delivered < cutoff,
            (Some(_), None) => false,
        }
    }
}

/// Partitions a receiver is responsible for: a name prefix plus exact names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionFilter {
    pub prefix: String,
    pub names: Vec<String>,
}

impl PartitionFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            names: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn matches(&self, queue_name: &str) -> bool {
        queue_name.starts_with(&self.prefix) || self.names.iter().any(|name| name == queue_name)
    }
}

/// Durable storage for queued messages.
///
/// Every claim goes through [`QueueStore::claim_next`], which must never hand
/// the same row to two concurrent callers.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert(&self, message: NewMessage) -> anyhow::Result<MessageId>;

    /// Distinct partitions that have at least one eligible row.
    async fn pending_partitions(
        &self,
        filter: &PartitionFilter,
        eligibility: &Eligibility,
    ) -> anyhow::Result<Vec<String>>;

    /// Stamp and return the oldest eligible row of a partition.
    async fn claim_next(
        &self,
        queue_name: &str,
        eligibility: &Eligibility,
    ) -> anyhow::Result<Option<StoredMessage>>;

    /// Rewrite `delivered_at` of a claimed row.
    async fn touch(&self, id: MessageId, at: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn delete(&self, id: MessageId) -> anyhow::Result<bool>;

    /// Move a row to another partition and make it pending there.
    async fn relocate(&self, id: MessageId, queue_name: &str) -> anyhow::Result<bool>;

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot>;
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Per-partition statistics.
    pub queues: HashMap<String, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: HashMap::new(),
        }
    }

    /// Get or create an entry for a partition.
    pub fn entry_mut(&mut self, queue_name: &str) -> &mut QueueSnapshotEntry {
        self.queues.entry(queue_name.to_string()).or_default()
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(|entry| entry.total_count).sum()
    }
}

/// Statistics for a single partition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    /// Rows available and not delivered.
    pub ready_count: usize,
    /// Rows currently delivered to a receiver.
    pub delivered_count: usize,
    /// Rows whose `available_at` lies in the future.
    pub delayed_count: usize,
    pub total_count: usize,
}

#[derive(Clone, Debug)]
struct Row {
    body: String,
    headers: String,
    queue_name: String,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    rows: BTreeMap<i64, Row>,
}

/// Process-local store. Claims are serialized by a single mutex.
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Partition of every stored row, in id order.
    pub fn queue_names(&self) -> Vec<(MessageId, String)> {
        self.state
            .lock()
            .rows
            .iter()
            .map(|(id, row)| (MessageId(*id), row.queue_name.clone()))
            .collect()
    }

    /// Backdate the delivery stamp of a row.
    pub fn set_delivered_at(&self, id: MessageId, at: Option<DateTime<Utc>>) -> bool {
        match self.state.lock().rows.get_mut(&id.0) {
            Some(row) => {
                row.delivered_at = at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert(&self, message: NewMessage) -> anyhow::Result<MessageId> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.rows.insert(
            id,
            Row {
                body: message.body,
                headers: message.headers,
                queue_name: message.queue_name,
                created_at: message.created_at,
                available_at: message.available_at,
                delivered_at: None,
            },
        );
        Ok(MessageId(id))
    }

    async fn pending_partitions(
        &self,
        filter: &PartitionFilter,
        eligibility: &Eligibility,
    ) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .rows
            .values()
            .filter(|row| filter.matches(&row.queue_name))
            .filter(|row| eligibility.admits(row.available_at, row.delivered_at))
            .map(|row| row.queue_name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        eligibility: &Eligibility,
    ) -> anyhow::Result<Option<StoredMessage>> {
        let mut state = self.state.lock();
        let candidate = state
            .rows
            .iter()
            .filter(|(_, row)| row.queue_name == queue_name)
            .filter(|(_, row)| eligibility.admits(row.available_at, row.delivered_at))
            .min_by_key(|(id, row)| (row.created_at, **id))
            .map(|(id, _)| *id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(None);
        };
        let previous = row.delivered_at.replace(eligibility.now);
        Ok(Some(StoredMessage {
            id: MessageId(id),
            body: row.body.clone(),
            headers: row.headers.clone(),
            queue_name: row.queue_name.clone(),
            created_at: row.created_at,
            available_at: row.available_at,
            delivered_at: previous,
        }))
    }

    async fn touch(&self, id: MessageId, at: DateTime<Utc>) -> anyhow::Result<bool> {
        match self.state.lock().rows.get_mut(&id.0) {
            Some(row) if row.delivered_at.is_some() => {
                row.delivered_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: MessageId) -> anyhow::Result<bool> {
        Ok(self.state.lock().rows.remove(&id.0).is_some())
    }

    async fn relocate(&self, id: MessageId, queue_name: &str) -> anyhow::Result<bool> {
        match self.state.lock().rows.get_mut(&id.0) {
            Some(row) => {
                row.queue_name = queue_name.to_string();
                row.delivered_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let now = Utc::now();
        let mut snapshot = QueueSnapshot::new(now);
        let state = self.state.lock();
        for row in state.rows.values() {
            let entry = snapshot.entry_mut(&row.queue_name);
            entry.total_count += 1;
            if row.delivered_at.is_some() {
                entry.delivered_count += 1;
            } else if row.available_at > now {
                entry.delayed_count += 1;
            } else {
                entry.ready_count += 1;
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(queue: &str, created_at: DateTime<Utc>) -> NewMessage {
        NewMessage {
            body: "{}".into(),
            headers: "{}".into(),
            queue_name: queue.into(),
            created_at,
            available_at: created_at,
        }
    }

    #[tokio::test]
    async fn test_claims_oldest_then_ties_by_id() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let late = store.insert(row("env_1", now)).await.unwrap();
        let early = store
            .insert(row("env_1", now - Duration::seconds(5)))
            .await
            .unwrap();
        let tie = store.insert(row("env_1", now)).await.unwrap();

        let eligibility = Eligibility::at(now, None);
        let mut order = Vec::new();
        while let Some(claimed) = store.claim_next("env_1", &eligibility).await.unwrap() {
            order.push(claimed.id);
        }
        assert_eq!(order, vec![early, late, tie]);
    }

    #[tokio::test]
    async fn test_delayed_rows_wait() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let mut delayed = row("env_1", now);
        delayed.available_at = now + Duration::seconds(30);
        store.insert(delayed).await.unwrap();

        let filter = PartitionFilter::new("env_");
        let eligibility = Eligibility::at(now, None);
        assert!(store
            .pending_partitions(&filter, &eligibility)
            .await
            .unwrap()
            .is_empty());
        let later = Eligibility::at(now + Duration::seconds(31), None);
        assert_eq!(
            store.pending_partitions(&filter, &later).await.unwrap(),
            vec!["env_1"]
        );
    }

    #[tokio::test]
    async fn test_stale_delivery_becomes_eligible() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let id = store.insert(row("env_1", now)).await.unwrap();
        store.set_delivered_at(id, Some(now - Duration::hours(5)));

        let strict = Eligibility::at(now, None);
        assert!(store.claim_next("env_1", &strict).await.unwrap().is_none());

        let lenient = Eligibility::at(now, Some(Duration::hours(4)));
        let claimed = store.claim_next("env_1", &lenient).await.unwrap().unwrap();
        assert!(claimed.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_filter_excludes_foreign_partitions() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        store.insert(row("env_1", now)).await.unwrap();
        store.insert(row("default", now)).await.unwrap();
        store.insert(row("failed", now)).await.unwrap();

        let filter = PartitionFilter::new("env_").with_name("default");
        let names = store
            .pending_partitions(&filter, &Eligibility::at(now, None))
            .await
            .unwrap();
        assert_eq!(names, vec!["default", "env_1"]);

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.total(), 3);
        assert_eq!(snapshot.queues["failed"].ready_count, 1);
    }

    #[tokio::test]
    async fn test_touch_only_refreshes_delivered_rows() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let pending = store.insert(row("env_1", now)).await.unwrap();
        assert!(!store.touch(pending, now).await.unwrap());

        let claimed = store
            .claim_next("env_1", &Eligibility::at(now, None))
            .await
            .unwrap()
            .unwrap();
        let later = now + Duration::seconds(10);
        assert!(store.touch(claimed.id, later).await.unwrap());
        assert!(!store.touch(MessageId(999), later).await.unwrap());

        let other = store.insert(row("env_2", now)).await.unwrap();
        store.touch(other, later).await.unwrap();
        let names = store
            .pending_partitions(&PartitionFilter::new("env_"), &Eligibility::at(later, None))
            .await
            .unwrap();
        assert_eq!(names, vec!["env_2"]);
    }

    #[test]
    fn test_huge_redelivery_threshold_does_not_overflow() {
        let now = Utc::now();
        let eligibility = Eligibility::at(now, Some(Duration::MAX));
        assert_eq!(eligibility.stale_before, Some(DateTime::<Utc>::MIN_UTC));
        assert!(!eligibility.admits(now, Some(now - Duration::days(365))));
        assert!(eligibility.admits(now, None));
    }
}

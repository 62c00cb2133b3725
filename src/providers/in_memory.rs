use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{HistoryStore, InstanceRecord, Lease, ProviderError, QueueKind, TaskQueue, WorkItem};
use crate::Event;

const CAP: usize = 4096;

struct InstanceData {
    record: InstanceRecord,
    // generation N lives at index N - 1
    generations: Vec<Vec<Event>>,
}

struct QueueEntry {
    item: WorkItem,
    visible_at: Instant,
    delivery_count: u32,
    lease: Option<(String, Instant)>,
    lease_expired: bool,
}

impl QueueEntry {
    fn is_available(&self, now: Instant) -> bool {
        match &self.lease {
            Some((_, until)) => *until <= now,
            None => self.visible_at <= now,
        }
    }
}

/// Process-local provider backing both [`HistoryStore`] and [`TaskQueue`].
/// Uses tokio's clock so tests can pause and advance time.
#[derive(Default)]
pub struct InMemoryProvider {
    instances: Mutex<HashMap<String, InstanceData>>,
    orchestrator_q: Mutex<Vec<QueueEntry>>,
    worker_q: Mutex<Vec<QueueEntry>>,
}

impl InMemoryProvider {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<Vec<QueueEntry>> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
        }
    }

    /// Items in a queue, leased or not (test utility).
    pub async fn queue_depth(&self, kind: QueueKind) -> usize {
        self.queue(kind).lock().await.len()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryProvider {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        let mut g = self.instances.lock().await;
        if g.contains_key(&record.instance_id) {
            return Err(ProviderError::already_exists("create_instance", &record.instance_id));
        }
        g.insert(
            record.instance_id.clone(),
            InstanceData {
                record,
                generations: Vec::new(),
            },
        );
        Ok(())
    }

    async fn read_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        Ok(self.instances.lock().await.get(instance).map(|d| d.record.clone()))
    }

    async fn update_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        let mut g = self.instances.lock().await;
        let data = g
            .get_mut(&record.instance_id)
            .ok_or_else(|| ProviderError::not_found("update_instance", format!("instance not found: {}", record.instance_id)))?;
        data.record = record;
        Ok(())
    }

    async fn read(&self, instance: &str, generation: u64) -> Result<Vec<Event>, ProviderError> {
        let g = self.instances.lock().await;
        Ok(g
            .get(instance)
            .and_then(|d| d.generations.get(generation.saturating_sub(1) as usize))
            .cloned()
            .unwrap_or_default())
    }

    async fn append(
        &self,
        instance: &str,
        generation: u64,
        expected_version: usize,
        events: Vec<Event>,
    ) -> Result<(), ProviderError> {
        let mut g = self.instances.lock().await;
        let data = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::not_found("append", format!("instance not found: {instance}")))?;
        if generation == 0 {
            return Err(ProviderError::permanent("append", "generation numbers start at 1"));
        }
        let idx = (generation - 1) as usize;
        // a generation can only be opened directly after the latest one
        while data.generations.len() <= idx {
            if data.generations.len() < idx {
                return Err(ProviderError::permanent(
                    "append",
                    format!("generation {generation} skips ahead of {}", data.generations.len()),
                ));
            }
            data.generations.push(Vec::new());
        }
        let current = &mut data.generations[idx];
        if current.len() != expected_version {
            return Err(ProviderError::version_conflict("append", expected_version, current.len()));
        }
        if current.len() + events.len() > CAP {
            return Err(ProviderError::permanent(
                "append",
                format!("history cap exceeded (cap={CAP}, have={}, append={})", current.len(), events.len()),
            ));
        }
        current.extend(events);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut ids: Vec<String> = self.instances.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn purge(&self, instance: &str) -> Result<(), ProviderError> {
        match self.instances.lock().await.remove(instance) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found("purge", format!("instance not found: {instance}"))),
        }
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryProvider {
    async fn enqueue(&self, kind: QueueKind, item: WorkItem, delay: Duration) -> Result<(), ProviderError> {
        self.queue(kind).lock().await.push(QueueEntry {
            item,
            visible_at: Instant::now() + delay,
            delivery_count: 0,
            lease: None,
            lease_expired: false,
        });
        Ok(())
    }

    async fn dequeue_with_lease(
        &self,
        kind: QueueKind,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>, ProviderError> {
        let mut q = self.queue(kind).lock().await;
        let now = Instant::now();
        let Some(entry) = q.iter_mut().find(|e| e.is_available(now)) else {
            return Ok(None);
        };
        // still leased but available: the previous holder let it expire
        if entry.lease.is_some() {
            entry.lease_expired = true;
        }
        let token = uuid::Uuid::new_v4().to_string();
        entry.lease = Some((token.clone(), now + visibility_timeout));
        entry.delivery_count += 1;
        Ok(Some(Lease {
            item: entry.item.clone(),
            token,
            delivery_count: entry.delivery_count,
            redelivered: entry.lease_expired,
        }))
    }

    async fn renew_lease(&self, kind: QueueKind, token: &str, extend_by: Duration) -> Result<(), ProviderError> {
        let mut q = self.queue(kind).lock().await;
        let entry = q
            .iter_mut()
            .find(|e| matches!(&e.lease, Some((t, _)) if t == token))
            .ok_or_else(|| ProviderError::not_found("renew_lease", "lease not held"))?;
        entry.lease = Some((token.to_string(), Instant::now() + extend_by));
        Ok(())
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let mut q = self.queue(kind).lock().await;
        let pos = q
            .iter()
            .position(|e| matches!(&e.lease, Some((t, _)) if t == token))
            .ok_or_else(|| ProviderError::not_found("ack", "lease not held"))?;
        q.remove(pos);
        Ok(())
    }

    async fn nack(&self, kind: QueueKind, token: &str, delay: Duration) -> Result<(), ProviderError> {
        let mut q = self.queue(kind).lock().await;
        let pos = q
            .iter()
            .position(|e| matches!(&e.lease, Some((t, _)) if t == token))
            .ok_or_else(|| ProviderError::not_found("nack", "lease not held"))?;
        // back of the line so other ready items are not starved
        let mut entry = q.remove(pos);
        entry.lease = None;
        entry.visible_at = Instant::now() + delay;
        q.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    fn started() -> Event {
        Event::new(
            1,
            None,
            0,
            EventKind::OrchestratorStarted {
                workflow_type: "W".into(),
                version: "1.0.0".into(),
                input: String::new(),
                parent_instance: None,
                parent_id: None,
            },
        )
    }

    fn start_item(id: &str) -> WorkItem {
        WorkItem::StartOrchestration { instance: id.into() }
    }

    #[tokio::test]
    async fn create_instance_rejects_duplicates() {
        let p = InMemoryProvider::default();
        p.create_instance(InstanceRecord::new("a", "W", "")).await.unwrap();
        let err = p.create_instance(InstanceRecord::new("a", "W", "")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn append_enforces_expected_version() {
        let p = InMemoryProvider::default();
        p.create_instance(InstanceRecord::new("a", "W", "")).await.unwrap();
        p.append("a", 1, 0, vec![started()]).await.unwrap();
        let err = p.append("a", 1, 0, vec![started()]).await.unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(p.read("a", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn generations_are_isolated() {
        let p = InMemoryProvider::default();
        p.create_instance(InstanceRecord::new("a", "W", "")).await.unwrap();
        p.append("a", 1, 0, vec![started()]).await.unwrap();
        p.append("a", 2, 0, vec![started()]).await.unwrap();
        assert_eq!(p.read("a", 1).await.unwrap().len(), 1);
        assert_eq!(p.read("a", 2).await.unwrap().len(), 1);
        assert!(p.read("a", 3).await.unwrap().is_empty());
        assert!(p.append("a", 4, 0, vec![started()]).await.is_err());
    }

    #[tokio::test]
    async fn purge_removes_instance() {
        let p = InMemoryProvider::default();
        p.create_instance(InstanceRecord::new("a", "W", "")).await.unwrap();
        p.purge("a").await.unwrap();
        assert!(p.read_instance("a").await.unwrap().is_none());
        assert!(p.purge("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn leased_items_are_invisible_until_ack_or_nack() {
        let p = InMemoryProvider::default();
        p.enqueue(QueueKind::Orchestrator, start_item("a"), Duration::ZERO).await.unwrap();
        let lease = p
            .dequeue_with_lease(QueueKind::Orchestrator, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.delivery_count, 1);
        assert!(!lease.redelivered);
        assert!(p
            .dequeue_with_lease(QueueKind::Orchestrator, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        p.nack(QueueKind::Orchestrator, &lease.token, Duration::ZERO).await.unwrap();
        let again = p
            .dequeue_with_lease(QueueKind::Orchestrator, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.delivery_count, 2);
        // a deliberate nack is not a crash
        assert!(!again.redelivered);
        p.ack(QueueKind::Orchestrator, &again.token).await.unwrap();
        assert_eq!(p.queue_depth(QueueKind::Orchestrator).await, 0);
        assert!(p.ack(QueueKind::Orchestrator, &again.token).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_items_become_visible_later() {
        let p = InMemoryProvider::default();
        p.enqueue(QueueKind::Worker, start_item("a"), Duration::from_secs(5)).await.unwrap();
        assert!(p
            .dequeue_with_lease(QueueKind::Worker, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(p
            .dequeue_with_lease(QueueKind::Worker, Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered() {
        let p = InMemoryProvider::default();
        p.enqueue(QueueKind::Worker, start_item("a"), Duration::ZERO).await.unwrap();
        let first = p
            .dequeue_with_lease(QueueKind::Worker, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        p.renew_lease(QueueKind::Worker, &first.token, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(p
            .dequeue_with_lease(QueueKind::Worker, Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());
        tokio::time::advance(Duration::from_millis(600)).await;
        let second = p
            .dequeue_with_lease(QueueKind::Worker, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.delivery_count, 2);
        assert!(second.redelivered);
        // the stale token no longer owns the item
        assert!(p.ack(QueueKind::Worker, &first.token).await.is_err());
    }
}

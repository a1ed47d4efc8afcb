use crate::domain::bundle::{DurableId, Entry};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::warn;

/// State of one entry's durable identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Pending,
    Resolved(DurableId),
    /// The entry settled without producing an identifier.
    Failed,
}

impl Resolution {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Request-scoped map from transient `fullUrl` to durable identifier.
///
/// Each entry index owns one `watch` slot. Only the task processing that entry
/// settles it, and only once; any number of dependents can await it.
#[derive(Debug)]
pub struct ResolutionTable {
    slots: Vec<watch::Sender<Resolution>>,
    owners: HashMap<String, usize>,
}

impl ResolutionTable {
    pub fn new(entries: &[Entry]) -> Self {
        let slots = entries
            .iter()
            .map(|_| watch::Sender::new(Resolution::Pending))
            .collect();
        let owners = entries
            .iter()
            .filter_map(|entry| entry.full_url.clone().map(|url| (url, entry.index)))
            .collect();
        Self { slots, owners }
    }

    /// Records the final state of entry `index` and wakes its dependents.
    /// A slot settles once; later calls are ignored.
    pub fn settle(&self, index: usize, resolution: Resolution) {
        let Some(slot) = self.slots.get(index) else {
            warn!(index, "Settle for unknown entry ignored");
            return;
        };
        let changed = slot.send_if_modified(|current| {
            if current.is_settled() || !resolution.is_settled() {
                return false;
            }
            *current = resolution;
            true
        });
        if !changed {
            warn!(index, "Entry already settled");
        }
    }

    /// Waits until entry `index` has settled.
    pub async fn wait(&self, index: usize) -> Resolution {
        let Some(slot) = self.slots.get(index) else {
            return Resolution::Failed;
        };
        let mut receiver = slot.subscribe();
        match receiver.wait_for(Resolution::is_settled).await {
            Ok(resolution) => resolution.clone(),
            Err(_) => Resolution::Failed,
        }
    }

    pub fn get(&self, index: usize) -> Resolution {
        self.slots
            .get(index)
            .map(|slot| slot.borrow().clone())
            .unwrap_or(Resolution::Failed)
    }

    pub fn owner_of(&self, full_url: &str) -> Option<usize> {
        self.owners.get(full_url).copied()
    }

    /// The durable identifier behind a transient `fullUrl`, once resolved.
    pub fn resolved(&self, full_url: &str) -> Option<DurableId> {
        match self.get(self.owner_of(full_url)?) {
            Resolution::Resolved(id) => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bundle::{EntryRequest, Method};
    use std::sync::Arc;
    use std::time::Duration;

    fn entries(urls: &[&str]) -> Vec<Entry> {
        urls.iter()
            .enumerate()
            .map(|(index, url)| Entry {
                index,
                full_url: Some(url.to_string()),
                resource: None,
                request: EntryRequest {
                    method: Method::Delete,
                    url: "Patient/1".to_string(),
                },
            })
            .collect()
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_settle() {
        let table = Arc::new(ResolutionTable::new(&entries(&["urn:uuid:a", "urn:uuid:b"])));

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        table.settle(0, Resolution::Resolved(DurableId::new("Patient", "p1")));
        let resolution = waiter.await.unwrap();
        assert_eq!(resolution, Resolution::Resolved(DurableId::new("Patient", "p1")));
        assert_eq!(
            table.resolved("urn:uuid:a"),
            Some(DurableId::new("Patient", "p1"))
        );
        assert_eq!(table.resolved("urn:uuid:b"), None);
    }

    #[tokio::test]
    async fn test_wait_after_settle_returns_immediately() {
        let table = ResolutionTable::new(&entries(&["urn:uuid:a"]));
        table.settle(0, Resolution::Failed);
        assert_eq!(table.wait(0).await, Resolution::Failed);
    }

    #[test]
    fn test_slot_settles_once() {
        let table = ResolutionTable::new(&entries(&["urn:uuid:a"]));
        table.settle(0, Resolution::Failed);
        table.settle(0, Resolution::Resolved(DurableId::new("Patient", "p1")));
        assert_eq!(table.get(0), Resolution::Failed);
        assert_eq!(table.owner_of("urn:uuid:a"), Some(0));
        assert_eq!(table.owner_of("urn:uuid:z"), None);
    }
}

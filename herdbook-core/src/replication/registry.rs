use std::sync::Arc;

use super::Replicator;

/// Replicators by collection name, in registration order.
#[derive(Clone, Default)]
pub struct ReplicationRegistry {
    handles: Vec<(String, Arc<dyn Replicator>)>,
}

impl ReplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a replicator. Registering a collection again replaces the old
    /// one in place.
    pub fn register(&mut self, replicator: Arc<dyn Replicator>) {
        let name = replicator.collection().to_string();
        match self.handles.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = replicator,
            None => {
                tracing::debug!(collection = %name, "replication registered");
                self.handles.push((name, replicator));
            }
        }
    }

    pub fn get(&self, collection: &str) -> Option<Arc<dyn Replicator>> {
        self.handles
            .iter()
            .find(|(n, _)| n == collection)
            .map(|(_, h)| h.clone())
    }

    pub fn names(&self) -> Vec<&str> {
        self.handles.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Replicator>)> {
        self.handles.iter().map(|(n, h)| (n.as_str(), h))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

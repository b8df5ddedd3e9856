use crate::download::entity::Download;
use crate::download::types::{EntityId, Entry, QueuePosition};
use std::collections::HashMap;

/// Ordered download queue.
///
/// Entities live in an id-keyed arena; the order is a separate list of ids. Positions are plain
/// indices into that list, so inserting at a cursor never invalidates ids held elsewhere.
#[derive(Debug, Default)]
pub struct DownloadQueue {
    order: Vec<EntityId>,
    items: HashMap<EntityId, Download>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn position(&self, id: EntityId) -> Option<usize> {
        self.order.iter().position(|x| *x == id)
    }

    pub fn id_at(&self, index: usize) -> Option<EntityId> {
        self.order.get(index).copied()
    }

    pub fn get(&self, id: EntityId) -> Option<&Download> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Download> {
        self.items.get_mut(&id)
    }

    /// Inserts and returns the index the entity landed at. Out-of-range positions append.
    pub fn insert(&mut self, position: QueuePosition, download: Download) -> usize {
        let id = download.id();
        debug_assert!(!self.items.contains_key(&id), "entity id reused: {id}");
        let index = match position {
            QueuePosition::End => self.order.len(),
            QueuePosition::At(i) => i.min(self.order.len()),
        };
        self.order.insert(index, id);
        self.items.insert(id, download);
        index
    }

    /// Removes the entity and returns it with the index it occupied.
    pub fn remove(&mut self, id: EntityId) -> Option<(usize, Download)> {
        let index = self.position(id)?;
        self.order.remove(index);
        let download = self.items.remove(&id)?;
        Some((index, download))
    }

    pub fn contains_target(&self, entry: &Entry) -> bool {
        self.items.values().any(|d| d.entry().same_target(entry))
    }

    /// Snapshot of the current order. Scans walk this so they may mutate the queue.
    pub fn ids(&self) -> Vec<EntityId> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Download> + '_ {
        self.order.iter().filter_map(|id| self.items.get(id))
    }
}

//! Ordered, id-keyed peer collection backing the tray's peer list.
//!
//! Records are held behind `Arc` so an unchanged peer keeps the same instance
//! across polls. A list widget can compare pointers and skip re-rendering rows.
//! Every mutator reports what it did as a [`ListChange`] (or `None` when the
//! call was a no-op); the engine turns those into notifications.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::PeerRecord;

/// A contiguous edit: `removed` entries at `position` replaced by `added` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListChange {
    pub position: usize,
    pub removed: usize,
    pub added: usize,
}

impl ListChange {
    fn new(position: usize, removed: usize, added: usize) -> Self {
        Self {
            position,
            removed,
            added,
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    records: Vec<Arc<PeerRecord>>,
    index: HashMap<String, usize>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<Arc<PeerRecord>> {
        self.index.get(id).map(|&position| Arc::clone(&self.records[position]))
    }

    pub fn at(&self, position: usize) -> Option<Arc<PeerRecord>> {
        self.records.get(position).cloned()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Peers in current order. Each call starts from the front.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PeerRecord>> + '_ {
        self.records.iter()
    }

    /// Replaces the whole list, reusing held instances for unchanged peers.
    ///
    /// Emits one change covering the full range only when the length differs or
    /// some position now holds a different instance. Duplicate ids in `incoming`
    /// keep their first occurrence.
    pub fn replace_all<I>(&mut self, incoming: I) -> Option<ListChange>
    where
        I: IntoIterator<Item = PeerRecord>,
    {
        let mut records: Vec<Arc<PeerRecord>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for record in incoming {
            if index.contains_key(&record.id) {
                tracing::warn!(id = %record.id, "Dropping duplicate peer id");
                continue;
            }
            let kept = match self.find(&record.id) {
                Some(existing) if *existing == record => existing,
                _ => Arc::new(record),
            };
            index.insert(kept.id.clone(), records.len());
            records.push(kept);
        }

        let unchanged = records.len() == self.records.len()
            && records
                .iter()
                .zip(&self.records)
                .all(|(new, old)| Arc::ptr_eq(new, old));
        if unchanged {
            return None;
        }

        let change = ListChange::new(0, self.records.len(), records.len());
        self.records = records;
        self.index = index;
        Some(change)
    }

    /// Appends a new peer or replaces a changed one in place.
    pub fn upsert(&mut self, record: PeerRecord) -> Option<ListChange> {
        match self.index.get(&record.id) {
            Some(&position) if *self.records[position] == record => None,
            Some(&position) => {
                self.records[position] = Arc::new(record);
                Some(ListChange::new(position, 1, 1))
            }
            None => {
                let position = self.records.len();
                self.index.insert(record.id.clone(), position);
                self.records.push(Arc::new(record));
                Some(ListChange::new(position, 0, 1))
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ListChange> {
        let position = self.index.remove(id)?;
        self.records.remove(position);
        for record in &self.records[position..] {
            if let Some(slot) = self.index.get_mut(&record.id) {
                *slot -= 1;
            }
        }
        Some(ListChange::new(position, 1, 0))
    }

    /// Drops entries past `new_len`.
    pub fn truncate(&mut self, new_len: usize) -> Option<ListChange> {
        if new_len >= self.records.len() {
            return None;
        }
        let removed = self.records.len() - new_len;
        for record in self.records.drain(new_len..) {
            self.index.remove(&record.id);
        }
        Some(ListChange::new(new_len, removed, 0))
    }

    pub fn clear(&mut self) -> Option<ListChange> {
        self.truncate(0)
    }

    /// Snapshot of the current records, for handing to consumers outside a lock.
    pub fn to_vec(&self) -> Vec<Arc<PeerRecord>> {
        self.records.clone()
    }

    #[cfg(test)]
    fn index_is_consistent(&self) -> bool {
        self.index.len() == self.records.len()
            && self
                .records
                .iter()
                .enumerate()
                .all(|(position, record)| self.index.get(&record.id) == Some(&position))
    }
}

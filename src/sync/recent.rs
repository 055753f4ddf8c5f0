use std::collections::VecDeque;

use serde::Serialize;

/// Bounded list, most recent first, holding at most one entry per key.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct RecentList<T> {
    entries: VecDeque<T>,
    #[serde(skip)]
    capacity: usize,
}

pub trait Keyed {
    type Key: PartialEq;

    fn key(&self) -> Self::Key;
}

impl<T: Keyed> RecentList<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Puts `entry` at the front, replacing any older entry with the same key.
    pub fn push(&mut self, entry: T) {
        let key = entry.key();
        self.entries.retain(|existing| existing.key() != key);
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.entries.iter().cloned().collect()
    }
}

impl Keyed for String {
    type Key = String;

    fn key(&self) -> String {
        self.trim().to_lowercase()
    }
}

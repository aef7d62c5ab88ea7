use std::collections::{HashSet, VecDeque};

/// Bounded set of recently seen update ids.
///
/// When an insert pushes the set past `capacity`, only the `retain` most
/// recently inserted ids are kept.
#[derive(Debug)]
pub struct DedupSet {
    capacity: usize,
    retain: usize,
    ids: HashSet<i64>,
    order: VecDeque<i64>,
}

impl DedupSet {
    /// `retain` is clamped to `capacity`.
    #[must_use]
    pub fn new(capacity: usize, retain: usize) -> Self {
        Self {
            capacity,
            retain: retain.min(capacity),
            ids: HashSet::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
        }
    }

    #[must_use]
    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: i64) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            self.trim_to(self.retain);
        }
        true
    }

    /// Forget `id`. Returns `false` if it was not present.
    pub fn remove(&mut self, id: i64) -> bool {
        if !self.ids.remove(&id) {
            return false;
        }
        if let Some(pos) = self.order.iter().rposition(|&seen| seen == id) {
            self.order.remove(pos);
        }
        true
    }

    /// Drop all but the `keep` most recent ids.
    pub fn trim_to(&mut self, keep: usize) {
        while self.order.len() > keep {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.ids.shrink_to(self.capacity);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn retain_target(&self) -> usize {
        self.retain
    }
}

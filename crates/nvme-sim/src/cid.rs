use std::collections::{BTreeSet, HashMap};

/// Command identifiers currently in flight, per submission queue.
#[derive(Debug, Default)]
pub struct CommandIdTracker {
    outstanding: HashMap<u16, BTreeSet<u16>>,
}

impl CommandIdTracker {
    /// Marks `cid` as in flight on `sqid`. Returns `false` if it already was.
    pub fn admit(&mut self, sqid: u16, cid: u16) -> bool {
        self.outstanding.entry(sqid).or_default().insert(cid)
    }

    /// Retires `cid` on `sqid`. Returns `false` for an unknown pair.
    pub fn retire(&mut self, sqid: u16, cid: u16) -> bool {
        let Some(set) = self.outstanding.get_mut(&sqid) else {
            return false;
        };
        let removed = set.remove(&cid);
        if set.is_empty() {
            self.outstanding.remove(&sqid);
        }
        removed
    }

    pub fn is_outstanding(&self, sqid: u16, cid: u16) -> bool {
        self.outstanding
            .get(&sqid)
            .is_some_and(|set| set.contains(&cid))
    }

    pub fn outstanding(&self, sqid: u16) -> Vec<u16> {
        self.outstanding
            .get(&sqid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear_queue(&mut self, sqid: u16) {
        self.outstanding.remove(&sqid);
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_rejected_until_retired() {
        let mut ids = CommandIdTracker::default();
        assert!(ids.admit(1, 7));
        assert!(!ids.admit(1, 7));
        // Same cid on a different queue is independent.
        assert!(ids.admit(2, 7));

        assert!(ids.retire(1, 7));
        assert!(!ids.retire(1, 7));
        assert!(ids.admit(1, 7));
    }

    #[test]
    fn clearing_a_queue_forgets_its_ids() {
        let mut ids = CommandIdTracker::default();
        ids.admit(3, 1);
        ids.admit(3, 2);
        ids.admit(4, 1);
        assert_eq!(ids.outstanding(3), vec![1, 2]);

        ids.clear_queue(3);
        assert!(ids.outstanding(3).is_empty());
        assert!(ids.is_outstanding(4, 1));

        ids.clear();
        assert!(!ids.is_outstanding(4, 1));
    }
}

use std::collections::BTreeMap;

use crate::command::{COMMAND_SIZE, COMPLETION_SIZE};

/// Queue id of the admin submission/completion pair.
pub const ADMIN_QUEUE_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Submission { cqid: u16 },
    Completion,
}

/// A fixed-depth ring living in host memory.
///
/// For submission queues `tail` is the last tail doorbell value the controller observed and
/// `head` the next slot to fetch. For completion queues `tail` is the next slot to post into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub id: u16,
    pub kind: QueueKind,
    pub depth: u16,
    pub base: u64,
    pub head: u16,
    pub tail: u16,
    /// Phase tag; only meaningful for completion queues.
    pub phase: bool,
}

impl Queue {
    pub fn submission(id: u16, depth: u16, base: u64, cqid: u16) -> Self {
        Queue {
            id,
            kind: QueueKind::Submission { cqid },
            depth,
            base,
            head: 0,
            tail: 0,
            phase: false,
        }
    }

    pub fn completion(id: u16, depth: u16, base: u64) -> Self {
        Queue {
            id,
            kind: QueueKind::Completion,
            depth,
            base,
            head: 0,
            tail: 0,
            phase: false,
        }
    }

    pub fn paired_completion_queue(&self) -> Option<u16> {
        match self.kind {
            QueueKind::Submission { cqid } => Some(cqid),
            QueueKind::Completion => None,
        }
    }

    fn entry_size(&self) -> u64 {
        match self.kind {
            QueueKind::Submission { .. } => COMMAND_SIZE as u64,
            QueueKind::Completion => COMPLETION_SIZE as u64,
        }
    }

    /// Host physical address of ring slot `index`.
    pub fn slot_address(&self, index: u16) -> u64 {
        self.base + index as u64 * self.entry_size()
    }

    pub fn next_index(&self, index: u16) -> u16 {
        if index + 1 >= self.depth {
            0
        } else {
            index + 1
        }
    }

    /// Entries a host can hold unread before the ring is full (one slot always stays empty).
    pub fn capacity(&self) -> usize {
        (self.depth as usize).saturating_sub(1)
    }

    /// Advances the completion tail by one slot, flipping the phase tag when the tail wraps back
    /// to slot 0. Returns the slot that was posted into.
    pub fn advance_completion_tail(&mut self) -> u16 {
        let slot = self.tail;
        self.tail = self.next_index(slot);
        if self.tail == 0 {
            self.phase = !self.phase;
        }
        slot
    }
}

/// Owning collections of the currently valid submission and completion queues.
#[derive(Debug, Default)]
pub struct QueueArena {
    submission: BTreeMap<u16, Queue>,
    completion: BTreeMap<u16, Queue>,
}

impl QueueArena {
    pub fn insert(&mut self, queue: Queue) -> Option<Queue> {
        match queue.kind {
            QueueKind::Submission { .. } => self.submission.insert(queue.id, queue),
            QueueKind::Completion => self.completion.insert(queue.id, queue),
        }
    }

    pub fn submission(&self, id: u16) -> Option<&Queue> {
        self.submission.get(&id)
    }

    pub fn submission_mut(&mut self, id: u16) -> Option<&mut Queue> {
        self.submission.get_mut(&id)
    }

    pub fn completion(&self, id: u16) -> Option<&Queue> {
        self.completion.get(&id)
    }

    pub fn completion_mut(&mut self, id: u16) -> Option<&mut Queue> {
        self.completion.get_mut(&id)
    }

    pub fn remove_submission(&mut self, id: u16) -> Option<Queue> {
        self.submission.remove(&id)
    }

    pub fn remove_completion(&mut self, id: u16) -> Option<Queue> {
        self.completion.remove(&id)
    }

    /// Valid submission queue ids in ascending order.
    pub fn submission_ids(&self) -> Vec<u16> {
        self.submission.keys().copied().collect()
    }

    pub fn completion_ids(&self) -> Vec<u16> {
        self.completion.keys().copied().collect()
    }

    /// True if any submission queue posts into completion queue `cqid`.
    pub fn completion_queue_in_use(&self, cqid: u16) -> bool {
        self.submission
            .values()
            .any(|sq| sq.paired_completion_queue() == Some(cqid))
    }

    /// Drops every I/O queue, submission queues first so that no submission queue is ever left
    /// referencing a missing completion queue. Returns the removed submission queue ids.
    pub fn clear_io_queues(&mut self) -> Vec<u16> {
        let sq_ids: Vec<u16> = self
            .submission
            .keys()
            .copied()
            .filter(|&id| id != ADMIN_QUEUE_ID)
            .collect();
        for id in &sq_ids {
            self.submission.remove(id);
        }
        self.completion.retain(|&id, _| id == ADMIN_QUEUE_ID);
        sq_ids
    }
}

//! LRU queue of released blocks that still hold cached content

use tessera_types::BlockId;

/// Intrusive doubly linked list over block ids.
///
/// Front is the least recently released block. Push, pop and removal from the
/// middle (a cache hit on a released block) are all O(1).
#[derive(Debug, Clone)]
pub(crate) struct EvictionQueue {
    prev: Vec<Option<BlockId>>,
    next: Vec<Option<BlockId>>,
    linked: Vec<bool>,
    head: Option<BlockId>,
    tail: Option<BlockId>,
    len: usize,
}

impl EvictionQueue {
    pub(crate) fn new(num_blocks: usize) -> Self {
        Self {
            prev: vec![None; num_blocks],
            next: vec![None; num_blocks],
            linked: vec![false; num_blocks],
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn contains(&self, id: BlockId) -> bool {
        self.linked.get(id as usize).copied().unwrap_or(false)
    }

    pub(crate) fn push_back(&mut self, id: BlockId) {
        if self.contains(id) {
            return;
        }
        let i = id as usize;
        self.prev[i] = self.tail;
        self.next[i] = None;
        match self.tail {
            Some(tail) => self.next[tail as usize] = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.linked[i] = true;
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<BlockId> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    /// Unlink `id`; returns false if it was not queued
    pub(crate) fn remove(&mut self, id: BlockId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let i = id as usize;
        let (prev, next) = (self.prev[i], self.next[i]);
        match prev {
            Some(p) => self.next[p as usize] = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.prev[n as usize] = prev,
            None => self.tail = prev,
        }
        self.prev[i] = None;
        self.next[i] = None;
        self.linked[i] = false;
        self.len -= 1;
        true
    }

    /// Empty the queue, oldest first
    pub(crate) fn drain(&mut self) -> Vec<BlockId> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(id) = self.pop_front() {
            out.push(id);
        }
        out
    }
}

//! Index-linked arena holding the four cache lists.
//!
//! Every entry lives in one slab slot and is linked into exactly one of
//! the four lists. Links are slot indices, so moving an entry between lists
//! or to the head of its list is O(1) without pointers. Each list tracks
//! its length and the byte size of its members.
//!
//! Heads hold the most recently used entries; victims come off the tail.

use std::fmt;

/// Slot index of an entry in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryIdx(u32);

/// The four lists of the adaptive cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListId {
    /// Resident, seen once recently.
    Mru,
    /// Resident, seen at least twice.
    Mfu,
    /// Evicted from `Mru`; key and size only.
    MruGhost,
    /// Evicted from `Mfu`; key and size only.
    MfuGhost,
}

impl ListId {
    const fn slot(self) -> usize {
        match self {
            Self::Mru => 0,
            Self::Mfu => 1,
            Self::MruGhost => 2,
            Self::MfuGhost => 3,
        }
    }

    #[must_use]
    pub const fn is_ghost(self) -> bool {
        matches!(self, Self::MruGhost | Self::MfuGhost)
    }

    /// Ghost list an entry of this resident list falls into on eviction.
    #[must_use]
    pub const fn ghost(self) -> Self {
        match self {
            Self::Mru | Self::MruGhost => Self::MruGhost,
            Self::Mfu | Self::MfuGhost => Self::MfuGhost,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mru => "mru",
            Self::Mfu => "mfu",
            Self::MruGhost => "mru_ghost",
            Self::MfuGhost => "mfu_ghost",
        }
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ListHead {
    head: Option<EntryIdx>,
    tail: Option<EntryIdx>,
    len: usize,
    bytes: u64,
}

struct Node<T> {
    value: T,
    size: u64,
    list: ListId,
    prev: Option<EntryIdx>,
    next: Option<EntryIdx>,
}

pub(crate) struct Arena<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<u32>,
    lists: [ListHead; 4],
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            lists: [ListHead::default(); 4],
        }
    }

    pub(crate) fn len(&self, list: ListId) -> usize {
        self.lists[list.slot()].len
    }

    pub(crate) fn bytes(&self, list: ListId) -> u64 {
        self.lists[list.slot()].bytes
    }

    pub(crate) fn tail(&self, list: ListId) -> Option<EntryIdx> {
        self.lists[list.slot()].tail
    }

    pub(crate) fn get(&self, idx: EntryIdx) -> Option<&T> {
        self.node(idx).map(|n| &n.value)
    }

    pub(crate) fn get_mut(&mut self, idx: EntryIdx) -> Option<&mut T> {
        self.node_mut(idx).map(|n| &mut n.value)
    }

    pub(crate) fn list_of(&self, idx: EntryIdx) -> Option<ListId> {
        self.node(idx).map(|n| n.list)
    }

    pub(crate) fn size_of(&self, idx: EntryIdx) -> Option<u64> {
        self.node(idx).map(|n| n.size)
    }

    /// Link a new entry at the head of `list`.
    pub(crate) fn push_head(&mut self, list: ListId, size: u64, value: T) -> EntryIdx {
        let node = Node {
            value,
            size,
            list,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(raw) => {
                self.slots[raw as usize] = Some(node);
                EntryIdx(raw)
            }
            None => {
                // More than u32::MAX live entries cannot fit in memory anyway.
                let raw = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
                self.slots.push(Some(node));
                EntryIdx(raw)
            }
        };
        self.link_head(idx);
        idx
    }

    /// Unlink and free an entry, returning its value.
    pub(crate) fn remove(&mut self, idx: EntryIdx) -> Option<T> {
        self.unlink(idx)?;
        let node = self.slots.get_mut(idx.0 as usize)?.take()?;
        self.free.push(idx.0);
        Some(node.value)
    }

    /// Move an entry to the head of `list` (which may be its current list).
    pub(crate) fn move_to_head(&mut self, idx: EntryIdx, list: ListId) {
        if self.unlink(idx).is_none() {
            return;
        }
        if let Some(node) = self.node_mut(idx) {
            node.list = list;
        }
        self.link_head(idx);
    }

    /// Entries of `list` from tail (least recent) to head.
    pub(crate) fn iter_from_tail(&self, list: ListId) -> TailIter<'_, T> {
        TailIter {
            arena: self,
            cursor: self.lists[list.slot()].tail,
        }
    }

    fn node(&self, idx: EntryIdx) -> Option<&Node<T>> {
        self.slots.get(idx.0 as usize)?.as_ref()
    }

    fn node_mut(&mut self, idx: EntryIdx) -> Option<&mut Node<T>> {
        self.slots.get_mut(idx.0 as usize)?.as_mut()
    }

    fn link_head(&mut self, idx: EntryIdx) {
        let Some((list, size)) = self.node(idx).map(|n| (n.list, n.size)) else {
            return;
        };
        let old_head = self.lists[list.slot()].head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head.and_then(|h| self.node_mut(h)) {
            Some(head) => head.prev = Some(idx),
            None => self.lists[list.slot()].tail = Some(idx),
        }
        let head = &mut self.lists[list.slot()];
        head.head = Some(idx);
        head.len += 1;
        head.bytes += size;
    }

    fn unlink(&mut self, idx: EntryIdx) -> Option<()> {
        let (list, size, prev, next) = self.node(idx).map(|n| (n.list, n.size, n.prev, n.next))?;
        match prev.and_then(|p| self.node_mut(p)) {
            Some(p) => p.next = next,
            None => self.lists[list.slot()].head = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.lists[list.slot()].tail = prev,
        }
        let head = &mut self.lists[list.slot()];
        head.len -= 1;
        head.bytes -= size;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
        Some(())
    }
}

pub(crate) struct TailIter<'a, T> {
    arena: &'a Arena<T>,
    cursor: Option<EntryIdx>,
}

impl<'a, T> Iterator for TailIter<'a, T> {
    type Item = (EntryIdx, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.arena.node(idx)?;
        self.cursor = node.prev;
        Some((idx, &node.value))
    }
}

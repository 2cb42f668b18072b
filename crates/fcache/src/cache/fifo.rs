//! Eviction-ordered list for private (per-thread) caches.
//!
//! Empty placeholders are kept at the front, live fragments follow in
//! insertion order; the head of the list is always the next eviction
//! victim once the empty run is exhausted.

use crate::fragment::FragmentId;
use crate::memory::UnitId;

/// Opaque handle to a node in a [`Fifo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FifoNodeId(u32, u32);

enum NodeKind {
    Live(FragmentId),
    Empty { unit: UnitId, offset: usize, size: usize },
}

struct Node {
    kind: NodeKind,
    next: Option<FifoNodeId>,
    prev: Option<FifoNodeId>,
}

/// Doubly-linked eviction list: empty holes at the front, live fragments
/// behind them in insertion order.
#[derive(Default)]
pub struct Fifo {
    slab: Vec<Option<Node>>,
    generations: Vec<u32>,
    free_slots: Vec<u32>,
    head: Option<FifoNodeId>,
    tail: Option<FifoNodeId>,
    /// The last empty node, i.e. the boundary between the empty run at
    /// the front and the live fragments that follow.
    last_empty: Option<FifoNodeId>,
}

impl Fifo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, node: Node) -> FifoNodeId {
        if let Some(index) = self.free_slots.pop() {
            let generation = self.generations[index as usize];
            self.slab[index as usize] = Some(node);
            FifoNodeId(index, generation)
        } else {
            let index = u32::try_from(self.slab.len()).expect("fifo node count fits in u32");
            self.generations.push(0);
            self.slab.push(Some(node));
            FifoNodeId(index, 0)
        }
    }

    fn node(&self, id: FifoNodeId) -> &Node {
        assert_eq!(self.generations[id.0 as usize], id.1, "stale FifoNodeId");
        self.slab[id.0 as usize].as_ref().expect("dangling FifoNodeId")
    }

    fn node_mut(&mut self, id: FifoNodeId) -> &mut Node {
        assert_eq!(self.generations[id.0 as usize], id.1, "stale FifoNodeId");
        self.slab[id.0 as usize].as_mut().expect("dangling FifoNodeId")
    }

    fn link_at_tail(&mut self, id: FifoNodeId) {
        let old_tail = self.tail;
        self.node_mut(id).prev = old_tail;
        self.node_mut(id).next = None;
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn link_at_front(&mut self, id: FifoNodeId) {
        let old_head = self.head;
        self.node_mut(id).next = old_head;
        self.node_mut(id).prev = None;
        match old_head {
            Some(h) => self.node_mut(h).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
    }

    fn unlink(&mut self, id: FifoNodeId) {
        let (next, prev) = {
            let n = self.node(id);
            (n.next, n.prev)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        if self.last_empty == Some(id) {
            self.last_empty = prev.filter(|&p| matches!(self.node(p).kind, NodeKind::Empty { .. }));
        }
    }

    fn free(&mut self, id: FifoNodeId) {
        self.generations[id.0 as usize] = self.generations[id.0 as usize].wrapping_add(1);
        self.slab[id.0 as usize] = None;
        self.free_slots.push(id.0);
    }

    /// Appends a live fragment to the tail.
    pub fn append(&mut self, fragment: FragmentId) -> FifoNodeId {
        let id = self.alloc(Node {
            kind: NodeKind::Live(fragment),
            next: None,
            prev: None,
        });
        self.link_at_tail(id);
        id
    }

    /// Removes `id` (a live fragment node) from the list entirely.
    pub fn remove(&mut self, id: FifoNodeId) {
        self.unlink(id);
        self.free(id);
    }

    /// Prepends an empty-slot placeholder, merging with the current front
    /// empty node if it is physically adjacent in the same unit.
    pub fn prepend_empty(&mut self, unit: UnitId, offset: usize, size: usize) -> FifoNodeId {
        if let Some(front) = self.head {
            if let NodeKind::Empty {
                unit: front_unit,
                offset: front_offset,
                size: front_size,
            } = self.node(front).kind
            {
                if front_unit == unit && offset + size == front_offset {
                    self.node_mut(front).kind = NodeKind::Empty {
                        unit,
                        offset,
                        size: size + front_size,
                    };
                    return front;
                }
                if front_unit == unit && front_offset + front_size == offset {
                    self.node_mut(front).kind = NodeKind::Empty {
                        unit,
                        offset: front_offset,
                        size: size + front_size,
                    };
                    return front;
                }
            }
        }
        let id = self.alloc(Node {
            kind: NodeKind::Empty { unit, offset, size },
            next: None,
            prev: None,
        });
        self.link_at_front(id);
        self.last_empty = Some(id);
        id
    }

    /// Removes an empty-slot node (consumed by a placement).
    pub fn remove_empty(&mut self, id: FifoNodeId) {
        self.unlink(id);
        self.free(id);
    }

    #[must_use]
    pub fn head(&self) -> Option<FifoNodeId> {
        self.head
    }

    /// The last node still in the leading empty-slot run, i.e. the
    /// boundary `Placer::place` step 2 stops its empty-slot-fit walk at.
    #[must_use]
    pub fn last_empty(&self) -> Option<FifoNodeId> {
        self.last_empty
    }

    #[must_use]
    pub fn next(&self, id: FifoNodeId) -> Option<FifoNodeId> {
        self.node(id).next
    }

    /// Whether `id` names a live fragment and, if so, which one.
    #[must_use]
    pub fn fragment_at(&self, id: FifoNodeId) -> Option<FragmentId> {
        match self.node(id).kind {
            NodeKind::Live(f) => Some(f),
            NodeKind::Empty { .. } => None,
        }
    }

    /// Whether `id` names an empty placeholder and, if so, its location.
    #[must_use]
    pub fn empty_at(&self, id: FifoNodeId) -> Option<(UnitId, usize, usize)> {
        match self.node(id).kind {
            NodeKind::Empty { unit, offset, size } => Some((unit, offset, size)),
            NodeKind::Live(_) => None,
        }
    }

    /// Iterates the list from the head, for the FIFO empty-slot-fit and
    /// victim-eviction walks.
    pub fn iter_from_head(&self) -> impl Iterator<Item = FifoNodeId> + '_ {
        std::iter::successors(self.head, move |&id| self.node(id).next)
    }

    /// Finds the empty-slot node physically located at `(unit, offset)`,
    /// if any. Used when a contiguous eviction run consumes an empty
    /// placeholder and needs its node id to unlink it.
    #[must_use]
    pub fn find_empty_at(&self, unit: UnitId, offset: usize) -> Option<FifoNodeId> {
        for (index, slot) in self.slab.iter().enumerate() {
            if let Some(n) = slot {
                if let NodeKind::Empty { unit: u, offset: o, .. } = n.kind {
                    if u == unit && o == offset {
                        return Some(FifoNodeId(u32::try_from(index).unwrap(), self.generations[index]));
                    }
                }
            }
        }
        None
    }
}

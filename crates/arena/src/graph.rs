//! Breadth-first flattening of a pointer graph into a [`SerializedBlob`].
//!
//! Node layout (every field little-endian):
//!
//! | offset | field |
//! |---|---|
//! | 0 | payload length (`u32`) |
//! | 4 | child count (`u32`) |
//! | 8 | pointer to the children array, null when there are no children |
//! | 16 | pointer to the payload chunk, null when the payload is empty |
//!
//! The children array is a dense pointer array chunk registered with
//! [`RelocatableArena::record_pointer_array`]. The root is always the first
//! chunk, so it sits at offset 0 of the blob. A node reachable through
//! several parents is emitted once.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{ArenaError, ChunkHandle, POINTER_SIZE, RelocatableArena, RelocatedBlob, SerializedBlob};

const PAYLOAD_LEN_OFFSET: usize = 0;
const CHILD_COUNT_OFFSET: usize = 4;
const CHILDREN_PTR_OFFSET: usize = 8;
const PAYLOAD_PTR_OFFSET: usize = 16;
const NODE_SIZE: usize = 24;

/// A node of a graph that can be shipped across a process boundary.
pub trait GraphNode {
    /// Bytes stored verbatim for this node.
    fn payload(&self) -> Vec<u8>;

    /// Outgoing edges, in order.
    fn children(&self) -> Vec<&Self>;

    /// Identity used to emit shared nodes once. Defaults to the node address.
    fn identity(&self) -> usize {
        std::ptr::from_ref(self).addr()
    }
}

/// Flattens the graph rooted at `root` into a finalized blob.
pub fn flatten_graph<N: GraphNode>(root: &N, capacity: usize) -> Result<SerializedBlob, ArenaError> {
    let mut arena = RelocatableArena::new(capacity);
    let mut emitted: HashMap<usize, ChunkHandle> = HashMap::new();
    let mut queue: VecDeque<(&N, ChunkHandle)> = VecDeque::new();

    let root_chunk = arena.allocate(NODE_SIZE)?;
    emitted.insert(root.identity(), root_chunk);
    queue.push_back((root, root_chunk));

    while let Some((node, chunk)) = queue.pop_front() {
        let payload = node.payload();
        let children = node.children();

        arena.write_u32(chunk, PAYLOAD_LEN_OFFSET, len_u32(payload.len())?)?;
        arena.write_u32(chunk, CHILD_COUNT_OFFSET, len_u32(children.len())?)?;

        if !payload.is_empty() {
            let payload_chunk = arena.allocate_no_fixup(payload.len())?;
            arena.write_bytes(payload_chunk, 0, &payload)?;
            arena.write_pointer(chunk, PAYLOAD_PTR_OFFSET, payload_chunk, 0)?;
        }

        if children.is_empty() {
            continue;
        }
        let array = arena.allocate(children.len().saturating_mul(POINTER_SIZE))?;
        for (slot, child) in children.into_iter().enumerate() {
            let child_chunk = match emitted.get(&child.identity()) {
                Some(existing) => *existing,
                None => {
                    let fresh = arena.allocate(NODE_SIZE)?;
                    emitted.insert(child.identity(), fresh);
                    queue.push_back((child, fresh));
                    fresh
                }
            };
            arena.store_pointer(array, slot.saturating_mul(POINTER_SIZE), child_chunk, 0)?;
        }
        arena.record_pointer_array(array)?;
        arena.write_pointer(chunk, CHILDREN_PTR_OFFSET, array, 0)?;
    }

    #[cfg(debug_assertions)]
    arena.verify_all_pointers()?;

    arena.finalize()
}

fn len_u32(len: usize) -> Result<u32, ArenaError> {
    u32::try_from(len).map_err(|_| ArenaError::OutOfMemory {
        requested: len,
        available: 0,
    })
}

fn len_usize(len: u32) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX)
}

/// Read-only view over a relocated graph.
#[derive(Debug, Clone, Copy)]
pub struct GraphView<'a> {
    blob: &'a RelocatedBlob,
}

impl<'a> GraphView<'a> {
    pub fn new(blob: &'a RelocatedBlob) -> Self {
        Self { blob }
    }

    pub fn root(&self) -> Result<NodeView<'a>, ArenaError> {
        NodeView::at(self.blob, 0)
    }

    /// Visits every node reachable from the root, following live pointers.
    ///
    /// Returns the number of distinct nodes. Fails on the first pointer that
    /// does not resolve inside the blob.
    pub fn walk(&self) -> Result<usize, ArenaError> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.root()?]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.offset) {
                continue;
            }
            node.payload()?;
            queue.extend(node.children()?);
        }
        Ok(seen.len())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    blob: &'a RelocatedBlob,
    offset: usize,
}

impl<'a> NodeView<'a> {
    fn at(blob: &'a RelocatedBlob, offset: usize) -> Result<Self, ArenaError> {
        blob.slice(offset, NODE_SIZE)?;
        Ok(Self { blob, offset })
    }

    /// Offset of the node inside the blob.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn child_count(&self) -> Result<usize, ArenaError> {
        self.blob
            .read_u32(self.offset.saturating_add(CHILD_COUNT_OFFSET))
            .map(len_usize)
    }

    pub fn payload(&self) -> Result<&'a [u8], ArenaError> {
        let len = len_usize(
            self.blob
                .read_u32(self.offset.saturating_add(PAYLOAD_LEN_OFFSET))?,
        );
        match self
            .blob
            .follow(self.offset.saturating_add(PAYLOAD_PTR_OFFSET))?
        {
            Some(payload) => self.blob.slice(payload, len),
            None if len == 0 => Ok(&[]),
            None => Err(ArenaError::CorruptBlob(format!(
                "node at {} has a {len} byte payload but no payload pointer",
                self.offset
            ))),
        }
    }

    pub fn children(&self) -> Result<Vec<NodeView<'a>>, ArenaError> {
        let count = self.child_count()?;
        let Some(array) = self
            .blob
            .follow(self.offset.saturating_add(CHILDREN_PTR_OFFSET))?
        else {
            if count == 0 {
                return Ok(Vec::new());
            }
            return Err(ArenaError::CorruptBlob(format!(
                "node at {} has {count} children but no children array",
                self.offset
            )));
        };
        (0..count)
            .map(|slot| {
                let slot_offset = array.saturating_add(slot.saturating_mul(POINTER_SIZE));
                let child = self.blob.follow(slot_offset)?.ok_or_else(|| {
                    ArenaError::CorruptBlob(format!("null child slot at {slot_offset}"))
                })?;
                NodeView::at(self.blob, child)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Tree {
        label: String,
        kids: Vec<Arc<Tree>>,
    }

    impl GraphNode for Tree {
        fn payload(&self) -> Vec<u8> {
            self.label.as_bytes().to_vec()
        }

        fn children(&self) -> Vec<&Self> {
            self.kids.iter().map(AsRef::as_ref).collect()
        }
    }

    fn leaf(label: &str) -> Arc<Tree> {
        Arc::new(Tree {
            label: label.to_string(),
            kids: Vec::new(),
        })
    }

    #[test]
    fn test_flatten_single_node() {
        let root = leaf("root");
        let relocated = flatten_graph(root.as_ref(), 4096)
            .unwrap()
            .relocate()
            .unwrap();
        let view = GraphView::new(&relocated);

        let node = view.root().unwrap();
        assert_eq!(node.payload().unwrap(), b"root");
        assert!(node.children().unwrap().is_empty());
        assert_eq!(view.walk().unwrap(), 1);
    }

    #[test]
    fn test_flatten_preserves_child_order() {
        let root = Tree {
            label: "f".to_string(),
            kids: vec![leaf("a"), leaf("b"), leaf("c")],
        };
        let relocated = flatten_graph(&root, 4096).unwrap().relocate().unwrap();
        let children = GraphView::new(&relocated).root().unwrap().children().unwrap();

        let labels: Vec<&[u8]> = children.iter().map(|c| c.payload().unwrap()).collect();
        let expected: Vec<&[u8]> = vec![b"a", b"b", b"c"];
        assert_eq!(labels, expected);
    }

    #[test]
    fn test_shared_node_emitted_once() {
        let shared = leaf("shared");
        let left = Arc::new(Tree {
            label: "left".to_string(),
            kids: vec![Arc::clone(&shared)],
        });
        let right = Arc::new(Tree {
            label: "right".to_string(),
            kids: vec![Arc::clone(&shared)],
        });
        let root = Tree {
            label: "root".to_string(),
            kids: vec![left, right],
        };

        let relocated = flatten_graph(&root, 4096).unwrap().relocate().unwrap();
        let view = GraphView::new(&relocated);
        assert_eq!(view.walk().unwrap(), 4);

        let children = view.root().unwrap().children().unwrap();
        let via_left = children[0].children().unwrap()[0].offset();
        let via_right = children[1].children().unwrap()[0].offset();
        assert_eq!(via_left, via_right);
    }

    #[test]
    fn test_flatten_reports_out_of_memory() {
        let root = Tree {
            label: "x".repeat(256),
            kids: vec![leaf("a")],
        };
        let err = flatten_graph(&root, 128).unwrap_err();
        assert!(err.is_out_of_memory());
    }
}

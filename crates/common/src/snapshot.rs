//! Immutable copy of everything the compiler needs from a function.
//!
//! A snapshot is taken when the work item is created so that compilation
//! never touches live interpreter state. Inlinee snapshots form a tree that
//! is flattened with [`oopjit_arena::flatten_graph`] for transfer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use oopjit_arena::{ArenaError, GraphNode, NodeView};
use serde::{Deserialize, Serialize};

use crate::types::SourceHandle;

/// Straight-line functions below this many bytecodes are cheap enough to
/// compile speculatively.
const SPECULATIVE_STRAIGHT_LINE_LIMIT: u32 = 300;
const SPECULATIVE_LOOP_PERCENTAGE: u64 = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytecodeInfo {
    pub byte_code_count: u32,
    pub byte_code_in_loop_count: u32,
    pub byte_code_length: u32,
    pub loop_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub executed: bool,
    pub call_count: u32,
    /// Iteration count per loop, indexed by loop number.
    pub loop_iterations: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSnapshot {
    pub function: SourceHandle,
    pub display_name: String,
    pub bytecode: BytecodeInfo,
    pub profile: ProfileSnapshot,
    pub inlinees: Vec<Arc<FunctionSnapshot>>,
}

/// The per-node payload. Inlinees travel as graph edges, not inside it.
#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    function: SourceHandle,
    display_name: String,
    bytecode: BytecodeInfo,
    profile: ProfileSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Malformed snapshot graph: {0}")]
    Arena(#[from] ArenaError),
    #[error("Failed to decode snapshot record: {0}")]
    Decode(String),
    #[error("Snapshot graph has a cycle through offset {0}")]
    Cycle(usize),
}

impl FunctionSnapshot {
    pub fn new(function: SourceHandle, display_name: impl Into<String>) -> Self {
        Self {
            function,
            display_name: display_name.into(),
            bytecode: BytecodeInfo::default(),
            profile: ProfileSnapshot::default(),
            inlinees: Vec::new(),
        }
    }

    pub fn with_bytecode(mut self, bytecode: BytecodeInfo) -> Self {
        self.bytecode = bytecode;
        self
    }

    pub fn with_profile(mut self, profile: ProfileSnapshot) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_inlinee(mut self, inlinee: Arc<FunctionSnapshot>) -> Self {
        self.inlinees.push(inlinee);
        self
    }

    /// Profile-gated speculation heuristic: the function has run, and it is
    /// either dominated by loops or short enough that compiling it is cheap.
    pub fn is_loop_dominated_and_small(&self) -> bool {
        let count = u64::from(self.bytecode.byte_code_count);
        let in_loop = u64::from(self.bytecode.byte_code_in_loop_count);
        let loop_percentage = in_loop.saturating_mul(100) / count.saturating_add(1);
        let straight_line = self
            .bytecode
            .byte_code_count
            .saturating_sub(self.bytecode.byte_code_in_loop_count);

        self.profile.executed
            && (loop_percentage >= SPECULATIVE_LOOP_PERCENTAGE
                || straight_line < SPECULATIVE_STRAIGHT_LINE_LIMIT)
    }

    /// Number of snapshots in the inlining tree, this one included.
    pub fn tree_size(&self) -> usize {
        1 + self.inlinees.iter().map(|i| i.tree_size()).sum::<usize>()
    }

    /// Rebuilds a snapshot tree from a relocated graph node.
    ///
    /// Nodes shared by several parents come back as one shared `Arc`.
    pub fn from_view(view: NodeView<'_>) -> Result<Arc<Self>, SnapshotError> {
        let mut decoded = HashMap::new();
        let mut in_progress = HashSet::new();
        decode_node(view, &mut decoded, &mut in_progress)
    }

    fn record(&self) -> SnapshotRecord {
        SnapshotRecord {
            function: self.function,
            display_name: self.display_name.clone(),
            bytecode: self.bytecode.clone(),
            profile: self.profile.clone(),
        }
    }
}

fn decode_node(
    view: NodeView<'_>,
    decoded: &mut HashMap<usize, Arc<FunctionSnapshot>>,
    in_progress: &mut HashSet<usize>,
) -> Result<Arc<FunctionSnapshot>, SnapshotError> {
    if let Some(done) = decoded.get(&view.offset()) {
        return Ok(Arc::clone(done));
    }
    if !in_progress.insert(view.offset()) {
        return Err(SnapshotError::Cycle(view.offset()));
    }

    let record: SnapshotRecord = bincode::deserialize(view.payload()?)
        .map_err(|e| SnapshotError::Decode(e.to_string()))?;
    let inlinees = view
        .children()?
        .into_iter()
        .map(|child| decode_node(child, decoded, in_progress))
        .collect::<Result<Vec<_>, _>>()?;

    let snapshot = Arc::new(FunctionSnapshot {
        function: record.function,
        display_name: record.display_name,
        bytecode: record.bytecode,
        profile: record.profile,
        inlinees,
    });
    in_progress.remove(&view.offset());
    decoded.insert(view.offset(), Arc::clone(&snapshot));
    Ok(snapshot)
}

impl GraphNode for FunctionSnapshot {
    fn payload(&self) -> Vec<u8> {
        // Serializing plain owned data into a Vec cannot fail
        bincode::serialize(&self.record()).unwrap_or_default()
    }

    fn children(&self) -> Vec<&Self> {
        self.inlinees.iter().map(AsRef::as_ref).collect()
    }
}

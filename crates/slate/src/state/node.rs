use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::common::bitmap::Bitmap;
use crate::grid::Coord;
use crate::{ConfigId, NodeId, PartitionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Down,
    Unknown,
    Idle,
    Allocated,
    Drained,
    Draining,
}

impl NodeState {
    /// Projection into the `up_node_bitmap`: nodes the selector may use.
    pub fn is_up(&self) -> bool {
        matches!(self, NodeState::Idle | NodeState::Allocated | NodeState::Draining)
    }

    /// Projection into the `idle_node_bitmap`.
    pub fn is_idle(&self) -> bool {
        matches!(self, NodeState::Idle)
    }
}

bitflags! {
    /// Flags orthogonal to the node state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NodeFlags: u32 {
        const NO_RESPOND = 0b0001;
    }
}

/// Counts reported by the node itself; may be lower than the configured
/// counts in its configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounts {
    pub sockets: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
    pub real_memory: u64,
    pub tmp_disk: u64,
}

impl NodeCounts {
    pub fn cores(&self) -> u32 {
        self.sockets * self.cores_per_socket
    }

    pub fn cpus(&self) -> u32 {
        self.cores() * self.threads_per_core
    }
}

/// Configuration record shared by all nodes of identical spec.
///
/// Owns the membership bitmap; compared by weight for scheduling
/// tie-breaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub id: ConfigId,
    pub weight: u32,
    pub counts: NodeCounts,
    pub features: Vec<String>,
    pub node_bitmap: Bitmap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Empty name marks a deleted record; indices are never reused for
    /// live lookups until the name hash is rebuilt.
    pub name: String,
    pub coord: Option<Coord>,
    pub config: ConfigId,
    pub partition: Option<PartitionId>,
    pub state: NodeState,
    pub flags: NodeFlags,
    pub last_response: u64,
    pub live: NodeCounts,
    pub features: Vec<String>,
    /// Number of running jobs whose allocation includes this node.
    pub running_jobs: u32,
    /// Memory not yet promised to a job.
    pub free_memory: u64,
}

impl Node {
    pub fn is_deleted(&self) -> bool {
        self.name.is_empty()
    }
}

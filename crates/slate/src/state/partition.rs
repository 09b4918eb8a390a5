use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::bitmap::Bitmap;
use crate::{PartitionId, Priority};

/// Sharing policy of a partition. The row count bounds how many layers of
/// non-overlapping jobs may share the partition's nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedPolicy {
    No,
    Yes(u32),
    Force(u32),
}

impl SharedPolicy {
    pub fn row_count(&self) -> u32 {
        match self {
            SharedPolicy::No => 1,
            SharedPolicy::Yes(rows) | SharedPolicy::Force(rows) => (*rows).max(1),
        }
    }
}

/// One sharing layer: cores used by the jobs placed into this row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRow {
    pub core_bitmap: Bitmap,
    pub job_count: u32,
}

impl PartitionRow {
    pub fn new(total_cores: usize) -> Self {
        PartitionRow {
            core_bitmap: Bitmap::new(total_cores),
            job_count: 0,
        }
    }

    /// Row density used by the selector's row-packing pass.
    pub fn density(&self) -> usize {
        self.core_bitmap.count()
    }

    pub fn is_empty(&self) -> bool {
        self.job_count == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub name: String,
    pub priority: Priority,
    /// 0 means unlimited.
    pub max_nodes: u32,
    /// Zero duration means unlimited.
    pub max_time: Duration,
    pub shared: SharedPolicy,
    pub state_up: bool,
    pub allow_groups: Option<Vec<String>>,
    pub node_bitmap: Bitmap,
    pub rows: Vec<PartitionRow>,
}

impl Partition {
    pub fn new(
        id: PartitionId,
        name: String,
        priority: Priority,
        shared: SharedPolicy,
        node_count: usize,
        total_cores: usize,
    ) -> Self {
        Partition {
            id,
            name,
            priority,
            max_nodes: 0,
            max_time: Duration::ZERO,
            shared,
            state_up: true,
            allow_groups: None,
            node_bitmap: Bitmap::new(node_count),
            rows: (0..shared.row_count())
                .map(|_| PartitionRow::new(total_cores))
                .collect(),
        }
    }

    pub fn allows_group(&self, group: &str) -> bool {
        match &self.allow_groups {
            None => true,
            Some(groups) => groups.iter().any(|g| g == group),
        }
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::bitmap::Bitmap;
use crate::select::request::{JobRequest, TaskDist};
use crate::{JobId, Map, PartitionId, Priority, StepId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Complete,
    Failed,
    Timeout,
    NodeFail,
    Cancelled,
    Suspended,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete
                | JobState::Failed
                | JobState::Timeout
                | JobState::NodeFail
                | JobState::Cancelled
        )
    }
}

/// Why a pending job is not running yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitReason {
    Resources,
    Priority,
    PartitionDown,
}

/// The committed allocation of a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResources {
    pub nhosts: u32,
    pub nprocs: u32,
    /// Cpus granted per allocated node, in node-index order.
    pub cpus: Vec<u32>,
    /// Memory granted per allocated node, in node-index order.
    pub memory_allocated: Vec<u64>,
    /// Tasks placed per allocated node, in node-index order.
    pub tasks_per_node: Vec<u32>,
    /// Core bitmap spanning all nodes of the cluster.
    pub core_bitmap: Bitmap,
}

/// A sub-allocation within a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub job: JobId,
    pub node_bitmap: Bitmap,
    pub task_count: u32,
    pub distribution: TaskDist,
    /// Maximal task distance hint used by the launcher.
    pub task_distance: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user: UserId,
    pub name: String,
    pub partition: PartitionId,
    pub state: JobState,
    pub reason: Option<WaitReason>,
    pub priority: Priority,
    pub submit_time: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub time_limit: Duration,
    /// The allocation; empty bitmap while pending.
    pub node_bitmap: Bitmap,
    /// Row of the partition the allocation was placed into.
    pub row: Option<u32>,
    pub resources: Option<JobResources>,
    /// The original constraints the job was submitted with.
    pub details: JobRequest,
    pub steps: Map<StepId, Step>,
    next_step_id: u32,
}

impl Job {
    pub fn new(
        id: JobId,
        user: UserId,
        name: String,
        partition: PartitionId,
        priority: Priority,
        time_limit: Duration,
        details: JobRequest,
        node_count: usize,
        submit_time: u64,
    ) -> Self {
        Job {
            id,
            user,
            name,
            partition,
            state: JobState::Pending,
            reason: None,
            priority,
            submit_time,
            start_time: 0,
            end_time: 0,
            time_limit,
            node_bitmap: Bitmap::new(node_count),
            row: None,
            resources: None,
            details,
            steps: Map::default(),
            next_step_id: 0,
        }
    }

    pub fn new_step_id(&mut self) -> StepId {
        let id = StepId::new(self.next_step_id);
        self.next_step_id += 1;
        id
    }

    /// Deadline after which the reconciler forces the job to TIMEOUT.
    pub fn deadline(&self, kill_wait: Duration) -> Option<u64> {
        if self.state != JobState::Running || self.time_limit.is_zero() {
            return None;
        }
        Some(self.start_time + self.time_limit.as_secs() + kill_wait.as_secs())
    }
}

//! Wire types of the controller surface.
//!
//! Node sets cross the wire as hostlist strings ("n[01-04]"), never as
//! bitmap indices; internal record indices stay internal.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::error::SlateError;
use crate::select::request::{JobRequest, TaskDist};
use crate::state::job::{JobState, WaitReason};
use crate::state::node::NodeState;
use crate::{JobId, Priority, StepId, UserId};

/// Common payload of the submit-style calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitMsg {
    pub name: String,
    pub partition: String,
    pub priority: Priority,
    /// Zero means no limit (capped by the partition's `max_time`).
    pub time_limit: Duration,
    pub request: JobRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCreateMsg {
    pub job_id: JobId,
    pub task_count: u32,
    pub distribution: TaskDist,
    pub task_distance: u32,
    /// Hostlist naming a subset of the allocation; the whole allocation
    /// when absent.
    pub node_list: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOp {
    Drain,
    Resume,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    SubmitBatch(SubmitMsg),
    Allocate(SubmitMsg),
    AllocateAndRun(SubmitMsg),
    ConfirmAllocation {
        job_id: JobId,
    },
    WillRun(SubmitMsg),
    JobStepCreate(StepCreateMsg),
    CancelJob {
        job_id: JobId,
    },
    CancelJobStep {
        job_id: JobId,
        step_id: StepId,
    },
    CompleteJob {
        job_id: JobId,
        success: bool,
    },
    CompleteJobStep {
        job_id: JobId,
        step_id: StepId,
        success: bool,
    },
    UpdateJob {
        job_id: JobId,
        priority: Option<Priority>,
        time_limit: Option<Duration>,
    },
    UpdateNode {
        name: String,
        op: NodeOp,
        reason: Option<String>,
    },
    UpdatePartition {
        name: String,
        state_up: Option<bool>,
        max_nodes: Option<u32>,
    },
    LoadJobs {
        since: u64,
    },
    LoadNodes {
        since: u64,
    },
    LoadPartitions {
        since: u64,
    },
    Reconfigure {
        text: String,
    },
    Shutdown,
}

/// Reply to `Allocate` and `AllocateAndRun`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReply {
    pub job_id: JobId,
    pub node_list: String,
    /// Cpus granted per node, in `node_list` order.
    pub cpus_per_node: Vec<u32>,
    /// Serialized signed launch credential.
    pub credential: Vec<u8>,
    pub step_id: Option<StepId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WillRunReply {
    pub runnable_now: bool,
    pub node_list: String,
    pub total_cpus: u32,
}

/// Bulk query reply; `unchanged` short-circuits an up-to-date caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReply<T> {
    pub last_update: u64,
    pub unchanged: bool,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub user: UserId,
    pub partition: String,
    pub state: JobState,
    pub reason: Option<WaitReason>,
    pub priority: Priority,
    pub submit_time: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub node_list: String,
    pub num_procs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub partition: Option<String>,
    pub state: NodeState,
    pub responding: bool,
    pub cpus: u32,
    pub real_memory: u64,
    pub free_memory: u64,
    pub running_jobs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub priority: Priority,
    pub state_up: bool,
    pub max_nodes: u32,
    pub node_list: String,
}

/// Error category a client can branch on without parsing the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    Unauthorized,
    /// Valid but blocked right now; queue or retry.
    TryAgain,
    /// Never satisfiable under the current configuration.
    NeverRunnable,
    CredentialRejected,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SlateError> for ErrorReply {
    fn from(error: &SlateError) -> Self {
        let kind = match error {
            SlateError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SlateError::Unauthorized(_) => ErrorKind::Unauthorized,
            SlateError::InfeasibleNow | SlateError::Transient(_) => ErrorKind::TryAgain,
            SlateError::InfeasibleEver(_) => ErrorKind::NeverRunnable,
            SlateError::CredentialInvalid(_) => ErrorKind::CredentialRejected,
            _ => ErrorKind::Internal,
        };
        ErrorReply {
            kind,
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Submitted { job_id: JobId },
    Allocation(AllocationReply),
    WillRun(WillRunReply),
    StepCreated { job_id: JobId, step_id: StepId },
    Ok,
    Jobs(LoadReply<JobInfo>),
    Nodes(LoadReply<NodeInfo>),
    Partitions(LoadReply<PartitionInfo>),
    Error(ErrorReply),
}

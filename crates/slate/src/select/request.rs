use serde::{Deserialize, Serialize};

use crate::common::bitmap::Bitmap;

/// Which consumable resource granularity the selector tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrType {
    Cpu,
    Core,
    Socket,
    Memory,
    CpuMemory,
    CoreMemory,
    SocketMemory,
}

impl CrType {
    pub fn tracks_memory(&self) -> bool {
        matches!(
            self,
            CrType::Memory | CrType::CpuMemory | CrType::CoreMemory | CrType::SocketMemory
        )
    }

    pub fn tracks_sockets(&self) -> bool {
        matches!(self, CrType::Socket | CrType::SocketMemory)
    }

    pub fn tracks_cores(&self) -> bool {
        matches!(self, CrType::Core | CrType::CoreMemory)
    }
}

/// How the job wants to share nodes with other jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobNodeReq {
    /// Whole nodes, no sharing.
    Reserved,
    /// Share only with jobs in the same row.
    OneRow,
    /// Any available node.
    Available,
}

/// Current usage of a node as seen by the sharing filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUse {
    Free,
    Shared,
    OneRow,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemPolicy {
    /// Minimum memory per allocated cpu.
    PerCpu(u64),
    /// Minimum memory per allocated node.
    PerNode(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskDist {
    Block,
    Cyclic,
}

/// Job descriptor consumed by the selector. Zero in a `max_*`/`ntasks_*`
/// field means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub num_procs: u32,
    pub min_nodes: u32,
    /// 0 means no upper bound.
    pub max_nodes: u32,
    /// Nodes that MUST appear in the allocation.
    pub req_nodes: Option<Bitmap>,
    pub contiguous: bool,
    pub num_tasks: u32,
    pub cpus_per_task: u32,
    pub ntasks_per_node: u32,
    pub ntasks_per_socket: u32,
    pub min_sockets: u32,
    pub max_sockets: u32,
    pub min_cores: u32,
    pub max_cores: u32,
    pub max_threads: u32,
    pub mem_policy: Option<MemPolicy>,
    pub node_req: JobNodeReq,
    pub distribution: TaskDist,
}

impl Default for JobRequest {
    fn default() -> Self {
        JobRequest {
            num_procs: 1,
            min_nodes: 1,
            max_nodes: 0,
            req_nodes: None,
            contiguous: false,
            num_tasks: 1,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            ntasks_per_socket: 0,
            min_sockets: 1,
            max_sockets: 0,
            min_cores: 1,
            max_cores: 0,
            max_threads: 0,
            mem_policy: None,
            node_req: JobNodeReq::Available,
            distribution: TaskDist::Block,
        }
    }
}

impl JobRequest {
    pub fn validate(&self) -> crate::Result<()> {
        if self.num_procs == 0 {
            return Err("job requests zero processors".into());
        }
        if self.min_nodes == 0 {
            return Err("job requests zero nodes".into());
        }
        if self.max_nodes != 0 && self.max_nodes < self.min_nodes {
            return Err("max_nodes below min_nodes".into());
        }
        if self.cpus_per_task == 0 {
            return Err("cpus_per_task must be positive".into());
        }
        Ok(())
    }

    /// Effective node ceiling; `usize::MAX` when unbounded.
    pub fn max_nodes_or_unlimited(&self) -> usize {
        if self.max_nodes == 0 {
            usize::MAX
        } else {
            self.max_nodes as usize
        }
    }
}

/// Builder used heavily in tests; mirrors the common submit-line options.
#[derive(Default)]
pub struct JobRequestBuilder {
    inner: JobRequest,
}

impl JobRequestBuilder {
    pub fn new() -> Self {
        JobRequestBuilder {
            inner: JobRequest::default(),
        }
    }

    pub fn procs(mut self, n: u32) -> Self {
        self.inner.num_procs = n;
        self.inner.num_tasks = n;
        self
    }

    pub fn nodes(mut self, min: u32, max: u32) -> Self {
        self.inner.min_nodes = min;
        self.inner.max_nodes = max;
        self
    }

    pub fn tasks(mut self, n: u32) -> Self {
        self.inner.num_tasks = n;
        self
    }

    pub fn cpus_per_task(mut self, n: u32) -> Self {
        self.inner.cpus_per_task = n;
        self
    }

    pub fn ntasks_per_socket(mut self, n: u32) -> Self {
        self.inner.ntasks_per_socket = n;
        self
    }

    pub fn ntasks_per_node(mut self, n: u32) -> Self {
        self.inner.ntasks_per_node = n;
        self
    }

    pub fn sockets(mut self, min: u32, max: u32) -> Self {
        self.inner.min_sockets = min;
        self.inner.max_sockets = max;
        self
    }

    pub fn cores(mut self, min: u32, max: u32) -> Self {
        self.inner.min_cores = min;
        self.inner.max_cores = max;
        self
    }

    pub fn contiguous(mut self) -> Self {
        self.inner.contiguous = true;
        self
    }

    pub fn req_nodes(mut self, bitmap: Bitmap) -> Self {
        self.inner.req_nodes = Some(bitmap);
        self
    }

    pub fn mem_per_node(mut self, mem: u64) -> Self {
        self.inner.mem_policy = Some(MemPolicy::PerNode(mem));
        self
    }

    pub fn mem_per_cpu(mut self, mem: u64) -> Self {
        self.inner.mem_policy = Some(MemPolicy::PerCpu(mem));
        self
    }

    pub fn node_req(mut self, req: JobNodeReq) -> Self {
        self.inner.node_req = req;
        self
    }

    pub fn finish(self) -> JobRequest {
        self.inner
    }
}

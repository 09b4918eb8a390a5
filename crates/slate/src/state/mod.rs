//! Authoritative in-memory tables: nodes, configurations, partitions,
//! jobs and steps.
//!
//! A single writer lock (`StateRef = Arc<RwLock<StateStore>>`) serialises
//! every mutation; each table carries a `last_update` epoch advanced under
//! that lock so bulk queries can short-circuit unchanged responses.

pub mod job;
pub mod node;
pub mod partition;
pub mod snapshot;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::bitmap::Bitmap;
use crate::common::error::SlateError;
use crate::grid::Coord;
use crate::select::layout::NodeLayout;
use crate::select::request::{JobNodeReq, JobRequest, NodeUse};
use crate::{ConfigId, JobId, Map, NodeId, PartitionId, Priority, UserId};

use job::{Job, JobResources, JobState};
use node::{ConfigRecord, Node, NodeCounts, NodeFlags, NodeState};
use partition::{Partition, SharedPolicy};

pub type StateRef = Arc<RwLock<StateStore>>;

pub fn new_state_ref(store: StateStore) -> StateRef {
    Arc::new(RwLock::new(store))
}

/// Monotonic per-table epochs. `clock` is the global mutation counter;
/// a table's epoch is the clock value of its latest mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEpochs {
    pub clock: u64,
    pub nodes: u64,
    pub partitions: u64,
    pub jobs: u64,
    pub configs: u64,
}

impl TableEpochs {
    fn touch_nodes(&mut self) {
        self.clock += 1;
        self.nodes = self.clock;
    }
    fn touch_partitions(&mut self) {
        self.clock += 1;
        self.partitions = self.clock;
    }
    fn touch_jobs(&mut self) {
        self.clock += 1;
        self.jobs = self.clock;
    }
    fn touch_configs(&mut self) {
        self.clock += 1;
        self.configs = self.clock;
    }
}

pub struct StateStore {
    nodes: Vec<Node>,
    node_names: Map<String, NodeId>,
    /// Set when a node was deleted; the name hash is rebuilt on the next
    /// lookup instead of shifting record indices.
    names_dirty: bool,
    configs: Vec<ConfigRecord>,
    partitions: Vec<Partition>,
    partition_names: Map<String, PartitionId>,
    jobs: Map<JobId, Job>,
    next_job_id: u32,
    up_node_bitmap: Bitmap,
    idle_node_bitmap: Bitmap,
    epochs: TableEpochs,
    /// Set after an invariant violation; all further mutations refuse.
    poisoned: bool,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        StateStore {
            nodes: Vec::new(),
            node_names: Map::default(),
            names_dirty: false,
            configs: Vec::new(),
            partitions: Vec::new(),
            partition_names: Map::default(),
            jobs: Map::default(),
            next_job_id: 1,
            up_node_bitmap: Bitmap::new(0),
            idle_node_bitmap: Bitmap::new(0),
            epochs: TableEpochs::default(),
            poisoned: false,
        }
    }

    fn guard(&self) -> crate::Result<()> {
        if self.poisoned {
            Err(SlateError::Fatal(
                "state store refused mutation after invariant violation".into(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn epochs(&self) -> TableEpochs {
        self.epochs
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_cores(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| self.configs[usize::from(n.config)].counts.cores() as usize)
            .sum()
    }

    // --- configuration records ---------------------------------------

    pub fn add_config(
        &mut self,
        weight: u32,
        counts: NodeCounts,
        features: Vec<String>,
    ) -> crate::Result<ConfigId> {
        self.guard()?;
        let id = ConfigId::new(self.configs.len() as u32);
        self.configs.push(ConfigRecord {
            id,
            weight,
            counts,
            features,
            node_bitmap: Bitmap::new(self.nodes.len()),
        });
        self.epochs.touch_configs();
        Ok(id)
    }

    pub fn config(&self, id: ConfigId) -> Option<&ConfigRecord> {
        self.configs.get(usize::from(id))
    }

    pub fn configs(&self) -> &[ConfigRecord] {
        &self.configs
    }

    // --- nodes --------------------------------------------------------

    pub fn add_node(
        &mut self,
        name: &str,
        config: ConfigId,
        coord: Option<Coord>,
    ) -> crate::Result<NodeId> {
        self.guard()?;
        if name.is_empty() {
            return Err(SlateError::InvalidRequest("empty node name".into()));
        }
        if self.node_by_name(name).is_some() {
            return Err(SlateError::InvalidRequest(format!(
                "duplicate node name '{name}'"
            )));
        }
        let counts = self
            .configs
            .get(usize::from(config))
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown config {config}")))?
            .counts;
        let id = NodeId::new(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            coord,
            config,
            partition: None,
            state: NodeState::Unknown,
            flags: NodeFlags::empty(),
            last_response: 0,
            live: counts,
            features: Vec::new(),
            running_jobs: 0,
            free_memory: counts.real_memory,
        });
        self.node_names.insert(name.to_string(), id);

        let count = self.nodes.len();
        self.up_node_bitmap.resize(count);
        self.idle_node_bitmap.resize(count);
        for config in &mut self.configs {
            config.node_bitmap.resize(count);
        }
        for partition in &mut self.partitions {
            partition.node_bitmap.resize(count);
        }
        self.configs[usize::from(config)].node_bitmap.set(id.into());
        self.epochs.touch_nodes();
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(usize::from(id)).filter(|n| !n.is_deleted())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_deleted())
    }

    pub fn node_by_name(&mut self, name: &str) -> Option<NodeId> {
        if self.names_dirty {
            self.node_names.clear();
            for node in self.nodes.iter().filter(|n| !n.is_deleted()) {
                self.node_names.insert(node.name.clone(), node.id);
            }
            self.names_dirty = false;
        }
        self.node_names.get(name).copied()
    }

    pub fn set_node_state(&mut self, id: NodeId, state: NodeState) -> crate::Result<()> {
        self.guard()?;
        let node = self
            .nodes
            .get_mut(usize::from(id))
            .filter(|n| !n.is_deleted())
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown node {id}")))?;
        node.state = state;
        self.project_node(id);
        self.epochs.touch_nodes();
        Ok(())
    }

    pub fn set_node_responding(&mut self, id: NodeId, responding: bool, now: u64) {
        if let Some(node) = self.nodes.get_mut(usize::from(id)) {
            node.flags.set(NodeFlags::NO_RESPOND, !responding);
            if responding {
                node.last_response = now;
            }
            self.epochs.touch_nodes();
        }
    }

    /// Deleting a node does not shift indices: the record is blanked and
    /// marked DOWN; the name hash is rebuilt lazily.
    pub fn remove_node(&mut self, id: NodeId) -> crate::Result<()> {
        self.guard()?;
        let node = self
            .nodes
            .get_mut(usize::from(id))
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown node {id}")))?;
        if node.running_jobs > 0 {
            return Err(SlateError::InvalidRequest(format!(
                "node {} still has running jobs",
                node.name
            )));
        }
        node.name.clear();
        node.state = NodeState::Down;
        node.partition = None;
        self.names_dirty = true;
        self.project_node(id);
        for partition in &mut self.partitions {
            partition.node_bitmap.clear(id.into());
        }
        for config in &mut self.configs {
            config.node_bitmap.clear(id.into());
        }
        self.epochs.touch_nodes();
        self.epochs.touch_partitions();
        Ok(())
    }

    fn project_node(&mut self, id: NodeId) {
        let node = &self.nodes[usize::from(id)];
        let bit = usize::from(id);
        if node.state.is_up() && !node.is_deleted() {
            self.up_node_bitmap.set(bit);
        } else {
            self.up_node_bitmap.clear(bit);
        }
        if node.state.is_idle() && !node.is_deleted() {
            self.idle_node_bitmap.set(bit);
        } else {
            self.idle_node_bitmap.clear(bit);
        }
    }

    pub fn up_node_bitmap(&self) -> &Bitmap {
        &self.up_node_bitmap
    }

    pub fn idle_node_bitmap(&self) -> &Bitmap {
        &self.idle_node_bitmap
    }

    /// Sharing mode each node is currently held under.
    pub fn node_use(&self, id: NodeId) -> NodeUse {
        let node = &self.nodes[usize::from(id)];
        if node.running_jobs == 0 {
            return NodeUse::Free;
        }
        let mut usage = NodeUse::Shared;
        for job in self.jobs.values() {
            if job.state == JobState::Running && job.node_bitmap.test(id.into()) {
                match job.details.node_req {
                    JobNodeReq::Reserved => return NodeUse::Reserved,
                    JobNodeReq::OneRow => usage = NodeUse::OneRow,
                    JobNodeReq::Available => {}
                }
            }
        }
        usage
    }

    // --- partitions ---------------------------------------------------

    pub fn add_partition(
        &mut self,
        name: &str,
        priority: Priority,
        shared: SharedPolicy,
    ) -> crate::Result<PartitionId> {
        self.guard()?;
        if self.partition_names.contains_key(name) {
            return Err(SlateError::InvalidRequest(format!(
                "duplicate partition name '{name}'"
            )));
        }
        let id = PartitionId::new(self.partitions.len() as u32);
        self.partitions.push(Partition::new(
            id,
            name.to_string(),
            priority,
            shared,
            self.nodes.len(),
            self.total_cores(),
        ));
        self.partition_names.insert(name.to_string(), id);
        self.epochs.touch_partitions();
        Ok(id)
    }

    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(usize::from(id))
    }

    pub fn partition_mut(&mut self, id: PartitionId) -> Option<&mut Partition> {
        self.epochs.touch_partitions();
        self.partitions.get_mut(usize::from(id))
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition_by_name(&self, name: &str) -> Option<PartitionId> {
        self.partition_names.get(name).copied()
    }

    /// Assigns a node to a partition; a node belongs to at most one.
    pub fn assign_node(&mut self, node: NodeId, partition: PartitionId) -> crate::Result<()> {
        self.guard()?;
        let bit = usize::from(node);
        if self.nodes.get(bit).is_none_or(|n| n.is_deleted()) {
            return Err(SlateError::InvalidRequest(format!("unknown node {node}")));
        }
        if let Some(previous) = self.nodes[bit].partition {
            self.partitions[usize::from(previous)].node_bitmap.clear(bit);
        }
        self.nodes[bit].partition = Some(partition);
        self.partitions
            .get_mut(usize::from(partition))
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown partition {partition}")))?
            .node_bitmap
            .set(bit);
        self.epochs.touch_nodes();
        self.epochs.touch_partitions();
        Ok(())
    }

    /// Nodes of a partition the selector may currently consider. Draining
    /// nodes finish their running jobs but take no new ones; the same for
    /// nodes that stopped responding.
    pub fn avail_nodes(&self, partition: PartitionId) -> Bitmap {
        let mut avail = self.partitions[usize::from(partition)].node_bitmap.clone();
        avail.and_with(&self.up_node_bitmap);
        for (bit, node) in self.nodes.iter().enumerate() {
            if node.state == NodeState::Draining || node.flags.contains(NodeFlags::NO_RESPOND) {
                avail.clear(bit);
            }
        }
        avail
    }

    // --- jobs ---------------------------------------------------------

    pub fn create_job(
        &mut self,
        user: UserId,
        name: String,
        partition: PartitionId,
        priority: Priority,
        time_limit: Duration,
        details: JobRequest,
        now: u64,
        max_job_count: u32,
    ) -> crate::Result<JobId> {
        self.guard()?;
        details.validate()?;
        if self.partitions.get(usize::from(partition)).is_none() {
            return Err(SlateError::InvalidRequest(format!(
                "unknown partition {partition}"
            )));
        }
        if self.jobs.len() >= max_job_count as usize {
            return Err(SlateError::InfeasibleNow);
        }
        let id = JobId::new(self.next_job_id);
        self.next_job_id += 1;
        self.jobs.insert(
            id,
            Job::new(
                id,
                user,
                name,
                partition,
                priority,
                time_limit,
                details,
                self.nodes.len(),
                now,
            ),
        );
        self.epochs.touch_jobs();
        Ok(id)
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.epochs.touch_jobs();
        self.jobs.get_mut(&id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Pending jobs, highest priority first, submit order as tie-break.
    pub fn pending_jobs(&self) -> Vec<JobId> {
        let mut pending: Vec<_> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .map(|j| (j.priority, j.id))
            .collect();
        pending.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        pending.into_iter().map(|(_, id)| id).collect()
    }

    /// Records a successful selection: cores into the partition row, nodes
    /// to ALLOCATED, job to RUNNING. Never called with a conflicting
    /// selection; a row overlap here is an invariant violation.
    pub fn commit_allocation(
        &mut self,
        job_id: JobId,
        row: u32,
        node_bitmap: Bitmap,
        resources: JobResources,
        now: u64,
    ) -> crate::Result<()> {
        self.guard()?;
        let job = self
            .jobs
            .get(&job_id)
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown job {job_id}")))?;
        if job.state != JobState::Pending {
            return Err(SlateError::InvalidRequest(format!(
                "job {job_id} is not pending"
            )));
        }
        let partition = job.partition;
        {
            let part = &mut self.partitions[usize::from(partition)];
            let row_rec = part.rows.get_mut(row as usize).ok_or_else(|| {
                SlateError::InvalidRequest(format!("partition has no row {row}"))
            })?;
            if !row_rec.core_bitmap.is_disjoint(&resources.core_bitmap) {
                self.poisoned = true;
                return Err(SlateError::Fatal(format!(
                    "row {row} core overlap while committing job {job_id}"
                )));
            }
            row_rec.core_bitmap.or_with(&resources.core_bitmap);
            row_rec.job_count += 1;
        }

        let mut mem_iter = resources.memory_allocated.iter();
        for bit in node_bitmap.iter_set() {
            let node = &mut self.nodes[bit];
            node.state = NodeState::Allocated;
            node.running_jobs += 1;
            node.free_memory = node
                .free_memory
                .saturating_sub(mem_iter.next().copied().unwrap_or(0));
            self.project_node(NodeId::new(bit as u32));
        }

        let job = self.jobs.get_mut(&job_id).unwrap();
        job.node_bitmap = node_bitmap;
        job.row = Some(row);
        job.resources = Some(resources);
        job.state = JobState::Running;
        job.reason = None;
        job.start_time = now;
        self.epochs.touch_jobs();
        self.epochs.touch_nodes();
        self.epochs.touch_partitions();
        Ok(())
    }

    /// Rolls back a just-committed allocation (credential issuance failed).
    pub fn rollback_allocation(&mut self, job_id: JobId, now: u64) -> crate::Result<()> {
        self.release_job(job_id, JobState::Pending, now)
    }

    /// Moves a job to a terminal state and releases its resources.
    pub fn finish_job(&mut self, job_id: JobId, state: JobState, now: u64) -> crate::Result<()> {
        if !state.is_terminal() {
            return Err(SlateError::InvalidRequest(format!(
                "{state:?} is not a terminal job state"
            )));
        }
        self.release_job(job_id, state, now)
    }

    fn release_job(&mut self, job_id: JobId, new_state: JobState, now: u64) -> crate::Result<()> {
        self.guard()?;
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown job {job_id}")))?;
        let was_running = job.state == JobState::Running;
        job.state = new_state;
        job.end_time = if new_state.is_terminal() { now } else { 0 };
        if !was_running {
            self.epochs.touch_jobs();
            return Ok(());
        }
        let partition = job.partition;
        let row = job.row.take();
        let node_bitmap = std::mem::replace(&mut job.node_bitmap, Bitmap::new(self.nodes.len()));
        let resources = job.resources.take();

        if let (Some(row), Some(resources)) = (row, &resources) {
            let part = &mut self.partitions[usize::from(partition)];
            if let Some(row_rec) = part.rows.get_mut(row as usize) {
                row_rec.core_bitmap.and_not(&resources.core_bitmap);
                row_rec.job_count = row_rec.job_count.saturating_sub(1);
            }
        }
        let mut mem_iter = resources
            .as_ref()
            .map(|r| r.memory_allocated.clone())
            .unwrap_or_default()
            .into_iter();
        for bit in node_bitmap.iter_set() {
            let node = &mut self.nodes[bit];
            node.running_jobs = node.running_jobs.saturating_sub(1);
            node.free_memory = (node.free_memory + mem_iter.next().unwrap_or(0))
                .min(self.configs[usize::from(node.config)].counts.real_memory);
            if node.running_jobs == 0 && node.state == NodeState::Allocated {
                node.state = NodeState::Idle;
            }
            if node.running_jobs == 0 && node.state == NodeState::Draining {
                node.state = NodeState::Drained;
            }
            self.project_node(NodeId::new(bit as u32));
        }
        self.epochs.touch_jobs();
        self.epochs.touch_nodes();
        self.epochs.touch_partitions();
        Ok(())
    }

    /// Drops terminal jobs older than `min_job_age`.
    pub fn purge_terminal_jobs(&mut self, min_job_age: Duration, now: u64) -> usize {
        // Two passes: gather ids first, then mutate.
        let to_remove: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| {
                j.state.is_terminal() && j.end_time + min_job_age.as_secs() < now
            })
            .map(|j| j.id)
            .collect();
        for id in &to_remove {
            self.jobs.remove(id);
        }
        if !to_remove.is_empty() {
            self.epochs.touch_jobs();
        }
        to_remove.len()
    }

    // --- selector input -----------------------------------------------

    /// Core-geometry snapshot for the selector. With `fast_schedule` the
    /// configured counts are authoritative; otherwise the lower of the
    /// configured and live counts is used.
    pub fn layout(&self, fast_schedule: bool) -> NodeLayout {
        NodeLayout::build(self.nodes.iter().map(|node| {
            let configured = self.configs[usize::from(node.config)].counts;
            if fast_schedule {
                (
                    configured.sockets,
                    configured.cores_per_socket,
                    configured.threads_per_core,
                    configured.real_memory,
                )
            } else {
                (
                    configured.sockets.min(node.live.sockets),
                    configured.cores_per_socket.min(node.live.cores_per_socket),
                    configured.threads_per_core.min(node.live.threads_per_core),
                    configured.real_memory.min(node.live.real_memory),
                )
            }
        }))
    }

    pub fn free_memory_vec(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.free_memory).collect()
    }

    pub fn node_use_vec(&self) -> Vec<NodeUse> {
        (0..self.nodes.len())
            .map(|i| self.node_use(NodeId::new(i as u32)))
            .collect()
    }

    // --- snapshot support ----------------------------------------------

    /// All node records including blanked ones; the snapshot must keep
    /// deleted indices so that bitmaps stay aligned.
    pub fn raw_nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Rebuilds a store from snapshot records. Name hashes and the state
    /// projections are derived, not trusted from the file.
    pub fn restore(
        configs: Vec<ConfigRecord>,
        nodes: Vec<Node>,
        partitions: Vec<Partition>,
        jobs: Map<JobId, Job>,
        epochs: TableEpochs,
    ) -> crate::Result<StateStore> {
        let next_job_id = jobs.keys().map(|id| id.as_num()).max().unwrap_or(0) + 1;
        let mut store = StateStore {
            node_names: Map::default(),
            names_dirty: true,
            partition_names: partitions
                .iter()
                .map(|p| (p.name.clone(), p.id))
                .collect(),
            up_node_bitmap: Bitmap::new(nodes.len()),
            idle_node_bitmap: Bitmap::new(nodes.len()),
            nodes,
            configs,
            partitions,
            jobs,
            next_job_id,
            epochs,
            poisoned: false,
        };
        for i in 0..store.nodes.len() {
            store.project_node(NodeId::new(i as u32));
        }
        store.check_invariants()?;
        Ok(store)
    }

    // --- invariants ----------------------------------------------------

    /// Validates the testable properties over the current state.
    pub fn check_invariants(&self) -> crate::Result<()> {
        for job in self.jobs.values() {
            if job.state == JobState::Running {
                if !self.up_node_bitmap.is_superset(&job.node_bitmap) {
                    return Err(SlateError::Fatal(format!(
                        "running job {} holds nodes outside up_node_bitmap",
                        job.id
                    )));
                }
                if !self.idle_node_bitmap.is_disjoint(&job.node_bitmap) {
                    return Err(SlateError::Fatal(format!(
                        "running job {} overlaps idle_node_bitmap",
                        job.id
                    )));
                }
            }
        }
        for partition in &self.partitions {
            for (row_idx, row) in partition.rows.iter().enumerate() {
                let mut expected = Bitmap::new(row.core_bitmap.nbits());
                for job in self.jobs.values() {
                    if job.state == JobState::Running
                        && job.partition == partition.id
                        && job.row == Some(row_idx as u32)
                    {
                        if let Some(res) = &job.resources {
                            expected.or_with(&res.core_bitmap);
                        }
                    }
                }
                if expected != row.core_bitmap {
                    return Err(SlateError::Fatal(format!(
                        "partition {} row {row_idx} bitmap out of sync",
                        partition.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::request::JobRequestBuilder;

    pub(crate) fn small_cluster() -> (StateStore, PartitionId) {
        let mut store = StateStore::new();
        let config = store
            .add_config(
                1,
                NodeCounts {
                    sockets: 1,
                    cores_per_socket: 2,
                    threads_per_core: 1,
                    real_memory: 1024,
                    tmp_disk: 0,
                },
                vec![],
            )
            .unwrap();
        for name in ["linux01", "linux02", "linux03"] {
            let id = store.add_node(name, config, None).unwrap();
            store.set_node_state(id, NodeState::Idle).unwrap();
        }
        let part = store
            .add_partition("debug", 10, SharedPolicy::No)
            .unwrap();
        for i in 0..3 {
            store.assign_node(NodeId::new(i), part).unwrap();
        }
        (store, part)
    }

    fn run_job(store: &mut StateStore, part: PartitionId, nodes: &[u32]) -> JobId {
        let details = JobRequestBuilder::new().procs(2).nodes(1, 0).finish();
        let job = store
            .create_job(100, "job".into(), part, 0, Duration::ZERO, details, 1, 100)
            .unwrap();
        let node_bitmap = Bitmap::from_indices(3, nodes.iter().map(|n| *n as usize));
        let mut core_bitmap = Bitmap::new(store.total_cores());
        for n in nodes {
            core_bitmap.set((*n as usize) * 2);
        }
        let resources = JobResources {
            nhosts: nodes.len() as u32,
            nprocs: nodes.len() as u32,
            cpus: vec![1; nodes.len()],
            memory_allocated: vec![512; nodes.len()],
            tasks_per_node: vec![1; nodes.len()],
            core_bitmap,
        };
        store
            .commit_allocation(job, 0, node_bitmap, resources, 2)
            .unwrap();
        job
    }

    #[test]
    fn test_bitmap_projections_follow_state() {
        let (mut store, _part) = small_cluster();
        assert_eq!(store.up_node_bitmap().count(), 3);
        assert_eq!(store.idle_node_bitmap().count(), 3);
        store.set_node_state(NodeId::new(1), NodeState::Down).unwrap();
        assert_eq!(store.up_node_bitmap().count(), 2);
        assert!(!store.idle_node_bitmap().test(1));
    }

    #[test]
    fn test_commit_and_finish_job() {
        let (mut store, part) = small_cluster();
        let job = run_job(&mut store, part, &[0, 1]);
        assert!(store.check_invariants().is_ok());
        assert_eq!(store.node(NodeId::new(0)).unwrap().state, NodeState::Allocated);
        assert!(!store.idle_node_bitmap().test(0));
        assert_eq!(store.node(NodeId::new(0)).unwrap().free_memory, 512);

        store.finish_job(job, JobState::Complete, 50).unwrap();
        assert!(store.check_invariants().is_ok());
        assert_eq!(store.node(NodeId::new(0)).unwrap().state, NodeState::Idle);
        assert_eq!(store.node(NodeId::new(0)).unwrap().free_memory, 1024);
        assert!(store.partition(part).unwrap().rows[0].core_bitmap.is_empty());
    }

    #[test]
    fn test_row_overlap_poisons_store() {
        let (mut store, part) = small_cluster();
        run_job(&mut store, part, &[0]);
        // Second job claiming the same core must be rejected as Fatal.
        let details = JobRequestBuilder::new().procs(1).finish();
        let job2 = store
            .create_job(100, "j2".into(), part, 0, Duration::ZERO, details, 3, 100)
            .unwrap();
        let resources = JobResources {
            nhosts: 1,
            nprocs: 1,
            cpus: vec![1],
            memory_allocated: vec![0],
            tasks_per_node: vec![1],
            core_bitmap: Bitmap::from_indices(store.total_cores(), [0]),
        };
        let err = store
            .commit_allocation(job2, 0, Bitmap::from_indices(3, [0]), resources, 4)
            .unwrap_err();
        assert!(matches!(err, SlateError::Fatal(_)));
        assert!(store.set_node_state(NodeId::new(2), NodeState::Down).is_err());
    }

    #[test]
    fn test_remove_node_blanks_record() {
        let (mut store, _part) = small_cluster();
        let id = store.node_by_name("linux02").unwrap();
        store.remove_node(id).unwrap();
        assert!(store.node(id).is_none());
        assert!(store.node_by_name("linux02").is_none());
        // Indices of other nodes are unchanged.
        assert_eq!(store.node_by_name("linux03"), Some(NodeId::new(2)));
        // The blanked index is still occupied.
        assert_eq!(store.node_count(), 3);
    }

    #[test]
    fn test_epochs_are_monotonic() {
        let (mut store, _part) = small_cluster();
        let before = store.epochs();
        store.set_node_state(NodeId::new(0), NodeState::Down).unwrap();
        let after = store.epochs();
        assert!(after.nodes > before.nodes);
        assert_eq!(after.jobs, before.jobs);
        assert!(after.clock > before.clock);
    }

    #[test]
    fn test_purge_respects_min_age() {
        let (mut store, part) = small_cluster();
        let job = run_job(&mut store, part, &[0]);
        store.finish_job(job, JobState::Complete, 100).unwrap();
        assert_eq!(store.purge_terminal_jobs(Duration::from_secs(300), 200), 0);
        assert_eq!(store.purge_terminal_jobs(Duration::from_secs(300), 500), 1);
        assert!(store.job(job).is_none());
    }
}

//! RPC surface of the controller daemon.
//!
//! Every handler follows the same shape: check the caller's identity,
//! take the state lock, mutate, answer with a typed reply. A scheduling
//! pass runs inline on submit and whenever resources are released; jobs
//! left pending are retried on the next release.
//!
//! The state lock is never held across I/O; credential signing is pure
//! computation and a signing failure rolls the just-committed
//! allocation back before the error reaches the wire.

pub mod messages;

use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use crate::common::bitmap::Bitmap;
use crate::common::config::ControllerConfig;
use crate::common::error::SlateError;
use crate::common::{hostlist, now_secs};
use crate::cred::{Credential, CredentialEngine};
use crate::select::request::JobNodeReq;
use crate::select::{build_job_resources, cr_job_test};
use crate::state::job::{JobState, Step, WaitReason};
use crate::state::node::{NodeFlags, NodeState};
use crate::state::partition::SharedPolicy;
use crate::state::{StateRef, StateStore};
use crate::{JobId, NodeId, UserId};

use messages::{
    AllocationReply, ErrorReply, JobInfo, LoadReply, NodeInfo, NodeOp, PartitionInfo, Request,
    Response, StepCreateMsg, SubmitMsg, WillRunReply,
};

pub struct Controller {
    state: StateRef,
    creds: Arc<CredentialEngine>,
    config: RwLock<ControllerConfig>,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(state: StateRef, creds: Arc<CredentialEngine>, config: ControllerConfig) -> Self {
        Controller {
            state,
            creds,
            config: RwLock::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled by the `Shutdown` RPC; the daemon and the
    /// reconciler observe it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn handle(&self, uid: UserId, request: Request) -> Response {
        self.handle_at(uid, request, now_secs())
    }

    /// Like `handle` with an explicit clock, so tests control time.
    pub fn handle_at(&self, uid: UserId, request: Request, now: u64) -> Response {
        match self.dispatch(uid, request, now) {
            Ok(response) => response,
            Err(error) => {
                log::debug!("Request from uid {uid} failed: {error}");
                Response::Error(ErrorReply::from(&error))
            }
        }
    }

    fn dispatch(&self, uid: UserId, request: Request, now: u64) -> crate::Result<Response> {
        match request {
            Request::SubmitBatch(msg) => self.submit_batch(uid, &msg, now),
            Request::Allocate(msg) => self.allocate(uid, &msg, now, false),
            Request::AllocateAndRun(msg) => self.allocate(uid, &msg, now, true),
            Request::ConfirmAllocation { job_id } => self.confirm_allocation(uid, job_id),
            Request::WillRun(msg) => self.will_run(uid, &msg),
            Request::JobStepCreate(msg) => self.job_step_create(uid, &msg),
            Request::CancelJob { job_id } => self.cancel_job(uid, job_id, now),
            Request::CancelJobStep { job_id, step_id } => {
                self.remove_step(uid, job_id, step_id, true)
            }
            Request::CompleteJob { job_id, success } => {
                self.complete_job(uid, job_id, success, now)
            }
            Request::CompleteJobStep {
                job_id,
                step_id,
                success,
            } => {
                if !success {
                    log::info!("Step {step_id} of job {job_id} reported failure");
                }
                self.remove_step(uid, job_id, step_id, false)
            }
            Request::UpdateJob {
                job_id,
                priority,
                time_limit,
            } => self.update_job(uid, job_id, priority, time_limit, now),
            Request::UpdateNode { name, op, reason } => {
                self.update_node(uid, &name, op, reason.as_deref(), now)
            }
            Request::UpdatePartition {
                name,
                state_up,
                max_nodes,
            } => self.update_partition(uid, &name, state_up, max_nodes, now),
            Request::LoadJobs { since } => self.load_jobs(since),
            Request::LoadNodes { since } => self.load_nodes(since),
            Request::LoadPartitions { since } => self.load_partitions(since),
            Request::Reconfigure { text } => self.reconfigure(uid, &text),
            Request::Shutdown => {
                self.manager_only(uid)?;
                log::info!("Shutdown requested by uid {uid}");
                self.shutdown.cancel();
                Ok(Response::Ok)
            }
        }
    }

    // --- identity ------------------------------------------------------

    fn manager_uid(&self) -> UserId {
        self.config.read().unwrap().manager_uid
    }

    fn manager_only(&self, uid: UserId) -> crate::Result<()> {
        if uid != self.manager_uid() {
            return Err(SlateError::Unauthorized(
                "manager access required".into(),
            ));
        }
        Ok(())
    }

    /// Job mutations are open to the job's owner and the manager.
    fn authorize_job(&self, store: &StateStore, uid: UserId, job_id: JobId) -> crate::Result<()> {
        let job = store
            .job(job_id)
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown job {job_id}")))?;
        if job.user != uid && uid != self.manager_uid() {
            return Err(SlateError::Unauthorized("not the job owner".into()).for_job(job_id));
        }
        Ok(())
    }

    // --- submit path ---------------------------------------------------

    /// Validates the request against the partition and records the job as
    /// pending. The partition's sharing policy narrows the request: an
    /// exclusive partition hands out whole nodes only.
    fn submit(
        &self,
        store: &mut StateStore,
        uid: UserId,
        msg: &SubmitMsg,
        now: u64,
    ) -> crate::Result<JobId> {
        let max_job_count = self.config.read().unwrap().max_job_count;
        let partition = store.partition_by_name(&msg.partition).ok_or_else(|| {
            SlateError::InvalidRequest(format!("unknown partition '{}'", msg.partition))
        })?;
        let (shared, max_nodes, max_time, state_up) = {
            let part = store.partition(partition).ok_or_else(|| {
                SlateError::InvalidRequest(format!("unknown partition '{}'", msg.partition))
            })?;
            (part.shared, part.max_nodes, part.max_time, part.state_up)
        };
        let mut request = msg.request.clone();
        if shared == SharedPolicy::No {
            request.node_req = JobNodeReq::Reserved;
        }
        if max_nodes > 0 && request.min_nodes > max_nodes {
            return Err(SlateError::InfeasibleEver(
                "job needs more nodes than the partition permits".into(),
            ));
        }
        let mut time_limit = msg.time_limit;
        if !max_time.is_zero() && (time_limit.is_zero() || time_limit > max_time) {
            time_limit = max_time;
        }
        let job_id = store.create_job(
            uid,
            msg.name.clone(),
            partition,
            msg.priority,
            time_limit,
            request,
            now,
            max_job_count,
        )?;
        if !state_up {
            if let Some(job) = store.job_mut(job_id) {
                job.reason = Some(WaitReason::PartitionDown);
            }
        }
        log::info!("Job {job_id} ('{}') submitted by uid {uid}", msg.name);
        Ok(job_id)
    }

    /// Attempts to place a pending job right now. On success the
    /// allocation is committed and a launch credential issued; a signing
    /// failure rolls the commit back and leaves the job pending.
    fn try_start(
        &self,
        store: &mut StateStore,
        job_id: JobId,
        now: u64,
    ) -> crate::Result<AllocationReply> {
        let (fast_schedule, select_type, expiration_window) = {
            let config = self.config.read().unwrap();
            (
                config.fast_schedule,
                config.select_type,
                config.expiration_window,
            )
        };
        let (partition, user, request) = {
            let job = store
                .job(job_id)
                .ok_or_else(|| SlateError::InvalidRequest(format!("unknown job {job_id}")))?;
            if job.state != JobState::Pending {
                return Err(SlateError::InvalidRequest(format!(
                    "job {job_id} is not pending"
                )));
            }
            (job.partition, job.user, job.details.clone())
        };
        if !store.partition(partition).is_some_and(|p| p.state_up) {
            if let Some(job) = store.job_mut(job_id) {
                job.reason = Some(WaitReason::PartitionDown);
            }
            return Err(SlateError::InfeasibleNow);
        }

        let layout = store.layout(fast_schedule);
        let avail = store.avail_nodes(partition);
        let free_memory = store.free_memory_vec();
        let node_use = store.node_use_vec();
        let selection = match cr_job_test(
            &request,
            &layout,
            select_type,
            &avail,
            &free_memory,
            &node_use,
            partition,
            store.partitions(),
        ) {
            Ok(selection) => selection,
            Err(error) => {
                if matches!(error, SlateError::InfeasibleNow) {
                    if let Some(job) = store.job_mut(job_id) {
                        job.reason = Some(WaitReason::Resources);
                    }
                }
                return Err(error);
            }
        };
        let resources = build_job_resources(&request, &selection, &layout);
        let node_list = encode_nodes(store, &selection.nodes);
        let cpus_per_node = resources.cpus.clone();
        store.commit_allocation(job_id, selection.row, selection.nodes, resources, now)?;

        let cred = Credential {
            job_id,
            uid: user,
            node_list: node_list.clone(),
            expiration: now + expiration_window.as_secs(),
        };
        let signed = match self.creds.sign(cred) {
            Ok(signed) => signed,
            Err(error) => {
                store.rollback_allocation(job_id, now)?;
                log::warn!("Credential issue for job {job_id} failed: {error}");
                return Err(error);
            }
        };
        log::info!("Job {job_id} started on {node_list}");
        Ok(AllocationReply {
            job_id,
            node_list,
            cpus_per_node,
            credential: signed.to_bytes(),
            step_id: None,
        })
    }

    /// Walks the pending queue in priority order; a blocked job stays
    /// queued and does not stop later jobs from starting.
    pub fn schedule_cycle(&self, store: &mut StateStore, now: u64) -> usize {
        let mut started = 0;
        for job_id in store.pending_jobs() {
            match self.try_start(store, job_id, now) {
                Ok(_) => started += 1,
                Err(SlateError::Fatal(msg)) => {
                    log::error!("Scheduling stopped: {msg}");
                    break;
                }
                Err(_) => {}
            }
        }
        started
    }

    fn submit_batch(&self, uid: UserId, msg: &SubmitMsg, now: u64) -> crate::Result<Response> {
        let mut store = self.state.write().unwrap();
        let job_id = self.submit(&mut store, uid, msg, now)?;
        match self.try_start(&mut store, job_id, now) {
            Ok(_) | Err(SlateError::InfeasibleNow) | Err(SlateError::Transient(_)) => {
                Ok(Response::Submitted { job_id })
            }
            Err(error @ SlateError::InfeasibleEver(_)) => {
                store.finish_job(job_id, JobState::Cancelled, now)?;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Immediate allocation: either the job starts now or it is dropped.
    fn allocate(
        &self,
        uid: UserId,
        msg: &SubmitMsg,
        now: u64,
        with_step: bool,
    ) -> crate::Result<Response> {
        let mut store = self.state.write().unwrap();
        let job_id = self.submit(&mut store, uid, msg, now)?;
        let mut reply = match self.try_start(&mut store, job_id, now) {
            Ok(reply) => reply,
            Err(error) => {
                store.finish_job(job_id, JobState::Cancelled, now)?;
                return Err(error);
            }
        };
        if with_step {
            let job = store
                .job_mut(job_id)
                .ok_or_else(|| SlateError::InvalidRequest(format!("unknown job {job_id}")))?;
            let step_id = job.new_step_id();
            let step = Step {
                id: step_id,
                job: job_id,
                node_bitmap: job.node_bitmap.clone(),
                task_count: job
                    .resources
                    .as_ref()
                    .map(|r| r.tasks_per_node.iter().sum())
                    .unwrap_or(1),
                distribution: job.details.distribution,
                task_distance: 0,
            };
            job.steps.insert(step_id, step);
            reply.step_id = Some(step_id);
        }
        Ok(Response::Allocation(reply))
    }

    fn confirm_allocation(&self, uid: UserId, job_id: JobId) -> crate::Result<Response> {
        let store = self.state.read().unwrap();
        self.authorize_job(&store, uid, job_id)?;
        match store.job(job_id).map(|j| j.state) {
            Some(JobState::Running) => Ok(Response::Ok),
            _ => Err(
                SlateError::InvalidRequest("job has no active allocation".into()).for_job(job_id),
            ),
        }
    }

    /// Dry-run placement: answers whether the request would start now,
    /// without creating a job or committing anything.
    fn will_run(&self, _uid: UserId, msg: &SubmitMsg) -> crate::Result<Response> {
        let (fast_schedule, select_type) = {
            let config = self.config.read().unwrap();
            (config.fast_schedule, config.select_type)
        };
        let store = self.state.read().unwrap();
        let partition = store.partition_by_name(&msg.partition).ok_or_else(|| {
            SlateError::InvalidRequest(format!("unknown partition '{}'", msg.partition))
        })?;
        let part = store.partition(partition).ok_or_else(|| {
            SlateError::InvalidRequest(format!("unknown partition '{}'", msg.partition))
        })?;
        let mut request = msg.request.clone();
        request.validate()?;
        if part.shared == SharedPolicy::No {
            request.node_req = JobNodeReq::Reserved;
        }
        if !part.state_up || (part.max_nodes > 0 && request.min_nodes > part.max_nodes) {
            return Ok(Response::WillRun(WillRunReply {
                runnable_now: false,
                node_list: String::new(),
                total_cpus: 0,
            }));
        }
        let layout = store.layout(fast_schedule);
        let avail = store.avail_nodes(partition);
        let free_memory = store.free_memory_vec();
        let node_use = store.node_use_vec();
        match cr_job_test(
            &request,
            &layout,
            select_type,
            &avail,
            &free_memory,
            &node_use,
            partition,
            store.partitions(),
        ) {
            Ok(selection) => Ok(Response::WillRun(WillRunReply {
                runnable_now: true,
                node_list: encode_nodes(&store, &selection.nodes),
                total_cpus: selection.cpus.iter().sum(),
            })),
            Err(SlateError::InfeasibleNow) => Ok(Response::WillRun(WillRunReply {
                runnable_now: false,
                node_list: String::new(),
                total_cpus: 0,
            })),
            Err(error) => Err(error),
        }
    }

    // --- steps ---------------------------------------------------------

    fn job_step_create(&self, uid: UserId, msg: &StepCreateMsg) -> crate::Result<Response> {
        if msg.task_count == 0 {
            return Err(SlateError::InvalidRequest(
                "step requests zero tasks".into(),
            ));
        }
        let mut store = self.state.write().unwrap();
        self.authorize_job(&store, uid, msg.job_id)?;
        let allocation = store
            .job(msg.job_id)
            .filter(|j| j.state == JobState::Running)
            .map(|j| j.node_bitmap.clone())
            .ok_or_else(|| {
                SlateError::InvalidRequest("job is not running".into()).for_job(msg.job_id)
            })?;
        let node_bitmap = match &msg.node_list {
            Some(list) => {
                let mut bitmap = Bitmap::new(store.node_count());
                for name in hostlist::decode(list)? {
                    let id = store.node_by_name(&name).ok_or_else(|| {
                        SlateError::InvalidRequest(format!("unknown node '{name}'"))
                    })?;
                    bitmap.set(id.into());
                }
                bitmap
            }
            None => allocation.clone(),
        };
        if !allocation.is_superset(&node_bitmap) || node_bitmap.is_empty() {
            return Err(SlateError::InvalidRequest(
                "step nodes outside the job allocation".into(),
            )
            .for_job(msg.job_id));
        }
        let job = store
            .job_mut(msg.job_id)
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown job {}", msg.job_id)))?;
        let step_id = job.new_step_id();
        job.steps.insert(
            step_id,
            Step {
                id: step_id,
                job: msg.job_id,
                node_bitmap,
                task_count: msg.task_count,
                distribution: msg.distribution,
                task_distance: msg.task_distance,
            },
        );
        Ok(Response::StepCreated {
            job_id: msg.job_id,
            step_id,
        })
    }

    fn remove_step(
        &self,
        uid: UserId,
        job_id: JobId,
        step_id: crate::StepId,
        cancelled: bool,
    ) -> crate::Result<Response> {
        let mut store = self.state.write().unwrap();
        self.authorize_job(&store, uid, job_id)?;
        let job = store
            .job_mut(job_id)
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown job {job_id}")))?;
        if job.steps.remove(&step_id).is_none() {
            return Err(
                SlateError::InvalidRequest(format!("unknown step {step_id}")).for_job(job_id),
            );
        }
        if cancelled {
            log::info!("Step {step_id} of job {job_id} cancelled");
        }
        Ok(Response::Ok)
    }

    // --- job lifecycle -------------------------------------------------

    fn cancel_job(&self, uid: UserId, job_id: JobId, now: u64) -> crate::Result<Response> {
        let mut store = self.state.write().unwrap();
        self.authorize_job(&store, uid, job_id)?;
        let state = store
            .job(job_id)
            .map(|j| j.state)
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown job {job_id}")))?;
        if state.is_terminal() {
            return Err(
                SlateError::InvalidRequest("job already finished".into()).for_job(job_id),
            );
        }
        store.finish_job(job_id, JobState::Cancelled, now)?;
        log::info!("Job {job_id} cancelled by uid {uid}");
        if state == JobState::Running {
            self.creds.revoke(job_id, 0, now);
            self.schedule_cycle(&mut store, now);
        }
        Ok(Response::Ok)
    }

    fn complete_job(
        &self,
        uid: UserId,
        job_id: JobId,
        success: bool,
        now: u64,
    ) -> crate::Result<Response> {
        let mut store = self.state.write().unwrap();
        self.authorize_job(&store, uid, job_id)?;
        if store.job(job_id).map(|j| j.state) != Some(JobState::Running) {
            return Err(SlateError::InvalidRequest("job is not running".into()).for_job(job_id));
        }
        let state = if success {
            JobState::Complete
        } else {
            JobState::Failed
        };
        store.finish_job(job_id, state, now)?;
        self.creds.revoke(job_id, 0, now);
        log::info!("Job {job_id} finished as {state:?}");
        self.schedule_cycle(&mut store, now);
        Ok(Response::Ok)
    }

    fn update_job(
        &self,
        uid: UserId,
        job_id: JobId,
        priority: Option<crate::Priority>,
        time_limit: Option<std::time::Duration>,
        now: u64,
    ) -> crate::Result<Response> {
        let manager = uid == self.manager_uid();
        let mut store = self.state.write().unwrap();
        self.authorize_job(&store, uid, job_id)?;
        let mut reschedule = false;
        {
            let job = store
                .job_mut(job_id)
                .ok_or_else(|| SlateError::InvalidRequest(format!("unknown job {job_id}")))?;
            if let Some(priority) = priority {
                // Owners may only lower; raising needs the manager.
                if !manager && priority > job.priority {
                    return Err(SlateError::Unauthorized(
                        "only the manager may raise a job's priority".into(),
                    )
                    .for_job(job_id));
                }
                job.priority = priority;
                reschedule = job.state == JobState::Pending;
            }
            if let Some(limit) = time_limit {
                if !manager && (job.time_limit.is_zero() || limit > job.time_limit) {
                    return Err(SlateError::Unauthorized(
                        "only the manager may extend a time limit".into(),
                    )
                    .for_job(job_id));
                }
                job.time_limit = limit;
            }
        }
        if reschedule {
            self.schedule_cycle(&mut store, now);
        }
        Ok(Response::Ok)
    }

    // --- node and partition administration -----------------------------

    fn update_node(
        &self,
        uid: UserId,
        name: &str,
        op: NodeOp,
        reason: Option<&str>,
        now: u64,
    ) -> crate::Result<Response> {
        self.manager_only(uid)?;
        let mut store = self.state.write().unwrap();
        let id = store
            .node_by_name(name)
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown node '{name}'")))?;
        match op {
            NodeOp::Drain => {
                let busy = store.node(id).is_some_and(|n| n.running_jobs > 0);
                store.set_node_state(
                    id,
                    if busy {
                        NodeState::Draining
                    } else {
                        NodeState::Drained
                    },
                )?;
                log::info!(
                    "Node {name} draining ({})",
                    reason.unwrap_or("no reason given")
                );
            }
            NodeOp::Resume => {
                let busy = store.node(id).is_some_and(|n| n.running_jobs > 0);
                store.set_node_state(
                    id,
                    if busy {
                        NodeState::Allocated
                    } else {
                        NodeState::Idle
                    },
                )?;
                store.set_node_responding(id, true, now);
                log::info!("Node {name} resumed");
                self.schedule_cycle(&mut store, now);
            }
            NodeOp::Down => {
                // Running jobs lose the node before it leaves the up set.
                let victims: Vec<JobId> = store
                    .jobs()
                    .filter(|j| j.state == JobState::Running && j.node_bitmap.test(id.into()))
                    .map(|j| j.id)
                    .collect();
                for job in victims {
                    store.finish_job(job, JobState::NodeFail, now)?;
                    self.creds.revoke(job, 0, now);
                    log::info!("Job {job} lost node {name}; moved to NODE_FAIL");
                }
                store.set_node_state(id, NodeState::Down)?;
                log::info!(
                    "Node {name} set down ({})",
                    reason.unwrap_or("no reason given")
                );
            }
        }
        Ok(Response::Ok)
    }

    fn update_partition(
        &self,
        uid: UserId,
        name: &str,
        state_up: Option<bool>,
        max_nodes: Option<u32>,
        now: u64,
    ) -> crate::Result<Response> {
        self.manager_only(uid)?;
        let mut store = self.state.write().unwrap();
        let id = store
            .partition_by_name(name)
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown partition '{name}'")))?;
        let mut came_up = false;
        {
            let part = store
                .partition_mut(id)
                .ok_or_else(|| SlateError::InvalidRequest(format!("unknown partition '{name}'")))?;
            if let Some(up) = state_up {
                came_up = up && !part.state_up;
                part.state_up = up;
            }
            if let Some(max) = max_nodes {
                part.max_nodes = max;
            }
        }
        if came_up {
            self.schedule_cycle(&mut store, now);
        }
        Ok(Response::Ok)
    }

    // --- bulk queries --------------------------------------------------

    fn load_jobs(&self, since: u64) -> crate::Result<Response> {
        let store = self.state.read().unwrap();
        let last_update = store.epochs().jobs;
        if since >= last_update {
            return Ok(Response::Jobs(unchanged(last_update)));
        }
        let mut jobs: Vec<_> = store.jobs().collect();
        jobs.sort_by_key(|j| j.id);
        let items = jobs
            .into_iter()
            .map(|job| JobInfo {
                id: job.id,
                name: job.name.clone(),
                user: job.user,
                partition: store
                    .partition(job.partition)
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
                state: job.state,
                reason: job.reason,
                priority: job.priority,
                submit_time: job.submit_time,
                start_time: job.start_time,
                end_time: job.end_time,
                node_list: encode_nodes(&store, &job.node_bitmap),
                num_procs: job
                    .resources
                    .as_ref()
                    .map(|r| r.nprocs)
                    .unwrap_or(job.details.num_procs),
            })
            .collect();
        Ok(Response::Jobs(LoadReply {
            last_update,
            unchanged: false,
            items,
        }))
    }

    fn load_nodes(&self, since: u64) -> crate::Result<Response> {
        let store = self.state.read().unwrap();
        let last_update = store.epochs().nodes;
        if since >= last_update {
            return Ok(Response::Nodes(unchanged(last_update)));
        }
        let items = store
            .nodes()
            .map(|node| NodeInfo {
                name: node.name.clone(),
                partition: node
                    .partition
                    .and_then(|p| store.partition(p))
                    .map(|p| p.name.clone()),
                state: node.state,
                responding: !node.flags.contains(NodeFlags::NO_RESPOND),
                cpus: store
                    .config(node.config)
                    .map(|c| c.counts.cpus())
                    .unwrap_or(0),
                real_memory: store
                    .config(node.config)
                    .map(|c| c.counts.real_memory)
                    .unwrap_or(0),
                free_memory: node.free_memory,
                running_jobs: node.running_jobs,
            })
            .collect();
        Ok(Response::Nodes(LoadReply {
            last_update,
            unchanged: false,
            items,
        }))
    }

    fn load_partitions(&self, since: u64) -> crate::Result<Response> {
        let store = self.state.read().unwrap();
        let last_update = store.epochs().partitions;
        if since >= last_update {
            return Ok(Response::Partitions(unchanged(last_update)));
        }
        let items = store
            .partitions()
            .iter()
            .map(|part| PartitionInfo {
                name: part.name.clone(),
                priority: part.priority,
                state_up: part.state_up,
                max_nodes: part.max_nodes,
                node_list: encode_nodes(&store, &part.node_bitmap),
            })
            .collect();
        Ok(Response::Partitions(LoadReply {
            last_update,
            unchanged: false,
            items,
        }))
    }

    // --- configuration -------------------------------------------------

    fn reconfigure(&self, uid: UserId, text: &str) -> crate::Result<Response> {
        self.manager_only(uid)?;
        let config = ControllerConfig::parse(text)?;
        *self.config.write().unwrap() = config;
        log::info!("Configuration reloaded");
        Ok(Response::Ok)
    }
}

fn unchanged<T>(last_update: u64) -> LoadReply<T> {
    LoadReply {
        last_update,
        unchanged: true,
        items: Vec::new(),
    }
}

fn encode_nodes(store: &StateStore, bitmap: &Bitmap) -> String {
    let names: Vec<&str> = bitmap
        .iter_set()
        .filter_map(|bit| store.node(NodeId::new(bit as u32)).map(|n| n.name.as_str()))
        .collect();
    hostlist::encode(names)
}

//! Background reconciler.
//!
//! One detached task ticking once per second: block-list reconciliation
//! when the state clock advanced, failed-node sweep, job timeout sweep,
//! credential revocation of terminal jobs and credential GC. The
//! cancellation token is observed at the loop head; pending destructor
//! work is awaited before the final snapshot is written.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::blocks::fabric::Fabric;
use crate::blocks::BlockPlanner;
use crate::common::config::ControllerConfig;
use crate::common::now_secs;
use crate::cred::CredentialEngine;
use crate::state::job::JobState;
use crate::state::node::NodeState;
use crate::state::{snapshot, StateRef};
use crate::JobId;

const TICK: Duration = Duration::from_secs(1);

/// Poll timestamps carried across ticks.
#[derive(Debug, Default)]
pub struct Timers {
    pub last_block_poll: u64,
    pub last_fabric_poll: u64,
    pub last_save: u64,
    /// State clock observed by the latest successful block reconcile.
    pub last_state_clock: u64,
}

pub struct Reconciler {
    state: StateRef,
    creds: Arc<CredentialEngine>,
    planner: Option<Arc<tokio::sync::Mutex<BlockPlanner>>>,
    fabric: Option<Arc<dyn Fabric>>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        state: StateRef,
        creds: Arc<CredentialEngine>,
        planner: Option<Arc<tokio::sync::Mutex<BlockPlanner>>>,
        fabric: Option<Arc<dyn Fabric>>,
        config: ControllerConfig,
    ) -> Self {
        Reconciler {
            state,
            creds,
            planner,
            fabric,
            config,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut timers = Timers::default();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(TICK) => {}
            }
            self.tick(now_secs(), &mut timers).await;
        }
        self.save_snapshot(now_secs());
        log::info!("Reconciler stopped");
    }

    /// One loop body; public so tests can drive it without the timer.
    pub async fn tick(&self, now: u64, timers: &mut Timers) {
        self.reconcile_blocks(now, timers).await;
        self.sweep_failed_nodes(now, timers);
        self.sweep_job_timeouts(now);
        self.revoke_terminal_credentials(now);
        self.purge_old_jobs(now);
        let dropped = self.creds.gc(now);
        if dropped > 0 {
            log::debug!("Credential GC dropped {dropped} entries");
        }
        if now.saturating_sub(timers.last_save) >= self.config.state_save_interval.as_secs() {
            self.save_snapshot(now);
            timers.last_save = now;
        }
    }

    async fn reconcile_blocks(&self, now: u64, timers: &mut Timers) {
        let (Some(planner), Some(fabric)) = (&self.planner, &self.fabric) else {
            return;
        };
        if now.saturating_sub(timers.last_block_poll) < self.config.block_poll_interval.as_secs() {
            return;
        }
        let clock = self.state.read().unwrap().epochs().clock;
        if clock == timers.last_state_clock {
            return;
        }

        // Drop the dynamic blocks of finished jobs before reconciling.
        let terminal: Vec<JobId> = {
            let state = self.state.read().unwrap();
            state
                .jobs()
                .filter(|j| j.state.is_terminal())
                .map(|j| j.id)
                .collect()
        };
        let mut planner = planner.lock().await;
        let owners: Vec<JobId> = planner.blocks().iter().filter_map(|b| b.job).collect();
        for job in owners {
            let gone = terminal.contains(&job)
                || self.state.read().unwrap().job(job).is_none();
            if gone {
                for name in planner.job_ended(job) {
                    log::debug!("Dropping block {name} of finished job {job}");
                }
            }
        }
        match planner.reconcile(fabric).await {
            Ok(stats) => {
                if stats.created > 0 || stats.destroyed > 0 {
                    log::info!(
                        "Block reconcile: {} created, {} destroyed",
                        stats.created,
                        stats.destroyed
                    );
                }
                timers.last_state_clock = clock;
                timers.last_block_poll = now;
            }
            Err(e) => log::warn!("Block reconcile failed: {e}"),
        }
    }

    fn sweep_failed_nodes(&self, now: u64, timers: &mut Timers) {
        let Some(fabric) = &self.fabric else { return };
        if now.saturating_sub(timers.last_fabric_poll) < self.config.fabric_poll_interval.as_secs()
        {
            return;
        }
        timers.last_fabric_poll = now;
        let names = match fabric.down_nodes() {
            Ok(names) => names,
            Err(e) => {
                log::warn!("Fabric down-node poll failed: {e}");
                return;
            }
        };
        if names.is_empty() {
            return;
        }
        let mut state = self.state.write().unwrap();
        for name in names {
            let Some(id) = state.node_by_name(&name) else {
                continue;
            };
            state.set_node_responding(id, false, now);
            // Jobs lose their allocation before the node leaves the up set.
            let victims: Vec<JobId> = state
                .jobs()
                .filter(|j| j.state == JobState::Running && j.node_bitmap.test(id.into()))
                .map(|j| j.id)
                .collect();
            for job in victims {
                match state.finish_job(job, JobState::NodeFail, now) {
                    Ok(()) => {
                        self.creds.revoke(job, 0, now);
                        log::info!("Job {job} lost node {name}; moved to NODE_FAIL");
                    }
                    Err(e) => log::warn!("Cannot fail job {job} on node {name}: {e}"),
                }
            }
            if let Err(e) = state.set_node_state(id, NodeState::Down) {
                log::warn!("Cannot mark node {name} down: {e}");
            } else {
                log::info!("Fabric reports node {name} failed; marked DOWN");
            }
        }
    }

    fn sweep_job_timeouts(&self, now: u64) {
        let overdue: Vec<JobId> = {
            let state = self.state.read().unwrap();
            state
                .jobs()
                .filter(|j| j.deadline(self.config.kill_wait).is_some_and(|d| d <= now))
                .map(|j| j.id)
                .collect()
        };
        if overdue.is_empty() {
            return;
        }
        let mut state = self.state.write().unwrap();
        for job in overdue {
            match state.finish_job(job, JobState::Timeout, now) {
                Ok(()) => {
                    // Expiration 0 keeps whatever the live entry recorded.
                    self.creds.revoke(job, 0, now);
                    log::info!("Job {job} exceeded its time limit; moved to TIMEOUT");
                }
                Err(e) => log::warn!("Cannot time out job {job}: {e}"),
            }
        }
    }

    /// A credential whose owning job reached a terminal state is revoked
    /// within one tick.
    fn revoke_terminal_credentials(&self, now: u64) {
        let live = self.creds.export_live();
        if live.is_empty() {
            return;
        }
        let state = self.state.read().unwrap();
        for entry in live.into_iter().filter(|e| !e.revoked) {
            let terminal = match state.job(entry.job_id) {
                Some(job) => job.state.is_terminal(),
                None => true,
            };
            if terminal {
                self.creds.revoke(entry.job_id, 0, now);
            }
        }
    }

    /// Terminal jobs older than MinJobAge leave the table.
    fn purge_old_jobs(&self, now: u64) {
        let mut state = self.state.write().unwrap();
        let purged = state.purge_terminal_jobs(self.config.min_job_age, now);
        if purged > 0 {
            log::debug!("Purged {purged} terminal jobs");
        }
    }

    fn save_snapshot(&self, now: u64) {
        let path = self.config.state_save_location.join("state.bin");
        let state = self.state.read().unwrap();
        if let Err(e) = snapshot::save(&state, &self.creds, &path, now) {
            log::error!("State snapshot to {} failed: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::request::JobRequestBuilder;
    use crate::state::job::JobResources;
    use crate::state::node::{NodeCounts, NodeState};
    use crate::state::partition::SharedPolicy;
    use crate::state::{new_state_ref, StateStore};
    use crate::common::bitmap::Bitmap;
    use crate::cred::Credential;
    use crate::{NodeId, PartitionId};

    fn test_config(dir: &std::path::Path) -> ControllerConfig {
        ControllerConfig {
            kill_wait: Duration::from_secs(5),
            state_save_location: dir.to_path_buf(),
            state_save_interval: Duration::from_secs(1_000_000),
            block_poll_interval: Duration::ZERO,
            fabric_poll_interval: Duration::ZERO,
            ..ControllerConfig::default()
        }
    }

    /// Two idle nodes, one partition, one running job on node 0.
    fn store_with_running_job(now: u64) -> (StateRef, JobId) {
        let mut store = StateStore::new();
        let config = store
            .add_config(
                2,
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
        for name in ["n01", "n02"] {
            let id = store.add_node(name, config, None).unwrap();
            store.set_node_state(id, NodeState::Idle).unwrap();
        }
        let part = store.add_partition("batch", 1, SharedPolicy::Yes(1)).unwrap();
        store.assign_node(NodeId::new(0), part).unwrap();
        store.assign_node(NodeId::new(1), part).unwrap();
        let job = store
            .create_job(
                100,
                "t".into(),
                PartitionId::new(0),
                0,
                Duration::from_secs(10),
                JobRequestBuilder::new().procs(1).finish(),
                now,
                100,
            )
            .unwrap();
        store
            .commit_allocation(
                job,
                0,
                Bitmap::from_indices(2, [0]),
                JobResources {
                    nhosts: 1,
                    nprocs: 1,
                    cpus: vec![1],
                    memory_allocated: vec![0],
                    tasks_per_node: vec![1],
                    core_bitmap: Bitmap::from_indices(4, [0]),
                },
                now,
            )
            .unwrap();
        (new_state_ref(store), job)
    }

    fn reconciler(state: StateRef, dir: &std::path::Path) -> (Reconciler, Arc<CredentialEngine>) {
        let creds =
            Arc::new(CredentialEngine::with_generated_key(Duration::from_secs(600)).unwrap());
        let r = Reconciler::new(state, Arc::clone(&creds), None, None, test_config(dir));
        (r, creds)
    }

    #[tokio::test]
    async fn test_timeout_sweep_revokes_credential() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1000;
        let (state, job) = store_with_running_job(now);
        let (reconciler, creds) = reconciler(state.clone(), dir.path());
        creds
            .sign(Credential {
                job_id: job,
                uid: 100,
                node_list: "n01".into(),
                expiration: now + 600,
            })
            .unwrap();

        let mut timers = Timers::default();
        // Inside limit + kill_wait: nothing happens.
        reconciler.tick(now + 10, &mut timers).await;
        assert_eq!(state.read().unwrap().job(job).unwrap().state, JobState::Running);

        reconciler.tick(now + 16, &mut timers).await;
        let store = state.read().unwrap();
        assert_eq!(store.job(job).unwrap().state, JobState::Timeout);
        assert!(creds.is_revoked(job));
        // The node went back to idle.
        assert!(store.idle_node_bitmap().test(0));
    }

    #[tokio::test]
    async fn test_terminal_job_credential_revoked_within_tick() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1000;
        let (state, job) = store_with_running_job(now);
        let (reconciler, creds) = reconciler(state.clone(), dir.path());
        creds
            .sign(Credential {
                job_id: job,
                uid: 100,
                node_list: "n01".into(),
                expiration: now + 600,
            })
            .unwrap();
        state
            .write()
            .unwrap()
            .finish_job(job, JobState::Complete, now + 1)
            .unwrap();

        let mut timers = Timers::default();
        reconciler.tick(now + 2, &mut timers).await;
        assert!(creds.is_revoked(job));
    }

    #[tokio::test]
    async fn test_old_terminal_jobs_are_purged() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1000;
        let (state, job) = store_with_running_job(now);
        let (reconciler, _creds) = reconciler(state.clone(), dir.path());
        state
            .write()
            .unwrap()
            .finish_job(job, JobState::Complete, now + 1)
            .unwrap();

        let mut timers = Timers::default();
        // Younger than MinJobAge: kept for queries.
        reconciler.tick(now + 10, &mut timers).await;
        assert!(state.read().unwrap().job(job).is_some());

        reconciler.tick(now + 500, &mut timers).await;
        assert!(state.read().unwrap().job(job).is_none());
    }

    #[tokio::test]
    async fn test_failed_node_sweep_marks_down() {
        use crate::blocks::fabric::SimFabric;

        let dir = tempfile::tempdir().unwrap();
        let now = 1000;
        let (state, job) = store_with_running_job(now);
        let creds =
            Arc::new(CredentialEngine::with_generated_key(Duration::from_secs(600)).unwrap());
        let sim = SimFabric::new();
        sim.set_down_nodes(vec!["n01".into(), "n02".into()]);
        let fabric: Arc<dyn Fabric> = Arc::new(sim);
        let reconciler = Reconciler::new(
            state.clone(),
            Arc::clone(&creds),
            None,
            Some(fabric),
            test_config(dir.path()),
        );

        let mut timers = Timers::default();
        reconciler.tick(now, &mut timers).await;
        let store = state.read().unwrap();
        assert_eq!(store.node(NodeId::new(0)).unwrap().state, NodeState::Down);
        assert_eq!(store.node(NodeId::new(1)).unwrap().state, NodeState::Down);
        assert!(!store.up_node_bitmap().test(0));
        // The job running on the failed node was evicted with its
        // credential revoked, so the invariants still hold.
        assert_eq!(store.job(job).unwrap().state, JobState::NodeFail);
        assert!(creds.is_revoked(job));
        assert!(store.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1000;
        let (state, _job) = store_with_running_job(now);
        let (reconciler, _creds) = reconciler(state, dir.path());

        let cancel = CancellationToken::new();
        let handle = reconciler.spawn(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
        assert!(dir.path().join("state.bin").exists());
    }
}

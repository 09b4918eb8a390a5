//! Consumable-resource selector.
//!
//! `cr_job_test` answers "where can this job run right now" against the
//! live partition rows. It sweeps four passes of decreasing optimism:
//! fully idle cores, idle ignoring lower-priority usage, idle within the
//! same priority, and finally row packing inside the job's partition.

pub mod eval;
pub mod fit;
pub mod layout;
pub mod request;

use crate::common::bitmap::Bitmap;
use crate::common::error::SlateError;
use crate::select::eval::choose_nodes;
use crate::select::fit::{effective_threads, fit_node, verify_node_states};
use crate::select::layout::NodeLayout;
use crate::select::request::{CrType, JobRequest, MemPolicy, NodeUse, TaskDist};
use crate::state::job::JobResources;
use crate::state::partition::Partition;
use crate::PartitionId;

/// A successful placement: which nodes, which cores, how many cpus per
/// selected node, and which partition row the allocation joins.
#[derive(Debug, Clone)]
pub struct Selection {
    pub nodes: Bitmap,
    pub cores: Bitmap,
    /// Cpus granted per selected node, in node-index order.
    pub cpus: Vec<u32>,
    pub row: u32,
}

struct Fit {
    nodes: Bitmap,
    cores: Bitmap,
    cpus: Vec<u32>,
}

/// One fit attempt against a fixed set of busy cores.
#[allow(clippy::too_many_arguments)]
fn try_fit(
    req: &JobRequest,
    layout: &NodeLayout,
    cr: CrType,
    avail: &Bitmap,
    free_memory: &[u64],
    node_use: &[NodeUse],
    used_cores: &Bitmap,
) -> crate::Result<Option<Fit>> {
    let mut working = verify_node_states(req, cr, avail, free_memory, node_use)?;

    let mut cpu_cnt = vec![0u32; layout.node_count()];
    let mut picks = Bitmap::new(layout.total_cores);
    for node in working.clone().iter_set() {
        let mut cpus = fit_node(req, layout, cr, node, used_cores, &mut picks);
        if cr.tracks_memory() {
            if let Some(MemPolicy::PerCpu(per_cpu)) = req.mem_policy {
                // Deferred memory check: cap cpus to what memory backs.
                let cap = (free_memory[node] / per_cpu.max(1)) as u32;
                let capped = (cpus.min(cap) / req.cpus_per_task) * req.cpus_per_task;
                if capped < cpus {
                    cpus = capped;
                    trim_node_cores(
                        &mut picks,
                        layout,
                        node,
                        effective_threads(req, layout, node),
                        cpus,
                    );
                }
            }
        }
        cpu_cnt[node] = cpus;
        let required = req.req_nodes.as_ref().is_some_and(|r| r.test(node));
        if cpus == 0 && !required {
            working.clear(node);
            trim_node_cores(&mut picks, layout, node, 1, 0);
        }
    }

    if working.count() < req.min_nodes as usize {
        return Ok(None);
    }
    let Some(selected) = choose_nodes(req, &working, &cpu_cnt) else {
        return Ok(None);
    };

    let mut cores = Bitmap::new(layout.total_cores);
    let mut cpus = Vec::with_capacity(selected.count());
    for node in selected.iter_set() {
        for index in layout.core_range(node) {
            if picks.test(index) {
                cores.set(index);
            }
        }
        cpus.push(cpu_cnt[node]);
    }
    Ok(Some(Fit {
        nodes: selected,
        cores,
        cpus,
    }))
}

/// Keeps the first picked cores of `node` backing `keep_cpus` cpus and
/// clears the rest.
fn trim_node_cores(
    core_bitmap: &mut Bitmap,
    layout: &NodeLayout,
    node: usize,
    threads: u32,
    keep_cpus: u32,
) {
    let mut granted = 0;
    for index in layout.core_range(node) {
        if !core_bitmap.test(index) {
            continue;
        }
        if granted >= keep_cpus {
            core_bitmap.clear(index);
        } else {
            granted += threads;
        }
    }
}

/// Could the job fit on these nodes if the partition were completely
/// idle? Distinguishes a permanent misfit from a transient one.
fn fits_when_idle(
    req: &JobRequest,
    layout: &NodeLayout,
    cr: CrType,
    avail: &Bitmap,
) -> crate::Result<bool> {
    let idle_use = vec![NodeUse::Free; layout.node_count()];
    let no_cores = Bitmap::new(layout.total_cores);
    Ok(try_fit(req, layout, cr, avail, &layout.real_memory, &idle_use, &no_cores)?.is_some())
}

/// Four-pass placement sweep.
///
/// Pass 1 fits against every core any partition row holds. Pass 2 drops
/// everything but higher-priority usage; its failure means the job is
/// blocked for as long as that usage persists. Pass 3 adds back
/// same-priority usage, pass 4 tries each row of the job's own partition
/// in turn, least dense first, with an empty row as the last resort.
#[allow(clippy::too_many_arguments)]
pub fn cr_job_test(
    req: &JobRequest,
    layout: &NodeLayout,
    cr: CrType,
    avail: &Bitmap,
    free_memory: &[u64],
    node_use: &[NodeUse],
    partition: PartitionId,
    partitions: &[Partition],
) -> crate::Result<Selection> {
    let target = partitions
        .get(usize::from(partition))
        .ok_or_else(|| SlateError::InvalidRequest(format!("unknown partition {partition}")))?;

    let mut all_used = Bitmap::new(layout.total_cores);
    let mut hp_used = Bitmap::new(layout.total_cores);
    let mut sp_used = Bitmap::new(layout.total_cores);
    for part in partitions {
        for row in &part.rows {
            all_used.or_with(&row.core_bitmap);
            if part.priority > target.priority {
                hp_used.or_with(&row.core_bitmap);
                sp_used.or_with(&row.core_bitmap);
            } else if part.priority == target.priority {
                sp_used.or_with(&row.core_bitmap);
            }
        }
    }

    // Pass 1: everything currently used is busy.
    if let Some(fit) = try_fit(req, layout, cr, avail, free_memory, node_use, &all_used)? {
        // All rows were subtracted, so the first row always qualifies.
        let row = target
            .rows
            .iter()
            .position(|r| r.core_bitmap.is_disjoint(&fit.cores))
            .unwrap_or(0);
        return Ok(selection(fit, row as u32));
    }

    // Pass 2: only higher-priority usage is busy. Failure here means no
    // amount of same- or lower-priority churn can free the job.
    if try_fit(req, layout, cr, avail, free_memory, node_use, &hp_used)?.is_none() {
        return Err(infeasible(req, layout, cr, avail)?);
    }

    // Pass 3: same- and higher-priority usage is busy.
    if let Some(fit) = try_fit(req, layout, cr, avail, free_memory, node_use, &sp_used)? {
        let row = target
            .rows
            .iter()
            .position(|r| r.core_bitmap.is_disjoint(&fit.cores))
            .unwrap_or(0);
        return Ok(selection(fit, row as u32));
    }

    // Pass 4: row packing. Base usage excludes the job's own partition.
    let mut base = hp_used;
    for part in partitions {
        if part.priority == target.priority && part.id != target.id {
            for row in &part.rows {
                base.or_with(&row.core_bitmap);
            }
        }
    }
    let mut order: Vec<usize> = (0..target.rows.len())
        .filter(|r| !target.rows[*r].is_empty())
        .collect();
    order.sort_by_key(|r| target.rows[*r].density());
    for row in order {
        let mut used = base.clone();
        used.or_with(&target.rows[row].core_bitmap);
        if let Some(fit) = try_fit(req, layout, cr, avail, free_memory, node_use, &used)? {
            return Ok(selection(fit, row as u32));
        }
    }
    if let Some(row) = target.rows.iter().position(|r| r.is_empty()) {
        if let Some(fit) = try_fit(req, layout, cr, avail, free_memory, node_use, &base)? {
            return Ok(selection(fit, row as u32));
        }
    }
    Err(infeasible(req, layout, cr, avail)?)
}

fn selection(fit: Fit, row: u32) -> Selection {
    Selection {
        nodes: fit.nodes,
        cores: fit.cores,
        cpus: fit.cpus,
        row,
    }
}

fn infeasible(
    req: &JobRequest,
    layout: &NodeLayout,
    cr: CrType,
    avail: &Bitmap,
) -> crate::Result<SlateError> {
    Ok(if fits_when_idle(req, layout, cr, avail)? {
        SlateError::InfeasibleNow
    } else {
        SlateError::InfeasibleEver("request cannot fit the partition even when idle".into())
    })
}

/// Commit-side resource accounting: distribute tasks over the selected
/// nodes and drop cores no task needs.
pub fn build_job_resources(
    req: &JobRequest,
    selection: &Selection,
    layout: &NodeLayout,
) -> JobResources {
    let nodes: Vec<usize> = selection.nodes.iter_set().collect();
    let mut cpus = selection.cpus.clone();
    let mut core_bitmap = selection.cores.clone();

    let total_tasks = if req.num_tasks > 0 {
        req.num_tasks
    } else {
        (req.num_procs / req.cpus_per_task).max(1)
    };
    let capacity: Vec<u32> = cpus.iter().map(|c| c / req.cpus_per_task).collect();
    let tasks_per_node = distribute_tasks(total_tasks, &capacity, req.distribution);

    for (i, node) in nodes.iter().copied().enumerate() {
        let need = tasks_per_node[i] * req.cpus_per_task;
        if need < cpus[i] {
            cpus[i] = need;
            trim_node_cores(
                &mut core_bitmap,
                layout,
                node,
                effective_threads(req, layout, node),
                need,
            );
        }
    }

    let memory_allocated: Vec<u64> = match req.mem_policy {
        Some(MemPolicy::PerCpu(per)) => cpus.iter().map(|c| per * *c as u64).collect(),
        Some(MemPolicy::PerNode(per)) => vec![per; nodes.len()],
        None => vec![0; nodes.len()],
    };

    JobResources {
        nhosts: nodes.len() as u32,
        nprocs: cpus.iter().sum(),
        cpus,
        memory_allocated,
        tasks_per_node,
        core_bitmap,
    }
}

/// Block fills each node to capacity in turn; cyclic deals tasks one at
/// a time round-robin. Leftover tasks past total capacity pile on the
/// cpu-bearing nodes round-robin so the count is never lost.
fn distribute_tasks(total: u32, capacity: &[u32], dist: TaskDist) -> Vec<u32> {
    let mut tasks = vec![0u32; capacity.len()];
    let mut rem = total;
    // A required node can be selected with no free cpus; it hosts no
    // tasks. Every node that contributes cpus hosts at least one.
    let hosts = capacity.iter().filter(|c| **c > 0).count();
    if rem as usize >= hosts {
        for (t, cap) in tasks.iter_mut().zip(capacity) {
            if *cap > 0 {
                *t = 1;
                rem -= 1;
            }
        }
    }
    match dist {
        TaskDist::Block => {
            for (t, cap) in tasks.iter_mut().zip(capacity) {
                let take = rem.min(cap.saturating_sub(*t));
                *t += take;
                rem -= take;
            }
        }
        TaskDist::Cyclic => loop {
            let mut progressed = false;
            for (t, cap) in tasks.iter_mut().zip(capacity) {
                if rem > 0 && *t < *cap {
                    *t += 1;
                    rem -= 1;
                    progressed = true;
                }
            }
            if rem == 0 || !progressed {
                break;
            }
        },
    }
    let mut i = 0;
    while rem > 0 && hosts > 0 {
        let idx = i % tasks.len();
        if capacity[idx] > 0 {
            tasks[idx] += 1;
            rem -= 1;
        }
        i += 1;
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::request::{JobNodeReq, JobRequestBuilder};
    use crate::state::partition::{Partition, SharedPolicy};
    use crate::PartitionId;

    /// Four nodes of 2, 2, 2 and 4 single-thread cores.
    fn small_layout() -> NodeLayout {
        NodeLayout::build([
            (1, 2, 1, 1024),
            (1, 2, 1, 1024),
            (1, 2, 1, 1024),
            (1, 4, 1, 1024),
        ])
    }

    fn partition(layout: &NodeLayout, shared: SharedPolicy) -> Vec<Partition> {
        let mut part = Partition::new(
            PartitionId::new(0),
            "batch".to_string(),
            10,
            shared,
            layout.node_count(),
            layout.total_cores,
        );
        part.node_bitmap = Bitmap::filled(layout.node_count());
        vec![part]
    }

    /// Builds the trimmed resources and places them into the chosen row.
    fn commit(
        partitions: &mut [Partition],
        layout: &NodeLayout,
        req: &JobRequest,
        sel: &Selection,
    ) -> JobResources {
        let resources = build_job_resources(req, sel, layout);
        let row = &mut partitions[0].rows[sel.row as usize];
        assert!(row.core_bitmap.is_disjoint(&resources.core_bitmap));
        row.core_bitmap.or_with(&resources.core_bitmap);
        row.job_count += 1;
        resources
    }

    fn test_select(
        req: &JobRequest,
        layout: &NodeLayout,
        node_use: &[NodeUse],
        partitions: &[Partition],
    ) -> crate::Result<Selection> {
        cr_job_test(
            req,
            layout,
            CrType::Cpu,
            &Bitmap::filled(layout.node_count()),
            &layout.real_memory,
            node_use,
            PartitionId::new(0),
            partitions,
        )
    }

    #[test]
    fn test_disjoint_jobs_share_a_row() {
        let layout = small_layout();
        let mut parts = partition(&layout, SharedPolicy::Yes(2));
        let free = vec![NodeUse::Free; 4];
        let shared = vec![NodeUse::Shared; 4];

        // Three single-cpu tasks land on the three small nodes.
        let j2 = JobRequestBuilder::new().procs(3).nodes(3, 3).finish();
        let sel = test_select(&j2, &layout, &free, &parts).unwrap();
        assert_eq!(sel.nodes.iter_set().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(sel.row, 0);
        let res = commit(&mut parts, &layout, &j2, &sel);
        assert_eq!(res.cpus, vec![1, 1, 1]);
        assert_eq!(res.tasks_per_node, vec![1, 1, 1]);

        // Two cpus on one node only fit the big node; the weak-node
        // retry finds it.
        let j3 = JobRequestBuilder::new().procs(2).nodes(1, 1).finish();
        let sel = test_select(&j3, &layout, &shared, &parts).unwrap();
        assert_eq!(sel.nodes.iter_set().collect::<Vec<_>>(), vec![3]);
        assert_eq!(sel.row, 0);
        commit(&mut parts, &layout, &j3, &sel);

        // A second three-task job takes the remaining cpu of each small
        // node, still disjoint within row 0.
        let j4 = JobRequestBuilder::new().procs(3).nodes(3, 3).finish();
        let sel = test_select(&j4, &layout, &shared, &parts).unwrap();
        assert_eq!(sel.nodes.iter_set().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(sel.row, 0);
        let res = commit(&mut parts, &layout, &j4, &sel);
        assert_eq!(res.cpus, vec![1, 1, 1]);
    }

    #[test]
    fn test_reserved_job_waits_for_busy_nodes() {
        let layout = small_layout();
        let parts = partition(&layout, SharedPolicy::Yes(2));
        // Every node hosts someone, so a whole-node job cannot start,
        // but it would fit an idle partition.
        let shared = vec![NodeUse::Shared; 4];
        let j1 = JobRequestBuilder::new()
            .procs(4)
            .nodes(4, 4)
            .node_req(JobNodeReq::Reserved)
            .finish();
        assert!(matches!(
            test_select(&j1, &layout, &shared, &parts),
            Err(SlateError::InfeasibleNow)
        ));
    }

    #[test]
    fn test_exclusive_partition_serialises_jobs() {
        let layout = small_layout();
        let mut parts = partition(&layout, SharedPolicy::No);
        let free = vec![NodeUse::Free; 4];

        let j1 = JobRequestBuilder::new()
            .procs(4)
            .nodes(4, 4)
            .node_req(JobNodeReq::Reserved)
            .finish();
        let sel = test_select(&j1, &layout, &free, &parts).unwrap();
        assert_eq!(sel.nodes.count(), 4);
        commit(&mut parts, &layout, &j1, &sel);

        // With every node reserved the next job waits.
        let reserved = vec![NodeUse::Reserved; 4];
        let j2 = JobRequestBuilder::new()
            .procs(3)
            .nodes(3, 3)
            .node_req(JobNodeReq::Reserved)
            .finish();
        assert!(matches!(
            test_select(&j2, &layout, &reserved, &parts),
            Err(SlateError::InfeasibleNow)
        ));
    }

    #[test]
    fn test_oversized_request_is_infeasible_ever() {
        let layout = small_layout();
        let parts = partition(&layout, SharedPolicy::Yes(2));
        let free = vec![NodeUse::Free; 4];
        let req = JobRequestBuilder::new().procs(64).nodes(5, 0).finish();
        assert!(matches!(
            test_select(&req, &layout, &free, &parts),
            Err(SlateError::InfeasibleEver(_))
        ));
    }

    #[test]
    fn test_per_cpu_memory_caps_node_cpus() {
        // Node has 4 cpus but memory backs only 2 of them.
        let layout = NodeLayout::build([(1, 4, 1, 1024)]);
        let mut parts = partition(&layout, SharedPolicy::Yes(1));
        parts[0].node_bitmap = Bitmap::filled(1);
        let req = JobRequestBuilder::new()
            .procs(2)
            .nodes(1, 1)
            .mem_per_cpu(512)
            .finish();
        let sel = cr_job_test(
            &req,
            &layout,
            CrType::CpuMemory,
            &Bitmap::filled(1),
            &[1024],
            &[NodeUse::Free],
            PartitionId::new(0),
            &parts,
        )
        .unwrap();
        assert_eq!(sel.cpus, vec![2]);
        assert_eq!(sel.cores.count(), 2);

        let resources = build_job_resources(&req, &sel, &layout);
        assert_eq!(resources.memory_allocated, vec![1024]);
    }

    #[test]
    fn test_row_packing_keeps_overlap_out_of_a_row() {
        let layout = small_layout();
        let mut parts = partition(&layout, SharedPolicy::Force(2));
        // Row 0 holds every core; a new job must land in row 1.
        parts[0].rows[0].core_bitmap = Bitmap::filled(layout.total_cores);
        parts[0].rows[0].job_count = 4;
        let req = JobRequestBuilder::new().procs(2).nodes(1, 1).finish();
        let shared = vec![NodeUse::Shared; 4];
        let sel = test_select(&req, &layout, &shared, &parts).unwrap();
        assert_eq!(sel.row, 1);
        assert!(parts[0].rows[1].core_bitmap.is_disjoint(&sel.cores));
    }

    fn shared_partition(layout: &NodeLayout, id: u32, name: &str, priority: i32) -> Partition {
        let mut part = Partition::new(
            PartitionId::new(id),
            name.to_string(),
            priority,
            SharedPolicy::Yes(1),
            layout.node_count(),
            layout.total_cores,
        );
        part.node_bitmap = Bitmap::filled(layout.node_count());
        part
    }

    #[test]
    fn test_higher_priority_usage_blocks_lower_partition() {
        let layout = small_layout();
        let shared = vec![NodeUse::Shared; 4];
        let req = JobRequestBuilder::new().procs(1).nodes(1, 1).finish();

        // A running job in the high-priority partition holds every core
        // of the shared nodes.
        let mut hi = shared_partition(&layout, 0, "hi", 100);
        hi.rows[0].core_bitmap = Bitmap::filled(layout.total_cores);
        hi.rows[0].job_count = 1;
        let parts = vec![hi, shared_partition(&layout, 1, "lo", 10)];

        // The low-priority job would fit an idle machine, so it waits
        // rather than being rejected outright.
        let blocked = cr_job_test(
            &req,
            &layout,
            CrType::Cpu,
            &Bitmap::filled(4),
            &layout.real_memory,
            &shared,
            PartitionId::new(1),
            &parts,
        );
        assert!(matches!(blocked, Err(SlateError::InfeasibleNow)));

        // The reverse direction overcommits: low-priority usage does not
        // stop a high-priority job.
        let mut lo = shared_partition(&layout, 1, "lo", 10);
        lo.rows[0].core_bitmap = Bitmap::filled(layout.total_cores);
        lo.rows[0].job_count = 1;
        let parts = vec![shared_partition(&layout, 0, "hi", 100), lo];
        let sel = cr_job_test(
            &req,
            &layout,
            CrType::Cpu,
            &Bitmap::filled(4),
            &layout.real_memory,
            &shared,
            PartitionId::new(0),
            &parts,
        )
        .unwrap();
        assert_eq!(sel.cpus.iter().sum::<u32>(), 1);
        assert_eq!(sel.row, 0);
    }

    #[test]
    fn test_block_and_cyclic_distribution() {
        assert_eq!(
            distribute_tasks(5, &[4, 4], TaskDist::Block),
            vec![4, 1]
        );
        assert_eq!(
            distribute_tasks(5, &[4, 4], TaskDist::Cyclic),
            vec![3, 2]
        );
        // Overflow past capacity piles round-robin.
        assert_eq!(
            distribute_tasks(6, &[2, 2], TaskDist::Block),
            vec![3, 3]
        );
    }

    #[test]
    fn test_zero_capacity_node_hosts_no_tasks() {
        // A pinned node selected with no free cpus contributes nothing.
        assert_eq!(
            distribute_tasks(3, &[0, 2, 2], TaskDist::Block),
            vec![0, 2, 1]
        );
        assert_eq!(
            distribute_tasks(6, &[0, 2, 2], TaskDist::Cyclic),
            vec![0, 3, 3]
        );
    }

    #[test]
    fn test_build_resources_trims_unused_cores() {
        let layout = NodeLayout::build([(1, 4, 1, 1024), (1, 4, 1, 1024)]);
        let selection = Selection {
            nodes: Bitmap::filled(2),
            cores: Bitmap::filled(8),
            cpus: vec![4, 4],
            row: 0,
        };
        let req = JobRequestBuilder::new().procs(5).nodes(2, 2).finish();
        let resources = build_job_resources(&req, &selection, &layout);
        assert_eq!(resources.tasks_per_node, vec![4, 1]);
        assert_eq!(resources.cpus, vec![4, 1]);
        assert_eq!(resources.nprocs, 5);
        // Node 1 keeps a single core.
        assert_eq!(resources.core_bitmap.count(), 5);
    }
}

//! Per-node fitting: stage one drops nodes whose memory or sharing policy
//! excludes the job, stage two computes how many cpus each surviving node
//! can contribute and which cores back them.

use crate::common::bitmap::Bitmap;
use crate::common::error::SlateError;
use crate::select::layout::NodeLayout;
use crate::select::request::{CrType, JobNodeReq, JobRequest, MemPolicy, NodeUse};

/// Drops nodes that cannot host the job regardless of free cores.
///
/// A dropped node that the job explicitly required fails the whole
/// request: no alternative selection can satisfy it.
pub fn verify_node_states(
    req: &JobRequest,
    cr: CrType,
    avail: &Bitmap,
    free_memory: &[u64],
    node_use: &[NodeUse],
) -> crate::Result<Bitmap> {
    let mut working = avail.clone();
    for bit in avail.iter_set() {
        let mut keep = true;
        if cr.tracks_memory() {
            if let Some(MemPolicy::PerNode(min)) = req.mem_policy {
                // PerCpu is deferred until cpus are chosen.
                if free_memory[bit] < min {
                    keep = false;
                }
            }
        }
        if keep {
            keep = match node_use[bit] {
                NodeUse::Free => true,
                NodeUse::Reserved => false,
                NodeUse::OneRow => req.node_req == JobNodeReq::OneRow,
                NodeUse::Shared => req.node_req != JobNodeReq::Reserved,
            };
        }
        if !keep {
            if req.req_nodes.as_ref().is_some_and(|r| r.test(bit)) {
                return Err(SlateError::InfeasibleEver(
                    "a required node is excluded by memory or sharing policy".into(),
                ));
            }
            working.clear(bit);
        }
    }
    Ok(working)
}

/// Cpus the node can contribute; selected cores are recorded in
/// `core_pick` (global core indices). Returns 0 when the node cannot
/// host even one task.
pub fn fit_node(
    req: &JobRequest,
    layout: &NodeLayout,
    cr: CrType,
    node: usize,
    used_cores: &Bitmap,
    core_pick: &mut Bitmap,
) -> u32 {
    if cr.tracks_sockets() {
        fit_sockets(req, layout, node, used_cores, core_pick, false)
    } else if cr.tracks_cores() {
        fit_sockets(req, layout, node, used_cores, core_pick, true)
    } else {
        fit_cpus(req, layout, node, used_cores, core_pick)
    }
}

/// Socket- and core-level fitter. With `share_sockets` a socket partially
/// used by another job keeps its free cores; without it any used core
/// poisons the whole socket.
fn fit_sockets(
    req: &JobRequest,
    layout: &NodeLayout,
    node: usize,
    used_cores: &Bitmap,
    core_pick: &mut Bitmap,
    share_sockets: bool,
) -> u32 {
    let sockets = layout.sockets[node] as usize;
    let cores_per_socket = layout.cores_per_socket[node] as usize;
    let threads = effective_threads(req, layout, node);
    let offset = layout.core_offset[node];

    let mut free_cores = vec![0u32; sockets];
    let mut socket_used = vec![false; sockets];
    for socket in 0..sockets {
        for core in 0..cores_per_socket {
            if used_cores.test(offset + socket * cores_per_socket + core) {
                socket_used[socket] = true;
            } else {
                free_cores[socket] += 1;
            }
        }
    }
    if !share_sockets {
        // Sockets are not shared between jobs.
        for socket in 0..sockets {
            if socket_used[socket] {
                free_cores[socket] = 0;
            }
        }
    }

    // min_cores per socket, then min_sockets per node.
    for free in &mut free_cores {
        if *free < req.min_cores {
            *free = 0;
        }
    }
    let usable = free_cores.iter().filter(|f| **f > 0).count() as u32;
    if usable < req.min_sockets {
        return 0;
    }

    // max_cores per socket, max_sockets per node: trim the excess.
    if req.max_cores > 0 {
        for free in &mut free_cores {
            *free = (*free).min(req.max_cores);
        }
    }
    if req.max_sockets > 0 && usable > req.max_sockets {
        let mut order: Vec<usize> = (0..sockets).collect();
        order.sort_by_key(|s| std::cmp::Reverse(free_cores[*s]));
        for socket in order.into_iter().skip(req.max_sockets as usize) {
            free_cores[socket] = 0;
        }
    }

    let mut socket_cpus: Vec<u32> = free_cores.iter().map(|f| f * threads).collect();
    if req.ntasks_per_socket > 0 {
        let cap = req.ntasks_per_socket * req.cpus_per_task;
        for cpus in &mut socket_cpus {
            *cpus = (*cpus).min(cap);
        }
    }
    let mut avail_cpus: u32 = socket_cpus.iter().sum();
    if req.ntasks_per_node > 0 {
        avail_cpus = avail_cpus.min(req.ntasks_per_node * req.cpus_per_task);
    }
    if req.cpus_per_task > 1 {
        avail_cpus -= avail_cpus % req.cpus_per_task;
    }
    if avail_cpus < req.cpus_per_task {
        return 0;
    }

    // Core selection walks cores in index order, tie-broken by the
    // per-socket cpu budget so that ntasks_per_socket holds.
    let mut remaining = avail_cpus;
    'sockets: for socket in 0..sockets {
        let mut budget = socket_cpus[socket].min(remaining);
        if budget == 0 {
            continue;
        }
        for core in 0..cores_per_socket {
            let index = offset + socket * cores_per_socket + core;
            if used_cores.test(index) || (!share_sockets && socket_used[socket]) {
                continue;
            }
            core_pick.set(index);
            let granted = threads.min(budget);
            budget -= granted;
            remaining = remaining.saturating_sub(granted);
            if budget == 0 {
                if remaining == 0 {
                    break 'sockets;
                }
                break;
            }
        }
    }
    avail_cpus
}

/// Cpu-level fitter: every free core counts as `threads_per_core` cpus,
/// with no locality constraints.
fn fit_cpus(
    req: &JobRequest,
    layout: &NodeLayout,
    node: usize,
    used_cores: &Bitmap,
    core_pick: &mut Bitmap,
) -> u32 {
    let threads = effective_threads(req, layout, node);
    let free: Vec<usize> = layout
        .core_range(node)
        .filter(|index| !used_cores.test(*index))
        .collect();
    let mut avail_cpus = free.len() as u32 * threads;
    if req.ntasks_per_node > 0 {
        avail_cpus = avail_cpus.min(req.ntasks_per_node * req.cpus_per_task);
    }
    if req.cpus_per_task > 1 {
        avail_cpus -= avail_cpus % req.cpus_per_task;
    }
    if avail_cpus < req.cpus_per_task {
        return 0;
    }
    let mut remaining = avail_cpus;
    for index in free {
        if remaining == 0 {
            break;
        }
        core_pick.set(index);
        remaining = remaining.saturating_sub(threads);
    }
    avail_cpus
}

pub(crate) fn effective_threads(req: &JobRequest, layout: &NodeLayout, node: usize) -> u32 {
    let threads = layout.threads_per_core[node];
    if req.max_threads > 0 {
        threads.min(req.max_threads)
    } else {
        threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::request::JobRequestBuilder;

    #[test]
    fn test_socket_fit_trims_and_caps() {
        // One node, 2 sockets x 4 cores x 2 threads.
        let layout = NodeLayout::uniform(1, 2, 4, 2);
        let req = JobRequestBuilder::new()
            .sockets(2, 0)
            .cores(2, 3)
            .cpus_per_task(2)
            .ntasks_per_socket(2)
            .finish();
        let used = Bitmap::new(layout.total_cores);
        let mut pick = Bitmap::new(layout.total_cores);
        let cpus = fit_node(&req, &layout, CrType::Socket, 0, &used, &mut pick);
        assert_eq!(cpus, 8);
        // Two cores selected on each socket.
        let socket0: Vec<usize> = pick.iter_set().filter(|c| *c < 4).collect();
        let socket1: Vec<usize> = pick.iter_set().filter(|c| *c >= 4).collect();
        assert_eq!(socket0.len(), 2);
        assert_eq!(socket1.len(), 2);
    }

    #[test]
    fn test_socket_fit_rejects_shared_socket() {
        let layout = NodeLayout::uniform(1, 2, 2, 1);
        let req = JobRequestBuilder::new().procs(2).finish();
        // One core of socket 0 is used by another job.
        let used = Bitmap::from_indices(layout.total_cores, [0]);
        let mut pick = Bitmap::new(layout.total_cores);
        let cpus = fit_node(&req, &layout, CrType::Socket, 0, &used, &mut pick);
        // Socket 0 is poisoned; only socket 1 contributes.
        assert_eq!(cpus, 2);
        assert_eq!(pick.iter_set().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_core_fit_shares_sockets() {
        let layout = NodeLayout::uniform(1, 2, 2, 1);
        let req = JobRequestBuilder::new().procs(2).finish();
        let used = Bitmap::from_indices(layout.total_cores, [0]);
        let mut pick = Bitmap::new(layout.total_cores);
        let cpus = fit_node(&req, &layout, CrType::Core, 0, &used, &mut pick);
        // Only the used core itself is unavailable.
        assert_eq!(cpus, 3);
    }

    #[test]
    fn test_min_sockets_underflow_drops_node() {
        let layout = NodeLayout::uniform(1, 2, 2, 1);
        let req = JobRequestBuilder::new().sockets(2, 0).finish();
        let used = Bitmap::from_indices(layout.total_cores, [0]);
        let mut pick = Bitmap::new(layout.total_cores);
        assert_eq!(fit_node(&req, &layout, CrType::Socket, 0, &used, &mut pick), 0);
    }

    #[test]
    fn test_cpu_fit_counts_threads() {
        let layout = NodeLayout::uniform(1, 1, 2, 2);
        let req = JobRequestBuilder::new().procs(4).finish();
        let used = Bitmap::new(layout.total_cores);
        let mut pick = Bitmap::new(layout.total_cores);
        assert_eq!(fit_node(&req, &layout, CrType::Cpu, 0, &used, &mut pick), 4);
        assert_eq!(pick.count(), 2);
    }

    #[test]
    fn test_cpus_per_task_floors_to_multiple() {
        let layout = NodeLayout::uniform(1, 1, 3, 1);
        let req = JobRequestBuilder::new().procs(2).cpus_per_task(2).finish();
        let used = Bitmap::new(layout.total_cores);
        let mut pick = Bitmap::new(layout.total_cores);
        assert_eq!(fit_node(&req, &layout, CrType::Cpu, 0, &used, &mut pick), 2);
    }

    #[test]
    fn test_verify_drops_reserved_and_memory() {
        let req = JobRequestBuilder::new().mem_per_node(512).finish();
        let avail = Bitmap::filled(3);
        let free_memory = vec![1024, 100, 1024];
        let node_use = vec![NodeUse::Free, NodeUse::Free, NodeUse::Reserved];
        let working =
            verify_node_states(&req, CrType::CpuMemory, &avail, &free_memory, &node_use).unwrap();
        assert_eq!(working.iter_set().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_verify_fails_on_dropped_required_node() {
        let req = JobRequestBuilder::new()
            .req_nodes(Bitmap::from_indices(2, [1]))
            .finish();
        let avail = Bitmap::filled(2);
        let node_use = vec![NodeUse::Free, NodeUse::Reserved];
        let result = verify_node_states(&req, CrType::Cpu, &avail, &[0, 0], &node_use);
        assert!(matches!(result, Err(SlateError::InfeasibleEver(_))));
    }

    #[test]
    fn test_one_row_request_matches_one_row_node() {
        let req = JobRequestBuilder::new()
            .node_req(JobNodeReq::OneRow)
            .finish();
        let avail = Bitmap::filled(2);
        let node_use = vec![NodeUse::OneRow, NodeUse::Shared];
        let working = verify_node_states(&req, CrType::Cpu, &avail, &[0, 0], &node_use).unwrap();
        // A busy one-row node admits a matching request; a shared node
        // admits anything that is not reserved.
        assert_eq!(working.count(), 2);
    }
}

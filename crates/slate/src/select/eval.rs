//! Node-set evaluation: pick which nodes host the job given the cpus
//! each can contribute.
//!
//! `eval_nodes` works over maximal runs of consecutive available nodes
//! and accumulates greedily; `choose_nodes` retries it with weak nodes
//! cleared to find allocations a pure greedy walk misses.

use crate::common::bitmap::Bitmap;
use crate::select::request::JobRequest;

/// True when `avail` nodes can still complete the selection.
///
/// Required nodes above `min_nodes` relax the bound: each one beyond the
/// minimum is already pinned and does not need a free node.
pub(crate) fn enough_nodes(avail: usize, rem_nodes: i64, min_nodes: u32, req_nodes: u32) -> bool {
    if req_nodes > min_nodes {
        avail as i64 >= rem_nodes + min_nodes as i64 - req_nodes as i64
    } else {
        avail as i64 >= rem_nodes
    }
}

/// A maximal run of consecutive available nodes.
struct Run {
    start: usize,
    end: usize,
    cpus: u32,
    nodes: usize,
    /// Index of the first required node inside the run, if any.
    required: Option<usize>,
    picked: bool,
}

struct Accumulator<'a> {
    req: &'a JobRequest,
    cpu_cnt: &'a [u32],
    selected: Bitmap,
    rem_cpus: i64,
    rem_nodes: i64,
    max_nodes: usize,
    req_count: u32,
}

impl Accumulator<'_> {
    fn satisfied(&self) -> bool {
        self.rem_cpus <= 0 && self.rem_nodes <= 0
    }

    fn full(&self) -> bool {
        self.selected.count() >= self.max_nodes
    }

    /// Adds one node; false when the node ceiling blocks it.
    fn take(&mut self, node: usize) -> bool {
        if self.selected.test(node) {
            return true;
        }
        if self.full() {
            return false;
        }
        self.selected.set(node);
        self.rem_cpus -= self.cpu_cnt[node] as i64;
        self.rem_nodes -= 1;
        true
    }

    /// Walks the run, starting at the required node (if any) and growing
    /// outward, otherwise from the low end.
    fn consume_run(&mut self, run: &Run) {
        let order: Vec<usize> = match run.required {
            Some(pin) => {
                let up = pin..=run.end;
                let down = (run.start..pin).rev();
                up.chain(down).collect()
            }
            None => (run.start..=run.end).collect(),
        };
        for node in order {
            if self.satisfied() {
                return;
            }
            if self.cpu_cnt[node] == 0 && !self.is_required(node) {
                continue;
            }
            if !self.take(node) {
                return;
            }
        }
    }

    fn is_required(&self, node: usize) -> bool {
        self.req.req_nodes.as_ref().is_some_and(|r| r.test(node))
    }
}

/// Greedy selection over consecutive-node runs. Returns the node set or
/// `None` when no selection satisfies the request on this availability.
pub fn eval_nodes(req: &JobRequest, avail: &Bitmap, cpu_cnt: &[u32]) -> Option<Bitmap> {
    let req_count = match &req.req_nodes {
        Some(r) => {
            // Every required node must still be available.
            if !avail.is_superset(r) {
                return None;
            }
            r.count() as u32
        }
        None => 0,
    };
    let max_nodes = req.max_nodes_or_unlimited();
    if (req_count as usize) > max_nodes {
        return None;
    }

    let mut runs: Vec<Run> = Vec::new();
    let mut cursor = avail.first_set();
    while let Some(start) = cursor {
        let mut end = start;
        let mut cpus = cpu_cnt[start];
        let mut required = req
            .req_nodes
            .as_ref()
            .is_some_and(|r| r.test(start))
            .then_some(start);
        while end + 1 < avail.nbits() && avail.test(end + 1) {
            end += 1;
            cpus += cpu_cnt[end];
            if required.is_none() && req.req_nodes.as_ref().is_some_and(|r| r.test(end)) {
                required = Some(end);
            }
        }
        runs.push(Run {
            start,
            end,
            cpus,
            nodes: end - start + 1,
            required,
            picked: false,
        });
        cursor = avail.next_set(end + 1);
    }

    let mut acc = Accumulator {
        req,
        cpu_cnt,
        selected: Bitmap::new(avail.nbits()),
        rem_cpus: req.num_procs as i64,
        rem_nodes: req.min_nodes as i64,
        max_nodes,
        req_count,
    };

    // Required nodes are pinned before any run is weighed.
    if let Some(required) = &req.req_nodes {
        for node in required.iter_set() {
            if !acc.take(node) {
                return None;
            }
        }
    }

    if req.contiguous && runs.iter().filter(|r| r.required.is_some()).count() > 1 {
        // Required nodes span more than one run.
        return None;
    }

    loop {
        let mut best: Option<usize> = None;
        // 1. runs holding a required node come first.
        for (idx, run) in runs.iter().enumerate() {
            if !run.picked && run.required.is_some() {
                best = Some(idx);
                break;
            }
        }
        // 2. the cheapest run sufficient on its own.
        if best.is_none() {
            for (idx, run) in runs.iter().enumerate() {
                if run.picked {
                    continue;
                }
                let sufficient = (run.cpus as i64) >= acc.rem_cpus
                    && enough_nodes(run.nodes, acc.rem_nodes, req.min_nodes, acc.req_count);
                if sufficient && best.is_none_or(|b| run.cpus < runs[b].cpus) {
                    best = Some(idx);
                }
            }
        }
        // 3. otherwise the run with the most cpus.
        if best.is_none() {
            for (idx, run) in runs.iter().enumerate() {
                if !run.picked && best.is_none_or(|b| run.cpus > runs[b].cpus) {
                    best = Some(idx);
                }
            }
        }
        let Some(best) = best else { break };
        runs[best].picked = true;
        acc.consume_run(&runs[best]);
        if acc.satisfied() {
            return Some(acc.selected);
        }
        if req.contiguous {
            // Only one run may contribute.
            break;
        }
    }
    None
}

/// Stage-five driver: greedy first, then a knapsack-style retry that
/// clears every node contributing at most `count` cpus, for rising
/// `count`, so that a few strong nodes can win over many weak ones.
pub fn choose_nodes(req: &JobRequest, avail: &Bitmap, cpu_cnt: &[u32]) -> Option<Bitmap> {
    if let Some(selected) = eval_nodes(req, avail, cpu_cnt) {
        return Some(selected);
    }
    let most_cpus = avail.iter_set().map(|n| cpu_cnt[n]).max().unwrap_or(0);
    for count in 1..most_cpus {
        let mut working = avail.clone();
        for node in avail.iter_set() {
            if cpu_cnt[node] <= count
                && !req.req_nodes.as_ref().is_some_and(|r| r.test(node))
            {
                working.clear(node);
            }
        }
        if working.count() < req.min_nodes as usize {
            continue;
        }
        if let Some(selected) = eval_nodes(req, &working, cpu_cnt) {
            return Some(selected);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::request::JobRequestBuilder;

    #[test]
    fn test_enough_nodes_required_relaxation() {
        assert!(enough_nodes(2, 2, 2, 0));
        assert!(!enough_nodes(1, 2, 2, 0));
        // Three required against min 2: one fewer free node needed.
        assert!(enough_nodes(1, 2, 2, 3));
    }

    #[test]
    fn test_greedy_accumulates_from_run_start() {
        let req = JobRequestBuilder::new().procs(4).nodes(2, 0).finish();
        let avail = Bitmap::filled(6);
        let cpu_cnt = vec![2, 2, 2, 2, 2, 2];
        let selected = eval_nodes(&req, &avail, &cpu_cnt).unwrap();
        assert_eq!(selected.iter_set().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_prefers_smallest_sufficient_run() {
        // Two runs: nodes 0..3 (8 cpus) and 5..6 (4 cpus). A 4-cpu job
        // takes the cheaper sufficient run.
        let avail = Bitmap::from_indices(8, [0, 1, 2, 3, 5, 6]);
        let cpu_cnt = vec![2, 2, 2, 2, 0, 2, 2, 0];
        let req = JobRequestBuilder::new().procs(4).nodes(1, 0).finish();
        let selected = eval_nodes(&req, &avail, &cpu_cnt).unwrap();
        assert_eq!(selected.iter_set().collect::<Vec<_>>(), vec![5, 6]);
    }

    #[test]
    fn test_required_node_pins_and_grows_outward() {
        let avail = Bitmap::filled(5);
        let cpu_cnt = vec![1, 1, 1, 1, 1];
        let req = JobRequestBuilder::new()
            .procs(3)
            .nodes(3, 0)
            .req_nodes(Bitmap::from_indices(5, [2]))
            .finish();
        let selected = eval_nodes(&req, &avail, &cpu_cnt).unwrap();
        // Grows upward from the pin before wrapping downward.
        assert_eq!(selected.iter_set().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_contiguous_uses_single_run() {
        let avail = Bitmap::from_indices(6, [0, 1, 3, 4, 5]);
        let cpu_cnt = vec![2, 2, 0, 2, 2, 2];
        let req = JobRequestBuilder::new()
            .procs(6)
            .nodes(3, 0)
            .contiguous()
            .finish();
        let selected = eval_nodes(&req, &avail, &cpu_cnt).unwrap();
        assert_eq!(selected.iter_set().collect::<Vec<_>>(), vec![3, 4, 5]);

        let too_big = JobRequestBuilder::new()
            .procs(8)
            .nodes(4, 0)
            .contiguous()
            .finish();
        assert!(eval_nodes(&too_big, &avail, &cpu_cnt).is_none());
    }

    #[test]
    fn test_max_nodes_blocks_greedy() {
        let req = JobRequestBuilder::new().procs(4).nodes(1, 2).finish();
        let avail = Bitmap::filled(4);
        assert!(eval_nodes(&req, &avail, &[1, 1, 1, 1]).is_none());
    }

    #[test]
    fn test_knapsack_rescues_node_capped_job() {
        // 18 single-cpu nodes and two 8-cpu nodes at the end; a 16-cpu
        // job capped at 2 nodes only fits once the weak nodes are cleared.
        let mut cpu_cnt = vec![1u32; 20];
        cpu_cnt[18] = 8;
        cpu_cnt[19] = 8;
        let avail = Bitmap::filled(20);
        let req = JobRequestBuilder::new().procs(16).nodes(2, 2).finish();

        assert!(eval_nodes(&req, &avail, &cpu_cnt).is_none());
        let selected = choose_nodes(&req, &avail, &cpu_cnt).unwrap();
        assert_eq!(selected.iter_set().collect::<Vec<_>>(), vec![18, 19]);
    }

    #[test]
    fn test_knapsack_keeps_required_nodes() {
        let mut cpu_cnt = vec![1u32; 4];
        cpu_cnt[3] = 4;
        let avail = Bitmap::filled(4);
        let req = JobRequestBuilder::new()
            .procs(5)
            .nodes(2, 2)
            .req_nodes(Bitmap::from_indices(4, [0]))
            .finish();
        let selected = choose_nodes(&req, &avail, &cpu_cnt).unwrap();
        assert_eq!(selected.iter_set().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn test_missing_required_node_fails() {
        let req = JobRequestBuilder::new()
            .procs(1)
            .req_nodes(Bitmap::from_indices(4, [2]))
            .finish();
        let avail = Bitmap::from_indices(4, [0, 1, 3]);
        assert!(eval_nodes(&req, &avail, &[1, 1, 1, 1]).is_none());
    }
}

//! Block planner for grid topologies.
//!
//! STATIC wires every configured block against one shared wiring state
//! and rejects the whole configuration on any conflict. OVERLAP resets
//! the wiring state between blocks, so overlapping blocks may coexist
//! as long as at most one of an overlap group is booted. DYNAMIC keeps
//! no configured blocks and synthesises the smallest fitting block per
//! job.

pub mod fabric;

use std::sync::{Arc, Mutex};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::blocks::fabric::{BlockState, Fabric, FabricBlock};
use crate::common::bitmap::Bitmap;
use crate::common::config::ControllerConfig;
use crate::common::error::SlateError;
use crate::grid::{ConnType, Coord, Grid};
use crate::{BlockId, JobId, Map};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockMode {
    Static,
    Overlap,
    Dynamic,
}

/// A configured block request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    pub start: Coord,
    pub geometry: Coord,
    pub conn: ConnType,
    /// SMALL only: which quarter of the midplane (0..4).
    pub quarter: Option<u16>,
    /// SMALL only: which sixteenth of the midplane (0..16).
    pub segment: Option<u16>,
}

impl BlockSpec {
    pub fn new(start: &[u32], geometry: &[u32], conn: ConnType) -> Self {
        BlockSpec {
            start: start.iter().copied().collect(),
            geometry: geometry.iter().copied().collect(),
            conn,
            quarter: None,
            segment: None,
        }
    }

    fn size(&self) -> u64 {
        self.geometry.iter().map(|g| *g as u64).product()
    }

    fn validate(&self) -> crate::Result<()> {
        if self.conn != ConnType::Small && (self.quarter.is_some() || self.segment.is_some()) {
            return Err(SlateError::InvalidRequest(
                "quarter/segment only apply to small blocks".into(),
            ));
        }
        if self.quarter.is_some_and(|q| q >= 4) {
            return Err(SlateError::InvalidRequest("quarter must be 0..4".into()));
        }
        if self.segment.is_some_and(|s| s >= 16) {
            return Err(SlateError::InvalidRequest("segment must be 0..16".into()));
        }
        Ok(())
    }
}

/// A registered block.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub nodes: Bitmap,
    pub conn: ConnType,
    pub quarter: Option<u16>,
    pub segment: Option<u16>,
    pub state: BlockState,
    pub booted: bool,
    /// Dynamic blocks belong to the job they were synthesised for.
    pub job: Option<JobId>,
    pub full_system: bool,
    error_count: u32,
}

impl Block {
    fn fabric_desc(&self) -> FabricBlock {
        FabricBlock {
            name: self.name.clone(),
            nodes: self.nodes.clone(),
            conn: self.conn,
            quarter: self.quarter,
            segment: self.segment,
            state: self.state,
        }
    }

    fn matches(&self, live: &FabricBlock) -> bool {
        self.nodes == live.nodes
            && self.quarter == live.quarter
            && self.segment == live.segment
            && self.conn == live.conn
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub destroyed: u32,
    pub created: u32,
}

/// Builds the planner the configuration describes, committing the
/// configured blocks for STATIC and OVERLAP modes. `None` when no grid
/// is configured.
pub fn planner_from_config(config: &ControllerConfig) -> crate::Result<Option<BlockPlanner>> {
    let Some(dims) = &config.grid_dims else {
        return Ok(None);
    };
    let grid = Grid::new(dims)?;
    let mut specs = Vec::with_capacity(config.blocks.len());
    for name in &config.blocks {
        let (start, geometry) = grid.parse_block_name(name)?;
        specs.push(BlockSpec::new(&start, &geometry, ConnType::Torus));
    }
    let mut planner = BlockPlanner::new(grid, config.block_mode);
    if config.block_mode == BlockMode::Dynamic {
        if !specs.is_empty() {
            return Err(SlateError::InvalidRequest(
                "dynamic mode carries no configured blocks".into(),
            ));
        }
    } else {
        planner.create_static_blocks(&specs)?;
    }
    Ok(Some(planner))
}

pub struct BlockPlanner {
    grid: Grid,
    mode: BlockMode,
    blocks: Vec<Block>,
    next_id: u32,
}

impl BlockPlanner {
    pub fn new(grid: Grid, mode: BlockMode) -> Self {
        BlockPlanner {
            grid,
            mode,
            blocks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn mode(&self) -> BlockMode {
        self.mode
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_by_name(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    fn register(&mut self, spec: &BlockSpec, job: Option<JobId>) -> crate::Result<BlockId> {
        let nodes = self.grid.block_nodes(&spec.start, &spec.geometry)?;
        let id = BlockId::new(self.next_id);
        self.next_id += 1;
        self.blocks.push(Block {
            id,
            name: self.grid.block_name(&spec.start, &spec.geometry),
            nodes,
            conn: spec.conn,
            quarter: spec.quarter,
            segment: spec.segment,
            state: BlockState::Free,
            booted: false,
            job,
            full_system: self.grid.is_full_system(&spec.geometry),
            error_count: 0,
        });
        Ok(id)
    }

    /// Commits the configured block set for STATIC and OVERLAP modes.
    ///
    /// Any failure rejects the whole configuration; nothing is
    /// registered partially. A full-system block is synthesised when the
    /// configuration does not carry one; the synthesised block is exempt
    /// from the STATIC wiring-state check.
    pub fn create_static_blocks(&mut self, specs: &[BlockSpec]) -> crate::Result<()> {
        if self.mode == BlockMode::Dynamic {
            return Err(SlateError::InvalidRequest(
                "dynamic mode carries no configured blocks".into(),
            ));
        }
        if !self.blocks.is_empty() {
            return Err(SlateError::InvalidRequest(
                "block configuration already committed".into(),
            ));
        }

        let mut ordered: Vec<&BlockSpec> = specs.iter().collect();
        ordered.sort_by_key(|s| s.size());

        let mut wired = Bitmap::new(self.grid.node_count());
        let mut staged: Vec<BlockSpec> = Vec::new();
        for spec in ordered {
            spec.validate()?;
            self.grid.check_wiring(&spec.start, &spec.geometry, spec.conn)?;
            let nodes = self.grid.block_nodes(&spec.start, &spec.geometry)?;
            if self.mode == BlockMode::Static {
                if !wired.is_disjoint(&nodes) {
                    return Err(SlateError::InvalidRequest(format!(
                        "block {} overlaps an already wired block",
                        self.grid.block_name(&spec.start, &spec.geometry)
                    )));
                }
                wired.or_with(&nodes);
            }
            staged.push(spec.clone());
        }

        let has_full_system = staged
            .iter()
            .any(|s| self.grid.is_full_system(&s.geometry));

        for spec in &staged {
            self.register(spec, None)?;
        }
        if !has_full_system {
            let dims: Coord = self.grid.dims().iter().copied().collect();
            let start: Coord = dims.iter().map(|_| 0).collect();
            let full = BlockSpec::new(&start, &dims, ConnType::Torus);
            self.register(&full, None)?;
        }
        log::info!("Committed {} blocks in {:?} mode", self.blocks.len(), self.mode);
        Ok(())
    }

    /// Synthesises the smallest block covering `min_nodes` nodes, fitted
    /// against the already registered blocks. DYNAMIC mode only.
    pub fn create_dynamic_block(
        &mut self,
        job: JobId,
        min_nodes: u32,
        conn: ConnType,
    ) -> crate::Result<BlockId> {
        if self.mode != BlockMode::Dynamic {
            return Err(SlateError::InvalidRequest(
                "dynamic blocks require dynamic mode".into(),
            ));
        }
        let mut taken = Bitmap::new(self.grid.node_count());
        for block in &self.blocks {
            taken.or_with(&block.nodes);
        }

        let dims = self.grid.dims().to_vec();
        let mut geometries: Vec<Vec<u32>> = dims
            .iter()
            .map(|d| {
                (1..=*d)
                    .filter(|g| conn != ConnType::Torus || d % g == 0)
                    .collect::<Vec<u32>>()
            })
            .multi_cartesian_product()
            .filter(|geo| geo.iter().map(|g| *g as u64).product::<u64>() >= min_nodes as u64)
            .collect();
        geometries.sort_by_key(|geo| (geo.iter().map(|g| *g as u64).product::<u64>(), geo.clone()));

        for geometry in &geometries {
            let starts = dims
                .iter()
                .zip(geometry)
                .map(|(d, g)| {
                    let step = if conn == ConnType::Torus { *g } else { 1 };
                    (0..=d - g).step_by(step as usize).collect::<Vec<u32>>()
                })
                .multi_cartesian_product();
            for start in starts {
                if self.grid.check_wiring(&start, geometry, conn).is_err() {
                    continue;
                }
                let nodes = self.grid.block_nodes(&start, geometry)?;
                if !taken.is_disjoint(&nodes) {
                    continue;
                }
                let mut spec = BlockSpec::new(&start, geometry, conn);
                spec.quarter = None;
                spec.segment = None;
                let id = self.register(&spec, Some(job))?;
                log::debug!(
                    "Synthesised block {} for job {job}",
                    self.blocks.last().map(|b| b.name.as_str()).unwrap_or("?")
                );
                return Ok(id);
            }
        }
        Err(SlateError::InfeasibleNow)
    }

    /// Marks a block booted. Two overlapping booted blocks are refused.
    pub fn boot_block(&mut self, id: BlockId) -> crate::Result<()> {
        let target = self
            .blocks
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| SlateError::InvalidRequest(format!("unknown block {id}")))?;
        for (idx, block) in self.blocks.iter().enumerate() {
            if idx != target && block.booted && !block.nodes.is_disjoint(&self.blocks[target].nodes)
            {
                return Err(SlateError::InfeasibleNow);
            }
        }
        self.blocks[target].booted = true;
        Ok(())
    }

    pub fn release_block(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.iter_mut().find(|b| b.id == id) {
            block.booted = false;
        }
    }

    /// Drops the dynamic blocks of a finished job; the next reconcile
    /// destroys them on the fabric. Returns the dropped block names.
    pub fn job_ended(&mut self, job: JobId) -> Vec<String> {
        let mut dropped = Vec::new();
        self.blocks.retain(|block| {
            if block.job == Some(job) {
                dropped.push(block.name.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Aligns the fabric with the registered block set.
    ///
    /// Fabric-only blocks are destroyed by parallel workers tracked by a
    /// shared counter; the call does not return until every destruction
    /// worker finished. Mismatching blocks are destroyed and recreated;
    /// a failed create marks the block ERROR, is retried once on the
    /// next pass, and recreated from scratch after that.
    pub async fn reconcile(&mut self, fabric: &Arc<dyn Fabric>) -> crate::Result<ReconcileStats> {
        let live: Map<String, FabricBlock> = fabric
            .poll_blocks()?
            .into_iter()
            .map(|b| (b.name.clone(), b))
            .collect();

        let mut to_destroy: Vec<String> = Vec::new();
        let mut to_create: Vec<usize> = Vec::new();
        for name in live.keys() {
            if self.block_by_name(name).is_none() {
                to_destroy.push(name.clone());
            }
        }
        for (idx, block) in self.blocks.iter_mut().enumerate() {
            match live.get(&block.name) {
                None => to_create.push(idx),
                Some(found) if !block.matches(found) => {
                    to_destroy.push(block.name.clone());
                    to_create.push(idx);
                }
                Some(found) => {
                    if found.state == BlockState::Error || block.state == BlockState::Error {
                        block.error_count += 1;
                        if block.error_count > 1 {
                            // Retry exhausted.
                            to_destroy.push(block.name.clone());
                            block.error_count = 0;
                        }
                        to_create.push(idx);
                    } else {
                        block.state = found.state;
                    }
                }
            }
        }

        let num_to_destroy = to_destroy.len() as u32;
        let destroyed = Arc::new(Mutex::new(0u32));
        let mut workers = Vec::new();
        for name in to_destroy {
            let fabric = Arc::clone(fabric);
            let destroyed = Arc::clone(&destroyed);
            workers.push(tokio::spawn(async move {
                match fabric.destroy_block(&name) {
                    Ok(()) => *destroyed.lock().unwrap() += 1,
                    Err(e) => log::warn!("Failed to destroy block {name}: {e}"),
                }
            }));
        }
        for worker in workers {
            worker
                .await
                .map_err(|e| SlateError::Fatal(format!("destructor worker panicked: {e}")))?;
        }
        let num_destroyed = *destroyed.lock().unwrap();
        if num_destroyed != num_to_destroy {
            return Err(SlateError::Transient(format!(
                "destroyed {num_destroyed} of {num_to_destroy} blocks"
            )));
        }

        let mut created = 0;
        for idx in to_create {
            let desc = self.blocks[idx].fabric_desc();
            match fabric.create_block(&desc) {
                Ok(()) => {
                    self.blocks[idx].state = BlockState::Ready;
                    self.blocks[idx].error_count = 0;
                    created += 1;
                }
                Err(e) => {
                    log::warn!("Failed to create block {}: {e}", self.blocks[idx].name);
                    self.blocks[idx].state = BlockState::Error;
                    self.blocks[idx].error_count += 1;
                }
            }
        }
        Ok(ReconcileStats {
            destroyed: num_destroyed,
            created,
        })
    }
}

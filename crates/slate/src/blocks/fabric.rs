//! Narrow capability interface to the wiring fabric.
//!
//! The planner never talks to real hardware directly; a deployment
//! supplies a `Fabric` implementation, and a non-grid deployment can
//! supply one that rejects grid-only operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::common::bitmap::Bitmap;
use crate::common::error::SlateError;
use crate::grid::ConnType;
use crate::Map;

/// Lifecycle state of a block as the fabric reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    Free,
    Configuring,
    Ready,
    Deallocating,
    Error,
}

/// A block as seen on the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricBlock {
    pub name: String,
    pub nodes: Bitmap,
    pub conn: ConnType,
    pub quarter: Option<u16>,
    pub segment: Option<u16>,
    pub state: BlockState,
}

pub trait Fabric: Send + Sync + 'static {
    fn poll_blocks(&self) -> crate::Result<Vec<FabricBlock>>;
    fn create_block(&self, block: &FabricBlock) -> crate::Result<()>;
    fn destroy_block(&self, name: &str) -> crate::Result<()>;
    /// Names of nodes the fabric currently reports as failed.
    fn down_nodes(&self) -> crate::Result<Vec<String>>;
}

/// In-memory fabric used by tests and non-grid deployments.
#[derive(Default)]
pub struct SimFabric {
    blocks: Mutex<Map<String, FabricBlock>>,
    down: Mutex<Vec<String>>,
    /// Number of upcoming create calls that fail.
    fail_creates: AtomicU32,
}

impl SimFabric {
    pub fn new() -> Self {
        SimFabric::default()
    }

    pub fn set_down_nodes(&self, names: Vec<String>) {
        *self.down.lock().unwrap() = names;
    }

    pub fn fail_next_creates(&self, count: u32) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    /// Seeds a block as if it already existed on the fabric.
    pub fn seed_block(&self, block: FabricBlock) {
        self.blocks
            .lock()
            .unwrap()
            .insert(block.name.clone(), block);
    }

    pub fn block_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blocks.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Fabric for SimFabric {
    fn poll_blocks(&self) -> crate::Result<Vec<FabricBlock>> {
        Ok(self.blocks.lock().unwrap().values().cloned().collect())
    }

    fn create_block(&self, block: &FabricBlock) -> crate::Result<()> {
        let remaining = self.fail_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(SlateError::Transient("fabric create failed".into()));
        }
        let mut created = block.clone();
        created.state = BlockState::Ready;
        self.blocks
            .lock()
            .unwrap()
            .insert(created.name.clone(), created);
        Ok(())
    }

    fn destroy_block(&self, name: &str) -> crate::Result<()> {
        self.blocks.lock().unwrap().remove(name);
        Ok(())
    }

    fn down_nodes(&self) -> crate::Result<Vec<String>> {
        Ok(self.down.lock().unwrap().clone())
    }
}

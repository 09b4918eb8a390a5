#![deny(clippy::await_holding_refcell_ref)]

#[macro_use]
pub mod common;

pub mod blocks;
pub mod controller;
pub mod cred;
pub mod grid;
pub mod reconciler;
pub mod select;
pub mod state;

pub use crate::common::{Map, Set};

pub use crate::common::ids::{BlockId, ConfigId, JobId, NodeId, PartitionId, StepId, UserId};

// Priority: bigger number -> higher priority
pub type Priority = i32;

pub type Error = common::error::SlateError;
pub type Result<T> = std::result::Result<T, Error>;

pub const MAX_SNAPSHOT_SIZE: usize = 128 * 1024 * 1024;

//! Coordinate-addressed topology grid.
//!
//! Nodes live on a fixed D-dimensional grid (D = 1..=3). Block requests
//! present a start coordinate, a per-dimension geometry and a connection
//! type; the grid answers whether such a block is wirable and which node
//! indices it covers.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::common::bitmap::Bitmap;
use crate::common::error::SlateError;

pub const MAX_DIMS: usize = 3;

pub type Coord = SmallVec<[u32; MAX_DIMS]>;

/// How the nodes of a block are wired together.
///
/// TORUS closes a cycle in every covered dimension, MESH only needs a
/// contiguous rectilinear region, SMALL subdivides a single midplane and
/// ignores wiring entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnType {
    Torus,
    Mesh,
    Small,
}

#[derive(Debug, Clone)]
pub struct Grid {
    dims: Coord,
}

impl Grid {
    pub fn new(dims: &[u32]) -> crate::Result<Grid> {
        if dims.is_empty() || dims.len() > MAX_DIMS || dims.iter().any(|d| *d == 0) {
            return Err(SlateError::InvalidRequest(format!(
                "unsupported grid dimensionality {dims:?}"
            )));
        }
        Ok(Grid {
            dims: dims.iter().copied().collect(),
        })
    }

    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn node_count(&self) -> usize {
        self.dims.iter().map(|d| *d as usize).product()
    }

    /// Row-major index of a coordinate.
    pub fn coord_to_index(&self, coord: &[u32]) -> Option<usize> {
        if coord.len() != self.dims.len() {
            return None;
        }
        let mut index = 0usize;
        for (c, d) in coord.iter().zip(&self.dims) {
            if c >= d {
                return None;
            }
            index = index * (*d as usize) + *c as usize;
        }
        Some(index)
    }

    pub fn index_to_coord(&self, mut index: usize) -> Coord {
        let mut coord: Coord = SmallVec::from_elem(0, self.dims.len());
        for dim in (0..self.dims.len()).rev() {
            let size = self.dims[dim] as usize;
            coord[dim] = (index % size) as u32;
            index /= size;
        }
        coord
    }

    fn check_box(&self, start: &[u32], geometry: &[u32]) -> crate::Result<()> {
        if start.len() != self.dims.len() || geometry.len() != self.dims.len() {
            return Err(SlateError::InvalidRequest(
                "block coordinates do not match grid dimensionality".into(),
            ));
        }
        if geometry.iter().any(|g| *g == 0) {
            return Err(SlateError::InvalidRequest("empty block geometry".into()));
        }
        for dim in 0..self.dims.len() {
            if start[dim] + geometry[dim] > self.dims[dim] {
                return Err(SlateError::InfeasibleEver(format!(
                    "block {}+{} exceeds grid extent {} in dimension {}",
                    start[dim], geometry[dim], self.dims[dim], dim
                )));
            }
        }
        Ok(())
    }

    /// Wiring feasibility of `(start, geometry, conn)`.
    ///
    /// A torus dimension is wirable when the geometry either spans the
    /// whole dimension or tiles it from an aligned position, so that the
    /// fabric can close the cycle without crossing a foreign block.
    pub fn check_wiring(&self, start: &[u32], geometry: &[u32], conn: ConnType) -> crate::Result<()> {
        self.check_box(start, geometry)?;
        match conn {
            ConnType::Mesh => Ok(()),
            ConnType::Small => {
                // SMALL blocks never span more than one midplane.
                if geometry.iter().any(|g| *g != 1) {
                    Err(SlateError::InvalidRequest(
                        "small block must cover a single midplane".into(),
                    ))
                } else {
                    Ok(())
                }
            }
            ConnType::Torus => {
                for dim in 0..self.dims.len() {
                    let (g, d) = (geometry[dim], self.dims[dim]);
                    if g == d {
                        continue;
                    }
                    if d % g != 0 || start[dim] % g != 0 {
                        return Err(SlateError::InfeasibleEver(format!(
                            "torus not closable in dimension {dim} (geometry {g} of {d})"
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Bitmap of node indices covered by the block box.
    pub fn block_nodes(&self, start: &[u32], geometry: &[u32]) -> crate::Result<Bitmap> {
        self.check_box(start, geometry)?;
        let mut bitmap = Bitmap::new(self.node_count());
        let mut cursor: Coord = start.iter().copied().collect();
        loop {
            bitmap.set(self.coord_to_index(&cursor).unwrap());
            // Advance the cursor inside the box, last dimension fastest.
            let mut dim = self.dims.len();
            loop {
                if dim == 0 {
                    return Ok(bitmap);
                }
                dim -= 1;
                cursor[dim] += 1;
                if cursor[dim] < start[dim] + geometry[dim] {
                    break;
                }
                cursor[dim] = start[dim];
            }
        }
    }

    /// Canonical name of a block: `"000x111"` for start and inclusive end.
    pub fn block_name(&self, start: &[u32], geometry: &[u32]) -> String {
        let fmt = |coord: &[u32]| {
            coord
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join("")
        };
        let end: Coord = start
            .iter()
            .zip(geometry)
            .map(|(s, g)| s + g - 1)
            .collect();
        format!("{}x{}", fmt(start), fmt(&end))
    }

    /// Inverse of `block_name`: parses `"000x111"` into `(start, geometry)`.
    pub fn parse_block_name(&self, name: &str) -> crate::Result<(Coord, Coord)> {
        let bad = || SlateError::InvalidRequest(format!("malformed block name '{name}'"));
        let (start_text, end_text) = name.split_once('x').ok_or_else(bad)?;
        let parse = |text: &str| -> crate::Result<Coord> {
            if text.chars().count() != self.dims.len() {
                return Err(bad());
            }
            text.chars().map(|c| c.to_digit(10).ok_or_else(bad)).collect()
        };
        let start = parse(start_text)?;
        let end = parse(end_text)?;
        let mut geometry = Coord::new();
        for (s, e) in start.iter().zip(&end) {
            if e < s {
                return Err(bad());
            }
            geometry.push(e - s + 1);
        }
        Ok((start, geometry))
    }

    /// True when the geometry covers the entire machine.
    pub fn is_full_system(&self, geometry: &[u32]) -> bool {
        geometry.len() == self.dims.len() && geometry.iter().zip(&self.dims).all(|(g, d)| g == d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid444() -> Grid {
        Grid::new(&[4, 4, 4]).unwrap()
    }

    #[test]
    fn test_indexing_roundtrip() {
        let grid = grid444();
        assert_eq!(grid.node_count(), 64);
        for index in [0usize, 1, 17, 63] {
            let coord = grid.index_to_coord(index);
            assert_eq!(grid.coord_to_index(&coord), Some(index));
        }
        assert_eq!(grid.coord_to_index(&[4, 0, 0]), None);
        assert_eq!(grid.coord_to_index(&[0, 0]), None);
    }

    #[test]
    fn test_mesh_wiring_is_box_check() {
        let grid = grid444();
        assert!(grid.check_wiring(&[1, 1, 1], &[2, 3, 1], ConnType::Mesh).is_ok());
        assert!(grid.check_wiring(&[3, 0, 0], &[2, 1, 1], ConnType::Mesh).is_err());
    }

    #[test]
    fn test_torus_wiring_requires_alignment() {
        let grid = grid444();
        // Full dimension always closes.
        assert!(grid.check_wiring(&[0, 0, 0], &[4, 4, 4], ConnType::Torus).is_ok());
        // Half-dimension tiles from aligned starts only.
        assert!(grid.check_wiring(&[0, 0, 0], &[2, 2, 2], ConnType::Torus).is_ok());
        assert!(grid.check_wiring(&[2, 0, 0], &[2, 2, 2], ConnType::Torus).is_ok());
        assert!(grid.check_wiring(&[1, 0, 0], &[2, 2, 2], ConnType::Torus).is_err());
        // 3 does not divide 4.
        assert!(grid.check_wiring(&[0, 0, 0], &[3, 1, 1], ConnType::Torus).is_err());
    }

    #[test]
    fn test_small_block_single_midplane() {
        let grid = grid444();
        assert!(grid.check_wiring(&[2, 1, 0], &[1, 1, 1], ConnType::Small).is_ok());
        assert!(grid.check_wiring(&[0, 0, 0], &[2, 1, 1], ConnType::Small).is_err());
    }

    #[test]
    fn test_block_nodes_and_name() {
        let grid = grid444();
        let nodes = grid.block_nodes(&[0, 0, 0], &[2, 2, 2]).unwrap();
        assert_eq!(nodes.count(), 8);
        assert!(nodes.test(grid.coord_to_index(&[1, 1, 1]).unwrap()));
        assert!(!nodes.test(grid.coord_to_index(&[2, 0, 0]).unwrap()));
        assert_eq!(grid.block_name(&[0, 0, 0], &[2, 2, 2]), "000x111");
        assert_eq!(grid.block_name(&[2, 0, 0], &[2, 2, 2]), "200x311");
    }

    #[test]
    fn test_parse_block_name() {
        let grid = grid444();
        let (start, geometry) = grid.parse_block_name("200x311").unwrap();
        assert_eq!(start.as_slice(), &[2, 0, 0]);
        assert_eq!(geometry.as_slice(), &[2, 2, 2]);
        assert_eq!(grid.block_name(&start, &geometry), "200x311");
        // Wrong dimensionality, inverted range, junk.
        assert!(grid.parse_block_name("00x11").is_err());
        assert!(grid.parse_block_name("300x211").is_err());
        assert!(grid.parse_block_name("000-111").is_err());
    }

    #[test]
    fn test_one_dimensional_grid() {
        let grid = Grid::new(&[8]).unwrap();
        assert_eq!(grid.node_count(), 8);
        assert!(grid.check_wiring(&[0], &[8], ConnType::Torus).is_ok());
        assert!(grid.check_wiring(&[2], &[4], ConnType::Torus).is_err());
        assert!(grid.check_wiring(&[4], &[4], ConnType::Torus).is_ok());
    }
}

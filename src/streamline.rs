//! Streamline containers with an explicit coordinate convention.

use ndarray::Array3;

use std::collections::HashSet;

use crate::affine::Affine;
use crate::error::Result;
use crate::volume::{Grid, Volume, VolumeKind};

/// A polyline of 3D points.
pub type Streamline = Vec<[f64; 3]>;

/// The space streamline points are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateSpace {
    /// World coordinates in mm.
    Rasmm,
    /// Continuous voxel indices of some grid.
    Voxel,
}

/// Where integer voxel coordinates sit within a voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Integer coordinates are voxel centres; voxel `i` spans `[i - 0.5, i + 0.5)`.
    Center,
    /// Integer coordinates are voxel corners; voxel `i` spans `[i, i + 1)`.
    Corner,
}

impl Origin {
    /// Index of the voxel containing a continuous coordinate along one axis.
    pub fn voxel_index(&self, coord: f64) -> i64 {
        match self {
            Origin::Center => (coord + 0.5).floor() as i64,
            Origin::Corner => coord.floor() as i64,
        }
    }
}


/// An ordered set of streamlines in a declared space.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamlineSet {
    pub streamlines: Vec<Streamline>,
    pub space: CoordinateSpace,
    pub origin: Origin,
}

impl StreamlineSet {
    pub fn new(streamlines: Vec<Streamline>, space: CoordinateSpace, origin: Origin) -> StreamlineSet {
        StreamlineSet { streamlines, space, origin }
    }

    pub fn len(&self) -> usize {
        self.streamlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamlines.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<Streamline> {
        self.streamlines.iter()
    }

    pub fn num_points(&self) -> usize {
        self.streamlines.iter().map(|s| s.len()).sum()
    }

    /// Apply an affine to every point, declaring the result to be in `space`.
    pub fn transform(&self, xfm: &Affine, space: CoordinateSpace) -> StreamlineSet {
        StreamlineSet {
            streamlines: self.streamlines.iter().map(|s| s.iter().map(|p| xfm.apply(*p)).collect()).collect(),
            space,
            origin: self.origin,
        }
    }

    /// Replace every point with `f(point)`, keeping the declared space.
    pub fn map_points<F>(&self, f: F) -> StreamlineSet
    where
        F: Fn([f64; 3]) -> [f64; 3],
    {
        StreamlineSet {
            streamlines: self.streamlines.iter().map(|s| s.iter().map(|p| f(*p)).collect()).collect(),
            space: self.space,
            origin: self.origin,
        }
    }

    /// Keep the streamlines for which `keep` holds.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&Streamline) -> bool,
    {
        self.streamlines.retain(keep);
    }

    /// Drop streamlines with fewer than two points or any non-finite coordinate. Returns the number dropped.
    pub fn remove_invalid(&mut self) -> usize {
        let before = self.streamlines.len();
        self.streamlines
            .retain(|s| s.len() >= 2 && s.iter().all(|p| p.iter().all(|c| c.is_finite())));
        before - self.streamlines.len()
    }

    /// Number of distinct streamlines visiting each voxel of `grid`.
    ///
    /// Points are taken to be RASMM and mapped to voxels with the centred convention. Points
    /// outside the grid are ignored.
    pub fn density_map(&self, grid: &Grid) -> Result<Volume> {
        let w2v = match self.space {
            CoordinateSpace::Rasmm => grid.world_to_voxel()?,
            CoordinateSpace::Voxel => Affine::identity(),
        };
        let s = grid.shape;
        let mut counts = Array3::<f32>::zeros((s[0], s[1], s[2]));
        let mut visited: HashSet<[i64; 3]> = HashSet::new();
        for sl in self.streamlines.iter() {
            visited.clear();
            for p in sl {
                let v = w2v.apply(*p);
                let idx = [Origin::Center.voxel_index(v[0]), Origin::Center.voxel_index(v[1]), Origin::Center.voxel_index(v[2])];
                if grid.contains(idx) && visited.insert(idx) {
                    counts[[idx[0] as usize, idx[1] as usize, idx[2] as usize]] += 1.0;
                }
            }
        }
        Ok(Volume::new(counts, grid.affine, VolumeKind::Label))
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invalid_streamlines_are_dropped() {
        let mut set = StreamlineSet::new(
            vec![vec![], vec![[0.0; 3]], vec![[0.0; 3], [f64::NAN, 0.0, 0.0]], vec![[0.0; 3], [1.0, 0.0, 0.0]]],
            CoordinateSpace::Rasmm,
            Origin::Center,
        );
        assert_eq!(3, set.remove_invalid());
        assert_eq!(1, set.len());
    }

    #[test]
    fn density_counts_each_streamline_once_per_voxel() {
        let grid = Grid::new([4, 4, 4], Affine::scaling(2.0));
        let set = StreamlineSet::new(
            vec![
                // Both points fall into voxel (0, 0, 0).
                vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.0], [2.0, 0.0, 0.0]],
                vec![[0.2, 0.0, 0.0], [100.0, 0.0, 0.0]],
            ],
            CoordinateSpace::Rasmm,
            Origin::Center,
        );
        let density = set.density_map(&grid).unwrap();
        assert_eq!(2.0, density.value_at([0, 0, 0]));
        assert_eq!(1.0, density.value_at([1, 0, 0]));
        assert_eq!(3.0, density.data.sum());
    }

    #[test]
    fn voxel_indices_follow_the_origin_convention() {
        assert_eq!(0, Origin::Center.voxel_index(0.49));
        assert_eq!(1, Origin::Center.voxel_index(0.5));
        assert_eq!(-1, Origin::Center.voxel_index(-0.51));
        assert_eq!(0, Origin::Corner.voxel_index(0.99));
    }
}

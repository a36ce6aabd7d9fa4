//! Sampled scalar, mask and label fields on a voxel grid with a voxel-to-RASMM affine.

use ndarray::{Array3, Array4, ArrayView3, Axis};
use ndarray_stats::QuantileExt;

use std::fmt;
use std::path::Path;

use crate::affine::Affine;
use crate::error::{RegistrationError, Result};
use crate::nifti::{read_nifti, write_nifti};

/// Tolerance used when deciding whether two grids share the same affine.
pub const GRID_TOLERANCE: f64 = 1e-4;

/// What the samples of a [`Volume`] represent. Decides the on-disk datatype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    /// Continuous values: intensities, probabilities, displacements.
    Scalar,
    /// Binary values 0 and 1.
    Mask,
    /// Integer region labels.
    Label,
}

/// A voxel grid: spatial shape plus the affine mapping voxel indices to RASMM.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub shape: [usize; 3],
    pub affine: Affine,
}

impl Grid {
    pub fn new(shape: [usize; 3], affine: Affine) -> Grid {
        Grid { shape, affine }
    }

    /// The affine mapping RASMM coordinates to continuous voxel coordinates.
    pub fn world_to_voxel(&self) -> Result<Affine> {
        self.affine.inverse()
    }

    pub fn num_voxels(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    /// Isotropic voxel size in mm, taken from the first axis.
    pub fn vox_size(&self) -> f64 {
        self.affine.column_scales()[0]
    }

    pub fn same_as(&self, other: &Grid) -> bool {
        self.shape == other.shape && self.affine.is_close(&other.affine, GRID_TOLERANCE)
    }

    /// Whether the integer index lies inside the grid.
    pub fn contains(&self, idx: [i64; 3]) -> bool {
        (0..3).all(|d| idx[d] >= 0 && (idx[d] as usize) < self.shape[d])
    }
}


/// A 3D volume, optionally with several frames along a 4th axis (e.g. the 3 components of a warp field).
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub grid: Grid,
    pub data: Array4<f32>,
    pub kind: VolumeKind,
}

impl Volume {
    /// Wrap a single-frame 3D array.
    pub fn new(data: Array3<f32>, affine: Affine, kind: VolumeKind) -> Volume {
        let dims = data.dim();
        Volume {
            grid: Grid::new([dims.0, dims.1, dims.2], affine),
            data: data.insert_axis(Axis(3)),
            kind,
        }
    }

    pub fn from_frames(data: Array4<f32>, affine: Affine, kind: VolumeKind) -> Volume {
        let dims = data.dim();
        Volume {
            grid: Grid::new([dims.0, dims.1, dims.2], affine),
            data,
            kind,
        }
    }

    pub fn zeros(grid: &Grid, frames: usize, kind: VolumeKind) -> Volume {
        let s = grid.shape;
        Volume {
            grid: grid.clone(),
            data: Array4::zeros((s[0], s[1], s[2], frames)),
            kind,
        }
    }

    /// Read a volume from a NIfTI-1 file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Volume> {
        read_nifti(path)
    }

    /// Write the volume to a NIfTI-1 file, gzip-compressed if the name ends with ".gz".
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_nifti(path, self)
    }

    pub fn affine(&self) -> &Affine {
        &self.grid.affine
    }

    pub fn shape(&self) -> [usize; 3] {
        self.grid.shape
    }

    pub fn frames(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    pub fn vox_size(&self) -> f64 {
        self.grid.vox_size()
    }

    pub fn frame(&self, t: usize) -> ArrayView3<f32> {
        self.data.index_axis(Axis(3), t)
    }

    /// The value at an integer index of the first frame, or `0` outside the grid.
    pub fn value_at(&self, idx: [i64; 3]) -> f32 {
        if self.grid.contains(idx) {
            self.data[[idx[0] as usize, idx[1] as usize, idx[2] as usize, 0]]
        } else {
            0.0
        }
    }

    pub fn count_nonzero(&self) -> usize {
        self.data.iter().filter(|v| **v != 0.0).count()
    }

    pub fn count_zero(&self) -> usize {
        self.data.len() - self.count_nonzero()
    }

    /// Ratio of non-zero to zero voxels. A volume without zero voxels yields infinity.
    pub fn nonzero_ratio(&self) -> f64 {
        let zero = self.count_zero();
        if zero == 0 {
            return f64::INFINITY;
        }
        self.count_nonzero() as f64 / zero as f64
    }

    /// Largest sample value, or `None` for empty volumes or volumes containing NaN.
    pub fn max_value(&self) -> Option<f32> {
        self.data.max().ok().cloned()
    }

    /// Binary mask of all voxels strictly greater than `threshold`.
    pub fn binarize(&self, threshold: f32) -> Volume {
        Volume {
            grid: self.grid.clone(),
            data: self.data.mapv(|v| if v > threshold { 1.0 } else { 0.0 }),
            kind: VolumeKind::Mask,
        }
    }

    /// Keep values where `mask` is non-zero, zero elsewhere.
    pub fn masked(&self, mask: &Volume) -> Result<Volume> {
        self.check_same_grid(mask)?;
        let mut out = self.clone();
        let mask_frame = mask.frame(0);
        for t in 0..out.frames() {
            let mut frame = out.data.index_axis_mut(Axis(3), t);
            for (v, m) in frame.iter_mut().zip(mask_frame.iter()) {
                if *m == 0.0 {
                    *v = 0.0;
                }
            }
        }
        Ok(out)
    }

    /// Zero every voxel whose value is not an integer. Guards label volumes against interpolation leakage.
    pub fn zero_non_integer(&mut self) -> usize {
        let mut zeroed = 0;
        for v in self.data.iter_mut() {
            if !v.is_finite() || v.fract() != 0.0 {
                *v = 0.0;
                zeroed += 1;
            }
        }
        zeroed
    }

    /// The sorted set of distinct integer values, including the background `0` if present.
    pub fn unique_labels(&self) -> Vec<i64> {
        let mut labels: Vec<i64> = self
            .data
            .iter()
            .filter(|v| v.is_finite())
            .map(|v| v.round() as i64)
            .collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    /// A copy with a different [`VolumeKind`]. Mask conversion binarizes at zero.
    pub fn into_kind(self, kind: VolumeKind) -> Volume {
        match kind {
            VolumeKind::Mask => self.binarize(0.0),
            _ => Volume { kind, ..self },
        }
    }

    pub fn same_grid(&self, other: &Volume) -> bool {
        self.grid.same_as(&other.grid)
    }

    pub fn check_same_grid(&self, other: &Volume) -> Result<()> {
        if self.grid.shape != other.grid.shape {
            return Err(RegistrationError::ShapeMismatch(self.grid.shape.to_vec(), other.grid.shape.to_vec()));
        }
        if !self.grid.affine.is_close(&other.grid.affine, GRID_TOLERANCE) {
            return Err(RegistrationError::InvalidConfiguration(String::from(
                "volumes share a shape but not a voxel-to-world affine",
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} volume with {}x{}x{} voxels and {} frame(s) at {:.2} mm.",
            self.kind,
            self.grid.shape[0],
            self.grid.shape[1],
            self.grid.shape[2],
            self.frames(),
            self.vox_size()
        )
    }
}

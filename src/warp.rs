//! Dense displacement fields for non-linear transforms.
//!
//! A [`WarpField`] lives on the voxel grid of the space it maps *from* when pulling values,
//! i.e. the target (fixed) grid of a registration. For a world point `x` of that grid, the
//! corresponding point of the moving space is `x + d(x)`, with `d` in mm. The field therefore
//! contains the full mapping, including any affine part used to initialise it.

use ndarray::Array4;

use std::path::Path;

use crate::affine::Affine;
use crate::error::{RegistrationError, Result};
use crate::resample::{sample, Interpolation};
use crate::volume::{Grid, Volume, VolumeKind};

/// Number of fixed-point iterations used when inverting a field.
pub const DEFAULT_INVERSION_ITERATIONS: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct WarpField {
    pub field: Volume,
}

impl WarpField {
    /// Wrap a 3-frame displacement volume.
    pub fn new(field: Volume) -> Result<WarpField> {
        if field.frames() != 3 {
            return Err(RegistrationError::WarpFailed(format!(
                "displacement field needs 3 frames, found {}", field.frames()
            )));
        }
        Ok(WarpField { field: Volume { kind: VolumeKind::Scalar, ..field } })
    }

    pub fn zeros(grid: &Grid) -> WarpField {
        WarpField { field: Volume::zeros(grid, 3, VolumeKind::Scalar) }
    }

    /// The displacement field equivalent to an affine `xfm` mapping moving world coordinates to
    /// fixed world coordinates, sampled on the fixed `grid`.
    pub fn from_affine(grid: &Grid, xfm: &Affine) -> Result<WarpField> {
        let pull = xfm.inverse()?;
        let s = grid.shape;
        let mut data = Array4::zeros((s[0], s[1], s[2], 3));
        for i in 0..s[0] {
            for j in 0..s[1] {
                for k in 0..s[2] {
                    let x = grid.affine.apply([i as f64, j as f64, k as f64]);
                    let y = pull.apply(x);
                    for d in 0..3 {
                        data[[i, j, k, d]] = (y[d] - x[d]) as f32;
                    }
                }
            }
        }
        Ok(WarpField { field: Volume::from_frames(data, grid.affine, VolumeKind::Scalar) })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<WarpField> {
        WarpField::new(Volume::from_file(path)?)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.field.to_file(path)
    }

    pub fn grid(&self) -> &Grid {
        &self.field.grid
    }

    /// The displacement at a continuous voxel coordinate of the field grid, trilinearly interpolated.
    pub fn displacement_at_voxel(&self, coord: [f64; 3]) -> [f64; 3] {
        let mut d = [0.0; 3];
        for c in 0..3 {
            d[c] = sample(&self.field.frame(c), coord, Interpolation::Trilinear) as f64;
        }
        d
    }

    /// The displacement at a point, where `point_to_voxel` maps the point's coordinates to voxel coordinates of the field.
    pub fn displacement_at(&self, point: [f64; 3], point_to_voxel: &Affine) -> [f64; 3] {
        self.displacement_at_voxel(point_to_voxel.apply(point))
    }

    /// Map a fixed-space world point to the moving space.
    pub fn map_point(&self, world: [f64; 3], world_to_voxel: &Affine) -> [f64; 3] {
        let d = self.displacement_at(world, world_to_voxel);
        [world[0] + d[0], world[1] + d[1], world[2] + d[2]]
    }

    /// Resample a moving-space volume onto the grid of this field.
    ///
    /// If `source_xfm` is given, it maps the warped (moving-space) points further into the
    /// world space of `source` before sampling.
    pub fn apply(&self, source: &Volume, interp: Interpolation, source_xfm: Option<&Affine>) -> Result<Volume> {
        let grid = self.grid();
        let src_w2v = match source_xfm {
            Some(xfm) => xfm.then(&source.grid.world_to_voxel()?),
            None => source.grid.world_to_voxel()?,
        };
        let s = grid.shape;
        let frames = source.frames();
        let mut data = Array4::zeros((s[0], s[1], s[2], frames));
        for i in 0..s[0] {
            for j in 0..s[1] {
                for k in 0..s[2] {
                    let x = grid.affine.apply([i as f64, j as f64, k as f64]);
                    let d = self.displacement_at_voxel([i as f64, j as f64, k as f64]);
                    let y = [x[0] + d[0], x[1] + d[1], x[2] + d[2]];
                    if !(y[0].is_finite() && y[1].is_finite() && y[2].is_finite()) {
                        return Err(RegistrationError::WarpFailed(String::from("non-finite displacement")));
                    }
                    let coord = src_w2v.apply(y);
                    for t in 0..frames {
                        data[[i, j, k, t]] = sample(&source.frame(t), coord, interp);
                    }
                }
            }
        }
        Ok(Volume::from_frames(data, grid.affine, source.kind))
    }

    /// Invert the field on the moving-space `grid` by fixed-point iteration.
    ///
    /// For a moving point `y`, the fixed point `x` solves `x + d(x) = y`; the inverse field stores `x - y`.
    pub fn invert(&self, grid: &Grid, iterations: usize) -> Result<WarpField> {
        let w2v = self.grid().world_to_voxel()?;
        let s = grid.shape;
        let mut data = Array4::zeros((s[0], s[1], s[2], 3));
        for i in 0..s[0] {
            for j in 0..s[1] {
                for k in 0..s[2] {
                    let y = grid.affine.apply([i as f64, j as f64, k as f64]);
                    let mut x = y;
                    for _ in 0..iterations {
                        let d = self.displacement_at(x, &w2v);
                        x = [y[0] - d[0], y[1] - d[1], y[2] - d[2]];
                    }
                    for c in 0..3 {
                        data[[i, j, k, c]] = (x[c] - y[c]) as f32;
                    }
                }
            }
        }
        Ok(WarpField { field: Volume::from_frames(data, grid.affine, VolumeKind::Scalar) })
    }
}


/// A non-linear transform together with its mandatory inverse and the affine that initialised it.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpPair {
    pub forward: WarpField,
    pub inverse: WarpField,
    pub init: Affine,
}

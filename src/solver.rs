//! The contract between the registration engine and the numerical registration solvers.
//!
//! Solvers are black boxes: mutual-information optimisation, boundary-based cost functions and
//! deformable field estimation are not implemented by this crate. Any backend implementing
//! [`RegistrationSolver`] can be plugged into the alignment stages. [`CentroidSolver`] is a small,
//! deterministic reference backend that only estimates translations.

use crate::affine::Affine;
use crate::error::{RegistrationError, Result};
use crate::resample::{resample, Interpolation};
use crate::volume::{Grid, Volume};
use crate::warp::{WarpField, DEFAULT_INVERSION_ITERATIONS};

/// Cost function of an affine registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cost {
    MutualInformation,
    /// Driven by a white-matter edge map of the fixed volume.
    BoundaryBased,
}

/// Options for a single affine solver call.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignOptions {
    /// Degrees of freedom: 6 (rigid), 7 (rigid + global scale) or 12 (full affine).
    pub dof: u8,
    pub cost: Cost,
    /// Search over a wide range of initial rotations.
    pub search: bool,
    /// Number of histogram bins of the cost function, if not left to the solver.
    pub bins: Option<u32>,
}

impl AlignOptions {
    pub fn mutual_information(dof: u8) -> AlignOptions {
        AlignOptions { dof, cost: Cost::MutualInformation, search: true, bins: None }
    }

    pub fn boundary_based(dof: u8) -> AlignOptions {
        AlignOptions { dof, cost: Cost::BoundaryBased, search: true, bins: Some(256) }
    }
}

/// Result of a dedicated symmetric diffeomorphic registration of an anisotropy volume to a template.
#[derive(Debug, Clone, PartialEq)]
pub struct SynMapping {
    /// Pre-alignment affine, mapping template world coordinates to native world coordinates.
    pub affine: Affine,
    /// Forward deformation, sampled on the grid of `warped`.
    pub forward: WarpField,
    /// The moving volume resampled into template space.
    pub warped: Volume,
}


/// A black-box registration backend. All affines map moving world coordinates to fixed world coordinates.
pub trait RegistrationSolver {
    /// Estimate an affine from `moving` to `fixed`, optionally seeded by `init`.
    fn affine(&self, moving: &Volume, fixed: &Volume, init: Option<&Affine>, options: &AlignOptions) -> Result<Affine>;

    /// Refine `init` with a boundary-based cost on the white-matter edge map `wm_edge` of `fixed`.
    fn boundary_based(&self, moving: &Volume, fixed: &Volume, init: &Affine, wm_edge: &Volume, options: &AlignOptions) -> Result<Affine>;

    /// Estimate a non-linear warp from `moving` to `fixed` seeded by `init`. The field lives on the grid of `fixed`.
    fn nonlinear(&self, moving: &Volume, fixed: &Volume, init: &Affine, fixed_mask: Option<&Volume>) -> Result<WarpField>;

    /// Invert a warp produced by [`RegistrationSolver::nonlinear`] onto the moving `grid`.
    fn invert_warp(&self, warp: &WarpField, grid: &Grid) -> Result<WarpField>;

    /// Symmetric diffeomorphic registration of `moving` to `fixed`, with optional auxiliary contrasts of both.
    fn symmetric_normalization(
        &self,
        moving: &Volume,
        fixed: &Volume,
        moving_aux: Option<&Volume>,
        fixed_aux: Option<&Volume>,
    ) -> Result<SynMapping>;
}


/// Intensity-weighted centre of mass of the positive voxels, in world coordinates.
pub fn centroid(vol: &Volume) -> Option<[f64; 3]> {
    let s = vol.shape();
    let mut acc = [0.0f64; 3];
    let mut total = 0.0f64;
    for i in 0..s[0] {
        for j in 0..s[1] {
            for k in 0..s[2] {
                let v = vol.data[[i, j, k, 0]] as f64;
                if v > 0.0 && v.is_finite() {
                    acc[0] += v * i as f64;
                    acc[1] += v * j as f64;
                    acc[2] += v * k as f64;
                    total += v;
                }
            }
        }
    }
    if total == 0.0 {
        return None;
    }
    Some(vol.affine().apply([acc[0] / total, acc[1] / total, acc[2] / total]))
}


/// Reference backend aligning intensity centroids.
///
/// Affine estimates are pure translations; the non-linear warp is the affine expressed as a
/// displacement field, and warp inversion uses fixed-point iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct CentroidSolver;

impl CentroidSolver {
    fn centroids(&self, moving: &Volume, fixed: &Volume) -> Result<([f64; 3], [f64; 3])> {
        let empty = |name: &str| RegistrationError::RegistrationFailed(
            String::from("centroid alignment"),
            format!("{} volume has no positive voxels", name),
        );
        let m = centroid(moving).ok_or_else(|| empty("moving"))?;
        let f = centroid(fixed).ok_or_else(|| empty("fixed"))?;
        Ok((m, f))
    }
}

impl RegistrationSolver for CentroidSolver {
    fn affine(&self, moving: &Volume, fixed: &Volume, init: Option<&Affine>, _options: &AlignOptions) -> Result<Affine> {
        let (m, f) = self.centroids(moving, fixed)?;
        let init = init.cloned().unwrap_or_default();
        let seeded = init.apply(m);
        let residual = Affine::translation([f[0] - seeded[0], f[1] - seeded[1], f[2] - seeded[2]]);
        Ok(init.then(&residual))
    }

    fn boundary_based(&self, moving: &Volume, fixed: &Volume, init: &Affine, wm_edge: &Volume, options: &AlignOptions) -> Result<Affine> {
        if wm_edge.count_nonzero() == 0 {
            return Err(RegistrationError::RegistrationFailed(
                String::from("boundary-based alignment"),
                String::from("white-matter edge map is empty"),
            ));
        }
        self.affine(moving, fixed, Some(init), options)
    }

    fn nonlinear(&self, _moving: &Volume, fixed: &Volume, init: &Affine, _fixed_mask: Option<&Volume>) -> Result<WarpField> {
        WarpField::from_affine(&fixed.grid, init)
    }

    fn invert_warp(&self, warp: &WarpField, grid: &Grid) -> Result<WarpField> {
        warp.invert(grid, DEFAULT_INVERSION_ITERATIONS)
    }

    fn symmetric_normalization(
        &self,
        moving: &Volume,
        fixed: &Volume,
        _moving_aux: Option<&Volume>,
        _fixed_aux: Option<&Volume>,
    ) -> Result<SynMapping> {
        let xfm = self.affine(moving, fixed, None, &AlignOptions::mutual_information(12))?;
        let warped = resample(moving, &fixed.grid, &xfm, Interpolation::Trilinear)?;
        Ok(SynMapping {
            affine: xfm.inverse()?,
            forward: WarpField::zeros(&fixed.grid),
            warped,
        })
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::volume::VolumeKind;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn blob(at: usize) -> Volume {
        let data = Array3::from_shape_fn((10, 10, 10), |(i, j, k)| {
            if (at..at + 3).contains(&i) && (3..6).contains(&j) && (3..6).contains(&k) { 1.0 } else { 0.0 }
        });
        Volume::new(data, Affine::scaling(2.0), VolumeKind::Scalar)
    }

    #[test]
    fn identical_volumes_align_to_identity() {
        let vol = blob(3);
        let xfm = CentroidSolver.affine(&vol, &vol, None, &AlignOptions::mutual_information(12)).unwrap();
        assert!(xfm.is_identity(1e-9));
    }

    #[test]
    fn shifted_volumes_align_by_translation() {
        let xfm = CentroidSolver.affine(&blob(2), &blob(5), None, &AlignOptions::mutual_information(6)).unwrap();
        assert_abs_diff_eq!(6.0, xfm.offset()[0], epsilon = 1e-9);
        assert_abs_diff_eq!(0.0, xfm.offset()[1], epsilon = 1e-9);
    }

    #[test]
    fn empty_volumes_cannot_be_aligned() {
        let empty = Volume::zeros(&blob(0).grid, 1, VolumeKind::Scalar);
        assert!(CentroidSolver.affine(&empty, &blob(3), None, &AlignOptions::mutual_information(6)).is_err());
        assert!(CentroidSolver
            .boundary_based(&blob(3), &blob(3), &Affine::identity(), &empty, &AlignOptions::boundary_based(7))
            .is_err());
    }
}

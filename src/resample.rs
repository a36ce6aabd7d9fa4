//! Pull-back resampling of volumes onto other voxel grids.
//!
//! For every voxel of the target grid, the corresponding location in the source volume is
//! found by mapping the voxel centre into world space, through the inverse of the
//! source-to-target transform, and into the voxel space of the source.

use ndarray::{Array4, ArrayView3};

use crate::affine::Affine;
use crate::error::Result;
use crate::volume::{Grid, Volume, VolumeKind};

/// How values between voxel centres are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Value of the closest voxel centre. Required for masks and label volumes.
    Nearest,
    Trilinear,
}

impl Interpolation {
    /// The interpolation that preserves the semantics of the given volume kind.
    pub fn for_kind(kind: VolumeKind) -> Interpolation {
        match kind {
            VolumeKind::Scalar => Interpolation::Trilinear,
            VolumeKind::Mask | VolumeKind::Label => Interpolation::Nearest,
        }
    }
}


/// Sample a frame at a continuous voxel coordinate. Locations outside the grid contribute `0`.
pub fn sample(frame: &ArrayView3<f32>, coord: [f64; 3], interp: Interpolation) -> f32 {
    match interp {
        Interpolation::Nearest => sample_nearest(frame, coord),
        Interpolation::Trilinear => sample_trilinear(frame, coord),
    }
}


fn value_or_zero(frame: &ArrayView3<f32>, idx: [i64; 3]) -> f32 {
    let dims = frame.dim();
    if idx[0] < 0 || idx[1] < 0 || idx[2] < 0 {
        return 0.0;
    }
    let (i, j, k) = (idx[0] as usize, idx[1] as usize, idx[2] as usize);
    if i >= dims.0 || j >= dims.1 || k >= dims.2 {
        return 0.0;
    }
    frame[[i, j, k]]
}


fn sample_nearest(frame: &ArrayView3<f32>, coord: [f64; 3]) -> f32 {
    value_or_zero(frame, [coord[0].round() as i64, coord[1].round() as i64, coord[2].round() as i64])
}


fn sample_trilinear(frame: &ArrayView3<f32>, coord: [f64; 3]) -> f32 {
    let dims = frame.dim();
    let dims = [dims.0 as f64, dims.1 as f64, dims.2 as f64];
    if !(0..3).all(|d| coord[d] > -1.0 && coord[d] < dims[d]) {
        return 0.0;
    }
    let base = [coord[0].floor(), coord[1].floor(), coord[2].floor()];
    let frac = [coord[0] - base[0], coord[1] - base[1], coord[2] - base[2]];
    let base = [base[0] as i64, base[1] as i64, base[2] as i64];

    let mut acc = 0.0f64;
    for corner in 0..8 {
        let offset = [(corner & 1) as i64, ((corner >> 1) & 1) as i64, ((corner >> 2) & 1) as i64];
        let mut weight = 1.0;
        for d in 0..3 {
            weight *= if offset[d] == 1 { frac[d] } else { 1.0 - frac[d] };
        }
        if weight == 0.0 {
            continue;
        }
        let idx = [base[0] + offset[0], base[1] + offset[1], base[2] + offset[2]];
        acc += weight * value_or_zero(frame, idx) as f64;
    }
    acc as f32
}


/// Resample `source` onto `target`, where `xfm` maps source world coordinates to target world coordinates.
///
/// All frames are resampled. The result keeps the [`VolumeKind`] of the source.
pub fn resample(source: &Volume, target: &Grid, xfm: &Affine, interp: Interpolation) -> Result<Volume> {
    // target voxel -> target world -> source world -> source voxel
    let vox_map = target.affine.then(&xfm.inverse()?).then(&source.grid.world_to_voxel()?);

    let s = target.shape;
    let frames = source.frames();
    let mut data = Array4::zeros((s[0], s[1], s[2], frames));
    for t in 0..frames {
        let frame = source.frame(t);
        for i in 0..s[0] {
            for j in 0..s[1] {
                for k in 0..s[2] {
                    let coord = vox_map.apply([i as f64, j as f64, k as f64]);
                    data[[i, j, k, t]] = sample(&frame, coord, interp);
                }
            }
        }
    }
    Ok(Volume::from_frames(data, target.affine, source.kind))
}


/// Resample `source` onto the grid of `reference` without any spatial transform, the two volumes
/// being assumed to already share a world space.
pub fn resample_to_img(source: &Volume, reference: &Volume, interp: Interpolation) -> Result<Volume> {
    if source.same_grid(reference) {
        return Ok(source.clone());
    }
    resample(source, &reference.grid, &Affine::identity(), interp)
}


#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn cube_labels() -> Volume {
        let data = Array3::from_shape_fn((6, 6, 6), |(i, j, k)| if i > 1 && j > 1 && k > 1 { (1 + i % 3) as f32 } else { 0.0 });
        Volume::new(data, Affine::scaling(2.0), VolumeKind::Label)
    }

    #[test]
    fn identity_nearest_resampling_reproduces_the_input() {
        let vol = cube_labels();
        let out = resample(&vol, &vol.grid, &Affine::identity(), Interpolation::Nearest).unwrap();
        assert_eq!(vol, out);
    }

    #[test]
    fn translations_shift_voxels_in_world_units() {
        let vol = cube_labels();
        // Moving the source by one voxel (2 mm) along x.
        let xfm = Affine::translation([2.0, 0.0, 0.0]);
        let out = resample(&vol, &vol.grid, &xfm, Interpolation::Nearest).unwrap();
        assert_eq!(vol.value_at([2, 3, 3]), out.value_at([3, 3, 3]));
        assert_eq!(0.0, out.value_at([0, 3, 3]));
    }

    #[test]
    fn trilinear_interpolates_between_centres() {
        let data = Array3::from_shape_fn((2, 1, 1), |(i, _, _)| i as f32 * 10.0);
        let vol = Volume::new(data, Affine::identity(), VolumeKind::Scalar);
        let frame = vol.frame(0);
        assert_abs_diff_eq!(2.5, sample(&frame, [0.25, 0.0, 0.0], Interpolation::Trilinear), epsilon = 1e-6);
        assert_abs_diff_eq!(10.0, sample(&frame, [0.6, 0.0, 0.0], Interpolation::Nearest));
        assert_eq!(0.0, sample(&frame, [5.0, 0.0, 0.0], Interpolation::Nearest));
    }

    #[test]
    fn far_and_non_finite_coordinates_sample_zero() {
        let data = Array3::from_elem((2, 2, 2), 1.0f32);
        let vol = Volume::new(data, Affine::identity(), VolumeKind::Scalar);
        let frame = vol.frame(0);
        assert_eq!(0.0, sample(&frame, [1e300, 0.0, 0.0], Interpolation::Trilinear));
        assert_eq!(0.0, sample(&frame, [-1e300, 0.0, 0.0], Interpolation::Nearest));
        assert_eq!(0.0, sample(&frame, [0.0, f64::NAN, 0.0], Interpolation::Trilinear));
        assert_eq!(0.0, sample(&frame, [f64::INFINITY, 0.0, 0.0], Interpolation::Trilinear));
        assert_abs_diff_eq!(0.5, sample(&frame, [-0.5, 0.0, 0.0], Interpolation::Trilinear), epsilon = 1e-6);
    }

    #[test]
    fn resampling_to_a_coarser_grid_keeps_integer_labels() {
        let vol = cube_labels();
        let coarse = Grid::new([3, 3, 3], Affine::scaling(4.0));
        let out = resample(&vol, &coarse, &Affine::identity(), Interpolation::Nearest).unwrap();
        assert!(out.data.iter().all(|v| v.fract() == 0.0));
        assert_eq!(vol.value_at([4, 4, 4]), out.value_at([2, 2, 2]));
    }
}

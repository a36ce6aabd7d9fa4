//! Voxel-wise boolean algebra and simple morphological operators on masks.

use ndarray::Array3;

use crate::error::Result;
use crate::volume::{Volume, VolumeKind};

fn combine<F>(a: &Volume, b: &Volume, op: F) -> Result<Volume>
where
    F: Fn(bool, bool) -> bool,
{
    a.check_same_grid(b)?;
    let data = Array3::from_shape_fn(
        (a.shape()[0], a.shape()[1], a.shape()[2]),
        |(i, j, k)| {
            let x = a.data[[i, j, k, 0]] != 0.0;
            let y = b.data[[i, j, k, 0]] != 0.0;
            if op(x, y) { 1.0 } else { 0.0 }
        },
    );
    Ok(Volume::new(data, *a.affine(), VolumeKind::Mask))
}

/// Voxels non-zero in both masks.
pub fn intersect(a: &Volume, b: &Volume) -> Result<Volume> {
    combine(a, b, |x, y| x && y)
}

/// Voxels non-zero in either mask.
pub fn union(a: &Volume, b: &Volume) -> Result<Volume> {
    combine(a, b, |x, y| x || y)
}

/// Voxels non-zero in `a` but not in `b`.
pub fn subtract(a: &Volume, b: &Volume) -> Result<Volume> {
    combine(a, b, |x, y| x && !y)
}


/// Offsets of all voxels within `radius_mm` of the kernel centre.
fn sphere_offsets(radius_mm: f64, vox_size: f64) -> Vec<[i64; 3]> {
    let reach = (radius_mm / vox_size).floor() as i64;
    let r2 = radius_mm * radius_mm;
    let mut offsets = Vec::new();
    for dx in -reach..=reach {
        for dy in -reach..=reach {
            for dz in -reach..=reach {
                let d2 = ((dx * dx + dy * dy + dz * dz) as f64) * vox_size * vox_size;
                if d2 <= r2 {
                    offsets.push([dx, dy, dz]);
                }
            }
        }
    }
    offsets
}


/// Binary erosion with a spherical kernel: a voxel survives only if every in-grid voxel within
/// `radius_mm` is non-zero.
pub fn erode_sphere(mask: &Volume, radius_mm: f64) -> Volume {
    let offsets = sphere_offsets(radius_mm, mask.vox_size());
    let s = mask.shape();
    let data = Array3::from_shape_fn((s[0], s[1], s[2]), |(i, j, k)| {
        if mask.data[[i, j, k, 0]] == 0.0 {
            return 0.0;
        }
        let eroded = offsets.iter().any(|o| {
            let idx = [i as i64 + o[0], j as i64 + o[1], k as i64 + o[2]];
            mask.grid.contains(idx) && mask.value_at(idx) == 0.0
        });
        if eroded { 0.0 } else { 1.0 }
    });
    Volume::new(data, *mask.affine(), VolumeKind::Mask)
}


/// Gradient magnitude of the first frame from central differences (one-sided at the borders).
pub fn edge_strength(vol: &Volume) -> Volume {
    let s = vol.shape();
    let frame = vol.frame(0);
    let at = |i: usize, j: usize, k: usize| frame[[i, j, k]] as f64;
    let data = Array3::from_shape_fn((s[0], s[1], s[2]), |(i, j, k)| {
        let idx = [i, j, k];
        let mut sq = 0.0;
        for d in 0..3 {
            if s[d] < 2 {
                continue;
            }
            let mut lo = idx;
            let mut hi = idx;
            if idx[d] > 0 { lo[d] -= 1; }
            if idx[d] + 1 < s[d] { hi[d] += 1; }
            let span = (hi[d] - lo[d]) as f64;
            let g = (at(hi[0], hi[1], hi[2]) - at(lo[0], lo[1], lo[2])) / span;
            sq += g * g;
        }
        sq.sqrt() as f32
    });
    Volume::new(data, *vol.affine(), VolumeKind::Scalar)
}


/// Binary edge map of `vol`, restricted to `mask`.
pub fn edge_mask(vol: &Volume, mask: &Volume) -> Result<Volume> {
    edge_strength(vol).binarize(0.0).masked(mask)
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::affine::Affine;

    fn block(lo: usize, hi: usize) -> Volume {
        let data = Array3::from_shape_fn((9, 9, 9), |(i, j, k)| {
            if (lo..hi).contains(&i) && (lo..hi).contains(&j) && (lo..hi).contains(&k) { 1.0 } else { 0.0 }
        });
        Volume::new(data, Affine::identity(), VolumeKind::Mask)
    }

    #[test]
    fn boolean_algebra_is_voxelwise() {
        let a = block(0, 5);
        let b = block(3, 9);
        assert_eq!(8, intersect(&a, &b).unwrap().count_nonzero());
        assert_eq!(125 + 216 - 8, union(&a, &b).unwrap().count_nonzero());
        assert_eq!(125 - 8, subtract(&a, &b).unwrap().count_nonzero());
    }

    #[test]
    fn erosion_peels_the_border_of_a_block() {
        let a = block(2, 7);
        let eroded = erode_sphere(&a, 1.0);
        assert_eq!(27, eroded.count_nonzero());
        assert_eq!(1.0, eroded.value_at([4, 4, 4]));
        assert_eq!(0.0, eroded.value_at([2, 4, 4]));
        assert_eq!(a, erode_sphere(&a, 0.5));
    }

    #[test]
    fn edges_only_appear_at_intensity_changes() {
        let a = block(2, 7);
        let edges = edge_mask(&a, &a).unwrap();
        assert_eq!(0.0, edges.value_at([4, 4, 4]));
        assert_eq!(1.0, edges.value_at([2, 4, 4]));
        assert_eq!(0.0, edges.value_at([0, 0, 0]));
    }
}

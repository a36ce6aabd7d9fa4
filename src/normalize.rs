//! Normalization of native-space streamlines into template space.
//!
//! The anisotropy volume is registered to the template FA volume with a dedicated symmetric
//! normalization. Streamlines are deformed with its forward field, moved back through an
//! isocenter-corrected affine and filtered against the template brain mask.

use log::{debug, info};

use std::fs;
use std::path::{Path, PathBuf};

use crate::affine::Affine;
use crate::config::TemplateLibrary;
use crate::error::{RegistrationError, Result};
use crate::naming::{density_map_mni_path, liberal_atlas_path, streamlines_mni_path, tractography_dir, TractographyParams};
use crate::nifti::read_nifti_grid;
use crate::resample::{resample, Interpolation};
use crate::solver::{RegistrationSolver, SynMapping};
use crate::streamline::{CoordinateSpace, Origin, Streamline, StreamlineSet};
use crate::trk::{read_trk, write_trk, TrkHeader};
use crate::util::{nifti_stem, van_der_corput};
use crate::volume::{Volume, VolumeKind};

/// Per-axis translation multipliers: the van der Corput sequence at 1, 2, 3 with the voxel size as base.
///
/// # Examples
///
/// ```
/// let m = tractreg::normalize::isocenter_multipliers(2.0).unwrap();
/// assert_eq!([0.5, 0.25, 0.75], m);
/// ```
pub fn isocenter_multipliers(vox_size: f64) -> Result<[f64; 3]> {
    Ok([van_der_corput(1, vox_size)?, van_der_corput(2, vox_size)?, van_der_corput(3, vox_size)?])
}

/// The affine with each translation component `t_i` replaced by `-t_i * m_i`.
pub fn isocenter_adjusted(affine: &Affine, vox_size: f64) -> Result<Affine> {
    let mul = isocenter_multipliers(vox_size)?;
    let t = affine.offset();
    Ok(affine.with_offset([-t[0] * mul[0], -t[1] * mul[1], -t[2] * mul[2]]))
}

/// Add the forward displacement of `mapping` at every point. `point_to_voxel` maps points to field voxels.
pub fn deform_streamlines(streamlines: &StreamlineSet, mapping: &SynMapping, point_to_voxel: &Affine) -> StreamlineSet {
    streamlines.map_points(|p| {
        let d = mapping.forward.displacement_at(p, point_to_voxel);
        [p[0] + d[0], p[1] + d[1], p[2] + d[2]]
    })
}


/// Clip the segment from `a` to `b` to the box `[0, shape]` on every axis. `None` if it misses the box.
fn clip_to_box(a: [f64; 3], b: [f64; 3], shape: [usize; 3]) -> Option<([f64; 3], [f64; 3])> {
    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    // Axis and face coordinate where the clipped segment enters and leaves the box.
    let mut enter: Option<(usize, f64)> = None;
    let mut exit: Option<(usize, f64)> = None;
    for d in 0..3 {
        let hi = shape[d] as f64;
        let dir = b[d] - a[d];
        if !dir.is_finite() {
            return None;
        }
        if dir == 0.0 {
            if a[d] < 0.0 || a[d] >= hi {
                return None;
            }
            continue;
        }
        let (near, far) = if dir > 0.0 { (0.0, hi) } else { (hi, 0.0) };
        let (t_near, t_far) = ((near - a[d]) / dir, (far - a[d]) / dir);
        if t_near > t0 {
            t0 = t_near;
            enter = Some((d, near));
        }
        if t_far < t1 {
            t1 = t_far;
            exit = Some((d, far));
        }
        if t0 > t1 {
            return None;
        }
    }
    let at = |t: f64, face: Option<(usize, f64)>| {
        let mut p = [0.0; 3];
        for d in 0..3 {
            p[d] = (a[d] + t * (b[d] - a[d])).max(0.0).min(shape[d] as f64);
        }
        // Exact on the crossed face, whatever the precision of `t`.
        if let Some((d, v)) = face {
            p[d] = v;
        }
        p
    };
    Some((at(t0, enter), at(t1, exit)))
}

/// Voxels of a grid of `shape` crossed by the segment from `a` to `b`, both in continuous voxel
/// coordinates with centred voxels, in the order they are entered.
///
/// The segment is clipped to the grid first, so voxels outside the grid are never listed. Segments
/// with a non-finite end point cross nothing.
pub fn segment_voxels(a: [f64; 3], b: [f64; 3], shape: [usize; 3]) -> Vec<[i64; 3]> {
    if shape.iter().any(|&n| n == 0) || !a.iter().chain(b.iter()).all(|c| c.is_finite()) {
        return Vec::new();
    }
    // Shifted so that voxel i spans [i, i + 1).
    let a = [a[0] + 0.5, a[1] + 0.5, a[2] + 0.5];
    let b = [b[0] + 0.5, b[1] + 0.5, b[2] + 0.5];
    let (a, b) = match clip_to_box(a, b, shape) {
        Some(clipped) => clipped,
        None => return Vec::new(),
    };
    let index = |p: [f64; 3], d: usize| (p[d].floor() as i64).max(0).min(shape[d] as i64 - 1);
    let mut current = [index(a, 0), index(a, 1), index(a, 2)];
    let end = [index(b, 0), index(b, 1), index(b, 2)];

    let mut step = [0i64; 3];
    let mut t_max = [f64::INFINITY; 3];
    let mut t_delta = [f64::INFINITY; 3];
    for d in 0..3 {
        let dir = b[d] - a[d];
        if dir > 0.0 {
            step[d] = 1;
            t_delta[d] = 1.0 / dir;
            t_max[d] = (current[d] as f64 + 1.0 - a[d]) / dir;
        } else if dir < 0.0 {
            step[d] = -1;
            t_delta[d] = -1.0 / dir;
            t_max[d] = (a[d] - current[d] as f64) / -dir;
        }
    }

    let mut voxels = vec![current];
    let max_steps: i64 = (0..3).map(|d| (end[d] - current[d]).abs()).sum();
    for _ in 0..max_steps {
        if current == end {
            break;
        }
        let axis = if t_max[0] <= t_max[1] && t_max[0] <= t_max[2] {
            0
        } else if t_max[1] <= t_max[2] {
            1
        } else {
            2
        };
        if t_max[axis] > 1.0 {
            break;
        }
        current[axis] += step[axis];
        if current[axis] < 0 || current[axis] >= shape[axis] as i64 {
            break;
        }
        t_max[axis] += t_delta[axis];
        voxels.push(current);
    }
    voxels
}

fn crosses_mask(sl: &Streamline, mask: &Volume, point_to_voxel: &Affine) -> bool {
    let shape = mask.shape();
    let inside = |v: &[i64; 3]| mask.value_at(*v) != 0.0;
    let points: Vec<[f64; 3]> = sl.iter().map(|p| point_to_voxel.apply(*p)).collect();
    if !points.iter().all(|p| p.iter().all(|c| c.is_finite())) {
        return false;
    }
    match points.len() {
        0 => false,
        1 => segment_voxels(points[0], points[0], shape).iter().any(&inside),
        _ => points.windows(2).any(|w| segment_voxels(w[0], w[1], shape).iter().any(&inside)),
    }
}

/// Keep the streamlines whose polyline passes through a non-zero voxel of `mask` (`include`),
/// or those that never do (`!include`). Segments between points are traversed, so a streamline
/// whose points all lie outside the mask is kept if one of its segments crosses it. A streamline
/// with a non-finite point never crosses the mask.
pub fn target_line_based(streamlines: &StreamlineSet, mask: &Volume, point_to_voxel: &Affine, include: bool) -> StreamlineSet {
    let kept = streamlines
        .iter()
        .filter(|sl| crosses_mask(sl, mask, point_to_voxel) == include)
        .cloned()
        .collect();
    StreamlineSet::new(kept, streamlines.space, streamlines.origin)
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

/// Drop streamlines with a point at a negative index under the identity, centred-voxel mapping.
/// Returns the number dropped.
pub fn drop_negative_indices(streamlines: &mut StreamlineSet) -> usize {
    let before = streamlines.len();
    streamlines.retain(|sl| {
        let lowest = sl.iter().flat_map(|p| p.iter()).fold(f64::INFINITY, |acc, c| acc.min(c + 0.5));
        !(round6(lowest) < 0.0)
    });
    before - streamlines.len()
}

/// Union of two label volumes on the same grid. Where both are labelled, `canonical` wins.
pub fn liberal_union(canonical: &Volume, warped: &Volume) -> Result<Volume> {
    canonical.check_same_grid(warped)?;
    let mut out = canonical.clone();
    out.kind = VolumeKind::Label;
    for (o, w) in out.data.iter_mut().zip(warped.data.iter()) {
        if *o == 0.0 {
            *o = *w;
        }
    }
    Ok(out)
}

/// Bring native RASMM streamlines into voxel coordinates of the template grid and keep those
/// crossing `brain_mask`.
pub fn normalize_streamlines(
    streamlines: &StreamlineSet,
    mapping: &SynMapping,
    vox_size: f64,
    brain_mask: &Volume,
) -> Result<StreamlineSet> {
    let warped_affine = *mapping.warped.affine();
    let in_grid = streamlines.transform(&warped_affine, CoordinateSpace::Rasmm);
    let ref_grid = Affine::scaling(vox_size).inverse()?;
    let deformed = deform_streamlines(&in_grid, mapping, &ref_grid);
    drop(in_grid);

    let adjusted = isocenter_adjusted(&mapping.affine, vox_size)?;
    let back = adjusted.inverse()?.then(&warped_affine.inverse()?);
    let mut in_template = deformed.transform(&back, CoordinateSpace::Voxel);
    in_template.origin = Origin::Center;
    drop(deformed);

    let invalid = in_template.remove_invalid();
    let mut kept = target_line_based(&in_template, brain_mask, &Affine::identity(), true);
    let negative = drop_negative_indices(&mut kept);
    debug!(
        "{} of {} streamlines invalid, {} cross the template brain mask, {} of those dropped for negative indices",
        invalid,
        streamlines.len(),
        kept.len() + negative,
        negative
    );
    Ok(kept)
}


/// Inputs of a streamline normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationInputs {
    /// TrackVis file of native diffusion-space streamlines.
    pub streamlines: PathBuf,
    pub fa: PathBuf,
    pub ap: PathBuf,
    /// Atlas in native diffusion space.
    pub atlas_native: PathBuf,
    /// The same atlas in template space.
    pub uatlas: PathBuf,
    pub node_coords: Vec<[f64; 3]>,
    pub node_labels: Vec<String>,
}

/// Files written by a streamline normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationProducts {
    pub streamlines: PathBuf,
    pub density_map: PathBuf,
    pub liberal_atlas: PathBuf,
    pub warped_fa: PathBuf,
    pub input_count: usize,
    pub retained: usize,
}


/// Normalizes tractography of one subject into template space.
pub struct StreamlineNormalizer<'a> {
    solver: &'a dyn RegistrationSolver,
    templates: &'a TemplateLibrary,
}

impl<'a> StreamlineNormalizer<'a> {
    pub fn new(solver: &'a dyn RegistrationSolver, templates: &'a TemplateLibrary) -> StreamlineNormalizer<'a> {
        StreamlineNormalizer { solver, templates }
    }

    /// Normalize the streamlines of `inputs`.
    ///
    /// Outputs are named after `params` below `dir`; intermediate volumes go to
    /// `{base_dir}/dmri_reg/DSN`. Fails if the node coordinates and labels differ in number.
    ///
    /// The template library must have the resolution of the FA volume, rounded to whole mm.
    /// The isocenter correction uses the voxel size as the base of a van der Corput sequence,
    /// so data with voxels of 1 mm or smaller cannot be normalized and fail with
    /// [`RegistrationError::InvalidSequenceBase`].
    pub fn normalize<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        inputs: &NormalizationInputs,
        params: &TractographyParams,
        dir: P,
        base_dir: Q,
    ) -> Result<NormalizationProducts> {
        let dir = dir.as_ref();
        let dsn_dir = base_dir.as_ref().join("dmri_reg").join("DSN");
        fs::create_dir_all(&dsn_dir)?;
        fs::create_dir_all(tractography_dir(dir))?;
        for p in [self.templates.fa(), self.templates.brain(), inputs.uatlas.clone()].iter() {
            if !p.is_file() {
                return Err(RegistrationError::MissingReference(p.clone()));
            }
        }

        let fa = Volume::from_file(&inputs.fa)?;
        let vox_size = fa.vox_size();
        let matching = TemplateLibrary::new(&self.templates.root, self.templates.name.as_str(), vox_size);
        if matching.resolution != self.templates.resolution {
            return Err(RegistrationError::InvalidConfiguration(format!(
                "{} mm templates cannot normalize data with {} mm voxels",
                self.templates.resolution, vox_size
            )));
        }
        let template_fa = Volume::from_file(self.templates.fa())?;
        let brain_mask = template_fa.binarize(0.0);
        let template_brain = Volume::from_file(self.templates.brain())?;
        let ap = Volume::from_file(&inputs.ap)?;
        info!("Running symmetric normalization of {} to {}", inputs.fa.display(), self.templates.fa().display());
        let mapping = self
            .solver
            .symmetric_normalization(&fa, &template_fa, Some(&ap), Some(&template_brain))
            .map_err(|e| RegistrationError::RegistrationFailed(String::from("fa2template"), e.to_string()))?;
        drop(ap);
        drop(template_brain);
        drop(template_fa);
        drop(fa);
        let warped_fa = dsn_dir.join(format!("{}_in_template.nii.gz", nifti_stem(&inputs.fa)));
        mapping.warped.to_file(&warped_fa)?;

        let (_, native) = read_trk(&inputs.streamlines)?;
        let input_count = native.len();
        let in_template = normalize_streamlines(&native, &mapping, vox_size, &brain_mask)?;
        drop(native);
        drop(brain_mask);

        let uatlas_grid = read_nifti_grid(&inputs.uatlas)?;
        let streamlines = streamlines_mni_path(dir, params);
        let rasmm = in_template.transform(mapping.warped.affine(), CoordinateSpace::Rasmm);
        write_trk(&streamlines, &TrkHeader::for_grid(&uatlas_grid), &rasmm)?;
        drop(rasmm);

        let density_map = density_map_mni_path(dir, params);
        in_template.density_map(&mapping.warped.grid)?.to_file(&density_map)?;
        let retained = in_template.len();
        drop(in_template);
        info!("Kept {} of {} streamlines in template space", retained, input_count);

        let liberal_atlas = liberal_atlas_path(dir, &inputs.uatlas);
        if let Some(parent) = liberal_atlas.parent() {
            fs::create_dir_all(parent)?;
        }
        let native_atlas = Volume::from_file(&inputs.atlas_native)?.into_kind(VolumeKind::Label);
        let warped_atlas = mapping.forward.apply(&native_atlas, Interpolation::Nearest, Some(&mapping.affine))?;
        drop(native_atlas);
        let warped_atlas = resample(&warped_atlas, &uatlas_grid, &Affine::identity(), Interpolation::Nearest)?;
        let uatlas = Volume::from_file(&inputs.uatlas)?.into_kind(VolumeKind::Label);
        liberal_union(&uatlas, &warped_atlas)?.to_file(&liberal_atlas)?;

        if inputs.node_coords.len() != inputs.node_labels.len() {
            return Err(RegistrationError::LabelCoordinateMismatch(inputs.node_coords.len(), inputs.node_labels.len()));
        }

        Ok(NormalizationProducts { streamlines, density_map, liberal_atlas, warped_fa, input_count, retained })
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::volume::Grid;
    use crate::warp::WarpField;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn slab_mask() -> Volume {
        let data = Array3::from_shape_fn((10, 10, 10), |(i, _, _)| if i == 5 { 1.0 } else { 0.0 });
        Volume::new(data, Affine::identity(), VolumeKind::Mask)
    }

    fn set(streamlines: Vec<Streamline>) -> StreamlineSet {
        StreamlineSet::new(streamlines, CoordinateSpace::Voxel, Origin::Center)
    }

    #[test]
    fn multipliers_follow_the_van_der_corput_sequence() {
        assert_eq!([0.5, 0.25, 0.75], isocenter_multipliers(2.0).unwrap());
        assert!(isocenter_multipliers(1.0).is_err());

        let affine = Affine::from_rows([[2.0, 0.0, 0.0, -90.0], [0.0, 2.0, 0.0, -126.0], [0.0, 0.0, 2.0, -72.0], [0.0, 0.0, 0.0, 1.0]]);
        let adjusted = isocenter_adjusted(&affine, 2.0).unwrap();
        assert_eq!([45.0, 31.5, 54.0], adjusted.offset());
        assert_eq!(affine.rows()[0][0], adjusted.rows()[0][0]);
    }

    #[test]
    fn segments_enter_every_voxel_they_cross() {
        let voxels = segment_voxels([0.0, 0.0, 0.0], [3.0, 0.0, 0.0], [10, 10, 10]);
        assert_eq!(vec![[0, 0, 0], [1, 0, 0], [2, 0, 0], [3, 0, 0]], voxels);
        let diagonal = segment_voxels([0.0, 0.0, 0.0], [2.0, 2.0, 0.0], [10, 10, 10]);
        assert_eq!([0, 0, 0], diagonal[0]);
        assert_eq!([2, 2, 0], *diagonal.last().unwrap());
        for w in diagonal.windows(2) {
            let moved: i64 = (0..3).map(|d| (w[1][d] - w[0][d]).abs()).sum();
            assert_eq!(1, moved);
        }
    }

    #[test]
    fn segments_are_clipped_to_the_grid() {
        let far = segment_voxels([20.0, 4.0, 4.0], [2e7, 4.0, 4.0], [10, 10, 10]);
        assert!(far.is_empty());

        let through = segment_voxels([-1e300, 4.0, 4.0], [1e300, 4.0, 4.0], [10, 10, 10]);
        assert_eq!(10, through.len());
        assert_eq!([0, 4, 4], through[0]);
        assert_eq!([9, 4, 4], through[9]);

        let entering = segment_voxels([-5.0, 2.0, 2.0], [2.0, 2.0, 2.0], [10, 10, 10]);
        assert_eq!(vec![[0, 2, 2], [1, 2, 2], [2, 2, 2]], entering);
    }

    #[test]
    fn non_finite_points_cross_nothing() {
        assert!(segment_voxels([f64::INFINITY, 4.0, 4.0], [4.0, 4.0, 4.0], [10, 10, 10]).is_empty());
        assert!(segment_voxels([4.0, 4.0, 4.0], [4.0, f64::NAN, 4.0], [10, 10, 10]).is_empty());

        let mask = slab_mask();
        let broken = vec![[3.0, 4.0, 4.0], [f64::INFINITY, 4.0, 4.0], [8.0, 4.0, 4.0]];
        let huge = vec![[-1e300, 4.0, 4.0], [1e300, 4.0, 4.0]];
        let kept = target_line_based(&set(vec![broken.clone(), huge.clone()]), &mask, &Affine::identity(), true);
        assert_eq!(vec![huge], kept.streamlines);
        let excluded = target_line_based(&set(vec![broken]), &mask, &Affine::identity(), false);
        assert_eq!(1, excluded.len());
    }

    #[test]
    fn streamlines_crossing_the_mask_between_points_are_kept() {
        let mask = slab_mask();
        let straddling = vec![[3.0, 4.0, 4.0], [8.0, 4.0, 4.0]];
        let outside = vec![[1.0, 4.0, 4.0], [3.0, 4.0, 4.0]];
        let kept = target_line_based(&set(vec![straddling.clone(), outside.clone()]), &mask, &Affine::identity(), true);
        assert_eq!(vec![straddling.clone()], kept.streamlines);
        let excluded = target_line_based(&set(vec![straddling, outside.clone()]), &mask, &Affine::identity(), false);
        assert_eq!(vec![outside], excluded.streamlines);
    }

    #[test]
    fn negative_indices_are_dropped_after_rounding() {
        let mut s = set(vec![
            vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]],
            vec![[-0.5000001, 0.0, 0.0], [1.0, 1.0, 1.0]],
            vec![[-0.6, 0.0, 0.0], [1.0, 1.0, 1.0]],
        ]);
        assert_eq!(1, drop_negative_indices(&mut s));
        assert_eq!(2, s.len());
    }

    #[test]
    fn liberal_union_keeps_canonical_labels_on_overlap() {
        let canonical = Volume::new(Array3::from_shape_fn((3, 1, 1), |(i, _, _)| [1.0, 2.0, 0.0][i]), Affine::identity(), VolumeKind::Label);
        let warped = Volume::new(Array3::from_shape_fn((3, 1, 1), |(i, _, _)| [0.0, 3.0, 4.0][i]), Affine::identity(), VolumeKind::Label);
        let union = liberal_union(&canonical, &warped).unwrap();
        assert_eq!(vec![1.0, 2.0, 4.0], union.data.iter().cloned().collect::<Vec<f32>>());
    }

    #[test]
    fn identity_mapping_keeps_streamlines_in_place() {
        let grid = Grid::new([10, 10, 10], Affine::identity());
        let mapping = SynMapping {
            affine: Affine::identity(),
            forward: WarpField::zeros(&grid),
            warped: Volume::zeros(&grid, 1, VolumeKind::Scalar),
        };
        let native = StreamlineSet::new(
            vec![
                vec![[3.0, 4.0, 4.0], [8.0, 4.0, 4.0]],
                vec![[1.0, 1.0, 1.0], [2.0, 1.0, 1.0]],
                vec![[3.0, 4.0, 4.0], [f64::NAN, 4.0, 4.0], [8.0, 4.0, 4.0]],
                vec![[1e300, 4.0, 4.0], [2e300, 4.0, 4.0]],
            ],
            CoordinateSpace::Rasmm,
            Origin::Center,
        );
        let out = normalize_streamlines(&native, &mapping, 1.5, &slab_mask()).unwrap();
        assert_eq!(1, out.len());
        assert_eq!(CoordinateSpace::Voxel, out.space);
        assert_abs_diff_eq!(8.0, out.streamlines[0][1][0], epsilon = 1e-9);
    }
}

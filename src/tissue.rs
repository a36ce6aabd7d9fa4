//! Tissue probability maps and the binary masks derived from them.

use log::debug;

use crate::config::TissueThresholds;
use crate::error::Result;
use crate::morphology::{erode_sphere, intersect, subtract, union};
use crate::volume::Volume;

/// White matter, gray matter and CSF probability volumes on a common grid.
#[derive(Debug, Clone, PartialEq)]
pub struct TissueProbabilities {
    pub wm: Volume,
    pub gm: Volume,
    pub csf: Volume,
}

impl TissueProbabilities {
    pub fn check_same_grid(&self) -> Result<()> {
        self.wm.check_same_grid(&self.gm)?;
        self.wm.check_same_grid(&self.csf)
    }

    /// Binary masks at the given thresholds, and the probability maps restricted to them.
    pub fn threshold(&self, wm: f32, gm: f32, csf: f32) -> Result<(TissueProbabilities, TissueBinaries)> {
        self.check_same_grid()?;
        let bins = TissueBinaries {
            wm: self.wm.binarize(wm),
            gm: self.gm.binarize(gm),
            csf: self.csf.binarize(csf),
        };
        let probs = TissueProbabilities {
            wm: self.wm.masked(&bins.wm)?,
            gm: self.gm.masked(&bins.gm)?,
            csf: self.csf.masked(&bins.csf)?,
        };
        Ok((probs, bins))
    }
}


/// Thresholded tissue classes.
#[derive(Debug, Clone, PartialEq)]
pub struct TissueBinaries {
    pub wm: Volume,
    pub gm: Volume,
    pub csf: Volume,
}


/// The binary tissue masks of a session, all on the grid of the subject-space reference.
#[derive(Debug, Clone, PartialEq)]
pub struct TissueMaskSet {
    pub wm: Volume,
    pub gm: Volume,
    pub csf: Volume,
    /// Eroded ventricle mask.
    pub ventricle: Option<Volume>,
    /// Union of ventricles and CSF, the avoidance mask for tractography.
    pub ventricle_csf: Option<Volume>,
    pub corpus_callosum: Option<Volume>,
    /// White-gray matter interface, the waypoint mask for tractography.
    pub interface: Option<Volume>,
}

impl TissueMaskSet {
    /// Masks without ventricle handling.
    pub fn from_binaries(bins: TissueBinaries) -> TissueMaskSet {
        TissueMaskSet {
            wm: bins.wm,
            gm: bins.gm,
            csf: bins.csf,
            ventricle: None,
            ventricle_csf: None,
            corpus_callosum: None,
            interface: None,
        }
    }

    /// Combine subject-space tissue probabilities with ventricle and corpus callosum references.
    ///
    /// The ventricle mask is eroded with a sphere of `erosion_mm` and joined with CSF. The corpus
    /// callosum is restricted to white matter outside ventricles and CSF. The interface is the
    /// overlap of gray and white matter plus the corpus callosum, inside `brain_mask` and outside
    /// ventricles and CSF.
    pub fn compose(
        probs: &TissueProbabilities,
        thresholds: &TissueThresholds,
        ventricle: &Volume,
        corpus_callosum: &Volume,
        brain_mask: Option<&Volume>,
        erosion_mm: f64,
    ) -> Result<TissueMaskSet> {
        let (_, bins) = probs.threshold(thresholds.wm, thresholds.gm, thresholds.csf)?;
        let (vent, vent_csf) = ventricle_csf(ventricle, &bins.csf, erosion_mm)?;
        let cc = corpus_callosum_mask(corpus_callosum, &bins.wm, &vent_csf)?;
        let interface = interface_mask(&bins.gm, &bins.wm, &cc, brain_mask, Some(&vent_csf))?;
        debug!(
            "Interface mask has {} voxels, ventricle/CSF mask {} voxels",
            interface.count_nonzero(),
            vent_csf.count_nonzero()
        );
        Ok(TissueMaskSet {
            wm: bins.wm,
            gm: bins.gm,
            csf: bins.csf,
            ventricle: Some(vent),
            ventricle_csf: Some(vent_csf),
            corpus_callosum: Some(cc),
            interface: Some(interface),
        })
    }

    /// Check that every mask lies on the grid of `reference`.
    pub fn check_grid(&self, reference: &Volume) -> Result<()> {
        let optional = [&self.ventricle, &self.ventricle_csf, &self.corpus_callosum, &self.interface];
        for mask in [&self.wm, &self.gm, &self.csf].iter().cloned().chain(optional.iter().filter_map(|m| m.as_ref())) {
            reference.check_same_grid(mask)?;
        }
        Ok(())
    }
}


/// Erode the ventricle mask and join it with the CSF mask. Returns the eroded ventricles and the union.
pub fn ventricle_csf(ventricle: &Volume, csf_bin: &Volume, erosion_mm: f64) -> Result<(Volume, Volume)> {
    let eroded = erode_sphere(&ventricle.binarize(0.0), erosion_mm);
    let joined = union(csf_bin, &eroded)?;
    Ok((eroded, joined))
}

/// Corpus callosum voxels inside white matter and outside ventricles and CSF.
pub fn corpus_callosum_mask(corpus_callosum: &Volume, wm_bin: &Volume, ventricle_csf: &Volume) -> Result<Volume> {
    subtract(&intersect(corpus_callosum, wm_bin)?, ventricle_csf)
}

/// `((gm AND wm) OR cc) AND brain_mask`, minus `exclude`.
pub fn interface_mask(
    gm_bin: &Volume,
    wm_bin: &Volume,
    corpus_callosum: &Volume,
    brain_mask: Option<&Volume>,
    exclude: Option<&Volume>,
) -> Result<Volume> {
    let mut interface = union(&intersect(gm_bin, wm_bin)?, corpus_callosum)?;
    if let Some(mask) = brain_mask {
        interface = intersect(&interface, mask)?;
    }
    if let Some(exclude) = exclude {
        interface = subtract(&interface, exclude)?;
    }
    Ok(interface)
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::affine::Affine;
    use crate::volume::VolumeKind;
    use ndarray::Array3;

    fn field<F: Fn(usize, usize, usize) -> f32>(f: F) -> Volume {
        Volume::new(Array3::from_shape_fn((12, 12, 12), |(i, j, k)| f(i, j, k)), Affine::identity(), VolumeKind::Scalar)
    }

    fn probabilities() -> TissueProbabilities {
        TissueProbabilities {
            // WM fades out along x, GM fades in.
            wm: field(|i, _, _| 1.0 - i as f32 / 11.0),
            gm: field(|i, _, _| i as f32 / 11.0),
            csf: field(|i, j, _| if j < 3 && i > 4 { 0.99 } else { 0.0 }),
        }
    }

    #[test]
    fn thresholds_are_strict_and_mask_the_probabilities() {
        let probs = probabilities();
        let (masked, bins) = probs.threshold(0.5, 0.5, 0.95).unwrap();
        assert_eq!(1.0, bins.wm.value_at([5, 0, 0]));
        assert_eq!(0.0, bins.wm.value_at([6, 0, 0]));
        assert_eq!(0.0, masked.gm.value_at([5, 0, 0]));
        assert!(masked.gm.value_at([6, 0, 0]) > 0.5);
        assert_eq!(VolumeKind::Mask, bins.csf.kind);
    }

    #[test]
    fn interface_stays_in_tissue_and_out_of_csf() {
        let probs = probabilities();
        let vent = field(|i, j, k| if (4..9).contains(&i) && (4..9).contains(&j) && (4..9).contains(&k) { 1.0 } else { 0.0 });
        let cc = field(|_, j, k| if j >= 2 && k == 6 { 1.0 } else { 0.0 });
        let masks = TissueMaskSet::compose(&probs, &TissueThresholds::diffusion(), &vent, &cc, None, 1.0).unwrap();

        let interface = masks.interface.as_ref().unwrap();
        let vent_csf = masks.ventricle_csf.as_ref().unwrap();
        let cc = masks.corpus_callosum.as_ref().unwrap();
        assert!(interface.count_nonzero() > 0);
        for (idx, v) in interface.data.indexed_iter() {
            if *v == 0.0 {
                continue;
            }
            let (i, j, k, t) = idx;
            let at = |m: &Volume| m.data[[i, j, k, t]] != 0.0;
            assert!(at(&masks.wm) || at(&masks.gm) || at(cc));
            assert!(!at(vent_csf));
        }
        // Erosion by one voxel leaves the 3x3x3 core of the 5x5x5 block.
        assert_eq!(27, masks.ventricle.as_ref().unwrap().count_nonzero());
        assert!(masks.check_grid(&probs.wm).is_ok());
    }

    #[test]
    fn brain_mask_bounds_the_interface() {
        let gm = field(|_, _, _| 1.0).binarize(0.0);
        let none = field(|_, _, _| 0.0).binarize(0.0);
        let brain = field(|i, _, _| if i < 6 { 1.0 } else { 0.0 });
        let interface = interface_mask(&gm, &gm, &none, Some(&brain), None).unwrap();
        assert_eq!(6 * 12 * 12, interface.count_nonzero());
    }
}

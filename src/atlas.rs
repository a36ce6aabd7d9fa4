//! Transport of label atlases from template space into subject space.

use log::{info, warn};

use std::path::{Path, PathBuf};

use crate::align::AlignmentPath;
use crate::affine::Affine;
use crate::error::Result;
use crate::layout::Artifact;
use crate::outcome::{Fallback, Staged};
use crate::registrar::SpaceRegistrar;
use crate::resample::{resample, Interpolation};
use crate::util::{missing_labels, nifti_stem};
use crate::volume::{Volume, VolumeKind};

/// Label integrity of a transported atlas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelReport {
    /// Distinct non-zero labels, sorted.
    pub labels: Vec<i64>,
    /// Labels between 1 and the largest label that were lost.
    pub missing: Vec<i64>,
    /// Voxels zeroed because interpolation left a non-integer value.
    pub zeroed: usize,
}

impl LabelReport {
    pub fn for_volume(atlas: &Volume, zeroed: usize) -> LabelReport {
        let labels: Vec<i64> = atlas.unique_labels().into_iter().filter(|l| *l != 0).collect();
        let missing = missing_labels(&labels);
        LabelReport { labels, missing, zeroed }
    }

    pub fn is_consecutive(&self) -> bool {
        self.missing.is_empty()
    }
}


/// Paths and final volume of one transported atlas.
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasTransport {
    pub name: String,
    /// Atlas on the template-aligned T1w grid.
    pub template: PathBuf,
    pub t1w: PathBuf,
    /// Atlas in subject space, before tissue restriction.
    pub modality: PathBuf,
    /// Atlas in subject space restricted to the interface or gray matter.
    pub tissue: PathBuf,
    pub atlas: Volume,
    pub report: LabelReport,
}


/// Carries atlases through the transform chain of a finished [`SpaceRegistrar`] session.
pub struct AtlasTransporter<'r, 'a> {
    registrar: &'r SpaceRegistrar<'a>,
}

impl<'r, 'a> AtlasTransporter<'r, 'a> {
    pub fn new(registrar: &'r SpaceRegistrar<'a>) -> AtlasTransporter<'r, 'a> {
        AtlasTransporter { registrar }
    }

    /// Transport the atlas file at `path`, named after its file stem.
    pub fn transport<P: AsRef<Path>>(&self, path: P) -> Result<Staged<AtlasTransport>> {
        let atlas = Volume::from_file(path.as_ref())?.into_kind(VolumeKind::Label);
        self.transport_volume(&atlas, &nifti_stem(path))
    }

    /// Transport a template-space label volume.
    ///
    /// Non-integer voxels are zeroed after every resampling step. A gap in the final label set
    /// is logged, not treated as an error.
    pub fn transport_volume(&self, atlas: &Volume, name: &str) -> Result<Staged<AtlasTransport>> {
        let reg = self.registrar;
        let layout = reg.layout();
        let mut zeroed = 0;
        let mut fallbacks = Vec::new();

        let reference = reg.load(&Artifact::T1wAlignedTemplate)?;
        let mut in_template = resample(atlas, &reference.grid, &Affine::identity(), Interpolation::Nearest)?;
        drop(reference);
        zeroed += in_template.zero_non_integer();
        let template = layout.path(&Artifact::AtlasTemplate(name.to_string()));
        in_template.to_file(&template)?;

        let in_t1w = match reg.template_path() {
            Some(AlignmentPath::Nonlinear) => match reg.template_to_t1w(&in_template, Interpolation::Nearest) {
                Ok(vol) => vol,
                Err(e) => {
                    warn!("Warping atlas {} to T1w space failed ({}), using the affine chain", name, e);
                    fallbacks.push(Fallback::new("atlas2t1w", e.to_string()));
                    reg.template_to_t1w_affine(&in_template, Interpolation::Nearest)?
                }
            },
            _ => reg.template_to_t1w_affine(&in_template, Interpolation::Nearest)?,
        };
        drop(in_template);
        let brain_mask = reg.load(&Artifact::T1wBrainMask)?;
        let in_t1w = in_t1w.masked(&brain_mask)?;
        drop(brain_mask);
        let t1w = layout.path(&Artifact::AtlasT1w(name.to_string()));
        in_t1w.to_file(&t1w)?;

        let mut in_modality = reg.t1w_to_modality_labels(&in_t1w)?;
        drop(in_t1w);
        zeroed += in_modality.zero_non_integer();
        let modality = layout.path(&Artifact::AtlasModality(name.to_string()));
        in_modality.to_file(&modality)?;

        let tissue_mask = reg.label_tissue_mask()?;
        let restricted = in_modality.masked(&tissue_mask)?;
        drop(tissue_mask);
        drop(in_modality);
        let tissue = layout.path(&Artifact::AtlasTissue(name.to_string()));
        restricted.to_file(&tissue)?;

        let report = LabelReport::for_volume(&restricted, zeroed);
        if report.is_consecutive() {
            info!("Atlas {} carries {} labels in subject space", name, report.labels.len());
        } else {
            warn!("Non-consecutive integers found in parcellation {}: missing {:?}", name, report.missing);
        }

        Ok(Staged::with_fallbacks(
            AtlasTransport {
                name: name.to_string(),
                template,
                t1w,
                modality,
                tissue,
                atlas: restricted,
                report,
            },
            fallbacks,
        ))
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn reports_ignore_the_background_and_list_gaps() {
        let atlas = Volume::new(
            Array3::from_shape_fn((4, 4, 4), |(i, _, _)| [0.0, 1.0, 3.0, 4.0][i]),
            Affine::identity(),
            VolumeKind::Label,
        );
        let report = LabelReport::for_volume(&atlas, 2);
        assert_eq!(vec![1, 3, 4], report.labels);
        assert_eq!(vec![2], report.missing);
        assert!(!report.is_consecutive());
        assert_eq!(2, report.zeroed);
    }
}

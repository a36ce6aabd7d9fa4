//! Brain extraction and tissue segmentation of the anatomical image.
//!
//! The actual classification algorithms are external. This module decides whether brain
//! extraction is needed, reuses existing segmentation products found next to the input, and
//! turns tissue probability maps into the thresholded masks the registration stages consume.

use glob::{glob, Pattern};
use log::{debug, info, warn};

use std::path::{Path, PathBuf};

use crate::config::{Modality, RegistrationConfig};
use crate::error::{RegistrationError, Result};
use crate::layout::{Artifact, SessionLayout};
use crate::morphology::edge_mask;
use crate::resample::{resample_to_img, Interpolation};
use crate::tissue::TissueProbabilities;
use crate::volume::{Volume, VolumeKind};

/// Brain probability above which a voxel belongs to the brain mask.
pub const BRAIN_PROBABILITY_THRESHOLD: f32 = 0.5;

/// Black-box tissue segmentation of a skull-stripped anatomical volume.
pub trait TissueClassifier {
    fn classify(&self, t1w_brain: &Volume) -> Result<TissueProbabilities>;
}

/// Black-box skull stripping, returning a brain probability map on the grid of the input.
pub trait BrainExtractor {
    fn brain_probability(&self, t1w: &Volume) -> Result<Volume>;
}

/// Decides whether an anatomical volume still contains skull.
pub trait SkullStripClassifier {
    fn contains_skull(&self, t1w: &Volume) -> Result<bool>;
}


/// Treats a volume as unstripped when its ratio of non-zero to zero voxels exceeds `ratio`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeuristicClassifier {
    pub ratio: f64,
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        HeuristicClassifier { ratio: crate::config::DEFAULT_SKULL_STRIP_RATIO }
    }
}

impl SkullStripClassifier for HeuristicClassifier {
    fn contains_skull(&self, t1w: &Volume) -> Result<bool> {
        let ratio = t1w.nonzero_ratio();
        debug!("Non-zero to zero voxel ratio of anatomical image: {:.3}", ratio);
        Ok(ratio > self.ratio)
    }
}


/// Delegates the decision to a model returning the probability that skull is present.
pub struct ExternalModelClassifier {
    model: Box<dyn Fn(&Volume) -> Result<f64>>,
    pub threshold: f64,
}

impl ExternalModelClassifier {
    pub fn new<F>(model: F, threshold: f64) -> ExternalModelClassifier
    where
        F: Fn(&Volume) -> Result<f64> + 'static,
    {
        ExternalModelClassifier { model: Box::new(model), threshold }
    }
}

impl SkullStripClassifier for ExternalModelClassifier {
    fn contains_skull(&self, t1w: &Volume) -> Result<bool> {
        Ok((self.model)(t1w)? > self.threshold)
    }
}


/// Segmentation products found in a subject directory, matched by file name suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingSegmentation {
    pub brain_mask: Option<PathBuf>,
    pub wm: Option<PathBuf>,
    pub gm: Option<PathBuf>,
    pub csf: Option<PathBuf>,
}

impl ExistingSegmentation {
    /// Look for `*_desc-brain_mask.nii.gz` and `*_label-{WM,GM,CSF}_probseg.nii.gz` directly in `dir`.
    pub fn discover<P: AsRef<Path>>(dir: P) -> Result<ExistingSegmentation> {
        let escaped = Pattern::escape(&dir.as_ref().to_string_lossy());
        let first = |suffix: &str| -> Result<Option<PathBuf>> {
            let pattern = format!("{}/*{}", escaped, suffix);
            let paths = glob(&pattern).map_err(|e| RegistrationError::InvalidConfiguration(e.to_string()))?;
            Ok(paths.filter_map(std::result::Result::ok).find(|p| p.is_file()))
        };
        Ok(ExistingSegmentation {
            brain_mask: first("_desc-brain_mask.nii.gz")?,
            wm: first("_label-WM_probseg.nii.gz")?,
            gm: first("_label-GM_probseg.nii.gz")?,
            csf: first("_label-CSF_probseg.nii.gz")?,
        })
    }

    /// Whether the probability maps a session of `modality` needs are all present.
    pub fn is_complete(&self, modality: Modality) -> bool {
        let csf = modality == Modality::Functional || self.csf.is_some();
        self.wm.is_some() && self.gm.is_some() && csf
    }
}


/// Output of [`TissueSegmenter::run`], all on the grid of the anatomical input.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationProducts {
    pub t1w_brain: Volume,
    pub brain_mask: Volume,
    pub probabilities: TissueProbabilities,
    pub wm_thr: Volume,
    pub gm_thr: Option<Volume>,
    /// White matter boundary used by boundary-based registration.
    pub wm_edge: Volume,
    /// Whether existing probability maps were reused instead of running the classifier.
    pub reused: bool,
}

impl SegmentationProducts {
    pub fn save(&self, layout: &SessionLayout) -> Result<()> {
        self.t1w_brain.to_file(layout.path(&Artifact::T1wBrain))?;
        self.brain_mask.to_file(layout.path(&Artifact::T1wBrainMask))?;
        self.probabilities.wm.to_file(layout.path(&Artifact::Wm))?;
        self.probabilities.gm.to_file(layout.path(&Artifact::Gm))?;
        self.probabilities.csf.to_file(layout.path(&Artifact::Csf))?;
        self.wm_thr.to_file(layout.path(&Artifact::WmThr))?;
        self.wm_edge.to_file(layout.path(&Artifact::WmEdge))?;
        if let Some(gm_thr) = &self.gm_thr {
            gm_thr.to_file(layout.path(&Artifact::GmThr))?;
        }
        Ok(())
    }
}


/// Skull stripping and tissue segmentation of one session.
pub struct TissueSegmenter<'a> {
    config: &'a RegistrationConfig,
    skull: &'a dyn SkullStripClassifier,
    extractor: Option<&'a dyn BrainExtractor>,
    classifier: &'a dyn TissueClassifier,
}

impl<'a> TissueSegmenter<'a> {
    pub fn new(
        config: &'a RegistrationConfig,
        skull: &'a dyn SkullStripClassifier,
        extractor: Option<&'a dyn BrainExtractor>,
        classifier: &'a dyn TissueClassifier,
    ) -> TissueSegmenter<'a> {
        TissueSegmenter { config, skull, extractor, classifier }
    }

    /// Brain mask of the anatomical image.
    ///
    /// A configured mask takes precedence, then a discovered one. Otherwise the skull-strip
    /// classifier decides between running brain extraction and using the non-zero voxels.
    pub fn brain_mask(&self, t1w_head: &Volume, existing: &ExistingSegmentation) -> Result<Volume> {
        let supplied = self.config.brain_mask.as_ref().or_else(|| existing.brain_mask.as_ref());
        if let Some(path) = supplied {
            info!("Using brain mask {}", path.display());
            let mask = Volume::from_file(path)?.into_kind(VolumeKind::Mask);
            return resample_to_img(&mask, t1w_head, Interpolation::Nearest);
        }
        if self.skull.contains_skull(t1w_head)? {
            let extractor = self.extractor.ok_or_else(|| {
                RegistrationError::SegmentationFailed(String::from("anatomical image contains skull and no brain extractor is available"))
            })?;
            info!("Extracting brain from anatomical image");
            let prob = extractor.brain_probability(t1w_head)?;
            t1w_head.check_same_grid(&prob)?;
            return Ok(prob.binarize(BRAIN_PROBABILITY_THRESHOLD));
        }
        Ok(t1w_head.binarize(0.0))
    }

    /// Tissue probabilities of the skull-stripped volume, reused from `existing` unless overwriting.
    fn probabilities(&self, t1w_brain: &Volume, existing: &ExistingSegmentation) -> Result<(TissueProbabilities, bool)> {
        if !self.config.overwrite && existing.is_complete(self.config.modality) {
            info!("Existing segmentations detected...");
            let load = |path: &Option<PathBuf>| -> Result<Volume> {
                match path {
                    Some(p) => resample_to_img(&Volume::from_file(p)?.into_kind(VolumeKind::Scalar), t1w_brain, Interpolation::Trilinear),
                    None => Ok(Volume::zeros(&t1w_brain.grid, 1, VolumeKind::Scalar)),
                }
            };
            let probs = TissueProbabilities { wm: load(&existing.wm)?, gm: load(&existing.gm)?, csf: load(&existing.csf)? };
            return Ok((probs, true));
        }

        let probs = self
            .classifier
            .classify(t1w_brain)
            .map_err(|e| RegistrationError::SegmentationFailed(e.to_string()))?;
        probs.check_same_grid()?;
        if !t1w_brain.same_grid(&probs.wm) {
            return Err(RegistrationError::SegmentationFailed(String::from("probability maps are not on the anatomical grid")));
        }
        if probs.wm.count_nonzero() == 0 || probs.gm.count_nonzero() == 0 {
            return Err(RegistrationError::SegmentationFailed(String::from("degenerate tissue probability maps")));
        }
        Ok((probs, false))
    }

    /// Run skull stripping and segmentation. `base_dir` is searched for existing products.
    pub fn run<P: AsRef<Path>>(&self, t1w_head: &Volume, base_dir: P) -> Result<SegmentationProducts> {
        let existing = ExistingSegmentation::discover(base_dir)?;
        let mask = self.brain_mask(t1w_head, &existing)?;
        let t1w_brain = t1w_head.masked(&mask)?;
        drop(mask);
        if t1w_brain.count_nonzero() == 0 {
            return Err(RegistrationError::SegmentationFailed(String::from("brain mask is empty")));
        }

        let (mut probabilities, reused) = self.probabilities(&t1w_brain, &existing)?;
        if reused && probabilities.csf.count_nonzero() == 0 && self.config.modality == Modality::Diffusion {
            warn!("Existing CSF probability map is empty");
        }

        let thresholds = &self.config.thresholds;
        let wm_thr = probabilities.wm.binarize(thresholds.anat_wm);
        let gm_thr = match thresholds.anat_gm {
            Some(thr) => {
                let gm_thr = probabilities.gm.binarize(thr);
                probabilities.gm = probabilities.gm.masked(&gm_thr)?;
                Some(gm_thr)
            }
            None => None,
        };
        let wm_edge = edge_mask(&probabilities.wm, &wm_thr)?;
        let brain_mask = t1w_brain.binarize(0.0);

        Ok(SegmentationProducts { t1w_brain, brain_mask, probabilities, wm_thr, gm_thr, wm_edge, reused })
    }
}

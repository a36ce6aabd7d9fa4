//! Session configuration and the bundled template library.

use std::path::{Path, PathBuf};

use crate::error::{RegistrationError, Result};

/// Ratio of non-zero to zero voxels above which an anatomical volume is assumed to still contain skull.
pub const DEFAULT_SKULL_STRIP_RATIO: f64 = 0.25;

/// Radius of the spherical kernel used to erode the ventricle mask.
pub const DEFAULT_VENTRICLE_EROSION_MM: f64 = 10.0;

/// The subject space a session registers the anatomical image to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Diffusion,
    /// Functional sessions work in T1w space.
    Functional,
}

impl Modality {
    /// Short name used in artifact file names.
    pub fn short_name(&self) -> &'static str {
        match self {
            Modality::Diffusion => "dwi",
            Modality::Functional => "func",
        }
    }
}


/// Optional stages of a registration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Carry ventricle and corpus callosum references to subject space and build the white-gray interface.
    pub ventricle_masking: bool,
    /// Refine the T1w to subject-space alignment with a boundary-based cost.
    pub bbr_refinement: bool,
}

impl Capabilities {
    pub fn for_modality(modality: Modality) -> Capabilities {
        match modality {
            Modality::Diffusion => Capabilities { ventricle_masking: true, bbr_refinement: true },
            Modality::Functional => Capabilities { ventricle_masking: false, bbr_refinement: false },
        }
    }
}


/// Probability thresholds turning tissue probability maps into binary masks. All comparisons are strict (`>`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TissueThresholds {
    /// White matter in T1w space, used for the boundary edge map.
    pub anat_wm: f32,
    /// Gray matter in T1w space. When set, the gray matter probability map is masked by it.
    pub anat_gm: Option<f32>,
    /// White matter after transport to subject space.
    pub wm: f32,
    /// Gray matter after transport to subject space.
    pub gm: f32,
    /// CSF after transport to subject space.
    pub csf: f32,
}

impl TissueThresholds {
    pub fn diffusion() -> TissueThresholds {
        TissueThresholds { anat_wm: 0.20, anat_gm: None, wm: 0.20, gm: 0.15, csf: 0.95 }
    }

    pub fn functional() -> TissueThresholds {
        TissueThresholds { anat_wm: 0.50, anat_gm: Some(0.05), wm: 0.50, gm: 0.05, csf: 0.95 }
    }

    pub fn for_modality(modality: Modality) -> TissueThresholds {
        match modality {
            Modality::Diffusion => TissueThresholds::diffusion(),
            Modality::Functional => TissueThresholds::functional(),
        }
    }

    fn validate(&self) -> Result<()> {
        let all = [Some(self.anat_wm), self.anat_gm, Some(self.wm), Some(self.gm), Some(self.csf)];
        for thr in all.iter().flatten() {
            if !(*thr > 0.0 && *thr < 1.0) {
                return Err(RegistrationError::InvalidConfiguration(format!(
                    "tissue threshold {} outside (0, 1)", thr
                )));
            }
        }
        Ok(())
    }
}


/// Location of the reference volumes shipped at a given resolution.
///
/// All files live directly under `root` and are named after the template and the integer resolution in mm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateLibrary {
    pub root: PathBuf,
    pub name: String,
    pub resolution: u32,
}

impl TemplateLibrary {
    /// A library for the given voxel size, rounded to the nearest integer mm.
    pub fn new<P: AsRef<Path>, S: Into<String>>(root: P, name: S, vox_size: f64) -> TemplateLibrary {
        let resolution = if vox_size.is_finite() && vox_size > 0.0 { vox_size.round().max(1.0) as u32 } else { 0 };
        TemplateLibrary { root: root.as_ref().to_path_buf(), name: name.into(), resolution }
    }

    fn file(&self, stem: String) -> PathBuf {
        self.root.join(format!("{}.nii.gz", stem))
    }

    /// Template with skull.
    pub fn head(&self) -> PathBuf {
        self.file(format!("{}_{}mm", self.name, self.resolution))
    }

    pub fn brain(&self) -> PathBuf {
        self.file(format!("{}_brain_{}mm", self.name, self.resolution))
    }

    pub fn brain_mask(&self) -> PathBuf {
        self.file(format!("{}_brain_mask_{}mm", self.name, self.resolution))
    }

    /// Fractional anisotropy template.
    pub fn fa(&self) -> PathBuf {
        self.file(format!("FA_{}mm", self.resolution))
    }

    pub fn lateral_ventricles(&self) -> PathBuf {
        self.file(format!("LateralVentricles_{}mm", self.resolution))
    }

    pub fn corpus_callosum(&self) -> PathBuf {
        self.file(format!("CorpusCallosum_{}mm", self.resolution))
    }

    /// Probabilistic subcortical atlas the ventricle location mask is defined on.
    pub fn subcortical_atlas(&self) -> PathBuf {
        self.file(format!("HarvardOxford-sub-prob-{}mm", self.resolution))
    }

    /// Files a session of the given modality cannot run without.
    pub fn required(&self, modality: Modality) -> Vec<PathBuf> {
        let mut files = vec![self.head(), self.brain(), self.brain_mask()];
        if modality == Modality::Diffusion {
            files.push(self.fa());
            files.push(self.lateral_ventricles());
            files.push(self.corpus_callosum());
            files.push(self.subcortical_atlas());
        }
        files
    }

    /// Check that every required file exists, reporting the first missing one.
    pub fn validate(&self, modality: Modality) -> Result<()> {
        if self.resolution == 0 {
            return Err(RegistrationError::InvalidConfiguration(String::from("template resolution must be positive")));
        }
        if let Some(missing) = self.required(modality).into_iter().find(|p| !p.is_file()) {
            return Err(RegistrationError::MissingReference(missing));
        }
        Ok(())
    }
}


/// Immutable configuration of one registration session.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationConfig {
    pub modality: Modality,
    /// Skip non-linear and boundary-based refinement.
    pub simple: bool,
    pub vox_size: f64,
    pub templates: TemplateLibrary,
    /// Externally supplied brain mask in T1w space.
    pub brain_mask: Option<PathBuf>,
    /// Recompute tissue segmentation even if existing products are found.
    pub overwrite: bool,
    pub skull_strip_ratio: f64,
    pub ventricle_erosion_mm: f64,
    pub thresholds: TissueThresholds,
}

impl RegistrationConfig {
    pub fn new<P: AsRef<Path>, S: Into<String>>(modality: Modality, template_root: P, template_name: S, vox_size: f64) -> Self {
        RegistrationConfig {
            modality,
            simple: false,
            vox_size,
            templates: TemplateLibrary::new(template_root, template_name, vox_size),
            brain_mask: None,
            overwrite: modality == Modality::Diffusion,
            skull_strip_ratio: DEFAULT_SKULL_STRIP_RATIO,
            ventricle_erosion_mm: DEFAULT_VENTRICLE_EROSION_MM,
            thresholds: TissueThresholds::for_modality(modality),
        }
    }

    pub fn with_simple(mut self, simple: bool) -> Self {
        self.simple = simple;
        self
    }

    pub fn with_brain_mask<P: AsRef<Path>>(mut self, mask: P) -> Self {
        self.brain_mask = Some(mask.as_ref().to_path_buf());
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_skull_strip_ratio(mut self, ratio: f64) -> Self {
        self.skull_strip_ratio = ratio;
        self
    }

    pub fn with_ventricle_erosion(mut self, radius_mm: f64) -> Self {
        self.ventricle_erosion_mm = radius_mm;
        self
    }

    pub fn with_thresholds(mut self, thresholds: TissueThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::for_modality(self.modality)
    }

    /// Reject settings no session could run with. Does not touch the file system.
    pub fn validate(&self) -> Result<()> {
        if !(self.vox_size > 0.0 && self.vox_size.is_finite()) {
            return Err(RegistrationError::InvalidConfiguration(format!("voxel size must be positive, got {}", self.vox_size)));
        }
        if !(self.skull_strip_ratio > 0.0 && self.skull_strip_ratio.is_finite()) {
            return Err(RegistrationError::InvalidConfiguration(format!(
                "skull-strip ratio must be positive, got {}", self.skull_strip_ratio
            )));
        }
        if self.ventricle_erosion_mm < 0.0 {
            return Err(RegistrationError::InvalidConfiguration(String::from("ventricle erosion radius must not be negative")));
        }
        self.thresholds.validate()
    }
}

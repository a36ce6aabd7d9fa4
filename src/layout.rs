//! Working-directory layout of a registration session.
//!
//! [`SessionLayout`] only derives paths. Whether an artifact exists is a question for the file
//! system (or the [`TransformStore`](crate::transform_store::TransformStore)), never for the layout.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Modality;
use crate::error::Result;
use crate::util::nifti_stem;

/// A named affine or warp produced by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransformSlot {
    T1wToTemplateInit,
    T1wToTemplate,
    TemplateToT1w,
    T1wToTemplateWarp,
    TemplateToT1wWarp,
    ModalityToT1w,
    T1wToModality,
    ModalityToT1wBbr,
    T1wToModalityBbr,
    /// The transform carrying T1w-space tissue maps into subject space.
    T1wTissueToModality,
    /// Subcortical atlas to template brain, used to place the ventricle reference.
    SubcorticalToTemplate,
}

impl TransformSlot {
    pub fn is_warp(&self) -> bool {
        matches!(self, TransformSlot::T1wToTemplateWarp | TransformSlot::TemplateToT1wWarp)
    }

    fn file_name(&self, modality: Modality) -> String {
        let m = modality.short_name();
        match self {
            TransformSlot::T1wToTemplateInit => String::from("xfm_t1w2mni_init.mat"),
            TransformSlot::T1wToTemplate => String::from("xfm_t1w2mni.mat"),
            TransformSlot::TemplateToT1w => String::from("xfm_mni2t1.mat"),
            TransformSlot::T1wToTemplateWarp => String::from("t1w2mni_warp.nii.gz"),
            TransformSlot::TemplateToT1wWarp => String::from("mni2t1w_warp.nii.gz"),
            TransformSlot::ModalityToT1w => format!("{}2t1w_xfm.mat", m),
            TransformSlot::T1wToModality => format!("t1w2{}_xfm.mat", m),
            TransformSlot::ModalityToT1wBbr => format!("{}2t1w_bbr_xfm.mat", m),
            TransformSlot::T1wToModalityBbr => format!("t1w2{}_bbr_xfm.mat", m),
            TransformSlot::T1wTissueToModality => format!("t1wtissue2{}_xfm.mat", m),
            TransformSlot::SubcorticalToTemplate => String::from("roi_2_mni.mat"),
        }
    }
}


/// Volumes written by a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Artifact {
    T1wBrain,
    T1wBrainMask,
    /// White matter probability in T1w space.
    Wm,
    WmThr,
    WmEdge,
    Gm,
    GmThr,
    Csf,
    T1wAlignedTemplate,
    T1wInModality,
    BrainMaskInModality,
    VentricleTemplate,
    VentricleT1w,
    CorpusCallosumT1w,
    CorpusCallosumModality,
    WmInModality,
    GmInModality,
    CsfInModality,
    WmInModalityBin,
    GmInModalityBin,
    CsfInModalityBin,
    VentricleModality,
    VentricleCsfModality,
    /// White-gray matter interface in subject space.
    Interface,
    /// Atlas resampled onto the template-aligned T1w grid.
    AtlasTemplate(String),
    AtlasT1w(String),
    AtlasModality(String),
    /// Subject-space atlas restricted to the interface (diffusion) or gray matter (functional).
    AtlasTissue(String),
    WaymaskT1w(String),
    WaymaskModality(String),
    RoiT1w(String),
    RoiModality(String),
}


/// Directory layout of a session rooted at `base`.
///
/// Diffusion sessions write to `{base}/dmri_reg/reg/{mats,warps,imgs}` with anatomical products
/// in `{base}/anat_reg`. Functional sessions write to `{base}/reg/{mats,warps,imgs}` and keep
/// anatomical products with the other images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    pub base: PathBuf,
    pub modality: Modality,
}

impl SessionLayout {
    pub fn new<P: AsRef<Path>>(base: P, modality: Modality) -> SessionLayout {
        SessionLayout { base: base.as_ref().to_path_buf(), modality }
    }

    pub fn reg_dir(&self) -> PathBuf {
        match self.modality {
            Modality::Diffusion => self.base.join("dmri_reg").join("reg"),
            Modality::Functional => self.base.join("reg"),
        }
    }

    pub fn mats_dir(&self) -> PathBuf {
        self.reg_dir().join("mats")
    }

    pub fn warps_dir(&self) -> PathBuf {
        self.reg_dir().join("warps")
    }

    pub fn imgs_dir(&self) -> PathBuf {
        self.reg_dir().join("imgs")
    }

    pub fn anat_dir(&self) -> PathBuf {
        match self.modality {
            Modality::Diffusion => self.base.join("anat_reg"),
            Modality::Functional => self.imgs_dir(),
        }
    }

    /// Scratch directory of the streamline normalization.
    pub fn normalization_dir(&self) -> PathBuf {
        self.base.join("dmri_reg").join("DSN")
    }

    pub fn transform_path(&self, slot: TransformSlot) -> PathBuf {
        let dir = if slot.is_warp() { self.warps_dir() } else { self.mats_dir() };
        dir.join(slot.file_name(self.modality))
    }

    pub fn path(&self, artifact: &Artifact) -> PathBuf {
        let m = self.modality.short_name();
        let anat = |name: &str| self.anat_dir().join(format!("t1w_{}.nii.gz", name));
        let img = |name: String| self.imgs_dir().join(format!("{}.nii.gz", name));
        match artifact {
            Artifact::T1wBrain => anat("brain"),
            Artifact::T1wBrainMask => anat("brain_mask"),
            Artifact::Wm => anat("wm"),
            Artifact::WmThr => anat("wm_thr"),
            Artifact::WmEdge => anat("wm_edge"),
            Artifact::Gm => anat("gm"),
            Artifact::GmThr => anat("gm_thr"),
            Artifact::Csf => anat("csf"),
            Artifact::BrainMaskInModality => self.anat_dir().join(format!("t1w_brain_mask_in_{}.nii.gz", m)),
            Artifact::T1wAlignedTemplate => img(String::from("t1w_aligned_mni")),
            Artifact::T1wInModality => img(format!("t1w_in_{}", m)),
            Artifact::VentricleTemplate => img(String::from("vent_mask_mni")),
            Artifact::VentricleT1w => img(String::from("vent_mask_t1w")),
            Artifact::CorpusCallosumT1w => img(String::from("CorpusCallosum_t1wmask")),
            Artifact::CorpusCallosumModality => img(format!("CorpusCallosum_{}", m)),
            Artifact::WmInModality => img(format!("t1w_wm_in_{}", m)),
            Artifact::GmInModality => img(format!("t1w_gm_in_{}", m)),
            Artifact::CsfInModality => img(format!("t1w_csf_mask_{}", m)),
            Artifact::WmInModalityBin => img(format!("t1w_wm_in_{}_bin", m)),
            Artifact::GmInModalityBin => img(format!("t1w_gm_in_{}_bin", m)),
            Artifact::CsfInModalityBin => img(format!("t1w_csf_mask_{}_bin", m)),
            Artifact::VentricleModality => img(format!("t1w_vent_mask_{}", m)),
            Artifact::VentricleCsfModality => img(format!("t1w_vent_csf_in_{}", m)),
            Artifact::Interface => img(format!("t1w_wm_gm_int_in_{}", m)),
            Artifact::AtlasTemplate(atlas) => self.anat_dir().join(format!("{}_t1w_mni.nii.gz", atlas)),
            Artifact::AtlasT1w(atlas) => self.anat_dir().join(format!("{}_t1w_skull.nii.gz", atlas)),
            Artifact::AtlasModality(atlas) => img(format!("{}_{}_track", atlas, m)),
            Artifact::AtlasTissue(atlas) => match self.modality {
                Modality::Diffusion => img(format!("{}_{}_track_wmgm_int", atlas, m)),
                Modality::Functional => img(format!("{}_gm", atlas)),
            },
            Artifact::WaymaskT1w(stem) => img(format!("waymask-{}_in_t1w", stem)),
            Artifact::WaymaskModality(stem) => img(format!("waymask-{}_in_{}", stem, m)),
            Artifact::RoiT1w(stem) => img(format!("roi-{}_in_t1w", stem)),
            Artifact::RoiModality(stem) => img(format!("roi-{}_in_{}", stem, m)),
        }
    }

    /// The stem naming a transported waymask or ROI.
    pub fn waymask_stem<P: AsRef<Path>>(path: P) -> String {
        nifti_stem(path)
    }

    /// Create every directory of the layout that does not exist yet.
    pub fn create_dirs(&self) -> Result<()> {
        let mut dirs = vec![self.mats_dir(), self.warps_dir(), self.imgs_dir(), self.anat_dir()];
        if self.modality == Modality::Diffusion {
            dirs.push(self.normalization_dir());
        }
        for dir in dirs {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

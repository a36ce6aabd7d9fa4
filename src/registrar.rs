//! A registration session: the full transform chain of one subject and modality.
//!
//! Diffusion and functional sessions share one state machine. Their differences are expressed
//! by [`Capabilities`]: diffusion sessions refine the T1w to subject-space alignment with a
//! boundary-based cost and build ventricle, corpus callosum and interface masks; functional
//! sessions work in T1w space.

use log::{debug, info};

use std::path::{Path, PathBuf};

use crate::affine::Affine;
use crate::align::{AlignmentPath, AlignmentStage};
use crate::config::{Capabilities, Modality, RegistrationConfig};
use crate::error::{RegistrationError, Result};
use crate::layout::{Artifact, SessionLayout, TransformSlot};
use crate::nifti::read_nifti_grid;
use crate::outcome::{Fallback, Staged};
use crate::resample::{resample, Interpolation};
use crate::segment::{BrainExtractor, SkullStripClassifier, TissueClassifier, TissueSegmenter};
use crate::solver::{AlignOptions, RegistrationSolver};
use crate::tissue::{TissueMaskSet, TissueProbabilities};
use crate::transform_store::TransformStore;
use crate::util::nifti_stem;
use crate::volume::{Grid, Volume, VolumeKind};

/// Diffusion-derived inputs of a diffusion session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffusionInputs {
    /// Fractional anisotropy.
    pub fa: PathBuf,
    /// Directionally encoded anisotropy, the subject-space reference.
    pub ap: PathBuf,
    pub b0_mask: PathBuf,
}

/// The black boxes a session delegates to.
#[derive(Clone, Copy)]
pub struct Backends<'a> {
    pub solver: &'a dyn RegistrationSolver,
    pub skull: &'a dyn SkullStripClassifier,
    pub extractor: Option<&'a dyn BrainExtractor>,
    pub classifier: &'a dyn TissueClassifier,
}


/// Affines between T1w and subject space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModalityTransforms {
    pub modality_to_t1w: Affine,
    pub t1w_to_modality: Affine,
    /// Boundary-based refinement, subject to T1w and its inverse.
    pub bbr: Option<(Affine, Affine)>,
    /// Carries T1w tissue maps into subject space.
    pub tissue_to_modality: Affine,
}

impl ModalityTransforms {
    /// Subject space is T1w space.
    pub fn identity() -> ModalityTransforms {
        ModalityTransforms {
            modality_to_t1w: Affine::identity(),
            t1w_to_modality: Affine::identity(),
            bbr: None,
            tissue_to_modality: Affine::identity(),
        }
    }

    /// T1w to subject space for label volumes: boundary-based if available.
    pub fn label_affine(&self) -> Affine {
        match self.bbr {
            Some((_, t1w_to_modality)) => t1w_to_modality,
            None => self.t1w_to_modality,
        }
    }
}


/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformChain {
    pub template_path: AlignmentPath,
    /// T1w to template. The initializer on the non-linear path.
    pub t1w_to_template: Affine,
    pub template_to_t1w: Affine,
    pub template_to_t1w_warp: Option<PathBuf>,
    pub modality: ModalityTransforms,
}


/// Orchestrates the alignment stages of one session.
///
/// All products are written below the session's [`SessionLayout`]. Volumes are loaded when a
/// stage needs them and dropped as soon as it is done with them.
pub struct SpaceRegistrar<'a> {
    config: RegistrationConfig,
    layout: SessionLayout,
    store: TransformStore,
    backends: Backends<'a>,
    anat: PathBuf,
    diffusion: Option<DiffusionInputs>,
    template_path: Option<AlignmentPath>,
    modality: Option<ModalityTransforms>,
    fallbacks: Vec<Fallback>,
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(RegistrationError::MissingReference(path.to_path_buf()))
    }
}

impl<'a> SpaceRegistrar<'a> {
    /// Check all preconditions and create the session directories.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        config: RegistrationConfig,
        base_dir: P,
        anat: Q,
        diffusion: Option<DiffusionInputs>,
        backends: Backends<'a>,
    ) -> Result<SpaceRegistrar<'a>> {
        config.validate()?;
        config.templates.validate(config.modality)?;
        let anat = anat.as_ref().to_path_buf();
        require_file(&anat)?;
        if let Some(mask) = &config.brain_mask {
            require_file(mask)?;
        }
        match (&diffusion, config.modality) {
            (None, Modality::Diffusion) => {
                return Err(RegistrationError::InvalidConfiguration(String::from(
                    "diffusion sessions need anisotropy and B0 mask inputs",
                )));
            }
            (Some(d), Modality::Diffusion) => {
                for p in [&d.fa, &d.ap, &d.b0_mask].iter() {
                    require_file(p)?;
                }
            }
            (Some(_), Modality::Functional) => {
                return Err(RegistrationError::InvalidConfiguration(String::from(
                    "functional sessions take no diffusion inputs",
                )));
            }
            (None, Modality::Functional) => {}
        }

        let layout = SessionLayout::new(base_dir, config.modality);
        layout.create_dirs()?;
        let store = TransformStore::new(layout.clone());
        Ok(SpaceRegistrar {
            config,
            layout,
            store,
            backends,
            anat,
            diffusion,
            template_path: None,
            modality: None,
            fallbacks: Vec::new(),
        })
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn store(&self) -> &TransformStore {
        &self.store
    }

    pub fn capabilities(&self) -> Capabilities {
        self.config.capabilities()
    }

    /// Fallbacks taken so far.
    pub fn fallbacks(&self) -> &[Fallback] {
        &self.fallbacks
    }

    /// The path taken by the template alignment, once it ran.
    pub fn template_path(&self) -> Option<AlignmentPath> {
        self.template_path
    }

    pub fn modality_transforms(&self) -> Result<&ModalityTransforms> {
        self.modality.as_ref().ok_or_else(|| {
            RegistrationError::InvalidConfiguration(String::from("T1w to subject-space alignment has not been run"))
        })
    }

    fn absorb<T>(&mut self, staged: Staged<T>) -> T {
        self.fallbacks.extend(staged.fallbacks);
        staged.value
    }

    /// Load a session artifact, reporting a missing one as a precondition error.
    pub fn load(&self, artifact: &Artifact) -> Result<Volume> {
        let path = self.layout.path(artifact);
        require_file(&path)?;
        Volume::from_file(path)
    }

    fn save(&self, artifact: &Artifact, vol: &Volume) -> Result<PathBuf> {
        let path = self.layout.path(artifact);
        vol.to_file(&path)?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }

    /// Grid of the subject-space reference volume.
    pub fn modality_grid(&self) -> Result<Grid> {
        match &self.diffusion {
            Some(d) => read_nifti_grid(&d.ap),
            None => self.t1w_grid(),
        }
    }

    pub fn t1w_grid(&self) -> Result<Grid> {
        let path = self.layout.path(&Artifact::T1wBrain);
        require_file(&path)?;
        read_nifti_grid(path)
    }

    /// Skull strip and segment the anatomical image.
    pub fn gen_tissue(&mut self) -> Result<()> {
        let head = Volume::from_file(&self.anat)?;
        let b = self.backends;
        let segmenter = TissueSegmenter::new(&self.config, b.skull, b.extractor, b.classifier);
        let products = segmenter.run(&head, &self.layout.base)?;
        drop(head);
        products.save(&self.layout)?;
        info!(
            "Segmented anatomical image{}: {} brain voxels",
            if products.reused { " (reused existing probability maps)" } else { "" },
            products.brain_mask.count_nonzero()
        );
        Ok(())
    }

    /// Align T1w to the template, non-linearly unless in simple mode.
    pub fn t1w_to_template(&mut self) -> Result<AlignmentPath> {
        let t1w_brain = self.load(&Artifact::T1wBrain)?;
        let templates = &self.config.templates;
        let template_brain = Volume::from_file(templates.brain())?;
        let template_head = Volume::from_file(templates.head())?;
        let template_mask = Volume::from_file(templates.brain_mask())?.into_kind(VolumeKind::Mask);

        let stage = AlignmentStage::new(self.backends.solver);
        let staged = stage.align_nonlinear(
            "t1w2mni",
            &t1w_brain,
            &template_brain,
            &template_head,
            Some(&template_mask),
            self.config.simple,
        )?;
        drop(template_head);
        drop(template_mask);
        drop(template_brain);
        drop(t1w_brain);

        let result = self.absorb(staged);
        self.store.save_affine(TransformSlot::T1wToTemplateInit, &result.init)?;
        if let Some(pair) = &result.warp {
            self.store.save_warp(TransformSlot::T1wToTemplateWarp, &pair.forward)?;
            self.store.save_warp(TransformSlot::TemplateToT1wWarp, &pair.inverse)?;
        }
        self.store.save_affine(TransformSlot::T1wToTemplate, &result.forward)?;
        self.store.save_affine(TransformSlot::TemplateToT1w, &result.inverse)?;
        self.save(&Artifact::T1wAlignedTemplate, &result.aligned)?;

        info!("T1w to {} alignment finished on the {:?} path", self.config.templates.name, result.path);
        self.template_path = Some(result.path);
        Ok(result.path)
    }

    /// Align subject space and T1w. Functional sessions use the identity.
    pub fn t1w_to_modality(&mut self) -> Result<ModalityTransforms> {
        let diffusion = match &self.diffusion {
            Some(d) => d.clone(),
            None => {
                self.modality = Some(ModalityTransforms::identity());
                return Ok(ModalityTransforms::identity());
            }
        };
        let t1w_brain = self.load(&Artifact::T1wBrain)?;
        let ap = Volume::from_file(&diffusion.ap)?;
        let stage = AlignmentStage::new(self.backends.solver);

        let staged = if self.capabilities().bbr_refinement && !self.config.simple {
            let fa = Volume::from_file(&diffusion.fa)?;
            let wm_edge = self.load(&Artifact::WmEdge)?;
            stage.align_refined("t1w2dwi", &ap, &t1w_brain, Some((&fa, &wm_edge)))?
        } else {
            stage.align_refined("t1w2dwi", &ap, &t1w_brain, None)?
        };
        let refined = self.absorb(staged);

        let modality_to_t1w = refined.initial;
        let t1w_to_modality = modality_to_t1w.inverse()?;
        self.store.save_affine(TransformSlot::ModalityToT1w, &modality_to_t1w)?;
        self.store.save_affine(TransformSlot::T1wToModality, &t1w_to_modality)?;
        let bbr = match refined.refined {
            Some(forward) => {
                let inverse = forward.inverse()?;
                self.store.save_affine(TransformSlot::ModalityToT1wBbr, &forward)?;
                self.store.save_affine(TransformSlot::T1wToModalityBbr, &inverse)?;
                Some((forward, inverse))
            }
            None => None,
        };

        let init = bbr.map(|(_, inverse)| inverse).unwrap_or(t1w_to_modality);
        let dof = if self.config.simple { 6 } else { 7 };
        let tissue_to_modality = stage.align("t1wtissue2dwi", &t1w_brain, &ap, Some(&init), &AlignOptions::mutual_information(dof))?;
        self.store.save_affine(TransformSlot::T1wTissueToModality, &tissue_to_modality)?;
        let t1w_in_modality = resample(&t1w_brain, &ap.grid, &tissue_to_modality, Interpolation::Trilinear)?;
        self.save(&Artifact::T1wInModality, &t1w_in_modality)?;

        let transforms = ModalityTransforms { modality_to_t1w, t1w_to_modality, bbr, tissue_to_modality };
        self.modality = Some(transforms);
        Ok(transforms)
    }

    /// Carry a template-space volume to T1w space through the warp, or the affine on the affine path.
    pub fn template_to_t1w(&self, vol: &Volume, interp: Interpolation) -> Result<Volume> {
        match self.template_path {
            Some(AlignmentPath::Nonlinear) => {
                let warp = self.store.load_warp(TransformSlot::TemplateToT1wWarp)?;
                warp.apply(vol, interp, None)
            }
            Some(AlignmentPath::Affine) => self.template_to_t1w_affine(vol, interp),
            None => Err(RegistrationError::InvalidConfiguration(String::from(
                "T1w to template alignment has not been run",
            ))),
        }
    }

    /// Carry a template-space volume to T1w space with the template to T1w affine only.
    pub fn template_to_t1w_affine(&self, vol: &Volume, interp: Interpolation) -> Result<Volume> {
        let xfm = self.store.load_affine(TransformSlot::TemplateToT1w)?;
        resample(vol, &self.t1w_grid()?, &xfm, interp)
    }

    /// Carry a T1w-space tissue volume to subject space.
    pub fn t1w_to_modality_volume(&self, vol: &Volume, interp: Interpolation) -> Result<Volume> {
        if self.diffusion.is_none() {
            return Ok(vol.clone());
        }
        let xfm = self.modality_transforms()?.tissue_to_modality;
        resample(vol, &self.modality_grid()?, &xfm, interp)
    }

    /// Carry a T1w-space label volume to subject space, with the boundary-based affine if available.
    pub fn t1w_to_modality_labels(&self, vol: &Volume) -> Result<Volume> {
        if self.diffusion.is_none() {
            return Ok(vol.clone());
        }
        let xfm = self.modality_transforms()?.label_affine();
        resample(vol, &self.modality_grid()?, &xfm, Interpolation::Nearest)
    }

    /// Ventricle location mask on the template brain grid.
    fn ventricles_in_template(&mut self) -> Result<Volume> {
        let templates = self.config.templates.clone();
        require_file(&templates.subcortical_atlas())?;
        let atlas = Volume::from_file(templates.subcortical_atlas())?;
        let template_brain = Volume::from_file(templates.brain())?;
        let stage = AlignmentStage::new(self.backends.solver);
        let xfm = stage.align("subcortical2mni", &atlas, &template_brain, None, &AlignOptions::mutual_information(6))?;
        drop(atlas);
        self.store.save_affine(TransformSlot::SubcorticalToTemplate, &xfm)?;

        let ventricles = Volume::from_file(templates.lateral_ventricles())?.into_kind(VolumeKind::Mask);
        let vent_mni = resample(&ventricles, &template_brain.grid, &xfm, Interpolation::Nearest)?;
        self.save(&Artifact::VentricleTemplate, &vent_mni)?;
        Ok(vent_mni)
    }

    /// Tissue masks in subject space.
    ///
    /// Diffusion sessions carry the tissue probabilities and the template ventricle and corpus
    /// callosum references into diffusion space and compose the interface mask from them.
    /// Functional sessions use the T1w-space masks.
    pub fn tissue_to_modality(&mut self) -> Result<TissueMaskSet> {
        let thresholds = self.config.thresholds;
        let probs = TissueProbabilities {
            wm: self.load(&Artifact::Wm)?,
            gm: self.load(&Artifact::Gm)?,
            csf: self.load(&Artifact::Csf)?,
        };
        if !self.capabilities().ventricle_masking {
            let (_, bins) = probs.threshold(thresholds.anat_wm, thresholds.anat_gm.unwrap_or(thresholds.gm), thresholds.csf)?;
            return Ok(TissueMaskSet::from_binaries(bins));
        }
        let b0_mask = match &self.diffusion {
            Some(d) => d.b0_mask.clone(),
            None => return Err(RegistrationError::InvalidConfiguration(String::from("ventricle masking needs diffusion inputs"))),
        };

        info!("Creating ventricle and corpus callosum masks...");
        let vent_mni = self.ventricles_in_template()?;
        let vent_t1w = self.template_to_t1w(&vent_mni, Interpolation::Nearest)?;
        drop(vent_mni);
        self.save(&Artifact::VentricleT1w, &vent_t1w)?;
        let cc_mni = Volume::from_file(self.config.templates.corpus_callosum())?.into_kind(VolumeKind::Mask);
        let cc_t1w = self.template_to_t1w(&cc_mni, Interpolation::Nearest)?;
        drop(cc_mni);
        self.save(&Artifact::CorpusCallosumT1w, &cc_t1w)?;

        if let Some(mask) = &self.config.brain_mask {
            let mask = Volume::from_file(mask)?.into_kind(VolumeKind::Mask);
            let in_modality = self.t1w_to_modality_volume(&mask, Interpolation::Nearest)?;
            self.save(&Artifact::BrainMaskInModality, &in_modality)?;
        }

        let vent = self.t1w_to_modality_volume(&vent_t1w, Interpolation::Nearest)?;
        let cc = self.t1w_to_modality_volume(&cc_t1w, Interpolation::Nearest)?;
        drop(vent_t1w);
        drop(cc_t1w);
        let probs = TissueProbabilities {
            wm: self.t1w_to_modality_volume(&probs.wm, Interpolation::Trilinear)?,
            gm: self.t1w_to_modality_volume(&probs.gm, Interpolation::Trilinear)?,
            csf: self.t1w_to_modality_volume(&probs.csf, Interpolation::Trilinear)?,
        };
        let grid = self.modality_grid()?;
        let b0 = Volume::from_file(b0_mask)?.into_kind(VolumeKind::Mask);
        let b0 = resample(&b0, &grid, &Affine::identity(), Interpolation::Nearest)?;

        let masks = TissueMaskSet::compose(&probs, &thresholds, &vent, &cc, Some(&b0), self.config.ventricle_erosion_mm)?;
        let (masked, bins) = probs.threshold(thresholds.wm, thresholds.gm, thresholds.csf)?;
        self.save(&Artifact::WmInModality, &masked.wm)?;
        self.save(&Artifact::GmInModality, &masked.gm)?;
        self.save(&Artifact::CsfInModality, &masked.csf)?;
        self.save(&Artifact::WmInModalityBin, &bins.wm)?;
        self.save(&Artifact::GmInModalityBin, &bins.gm)?;
        self.save(&Artifact::CsfInModalityBin, &bins.csf)?;
        let optional = [
            (Artifact::VentricleModality, &masks.ventricle),
            (Artifact::VentricleCsfModality, &masks.ventricle_csf),
            (Artifact::CorpusCallosumModality, &masks.corpus_callosum),
            (Artifact::Interface, &masks.interface),
        ];
        for (artifact, mask) in optional.iter() {
            if let Some(mask) = mask {
                self.save(artifact, mask)?;
            }
        }
        masks.check_grid(&b0)?;
        Ok(masks)
    }

    /// Mask of the tissue labels are restricted to: the interface in diffusion space, gray matter in T1w space.
    pub fn label_tissue_mask(&self) -> Result<Volume> {
        if self.capabilities().ventricle_masking {
            self.load(&Artifact::Interface)
        } else {
            Ok(self.load(&Artifact::Gm)?.binarize(0.0))
        }
    }

    fn transport_mask<F>(&self, path: &Path, t1w_artifact: Artifact, modality_artifact: Option<F>) -> Result<PathBuf>
    where
        F: FnOnce(String) -> Artifact,
    {
        let vol = Volume::from_file(path)?.into_kind(VolumeKind::Mask);
        let interp = Interpolation::for_kind(vol.kind);
        let in_t1w = self.template_to_t1w(&vol, interp)?;
        drop(vol);
        let t1w_path = self.save(&t1w_artifact, &in_t1w)?;
        match modality_artifact {
            Some(artifact) => {
                let in_modality = self.t1w_to_modality_volume(&in_t1w, interp)?;
                self.save(&artifact(nifti_stem(path)), &in_modality)
            }
            None => Ok(t1w_path),
        }
    }

    /// Carry a template-space tractography waymask to subject space.
    pub fn waymask_to_modality<P: AsRef<Path>>(&self, waymask: P) -> Result<PathBuf> {
        let path = waymask.as_ref();
        self.transport_mask(path, Artifact::WaymaskT1w(nifti_stem(path)), Some(Artifact::WaymaskModality))
    }

    /// Carry a template-space ROI to subject space.
    pub fn roi_to_modality<P: AsRef<Path>>(&self, roi: P) -> Result<PathBuf> {
        let path = roi.as_ref();
        self.transport_mask(path, Artifact::RoiT1w(nifti_stem(path)), Some(Artifact::RoiModality))
    }

    /// Carry a template-space ROI to T1w space.
    pub fn roi_to_t1w<P: AsRef<Path>>(&self, roi: P) -> Result<PathBuf> {
        let path = roi.as_ref();
        self.transport_mask(path, Artifact::RoiT1w(nifti_stem(path)), None::<fn(String) -> Artifact>)
    }

    /// Summary of the transforms computed so far.
    pub fn transform_chain(&self) -> Result<TransformChain> {
        let template_path = self.template_path.ok_or_else(|| {
            RegistrationError::InvalidConfiguration(String::from("T1w to template alignment has not been run"))
        })?;
        let template_to_t1w_warp = match template_path {
            AlignmentPath::Nonlinear => Some(self.store.path(TransformSlot::TemplateToT1wWarp)),
            AlignmentPath::Affine => None,
        };
        Ok(TransformChain {
            template_path,
            t1w_to_template: self.store.load_affine(TransformSlot::T1wToTemplate)?,
            template_to_t1w: self.store.load_affine(TransformSlot::TemplateToT1w)?,
            template_to_t1w_warp,
            modality: *self.modality_transforms()?,
        })
    }

    /// Run every stage of the session.
    pub fn run(&mut self) -> Result<Staged<TransformChain>> {
        info!("Registering {} session in {}", self.config.modality.short_name(), self.layout.base.display());
        self.gen_tissue()?;
        self.t1w_to_template()?;
        self.t1w_to_modality()?;
        if self.capabilities().ventricle_masking {
            self.tissue_to_modality()?;
        }
        let chain = self.transform_chain()?;
        Ok(Staged::with_fallbacks(chain, self.fallbacks.clone()))
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::segment::HeuristicClassifier;
    use crate::solver::CentroidSolver;

    struct Nothing;

    impl TissueClassifier for Nothing {
        fn classify(&self, _: &Volume) -> Result<TissueProbabilities> {
            Err(RegistrationError::InvalidConfiguration(String::from("unused")))
        }
    }

    #[test]
    fn sessions_check_their_preconditions() {
        let dir = tempfile::tempdir().unwrap();
        let backends = Backends { solver: &CentroidSolver, skull: &HeuristicClassifier::default(), extractor: None, classifier: &Nothing };
        let cfg = RegistrationConfig::new(Modality::Functional, dir.path(), "MNI152_T1", 2.0);

        // No templates yet.
        match SpaceRegistrar::new(cfg.clone(), dir.path(), dir.path().join("t1w.nii.gz"), None, backends) {
            Err(RegistrationError::MissingReference(p)) => assert_eq!(cfg.templates.head(), p),
            _ => panic!("expected a missing template"),
        }

        for p in cfg.templates.required(Modality::Functional) {
            std::fs::write(p, b"").unwrap();
        }
        match SpaceRegistrar::new(cfg.clone(), dir.path(), dir.path().join("t1w.nii.gz"), None, backends) {
            Err(RegistrationError::MissingReference(p)) => assert_eq!(dir.path().join("t1w.nii.gz"), p),
            _ => panic!("expected a missing anatomical image"),
        }
    }

    #[test]
    fn label_affines_prefer_the_boundary_based_alignment() {
        let mut t = ModalityTransforms::identity();
        assert!(t.label_affine().is_identity(1e-12));
        let shift = Affine::translation([1.0, 0.0, 0.0]);
        t.bbr = Some((shift.inverse().unwrap(), shift));
        assert!(t.label_affine().is_close(&shift, 1e-12));
    }
}

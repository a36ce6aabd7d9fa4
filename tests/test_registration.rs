use ndarray::Array3;
use std::path::{Path, PathBuf};

use tractreg::tissue::TissueProbabilities;
use tractreg::{
    Affine, Artifact, AtlasTransporter, Backends, CentroidSolver, DiffusionInputs, HeuristicClassifier, Modality,
    RegistrationConfig, RegistrationError, RegistrationSolver, Result, SpaceRegistrar, StageStatus, TissueClassifier,
    TransformSlot, Volume, VolumeKind,
};
use tractreg::align::AlignmentPath;
use tractreg::solver::{AlignOptions, SynMapping};
use tractreg::volume::Grid;
use tractreg::warp::WarpField;

const TEMPLATE: &str = "MNI152_T1";

fn in_block(i: usize, j: usize, k: usize) -> bool {
    (3..7).contains(&i) && (3..7).contains(&j) && (3..7).contains(&k)
}

fn block(value: f32, kind: VolumeKind) -> Volume {
    let data = Array3::from_shape_fn((10, 10, 10), |(i, j, k)| if in_block(i, j, k) { value } else { 0.0 });
    Volume::new(data, Affine::identity(), kind)
}

/// Labels 1 to 4 spread over the block, one label per x slice.
fn atlas(skip: Option<usize>) -> Volume {
    let data = Array3::from_shape_fn((10, 10, 10), |(i, j, k)| {
        if in_block(i, j, k) && Some(i - 2) != skip { (i - 2) as f32 } else { 0.0 }
    });
    Volume::new(data, Affine::identity(), VolumeKind::Label)
}

fn write(path: PathBuf, vol: &Volume) -> PathBuf {
    vol.to_file(&path).unwrap();
    path
}

/// Uniform tissue classes inside the brain.
struct Uniform;

impl TissueClassifier for Uniform {
    fn classify(&self, t1w_brain: &Volume) -> Result<TissueProbabilities> {
        let inside = t1w_brain.binarize(0.0);
        Ok(TissueProbabilities {
            wm: Volume { kind: VolumeKind::Scalar, data: inside.data.mapv(|v| v * 0.8), ..inside.clone() },
            gm: Volume { kind: VolumeKind::Scalar, data: inside.data.mapv(|v| v * 0.6), ..inside.clone() },
            csf: Volume::zeros(&inside.grid, 1, VolumeKind::Scalar),
        })
    }
}

/// Centroid alignment, but every non-linear attempt fails.
struct NoWarp;

impl RegistrationSolver for NoWarp {
    fn affine(&self, moving: &Volume, fixed: &Volume, init: Option<&Affine>, options: &AlignOptions) -> Result<Affine> {
        CentroidSolver.affine(moving, fixed, init, options)
    }

    fn boundary_based(&self, moving: &Volume, fixed: &Volume, init: &Affine, wm_edge: &Volume, options: &AlignOptions) -> Result<Affine> {
        CentroidSolver.boundary_based(moving, fixed, init, wm_edge, options)
    }

    fn nonlinear(&self, _: &Volume, _: &Volume, _: &Affine, _: Option<&Volume>) -> Result<WarpField> {
        Err(RegistrationError::WarpFailed(String::from("solver diverged")))
    }

    fn invert_warp(&self, warp: &WarpField, grid: &Grid) -> Result<WarpField> {
        CentroidSolver.invert_warp(warp, grid)
    }

    fn symmetric_normalization(&self, moving: &Volume, fixed: &Volume, a: Option<&Volume>, b: Option<&Volume>) -> Result<SynMapping> {
        CentroidSolver.symmetric_normalization(moving, fixed, a, b)
    }
}

fn write_templates(dir: &Path, modality: Modality) {
    let cfg = RegistrationConfig::new(modality, dir, TEMPLATE, 1.0);
    let t = &cfg.templates;
    write(t.head(), &block(100.0, VolumeKind::Scalar));
    write(t.brain(), &block(100.0, VolumeKind::Scalar));
    write(t.brain_mask(), &block(1.0, VolumeKind::Mask));
    if modality == Modality::Diffusion {
        write(t.fa(), &block(0.5, VolumeKind::Scalar));
        write(t.subcortical_atlas(), &block(50.0, VolumeKind::Scalar));
        let vent = Array3::from_shape_fn((10, 10, 10), |(i, j, k)| if (4..6).contains(&i) && (4..6).contains(&j) && (4..6).contains(&k) { 1.0 } else { 0.0 });
        write(t.lateral_ventricles(), &Volume::new(vent, Affine::identity(), VolumeKind::Mask));
        let cc = Array3::from_shape_fn((10, 10, 10), |(i, j, k)| if j == 5 && k == 5 && (2..8).contains(&i) { 1.0 } else { 0.0 });
        write(t.corpus_callosum(), &Volume::new(cc, Affine::identity(), VolumeKind::Mask));
    }
}

fn backends<'a>(solver: &'a dyn RegistrationSolver, skull: &'a HeuristicClassifier) -> Backends<'a> {
    Backends { solver, skull, extractor: None, classifier: &Uniform }
}

#[test]
fn functional_identity_session_reproduces_the_atlas() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let templates = dir.path().join("templates");
    let inputs = dir.path().join("inputs");
    std::fs::create_dir_all(&templates).unwrap();
    std::fs::create_dir_all(&inputs).unwrap();
    write_templates(&templates, Modality::Functional);
    let anat = write(inputs.join("t1w.nii.gz"), &block(100.0, VolumeKind::Scalar));

    let skull = HeuristicClassifier::default();
    let cfg = RegistrationConfig::new(Modality::Functional, &templates, TEMPLATE, 1.0).with_simple(true);
    let mut reg = SpaceRegistrar::new(cfg, dir.path().join("sub-01"), &anat, None, backends(&CentroidSolver, &skull)).unwrap();
    let staged = reg.run().unwrap();

    assert_eq!(StageStatus::Success, staged.status());
    let chain = staged.into_inner();
    assert_eq!(AlignmentPath::Affine, chain.template_path);
    assert!(chain.t1w_to_template.is_identity(1e-3));
    assert!(chain.template_to_t1w.is_identity(1e-3));
    assert!(chain.modality.t1w_to_modality.is_identity(1e-12));
    assert!(chain.template_to_t1w_warp.is_none());

    let source = atlas(None);
    let transporter = AtlasTransporter::new(&reg);
    let first = transporter.transport_volume(&source, "blocks").unwrap().into_inner();
    assert_eq!(source.data, first.atlas.data);
    assert!(first.report.is_consecutive());
    assert_eq!(vec![1, 2, 3, 4], first.report.labels);
    assert!(first.tissue.ends_with("reg/imgs/blocks_gm.nii.gz"));
    assert!(first.tissue.is_file());

    // A second pass over the transported atlas changes nothing.
    let second = transporter.transport(&first.tissue).unwrap().into_inner();
    assert_eq!(first.atlas.data, second.atlas.data);
}

#[test]
fn label_gaps_are_reported_without_failing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    write_templates(dir.path(), Modality::Functional);
    let anat = write(dir.path().join("t1w.nii.gz"), &block(100.0, VolumeKind::Scalar));

    let skull = HeuristicClassifier::default();
    let cfg = RegistrationConfig::new(Modality::Functional, dir.path(), TEMPLATE, 1.0).with_simple(true);
    let mut reg = SpaceRegistrar::new(cfg, dir.path().join("sub-01"), &anat, None, backends(&CentroidSolver, &skull)).unwrap();
    reg.run().unwrap();

    let transported = AtlasTransporter::new(&reg).transport_volume(&atlas(Some(2)), "gappy").unwrap().into_inner();
    assert!(!transported.report.is_consecutive());
    assert_eq!(vec![2], transported.report.missing);
    assert_eq!(0, transported.report.zeroed);
}

#[test]
fn diffusion_session_builds_interface_masks_on_the_diffusion_grid() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let templates = dir.path().join("templates");
    std::fs::create_dir_all(&templates).unwrap();
    write_templates(&templates, Modality::Diffusion);
    let anat = write(dir.path().join("t1w.nii.gz"), &block(100.0, VolumeKind::Scalar));
    let diffusion = DiffusionInputs {
        fa: write(dir.path().join("fa.nii.gz"), &block(0.5, VolumeKind::Scalar)),
        ap: write(dir.path().join("ap.nii.gz"), &block(2.0, VolumeKind::Scalar)),
        b0_mask: write(dir.path().join("b0_mask.nii.gz"), &block(1.0, VolumeKind::Mask)),
    };

    let skull = HeuristicClassifier::default();
    let cfg = RegistrationConfig::new(Modality::Diffusion, &templates, TEMPLATE, 1.0).with_ventricle_erosion(1.0);
    let mut reg = SpaceRegistrar::new(cfg, dir.path().join("sub-01"), &anat, Some(diffusion), backends(&CentroidSolver, &skull)).unwrap();
    let chain = reg.run().unwrap().into_inner();

    assert_eq!(AlignmentPath::Nonlinear, chain.template_path);
    assert!(chain.template_to_t1w_warp.as_ref().unwrap().is_file());
    assert!(chain.modality.bbr.is_some());
    assert!(chain.modality.tissue_to_modality.is_identity(1e-3));

    let ap = reg.load(&Artifact::T1wInModality).unwrap();
    let interface = reg.load(&Artifact::Interface).unwrap();
    let vent_csf = reg.load(&Artifact::VentricleCsfModality).unwrap();
    let wm = reg.load(&Artifact::WmInModalityBin).unwrap();
    let gm = reg.load(&Artifact::GmInModalityBin).unwrap();
    let cc = reg.load(&Artifact::CorpusCallosumModality).unwrap();
    for mask in [&interface, &vent_csf, &wm, &gm, &cc].iter() {
        ap.check_same_grid(mask).unwrap();
    }
    assert!(interface.count_nonzero() > 0);
    for ((idx, v), c) in interface.data.indexed_iter().zip(vent_csf.data.iter()) {
        if *v != 0.0 {
            assert!(wm.data[idx] != 0.0 || gm.data[idx] != 0.0 || cc.data[idx] != 0.0);
            assert_eq!(0.0, *c);
        }
    }

    let source = atlas(None);
    let transported = AtlasTransporter::new(&reg).transport_volume(&source, "blocks").unwrap().into_inner();
    assert_eq!(source.data, transported.atlas.data);
    assert!(transported.tissue.ends_with("dmri_reg/reg/imgs/blocks_dwi_track_wmgm_int.nii.gz"));
}

#[test]
fn failed_warps_fall_back_to_the_affine_path() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    write_templates(dir.path(), Modality::Functional);
    let anat = write(dir.path().join("t1w.nii.gz"), &block(100.0, VolumeKind::Scalar));

    let skull = HeuristicClassifier::default();
    let cfg = RegistrationConfig::new(Modality::Functional, dir.path(), TEMPLATE, 1.0);
    let mut reg = SpaceRegistrar::new(cfg, dir.path().join("sub-01"), &anat, None, backends(&NoWarp, &skull)).unwrap();
    let staged = reg.run().unwrap();

    assert_eq!(StageStatus::RecoverableFallbackUsed, staged.status());
    assert_eq!("t1w2mni", staged.fallbacks[0].stage);
    assert_eq!(AlignmentPath::Affine, staged.value.template_path);
    assert!(staged.value.t1w_to_template.is_identity(1e-3));
}

#[test]
fn unreadable_template_warp_moves_the_atlas_along_the_affine_chain() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    write_templates(dir.path(), Modality::Functional);
    let anat = write(dir.path().join("t1w.nii.gz"), &block(100.0, VolumeKind::Scalar));

    let skull = HeuristicClassifier::default();
    let cfg = RegistrationConfig::new(Modality::Functional, dir.path(), TEMPLATE, 1.0);
    let mut reg = SpaceRegistrar::new(cfg, dir.path().join("sub-01"), &anat, None, backends(&CentroidSolver, &skull)).unwrap();
    let staged = reg.run().unwrap();
    assert_eq!(StageStatus::Success, staged.status());
    assert_eq!(AlignmentPath::Nonlinear, staged.value.template_path);

    let warp = reg.store().path(TransformSlot::TemplateToT1wWarp);
    assert!(warp.is_file());
    std::fs::write(&warp, b"not a warp field").unwrap();

    let source = atlas(None);
    let transported = AtlasTransporter::new(&reg).transport_volume(&source, "blocks").unwrap();
    assert_eq!(StageStatus::RecoverableFallbackUsed, transported.status());
    assert_eq!(1, transported.fallbacks.len());
    assert_eq!("atlas2t1w", transported.fallbacks[0].stage);
    assert_eq!(source.data, transported.value.atlas.data);
    assert!(transported.value.t1w.is_file());
}

#[test]
fn skull_without_an_extractor_fails_segmentation() {
    let dir = tempfile::tempdir().unwrap();
    write_templates(dir.path(), Modality::Functional);
    // Mostly non-zero: treated as still containing skull.
    let head = Volume::new(Array3::from_elem((10, 10, 10), 10.0), Affine::identity(), VolumeKind::Scalar);
    let anat = write(dir.path().join("t1w.nii.gz"), &head);

    let skull = HeuristicClassifier::default();
    let cfg = RegistrationConfig::new(Modality::Functional, dir.path(), TEMPLATE, 1.0);
    let mut reg = SpaceRegistrar::new(cfg, dir.path().join("sub-01"), &anat, None, backends(&CentroidSolver, &skull)).unwrap();
    match reg.run() {
        Err(RegistrationError::SegmentationFailed(_)) => {}
        other => panic!("expected a segmentation failure, got {:?}", other.map(|s| s.value.template_path)),
    }
}

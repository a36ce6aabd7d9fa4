//! Spatial registration of diffusion and functional MRI sessions to anatomical and template space.
//!
//! A [`SpaceRegistrar`] builds the transform chain of one session: template and T1w, T1w and
//! the subject's diffusion or functional space, plus tissue masks in subject space. An
//! [`AtlasTransporter`] carries label atlases along that chain, and a [`StreamlineNormalizer`]
//! maps tractography from native diffusion space into template space.
//!
//! Image registration itself is delegated to a [`RegistrationSolver`]; [`CentroidSolver`] is a
//! simple deterministic backend.

pub mod affine;
pub mod align;
pub mod atlas;
pub mod config;
pub mod error;
pub mod layout;
pub mod morphology;
pub mod naming;
pub mod nifti;
pub mod normalize;
pub mod outcome;
pub mod registrar;
pub mod resample;
pub mod segment;
pub mod solver;
pub mod streamline;
pub mod tissue;
pub mod transform_store;
pub mod trk;
pub mod util;
pub mod volume;
pub mod warp;

pub use affine::{read_affine, write_affine, Affine};
pub use align::{AlignmentPath, AlignmentResult, AlignmentStage};
pub use atlas::{AtlasTransport, AtlasTransporter, LabelReport};
pub use config::{Modality, RegistrationConfig, TemplateLibrary, TissueThresholds};
pub use error::{RegistrationError, Result};
pub use layout::{Artifact, SessionLayout, TransformSlot};
pub use naming::TractographyParams;
pub use nifti::{read_nifti, write_nifti, NiftiHeader};
pub use normalize::{NormalizationInputs, NormalizationProducts, StreamlineNormalizer};
pub use outcome::{Fallback, StageStatus, Staged};
pub use registrar::{Backends, DiffusionInputs, SpaceRegistrar, TransformChain};
pub use resample::Interpolation;
pub use segment::{BrainExtractor, HeuristicClassifier, SkullStripClassifier, TissueClassifier};
pub use solver::{CentroidSolver, RegistrationSolver};
pub use streamline::StreamlineSet;
pub use tissue::TissueMaskSet;
pub use transform_store::TransformStore;
pub use trk::{read_trk, write_trk, TrkHeader};
pub use volume::{Grid, Volume, VolumeKind};
pub use warp::WarpField;

//! The registration primitive and its fallback policy.
//!
//! A non-linear alignment always starts from an initializing affine. The non-linear refinement
//! is attempted unless the session runs in simple mode; if it fails, a plain affine registration
//! seeded by the same initializer takes over. Inverse affines are always obtained by matrix
//! inversion, never by registering in the opposite direction.

use log::{info, warn};

use crate::affine::Affine;
use crate::error::{RegistrationError, Result};
use crate::outcome::{Fallback, Staged};
use crate::resample::{resample, Interpolation};
use crate::solver::{AlignOptions, RegistrationSolver};
use crate::volume::Volume;
use crate::warp::{WarpField, WarpPair};

/// Outcome of a single recoverable solver attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome<T> {
    Succeeded(T),
    Failed(String),
}

impl<T> AttemptOutcome<T> {
    pub fn from_result(result: Result<T>) -> AttemptOutcome<T> {
        match result {
            Ok(v) => AttemptOutcome::Succeeded(v),
            Err(e) => AttemptOutcome::Failed(e.to_string()),
        }
    }
}


/// States of the alignment state machine, in the order they were visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignState {
    Init,
    NonlinearAttempted,
    LinearFallback,
}

/// The terminal path of an alignment. Later stages apply the warp or the affine accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentPath {
    Nonlinear,
    Affine,
}

/// Transforms between a moving and a fixed space.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentResult {
    /// Initializing affine, moving to fixed.
    pub init: Affine,
    /// Moving to fixed. Equal to `init` on the non-linear path.
    pub forward: Affine,
    /// Fixed to moving, the matrix inverse of `forward`.
    pub inverse: Affine,
    /// Forward and inverse warps, present on the non-linear path only.
    pub warp: Option<WarpPair>,
    pub path: AlignmentPath,
    pub trace: Vec<AlignState>,
    /// The moving volume resampled into the fixed space.
    pub aligned: Volume,
}

impl AlignmentResult {
    /// Carry a fixed-space volume into the moving space, through the warp if there is one.
    pub fn to_moving(&self, vol: &Volume, moving: &Volume, interp: Interpolation) -> Result<Volume> {
        match &self.warp {
            Some(pair) => pair.inverse.apply(vol, interp, None),
            None => resample(vol, &moving.grid, &self.inverse, interp),
        }
    }
}


/// An affine alignment optionally refined with a boundary-based cost.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinedAlignment {
    /// Mutual-information affine, moving to fixed.
    pub initial: Affine,
    /// Boundary-based refinement of `initial`, if it succeeded.
    pub refined: Option<Affine>,
}

impl RefinedAlignment {
    /// The refined affine if available, else the initial one.
    pub fn best(&self) -> &Affine {
        self.refined.as_ref().unwrap_or(&self.initial)
    }
}


/// Runs alignments against a black-box solver.
pub struct AlignmentStage<'a> {
    solver: &'a dyn RegistrationSolver,
}

impl<'a> AlignmentStage<'a> {
    pub fn new(solver: &'a dyn RegistrationSolver) -> AlignmentStage<'a> {
        AlignmentStage { solver }
    }

    /// A single affine alignment. Solver failures are fatal.
    pub fn align(&self, stage: &str, moving: &Volume, fixed: &Volume, init: Option<&Affine>, options: &AlignOptions) -> Result<Affine> {
        self.solver
            .affine(moving, fixed, init, options)
            .map_err(|e| RegistrationError::RegistrationFailed(stage.to_string(), e.to_string()))
    }

    /// Align `moving` to a template, non-linearly unless `simple`.
    ///
    /// The initializer and the affine fallback register against `fixed_brain`, the non-linear
    /// refinement against `fixed_head` restricted to `fixed_mask`.
    pub fn align_nonlinear(
        &self,
        stage: &str,
        moving: &Volume,
        fixed_brain: &Volume,
        fixed_head: &Volume,
        fixed_mask: Option<&Volume>,
        simple: bool,
    ) -> Result<Staged<AlignmentResult>> {
        let options = AlignOptions::mutual_information(12);
        let mut trace = vec![AlignState::Init];
        let init = self.align(stage, moving, fixed_brain, None, &options)?;

        let mut fallbacks = Vec::new();
        if !simple {
            trace.push(AlignState::NonlinearAttempted);
            info!("Learning a non-linear mapping for {} ...", stage);
            match AttemptOutcome::from_result(self.nonlinear(moving, fixed_head, &init, fixed_mask)) {
                AttemptOutcome::Succeeded((pair, aligned)) => {
                    let inverse = init.inverse()?;
                    return Ok(Staged::success(AlignmentResult {
                        init,
                        forward: init,
                        inverse,
                        warp: Some(pair),
                        path: AlignmentPath::Nonlinear,
                        trace,
                        aligned,
                    }));
                }
                AttemptOutcome::Failed(reason) => {
                    warn!("Non-linear registration failed for {} ({}), falling back to affine registration", stage, reason);
                    fallbacks.push(Fallback::new(stage, reason));
                }
            }
        }

        trace.push(AlignState::LinearFallback);
        let forward = self.align(stage, moving, fixed_brain, Some(&init), &options)?;
        let inverse = forward.inverse()?;
        let aligned = resample(moving, &fixed_brain.grid, &forward, Interpolation::Trilinear)?;
        Ok(Staged::with_fallbacks(
            AlignmentResult { init, forward, inverse, warp: None, path: AlignmentPath::Affine, trace, aligned },
            fallbacks,
        ))
    }

    fn nonlinear(&self, moving: &Volume, fixed: &Volume, init: &Affine, mask: Option<&Volume>) -> Result<(WarpPair, Volume)> {
        let forward: WarpField = self.solver.nonlinear(moving, fixed, init, mask)?;
        let inverse = self.solver.invert_warp(&forward, &moving.grid)?;
        let aligned = forward.apply(moving, Interpolation::Trilinear, None)?;
        Ok((WarpPair { forward, inverse, init: *init }, aligned))
    }

    /// Align two modalities of the same subject: mutual information first, then, unless
    /// `boundary` is `None`, a boundary-based pass seeded by it. `boundary` holds the volume to
    /// align in place of `moving` and the white matter edge map of `fixed`.
    pub fn align_refined(
        &self,
        stage: &str,
        moving: &Volume,
        fixed: &Volume,
        boundary: Option<(&Volume, &Volume)>,
    ) -> Result<Staged<RefinedAlignment>> {
        let initial = self.align(stage, moving, fixed, None, &AlignOptions::mutual_information(6))?;
        let (boundary_moving, wm_edge) = match boundary {
            Some(b) => b,
            None => return Ok(Staged::success(RefinedAlignment { initial, refined: None })),
        };

        info!("Learning a boundary-based mapping for {} ...", stage);
        let attempt = self.solver.boundary_based(boundary_moving, fixed, &initial, wm_edge, &AlignOptions::boundary_based(7));
        Ok(match AttemptOutcome::from_result(attempt) {
            AttemptOutcome::Succeeded(refined) => Staged::success(RefinedAlignment { initial, refined: Some(refined) }),
            AttemptOutcome::Failed(reason) => {
                warn!("Boundary-based registration failed for {} ({}), keeping the mutual-information alignment", stage, reason);
                Staged::with_fallbacks(RefinedAlignment { initial, refined: None }, vec![Fallback::new(stage, reason)])
            }
        })
    }
}

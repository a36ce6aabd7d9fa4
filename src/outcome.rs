//! Typed results of registration stages.
//!
//! A stage either fails fatally (`Err(RegistrationError)`) or produces a value. A produced value
//! may have been reached through a recovery path, which is recorded as a [`Fallback`] so that
//! callers do not have to parse log output to find out which path was taken.

use std::fmt;

/// Overall status of a stage that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Success,
    RecoverableFallbackUsed,
}

/// A recovery decision taken during a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    /// Name of the stage, e.g. `"t1w2mni"`.
    pub stage: String,
    /// Why the preferred path was abandoned.
    pub reason: String,
}

impl Fallback {
    pub fn new<S: Into<String>, R: Into<String>>(stage: S, reason: R) -> Fallback {
        Fallback { stage: stage.into(), reason: reason.into() }
    }
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.reason)
    }
}


/// A stage result together with the fallbacks used to produce it.
#[derive(Debug, Clone, PartialEq)]
pub struct Staged<T> {
    pub value: T,
    pub fallbacks: Vec<Fallback>,
}

impl<T> Staged<T> {
    pub fn success(value: T) -> Staged<T> {
        Staged { value, fallbacks: Vec::new() }
    }

    pub fn with_fallbacks(value: T, fallbacks: Vec<Fallback>) -> Staged<T> {
        Staged { value, fallbacks }
    }

    pub fn status(&self) -> StageStatus {
        if self.fallbacks.is_empty() {
            StageStatus::Success
        } else {
            StageStatus::RecoverableFallbackUsed
        }
    }

    /// Unwrap the value of another stage, adding its fallbacks to this one.
    pub fn absorb<U>(&mut self, other: Staged<U>) -> U {
        self.fallbacks.extend(other.fallbacks);
        other.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

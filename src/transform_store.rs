//! File-backed storage of the transforms of one session.

use std::collections::BTreeSet;
use std::path::PathBuf;

use log::debug;

use crate::affine::Affine;
use crate::error::{RegistrationError, Result};
use crate::layout::{SessionLayout, TransformSlot};
use crate::warp::WarpField;

/// Named affine and warp artifacts of one session, with a record of which slots were written by it.
///
/// A slot is written as a whole. Fallback paths overwrite a slot instead of patching it.
#[derive(Debug, Clone)]
pub struct TransformStore {
    layout: SessionLayout,
    written: BTreeSet<TransformSlot>,
}

impl TransformStore {
    pub fn new(layout: SessionLayout) -> TransformStore {
        TransformStore { layout, written: BTreeSet::new() }
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn path(&self, slot: TransformSlot) -> PathBuf {
        self.layout.transform_path(slot)
    }

    /// Whether the slot was written by this session or exists on disk from an earlier run.
    pub fn has(&self, slot: TransformSlot) -> bool {
        self.written.contains(&slot) || self.path(slot).is_file()
    }

    /// Whether the slot was written by this session.
    pub fn written_here(&self, slot: TransformSlot) -> bool {
        self.written.contains(&slot)
    }

    pub fn written(&self) -> impl Iterator<Item = &TransformSlot> {
        self.written.iter()
    }

    pub fn save_affine(&mut self, slot: TransformSlot, xfm: &Affine) -> Result<PathBuf> {
        let path = self.path(slot);
        xfm.to_file(&path)?;
        debug!("Saved {:?} to {}", slot, path.display());
        self.written.insert(slot);
        Ok(path)
    }

    pub fn load_affine(&self, slot: TransformSlot) -> Result<Affine> {
        let path = self.existing(slot)?;
        Affine::from_file(path)
    }

    pub fn save_warp(&mut self, slot: TransformSlot, warp: &WarpField) -> Result<PathBuf> {
        let path = self.path(slot);
        warp.to_file(&path)?;
        debug!("Saved {:?} to {}", slot, path.display());
        self.written.insert(slot);
        Ok(path)
    }

    pub fn load_warp(&self, slot: TransformSlot) -> Result<WarpField> {
        let path = self.existing(slot)?;
        WarpField::from_file(path)
    }

    fn existing(&self, slot: TransformSlot) -> Result<PathBuf> {
        let path = self.path(slot);
        if path.is_file() {
            Ok(path)
        } else {
            Err(RegistrationError::MissingReference(path))
        }
    }
}

//! Names of template-space tractography products.
//!
//! Every name encodes the tracking parameters it was produced with, so that products of a
//! parameter sweep never collide.

use std::path::{Path, PathBuf};

use crate::util::nifti_stem;

/// Node definition of the graph the streamlines are counted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSize {
    /// Nodes are whole parcels.
    Parcels,
    /// Spherical nodes of the given radius in mm.
    Radius(u32),
}

/// Parameters of a tractography run.
#[derive(Debug, Clone, PartialEq)]
pub struct TractographyParams {
    pub network: Option<String>,
    pub roi: Option<PathBuf>,
    pub conn_model: String,
    pub target_samples: usize,
    pub node_size: Option<NodeSize>,
    /// Curvature thresholds in degrees.
    pub curv_thr_list: Vec<u32>,
    /// Step sizes in mm.
    pub step_list: Vec<f64>,
    pub track_type: String,
    /// Direction getter.
    pub directget: String,
    /// Minimum streamline length in mm.
    pub min_length: u32,
}

impl TractographyParams {
    fn encode(&self, prefix: &str, extension: &str) -> String {
        let mut name = String::from(prefix);
        if let Some(network) = &self.network {
            name.push_str(network);
            name.push('_');
        }
        if let Some(roi) = &self.roi {
            let file_name = roi.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
            name.push_str(file_name.split('.').next().unwrap_or(""));
            name.push('_');
        }
        name.push_str(&format!("{}_{}", self.conn_model, self.target_samples));
        match self.node_size {
            Some(NodeSize::Radius(r)) => name.push_str(&format!("_{}mm_", r)),
            _ => name.push('_'),
        }
        let curv: Vec<String> = self.curv_thr_list.iter().map(|c| c.to_string()).collect();
        let step: Vec<String> = self.step_list.iter().map(|s| float_repr(*s)).collect();
        name.push_str(&format!(
            "curv[{}]step[{}]tt-{}_dg-{}_ml-{}{}",
            curv.join("_"),
            step.join("_"),
            self.track_type,
            self.directget,
            self.min_length,
            extension
        ));
        name
    }
}


/// Floats keep a fractional part even when integral, e.g. `1.0`.
fn float_repr(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}


/// Directory all tractography products of an output directory are written to.
pub fn tractography_dir<P: AsRef<Path>>(dir: P) -> PathBuf {
    dir.as_ref().join("tractography")
}

/// Template-space streamlines.
pub fn streamlines_mni_path<P: AsRef<Path>>(dir: P, params: &TractographyParams) -> PathBuf {
    tractography_dir(dir).join(params.encode("streamlines_mni_", ".trk"))
}

/// Template-space streamline density map.
pub fn density_map_mni_path<P: AsRef<Path>>(dir: P, params: &TractographyParams) -> PathBuf {
    tractography_dir(dir).join(params.encode("density_map_mni_", ".nii.gz"))
}

/// Union of the canonical template atlas `uatlas` and the subject atlas warped to template space.
pub fn liberal_atlas_path<P: AsRef<Path>, Q: AsRef<Path>>(dir: P, uatlas: Q) -> PathBuf {
    dir.as_ref()
        .join("parcellations")
        .join(format!("{}_liberal.nii.gz", nifti_stem(uatlas)))
}


#[cfg(test)]
mod test {
    use super::*;

    fn params() -> TractographyParams {
        TractographyParams {
            network: None,
            roi: None,
            conn_model: String::from("csd"),
            target_samples: 10000,
            node_size: None,
            curv_thr_list: vec![40, 30],
            step_list: vec![0.1, 0.2, 0.5],
            track_type: String::from("local"),
            directget: String::from("prob"),
            min_length: 20,
        }
    }

    #[test]
    fn names_encode_every_parameter() {
        assert_eq!(
            PathBuf::from("/out/tractography/streamlines_mni_csd_10000_curv[40_30]step[0.1_0.2_0.5]tt-local_dg-prob_ml-20.trk"),
            streamlines_mni_path("/out", &params())
        );

        let mut p = params();
        p.network = Some(String::from("Default"));
        p.roi = Some(PathBuf::from("/rois/pcc.nii.gz"));
        p.node_size = Some(NodeSize::Radius(4));
        p.step_list = vec![1.0];
        assert_eq!(
            PathBuf::from("/out/tractography/density_map_mni_Default_pcc_csd_10000_4mm_curv[40_30]step[1.0]tt-local_dg-prob_ml-20.nii.gz"),
            density_map_mni_path("/out", &p)
        );

        p.node_size = Some(NodeSize::Parcels);
        assert!(density_map_mni_path("/out", &p).to_string_lossy().contains("csd_10000_curv"));
    }

    #[test]
    fn liberal_atlases_are_named_after_the_canonical_atlas() {
        assert_eq!(
            PathBuf::from("/out/parcellations/aal_2mm_liberal.nii.gz"),
            liberal_atlas_path("/out", "/atlases/aal_2mm.nii.gz")
        );
    }
}

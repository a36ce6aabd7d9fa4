//! Homogeneous 4x4 affine transforms between physical (RASMM) coordinate spaces.
//!
//! Affines are stored on disk as plain text: four rows of four whitespace-separated
//! numbers, the layout used by most neuroimaging registration tools for `.mat` files.

use nalgebra::{Matrix4, Vector4};

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{RegistrationError, Result};

/// A directional affine transform, mapping homogeneous coordinates of a source space into a target space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub matrix: Matrix4<f64>,
}

impl Default for Affine {
    fn default() -> Affine {
        Affine::identity()
    }
}

impl Affine {
    pub fn identity() -> Affine {
        Affine { matrix: Matrix4::identity() }
    }

    pub fn from_matrix(matrix: Matrix4<f64>) -> Affine {
        Affine { matrix }
    }

    /// Construct from four rows of four values.
    pub fn from_rows(rows: [[f64; 4]; 4]) -> Affine {
        let mut matrix = Matrix4::identity();
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                matrix[(r, c)] = *value;
            }
        }
        Affine { matrix }
    }

    /// A pure translation.
    pub fn translation(offset: [f64; 3]) -> Affine {
        let mut matrix = Matrix4::identity();
        for i in 0..3 {
            matrix[(i, 3)] = offset[i];
        }
        Affine { matrix }
    }

    /// Isotropic scaling with unit homogeneous entry, e.g. the voxel-to-mm map of a grid with `vox_size` spacing.
    pub fn scaling(vox_size: f64) -> Affine {
        let mut matrix = Matrix4::identity() * vox_size;
        matrix[(3, 3)] = 1.0;
        Affine { matrix }
    }

    pub fn rows(&self) -> [[f64; 4]; 4] {
        let mut rows = [[0.0; 4]; 4];
        for r in 0..4 {
            for c in 0..4 {
                rows[r][c] = self.matrix[(r, c)];
            }
        }
        rows
    }

    /// The translation column.
    pub fn offset(&self) -> [f64; 3] {
        [self.matrix[(0, 3)], self.matrix[(1, 3)], self.matrix[(2, 3)]]
    }

    /// A copy of this affine with a replaced translation column.
    pub fn with_offset(&self, offset: [f64; 3]) -> Affine {
        let mut matrix = self.matrix;
        for i in 0..3 {
            matrix[(i, 3)] = offset[i];
        }
        Affine { matrix }
    }

    /// Direct matrix inversion. Registration inverses are always derived this way, never re-estimated.
    pub fn inverse(&self) -> Result<Affine> {
        self.matrix
            .try_inverse()
            .map(Affine::from_matrix)
            .ok_or(RegistrationError::SingularMatrix)
    }

    /// The transform applying `self` first and `next` afterwards.
    pub fn then(&self, next: &Affine) -> Affine {
        Affine { matrix: next.matrix * self.matrix }
    }

    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        let v = self.matrix * Vector4::new(point[0], point[1], point[2], 1.0);
        [v[0], v[1], v[2]]
    }

    /// The length of each column of the linear part, i.e. the voxel spacing for a voxel-to-world affine.
    pub fn column_scales(&self) -> [f64; 3] {
        let mut scales = [0.0; 3];
        for c in 0..3 {
            let mut sq = 0.0;
            for r in 0..3 {
                sq += self.matrix[(r, c)] * self.matrix[(r, c)];
            }
            scales[c] = sq.sqrt();
        }
        scales
    }

    /// Element-wise comparison with an absolute tolerance.
    pub fn is_close(&self, other: &Affine, tol: f64) -> bool {
        self.matrix
            .iter()
            .zip(other.matrix.iter())
            .all(|(a, b)| (a - b).abs() <= tol)
    }

    pub fn is_identity(&self, tol: f64) -> bool {
        self.is_close(&Affine::identity(), tol)
    }

    /// Read an affine from a text file with 4 rows of 4 numbers.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Affine> {
        let content = fs::read_to_string(&path)?;
        Affine::from_text(&content).ok_or_else(|| RegistrationError::InvalidAffineFile(path.as_ref().to_path_buf()))
    }

    fn from_text(content: &str) -> Option<Affine> {
        let values: Vec<f64> = content
            .split_whitespace()
            .map(|tok| tok.parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .ok()?;
        if values.len() != 16 {
            return None;
        }
        Some(Affine { matrix: Matrix4::from_row_slice(&values) })
    }

    /// Write this affine as a text file with 4 rows of 4 numbers.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl fmt::Display for Affine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for r in 0..4 {
            writeln!(
                f,
                "{:.10}  {:.10}  {:.10}  {:.10}",
                self.matrix[(r, 0)],
                self.matrix[(r, 1)],
                self.matrix[(r, 2)],
                self.matrix[(r, 3)]
            )?;
        }
        Ok(())
    }
}


/// Read an affine matrix text file.
pub fn read_affine<P: AsRef<Path>>(path: P) -> Result<Affine> {
    Affine::from_file(path)
}


/// Write an affine matrix text file.
pub fn write_affine<P: AsRef<Path>>(path: P, affine: &Affine) -> Result<()> {
    affine.to_file(path)
}

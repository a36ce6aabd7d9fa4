use quick_error::quick_error;
use std::io::Error as IOError;
use std::path::PathBuf;

quick_error! {
    /// Error type for all error variants originated by this crate.
    #[derive(Debug)]
    pub enum RegistrationError {
        /// Invalid NIfTI-1 file: wrong header size or magic.
        InvalidNiftiFormat(reason: String) {
            display("Invalid NIfTI-1 file: {}", reason)
        }

        UnsupportedNiftiDatatype(code: i16) {
            display("Unsupported NIfTI datatype code {}", code)
        }

        /// Invalid TrackVis file: wrong magic or header size.
        InvalidTrkFormat(reason: String) {
            display("Invalid TrackVis trk file: {}", reason)
        }

        InvalidAffineFile(path: PathBuf) {
            display("Invalid affine matrix file: {}", path.display())
        }

        SingularMatrix {
            display("Affine matrix is singular and cannot be inverted")
        }

        /// Two volumes were expected to share a voxel grid or frame count.
        ShapeMismatch(expected: Vec<usize>, actual: Vec<usize>) {
            display("Shape mismatch: expected {:?}, got {:?}", expected, actual)
        }

        /// A required reference file (template, atlas, prior transform) is missing.
        MissingReference(path: PathBuf) {
            display("Required reference file not found: {}", path.display())
        }

        InvalidConfiguration(reason: String) {
            display("Invalid configuration: {}", reason)
        }

        SegmentationFailed(reason: String) {
            display("Segmentation failed: {}. Does the input anatomical image still contain skull?", reason)
        }

        /// Both the non-linear and the affine solver path failed.
        RegistrationFailed(stage: String, reason: String) {
            display("Registration failed during {}: {}", stage, reason)
        }

        WarpFailed(reason: String) {
            display("Could not apply warp field: {}", reason)
        }

        LabelCoordinateMismatch(coords: usize, labels: usize) {
            display("Number of node coordinates ({}) does not match number of node labels ({})", coords, labels)
        }

        InvalidSequenceBase(base: f64) {
            display("Van der Corput base must be greater than 1, got {}", base)
        }

        /// I/O Error
        Io(err: IOError) {
            from()
            source(err)
        }
    }
}

/// Alias type for results originated from this crate.
pub type Result<T> = ::std::result::Result<T, RegistrationError>;

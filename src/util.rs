//! Utility functions used in all other modules.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::{RegistrationError, Result};

use byteordered::byteorder::{ReadBytesExt, WriteBytesExt};

/// Check whether the file extension ends with ".gz".
pub fn is_gz_file<P>(path: P) -> bool
where
    P: AsRef<Path>,
{
    path.as_ref()
        .file_name()
        .map(|a| a.to_string_lossy().ends_with(".gz"))
        .unwrap_or(false)
}


/// The file name of a NIfTI path without any `.nii` / `.nii.gz` suffix.
///
/// # Examples
///
/// ```
/// assert_eq!(tractreg::util::nifti_stem("/data/atlas/aal.nii.gz"), "aal");
/// assert_eq!(tractreg::util::nifti_stem("roi.nii"), "roi");
/// ```
pub fn nifti_stem<P>(path: P) -> String
where
    P: AsRef<Path>,
{
    let name = path
        .as_ref()
        .file_name()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.find(".nii") {
        Some(pos) => name[..pos].to_string(),
        None => name.split('.').next().unwrap_or("").to_string(),
    }
}


/// Read a fixed length zero-terminated byte string of the given length from the input. Embedded '\0' chars are allowed, but not added to the returned String.
pub fn read_fixed_length_string<S>(input: &mut S, len: usize) -> Result<String>
where
    S: Read,
{
    let mut info_line = String::with_capacity(len);
    for _  in 0..len   {
        let cur_char = input.read_u8()? as char;
        if cur_char != '\0'  {
            info_line.push(cur_char);
        }
    }
    Ok(info_line)
}


/// Write a string into a fixed length field, truncating it or padding it with '\0'.
pub fn write_fixed_length_string<S>(output: &mut S, value: &str, len: usize) -> Result<()>
where
    S: Write,
{
    let bytes = value.as_bytes();
    for idx in 0..len {
        output.write_u8(if idx < bytes.len() { bytes[idx] } else { 0 })?;
    }
    Ok(())
}


/// Compute the `n`-th element of the van der Corput low-discrepancy sequence in the given `base`.
///
/// The base does not have to be an integer: the voxel size in mm is used directly, with
/// floored division providing the digits. Bases at or below 1 never terminate and are rejected.
///
/// # Examples
///
/// ```
/// let v = tractreg::util::van_der_corput(3, 2.0).unwrap();
/// assert_eq!(v, 0.75);
/// ```
pub fn van_der_corput(n: u32, base: f64) -> Result<f64> {
    if !(base > 1.0) || !base.is_finite() {
        return Err(RegistrationError::InvalidSequenceBase(base));
    }
    let mut n = n as f64;
    let mut vdc = 0.0;
    let mut denom = 1.0;
    while n != 0.0 {
        denom *= base;
        let quotient = (n / base).floor();
        let remainder = n - quotient * base;
        n = quotient;
        vdc += remainder / denom;
    }
    Ok(vdc)
}


/// Labels from `1` to the largest label in `labels` which do not occur in `labels`.
///
/// The background label `0` and negative labels are ignored. An empty result means the
/// non-zero labels form a consecutive range starting at 1.
pub fn missing_labels(labels: &[i64]) -> Vec<i64> {
    let mut present: Vec<i64> = labels.iter().cloned().filter(|l| *l > 0).collect();
    present.sort_unstable();
    present.dedup();
    let max_label = match present.last() {
        Some(m) => *m,
        None => return Vec::new(),
    };
    let mut missing = Vec::new();
    let mut idx = 0;
    for label in 1..=max_label {
        if idx < present.len() && present[idx] == label {
            idx += 1;
        } else {
            missing.push(label);
        }
    }
    missing
}


/// Whether the non-zero labels form the consecutive range `1..=N`.
pub fn is_consecutive(labels: &[i64]) -> bool {
    missing_labels(labels).is_empty()
}

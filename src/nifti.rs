//! Functions for reading and writing single-file NIfTI-1 volumes ('.nii' and '.nii.gz').
//!
//! Only the parts of the header that determine geometry and sample decoding are modelled.
//! Files are read in either byte order and always written little-endian.

use byteordered::{ByteOrdered, Endianness};
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array, Array4, ShapeBuilder};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::affine::Affine;
use crate::error::{RegistrationError, Result};
use crate::util::{is_gz_file, read_fixed_length_string, write_fixed_length_string};
use crate::volume::{Grid, Volume, VolumeKind};

pub const NIFTI1_HEADER_SIZE: i32 = 348;
pub const NIFTI1_MAGIC_SINGLE_FILE: &str = "n+1";
pub const NIFTI1_DEFAULT_VOX_OFFSET: f32 = 352.0;

pub const DT_UINT8: i16 = 2;
pub const DT_INT16: i16 = 4;
pub const DT_INT32: i16 = 8;
pub const DT_FLOAT32: i16 = 16;
pub const DT_FLOAT64: i16 = 64;
pub const DT_INT8: i16 = 256;
pub const DT_UINT16: i16 = 512;
pub const DT_UINT32: i16 = 768;

const XFORM_SCANNER_ANAT: i16 = 1;
const XFORM_ALIGNED_ANAT: i16 = 2;
const UNITS_MM_SEC: u8 = 10;

/// The header of a NIfTI-1 file.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub endianness: Endianness,
    pub dim: [i16; 8],
    pub intent_code: i16,
    pub datatype: i16,
    pub bitpix: i16,
    pub pixdim: [f32; 8],
    pub vox_offset: f32,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub xyzt_units: u8,
    pub descrip: String,
    pub qform_code: i16,
    pub sform_code: i16,
    pub quatern: [f32; 3],
    pub qoffset: [f32; 3],
    pub srow_x: [f32; 4],
    pub srow_y: [f32; 4],
    pub srow_z: [f32; 4],
    pub magic: String,
}


impl Default for NiftiHeader {
    fn default() -> NiftiHeader {
        NiftiHeader {
            endianness: Endianness::Little,
            dim: [0; 8],
            intent_code: 0,
            datatype: DT_FLOAT32,
            bitpix: 32,
            pixdim: [1.0; 8],
            vox_offset: NIFTI1_DEFAULT_VOX_OFFSET,
            scl_slope: 1.0,
            scl_inter: 0.0,
            xyzt_units: UNITS_MM_SEC,
            descrip: String::new(),
            qform_code: 0,
            sform_code: 0,
            quatern: [0.0; 3],
            qoffset: [0.0; 3],
            srow_x: [1.0, 0.0, 0.0, 0.0],
            srow_y: [0.0, 1.0, 0.0, 0.0],
            srow_z: [0.0, 0.0, 1.0, 0.0],
            magic: String::from(NIFTI1_MAGIC_SINGLE_FILE),
        }
    }
}


/// Size in bits of a single sample of the given datatype.
pub fn datatype_bitpix(datatype: i16) -> Result<i16> {
    match datatype {
        DT_UINT8 | DT_INT8 => Ok(8),
        DT_INT16 | DT_UINT16 => Ok(16),
        DT_INT32 | DT_UINT32 | DT_FLOAT32 => Ok(32),
        DT_FLOAT64 => Ok(64),
        other => Err(RegistrationError::UnsupportedNiftiDatatype(other)),
    }
}


impl NiftiHeader {

    /// Read a NIfTI-1 header from a file.
    /// If the file's name ends with ".gz", the file is assumed to need GZip decoding.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<NiftiHeader> {
        let gz = is_gz_file(&path);
        let mut file = BufReader::new(File::open(path)?);
        if gz {
            NiftiHeader::from_reader(&mut GzDecoder::new(file))
        } else {
            NiftiHeader::from_reader(&mut file)
        }
    }


    /// Read a NIfTI-1 header from the given byte stream.
    /// It is assumed that the input is currently at the start of the header. After
    /// this call, the input is positioned directly behind the 348 header bytes.
    pub fn from_reader<S>(input: &mut S) -> Result<NiftiHeader>
    where
        S: Read,
    {
        let mut sizeof_hdr = [0u8; 4];
        input.read_exact(&mut sizeof_hdr)?;

        let endianness = if i32::from_le_bytes(sizeof_hdr) == NIFTI1_HEADER_SIZE {
            Endianness::Little
        } else if i32::from_be_bytes(sizeof_hdr) == NIFTI1_HEADER_SIZE {
            Endianness::Big
        } else {
            return Err(RegistrationError::InvalidNiftiFormat(String::from("sizeof_hdr is not 348")));
        };

        let mut hdr = NiftiHeader::default();
        hdr.endianness = endianness;
        let mut input = ByteOrdered::runtime(input, endianness);

        // data_type, db_name, extents, session_error, regular, dim_info: unused.
        let mut skipped = [0u8; 36];
        input.read_exact(&mut skipped)?;

        for idx in 0..8 { hdr.dim[idx] = input.read_i16()?; }

        for _ in 0..3 { input.read_f32()?; } // intent_p1..3
        hdr.intent_code = input.read_i16()?;
        hdr.datatype = input.read_i16()?;
        hdr.bitpix = input.read_i16()?;
        input.read_i16()?; // slice_start

        for idx in 0..8 { hdr.pixdim[idx] = input.read_f32()?; }

        hdr.vox_offset = input.read_f32()?;
        hdr.scl_slope = input.read_f32()?;
        hdr.scl_inter = input.read_f32()?;
        input.read_i16()?; // slice_end
        input.read_u8()?; // slice_code
        hdr.xyzt_units = input.read_u8()?;

        // cal_max, cal_min, slice_duration, toffset, glmax, glmin
        let mut skipped = [0u8; 24];
        input.read_exact(&mut skipped)?;

        hdr.descrip = read_fixed_length_string(&mut input, 80)?;
        read_fixed_length_string(&mut input, 24)?; // aux_file

        hdr.qform_code = input.read_i16()?;
        hdr.sform_code = input.read_i16()?;
        for idx in 0..3 { hdr.quatern[idx] = input.read_f32()?; }
        for idx in 0..3 { hdr.qoffset[idx] = input.read_f32()?; }
        for idx in 0..4 { hdr.srow_x[idx] = input.read_f32()?; }
        for idx in 0..4 { hdr.srow_y[idx] = input.read_f32()?; }
        for idx in 0..4 { hdr.srow_z[idx] = input.read_f32()?; }

        read_fixed_length_string(&mut input, 16)?; // intent_name
        hdr.magic = read_fixed_length_string(&mut input, 4)?;

        if hdr.magic != NIFTI1_MAGIC_SINGLE_FILE {
            return Err(RegistrationError::InvalidNiftiFormat(format!(
                "unsupported magic '{}', only single-file NIfTI-1 is supported", hdr.magic
            )));
        }
        if hdr.dim[0] < 1 || hdr.dim[0] > 7 {
            return Err(RegistrationError::InvalidNiftiFormat(format!("invalid dim[0] = {}", hdr.dim[0])));
        }
        if (hdr.vox_offset as i32) < NIFTI1_HEADER_SIZE {
            return Err(RegistrationError::InvalidNiftiFormat(format!("invalid vox_offset {}", hdr.vox_offset)));
        }
        datatype_bitpix(hdr.datatype)?;
        Ok(hdr)
    }


    /// Build a header describing the given volume.
    pub fn for_volume(volume: &Volume) -> NiftiHeader {
        let mut hdr = NiftiHeader::default();
        let shape = volume.shape();
        let frames = volume.frames();
        hdr.dim = [if frames > 1 { 4 } else { 3 }, shape[0] as i16, shape[1] as i16, shape[2] as i16, frames as i16, 1, 1, 1];

        hdr.datatype = match volume.kind {
            VolumeKind::Mask => DT_UINT8,
            VolumeKind::Label => DT_INT32,
            VolumeKind::Scalar => DT_FLOAT32,
        };
        hdr.bitpix = datatype_bitpix(hdr.datatype).unwrap_or(32);

        let scales = volume.affine().column_scales();
        hdr.pixdim = [1.0, scales[0] as f32, scales[1] as f32, scales[2] as f32, 1.0, 1.0, 1.0, 1.0];

        let rows = volume.affine().rows();
        hdr.sform_code = XFORM_ALIGNED_ANAT;
        hdr.qform_code = 0;
        for c in 0..4 {
            hdr.srow_x[c] = rows[0][c] as f32;
            hdr.srow_y[c] = rows[1][c] as f32;
            hdr.srow_z[c] = rows[2][c] as f32;
        }
        hdr
    }


    /// Spatial dimensions (dim[1..=3]) with missing dimensions counted as 1.
    pub fn spatial_shape(&self) -> [usize; 3] {
        let mut shape = [1usize; 3];
        for d in 0..3 {
            if (d as i16) < self.dim[0] {
                shape[d] = self.dim[d + 1].max(1) as usize;
            }
        }
        shape
    }


    /// Number of frames: all dimensions beyond the third are folded into one axis.
    pub fn num_frames(&self) -> usize {
        let mut frames = 1usize;
        for d in 4..=(self.dim[0] as usize) {
            frames *= self.dim[d].max(1) as usize;
        }
        frames
    }


    /// The voxel-to-RASMM affine: sform if set, else qform, else pixdim scaling.
    pub fn affine(&self) -> Affine {
        if self.sform_code > 0 {
            let mut rows = [[0.0, 0.0, 0.0, 1.0]; 4];
            for c in 0..4 {
                rows[0][c] = self.srow_x[c] as f64;
                rows[1][c] = self.srow_y[c] as f64;
                rows[2][c] = self.srow_z[c] as f64;
            }
            rows[3] = [0.0, 0.0, 0.0, 1.0];
            return Affine::from_rows(rows);
        }
        if self.qform_code >= XFORM_SCANNER_ANAT {
            return self.qform_affine();
        }
        let mut rows = [[0.0; 4]; 4];
        for d in 0..3 {
            rows[d][d] = self.pixdim[d + 1] as f64;
        }
        rows[3][3] = 1.0;
        Affine::from_rows(rows)
    }


    fn qform_affine(&self) -> Affine {
        let b = self.quatern[0] as f64;
        let c = self.quatern[1] as f64;
        let d = self.quatern[2] as f64;
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let rot = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - b * b - c * c],
        ];
        let zooms = [self.pixdim[1] as f64, self.pixdim[2] as f64, qfac * self.pixdim[3] as f64];
        let mut rows = [[0.0; 4]; 4];
        for r in 0..3 {
            for col in 0..3 {
                rows[r][col] = rot[r][col] * zooms[col];
            }
            rows[r][3] = self.qoffset[r] as f64;
        }
        rows[3][3] = 1.0;
        Affine::from_rows(rows)
    }


    /// Write the 348 header bytes plus an empty 4 byte extension block, little-endian.
    pub fn to_writer<W>(&self, output: &mut W) -> Result<()>
    where
        W: Write,
    {
        let mut output = ByteOrdered::le(output);
        output.write_i32(NIFTI1_HEADER_SIZE)?;
        output.write_all(&[0u8; 36])?;
        for idx in 0..8 { output.write_i16(self.dim[idx])?; }
        for _ in 0..3 { output.write_f32(0.0)?; }
        output.write_i16(self.intent_code)?;
        output.write_i16(self.datatype)?;
        output.write_i16(self.bitpix)?;
        output.write_i16(0)?;
        for idx in 0..8 { output.write_f32(self.pixdim[idx])?; }
        output.write_f32(NIFTI1_DEFAULT_VOX_OFFSET)?;
        output.write_f32(self.scl_slope)?;
        output.write_f32(self.scl_inter)?;
        output.write_i16(0)?;
        output.write_u8(0)?;
        output.write_u8(self.xyzt_units)?;
        output.write_all(&[0u8; 24])?;
        write_fixed_length_string(&mut output, &self.descrip, 80)?;
        write_fixed_length_string(&mut output, "", 24)?;
        output.write_i16(self.qform_code)?;
        output.write_i16(self.sform_code)?;
        for idx in 0..3 { output.write_f32(self.quatern[idx])?; }
        for idx in 0..3 { output.write_f32(self.qoffset[idx])?; }
        for idx in 0..4 { output.write_f32(self.srow_x[idx])?; }
        for idx in 0..4 { output.write_f32(self.srow_y[idx])?; }
        for idx in 0..4 { output.write_f32(self.srow_z[idx])?; }
        write_fixed_length_string(&mut output, "", 16)?;
        write_fixed_length_string(&mut output, NIFTI1_MAGIC_SINGLE_FILE, 4)?;
        output.write_all(&[0u8; 4])?;
        Ok(())
    }
}


/// Decode the sample data following a header. The input must be positioned directly behind the header bytes.
fn data_from_reader<S>(input: &mut S, hdr: &NiftiHeader) -> Result<Array4<f32>>
where
    S: Read,
{
    let mut input = ByteOrdered::runtime(input, hdr.endianness);

    // This is only read because we cannot seek in a GZ stream.
    let gap = hdr.vox_offset as usize - NIFTI1_HEADER_SIZE as usize;
    let mut skipped: Vec<u8> = vec![0; gap];
    input.read_exact(&mut skipped)?;

    let shape = hdr.spatial_shape();
    let frames = hdr.num_frames();
    let num_values = shape[0] * shape[1] * shape[2] * frames;

    let mut values: Vec<f32> = Vec::with_capacity(num_values);
    for _ in 0..num_values {
        let v = match hdr.datatype {
            DT_UINT8 => input.read_u8()? as f32,
            DT_INT8 => input.read_i8()? as f32,
            DT_INT16 => input.read_i16()? as f32,
            DT_UINT16 => input.read_u16()? as f32,
            DT_INT32 => input.read_i32()? as f32,
            DT_UINT32 => input.read_u32()? as f32,
            DT_FLOAT32 => input.read_f32()?,
            DT_FLOAT64 => input.read_f64()? as f32,
            other => return Err(RegistrationError::UnsupportedNiftiDatatype(other)),
        };
        values.push(v);
    }

    if hdr.scl_slope != 0.0 && (hdr.scl_slope != 1.0 || hdr.scl_inter != 0.0) {
        for v in values.iter_mut() {
            *v = *v * hdr.scl_slope + hdr.scl_inter;
        }
    }

    // NIfTI stores the first axis fastest, i.e. in Fortran order.
    let data = Array::from_shape_vec((shape[0], shape[1], shape[2], frames).f(), values)
        .map_err(|e| RegistrationError::InvalidNiftiFormat(e.to_string()))?;
    Ok(data)
}


fn volume_kind(hdr: &NiftiHeader) -> VolumeKind {
    match hdr.datatype {
        DT_UINT8 => VolumeKind::Mask,
        DT_INT8 | DT_INT16 | DT_UINT16 | DT_INT32 | DT_UINT32 => VolumeKind::Label,
        _ => VolumeKind::Scalar,
    }
}


/// Read a volume from the given byte stream, which must be at the start of the header.
pub fn volume_from_reader<S>(input: &mut S) -> Result<Volume>
where
    S: Read,
{
    let hdr = NiftiHeader::from_reader(input)?;
    let data = data_from_reader(input, &hdr)?;
    let mut kind = volume_kind(&hdr);
    if kind == VolumeKind::Mask && data.iter().any(|v| *v > 1.0) {
        kind = VolumeKind::Label;
    }
    Ok(Volume::from_frames(data, hdr.affine(), kind))
}


/// Write a volume, header and samples, to the given byte stream.
pub fn volume_to_writer<W>(output: &mut W, volume: &Volume) -> Result<()>
where
    W: Write,
{
    let hdr = NiftiHeader::for_volume(volume);
    hdr.to_writer(output)?;

    let mut output = ByteOrdered::le(output);
    let shape = volume.shape();
    for t in 0..volume.frames() {
        for z in 0..shape[2] {
            for y in 0..shape[1] {
                for x in 0..shape[0] {
                    let v = volume.data[[x, y, z, t]];
                    match volume.kind {
                        VolumeKind::Mask => output.write_u8(if v != 0.0 { 1 } else { 0 })?,
                        VolumeKind::Label => output.write_i32(v.round() as i32)?,
                        VolumeKind::Scalar => output.write_f32(v)?,
                    }
                }
            }
        }
    }
    Ok(())
}


/// Read a NIfTI-1 file.
///
/// If the file's name ends with ".gz", the file is assumed to need GZip decoding.
/// Integer datatypes are read as [`VolumeKind::Label`], `uint8` volumes holding only 0 and 1 as
/// [`VolumeKind::Mask`], and floating point datatypes as [`VolumeKind::Scalar`].
///
/// # Examples
///
/// ```no_run
/// let vol = tractreg::read_nifti("/path/to/sub-01/anat/t1w_brain.nii.gz").unwrap();
/// println!("Voxel size: {} mm", vol.vox_size());
/// ```
pub fn read_nifti<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let gz = is_gz_file(&path);
    let mut file = BufReader::new(File::open(path)?);
    if gz {
        volume_from_reader(&mut GzDecoder::new(file))
    } else {
        volume_from_reader(&mut file)
    }
}


/// Read only the voxel grid of a NIfTI-1 file, without decoding the samples.
pub fn read_nifti_grid<P: AsRef<Path>>(path: P) -> Result<Grid> {
    let hdr = NiftiHeader::from_file(path)?;
    Ok(Grid::new(hdr.spatial_shape(), hdr.affine()))
}


/// Write a NIfTI-1 file, gzip-compressed if the file's name ends with ".gz".
pub fn write_nifti<P: AsRef<Path>>(path: P, volume: &Volume) -> Result<()> {
    let gz = is_gz_file(&path);
    let file = BufWriter::new(File::create(path)?);
    if gz {
        let mut encoder = GzEncoder::new(file, Compression::default());
        volume_to_writer(&mut encoder, volume)?;
        encoder.finish()?.flush()?;
    } else {
        let mut file = file;
        volume_to_writer(&mut file, volume)?;
        file.flush()?;
    }
    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn labels() -> Volume {
        let data = Array3::from_shape_fn((3, 4, 5), |(i, j, k)| ((i * 20 + j * 5 + k) % 7) as f32);
        let affine = Affine::from_rows([
            [-2.0, 0.0, 0.0, 90.0],
            [0.0, 2.0, 0.0, -126.0],
            [0.0, 0.0, 2.0, -72.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        Volume::new(data, affine, VolumeKind::Label)
    }

    #[test]
    fn label_volumes_survive_a_compressed_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("atlas.nii.gz");
        let vol = labels();
        write_nifti(&path, &vol).unwrap();

        let hdr = NiftiHeader::from_file(&path).unwrap();
        assert_eq!(DT_INT32, hdr.datatype);
        assert_eq!([3, 4, 5], hdr.spatial_shape());
        assert_eq!(1, hdr.num_frames());

        let back = read_nifti(&path).unwrap();
        assert_eq!(VolumeKind::Label, back.kind);
        assert_eq!(vol.data, back.data);
        assert!(vol.affine().is_close(back.affine(), 1e-5));
    }

    #[test]
    fn multi_frame_scalar_volumes_keep_their_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("warp.nii");
        let data = Array4::from_shape_fn((2, 3, 4, 3), |(i, j, k, t)| (i + 2 * j + 3 * k) as f32 * 0.5 - t as f32);
        let vol = Volume::from_frames(data, Affine::scaling(1.5), VolumeKind::Scalar);
        write_nifti(&path, &vol).unwrap();

        let back = read_nifti(&path).unwrap();
        assert_eq!(3, back.frames());
        assert_eq!(vol.data, back.data);
        assert_eq!(1.5, back.vox_size());
    }

    #[test]
    fn masks_are_stored_as_uint8() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mask.nii");
        let mask = labels().binarize(3.0);
        write_nifti(&path, &mask).unwrap();
        let back = read_nifti(&path).unwrap();
        assert_eq!(VolumeKind::Mask, back.kind);
        assert_eq!(mask.data, back.data);
        assert_eq!(348 + 4 + 3 * 4 * 5, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn garbage_is_not_a_nifti_header() {
        let bytes = vec![7u8; 400];
        assert!(NiftiHeader::from_reader(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn qform_is_used_without_sform() {
        let mut hdr = NiftiHeader::default();
        hdr.dim = [3, 2, 2, 2, 1, 1, 1, 1];
        hdr.qform_code = 1;
        hdr.pixdim = [1.0, 2.0, 2.0, 3.0, 1.0, 1.0, 1.0, 1.0];
        hdr.qoffset = [10.0, 20.0, 30.0];
        let affine = hdr.affine();
        assert!(affine.is_close(
            &Affine::from_rows([
                [2.0, 0.0, 0.0, 10.0],
                [0.0, 2.0, 0.0, 20.0],
                [0.0, 0.0, 3.0, 30.0],
                [0.0, 0.0, 0.0, 1.0],
            ]),
            1e-9
        ));
    }
}

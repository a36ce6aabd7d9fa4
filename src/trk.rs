//! Functions for reading and writing TrackVis '.trk' streamline files.
//!
//! Points are stored on disk in 'voxmm' coordinates: voxel coordinates scaled by the voxel
//! size, with the origin at the corner of the first voxel. In memory, streamlines are kept in
//! RASMM world coordinates, converted with the header's `vox_to_ras` matrix.

use byteordered::{ByteOrdered, Endianness};
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::affine::Affine;
use crate::error::{RegistrationError, Result};
use crate::streamline::{CoordinateSpace, Origin, Streamline, StreamlineSet};
use crate::util::{is_gz_file, read_fixed_length_string, write_fixed_length_string};
use crate::volume::Grid;

pub const TRK_HEADER_SIZE: i32 = 1000;
pub const TRK_MAGIC: &str = "TRACK";

/// The header of a TrackVis file.
#[derive(Debug, Clone, PartialEq)]
pub struct TrkHeader {
    pub dim: [i16; 3],
    pub voxel_size: [f32; 3],
    pub origin: [f32; 3],
    pub n_scalars: i16,
    pub n_properties: i16,
    /// Voxel to RASMM affine of the reference volume. All zeros in files predating version 2.
    pub vox_to_ras: [[f32; 4]; 4],
    pub voxel_order: String,
    /// Number of streamlines, `0` if unknown.
    pub n_count: i32,
    pub version: i32,
    pub endianness: Endianness,
}

impl Default for TrkHeader {
    fn default() -> TrkHeader {
        TrkHeader {
            dim: [1; 3],
            voxel_size: [1.0; 3],
            origin: [0.0; 3],
            n_scalars: 0,
            n_properties: 0,
            vox_to_ras: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
            voxel_order: String::from("RAS"),
            n_count: 0,
            version: 2,
            endianness: Endianness::Little,
        }
    }
}

impl TrkHeader {

    /// A header referencing the given voxel grid.
    pub fn for_grid(grid: &Grid) -> TrkHeader {
        let scales = grid.affine.column_scales();
        let rows = grid.affine.rows();
        let mut vox_to_ras = [[0.0f32; 4]; 4];
        for r in 0..4 {
            for c in 0..4 {
                vox_to_ras[r][c] = rows[r][c] as f32;
            }
        }
        TrkHeader {
            dim: [grid.shape[0] as i16, grid.shape[1] as i16, grid.shape[2] as i16],
            voxel_size: [scales[0] as f32, scales[1] as f32, scales[2] as f32],
            vox_to_ras,
            ..TrkHeader::default()
        }
    }


    /// Read a TrackVis header from the given byte stream.
    /// It is assumed that the input is currently at the start of the header. After this call,
    /// the input is positioned at the first streamline.
    pub fn from_reader<S>(input: &mut S) -> Result<TrkHeader>
    where
        S: Read,
    {
        let mut raw = [0u8; TRK_HEADER_SIZE as usize];
        input.read_exact(&mut raw)?;

        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&raw[996..1000]);
        let endianness = if i32::from_le_bytes(size_bytes) == TRK_HEADER_SIZE {
            Endianness::Little
        } else if i32::from_be_bytes(size_bytes) == TRK_HEADER_SIZE {
            Endianness::Big
        } else {
            return Err(RegistrationError::InvalidTrkFormat(String::from("hdr_size is not 1000")));
        };

        let mut hdr = TrkHeader::default();
        hdr.endianness = endianness;
        let mut input = ByteOrdered::runtime(&raw[..], endianness);

        let magic = read_fixed_length_string(&mut input, 6)?;
        if magic != TRK_MAGIC {
            return Err(RegistrationError::InvalidTrkFormat(format!("unsupported magic '{}'", magic)));
        }
        for idx in 0..3 { hdr.dim[idx] = input.read_i16()?; }
        for idx in 0..3 { hdr.voxel_size[idx] = input.read_f32()?; }
        for idx in 0..3 { hdr.origin[idx] = input.read_f32()?; }
        hdr.n_scalars = input.read_i16()?;
        read_fixed_length_string(&mut input, 200)?; // scalar_name
        hdr.n_properties = input.read_i16()?;
        read_fixed_length_string(&mut input, 200)?; // property_name
        for r in 0..4 {
            for c in 0..4 {
                hdr.vox_to_ras[r][c] = input.read_f32()?;
            }
        }
        read_fixed_length_string(&mut input, 444)?; // reserved
        hdr.voxel_order = read_fixed_length_string(&mut input, 4)?;
        // pad2, image_orientation_patient, pad1, invert and swap flags
        let mut skipped = [0u8; 36];
        input.read_exact(&mut skipped)?;
        hdr.n_count = input.read_i32()?;
        hdr.version = input.read_i32()?;

        if hdr.n_scalars < 0 || hdr.n_properties < 0 {
            return Err(RegistrationError::InvalidTrkFormat(String::from("negative scalar or property count")));
        }
        Ok(hdr)
    }


    /// Write the 1000 header bytes, little-endian.
    pub fn to_writer<W>(&self, output: &mut W) -> Result<()>
    where
        W: Write,
    {
        let mut output = ByteOrdered::le(output);
        write_fixed_length_string(&mut output, TRK_MAGIC, 6)?;
        for idx in 0..3 { output.write_i16(self.dim[idx])?; }
        for idx in 0..3 { output.write_f32(self.voxel_size[idx])?; }
        for idx in 0..3 { output.write_f32(self.origin[idx])?; }
        output.write_i16(0)?;
        write_fixed_length_string(&mut output, "", 200)?;
        output.write_i16(0)?;
        write_fixed_length_string(&mut output, "", 200)?;
        for r in 0..4 {
            for c in 0..4 {
                output.write_f32(self.vox_to_ras[r][c])?;
            }
        }
        write_fixed_length_string(&mut output, "", 444)?;
        write_fixed_length_string(&mut output, &self.voxel_order, 4)?;
        output.write_all(&[0u8; 36])?;
        output.write_i32(self.n_count)?;
        output.write_i32(self.version)?;
        output.write_i32(TRK_HEADER_SIZE)?;
        Ok(())
    }


    /// The voxel to RASMM affine, falling back to a plain voxel size scaling for old files.
    pub fn affine(&self) -> Affine {
        let mut rows = [[0.0f64; 4]; 4];
        for r in 0..4 {
            for c in 0..4 {
                rows[r][c] = self.vox_to_ras[r][c] as f64;
            }
        }
        if rows[3][3] == 0.0 {
            let mut scaling = [[0.0f64; 4]; 4];
            for d in 0..3 {
                scaling[d][d] = self.voxel_size[d] as f64;
            }
            scaling[3][3] = 1.0;
            return Affine::from_rows(scaling);
        }
        Affine::from_rows(rows)
    }


    /// Maps voxmm coordinates to RASMM: scale to voxels, shift the corner origin to the voxel centre, apply `vox_to_ras`.
    pub fn voxmm_to_rasmm(&self) -> Affine {
        let mut scale = [[0.0f64; 4]; 4];
        for d in 0..3 {
            let size = if self.voxel_size[d] > 0.0 { self.voxel_size[d] as f64 } else { 1.0 };
            scale[d][d] = 1.0 / size;
            scale[d][3] = -0.5;
        }
        scale[3][3] = 1.0;
        Affine::from_rows(scale).then(&self.affine())
    }


    /// The grid of the reference volume.
    pub fn grid(&self) -> Grid {
        let shape = [self.dim[0].max(1) as usize, self.dim[1].max(1) as usize, self.dim[2].max(1) as usize];
        Grid::new(shape, self.affine())
    }
}


/// Read streamlines following a header, converting them to RASMM.
pub fn streamlines_from_reader<S>(input: &mut S, hdr: &TrkHeader) -> Result<StreamlineSet>
where
    S: Read,
{
    let to_rasmm = hdr.voxmm_to_rasmm();
    let mut input = ByteOrdered::runtime(input, hdr.endianness);
    let n_scalars = hdr.n_scalars as usize;
    let n_properties = hdr.n_properties as usize;
    let mut streamlines: Vec<Streamline> = Vec::new();

    loop {
        // End of file is only valid between streamlines.
        let mut count = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            let n = input.read(&mut count[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        if filled < 4 {
            return Err(RegistrationError::InvalidTrkFormat(String::from("truncated streamline")));
        }
        let num_points = match hdr.endianness {
            Endianness::Little => i32::from_le_bytes(count),
            Endianness::Big => i32::from_be_bytes(count),
        };
        if num_points < 0 {
            return Err(RegistrationError::InvalidTrkFormat(format!("negative point count {}", num_points)));
        }

        let mut points = Vec::with_capacity(num_points as usize);
        for _ in 0..num_points {
            let mut voxmm = [0.0f64; 3];
            for d in 0..3 {
                voxmm[d] = input.read_f32()? as f64;
            }
            for _ in 0..n_scalars {
                input.read_f32()?;
            }
            points.push(to_rasmm.apply(voxmm));
        }
        for _ in 0..n_properties {
            input.read_f32()?;
        }
        streamlines.push(points);

        if hdr.n_count > 0 && streamlines.len() == hdr.n_count as usize {
            break;
        }
    }
    Ok(StreamlineSet::new(streamlines, CoordinateSpace::Rasmm, Origin::Center))
}


/// Write a header and RASMM streamlines to the given byte stream.
pub fn streamlines_to_writer<W>(output: &mut W, hdr: &TrkHeader, streamlines: &StreamlineSet) -> Result<()>
where
    W: Write,
{
    if streamlines.space != CoordinateSpace::Rasmm {
        return Err(RegistrationError::InvalidTrkFormat(String::from("only RASMM streamlines can be written")));
    }
    let mut hdr = hdr.clone();
    hdr.n_scalars = 0;
    hdr.n_properties = 0;
    hdr.n_count = streamlines.len() as i32;
    hdr.to_writer(output)?;

    let to_voxmm = hdr.voxmm_to_rasmm().inverse()?;
    let mut output = ByteOrdered::le(output);
    for sl in streamlines.iter() {
        output.write_i32(sl.len() as i32)?;
        for p in sl {
            let v = to_voxmm.apply(*p);
            for d in 0..3 {
                output.write_f32(v[d] as f32)?;
            }
        }
    }
    Ok(())
}


/// Read a TrackVis file. Streamlines are returned in RASMM.
///
/// If the file's name ends with ".gz", the file is assumed to need GZip decoding.
pub fn read_trk<P: AsRef<Path>>(path: P) -> Result<(TrkHeader, StreamlineSet)> {
    let gz = is_gz_file(&path);
    let mut file = BufReader::new(File::open(path)?);
    if gz {
        let mut decoder = GzDecoder::new(file);
        let hdr = TrkHeader::from_reader(&mut decoder)?;
        let streamlines = streamlines_from_reader(&mut decoder, &hdr)?;
        Ok((hdr, streamlines))
    } else {
        let hdr = TrkHeader::from_reader(&mut file)?;
        let streamlines = streamlines_from_reader(&mut file, &hdr)?;
        Ok((hdr, streamlines))
    }
}


/// Write RASMM streamlines to a TrackVis file, gzip-compressed if the file's name ends with ".gz".
pub fn write_trk<P: AsRef<Path>>(path: P, hdr: &TrkHeader, streamlines: &StreamlineSet) -> Result<()> {
    let gz = is_gz_file(&path);
    let file = BufWriter::new(File::create(path)?);
    if gz {
        let mut encoder = GzEncoder::new(file, Compression::default());
        streamlines_to_writer(&mut encoder, hdr, streamlines)?;
        encoder.finish()?.flush()?;
    } else {
        let mut file = file;
        streamlines_to_writer(&mut file, hdr, streamlines)?;
        file.flush()?;
    }
    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn header() -> TrkHeader {
        let mut rows = [[0.0; 4]; 4];
        rows[0] = [2.0, 0.0, 0.0, -90.0];
        rows[1] = [0.0, 2.0, 0.0, -126.0];
        rows[2] = [0.0, 0.0, 2.0, -72.0];
        rows[3] = [0.0, 0.0, 0.0, 1.0];
        TrkHeader::for_grid(&Grid::new([91, 109, 91], Affine::from_rows(rows)))
    }

    #[test]
    fn voxel_centres_map_to_the_reference_affine() {
        let hdr = header();
        // The centre of voxel (0, 0, 0) sits 1 mm from the corner.
        let p = hdr.voxmm_to_rasmm().apply([1.0, 1.0, 1.0]);
        assert_abs_diff_eq!(-90.0, p[0], epsilon = 1e-9);
        assert_abs_diff_eq!(-126.0, p[1], epsilon = 1e-9);
        assert_abs_diff_eq!(-72.0, p[2], epsilon = 1e-9);
    }

    #[test]
    fn streamlines_survive_a_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracks.trk");
        let set = StreamlineSet::new(
            vec![vec![[0.0, 0.0, 0.0], [1.5, -2.0, 4.0]], vec![[10.0, 12.0, -8.0]]],
            CoordinateSpace::Rasmm,
            Origin::Center,
        );
        write_trk(&path, &header(), &set).unwrap();
        assert_eq!(1000 + (4 + 2 * 12) + (4 + 12), std::fs::metadata(&path).unwrap().len());

        let (hdr, read) = read_trk(&path).unwrap();
        assert_eq!(2, hdr.n_count);
        assert_eq!([91, 109, 91], hdr.dim);
        assert_eq!(2, read.len());
        assert_abs_diff_eq!(-2.0, read.streamlines[0][1][1], epsilon = 1e-4);
        assert_abs_diff_eq!(-8.0, read.streamlines[1][0][2], epsilon = 1e-4);
    }

    #[test]
    fn big_endian_files_are_detected_from_the_header_size() {
        let mut buf: Vec<u8> = Vec::new();
        header().to_writer(&mut buf).unwrap();
        // The byte order is taken from hdr_size alone.
        buf[996..1000].copy_from_slice(&1000_i32.to_be_bytes());
        let hdr = TrkHeader::from_reader(&mut buf.as_slice()).unwrap();
        assert_eq!(Endianness::Big, hdr.endianness);

        buf[996..1000].copy_from_slice(&7_i32.to_le_bytes());
        assert!(TrkHeader::from_reader(&mut buf.as_slice()).is_err());
    }
}

//! Compressed array archives (`.npz`)
//!
//! The mosaicked cube is cached between runs as a zip of NPY members. Members
//! are written as little-endian float32; float64 members written by other
//! tools are read and narrowed.

use crate::types::{FuseError, FuseResult, RasterCube};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use regex::Regex;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Member name used for a single saved cube
pub const CUBE_MEMBER: &str = "arr_0";

/// Upper bound on the buffer reserved from a member's declared size
const MAX_PREALLOC: usize = 64 << 20;

impl From<zip::result::ZipError> for FuseError {
    fn from(err: zip::result::ZipError) -> Self {
        FuseError::Archive(err.to_string())
    }
}

/// Write named arrays to a deflated `.npz` archive
pub fn write_npz(path: &Path, members: &[(&str, ArrayViewD<'_, f32>)]) -> FuseResult<()> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, array) in members {
        zip.start_file(format!("{}.npy", name), options)?;
        zip.write_all(&encode_npy(array))?;
    }
    zip.finish()?;

    log::info!("Wrote {} arrays to {}", members.len(), path.display());
    Ok(())
}

/// Read every member of a `.npz` archive, in archive order
pub fn read_npz(path: &Path) -> FuseResult<Vec<(String, ArrayD<f32>)>> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut members = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().trim_end_matches(".npy").to_string();
        // Declared sizes come from the zip header and are not trusted
        let mut bytes = Vec::with_capacity(prealloc_len(entry.size()));
        entry.read_to_end(&mut bytes)?;
        let array = decode_npy(&bytes).map_err(|e| match e {
            FuseError::InvalidFormat(msg) => FuseError::InvalidFormat(format!("{}: {}", name, msg)),
            other => other,
        })?;
        members.push((name, array));
    }

    Ok(members)
}

fn prealloc_len(declared: u64) -> usize {
    usize::try_from(declared).map_or(MAX_PREALLOC, |n| n.min(MAX_PREALLOC))
}

/// Save a band-ordered cube as `arr_0`
pub fn save_cube(path: &Path, cube: &RasterCube) -> FuseResult<()> {
    write_npz(path, &[(CUBE_MEMBER, cube.view().into_dyn())])
}

/// Load the `arr_0` cube; a 2-D member becomes a single-band cube
pub fn load_cube(path: &Path) -> FuseResult<RasterCube> {
    let (_, array) = read_npz(path)?
        .into_iter()
        .find(|(name, _)| name == CUBE_MEMBER)
        .ok_or_else(|| FuseError::Archive(format!("No {} member in {}", CUBE_MEMBER, path.display())))?;

    let array = match array.ndim() {
        2 => array.insert_axis(ndarray::Axis(0)),
        3 => array,
        n => {
            return Err(FuseError::InvalidFormat(format!(
                "Expected a 2-D or 3-D cube, found {} dimensions",
                n
            )))
        }
    };
    array
        .into_dimensionality::<ndarray::Ix3>()
        .map_err(|e| FuseError::InvalidFormat(e.to_string()))
}

fn encode_npy(array: &ArrayViewD<'_, f32>) -> Vec<u8> {
    let shape = match array.shape() {
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': {}, }}", shape);

    // Magic, version and length take 10 bytes; the header ends in '\n' on a 64-byte boundary
    let unpadded = NPY_MAGIC.len() + 4 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut bytes = Vec::with_capacity(10 + header.len() + array.len() * 4);
    bytes.extend_from_slice(NPY_MAGIC);
    bytes.extend_from_slice(&[1, 0]);
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    // Logical (C) order regardless of memory layout
    for value in array.iter() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_npy(bytes: &[u8]) -> FuseResult<ArrayD<f32>> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(FuseError::InvalidFormat("missing NPY magic".to_string()));
    }

    let (header_len, offset) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 if bytes.len() >= 12 => (
            u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
            12,
        ),
        v => return Err(FuseError::InvalidFormat(format!("unsupported NPY version {}", v))),
    };
    let data_start = offset + header_len;
    if bytes.len() < data_start {
        return Err(FuseError::InvalidFormat("truncated NPY header".to_string()));
    }
    let header = std::str::from_utf8(&bytes[offset..data_start])
        .map_err(|e| FuseError::InvalidFormat(format!("NPY header is not text: {}", e)))?;

    let descr = header_field(header, r"'descr':\s*'([^']*)'")?;
    if header_field(header, r"'fortran_order':\s*(True|False)")? == "True" {
        return Err(FuseError::InvalidFormat("Fortran-ordered arrays are not supported".to_string()));
    }
    let shape = header_field(header, r"'shape':\s*\(([^)]*)\)")?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| FuseError::InvalidFormat(format!("bad shape entry '{}': {}", s, e)))
        })
        .collect::<FuseResult<Vec<_>>>()?;

    let data = &bytes[data_start..];
    let values: Vec<f32> = match descr.as_str() {
        "<f4" => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        "<f8" => data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        other => return Err(FuseError::InvalidFormat(format!("unsupported dtype {}", other))),
    };

    ArrayD::from_shape_vec(IxDyn(&shape), values)
        .map_err(|e| FuseError::InvalidFormat(format!("data does not match shape {:?}: {}", shape, e)))
}

fn header_field(header: &str, pattern: &str) -> FuseResult<String> {
    let re = Regex::new(pattern).map_err(|e| FuseError::Processing(e.to_string()))?;
    re.captures(header)
        .map(|c| c[1].to_string())
        .ok_or_else(|| FuseError::InvalidFormat(format!("NPY header lacks {}", pattern)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_cube_survives_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cube.npz");
        let mut cube = Array3::from_shape_fn((3, 4, 5), |(b, r, c)| (b * 100 + r * 10 + c) as f32);
        cube[[1, 2, 3]] = f32::NAN;

        save_cube(&path, &cube).unwrap();
        let loaded = load_cube(&path).unwrap();

        assert_eq!(loaded.dim(), (3, 4, 5));
        assert_eq!(loaded[[2, 3, 4]], 234.0);
        assert!(loaded[[1, 2, 3]].is_nan());
    }

    #[test]
    fn test_declared_member_size_is_capped() {
        assert_eq!(prealloc_len(1024), 1024);
        assert_eq!(prealloc_len(u64::MAX), MAX_PREALLOC);
        assert_eq!(prealloc_len(MAX_PREALLOC as u64 + 1), MAX_PREALLOC);
    }

    #[test]
    fn test_header_is_aligned() {
        let cube = Array3::<f32>::zeros((2, 2, 2));
        let bytes = encode_npy(&cube.view().into_dyn());
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
    }

    #[test]
    fn test_float64_member_is_narrowed() {
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (2,), }\n";
        let mut bytes = NPY_MAGIC.to_vec();
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&1.5f64.to_le_bytes());
        bytes.extend_from_slice(&(-2.0f64).to_le_bytes());

        let array = decode_npy(&bytes).unwrap();
        assert_eq!(array.shape(), &[2]);
        assert_eq!(array[[1]], -2.0);
    }

    #[test]
    fn test_unsupported_dtype_rejected() {
        let header = "{'descr': '<i2', 'fortran_order': False, 'shape': (1,), }\n";
        let mut bytes = NPY_MAGIC.to_vec();
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(decode_npy(&bytes), Err(FuseError::InvalidFormat(_))));
    }
}

//! Deflate/inflate of typed record buffers.
//!
//! Methylome payloads may be stored deflated on disk; this adapter moves
//! between `Pod` record slices and raw zlib streams with explicit errors.

use std::io::{Read, Write};

use bytemuck::Pod;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("deflate failed: {0}")]
    Deflate(std::io::Error),

    #[error("inflate failed: {0}")]
    Inflate(std::io::Error),

    #[error("inflated size {got} bytes does not match expected {expected}")]
    SizeMismatch { got: usize, expected: usize },
}

/// Deflate a slice of records into a zlib byte stream.
pub fn deflate<T: Pod>(records: &[T]) -> Result<Vec<u8>, CompressError> {
    let bytes: &[u8] = bytemuck::cast_slice(records);
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes).map_err(CompressError::Deflate)?;
    encoder.finish().map_err(CompressError::Deflate)
}

/// Inflate a zlib byte stream into exactly `n_records` records.
///
/// The expected record count comes from metadata; a stream that inflates
/// to any other size is corrupt.
pub fn inflate<T: Pod>(bytes: &[u8], n_records: usize) -> Result<Vec<T>, CompressError> {
    let expected = n_records * std::mem::size_of::<T>();
    let mut raw = Vec::with_capacity(expected);
    let mut decoder = ZlibDecoder::new(bytes);
    decoder
        .read_to_end(&mut raw)
        .map_err(CompressError::Inflate)?;
    if raw.len() != expected {
        return Err(CompressError::SizeMismatch {
            got: raw.len(),
            expected,
        });
    }
    let mut records = vec![T::zeroed(); n_records];
    bytemuck::cast_slice_mut::<T, u8>(&mut records).copy_from_slice(&raw);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_u32_records() {
        let records: Vec<u32> = (0..1000).map(|i| i * 7 + 3).collect();
        let packed = deflate(&records).unwrap();
        assert!(packed.len() < records.len() * 4);
        let unpacked: Vec<u32> = inflate(&packed, records.len()).unwrap();
        assert_eq!(records, unpacked);
    }

    #[test]
    fn roundtrip_empty() {
        let records: Vec<u32> = Vec::new();
        let packed = deflate(&records).unwrap();
        let unpacked: Vec<u32> = inflate(&packed, 0).unwrap();
        assert!(unpacked.is_empty());
    }

    #[test]
    fn wrong_record_count_is_an_error() {
        let records: Vec<u32> = vec![1, 2, 3, 4];
        let packed = deflate(&records).unwrap();
        let err = inflate::<u32>(&packed, 3).unwrap_err();
        assert!(matches!(err, CompressError::SizeMismatch { .. }));
    }

    #[test]
    fn garbage_input_is_an_error() {
        let err = inflate::<u32>(b"definitely not zlib", 4).unwrap_err();
        assert!(matches!(err, CompressError::Inflate(_)));
    }
}

/// --- Chunk Filter Pipeline ---
/// Byte-level filters applied to serialized chunks, in HDF5 order:
/// shuffle -> compress (zlib or zstd) -> fletcher32 checksum.
///
/// Every filter produces the same bytes as its zarr v3 counterpart
/// (`numcodecs.shuffle`, `numcodecs.zlib`, `zstd`, `numcodecs.fletcher32`), so
/// chunks written here decode through `zarrs` once referenced from a store.
use crate::{
    encoding::{ChunkEncoding, Compression},
    error::{ChunkStackError, Result},
};

use flate2::{read::ZlibDecoder, write::ZlibEncoder};
use std::io::{Read, Write};
use tracing::{error, trace};
use zstd::stream::{decode_all, encode_all};

const CHECKSUM_LEN: usize = 4;

/// Groups byte `j` of every element together so similar bytes sit next to each
/// other. Trailing bytes that do not form a whole element are kept as-is.
pub fn shuffle(bytes: &[u8], element_size: usize) -> Vec<u8> {
    if element_size <= 1 {
        return bytes.to_vec();
    }
    let count = bytes.len() / element_size;
    let mut out = vec![0u8; bytes.len()];
    for (i, element) in bytes.chunks_exact(element_size).enumerate() {
        for (j, byte) in element.iter().enumerate() {
            out[j * count + i] = *byte;
        }
    }
    let whole = count * element_size;
    out[whole..].copy_from_slice(&bytes[whole..]);
    out
}

pub fn unshuffle(bytes: &[u8], element_size: usize) -> Vec<u8> {
    if element_size <= 1 {
        return bytes.to_vec();
    }
    let count = bytes.len() / element_size;
    let mut out = vec![0u8; bytes.len()];
    for i in 0..count {
        for j in 0..element_size {
            out[i * element_size + j] = bytes[j * count + i];
        }
    }
    let whole = count * element_size;
    out[whole..].copy_from_slice(&bytes[whole..]);
    out
}

/// Fletcher-32 over big-endian 16-bit words, as HDF5 and numcodecs compute it.
/// An odd trailing byte counts as the high byte of a final word.
pub fn fletcher32(bytes: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    for word in bytes.chunks(2) {
        let value = match word {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from(*hi) << 8,
            _ => 0,
        };
        sum1 = (sum1 + u32::from(value)) % 65_535;
        sum2 = (sum2 + sum1) % 65_535;
    }
    (sum2 << 16) | sum1
}

fn compress_zlib(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::new(level));
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| ChunkStackError::CompressionError(format!("zlib: {}", e)))
}

fn decompress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| ChunkStackError::DecompressionError(format!("zlib: {}", e)))?;
    Ok(out)
}

fn compress_zstd(data: &[u8], level: i32) -> Result<Vec<u8>> {
    encode_all(data, level)
        .map_err(|e| ChunkStackError::CompressionError(format!("zstd: {}", e)))
}

fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    decode_all(data).map_err(|e| ChunkStackError::DecompressionError(format!("zstd: {}", e)))
}

/// Applies the byte filters of `encoding` to a serialized chunk.
pub fn encode_chunk(raw: Vec<u8>, encoding: &ChunkEncoding) -> Result<Vec<u8>> {
    let raw_len = raw.len();
    let mut bytes = if encoding.shuffle {
        shuffle(&raw, encoding.dtype.size())
    } else {
        raw
    };
    bytes = match encoding.compression {
        Some(Compression::Zlib { level }) => compress_zlib(&bytes, level)?,
        Some(Compression::Zstd { level }) => compress_zstd(&bytes, level)?,
        None => bytes,
    };
    if encoding.fletcher32 {
        let checksum = fletcher32(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
    }
    trace!(raw_len, stored_len = bytes.len(), "Encoded chunk");
    Ok(bytes)
}

/// Reverses [`encode_chunk`], verifying the checksum when present.
pub fn decode_chunk(stored: &[u8], encoding: &ChunkEncoding) -> Result<Vec<u8>> {
    let mut payload = stored;
    if encoding.fletcher32 {
        if stored.len() < CHECKSUM_LEN {
            return Err(ChunkStackError::DecompressionError(
                "chunk too short to hold a fletcher32 checksum".to_string(),
            ));
        }
        let (data, tail) = stored.split_at(stored.len() - CHECKSUM_LEN);
        let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let actual = fletcher32(data);
        if expected != actual {
            error!(expected, actual, "Fletcher32 checksum mismatch");
            return Err(ChunkStackError::DecompressionError(format!(
                "fletcher32 checksum mismatch: stored {:#010x}, computed {:#010x}",
                expected, actual
            )));
        }
        payload = data;
    }
    let bytes = match encoding.compression {
        Some(Compression::Zlib { .. }) => decompress_zlib(payload)?,
        Some(Compression::Zstd { .. }) => decompress_zstd(payload)?,
        None => payload.to_vec(),
    };
    Ok(if encoding.shuffle {
        unshuffle(&bytes, encoding.dtype.size())
    } else {
        bytes
    })
}

// Cache entry encoding
//
// Layout before compression: u32 LE header length, JSON header, f32 LE vector.
// One leading tag byte says whether the rest is raw or zstd.

use super::CacheError;
use serde::{Deserialize, Serialize};

const TAG_RAW: u8 = 0x00;
const TAG_ZSTD: u8 = 0x01;

/// Number of strided byte positions compared after a compression round trip
const SPOT_CHECK_SAMPLES: usize = 64;

/// A cached vector with its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub identity: String,
    pub vector: Vec<f32>,
    pub created_at: i64,
    pub model: String,
}

#[derive(Serialize, Deserialize)]
struct EntryHeader {
    identity: String,
    created_at: i64,
    model: String,
    dimension: usize,
}

/// Encoded payload ready for the backend
#[derive(Debug)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// Encode an entry, compressing it when that is both worthwhile and verified
pub fn encode(entry: &CacheEntry, compression_threshold: usize) -> Result<Encoded, CacheError> {
    let raw = serialize(entry)?;

    if raw.len() >= compression_threshold {
        match compress_verified(&raw) {
            Some(compressed) if compressed.len() < raw.len() => {
                let mut bytes = Vec::with_capacity(compressed.len() + 1);
                bytes.push(TAG_ZSTD);
                bytes.extend_from_slice(&compressed);
                return Ok(Encoded {
                    bytes,
                    compressed: true,
                });
            }
            Some(_) => {}
            None => {
                tracing::warn!(
                    "Compressed cache entry failed validation for {}, storing raw",
                    entry.identity
                );
            }
        }
    }

    let mut bytes = Vec::with_capacity(raw.len() + 1);
    bytes.push(TAG_RAW);
    bytes.extend_from_slice(&raw);
    Ok(Encoded {
        bytes,
        compressed: false,
    })
}

/// Decode a payload written by [`encode`], in either encoding
pub fn decode(bytes: &[u8]) -> Result<CacheEntry, CacheError> {
    let (tag, body) = bytes
        .split_first()
        .ok_or_else(|| CacheError::Corrupted("empty payload".to_string()))?;

    match *tag {
        TAG_RAW => deserialize(body),
        TAG_ZSTD => {
            let raw = zstd::decode_all(body)
                .map_err(|e| CacheError::Corrupted(format!("zstd: {}", e)))?;
            deserialize(&raw)
        }
        other => Err(CacheError::Corrupted(format!("unknown tag {:#04x}", other))),
    }
}

/// Compress and verify by decompressing our own output
fn compress_verified(raw: &[u8]) -> Option<Vec<u8>> {
    let compressed = zstd::encode_all(raw, 3).ok()?;
    let roundtrip = zstd::decode_all(&compressed[..]).ok()?;

    if spot_check(raw, &roundtrip) {
        Some(compressed)
    } else {
        None
    }
}

/// Compare lengths, both ends, and evenly strided samples
fn spot_check(original: &[u8], roundtrip: &[u8]) -> bool {
    if original.len() != roundtrip.len() {
        return false;
    }
    if original.is_empty() {
        return true;
    }

    let last = original.len() - 1;
    if original[0] != roundtrip[0] || original[last] != roundtrip[last] {
        return false;
    }

    let stride = (original.len() / SPOT_CHECK_SAMPLES).max(1);
    (0..original.len())
        .step_by(stride)
        .all(|i| original[i] == roundtrip[i])
}

fn serialize(entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
    let header = EntryHeader {
        identity: entry.identity.clone(),
        created_at: entry.created_at,
        model: entry.model.clone(),
        dimension: entry.vector.len(),
    };
    let header = serde_json::to_vec(&header).map_err(|e| CacheError::Codec(e.to_string()))?;

    let mut out = Vec::with_capacity(4 + header.len() + entry.vector.len() * 4);
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    for value in &entry.vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(out)
}

fn deserialize(raw: &[u8]) -> Result<CacheEntry, CacheError> {
    if raw.len() < 4 {
        return Err(CacheError::Corrupted("truncated header length".to_string()));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&raw[..4]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_end = 4usize
        .checked_add(header_len)
        .filter(|end| *end <= raw.len())
        .ok_or_else(|| CacheError::Corrupted("truncated header".to_string()))?;

    let header: EntryHeader = serde_json::from_slice(&raw[4..header_end])
        .map_err(|e| CacheError::Corrupted(format!("header: {}", e)))?;

    let body = &raw[header_end..];
    if body.len() != header.dimension * 4 {
        return Err(CacheError::Corrupted(format!(
            "vector body is {} bytes, expected {}",
            body.len(),
            header.dimension * 4
        )));
    }

    let vector = body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(CacheEntry {
        identity: header.identity,
        vector,
        created_at: header.created_at,
        model: header.model,
    })
}

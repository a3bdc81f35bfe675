//! Native tile payload codec
//!
//! Payload layout: a fixed little-endian header followed by an LZ4
//! block-compressed body holding the record plane and, when the model
//! carries view-dependent color, the SH plane. Format-specific decoders
//! (PLY, SPZ, ...) plug in behind the same [`TileDecoder`] trait.

use half::f16;

use crate::core::error::DecodeError;
use crate::splat::record::{ShPlane, SplatRecord, TileSplats, SPLAT_STRIDE};

pub const MAGIC: u32 = 0x544C5053; // 'SPLT'
pub const VERSION: u32 = 1;

/// Fixed header at the start of every tile payload
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct PayloadHeader {
    magic: u32,
    version: u32,
    count: u32,
    sh_degree: u8,
    flags: u8,
    reserved: [u8; 2],
}

const HEADER_SIZE: usize = std::mem::size_of::<PayloadHeader>();

/// Decodes raw tile bytes into splat records.
///
/// Implementations must be deterministic and side-effect-free: the same
/// bytes always produce the same records or the same error.
pub trait TileDecoder: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8]) -> Result<TileSplats, DecodeError>;
}

/// Built-in codec for the crate's native tile payload format
#[derive(Clone, Copy, Debug, Default)]
pub struct RawTileCodec;

impl RawTileCodec {
    /// Encode a decoded tile back into payload bytes (tooling and tests)
    pub fn encode(splats: &TileSplats) -> Vec<u8> {
        let sh_degree = splats.sh.as_ref().map_or(0, |p| p.degree);
        let header = PayloadHeader {
            magic: MAGIC,
            version: VERSION,
            count: splats.records.len() as u32,
            sh_degree,
            flags: 0,
            reserved: [0; 2],
        };

        let mut body = Vec::with_capacity(splats.byte_size());
        body.extend_from_slice(bytemuck::cast_slice(&splats.records));
        if let Some(sh) = &splats.sh {
            for coeff in &sh.coeffs {
                body.extend_from_slice(&coeff.to_le_bytes());
            }
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(&lz4_flex::compress_prepend_size(&body));
        out
    }
}

impl TileDecoder for RawTileCodec {
    fn decode(&self, bytes: &[u8]) -> Result<TileSplats, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let header: PayloadHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        if header.magic != MAGIC {
            return Err(DecodeError::BadMagic { found: header.magic });
        }
        if header.version != VERSION {
            return Err(DecodeError::UnsupportedVersion(header.version));
        }
        if header.sh_degree > 3 {
            return Err(DecodeError::InvalidShDegree(header.sh_degree));
        }

        let body = lz4_flex::decompress_size_prepended(&bytes[HEADER_SIZE..])
            .map_err(|e| DecodeError::Decompress(e.to_string()))?;

        let count = header.count as usize;
        let coeffs_per_splat = ShPlane::coeffs_per_splat(header.sh_degree);
        let record_bytes = count * SPLAT_STRIDE;
        let sh_bytes = count * coeffs_per_splat * 2;
        if body.len() != record_bytes + sh_bytes {
            return Err(DecodeError::CountMismatch {
                header: record_bytes + sh_bytes,
                plane: body.len(),
            });
        }

        // The decompressed buffer carries no alignment guarantee, so records
        // are read per-stride rather than cast in place.
        let mut records = Vec::with_capacity(count);
        for chunk in body[..record_bytes].chunks_exact(SPLAT_STRIDE) {
            records.push(bytemuck::pod_read_unaligned::<SplatRecord>(chunk));
        }

        let sh = if header.sh_degree > 0 {
            let mut coeffs = Vec::with_capacity(count * coeffs_per_splat);
            for pair in body[record_bytes..].chunks_exact(2) {
                coeffs.push(f16::from_le_bytes([pair[0], pair[1]]));
            }
            Some(ShPlane {
                degree: header.sh_degree,
                coeffs,
            })
        } else {
            None
        };

        let splats = TileSplats { records, sh };
        splats.validate()?;
        Ok(splats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_splats(count: usize, sh_degree: u8) -> TileSplats {
        let records = (0..count)
            .map(|i| SplatRecord {
                position: [i as f32, i as f32 * 2.0, -(i as f32)],
                scale: [0.1, 0.2, 0.3],
                rotation: [0.0, 0.0, 0.0, 1.0],
                color: [255, 128, (i % 256) as u8, 200],
                _pad: [0; 4],
            })
            .collect();

        let sh = (sh_degree > 0).then(|| ShPlane {
            degree: sh_degree,
            coeffs: (0..count * ShPlane::coeffs_per_splat(sh_degree))
                .map(|i| f16::from_f32(i as f32 * 0.01))
                .collect(),
        });

        TileSplats { records, sh }
    }

    #[test]
    fn test_encode_decode_preserves_records() {
        let splats = make_splats(33, 1);
        let bytes = RawTileCodec::encode(&splats);
        let decoded = RawTileCodec.decode(&bytes).expect("decode failed");

        assert_eq!(decoded, splats);
    }

    #[test]
    fn test_decode_without_sh_plane() {
        let splats = make_splats(7, 0);
        let bytes = RawTileCodec::encode(&splats);
        let decoded = RawTileCodec.decode(&bytes).expect("decode failed");

        assert_eq!(decoded.len(), 7);
        assert!(decoded.sh.is_none());
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = RawTileCodec::encode(&make_splats(4, 0));
        bytes[0] ^= 0xFF;

        assert!(matches!(
            RawTileCodec.decode(&bytes),
            Err(DecodeError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let bytes = RawTileCodec::encode(&make_splats(4, 0));

        assert!(matches!(
            RawTileCodec.decode(&bytes[..HEADER_SIZE - 3]),
            Err(DecodeError::Truncated { .. })
        ));
        // Header intact but body cut short fails in decompression
        assert!(RawTileCodec.decode(&bytes[..bytes.len() - 5]).is_err());
    }

    #[test]
    fn test_decode_rejects_count_mismatch() {
        let splats = make_splats(4, 0);
        let mut bytes = RawTileCodec::encode(&splats);
        // Claim one more record than the body holds
        bytes[8..12].copy_from_slice(&5u32.to_le_bytes());

        assert!(matches!(
            RawTileCodec.decode(&bytes),
            Err(DecodeError::CountMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = RawTileCodec::encode(&make_splats(2, 0));
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());

        assert!(matches!(
            RawTileCodec.decode(&bytes),
            Err(DecodeError::UnsupportedVersion(99))
        ));
    }
}

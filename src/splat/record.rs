//! Normalized splat records
//!
//! A decoded tile is a flat plane of fixed-stride records plus an optional
//! spherical-harmonics plane. The record keeps only what the sort/cull path
//! touches; SH coefficients stay in a separate f16 plane so the hot data
//! stays compact.

use bytemuck::{Pod, Zeroable};
use half::f16;

use crate::core::error::DecodeError;
use crate::core::types::Vec3;

/// One anisotropic Gaussian, fixed 48-byte stride.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SplatRecord {
    /// World-space center
    pub position: [f32; 3],
    /// Per-axis scale of the Gaussian
    pub scale: [f32; 3],
    /// Rotation quaternion (x, y, z, w)
    pub rotation: [f32; 4],
    /// RGB color + opacity, 8 bits each
    pub color: [u8; 4],
    pub _pad: [u8; 4],
}

/// Byte stride of one record in the resident buffer
pub const SPLAT_STRIDE: usize = std::mem::size_of::<SplatRecord>();

impl SplatRecord {
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

/// Spherical-harmonics plane for one tile.
///
/// Stores the view-dependent color coefficients beyond the DC term,
/// 3 channels per coefficient, row-major per splat.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShPlane {
    pub degree: u8,
    pub coeffs: Vec<f16>,
}

impl ShPlane {
    /// Number of f16 values per splat for a given SH degree (degree 0 keeps
    /// only the DC color, which lives in the record itself).
    pub fn coeffs_per_splat(degree: u8) -> usize {
        let bands = (degree as usize + 1) * (degree as usize + 1);
        3 * bands.saturating_sub(1)
    }
}

/// Decoded contents of one tile
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TileSplats {
    pub records: Vec<SplatRecord>,
    pub sh: Option<ShPlane>,
}

impl TileSplats {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Byte footprint once resident (records plus SH plane)
    pub fn byte_size(&self) -> usize {
        let sh_bytes = self.sh.as_ref().map_or(0, |p| p.coeffs.len() * 2);
        self.records.len() * SPLAT_STRIDE + sh_bytes
    }

    /// Check internal consistency: the SH plane, if present, must hold
    /// exactly `coeffs_per_splat(degree)` values per record.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if let Some(sh) = &self.sh {
            if sh.degree == 0 || sh.degree > 3 {
                return Err(DecodeError::InvalidShDegree(sh.degree));
            }
            let expected = self.records.len() * ShPlane::coeffs_per_splat(sh.degree);
            if sh.coeffs.len() != expected {
                return Err(DecodeError::CountMismatch {
                    header: expected,
                    plane: sh.coeffs.len(),
                });
            }
        }
        Ok(())
    }
}

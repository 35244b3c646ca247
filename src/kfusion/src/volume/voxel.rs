//! 32-bit voxel encoding.
//!
//! The low half holds the signed distance as an `i16` fraction of
//! [`DISTANCE_SCALE`]; the high half holds the weight as a `u16` count.

/// Distance quantization scale: stored = round(d * scale).
pub const DISTANCE_SCALE: f32 = 32766.0;

/// Decoded voxel contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voxel {
    /// Truncated signed distance in [-1, 1].
    pub distance: f32,
    /// Number of fused observations, capped at the configured maximum.
    pub weight: f32,
}

impl Voxel {
    /// State of a voxel that has never been observed.
    pub const EMPTY: Voxel = Voxel {
        distance: 1.0,
        weight: 0.0,
    };
}

/// Packed voxel as stored in the volume and uploaded to the device.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedVoxel(pub u32);

impl Default for PackedVoxel {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl PackedVoxel {
    /// Distance 1.0, weight 0.
    pub const EMPTY: PackedVoxel = PackedVoxel(DISTANCE_SCALE as u32);

    /// Quantize a distance to its stored integer, rounding half up.
    #[inline]
    pub fn quantize_distance(distance: f32) -> i16 {
        (distance.clamp(-1.0, 1.0) * DISTANCE_SCALE + 0.5).floor() as i16
    }

    #[inline]
    pub fn encode(voxel: Voxel) -> Self {
        let d = Self::quantize_distance(voxel.distance) as u16 as u32;
        let w = (voxel.weight.clamp(0.0, u16::MAX as f32) + 0.5).floor() as u32;
        PackedVoxel(d | (w << 16))
    }

    #[inline]
    pub fn distance(self) -> f32 {
        (self.0 & 0xFFFF) as u16 as i16 as f32 / DISTANCE_SCALE
    }

    #[inline]
    pub fn weight(self) -> f32 {
        (self.0 >> 16) as f32
    }

    #[inline]
    pub fn decode(self) -> Voxel {
        Voxel {
            distance: self.distance(),
            weight: self.weight(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_decodes_to_reset_state() {
        assert_eq!(PackedVoxel::EMPTY.decode(), Voxel::EMPTY);
        assert_eq!(PackedVoxel::encode(Voxel::EMPTY), PackedVoxel::EMPTY);
    }

    #[test]
    fn test_negative_distance_and_weight_share_word() {
        let v = PackedVoxel::encode(Voxel {
            distance: -0.25,
            weight: 42.0,
        });
        assert_relative_eq!(v.distance(), -0.25, epsilon = 1.0 / DISTANCE_SCALE);
        assert_eq!(v.weight(), 42.0);
    }

    #[test]
    fn test_distance_is_clamped() {
        let v = PackedVoxel::encode(Voxel {
            distance: -3.0,
            weight: 1.0,
        });
        assert_relative_eq!(v.distance(), -1.0);
    }

    #[test]
    fn test_requantizing_is_stable() {
        let d = 0.123_456_7;
        let once = PackedVoxel::quantize_distance(d);
        let twice = PackedVoxel::quantize_distance(once as f32 / DISTANCE_SCALE);
        assert_eq!(once, twice);
    }
}

use serde::{Deserialize, Serialize};

use crate::error::{invalid_config, TerrainResult};

/// User-tunable parameters of the density field and surface extraction
///
/// Equality is field-wise and drives regeneration: a chunk re-runs the
/// pipeline only when the settings it last generated with differ.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Spatial frequency applied to lattice coordinates
    pub scale: f32,
    /// Amplitude multiplier per octave
    pub persistence: f32,
    /// Frequency multiplier per octave
    pub lacunarity: f32,
    /// Number of fractal octaves; zero yields a constant field
    pub octaves: u32,
    /// Threshold separating inside from outside
    pub iso_level: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            scale: 0.151,
            persistence: 0.5,
            lacunarity: 2.0,
            octaves: 4,
            iso_level: 1.0,
        }
    }
}

impl GenerationSettings {
    /// Upper bounds offered by the interactive controls
    pub const MAX_SCALE: f32 = 5.0;
    pub const MAX_PERSISTENCE: f32 = 1.0;
    pub const MAX_LACUNARITY: f32 = 5.0;
    pub const MAX_OCTAVES: u32 = 10;
    pub const MAX_ISO_LEVEL: f32 = 2.0;

    /// Reject values outside the control ranges
    pub fn validate(&self) -> TerrainResult<()> {
        check_range("generation.scale", self.scale, Self::MAX_SCALE)?;
        check_range("generation.persistence", self.persistence, Self::MAX_PERSISTENCE)?;
        check_range("generation.lacunarity", self.lacunarity, Self::MAX_LACUNARITY)?;
        check_range("generation.iso_level", self.iso_level, Self::MAX_ISO_LEVEL)?;
        if self.octaves > Self::MAX_OCTAVES {
            return Err(invalid_config(
                "generation.octaves",
                format!("{} exceeds {}", self.octaves, Self::MAX_OCTAVES),
            ));
        }
        Ok(())
    }

    /// Clamp every field into the control ranges
    pub fn clamped(&self) -> Self {
        Self {
            scale: self.scale.clamp(0.0, Self::MAX_SCALE),
            persistence: self.persistence.clamp(0.0, Self::MAX_PERSISTENCE),
            lacunarity: self.lacunarity.clamp(0.0, Self::MAX_LACUNARITY),
            octaves: self.octaves.min(Self::MAX_OCTAVES),
            iso_level: self.iso_level.clamp(0.0, Self::MAX_ISO_LEVEL),
        }
    }
}

fn check_range(field: &str, value: f32, max: f32) -> TerrainResult<()> {
    if !value.is_finite() || value < 0.0 || value > max {
        return Err(invalid_config(field, format!("{} not in [0, {}]", value, max)));
    }
    Ok(())
}

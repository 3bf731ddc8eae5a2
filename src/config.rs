//! TOML configuration for terrain generation
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) gives a single 32^3 chunk with the standard generation settings.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{invalid_config, TerrainResult};
use crate::gpu::{BackendPreference, TransferMode};
use crate::terrain::{validate_point_count, CapacityPolicy, GenerationSettings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TerrainConfig {
    pub generation: GenerationSettings,
    pub chunks: ChunkConfig,
    pub transfer: TransferMode,
    pub device: DeviceConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Lattice points per chunk; must be a perfect cube
    pub point_count: u32,
    pub chunks_per_axis: u32,
    pub capacity: CapacityPolicy,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            point_count: 32 * 32 * 32,
            chunks_per_axis: 1,
            capacity: CapacityPolicy::Heuristic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendPreference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// PNG path for an offscreen snapshot; empty disables it
    pub snapshot: String,
    pub width: u32,
    pub height: u32,
    pub draw_points: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            snapshot: String::new(),
            width: 1280,
            height: 720,
            draw_points: false,
        }
    }
}

impl RenderConfig {
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        if self.snapshot.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.snapshot))
        }
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

impl TerrainConfig {
    pub fn from_toml_str(source: &str) -> TerrainResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> TerrainResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        log::info!("[TerrainConfig] Loaded {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> TerrainResult<()> {
        self.generation.validate()?;

        validate_point_count(self.chunks.point_count).map_err(|_| {
            invalid_config(
                "chunks.point_count",
                format!("{} is not a non-zero perfect cube", self.chunks.point_count),
            )
        })?;
        if self.chunks.chunks_per_axis == 0 {
            return Err(invalid_config("chunks.chunks_per_axis", "must be at least 1"));
        }

        if let TransferMode::Mapped { chunk_size: 0 } = self.transfer {
            return Err(invalid_config("transfer.chunk_size", "must be positive"));
        }

        if self.render.width == 0 || self.render.height == 0 {
            return Err(invalid_config(
                "render",
                format!("invalid size {}x{}", self.render.width, self.render.height),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TerrainError;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = TerrainConfig::from_toml_str("").unwrap();
        assert_eq!(config, TerrainConfig::default());
        assert_eq!(config.chunks.point_count, 32768);
        assert_eq!(config.transfer, TransferMode::Mapped { chunk_size: 1024 });
        assert_eq!(config.device.backend, BackendPreference::Auto);
        assert_eq!(config.render.snapshot_path(), None);
    }

    #[test]
    fn test_parse_all_sections() {
        let config = TerrainConfig::from_toml_str(
            r#"
            [generation]
            scale = 0.2
            octaves = 6
            iso_level = 0.9

            [chunks]
            point_count = 4096
            chunks_per_axis = 2
            capacity = "worst_case"

            [transfer]
            mode = "device_copy"

            [device]
            backend = "host"

            [render]
            snapshot = "terrain.png"
            draw_points = true
            "#,
        )
        .unwrap();

        assert_eq!(config.generation.scale, 0.2);
        assert_eq!(config.generation.octaves, 6);
        assert_eq!(config.generation.persistence, 0.5);
        assert_eq!(config.chunks.capacity, CapacityPolicy::WorstCase);
        assert_eq!(config.transfer, TransferMode::DeviceCopy);
        assert_eq!(config.device.backend, BackendPreference::Host);
        assert_eq!(config.render.snapshot_path(), Some(PathBuf::from("terrain.png")));
        assert_eq!(config.render.width, 1280);
    }

    #[test]
    fn test_mapped_transfer_and_fixed_capacity() {
        let config = TerrainConfig::from_toml_str(
            r#"
            [chunks]
            capacity = { fixed = 500 }

            [transfer]
            mode = "mapped"
            chunk_size = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.chunks.capacity, CapacityPolicy::Fixed(500));
        assert_eq!(config.transfer, TransferMode::Mapped { chunk_size: 64 });
    }

    #[test]
    fn test_invalid_values_rejected() {
        for source in [
            "[chunks]\npoint_count = 10",
            "[chunks]\npoint_count = 0",
            "[chunks]\nchunks_per_axis = 0",
            "[transfer]\nmode = \"mapped\"\nchunk_size = 0",
            "[generation]\noctaves = 12",
        ] {
            assert!(
                matches!(
                    TerrainConfig::from_toml_str(source),
                    Err(TerrainError::InvalidConfig { .. })
                ),
                "accepted: {source}"
            );
        }
        assert!(matches!(
            TerrainConfig::from_toml_str("[chunks]\npoint_count = \"many\""),
            Err(TerrainError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terrain.toml");
        std::fs::write(&path, "[generation]\niso_level = 1.2\n").unwrap();
        let config = TerrainConfig::load(&path).unwrap();
        assert_eq!(config.generation.iso_level, 1.2);

        assert!(matches!(
            TerrainConfig::load(dir.path().join("missing.toml")),
            Err(TerrainError::Io(_))
        ));
    }
}

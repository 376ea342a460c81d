use crate::world::WorldError;
use serde_derive::Deserialize;

/// Streaming and meshing tunables, consumed from the host application.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct WorldConfig {
    /// Number of visible chunks around an observer; one render LOD step per
    /// multiple of this distance.
    pub visible_radius: u32,
    /// Chebyshev radius, in sections, inside which section files are loaded.
    pub section_load_radius: u32,
    /// Seconds a section must stay out of range before it is unloaded.
    pub chunk_remove_delay: f32,
    /// When false, all meshing runs inline on the world thread.
    pub parallel_chunk_build: bool,
    /// Meshing passes allowed per `update` call.
    pub max_chunks_per_frame: u32,
    /// Section loads/generations allowed per `update` call.
    pub max_sections_per_frame: u32,
    /// When false the mesher ignores per-face light and writes the maximum
    /// level everywhere.
    pub use_lightmaps: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            visible_radius: 10,
            section_load_radius: 4,
            chunk_remove_delay: 10.0,
            parallel_chunk_build: true,
            max_chunks_per_frame: 100,
            max_sections_per_frame: 1,
            use_lightmaps: false,
        }
    }
}

impl WorldConfig {
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.visible_radius < 1 {
            return Err(WorldError::MismatchedConfig(
                "visible_radius must be at least 1".into(),
            ));
        }
        if self.section_load_radius < 1 {
            return Err(WorldError::MismatchedConfig(
                "section_load_radius must be at least 1".into(),
            ));
        }
        if !(self.chunk_remove_delay >= 0.0) {
            return Err(WorldError::MismatchedConfig(
                "chunk_remove_delay must be non-negative".into(),
            ));
        }
        if self.max_chunks_per_frame < 1 || self.max_sections_per_frame < 1 {
            return Err(WorldError::MismatchedConfig(
                "per-frame budgets must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Grid parameters fixed at world creation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GridParams {
    pub chunk_size: u32,
    pub section_size: u32,
    pub lod_levels: u32,
}

impl GridParams {
    pub fn validate(&self) -> Result<(), WorldError> {
        if !self.chunk_size.is_power_of_two() || !(8..=64).contains(&self.chunk_size) {
            return Err(WorldError::MismatchedConfig(format!(
                "chunk size {} must be a power of two in [8, 64]",
                self.chunk_size
            )));
        }
        if self.section_size < 1 {
            return Err(WorldError::MismatchedConfig(
                "section size must be at least 1".into(),
            ));
        }
        if !(1..=crate::world::chunk::MAX_LOD_LEVELS as u32).contains(&self.lod_levels) {
            return Err(WorldError::MismatchedConfig(format!(
                "lod count {} out of range",
                self.lod_levels
            )));
        }
        if self.chunk_size >> (self.lod_levels - 1) < 2 {
            return Err(WorldError::MismatchedConfig(format!(
                "chunk size {} too small for {} lod levels",
                self.chunk_size, self.lod_levels
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        WorldConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_radius_is_rejected() {
        let config = WorldConfig {
            visible_radius: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn grid_rejects_non_power_of_two() {
        let grid = GridParams {
            chunk_size: 24,
            section_size: 4,
            lod_levels: 2,
        };
        assert!(grid.validate().is_err());
    }

    #[test]
    fn grid_rejects_out_of_range_sizes() {
        for chunk_size in [4, 128] {
            let grid = GridParams {
                chunk_size,
                section_size: 4,
                lod_levels: 1,
            };
            assert!(grid.validate().is_err());
        }
    }

    #[test]
    fn grid_rejects_excessive_lod_count() {
        let grid = GridParams {
            chunk_size: 8,
            section_size: 4,
            lod_levels: 4,
        };
        assert!(grid.validate().is_err());
    }

    #[test]
    fn grid_accepts_reference_shape() {
        GridParams {
            chunk_size: 16,
            section_size: 4,
            lod_levels: 3,
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn config_parses_from_json() {
        let config: WorldConfig = serde_json::from_str(
            r#"{ "visible_radius": 6, "use_lightmaps": true }"#,
        )
        .unwrap();
        assert_eq!(config.visible_radius, 6);
        assert!(config.use_lightmaps);
        assert_eq!(config.max_sections_per_frame, 1);
    }
}

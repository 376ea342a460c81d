use crate::{
    prelude::*,
    world::block::{self, BlockValue},
    Faces,
};
use nalgebra::Point3;
use serde_derive::Deserialize;
use std::{collections::HashMap, fs::File, path::Path, sync::Arc};

pub const UNKNOWN_MATERIAL: u32 = 0;

/// Geometry class of a palette entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockShape {
    #[default]
    Cube,
    Slab,
    Stairs,
    Plane,
    Mesh,
}

#[derive(Copy, Clone, Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BlockFlags {
    pub visible: bool,
    pub blocks_visibility: bool,
    pub collidable: bool,
    /// Neighbouring equal-valued cubes occlude their shared faces.
    pub volume_cube: bool,
    pub point_light_emitter: bool,
}

/// Per-face visual parameters: material slot, RGBA colour and the UV
/// rectangle (u, v, atlas layer).
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FaceVisual {
    pub material_index: u32,
    pub color: [u8; 4],
    pub min_uv: [f32; 3],
    pub max_uv: [f32; 3],
}

impl Default for FaceVisual {
    fn default() -> Self {
        Self {
            material_index: UNKNOWN_MATERIAL,
            color: [255, 255, 255, 255],
            min_uv: [0.0, 0.0, 0.0],
            max_uv: [1.0, 1.0, 0.0],
        }
    }
}

impl FaceVisual {
    pub fn rgb_bits(&self) -> u32 {
        (self.color[0] as u32)
            | ((self.color[1] as u32) << 8)
            | ((self.color[2] as u32) << 16)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SlabSettings {
    /// Fraction of a full block, in (0, 1].
    pub height: f32,
}

impl Default for SlabSettings {
    fn default() -> Self {
        Self { height: 0.5 }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PlaneSettings {
    pub visual: FaceVisual,
    pub width: f32,
    pub height: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    /// Radians.
    pub base_rotation: f32,
    pub repeat_rotation: f32,
    pub repeat_count: u32,
}

impl Default for PlaneSettings {
    fn default() -> Self {
        Self {
            visual: FaceVisual::default(),
            width: 1.0,
            height: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            base_rotation: 0.0,
            repeat_rotation: std::f32::consts::FRAC_PI_2,
            repeat_count: 2,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MeshSettings {
    pub mesh_index: u32,
    pub scale: f32,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            mesh_index: 0,
            scale: 1.0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PointLightSettings {
    pub offset: [f32; 3],
    pub range: f32,
    pub color: [u8; 3],
    pub brightness: f32,
    pub falloff: f32,
}

impl Default for PointLightSettings {
    fn default() -> Self {
        Self {
            offset: [0.0, 0.0, 0.5],
            range: 8.0,
            color: [255, 255, 255],
            brightness: 1.0,
            falloff: 1.0,
        }
    }
}

/// One palette entry. Entry 0 is always air: invisible, intangible and
/// shapeless.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockType {
    pub name: String,
    #[serde(default)]
    pub shape: BlockShape,
    #[serde(default)]
    pub flags: BlockFlags,
    #[serde(default)]
    pub faces: Faces<FaceVisual>,
    #[serde(default)]
    pub slab: SlabSettings,
    #[serde(default)]
    pub plane: PlaneSettings,
    #[serde(default)]
    pub mesh: MeshSettings,
    #[serde(default)]
    pub point_light: PointLightSettings,
}

impl BlockType {
    pub fn air() -> Self {
        Self {
            name: "air".into(),
            shape: BlockShape::Cube,
            flags: BlockFlags::default(),
            faces: Faces::default(),
            slab: SlabSettings::default(),
            plane: PlaneSettings::default(),
            mesh: MeshSettings::default(),
            point_light: PointLightSettings::default(),
        }
    }
}

/// Collision geometry for a mesh-shaped block, in the mesh's local space.
#[derive(Clone, Debug, Default)]
pub struct PaletteMesh {
    pub name: String,
    pub triangles: Vec<[Point3<f32>; 3]>,
}

/// The immutable block-type catalog. Indexed by the low 15 bits of a block
/// value; coloured values bypass the palette entirely.
#[derive(Clone, Debug, Default)]
pub struct BlockRegistry {
    entries: Vec<BlockType>,
    name_map: HashMap<String, BlockValue>,
    meshes: Vec<PaletteMesh>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RegistryManifest {
    blocks: Vec<BlockType>,
}

pub fn load_registry<P: AsRef<Path>>(path: P) -> Result<Arc<BlockRegistry>> {
    let manifest: RegistryManifest = serde_json::from_reader(File::open(path)?)?;
    Ok(Arc::new(BlockRegistry::new(manifest.blocks, Vec::new())?))
}

impl BlockRegistry {
    /// Entry 0 is reserved for air; a manifest that names its first entry
    /// anything else is rejected.
    pub fn new(mut entries: Vec<BlockType>, meshes: Vec<PaletteMesh>) -> Result<Self> {
        if entries.is_empty() {
            entries.push(BlockType::air());
        }
        if entries[0].name != "air" || entries[0].flags.visible {
            bail!("palette entry 0 must be air");
        }

        let mut name_map = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            if index >= block::COLORED_FLAG as usize {
                bail!("palette overflows the 15-bit index space");
            }
            if name_map.insert(entry.name.clone(), index as BlockValue).is_some() {
                bail!("duplicate palette entry '{}'", entry.name);
            }
        }

        Ok(Self {
            entries,
            name_map,
            meshes,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_id(&self, name: &str) -> Option<BlockValue> {
        self.name_map.get(name).copied()
    }

    /// The palette entry for a typed block value. Air, coloured values and
    /// out-of-range indices have no entry.
    #[inline(always)]
    pub fn get(&self, value: BlockValue) -> Option<&BlockType> {
        if value == block::AIR || block::is_colored(value) {
            return None;
        }
        self.entries.get(value as usize)
    }

    #[inline(always)]
    pub fn entry(&self, index: usize) -> &BlockType {
        &self.entries[index]
    }

    #[inline(always)]
    pub fn mesh(&self, index: u32) -> Option<&PaletteMesh> {
        self.meshes.get(index as usize)
    }

    /// Shape of an arbitrary value; coloured blocks read as plain cubes.
    #[inline(always)]
    pub fn shape_of(&self, value: BlockValue) -> BlockShape {
        if block::is_colored(value) {
            return BlockShape::Cube;
        }
        self.get(value).map(|entry| entry.shape).unwrap_or_default()
    }

    #[inline(always)]
    pub fn is_visible(&self, value: BlockValue) -> bool {
        block::is_colored(value)
            || self.get(value).map_or(false, |entry| entry.flags.visible)
    }

    #[inline(always)]
    pub fn is_collidable(&self, value: BlockValue) -> bool {
        block::is_colored(value)
            || self.get(value).map_or(false, |entry| entry.flags.collidable)
    }
}

#[cfg(test)]
pub(crate) mod test_palette {
    use super::*;
    use nalgebra::point;

    /// A palette exercising every shape class, used across the crate's
    /// tests. Entry order: air, stone (visibility-blocking cube), glass
    /// (transparent cube), water (volume cube), half-slab, stairs, grass
    /// plane, statue mesh, lamp (light-emitting cube).
    pub fn build() -> Arc<BlockRegistry> {
        let solid = BlockFlags {
            visible: true,
            blocks_visibility: true,
            collidable: true,
            ..Default::default()
        };

        let mut blocks = vec![BlockType::air()];
        blocks.push(BlockType {
            name: "stone".into(),
            flags: solid,
            ..BlockType::air()
        });
        blocks.push(BlockType {
            name: "glass".into(),
            flags: BlockFlags {
                visible: true,
                collidable: true,
                ..Default::default()
            },
            ..BlockType::air()
        });
        blocks.push(BlockType {
            name: "water".into(),
            flags: BlockFlags {
                visible: true,
                volume_cube: true,
                ..Default::default()
            },
            ..BlockType::air()
        });
        blocks.push(BlockType {
            name: "half-slab".into(),
            shape: BlockShape::Slab,
            flags: solid,
            slab: SlabSettings { height: 0.5 },
            ..BlockType::air()
        });
        blocks.push(BlockType {
            name: "stairs".into(),
            shape: BlockShape::Stairs,
            flags: solid,
            ..BlockType::air()
        });
        blocks.push(BlockType {
            name: "grass-tuft".into(),
            shape: BlockShape::Plane,
            flags: BlockFlags {
                visible: true,
                ..Default::default()
            },
            plane: PlaneSettings {
                repeat_count: 2,
                ..Default::default()
            },
            ..BlockType::air()
        });
        blocks.push(BlockType {
            name: "statue".into(),
            shape: BlockShape::Mesh,
            flags: BlockFlags {
                visible: true,
                collidable: true,
                ..Default::default()
            },
            mesh: MeshSettings {
                mesh_index: 0,
                scale: 1.0,
            },
            ..BlockType::air()
        });
        blocks.push(BlockType {
            name: "lamp".into(),
            flags: BlockFlags {
                visible: true,
                blocks_visibility: true,
                collidable: true,
                point_light_emitter: true,
                ..Default::default()
            },
            ..BlockType::air()
        });

        let statue_mesh = PaletteMesh {
            name: "statue".into(),
            triangles: vec![[
                point![-0.25, -0.25, 0.0],
                point![0.25, -0.25, 0.0],
                point![0.0, 0.0, 0.75],
            ]],
        };

        Arc::new(BlockRegistry::new(blocks, vec![statue_mesh]).unwrap())
    }

    pub const STONE: BlockValue = 1;
    pub const GLASS: BlockValue = 2;
    pub const WATER: BlockValue = 3;
    pub const SLAB: BlockValue = 4;
    pub const STAIRS: BlockValue = 5;
    pub const PLANE: BlockValue = 6;
    pub const MESH: BlockValue = 7;
    pub const LAMP: BlockValue = 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_zero_must_be_air() {
        let stone = BlockType {
            name: "stone".into(),
            flags: BlockFlags {
                visible: true,
                ..Default::default()
            },
            ..BlockType::air()
        };
        assert!(BlockRegistry::new(vec![stone], Vec::new()).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let blocks = vec![BlockType::air(), BlockType::air()];
        assert!(BlockRegistry::new(blocks, Vec::new()).is_err());
    }

    #[test]
    fn lookup_by_name_and_value() {
        let palette = test_palette::build();
        assert_eq!(palette.get_id("stone"), Some(test_palette::STONE));
        assert!(palette.get(block::AIR).is_none());
        assert!(palette.get(block::pack_colored(255, 0, 0)).is_none());
        assert_eq!(
            palette.get(test_palette::SLAB).map(|entry| entry.shape),
            Some(BlockShape::Slab)
        );
    }

    #[test]
    fn colored_values_read_as_visible_cubes() {
        let palette = test_palette::build();
        let tint = block::pack_colored(16, 32, 64);
        assert!(palette.is_visible(tint));
        assert!(palette.is_collidable(tint));
        assert_eq!(palette.shape_of(tint), BlockShape::Cube);
    }

    #[test]
    fn manifest_parses_with_defaults() {
        let manifest = r#"{
            "blocks": [
                { "name": "air" },
                {
                    "name": "stone",
                    "flags": { "visible": true, "blocks-visibility": true, "collidable": true }
                },
                { "name": "half-slab", "shape": "slab", "slab": { "height": 0.5 } }
            ]
        }"#;
        let parsed: RegistryManifest = serde_json::from_str(manifest).unwrap();
        let registry = BlockRegistry::new(parsed.blocks, Vec::new()).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.shape_of(2), BlockShape::Slab);
        assert!(registry.entry(1).flags.blocks_visibility);
    }
}

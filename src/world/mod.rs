use crate::{
    aabb::Aabb,
    collision::ChunkCollisionShape,
    config::{GridParams, WorldConfig},
    mesher::{mesh_single_block, MesherInput, MesherPool},
    prelude::*,
    render::{
        BlockRenderProxy, ChunkRenderProxy, RenderMessage, RendererHandle,
    },
    transform::Transform,
    util::{self, DwordBitSet},
    Side,
};
use nalgebra::{point, vector, Point3, Vector3};
use std::{
    collections::HashMap,
    fmt, io,
    sync::Arc,
};

pub mod animation;
pub mod block;
pub mod chunk;
pub mod entity;
pub mod generation;
pub mod persistence;
pub mod registry;
pub mod section;

use self::{
    animation::{AnimationDriver, BlockAnimation, Easing, PhysicsBodyHandle},
    block::{BlockValue, Rotation},
    chunk::{Chunk, MeshState},
    entity::{EntityId, EntityRecord},
    generation::WorldGenerator,
    persistence::{IndexFile, WorldStorage},
    registry::{BlockRegistry, BlockShape},
    section::{LoadState, Section},
};

/// Global block coordinates. Z is unbounded; sections only tile X/Y.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new<I: Into<[i32; 3]>>(pos: I) -> Self {
        let [x, y, z] = pos.into();
        Self { x, y, z }
    }

    pub fn offset<I: Into<[i32; 3]>>(self, offset: I) -> Self {
        let [dx, dy, dz] = offset.into();
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }

    pub fn origin(self) -> Point3<f32> {
        point![self.x as f32, self.y as f32, self.z as f32]
    }
}

impl From<BlockPos> for Point3<i32> {
    fn from(BlockPos { x, y, z }: BlockPos) -> Self {
        nalgebra::point![x, y, z]
    }
}

/// Global chunk coordinates.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn offset<I: Into<[i32; 3]>>(self, offset: I) -> Self {
        let [dx, dy, dz] = offset.into();
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SectionPos {
    pub x: i32,
    pub y: i32,
}

/// Euclidean split of a block coordinate into its chunk and in-chunk offset.
pub fn split_block_coord(chunk_size: u32, pos: BlockPos) -> (ChunkPos, [u32; 3]) {
    let size = chunk_size as i32;
    let chunk = ChunkPos {
        x: util::floor_div(pos.x, size),
        y: util::floor_div(pos.y, size),
        z: util::floor_div(pos.z, size),
    };
    let local = [
        util::floor_rem(pos.x, size) as u32,
        util::floor_rem(pos.y, size) as u32,
        util::floor_rem(pos.z, size) as u32,
    ];
    (chunk, local)
}

/// Splits global chunk coordinates into the owning section and the relative
/// chunk coordinates within it. Z passes through; sections have no Z axis.
pub fn split_chunk_coord(section_size: u32, pos: ChunkPos) -> (SectionPos, u32, u32, i32) {
    let size = section_size as i32;
    let section = SectionPos {
        x: util::floor_div(pos.x, size),
        y: util::floor_div(pos.y, size),
    };
    (
        section,
        util::floor_rem(pos.x, size) as u32,
        util::floor_rem(pos.y, size) as u32,
        pos.z,
    )
}

pub fn chunk_bounds(chunk_size: u32, pos: ChunkPos) -> Aabb {
    let size = chunk_size as f32;
    let min = point![
        pos.x as f32 * size,
        pos.y as f32 * size,
        pos.z as f32 * size
    ];
    Aabb::new(min, min + vector![size, size, size])
}

fn chunk_center(chunk_size: u32, pos: ChunkPos) -> Point3<f32> {
    let half = chunk_size as f32 * 0.5;
    let min = chunk_bounds(chunk_size, pos).min;
    min + vector![half, half, half]
}

#[derive(Debug)]
pub enum WorldError {
    /// Wrong magic, truncated stream or parameter mismatch. Nothing is
    /// partially applied.
    CorruptFile(String),
    /// Invalid construction parameters.
    MismatchedConfig(String),
    /// An edit outside any existing section with `create = false`.
    OutOfRangeCoord(BlockPos),
    Io(io::Error),
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldError::CorruptFile(detail) => write!(f, "corrupt world file: {detail}"),
            WorldError::MismatchedConfig(detail) => write!(f, "mismatched config: {detail}"),
            WorldError::OutOfRangeCoord(pos) => {
                write!(f, "no section covers block ({}, {}, {})", pos.x, pos.y, pos.z)
            }
            WorldError::Io(err) => write!(f, "world io error: {err}"),
        }
    }
}

impl std::error::Error for WorldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorldError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for WorldError {
    fn from(err: io::Error) -> Self {
        WorldError::Io(err)
    }
}

/// A chunk waiting for the mesher, with the view information the scheduler
/// sorts by.
#[derive(Copy, Clone, Debug)]
pub struct PendingMesh {
    pub chunk: ChunkPos,
    pub view_center: Point3<f32>,
    pub min_view_distance: f32,
    pub old_lod: u32,
    pub new_lod: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct RaycastHit {
    pub block: BlockPos,
    /// `None` when the ray started inside the hit block.
    pub face: Option<Side>,
    pub value: BlockValue,
    pub distance: f32,
}

/// Dense rectangle of section slots plus the availability bitset. Resident
/// sections always have their bit set; a set bit with a vacant slot means
/// the section exists on disk only.
struct SectionIndex {
    min_sx: i32,
    min_sy: i32,
    max_sx: i32,
    max_sy: i32,
    sections: Vec<Option<Box<Section>>>,
    available: DwordBitSet,
}

impl SectionIndex {
    fn new(min_sx: i32, min_sy: i32, max_sx: i32, max_sy: i32) -> Self {
        debug_assert!(min_sx <= max_sx && min_sy <= max_sy);
        let slots = ((max_sx - min_sx + 1) * (max_sy - min_sy + 1)) as usize;
        Self {
            min_sx,
            min_sy,
            max_sx,
            max_sy,
            sections: (0..slots).map(|_| None).collect(),
            available: DwordBitSet::with_len(slots),
        }
    }

    fn width(&self) -> i32 {
        self.max_sx - self.min_sx + 1
    }

    fn contains(&self, sx: i32, sy: i32) -> bool {
        (self.min_sx..=self.max_sx).contains(&sx) && (self.min_sy..=self.max_sy).contains(&sy)
    }

    fn slot(&self, sx: i32, sy: i32) -> Option<usize> {
        if !self.contains(sx, sy) {
            return None;
        }
        Some(((sy - self.min_sy) * self.width() + (sx - self.min_sx)) as usize)
    }

    fn section(&self, sx: i32, sy: i32) -> Option<&Section> {
        self.sections[self.slot(sx, sy)?].as_deref()
    }

    fn section_mut(&mut self, sx: i32, sy: i32) -> Option<&mut Section> {
        let slot = self.slot(sx, sy)?;
        self.sections[slot].as_deref_mut()
    }

    fn is_available(&self, sx: i32, sy: i32) -> bool {
        self.slot(sx, sy).map_or(false, |slot| self.available.get(slot))
    }

    fn set_available(&mut self, sx: i32, sy: i32, available: bool) {
        if let Some(slot) = self.slot(sx, sy) {
            if available {
                self.available.set(slot);
            } else {
                self.available.unset(slot);
            }
        }
    }

    /// Grows the rectangle to cover `(sx, sy)`, preserving slot contents and
    /// availability. The rectangle never shrinks.
    fn grow_to_include(&mut self, sx: i32, sy: i32) {
        if self.contains(sx, sy) {
            return;
        }

        let min_sx = self.min_sx.min(sx);
        let min_sy = self.min_sy.min(sy);
        let max_sx = self.max_sx.max(sx);
        let max_sy = self.max_sy.max(sy);
        let mut grown = SectionIndex::new(min_sx, min_sy, max_sx, max_sy);

        let old_sections = std::mem::take(&mut self.sections);
        for (old_slot, slot_value) in old_sections.into_iter().enumerate() {
            let sx = self.min_sx + (old_slot as i32 % self.width());
            let sy = self.min_sy + (old_slot as i32 / self.width());
            let new_slot = grown.slot(sx, sy).expect("grown rectangle covers old");
            if self.available.get(old_slot) {
                grown.available.set(new_slot);
            }
            grown.sections[new_slot] = slot_value;
        }

        *self = grown;
    }

    fn insert(&mut self, section: Box<Section>) {
        let (sx, sy) = (section.section_x(), section.section_y());
        self.grow_to_include(sx, sy);
        let slot = self.slot(sx, sy).expect("just grown");
        debug_assert!(self.sections[slot].is_none());
        self.sections[slot] = Some(section);
        self.available.set(slot);
    }

    fn remove(&mut self, sx: i32, sy: i32) -> Option<Box<Section>> {
        let slot = self.slot(sx, sy)?;
        self.sections[slot].take()
    }

    fn resident_positions(&self) -> Vec<SectionPos> {
        let mut positions = Vec::new();
        for (slot, section) in self.sections.iter().enumerate() {
            if section.is_some() {
                positions.push(SectionPos {
                    x: self.min_sx + (slot as i32 % self.width()),
                    y: self.min_sy + (slot as i32 / self.width()),
                });
            }
        }
        positions
    }

    fn available_positions(&self) -> Vec<SectionPos> {
        let mut positions = Vec::new();
        for slot in 0..self.available.len() {
            if self.available.get(slot) {
                positions.push(SectionPos {
                    x: self.min_sx + (slot as i32 % self.width()),
                    y: self.min_sy + (slot as i32 / self.width()),
                });
            }
        }
        positions
    }
}

/// The world: fixed grid parameters, the section index, the streaming and
/// meshing scheduler, entities and block animations. All structural
/// mutation happens on the thread that owns this value; only the mesher and
/// collision provider run elsewhere.
pub struct BlockWorld {
    palette: Arc<BlockRegistry>,
    grid: GridParams,
    config: WorldConfig,
    storage: Option<WorldStorage>,
    generator: Option<Box<dyn WorldGenerator>>,

    index: SectionIndex,
    pending_meshes: Vec<PendingMesh>,
    mesher_pool: MesherPool,
    in_flight: HashMap<ChunkPos, (u32, u64)>,
    mesh_epoch: u64,

    renderer: RendererHandle,

    /// entity id -> home section, `None` meaning the global list
    entity_homes: HashMap<EntityId, Option<SectionPos>>,
    global_entities: Vec<EntityRecord>,

    animations: Vec<BlockAnimation>,
}

impl BlockWorld {
    pub fn create(
        palette: Arc<BlockRegistry>,
        grid: GridParams,
        config: WorldConfig,
        renderer: RendererHandle,
        storage: Option<WorldStorage>,
    ) -> Result<Self, WorldError> {
        grid.validate()?;
        config.validate()?;

        let mesher_pool = MesherPool::new(config.parallel_chunk_build)
            .map_err(|err| WorldError::MismatchedConfig(err.to_string()))?;

        let mut index = SectionIndex::new(0, 0, 0, 0);
        let mut global_entities = Vec::new();
        let mut entity_homes = HashMap::new();
        if let Some(storage) = &storage {
            if let Some(file) = storage.load_index_file()? {
                index = SectionIndex::new(file.min_sx, file.min_sy, file.max_sx, file.max_sy);
                for slot in 0..file.available.len() {
                    if file.available.get(slot) {
                        index.available.set(slot);
                    }
                }
            }
            global_entities = storage.load_global_entities()?;
            for entity in &global_entities {
                entity_homes.insert(entity.id, None);
            }
        }

        Ok(Self {
            palette,
            grid,
            config,
            storage,
            generator: None,
            index,
            pending_meshes: Vec::new(),
            mesher_pool,
            in_flight: HashMap::new(),
            mesh_epoch: 0,
            renderer,
            entity_homes,
            global_entities,
            animations: Vec::new(),
        })
    }

    pub fn palette(&self) -> &Arc<BlockRegistry> {
        &self.palette
    }

    pub fn chunk_size(&self) -> u32 {
        self.grid.chunk_size
    }

    pub fn section_size(&self) -> u32 {
        self.grid.section_size
    }

    pub fn lod_levels(&self) -> u32 {
        self.grid.lod_levels
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn set_generator(&mut self, generator: Box<dyn WorldGenerator>) {
        self.generator = Some(generator);
    }

    pub fn pending_mesh_count(&self) -> usize {
        self.pending_meshes.len() + self.in_flight.len()
    }

    pub fn loaded_section_count(&self) -> usize {
        self.index.resident_positions().len()
    }

    // ------------------------------------------------------------------
    // coordinates

    pub fn chunk_of_position(&self, position: Point3<f32>) -> ChunkPos {
        let (chunk, _) = split_block_coord(self.grid.chunk_size, self.point_of_position(position));
        chunk
    }

    pub fn section_of_position(&self, position: Point3<f32>) -> SectionPos {
        let chunk = self.chunk_of_position(position);
        split_chunk_coord(self.grid.section_size, chunk).0
    }

    pub fn point_of_position(&self, position: Point3<f32>) -> BlockPos {
        BlockPos {
            x: position.x.floor() as i32,
            y: position.y.floor() as i32,
            z: position.z.floor() as i32,
        }
    }

    // ------------------------------------------------------------------
    // section and chunk access

    pub fn section(&self, sx: i32, sy: i32) -> Option<&Section> {
        self.index.section(sx, sy)
    }

    pub fn section_mut(&mut self, sx: i32, sy: i32) -> Option<&mut Section> {
        self.index.section_mut(sx, sy)
    }

    pub fn is_section_available(&self, sx: i32, sy: i32) -> bool {
        self.index.is_available(sx, sy)
    }

    pub fn is_section_loaded(&self, sx: i32, sy: i32, required_lod: u32) -> bool {
        self.index
            .section(sx, sy)
            .map_or(false, |section| section.loaded_lod() <= required_lod)
    }

    pub fn chunk(&self, pos: ChunkPos) -> Option<&Chunk> {
        let (section, rx, ry, cz) = split_chunk_coord(self.grid.section_size, pos);
        self.index.section(section.x, section.y)?.chunk(rx, ry, cz)
    }

    fn chunk_mut(&mut self, pos: ChunkPos) -> Option<&mut Chunk> {
        let (section, rx, ry, cz) = split_chunk_coord(self.grid.section_size, pos);
        self.index
            .section_mut(section.x, section.y)?
            .chunk_mut(rx, ry, cz)
    }

    pub fn is_chunk_available(&self, pos: ChunkPos) -> bool {
        let (section, rx, ry, cz) = split_chunk_coord(self.grid.section_size, pos);
        self.index
            .section(section.x, section.y)
            .map_or(false, |section| section.is_chunk_available(rx, ry, cz))
    }

    pub fn is_chunk_loaded(&self, pos: ChunkPos, required_lod: u32) -> bool {
        self.chunk(pos)
            .map_or(false, |chunk| chunk.loaded_lod() <= required_lod)
    }

    /// A collision shape for a resident chunk, valid while no writes happen
    /// to that chunk.
    pub fn chunk_collision_shape(&self, pos: ChunkPos) -> Option<ChunkCollisionShape<'_>> {
        Some(ChunkCollisionShape::new(self.chunk(pos)?, &self.palette))
    }

    /// Editor path: a fresh section covering the given chunk-Z range.
    pub fn create_section(
        &mut self,
        sx: i32,
        sy: i32,
        min_cz: i32,
        max_cz: i32,
    ) -> Result<&mut Section, WorldError> {
        if self.index.section(sx, sy).is_some() || self.index.is_available(sx, sy) {
            return Err(WorldError::MismatchedConfig(format!(
                "section ({sx}, {sy}) already exists"
            )));
        }
        let section = Section::create(
            self.grid.chunk_size,
            self.grid.section_size,
            self.grid.lod_levels,
            sx,
            sy,
            min_cz,
            max_cz,
        );
        self.index.insert(Box::new(section));
        Ok(self
            .index
            .section_mut(sx, sy)
            .expect("section inserted above"))
    }

    /// Drops a section and its file-availability bit; dirty content is
    /// discarded.
    pub fn delete_section(&mut self, sx: i32, sy: i32) {
        if let Some(section) = self.index.remove(sx, sy) {
            self.drop_section_state(section);
        }
        self.index.set_available(sx, sy, false);
    }

    fn drop_section_state(&mut self, mut section: Box<Section>) {
        for entity in section.entities() {
            self.entity_homes.remove(&entity.id);
        }
        let (sx, sy) = (section.section_x(), section.section_y());
        for chunk in section.chunks_mut() {
            if let Some(proxy) = chunk.take_render_proxy() {
                self.renderer.send(RenderMessage::RemoveChunkProxy { proxy });
            }
        }
        self.pending_meshes.retain(|pending| {
            let (section_pos, ..) = split_chunk_coord(self.grid.section_size, pending.chunk);
            section_pos.x != sx || section_pos.y != sy
        });
    }

    // ------------------------------------------------------------------
    // block edits

    /// `None` when no section is resident (or not loaded to full detail)
    /// under the coordinate; absent chunks inside a resident section read
    /// as air.
    pub fn block_value(&self, pos: BlockPos) -> Option<BlockValue> {
        let (chunk_pos, local) = split_block_coord(self.grid.chunk_size, pos);
        let (section_pos, rx, ry, cz) = split_chunk_coord(self.grid.section_size, chunk_pos);
        let section = self.index.section(section_pos.x, section_pos.y)?;
        if section.loaded_lod() > 0 {
            return None;
        }
        match section.chunk(rx, ry, cz) {
            Some(chunk) => Some(chunk.block(0, local[0], local[1], local[2])),
            None => Some(block::AIR),
        }
    }

    pub fn clear_block(&mut self, pos: BlockPos) -> Result<(), WorldError> {
        self.write_block(pos, block::AIR, Rotation::North, false)
    }

    pub fn set_block_type(
        &mut self,
        pos: BlockPos,
        value: BlockValue,
        rotation: Rotation,
        create: bool,
    ) -> Result<(), WorldError> {
        self.write_block(pos, value, rotation, create)
    }

    pub fn set_block_color(
        &mut self,
        pos: BlockPos,
        rgb: [u8; 3],
        create: bool,
    ) -> Result<(), WorldError> {
        self.write_block(
            pos,
            block::pack_colored(rgb[0], rgb[1], rgb[2]),
            Rotation::North,
            create,
        )
    }

    /// Resolves, writes, refreshes the covering LODs and queues the chunk
    /// (and boundary neighbours) for re-meshing. Writing the value a cell
    /// already holds is a no-op: mesh state does not move.
    fn write_block(
        &mut self,
        pos: BlockPos,
        value: BlockValue,
        rotation: Rotation,
        create: bool,
    ) -> Result<(), WorldError> {
        let (chunk_pos, local) = split_block_coord(self.grid.chunk_size, pos);
        let (section_pos, rx, ry, cz) = split_chunk_coord(self.grid.section_size, chunk_pos);

        if self.index.section(section_pos.x, section_pos.y).is_none() {
            if !create {
                return Err(WorldError::OutOfRangeCoord(pos));
            }
            if self.index.is_available(section_pos.x, section_pos.y) {
                // exists on disk but not resident; edits must wait for the
                // stream-in rather than shadowing the file
                return Err(WorldError::OutOfRangeCoord(pos));
            }
            self.index.grow_to_include(section_pos.x, section_pos.y);
            let section = Section::create(
                self.grid.chunk_size,
                self.grid.section_size,
                self.grid.lod_levels,
                section_pos.x,
                section_pos.y,
                cz,
                cz,
            );
            self.index.insert(Box::new(section));
        }

        let section = self
            .index
            .section_mut(section_pos.x, section_pos.y)
            .expect("section resident");
        if section.loaded_lod() != 0 {
            return Err(WorldError::OutOfRangeCoord(pos));
        }

        if section.chunk(rx, ry, cz).is_none() {
            if !create {
                return Err(WorldError::OutOfRangeCoord(pos));
            }
            section.create_chunk(rx, ry, cz);
        }

        let chunk = section.chunk_mut(rx, ry, cz).expect("chunk resident");
        let old_value = chunk.block(0, local[0], local[1], local[2]);
        let old_rotation = chunk.rotation(0, local[0], local[1], local[2]);
        if old_value == value && old_rotation == rotation {
            return Ok(());
        }

        chunk.set_block(0, local[0], local[1], local[2], value);
        chunk.set_rotation(0, local[0], local[1], local[2], rotation);
        chunk.update_lods(0, local[0], local[1], local[2]);
        section.mark_changed();

        self.request_remesh(chunk_pos);

        // faces shared with neighbour chunks changed too
        let edge = self.grid.chunk_size - 1;
        for (axis, side_pair) in [
            (0, [Side::Left, Side::Right]),
            (1, [Side::Front, Side::Back]),
            (2, [Side::Bottom, Side::Top]),
        ] {
            if local[axis] == 0 {
                let normal: Vector3<i32> = side_pair[0].normal();
                self.request_remesh(chunk_pos.offset([normal.x, normal.y, normal.z]));
            }
            if local[axis] == edge {
                let normal: Vector3<i32> = side_pair[1].normal();
                self.request_remesh(chunk_pos.offset([normal.x, normal.y, normal.z]));
            }
        }

        Ok(())
    }

    /// Flags a chunk for re-meshing if it is resident and idle. The pending
    /// entry's view data is refreshed by the scheduler before sorting.
    fn request_remesh(&mut self, pos: ChunkPos) {
        let (section_pos, rx, ry, cz) = split_chunk_coord(self.grid.section_size, pos);
        let lod_levels = self.grid.lod_levels;
        let chunk_size = self.grid.chunk_size;

        let Some(section) = self.index.section_mut(section_pos.x, section_pos.y) else {
            return;
        };
        let Some(chunk) = section.chunk_mut(rx, ry, cz) else {
            return;
        };

        let old_lod = chunk.render_lod();
        let new_lod = chunk.render_lod().min(lod_levels - 1).max(chunk.loaded_lod());
        if chunk.mark_pending() {
            section.add_chunk_pending_mesh();
            self.pending_meshes.push(PendingMesh {
                chunk: pos,
                view_center: chunk_center(chunk_size, pos),
                min_view_distance: 0.0,
                old_lod,
                new_lod,
            });
        }
    }

    // ------------------------------------------------------------------
    // scheduler

    /// One cooperative frame: apply finished meshes, stream sections around
    /// the observers, re-evaluate render LODs, run the mesher over the
    /// nearest pending chunks within budget, and advance block animations.
    pub fn update(&mut self, dt: f32, observers: &[Point3<f32>]) {
        self.apply_completed_meshes();
        self.stream_sections(dt, observers);
        self.transition_render_lods(observers);
        self.sort_pending_meshes(observers);
        self.process_pending_meshes();
        self.apply_completed_meshes();
        self.update_animations(dt);
    }

    fn observer_sections(&self, observers: &[Point3<f32>]) -> Vec<SectionPos> {
        observers
            .iter()
            .map(|observer| self.section_of_position(*observer))
            .collect()
    }

    fn section_in_range(&self, pos: SectionPos, observer_sections: &[SectionPos]) -> bool {
        let radius = self.config.section_load_radius as i32;
        observer_sections
            .iter()
            .any(|obs| (pos.x - obs.x).abs() <= radius && (pos.y - obs.y).abs() <= radius)
    }

    /// Render LOD the scheduler wants for geometry at `center`.
    fn target_lod_for(&self, center: Point3<f32>, observers: &[Point3<f32>]) -> u32 {
        let mut nearest = f32::INFINITY;
        for observer in observers {
            nearest = util::min(nearest, (center - observer).norm());
        }
        if !nearest.is_finite() {
            return self.grid.lod_levels - 1;
        }
        let chunks = nearest / self.grid.chunk_size as f32;
        let steps = (chunks / self.config.visible_radius as f32).floor();
        util::clamp(steps as i64, 0, (self.grid.lod_levels - 1) as i64) as u32
    }

    fn stream_sections(&mut self, dt: f32, observers: &[Point3<f32>]) {
        let observer_sections = self.observer_sections(observers);

        // age and unload out-of-range sections
        for pos in self.index.resident_positions() {
            if self.section_in_range(pos, &observer_sections) {
                if let Some(section) = self.index.section_mut(pos.x, pos.y) {
                    section.out_of_range_for = 0.0;
                }
            } else {
                let expired = {
                    let Some(section) = self.index.section_mut(pos.x, pos.y) else {
                        continue;
                    };
                    section.out_of_range_for += dt;
                    section.out_of_range_for >= self.config.chunk_remove_delay
                };
                if expired {
                    self.unload_section(pos.x, pos.y);
                }
            }
        }

        if observers.is_empty() {
            return;
        }

        // activate loads nearest-first within the per-frame budget
        let mut candidates: Vec<(f32, SectionPos)> = Vec::new();
        let radius = self.config.section_load_radius as i32;
        for obs in &observer_sections {
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let pos = SectionPos {
                        x: obs.x + dx,
                        y: obs.y + dy,
                    };
                    if candidates.iter().any(|(_, existing)| *existing == pos) {
                        continue;
                    }
                    let center = self.section_center(pos);
                    let distance = observers
                        .iter()
                        .map(|observer| (center - observer).norm())
                        .fold(f32::INFINITY, util::min);
                    candidates.push((distance, pos));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut budget = self.config.max_sections_per_frame;
        for (_, pos) in candidates {
            if budget == 0 {
                break;
            }
            let target_lod = self.target_lod_for(self.section_center(pos), observers);

            let resident_lod = self.index.section(pos.x, pos.y).map(|section| {
                (section.loaded_lod(), section.load_state())
            });
            match resident_lod {
                Some((_, LoadState::Generating)) => {}
                Some((loaded, _)) if loaded > target_lod => {
                    // deepen an already-resident section
                    if self.deepen_section(pos, target_lod) {
                        budget -= 1;
                    }
                }
                Some(_) => {}
                None => {
                    if self.activate_section(pos, target_lod) {
                        budget -= 1;
                    }
                }
            }
        }
    }

    fn section_center(&self, pos: SectionPos) -> Point3<f32> {
        let blocks = (self.grid.section_size * self.grid.chunk_size) as f32;
        point![
            (pos.x as f32 + 0.5) * blocks,
            (pos.y as f32 + 0.5) * blocks,
            0.0
        ]
    }

    fn deepen_section(&mut self, pos: SectionPos, target_lod: u32) -> bool {
        let Some(storage) = &self.storage else {
            return false;
        };
        if !self.index.is_available(pos.x, pos.y) {
            return false;
        }
        let grid = self.grid;
        let Some(section) = self.index.section_mut(pos.x, pos.y) else {
            return false;
        };
        debug_assert!(section.lod_levels() == grid.lod_levels);
        match storage.load_section_file_lods(section, target_lod) {
            Ok(()) => {
                let entities: Vec<EntityId> =
                    section.entities().iter().map(|entity| entity.id).collect();
                for id in entities {
                    self.entity_homes.insert(id, Some(pos));
                }
                true
            }
            Err(err) => {
                log::error!("failed to deepen section ({}, {}): {err}", pos.x, pos.y);
                false
            }
        }
    }

    /// Brings one non-resident section in, from disk or from the generator.
    fn activate_section(&mut self, pos: SectionPos, target_lod: u32) -> bool {
        if self.index.is_available(pos.x, pos.y) {
            let Some(storage) = &self.storage else {
                return false;
            };
            match storage.load_section_file(&self.grid, pos.x, pos.y, target_lod) {
                Ok(section) => {
                    for entity in section.entities() {
                        self.entity_homes.insert(entity.id, Some(pos));
                    }
                    self.index.insert(Box::new(section));
                    true
                }
                Err(WorldError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                    log::error!(
                        "section ({}, {}) was marked available but its file is missing",
                        pos.x,
                        pos.y
                    );
                    self.index.set_available(pos.x, pos.y, false);
                    false
                }
                Err(err) => {
                    log::error!("failed to load section ({}, {}): {err}", pos.x, pos.y);
                    false
                }
            }
        } else if self
            .generator
            .as_ref()
            .map_or(false, |generator| generator.can_generate(pos.x, pos.y))
        {
            let generator = self.generator.take().expect("checked above");
            let (min_bz, max_bz) = generator.z_range(pos.x, pos.y);
            let chunk_size = self.grid.chunk_size as i32;
            let mut section = Section::create(
                self.grid.chunk_size,
                self.grid.section_size,
                self.grid.lod_levels,
                pos.x,
                pos.y,
                util::floor_div(min_bz, chunk_size),
                util::floor_div(max_bz, chunk_size),
            );
            section.set_load_state(LoadState::Generating);

            let result = generator.generate_into(&mut section, &self.palette);
            self.generator = Some(generator);
            match result {
                Ok(()) => {
                    section.set_load_state(LoadState::Changed);
                    self.index.insert(Box::new(section));
                    true
                }
                Err(err) => {
                    log::error!("generator failed for section ({}, {}): {err}", pos.x, pos.y);
                    false
                }
            }
        } else {
            false
        }
    }

    /// Saves (when dirty) and frees one section. Returns false when a dirty
    /// section could not be saved; it then stays resident and is retried on
    /// the next pass.
    fn unload_section(&mut self, sx: i32, sy: i32) -> bool {
        let is_changed = match self.index.section(sx, sy) {
            Some(section) => section.is_changed(),
            None => return false,
        };

        if is_changed {
            if self.storage.is_none() {
                return false;
            }
            // saving needs every LOD resident
            if self.index.section(sx, sy).map_or(0, |s| s.loaded_lod()) != 0 {
                if !self.deepen_section(SectionPos { x: sx, y: sy }, 0) {
                    return false;
                }
            }
            let storage = self.storage.as_ref().expect("checked above");
            let section = self.index.section_mut(sx, sy).expect("checked resident");
            match storage.save_section_file(section) {
                Ok(()) => {
                    section.set_load_state(LoadState::Loaded);
                    self.index.set_available(sx, sy, true);
                }
                Err(err) => {
                    log::error!("failed to save section ({sx}, {sy}): {err}; keeping resident");
                    return false;
                }
            }
        }

        let section = self.index.remove(sx, sy).expect("checked resident");
        self.drop_section_state(section);
        true
    }

    fn transition_render_lods(&mut self, observers: &[Point3<f32>]) {
        if observers.is_empty() {
            return;
        }

        let chunk_size = self.grid.chunk_size;
        let lod_levels = self.grid.lod_levels;
        let visible_radius = self.config.visible_radius as f32;

        let mut requests = Vec::new();
        for pos in self.index.resident_positions() {
            let Some(section) = self.index.section_mut(pos.x, pos.y) else {
                continue;
            };
            let section_loaded = section.loaded_lod();
            let mut newly_pending = 0;
            for chunk in section.chunks_mut() {
                if chunk.loaded_lod() >= lod_levels {
                    continue;
                }
                let center = chunk_center(chunk_size, chunk.pos());
                let mut nearest = f32::INFINITY;
                for observer in observers {
                    nearest = util::min(nearest, (center - observer).norm());
                }
                let steps = ((nearest / chunk_size as f32) / visible_radius).floor();
                let target = util::clamp(steps as i64, 0, (lod_levels - 1) as i64) as u32;
                let target = target.max(section_loaded).max(chunk.loaded_lod());

                if target != chunk.render_lod() && chunk.mesh_state() == MeshState::Idle {
                    let old_lod = chunk.render_lod();
                    if chunk.mark_pending() {
                        newly_pending += 1;
                        requests.push(PendingMesh {
                            chunk: chunk.pos(),
                            view_center: center,
                            min_view_distance: nearest,
                            old_lod,
                            new_lod: target,
                        });
                    }
                }
            }
            for _ in 0..newly_pending {
                section.add_chunk_pending_mesh();
            }
        }
        self.pending_meshes.extend(requests);
    }

    fn sort_pending_meshes(&mut self, observers: &[Point3<f32>]) {
        let chunk_size = self.grid.chunk_size;
        let visible_radius = self.config.visible_radius as f32;
        let lod_levels = self.grid.lod_levels;
        for pending in &mut self.pending_meshes {
            let center = chunk_center(chunk_size, pending.chunk);
            pending.view_center = center;
            pending.min_view_distance = observers
                .iter()
                .map(|observer| (center - observer).norm())
                .fold(f32::INFINITY, util::min);
            // the view moved since this request was queued; re-derive its LOD
            if pending.min_view_distance.is_finite() {
                let steps =
                    ((pending.min_view_distance / chunk_size as f32) / visible_radius).floor();
                pending.new_lod = util::clamp(steps as i64, 0, (lod_levels - 1) as i64) as u32;
            }
        }
        self.pending_meshes.sort_by(|a, b| {
            a.min_view_distance
                .partial_cmp(&b.min_view_distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// Invariant: a chunk may only be meshed at LOD l when each face
    /// neighbour is absent or loaded at least that fine.
    pub fn is_chunk_neighbours_loaded(&self, pos: ChunkPos, lod: u32) -> bool {
        for side in Side::ALL {
            let normal: Vector3<i32> = side.normal();
            let neighbour = pos.offset([normal.x, normal.y, normal.z]);
            if let Some(chunk) = self.chunk(neighbour) {
                if chunk.loaded_lod() > lod {
                    return false;
                }
            }
        }
        true
    }

    fn process_pending_meshes(&mut self) {
        let budget = self.config.max_chunks_per_frame as usize;
        let mut processed = 0;
        let mut remaining = Vec::new();

        let pending = std::mem::take(&mut self.pending_meshes);
        for request in pending {
            if processed >= budget {
                remaining.push(request);
                continue;
            }

            let (state, loaded_lod) = match self.chunk(request.chunk) {
                Some(chunk) => (chunk.mesh_state(), chunk.loaded_lod()),
                None => continue, // chunk went away; drop the request
            };
            if state != MeshState::Pending {
                continue;
            }

            // a chunk can only be meshed as fine as its resident data; with
            // no data at all the input build below defers the request until
            // loading resumes
            let lod = request.new_lod.max(loaded_lod);
            if !self.is_chunk_neighbours_loaded(request.chunk, lod) {
                remaining.push(request);
                continue;
            }

            let input = self.build_mesher_input(request.chunk, lod);
            let Some(input) = input else {
                remaining.push(request);
                continue;
            };

            self.mesh_epoch += 1;
            let epoch = self.mesh_epoch;
            if let Some(chunk) = self.chunk_mut(request.chunk) {
                chunk.begin_mesh();
            }
            self.in_flight.insert(request.chunk, (lod, epoch));
            self.mesher_pool.submit(request.chunk, lod, epoch, input);
            processed += 1;
        }

        self.pending_meshes = remaining;
    }

    /// Copies the padded volume the mesher needs: the chunk's own cells at
    /// `lod` plus one-cell borders from the six face neighbours. Missing
    /// neighbours contribute air.
    fn build_mesher_input(&self, pos: ChunkPos, lod: u32) -> Option<MesherInput> {
        let chunk = self.chunk(pos)?;
        if !chunk.is_lod_loaded(lod) {
            return None;
        }

        let edge = self.grid.chunk_size >> lod;
        let mut input = MesherInput::new(
            Arc::clone(&self.palette),
            self.grid.chunk_size,
            lod,
            chunk.base_position(),
            self.config.use_lightmaps,
        );

        for z in 0..edge {
            for y in 0..edge {
                for x in 0..edge {
                    input.set(
                        x + 1,
                        y + 1,
                        z + 1,
                        chunk.block(lod, x, y, z),
                        chunk.block_data(lod, x, y, z),
                    );
                }
            }
        }

        for side in Side::ALL {
            let normal: Vector3<i32> = side.normal();
            let Some(neighbour) = self.chunk(pos.offset([normal.x, normal.y, normal.z])) else {
                continue;
            };
            if !neighbour.is_lod_loaded(lod) {
                continue;
            }

            // the border plane maps onto the neighbour's opposite plane
            for v in 0..edge {
                for u in 0..edge {
                    let (input_cell, neighbour_cell) = match side {
                        Side::Right => ([edge + 1, u + 1, v + 1], [0, u, v]),
                        Side::Left => ([0, u + 1, v + 1], [edge - 1, u, v]),
                        Side::Back => ([u + 1, edge + 1, v + 1], [u, 0, v]),
                        Side::Front => ([u + 1, 0, v + 1], [u, edge - 1, v]),
                        Side::Top => ([u + 1, v + 1, edge + 1], [u, v, 0]),
                        Side::Bottom => ([u + 1, v + 1, 0], [u, v, edge - 1]),
                    };
                    input.set(
                        input_cell[0],
                        input_cell[1],
                        input_cell[2],
                        neighbour.block(lod, neighbour_cell[0], neighbour_cell[1], neighbour_cell[2]),
                        neighbour.block_data(
                            lod,
                            neighbour_cell[0],
                            neighbour_cell[1],
                            neighbour_cell[2],
                        ),
                    );
                }
            }
        }

        Some(input)
    }

    fn apply_completed_meshes(&mut self) {
        for completed in self.mesher_pool.drain_completed() {
            let current_epoch = self
                .in_flight
                .get(&completed.chunk)
                .map(|&(_, epoch)| epoch);
            if current_epoch != Some(completed.epoch) {
                log::debug!("discarding stale mesh for chunk {:?}", completed.chunk);
                continue;
            }
            self.in_flight.remove(&completed.chunk);

            let (section_pos, rx, ry, cz) =
                split_chunk_coord(self.grid.section_size, completed.chunk);
            let Some(section) = self.index.section_mut(section_pos.x, section_pos.y) else {
                // section unloaded while the worker ran
                continue;
            };
            let Some(chunk) = section.chunk_mut(rx, ry, cz) else {
                continue;
            };

            let requeue = chunk.finish_mesh();
            chunk.set_render_lod(completed.lod);

            let proxy = match chunk.render_proxy() {
                Some(proxy) => Arc::clone(proxy),
                None => {
                    let proxy = ChunkRenderProxy::new(completed.chunk);
                    chunk.set_render_proxy(Some(Arc::clone(&proxy)));
                    self.renderer.send(RenderMessage::AddChunkProxy {
                        proxy: Arc::clone(&proxy),
                    });
                    proxy
                }
            };

            let mesh = Arc::new(completed.output);
            proxy.swap_mesh(Arc::clone(&mesh));
            section.remove_chunk_pending_mesh();
            self.renderer.send(RenderMessage::UpdateChunkMesh {
                proxy,
                mesh: Arc::clone(&mesh),
            });
            if !mesh.lights.is_empty() {
                self.renderer.send(RenderMessage::PointLights {
                    chunk: completed.chunk,
                    lights: mesh.lights.clone(),
                });
            }

            if requeue {
                self.request_remesh(completed.chunk);
            }
        }
    }

    // ------------------------------------------------------------------
    // bulk load/save

    /// Loads every section listed in the availability index down to
    /// `max_lod`.
    pub fn load_all_sections(&mut self, max_lod: u32) -> Result<(), WorldError> {
        for pos in self.index.available_positions() {
            if self.index.section(pos.x, pos.y).is_some() {
                if self.index.section(pos.x, pos.y).map_or(0, |s| s.loaded_lod()) > max_lod {
                    self.deepen_section(pos, max_lod);
                }
                continue;
            }
            let Some(storage) = &self.storage else {
                continue;
            };
            let section = storage.load_section_file(&self.grid, pos.x, pos.y, max_lod)?;
            for entity in section.entities() {
                self.entity_homes.insert(entity.id, Some(pos));
            }
            self.index.insert(Box::new(section));
        }
        Ok(())
    }

    /// Writes every changed section back to disk, then the index and the
    /// global entities.
    pub fn save_changed_sections(&mut self) -> Result<(), WorldError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        for pos in self.index.resident_positions() {
            let section = self.index.section(pos.x, pos.y).expect("resident");
            if !section.is_changed() || section.load_state() == LoadState::Generating {
                continue;
            }
            if section.loaded_lod() != 0 {
                return Err(WorldError::MismatchedConfig(format!(
                    "section ({}, {}) is dirty but not fully loaded",
                    pos.x, pos.y
                )));
            }
            storage.save_section_file(section)?;
            let section = self.index.section_mut(pos.x, pos.y).expect("resident");
            section.set_load_state(LoadState::Loaded);
            self.index.set_available(pos.x, pos.y, true);
        }

        let index_file = IndexFile {
            min_sx: self.index.min_sx,
            min_sy: self.index.min_sy,
            max_sx: self.index.max_sx,
            max_sy: self.index.max_sy,
            available: self.index.available.clone(),
        };
        storage.save_index_file(&index_file)?;
        storage.save_global_entities(&self.global_entities)?;
        Ok(())
    }

    pub fn unload_all_sections(&mut self) {
        for pos in self.index.resident_positions() {
            if !self.unload_section(pos.x, pos.y) {
                log::warn!(
                    "section ({}, {}) could not be saved during unload-all; dropping",
                    pos.x,
                    pos.y
                );
                if let Some(section) = self.index.remove(pos.x, pos.y) {
                    self.drop_section_state(section);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // entities

    fn home_for_position(&self, position: Point3<f32>) -> Option<SectionPos> {
        let pos = self.section_of_position(position);
        match self.index.section(pos.x, pos.y) {
            Some(section) if section.loaded_lod() == 0 => Some(pos),
            _ => None,
        }
    }

    /// Inserts an entity; its home is the section containing its position,
    /// or the global list when none is resident.
    pub fn add_entity(&mut self, record: EntityRecord) -> Result<()> {
        if self.entity_homes.contains_key(&record.id) {
            bail!("entity {} already exists", record.id);
        }

        let home = self.home_for_position(record.position());
        match home {
            Some(pos) => {
                self.index
                    .section_mut(pos.x, pos.y)
                    .expect("home is resident")
                    .add_entity(record.clone());
            }
            None => self.global_entities.push(record.clone()),
        }
        self.entity_homes.insert(record.id, home);
        Ok(())
    }

    /// Moves an entity, re-homing it when its position crosses a section
    /// boundary.
    pub fn move_entity(&mut self, id: EntityId, bounds: Aabb) -> Result<()> {
        let Some(&old_home) = self.entity_homes.get(&id) else {
            bail!("entity {id} is not tracked");
        };

        let new_home = self.home_for_position(bounds.center());
        if old_home == new_home {
            match old_home {
                Some(pos) => {
                    self.index
                        .section_mut(pos.x, pos.y)
                        .expect("home is resident")
                        .update_entity_bounds(id, bounds);
                }
                None => {
                    if let Some(entity) = self
                        .global_entities
                        .iter_mut()
                        .find(|entity| entity.id == id)
                    {
                        entity.bounds = bounds;
                    }
                }
            }
            return Ok(());
        }

        let mut record = match old_home {
            Some(pos) => self
                .index
                .section_mut(pos.x, pos.y)
                .expect("home is resident")
                .remove_entity(id)
                .ok_or_else(|| anyhow!("entity {id} missing from its home section"))?,
            None => {
                let index = self
                    .global_entities
                    .iter()
                    .position(|entity| entity.id == id)
                    .ok_or_else(|| anyhow!("entity {id} missing from the global list"))?;
                self.global_entities.swap_remove(index)
            }
        };
        record.bounds = bounds;

        match new_home {
            Some(pos) => self
                .index
                .section_mut(pos.x, pos.y)
                .expect("home is resident")
                .add_entity(record),
            None => self.global_entities.push(record),
        }
        self.entity_homes.insert(id, new_home);
        Ok(())
    }

    pub fn remove_entity(&mut self, id: EntityId) -> Result<EntityRecord> {
        let Some(home) = self.entity_homes.remove(&id) else {
            bail!("entity {id} is not tracked");
        };
        match home {
            Some(pos) => self
                .index
                .section_mut(pos.x, pos.y)
                .expect("home is resident")
                .remove_entity(id)
                .ok_or_else(|| anyhow!("entity {id} missing from its home section")),
            None => {
                let index = self
                    .global_entities
                    .iter()
                    .position(|entity| entity.id == id)
                    .ok_or_else(|| anyhow!("entity {id} missing from the global list"))?;
                Ok(self.global_entities.swap_remove(index))
            }
        }
    }

    pub fn entity_home(&self, id: EntityId) -> Option<Option<SectionPos>> {
        self.entity_homes.get(&id).copied()
    }

    // ------------------------------------------------------------------
    // block animations

    /// A cosmetic block gliding from `start` to the target cell; on expiry
    /// the block is written into the world.
    pub fn set_block_with_animation(
        &mut self,
        target: BlockPos,
        value: BlockValue,
        rotation: Rotation,
        start: Transform,
        spawn_time: f32,
        easing: Easing,
    ) {
        let end = Transform::to(target.origin());
        self.spawn_animation(BlockAnimation {
            value,
            rotation,
            target,
            proxy: self.make_block_proxy(value),
            lifetime: spawn_time,
            remaining: spawn_time,
            driver: AnimationDriver::Eased {
                start,
                end,
                easing,
            },
            set_on_expiry: true,
            current: start,
        });
    }

    /// Detaches a block into a physics-driven debris proxy; the block is
    /// removed from the world immediately and the proxy despawns after
    /// `despawn_time`.
    pub fn create_animated_physics_block(
        &mut self,
        pos: BlockPos,
        body: PhysicsBodyHandle,
        remove_block: bool,
        despawn_time: f32,
    ) -> Result<(), WorldError> {
        let value = self
            .block_value(pos)
            .filter(|&value| value != block::AIR)
            .ok_or(WorldError::OutOfRangeCoord(pos))?;
        if remove_block {
            self.clear_block(pos)?;
        }

        self.spawn_animation(BlockAnimation {
            value,
            rotation: Rotation::North,
            target: pos,
            proxy: self.make_block_proxy(value),
            lifetime: despawn_time,
            remaining: despawn_time,
            driver: AnimationDriver::Physics { body },
            set_on_expiry: false,
            current: Transform::to(pos.origin()),
        });
        Ok(())
    }

    pub fn set_animation_body_transform(&mut self, body: PhysicsBodyHandle, transform: Transform) {
        for animation in &mut self.animations {
            if animation.set_body_transform(body, transform) {
                animation.proxy.set_transform(transform.to_matrix());
            }
        }
    }

    pub fn animation_count(&self) -> usize {
        self.animations.len()
    }

    fn make_block_proxy(&self, value: BlockValue) -> Arc<BlockRenderProxy> {
        let mesh = Arc::new(mesh_single_block(&self.palette, value));
        let proxy = BlockRenderProxy::new(value, 0, mesh);
        self.renderer.send(RenderMessage::AddBlockProxy {
            proxy: Arc::clone(&proxy),
        });
        proxy
    }

    fn spawn_animation(&mut self, animation: BlockAnimation) {
        self.animations.push(animation);
    }

    fn update_animations(&mut self, dt: f32) {
        let mut animations = std::mem::take(&mut self.animations);
        let mut survivors = Vec::with_capacity(animations.len());

        for mut animation in animations.drain(..) {
            let expired = animation.advance(dt);
            self.renderer.send(RenderMessage::UpdateBlockTransform {
                proxy: Arc::clone(&animation.proxy),
                transform: animation.current.to_matrix(),
            });

            if !expired {
                survivors.push(animation);
                continue;
            }

            if animation.set_on_expiry {
                if let Err(err) = self.set_block_type(
                    animation.target,
                    animation.value,
                    animation.rotation,
                    true,
                ) {
                    log::error!("spawn animation could not place its block: {err}");
                }
            }
            self.renderer.send(RenderMessage::RemoveBlockProxy {
                proxy: animation.proxy,
            });
        }

        self.animations = survivors;
    }

    // ------------------------------------------------------------------
    // raycasts

    /// Steps through grid cells with a 3D DDA and tests each non-air cell
    /// against its shape. Returns the nearest hit within `max_distance`.
    pub fn raycast(
        &self,
        origin: Point3<f32>,
        direction: Vector3<f32>,
        max_distance: f32,
    ) -> Option<RaycastHit> {
        if direction.norm_squared() == 0.0 {
            return None;
        }
        let direction = direction.normalize();
        let mut current = self.point_of_position(origin);

        let step_x = direction.x.signum();
        let step_y = direction.y.signum();
        let step_z = direction.z.signum();

        let next_boundary = |coord: i32, step: f32| -> f32 {
            coord as f32 + if step < 0.0 { 0.0 } else { 1.0 }
        };

        let checked_div = |num: f32, denom: f32| -> f32 {
            if denom == 0.0 {
                f32::MAX
            } else {
                num / denom
            }
        };

        let mut t_max_x = checked_div(next_boundary(current.x, step_x) - origin.x, direction.x);
        let mut t_max_y = checked_div(next_boundary(current.y, step_y) - origin.y, direction.y);
        let mut t_max_z = checked_div(next_boundary(current.z, step_z) - origin.z, direction.z);

        let t_delta_x = checked_div(step_x, direction.x).abs();
        let t_delta_y = checked_div(step_y, direction.y).abs();
        let t_delta_z = checked_div(step_z, direction.z).abs();

        let step_x = step_x as i32;
        let step_y = step_y as i32;
        let step_z = step_z as i32;

        let mut entered_t = 0.0f32;
        let mut entered_side: Option<Side> = None;

        loop {
            if entered_t > max_distance {
                return None;
            }

            if let Some(value) = self.block_value(current) {
                if value != block::AIR {
                    if let Some(hit) =
                        self.raycast_cell(origin, direction, current, value, entered_side)
                    {
                        if hit.distance <= max_distance {
                            return Some(hit);
                        }
                        return None;
                    }
                }
            }

            if t_max_x < t_max_y && t_max_x < t_max_z {
                current.x += step_x;
                entered_t = t_max_x;
                t_max_x += t_delta_x;
                entered_side = Some(if step_x > 0 { Side::Left } else { Side::Right });
            } else if t_max_y < t_max_z {
                current.y += step_y;
                entered_t = t_max_y;
                t_max_y += t_delta_y;
                entered_side = Some(if step_y > 0 { Side::Front } else { Side::Back });
            } else {
                current.z += step_z;
                entered_t = t_max_z;
                t_max_z += t_delta_z;
                entered_side = Some(if step_z > 0 { Side::Bottom } else { Side::Top });
            }
        }
    }

    /// Precise per-shape test for one occupied cell.
    fn raycast_cell(
        &self,
        origin: Point3<f32>,
        direction: Vector3<f32>,
        cell: BlockPos,
        value: BlockValue,
        entered_side: Option<Side>,
    ) -> Option<RaycastHit> {
        let cell_min = cell.origin();
        let shape = self.palette.shape_of(value);

        let mut cell_box = Aabb::new(cell_min, cell_min + vector![1.0, 1.0, 1.0]);
        match shape {
            BlockShape::Slab => {
                let height = self
                    .palette
                    .get(value)
                    .map(|entry| entry.slab.height)
                    .unwrap_or(1.0);
                cell_box.max.z = cell_min.z + height;
            }
            BlockShape::Mesh => {
                return self.raycast_mesh_cell(origin, direction, cell, value);
            }
            // cubes use the cell box; other shapes fall back to it
            _ => {}
        }

        let distance = cell_box.intersect_ray(origin, direction)?;
        let face = if distance == 0.0 {
            None
        } else {
            Some(box_entry_face(&cell_box, origin, direction, distance).unwrap_or_else(|| {
                entered_side.unwrap_or(Side::Top)
            }))
        };
        Some(RaycastHit {
            block: cell,
            face,
            value,
            distance,
        })
    }

    fn raycast_mesh_cell(
        &self,
        origin: Point3<f32>,
        direction: Vector3<f32>,
        cell: BlockPos,
        value: BlockValue,
    ) -> Option<RaycastHit> {
        let entry = self.palette.get(value)?;
        let mesh = self.palette.mesh(entry.mesh.mesh_index)?;

        let (chunk_pos, local) = split_block_coord(self.grid.chunk_size, cell);
        let rotation = self
            .chunk(chunk_pos)
            .map(|chunk| chunk.rotation(0, local[0], local[1], local[2]))
            .unwrap_or_default();

        let cell_min = cell.origin();
        let center = cell_min + vector![0.5, 0.5, 0.0];
        let spin = nalgebra::UnitQuaternion::from_euler_angles(0.0, 0.0, rotation.angle());

        let mut nearest: Option<f32> = None;
        for triangle in &mesh.triangles {
            let transformed = [
                center + spin * triangle[0].coords,
                center + spin * triangle[1].coords,
                center + spin * triangle[2].coords,
            ];
            if let Some(distance) = ray_triangle(origin, direction, &transformed) {
                nearest = Some(match nearest {
                    Some(best) => util::min(best, distance),
                    None => distance,
                });
            }
        }

        nearest.map(|distance| RaycastHit {
            block: cell,
            face: None,
            value,
            distance,
        })
    }
}

fn box_entry_face(
    aabb: &Aabb,
    origin: Point3<f32>,
    direction: Vector3<f32>,
    distance: f32,
) -> Option<Side> {
    let hit = origin + direction * distance;
    let eps = 1e-4;
    if (hit.x - aabb.min.x).abs() < eps && direction.x > 0.0 {
        return Some(Side::Left);
    }
    if (hit.x - aabb.max.x).abs() < eps && direction.x < 0.0 {
        return Some(Side::Right);
    }
    if (hit.y - aabb.min.y).abs() < eps && direction.y > 0.0 {
        return Some(Side::Front);
    }
    if (hit.y - aabb.max.y).abs() < eps && direction.y < 0.0 {
        return Some(Side::Back);
    }
    if (hit.z - aabb.min.z).abs() < eps && direction.z > 0.0 {
        return Some(Side::Bottom);
    }
    if (hit.z - aabb.max.z).abs() < eps && direction.z < 0.0 {
        return Some(Side::Top);
    }
    None
}

/// Moller-Trumbore; backface hits count, which suits double-sided
/// collision meshes.
fn ray_triangle(
    origin: Point3<f32>,
    direction: Vector3<f32>,
    triangle: &[Point3<f32>; 3],
) -> Option<f32> {
    let edge1 = triangle[1] - triangle[0];
    let edge2 = triangle[2] - triangle[0];
    let h = direction.cross(&edge2);
    let a = edge1.dot(&h);
    if a.abs() < 1e-8 {
        return None;
    }

    let f = 1.0 / a;
    let s = origin - triangle[0];
    let u = f * s.dot(&h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(&edge1);
    let v = f * direction.dot(&q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = f * edge2.dot(&q);
    if t >= 0.0 {
        Some(t)
    } else {
        None
    }
}

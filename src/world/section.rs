use crate::{
    aabb::Aabb,
    render::ChunkRenderProxy,
    util::DwordBitSet,
    world::{
        chunk::Chunk,
        entity::{EntityId, EntityRecord},
        ChunkPos,
    },
};
use nalgebra::{point, vector};
use std::sync::Arc;

/// Whether a resident section matches its on-disk image.
///
/// `Loaded -> Changed` on any LOD-0 mutation, back to `Loaded` on a
/// successful save. `Generating` marks a section whose content is still
/// being produced by a world generator; the streaming scheduler will not
/// issue a disk load for it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LoadState {
    Loaded,
    Changed,
    Generating,
}

/// A section_size x section_size tile of chunks with a growable Z range.
/// The unit of streaming and persistence.
#[derive(Debug)]
pub struct Section {
    section_size: u32,
    chunk_size: u32,
    lod_levels: u32,
    sx: i32,
    sy: i32,
    base_chunk_x: i32,
    base_chunk_y: i32,

    min_cz: i32,
    max_cz: i32,
    chunks: Vec<Option<Box<Chunk>>>,
    availability: DwordBitSet,

    loaded_lod: u32,
    load_state: LoadState,
    entities: Vec<EntityRecord>,
    chunks_pending_mesh: u32,

    /// Seconds this section has been outside every observer's load radius.
    pub(crate) out_of_range_for: f32,
}

impl Section {
    /// A section with an initialized (empty) chunk array. `loaded_lod`
    /// starts at `lod_levels`; the create/load paths lower it.
    pub fn with_range(
        chunk_size: u32,
        section_size: u32,
        lod_levels: u32,
        sx: i32,
        sy: i32,
        min_cz: i32,
        max_cz: i32,
    ) -> Self {
        debug_assert!(min_cz <= max_cz);
        let count_z = (max_cz - min_cz + 1) as usize;
        let slot_count = (section_size * section_size) as usize * count_z;
        Self {
            section_size,
            chunk_size,
            lod_levels,
            sx,
            sy,
            base_chunk_x: sx * section_size as i32,
            base_chunk_y: sy * section_size as i32,
            min_cz,
            max_cz,
            chunks: (0..slot_count).map(|_| None).collect(),
            availability: DwordBitSet::with_len(slot_count),
            loaded_lod: lod_levels,
            load_state: LoadState::Loaded,
            entities: Vec::new(),
            chunks_pending_mesh: 0,
            out_of_range_for: 0.0,
        }
    }

    /// Editor path: an empty section that has never been on disk.
    pub fn create(
        chunk_size: u32,
        section_size: u32,
        lod_levels: u32,
        sx: i32,
        sy: i32,
        min_cz: i32,
        max_cz: i32,
    ) -> Self {
        let mut section =
            Self::with_range(chunk_size, section_size, lod_levels, sx, sy, min_cz, max_cz);
        section.loaded_lod = 0;
        section.load_state = LoadState::Changed;
        section
    }

    pub fn section_x(&self) -> i32 {
        self.sx
    }

    pub fn section_y(&self) -> i32 {
        self.sy
    }

    pub fn section_size(&self) -> u32 {
        self.section_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn lod_levels(&self) -> u32 {
        self.lod_levels
    }

    pub fn base_chunk_x(&self) -> i32 {
        self.base_chunk_x
    }

    pub fn base_chunk_y(&self) -> i32 {
        self.base_chunk_y
    }

    pub fn min_chunk_z(&self) -> i32 {
        self.min_cz
    }

    pub fn max_chunk_z(&self) -> i32 {
        self.max_cz
    }

    pub fn chunk_count_z(&self) -> u32 {
        (self.max_cz - self.min_cz + 1) as u32
    }

    pub fn slot_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn loaded_lod(&self) -> u32 {
        self.loaded_lod
    }

    pub(crate) fn set_loaded_lod(&mut self, lod: u32) {
        self.loaded_lod = lod;
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    pub fn set_load_state(&mut self, state: LoadState) {
        self.load_state = state;
    }

    pub fn is_changed(&self) -> bool {
        self.load_state != LoadState::Loaded
    }

    pub fn mark_changed(&mut self) {
        if self.load_state == LoadState::Loaded {
            self.load_state = LoadState::Changed;
        }
    }

    pub fn bounds(&self) -> Aabb {
        let blocks = (self.section_size * self.chunk_size) as f32;
        let min = point![
            self.base_chunk_x as f32 * self.chunk_size as f32,
            self.base_chunk_y as f32 * self.chunk_size as f32,
            (self.min_cz * self.chunk_size as i32) as f32
        ];
        let height = self.chunk_count_z() as f32 * self.chunk_size as f32;
        Aabb::new(min, min + vector![blocks, blocks, height])
    }

    pub fn availability(&self) -> &DwordBitSet {
        &self.availability
    }

    pub(crate) fn availability_mut(&mut self) -> &mut DwordBitSet {
        &mut self.availability
    }

    /// Slot index for relative chunk coordinates; `None` when `cz` is
    /// outside the current Z range.
    pub fn chunk_index(&self, rx: u32, ry: u32, cz: i32) -> Option<usize> {
        debug_assert!(rx < self.section_size && ry < self.section_size);
        if cz < self.min_cz || cz > self.max_cz {
            return None;
        }
        let area = (self.section_size * self.section_size) as usize;
        Some(
            (cz - self.min_cz) as usize * area
                + ry as usize * self.section_size as usize
                + rx as usize,
        )
    }

    pub fn is_chunk_available(&self, rx: u32, ry: u32, cz: i32) -> bool {
        self.chunk_index(rx, ry, cz)
            .map_or(false, |index| self.availability.get(index))
    }

    pub fn chunk(&self, rx: u32, ry: u32, cz: i32) -> Option<&Chunk> {
        let index = self.chunk_index(rx, ry, cz)?;
        self.chunks[index].as_deref()
    }

    pub fn chunk_mut(&mut self, rx: u32, ry: u32, cz: i32) -> Option<&mut Chunk> {
        let index = self.chunk_index(rx, ry, cz)?;
        self.chunks[index].as_deref_mut()
    }

    pub(crate) fn insert_loaded_chunk(&mut self, rx: u32, ry: u32, cz: i32, chunk: Box<Chunk>) {
        let index = self
            .chunk_index(rx, ry, cz)
            .expect("chunk outside section Z range");
        self.chunks[index] = Some(chunk);
        self.availability.set(index);
    }

    /// Creates an all-air chunk with every LOD resident. Grows the Z range
    /// when `cz` falls outside it. Only valid at LOD 0.
    pub fn create_chunk(&mut self, rx: u32, ry: u32, cz: i32) -> &mut Chunk {
        debug_assert_eq!(self.loaded_lod, 0, "section not editable above LOD 0");
        if cz < self.min_cz || cz > self.max_cz {
            self.resize_z(self.min_cz.min(cz), self.max_cz.max(cz));
        }

        let index = self.chunk_index(rx, ry, cz).expect("resize failed to cover cz");
        debug_assert!(!self.availability.get(index), "chunk slot already populated");

        let pos = ChunkPos {
            x: self.base_chunk_x + rx as i32,
            y: self.base_chunk_y + ry as i32,
            z: cz,
        };
        let mut chunk = Box::new(Chunk::new(self.chunk_size, self.lod_levels, pos));
        chunk.allocate_all();

        self.chunks[index] = Some(chunk);
        self.availability.set(index);
        self.mark_changed();
        self.chunks[index].as_deref_mut().expect("just inserted")
    }

    pub fn delete_chunk(&mut self, rx: u32, ry: u32, cz: i32) -> Option<Box<Chunk>> {
        debug_assert_eq!(self.loaded_lod, 0, "section not editable above LOD 0");
        let index = self.chunk_index(rx, ry, cz)?;
        if !self.availability.get(index) {
            return None;
        }
        let chunk = self.chunks[index].take();
        self.availability.unset(index);
        self.mark_changed();
        chunk
    }

    /// Reallocates the chunk array over a superset Z range, moving present
    /// chunks to their new slot indices. O(existing slots).
    pub fn resize_z(&mut self, min_cz: i32, max_cz: i32) {
        debug_assert!(min_cz <= max_cz);
        let area = (self.section_size * self.section_size) as usize;
        let new_count = area * (max_cz - min_cz + 1) as usize;

        let mut chunks: Vec<Option<Box<Chunk>>> = (0..new_count).map(|_| None).collect();
        let mut availability = DwordBitSet::with_len(new_count);

        let old_chunks = std::mem::take(&mut self.chunks);
        for (old_index, slot) in old_chunks.into_iter().enumerate() {
            if !self.availability.get(old_index) {
                continue;
            }
            let cz = self.min_cz + (old_index / area) as i32;
            if cz < min_cz || cz > max_cz {
                continue;
            }
            let new_index = (cz - min_cz) as usize * area + old_index % area;
            chunks[new_index] = slot;
            availability.set(new_index);
        }

        self.min_cz = min_cz;
        self.max_cz = max_cz;
        self.chunks = chunks;
        self.availability = availability;
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter_map(|slot| slot.as_deref())
    }

    pub fn chunks_mut(&mut self) -> impl Iterator<Item = &mut Chunk> {
        self.chunks.iter_mut().filter_map(|slot| slot.as_deref_mut())
    }

    pub fn chunk_count(&self) -> usize {
        self.availability.count_ones()
    }

    pub fn chunks_pending_mesh(&self) -> u32 {
        self.chunks_pending_mesh
    }

    pub(crate) fn add_chunk_pending_mesh(&mut self) {
        self.chunks_pending_mesh += 1;
    }

    pub(crate) fn remove_chunk_pending_mesh(&mut self) {
        debug_assert!(self.chunks_pending_mesh > 0);
        self.chunks_pending_mesh -= 1;
    }

    /// Re-derives every higher LOD of every chunk from its LOD 0 content.
    pub fn rebuild_lods(&mut self) {
        debug_assert_eq!(self.loaded_lod, 0);
        let chunk_size = self.chunk_size;
        for chunk in self.chunks_mut() {
            for z in (0..chunk_size).step_by(2) {
                for y in (0..chunk_size).step_by(2) {
                    for x in (0..chunk_size).step_by(2) {
                        chunk.update_lods(0, x, y, z);
                    }
                }
            }
        }
    }

    /// Drops every LOD level finer than `lod` from all chunks, releasing
    /// render proxies whose meshes were built at a now-unloaded level. The
    /// released proxies are returned so the caller can notify the renderer.
    pub fn unload_lods_below(&mut self, lod: u32) -> Vec<Arc<ChunkRenderProxy>> {
        debug_assert!(lod >= self.loaded_lod);

        let mut dropped = Vec::new();
        let mut warned = false;
        for chunk in self.chunks.iter_mut().filter_map(|slot| slot.as_deref_mut()) {
            if chunk.render_lod() < lod {
                if !warned {
                    log::warn!(
                        "unloading section [{}, {}] while render LODs are finer than {}; \
                         this will look jarring until the chunks are re-meshed",
                        self.sx,
                        self.sy,
                        lod
                    );
                    warned = true;
                }
                if let Some(proxy) = chunk.take_render_proxy() {
                    dropped.push(proxy);
                }
                chunk.set_render_lod(chunk.lod_levels());
            }
        }

        if lod > 0 && self.loaded_lod == 0 {
            self.entities.clear();
        }
        for level in self.loaded_lod..lod {
            for chunk in self.chunks.iter_mut().filter_map(|slot| slot.as_deref_mut()) {
                chunk.unload_lod(level);
            }
        }
        self.loaded_lod = lod;
        dropped
    }

    pub fn entities(&self) -> &[EntityRecord] {
        &self.entities
    }

    pub(crate) fn entities_mut(&mut self) -> &mut Vec<EntityRecord> {
        &mut self.entities
    }

    pub fn add_entity(&mut self, entity: EntityRecord) {
        debug_assert_eq!(self.loaded_lod, 0, "entities only exist at LOD 0");
        self.entities.push(entity);
        self.mark_changed();
    }

    pub fn update_entity_bounds(&mut self, id: EntityId, bounds: Aabb) -> bool {
        debug_assert_eq!(self.loaded_lod, 0);
        for entity in self.entities.iter_mut() {
            if entity.id == id {
                entity.bounds = bounds;
                self.load_state = match self.load_state {
                    LoadState::Loaded => LoadState::Changed,
                    other => other,
                };
                return true;
            }
        }
        false
    }

    pub fn remove_entity(&mut self, id: EntityId) -> Option<EntityRecord> {
        debug_assert_eq!(self.loaded_lod, 0);
        let index = self.entities.iter().position(|entity| entity.id == id)?;
        self.mark_changed();
        Some(self.entities.swap_remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aabb::Aabb;

    fn section() -> Section {
        Section::create(16, 4, 2, 0, 0, 0, 0)
    }

    #[test]
    fn create_chunk_sets_availability_and_changed() {
        let mut section = section();
        section.set_load_state(LoadState::Loaded);
        section.create_chunk(1, 2, 0);
        assert!(section.is_chunk_available(1, 2, 0));
        assert!(!section.is_chunk_available(0, 0, 0));
        assert_eq!(section.load_state(), LoadState::Changed);
        assert_eq!(section.chunk_count(), 1);
    }

    #[test]
    fn create_chunk_outside_z_range_resizes() {
        // scenario: a single edit 64 blocks up extends the column to cz = 4
        let mut section = section();
        section.create_chunk(0, 0, 0).set_block(0, 0, 0, 0, 1);
        section.create_chunk(0, 0, 4);
        assert_eq!(section.min_chunk_z(), 0);
        assert_eq!(section.max_chunk_z(), 4);
        assert_eq!(section.chunk_count_z(), 5);
        // the original chunk kept its content at its shifted index
        assert_eq!(section.chunk(0, 0, 0).unwrap().block(0, 0, 0, 0), 1);
        assert!(section.is_chunk_available(0, 0, 4));
    }

    #[test]
    fn resize_down_preserves_negative_range() {
        let mut section = section();
        section.create_chunk(3, 3, 0).set_block(0, 5, 5, 5, 9);
        section.create_chunk(3, 3, -2);
        assert_eq!(section.min_chunk_z(), -2);
        assert_eq!(section.chunk(3, 3, 0).unwrap().block(0, 5, 5, 5), 9);
        let pos = section.chunk(3, 3, -2).unwrap().pos();
        assert_eq!((pos.x, pos.y, pos.z), (3, 3, -2));
    }

    #[test]
    fn delete_chunk_clears_slot() {
        let mut section = section();
        section.create_chunk(0, 1, 0);
        assert!(section.delete_chunk(0, 1, 0).is_some());
        assert!(!section.is_chunk_available(0, 1, 0));
        assert!(section.delete_chunk(0, 1, 0).is_none());
        assert!(section.delete_chunk(0, 1, 7).is_none());
    }

    #[test]
    fn rebuild_lods_matches_incremental_updates() {
        let mut section = section();
        {
            let chunk = section.create_chunk(0, 0, 0);
            chunk.set_block(0, 4, 4, 4, 2);
            chunk.set_block(0, 9, 3, 1, 3);
        }
        section.rebuild_lods();
        let chunk = section.chunk(0, 0, 0).unwrap();
        assert_eq!(chunk.block(1, 2, 2, 2), 2);
        assert_eq!(chunk.block(1, 4, 1, 0), 3);
    }

    #[test]
    fn unload_lods_below_drops_fine_levels_and_entities() {
        let mut section = section();
        section.create_chunk(0, 0, 0);
        section.add_entity(EntityRecord {
            id: 7,
            class: "item".into(),
            bounds: Aabb::new(
                nalgebra::point![0.0, 0.0, 0.0],
                nalgebra::point![1.0, 1.0, 1.0],
            ),
            payload: Vec::new(),
        });

        section.unload_lods_below(1);
        assert_eq!(section.loaded_lod(), 1);
        assert!(section.entities().is_empty());
        let chunk = section.chunk(0, 0, 0).unwrap();
        assert!(!chunk.is_lod_loaded(0));
        assert!(chunk.is_lod_loaded(1));
    }

    #[test]
    fn entity_list_updates() {
        let bounds = Aabb::new(
            nalgebra::point![2.0, 2.0, 2.0],
            nalgebra::point![3.0, 3.0, 3.0],
        );
        let mut section = section();
        section.add_entity(EntityRecord {
            id: 1,
            class: "mob".into(),
            bounds,
            payload: Vec::new(),
        });
        assert!(section.update_entity_bounds(1, bounds.translated(nalgebra::vector![1.0, 0.0, 0.0])));
        assert!(!section.update_entity_bounds(2, bounds));
        assert_eq!(section.remove_entity(1).map(|entity| entity.id), Some(1));
        assert!(section.remove_entity(1).is_none());
    }
}

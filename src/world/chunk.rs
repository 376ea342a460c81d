use crate::{
    aabb::Aabb,
    codec::{ReadExt, WriteExt},
    render::ChunkRenderProxy,
    world::block::{self, BlockData, BlockValue, Rotation},
};
use nalgebra::{point, vector};
use std::{io, sync::Arc};

use super::ChunkPos;

pub const MAX_LOD_LEVELS: usize = 3;

/// Where a chunk sits in the re-mesh pipeline.
///
/// `Idle -> Pending` on edit or render-LOD change, `Pending -> InProgress`
/// when the mesher picks the chunk up. An edit that lands while a worker
/// holds the chunk's data moves to `InProgressWithChanges`, which re-enters
/// the queue once the stale result comes back.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum MeshState {
    #[default]
    Idle,
    Pending,
    InProgress,
    InProgressWithChanges,
}

#[derive(Debug)]
pub struct Chunk {
    chunk_size: u32,
    lod_levels: u32,
    pos: ChunkPos,
    base_position: nalgebra::Point3<f32>,
    bounds: Aabb,

    /// Arrays for LOD l exist iff `loaded_lod <= l < lod_levels`. Cell order
    /// is `z * edge^2 + y * edge + x`.
    values: [Option<Box<[BlockValue]>>; MAX_LOD_LEVELS],
    data: [Option<Box<[BlockData]>>; MAX_LOD_LEVELS],

    loaded_lod: u32,
    render_lod: u32,
    mesh_state: MeshState,
    render_proxy: Option<Arc<ChunkRenderProxy>>,
}

impl Chunk {
    /// A chunk starts with no resident LOD arrays; `allocate_all` or
    /// `load_lod_from` bring data in.
    pub fn new(chunk_size: u32, lod_levels: u32, pos: ChunkPos) -> Self {
        debug_assert!(lod_levels as usize <= MAX_LOD_LEVELS);
        let base_position = point![
            (pos.x * chunk_size as i32) as f32,
            (pos.y * chunk_size as i32) as f32,
            (pos.z * chunk_size as i32) as f32
        ];
        let extent = chunk_size as f32;
        Self {
            chunk_size,
            lod_levels,
            pos,
            base_position,
            bounds: Aabb::new(
                base_position,
                base_position + vector![extent, extent, extent],
            ),
            values: Default::default(),
            data: Default::default(),
            loaded_lod: lod_levels,
            render_lod: lod_levels,
            mesh_state: MeshState::Idle,
            render_proxy: None,
        }
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn lod_levels(&self) -> u32 {
        self.lod_levels
    }

    pub fn base_position(&self) -> nalgebra::Point3<f32> {
        self.base_position
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    #[inline(always)]
    pub fn edge(&self, lod: u32) -> u32 {
        self.chunk_size >> lod
    }

    #[inline(always)]
    fn cell_count(&self, lod: u32) -> usize {
        let edge = self.edge(lod) as usize;
        edge * edge * edge
    }

    #[inline(always)]
    fn index(&self, lod: u32, x: u32, y: u32, z: u32) -> usize {
        let edge = self.edge(lod);
        debug_assert!(x < edge && y < edge && z < edge);
        (z as usize * edge as usize + y as usize) * edge as usize + x as usize
    }

    pub fn loaded_lod(&self) -> u32 {
        self.loaded_lod
    }

    pub fn is_lod_loaded(&self, lod: u32) -> bool {
        lod < self.lod_levels && self.values[lod as usize].is_some()
    }

    pub fn render_lod(&self) -> u32 {
        self.render_lod
    }

    pub fn set_render_lod(&mut self, lod: u32) {
        self.render_lod = lod;
    }

    pub fn values(&self, lod: u32) -> Option<&[BlockValue]> {
        self.values[lod as usize].as_deref()
    }

    pub fn data(&self, lod: u32) -> Option<&[BlockData]> {
        self.data[lod as usize].as_deref()
    }

    /// Allocates zeroed arrays for every LOD level. The chunk is editable
    /// afterwards.
    pub fn allocate_all(&mut self) {
        for lod in 0..self.lod_levels {
            let count = self.cell_count(lod);
            self.values[lod as usize] = Some(vec![block::AIR; count].into_boxed_slice());
            self.data[lod as usize] = Some(vec![0; count].into_boxed_slice());
        }
        self.loaded_lod = 0;
    }

    #[inline(always)]
    pub fn block(&self, lod: u32, x: u32, y: u32, z: u32) -> BlockValue {
        let index = self.index(lod, x, y, z);
        self.values[lod as usize].as_ref().expect("block LOD not resident")[index]
    }

    #[inline(always)]
    pub fn set_block(&mut self, lod: u32, x: u32, y: u32, z: u32, value: BlockValue) {
        let index = self.index(lod, x, y, z);
        self.values[lod as usize].as_mut().expect("block LOD not resident")[index] = value;
    }

    #[inline(always)]
    pub fn block_data(&self, lod: u32, x: u32, y: u32, z: u32) -> BlockData {
        let index = self.index(lod, x, y, z);
        self.data[lod as usize].as_ref().expect("block LOD not resident")[index]
    }

    #[inline(always)]
    pub fn set_block_data(&mut self, lod: u32, x: u32, y: u32, z: u32, data: BlockData) {
        let index = self.index(lod, x, y, z);
        self.data[lod as usize].as_mut().expect("block LOD not resident")[index] = data;
    }

    pub fn light(&self, lod: u32, x: u32, y: u32, z: u32) -> u8 {
        block::light_level(self.block_data(lod, x, y, z))
    }

    pub fn set_light(&mut self, lod: u32, x: u32, y: u32, z: u32, light: u8) {
        let data = self.block_data(lod, x, y, z);
        self.set_block_data(lod, x, y, z, block::with_light_level(data, light));
    }

    pub fn rotation(&self, lod: u32, x: u32, y: u32, z: u32) -> Rotation {
        block::rotation(self.block_data(lod, x, y, z))
    }

    pub fn set_rotation(&mut self, lod: u32, x: u32, y: u32, z: u32, rotation: Rotation) {
        let data = self.block_data(lod, x, y, z);
        self.set_block_data(lod, x, y, z, block::with_rotation(data, rotation));
    }

    /// Refreshes every coarser LOD covering `(x, y, z)` at level `lod`. The
    /// representative of each 2x2x2 cell is the first non-air child in scan
    /// order (x fastest, then y, then z), which makes the down-sample
    /// deterministic and idempotent.
    pub fn update_lods(&mut self, lod: u32, x: u32, y: u32, z: u32) {
        if lod + 1 >= self.lod_levels {
            return;
        }

        let base = (x & !1, y & !1, z & !1);
        let mut value = self.block(lod, base.0, base.1, base.2);
        let mut data = self.block_data(lod, base.0, base.1, base.2);
        'scan: for dz in 0..2 {
            for dy in 0..2 {
                for dx in 0..2 {
                    let candidate = self.block(lod, base.0 + dx, base.1 + dy, base.2 + dz);
                    if candidate != block::AIR {
                        value = candidate;
                        data = self.block_data(lod, base.0 + dx, base.1 + dy, base.2 + dz);
                        break 'scan;
                    }
                }
            }
        }

        let next = (base.0 / 2, base.1 / 2, base.2 / 2);
        self.set_block(lod + 1, next.0, next.1, next.2, value);
        self.set_block_data(lod + 1, next.0, next.1, next.2, data);
        self.update_lods(lod + 1, next.0, next.1, next.2);
    }

    pub fn is_air_chunk(&self) -> bool {
        match self.values(0) {
            Some(values) => values.iter().all(|&value| value == block::AIR),
            None => false,
        }
    }

    /// Reads one LOD band: the value array then the data array, packed
    /// little-endian. Allocates the level if it was not resident.
    pub fn load_lod_from<R: io::Read>(&mut self, lod: u32, reader: &mut R) -> io::Result<()> {
        let count = self.cell_count(lod);
        let mut values = vec![block::AIR; count].into_boxed_slice();
        let mut data = vec![0u8; count].into_boxed_slice();
        reader.read_u16_slice_le(&mut values)?;
        reader.read_exact(&mut data)?;

        self.values[lod as usize] = Some(values);
        self.data[lod as usize] = Some(data);
        self.loaded_lod = self.loaded_lod.min(lod);
        Ok(())
    }

    pub fn save_lod_to<W: io::Write>(&self, lod: u32, writer: &mut W) -> io::Result<()> {
        let values = self.values[lod as usize]
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "LOD not resident"))?;
        let data = self.data[lod as usize]
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "LOD not resident"))?;
        writer.write_u16_slice_le(values)?;
        writer.write_all(data)?;
        Ok(())
    }

    /// Frees one LOD level and re-derives the loaded floor.
    pub fn unload_lod(&mut self, lod: u32) {
        self.values[lod as usize] = None;
        self.data[lod as usize] = None;

        if lod == self.loaded_lod {
            self.loaded_lod = (lod + 1..self.lod_levels)
                .find(|&level| self.values[level as usize].is_some())
                .unwrap_or(self.lod_levels);
        }
    }

    pub fn mesh_state(&self) -> MeshState {
        self.mesh_state
    }

    /// Flags the chunk for re-meshing. Returns true when this transition
    /// newly enqueued the chunk; edits racing a worker flip the state so the
    /// result gets rebuilt instead.
    pub fn mark_pending(&mut self) -> bool {
        match self.mesh_state {
            MeshState::Idle => {
                self.mesh_state = MeshState::Pending;
                true
            }
            MeshState::InProgress => {
                self.mesh_state = MeshState::InProgressWithChanges;
                false
            }
            MeshState::Pending | MeshState::InProgressWithChanges => false,
        }
    }

    pub fn begin_mesh(&mut self) {
        debug_assert_eq!(self.mesh_state, MeshState::Pending);
        self.mesh_state = MeshState::InProgress;
    }

    /// Returns true when the finished result is already stale and the chunk
    /// must be re-enqueued.
    pub fn finish_mesh(&mut self) -> bool {
        match self.mesh_state {
            MeshState::InProgressWithChanges => {
                self.mesh_state = MeshState::Pending;
                true
            }
            _ => {
                self.mesh_state = MeshState::Idle;
                false
            }
        }
    }

    pub fn render_proxy(&self) -> Option<&Arc<ChunkRenderProxy>> {
        self.render_proxy.as_ref()
    }

    pub fn set_render_proxy(&mut self, proxy: Option<Arc<ChunkRenderProxy>>) {
        self.render_proxy = proxy;
    }

    pub fn take_render_proxy(&mut self) -> Option<Arc<ChunkRenderProxy>> {
        self.render_proxy.take()
    }
}

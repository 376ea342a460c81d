//! Chunk meshing: input snapshots, output payloads and the worker pool.
//!
//! The mesher itself ([`generation`]) is a pure function of a
//! [`MesherInput`]; the world thread copies a padded block volume into the
//! input, hands it to the pool (or runs it inline when
//! `parallel_chunk_build` is off), and drains completions once per frame.

use crate::{
    aabb::{Aabb, Sphere},
    prelude::*,
    util::ChannelPair,
    world::{
        block::{BlockData, BlockValue},
        registry::BlockRegistry,
        ChunkPos,
    },
};
use nalgebra::{point, Matrix4, Point3, Vector3};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

pub mod generation;

pub use generation::{generate_mesh, mesh_single_block};

/// One terrain vertex. Tangent and normal are packed snorm8 vectors, byte
/// layout `x | y << 8 | z << 16 | w << 24` with `w` carrying the binormal
/// handedness.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Vertex {
    pub position: Point3<f32>,
    pub tex_coord: Vector3<f32>,
    pub color: u32,
    pub tangent: u32,
    pub normal: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Triangle {
    pub material_index: u32,
    pub indices: [u32; 3],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Batch {
    pub material_index: u32,
    pub start_index: u32,
    pub index_count: u32,
}

/// Instance transforms for one palette mesh, keyed by mesh index.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshInstances {
    pub mesh_index: u32,
    pub transforms: Vec<Matrix4<f32>>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PointLight {
    pub position: Point3<f32>,
    pub range: f32,
    pub inverse_range: f32,
    pub color: Vector3<f32>,
    pub falloff: f32,
    pub is_static: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MesherOutput {
    pub bounds: Aabb,
    pub sphere: Sphere,
    pub vertices: Vec<Vertex>,
    pub triangles: Vec<Triangle>,
    pub batches: Vec<Batch>,
    pub instances: Vec<MeshInstances>,
    pub lights: Vec<PointLight>,
}

impl Default for MesherOutput {
    fn default() -> Self {
        let origin = point![0.0, 0.0, 0.0];
        Self {
            bounds: Aabb::new(origin, origin),
            sphere: Sphere {
                center: origin,
                radius: 0.0,
            },
            vertices: Vec::new(),
            triangles: Vec::new(),
            batches: Vec::new(),
            instances: Vec::new(),
            lights: Vec::new(),
        }
    }
}

impl MesherOutput {
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty() && self.instances.is_empty()
    }
}

/// A padded block volume: the chunk's cells at one LOD plus a one-cell
/// border copied from the six face neighbours (or air where absent).
pub struct MesherInput {
    palette: Arc<BlockRegistry>,
    volume_edge: u32,
    lod: u32,
    base_position: Point3<f32>,
    generate_light_maps: bool,
    values: Box<[BlockValue]>,
    data: Box<[BlockData]>,
}

impl MesherInput {
    pub fn new(
        palette: Arc<BlockRegistry>,
        chunk_size: u32,
        lod: u32,
        base_position: Point3<f32>,
        generate_light_maps: bool,
    ) -> Self {
        let volume_edge = (chunk_size >> lod) + 2;
        let cells = (volume_edge as usize).pow(3);
        Self {
            palette,
            volume_edge,
            lod,
            base_position,
            generate_light_maps,
            values: vec![0; cells].into_boxed_slice(),
            data: vec![0; cells].into_boxed_slice(),
        }
    }

    pub fn palette(&self) -> &BlockRegistry {
        &self.palette
    }

    pub fn volume_edge(&self) -> u32 {
        self.volume_edge
    }

    pub fn lod(&self) -> u32 {
        self.lod
    }

    pub fn base_position(&self) -> Point3<f32> {
        self.base_position
    }

    pub fn generate_light_maps(&self) -> bool {
        self.generate_light_maps
    }

    #[inline(always)]
    fn index(&self, x: u32, y: u32, z: u32) -> usize {
        debug_assert!(x < self.volume_edge && y < self.volume_edge && z < self.volume_edge);
        ((z * self.volume_edge + y) * self.volume_edge + x) as usize
    }

    #[inline(always)]
    pub fn value_at(&self, x: u32, y: u32, z: u32) -> BlockValue {
        self.values[self.index(x, y, z)]
    }

    #[inline(always)]
    pub fn data_at(&self, x: u32, y: u32, z: u32) -> BlockData {
        self.data[self.index(x, y, z)]
    }

    /// Writes one cell in padded coordinates (the interior starts at 1).
    pub fn set(&mut self, x: u32, y: u32, z: u32, value: BlockValue, data: BlockData) {
        let index = self.index(x, y, z);
        self.values[index] = value;
        self.data[index] = data;
    }
}

/// A finished mesh travelling back to the world thread. `epoch` is the job
/// counter the world stamped at submission; a completion whose chunk has
/// since advanced is discarded without error.
pub struct CompletedMesh {
    pub chunk: ChunkPos,
    pub lod: u32,
    pub epoch: u64,
    pub output: MesherOutput,
}

pub struct MesherPool {
    pool: Option<ThreadPool>,
    completed: ChannelPair<CompletedMesh>,
}

impl MesherPool {
    pub fn new(parallel: bool) -> Result<Self> {
        let pool = if parallel {
            Some(ThreadPoolBuilder::new().build()?)
        } else {
            None
        };
        Ok(Self {
            pool,
            completed: ChannelPair::new(),
        })
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Queues a meshing job. In serial mode the job runs immediately and its
    /// completion is still delivered through the channel, so the caller's
    /// drain loop behaves identically either way.
    pub fn submit(&self, chunk: ChunkPos, lod: u32, epoch: u64, input: MesherInput) {
        let sender = self.completed.sender();
        let job = move || {
            let output = generation::generate_mesh(&input);
            let _ = sender.send(CompletedMesh {
                chunk,
                lod,
                epoch,
                output,
            });
        };

        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => job(),
        }
    }

    pub fn drain_completed(&self) -> Vec<CompletedMesh> {
        self.completed.rx.try_iter().collect()
    }

    /// Blocks until `count` completions have arrived (worker mode only);
    /// used by the scheduler when it must observe results this frame.
    pub fn wait_completed(&self, count: usize) -> Vec<CompletedMesh> {
        let mut completed = Vec::with_capacity(count);
        while completed.len() < count {
            match self.completed.rx.recv() {
                Ok(mesh) => completed.push(mesh),
                Err(_) => break,
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::registry::test_palette;

    fn single_stone_input() -> MesherInput {
        let palette = test_palette::build();
        let mut input = MesherInput::new(palette, 8, 0, point![0.0, 0.0, 0.0], false);
        input.set(1, 1, 1, test_palette::STONE, 0);
        input
    }

    #[test]
    fn serial_pool_completes_inline() {
        let pool = MesherPool::new(false).unwrap();
        assert!(!pool.is_parallel());
        pool.submit(ChunkPos { x: 0, y: 0, z: 0 }, 0, 1, single_stone_input());
        let completed = pool.drain_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].epoch, 1);
        assert_eq!(completed[0].output.triangles.len(), 12);
    }

    #[test]
    fn parallel_pool_delivers_through_channel() {
        let pool = MesherPool::new(true).unwrap();
        pool.submit(ChunkPos { x: 1, y: 2, z: 3 }, 0, 7, single_stone_input());
        let completed = pool.wait_completed(1);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].chunk, ChunkPos { x: 1, y: 2, z: 3 });
        assert_eq!(completed[0].output.vertices.len(), 24);
    }
}

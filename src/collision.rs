//! Per-chunk concave collision geometry.
//!
//! [`ChunkCollisionShape`] enumerates triangles overlapping a query AABB on
//! demand, straight from the chunk's LOD-0 block data. It never allocates
//! per-query and is read-only with respect to the chunk, so it may run
//! concurrently with meshing of other chunks; it must not race writes to the
//! same chunk.

use crate::{
    aabb::Aabb,
    util,
    world::{
        block,
        chunk::Chunk,
        registry::{BlockRegistry, BlockShape},
    },
    Side,
};
use nalgebra::{point, vector, Matrix4, Point3, Vector3};

/// Receives one triangle at a time. `side` is the cube face the triangle
/// belongs to and `triangle_index` is 0 or 1 within that face, so callers
/// can tell which face of which block was hit.
pub trait TriangleCallback {
    fn triangle(&mut self, vertices: &[Point3<f32>; 3], side: Side, triangle_index: u32);
}

impl<F> TriangleCallback for F
where
    F: FnMut(&[Point3<f32>; 3], Side, u32),
{
    fn triangle(&mut self, vertices: &[Point3<f32>; 3], side: Side, triangle_index: u32) {
        self(vertices, side, triangle_index)
    }
}

pub struct ChunkCollisionShape<'a> {
    chunk: &'a Chunk,
    palette: &'a BlockRegistry,
}

impl<'a> ChunkCollisionShape<'a> {
    pub fn new(chunk: &'a Chunk, palette: &'a BlockRegistry) -> Self {
        Self { chunk, palette }
    }

    /// Chunk-local bounds of the shape.
    pub fn local_bounds(&self) -> Aabb {
        let edge = self.chunk.chunk_size() as f32;
        Aabb::new(point![0.0, 0.0, 0.0], point![edge, edge, edge])
    }

    /// Calls `callback` for every collision triangle overlapping the given
    /// chunk-local AABB. Requires LOD 0 resident; coarser-only chunks
    /// produce nothing.
    pub fn process_triangles<C: TriangleCallback>(
        &self,
        aabb_min: Point3<f32>,
        aabb_max: Point3<f32>,
        callback: &mut C,
    ) {
        if self.chunk.loaded_lod() != 0 {
            return;
        }

        let edge = self.chunk.chunk_size() as i32;
        let clip = |value: f32| util::clamp(value.floor() as i32, 0, edge - 1) as u32;
        let (min_x, min_y, min_z) = (clip(aabb_min.x), clip(aabb_min.y), clip(aabb_min.z));
        let (max_x, max_y, max_z) = (clip(aabb_max.x), clip(aabb_max.y), clip(aabb_max.z));

        for z in min_z..=max_z {
            for y in min_y..=max_y {
                for x in min_x..=max_x {
                    let value = self.chunk.block(0, x, y, z);
                    if value == block::AIR {
                        continue;
                    }

                    let mut height = 1.0f32;
                    if !block::is_colored(value) {
                        let entry = match self.palette.get(value) {
                            Some(entry) => entry,
                            None => continue,
                        };
                        if !entry.flags.collidable {
                            continue;
                        }
                        match entry.shape {
                            BlockShape::Cube => {}
                            BlockShape::Slab => height = entry.slab.height,
                            BlockShape::Mesh => {
                                self.process_mesh_block(
                                    entry.mesh.mesh_index,
                                    x,
                                    y,
                                    z,
                                    aabb_min,
                                    aabb_max,
                                    callback,
                                );
                                continue;
                            }
                            // stairs and planes are not yet supported here
                            _ => continue,
                        }
                    }

                    emit_box_triangles(x, y, z, height, callback);
                }
            }
        }
    }

    /// Mesh-shaped blocks delegate to the palette mesh's own triangles,
    /// queried in mesh-local space and forwarded through the block's
    /// transform.
    fn process_mesh_block<C: TriangleCallback>(
        &self,
        mesh_index: u32,
        x: u32,
        y: u32,
        z: u32,
        aabb_min: Point3<f32>,
        aabb_max: Point3<f32>,
        callback: &mut C,
    ) {
        let mesh = match self.palette.mesh(mesh_index) {
            Some(mesh) => mesh,
            None => return,
        };

        let rotation = self.chunk.rotation(0, x, y, z);
        let transform = Matrix4::new_translation(&vector![
            x as f32 + 0.5,
            y as f32 + 0.5,
            z as f32
        ]) * Matrix4::new_rotation(Vector3::z() * rotation.angle());
        let inverse = match transform.try_inverse() {
            Some(inverse) => inverse,
            None => return,
        };

        let local_min = inverse.transform_point(&aabb_min);
        let local_max = inverse.transform_point(&aabb_max);
        let query = Aabb::new(
            point![
                util::min(local_min.x, local_max.x),
                util::min(local_min.y, local_max.y),
                util::min(local_min.z, local_max.z)
            ],
            point![
                util::max(local_min.x, local_max.x),
                util::max(local_min.y, local_max.y),
                util::max(local_min.z, local_max.z)
            ],
        );

        for (index, triangle) in mesh.triangles.iter().enumerate() {
            let bounds = Aabb::new(triangle[0], triangle[0])
                .union_point(&triangle[1])
                .union_point(&triangle[2]);
            if !bounds.intersects(&query) {
                continue;
            }
            let transformed = [
                transform.transform_point(&triangle[0]),
                transform.transform_point(&triangle[1]),
                transform.transform_point(&triangle[2]),
            ];
            callback.triangle(&transformed, Side::Top, index as u32);
        }
    }
}

/// The twelve triangles of an axis-aligned box occupying one cell, with the
/// top plane at `height`. Triangles are tagged with their face and a 0/1
/// index within the face.
fn emit_box_triangles<C: TriangleCallback>(x: u32, y: u32, z: u32, height: f32, callback: &mut C) {
    let (bx, by, bz) = (x as f32, y as f32, z as f32);

    // corner order: bottom front-left/front-right/back-left/back-right, then
    // the same four on the top plane
    let corners = [
        point![bx, by, bz],
        point![bx + 1.0, by, bz],
        point![bx, by + 1.0, bz],
        point![bx + 1.0, by + 1.0, bz],
        point![bx, by, bz + height],
        point![bx + 1.0, by, bz + height],
        point![bx, by + 1.0, bz + height],
        point![bx + 1.0, by + 1.0, bz + height],
    ];

    let faces: [(Side, [usize; 3], [usize; 3]); 6] = [
        (Side::Right, [5, 1, 3], [5, 3, 7]),
        (Side::Left, [4, 0, 2], [2, 4, 6]),
        (Side::Back, [6, 7, 2], [7, 3, 2]),
        (Side::Front, [0, 5, 4], [4, 1, 5]),
        (Side::Top, [6, 5, 7], [6, 4, 5]),
        (Side::Bottom, [0, 2, 3], [2, 3, 1]),
    ];

    for (side, first, second) in faces {
        callback.triangle(
            &[corners[first[0]], corners[first[1]], corners[first[2]]],
            side,
            0,
        );
        callback.triangle(
            &[corners[second[0]], corners[second[1]], corners[second[2]]],
            side,
            1,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{
        block::{with_rotation, Rotation},
        chunk::Chunk,
        registry::test_palette,
        ChunkPos,
    };

    struct Collector {
        triangles: Vec<([Point3<f32>; 3], Side, u32)>,
    }

    impl Collector {
        fn new() -> Self {
            Self {
                triangles: Vec::new(),
            }
        }
    }

    impl TriangleCallback for Collector {
        fn triangle(&mut self, vertices: &[Point3<f32>; 3], side: Side, index: u32) {
            self.triangles.push((*vertices, side, index));
        }
    }

    fn chunk_with(value: u16, at: (u32, u32, u32)) -> Chunk {
        let mut chunk = Chunk::new(16, 1, ChunkPos { x: 0, y: 0, z: 0 });
        chunk.allocate_all();
        chunk.set_block(0, at.0, at.1, at.2, value);
        chunk
    }

    #[test]
    fn cube_emits_twelve_tagged_triangles() {
        let palette = test_palette::build();
        let chunk = chunk_with(test_palette::STONE, (2, 3, 4));
        let shape = ChunkCollisionShape::new(&chunk, &palette);

        let mut collector = Collector::new();
        shape.process_triangles(point![2.0, 3.0, 4.0], point![3.0, 4.0, 5.0], &mut collector);

        assert_eq!(collector.triangles.len(), 12);
        for side in Side::ALL {
            let face_triangles: Vec<_> = collector
                .triangles
                .iter()
                .filter(|(_, s, _)| *s == side)
                .collect();
            assert_eq!(face_triangles.len(), 2);
            assert_ne!(face_triangles[0].2, face_triangles[1].2);
        }

        // every vertex lies inside the cell
        let cell = Aabb::new(point![2.0, 3.0, 4.0], point![3.0, 4.0, 5.0]);
        for (vertices, _, _) in &collector.triangles {
            for vertex in vertices {
                assert!(cell.contains(vertex));
            }
        }
    }

    #[test]
    fn aabb_clipping_skips_far_blocks() {
        let palette = test_palette::build();
        let mut chunk = chunk_with(test_palette::STONE, (0, 0, 0));
        chunk.set_block(0, 10, 10, 10, test_palette::STONE);
        let shape = ChunkCollisionShape::new(&chunk, &palette);

        let mut collector = Collector::new();
        shape.process_triangles(point![0.0, 0.0, 0.0], point![0.9, 0.9, 0.9], &mut collector);
        assert_eq!(collector.triangles.len(), 12);
    }

    #[test]
    fn slab_triangles_respect_height() {
        let palette = test_palette::build();
        let chunk = chunk_with(test_palette::SLAB, (1, 1, 1));
        let shape = ChunkCollisionShape::new(&chunk, &palette);

        let mut collector = Collector::new();
        shape.process_triangles(point![1.0, 1.0, 1.0], point![2.0, 2.0, 2.0], &mut collector);
        assert_eq!(collector.triangles.len(), 12);
        let max_z = collector
            .triangles
            .iter()
            .flat_map(|(vertices, _, _)| vertices.iter())
            .map(|vertex| vertex.z)
            .fold(f32::MIN, f32::max);
        assert!((max_z - 1.5).abs() < 1e-6);
    }

    #[test]
    fn non_collidable_and_unsupported_shapes_are_skipped() {
        let palette = test_palette::build();
        let mut chunk = chunk_with(test_palette::WATER, (1, 1, 1));
        chunk.set_block(0, 2, 1, 1, test_palette::PLANE);
        chunk.set_block(0, 3, 1, 1, test_palette::STAIRS);
        let shape = ChunkCollisionShape::new(&chunk, &palette);

        let mut collector = Collector::new();
        shape.process_triangles(point![0.0, 0.0, 0.0], point![16.0, 16.0, 16.0], &mut collector);
        // water is not collidable, planes and stairs are skipped at the
        // collision layer
        assert!(collector.triangles.is_empty());
    }

    #[test]
    fn colored_blocks_collide_as_full_cubes() {
        let palette = test_palette::build();
        let chunk = chunk_with(block::pack_colored(255, 0, 0), (5, 5, 5));
        let shape = ChunkCollisionShape::new(&chunk, &palette);

        let mut collector = Collector::new();
        shape.process_triangles(point![5.0, 5.0, 5.0], point![6.0, 6.0, 6.0], &mut collector);
        assert_eq!(collector.triangles.len(), 12);
    }

    #[test]
    fn mesh_blocks_forward_transformed_mesh_triangles() {
        let palette = test_palette::build();
        let mut chunk = chunk_with(test_palette::MESH, (4, 4, 4));
        chunk.set_block_data(0, 4, 4, 4, with_rotation(0, Rotation::North));
        let shape = ChunkCollisionShape::new(&chunk, &palette);

        let mut collector = Collector::new();
        shape.process_triangles(point![4.0, 4.0, 4.0], point![5.0, 5.0, 5.0], &mut collector);
        assert_eq!(collector.triangles.len(), 1);

        // the statue triangle is authored around its local origin; it lands
        // on the cell center
        let (vertices, _, _) = &collector.triangles[0];
        for vertex in vertices {
            assert!(vertex.x >= 4.0 && vertex.x <= 5.0);
            assert!(vertex.y >= 4.0 && vertex.y <= 5.0);
            assert!(vertex.z >= 4.0 && vertex.z <= 5.0);
        }
    }

    #[test]
    fn coarse_only_chunks_produce_nothing() {
        let palette = test_palette::build();
        let mut chunk = Chunk::new(16, 2, ChunkPos { x: 0, y: 0, z: 0 });
        chunk.allocate_all();
        chunk.set_block(0, 0, 0, 0, test_palette::STONE);
        chunk.unload_lod(0);
        let shape = ChunkCollisionShape::new(&chunk, &palette);

        let mut collector = Collector::new();
        shape.process_triangles(point![0.0, 0.0, 0.0], point![16.0, 16.0, 16.0], &mut collector);
        assert!(collector.triangles.is_empty());
    }

    #[test]
    fn collision_extents_match_mesher_bounds() {
        // render/collision agreement on a fully solid cube
        use crate::mesher::{generate_mesh, MesherInput};

        let palette = test_palette::build();
        let chunk = chunk_with(test_palette::STONE, (3, 3, 3));

        let mut input = MesherInput::new(
            std::sync::Arc::clone(&palette),
            16,
            0,
            point![0.0, 0.0, 0.0],
            false,
        );
        input.set(4, 4, 4, test_palette::STONE, 0);
        let mesh_bounds = generate_mesh(&input).bounds;

        let shape = ChunkCollisionShape::new(&chunk, &palette);
        let mut collector = Collector::new();
        shape.process_triangles(point![3.0, 3.0, 3.0], point![4.0, 4.0, 4.0], &mut collector);

        let tolerant = mesh_bounds.inflate(1e-5);
        for (vertices, _, _) in &collector.triangles {
            for vertex in vertices {
                assert!(tolerant.contains(vertex));
            }
        }
    }
}

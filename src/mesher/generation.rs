//! Face culling, greedy merging and per-shape quad emission.
//!
//! [`generate_mesh`] drives three passes over a padded input volume: a face
//! mask pass that decides which of the six faces of every cell survive
//! occlusion, a sweep pass that grows merged quads out of cells whose face
//! bits are still set, and a finalization pass that orders triangles by
//! material and derives the batch list.

use super::{Batch, MeshInstances, MesherInput, MesherOutput, PointLight, Triangle, Vertex};
use crate::{
    aabb::{Aabb, Sphere},
    world::{
        block::{self, BlockValue, Rotation},
        registry::{BlockRegistry, BlockShape, BlockType, FaceVisual},
    },
    Side,
};
use nalgebra::{point, vector, Matrix4, Point3, UnitQuaternion, Vector3};

// Packed snorm8 tangent/normal per face, byte layout x | y<<8 | z<<16 | w<<24.
// The tangent's w byte carries the binormal handedness.
#[rustfmt::skip]
const FACE_PACKED_TANGENTS: [u32; 6] = [
    0x7F00_8100, // Right  (0, -1, 0)
    0x8100_8100, // Left   (0, -1, 0)
    0x7F00_007F, // Back   (1, 0, 0)
    0x8100_007F, // Front  (1, 0, 0)
    0x8100_007F, // Top    (1, 0, 0)
    0x7F00_007F, // Bottom (1, 0, 0)
];

#[rustfmt::skip]
const FACE_PACKED_NORMALS: [u32; 6] = [
    0x0000_007F, // Right  (1, 0, 0)
    0x0000_0081, // Left   (-1, 0, 0)
    0x0000_7F00, // Back   (0, 1, 0)
    0x0000_8100, // Front  (0, -1, 0)
    0x007F_0000, // Top    (0, 0, 1)
    0x0081_0000, // Bottom (0, 0, -1)
];

#[inline(always)]
fn pack_snorm8(value: f32) -> u32 {
    ((value.clamp(-1.0, 1.0) * 127.0).round() as i32 as u8) as u32
}

fn pack_unit_vector(v: Vector3<f32>, w: f32) -> u32 {
    pack_snorm8(v.x) | (pack_snorm8(v.y) << 8) | (pack_snorm8(v.z) << 16) | (pack_snorm8(w) << 24)
}

/// Face colour: the palette face's RGB (or the tint of a coloured value)
/// with the light level scaled into the alpha byte.
fn cube_vertex_color(entry: Option<&BlockType>, side: Side, value: BlockValue, light: u32) -> u32 {
    let rgb = match entry {
        Some(entry) => entry.faces[side].rgb_bits(),
        None => {
            let [r, g, b] = block::colored_rgb(value);
            (r as u32) | ((g as u32) << 8) | ((b as u32) << 16)
        }
    };
    rgb | ((light * 10).min(255) << 24)
}

fn plane_vertex_color(visual: &FaceVisual, light: u32) -> u32 {
    visual.rgb_bits() | ((light * 10).min(255) << 24)
}

/// Does the block at `(x, y, z)` show its `face`? Decided entirely by the
/// neighbour cell on the far side of that face.
fn face_visible(input: &MesherInput, x: u32, y: u32, z: u32, value: BlockValue, face: Side) -> bool {
    let normal: Vector3<i32> = face.normal();
    let neighbour = input.value_at(
        (x as i32 + normal.x) as u32,
        (y as i32 + normal.y) as u32,
        (z as i32 + normal.z) as u32,
    );

    if neighbour == block::AIR {
        return true;
    }
    if block::is_colored(neighbour) {
        return false;
    }

    let entry = match input.palette().get(neighbour) {
        Some(entry) => entry,
        None => return true,
    };

    match entry.shape {
        BlockShape::Cube => {
            if entry.flags.volume_cube && neighbour == value {
                return false;
            }
            !entry.flags.blocks_visibility
        }
        BlockShape::Slab => {
            if entry.flags.volume_cube && neighbour == value {
                return false;
            }
            // a slab only seals the face below it
            if face == Side::Top {
                return !entry.flags.blocks_visibility;
            }
            true
        }
        BlockShape::Stairs => {
            // stairs seal the face below and the face behind them
            if face == Side::Top || face == Side::Front {
                return !entry.flags.blocks_visibility;
            }
            true
        }
        BlockShape::Plane | BlockShape::Mesh => true,
    }
}

/// Light level for a face, sampled from the neighbour cell it opens onto.
fn face_light(input: &MesherInput, x: u32, y: u32, z: u32, face: Side) -> u32 {
    if !input.generate_light_maps() {
        return block::MAX_LIGHT_LEVEL as u32;
    }
    let normal: Vector3<i32> = face.normal();
    let data = input.data_at(
        (x as i32 + normal.x) as u32,
        (y as i32 + normal.y) as u32,
        (z as i32 + normal.z) as u32,
    );
    block::light_level(data) as u32
}

struct MeshBuilder<'a> {
    input: &'a MesherInput,
    palette: &'a BlockRegistry,
    face_masks: Vec<u8>,
    output: MesherOutput,
    bounds: Option<Aabb>,
}

impl<'a> MeshBuilder<'a> {
    fn new(input: &'a MesherInput) -> Self {
        let edge = input.volume_edge() as usize;
        Self {
            input,
            palette: input.palette(),
            face_masks: vec![0; edge * edge * edge],
            output: MesherOutput::default(),
            bounds: None,
        }
    }

    #[inline(always)]
    fn mask_index(&self, x: u32, y: u32, z: u32) -> usize {
        let edge = self.input.volume_edge();
        ((z * edge + y) * edge + x) as usize
    }

    fn compute_face_masks(&mut self) {
        let interior = 1..self.input.volume_edge() - 1;
        for z in interior.clone() {
            for y in interior.clone() {
                for x in interior.clone() {
                    let value = self.input.value_at(x, y, z);
                    if value == block::AIR {
                        continue;
                    }

                    let mut mask = 0u8;
                    Side::enumerate(|face| {
                        if face_visible(self.input, x, y, z, value, face) {
                            mask |= face.bit();
                        }
                    });

                    if !block::is_colored(value) {
                        if let Some(entry) = self.palette.get(value) {
                            match entry.shape {
                                // a slab's top is flush only against another
                                // slab of the same type
                                BlockShape::Slab if mask & Side::Top.bit() == 0 => {
                                    if self.input.value_at(x, y, z + 1) != value {
                                        mask |= Side::Top.bit();
                                    }
                                }
                                // stair treads survive unless the stair is
                                // completely hidden
                                BlockShape::Stairs if mask != 0 => {
                                    mask |= Side::Top.bit();
                                }
                                _ => {}
                            }
                        }
                    }

                    let index = self.mask_index(x, y, z);
                    self.face_masks[index] = mask;
                }
            }
        }
    }

    fn union_cells(&mut self, lod: u32, min_cell: [u32; 3], max_cell: [u32; 3]) {
        let base = self.input.base_position();
        let min = point![
            base.x + ((min_cell[0] << lod) as f32),
            base.y + ((min_cell[1] << lod) as f32),
            base.z + ((min_cell[2] << lod) as f32)
        ];
        let max = point![
            base.x + (((max_cell[0] + 1) << lod) as f32),
            base.y + (((max_cell[1] + 1) << lod) as f32),
            base.z + (((max_cell[2] + 1) << lod) as f32)
        ];
        let quad = Aabb::new(min, max);
        self.bounds = Some(match self.bounds {
            Some(bounds) => bounds.union(&quad),
            None => quad,
        });
    }

    fn emit_blocks(&mut self) {
        let lod = self.input.lod();
        let base = self.input.base_position();
        let limit = self.input.volume_edge() - 1;

        for z in 1..limit {
            for y in 1..limit {
                for x in 1..limit {
                    let value = self.input.value_at(x, y, z);
                    if value == block::AIR {
                        continue;
                    }

                    let data = self.input.data_at(x, y, z);
                    let rotation = block::rotation(data);
                    let entry = self.palette.get(value);
                    let shape = match entry {
                        Some(entry) => entry.shape,
                        None => BlockShape::Cube,
                    };

                    match shape {
                        BlockShape::Cube | BlockShape::Slab => {
                            self.sweep_tiling_block(x, y, z, value, rotation, entry, shape);
                        }
                        BlockShape::Stairs => {
                            let mask_index = self.mask_index(x, y, z);
                            if self.face_masks[mask_index] != 0 {
                                self.face_masks[mask_index] = 0;
                                let entry = entry.expect("stairs are always typed");
                                let cell = [x - 1, y - 1, z - 1];
                                Side::enumerate(|face| {
                                    let light = face_light(self.input, x, y, z, face);
                                    emit_stair_face(
                                        entry,
                                        value,
                                        light,
                                        rotation,
                                        base,
                                        lod,
                                        cell,
                                        face,
                                        &mut self.output,
                                    );
                                });
                                self.union_cells(lod, cell, cell);
                            }
                        }
                        BlockShape::Plane | BlockShape::Mesh => {
                            let mask_index = self.mask_index(x, y, z);
                            if self.face_masks[mask_index] != 0 {
                                self.face_masks[mask_index] = 0;
                                let entry = entry.expect("planes and meshes are always typed");
                                let light = face_light(self.input, x, y, z, Side::Right);
                                let cell = [x - 1, y - 1, z - 1];
                                if shape == BlockShape::Plane {
                                    emit_plane(
                                        entry,
                                        light,
                                        rotation,
                                        base,
                                        lod,
                                        cell,
                                        &mut self.output,
                                    );
                                    self.union_cells(lod, cell, cell);
                                } else {
                                    emit_mesh_instance(
                                        entry,
                                        rotation,
                                        base,
                                        lod,
                                        cell,
                                        &mut self.output,
                                    );
                                }
                            }
                        }
                    }

                    // point lights only exist at full detail
                    if lod == 0 {
                        if let Some(entry) = entry {
                            if entry.flags.point_light_emitter {
                                emit_light(entry, base, lod, [x - 1, y - 1, z - 1], &mut self.output);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Greedy expansion for cube- and slab-shaped blocks starting at one
    /// padded cell. Merges along the sweep axes while value, rotation, face
    /// bit and face light all agree.
    fn sweep_tiling_block(
        &mut self,
        x: u32,
        y: u32,
        z: u32,
        value: BlockValue,
        rotation: Rotation,
        entry: Option<&BlockType>,
        shape: BlockShape,
    ) {
        let lod = self.input.lod();
        let base = self.input.base_position();
        let limit = self.input.volume_edge() - 1;

        // slabs only stack into vertical runs when they behave as volumes
        let can_tile_z = match shape {
            BlockShape::Cube => true,
            BlockShape::Slab => entry.map_or(false, |entry| entry.flags.volume_cube),
            _ => false,
        };

        for face in Side::ALL {
            let face_bit = face.bit();
            if self.face_masks[self.mask_index(x, y, z)] & face_bit == 0 {
                continue;
            }

            let light = face_light(self.input, x, y, z, face);

            let (sweep0, sweep1): (usize, Option<usize>) = match face {
                Side::Right | Side::Left => (1, can_tile_z.then_some(2)),
                Side::Back | Side::Front => (0, can_tile_z.then_some(2)),
                Side::Top | Side::Bottom => (1, Some(0)),
            };

            let start = [x, y, z];
            let mut end = start;

            let matches = |this: &Self, coords: [u32; 3]| {
                let (cx, cy, cz) = (coords[0], coords[1], coords[2]);
                this.input.value_at(cx, cy, cz) == value
                    && this.face_masks[this.mask_index(cx, cy, cz)] & face_bit != 0
                    && block::rotation(this.input.data_at(cx, cy, cz)) == rotation
                    && face_light(this.input, cx, cy, cz, face) == light
            };

            // first sweep axis, then the second while whole rows agree
            let mut probe = start;
            for next in start[sweep0] + 1..limit {
                probe[sweep0] = next;
                if matches(self, probe) {
                    end[sweep0] += 1;
                } else {
                    break;
                }
            }

            if let Some(sweep1) = sweep1 {
                'rows: for next in start[sweep1] + 1..limit {
                    probe[sweep1] = next;
                    for row in start[sweep0]..=end[sweep0] {
                        probe[sweep0] = row;
                        if !matches(self, probe) {
                            break 'rows;
                        }
                    }
                    end[sweep1] += 1;
                }
            }

            for cz in start[2]..=end[2] {
                for cy in start[1]..=end[1] {
                    for cx in start[0]..=end[0] {
                        let index = self.mask_index(cx, cy, cz);
                        self.face_masks[index] &= !face_bit;
                    }
                }
            }

            let quad_start = [start[0] - 1, start[1] - 1, start[2] - 1];
            let quad_end = [end[0] - 1, end[1] - 1, end[2] - 1];
            match shape {
                BlockShape::Cube => emit_cube_face(
                    entry,
                    value,
                    light,
                    rotation,
                    base,
                    lod,
                    quad_start,
                    quad_end,
                    face,
                    &mut self.output,
                ),
                BlockShape::Slab => {
                    // the run's top slab loses its upper sliver unless another
                    // slab of the same type continues above it
                    let is_top_slab = self.input.value_at(end[0], end[1], end[2] + 1) != value;
                    emit_slab_face(
                        entry.expect("slabs are always typed"),
                        value,
                        light,
                        rotation,
                        base,
                        lod,
                        quad_start,
                        quad_end,
                        face,
                        is_top_slab,
                        &mut self.output,
                    );
                }
                _ => unreachable!("only tiling shapes reach the sweep"),
            }
            self.union_cells(lod, quad_start, quad_end);
        }
    }

    fn finalize(mut self) -> MesherOutput {
        if let Some(bounds) = self.bounds {
            self.output.bounds = bounds;
            self.output.sphere = Sphere::enclosing(&bounds);
        }
        finalize_batches(&mut self.output);
        self.output
    }
}

/// Orders triangles so that every material's triangles are contiguous, then
/// derives run-length batches from the ordering.
fn finalize_batches(output: &mut MesherOutput) {
    output
        .triangles
        .sort_by_key(|triangle| (triangle.material_index, triangle.indices));

    debug_assert!(output.batches.is_empty());
    if output.triangles.is_empty() {
        return;
    }

    let mut batch = Batch {
        material_index: output.triangles[0].material_index,
        start_index: 0,
        index_count: 0,
    };
    for (index, triangle) in output.triangles.iter().enumerate() {
        if triangle.material_index == batch.material_index {
            batch.index_count += 3;
        } else {
            output.batches.push(batch);
            batch = Batch {
                material_index: triangle.material_index,
                start_index: index as u32 * 3,
                index_count: 3,
            };
        }
    }
    output.batches.push(batch);
}

/// Generates the full render payload for one padded chunk volume. Pure: the
/// same input always produces the same output, byte for byte.
pub fn generate_mesh(input: &MesherInput) -> MesherOutput {
    let mut builder = MeshBuilder::new(input);
    builder.compute_face_masks();
    builder.emit_blocks();
    builder.finalize()
}

/// A one-block mesh at the origin, used for animated-block proxies.
pub fn mesh_single_block(palette: &BlockRegistry, value: BlockValue) -> MesherOutput {
    let mut output = MesherOutput::default();
    let entry = palette.get(value);
    let shape = match entry {
        Some(entry) => entry.shape,
        None if block::is_colored(value) => BlockShape::Cube,
        None => return output,
    };

    let origin = point![0.0, 0.0, 0.0];
    let light = block::MAX_LIGHT_LEVEL as u32;
    match shape {
        BlockShape::Cube => Side::enumerate(|face| {
            emit_cube_face(
                entry,
                value,
                light,
                Rotation::North,
                origin,
                0,
                [0; 3],
                [0; 3],
                face,
                &mut output,
            );
        }),
        BlockShape::Slab => Side::enumerate(|face| {
            emit_slab_face(
                entry.expect("slabs are always typed"),
                value,
                light,
                Rotation::North,
                origin,
                0,
                [0; 3],
                [0; 3],
                face,
                true,
                &mut output,
            );
        }),
        BlockShape::Stairs => Side::enumerate(|face| {
            emit_stair_face(
                entry.expect("stairs are always typed"),
                value,
                light,
                Rotation::North,
                origin,
                0,
                [0; 3],
                face,
                &mut output,
            );
        }),
        BlockShape::Plane => {
            emit_plane(
                entry.expect("planes are always typed"),
                light,
                Rotation::North,
                origin,
                0,
                [0; 3],
                &mut output,
            );
        }
        BlockShape::Mesh => {
            emit_mesh_instance(
                entry.expect("meshes are always typed"),
                Rotation::North,
                origin,
                0,
                [0; 3],
                &mut output,
            );
        }
    }

    output.bounds = Aabb::new(origin, point![1.0, 1.0, 1.0]);
    output.sphere = Sphere::enclosing(&output.bounds);
    finalize_batches(&mut output);
    output
}

// Quad corners arrive in (top-left, top-right, bottom-left, bottom-right)
// order; the two winding patterns below keep every face fronting outwards.
fn push_quad(
    output: &mut MesherOutput,
    material_index: u32,
    side: Side,
    color: u32,
    corners: [(Point3<f32>, Vector3<f32>); 4],
) {
    let base_vertex = output.vertices.len() as u32;
    for (position, tex_coord) in corners {
        output.vertices.push(Vertex {
            position,
            tex_coord,
            color,
            tangent: FACE_PACKED_TANGENTS[side.index()],
            normal: FACE_PACKED_NORMALS[side.index()],
        });
    }

    let winding: [[u32; 3]; 2] = match side {
        Side::Right | Side::Back | Side::Bottom => [[0, 1, 2], [1, 3, 2]],
        Side::Left | Side::Front | Side::Top => [[0, 2, 1], [1, 2, 3]],
    };
    for triangle in winding {
        output.triangles.push(Triangle {
            material_index,
            indices: [
                base_vertex + triangle[0],
                base_vertex + triangle[1],
                base_vertex + triangle[2],
            ],
        });
    }
}

struct QuadUvs {
    top_left: Vector3<f32>,
    top_right: Vector3<f32>,
    bottom_left: Vector3<f32>,
    bottom_right: Vector3<f32>,
}

/// UV rectangle for a merged side face, tiled by the run length along each
/// sweep axis. Top/bottom faces additionally spin their corners to follow
/// the block's cardinal rotation.
fn quad_uvs(
    visual: &FaceVisual,
    side: Side,
    rotation: Rotation,
    counts: [u32; 3],
    lod: u32,
    top_v: Option<f32>,
) -> QuadUvs {
    let min = Vector3::from(visual.min_uv);
    let max = Vector3::from(visual.max_uv);
    let scaled = |count: u32| (count << lod) as f32;

    match side {
        Side::Right | Side::Left | Side::Back | Side::Front => {
            let across = match side {
                Side::Right | Side::Left => scaled(counts[1]),
                _ => scaled(counts[0]),
            };
            let up = scaled(counts[2]);
            let top = top_v.unwrap_or(min.y);
            QuadUvs {
                top_left: vector![min.x, top, min.z],
                top_right: vector![max.x * across, top, min.z],
                bottom_right: vector![max.x * across, max.y * up, min.z],
                bottom_left: vector![min.x, max.y * up, min.z],
            }
        }
        Side::Top | Side::Bottom => {
            let (along_u, along_v) = match rotation {
                Rotation::North | Rotation::South => (scaled(counts[0]), scaled(counts[1])),
                Rotation::East | Rotation::West => (scaled(counts[1]), scaled(counts[0])),
            };
            let corners = [
                vector![min.x, min.y, min.z],
                vector![max.x * along_u, min.y, min.z],
                vector![max.x * along_u, max.y * along_v, min.z],
                vector![min.x, max.y * along_v, min.z],
            ];
            let spin = rotation.index();
            QuadUvs {
                top_left: corners[spin % 4],
                top_right: corners[(1 + spin) % 4],
                bottom_right: corners[(2 + spin) % 4],
                bottom_left: corners[(3 + spin) % 4],
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_cube_face(
    entry: Option<&BlockType>,
    value: BlockValue,
    light: u32,
    rotation: Rotation,
    base: Point3<f32>,
    lod: u32,
    start: [u32; 3],
    end: [u32; 3],
    face: Side,
    output: &mut MesherOutput,
) {
    let default_visual = FaceVisual::default();
    let visual = match entry {
        Some(entry) => match face {
            Side::Top | Side::Bottom => &entry.faces[face],
            _ => &entry.faces[rotation.orient(face)],
        },
        None => &default_visual,
    };
    let counts = [
        end[0] - start[0] + 1,
        end[1] - start[1] + 1,
        end[2] - start[2] + 1,
    ];
    let uvs = quad_uvs(visual, face, rotation, counts, lod, None);
    let color = cube_vertex_color(entry, face, value, light);

    let p = |x: u32, y: u32, z: u32| -> Point3<f32> {
        base + vector![((x << lod) as f32), ((y << lod) as f32), ((z << lod) as f32)]
    };
    let (s, e) = (start, end);

    let corners = match face {
        Side::Right => [
            (p(e[0] + 1, e[1] + 1, e[2] + 1), uvs.top_left),
            (p(e[0] + 1, s[1], e[2] + 1), uvs.top_right),
            (p(e[0] + 1, e[1] + 1, s[2]), uvs.bottom_left),
            (p(e[0] + 1, s[1], s[2]), uvs.bottom_right),
        ],
        Side::Left => [
            (p(s[0], e[1] + 1, e[2] + 1), uvs.top_left),
            (p(s[0], s[1], e[2] + 1), uvs.top_right),
            (p(s[0], e[1] + 1, s[2]), uvs.bottom_left),
            (p(s[0], s[1], s[2]), uvs.bottom_right),
        ],
        Side::Back => [
            (p(s[0], e[1] + 1, e[2] + 1), uvs.top_left),
            (p(e[0] + 1, e[1] + 1, e[2] + 1), uvs.top_right),
            (p(s[0], e[1] + 1, s[2]), uvs.bottom_left),
            (p(e[0] + 1, e[1] + 1, s[2]), uvs.bottom_right),
        ],
        Side::Front => [
            (p(s[0], s[1], e[2] + 1), uvs.top_left),
            (p(e[0] + 1, s[1], e[2] + 1), uvs.top_right),
            (p(s[0], s[1], s[2]), uvs.bottom_left),
            (p(e[0] + 1, s[1], s[2]), uvs.bottom_right),
        ],
        Side::Top => [
            (p(s[0], e[1] + 1, e[2] + 1), uvs.top_left),
            (p(e[0] + 1, e[1] + 1, e[2] + 1), uvs.top_right),
            (p(s[0], s[1], e[2] + 1), uvs.bottom_left),
            (p(e[0] + 1, s[1], e[2] + 1), uvs.bottom_right),
        ],
        Side::Bottom => [
            (p(s[0], e[1] + 1, s[2]), uvs.top_left),
            (p(e[0] + 1, e[1] + 1, s[2]), uvs.top_right),
            (p(s[0], s[1], s[2]), uvs.bottom_left),
            (p(e[0] + 1, s[1], s[2]), uvs.bottom_right),
        ],
    };

    push_quad(output, visual.material_index, face, color, corners);
}

/// Like a cube face, but the top of the run drops by `1 - slab_height` and
/// the side faces shrink their top UV edge by the same fraction.
#[allow(clippy::too_many_arguments)]
fn emit_slab_face(
    entry: &BlockType,
    value: BlockValue,
    light: u32,
    rotation: Rotation,
    base: Point3<f32>,
    lod: u32,
    start: [u32; 3],
    end: [u32; 3],
    face: Side,
    is_top_slab: bool,
    output: &mut MesherOutput,
) {
    let height = entry.slab.height;
    let shortened = !entry.flags.volume_cube || is_top_slab;

    let top_drop = if shortened {
        ((1u32 << lod) as f32) * (1.0 - height)
    } else {
        0.0
    };
    let top_v = if shortened && matches!(face, Side::Right | Side::Left | Side::Back | Side::Front)
    {
        let visual = &entry.faces[rotation.orient(face)];
        Some(visual.min_uv[1] + (1.0 - height) * (visual.max_uv[1] - visual.min_uv[1]))
    } else {
        None
    };

    let visual = match face {
        Side::Top | Side::Bottom => &entry.faces[face],
        _ => &entry.faces[rotation.orient(face)],
    };
    let counts = [
        end[0] - start[0] + 1,
        end[1] - start[1] + 1,
        end[2] - start[2] + 1,
    ];
    let uvs = quad_uvs(visual, face, rotation, counts, lod, top_v);
    let color = cube_vertex_color(Some(entry), face, value, light);

    let drop = vector![0.0, 0.0, top_drop];
    let p = |x: u32, y: u32, z: u32| -> Point3<f32> {
        base + vector![((x << lod) as f32), ((y << lod) as f32), ((z << lod) as f32)]
    };
    let (s, e) = (start, end);

    // the vertices on the run's top plane sink by the drop
    let corners = match face {
        Side::Right => [
            (p(e[0] + 1, e[1] + 1, e[2] + 1) - drop, uvs.top_left),
            (p(e[0] + 1, s[1], e[2] + 1) - drop, uvs.top_right),
            (p(e[0] + 1, e[1] + 1, s[2]), uvs.bottom_left),
            (p(e[0] + 1, s[1], s[2]), uvs.bottom_right),
        ],
        Side::Left => [
            (p(s[0], e[1] + 1, e[2] + 1) - drop, uvs.top_left),
            (p(s[0], s[1], e[2] + 1) - drop, uvs.top_right),
            (p(s[0], e[1] + 1, s[2]), uvs.bottom_left),
            (p(s[0], s[1], s[2]), uvs.bottom_right),
        ],
        Side::Back => [
            (p(s[0], e[1] + 1, e[2] + 1) - drop, uvs.top_left),
            (p(e[0] + 1, e[1] + 1, e[2] + 1) - drop, uvs.top_right),
            (p(s[0], e[1] + 1, s[2]), uvs.bottom_left),
            (p(e[0] + 1, e[1] + 1, s[2]), uvs.bottom_right),
        ],
        Side::Front => [
            (p(s[0], s[1], e[2] + 1) - drop, uvs.top_left),
            (p(e[0] + 1, s[1], e[2] + 1) - drop, uvs.top_right),
            (p(s[0], s[1], s[2]), uvs.bottom_left),
            (p(e[0] + 1, s[1], s[2]), uvs.bottom_right),
        ],
        Side::Top => [
            (p(s[0], e[1] + 1, e[2] + 1) - drop, uvs.top_left),
            (p(e[0] + 1, e[1] + 1, e[2] + 1) - drop, uvs.top_right),
            (p(s[0], s[1], e[2] + 1) - drop, uvs.bottom_left),
            (p(e[0] + 1, s[1], e[2] + 1) - drop, uvs.bottom_right),
        ],
        Side::Bottom => [
            (p(s[0], e[1] + 1, s[2]), uvs.top_left),
            (p(e[0] + 1, e[1] + 1, s[2]), uvs.top_right),
            (p(s[0], s[1], s[2]), uvs.bottom_left),
            (p(e[0] + 1, s[1], s[2]), uvs.bottom_right),
        ],
    };

    push_quad(output, visual.material_index, face, color, corners);
}

/// Rotates a point in the unit cell footprint by quarter turns about +Z,
/// keeping it inside [0, 1]^2.
fn rotate_local(rotation: Rotation, p: Vector3<f32>) -> Vector3<f32> {
    match rotation {
        Rotation::North => p,
        Rotation::East => vector![p.y, 1.0 - p.x, p.z],
        Rotation::South => vector![1.0 - p.x, 1.0 - p.y, p.z],
        Rotation::West => vector![1.0 - p.y, p.x, p.z],
    }
}

/// Stairs never merge: each block emits a fixed L-profile. The profile is
/// authored in local space and spun by the block's rotation.
#[allow(clippy::too_many_arguments)]
fn emit_stair_face(
    entry: &BlockType,
    value: BlockValue,
    light: u32,
    rotation: Rotation,
    base: Point3<f32>,
    lod: u32,
    cell: [u32; 3],
    face: Side,
    output: &mut MesherOutput,
) {
    let visual = &entry.faces[face];
    let tile = (1u32 << lod) as f32;
    let min = Vector3::from(visual.min_uv);
    let half = vector![
        (visual.max_uv[0] - 0.5) * tile,
        (visual.max_uv[1] - 0.5) * tile,
        visual.min_uv[2]
    ];
    let max = vector![visual.max_uv[0] * tile, visual.max_uv[1] * tile, visual.min_uv[2]];

    let color = cube_vertex_color(Some(entry), face, value, light);
    let scale = (1u32 << lod) as f32;
    let start = base
        + vector![
            ((cell[0] << lod) as f32),
            ((cell[1] << lod) as f32),
            ((cell[2] << lod) as f32)
        ];
    let p = |x: f32, y: f32, z: f32| -> Point3<f32> {
        let local = rotate_local(rotation, vector![x, y, z]);
        start + local * scale
    };
    let uv = |u: f32, v: f32| vector![u, v, min.z];

    let mut quad = |corners: [(Point3<f32>, Vector3<f32>); 4]| {
        push_quad(output, visual.material_index, face, color, corners);
    };

    match rotation.orient(face) {
        Side::Right => {
            quad([
                (p(1.0, 1.0, 0.5), uv(min.x, min.y)),
                (p(1.0, 0.0, 0.5), uv(half.x, min.y)),
                (p(1.0, 1.0, 0.0), uv(min.x, half.y)),
                (p(1.0, 0.0, 0.0), uv(half.x, half.y)),
            ]);
            quad([
                (p(1.0, 1.0, 1.0), uv(half.x, half.y)),
                (p(1.0, 0.5, 1.0), uv(max.x, half.y)),
                (p(1.0, 1.0, 0.5), uv(half.x, max.y)),
                (p(1.0, 0.5, 0.5), uv(max.x, max.y)),
            ]);
        }
        Side::Left => {
            quad([
                (p(0.0, 1.0, 0.5), uv(min.x, min.y)),
                (p(0.0, 0.0, 0.5), uv(half.x, min.y)),
                (p(0.0, 1.0, 0.0), uv(min.x, half.y)),
                (p(0.0, 0.0, 0.0), uv(half.x, half.y)),
            ]);
            quad([
                (p(0.0, 1.0, 1.0), uv(half.x, half.y)),
                (p(0.0, 0.5, 1.0), uv(max.x, half.y)),
                (p(0.0, 1.0, 0.5), uv(half.x, max.y)),
                (p(0.0, 0.5, 0.5), uv(max.x, max.y)),
            ]);
        }
        Side::Back => {
            quad([
                (p(0.0, 1.0, 1.0), uv(min.x, min.y)),
                (p(1.0, 1.0, 1.0), uv(max.x, min.y)),
                (p(0.0, 1.0, 0.0), uv(min.x, max.y)),
                (p(1.0, 1.0, 0.0), uv(max.x, max.y)),
            ]);
        }
        Side::Front => {
            quad([
                (p(0.0, 0.0, 0.5), uv(min.x, half.y)),
                (p(1.0, 0.0, 0.5), uv(max.x, half.y)),
                (p(0.0, 0.0, 0.0), uv(min.x, min.y)),
                (p(1.0, 0.0, 0.0), uv(max.x, min.y)),
            ]);
            quad([
                (p(0.0, 0.5, 1.0), uv(min.x, max.y)),
                (p(1.0, 0.5, 1.0), uv(max.x, max.y)),
                (p(0.0, 0.5, 0.5), uv(min.x, half.y)),
                (p(1.0, 0.5, 0.5), uv(max.x, half.y)),
            ]);
        }
        Side::Top => {
            quad([
                (p(0.0, 0.5, 0.5), uv(min.x, min.y)),
                (p(1.0, 0.5, 0.5), uv(half.x, min.y)),
                (p(0.0, 0.0, 0.5), uv(min.x, half.y)),
                (p(1.0, 0.0, 0.5), uv(half.x, half.y)),
            ]);
            quad([
                (p(0.0, 1.0, 1.0), uv(half.x, half.y)),
                (p(1.0, 1.0, 1.0), uv(max.x, half.y)),
                (p(0.0, 0.5, 1.0), uv(half.x, max.y)),
                (p(1.0, 0.5, 1.0), uv(max.x, max.y)),
            ]);
        }
        Side::Bottom => {
            quad([
                (p(0.0, 1.0, 0.0), uv(min.x, min.y)),
                (p(1.0, 1.0, 0.0), uv(max.x, min.y)),
                (p(0.0, 0.0, 0.0), uv(min.x, max.y)),
                (p(1.0, 0.0, 0.0), uv(max.x, max.y)),
            ]);
        }
    }
}

fn tangent_space(
    positions: [Point3<f32>; 3],
    uvs: [Vector3<f32>; 3],
) -> (Vector3<f32>, Vector3<f32>, Vector3<f32>) {
    let edge1 = positions[1] - positions[0];
    let edge2 = positions[2] - positions[0];
    let duv1 = uvs[1] - uvs[0];
    let duv2 = uvs[2] - uvs[0];

    let det = duv1.x * duv2.y - duv2.x * duv1.y;
    let normal = edge1.cross(&edge2);
    if det.abs() < 1e-8 {
        return (Vector3::zeros(), Vector3::zeros(), normal);
    }
    let inv = 1.0 / det;
    let tangent = (edge1 * duv2.y - edge2 * duv1.y) * inv;
    let binormal = (edge2 * duv1.x - edge1 * duv2.x) * inv;
    (tangent, binormal, normal)
}

fn normalized_or_zero(v: Vector3<f32>) -> Vector3<f32> {
    let norm = v.norm();
    if norm > 1e-8 {
        v / norm
    } else {
        Vector3::zeros()
    }
}

/// Double-sided billboard pairs, repeated and spun by the plane settings.
/// The tangent space comes from the actual triangle geometry since the
/// billboard orientation is arbitrary.
fn emit_plane(
    entry: &BlockType,
    light: u32,
    rotation: Rotation,
    base: Point3<f32>,
    lod: u32,
    cell: [u32; 3],
    output: &mut MesherOutput,
) {
    let settings = &entry.plane;
    let visual = &settings.visual;
    let min = Vector3::from(visual.min_uv);
    let max = Vector3::from(visual.max_uv);
    let color = plane_vertex_color(visual, light);

    let scale = (1u32 << lod) as f32;
    let block_pos = base
        + vector![
            ((cell[0] << lod) as f32),
            ((cell[1] << lod) as f32),
            ((cell[2] << lod) as f32)
        ];

    // two coincident quads wound in opposite directions
    #[rustfmt::skip]
    let template: [(Vector3<f32>, Vector3<f32>); 8] = [
        (vector![-0.5, 0.0, 1.0], vector![min.x, min.y, min.z]),
        (vector![0.5, 0.0, 1.0], vector![max.x, min.y, min.z]),
        (vector![-0.5, 0.0, 0.0], vector![min.x, max.y, min.z]),
        (vector![0.5, 0.0, 0.0], vector![max.x, max.y, min.z]),
        (vector![-0.5, 0.0, 1.0], vector![min.x, min.y, min.z]),
        (vector![0.5, 0.0, 1.0], vector![max.x, min.y, min.z]),
        (vector![-0.5, 0.0, 0.0], vector![min.x, max.y, min.z]),
        (vector![0.5, 0.0, 0.0], vector![max.x, max.y, min.z]),
    ];
    const QUAD_TRIANGLES: [[usize; 3]; 4] = [[2, 3, 0], [0, 3, 1], [6, 4, 7], [7, 4, 5]];

    let mut spin = settings.base_rotation;
    for _ in 0..settings.repeat_count {
        let spin_rotation =
            UnitQuaternion::from_euler_angles(0.0, 0.0, spin);

        let mut positions = [point![0.0f32, 0.0, 0.0]; 8];
        let mut uvs = [Vector3::zeros(); 8];
        for (index, (local, uv)) in template.iter().enumerate() {
            let mut p = spin_rotation * local;
            p.x *= settings.width;
            p.z *= settings.height;
            p.x += settings.offset_x + 0.5;
            p.y += settings.offset_y + 0.5;
            positions[index] = block_pos + rotate_local(rotation, p) * scale;
            uvs[index] = *uv;
        }

        let mut tangents = [Vector3::zeros(); 8];
        let mut binormals = [Vector3::zeros(); 8];
        let mut normals = [Vector3::zeros(); 8];
        for triangle in QUAD_TRIANGLES {
            let (tangent, binormal, normal) = tangent_space(
                [
                    positions[triangle[0]],
                    positions[triangle[1]],
                    positions[triangle[2]],
                ],
                [uvs[triangle[0]], uvs[triangle[1]], uvs[triangle[2]]],
            );
            for index in triangle {
                tangents[index] += tangent;
                binormals[index] += binormal;
                normals[index] += normal;
            }
        }

        let base_vertex = output.vertices.len() as u32;
        for index in 0..8 {
            let tangent = normalized_or_zero(tangents[index]);
            let binormal = normalized_or_zero(binormals[index]);
            let normal = normalized_or_zero(normals[index]);
            let handedness = if normal.cross(&tangent).dot(&binormal) >= 0.0 {
                1.0
            } else {
                -1.0
            };
            output.vertices.push(Vertex {
                position: positions[index],
                tex_coord: uvs[index],
                color,
                tangent: pack_unit_vector(tangent, handedness),
                normal: pack_unit_vector(normal, 0.0),
            });
        }
        for triangle in QUAD_TRIANGLES {
            output.triangles.push(Triangle {
                material_index: visual.material_index,
                indices: [
                    base_vertex + triangle[0] as u32,
                    base_vertex + triangle[1] as u32,
                    base_vertex + triangle[2] as u32,
                ],
            });
        }

        spin += settings.repeat_rotation;
    }
}

/// Mesh-shaped blocks contribute no triangles; they accumulate an instance
/// transform keyed by the palette mesh index.
fn emit_mesh_instance(
    entry: &BlockType,
    rotation: Rotation,
    base: Point3<f32>,
    lod: u32,
    cell: [u32; 3],
    output: &mut MesherOutput,
) {
    let scale = (1u32 << lod) as f32;
    let translation = base
        + vector![
            ((cell[0] << lod) as f32),
            ((cell[1] << lod) as f32),
            ((cell[2] << lod) as f32)
        ]
        + vector![0.5, 0.5, 0.0] * scale;

    let transform = Matrix4::new_translation(&translation.coords)
        * Matrix4::new_rotation(Vector3::z() * rotation.angle())
        * Matrix4::new_scaling(entry.mesh.scale * scale);

    let mesh_index = entry.mesh.mesh_index;
    let instances = match output
        .instances
        .iter_mut()
        .find(|instances| instances.mesh_index == mesh_index)
    {
        Some(instances) => instances,
        None => {
            output.instances.push(MeshInstances {
                mesh_index,
                transforms: Vec::new(),
            });
            output.instances.last_mut().expect("just pushed")
        }
    };
    instances.transforms.push(transform);
}

fn emit_light(
    entry: &BlockType,
    base: Point3<f32>,
    lod: u32,
    cell: [u32; 3],
    output: &mut MesherOutput,
) {
    let settings = &entry.point_light;
    let scale = (1u32 << lod) as f32;
    let position = base
        + vector![
            ((cell[0] << lod) as f32),
            ((cell[1] << lod) as f32),
            ((cell[2] << lod) as f32)
        ]
        + (vector![0.5, 0.5, 0.0] + Vector3::from(settings.offset)) * scale;

    let range = settings.range * scale;
    output.lights.push(PointLight {
        position,
        range,
        inverse_range: 1.0 / range,
        color: vector![
            settings.color[0] as f32 / 255.0,
            settings.color[1] as f32 / 255.0,
            settings.color[2] as f32 / 255.0
        ] * settings.brightness,
        falloff: settings.falloff,
        is_static: false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::registry::{test_palette, BlockRegistry};
    use std::sync::Arc;

    fn input_16(palette: &Arc<BlockRegistry>) -> MesherInput {
        MesherInput::new(Arc::clone(palette), 16, 0, point![0.0, 0.0, 0.0], false)
    }

    #[test]
    fn single_cube_emits_six_faces() {
        // S1: one visibility-blocking cube in an otherwise empty chunk
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        input.set(1, 1, 1, test_palette::STONE, 0);

        let output = generate_mesh(&input);
        assert_eq!(output.vertices.len(), 24);
        assert_eq!(output.triangles.len(), 12);
        assert_eq!(output.batches.len(), 1);
        assert_eq!(output.batches[0].index_count, 36);
        assert_eq!(output.bounds, Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0]));
    }

    #[test]
    fn full_chunk_merges_each_outer_face_into_one_quad() {
        // S2: interior faces all culled, six 16x16 merged quads survive
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        for z in 1..17 {
            for y in 1..17 {
                for x in 1..17 {
                    input.set(x, y, z, test_palette::STONE, 0);
                }
            }
        }

        let output = generate_mesh(&input);
        assert_eq!(output.vertices.len(), 24);
        assert_eq!(output.triangles.len(), 12);
        assert_eq!(output.batches.len(), 1);
        assert_eq!(
            output.bounds,
            Aabb::new(point![0.0, 0.0, 0.0], point![16.0, 16.0, 16.0])
        );
    }

    #[test]
    fn checkerboard_emits_every_face_unmerged() {
        // S3: no two solid cells share a face, so nothing merges
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        let mut solid_cells = 0;
        for z in 1..3 {
            for y in 1..3 {
                for x in 1..3 {
                    if (x + y + z) % 2 == 0 {
                        input.set(x, y, z, test_palette::STONE, 0);
                        solid_cells += 1;
                    }
                }
            }
        }

        let output = generate_mesh(&input);
        assert_eq!(output.vertices.len(), solid_cells * 24);
        assert_eq!(output.triangles.len(), solid_cells * 12);
    }

    #[test]
    fn slab_region_matches_expected_quads() {
        // S4: a 4x4x1 half-slab region
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        for y in 1..5 {
            for x in 1..5 {
                input.set(x, y, 1, test_palette::SLAB, 0);
            }
        }

        let output = generate_mesh(&input);
        // one 4x4 top and one 4x4 bottom; slabs never occlude lateral
        // faces, so every row and column contributes a merged 4-long side
        // quad: 4 quads per side direction plus the two caps
        assert_eq!(output.vertices.len(), 18 * 4);
        assert_eq!(output.triangles.len(), 18 * 2);

        // the top face sits at the slab height
        let top_vertices: Vec<_> = output
            .vertices
            .iter()
            .filter(|vertex| vertex.normal == FACE_PACKED_NORMALS[Side::Top.index()])
            .collect();
        assert_eq!(top_vertices.len(), 4);
        for vertex in top_vertices {
            assert!((vertex.position.z - 0.5).abs() < 1e-6);
        }

        // side faces shrink their top UV edge by (1 - height)
        let side_top_v: Vec<f32> = output
            .vertices
            .iter()
            .filter(|vertex| vertex.normal == FACE_PACKED_NORMALS[Side::Right.index()])
            .map(|vertex| vertex.tex_coord.y)
            .collect();
        assert!(side_top_v.iter().any(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn mesher_is_idempotent() {
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        for (index, cell) in [(1, 1, 1), (2, 1, 1), (5, 5, 5), (5, 5, 6)].iter().enumerate() {
            input.set(cell.0, cell.1, cell.2, (index % 2 + 1) as BlockValue, 0);
        }
        input.set(8, 8, 8, test_palette::PLANE, 0);
        input.set(9, 9, 9, test_palette::MESH, 0);
        input.set(10, 10, 10, test_palette::LAMP, 0);

        let first = generate_mesh(&input);
        let second = generate_mesh(&input);
        assert_eq!(first, second);
    }

    #[test]
    fn interior_faces_between_equal_blockers_are_culled() {
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        input.set(1, 1, 1, test_palette::STONE, 0);
        input.set(2, 1, 1, test_palette::STONE, 0);

        let output = generate_mesh(&input);
        // 2x1x1 bar: +Y/-Y/+Z/-Z merge into one quad each, plus the two caps
        assert_eq!(output.triangles.len(), 12);
        let plane_x1 = output
            .vertices
            .iter()
            .filter(|vertex| (vertex.position.x - 1.0).abs() < 1e-6)
            .filter(|vertex| {
                vertex.normal == FACE_PACKED_NORMALS[Side::Right.index()]
                    || vertex.normal == FACE_PACKED_NORMALS[Side::Left.index()]
            })
            .count();
        assert_eq!(plane_x1, 0);
    }

    #[test]
    fn volume_cubes_occlude_only_their_own_kind() {
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        input.set(1, 1, 1, test_palette::WATER, 0);
        input.set(2, 1, 1, test_palette::WATER, 0);
        let merged = generate_mesh(&input);
        assert_eq!(merged.triangles.len(), 12);

        let mut input = input_16(&palette);
        input.set(1, 1, 1, test_palette::WATER, 0);
        let single = generate_mesh(&input);
        assert_eq!(single.triangles.len(), 12);
    }

    #[test]
    fn glass_does_not_occlude_stone() {
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        input.set(1, 1, 1, test_palette::STONE, 0);
        input.set(2, 1, 1, test_palette::GLASS, 0);

        let output = generate_mesh(&input);
        // stone keeps all six faces; glass keeps five (stone blocks its -X)
        assert_eq!(output.triangles.len(), 11 * 2);
    }

    #[test]
    fn greedy_merge_respects_rotation_and_light() {
        let palette = test_palette::build();

        let mut uniform = input_16(&palette);
        uniform.set(1, 1, 1, test_palette::STONE, 0);
        uniform.set(2, 1, 1, test_palette::STONE, 0);
        let merged_count = generate_mesh(&uniform).triangles.len();

        let mut rotated = input_16(&palette);
        rotated.set(1, 1, 1, test_palette::STONE, 0);
        rotated.set(
            2,
            1,
            1,
            test_palette::STONE,
            block::with_rotation(0, Rotation::East),
        );
        let split_count = generate_mesh(&rotated).triangles.len();

        // top faces no longer merge when rotations differ
        assert!(split_count > merged_count);
    }

    #[test]
    fn stairs_emit_fixed_profile_per_block() {
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        input.set(1, 1, 1, test_palette::STAIRS, 0);
        input.set(2, 1, 1, test_palette::STAIRS, 0);

        let output = generate_mesh(&input);
        // no merging: two blocks emit exactly twice one block's triangles
        let mut single = input_16(&palette);
        single.set(1, 1, 1, test_palette::STAIRS, 0);
        let single_output = generate_mesh(&single);
        assert_eq!(output.triangles.len(), 2 * single_output.triangles.len());
        // the L-profile: 10 quads per block
        assert_eq!(single_output.triangles.len(), 20);
    }

    #[test]
    fn stair_rotation_moves_the_riser() {
        let palette = test_palette::build();
        let mut north = input_16(&palette);
        north.set(1, 1, 1, test_palette::STAIRS, 0);
        let mut south = input_16(&palette);
        south.set(
            1,
            1,
            1,
            test_palette::STAIRS,
            block::with_rotation(0, Rotation::South),
        );

        let north_out = generate_mesh(&north);
        let south_out = generate_mesh(&south);
        assert_eq!(north_out.vertices.len(), south_out.vertices.len());
        assert_ne!(
            north_out.vertices.iter().map(|v| v.position).collect::<Vec<_>>(),
            south_out.vertices.iter().map(|v| v.position).collect::<Vec<_>>()
        );
    }

    #[test]
    fn plane_emits_repeat_count_quad_pairs() {
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        input.set(4, 4, 1, test_palette::PLANE, 0);

        let output = generate_mesh(&input);
        // repeat_count = 2, each repeat is two double-sided quads
        assert_eq!(output.vertices.len(), 16);
        assert_eq!(output.triangles.len(), 8);
    }

    #[test]
    fn mesh_blocks_emit_instances_not_triangles() {
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        input.set(3, 3, 1, test_palette::MESH, 0);
        input.set(5, 3, 1, test_palette::MESH, 0);

        let output = generate_mesh(&input);
        assert!(output.triangles.is_empty());
        assert_eq!(output.instances.len(), 1);
        assert_eq!(output.instances[0].transforms.len(), 2);

        // instance translation lands on the cell center
        let translation = output.instances[0].transforms[0].column(3);
        assert!((translation[0] - 2.5).abs() < 1e-6);
        assert!((translation[1] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn lamps_emit_point_lights_at_lod0_only() {
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        input.set(2, 2, 2, test_palette::LAMP, 0);
        let output = generate_mesh(&input);
        assert_eq!(output.lights.len(), 1);
        let light = output.lights[0];
        assert!((light.position.x - 1.5).abs() < 1e-6);
        assert!(!light.is_static);
        assert!((light.inverse_range * light.range - 1.0).abs() < 1e-6);

        let mut coarse = MesherInput::new(Arc::clone(&palette), 16, 1, point![0.0, 0.0, 0.0], false);
        coarse.set(2, 2, 2, test_palette::LAMP, 0);
        assert!(generate_mesh(&coarse).lights.is_empty());
    }

    #[test]
    fn colored_blocks_always_occlude_and_carry_their_tint() {
        let palette = test_palette::build();
        let tint = block::pack_colored(248, 0, 8);
        let mut input = input_16(&palette);
        input.set(1, 1, 1, tint, 0);
        input.set(2, 1, 1, test_palette::STONE, 0);

        let output = generate_mesh(&input);
        // the coloured cube hides stone's -X face and stone hides the
        // coloured cube's +X face, leaving five faces each
        assert_eq!(output.triangles.len(), 10 * 2);
        let tinted = output
            .vertices
            .iter()
            .find(|vertex| vertex.color & 0x00FF_FFFF == (248u32) | (8u32 << 16))
            .expect("tinted vertices present");
        // light 15 scales into the alpha byte
        assert_eq!(tinted.color >> 24, 150);
    }

    #[test]
    fn lightmaps_sample_the_neighbour_cell() {
        let palette = test_palette::build();
        let mut input = MesherInput::new(Arc::clone(&palette), 16, 0, point![0.0, 0.0, 0.0], true);
        input.set(1, 1, 1, test_palette::STONE, 0);
        // the cell above the block carries light level 8
        input.set(1, 1, 2, block::AIR, block::with_light_level(0, 8));

        let output = generate_mesh(&input);
        let top_color = output
            .vertices
            .iter()
            .find(|vertex| vertex.normal == FACE_PACKED_NORMALS[Side::Top.index()])
            .expect("top face present")
            .color;
        assert_eq!(top_color >> 24, 80);

        let bottom_color = output
            .vertices
            .iter()
            .find(|vertex| vertex.normal == FACE_PACKED_NORMALS[Side::Bottom.index()])
            .expect("bottom face present")
            .color;
        assert_eq!(bottom_color >> 24, 0);
    }

    #[test]
    fn batches_group_materials_contiguously() {
        let palette = test_palette::build();
        let mut input = input_16(&palette);
        input.set(1, 1, 1, test_palette::STONE, 0);
        input.set(4, 4, 4, test_palette::GLASS, 0);

        let mut output = generate_mesh(&input);
        // force distinct materials to exercise the batch split
        for triangle in output.triangles.iter_mut().take(6) {
            triangle.material_index = 1;
        }
        output.batches.clear();
        finalize_batches(&mut output);

        assert_eq!(output.batches.len(), 2);
        assert_eq!(output.batches[0].start_index, 0);
        assert_eq!(
            output.batches[0].index_count + output.batches[1].index_count,
            output.triangles.len() as u32 * 3
        );
        let mut last_material = None;
        for triangle in &output.triangles {
            if let Some(last) = last_material {
                assert!(triangle.material_index >= last);
            }
            last_material = Some(triangle.material_index);
        }
    }

    #[test]
    fn single_block_mesh_is_batch_finalized() {
        let palette = test_palette::build();
        let output = mesh_single_block(&palette, test_palette::STONE);
        assert_eq!(output.triangles.len(), 12);
        assert_eq!(output.batches.len(), 1);

        let slab = mesh_single_block(&palette, test_palette::SLAB);
        assert_eq!(slab.triangles.len(), 12);

        let none = mesh_single_block(&palette, block::AIR);
        assert!(none.triangles.is_empty());
    }

    #[test]
    fn lod_scales_vertex_positions() {
        let palette = test_palette::build();
        let mut input = MesherInput::new(Arc::clone(&palette), 16, 1, point![0.0, 0.0, 0.0], false);
        // LOD 1 volume is 8 cells across; one cell covers 2 world units
        input.set(1, 1, 1, test_palette::STONE, 0);

        let output = generate_mesh(&input);
        assert_eq!(
            output.bounds,
            Aabb::new(point![0.0, 0.0, 0.0], point![2.0, 2.0, 2.0])
        );
    }
}

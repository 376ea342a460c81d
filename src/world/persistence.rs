//! Section, index and global-entity files.
//!
//! Everything is packed little-endian with no alignment padding. A section
//! file carries a per-LOD offset table so that partial loads can seek
//! straight to the coarse bands without touching the fine ones.

use crate::{
    codec::{ReadExt, WriteExt},
    config::GridParams,
    util::DwordBitSet,
    world::{
        chunk::Chunk,
        entity,
        section::{LoadState, Section},
        ChunkPos, WorldError,
    },
};
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

pub const SECTION_MAGIC: u32 = 0xCCBBAA03;
pub const INDEX_MAGIC: u32 = 0xCCBBAA04;
pub const GLOBAL_ENTITY_MAGIC: u32 = 0xCCBBAA05;

fn stream_error(err: io::Error) -> WorldError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        WorldError::CorruptFile("unexpected end of stream".into())
    } else {
        WorldError::Io(err)
    }
}

/// Byte size of one chunk's (values, data) pair at a given LOD.
fn chunk_lod_bytes(chunk_size: u32, lod: u32) -> u64 {
    let edge = (chunk_size >> lod) as u64;
    edge * edge * edge * 3
}

pub fn save_section<W: Write>(section: &Section, writer: &mut W) -> Result<(), WorldError> {
    debug_assert_eq!(section.loaded_lod(), 0, "saving requires all LODs resident");

    let lod_levels = section.lod_levels();
    let mask = section.availability();

    writer.write_u32_le(SECTION_MAGIC)?;
    writer.write_i32_le(section.chunk_size() as i32)?;
    writer.write_i32_le(section.section_size() as i32)?;
    writer.write_i32_le(lod_levels as i32)?;
    writer.write_i32_le(section.min_chunk_z())?;
    writer.write_i32_le(section.max_chunk_z())?;
    writer.write_u32_le(mask.dword_count() as u32)?;
    writer.write_u32_slice_le(mask.words())?;

    // the data area follows the offset table and the entity header; offsets
    // are computed arithmetically because every chunk record has a fixed size
    let available = section.chunk_count() as u64;
    let header_bytes = 4 + 5 * 4 + 4 + 4 * mask.dword_count() as u64;
    let mut cursor = header_bytes + 4 * lod_levels as u64 + 8;

    let mut lod_offsets = vec![0u32; lod_levels as usize];
    for lod in (0..lod_levels).rev() {
        lod_offsets[lod as usize] = cursor as u32;
        cursor += chunk_lod_bytes(section.chunk_size(), lod) * available;
    }
    writer.write_u32_slice_le(&lod_offsets)?;
    writer.write_u32_le(cursor as u32)?;
    writer.write_u32_le(section.entities().len() as u32)?;

    for lod in (0..lod_levels).rev() {
        for_each_slot(section, |section, rx, ry, cz| {
            if let Some(chunk) = section.chunk(rx, ry, cz) {
                chunk.save_lod_to(lod, writer)?;
            }
            Ok(())
        })?;
    }

    entity::save_entities(section.entities(), writer)?;
    Ok(())
}

/// Visits every slot in ascending (cz, ry, rx) order, the order chunk data
/// is laid out in the file.
fn for_each_slot<F>(section: &Section, mut func: F) -> Result<(), WorldError>
where
    F: FnMut(&Section, u32, u32, i32) -> Result<(), WorldError>,
{
    for cz in section.min_chunk_z()..=section.max_chunk_z() {
        for ry in 0..section.section_size() {
            for rx in 0..section.section_size() {
                func(section, rx, ry, cz)?;
            }
        }
    }
    Ok(())
}

struct SectionHeader {
    min_cz: i32,
    max_cz: i32,
    mask: DwordBitSet,
}

fn read_section_header<R: Read>(
    grid: &GridParams,
    reader: &mut R,
) -> Result<SectionHeader, WorldError> {
    let magic = reader.read_u32_le().map_err(stream_error)?;
    if magic != SECTION_MAGIC {
        return Err(WorldError::CorruptFile(format!(
            "bad section magic {magic:#010x}"
        )));
    }

    let chunk_size = reader.read_i32_le().map_err(stream_error)?;
    let section_size = reader.read_i32_le().map_err(stream_error)?;
    let lod_levels = reader.read_i32_le().map_err(stream_error)?;
    if chunk_size != grid.chunk_size as i32
        || section_size != grid.section_size as i32
        || lod_levels != grid.lod_levels as i32
    {
        return Err(WorldError::CorruptFile(format!(
            "grid parameters {chunk_size}/{section_size}/{lod_levels} disagree with world"
        )));
    }

    let min_cz = reader.read_i32_le().map_err(stream_error)?;
    let max_cz = reader.read_i32_le().map_err(stream_error)?;
    if min_cz > max_cz {
        return Err(WorldError::CorruptFile("inverted section Z range".into()));
    }

    let slot_count =
        (grid.section_size * grid.section_size) as usize * (max_cz - min_cz + 1) as usize;
    let dword_count = reader.read_u32_le().map_err(stream_error)? as usize;
    if dword_count != (slot_count + 31) / 32 {
        return Err(WorldError::CorruptFile("availability mask size mismatch".into()));
    }
    let mut words = vec![0u32; dword_count];
    reader.read_u32_slice_le(&mut words).map_err(stream_error)?;
    let mask = DwordBitSet::from_words(words, slot_count)
        .ok_or_else(|| WorldError::CorruptFile("availability mask size mismatch".into()))?;

    Ok(SectionHeader {
        min_cz,
        max_cz,
        mask,
    })
}

/// Loads a section from scratch, reading only LOD bands `>= max_lod`.
pub fn load_section<R: Read + Seek>(
    grid: &GridParams,
    sx: i32,
    sy: i32,
    reader: &mut R,
    max_lod: u32,
) -> Result<Section, WorldError> {
    let header = read_section_header(grid, reader)?;

    let mut section = Section::with_range(
        grid.chunk_size,
        grid.section_size,
        grid.lod_levels,
        sx,
        sy,
        header.min_cz,
        header.max_cz,
    );
    load_lod_bands(&mut section, &header.mask, reader, max_lod)?;
    section.set_load_state(LoadState::Loaded);
    Ok(section)
}

/// Deepens an already-resident section, e.g. from LOD 2 down to LOD 0. The
/// header must agree with the resident section.
pub fn load_section_lods<R: Read + Seek>(
    section: &mut Section,
    reader: &mut R,
    max_lod: u32,
) -> Result<(), WorldError> {
    let grid = GridParams {
        chunk_size: section.chunk_size(),
        section_size: section.section_size(),
        lod_levels: section.lod_levels(),
    };
    let header = read_section_header(&grid, reader)?;
    if header.min_cz != section.min_chunk_z() || header.max_cz != section.max_chunk_z() {
        return Err(WorldError::CorruptFile(
            "section Z range disagrees with resident section".into(),
        ));
    }
    load_lod_bands(section, &header.mask, reader, max_lod)
}

fn load_lod_bands<R: Read + Seek>(
    section: &mut Section,
    mask: &DwordBitSet,
    reader: &mut R,
    max_lod: u32,
) -> Result<(), WorldError> {
    let lod_levels = section.lod_levels();

    let mut lod_offsets = vec![0u32; lod_levels as usize];
    reader.read_u32_slice_le(&mut lod_offsets).map_err(stream_error)?;
    let entity_offset = reader.read_u32_le().map_err(stream_error)?;
    let entity_count = reader.read_u32_le().map_err(stream_error)?;

    let old_loaded = section.loaded_lod();
    for lod in (max_lod..lod_levels).rev() {
        if lod > old_loaded {
            continue;
        }

        reader
            .seek(SeekFrom::Start(lod_offsets[lod as usize] as u64))
            .map_err(stream_error)?;

        let mut slot = 0usize;
        for cz in section.min_chunk_z()..=section.max_chunk_z() {
            for ry in 0..section.section_size() {
                for rx in 0..section.section_size() {
                    let this_slot = slot;
                    slot += 1;
                    if !mask.get(this_slot) {
                        continue;
                    }

                    if section.chunk(rx, ry, cz).is_none() {
                        let pos = ChunkPos {
                            x: section.base_chunk_x() + rx as i32,
                            y: section.base_chunk_y() + ry as i32,
                            z: cz,
                        };
                        let chunk = Box::new(Chunk::new(
                            section.chunk_size(),
                            section.lod_levels(),
                            pos,
                        ));
                        section.insert_loaded_chunk(rx, ry, cz, chunk);
                    }
                    section
                        .chunk_mut(rx, ry, cz)
                        .expect("slot populated above")
                        .load_lod_from(lod, reader)
                        .map_err(stream_error)?;
                }
            }
        }
    }

    section.set_loaded_lod(max_lod);

    if old_loaded > 0 && max_lod == 0 && entity_count > 0 {
        reader
            .seek(SeekFrom::Start(entity_offset as u64))
            .map_err(stream_error)?;
        let entities = entity::load_entities(reader).map_err(stream_error)?;
        if entities.len() != entity_count as usize {
            return Err(WorldError::CorruptFile("entity count mismatch".into()));
        }
        *section.entities_mut() = entities;
    }

    Ok(())
}

/// The world's availability index: the section rectangle and which section
/// files exist.
pub struct IndexFile {
    pub min_sx: i32,
    pub min_sy: i32,
    pub max_sx: i32,
    pub max_sy: i32,
    pub available: DwordBitSet,
}

pub fn save_index<W: Write>(index: &IndexFile, writer: &mut W) -> Result<(), WorldError> {
    writer.write_u32_le(INDEX_MAGIC)?;
    writer.write_i32_le(index.min_sx)?;
    writer.write_i32_le(index.min_sy)?;
    writer.write_i32_le(index.max_sx)?;
    writer.write_i32_le(index.max_sy)?;
    writer.write_u32_le(index.available.dword_count() as u32)?;
    writer.write_u32_slice_le(index.available.words())?;
    Ok(())
}

pub fn load_index<R: Read>(reader: &mut R) -> Result<IndexFile, WorldError> {
    let magic = reader.read_u32_le().map_err(stream_error)?;
    if magic != INDEX_MAGIC {
        return Err(WorldError::CorruptFile(format!("bad index magic {magic:#010x}")));
    }
    let min_sx = reader.read_i32_le().map_err(stream_error)?;
    let min_sy = reader.read_i32_le().map_err(stream_error)?;
    let max_sx = reader.read_i32_le().map_err(stream_error)?;
    let max_sy = reader.read_i32_le().map_err(stream_error)?;
    if min_sx > max_sx || min_sy > max_sy {
        return Err(WorldError::CorruptFile("inverted index rectangle".into()));
    }

    let slots = ((max_sx - min_sx + 1) * (max_sy - min_sy + 1)) as usize;
    let dword_count = reader.read_u32_le().map_err(stream_error)? as usize;
    let mut words = vec![0u32; dword_count];
    reader.read_u32_slice_le(&mut words).map_err(stream_error)?;
    let available = DwordBitSet::from_words(words, slots)
        .ok_or_else(|| WorldError::CorruptFile("index mask size mismatch".into()))?;

    Ok(IndexFile {
        min_sx,
        min_sy,
        max_sx,
        max_sy,
        available,
    })
}

/// Directory-backed storage for a world: one file per section, one index
/// file, one global-entity file.
pub struct WorldStorage {
    base_path: PathBuf,
}

impl WorldStorage {
    pub fn create<P: AsRef<Path>>(base_path: P) -> Result<Self, WorldError> {
        fs::create_dir_all(base_path.as_ref())?;
        Ok(Self {
            base_path: base_path.as_ref().to_owned(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn section_path(&self, sx: i32, sy: i32) -> PathBuf {
        self.base_path.join(format!("section_{sx}_{sy}.sec"))
    }

    pub fn index_path(&self) -> PathBuf {
        self.base_path.join("world.idx")
    }

    pub fn global_entity_path(&self) -> PathBuf {
        self.base_path.join("global.ent")
    }

    pub fn section_file_exists(&self, sx: i32, sy: i32) -> bool {
        self.section_path(sx, sy).is_file()
    }

    pub fn save_section_file(&self, section: &Section) -> Result<(), WorldError> {
        let path = self.section_path(section.section_x(), section.section_y());
        let mut writer = BufWriter::new(File::create(path)?);
        save_section(section, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_section_file(
        &self,
        grid: &GridParams,
        sx: i32,
        sy: i32,
        max_lod: u32,
    ) -> Result<Section, WorldError> {
        let mut reader = BufReader::new(File::open(self.section_path(sx, sy))?);
        load_section(grid, sx, sy, &mut reader, max_lod)
    }

    pub fn load_section_file_lods(
        &self,
        section: &mut Section,
        max_lod: u32,
    ) -> Result<(), WorldError> {
        let path = self.section_path(section.section_x(), section.section_y());
        let mut reader = BufReader::new(File::open(path)?);
        load_section_lods(section, &mut reader, max_lod)
    }

    pub fn save_index_file(&self, index: &IndexFile) -> Result<(), WorldError> {
        let mut writer = BufWriter::new(File::create(self.index_path())?);
        save_index(index, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_index_file(&self) -> Result<Option<IndexFile>, WorldError> {
        let path = self.index_path();
        if !path.is_file() {
            return Ok(None);
        }
        let mut reader = BufReader::new(File::open(path)?);
        Ok(Some(load_index(&mut reader)?))
    }

    pub fn save_global_entities(
        &self,
        entities: &[entity::EntityRecord],
    ) -> Result<(), WorldError> {
        let mut writer = BufWriter::new(File::create(self.global_entity_path())?);
        writer.write_u32_le(GLOBAL_ENTITY_MAGIC)?;
        entity::save_entities(entities, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_global_entities(&self) -> Result<Vec<entity::EntityRecord>, WorldError> {
        let path = self.global_entity_path();
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::new(File::open(path)?);
        let magic = reader.read_u32_le().map_err(stream_error)?;
        if magic != GLOBAL_ENTITY_MAGIC {
            return Err(WorldError::CorruptFile(format!(
                "bad global entity magic {magic:#010x}"
            )));
        }
        entity::load_entities(&mut reader).map_err(stream_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aabb::Aabb,
        world::entity::EntityRecord,
    };
    use nalgebra::point;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    const GRID: GridParams = GridParams {
        chunk_size: 8,
        section_size: 2,
        lod_levels: 2,
    };

    fn populated_section() -> Section {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(0xb10c);
        let mut section = Section::create(
            GRID.chunk_size,
            GRID.section_size,
            GRID.lod_levels,
            -1,
            2,
            -1,
            1,
        );
        for (rx, ry, cz) in [(0, 0, -1), (1, 1, 0), (0, 1, 1)] {
            let chunk = section.create_chunk(rx, ry, cz);
            for _ in 0..64 {
                let (x, y, z) = (rng.gen_range(0, 8), rng.gen_range(0, 8), rng.gen_range(0, 8));
                chunk.set_block(0, x, y, z, rng.gen_range(1, 5) as u16);
                chunk.set_block_data(0, x, y, z, rng.gen::<u8>());
                chunk.update_lods(0, x, y, z);
            }
        }
        section.add_entity(EntityRecord {
            id: 11,
            class: "item".into(),
            bounds: Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0]),
            payload: vec![1, 2, 3],
        });
        section
    }

    #[test]
    fn save_load_round_trip_is_byte_identical_per_lod() {
        let section = populated_section();
        let mut bytes = Vec::new();
        save_section(&section, &mut bytes).unwrap();

        let restored = load_section(&GRID, -1, 2, &mut Cursor::new(&bytes), 0).unwrap();
        assert_eq!(restored.min_chunk_z(), section.min_chunk_z());
        assert_eq!(restored.max_chunk_z(), section.max_chunk_z());
        assert_eq!(restored.chunk_count(), section.chunk_count());
        assert_eq!(restored.entities(), section.entities());
        assert_eq!(restored.load_state(), LoadState::Loaded);

        for cz in section.min_chunk_z()..=section.max_chunk_z() {
            for ry in 0..GRID.section_size {
                for rx in 0..GRID.section_size {
                    let (a, b) = (section.chunk(rx, ry, cz), restored.chunk(rx, ry, cz));
                    assert_eq!(a.is_some(), b.is_some());
                    if let (Some(a), Some(b)) = (a, b) {
                        for lod in 0..GRID.lod_levels {
                            assert_eq!(a.values(lod), b.values(lod));
                            assert_eq!(a.data(lod), b.data(lod));
                        }
                    }
                }
            }
        }

        // and the round trip of the round trip produces identical bytes
        let mut bytes_again = Vec::new();
        save_section(&restored, &mut bytes_again).unwrap();
        assert_eq!(bytes, bytes_again);
    }

    #[test]
    fn partial_load_reads_only_coarse_bands() {
        let section = populated_section();
        let mut bytes = Vec::new();
        save_section(&section, &mut bytes).unwrap();

        let coarse = load_section(&GRID, -1, 2, &mut Cursor::new(&bytes), 1).unwrap();
        assert_eq!(coarse.loaded_lod(), 1);
        assert!(coarse.entities().is_empty());
        let chunk = coarse.chunk(1, 1, 0).unwrap();
        assert!(!chunk.is_lod_loaded(0));
        assert_eq!(
            chunk.values(1),
            section.chunk(1, 1, 0).unwrap().values(1)
        );
    }

    #[test]
    fn deepening_a_partial_load_restores_lod0_and_entities() {
        let section = populated_section();
        let mut bytes = Vec::new();
        save_section(&section, &mut bytes).unwrap();

        let mut coarse = load_section(&GRID, -1, 2, &mut Cursor::new(&bytes), 1).unwrap();
        load_section_lods(&mut coarse, &mut Cursor::new(&bytes), 0).unwrap();
        assert_eq!(coarse.loaded_lod(), 0);
        assert_eq!(coarse.entities(), section.entities());
        assert_eq!(
            coarse.chunk(0, 0, -1).unwrap().values(0),
            section.chunk(0, 0, -1).unwrap().values(0)
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let section = populated_section();
        let mut bytes = Vec::new();
        save_section(&section, &mut bytes).unwrap();
        bytes[0] ^= 0xFF;
        match load_section(&GRID, -1, 2, &mut Cursor::new(&bytes), 0) {
            Err(WorldError::CorruptFile(_)) => {}
            other => panic!("expected CorruptFile, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_grid_is_rejected() {
        let section = populated_section();
        let mut bytes = Vec::new();
        save_section(&section, &mut bytes).unwrap();
        let other_grid = GridParams {
            chunk_size: 16,
            ..GRID
        };
        assert!(matches!(
            load_section(&other_grid, -1, 2, &mut Cursor::new(&bytes), 0),
            Err(WorldError::CorruptFile(_))
        ));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let section = populated_section();
        let mut bytes = Vec::new();
        save_section(&section, &mut bytes).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(
            load_section(&GRID, -1, 2, &mut Cursor::new(&bytes), 0),
            Err(WorldError::CorruptFile(_))
        ));
    }

    #[test]
    fn index_round_trip() {
        let mut available = DwordBitSet::with_len(9);
        available.set(0);
        available.set(8);
        let index = IndexFile {
            min_sx: -1,
            min_sy: -1,
            max_sx: 1,
            max_sy: 1,
            available,
        };
        let mut bytes = Vec::new();
        save_index(&index, &mut bytes).unwrap();
        let restored = load_index(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(restored.min_sx, -1);
        assert_eq!(restored.max_sy, 1);
        assert!(restored.available.get(0) && restored.available.get(8));
        assert!(!restored.available.get(4));
    }
}

//! Opaque entity records.
//!
//! The engine does not interpret entity payloads; it only tracks which
//! section an entity is homed in and round-trips the serialized bytes
//! through section files. On disk an entity is a class table followed by
//! records of `{type index, payload size, payload bytes}` and nothing
//! else; the payload is the engine's serialized image of the entity, which
//! carries its own id and bounds ahead of the host's opaque bytes the same
//! way a serialized object carries its own identity.

use crate::{
    aabb::Aabb,
    codec::{ReadExt, WriteExt},
};
use nalgebra::point;
use std::{collections::HashMap, io};

pub type EntityId = u32;

#[derive(Clone, Debug, PartialEq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub class: String,
    pub bounds: Aabb,
    pub payload: Vec<u8>,
}

impl EntityRecord {
    pub fn position(&self) -> nalgebra::Point3<f32> {
        self.bounds.center()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClassTable {
    names: Vec<String>,
    indices: HashMap<String, u32>,
}

impl ClassTable {
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.indices.get(name) {
            return index;
        }
        let index = self.names.len() as u32;
        self.names.push(name.to_owned());
        self.indices.insert(name.to_owned(), index);
        index
    }

    pub fn name(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn save_to<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32_le(self.names.len() as u32)?;
        for name in &self.names {
            writer.write_str(name)?;
        }
        Ok(())
    }

    pub fn load_from<R: io::Read>(reader: &mut R) -> io::Result<Self> {
        let count = reader.read_u32_le()?;
        let mut table = ClassTable::default();
        for _ in 0..count {
            let name = reader.read_str()?;
            table.intern(&name);
        }
        Ok(table)
    }
}

/// The serialized entity image: id, bounds, then the host's bytes. This is
/// the record payload; the record framing itself carries only the class
/// index and a length, so unknown records can be skipped by size.
fn encode_entity_image(entity: &EntityRecord) -> Vec<u8> {
    let mut image = Vec::with_capacity(4 + 6 * 4 + entity.payload.len());
    image.extend_from_slice(&entity.id.to_le_bytes());
    for component in [
        entity.bounds.min.x,
        entity.bounds.min.y,
        entity.bounds.min.z,
        entity.bounds.max.x,
        entity.bounds.max.y,
        entity.bounds.max.z,
    ] {
        image.extend_from_slice(&component.to_le_bytes());
    }
    image.extend_from_slice(&entity.payload);
    image
}

fn decode_entity_image(class: &str, image: &[u8]) -> io::Result<EntityRecord> {
    let mut reader = image;
    let id = reader.read_u32_le()?;
    let mut bounds = [0.0f32; 6];
    for component in bounds.iter_mut() {
        *component = reader.read_f32_le()?;
    }
    Ok(EntityRecord {
        id,
        class: class.to_owned(),
        bounds: Aabb::new(
            point![bounds[0], bounds[1], bounds[2]],
            point![bounds[3], bounds[4], bounds[5]],
        ),
        payload: reader.to_vec(),
    })
}

/// Writes a class table followed by `{type index, payload size, payload
/// bytes}` records.
pub fn save_entities<W: io::Write>(entities: &[EntityRecord], writer: &mut W) -> io::Result<()> {
    let mut table = ClassTable::default();
    for entity in entities {
        table.intern(&entity.class);
    }
    table.save_to(writer)?;

    writer.write_u32_le(entities.len() as u32)?;
    for entity in entities {
        let image = encode_entity_image(entity);
        writer.write_u32_le(table.intern(&entity.class))?;
        writer.write_u32_le(image.len() as u32)?;
        writer.write_all(&image)?;
    }
    Ok(())
}

pub fn load_entities<R: io::Read>(reader: &mut R) -> io::Result<Vec<EntityRecord>> {
    let table = ClassTable::load_from(reader)?;
    let count = reader.read_u32_le()?;

    let mut entities = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_index = reader.read_u32_le()?;
        let image_len = reader.read_u32_le()? as usize;
        let mut image = vec![0; image_len];
        reader.read_exact(&mut image)?;

        let class = table.name(type_index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "entity class index out of range")
        })?;
        entities.push(decode_entity_image(class, &image)?);
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Seek, SeekFrom};

    fn sample(id: EntityId, class: &str) -> EntityRecord {
        EntityRecord {
            id,
            class: class.into(),
            bounds: Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 2.0, 3.0]),
            payload: vec![id as u8; 4],
        }
    }

    #[test]
    fn class_table_interns_once() {
        let mut table = ClassTable::default();
        let a = table.intern("item");
        let b = table.intern("mob");
        assert_eq!(table.intern("item"), a);
        assert_ne!(a, b);
        assert_eq!(table.name(b), Some("mob"));
    }

    #[test]
    fn entities_round_trip() {
        let entities = vec![sample(1, "item"), sample(2, "mob"), sample(3, "item")];
        let mut bytes = Vec::new();
        save_entities(&entities, &mut bytes).unwrap();
        let restored = load_entities(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(restored, entities);
    }

    #[test]
    fn records_carry_only_type_index_size_and_payload() {
        // a reader that understands nothing about entity images can still
        // walk the records by their size fields alone
        let entities = vec![sample(1, "item"), sample(2, "mob")];
        let mut bytes = Vec::new();
        save_entities(&entities, &mut bytes).unwrap();

        let total = bytes.len() as u64;
        let mut cursor = Cursor::new(bytes);
        let table = ClassTable::load_from(&mut cursor).unwrap();
        assert_eq!(table.len(), 2);
        let count = cursor.read_u32_le().unwrap();
        assert_eq!(count, 2);
        for _ in 0..count {
            let type_index = cursor.read_u32_le().unwrap();
            assert!(table.name(type_index).is_some());
            let size = cursor.read_u32_le().unwrap();
            cursor.seek(SeekFrom::Current(size as i64)).unwrap();
        }
        assert_eq!(cursor.position(), total);
    }

    #[test]
    fn image_size_covers_id_bounds_and_host_bytes() {
        let entity = sample(9, "item");
        let image = encode_entity_image(&entity);
        assert_eq!(image.len(), 4 + 6 * 4 + entity.payload.len());
        let decoded = decode_entity_image("item", &image).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn truncated_entity_stream_errors() {
        let mut bytes = Vec::new();
        save_entities(&[sample(1, "item")], &mut bytes).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(load_entities(&mut Cursor::new(bytes)).is_err());
    }
}

//! Little-endian primitive encoding over `std::io` streams.
//!
//! The section and index file formats are plain packed little-endian with no
//! alignment padding, so everything here is a thin extension trait rather
//! than a full serialization framework.

use std::io::{Read, Result, Write};

pub trait WriteExt: Write {
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value])
    }

    fn write_u16_le(&mut self, value: u16) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_u32_le(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_i32_le(&mut self, value: i32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_f32_le(&mut self, value: f32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_u16_slice_le(&mut self, values: &[u16]) -> Result<()> {
        for &value in values {
            self.write_u16_le(value)?;
        }
        Ok(())
    }

    fn write_u32_slice_le(&mut self, values: &[u32]) -> Result<()> {
        for &value in values {
            self.write_u32_le(value)?;
        }
        Ok(())
    }

    fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_u32_le(value.len() as u32)?;
        self.write_all(value.as_bytes())
    }
}

impl<W: Write + ?Sized> WriteExt for W {}

pub trait ReadExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32_le(&mut self) -> Result<i32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_f32_le(&mut self) -> Result<f32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    fn read_u16_slice_le(&mut self, out: &mut [u16]) -> Result<()> {
        for value in out.iter_mut() {
            *value = self.read_u16_le()?;
        }
        Ok(())
    }

    fn read_u32_slice_le(&mut self, out: &mut [u32]) -> Result<()> {
        for value in out.iter_mut() {
            *value = self.read_u32_le()?;
        }
        Ok(())
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32_le()? as usize;
        let mut buf = vec![0; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

impl<R: Read + ?Sized> ReadExt for R {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn primitives_round_trip() {
        let mut buf = Vec::new();
        buf.write_u8(0xAB).unwrap();
        buf.write_u16_le(0xCCBB).unwrap();
        buf.write_u32_le(0xCCBBAA03).unwrap();
        buf.write_i32_le(-42).unwrap();
        buf.write_f32_le(1.5).unwrap();
        buf.write_str("stone").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(cursor.read_u8().unwrap(), 0xAB);
        assert_eq!(cursor.read_u16_le().unwrap(), 0xCCBB);
        assert_eq!(cursor.read_u32_le().unwrap(), 0xCCBBAA03);
        assert_eq!(cursor.read_i32_le().unwrap(), -42);
        assert_eq!(cursor.read_f32_le().unwrap(), 1.5);
        assert_eq!(cursor.read_str().unwrap(), "stone");
    }

    #[test]
    fn slices_are_packed_little_endian() {
        let mut buf = Vec::new();
        buf.write_u16_slice_le(&[0x0102, 0x8000]).unwrap();
        assert_eq!(buf, [0x02, 0x01, 0x00, 0x80]);

        let mut out = [0u16; 2];
        Cursor::new(buf).read_u16_slice_le(&mut out).unwrap();
        assert_eq!(out, [0x0102, 0x8000]);
    }

    #[test]
    fn truncated_reads_error() {
        let mut cursor = Cursor::new(vec![0x01, 0x02]);
        assert!(cursor.read_u32_le().is_err());
    }
}

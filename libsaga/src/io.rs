use crate::hash::{Oid, OID_SIZE};
use std::io::{self, prelude::*};

// all fixed-width integers are little-endian on disk
pub(crate) trait ReadExt: Read {
    #[inline]
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut i = 0u8;
        self.read_exact(std::slice::from_mut(&mut i))?;
        Ok(i)
    }

    #[inline]
    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    #[inline]
    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    #[inline]
    fn read_i64(&mut self) -> io::Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    // variable length little-endian integer encoding
    // read next byte if MSB is 1
    fn read_varint(&mut self) -> io::Result<u64> {
        let mut n = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            n |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok(n)
    }

    #[inline]
    fn read_oid(&mut self) -> io::Result<Oid> {
        let mut buf = [0u8; OID_SIZE];
        self.read_exact(&mut buf)?;
        Ok(Oid::new(buf))
    }

    fn read_vec(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// varint length prefixed utf-8 string
    fn read_str(&mut self) -> io::Result<String> {
        let len = self.read_varint()? as usize;
        let bytes = self.read_vec(len)?;
        String::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl<R: Read + ?Sized> ReadExt for R {
}

pub(crate) trait WriteExt: Write {
    #[inline]
    fn write_u8(&mut self, i: u8) -> io::Result<()> {
        self.write_all(&[i])
    }

    #[inline]
    fn write_u32(&mut self, i: u32) -> io::Result<()> {
        self.write_all(&i.to_le_bytes())
    }

    #[inline]
    fn write_u64(&mut self, i: u64) -> io::Result<()> {
        self.write_all(&i.to_le_bytes())
    }

    #[inline]
    fn write_i64(&mut self, i: i64) -> io::Result<()> {
        self.write_all(&i.to_le_bytes())
    }

    fn write_varint(&mut self, mut n: u64) -> io::Result<()> {
        loop {
            let mut byte = (n & 0x7f) as u8;
            n >>= 7;
            if n != 0 {
                byte |= 0x80;
            }
            self.write_all(&[byte])?;
            if n == 0 {
                return Ok(());
            }
        }
    }

    #[inline]
    fn write_oid(&mut self, oid: Oid) -> io::Result<()> {
        self.write_all(oid.as_bytes())
    }

    /// varint length prefixed utf-8 string
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.write_varint(s.len() as u64)?;
        self.write_all(s.as_bytes())
    }
}

impl<W: Write + ?Sized> WriteExt for W {
}

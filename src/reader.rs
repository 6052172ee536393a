//! Position-tracking binary reader with runtime-selected endianness.
//!
//! Archive headers are big-endian; serialized-file metadata follows the
//! endianness byte in its own header. One reader type serves both, so the
//! byte order is a runtime field rather than a type parameter.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::{self, Read, Seek, SeekFrom};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    /// Map a serialized-file endianness byte (0 = little, nonzero = big).
    pub fn from_flag(flag: u8) -> Self {
        if flag == 0 {
            Endian::Little
        } else {
            Endian::Big
        }
    }
}

pub struct EndianReader<R> {
    inner: R,
    endian: Endian,
}

macro_rules! endian_read {
    ($name:ident, $ty:ty, $method:ident) => {
        pub fn $name(&mut self) -> io::Result<$ty> {
            match self.endian {
                Endian::Big => self.inner.$method::<BigEndian>(),
                Endian::Little => self.inner.$method::<LittleEndian>(),
            }
        }
    };
}

impl<R: Read + Seek> EndianReader<R> {
    pub fn new(inner: R, endian: Endian) -> Self {
        Self { inner, endian }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn position(&mut self) -> io::Result<u64> {
        self.inner.stream_position()
    }

    pub fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn skip(&mut self, bytes: i64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Current(bytes))?;
        Ok(())
    }

    /// Total stream length; restores the current position.
    pub fn stream_len(&mut self) -> io::Result<u64> {
        let pos = self.inner.stream_position()?;
        let len = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(len)
    }

    /// Advance to the next multiple of `alignment` from stream start.
    pub fn align(&mut self, alignment: u64) -> io::Result<()> {
        let pos = self.inner.stream_position()?;
        let rem = pos % alignment;
        if rem != 0 {
            self.inner.seek(SeekFrom::Current((alignment - rem) as i64))?;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        self.inner.read_u8()
    }

    pub fn read_i8(&mut self) -> io::Result<i8> {
        self.inner.read_i8()
    }

    pub fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.inner.read_u8()? != 0)
    }

    endian_read!(read_u16, u16, read_u16);
    endian_read!(read_i16, i16, read_i16);
    endian_read!(read_u32, u32, read_u32);
    endian_read!(read_i32, i32, read_i32);
    endian_read!(read_u64, u64, read_u64);
    endian_read!(read_i64, i64, read_i64);
    endian_read!(read_f32, f32, read_f32);
    endian_read!(read_f64, f64, read_f64);

    pub fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_exact_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read bytes up to (and consuming) the next NUL, decoded lossily.
    pub fn read_cstring(&mut self) -> io::Result<String> {
        let mut bytes = Vec::new();
        loop {
            let b = self.inner.read_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<R: Read> Read for EndianReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

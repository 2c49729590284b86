//! File I/O and mapping: pread/pwrite with an optional shared mmap mirror,
//! growth, and centralized endian conversion.
//!
//! The invariant maintained here is simple: bytes visible through the map
//! equal bytes visible through pread at all times (the map is MAP_SHARED on
//! the same descriptor), so callers may mix paths freely.  Durability is
//! only promised after [`TdbFile::sync`].
//!
//! All multi-byte integers pass through [`TdbFile::read_off`] /
//! [`TdbFile::write_off`] (and their u32 counterparts for the legacy
//! format), which byte-swap when the database carries the CONVERT feature.
//! Keys and values are byte strings and never converted.

use std::fs::File;
use std::os::unix::fs::FileExt;

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Storage behind a database: a real file (optionally mapped) or an
/// in-memory buffer for `Flags::INTERNAL` databases.
pub(crate) enum Backing {
    Mem(Vec<u8>),
    File {
        file: File,
        map: Option<MmapMut>,
        size: u64,
        no_mmap: bool,
    },
}

/// A database's byte store.
pub(crate) struct TdbFile {
    backing: Backing,
    /// Byte-swap every integer field on read and write.
    pub convert: bool,
    /// Elide fsync/msync.
    pub no_sync: bool,
    /// Identity for the per-process double-open registry.
    pub device: u64,
    pub inode: u64,
}

impl TdbFile {
    pub fn new_mem(image: Vec<u8>, convert: bool) -> TdbFile {
        TdbFile {
            backing: Backing::Mem(image),
            convert,
            no_sync: true,
            device: 0,
            inode: 0,
        }
    }

    pub fn new_file(
        file: File,
        size: u64,
        no_mmap: bool,
        convert: bool,
        no_sync: bool,
        device: u64,
        inode: u64,
    ) -> Result<TdbFile> {
        let mut f = TdbFile {
            backing: Backing::File {
                file,
                map: None,
                size,
                no_mmap,
            },
            convert,
            no_sync,
            device,
            inode,
        };
        f.remap()?;
        Ok(f)
    }

    /// Current length of the store in bytes.
    pub fn size(&self) -> u64 {
        match &self.backing {
            Backing::Mem(v) => v.len() as u64,
            Backing::File { size, .. } => *size,
        }
    }

    pub fn is_mem(&self) -> bool {
        matches!(self.backing, Backing::Mem(_))
    }

    pub fn file(&self) -> Option<&File> {
        match &self.backing {
            Backing::Mem(_) => None,
            Backing::File { file, .. } => Some(file),
        }
    }

    /// Refresh the cached file size from the descriptor (another process
    /// may have grown the file) and re-map if it changed.
    pub fn refresh_size(&mut self) -> Result<()> {
        let new = match &self.backing {
            Backing::Mem(_) => return Ok(()),
            Backing::File { file, .. } => file.metadata().map_err(|_| Error::Io)?.len(),
        };
        if let Backing::File { size, .. } = &mut self.backing {
            if *size != new {
                *size = new;
                return self.remap();
            }
        }
        Ok(())
    }

    /// Toggle the no-mmap policy at runtime and re-map accordingly.
    pub fn set_no_mmap(&mut self, v: bool) -> Result<()> {
        if let Backing::File { no_mmap, .. } = &mut self.backing {
            *no_mmap = v;
        }
        self.remap()
    }

    /// (Re)establish the mapping to cover the whole file.  A zero-length
    /// file stays unmapped until it grows.
    pub fn remap(&mut self) -> Result<()> {
        if let Backing::File {
            file,
            map,
            size,
            no_mmap,
        } = &mut self.backing
        {
            *map = None;
            if !*no_mmap && *size > 0 {
                // Safety: the mapping is over our own descriptor and torn
                // down before the file handle; other processes mutate the
                // file only under the advisory lock protocol.
                match unsafe { MmapMut::map_mut(&*file) } {
                    Ok(m) => *map = Some(m),
                    // Fall back to pread/pwrite; correctness is unaffected.
                    Err(_) => *map = None,
                }
            }
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes at `off`.
    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        if off.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(Error::Io);
        }
        match &self.backing {
            Backing::Mem(v) => {
                buf.copy_from_slice(&v[off as usize..(off + len) as usize]);
                Ok(())
            }
            Backing::File { file, map, .. } => {
                if let Some(m) = map {
                    buf.copy_from_slice(&m[off as usize..(off + len) as usize]);
                    Ok(())
                } else {
                    file.read_exact_at(buf, off).map_err(|_| Error::Io)
                }
            }
        }
    }

    /// Read `len` bytes at `off` into a fresh buffer.
    pub fn read_vec(&self, off: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.read(off, &mut buf)?;
        Ok(buf)
    }

    /// Borrow `len` bytes at `off` directly from the mapping when one
    /// exists, copying otherwise.
    pub fn read_ref(&self, off: u64, len: u64) -> Result<std::borrow::Cow<'_, [u8]>> {
        if off.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(Error::Io);
        }
        match &self.backing {
            Backing::Mem(v) => Ok(std::borrow::Cow::Borrowed(
                &v[off as usize..(off + len) as usize],
            )),
            Backing::File { map: Some(m), .. } => Ok(std::borrow::Cow::Borrowed(
                &m[off as usize..(off + len) as usize],
            )),
            Backing::File { .. } => Ok(std::borrow::Cow::Owned(self.read_vec(off, len)?)),
        }
    }

    /// Write `data` at `off`.  The range must already be inside the file;
    /// growth goes through [`TdbFile::expand_file`].
    pub fn write(&mut self, off: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        if off.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(Error::Io);
        }
        match &mut self.backing {
            Backing::Mem(v) => {
                v[off as usize..(off + len) as usize].copy_from_slice(data);
                Ok(())
            }
            Backing::File { file, map, .. } => {
                if let Some(m) = map {
                    m[off as usize..(off + len) as usize].copy_from_slice(data);
                    Ok(())
                } else {
                    file.write_all_at(data, off).map_err(|_| Error::Io)
                }
            }
        }
    }

    /// Grow the store by `add` bytes of zeroes and re-establish the map.
    pub fn expand_file(&mut self, add: u64) -> Result<()> {
        match &mut self.backing {
            Backing::Mem(v) => {
                let new = v.len() as u64 + add;
                v.resize(new as usize, 0);
                Ok(())
            }
            Backing::File { file, size, .. } => {
                let new = *size + add;
                // ftruncate zero-fills the extension.
                file.set_len(new).map_err(|_| Error::Io)?;
                *size = new;
                self.remap()
            }
        }
    }

    /// Shrink the store to exactly `new_size` bytes (recovery replay only).
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        match &mut self.backing {
            Backing::Mem(v) => {
                v.truncate(new_size as usize);
                Ok(())
            }
            Backing::File {
                file, map, size, ..
            } => {
                *map = None;
                file.set_len(new_size).map_err(|_| Error::Io)?;
                *size = new_size;
                self.remap()
            }
        }
    }

    /// Push written bytes to stable storage, unless NOSYNC.
    pub fn sync(&mut self) -> Result<()> {
        if self.no_sync {
            return Ok(());
        }
        if let Backing::File { file, map, .. } = &mut self.backing {
            if let Some(m) = map {
                m.flush().map_err(|_| Error::Io)?;
            }
            file.sync_data().map_err(|_| Error::Io)?;
        }
        Ok(())
    }

    // ── Converted integer access ─────────────────────────────────────────────

    #[inline]
    pub fn conv64(&self, v: u64) -> u64 {
        if self.convert {
            v.swap_bytes()
        } else {
            v
        }
    }

    #[inline]
    pub fn conv32(&self, v: u32) -> u32 {
        if self.convert {
            v.swap_bytes()
        } else {
            v
        }
    }

    /// Read one 64-bit field.
    pub fn read_off(&self, off: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(off, &mut buf)?;
        Ok(self.conv64(u64::from_le_bytes(buf)))
    }

    /// Write one 64-bit field.
    pub fn write_off(&mut self, off: u64, v: u64) -> Result<()> {
        self.write(off, &self.conv64(v).to_le_bytes())
    }

    /// Read `n` consecutive 64-bit fields.
    pub fn read_offs(&self, off: u64, n: u64) -> Result<Vec<u64>> {
        let raw = self.read_vec(off, n * 8)?;
        Ok(raw
            .chunks_exact(8)
            .map(|c| self.conv64(u64::from_le_bytes(c.try_into().unwrap())))
            .collect())
    }

    /// Write consecutive 64-bit fields.
    pub fn write_offs(&mut self, off: u64, vals: &[u64]) -> Result<()> {
        let mut raw = Vec::with_capacity(vals.len() * 8);
        for &v in vals {
            raw.extend_from_slice(&self.conv64(v).to_le_bytes());
        }
        self.write(off, &raw)
    }

    /// Read one 32-bit field (legacy format).
    pub fn read_u32(&self, off: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(off, &mut buf)?;
        Ok(self.conv32(u32::from_le_bytes(buf)))
    }

    /// Write one 32-bit field (legacy format).
    pub fn write_u32(&mut self, off: u64, v: u32) -> Result<()> {
        self.write(off, &self.conv32(v).to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_round_trip() {
        let mut f = TdbFile::new_mem(vec![0; 64], false);
        f.write_off(8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(f.read_off(8).unwrap(), 0x0102_0304_0506_0708);
        f.write(0, b"hello").unwrap();
        assert_eq!(&f.read_vec(0, 5).unwrap(), b"hello");
        assert_eq!(f.size(), 64);
        f.expand_file(16).unwrap();
        assert_eq!(f.size(), 80);
        assert_eq!(f.read_vec(64, 16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn convert_swaps_fields_not_bytes() {
        let mut f = TdbFile::new_mem(vec![0; 32], true);
        f.write_off(0, 1).unwrap();
        // On disk the value is byte-swapped...
        let raw = u64::from_le_bytes(f.read_vec(0, 8).unwrap().try_into().unwrap());
        assert_eq!(raw, 1u64.swap_bytes());
        // ...but reads convert it back.
        assert_eq!(f.read_off(0).unwrap(), 1);
        // Byte strings pass through untouched.
        f.write(8, b"abcd").unwrap();
        assert_eq!(&f.read_vec(8, 4).unwrap(), b"abcd");
    }

    #[test]
    fn out_of_range_is_io() {
        let f = TdbFile::new_mem(vec![0; 16], false);
        assert_eq!(f.read_off(16), Err(Error::Io));
        assert_eq!(f.read_off(u64::MAX - 3), Err(Error::Io));
        let mut f = f;
        assert_eq!(f.write(12, &[0; 8]), Err(Error::Io));
    }

    #[test]
    fn vector_field_io() {
        let mut f = TdbFile::new_mem(vec![0; 64], false);
        f.write_offs(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(f.read_offs(0, 4).unwrap(), vec![1, 2, 3, 4]);
    }
}

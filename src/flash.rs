//! Block device abstraction standing in for NOR flash

use crate::error::{FsError, FsResult};

/// Callbacks the filesystem engine uses to reach the flash.
pub trait Flash {
    /// Total size in bytes
    fn size(&self) -> usize;

    /// Read `buf.len()` bytes starting at `addr`
    fn read(&self, addr: u32, buf: &mut [u8]) -> FsResult<()>;

    /// Program `data` at `addr`
    fn write(&mut self, addr: u32, data: &[u8]) -> FsResult<()>;

    /// Reset `len` bytes starting at `addr` to 0xFF
    fn erase(&mut self, addr: u32, len: usize) -> FsResult<()>;
}

/// Flash simulated by a byte buffer the size of the image.
///
/// No page or erase-block alignment is enforced here; the engine is
/// responsible for that.
#[derive(Debug, Clone)]
pub struct RamFlash {
    buf: Vec<u8>,
}

impl RamFlash {
    /// Wrap an existing image
    pub fn from_vec(buf: Vec<u8>) -> Self {
        RamFlash { buf }
    }

    /// A fully erased device of `size` bytes
    pub fn erased(size: usize) -> Self {
        RamFlash {
            buf: vec![0xFF; size],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn range(&self, addr: u32, len: usize) -> FsResult<std::ops::Range<usize>> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.buf.len() => Ok(start..end),
            _ => Err(FsError::OutOfBounds {
                addr,
                len,
                size: self.buf.len(),
            }),
        }
    }
}

impl Flash for RamFlash {
    fn size(&self) -> usize {
        self.buf.len()
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> FsResult<()> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.buf[range]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> FsResult<()> {
        let range = self.range(addr, data.len())?;
        self.buf[range].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: usize) -> FsResult<()> {
        let range = self.range(addr, len)?;
        self.buf[range].fill(0xFF);
        Ok(())
    }
}

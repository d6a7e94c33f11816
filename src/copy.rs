//! Streaming copies between host files and the mounted filesystem

use crate::flash::Flash;
use crate::fs::{FileHandle, FlashFs};
use crate::types::OpenFlags;
use anyhow::{Context, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// Size of the intermediate copy buffer
pub const COPY_BUF_SIZE: usize = 512;

/// Copy everything from `src` to `dst` through a bounded buffer.
/// Returns the number of bytes copied.
pub fn copy_stream<R, W>(src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }

    dst.flush()?;
    Ok(total)
}

/// `Read` adapter over an open filesystem file
pub struct FileReader<'a, F: Flash> {
    fs: &'a mut FlashFs<F>,
    fh: FileHandle,
}

impl<'a, F: Flash> FileReader<'a, F> {
    pub fn new(fs: &'a mut FlashFs<F>, fh: FileHandle) -> Self {
        FileReader { fs, fh }
    }
}

impl<F: Flash> Read for FileReader<'_, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fs.read(self.fh, buf).map_err(io::Error::other)
    }
}

/// `Write` adapter over an open filesystem file
pub struct FileWriter<'a, F: Flash> {
    fs: &'a mut FlashFs<F>,
    fh: FileHandle,
}

impl<'a, F: Flash> FileWriter<'a, F> {
    pub fn new(fs: &'a mut FlashFs<F>, fh: FileHandle) -> Self {
        FileWriter { fs, fh }
    }
}

impl<F: Flash> Write for FileWriter<'_, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.fs.write(self.fh, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Copy a host file into the filesystem, replacing any existing file
pub fn import<F: Flash>(fs: &mut FlashFs<F>, src: &Path, dst: &str) -> Result<u64> {
    let mut host = File::open(src).with_context(|| format!("Failed to open '{}'", src.display()))?;

    let fh = fs
        .open(dst, OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY)
        .with_context(|| format!("Failed to create '{}'", dst))?;

    let copied = copy_stream(&mut host, &mut FileWriter::new(fs, fh));
    let closed = fs.close(fh);

    let copied = copied.with_context(|| format!("Failed to write '{}'", dst))?;
    closed.with_context(|| format!("Failed to write '{}'", dst))?;

    debug!("Imported {} bytes from {} to {}", copied, src.display(), dst);
    Ok(copied)
}

/// Copy a filesystem file out to the host, replacing any existing file
pub fn export<F: Flash>(fs: &mut FlashFs<F>, src: &str, dst: &Path) -> Result<u64> {
    let fh = fs
        .open(src, OpenFlags::RDONLY)
        .with_context(|| format!("Failed to open '{}'", src))?;

    let host = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)
        .with_context(|| format!("Failed to create '{}'", dst.display()));
    let result = match host {
        Ok(mut host) => copy_stream(&mut FileReader::new(fs, fh), &mut host)
            .with_context(|| format!("Failed to write '{}'", dst.display())),
        Err(e) => Err(e),
    };
    fs.close(fh)
        .with_context(|| format!("Failed to close '{}'", src))?;

    let copied = result?;
    debug!("Exported {} bytes from {} to {}", copied, src, dst.display());
    Ok(copied)
}

/// Stream a filesystem file to `out`
pub fn cat<F: Flash, W: Write + ?Sized>(fs: &mut FlashFs<F>, path: &str, out: &mut W) -> Result<u64> {
    let fh = fs
        .open(path, OpenFlags::RDONLY)
        .with_context(|| format!("Failed to open '{}'", path))?;

    let copied = copy_stream(&mut FileReader::new(fs, fh), out);
    fs.close(fh)
        .with_context(|| format!("Failed to close '{}'", path))?;

    copied.with_context(|| format!("Failed to read '{}'", path))
}

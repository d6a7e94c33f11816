//! Backing image file lifecycle: open or create, load, mount, flush

use crate::flash::RamFlash;
use crate::fs::FlashFs;
use crate::types::{FsConfig, PAGE_SIZE};
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Check that `size` is usable as an image size
pub fn validate_size(size: u64) -> Result<u32> {
    if size == 0 {
        bail!("Image size must not be zero");
    }
    if size % PAGE_SIZE as u64 != 0 {
        bail!(
            "Image size {} is not a multiple of the page size ({})",
            size,
            PAGE_SIZE
        );
    }
    u32::try_from(size).with_context(|| format!("Image size {} is too large", size))
}

/// Host file holding a flash image
#[derive(Debug)]
pub struct Image {
    file: File,
    path: PathBuf,
    size: u32,
    created: bool,
}

impl Image {
    /// Open an existing image, taking its size from the file length
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let len = file
            .metadata()
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        let size = validate_size(len).with_context(|| format!("Bad image {}", path.display()))?;

        debug!("Opened {} ({} bytes)", path.display(), size);
        Ok(Image {
            file,
            path: path.to_path_buf(),
            size,
            created: false,
        })
    }

    /// Create (or truncate) an image of `size` bytes. The size is checked
    /// before the file is touched.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref();
        let size = validate_size(size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        file.set_len(size as u64)
            .with_context(|| format!("Failed to size {}", path.display()))?;

        info!("Created {} ({} bytes)", path.display(), size);
        Ok(Image {
            file,
            path: path.to_path_buf(),
            size,
            created: true,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Materialize the image in memory. A newly created image starts
    /// fully erased.
    pub fn load(&mut self) -> Result<RamFlash> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(self.size as usize)
            .with_context(|| format!("Failed to allocate {} bytes", self.size))?;

        if self.created {
            buf.resize(self.size as usize, 0xFF);
        } else {
            buf.resize(self.size as usize, 0);
            self.file.seek(SeekFrom::Start(0))?;
            self.file
                .read_exact(&mut buf)
                .with_context(|| format!("Failed to read {}", self.path.display()))?;
        }
        Ok(RamFlash::from_vec(buf))
    }

    /// Load the image and mount the filesystem on it
    pub fn mount(mut self) -> Result<Session> {
        let flash = self.load()?;
        let fs = FlashFs::mount(flash, FsConfig::new(self.size))
            .with_context(|| format!("Failed to mount {}", self.path.display()))?;
        Ok(Session { image: self, fs })
    }

    /// Write the whole buffer back at offset 0
    fn store(&mut self, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(data)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        self.file
            .sync_all()
            .with_context(|| format!("Failed to sync {}", self.path.display()))?;
        Ok(())
    }
}

/// A mounted image. Call [`Session::finish`] to unmount and persist.
pub struct Session {
    image: Image,
    fs: FlashFs<RamFlash>,
}

impl Session {
    /// Open or create `path` and mount it
    pub fn open<P: AsRef<Path>>(path: P, create: Option<u64>) -> Result<Self> {
        let image = match create {
            Some(size) => Image::create(path, size)?,
            None => Image::open(path)?,
        };
        image.mount()
    }

    pub fn fs(&mut self) -> &mut FlashFs<RamFlash> {
        &mut self.fs
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Unmount and write the buffer back to the image file. The buffer is
    /// written even if unmounting reports an error.
    pub fn finish(self) -> Result<()> {
        let Session { mut image, mut fs } = self;

        let unmounted = fs.unmount();
        if let Err(e) = &unmounted {
            warn!("Unmount failed, flushing image anyway: {}", e);
        }

        let flash = fs.into_inner();
        image.store(flash.as_bytes())?;
        info!("Wrote {} bytes to {}", image.size, image.path.display());

        unmounted.with_context(|| format!("Failed to unmount {}", image.path.display()))
    }
}

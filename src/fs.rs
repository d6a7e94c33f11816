//! Flash filesystem engine
//!
//! A small log-structured store over a [`Flash`] device. Every logical block
//! starts with a [`BlockHeader`] page; the remaining pages are either free,
//! live or deleted object pages. Pages are never rewritten in place: updates
//! allocate a fresh page and retire the old one, and space is reclaimed by
//! erasing whole blocks during garbage collection.

use crate::error::{FsError, FsResult};
use crate::flash::Flash;
use crate::types::*;
use log::{debug, info, warn};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    /// Block header page
    Meta,
    Free,
    Live,
    Deleted,
}

/// In-RAM view of one object, rebuilt at mount
#[derive(Debug, Clone)]
struct Object {
    entry_type: EntryType,
    name: String,
    index_page: u32,
    /// (page number, payload length) for each data span in order
    data: Vec<(u32, u16)>,
}

impl Object {
    fn size(&self) -> u64 {
        self.data.iter().map(|&(_, len)| len as u64).sum()
    }
}

#[derive(Debug)]
struct OpenFile {
    obj_id: u16,
    flags: OpenFlags,
    pos: u64,
    /// Bytes not yet programmed (always less than one page after a write)
    pending: Vec<u8>,
    tail_loaded: bool,
}

/// Handle returned by [`FlashFs::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(usize);

impl FileHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Cursor over a directory listing
#[derive(Debug)]
pub struct Dir {
    prefix: String,
    next: Option<u16>,
}

/// Mounted flash filesystem
pub struct FlashFs<F: Flash> {
    flash: F,
    config: FsConfig,
    pages: Vec<PageState>,
    objects: BTreeMap<u16, Object>,
    fds: Vec<Option<OpenFile>>,
    work: Vec<u8>,
    cursor: usize,
}

impl<F: Flash> FlashFs<F> {
    /// Mount the filesystem on `flash`, formatting blank blocks in place
    pub fn mount(flash: F, config: FsConfig) -> FsResult<Self> {
        Self::check_geometry(&config, flash.size())?;

        let blocks = config.block_count() as usize;
        let total_pages = blocks * config.pages_per_block() as usize;

        let mut fs = FlashFs {
            flash,
            config,
            pages: vec![PageState::Free; total_pages],
            objects: BTreeMap::new(),
            fds: (0..config.max_open_files).map(|_| None).collect(),
            work: vec![0xFF; config.log_page_size as usize],
            cursor: 0,
        };

        let live = fs.scan_blocks()?;
        fs.rebuild_index(live)?;

        info!(
            "Mounted {} blocks, {} objects, {} free pages",
            blocks,
            fs.objects.len(),
            fs.count(PageState::Free)
        );
        Ok(fs)
    }

    fn check_geometry(config: &FsConfig, flash_size: usize) -> FsResult<()> {
        let page = config.log_page_size;
        let block = config.log_block_size;

        if (page as usize) < PageHeader::SIZE + MAX_NAME_LEN + 1 {
            return Err(FsError::BadGeometry(format!("page size {} too small", page)));
        }
        if block == 0 || block % page != 0 || block / page < 2 {
            return Err(FsError::BadGeometry(format!(
                "block size {} is not a multiple of page size {}",
                block, page
            )));
        }
        if config.phys_erase_block == 0 || block % config.phys_erase_block != 0 {
            return Err(FsError::BadGeometry(format!(
                "block size {} is not a multiple of erase block {}",
                block, config.phys_erase_block
            )));
        }
        if config.phys_size as usize > flash_size {
            return Err(FsError::BadGeometry(format!(
                "configured size {} exceeds device size {}",
                config.phys_size, flash_size
            )));
        }
        if config.block_count() < 2 {
            return Err(FsError::BadGeometry(format!(
                "{} bytes holds fewer than 2 blocks",
                config.phys_size
            )));
        }
        if config.max_open_files == 0 {
            return Err(FsError::BadGeometry("empty file table".to_string()));
        }
        Ok(())
    }

    /// Classify every page, formatting blank blocks. Returns the live pages.
    fn scan_blocks(&mut self) -> FsResult<Vec<(u32, PageHeader)>> {
        let ppb = self.config.pages_per_block();
        let mut live = Vec::new();
        let mut last_live = None;

        for block in 0..self.config.block_count() {
            let mut raw = [0u8; BlockHeader::SIZE];
            self.flash.read(block * self.config.log_block_size, &mut raw)?;

            if BlockHeader::is_blank(&raw) {
                debug!("Formatting blank block {}", block);
                self.format_block(block)?;
                continue;
            }

            let header = BlockHeader::from_bytes(&raw).unwrap_or(BlockHeader { magic: 0 });
            if !header.is_valid() {
                return Err(FsError::NotFormatted {
                    block,
                    magic: header.magic,
                });
            }
            self.pages[(block * ppb) as usize] = PageState::Meta;

            for page in block * ppb + 1..(block + 1) * ppb {
                let hdr = self.read_header(page)?;
                self.pages[page as usize] = match hdr.flags {
                    PAGE_FREE => PageState::Free,
                    PAGE_LIVE => {
                        live.push((page, hdr));
                        last_live = Some(page);
                        PageState::Live
                    }
                    _ => PageState::Deleted,
                };
            }
        }

        if let Some(page) = last_live {
            self.cursor = (page as usize + 1) % self.pages.len();
        }
        Ok(live)
    }

    /// Build the object table from live pages, retiring anything unreachable
    fn rebuild_index(&mut self, live: Vec<(u32, PageHeader)>) -> FsResult<()> {
        let mut spans: BTreeMap<u16, BTreeMap<u16, (u32, u16)>> = BTreeMap::new();
        let dpp = self.config.data_per_page();

        for &(page, hdr) in live.iter().filter(|(_, h)| h.kind == KIND_INDEX) {
            let len = hdr.len as usize;
            if len < 2 || len > MAX_NAME_LEN + 1 || self.objects.contains_key(&hdr.obj_id) {
                warn!("Dropping bad index page {} (obj {})", page, hdr.obj_id);
                self.delete_page(page)?;
                continue;
            }

            let mut payload = vec![0u8; len];
            self.flash
                .read(self.page_addr(page) + PageHeader::SIZE as u32, &mut payload)?;
            self.objects.insert(
                hdr.obj_id,
                Object {
                    entry_type: EntryType::from_u8(payload[0]),
                    name: String::from_utf8_lossy(&payload[1..]).to_string(),
                    index_page: page,
                    data: Vec::new(),
                },
            );
        }

        for &(page, hdr) in live.iter().filter(|(_, h)| h.kind != KIND_INDEX) {
            let known = hdr.kind == KIND_DATA && self.objects.contains_key(&hdr.obj_id);
            if !known || hdr.len as usize > dpp {
                debug!("Dropping orphan page {} (obj {})", page, hdr.obj_id);
                self.delete_page(page)?;
                continue;
            }
            let object_spans = spans.entry(hdr.obj_id).or_default();
            if object_spans.contains_key(&hdr.span) {
                warn!("Dropping duplicate span {} of obj {}", hdr.span, hdr.obj_id);
                self.delete_page(page)?;
                continue;
            }
            object_spans.insert(hdr.span, (page, hdr.len));
        }

        // Data must form a contiguous run of spans where only the last page
        // may be short
        for (obj_id, object_spans) in spans {
            let mut data = Vec::new();
            let mut broken = false;
            for (expected, (span, (page, len))) in object_spans.into_iter().enumerate() {
                if broken || span as usize != expected {
                    broken = true;
                    self.delete_page(page)?;
                    continue;
                }
                data.push((page, len));
                if (len as usize) < dpp {
                    broken = true;
                }
            }
            if broken {
                warn!("Object {} truncated to {} spans", obj_id, data.len());
            }
            if let Some(object) = self.objects.get_mut(&obj_id) {
                object.data = data;
            }
        }
        Ok(())
    }

    /// Release all open files, flushing buffered data
    pub fn unmount(&mut self) -> FsResult<()> {
        let mut result = Ok(());
        for idx in 0..self.fds.len() {
            if self.fds[idx].is_some() {
                let closed = self.close(FileHandle(idx));
                if result.is_ok() {
                    result = closed;
                }
            }
        }
        info!("Unmounted ({} objects)", self.objects.len());
        result
    }

    /// Hand back the underlying device
    pub fn into_inner(self) -> F {
        self.flash
    }

    // --- page level ---

    fn page_addr(&self, page: u32) -> u32 {
        page * self.config.log_page_size
    }

    fn block_of(&self, page: usize) -> u32 {
        page as u32 / self.config.pages_per_block()
    }

    fn count(&self, state: PageState) -> usize {
        self.pages.iter().filter(|&&s| s == state).count()
    }

    fn read_header(&self, page: u32) -> FsResult<PageHeader> {
        let mut raw = [0u8; PageHeader::SIZE];
        self.flash.read(self.page_addr(page), &mut raw)?;
        // Eight bytes always decode
        Ok(PageHeader::from_bytes(&raw).unwrap_or(PageHeader {
            flags: PAGE_DELETED,
            kind: 0,
            obj_id: OBJ_ID_FREE,
            span: 0,
            len: 0,
        }))
    }

    fn delete_page(&mut self, page: u32) -> FsResult<()> {
        self.flash.write(self.page_addr(page), &[PAGE_DELETED])?;
        self.pages[page as usize] = PageState::Deleted;
        Ok(())
    }

    fn format_block(&mut self, block: u32) -> FsResult<()> {
        let ppb = self.config.pages_per_block();
        let addr = block * self.config.log_block_size;

        self.flash.erase(addr, self.config.log_block_size as usize)?;
        self.flash.write(addr, &BlockHeader::new().to_bytes())?;

        let first = (block * ppb) as usize;
        self.pages[first] = PageState::Meta;
        for state in &mut self.pages[first + 1..first + ppb as usize] {
            *state = PageState::Free;
        }
        Ok(())
    }

    /// Next free page at or after the cursor, skipping `exclude`
    fn find_free(&mut self, exclude: Option<u32>) -> Option<u32> {
        let total = self.pages.len();
        for i in 0..total {
            let page = (self.cursor + i) % total;
            if self.pages[page] == PageState::Free && Some(self.block_of(page)) != exclude {
                self.cursor = (page + 1) % total;
                return Some(page as u32);
            }
        }
        None
    }

    /// Allocate a page, keeping enough free pages back that garbage
    /// collection can always evacuate one block.
    fn alloc_page(&mut self) -> FsResult<u32> {
        let reserve = (self.config.pages_per_block() - 1) as usize;
        while self.count(PageState::Free) <= reserve {
            if !self.gc()? {
                return Err(FsError::Full);
            }
        }
        self.find_free(None).ok_or(FsError::Full)
    }

    /// Program a live page and return its number
    fn write_page(&mut self, kind: u8, obj_id: u16, span: u16, payload: &[u8]) -> FsResult<u32> {
        let page = self.alloc_page()?;
        let addr = self.page_addr(page);
        let hdr = PageHeader {
            flags: PAGE_LIVE,
            kind,
            obj_id,
            span,
            len: payload.len() as u16,
        };

        let end = PageHeader::SIZE + payload.len();
        self.work.fill(0xFF);
        self.work[..PageHeader::SIZE].copy_from_slice(&hdr.to_bytes());
        self.work[PageHeader::SIZE..end].copy_from_slice(payload);
        self.flash.write(addr, &self.work[..end])?;

        self.pages[page as usize] = PageState::Live;
        Ok(page)
    }

    /// Reclaim the block with the most deleted pages (lowest index on a
    /// tie). Returns false when nothing can be reclaimed.
    fn gc(&mut self) -> FsResult<bool> {
        let ppb = self.config.pages_per_block() as usize;
        let free_total = self.count(PageState::Free);

        let mut victim: Option<(u32, usize)> = None;
        for block in 0..self.config.block_count() {
            let states = &self.pages[block as usize * ppb..(block as usize + 1) * ppb];
            let deleted = states.iter().filter(|&&s| s == PageState::Deleted).count();
            let live = states.iter().filter(|&&s| s == PageState::Live).count();
            let free = states.iter().filter(|&&s| s == PageState::Free).count();

            if deleted == 0 || live > free_total - free {
                continue;
            }
            if victim.map_or(true, |(_, best)| deleted > best) {
                victim = Some((block, deleted));
            }
        }

        let Some((block, deleted)) = victim else {
            return Ok(false);
        };
        debug!("GC block {} ({} deleted)", block, deleted);

        let first = block as usize * ppb;
        for page in first + 1..first + ppb {
            if self.pages[page] == PageState::Live {
                self.relocate(page as u32, block)?;
            }
        }

        self.format_block(block)?;
        Ok(true)
    }

    fn relocate(&mut self, page: u32, victim: u32) -> FsResult<()> {
        let target = self.find_free(Some(victim)).ok_or(FsError::Full)?;
        let from = self.page_addr(page);
        let to = self.page_addr(target);

        self.flash.read(from, &mut self.work)?;
        self.flash.write(to, &self.work)?;
        self.pages[target as usize] = PageState::Live;
        self.pages[page as usize] = PageState::Deleted;

        let hdr = self.read_header(target)?;
        match self.objects.get_mut(&hdr.obj_id) {
            Some(object) if hdr.kind == KIND_INDEX => object.index_page = target,
            Some(object) => {
                if let Some(slot) = object.data.get_mut(hdr.span as usize) {
                    slot.0 = target;
                }
            }
            None => {
                warn!("Relocated unreferenced page {}", page);
                self.delete_page(target)?;
            }
        }
        Ok(())
    }

    // --- objects ---

    fn normalize(path: &str) -> FsResult<String> {
        let name = path.trim_start_matches('/');
        if name.is_empty() || name.contains('\0') {
            return Err(FsError::InvalidName(path.to_string()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        Ok(name.to_string())
    }

    fn find(&self, name: &str) -> Option<u16> {
        self.objects
            .iter()
            .find(|(_, obj)| obj.name == name)
            .map(|(&id, _)| id)
    }

    fn create_object(&mut self, name: &str, entry_type: EntryType) -> FsResult<u16> {
        let obj_id = (1..OBJ_ID_FREE)
            .find(|id| !self.objects.contains_key(id))
            .ok_or(FsError::Full)?;

        let mut payload = Vec::with_capacity(name.len() + 1);
        payload.push(entry_type.to_u8());
        payload.extend_from_slice(name.as_bytes());
        let index_page = self.write_page(KIND_INDEX, obj_id, 0, &payload)?;

        debug!("Created object {} '{}'", obj_id, name);
        self.objects.insert(
            obj_id,
            Object {
                entry_type,
                name: name.to_string(),
                index_page,
                data: Vec::new(),
            },
        );
        Ok(obj_id)
    }

    fn truncate_object(&mut self, obj_id: u16) -> FsResult<()> {
        let data = match self.objects.get_mut(&obj_id) {
            Some(object) => std::mem::take(&mut object.data),
            None => return Ok(()),
        };
        for (page, _) in data {
            self.delete_page(page)?;
        }
        Ok(())
    }

    /// Pull a short last page back into the write buffer so appends
    /// continue it instead of leaving a hole.
    fn load_tail(&mut self, file: &mut OpenFile) -> FsResult<()> {
        let dpp = self.config.data_per_page();
        let tail = match self.objects.get(&file.obj_id) {
            Some(object) => object.data.last().copied(),
            None => return Err(FsError::BadHandle(file.obj_id as usize)),
        };

        if let Some((page, len)) = tail {
            if (len as usize) < dpp {
                let mut data = vec![0u8; len as usize];
                self.flash
                    .read(self.page_addr(page) + PageHeader::SIZE as u32, &mut data)?;
                self.delete_page(page)?;
                if let Some(object) = self.objects.get_mut(&file.obj_id) {
                    object.data.pop();
                }
                data.extend_from_slice(&file.pending);
                file.pending = data;
            }
        }
        Ok(())
    }

    /// Program buffered data. Only whole pages are written unless `all`.
    fn flush_pending(&mut self, file: &mut OpenFile, all: bool) -> FsResult<()> {
        let dpp = self.config.data_per_page();
        while file.pending.len() >= dpp || (all && !file.pending.is_empty()) {
            let n = file.pending.len().min(dpp);
            let span = match self.objects.get(&file.obj_id) {
                Some(object) => object.data.len(),
                None => return Err(FsError::BadHandle(file.obj_id as usize)),
            };
            let span = u16::try_from(span).map_err(|_| FsError::Full)?;

            let page = self.write_page(KIND_DATA, file.obj_id, span, &file.pending[..n])?;
            if let Some(object) = self.objects.get_mut(&file.obj_id) {
                object.data.push((page, n as u16));
            }
            file.pending.drain(..n);
        }
        Ok(())
    }

    // --- public file API ---

    /// Open `path`. Without `CREAT` the file must exist; `TRUNC` discards
    /// existing contents when writing. Writes always append.
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> FsResult<FileHandle> {
        let name = Self::normalize(path)?;
        let flags = if flags.readable() || flags.writable() {
            flags
        } else {
            flags | OpenFlags::RDONLY
        };

        let slot = self
            .fds
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyOpenFiles)?;

        let obj_id = match self.find(&name) {
            Some(id) => {
                if flags.writable() && flags.contains(OpenFlags::TRUNC) {
                    self.truncate_object(id)?;
                }
                id
            }
            None if flags.contains(OpenFlags::CREAT) => {
                self.create_object(&name, EntryType::File)?
            }
            None => return Err(FsError::NotFound(name)),
        };

        debug!("open('{}') -> fd {} (obj {})", name, slot, obj_id);
        self.fds[slot] = Some(OpenFile {
            obj_id,
            flags,
            pos: 0,
            pending: Vec::new(),
            tail_loaded: false,
        });
        Ok(FileHandle(slot))
    }

    fn file(&self, fh: FileHandle) -> FsResult<&OpenFile> {
        self.fds
            .get(fh.0)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadHandle(fh.0))
    }

    /// Read from the current position. Returns 0 at end of file.
    pub fn read(&mut self, fh: FileHandle, buf: &mut [u8]) -> FsResult<usize> {
        let file = self.file(fh)?;
        if !file.flags.readable() {
            return Err(FsError::NotReadable);
        }
        let obj_id = file.obj_id;
        let mut pos = file.pos;

        let dpp = self.config.data_per_page() as u64;
        let object = self
            .objects
            .get(&obj_id)
            .ok_or(FsError::BadHandle(fh.0))?;

        let mut done = 0;
        while done < buf.len() {
            let span = (pos / dpp) as usize;
            let offset = (pos % dpp) as usize;
            let Some(&(page, len)) = object.data.get(span) else {
                break;
            };
            if offset >= len as usize {
                break;
            }

            let n = (len as usize - offset).min(buf.len() - done);
            let addr = page * self.config.log_page_size + (PageHeader::SIZE + offset) as u32;
            self.flash.read(addr, &mut buf[done..done + n])?;
            done += n;
            pos += n as u64;
        }

        if let Some(Some(file)) = self.fds.get_mut(fh.0) {
            file.pos = pos;
        }
        Ok(done)
    }

    /// Append `data` to the file
    pub fn write(&mut self, fh: FileHandle, data: &[u8]) -> FsResult<usize> {
        if !self.file(fh)?.flags.writable() {
            return Err(FsError::NotWritable);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut file = self.fds[fh.0].take().ok_or(FsError::BadHandle(fh.0))?;
        let result = self.append(&mut file, data);
        self.fds[fh.0] = Some(file);

        result.map(|_| data.len())
    }

    fn append(&mut self, file: &mut OpenFile, data: &[u8]) -> FsResult<()> {
        if !file.tail_loaded {
            self.load_tail(file)?;
            file.tail_loaded = true;
        }
        file.pending.extend_from_slice(data);
        self.flush_pending(file, false)
    }

    /// Flush buffered data and release the handle. The handle is released
    /// even if the flush fails.
    pub fn close(&mut self, fh: FileHandle) -> FsResult<()> {
        let mut file = self
            .fds
            .get_mut(fh.0)
            .and_then(Option::take)
            .ok_or(FsError::BadHandle(fh.0))?;

        if file.flags.writable() && !file.pending.is_empty() {
            self.flush_pending(&mut file, true)?;
        }
        Ok(())
    }

    /// Delete a file and all its pages
    pub fn remove(&mut self, path: &str) -> FsResult<()> {
        let name = Self::normalize(path)?;
        let obj_id = self
            .find(&name)
            .ok_or_else(|| FsError::NotFound(name.clone()))?;

        if self.fds.iter().flatten().any(|f| f.obj_id == obj_id) {
            return Err(FsError::Busy(name));
        }

        self.truncate_object(obj_id)?;
        if let Some(object) = self.objects.remove(&obj_id) {
            self.delete_page(object.index_page)?;
        }
        debug!("Removed object {} '{}'", obj_id, name);
        Ok(())
    }

    /// Look up a single entry
    pub fn stat(&self, path: &str) -> FsResult<DirEntry> {
        let name = Self::normalize(path)?;
        let obj_id = self
            .find(&name)
            .ok_or_else(|| FsError::NotFound(name.clone()))?;
        Ok(self.dir_entry(obj_id, &self.objects[&obj_id], name))
    }

    fn dir_entry(&self, obj_id: u16, object: &Object, name: String) -> DirEntry {
        let pending: u64 = self
            .fds
            .iter()
            .flatten()
            .filter(|f| f.obj_id == obj_id && f.tail_loaded)
            .map(|f| f.pending.len() as u64)
            .sum();
        DirEntry {
            entry_type: object.entry_type,
            size: object.size() + pending,
            name,
            obj_id,
        }
    }

    /// Start listing entries under `path` ("/" lists everything)
    pub fn opendir(&self, path: &str) -> FsResult<Dir> {
        let dir = path.trim_matches('/');
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        Ok(Dir {
            prefix,
            next: Some(0),
        })
    }

    /// Next entry of the listing, or None at the end
    pub fn readdir(&self, dir: &mut Dir) -> Option<DirEntry> {
        let start = dir.next?;
        for (&obj_id, object) in self.objects.range(start..) {
            if let Some(rest) = object.name.strip_prefix(dir.prefix.as_str()) {
                dir.next = obj_id.checked_add(1);
                return Some(self.dir_entry(obj_id, object, rest.to_string()));
            }
        }
        dir.next = None;
        None
    }

    pub fn closedir(&self, dir: Dir) {
        drop(dir);
    }

    /// Total and used bytes. Block headers count as used.
    pub fn info(&self) -> FsResult<FsInfo> {
        let blocks = self.config.block_count() as u64;
        let page = self.config.log_page_size as u64;
        let live = self.count(PageState::Live) as u64;

        Ok(FsInfo {
            total: blocks * self.config.log_block_size as u64,
            used: (blocks + live) * page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::RamFlash;
    use rand::{Rng, SeedableRng};

    fn new_fs(size: u32) -> FlashFs<RamFlash> {
        FlashFs::mount(RamFlash::erased(size as usize), FsConfig::new(size)).unwrap()
    }

    fn write_file(fs: &mut FlashFs<RamFlash>, path: &str, data: &[u8]) {
        let fh = fs
            .open(path, OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY)
            .unwrap();
        for chunk in data.chunks(100) {
            assert_eq!(fs.write(fh, chunk).unwrap(), chunk.len());
        }
        fs.close(fh).unwrap();
    }

    fn read_file(fs: &mut FlashFs<RamFlash>, path: &str) -> Vec<u8> {
        let fh = fs.open(path, OpenFlags::RDONLY).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 77];
        loop {
            let n = fs.read(fh, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        fs.close(fh).unwrap();
        out
    }

    fn names(fs: &FlashFs<RamFlash>) -> Vec<String> {
        let mut dir = fs.opendir("/").unwrap();
        let mut names = Vec::new();
        while let Some(entry) = fs.readdir(&mut dir) {
            names.push(entry.name);
        }
        fs.closedir(dir);
        names
    }

    #[test]
    fn test_mount_formats_blank_flash() {
        let fs = new_fs(64 * 1024);
        let info = fs.info().unwrap();
        assert_eq!(info.total, 64 * 1024);
        assert!(info.used > 0 && info.used < info.total);
        assert!(names(&fs).is_empty());

        let flash = fs.into_inner();
        let header = BlockHeader::from_bytes(&flash.as_bytes()[4096..]).unwrap();
        assert_eq!(header, BlockHeader::new());
    }

    #[test]
    fn test_mount_rejects_foreign_data() {
        let flash = RamFlash::from_vec(vec![0u8; 16 * 1024]);
        let err = FlashFs::mount(flash, FsConfig::new(16 * 1024)).err().unwrap();
        assert!(matches!(err, FsError::NotFormatted { block: 0, magic: 0 }));
    }

    #[test]
    fn test_mount_rejects_tiny_device() {
        let err = FlashFs::mount(RamFlash::erased(4096), FsConfig::new(4096))
            .err()
            .unwrap();
        assert!(matches!(err, FsError::BadGeometry(_)));

        let err = FlashFs::mount(RamFlash::erased(4096), FsConfig::new(8192))
            .err()
            .unwrap();
        assert!(matches!(err, FsError::BadGeometry(_)));
    }

    #[test]
    fn test_write_read_across_pages() {
        let mut fs = new_fs(64 * 1024);
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        write_file(&mut fs, "/data.bin", &data);

        assert_eq!(read_file(&mut fs, "/data.bin"), data);
        let entry = fs.stat("data.bin").unwrap();
        assert_eq!(entry.size, 1000);
        assert_eq!(entry.entry_type, EntryType::File);
    }

    #[test]
    fn test_append_continues_short_page() {
        let mut fs = new_fs(64 * 1024);
        write_file(&mut fs, "/log", b"hello ");

        let fh = fs.open("/log", OpenFlags::WRONLY | OpenFlags::APPEND).unwrap();
        fs.write(fh, b"world").unwrap();
        fs.close(fh).unwrap();

        assert_eq!(read_file(&mut fs, "/log"), b"hello world");
        // One index page plus one data page
        let info = fs.info().unwrap();
        assert_eq!(info.used, (16 + 2) * 256);
    }

    #[test]
    fn test_truncate_replaces_contents() {
        let mut fs = new_fs(64 * 1024);
        write_file(&mut fs, "/f", &[1u8; 600]);
        write_file(&mut fs, "/f", b"xy");
        assert_eq!(read_file(&mut fs, "/f"), b"xy");
        assert_eq!(names(&fs), vec!["f".to_string()]);
    }

    #[test]
    fn test_open_missing_without_create() {
        let mut fs = new_fs(64 * 1024);
        assert_eq!(
            fs.open("/nope", OpenFlags::RDONLY),
            Err(FsError::NotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_remove() {
        let mut fs = new_fs(64 * 1024);
        write_file(&mut fs, "/a", b"aaa");
        write_file(&mut fs, "/b", b"bbb");
        let before = fs.info().unwrap().used;

        fs.remove("/a").unwrap();
        assert_eq!(names(&fs), vec!["b".to_string()]);
        assert!(fs.info().unwrap().used < before);
        assert!(matches!(fs.remove("/a"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_remove_open_file_is_busy() {
        let mut fs = new_fs(64 * 1024);
        write_file(&mut fs, "/a", b"aaa");
        let fh = fs.open("/a", OpenFlags::RDONLY).unwrap();
        assert!(matches!(fs.remove("/a"), Err(FsError::Busy(_))));
        fs.close(fh).unwrap();
        fs.remove("/a").unwrap();
    }

    #[test]
    fn test_handle_limits() {
        let mut fs = new_fs(64 * 1024);
        let handles: Vec<_> = (0..MAX_OPEN_FILES)
            .map(|i| fs.open(&format!("/f{}", i), OpenFlags::CREAT | OpenFlags::WRONLY).unwrap())
            .collect();
        assert_eq!(
            fs.open("/extra", OpenFlags::CREAT | OpenFlags::WRONLY),
            Err(FsError::TooManyOpenFiles)
        );

        let mut buf = [0u8; 4];
        assert_eq!(fs.read(handles[0], &mut buf), Err(FsError::NotReadable));
        fs.close(handles[0]).unwrap();
        assert_eq!(fs.close(handles[0]), Err(FsError::BadHandle(handles[0].index())));
    }

    #[test]
    fn test_name_validation() {
        let mut fs = new_fs(64 * 1024);
        let long = format!("/{}", "x".repeat(MAX_NAME_LEN + 1));
        assert!(matches!(
            fs.open(&long, OpenFlags::CREAT | OpenFlags::WRONLY),
            Err(FsError::NameTooLong { .. })
        ));
        assert!(matches!(fs.open("/", OpenFlags::RDONLY), Err(FsError::InvalidName(_))));
    }

    #[test]
    fn test_remount_preserves_files() {
        let mut fs = new_fs(64 * 1024);
        write_file(&mut fs, "/one", b"first file");
        write_file(&mut fs, "/two", &[7u8; 3000]);
        let fh = fs.open("/three", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
        fs.write(fh, b"buffered").unwrap();
        fs.unmount().unwrap();
        let used = fs.info().unwrap().used;

        let mut fs = FlashFs::mount(fs.into_inner(), FsConfig::new(64 * 1024)).unwrap();
        assert_eq!(names(&fs), vec!["one", "two", "three"]);
        assert_eq!(read_file(&mut fs, "/one"), b"first file");
        assert_eq!(read_file(&mut fs, "/two"), vec![7u8; 3000]);
        assert_eq!(read_file(&mut fs, "/three"), b"buffered");
        assert_eq!(fs.info().unwrap().used, used);
    }

    #[test]
    fn test_mount_drops_orphan_pages() {
        let mut fs = new_fs(16 * 1024);
        write_file(&mut fs, "/gone", &[1u8; 300]);
        let index_page = fs.objects.values().next().unwrap().index_page;
        fs.delete_page(index_page).unwrap();

        let mut flash = fs.into_inner();
        let fs = FlashFs::mount(flash.clone(), FsConfig::new(16 * 1024)).unwrap();
        assert!(names(&fs).is_empty());
        assert_eq!(fs.info().unwrap().used, 4 * 256);

        // A foreign page kind is dropped too
        let mut fs = fs;
        write_file(&mut fs, "/x", b"x");
        flash = fs.into_inner();
        flash.write(40 * 256, &[PAGE_LIVE, 0x7E, 1, 0, 0, 0, 1, 0]).unwrap();
        let fs = FlashFs::mount(flash, FsConfig::new(16 * 1024)).unwrap();
        assert_eq!(names(&fs), vec!["x"]);
    }

    #[test]
    fn test_gc_reclaims_deleted_space() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut fs = new_fs(16 * 1024);
        let mut written = 0;

        for round in 0..40 {
            let len = rng.gen_range(1..2500);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let path = format!("/r{}", round % 2);
            write_file(&mut fs, &path, &data);
            assert_eq!(read_file(&mut fs, &path), data);
            written += len;
        }

        // Far more than the device holds went through it
        assert!(written > 16 * 1024);
        let info = fs.info().unwrap();
        assert!(info.used <= info.total);
    }

    #[test]
    fn test_full_filesystem() {
        let mut fs = new_fs(8 * 1024);
        let fh = fs
            .open("/big", OpenFlags::CREAT | OpenFlags::WRONLY)
            .unwrap();
        let mut result = Ok(0);
        for _ in 0..100 {
            result = fs.write(fh, &[0xAB; 256]);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(FsError::Full));
        let _ = fs.close(fh);

        // Space comes back after removing the file
        fs.remove("/big").unwrap();
        write_file(&mut fs, "/small", b"ok");
        assert_eq!(read_file(&mut fs, "/small"), b"ok");
    }

    #[test]
    fn test_device_fault_is_fatal() {
        let mut fs = new_fs(16 * 1024);
        let err = fs.flash.erase(16 * 1024, 1).unwrap_err();
        assert!(err.is_fatal());
        assert!(!FsError::Full.is_fatal());
    }
}

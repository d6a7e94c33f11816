//! Core data structures for flash filesystem images

use std::fmt;
use std::ops::BitOr;

/// Magic number stamped in every block header ("FLSH")
pub const FLASHFS_MAGIC: u32 = 0x464C_5348;

/// Logical page size in bytes
pub const PAGE_SIZE: u32 = 256;

/// Physical erase block size in bytes
pub const ERASE_BLOCK_SIZE: u32 = 4096;

/// Logical block size in bytes
pub const BLOCK_SIZE: u32 = 4096;

/// Maximum object name length in bytes
pub const MAX_NAME_LEN: usize = 32;

/// Default capacity of the open file table
pub const MAX_OPEN_FILES: usize = 4;

/// Page flag values. Writes may only clear bits, so each state is reachable
/// from the previous one without an erase.
pub const PAGE_FREE: u8 = 0xFF;
pub const PAGE_LIVE: u8 = 0xFE;
pub const PAGE_DELETED: u8 = 0xFC;

/// Page kinds
pub const KIND_INDEX: u8 = 0x01; // Object index page (type + name)
pub const KIND_DATA: u8 = 0x02; // Object data page

/// Object id value of an erased page
pub const OBJ_ID_FREE: u16 = 0xFFFF;

/// Engine geometry and resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    /// Size of the underlying flash in bytes
    pub phys_size: u32,
    /// Physical erase block size
    pub phys_erase_block: u32,
    /// Logical block size (a multiple of the erase block)
    pub log_block_size: u32,
    /// Logical page size
    pub log_page_size: u32,
    /// Number of simultaneously open files
    pub max_open_files: usize,
}

impl FsConfig {
    /// Standard geometry for an image of `phys_size` bytes
    pub fn new(phys_size: u32) -> Self {
        FsConfig {
            phys_size,
            phys_erase_block: ERASE_BLOCK_SIZE,
            log_block_size: BLOCK_SIZE,
            log_page_size: PAGE_SIZE,
            max_open_files: MAX_OPEN_FILES,
        }
    }

    pub fn pages_per_block(&self) -> u32 {
        self.log_block_size / self.log_page_size
    }

    /// Number of whole logical blocks on the device
    pub fn block_count(&self) -> u32 {
        self.phys_size / self.log_block_size
    }

    /// Payload bytes carried by one data page
    pub fn data_per_page(&self) -> usize {
        self.log_page_size as usize - PageHeader::SIZE
    }
}

/// Block header (first page of every logical block)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
}

impl BlockHeader {
    /// Size of block header on flash
    pub const SIZE: usize = 4;

    pub fn new() -> Self {
        BlockHeader {
            magic: FLASHFS_MAGIC,
        }
    }

    /// Read block header from raw data
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        use byteorder::{LittleEndian, ReadBytesExt};
        use std::io::Cursor;

        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>().ok()?;
        Some(BlockHeader { magic })
    }

    /// Serialize block header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        use byteorder::{LittleEndian, WriteBytesExt};

        let mut data = Vec::with_capacity(Self::SIZE);
        data.write_u32::<LittleEndian>(self.magic).unwrap();
        data
    }

    /// True when the header area has never been programmed
    pub fn is_blank(data: &[u8]) -> bool {
        data.iter().take(Self::SIZE).all(|&b| b == 0xFF)
    }

    pub fn is_valid(&self) -> bool {
        self.magic == FLASHFS_MAGIC
    }
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Page header (first 8 bytes of every object page)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// One of PAGE_FREE, PAGE_LIVE, PAGE_DELETED
    pub flags: u8,
    /// KIND_INDEX or KIND_DATA
    pub kind: u8,
    /// Owning object
    pub obj_id: u16,
    /// Data span index (0 for index pages)
    pub span: u16,
    /// Payload bytes used
    pub len: u16,
}

impl PageHeader {
    /// Size of page header on flash
    pub const SIZE: usize = 8;

    /// Read page header from raw data
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        use byteorder::{LittleEndian, ReadBytesExt};
        use std::io::Cursor;

        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u8().ok()?;
        let kind = cursor.read_u8().ok()?;
        let obj_id = cursor.read_u16::<LittleEndian>().ok()?;
        let span = cursor.read_u16::<LittleEndian>().ok()?;
        let len = cursor.read_u16::<LittleEndian>().ok()?;
        Some(PageHeader {
            flags,
            kind,
            obj_id,
            span,
            len,
        })
    }

    /// Serialize page header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        use byteorder::{LittleEndian, WriteBytesExt};

        let mut data = Vec::with_capacity(Self::SIZE);
        data.write_u8(self.flags).unwrap();
        data.write_u8(self.kind).unwrap();
        data.write_u16::<LittleEndian>(self.obj_id).unwrap();
        data.write_u16::<LittleEndian>(self.span).unwrap();
        data.write_u16::<LittleEndian>(self.len).unwrap();
        data
    }

    pub fn is_free(&self) -> bool {
        self.flags == PAGE_FREE
    }

    pub fn is_live(&self) -> bool {
        self.flags == PAGE_LIVE
    }
}

/// Type of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryType {
    #[default]
    Unknown,
    File,
    Directory,
    HardLink,
    SoftLink,
}

impl EntryType {
    /// Decode the on-flash type byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => EntryType::File,
            2 => EntryType::Directory,
            3 => EntryType::HardLink,
            4 => EntryType::SoftLink,
            _ => EntryType::Unknown,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            EntryType::Unknown => 0,
            EntryType::File => 1,
            EntryType::Directory => 2,
            EntryType::HardLink => 3,
            EntryType::SoftLink => 4,
        }
    }

    /// Single character used in listings
    pub fn type_char(self) -> char {
        match self {
            EntryType::Unknown => '?',
            EntryType::File => 'f',
            EntryType::Directory => 'd',
            EntryType::HardLink => 'h',
            EntryType::SoftLink => 's',
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_char())
    }
}

/// Directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub entry_type: EntryType,
    pub size: u64,
    pub name: String,
    pub obj_id: u16,
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:6} {}", self.entry_type, self.size, self.name)
    }
}

/// Filesystem usage in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub total: u64,
    pub used: u64,
}

/// Flags accepted by `FlashFs::open`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u8);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(0x01);
    pub const WRONLY: OpenFlags = OpenFlags(0x02);
    pub const RDWR: OpenFlags = OpenFlags(0x03);
    pub const CREAT: OpenFlags = OpenFlags(0x04);
    pub const TRUNC: OpenFlags = OpenFlags(0x08);
    pub const APPEND: OpenFlags = OpenFlags(0x10);

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn readable(self) -> bool {
        self.contains(Self::RDONLY)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRONLY)
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

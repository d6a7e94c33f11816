//! flashimg: Userspace tools for flash filesystem images
//!
//! This library simulates a NOR flash device backed by an image file, mounts
//! a small wear-aware flash filesystem on it, and provides the copy and
//! command-interpreter logic used by the `flashimg` binary.

pub mod types;
pub mod error;
pub mod flash;
pub mod fs;
pub mod copy;
pub mod command;
pub mod shell;
pub mod image;

pub use types::*;
pub use error::{FsError, FsResult};
pub use flash::{Flash, RamFlash};
pub use fs::{Dir, FileHandle, FlashFs};
pub use command::Command;
pub use shell::{ExitStatus, Interpreter};
pub use image::{Image, Session};

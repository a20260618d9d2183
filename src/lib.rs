//! evfs - an "entries virtual file system".
//!
//! A single-file embedded key/value store in which every value is a
//! variable-length byte stream (an "entry") identified by a short textual
//! key. The backing file is divided into fixed-size clusters linked into
//! per-entry chains; a directory entry maps keys to chain heads and a
//! write-back cluster cache with LRU eviction absorbs cluster I/O.
//!
//! Entries behave like files: they can be created, opened, read, written,
//! seeked, truncated, iterated and erased at runtime through cursor-style
//! handles.
//!
//! ```no_run
//! use evfs::Evfs;
//!
//! # fn run() -> evfs::Result<()> {
//! let fs = Evfs::create("app.db", 256, 64, 8)?;
//! let handle = fs.create_entry("greeting")?;
//! fs.write(handle, b"hello world")?;
//! fs.seek(handle, 0)?;
//! let mut buf = [0u8; 11];
//! fs.read(handle, &mut buf)?;
//! fs.close_entry(handle)?;
//! fs.close()?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

mod cache;
mod chain;
mod cluster;
mod dir;
mod entry;
mod error;
mod fs;
mod host;

pub use crate::dir::{Entries, EntryInfo};
pub use crate::error::{Error, Result};
pub use crate::fs::{EntryHandle, Evfs, EvfsStat};

use core::cmp;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cache::ClusterCache;
use crate::chain;
use crate::cluster::{self, ClusterManager};
use crate::dir::{self, DirRecord, Entries, EntryInfo};
use crate::entry::{self, Cursor};
use crate::error::{Error, Result};

/// Opaque cursor handle for an open entry.
///
/// Handles are small dense positive integers; 0 and negative values are
/// never valid. A handle stays usable until `close_entry`, but every
/// operation on it fails with [`Error::NotFound`] once the underlying entry
/// has been erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle(i32);

impl EntryHandle {
    /// The raw positive integer behind this handle.
    pub fn raw(self) -> i32 {
        self.0
    }
}

struct HandleRec {
    // None once the underlying entry has been erased
    entry: Option<u32>,
    cursor: Cursor,
}

struct Core {
    mgr: ClusterManager,
    cache: ClusterCache,
    handles: Vec<Option<HandleRec>>,
    closed: bool,
}

/// Store statistics as reported by [`Evfs::stat`].
#[derive(Copy, Clone, Debug)]
pub struct EvfsStat {
    cluster_size: u32,
    cluster_count: u32,
    cluster_idle: u32,
    cluster_busy: u32,
    entries: u32,
    cache_blocks: usize,
    cache_hit_rate: f32,
}

impl EvfsStat {
    /// Cluster size in bytes.
    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    /// Total number of clusters in the backing file.
    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    /// Number of clusters on the free list.
    pub fn cluster_idle(&self) -> u32 {
        self.cluster_idle
    }

    /// Number of clusters owned by entry chains.
    pub fn cluster_busy(&self) -> u32 {
        self.cluster_busy
    }

    /// Number of live entries.
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Current cluster cache capacity in blocks.
    pub fn cache_blocks(&self) -> usize {
        self.cache_blocks
    }

    /// Lifetime cache hit rate of the current open.
    pub fn cache_hit_rate(&self) -> f32 {
        self.cache_hit_rate
    }
}

/// An open evfs store.
///
/// At most one store can be live per process; a second [`Evfs::create`] or
/// [`Evfs::open`] fails with [`Error::AlreadyExists`] until the first
/// instance is closed or dropped. All methods take `&self` and may be
/// called from any thread; a single internal mutex serializes them.
/// Sharing one [`EntryHandle`] between threads is not supported — the calls
/// will not race, but the cursor interleaving is unspecified.
pub struct Evfs {
    core: Mutex<Core>,
}

impl Evfs {
    /// Creates and formats a new store, truncating any existing file at
    /// `path`.
    ///
    /// `cluster_size` must be a power of two in `[64, 4096]` and the total
    /// size `cluster_size * cluster_count` must stay below 1 GiB.
    pub fn create<P: AsRef<Path>>(path: P, cluster_size: u32, cluster_count: u32, cache_blocks: usize) -> Result<Self> {
        cluster::lifecycle_begin_init()?;
        let mgr = match ClusterManager::format(path.as_ref(), cluster_size, cluster_count) {
            Ok(mgr) => mgr,
            Err(err) => {
                cluster::lifecycle_abort_init();
                return Err(err);
            }
        };
        cluster::lifecycle_set_ready();
        Ok(Evfs {
            core: Mutex::new(Core {
                mgr,
                cache: ClusterCache::new(cache_blocks),
                handles: Vec::new(),
                closed: false,
            }),
        })
    }

    /// Opens an existing store, validating the superblock.
    pub fn open<P: AsRef<Path>>(path: P, cache_blocks: usize) -> Result<Self> {
        cluster::lifecycle_begin_init()?;
        let mgr = match ClusterManager::open(path.as_ref()) {
            Ok(mgr) => mgr,
            Err(err) => {
                cluster::lifecycle_abort_init();
                return Err(err);
            }
        };
        cluster::lifecycle_set_ready();
        Ok(Evfs {
            core: Mutex::new(Core {
                mgr,
                cache: ClusterCache::new(cache_blocks),
                handles: Vec::new(),
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flushes all buffered state and closes the store.
    ///
    /// Dropping the store performs the same teardown; this method only
    /// surfaces the final flush error.
    pub fn close(self) -> Result<()> {
        let mut core = self.lock();
        core.close_internal()
    }

    /// Creates a new entry under `key` and returns a handle positioned at
    /// offset 0. Fails with [`Error::AlreadyExists`] if the key is taken.
    pub fn create_entry(&self, key: &str) -> Result<EntryHandle> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let key_bytes = dir::encode_key(key)?;
        dir::ensure_directory(&mut core.cache, &mut core.mgr)?;
        let records = dir::load_records(&mut core.cache, &mut core.mgr)?;
        if dir::find_by_key(&records, &key_bytes).is_some() {
            return Err(Error::AlreadyExists);
        }
        let head = entry::create_chain(&mut core.cache, &mut core.mgr, &key_bytes)?;
        let record = DirRecord {
            entry_id: head,
            key: key_bytes,
        };
        if let Err(err) = dir::add_record(&mut core.cache, &mut core.mgr, record) {
            // take the half-created entry back before reporting
            let _ = chain::free_chain(&mut core.cache, &mut core.mgr, head);
            return Err(err);
        }
        debug!("created entry {:?} at cluster {}", key, head);
        Ok(core.alloc_handle(head))
    }

    /// Opens the entry stored under `key`.
    pub fn open_entry_by_key(&self, key: &str) -> Result<EntryHandle> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let key_bytes = dir::encode_key(key)?;
        let records = dir::load_records(&mut core.cache, &mut core.mgr)?;
        let slot = dir::find_by_key(&records, &key_bytes).ok_or(Error::NotFound)?;
        let head = records[slot].entry_id;
        // the head cluster must agree with the directory record
        if entry::read_key(&mut core.cache, &mut core.mgr, head)? != key_bytes {
            return Err(Error::CorruptedFileSystem);
        }
        Ok(core.alloc_handle(head))
    }

    /// Opens an entry by its id, as reported by iteration.
    pub fn open_entry(&self, entry_id: u32) -> Result<EntryHandle> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let records = dir::load_records(&mut core.cache, &mut core.mgr)?;
        dir::find_by_id(&records, entry_id).ok_or(Error::NotFound)?;
        Ok(core.alloc_handle(entry_id))
    }

    /// Flushes buffered writes and releases the handle. The entry itself is
    /// untouched.
    pub fn close_entry(&self, handle: EntryHandle) -> Result<()> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let index = core.handle_index(handle)?;
        core.cache.flush(&mut core.mgr)?;
        core.mgr.flush()?;
        core.handles[index] = None;
        Ok(())
    }

    /// Erases the entry the handle refers to; all handles on it become
    /// invalid.
    pub fn erase_entry(&self, handle: EntryHandle) -> Result<()> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let index = core.handle_index(handle)?;
        let head = core.handles[index]
            .as_ref()
            .and_then(|rec| rec.entry)
            .ok_or(Error::NotFound)?;
        let records = dir::load_records(&mut core.cache, &mut core.mgr)?;
        let slot = dir::find_by_id(&records, head).ok_or(Error::NotFound)?;
        core.erase_at(slot, head)
    }

    /// Erases the entry stored under `key`.
    pub fn erase_entry_by_key(&self, key: &str) -> Result<()> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let key_bytes = dir::encode_key(key)?;
        let records = dir::load_records(&mut core.cache, &mut core.mgr)?;
        let slot = dir::find_by_key(&records, &key_bytes).ok_or(Error::NotFound)?;
        let head = records[slot].entry_id;
        core.erase_at(slot, head)
    }

    /// Reads up to `buf.len()` bytes at the handle's cursor, advancing it.
    /// Returns 0 once the cursor is at or past the end of the entry.
    pub fn read(&self, handle: EntryHandle, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let index = core.handle_index(handle)?;
        let rec = core.handles[index].as_mut().ok_or(Error::InvalidInput)?;
        let head = rec.entry.ok_or(Error::NotFound)?;
        entry::read(&mut core.cache, &mut core.mgr, head, &mut rec.cursor, buf)
    }

    /// Writes `buf` at the handle's cursor, allocating clusters as needed
    /// and zero-filling any gap left by a seek beyond the end. Returns the
    /// number of bytes written, which is smaller than `buf.len()` only when
    /// the store ran out of space midway.
    pub fn write(&self, handle: EntryHandle, buf: &[u8]) -> Result<usize> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let index = core.handle_index(handle)?;
        let rec = core.handles[index].as_mut().ok_or(Error::InvalidInput)?;
        let head = rec.entry.ok_or(Error::NotFound)?;
        entry::write(&mut core.cache, &mut core.mgr, head, &mut rec.cursor, buf)
    }

    /// Moves the handle's cursor to an absolute offset. Seeking past the
    /// end is allowed; the entry grows on the next write.
    pub fn seek(&self, handle: EntryHandle, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(Error::InvalidInput);
        }
        let mut guard = self.lock();
        let core = &mut *guard;
        let index = core.handle_index(handle)?;
        let rec = core.handles[index].as_mut().ok_or(Error::InvalidInput)?;
        let head = rec.entry.ok_or(Error::NotFound)?;
        entry::seek(&mut core.cache, &mut core.mgr, head, &mut rec.cursor, offset as u64)
    }

    /// Sets the entry's logical length, freeing or zero-filling clusters.
    /// Cursors of all handles on the entry are clamped to the new length.
    pub fn truncate(&self, handle: EntryHandle, new_len: i64) -> Result<()> {
        if new_len < 0 {
            return Err(Error::InvalidInput);
        }
        let mut guard = self.lock();
        let core = &mut *guard;
        let index = core.handle_index(handle)?;
        let head = core.handles[index]
            .as_ref()
            .and_then(|rec| rec.entry)
            .ok_or(Error::NotFound)?;
        entry::truncate(&mut core.cache, &mut core.mgr, head, new_len as u64)?;
        // freed clusters may include cached cursor positions
        for rec in core.handles.iter_mut().flatten() {
            if rec.entry == Some(head) {
                let logical = cmp::min(rec.cursor.logical, new_len as u64);
                rec.cursor = Cursor::rewind(head);
                rec.cursor.logical = logical;
            }
        }
        Ok(())
    }

    /// Logical length of the entry in bytes.
    pub fn entry_size(&self, handle: EntryHandle) -> Result<u64> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let index = core.handle_index(handle)?;
        let head = core.handles[index]
            .as_ref()
            .and_then(|rec| rec.entry)
            .ok_or(Error::NotFound)?;
        entry::entry_size(&mut core.cache, &mut core.mgr, head)
    }

    /// Forces write-back of every buffered cluster of this entry.
    pub fn flush_entry_buffer(&self, handle: EntryHandle) -> Result<()> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let index = core.handle_index(handle)?;
        core.handles[index]
            .as_ref()
            .and_then(|rec| rec.entry)
            .ok_or(Error::NotFound)?;
        core.cache.flush(&mut core.mgr)?;
        core.mgr.flush()
    }

    /// Iterates live entries in directory-record order.
    pub fn entries(&self) -> Result<Entries> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let records = dir::load_records(&mut core.cache, &mut core.mgr)?;
        let mut items = Vec::new();
        for record in records.iter().filter(|r| r.entry_id != 0) {
            let size = entry::entry_size(&mut core.cache, &mut core.mgr, record.entry_id)?;
            items.push(EntryInfo {
                entry_id: record.entry_id,
                key: dir::decode_key(&record.key),
                size,
            });
        }
        Ok(Entries::new(items))
    }

    /// Current store statistics.
    pub fn stat(&self) -> Result<EvfsStat> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let cluster_idle = chain::count_free_clusters(&mut core.mgr)?;
        let records = dir::load_records(&mut core.cache, &mut core.mgr)?;
        let entries = records.iter().filter(|r| r.entry_id != 0).count() as u32;
        Ok(EvfsStat {
            cluster_size: core.mgr.cluster_size(),
            cluster_count: core.mgr.cluster_count(),
            cluster_idle,
            cluster_busy: core.mgr.cluster_count().saturating_sub(cluster_idle + 1),
            entries,
            cache_blocks: core.cache.capacity(),
            cache_hit_rate: core.cache.hit_rate(),
        })
    }

    /// Changes the cluster cache capacity at runtime. Shrinking writes
    /// evicted dirty blocks back first; 0 disables caching.
    pub fn set_cache_blocks(&self, cache_blocks: usize) -> Result<()> {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.cache.resize(&mut core.mgr, cache_blocks)
    }

    /// Lifetime cache hit rate of the current open.
    pub fn cache_hit_rate(&self) -> f32 {
        self.lock().cache.hit_rate()
    }
}

impl Core {
    fn handle_index(&self, handle: EntryHandle) -> Result<usize> {
        if handle.0 <= 0 {
            return Err(Error::InvalidInput);
        }
        let index = handle.0 as usize - 1;
        match self.handles.get(index) {
            Some(Some(_)) => Ok(index),
            _ => Err(Error::InvalidInput),
        }
    }

    fn alloc_handle(&mut self, head: u32) -> EntryHandle {
        let rec = HandleRec {
            entry: Some(head),
            cursor: Cursor::rewind(head),
        };
        let index = match self.handles.iter().position(|slot| slot.is_none()) {
            Some(free) => {
                self.handles[free] = Some(rec);
                free
            }
            None => {
                self.handles.push(Some(rec));
                self.handles.len() - 1
            }
        };
        EntryHandle(index as i32 + 1)
    }

    fn erase_at(&mut self, slot: usize, head: u32) -> Result<()> {
        chain::free_chain(&mut self.cache, &mut self.mgr, head)?;
        dir::remove_record(&mut self.cache, &mut self.mgr, slot)?;
        for rec in self.handles.iter_mut().flatten() {
            if rec.entry == Some(head) {
                rec.entry = None;
            }
        }
        // once the last record is gone the directory chain itself goes back
        // to the free list
        let records = dir::load_records(&mut self.cache, &mut self.mgr)?;
        if !records.is_empty() && records.iter().all(|r| r.entry_id == 0) {
            let dir_head = self.mgr.directory_head();
            chain::free_chain(&mut self.cache, &mut self.mgr, dir_head)?;
            self.mgr.set_directory_head(0);
            self.mgr.write_superblock()?;
        }
        debug!("erased entry at cluster {}", head);
        Ok(())
    }

    fn close_internal(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = self
            .cache
            .flush(&mut self.mgr)
            .and_then(|_| self.mgr.flush());
        self.closed = true;
        if cluster::lifecycle_begin_close() {
            cluster::lifecycle_set_closed();
        }
        flushed
    }
}

/// Dropping the store flushes and closes it; a failure at this point can
/// only be logged.
impl Drop for Evfs {
    fn drop(&mut self) {
        let mut core = self.lock();
        if let Err(err) = core.close_internal() {
            error!("close failed {}", err);
        }
    }
}

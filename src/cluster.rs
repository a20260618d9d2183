use std::io::{self, Cursor};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::host::{HostFile, ReadLeExt, WriteLeExt};

/// Every cluster starts with this header, including the superblock.
pub(crate) const CLUSTER_HEADER_SIZE: u32 = 12;

pub(crate) const MIN_CLUSTER_SIZE: u32 = 64;
pub(crate) const MAX_CLUSTER_SIZE: u32 = 4096;

// A store never grows to 1 GiB or beyond.
pub(crate) const MAX_STORE_SIZE: u64 = 1 << 30;

// The byte pattern "evfs" read as a little-endian u32.
const EVFS_MAGIC: u32 = 0x7366_7665;

// magic + cluster_size + cluster_count + expand_cluster_count
// + free_list_head + directory_head
pub(crate) const SUPERBLOCK_SIZE: u32 = 24;

/// The 12-byte header present at the start of every cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ClusterHeader {
    /// Bytes of payload currently in use.
    pub(crate) data_seg_size: u32,
    /// Next cluster in this entry's chain, 0 for tail.
    pub(crate) next_cluster_id: u32,
    /// First cluster of the chain this cluster belongs to.
    pub(crate) head_cluster_id: u32,
}

impl ClusterHeader {
    fn deserialize<T: io::Read>(rdr: &mut T) -> io::Result<Self> {
        Ok(ClusterHeader {
            data_seg_size: rdr.read_u32_le()?,
            next_cluster_id: rdr.read_u32_le()?,
            head_cluster_id: rdr.read_u32_le()?,
        })
    }

    fn serialize<T: io::Write>(&self, wrt: &mut T) -> io::Result<()> {
        wrt.write_u32_le(self.data_seg_size)?;
        wrt.write_u32_le(self.next_cluster_id)?;
        wrt.write_u32_le(self.head_cluster_id)
    }

    /// Parses the header from the first 12 bytes of a cluster buffer.
    pub(crate) fn parse(cluster: &[u8]) -> Self {
        let mut rdr = Cursor::new(&cluster[..CLUSTER_HEADER_SIZE as usize]);
        // reads from an in-memory slice of sufficient length cannot fail
        Self::deserialize(&mut rdr).unwrap_or_default()
    }

    /// Stores the header into the first 12 bytes of a cluster buffer.
    pub(crate) fn store(&self, cluster: &mut [u8]) {
        let mut wrt = Cursor::new(&mut cluster[..CLUSTER_HEADER_SIZE as usize]);
        let _ = self.serialize(&mut wrt);
    }
}

/// In-memory copy of the superblock payload (cluster 0).
#[derive(Debug, Clone, Default)]
pub(crate) struct Superblock {
    pub(crate) cluster_size: u32,
    pub(crate) cluster_count: u32,
    pub(crate) expand_cluster_count: u32,
    pub(crate) free_list_head: u32,
    pub(crate) directory_head: u32,
}

impl Superblock {
    fn deserialize<T: io::Read>(rdr: &mut T) -> Result<Self> {
        let magic = rdr.read_u32_le()?;
        if magic != EVFS_MAGIC {
            return Err(Error::BadFormat);
        }
        Ok(Superblock {
            cluster_size: rdr.read_u32_le()?,
            cluster_count: rdr.read_u32_le()?,
            expand_cluster_count: rdr.read_u32_le()?,
            free_list_head: rdr.read_u32_le()?,
            directory_head: rdr.read_u32_le()?,
        })
    }

    fn serialize<T: io::Write>(&self, wrt: &mut T) -> io::Result<()> {
        wrt.write_u32_le(EVFS_MAGIC)?;
        wrt.write_u32_le(self.cluster_size)?;
        wrt.write_u32_le(self.cluster_count)?;
        wrt.write_u32_le(self.expand_cluster_count)?;
        wrt.write_u32_le(self.free_list_head)?;
        wrt.write_u32_le(self.directory_head)
    }

    // sanity checks in the manner of the open-time validation contract
    fn validate(&self, file_size: u64) -> Result<()> {
        if self.cluster_size < MIN_CLUSTER_SIZE
            || self.cluster_size > MAX_CLUSTER_SIZE
            || !self.cluster_size.is_power_of_two()
        {
            return Err(Error::BadFormat);
        }
        if self.cluster_count == 0 || self.expand_cluster_count == 0 {
            return Err(Error::BadFormat);
        }
        if u64::from(self.cluster_size) * u64::from(self.cluster_count) != file_size {
            return Err(Error::BadFormat);
        }
        if self.free_list_head >= self.cluster_count || self.directory_head >= self.cluster_count {
            return Err(Error::BadFormat);
        }
        Ok(())
    }
}

// Process-wide lifecycle of the single live store. All transitions go
// through compare-exchange so racing create/open calls observe
// AlreadyExists instead of both succeeding.
const STATE_NOT_READY: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;
const STATE_CLOSING: u32 = 3;

static LIFECYCLE: AtomicU32 = AtomicU32::new(STATE_NOT_READY);

pub(crate) fn lifecycle_begin_init() -> Result<()> {
    LIFECYCLE
        .compare_exchange(STATE_NOT_READY, STATE_INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|_| Error::AlreadyExists)
}

pub(crate) fn lifecycle_set_ready() {
    LIFECYCLE.store(STATE_READY, Ordering::Release);
}

pub(crate) fn lifecycle_abort_init() {
    let _ = LIFECYCLE.compare_exchange(STATE_INITIALIZING, STATE_NOT_READY, Ordering::AcqRel, Ordering::Acquire);
}

pub(crate) fn lifecycle_begin_close() -> bool {
    LIFECYCLE
        .compare_exchange(STATE_READY, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

pub(crate) fn lifecycle_set_closed() {
    LIFECYCLE.store(STATE_NOT_READY, Ordering::Release);
}

/// Owns the backing file and the in-memory superblock; reads and writes
/// whole clusters by index.
pub(crate) struct ClusterManager {
    host: HostFile,
    superblock: Superblock,
    cluster_size: u32,
    payload_max: u32,
    file_size: u64,
}

impl ClusterManager {
    /// Creates and formats a new store file, truncating any existing content.
    pub(crate) fn format(path: &Path, cluster_size: u32, cluster_count: u32) -> Result<Self> {
        if cluster_size < MIN_CLUSTER_SIZE
            || cluster_size > MAX_CLUSTER_SIZE
            || !cluster_size.is_power_of_two()
        {
            return Err(Error::InvalidInput);
        }
        if cluster_count == 0 {
            return Err(Error::InvalidInput);
        }
        let file_size = u64::from(cluster_size) * u64::from(cluster_count);
        if file_size >= MAX_STORE_SIZE {
            return Err(Error::InvalidInput);
        }

        let superblock = Superblock {
            cluster_size,
            cluster_count,
            // the store doubles on each expansion
            expand_cluster_count: cluster_count,
            free_list_head: 0,
            directory_head: 0,
        };

        let host = HostFile::create(path)?;
        let mut mgr = ClusterManager {
            host,
            superblock,
            cluster_size,
            payload_max: cluster_size - CLUSTER_HEADER_SIZE,
            file_size,
        };
        mgr.write_superblock()?;
        mgr.host.zero_extend(u64::from(cluster_size), file_size)?;
        // thread every cluster after the superblock onto the free list in
        // ascending order
        if cluster_count > 1 {
            for index in 1..cluster_count {
                let header = ClusterHeader {
                    data_seg_size: 0,
                    next_cluster_id: if index + 1 < cluster_count { index + 1 } else { 0 },
                    head_cluster_id: 0,
                };
                let mut buf = [0_u8; CLUSTER_HEADER_SIZE as usize];
                header.store(&mut buf);
                mgr.host.write_all_at(u64::from(index) * u64::from(cluster_size), &buf)?;
            }
            mgr.superblock.free_list_head = 1;
            mgr.write_superblock()?;
        }
        debug!("formatted store: {} clusters of {} bytes", cluster_count, cluster_size);
        Ok(mgr)
    }

    /// Opens an existing store file, validating the superblock cluster.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let mut host = HostFile::open(path)?;
        let file_size = host.size()?;
        let guide_size = CLUSTER_HEADER_SIZE + SUPERBLOCK_SIZE;
        if file_size < u64::from(guide_size) || file_size >= MAX_STORE_SIZE {
            return Err(Error::BadFormat);
        }

        let mut guide = vec![0_u8; guide_size as usize];
        host.read_exact_at(0, &mut guide)?;
        let header = ClusterHeader::parse(&guide);
        if header.data_seg_size != SUPERBLOCK_SIZE || header.next_cluster_id != 0 || header.head_cluster_id != 0 {
            return Err(Error::BadFormat);
        }
        let mut rdr = Cursor::new(&guide[CLUSTER_HEADER_SIZE as usize..]);
        let superblock = Superblock::deserialize(&mut rdr)?;
        superblock.validate(file_size)?;

        let cluster_size = superblock.cluster_size;
        debug!(
            "opened store: {} clusters of {} bytes, free list at {}, directory at {}",
            superblock.cluster_count, cluster_size, superblock.free_list_head, superblock.directory_head
        );
        Ok(ClusterManager {
            host,
            superblock,
            cluster_size,
            payload_max: cluster_size - CLUSTER_HEADER_SIZE,
            file_size,
        })
    }

    pub(crate) fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    /// Usable payload bytes per cluster.
    pub(crate) fn payload_max(&self) -> u32 {
        self.payload_max
    }

    pub(crate) fn cluster_count(&self) -> u32 {
        self.superblock.cluster_count
    }

    pub(crate) fn free_list_head(&self) -> u32 {
        self.superblock.free_list_head
    }

    pub(crate) fn set_free_list_head(&mut self, cluster_id: u32) {
        self.superblock.free_list_head = cluster_id;
    }

    pub(crate) fn directory_head(&self) -> u32 {
        self.superblock.directory_head
    }

    pub(crate) fn set_directory_head(&mut self, cluster_id: u32) {
        self.superblock.directory_head = cluster_id;
    }

    fn cluster_offset(&self, cluster_id: u32) -> u64 {
        u64::from(cluster_id) * u64::from(self.cluster_size)
    }

    fn check_index(&self, cluster_id: u32) -> Result<()> {
        // an index outside the file can only come from a broken chain
        if cluster_id == 0 || cluster_id >= self.superblock.cluster_count {
            return Err(Error::CorruptedFileSystem);
        }
        Ok(())
    }

    pub(crate) fn read_cluster(&mut self, cluster_id: u32) -> Result<Vec<u8>> {
        self.check_index(cluster_id)?;
        let mut buf = vec![0_u8; self.cluster_size as usize];
        self.host.read_exact_at(self.cluster_offset(cluster_id), &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn write_cluster(&mut self, cluster_id: u32, buf: &[u8]) -> Result<()> {
        self.check_index(cluster_id)?;
        debug_assert_eq!(buf.len(), self.cluster_size as usize);
        self.host.write_all_at(self.cluster_offset(cluster_id), buf)?;
        Ok(())
    }

    /// Reads only the 12-byte header of a cluster.
    pub(crate) fn read_cluster_head(&mut self, cluster_id: u32) -> Result<ClusterHeader> {
        self.check_index(cluster_id)?;
        let mut buf = [0_u8; CLUSTER_HEADER_SIZE as usize];
        self.host.read_exact_at(self.cluster_offset(cluster_id), &mut buf)?;
        Ok(ClusterHeader::parse(&buf))
    }

    /// Serializes the in-memory superblock into cluster 0 on disk.
    pub(crate) fn write_superblock(&mut self) -> Result<()> {
        let mut buf = vec![0_u8; self.cluster_size as usize];
        let header = ClusterHeader {
            data_seg_size: SUPERBLOCK_SIZE,
            next_cluster_id: 0,
            head_cluster_id: 0,
        };
        header.store(&mut buf);
        let mut wrt = Cursor::new(&mut buf[CLUSTER_HEADER_SIZE as usize..]);
        self.superblock.serialize(&mut wrt)?;
        self.host.write_all_at(0, &buf)?;
        Ok(())
    }

    /// Grows the file by `expand_cluster_count` clusters and persists the
    /// superblock. Returns the index of the first appended cluster and the
    /// number of clusters appended.
    pub(crate) fn expand(&mut self) -> Result<(u32, u32)> {
        let appended = self.superblock.expand_cluster_count;
        let grow = u64::from(appended) * u64::from(self.cluster_size);
        if self.file_size + grow >= MAX_STORE_SIZE {
            return Err(Error::NotEnoughSpace);
        }
        let first_new = self.superblock.cluster_count;
        self.host.zero_extend(self.file_size, self.file_size + grow)?;
        self.file_size += grow;
        self.superblock.cluster_count += appended;
        self.write_superblock()?;
        trace!("expanded store to {} clusters", self.superblock.cluster_count);
        Ok((first_new, appended))
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.host.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = ClusterHeader {
            data_seg_size: 84,
            next_cluster_id: 7,
            head_cluster_id: 3,
        };
        let mut buf = [0_u8; 16];
        header.store(&mut buf);
        assert_eq!(ClusterHeader::parse(&buf), header);
        // little-endian on disk
        assert_eq!(&buf[..4], &[84, 0, 0, 0]);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut buf = Vec::new();
        buf.write_u32_le(0x1234_5678).unwrap();
        buf.extend_from_slice(&[0; 20]);
        let mut rdr = Cursor::new(&buf[..]);
        assert!(matches!(Superblock::deserialize(&mut rdr), Err(Error::BadFormat)));
    }

    #[test]
    fn superblock_validates_geometry() {
        let superblock = Superblock {
            cluster_size: 128,
            cluster_count: 10,
            expand_cluster_count: 10,
            free_list_head: 0,
            directory_head: 0,
        };
        assert!(superblock.validate(1280).is_ok());
        assert!(superblock.validate(1281).is_err());
        let mut bad = superblock.clone();
        bad.cluster_size = 96; // not a power of two
        assert!(bad.validate(960).is_err());
    }
}

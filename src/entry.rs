use core::cmp;

use crate::cache::ClusterCache;
use crate::chain;
use crate::cluster::{ClusterHeader, ClusterManager, CLUSTER_HEADER_SIZE};
use crate::error::{Error, Result};

/// Bytes reserved at the start of a head cluster's payload for the
/// NUL-padded entry key.
pub(crate) const ENTRY_KEY_SIZE: u32 = 32;

const ZERO_FILL_CHUNK: usize = 64 * 1024;

/// Per-handle cursor.
///
/// `logical` is the user-visible byte offset. `cluster_id`/`cluster_base`
/// cache the cluster the cursor last touched and the stream offset of that
/// cluster's payload start, so sequential operations do not re-walk the
/// chain from the head. The stream offset of a logical position is
/// `logical + ENTRY_KEY_SIZE`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cursor {
    pub(crate) logical: u64,
    pub(crate) cluster_id: u32,
    pub(crate) cluster_base: u64,
}

impl Cursor {
    pub(crate) fn rewind(head: u32) -> Self {
        Cursor {
            logical: 0,
            cluster_id: head,
            cluster_base: 0,
        }
    }
}

fn payload(buf: &[u8]) -> &[u8] {
    &buf[CLUSTER_HEADER_SIZE as usize..]
}

fn payload_mut(buf: &mut [u8]) -> &mut [u8] {
    &mut buf[CLUSTER_HEADER_SIZE as usize..]
}

/// Allocates a head cluster for a new chain and stores the 32-byte key in
/// the first payload bytes. Returns the new chain's head cluster id.
pub(crate) fn create_chain(cache: &mut ClusterCache, mgr: &mut ClusterManager, key: &[u8; ENTRY_KEY_SIZE as usize]) -> Result<u32> {
    let head = chain::allocate_cluster(cache, mgr, None)?;
    let mut buf = cache.read(mgr, head)?;
    payload_mut(&mut buf)[..ENTRY_KEY_SIZE as usize].copy_from_slice(key);
    let header = ClusterHeader {
        data_seg_size: ENTRY_KEY_SIZE,
        next_cluster_id: 0,
        head_cluster_id: head,
    };
    header.store(&mut buf);
    cache.write(mgr, head, buf)?;
    Ok(head)
}

/// Reads the key bytes stored in a head cluster.
pub(crate) fn read_key(cache: &mut ClusterCache, mgr: &mut ClusterManager, head: u32) -> Result<[u8; ENTRY_KEY_SIZE as usize]> {
    let buf = cache.read(mgr, head)?;
    let header = ClusterHeader::parse(&buf);
    if header.data_seg_size < ENTRY_KEY_SIZE || header.head_cluster_id != head {
        return Err(Error::CorruptedFileSystem);
    }
    let mut key = [0_u8; ENTRY_KEY_SIZE as usize];
    key.copy_from_slice(&payload(&buf)[..ENTRY_KEY_SIZE as usize]);
    Ok(key)
}

/// Sum of `data_seg_size` over the chain, i.e. the length of the payload
/// stream including the key prefix.
fn stream_length(cache: &mut ClusterCache, mgr: &mut ClusterManager, head: u32) -> Result<u64> {
    let mut total = 0_u64;
    let mut cluster = head;
    let mut steps = 0_u32;
    loop {
        let header = chain::read_header(cache, mgr, cluster)?;
        total += u64::from(header.data_seg_size);
        if header.next_cluster_id == 0 {
            return Ok(total);
        }
        cluster = header.next_cluster_id;
        steps += 1;
        if steps > mgr.cluster_count() {
            return Err(Error::CorruptedFileSystem);
        }
    }
}

/// Logical entry length: the payload stream minus the key prefix.
pub(crate) fn entry_size(cache: &mut ClusterCache, mgr: &mut ClusterManager, head: u32) -> Result<u64> {
    let stream = stream_length(cache, mgr, head)?;
    if stream < u64::from(ENTRY_KEY_SIZE) {
        return Err(Error::CorruptedFileSystem);
    }
    Ok(stream - u64::from(ENTRY_KEY_SIZE))
}

/// Repositions the cursor, walking the chain to refresh the cached cluster.
/// Offsets beyond the current end are allowed; the cursor then rests on the
/// tail cluster until a write extends the entry.
pub(crate) fn seek(cache: &mut ClusterCache, mgr: &mut ClusterManager, head: u32, cursor: &mut Cursor, offset: u64) -> Result<()> {
    let target = offset + u64::from(ENTRY_KEY_SIZE);
    let mut cluster = head;
    let mut base = 0_u64;
    let mut steps = 0_u32;
    loop {
        let header = chain::read_header(cache, mgr, cluster)?;
        if target - base < u64::from(header.data_seg_size) || header.next_cluster_id == 0 {
            break;
        }
        base += u64::from(header.data_seg_size);
        cluster = header.next_cluster_id;
        steps += 1;
        if steps > mgr.cluster_count() {
            return Err(Error::CorruptedFileSystem);
        }
    }
    cursor.logical = offset;
    cursor.cluster_id = cluster;
    cursor.cluster_base = base;
    Ok(())
}

/// Copies up to `buf.len()` bytes starting at the cursor, crossing cluster
/// boundaries, stopping at end-of-entry. Advances the cursor.
pub(crate) fn read(cache: &mut ClusterCache, mgr: &mut ClusterManager, head: u32, cursor: &mut Cursor, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let target = cursor.logical + u64::from(ENTRY_KEY_SIZE);
    let (mut cluster, mut base) = if cursor.cluster_id != 0 && cursor.cluster_base <= target {
        (cursor.cluster_id, cursor.cluster_base)
    } else {
        (head, 0)
    };

    // find the cluster holding the first requested byte
    let mut steps = 0_u32;
    loop {
        let header = chain::read_header(cache, mgr, cluster)?;
        if target - base < u64::from(header.data_seg_size) {
            break;
        }
        if header.next_cluster_id == 0 {
            // cursor is at or past the end of the entry
            return Ok(0);
        }
        base += u64::from(header.data_seg_size);
        cluster = header.next_cluster_id;
        steps += 1;
        if steps > mgr.cluster_count() {
            return Err(Error::CorruptedFileSystem);
        }
    }

    let mut off = (target - base) as usize;
    let mut copied = 0;
    loop {
        let cl_buf = cache.read(mgr, cluster)?;
        let header = ClusterHeader::parse(&cl_buf);
        if header.data_seg_size > mgr.payload_max() {
            return Err(Error::CorruptedFileSystem);
        }
        let avail = header.data_seg_size as usize - off;
        let n = cmp::min(avail, buf.len() - copied);
        buf[copied..copied + n].copy_from_slice(&payload(&cl_buf)[off..off + n]);
        copied += n;
        off += n;
        if copied == buf.len() || header.next_cluster_id == 0 {
            break;
        }
        base += u64::from(header.data_seg_size);
        cluster = header.next_cluster_id;
        off = 0;
        steps += 1;
        if steps > mgr.cluster_count() {
            return Err(Error::CorruptedFileSystem);
        }
    }
    trace!("read {} bytes at offset {}", copied, cursor.logical);
    cursor.logical += copied as u64;
    cursor.cluster_id = cluster;
    cursor.cluster_base = base;
    Ok(copied)
}

/// Copies `data` into the chain's payload stream at `stream_off`, which
/// must not exceed the current stream length. Allocates tail clusters as
/// needed; on allocation failure the prefix already written stays valid and
/// its length is returned. Returns the bytes written and the cluster/base
/// the write ended in.
fn write_stream(
    cache: &mut ClusterCache,
    mgr: &mut ClusterManager,
    head: u32,
    hint: Option<(u32, u64)>,
    stream_off: u64,
    data: &[u8],
) -> Result<(usize, u32, u64)> {
    let p = u64::from(mgr.payload_max());
    let (mut cluster, mut base) = match hint {
        Some((cluster_id, cluster_base)) if cluster_id != 0 && cluster_base <= stream_off => (cluster_id, cluster_base),
        _ => (head, 0),
    };

    // walk to the cluster that will take the first byte; stream_off may sit
    // exactly on the tail's end, in which case allocation happens below
    let mut steps = 0_u32;
    while stream_off - base >= p {
        let header = chain::read_header(cache, mgr, cluster)?;
        if header.next_cluster_id == 0 {
            if stream_off - base == p {
                break;
            }
            // a gap beyond the tail should have been zero-filled already
            return Err(Error::CorruptedFileSystem);
        }
        base += p;
        cluster = header.next_cluster_id;
        steps += 1;
        if steps > mgr.cluster_count() {
            return Err(Error::CorruptedFileSystem);
        }
    }

    let mut written = 0;
    while written < data.len() {
        let mut off = (stream_off + written as u64 - base) as usize;
        if off == p as usize {
            // step over the cluster boundary, following or growing the chain
            let header = chain::read_header(cache, mgr, cluster)?;
            let next = if header.next_cluster_id != 0 {
                header.next_cluster_id
            } else {
                match chain::allocate_cluster(cache, mgr, Some(cluster)) {
                    Ok(cluster_id) => cluster_id,
                    Err(err) if written > 0 => {
                        warn!("chain extension failed after {} bytes: {}", written, err);
                        return Ok((written, cluster, base));
                    }
                    Err(err) => return Err(err),
                }
            };
            base += p;
            cluster = next;
            off = 0;
        }

        let mut buf = cache.read(mgr, cluster)?;
        let mut header = ClusterHeader::parse(&buf);
        if header.data_seg_size > mgr.payload_max() || off > header.data_seg_size as usize {
            return Err(Error::CorruptedFileSystem);
        }
        let n = cmp::min(p as usize - off, data.len() - written);
        payload_mut(&mut buf)[off..off + n].copy_from_slice(&data[written..written + n]);
        let end = (off + n) as u32;
        if end > header.data_seg_size {
            header.data_seg_size = end;
            header.store(&mut buf);
        }
        cache.write(mgr, cluster, buf)?;
        written += n;
    }
    Ok((written, cluster, base))
}

/// Appends zeros to the end of the stream in bounded chunks.
fn zero_fill(cache: &mut ClusterCache, mgr: &mut ClusterManager, head: u32, stream_end: u64, gap: u64) -> Result<()> {
    let zeros = [0_u8; ZERO_FILL_CHUNK];
    let mut pos = stream_end;
    let mut remaining = gap;
    let mut hint = None;
    while remaining > 0 {
        let n = cmp::min(remaining, ZERO_FILL_CHUNK as u64) as usize;
        let (filled, cluster, base) = write_stream(cache, mgr, head, hint, pos, &zeros[..n])?;
        if filled < n {
            return Err(Error::NotEnoughSpace);
        }
        pos += filled as u64;
        remaining -= filled as u64;
        hint = Some((cluster, base));
    }
    Ok(())
}

/// Writes `data` at the cursor, zero-filling any gap between the current
/// end of the entry and the cursor first. Returns the number of caller
/// bytes written; a partial count means allocation failed midway.
pub(crate) fn write(cache: &mut ClusterCache, mgr: &mut ClusterManager, head: u32, cursor: &mut Cursor, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let stream_end = stream_length(cache, mgr, head)?;
    let target = cursor.logical + u64::from(ENTRY_KEY_SIZE);
    if target > stream_end {
        zero_fill(cache, mgr, head, stream_end, target - stream_end)?;
    }
    let (written, cluster, base) = write_stream(cache, mgr, head, Some((cursor.cluster_id, cursor.cluster_base)), target, data)?;
    trace!("wrote {} bytes at offset {}", written, cursor.logical);
    cursor.logical += written as u64;
    cursor.cluster_id = cluster;
    cursor.cluster_base = base;
    Ok(written)
}

/// Changes the entry's logical length. Shrinking frees every cluster wholly
/// beyond the new end; growing zero-fills. The key prefix is never touched.
pub(crate) fn truncate(cache: &mut ClusterCache, mgr: &mut ClusterManager, head: u32, new_len: u64) -> Result<()> {
    let p = u64::from(mgr.payload_max());
    let current = entry_size(cache, mgr, head)?;
    if new_len == current {
        return Ok(());
    }
    if new_len > current {
        let stream_end = current + u64::from(ENTRY_KEY_SIZE);
        return zero_fill(cache, mgr, head, stream_end, new_len - current);
    }

    let stream_new_end = new_len + u64::from(ENTRY_KEY_SIZE);
    // the cluster holding the last retained byte becomes the tail
    let tail_index = (stream_new_end - 1) / p;
    let mut cluster = head;
    for _ in 0..tail_index {
        let header = chain::read_header(cache, mgr, cluster)?;
        if header.next_cluster_id == 0 {
            return Err(Error::CorruptedFileSystem);
        }
        cluster = header.next_cluster_id;
    }
    chain::truncate_chain(cache, mgr, cluster)?;
    let new_seg = (stream_new_end - tail_index * p) as u32;
    chain::update_header(cache, mgr, cluster, |h| h.data_seg_size = new_seg)?;
    Ok(())
}

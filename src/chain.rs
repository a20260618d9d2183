use crate::cache::ClusterCache;
use crate::cluster::{ClusterHeader, ClusterManager};
use crate::error::{Error, Result};

/// Reads a cluster header through the cache, rejecting headers no valid
/// store can contain.
pub(crate) fn read_header(cache: &mut ClusterCache, mgr: &mut ClusterManager, cluster_id: u32) -> Result<ClusterHeader> {
    let buf = cache.read(mgr, cluster_id)?;
    let header = ClusterHeader::parse(&buf);
    if header.data_seg_size > mgr.payload_max() {
        return Err(Error::CorruptedFileSystem);
    }
    if header.next_cluster_id >= mgr.cluster_count() {
        return Err(Error::CorruptedFileSystem);
    }
    Ok(header)
}

/// Read-modify-write of a single cluster header, leaving the payload alone.
pub(crate) fn update_header<F>(cache: &mut ClusterCache, mgr: &mut ClusterManager, cluster_id: u32, f: F) -> Result<()>
where
    F: FnOnce(&mut ClusterHeader),
{
    let mut buf = cache.read(mgr, cluster_id)?;
    let mut header = ClusterHeader::parse(&buf);
    f(&mut header);
    header.store(&mut buf);
    cache.write(mgr, cluster_id, buf)
}

/// Collects the cluster ids of a chain starting at `head`, in chain order.
/// A walk longer than the cluster count means a cycle.
pub(crate) fn collect_chain(cache: &mut ClusterCache, mgr: &mut ClusterManager, head: u32) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    let mut cluster = head;
    loop {
        ids.push(cluster);
        if ids.len() > mgr.cluster_count() as usize {
            return Err(Error::CorruptedFileSystem);
        }
        let header = read_header(cache, mgr, cluster)?;
        if header.next_cluster_id == 0 {
            return Ok(ids);
        }
        cluster = header.next_cluster_id;
    }
}

/// Pops a cluster off the free list, growing the backing file when the list
/// is empty. The fresh cluster is zeroed, marked as a tail and either
/// becomes its own chain head or is linked after `prev`.
pub(crate) fn allocate_cluster(cache: &mut ClusterCache, mgr: &mut ClusterManager, prev: Option<u32>) -> Result<u32> {
    if mgr.free_list_head() == 0 {
        let (first_new, appended) = mgr.expand()?;
        // chain the fresh clusters in ascending order in front of the list
        let mut next_free = mgr.free_list_head();
        for index in (0..appended).rev() {
            let cluster_id = first_new + index;
            let mut buf = vec![0_u8; mgr.cluster_size() as usize];
            let header = ClusterHeader {
                data_seg_size: 0,
                next_cluster_id: next_free,
                head_cluster_id: 0,
            };
            header.store(&mut buf);
            mgr.write_cluster(cluster_id, &buf)?;
            next_free = cluster_id;
        }
        mgr.set_free_list_head(next_free);
        mgr.write_superblock()?;
    }

    let cluster_id = mgr.free_list_head();
    // free clusters are never cache resident, their headers on disk are
    // authoritative
    let free_header = mgr.read_cluster_head(cluster_id)?;
    mgr.set_free_list_head(free_header.next_cluster_id);

    let head = match prev {
        Some(prev_id) => read_header(cache, mgr, prev_id)?.head_cluster_id,
        None => cluster_id,
    };
    let mut buf = vec![0_u8; mgr.cluster_size() as usize];
    let header = ClusterHeader {
        data_seg_size: 0,
        next_cluster_id: 0,
        head_cluster_id: head,
    };
    header.store(&mut buf);
    cache.write(mgr, cluster_id, buf)?;

    if let Some(prev_id) = prev {
        update_header(cache, mgr, prev_id, |h| {
            debug_assert_eq!(h.next_cluster_id, 0);
            h.next_cluster_id = cluster_id;
        })?;
    }
    mgr.write_superblock()?;
    trace!("allocated cluster {}", cluster_id);
    Ok(cluster_id)
}

/// Returns every cluster reachable from `from` to the free list. Resident
/// cache blocks are dropped without write-back; the freed clusters are
/// rewritten zeroed. Returns the number of clusters freed.
pub(crate) fn free_chain(cache: &mut ClusterCache, mgr: &mut ClusterManager, from: u32) -> Result<u32> {
    let ids = collect_chain(cache, mgr, from)?;
    let mut free_head = mgr.free_list_head();
    for &cluster_id in &ids {
        cache.invalidate(cluster_id);
        let mut buf = vec![0_u8; mgr.cluster_size() as usize];
        let header = ClusterHeader {
            data_seg_size: 0,
            next_cluster_id: free_head,
            head_cluster_id: 0,
        };
        header.store(&mut buf);
        mgr.write_cluster(cluster_id, &buf)?;
        free_head = cluster_id;
    }
    mgr.set_free_list_head(free_head);
    mgr.write_superblock()?;
    trace!("freed {} clusters starting at {}", ids.len(), from);
    Ok(ids.len() as u32)
}

/// Makes `new_tail` the last cluster of its chain, freeing everything
/// behind it.
pub(crate) fn truncate_chain(cache: &mut ClusterCache, mgr: &mut ClusterManager, new_tail: u32) -> Result<()> {
    let header = read_header(cache, mgr, new_tail)?;
    let rest = header.next_cluster_id;
    if rest == 0 {
        return Ok(());
    }
    update_header(cache, mgr, new_tail, |h| h.next_cluster_id = 0)?;
    free_chain(cache, mgr, rest)?;
    Ok(())
}

/// Length of the free list, walking the on-disk chain.
pub(crate) fn count_free_clusters(mgr: &mut ClusterManager) -> Result<u32> {
    let mut count = 0;
    let mut cluster = mgr.free_list_head();
    while cluster != 0 {
        count += 1;
        if count > mgr.cluster_count() {
            return Err(Error::CorruptedFileSystem);
        }
        cluster = mgr.read_cluster_head(cluster)?.next_cluster_id;
    }
    Ok(count)
}

use crate::cluster::ClusterManager;
use crate::error::Result;

/// One slot of the cluster cache: a buffered copy of a whole cluster plus
/// dirty and LRU metadata.
struct CacheBlock {
    cluster_id: u32,
    buf: Vec<u8>,
    dirty: bool,
    last_access: u64,
}

/// Fixed-capacity write-back cache of cluster buffers keyed by cluster
/// index, with LRU eviction. A capacity of 0 disables caching entirely and
/// every access passes straight through to the cluster manager.
pub(crate) struct ClusterCache {
    blocks: Vec<CacheBlock>,
    capacity: usize,
    access_counter: u64,
    hits: u64,
    misses: u64,
}

impl ClusterCache {
    pub(crate) fn new(capacity: usize) -> Self {
        ClusterCache {
            blocks: Vec::new(),
            capacity,
            access_counter: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lifetime hit rate of the current open, `hits / (hits + misses)`.
    pub(crate) fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }

    fn find(&self, cluster_id: u32) -> Option<usize> {
        self.blocks.iter().position(|b| b.cluster_id == cluster_id)
    }

    fn touch(&mut self, index: usize) {
        self.access_counter += 1;
        self.blocks[index].last_access = self.access_counter;
    }

    fn lru_index(&self) -> usize {
        let mut lru = 0;
        let mut lru_access = u64::MAX;
        for (index, block) in self.blocks.iter().enumerate() {
            if block.last_access < lru_access {
                lru_access = block.last_access;
                lru = index;
            }
        }
        lru
    }

    /// Selects a slot for a new resident cluster, evicting the least
    /// recently used block (with write-back when dirty) at capacity.
    fn acquire_slot(&mut self, mgr: &mut ClusterManager) -> Result<usize> {
        if self.blocks.len() < self.capacity {
            self.blocks.push(CacheBlock {
                cluster_id: 0,
                buf: Vec::new(),
                dirty: false,
                last_access: 0,
            });
            return Ok(self.blocks.len() - 1);
        }
        let index = self.lru_index();
        self.write_back(mgr, index)?;
        Ok(index)
    }

    fn write_back(&mut self, mgr: &mut ClusterManager, index: usize) -> Result<()> {
        if self.blocks[index].dirty {
            trace!("cache write-back of cluster {}", self.blocks[index].cluster_id);
            mgr.write_cluster(self.blocks[index].cluster_id, &self.blocks[index].buf)?;
            self.blocks[index].dirty = false;
        }
        Ok(())
    }

    /// Returns a copy of the cluster's current content.
    pub(crate) fn read(&mut self, mgr: &mut ClusterManager, cluster_id: u32) -> Result<Vec<u8>> {
        if self.capacity == 0 {
            self.misses += 1;
            return mgr.read_cluster(cluster_id);
        }
        if let Some(index) = self.find(cluster_id) {
            self.hits += 1;
            self.touch(index);
            return Ok(self.blocks[index].buf.clone());
        }
        self.misses += 1;
        let buf = mgr.read_cluster(cluster_id)?;
        let index = self.acquire_slot(mgr)?;
        self.blocks[index].cluster_id = cluster_id;
        self.blocks[index].buf = buf.clone();
        self.blocks[index].dirty = false;
        self.touch(index);
        Ok(buf)
    }

    /// Places a full cluster buffer in the cache and marks it dirty; the
    /// disk write is deferred until eviction or flush.
    pub(crate) fn write(&mut self, mgr: &mut ClusterManager, cluster_id: u32, buf: Vec<u8>) -> Result<()> {
        if self.capacity == 0 {
            self.misses += 1;
            return mgr.write_cluster(cluster_id, &buf);
        }
        let index = match self.find(cluster_id) {
            Some(index) => {
                self.hits += 1;
                index
            }
            None => {
                self.misses += 1;
                let index = self.acquire_slot(mgr)?;
                self.blocks[index].cluster_id = cluster_id;
                index
            }
        };
        self.blocks[index].buf = buf;
        self.blocks[index].dirty = true;
        self.touch(index);
        Ok(())
    }

    /// Writes back every dirty resident block.
    pub(crate) fn flush(&mut self, mgr: &mut ClusterManager) -> Result<()> {
        for index in 0..self.blocks.len() {
            self.write_back(mgr, index)?;
        }
        Ok(())
    }

    /// Changes the capacity at runtime. Shrinking drops blocks in LRU
    /// order, writing dirty ones back first.
    pub(crate) fn resize(&mut self, mgr: &mut ClusterManager, capacity: usize) -> Result<()> {
        self.capacity = capacity;
        while self.blocks.len() > capacity {
            let index = self.lru_index();
            self.write_back(mgr, index)?;
            self.blocks.swap_remove(index);
        }
        Ok(())
    }

    /// Drops the block for a cluster without write-back. Used when the
    /// cluster is returned to the free list.
    pub(crate) fn invalidate(&mut self, cluster_id: u32) {
        if let Some(index) = self.find(cluster_id) {
            self.blocks.swap_remove(index);
        }
    }
}

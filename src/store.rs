//! Block store: the integrity core of the server.
//!
//! The transport behind the provider is not trusted. Once any reader has seen
//! the bytes of a block, every later read of that block must return the same
//! bytes or fail; otherwise the peer could hand one set of bits to signature
//! verification and another to the installer. The store enforces this by
//! pinning each block's SHA-256 digest on first observation and rejecting any
//! refetch that hashes differently.

use std::mem::size_of;

use anyhow::bail;
use nix::errno::Errno;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::provider::BlockProvider;

/// fs/fuse/inode.c clamps max_read to at least a page.
pub const MIN_BLOCK_SIZE: u32 = 4096;
pub const MAX_BLOCK_SIZE: u32 = 1 << 22;
pub const MAX_BLOCK_COUNT: u32 = 1 << 18;

/// Memory left untouched for the co-resident updater process when sizing the
/// retention cache.
pub const DEFAULT_RESERVED_MEMORY: u64 = 500 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fingerprint {
    Unseen,
    Pinned([u8; 32]),
}

/// Blocks kept around after fetching so that random re-reads don't have to
/// round-trip the transport again. Purely advisory: an evicted block is
/// refetched and re-verified against its pinned fingerprint.
pub struct RetentionCache {
    capacity: u32,
    len: u32,
    slots: Vec<Option<Box<[u8]>>>,
}

impl RetentionCache {
    pub fn new(capacity: u32, block_count: u32) -> Self {
        Self {
            capacity,
            len: 0,
            slots: vec![None; block_count as usize],
        }
    }

    pub fn get(&self, block: u32) -> Option<&[u8]> {
        self.slots[block as usize].as_deref()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clone `bytes` into the slot for `block`, evicting first if the cache
    /// is full. Packages are mostly read front to back, so the scan for a
    /// victim starts just behind `block` and walks backward (wrapping),
    /// keeping the just-read and forward-adjacent blocks resident. If the
    /// walk wraps all the way around without finding a victim, the new block
    /// is not admitted.
    pub fn insert(&mut self, block: u32, bytes: &[u8]) {
        if self.len == self.capacity {
            let count = self.slots.len() as u32;
            let mut n = if block == 0 { count - 1 } else { block - 1 };
            loop {
                if n == block {
                    debug!("cache walk found no victim, not admitting block {block}");
                    return;
                }
                if self.slots[n as usize].take().is_some() {
                    self.len -= 1;
                    break;
                }
                n = if n == 0 { count - 1 } else { n - 1 };
            }
        }
        self.slots[block as usize] = Some(bytes.into());
        self.len += 1;
    }
}

/// Size the retention cache from the memory actually available on the
/// system: everything free right now, minus `reserved` for the updater and
/// the per-block bookkeeping. Returns `None` when the budget is too small to
/// be worth having (under two blocks or under 1% of the file).
pub fn plan_cache(free_memory: u64, file_size: u64, block_size: u32, reserved: u64) -> Option<u32> {
    let block_count = block_count(file_size, block_size);
    let overhead = reserved
        + block_count as u64 * (32 + size_of::<Option<Box<[u8]>>>() as u64);
    let avail = free_memory.saturating_sub(overhead);
    let budget = u32::try_from(avail / block_size as u64).unwrap_or(u32::MAX);
    let capacity = budget.min(block_count);
    if capacity >= 2 && capacity >= block_count / 100 {
        Some(capacity)
    } else {
        None
    }
}

/// MemFree + Buffers + Cached, in bytes. 0 if /proc/meminfo is unreadable.
pub fn free_memory() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .map(|s| parse_meminfo(&s))
        .unwrap_or(0)
}

fn parse_meminfo(contents: &str) -> u64 {
    let mut total = 0;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if matches!(key, "MemFree" | "Buffers" | "Cached") {
            let kb = value
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .unwrap_or(0);
            total += kb * 1024;
        }
    }
    total
}

pub fn block_count(file_size: u64, block_size: u32) -> u32 {
    if file_size == 0 {
        0
    } else {
        ((file_size - 1) / block_size as u64 + 1) as u32
    }
}

pub struct BlockStore {
    file_size: u64,
    block_size: u32,
    block_count: u32,
    /// Bytes of `current_index`, or meaningless when that is `None`.
    current: Box<[u8]>,
    current_index: Option<u64>,
    /// Holds the tail of block N while N+1 is fetched into `current` for a
    /// read that straddles the boundary.
    spill: Box<[u8]>,
    fingerprints: Vec<Fingerprint>,
    cache: Option<RetentionCache>,
}

impl BlockStore {
    pub fn new(
        file_size: u64,
        block_size: u32,
        cache_capacity: Option<u32>,
    ) -> anyhow::Result<Self> {
        if block_size < MIN_BLOCK_SIZE {
            bail!("block size {block_size} is too small");
        }
        if block_size > MAX_BLOCK_SIZE {
            bail!("block size {block_size} is too large");
        }
        let block_count = block_count(file_size, block_size);
        if block_count > MAX_BLOCK_COUNT {
            bail!("file has too many blocks ({block_count})");
        }
        Ok(Self {
            file_size,
            block_size,
            block_count,
            current: vec![0; block_size as usize].into_boxed_slice(),
            current_index: None,
            spill: vec![0; block_size as usize].into_boxed_slice(),
            fingerprints: vec![Fingerprint::Unseen; block_count as usize],
            cache: cache_capacity.map(|capacity| RetentionCache::new(capacity, block_count)),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn current(&self) -> &[u8] {
        &self.current
    }

    pub fn spill(&self) -> &[u8] {
        &self.spill
    }

    pub fn cache(&self) -> Option<&RetentionCache> {
        self.cache.as_ref()
    }

    /// Preserve the tail of the current block before `ensure_block`
    /// overwrites it with the next one.
    pub fn spill_tail(&mut self, from: usize) {
        let len = self.block_size as usize - from;
        self.spill[..len].copy_from_slice(&self.current[from..]);
    }

    /// Make `current` hold the bytes of `block`. Consults, in order: the
    /// buffer itself, the retention cache, the provider. A provider fetch is
    /// hashed and checked against the block's pinned fingerprint; the first
    /// observation pins it. Blocks past the end of the file are synthesized
    /// as zeros and never fetched or fingerprinted.
    pub fn ensure_block(
        &mut self,
        provider: &mut dyn BlockProvider,
        block: u64,
    ) -> Result<(), Errno> {
        if self.current_index == Some(block) {
            return Ok(());
        }

        if block >= self.block_count as u64 {
            self.current.fill(0);
            self.current_index = Some(block);
            return Ok(());
        }
        let index = block as u32;

        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(index) {
                self.current.copy_from_slice(bytes);
                self.current_index = Some(block);
                return Ok(());
            }
        }

        // The last block of the file may be partial: fetch short and pad
        // with zeros before hashing.
        let mut fetch_len = self.block_size as usize;
        let start = block * self.block_size as u64;
        if start + self.block_size as u64 > self.file_size {
            fetch_len = (self.file_size - start) as usize;
            self.current[fetch_len..].fill(0);
        }

        if let Err(err) = provider.read_block(&mut self.current[..fetch_len], index) {
            warn!("provider failed to deliver block {index}: {err:#}");
            return Err(Errno::EIO);
        }
        self.current_index = Some(block);

        let digest: [u8; 32] = Sha256::digest(&self.current).into();
        match self.fingerprints[index as usize] {
            Fingerprint::Pinned(pinned) if pinned == digest => Ok(()),
            Fingerprint::Pinned(_) => {
                error!("block {index} does not match its first-read fingerprint");
                self.current_index = None;
                Err(Errno::EIO)
            }
            Fingerprint::Unseen => {
                self.fingerprints[index as usize] = Fingerprint::Pinned(digest);
                if let Some(cache) = &mut self.cache {
                    cache.insert(index, &self.current);
                }
                Ok(())
            }
        }
    }
}

//! Fixed-size packet pool.
//!
//! Packets are slots inside cache blocks. A [`Packet`] is an arena index
//! (cache, slot, cache generation), never a pointer, so the pool always finds
//! a packet's header by lookup.
//!
//! Growth and shrink follow the slab scheme:
//! - `acquire` pops the free list, allocating a whole new cache when it is empty
//! - `release` pushes the slot back; a cache whose usage drops to zero is
//!   returned to the allocator once the pool holds more than
//!   `2 x cache_capacity` free slots
//!
//! `allocated == used + free` holds after every call.

use thiserror::Error;

/// Default bytes per packet.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Default number of packets per cache block.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A new cache block could not be allocated.
    #[error("packet pool out of memory")]
    OutOfMemory,

    /// The packet was already returned.
    #[error("packet {cache}:{slot} released twice")]
    DoubleFree { cache: u32, slot: u32 },

    /// The packet does not belong to this pool (or to a cache that was since freed).
    #[error("packet {cache}:{slot} does not belong to this pool")]
    Foreign { cache: u32, slot: u32 },

    /// Counters disagree with the slot states.
    #[error("pool bookkeeping corrupted: {0}")]
    Corrupted(String),
}

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Bytes per packet.
    pub packet_size: usize,
    /// Packets per cache block.
    pub cache_capacity: usize,
    /// Optional ceiling on allocated packets. `None` lets the pool grow until
    /// the allocator refuses.
    pub max_packets: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_packets: None,
        }
    }
}

/// Handle to a packet slot.
///
/// Deliberately neither `Clone` nor `Copy`: whoever holds the handle owns the
/// slot until it goes back through [`PacketPool::release`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Packet {
    cache: u32,
    slot: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotMeta {
    in_use: bool,
    len: usize,
    sent: usize,
}

#[derive(Debug)]
struct Cache {
    generation: u32,
    data: Vec<u8>,
    meta: Vec<SlotMeta>,
    used: usize,
    live: bool,
}

/// Slab pool of fixed-size packets. Owned by a single worker.
#[derive(Debug)]
pub struct PacketPool {
    config: PoolConfig,
    caches: Vec<Cache>,
    retired: Vec<u32>,
    free: Vec<(u32, u32)>,
    allocated: usize,
    used: usize,
    next_generation: u32,
}

impl PacketPool {
    /// Create an empty pool. No memory is allocated until the first `acquire`.
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig {
            packet_size: config.packet_size.max(1),
            cache_capacity: config.cache_capacity.max(1),
            max_packets: config.max_packets,
        };
        Self {
            config,
            caches: Vec::new(),
            retired: Vec::new(),
            free: Vec::new(),
            allocated: 0,
            used: 0,
            next_generation: 0,
        }
    }

    /// Take a packet, growing the pool by one cache if the free list is empty.
    pub fn acquire(&mut self) -> Result<Packet, PoolError> {
        debug_assert_eq!(self.check_invariants(), Ok(()));

        if self.free.is_empty() {
            self.grow()?;
        }
        let Some((cache_idx, slot)) = self.free.pop() else {
            return Err(PoolError::OutOfMemory);
        };

        let cache = &mut self.caches[cache_idx as usize];
        cache.meta[slot as usize] = SlotMeta {
            in_use: true,
            len: 0,
            sent: 0,
        };
        cache.used += 1;
        self.used += 1;
        let packet = Packet {
            cache: cache_idx,
            slot,
            generation: cache.generation,
        };

        debug_assert_eq!(self.check_invariants(), Ok(()));
        Ok(packet)
    }

    /// Return a packet. Frees its cache when the cache is idle and the pool
    /// holds more than twice a cache's worth of free packets.
    pub fn release(&mut self, packet: Packet) -> Result<(), PoolError> {
        debug_assert_eq!(self.check_invariants(), Ok(()));

        let Packet {
            cache: cache_idx,
            slot,
            generation,
        } = packet;
        let foreign = PoolError::Foreign {
            cache: cache_idx,
            slot,
        };
        let cache = self
            .caches
            .get_mut(cache_idx as usize)
            .ok_or_else(|| foreign.clone())?;
        if !cache.live || cache.generation != generation {
            return Err(foreign);
        }
        let meta = cache.meta.get_mut(slot as usize).ok_or(foreign)?;
        if !meta.in_use {
            return Err(PoolError::DoubleFree {
                cache: cache_idx,
                slot,
            });
        }

        *meta = SlotMeta::default();
        cache.used -= 1;
        let cache_idle = cache.used == 0;
        self.used -= 1;
        self.free.push((cache_idx, slot));

        if cache_idle && self.free.len() > 2 * self.config.cache_capacity {
            self.shrink(cache_idx);
        }

        debug_assert_eq!(self.check_invariants(), Ok(()));
        Ok(())
    }

    fn grow(&mut self) -> Result<(), PoolError> {
        let capacity = self.config.cache_capacity;
        if let Some(max) = self.config.max_packets {
            if self.allocated + capacity > max {
                return Err(PoolError::OutOfMemory);
            }
        }

        let bytes = self
            .config
            .packet_size
            .checked_mul(capacity)
            .ok_or(PoolError::OutOfMemory)?;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| PoolError::OutOfMemory)?;
        data.resize(bytes, 0);
        let mut meta = Vec::new();
        meta.try_reserve_exact(capacity)
            .map_err(|_| PoolError::OutOfMemory)?;
        meta.resize(capacity, SlotMeta::default());
        self.free
            .try_reserve(capacity)
            .map_err(|_| PoolError::OutOfMemory)?;

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let cache = Cache {
            generation,
            data,
            meta,
            used: 0,
            live: true,
        };

        let cache_idx = match self.retired.pop() {
            Some(idx) => {
                self.caches[idx as usize] = cache;
                idx
            }
            None => {
                self.caches.push(cache);
                (self.caches.len() - 1) as u32
            }
        };

        // Reverse so the lowest slot is handed out first.
        self.free
            .extend((0..capacity as u32).rev().map(|slot| (cache_idx, slot)));
        self.allocated += capacity;
        Ok(())
    }

    fn shrink(&mut self, cache_idx: u32) {
        let cache = &mut self.caches[cache_idx as usize];
        debug_assert_eq!(cache.used, 0);
        cache.live = false;
        cache.data = Vec::new();
        cache.meta = Vec::new();
        self.free.retain(|&(idx, _)| idx != cache_idx);
        self.allocated -= self.config.cache_capacity;
        self.retired.push(cache_idx);
    }

    fn meta(&self, packet: &Packet) -> &SlotMeta {
        &self.caches[packet.cache as usize].meta[packet.slot as usize]
    }

    fn meta_mut(&mut self, packet: &Packet) -> &mut SlotMeta {
        &mut self.caches[packet.cache as usize].meta[packet.slot as usize]
    }

    fn range(&self, packet: &Packet) -> std::ops::Range<usize> {
        let start = packet.slot as usize * self.config.packet_size;
        start..start + self.config.packet_size
    }

    /// Bytes filled so far.
    pub fn len(&self, packet: &Packet) -> usize {
        self.meta(packet).len
    }

    /// Whether nothing has been filled in yet.
    pub fn is_empty(&self, packet: &Packet) -> bool {
        self.meta(packet).len == 0
    }

    /// Whether the packet has no spare room left.
    pub fn is_full(&self, packet: &Packet) -> bool {
        self.meta(packet).len == self.config.packet_size
    }

    /// Whether every filled byte has been sent.
    pub fn is_drained(&self, packet: &Packet) -> bool {
        let meta = self.meta(packet);
        meta.sent == meta.len
    }

    /// Filled bytes not yet sent.
    pub fn unsent(&self, packet: &Packet) -> &[u8] {
        let meta = *self.meta(packet);
        let range = self.range(packet);
        &self.caches[packet.cache as usize].data[range][meta.sent..meta.len]
    }

    /// Room after the filled bytes, for the next receive.
    pub fn spare_mut(&mut self, packet: &Packet) -> &mut [u8] {
        let len = self.meta(packet).len;
        let range = self.range(packet);
        &mut self.caches[packet.cache as usize].data[range][len..]
    }

    /// Mark `n` more bytes as filled.
    pub fn commit(&mut self, packet: &Packet, n: usize) {
        let capacity = self.config.packet_size;
        let meta = self.meta_mut(packet);
        debug_assert!(meta.len + n <= capacity);
        meta.len = (meta.len + n).min(capacity);
    }

    /// Advance the send cursor by `n` bytes.
    pub fn advance(&mut self, packet: &Packet, n: usize) {
        let meta = self.meta_mut(packet);
        debug_assert!(meta.sent + n <= meta.len);
        meta.sent = (meta.sent + n).min(meta.len);
    }

    /// Packets backed by memory (used + free).
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Packets handed out.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Packets on the free list.
    pub fn free(&self) -> usize {
        self.free.len()
    }

    /// Cache blocks currently backed by memory.
    pub fn cache_count(&self) -> usize {
        self.caches.iter().filter(|c| c.live).count()
    }

    /// Bytes per packet.
    pub fn packet_size(&self) -> usize {
        self.config.packet_size
    }

    /// Verify the counters against the slot states.
    pub fn check_invariants(&self) -> Result<(), PoolError> {
        if self.allocated != self.used + self.free.len() {
            return Err(PoolError::Corrupted(format!(
                "allocated {} != used {} + free {}",
                self.allocated,
                self.used,
                self.free.len()
            )));
        }

        let mut in_use = 0;
        let mut live_slots = 0;
        for cache in self.caches.iter().filter(|c| c.live) {
            let busy = cache.meta.iter().filter(|m| m.in_use).count();
            if busy != cache.used {
                return Err(PoolError::Corrupted(format!(
                    "cache generation {} counts {} used but has {} busy slots",
                    cache.generation, cache.used, busy
                )));
            }
            in_use += busy;
            live_slots += cache.meta.len();
        }
        if in_use != self.used || live_slots != self.allocated {
            return Err(PoolError::Corrupted(format!(
                "slots in use {in_use}/{live_slots}, counters {}/{}",
                self.used, self.allocated
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn forge(packet: &Packet) -> Packet {
        Packet {
            cache: packet.cache,
            slot: packet.slot,
            generation: packet.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn small_pool(capacity: usize) -> PacketPool {
        PacketPool::new(PoolConfig {
            packet_size: 8,
            cache_capacity: capacity,
            max_packets: None,
        })
    }

    #[test]
    fn test_acquire_grows_by_whole_caches() {
        let mut pool = small_pool(4);
        assert_eq!(pool.allocated(), 0);

        let a = pool.acquire().unwrap();
        assert_eq!(pool.allocated(), 4);
        assert_eq!(pool.used(), 1);
        assert_eq!(pool.free(), 3);

        let rest: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.cache_count(), 2);
        assert_eq!(pool.allocated(), 8);

        pool.release(a).unwrap();
        for p in rest {
            pool.release(p).unwrap();
        }
        assert_eq!(pool.used(), 0);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_idle_cache_freed_only_above_high_water() {
        let mut pool = small_pool(2);
        let held: Vec<_> = (0..6).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.cache_count(), 3);

        let mut held = held.into_iter();
        // Free counts stay at or below 2 x capacity: nothing is returned.
        for _ in 0..4 {
            pool.release(held.next().unwrap()).unwrap();
        }
        assert_eq!(pool.cache_count(), 3);
        assert_eq!(pool.free(), 4);

        // Fifth release leaves the third cache idle with 5 free slots > 4.
        pool.release(held.next().unwrap()).unwrap();
        assert_eq!(pool.cache_count(), 3, "third cache still holds a packet");
        pool.release(held.next().unwrap()).unwrap();
        assert_eq!(pool.cache_count(), 2);
        assert_eq!(pool.allocated(), 4);
        assert_eq!(pool.free(), 4);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_double_free_is_reported() {
        let mut pool = small_pool(2);
        let p = pool.acquire().unwrap();
        let twin = PacketPool::forge(&p);
        pool.release(p).unwrap();
        assert_eq!(
            pool.release(twin),
            Err(PoolError::DoubleFree { cache: 0, slot: 0 })
        );
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_packet_from_other_pool_is_rejected() {
        let mut a = small_pool(2);
        let mut b = small_pool(2);
        let _warm = b.acquire().unwrap();
        let p = a.acquire().unwrap();
        let stranger = PacketPool::forge(&p);
        a.release(p).unwrap();
        // `b` has a cache 0 of the same generation; slot 1 is free there.
        let mut forged = stranger;
        forged.slot = 5;
        assert!(matches!(b.release(forged), Err(PoolError::Foreign { .. })));
    }

    #[test]
    fn test_max_packets_surfaces_out_of_memory() {
        let mut pool = PacketPool::new(PoolConfig {
            packet_size: 8,
            cache_capacity: 2,
            max_packets: Some(2),
        });
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.acquire(), Err(PoolError::OutOfMemory));
        pool.check_invariants().unwrap();
        pool.release(a).unwrap();
        assert!(pool.acquire().is_ok());
        pool.release(b).unwrap();
    }

    #[test]
    fn test_fill_and_send_cursors() {
        let mut pool = small_pool(1);
        let p = pool.acquire().unwrap();
        assert!(pool.is_empty(&p));

        pool.spare_mut(&p)[..5].copy_from_slice(b"hello");
        pool.commit(&p, 5);
        assert_eq!(pool.unsent(&p), b"hello");
        assert_eq!(pool.spare_mut(&p).len(), 3);

        pool.advance(&p, 2);
        assert_eq!(pool.unsent(&p), b"llo");
        assert!(!pool.is_drained(&p));
        pool.advance(&p, 3);
        assert!(pool.is_drained(&p));

        pool.release(p).unwrap();
        let again = pool.acquire().unwrap();
        assert!(pool.is_empty(&again), "recycled packets start empty");
        pool.release(again).unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Release(usize),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![Just(Op::Acquire), any::<usize>().prop_map(Op::Release)],
            0..300,
        )
    }

    proptest! {
        #[test]
        fn prop_pool_counts_balance(seq in ops(), capacity in 1usize..6) {
            let mut pool = PacketPool::new(PoolConfig {
                packet_size: 4,
                cache_capacity: capacity,
                max_packets: None,
            });
            let mut live: Vec<Packet> = Vec::new();

            for op in seq {
                match op {
                    Op::Acquire => live.push(pool.acquire().unwrap()),
                    Op::Release(i) if !live.is_empty() => {
                        let p = live.swap_remove(i % live.len());
                        pool.release(p).unwrap();
                    }
                    Op::Release(_) => {}
                }
                prop_assert_eq!(pool.allocated(), pool.used() + pool.free());
                prop_assert_eq!(pool.used(), live.len());
                prop_assert_eq!(pool.check_invariants(), Ok(()));

                let slots: HashSet<(u32, u32)> = live.iter().map(|p| (p.cache, p.slot)).collect();
                prop_assert_eq!(slots.len(), live.len(), "two live packets share a slot");
            }
        }

        #[test]
        fn prop_live_packets_keep_their_bytes(count in 1usize..40) {
            let mut pool = PacketPool::new(PoolConfig {
                packet_size: 4,
                cache_capacity: 3,
                max_packets: None,
            });
            let packets: Vec<Packet> = (0..count).map(|_| pool.acquire().unwrap()).collect();
            for (i, p) in packets.iter().enumerate() {
                pool.spare_mut(p).fill(i as u8);
                pool.commit(p, 4);
            }
            for (i, p) in packets.iter().enumerate() {
                prop_assert!(pool.unsent(p).iter().all(|&b| b == i as u8));
            }
            for p in packets {
                pool.release(p).unwrap();
            }
        }
    }
}

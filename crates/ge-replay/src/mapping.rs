//! Pushbuffer-to-guest-memory mapping.
//!
//! Dumps can reference more data than the emulated device has usable memory,
//! because generated data is captured too. This maps byte ranges of the
//! pushbuffer into guest RAM on demand: large aligned "slab" windows with LRU
//! eviction for the common case, and exact-fit "extra" allocations (reused
//! round-robin) for ranges that straddle a slab boundary or exceed slab size,
//! since texture data, vertices etc. must be contiguous in guest memory.
//!
//! The flush callback runs before any slab or extra is overwritten: the GE
//! may still be consuming the old window asynchronously, and eviction without
//! a stall would corrupt in-flight work.

use tracing::debug;

use crate::env::GuestMemory;

pub const SLAB_SIZE: u32 = 1024 * 1024;
// 10 is the number of texture units + verts + inds; the worst case of
// concurrently live mappings.
pub const SLAB_COUNT: usize = 10;
pub const EXTRA_COUNT: usize = 10;

/// An aligned slab-sized window of the pushbuffer in guest RAM.
#[derive(Clone, Copy, Default)]
struct Slab {
    guest_ptr: u32,
    buf_pos: u32,
    last_used: u32,
}

impl Slab {
    fn matches(&self, buf_pos: u32) -> bool {
        // guest_ptr is checked because buf_pos = 0 is valid, and the initial
        // value.
        self.buf_pos == buf_pos && self.guest_ptr != 0
    }

    fn age(&self, generation: u32) -> u32 {
        // Unallocated is as expired as it's gonna get.
        if self.guest_ptr == 0 {
            u32::MAX
        } else {
            generation - self.last_used
        }
    }
}

/// An ad-hoc exact-fit mapping (straddling slabs, or larger than one).
#[derive(Clone, Copy, Default)]
struct Extra {
    guest_ptr: u32,
    buf_pos: u32,
    size: u32,
}

impl Extra {
    fn matches(&self, buf_pos: u32, size: u32) -> bool {
        self.buf_pos == buf_pos && self.guest_ptr != 0 && self.size >= size
    }
}

pub struct BufMapping {
    slabs: [Slab; SLAB_COUNT],
    extras: [Extra; EXTRA_COUNT],
    /// Most recently set-up slab, the fast path for clustered access.
    last_slab: usize,
    /// Round-robin cursor over the extra pool.
    extra_cursor: usize,
    /// Bumped on every slab setup; drives LRU ages.
    generation: u32,
}

impl BufMapping {
    pub fn new() -> BufMapping {
        BufMapping {
            slabs: [Slab::default(); SLAB_COUNT],
            extras: [Extra::default(); EXTRA_COUNT],
            last_slab: 0,
            extra_cursor: 0,
            generation: 0,
        }
    }

    /// Maps `pushbuf[offset..offset + size]` to contiguous guest memory.
    /// Returns the guest address, or 0 on allocation failure.
    pub fn map(
        &mut self,
        mem: &dyn GuestMemory,
        pushbuf: &[u8],
        offset: u32,
        size: u32,
        flush: &mut dyn FnMut(),
    ) -> u32 {
        if size == 0 {
            debug!(offset, "refusing to map empty range");
            return 0;
        }

        let slab1 = offset / SLAB_SIZE;
        let slab2 = (offset + size - 1) / SLAB_SIZE;
        if slab1 == slab2 {
            // Shortcut in case it's simply the most recent slab.
            if self.slabs[self.last_slab].matches(slab1 * SLAB_SIZE) {
                return self.slab_ptr(self.last_slab, offset);
            }
            self.map_slab(mem, pushbuf, offset, flush)
        } else {
            // Straddles a slab boundary; needs a contiguous extra.
            self.map_extra(mem, pushbuf, offset, size, flush)
        }
    }

    /// Frees every slab and extra. Session teardown only.
    pub fn reset(&mut self, mem: &dyn GuestMemory) {
        self.generation = 0;
        self.extra_cursor = 0;
        self.last_slab = 0;
        for slab in &mut self.slabs {
            if slab.guest_ptr != 0 {
                mem.free(slab.guest_ptr);
            }
            *slab = Slab::default();
        }
        for extra in &mut self.extras {
            if extra.guest_ptr != 0 {
                mem.free(extra.guest_ptr);
            }
            *extra = Extra::default();
        }
    }

    /// Marks the slab used and returns the guest address for `offset`.
    fn slab_ptr(&mut self, index: usize, offset: u32) -> u32 {
        let slab = &mut self.slabs[index];
        slab.last_used = self.generation;
        slab.guest_ptr + (offset - slab.buf_pos)
    }

    fn map_slab(
        &mut self,
        mem: &dyn GuestMemory,
        pushbuf: &[u8],
        offset: u32,
        flush: &mut dyn FnMut(),
    ) -> u32 {
        let slab_pos = (offset / SLAB_SIZE) * SLAB_SIZE;

        let mut best = 0;
        for i in 0..SLAB_COUNT {
            if self.slabs[i].matches(slab_pos) {
                return self.slab_ptr(i, offset);
            }
            if self.slabs[i].age(self.generation) > self.slabs[best].age(self.generation) {
                best = i;
            }
        }

        // Stall before overwriting the evicted window.
        flush();

        // Slabs come in one size; an already-backed slab is simply taken over.
        if self.slabs[best].guest_ptr == 0 {
            match mem.alloc(SLAB_SIZE, false, "GE replay slab") {
                Some(ptr) => self.slabs[best].guest_ptr = ptr,
                None => return 0,
            }
        }

        let copy_len = SLAB_SIZE.min(pushbuf.len() as u32 - slab_pos) as usize;
        mem.write_bytes(
            self.slabs[best].guest_ptr,
            &pushbuf[slab_pos as usize..slab_pos as usize + copy_len],
        );
        self.slabs[best].buf_pos = slab_pos;
        self.generation += 1;
        self.slabs[best].last_used = self.generation;
        self.last_slab = best;
        self.slab_ptr(best, offset)
    }

    fn map_extra(
        &mut self,
        mem: &dyn GuestMemory,
        pushbuf: &[u8],
        offset: u32,
        size: u32,
        flush: &mut dyn FnMut(),
    ) -> u32 {
        for extra in &self.extras {
            // Larger straddling buffers are reasonably likely to be reused.
            if extra.matches(offset, size) {
                return extra.guest_ptr;
            }
        }

        // Stall first, so we don't stomp guest RAM still being read.
        flush();

        let index = self.extra_cursor;
        self.extra_cursor = (self.extra_cursor + 1) % EXTRA_COUNT;

        if !self.setup_extra(mem, pushbuf, index, offset, size) {
            // Old extras may have outlived their real use; free the whole
            // pool and try once more before giving up.
            for extra in &mut self.extras {
                if extra.guest_ptr != 0 {
                    mem.free(extra.guest_ptr);
                }
                *extra = Extra::default();
            }
            if !self.setup_extra(mem, pushbuf, index, offset, size) {
                return 0;
            }
        }
        self.extras[index].guest_ptr
    }

    fn setup_extra(
        &mut self,
        mem: &dyn GuestMemory,
        pushbuf: &[u8],
        index: usize,
        offset: u32,
        size: u32,
    ) -> bool {
        let extra = &mut self.extras[index];
        if extra.guest_ptr != 0 {
            mem.free(extra.guest_ptr);
            *extra = Extra::default();
        }

        let ptr = match mem.alloc(size, false, "GE replay straddle") {
            Some(ptr) => ptr,
            None => return false,
        };
        extra.guest_ptr = ptr;
        extra.buf_pos = offset;
        extra.size = size;
        mem.write_bytes(ptr, &pushbuf[offset as usize..(offset + size) as usize]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::VecGuestRam;

    fn ram_24m() -> VecGuestRam {
        VecGuestRam::new(0x0880_0000, 24 * 1024 * 1024)
    }

    fn pushbuf(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 255) as u8).collect()
    }

    #[test]
    fn slab_map_is_idempotent_until_eviction() {
        let ram = ram_24m();
        let buf = pushbuf(2 * SLAB_SIZE as usize);
        let mut mapping = BufMapping::new();
        let mut flushes = 0;

        let first = mapping.map(&ram, &buf, 0x100, 0x40, &mut || flushes += 1);
        assert_ne!(first, 0);
        assert_eq!(flushes, 1);

        // Same window, same address; no further flushes.
        for _ in 0..4 {
            assert_eq!(mapping.map(&ram, &buf, 0x100, 0x40, &mut || flushes += 1), first);
        }
        assert_eq!(mapping.map(&ram, &buf, 0x9000, 4, &mut || flushes += 1), first + 0x8F00);
        assert_eq!(flushes, 1);
    }

    #[test]
    fn slab_contents_match_pushbuffer() {
        let ram = ram_24m();
        let buf = pushbuf(SLAB_SIZE as usize);
        let mut mapping = BufMapping::new();
        let addr = mapping.map(&ram, &buf, 0x2345, 0x100, &mut || {});
        assert_ne!(addr, 0);
        assert_eq!(ram.read_bytes(addr, 0x100), buf[0x2345..0x2445]);
    }

    #[test]
    fn straddling_range_is_contiguous() {
        let ram = ram_24m();
        let buf = pushbuf(3 * SLAB_SIZE as usize);
        let mut mapping = BufMapping::new();

        let offset = SLAB_SIZE - 8;
        let addr = mapping.map(&ram, &buf, offset, 64, &mut || {});
        assert_ne!(addr, 0);
        assert_eq!(
            ram.read_bytes(addr, 64),
            buf[offset as usize..offset as usize + 64]
        );

        // Oversize request (> slab) also goes through the extra pool.
        let big = mapping.map(&ram, &buf, 0, SLAB_SIZE + 16, &mut || {});
        assert_ne!(big, 0);
        assert_eq!(
            ram.read_bytes(big, SLAB_SIZE + 16),
            buf[..(SLAB_SIZE + 16) as usize]
        );
    }

    #[test]
    fn lru_evicts_the_oldest_slab_first() {
        let ram = ram_24m();
        let buf = pushbuf((SLAB_COUNT + 2) * SLAB_SIZE as usize);
        let mut mapping = BufMapping::new();

        let mut addrs = Vec::new();
        for i in 0..SLAB_COUNT {
            addrs.push(mapping.map(&ram, &buf, i as u32 * SLAB_SIZE, 16, &mut || {}));
        }
        assert!(addrs.iter().all(|&a| a != 0));

        // Touch every slab except the first so slab 0 is strictly oldest.
        for i in 1..SLAB_COUNT {
            mapping.map(&ram, &buf, i as u32 * SLAB_SIZE, 16, &mut || {});
        }

        // One more distinct window: must reuse slab 0's backing memory.
        let evicted = mapping.map(&ram, &buf, SLAB_COUNT as u32 * SLAB_SIZE, 16, &mut || {});
        assert_eq!(evicted, addrs[0]);

        // Window 0 now needs a fresh setup, evicting the next-oldest (1).
        let remapped = mapping.map(&ram, &buf, 0, 16, &mut || {});
        assert_eq!(remapped, addrs[1]);
    }

    #[test]
    fn allocation_failure_returns_zero() {
        // Too small for even one slab.
        let ram = VecGuestRam::new(0x0880_0000, 0x1000);
        let buf = pushbuf(2 * SLAB_SIZE as usize);
        let mut mapping = BufMapping::new();
        assert_eq!(mapping.map(&ram, &buf, 0, 16, &mut || {}), 0);
    }

    #[test]
    fn extra_pool_frees_everything_and_retries() {
        // Room for two ~0.9 MiB extras but not three.
        let ram = VecGuestRam::new(0x0880_0000, 2 * 1024 * 1024);
        let buf = pushbuf(4 * SLAB_SIZE as usize);
        let mut mapping = BufMapping::new();
        let size = 900 * 1024;

        let a = mapping.map(&ram, &buf, SLAB_SIZE - 4, size, &mut || {});
        let b = mapping.map(&ram, &buf, 2 * SLAB_SIZE - 4, size, &mut || {});
        assert!(a != 0 && b != 0);

        // Third distinct straddle exhausts RAM; the pool must free itself and
        // retry once rather than fail.
        let c = mapping.map(&ram, &buf, 3 * SLAB_SIZE - 4, size, &mut || {});
        assert_ne!(c, 0);
        assert_eq!(
            ram.read_bytes(c, size),
            buf[(3 * SLAB_SIZE - 4) as usize..(3 * SLAB_SIZE - 4 + size) as usize]
        );
    }

    #[test]
    fn reset_releases_guest_memory() {
        let ram = ram_24m();
        let buf = pushbuf(2 * SLAB_SIZE as usize);
        let mut mapping = BufMapping::new();
        let addr = mapping.map(&ram, &buf, 0, 16, &mut || {});
        assert_ne!(addr, 0);

        mapping.reset(&ram);
        // The slab's backing memory is allocatable again.
        assert_eq!(ram.alloc(SLAB_SIZE, false, "check"), Some(addr));
    }
}

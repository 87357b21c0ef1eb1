//! Trait seams toward the host emulator.
//!
//! The replay engine never touches emulated memory, the GPU engine, or the
//! scheduler directly; the embedding emulator provides these behind small
//! traits. Everything is `&self` + `Send + Sync` because the worker thread
//! and the primary context share one `Arc<dyn ReplayEnv>` — implementations
//! do their own locking.

use std::sync::Mutex;

/// Emulated user memory and the VRAM predicates the replayer relies on.
pub trait GuestMemory: Send + Sync {
    fn is_valid_range(&self, addr: u32, size: u32) -> bool;
    fn is_vram_address(&self, addr: u32) -> bool;

    /// Unchecked copy into emulated memory. Callers validate the range.
    fn write_bytes(&self, addr: u32, bytes: &[u8]);
    fn write_u32(&self, addr: u32, value: u32);

    /// Memory-tracking notification for a write performed by the replay.
    fn notify_write(&self, addr: u32, size: u32, tag: &str);

    /// Allocates emulated user memory; `None` when exhausted.
    fn alloc(&self, size: u32, from_top: bool, tag: &str) -> Option<u32>;
    fn free(&self, addr: u32);
}

/// The GPU engine's public operations, as consumed by the replay.
pub trait GeEngine: Send + Sync {
    /// Enqueues a new display list. Returns the list id and whether list
    /// execution was resumed by the enqueue.
    fn enqueue_list(&self, list_addr: u32, stall_addr: u32) -> (u32, bool);

    /// Moves the stall pointer of a running list. Returns whether list
    /// execution was resumed.
    fn update_stall(&self, list_id: u32, stall_addr: u32) -> bool;

    fn list_sync(&self, list_id: u32, mode: u32);
    fn reapply_gfx_state(&self);

    /// Restores the full register state from a dump snapshot.
    fn restore_gfx_state(&self, snapshot: &[u8]);

    /// Live transfer-source-width register word. Only meaningful after the
    /// list has been drained up to the current position.
    fn transfer_src_width(&self) -> u32;

    fn set_addr_translation(&self, value: u32);
    fn set_interrupts_enabled(&self, enabled: bool);

    /// Ticks at which the list is expected to finish, if known.
    fn list_ticks(&self, list_id: u32) -> Option<u64>;

    fn perform_memory_set(&self, dest: u32, value: u8, size: u32);
    fn perform_write_color_from_memory(&self, dest: u32, size: u32);
}

/// Scheduler and display hooks on the primary context's side.
pub trait ReplayHost: Send + Sync {
    fn now_ticks(&self) -> u64;

    /// Charges already-elapsed GE time against the current timeslice.
    fn consume_downcount(&self, ticks: u64);

    fn eat_cycles(&self, cycles: u32);
    fn force_reschedule_check(&self);

    /// Splits the current call over GE execution after an action resumed the
    /// list, so the GE gets to run before the caller continues.
    fn defer_to_ge(&self);

    /// Applies a display configuration. `latched` selects the next-vsync
    /// surface; `false` flips the active surface immediately.
    fn set_framebuf(&self, top_addr: u32, line_size: u32, pixel_format: u32, latched: bool);

    /// Surfaces the dump's game identifier (window title, game database).
    fn on_game_identified(&self, game_id: &str) {
        let _ = game_id;
    }

    /// Splices the fixed bootstrap program that re-invokes the replay entry
    /// point once per display refresh. The instruction sequence itself is the
    /// host's concern.
    fn install_bootstrap(&self, code_start: u32);
}

pub trait ReplayEnv: GuestMemory + GeEngine + ReplayHost {}

impl<T: GuestMemory + GeEngine + ReplayHost + ?Sized> ReplayEnv for T {}

/// Replay-relevant host configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayConfig {
    /// Software rasterizer active; render-target aliases must not be stomped
    /// by direct CLUT/framebuffer uploads.
    pub software_rendering: bool,
}

/// Contiguous `Vec`-backed guest RAM with a first-fit allocator.
///
/// For tests and lightweight embedders; real emulators implement
/// [`GuestMemory`] over their own memory subsystem.
pub struct VecGuestRam {
    base: u32,
    vram: std::ops::Range<u32>,
    inner: Mutex<RamInner>,
}

struct RamInner {
    bytes: Vec<u8>,
    // (addr, size), sorted by addr.
    allocs: Vec<(u32, u32)>,
}

impl VecGuestRam {
    pub fn new(base: u32, size: u32) -> VecGuestRam {
        VecGuestRam {
            base,
            vram: 0..0,
            inner: Mutex::new(RamInner {
                bytes: vec![0u8; size as usize],
                allocs: Vec::new(),
            }),
        }
    }

    /// Marks an address range as VRAM for [`GuestMemory::is_vram_address`].
    /// The range must lie inside the backing RAM to be writable.
    pub fn with_vram(mut self, vram: std::ops::Range<u32>) -> VecGuestRam {
        self.vram = vram;
        self
    }

    pub fn read_bytes(&self, addr: u32, len: u32) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let start = (addr - self.base) as usize;
        inner.bytes[start..start + len as usize].to_vec()
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let bytes = self.read_bytes(addr, 4);
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    fn size(&self) -> u32 {
        self.inner.lock().unwrap().bytes.len() as u32
    }
}

impl GuestMemory for VecGuestRam {
    fn is_valid_range(&self, addr: u32, size: u32) -> bool {
        let end = match addr.checked_add(size) {
            Some(end) => end,
            None => return false,
        };
        addr >= self.base && end <= self.base + self.size()
    }

    fn is_vram_address(&self, addr: u32) -> bool {
        self.vram.contains(&addr)
    }

    fn write_bytes(&self, addr: u32, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let start = (addr - self.base) as usize;
        inner.bytes[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn write_u32(&self, addr: u32, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    fn notify_write(&self, _addr: u32, _size: u32, _tag: &str) {}

    fn alloc(&self, size: u32, from_top: bool, _tag: &str) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let total = self.size();
        let mut inner = self.inner.lock().unwrap();

        // Gap scan over the sorted allocation list.
        let mut gaps = Vec::new();
        let mut cursor = self.base;
        for &(addr, alloc_size) in &inner.allocs {
            if addr > cursor {
                gaps.push(cursor..addr);
            }
            cursor = addr + alloc_size;
        }
        if cursor < self.base + total {
            gaps.push(cursor..self.base + total);
        }

        let fit = if from_top {
            gaps.iter()
                .rev()
                .find(|gap| gap.end - gap.start >= size)
                .map(|gap| gap.end - size)
        } else {
            gaps.iter()
                .find(|gap| gap.end - gap.start >= size)
                .map(|gap| gap.start)
        };

        let addr = fit?;
        inner.allocs.push((addr, size));
        inner.allocs.sort_unstable_by_key(|&(a, _)| a);
        Some(addr)
    }

    fn free(&self, addr: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.allocs.retain(|&(a, _)| a != addr);
    }
}

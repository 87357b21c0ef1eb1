//! Recording [`ReplayEnv`] mock shared by the unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::env::{GeEngine, GuestMemory, ReplayHost, VecGuestRam};
use crate::ops::{OpKind, OpSlot, Operation};

/// Guest RAM plus a record of every engine/host call the replay makes.
pub struct MockEnv {
    pub ram: VecGuestRam,
    max_write_end: AtomicU64,
    notified: Mutex<Vec<(u32, u32)>>,
    memory_sets: Mutex<Vec<(u32, u8, u32)>>,
    pub addr_translations: Mutex<Vec<u32>>,
}

impl MockEnv {
    pub const RAM_BASE: u32 = 0x0880_0000;
    pub const RAM_SIZE: u32 = 0x0180_0000;
    /// A VRAM-flagged window inside the backing RAM so direct writes land.
    pub const VRAM_BASE: u32 = 0x0890_0000;
    pub const VRAM_SIZE: u32 = 0x0010_0000;

    pub fn new() -> MockEnv {
        MockEnv {
            ram: VecGuestRam::new(Self::RAM_BASE, Self::RAM_SIZE)
                .with_vram(Self::VRAM_BASE..Self::VRAM_BASE + Self::VRAM_SIZE),
            max_write_end: AtomicU64::new(0),
            notified: Mutex::new(Vec::new()),
            memory_sets: Mutex::new(Vec::new()),
            addr_translations: Mutex::new(Vec::new()),
        }
    }

    pub fn notified_writes(&self) -> Vec<(u32, u32)> {
        self.notified.lock().unwrap().clone()
    }

    pub fn memory_sets(&self) -> Vec<(u32, u8, u32)> {
        self.memory_sets.lock().unwrap().clone()
    }

    pub fn max_write_end(&self) -> u64 {
        self.max_write_end.load(Ordering::Relaxed)
    }

    fn track_write(&self, addr: u32, len: usize) {
        self.max_write_end
            .fetch_max(addr as u64 + len as u64, Ordering::Relaxed);
    }
}

impl GuestMemory for MockEnv {
    fn is_valid_range(&self, addr: u32, size: u32) -> bool {
        self.ram.is_valid_range(addr, size)
    }

    fn is_vram_address(&self, addr: u32) -> bool {
        self.ram.is_vram_address(addr)
    }

    fn write_bytes(&self, addr: u32, bytes: &[u8]) {
        self.track_write(addr, bytes.len());
        self.ram.write_bytes(addr, bytes);
    }

    fn write_u32(&self, addr: u32, value: u32) {
        self.track_write(addr, 4);
        self.ram.write_u32(addr, value);
    }

    fn notify_write(&self, addr: u32, size: u32, _tag: &str) {
        self.notified.lock().unwrap().push((addr, size));
    }

    fn alloc(&self, size: u32, from_top: bool, tag: &str) -> Option<u32> {
        self.ram.alloc(size, from_top, tag)
    }

    fn free(&self, addr: u32) {
        self.ram.free(addr);
    }
}

impl GeEngine for MockEnv {
    fn enqueue_list(&self, _list_addr: u32, _stall_addr: u32) -> (u32, bool) {
        (1, false)
    }

    fn update_stall(&self, _list_id: u32, _stall_addr: u32) -> bool {
        false
    }

    fn list_sync(&self, _list_id: u32, _mode: u32) {}
    fn reapply_gfx_state(&self) {}
    fn restore_gfx_state(&self, _snapshot: &[u8]) {}

    fn transfer_src_width(&self) -> u32 {
        0xB300_0200
    }

    fn set_addr_translation(&self, value: u32) {
        self.addr_translations.lock().unwrap().push(value);
    }

    fn set_interrupts_enabled(&self, _enabled: bool) {}

    fn list_ticks(&self, _list_id: u32) -> Option<u64> {
        None
    }

    fn perform_memory_set(&self, dest: u32, value: u8, size: u32) {
        self.memory_sets.lock().unwrap().push((dest, value, size));
    }

    fn perform_write_color_from_memory(&self, _dest: u32, _size: u32) {}
}

impl ReplayHost for MockEnv {
    fn now_ticks(&self) -> u64 {
        0
    }

    fn consume_downcount(&self, _ticks: u64) {}
    fn eat_cycles(&self, _cycles: u32) {}
    fn force_reschedule_check(&self) {}
    fn defer_to_ge(&self) {}

    fn set_framebuf(&self, _top_addr: u32, _line_size: u32, _pixel_format: u32, _latched: bool) {}

    fn install_bootstrap(&self, _code_start: u32) {}
}

/// Plays the primary context: completes every operation until `Done` (or
/// cancellation) and returns the observed sequence. `EnqueueList` is answered
/// with list id 1.
pub fn drive_ops(slot: Arc<OpSlot>) -> JoinHandle<Vec<Operation>> {
    thread::spawn(move || {
        let mut observed = Vec::new();
        while let Some(op) = slot.wait_for_op() {
            observed.push(op);
            let ret = if op.kind == OpKind::EnqueueList { 1 } else { 0 };
            slot.complete(ret);
            if op.kind == OpKind::Done {
                break;
            }
        }
        observed
    })
}

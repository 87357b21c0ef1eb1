//! Shared harness: a recording host environment and a dump writer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use ge_dump::{Command, COMPRESSION_CUTOVER_VERSION, DUMP_MAGIC, GAME_ID_SIZE};
use ge_replay::{GeEngine, GuestMemory, ReplayHost, VecGuestRam};

pub struct RecordingEnv {
    pub ram: VecGuestRam,
    pub enqueues: AtomicU32,
    pub stalls: AtomicU32,
    pub list_syncs: AtomicU32,
    pub reapplies: AtomicU32,
    pub restores: AtomicU32,
    pub cycles: Mutex<Vec<u32>>,
    pub framebufs: Mutex<Vec<(u32, u32, u32, bool)>>,
    pub game_ids: Mutex<Vec<String>>,
}

impl RecordingEnv {
    pub const RAM_BASE: u32 = 0x0880_0000;
    pub const RAM_SIZE: u32 = 0x0180_0000;
    pub const VRAM_BASE: u32 = 0x0890_0000;

    pub fn new() -> RecordingEnv {
        RecordingEnv {
            ram: VecGuestRam::new(Self::RAM_BASE, Self::RAM_SIZE)
                .with_vram(Self::VRAM_BASE..Self::VRAM_BASE + 0x0010_0000),
            enqueues: AtomicU32::new(0),
            stalls: AtomicU32::new(0),
            list_syncs: AtomicU32::new(0),
            reapplies: AtomicU32::new(0),
            restores: AtomicU32::new(0),
            cycles: Mutex::new(Vec::new()),
            framebufs: Mutex::new(Vec::new()),
            game_ids: Mutex::new(Vec::new()),
        }
    }
}

impl GuestMemory for RecordingEnv {
    fn is_valid_range(&self, addr: u32, size: u32) -> bool {
        self.ram.is_valid_range(addr, size)
    }

    fn is_vram_address(&self, addr: u32) -> bool {
        self.ram.is_vram_address(addr)
    }

    fn write_bytes(&self, addr: u32, bytes: &[u8]) {
        self.ram.write_bytes(addr, bytes);
    }

    fn write_u32(&self, addr: u32, value: u32) {
        self.ram.write_u32(addr, value);
    }

    fn notify_write(&self, _addr: u32, _size: u32, _tag: &str) {}

    fn alloc(&self, size: u32, from_top: bool, tag: &str) -> Option<u32> {
        self.ram.alloc(size, from_top, tag)
    }

    fn free(&self, addr: u32) {
        self.ram.free(addr);
    }
}

impl GeEngine for RecordingEnv {
    fn enqueue_list(&self, _list_addr: u32, _stall_addr: u32) -> (u32, bool) {
        self.enqueues.fetch_add(1, Ordering::Relaxed);
        (1, false)
    }

    fn update_stall(&self, _list_id: u32, _stall_addr: u32) -> bool {
        self.stalls.fetch_add(1, Ordering::Relaxed);
        false
    }

    fn list_sync(&self, _list_id: u32, _mode: u32) {
        self.list_syncs.fetch_add(1, Ordering::Relaxed);
    }

    fn reapply_gfx_state(&self) {
        self.reapplies.fetch_add(1, Ordering::Relaxed);
    }

    fn restore_gfx_state(&self, _snapshot: &[u8]) {
        self.restores.fetch_add(1, Ordering::Relaxed);
    }

    fn transfer_src_width(&self) -> u32 {
        0xB300_0200
    }

    fn set_addr_translation(&self, _value: u32) {}
    fn set_interrupts_enabled(&self, _enabled: bool) {}

    fn list_ticks(&self, _list_id: u32) -> Option<u64> {
        None
    }

    fn perform_memory_set(&self, _dest: u32, _value: u8, _size: u32) {}
    fn perform_write_color_from_memory(&self, _dest: u32, _size: u32) {}
}

impl ReplayHost for RecordingEnv {
    fn now_ticks(&self) -> u64 {
        0
    }

    fn consume_downcount(&self, _ticks: u64) {}

    fn eat_cycles(&self, cycles: u32) {
        self.cycles.lock().unwrap().push(cycles);
    }

    fn force_reschedule_check(&self) {}
    fn defer_to_ge(&self) {}

    fn set_framebuf(&self, top_addr: u32, line_size: u32, pixel_format: u32, latched: bool) {
        self.framebufs
            .lock()
            .unwrap()
            .push((top_addr, line_size, pixel_format, latched));
    }

    fn on_game_identified(&self, game_id: &str) {
        self.game_ids.lock().unwrap().push(game_id.to_string());
    }

    fn install_bootstrap(&self, _code_start: u32) {}
}

/// Serializes a dump the way the recorder side of the tooling would.
pub fn write_dump(version: u32, game_id: &[u8], commands: &[Command], pushbuf: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&DUMP_MAGIC);
    out.extend_from_slice(&version.to_le_bytes());
    if version > 3 {
        let mut id = [0u8; GAME_ID_SIZE];
        id[..game_id.len()].copy_from_slice(game_id);
        out.extend_from_slice(&id);
    }
    out.extend_from_slice(&(commands.len() as u32).to_le_bytes());
    out.extend_from_slice(&(pushbuf.len() as u32).to_le_bytes());

    let mut command_bytes = Vec::new();
    for cmd in commands {
        command_bytes.extend_from_slice(&cmd.encode());
    }
    write_block(&mut out, version, &command_bytes);
    write_block(&mut out, version, pushbuf);
    out
}

fn write_block(out: &mut Vec<u8>, version: u32, data: &[u8]) {
    let compressed = if version < COMPRESSION_CUTOVER_VERSION {
        data.to_vec()
    } else {
        lz4_flex::block::compress(data)
    };
    out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
}

/// Writes a dump into `dir` and returns its path.
pub fn write_dump_file(
    dir: &tempfile::TempDir,
    name: &str,
    version: u32,
    game_id: &[u8],
    commands: &[Command],
    pushbuf: &[u8],
) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, write_dump(version, game_id, commands, pushbuf)).unwrap();
    path
}

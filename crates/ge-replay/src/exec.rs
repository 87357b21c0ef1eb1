//! Sequential interpreter over a dump's command table.
//!
//! Runs on the replay worker thread. Each command either has an immediate
//! local effect (direct VRAM writes) or appends hardware-format words to a
//! display list reconstructed in guest memory, wrapping ring-buffer style
//! when the list buffer fills. Anything that must execute on the primary
//! context goes through the [`OpSlot`] rendezvous.

use std::sync::Arc;

use ge_dump::{CommandType, Dump, UNCHANGED_VRAM_MIN_VERSION};
use tracing::{error, trace, warn};

use crate::env::{ReplayConfig, ReplayEnv};
use crate::ge::{
    base_word, op, GE_CMD_BASE, GE_CMD_CLUTADDR, GE_CMD_CLUTADDRUPPER, GE_CMD_END, GE_CMD_FINISH,
    GE_CMD_JUMP, GE_CMD_NOP, GE_CMD_SIGNAL, GE_CMD_TEXADDR0, GE_CMD_TEXADDR7, GE_CMD_TEXBUFWIDTH0,
    GE_CMD_TEXBUFWIDTH7, GE_CMD_TRANSFERSRC, GE_CMD_VADDR, GE_CMD_IADDR,
};
use crate::mapping::BufMapping;
use crate::ops::{OpKind, OpSlot, Operation};

/// Reconstructed display-list buffer size.
pub const LIST_BUF_SIZE: u32 = 256 * 1024;

/// Default EDRAM address-translation base, re-applied before every run.
const DEFAULT_EDRAM_TRANSLATION: u32 = 0x400;

const TEX_UNITS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Cancelled,
    /// An unknown command tag ended the replay early.
    Error,
}

pub struct DumpExecutor<E: ReplayEnv> {
    dump: Arc<Dump>,
    env: Arc<E>,
    ops: Arc<OpSlot>,
    config: ReplayConfig,
    mapping: BufMapping,

    list_buf_size: u32,
    list_buf: u32,
    list_pos: u32,
    list_id: u32,
    /// Words queued for the next Registers append.
    list_queue: Vec<u32>,

    memcpy_dest: u32,
    clut_addr: u32,
    clut_flags: u32,

    last_bufw: [u16; TEX_UNITS],
    last_tex: [u32; TEX_UNITS],
    last_base: u32,
}

impl<E: ReplayEnv> DumpExecutor<E> {
    pub fn new(dump: Arc<Dump>, env: Arc<E>, ops: Arc<OpSlot>, config: ReplayConfig) -> Self {
        DumpExecutor {
            dump,
            env,
            ops,
            config,
            mapping: BufMapping::new(),
            list_buf_size: LIST_BUF_SIZE,
            list_buf: 0,
            list_pos: 0,
            list_id: 0,
            list_queue: Vec::new(),
            memcpy_dest: 0,
            clut_addr: 0,
            clut_flags: 0,
            last_bufw: [0; TEX_UNITS],
            last_tex: [0; TEX_UNITS],
            last_base: 0xFFFF_FFFF,
        }
    }

    /// Shrinks the list buffer so ring wrap-around is reachable in tests.
    #[doc(hidden)]
    pub fn with_list_buf_size(mut self, size: u32) -> Self {
        self.list_buf_size = size;
        self
    }

    pub fn run(&mut self) -> RunOutcome {
        self.env.set_addr_translation(DEFAULT_EDRAM_TRANSLATION);

        let dump = Arc::clone(&self.dump);
        let mut cancelled = false;
        for (index, cmd) in dump.commands.iter().enumerate() {
            if self.ops.is_cancelled() {
                cancelled = true;
                break;
            }

            let Some(kind) = cmd.kind() else {
                error!(tag = cmd.raw_kind, index, "unsupported dump command, aborting replay");
                return RunOutcome::Error;
            };
            let is_last = index + 1 == dump.commands.len();
            self.dispatch(kind, cmd.offset, cmd.size, is_last);
        }

        self.submit_list_end();
        if cancelled {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Done
        }
    }

    fn dispatch(&mut self, kind: CommandType, offset: u32, size: u32, is_last: bool) {
        trace!(?kind, offset, size, "replay command");
        match kind {
            CommandType::Init => self.init(offset, size),
            CommandType::Registers => self.registers(offset, size),
            CommandType::Vertices => self.vertices(offset, size),
            CommandType::Indices => self.indices(offset, size),
            CommandType::ClutAddr => self.clut_addr(offset, size),
            CommandType::Clut => self.clut(offset, size),
            CommandType::TransferSrc => self.transfer_src(offset, size),
            CommandType::Memset => self.memset(offset, size),
            CommandType::MemcpyDest => self.memcpy_dest(offset, size),
            CommandType::MemcpyData => self.memcpy_data(offset, size),
            CommandType::EdramTranslation => self.edram_translation(offset, size),
            CommandType::Texture(unit) => self.texture(unit, offset, size),
            CommandType::Framebuffer(unit) => self.framebuf(unit, offset, size),
            CommandType::Display => self.display(offset, size, is_last),
        }
    }

    /// Stalls the GE at the current write position and charges the elapsed
    /// list time against the worker's timeslice.
    fn sync_stall(&self) {
        sync_stall_inner(
            &*self.env,
            &self.ops,
            self.list_buf,
            self.list_id,
            self.list_pos,
        );
    }

    /// Maps a pushbuffer range, stalling first if a window must be evicted.
    fn map(&mut self, offset: u32, size: u32) -> u32 {
        let env = Arc::clone(&self.env);
        let ops = Arc::clone(&self.ops);
        let (list_buf, list_id, list_pos) = (self.list_buf, self.list_id, self.list_pos);
        self.mapping.map(
            &*self.env,
            &self.dump.pushbuf,
            offset,
            size,
            &mut || sync_stall_inner(&*env, &ops, list_buf, list_id, list_pos),
        )
    }

    fn payload(&self, offset: u32, size: u32) -> &[u8] {
        // Ranges were validated against the pushbuffer at load.
        &self.dump.pushbuf[offset as usize..offset as usize + size as usize]
    }

    fn queue_base(&mut self, addr: u32) {
        if self.last_base != (addr & 0xFF00_0000) {
            self.list_queue.push(base_word(addr));
            self.last_base = addr & 0xFF00_0000;
        }
    }

    fn init(&mut self, offset: u32, size: u32) {
        let snapshot = self.payload(offset, size);
        self.env.restore_gfx_state(snapshot);
        self.ops.execute_on_main(Operation {
            kind: OpKind::ReapplyGfxState,
            list_id: 0,
            param: 0,
        });

        // Force the next texture/framebuffer bind to re-emit address and
        // stride instead of assuming they are current.
        self.last_bufw = [0; TEX_UNITS];
        self.last_tex = [0; TEX_UNITS];
        self.last_base = 0xFFFF_FFFF;
    }

    fn registers(&mut self, offset: u32, size: u32) {
        if self.list_buf == 0 && !self.open_list() {
            return;
        }

        let pending = (self.list_queue.len() * 4) as u32;
        // Space for the payload plus the base+jump reserve.
        let needed = pending + size + 8;
        if self.list_pos + needed >= self.list_buf + self.list_buf_size {
            self.env.write_u32(self.list_pos, base_word(self.list_buf));
            self.env
                .write_u32(self.list_pos + 4, op(GE_CMD_JUMP, self.list_buf));
            self.list_pos = self.list_buf;
            self.last_base = self.list_buf & 0xFF00_0000;

            // Don't continue until the consumer has stalled behind us.
            self.sync_stall();
        }

        let mut words: Vec<u32> = self.list_queue.drain(..).collect();
        let dump = Arc::clone(&self.dump);
        let payload = &dump.pushbuf[offset as usize..offset as usize + size as usize];
        for chunk in payload.chunks_exact(4) {
            words.push(self.rewrite_register_word(u32::from_le_bytes(chunk.try_into().unwrap())));
        }

        let mut bytes = Vec::with_capacity(words.len() * 4 + payload.len() % 4);
        for word in &words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.extend_from_slice(payload.chunks_exact(4).remainder());
        self.env.write_bytes(self.list_pos, &bytes);
        self.list_pos += bytes.len() as u32;
    }

    /// Allocates and registers the reconstructed display list.
    fn open_list(&mut self) -> bool {
        let Some(buf) = self.env.alloc(self.list_buf_size, true, "GE replay list") else {
            error!("unable to allocate for display list");
            return false;
        };
        self.list_buf = buf;
        self.list_pos = buf;
        self.env.write_u32(self.list_pos, op(GE_CMD_NOP, 0));
        self.list_pos += 4;

        // Keep interrupts off across registration so nothing observes the
        // half-initialized list.
        self.env.set_interrupts_enabled(false);
        self.list_id = self.ops.execute_on_main(Operation {
            kind: OpKind::EnqueueList,
            list_id: self.list_buf,
            param: self.list_pos,
        });
        self.env.set_interrupts_enabled(true);
        true
    }

    /// Rewrites one raw register word before it reaches the list.
    ///
    /// Texture strides matching the cached value become NOPs (the hardware
    /// would treat them as redundant, and they'd force a pipeline flush);
    /// texture addresses become NOPs unconditionally since real addresses
    /// come from the mapper, and the word is only used to learn the expected
    /// stride for the next comparison.
    fn rewrite_register_word(&mut self, word: u32) -> u32 {
        let cmd = word >> 24;
        let mut word = word;

        if (GE_CMD_TEXBUFWIDTH0..=GE_CMD_TEXBUFWIDTH7).contains(&cmd) {
            let unit = (cmd - GE_CMD_TEXBUFWIDTH0) as usize;
            let bufw = (word & 0xFFFF) as u16;
            if bufw == self.last_bufw[unit] {
                word = GE_CMD_NOP << 24;
            } else {
                word = (cmd << 24) | ((self.last_tex[unit] & 0xFF00_0000) >> 8) | bufw as u32;
            }
            self.last_bufw[unit] = bufw;
        }

        if (GE_CMD_TEXADDR0..=GE_CMD_TEXADDR7).contains(&cmd) {
            word = GE_CMD_NOP << 24;
        }
        if cmd == GE_CMD_SIGNAL || cmd == GE_CMD_BASE {
            self.last_base = 0xFFFF_FFFF;
        }
        word
    }

    fn vertices(&mut self, offset: u32, size: u32) {
        let addr = self.map(offset, size);
        if addr == 0 {
            error!("unable to allocate for vertices");
            return;
        }
        self.queue_base(addr);
        self.list_queue.push(op(GE_CMD_VADDR, addr));
    }

    fn indices(&mut self, offset: u32, size: u32) {
        let addr = self.map(offset, size);
        if addr == 0 {
            error!("unable to allocate for indices");
            return;
        }
        self.queue_base(addr);
        self.list_queue.push(op(GE_CMD_IADDR, addr));
    }

    fn clut_addr(&mut self, offset: u32, size: u32) {
        if size < 8 {
            warn!(size, "short clut-addr payload");
            return;
        }
        let data = self.payload(offset, size);
        let (addr, flags) = (read_u32(data, 0), read_u32(data, 4));
        self.clut_addr = addr;
        self.clut_flags = flags;
    }

    fn clut(&mut self, offset: u32, size: u32) {
        if self.clut_addr != 0 {
            // Palette upload behaves as a memory side effect, not a list
            // operation; copy it straight in.
            let is_target = self.clut_flags & 1 != 0;
            if self.env.is_valid_range(self.clut_addr, size)
                && (!is_target || !self.config.software_rendering)
            {
                let addr = self.clut_addr;
                self.env.write_bytes(addr, self.payload(offset, size));
                self.env.notify_write(addr, size, "ReplayClut");
            }
            self.clut_addr = 0;
        } else {
            let addr = self.map(offset, size);
            if addr == 0 {
                error!("unable to allocate for clut");
                return;
            }
            self.list_queue
                .push((GE_CMD_CLUTADDRUPPER << 24) | ((addr >> 8) & 0x00FF_0000));
            self.list_queue.push(op(GE_CMD_CLUTADDR, addr));
        }
    }

    fn transfer_src(&mut self, offset: u32, size: u32) {
        let addr = self.map(offset, size);
        if addr == 0 {
            error!("unable to allocate for transfer");
            return;
        }

        // The transfer-source-width register must be read from live state,
        // not from the captured stream.
        self.sync_stall();

        let width_word = (self.env.transfer_src_width() & 0xFF00_FFFF) | ((addr >> 8) & 0x00FF_0000);
        self.list_queue.push(width_word);
        self.list_queue.push(op(GE_CMD_TRANSFERSRC, addr));
    }

    fn memset(&mut self, offset: u32, size: u32) {
        if size < 12 {
            warn!(size, "short memset payload");
            return;
        }
        let data = self.payload(offset, size);
        let dest = read_u32(data, 0);
        let value = read_u32(data, 4);
        let fill_size = read_u32(data, 8);

        // Block fills onto video memory are out-of-band device operations,
        // not list-driven drawing.
        if self.env.is_vram_address(dest) {
            self.sync_stall();
            self.env.perform_memory_set(dest, value as u8, fill_size);
        }
    }

    fn memcpy_dest(&mut self, offset: u32, size: u32) {
        if size < 4 {
            warn!(size, "short memcpy-dest payload");
            return;
        }
        self.memcpy_dest = read_u32(self.payload(offset, size), 0);
    }

    fn memcpy_data(&mut self, offset: u32, size: u32) {
        if self.env.is_vram_address(self.memcpy_dest) {
            self.sync_stall();
            let dest = self.memcpy_dest;
            self.env.write_bytes(dest, self.payload(offset, size));
            self.env.notify_write(dest, size, "ReplayMemcpy");
            self.env.perform_write_color_from_memory(dest, size);
        }
    }

    fn texture(&mut self, unit: usize, offset: u32, size: u32) {
        let addr = self.map(offset, size);
        if addr == 0 {
            error!(unit, "unable to allocate for texture");
            return;
        }

        if self.last_tex[unit] != addr {
            let bufw_cmd = GE_CMD_TEXBUFWIDTH0 + unit as u32;
            let addr_cmd = GE_CMD_TEXADDR0 + unit as u32;
            self.list_queue
                .push((bufw_cmd << 24) | ((addr >> 8) & 0x00FF_0000) | self.last_bufw[unit] as u32);
            self.list_queue.push(op(addr_cmd, addr));
            self.last_tex[unit] = addr;
        }
    }

    fn framebuf(&mut self, unit: usize, offset: u32, size: u32) {
        const HEADER_SIZE: u32 = 16;
        if size < HEADER_SIZE {
            warn!(size, "short framebuffer payload");
            return;
        }
        let data = self.payload(offset, size);
        let addr = read_u32(data, 0);
        let bufw = read_u32(data, 4);
        let flags = read_u32(data, 8);
        // data[12..16] padding

        // Framebuffers must alias real video memory, not a mapper window, so
        // the literal captured address goes into the list.
        if self.last_tex[unit] != addr || self.last_bufw[unit] != bufw as u16 {
            let bufw_cmd = GE_CMD_TEXBUFWIDTH0 + unit as u32;
            let addr_cmd = GE_CMD_TEXADDR0 + unit as u32;
            self.list_queue
                .push((bufw_cmd << 24) | ((addr >> 8) & 0x00FF_0000) | (bufw & 0xFFFF));
            self.list_queue.push(op(addr_cmd, addr));
            self.last_tex[unit] = addr;
            self.last_bufw[unit] = bufw as u16;
        }

        // Materialize the contents into VRAM even if no draw touches them.
        let payload_size = size - HEADER_SIZE;
        let is_target = flags & 1 != 0;
        let unchanged_vram = self.dump.version >= UNCHANGED_VRAM_MIN_VERSION && flags & 2 != 0;
        if self.env.is_valid_range(addr, payload_size)
            && !unchanged_vram
            && (!is_target || !self.config.software_rendering)
        {
            let contents = &self.dump.pushbuf
                [(offset + HEADER_SIZE) as usize..(offset + size) as usize];
            self.env.write_bytes(addr, contents);
            self.env.notify_write(addr, payload_size, "ReplayTex");
        }
    }

    fn display(&mut self, offset: u32, size: u32, allow_flip: bool) {
        if size < 12 {
            warn!(size, "short display payload");
            return;
        }
        let data = self.payload(offset, size);
        let top_addr = read_u32(data, 0);
        let line_size = read_u32(data, 4);
        let pixel_format = read_u32(data, 8);

        // Sync up drawing before touching the display.
        self.sync_stall();

        self.env.set_framebuf(top_addr, line_size, pixel_format, true);
        if allow_flip {
            self.env.set_framebuf(top_addr, line_size, pixel_format, false);
        }
    }

    fn edram_translation(&mut self, offset: u32, size: u32) {
        if size < 4 {
            warn!(size, "short edram-translation payload");
            return;
        }
        let value = read_u32(self.payload(offset, size), 0);
        self.sync_stall();
        self.env.set_addr_translation(value);
    }

    /// Closes the reconstructed list: end marker, final stall, blocking sync.
    fn submit_list_end(&mut self) {
        if self.list_pos == 0 || self.ops.is_cancelled() {
            return;
        }

        // There's always space for the end marker; the wrap check reserves
        // exactly this much.
        self.env.write_u32(self.list_pos, op(GE_CMD_FINISH, 0));
        self.env.write_u32(self.list_pos + 4, op(GE_CMD_END, 0));
        self.list_pos += 8;

        self.last_tex = [0; TEX_UNITS];
        self.last_base = 0xFFFF_FFFF;

        self.sync_stall();
        self.ops.execute_on_main(Operation {
            kind: OpKind::ListSync,
            list_id: self.list_id,
            param: 0,
        });
    }
}

impl<E: ReplayEnv> Drop for DumpExecutor<E> {
    fn drop(&mut self) {
        self.memcpy_dest = 0;
        if self.list_buf != 0 {
            self.env.free(self.list_buf);
            self.list_buf = 0;
        }
        self.list_pos = 0;
        self.mapping.reset(&*self.env);
    }
}

fn sync_stall_inner<E: ReplayEnv + ?Sized>(
    env: &E,
    ops: &OpSlot,
    list_buf: u32,
    list_id: u32,
    list_pos: u32,
) {
    if list_buf == 0 {
        trace!("sync stall: no active display list");
        return;
    }

    ops.execute_on_main(Operation {
        kind: OpKind::UpdateStall,
        list_id,
        param: list_pos,
    });

    if let Some(list_ticks) = env.list_ticks(list_id) {
        let now = env.now_ticks();
        if list_ticks > now {
            env.consume_downcount(list_ticks - now);
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

//! On-disk dump layout.
//!
//! All integers are little-endian. The file is:
//!
//! ```text
//! magic[8]  version:u32  game_id[12]          (header; 12 bytes total for version <= 3,
//!                                              which predates the game_id field)
//! command_count:u32  pushbuf_size:u32
//! compressed_len:u32  compressed bytes        (command table, command_count * 12 bytes)
//! compressed_len:u32  compressed bytes        (pushbuffer, pushbuf_size bytes)
//! ```
//!
//! Payload blocks are stored raw below [`COMPRESSION_CUTOVER_VERSION`] and
//! LZ4-block-compressed at/after it. Either way the decompressed length must
//! match the declared size exactly or the dump is treated as truncated.

pub const DUMP_MAGIC: [u8; 8] = *b"GEDUMPV1";

/// Newest dump version this loader understands.
pub const DUMP_VERSION: u32 = 8;
/// Oldest dump version still supported.
pub const MIN_DUMP_VERSION: u32 = 2;

/// Versions below this store payload blocks raw; at/after, LZ4.
pub const COMPRESSION_CUTOVER_VERSION: u32 = 5;
/// The Framebuffer "contents unchanged in VRAM" flag is only trustworthy from
/// this version on; older recorders set it unreliably.
pub const UNCHANGED_VRAM_MIN_VERSION: u32 = 6;

pub const GAME_ID_SIZE: usize = 12;
pub const DUMP_HEADER_SIZE: u64 = 24;
/// Header size for version <= 3 dumps (magic + version only).
pub const LEGACY_DUMP_HEADER_SIZE: u64 = 12;

/// Size of one serialized command-table record.
pub const COMMAND_RECORD_SIZE: usize = 12;

/// Replay command tags.
///
/// The order of commands in the table is the required replay order; later
/// commands depend on state established by earlier ones (bound textures, CLUT
/// address, memcpy destination).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandType {
    /// Full GPU register snapshot to restore before anything else.
    Init,
    /// Raw register/display-list words to splice into the reconstructed list.
    Registers,
    Vertices,
    Indices,
    /// `{ addr: u32, flags: u32 }` destination for a following `Clut`.
    ClutAddr,
    Clut,
    TransferSrc,
    /// `{ dest: u32, value: u32, size: u32 }` block fill.
    Memset,
    MemcpyDest,
    MemcpyData,
    /// New EDRAM address-translation base (u32).
    EdramTranslation,
    /// `{ top_addr: u32, line_size: u32, pixel_format: u32 }` display flip.
    Display,
    /// Texture data for one of the 8 texture units.
    Texture(usize),
    /// Framebuffer-as-texture bind + contents for one of the 8 units.
    Framebuffer(usize),
}

const TAG_INIT: u8 = 0;
const TAG_REGISTERS: u8 = 1;
const TAG_VERTICES: u8 = 2;
const TAG_INDICES: u8 = 3;
const TAG_CLUT_ADDR: u8 = 4;
const TAG_CLUT: u8 = 5;
const TAG_TRANSFER_SRC: u8 = 6;
const TAG_MEMSET: u8 = 7;
const TAG_MEMCPY_DEST: u8 = 8;
const TAG_MEMCPY_DATA: u8 = 9;
const TAG_EDRAM_TRANS: u8 = 10;
const TAG_DISPLAY: u8 = 11;
const TAG_TEXTURE0: u8 = 0x10;
const TAG_FRAMEBUF0: u8 = 0x18;

impl CommandType {
    pub fn from_u8(raw: u8) -> Option<CommandType> {
        Some(match raw {
            TAG_INIT => CommandType::Init,
            TAG_REGISTERS => CommandType::Registers,
            TAG_VERTICES => CommandType::Vertices,
            TAG_INDICES => CommandType::Indices,
            TAG_CLUT_ADDR => CommandType::ClutAddr,
            TAG_CLUT => CommandType::Clut,
            TAG_TRANSFER_SRC => CommandType::TransferSrc,
            TAG_MEMSET => CommandType::Memset,
            TAG_MEMCPY_DEST => CommandType::MemcpyDest,
            TAG_MEMCPY_DATA => CommandType::MemcpyData,
            TAG_EDRAM_TRANS => CommandType::EdramTranslation,
            TAG_DISPLAY => CommandType::Display,
            TAG_TEXTURE0..=0x17 => CommandType::Texture((raw - TAG_TEXTURE0) as usize),
            TAG_FRAMEBUF0..=0x1F => CommandType::Framebuffer((raw - TAG_FRAMEBUF0) as usize),
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        match self {
            CommandType::Init => TAG_INIT,
            CommandType::Registers => TAG_REGISTERS,
            CommandType::Vertices => TAG_VERTICES,
            CommandType::Indices => TAG_INDICES,
            CommandType::ClutAddr => TAG_CLUT_ADDR,
            CommandType::Clut => TAG_CLUT,
            CommandType::TransferSrc => TAG_TRANSFER_SRC,
            CommandType::Memset => TAG_MEMSET,
            CommandType::MemcpyDest => TAG_MEMCPY_DEST,
            CommandType::MemcpyData => TAG_MEMCPY_DATA,
            CommandType::EdramTranslation => TAG_EDRAM_TRANS,
            CommandType::Display => TAG_DISPLAY,
            CommandType::Texture(unit) => TAG_TEXTURE0 + unit as u8,
            CommandType::Framebuffer(unit) => TAG_FRAMEBUF0 + unit as u8,
        }
    }
}

/// One command-table entry: a tag plus the pushbuffer range it references.
///
/// The tag is kept raw so that a dump containing tags newer than this build
/// still loads; the replayer reports the unknown tag at the command where it
/// is reached rather than rejecting the whole file up front.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Command {
    pub raw_kind: u8,
    /// Byte offset into the pushbuffer.
    pub offset: u32,
    /// Byte length of the referenced data.
    pub size: u32,
}

impl Command {
    pub fn new(kind: CommandType, offset: u32, size: u32) -> Command {
        Command {
            raw_kind: kind.to_u8(),
            offset,
            size,
        }
    }

    pub fn kind(&self) -> Option<CommandType> {
        CommandType::from_u8(self.raw_kind)
    }

    pub fn decode(record: &[u8; COMMAND_RECORD_SIZE]) -> Command {
        Command {
            raw_kind: record[0],
            // record[1..4] reserved
            offset: u32::from_le_bytes(record[4..8].try_into().unwrap()),
            size: u32::from_le_bytes(record[8..12].try_into().unwrap()),
        }
    }

    pub fn encode(&self) -> [u8; COMMAND_RECORD_SIZE] {
        let mut out = [0u8; COMMAND_RECORD_SIZE];
        out[0] = self.raw_kind;
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for raw in 0u8..=0xFF {
            if let Some(kind) = CommandType::from_u8(raw) {
                assert_eq!(kind.to_u8(), raw);
            }
        }
        assert_eq!(CommandType::from_u8(0x17), Some(CommandType::Texture(7)));
        assert_eq!(CommandType::from_u8(0x1F), Some(CommandType::Framebuffer(7)));
        assert_eq!(CommandType::from_u8(0x20), None);
    }

    #[test]
    fn record_round_trip() {
        let cmd = Command::new(CommandType::Texture(3), 0x1234, 0x40);
        let decoded = Command::decode(&cmd.encode());
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.kind(), Some(CommandType::Texture(3)));
    }
}

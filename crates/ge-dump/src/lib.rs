//! GE frame-dump container.
//!
//! A dump is a recording of one frame of display-list activity: an ordered
//! command table plus the flat "pushbuffer" holding every byte of data those
//! commands referenced (vertices, textures, register snapshots, ...). This
//! crate owns the on-disk layout and the loader; replaying a dump against a
//! live GE is `ge-replay`'s job.

mod format;
mod reader;

pub use format::{
    Command, CommandType, COMMAND_RECORD_SIZE, COMPRESSION_CUTOVER_VERSION, DUMP_HEADER_SIZE,
    DUMP_MAGIC, DUMP_VERSION, GAME_ID_SIZE, LEGACY_DUMP_HEADER_SIZE, MIN_DUMP_VERSION,
    UNCHANGED_VRAM_MIN_VERSION,
};
pub use reader::{Dump, DumpReadError};

use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::format::{
    Command, COMMAND_RECORD_SIZE, COMPRESSION_CUTOVER_VERSION, DUMP_MAGIC, DUMP_VERSION,
    GAME_ID_SIZE, LEGACY_DUMP_HEADER_SIZE, MIN_DUMP_VERSION,
};

/// Defensive cap on either declared decompressed payload. Dumps record one
/// frame; anything past this is a corrupt length field, not a real dump.
const MAX_DECOMPRESSED_SIZE: u32 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DumpReadError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid dump magic")]
    InvalidMagic,

    #[error("unsupported dump version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated dump: {0}")]
    Truncated(&'static str),

    #[error("lz4 decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
}

/// A fully loaded dump, immutable for the duration of a replay session.
#[derive(Clone, Debug)]
pub struct Dump {
    pub version: u32,
    /// Game identifier from the header, if the dump is new enough to carry
    /// one and the field was non-empty.
    pub game_id: Option<String>,
    pub commands: Vec<Command>,
    pub pushbuf: Vec<u8>,
}

impl Dump {
    pub fn load(path: &Path) -> Result<Dump, DumpReadError> {
        info!("loading GE dump {}", path.display());
        let file = File::open(path)?;
        Self::read(file)
    }

    pub fn read<R: Read + Seek>(mut reader: R) -> Result<Dump, DumpReadError> {
        let mut magic = [0u8; 8];
        read_exact(&mut reader, &mut magic)?;
        if magic != DUMP_MAGIC {
            return Err(DumpReadError::InvalidMagic);
        }

        let version = read_u32(&mut reader)?;
        if !(MIN_DUMP_VERSION..=DUMP_VERSION).contains(&version) {
            return Err(DumpReadError::UnsupportedVersion(version));
        }

        let mut game_id_raw = [0u8; GAME_ID_SIZE];
        read_exact(&mut reader, &mut game_id_raw)?;
        let game_id = if version <= 3 {
            // The identifier field did not exist yet; its bytes overlap the
            // command-count field, so re-seek to the legacy header end.
            reader.seek(SeekFrom::Start(LEGACY_DUMP_HEADER_SIZE))?;
            None
        } else {
            parse_game_id(&game_id_raw)
        };

        let command_count = read_u32(&mut reader)?;
        let pushbuf_size = read_u32(&mut reader)?;

        let commands_size = command_count
            .checked_mul(COMMAND_RECORD_SIZE as u32)
            .ok_or(DumpReadError::Truncated("command table size overflow"))?;
        let command_bytes = read_compressed(&mut reader, commands_size, version)?;
        let pushbuf = read_compressed(&mut reader, pushbuf_size, version)?;

        let commands = command_bytes
            .chunks_exact(COMMAND_RECORD_SIZE)
            .map(|record| Command::decode(record.try_into().unwrap()))
            .collect::<Vec<_>>();

        // Validate every referenced range now so the replayer can slice the
        // pushbuffer without per-command bounds checks.
        for cmd in &commands {
            let end = cmd
                .offset
                .checked_add(cmd.size)
                .ok_or(DumpReadError::Truncated("command range overflow"))?;
            if end as usize > pushbuf.len() {
                return Err(DumpReadError::Truncated("command outside pushbuffer"));
            }
        }

        debug!(
            version,
            commands = commands.len(),
            pushbuf_bytes = pushbuf.len(),
            "dump loaded"
        );
        Ok(Dump {
            version,
            game_id,
            commands,
            pushbuf,
        })
    }
}

/// Reads one length-prefixed payload block and undoes the version's codec.
///
/// Both codecs must reproduce exactly `expected_size` bytes; anything else is
/// a truncated dump.
fn read_compressed<R: Read>(
    reader: &mut R,
    expected_size: u32,
    version: u32,
) -> Result<Vec<u8>, DumpReadError> {
    if expected_size > MAX_DECOMPRESSED_SIZE {
        return Err(DumpReadError::Truncated("declared size implausible"));
    }

    let compressed_size = read_u32(reader)?;
    if compressed_size > MAX_DECOMPRESSED_SIZE {
        return Err(DumpReadError::Truncated("compressed size implausible"));
    }
    let mut compressed = vec![0u8; compressed_size as usize];
    read_exact(reader, &mut compressed)?;

    let data = if version < COMPRESSION_CUTOVER_VERSION {
        compressed
    } else {
        lz4_flex::block::decompress(&compressed, expected_size as usize)?
    };

    if data.len() != expected_size as usize {
        return Err(DumpReadError::Truncated("decompressed size mismatch"));
    }
    Ok(data)
}

fn parse_game_id(raw: &[u8; GAME_ID_SIZE]) -> Option<String> {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    if len == 0 {
        return None;
    }
    std::str::from_utf8(&raw[..len]).ok().map(str::to_owned)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), DumpReadError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            DumpReadError::Truncated("short read")
        } else {
            DumpReadError::Io(err)
        }
    })
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, DumpReadError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

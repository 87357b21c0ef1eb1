//! Display-list word encoding.
//!
//! A list word is `opcode << 24 | argument`, with the argument limited to the
//! low 24 bits. Addresses are split across two words: BASE carries bits
//! 24..32 (shifted into its argument's high byte) and the address-bearing
//! command carries bits 0..24.

pub const GE_CMD_NOP: u32 = 0x00;
pub const GE_CMD_VADDR: u32 = 0x01;
pub const GE_CMD_IADDR: u32 = 0x02;
pub const GE_CMD_JUMP: u32 = 0x08;
pub const GE_CMD_END: u32 = 0x0C;
pub const GE_CMD_SIGNAL: u32 = 0x0E;
pub const GE_CMD_FINISH: u32 = 0x0F;
pub const GE_CMD_BASE: u32 = 0x10;
pub const GE_CMD_TEXADDR0: u32 = 0xA0;
pub const GE_CMD_TEXADDR7: u32 = 0xA7;
pub const GE_CMD_TEXBUFWIDTH0: u32 = 0xA8;
pub const GE_CMD_TEXBUFWIDTH7: u32 = 0xAF;
pub const GE_CMD_CLUTADDR: u32 = 0xB0;
pub const GE_CMD_CLUTADDRUPPER: u32 = 0xB1;
pub const GE_CMD_TRANSFERSRC: u32 = 0xB2;

/// Builds one list word.
#[inline]
pub fn op(cmd: u32, arg: u32) -> u32 {
    (cmd << 24) | (arg & 0x00FF_FFFF)
}

/// BASE word carrying the high byte of `addr`.
#[inline]
pub fn base_word(addr: u32) -> u32 {
    (GE_CMD_BASE << 24) | ((addr >> 8) & 0x00FF_0000)
}

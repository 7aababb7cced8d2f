//! Identification block - the first 0x1000 bytes the cartridge returns to
//! a raw `00` command.
//!
//! ## Fields used by the handshake
//! ```text
//! [+0x00C] Game code                          (u32 LE)
//! [+0x013] KEY2 seed select                   (u8, low 3 bits used)
//! [+0x060] ROMCNT for normal (KEY2) transfers (u32 LE)
//! [+0x064] ROMCNT for KEY1 transfers          (u32 LE)
//! ```
//! Everything else in the block (title, ROM layout, logo, CRCs) is of no
//! interest to a flasher and is not parsed.

use std::io::{Read, Seek, SeekFrom};

use super::flags::RomCnt;
use crate::Result;
use crate::utils::{le_u32, u8};

/// Size of the block requested by the raw header read.
pub const HEADER_SIZE: usize = 0x1000;

/// Values the protocol engine takes from the identification block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    pub game_code: u32,
    pub key2_seed: u8,
    pub key1_romcnt: RomCnt,
    pub key2_romcnt: RomCnt,
}

impl Identification {
    /// Parse the fields from a header image.
    ///
    /// The reader may be positioned anywhere; offsets are absolute.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        r.seek(SeekFrom::Start(0x0C))?;
        let game_code = le_u32(r)?;
        r.seek(SeekFrom::Start(0x13))?;
        let key2_seed = u8(r)?;
        r.seek(SeekFrom::Start(0x60))?;
        let key2_romcnt = RomCnt::from_raw(le_u32(r)?);
        let key1_romcnt = RomCnt::from_raw(le_u32(r)?);
        Ok(Self {
            game_code,
            key2_seed,
            key1_romcnt,
            key2_romcnt,
        })
    }
}

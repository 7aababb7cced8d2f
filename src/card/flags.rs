//! ROMCNT - the per-transfer control word of the cartridge slot.
//!
//! ```text
//! bit 28     SEC_LARGE  secure area transferred in 0x1000-byte blocks
//! bit 27     CLK_SLOW   4.2 MHz instead of 6.7 MHz transfer clock
//! bit 22     SEC_CMD    command word is KEY2-encrypted by the hardware
//! bits 16-21 DELAY2     gap after the response (KEY1 gap2)
//! bit 14     SEC_EN     KEY2 unit enabled
//! bit 13     SEC_DAT    response data is KEY2-encrypted by the hardware
//! bits 0-12  DELAY1     gap before the response (KEY1 gap1)
//! ```
//!
//! The card header stores one such word per encrypted stage; the protocol
//! engine derives the words it actually uses from them.

use bitflags::bitflags;

bitflags! {
    /// Transfer flags handed to the transport with every command.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RomCnt: u32 {
        const SEC_LARGE = 1 << 28;
        const CLK_SLOW = 1 << 27;
        const SEC_CMD = 1 << 22;
        const DELAY2 = 0x3F << 16;
        const SEC_EN = 1 << 14;
        const SEC_DAT = 1 << 13;
        const DELAY1 = 0x1FFF;
    }
}

impl RomCnt {
    /// Flags for unencrypted commands during the handshake.
    pub const RAW: RomCnt = RomCnt::CLK_SLOW.union(RomCnt::from_bits_retain(0x18 << 16));

    /// Wrap a raw control word, keeping unknown bits.
    #[inline]
    pub const fn from_raw(v: u32) -> Self {
        RomCnt::from_bits_retain(v)
    }

    /// Build a word from its two delay fields.
    pub const fn with_delays(pre: u16, post: u8) -> Self {
        RomCnt::from_bits_retain((pre as u32 & 0x1FFF) | ((post as u32 & 0x3F) << 16))
    }

    /// Delay before the response (KEY1 gap1).
    #[inline]
    pub const fn pre_delay(self) -> u16 {
        (self.bits() & 0x1FFF) as u16
    }

    /// Delay after the response (KEY1 gap2).
    #[inline]
    pub const fn post_delay(self) -> u8 {
        ((self.bits() >> 16) & 0x3F) as u8
    }

    /// True if the hardware KEY2-encrypts the command word.
    #[inline]
    pub const fn key2_command(self) -> bool {
        self.contains(RomCnt::SEC_CMD.union(RomCnt::SEC_EN))
    }

    /// True if the hardware KEY2-decrypts the response.
    #[inline]
    pub const fn key2_response(self) -> bool {
        self.contains(RomCnt::SEC_DAT.union(RomCnt::SEC_EN))
    }

    /// Cipher1-stage word: the header KEY1 word with its two delay fields
    /// summed, clock speed taken from the KEY2 word, large secure-area
    /// blocks forced on.
    pub const fn key1_from_header(hdr_key1: RomCnt, key2: RomCnt) -> RomCnt {
        let h = hdr_key1.bits();
        let merged = (h & (RomCnt::CLK_SLOW.bits() | RomCnt::DELAY1.bits()))
            .wrapping_add((h & RomCnt::DELAY2.bits()) >> 16);
        RomCnt::from_bits_retain(
            (key2.bits() & RomCnt::CLK_SLOW.bits()) | merged | RomCnt::SEC_LARGE.bits(),
        )
    }

    /// Cipher2-stage word: the header KEY2 word restricted to the bits the
    /// host is allowed to pass through.
    pub const fn key2_from_header(hdr_key2: RomCnt) -> RomCnt {
        hdr_key2.intersection(
            RomCnt::CLK_SLOW
                .union(RomCnt::SEC_CMD)
                .union(RomCnt::DELAY2)
                .union(RomCnt::SEC_EN)
                .union(RomCnt::SEC_DAT)
                .union(RomCnt::DELAY1),
        )
    }

    /// Flags for the raw "activate KEY1" command.
    pub const fn activate_key1(key2: RomCnt) -> RomCnt {
        key2.intersection(RomCnt::CLK_SLOW.union(RomCnt::DELAY2).union(RomCnt::DELAY1))
    }
}

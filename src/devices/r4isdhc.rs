//! R4iSDHC family (DSTT clones with a 2 MiB SPI NOR behind the cart FPGA).
//!
//! The FPGA tunnels SPI NOR commands through cartridge command words. A
//! tunnelled word is built little-endian, so its first byte on the wire is
//! the `0x99` escape:
//!
//! ```text
//! byte  0    1      2    3..6           6    7
//!       99   XY     CC   AA AA AA       D1   D2      nor_cmd
//!       99   FPGA   D1   D2   00 00 00  00   00      nor_raw
//! ```
//! `X`/`Y` are the number of bytes the FPGA clocks out of / into the NOR,
//! `CC` the SPI opcode, `AA` a big-endian 24-bit address. Page programs
//! stream their data two bytes at a time through `nor_raw` words and are
//! committed by a final word with FPGA parameter `F0`.
//!
//! Newer carts unlock the tunnel with a single raw `68` command. Older
//! ones only do so after a full KEY1/KEY2 handshake and a secure `66`
//! command, and lack the ROM-to-NOR map, which changes the ntrboot layout.

use log::{info, warn};

use crate::card::{Card, Command, RomCnt, Transport};
use crate::flash::{FlashIo, Geometry, Progress, RawFlash};
use crate::keys::{Key1Variant, KeySeed, P_WORDS};
use crate::utils::resp_u32;
use crate::{Error, Result};

pub const NAME: &str = "R4iSDHC family";
pub const AUTHOR: &str = "handsomematt, Rai-chan, Kitlith,\n        stuckpixel, angelsl, et al.";
pub const DESCRIPTION: &str = "\nA family of DSTT clones. Tested with:\n * R4iSDHC RTS Lite (r4isdhc.com)\n * R4i-SDHC 3DS RTS (r4i-sdhc.com)\n * R4i-SDHC B9S (r4i-sdhc.com)";
pub const MAX_LENGTH: u32 = 0x20_0000;

const NOR_FLAGS: RomCnt = RomCnt::from_raw(0x18_0000);
const SECURE_UNLOCK_FLAGS: RomCnt = RomCnt::from_raw(0x58_6000);
const CMD_UNLOCK: u8 = 0x68;
const CMD_SECURE_UNLOCK: u8 = 0x66;

// Header values of the secure mode; the identification block of these
// carts does not carry them.
const SECURE_KEY1_ROMCNT: RomCnt = RomCnt::from_raw(0x0818_08F8);
const SECURE_KEY2_ROMCNT: RomCnt = RomCnt::from_raw(0x0041_6657);

const SPI_PROGRAM: u8 = 0x02;
const SPI_WRITE_DISABLE: u8 = 0x04;
const SPI_WRITE_ENABLE: u8 = 0x06;
const SPI_SECTOR_ERASE: u8 = 0x20;
const SPI_FAST_READ: u8 = 0x3B;

const GEOMETRY: Geometry = match Geometry::checked(2, 12, 8) {
    Some(g) => g,
    None => panic!("invalid R4iSDHC geometry"),
};

const WRITE_ENABLE_DELAY_US: u32 = 6_000;
const ERASE_DELAY_US: u32 = 612_000;
/// Erased-sector checks before an erase is reported as hung.
pub const ERASE_SANITY_RETRIES: u32 = 10;

const MAP_ADDR: u32 = 0x40;
const KEY_P_ADDRS: [u32; 2] = [0x1000, 0x1F_1000];
const KEY_S_ADDRS: [u32; 2] = [0x2000, 0x1F_2000];
const FIRM_ADDR: u32 = 0x7E00;
const FIRM_HEADER_ADDR: u32 = 0x1F_7E00;
/// Largest FIRM that stays clear of the second key copy.
pub const MAX_FIRM: usize = (0x1F_1000 - FIRM_ADDR) as usize;

/// A tunnelled SPI NOR command.
pub const fn nor_cmd(outlen: u8, inlen: u8, cmd: u8, addr: u32, d1: u8, d2: u8) -> u64 {
    0x99 | ((outlen as u64 & 0xF) << 12)
        | ((inlen as u64 & 0xF) << 8)
        | ((cmd as u64) << 16)
        | ((addr as u64 & 0xFF_0000) << 8)
        | ((addr as u64 & 0xFF00) << 24)
        | ((addr as u64 & 0xFF) << 40)
        | ((d1 as u64) << 48)
        | ((d2 as u64) << 56)
}

/// A raw FPGA word carrying two data bytes.
pub const fn nor_raw(d1: u8, d2: u8, fpga_param: u8) -> u64 {
    0x99 | ((fpga_param as u64) << 8) | ((d1 as u64) << 16) | ((d2 as u64) << 24)
}

/// Put a tunnelled word on the wire, low byte first.
#[inline]
pub const fn tunnel(word: u64) -> Command {
    Command::from_bytes(word.to_le_bytes())
}

#[derive(Debug, Clone, Default)]
pub struct R4iSdhc {
    old_cart: bool,
}

impl R4iSdhc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set when the cart only opened up after the secure handshake.
    pub fn is_old_cart(&self) -> bool {
        self.old_cart
    }

    // The write-disable command answers all ones until the tunnel is open
    // and zeroes afterwards.
    fn probe<T: Transport>(card: &mut Card<T>) -> Result<u32> {
        let mut buf = [0u8; 4];
        card.transfer(tunnel(nor_cmd(0, 1, SPI_WRITE_DISABLE, 0, 0, 0)), &mut buf, NOR_FLAGS)?;
        Ok(resp_u32(buf))
    }

    pub fn initialize<T: Transport>(&mut self, card: &mut Card<T>) -> Result<()> {
        if Self::probe(card)? != 0xFFFF_FFFF {
            return Err(Error::NotDetected);
        }

        card.init()?;
        card.transfer(Command::new(CMD_UNLOCK, 0), &mut [0u8; 4], NOR_FLAGS)?;
        if Self::probe(card)? == 0 {
            self.old_cart = false;
            return Ok(());
        }

        // The slow path: one full handshake per key variant.
        let variants: Vec<Key1Variant> = card.keys().loaded().collect();
        for variant in variants {
            match Self::try_secure_init(card, variant) {
                Ok(true) => {
                    info!("R4iSDHC: unlocked after secure init ({variant:?})");
                    self.old_cart = true;
                    return Ok(());
                }
                Ok(false) => warn!("R4iSDHC: secure init ({variant:?}) did not unlock the NOR"),
                Err(e) if e.is_handshake_failure() => {
                    warn!("R4iSDHC: secure init ({variant:?}) failed: {e}")
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotDetected)
    }

    fn try_secure_init<T: Transport>(card: &mut Card<T>, variant: Key1Variant) -> Result<bool> {
        card.init()?;
        card.override_identification(SECURE_KEY1_ROMCNT, SECURE_KEY2_ROMCNT, 0)?;
        card.begin_cipher1(variant)?;
        card.begin_cipher2()?;
        card.transfer(Command::new(CMD_SECURE_UNLOCK, 0), &mut [0u8; 4], SECURE_UNLOCK_FLAGS)?;
        Ok(Self::probe(card)? != 0xFFFF_FFFF)
    }

    pub fn shutdown<T: Transport>(&mut self, _card: &mut Card<T>) -> Result<()> {
        Ok(())
    }

    pub fn read_flash<T: Transport>(
        &mut self,
        card: &mut Card<T>,
        address: u32,
        buf: &mut [u8],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let mut nor = NorFlash { card };
        FlashIo::new(&mut nor).with_progress(progress).read(address, buf, true)
    }

    pub fn write_flash<T: Transport>(
        &mut self,
        card: &mut Card<T>,
        address: u32,
        buf: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let mut nor = NorFlash { card };
        FlashIo::new(&mut nor)
            .with_progress(progress)
            .write_labeled(address, buf, true, "Writing NOR")
    }

    /// Write the ROM map, both copies of the seed table and the FIRM.
    ///
    /// Old carts read 0x8000..0x10000 of the ROM from 0x1F8000, so they get
    /// a larger second FIRM copy and no map.
    pub fn inject_ntrboot<T: Transport>(
        &mut self,
        card: &mut Card<T>,
        key: &KeySeed,
        firm: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        if firm.len() > MAX_FIRM {
            return Err(Error::PayloadTooLarge {
                size: firm.len(),
                max: MAX_FIRM,
            });
        }

        let key = key.to_bytes();
        let (p_array, s_boxes) = key.split_at(P_WORDS * 4);

        // Second ROM map entry set to 0x7FFFFFFF (big-endian).
        let mut map = [0u8; 0x100];
        map[4..8].copy_from_slice(&[0x7F, 0xFF, 0xFF, 0xFF]);

        let mut nor = NorFlash { card };
        let mut io = FlashIo::new(&mut nor).with_progress(progress);
        if !self.old_cart {
            io.write_labeled(MAP_ADDR, &map, true, "Writing ROM <=> NOR map")?;
        }
        io.write_labeled(KEY_P_ADDRS[0], p_array, true, "Writing Blowfish key (1)")?;
        io.write_labeled(KEY_P_ADDRS[1], p_array, true, "Writing Blowfish key (2)")?;
        io.write_labeled(KEY_S_ADDRS[0], s_boxes, true, "Writing Blowfish key (3)")?;
        io.write_labeled(KEY_S_ADDRS[1], s_boxes, true, "Writing Blowfish key (4)")?;
        io.write_labeled(FIRM_ADDR, firm, true, "Writing FIRM (1)")?;

        let header_len = firm.len().min(if self.old_cart { 0x8200 } else { 0x200 });
        io.write_labeled(FIRM_HEADER_ADDR, &firm[..header_len], true, "Writing FIRM (2)")
    }
}

struct NorFlash<'c, T: Transport> {
    card: &'c mut Card<T>,
}

impl<T: Transport> NorFlash<'_, T> {
    fn send(&mut self, word: u64, resp: &mut [u8]) -> Result<()> {
        self.card.transfer(tunnel(word), resp, NOR_FLAGS)
    }

    fn read_word(&mut self, address: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.send(nor_cmd(2, 5, SPI_FAST_READ, address, 0, 0), &mut buf)?;
        Ok(resp_u32(buf))
    }

    fn write_enable(&mut self) -> Result<()> {
        self.send(nor_cmd(0, 1, SPI_WRITE_ENABLE, 0, 0, 0), &mut [0u8; 4])?;
        self.card.delay(WRITE_ENABLE_DELAY_US);
        Ok(())
    }

    fn sector_erased(&mut self, address: u32) -> Result<bool> {
        let last = address + GEOMETRY.erase_size() - 4;
        Ok(self.read_word(address)? == 0xFFFF_FFFF && self.read_word(last)? == 0xFFFF_FFFF)
    }
}

impl<T: Transport> RawFlash for NorFlash<'_, T> {
    fn geometry(&self) -> Geometry {
        GEOMETRY
    }

    fn raw_read(&mut self, address: u32, dest: &mut [u8]) -> Result<()> {
        self.send(nor_cmd(2, 5, SPI_FAST_READ, address, 0, 0), dest)
    }

    // There is no way to read the NOR status register through the FPGA,
    // so a fixed wait is followed by checking both ends of the sector.
    fn raw_erase(&mut self, address: u32) -> Result<()> {
        self.write_enable()?;
        self.send(nor_cmd(0, 4, SPI_SECTOR_ERASE, address, 0, 0), &mut [0u8; 4])?;
        self.card.delay(ERASE_DELAY_US);

        for _ in 0..ERASE_SANITY_RETRIES {
            if self.sector_erased(address)? {
                return Ok(());
            }
            warn!("R4iSDHC: sector {address:#X} start or end isn't FF");
            self.card.delay(ERASE_DELAY_US);
        }
        Err(Error::BusyTimeout {
            address,
            polls: ERASE_SANITY_RETRIES,
        })
    }

    fn raw_write(&mut self, address: u32, src: &[u8]) -> Result<()> {
        let &[d0, d1, ..] = src else {
            return Err(Error::InvalidRange);
        };
        self.write_enable()?;
        self.send(nor_cmd(0, 6, SPI_PROGRAM, address, d0, d1), &mut [0u8; 4])?;
        for pair in src[2..].chunks_exact(2) {
            self.send(nor_raw(pair[0], pair[1], 0), &mut [0u8; 4])?;
        }
        self.send(nor_raw(d0, d1, 0xF0), &mut [0u8; 4])?;
        self.card.delay(WRITE_ENABLE_DELAY_US);
        Ok(())
    }
}

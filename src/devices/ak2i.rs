//! Acekard 2i (HW-44 / HW-81) and its R4i Ultra clone.
//!
//! The cart answers vendor commands in the Raw stage, so no handshake is
//! needed. Flash is read in 0x200-byte blocks, erased in 64 KiB sectors
//! and programmed one byte per command, each erase or program followed by
//! polling the busy bit.
//!
//! ## Command words
//! ```text
//! C0 00 00 00 00 00 00 00   flash busy status (bit 0)
//! D1 00 00 00 00 00 00 00   hardware revision
//! B7 AA AA AA AA 10 00 00   read 0x200 bytes at address AAAAAAAA
//! D4 AA AA AA 00 01 00 00   erase sector              (HW-44)
//! D4 AA AA AA VV 03 00 00   program byte VV           (HW-44)
//! D4 AA AA AA 30 80 00 35   erase sector              (HW-81)
//! D4 AA AA AA VV A0 00 63   program byte VV           (HW-81)
//! ```
//! HW-44 only decodes five address bits in the top address byte.
//!
//! ## ntrboot payload (at 0x80000)
//! ```text
//! [+0x0000] KEY1 seed table   (0x1048 bytes)
//! [+0x1FC0] chip ID + length  (8 bytes)
//! [+0x9E00] FIRM
//! ```

use log::{debug, info};

use crate::card::{Card, Command, RomCnt, Transport};
use crate::flash::{FlashIo, Geometry, Progress, RawFlash};
use crate::keys::{KeySeed, SEED_BYTES};
use crate::utils::{len_u32, page_round_up, resp_u32};
use crate::{Error, Result};

pub const NAME: &str = "Acekard 2i";
pub const AUTHOR: &str = "Kitlith + Normmatt";
pub const DESCRIPTION: &str =
    "Works with the following carts:\n * Acekard 2i HW-44\n * Acekard 2i HW-81\n * R4i Ultra (r4ultra.com)";

const CMD_WAIT_FLASH_BUSY: [u8; 8] = [0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
const CMD_GET_HW_REVISION: [u8; 8] = [0xD1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
const CMD_SET_MAP_TABLE_ADDRESS: [u8; 8] = [0xD0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
const CMD_ACTIVE_FAT_MAP: [u8; 8] = [0xC2, 0x55, 0xAA, 0x55, 0xAA, 0x00, 0x00, 0x00];
const CMD_UNLOCK_FLASH: [u8; 8] = [0xC2, 0xAA, 0x55, 0xAA, 0x55, 0x00, 0x00, 0x00];
const CMD_LOCK_FLASH: [u8; 8] = [0xC2, 0xAA, 0xAA, 0x55, 0x55, 0x00, 0x00, 0x00];
const CMD_UNLOCK_ASIC: [u8; 8] = [0xC2, 0xAA, 0x55, 0x55, 0xAA, 0x00, 0x00, 0x00];
const CMD_READ_FLASH: [u8; 8] = [0xB7, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00];
const CMD_ERASE_FLASH: [u8; 8] = [0xD4, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00];
const CMD_WRITE_BYTE_FLASH: [u8; 8] = [0xD4, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00];
const CMD_SET_FLASH_1681_81: [u8; 8] = [0xD8, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC6, 0x06];
const CMD_ERASE_FLASH_81: [u8; 8] = [0xD4, 0x00, 0x00, 0x00, 0x30, 0x80, 0x00, 0x35];
const CMD_WRITE_BYTE_FLASH_81: [u8; 8] = [0xD4, 0x00, 0x00, 0x00, 0x30, 0xA0, 0x00, 0x63];

const SECTOR_SIZE: u32 = 0x10000;
const GEOMETRY: Geometry = match Geometry::checked(9, 16, 0) {
    Some(g) => g,
    None => panic!("invalid AK2i geometry"),
};

/// Busy-bit polls before an erase or program is given up on.
pub const BUSY_POLLS: u32 = 0x1000;

const NTRBOOT_BASE: u32 = 0x80000;
const FIRM_OFFSET: u32 = 0x9E00;
const CHIPID_OFFSET: usize = 0x1FC0;
const CHIPID_AND_LENGTH: [u8; 8] = [0x00, 0x00, 0x0F, 0xC2, 0x00, 0xB4, 0x17, 0x00];

/// Hardware revision reported by the cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    Hw44,
    Hw81,
}

impl Revision {
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0x4444_4444 => Some(Revision::Hw44),
            0x8181_8181 => Some(Revision::Hw81),
            _ => None,
        }
    }

    pub fn max_length(self) -> u32 {
        match self {
            Revision::Hw44 => 0x20_0000,
            Revision::Hw81 => 0x100_0000,
        }
    }
}

// The latency argument of the vendor command set is the pre-response gap.
fn send<T: Transport>(card: &mut Card<T>, cmd: [u8; 8], resp: &mut [u8], latency: u16) -> Result<()> {
    card.transfer(Command::from_bytes(cmd), resp, RomCnt::with_delays(latency, 0))
}

#[derive(Debug, Clone, Default)]
pub struct Ak2i {
    revision: Option<Revision>,
}

impl Ak2i {
    pub fn new() -> Self {
        Self::default()
    }

    /// The revision found by [`Ak2i::initialize`].
    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    /// Flash size, or 0 before detection.
    pub fn max_length(&self) -> u32 {
        self.revision.map_or(0, Revision::max_length)
    }

    fn detected(&self) -> Result<Revision> {
        self.revision.ok_or(Error::NotDetected)
    }

    pub fn initialize<T: Transport>(&mut self, card: &mut Card<T>) -> Result<()> {
        info!("AK2i: init");
        let mut id = [0u8; 4];
        send(card, CMD_GET_HW_REVISION, &mut id, 0)?;
        let id = resp_u32(id);
        info!("AK2i: HW revision = {id:08X}");

        let revision = Revision::from_id(id).ok_or(Error::NotDetected)?;
        match revision {
            Revision::Hw44 => {
                send(card, CMD_SET_MAP_TABLE_ADDRESS, &mut [], 0)?;
                send(card, CMD_ACTIVE_FAT_MAP, &mut [0u8; 4], 0)?;
                send(card, CMD_UNLOCK_ASIC, &mut [], 0)?;
            }
            Revision::Hw81 => {
                send(card, CMD_SET_FLASH_1681_81, &mut [], 20)?;
                send(card, CMD_ACTIVE_FAT_MAP, &mut [0u8; 4], 0)?;
                send(card, CMD_UNLOCK_FLASH, &mut [], 0)?;
                send(card, CMD_UNLOCK_ASIC, &mut [], 0)?;
                send(card, CMD_SET_MAP_TABLE_ADDRESS, &mut [], 0)?;
            }
        }
        self.revision = Some(revision);
        Ok(())
    }

    pub fn shutdown<T: Transport>(&mut self, card: &mut Card<T>) -> Result<()> {
        info!("AK2i: shutdown");
        send(card, CMD_LOCK_FLASH, &mut [], 0)?;
        send(card, CMD_SET_MAP_TABLE_ADDRESS, &mut [], 0)?;
        send(card, CMD_ACTIVE_FAT_MAP, &mut [0u8; 4], 4)
    }

    pub fn read_flash<T: Transport>(
        &mut self,
        card: &mut Card<T>,
        address: u32,
        buf: &mut [u8],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let revision = self.detected()?;
        info!("AK2i: read_flash(addr={address:#010X}, size={:#X})", buf.len());
        send(card, CMD_LOCK_FLASH, &mut [], 0)?;
        if revision == Revision::Hw81 {
            send(card, CMD_SET_FLASH_1681_81, &mut [], 20)?;
        }
        send(card, CMD_SET_MAP_TABLE_ADDRESS, &mut [], 0)?;

        let mut flash = Ak2iFlash { card, revision };
        FlashIo::new(&mut flash).with_progress(progress).read(address, buf, true)
    }

    pub fn write_flash<T: Transport>(
        &mut self,
        card: &mut Card<T>,
        address: u32,
        buf: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let revision = self.detected()?;
        info!("AK2i: write_flash(addr={address:#010X}, size={:#X})", buf.len());
        send(card, CMD_UNLOCK_FLASH, &mut [], 0)?;
        send(card, CMD_UNLOCK_ASIC, &mut [], 0)?;
        if revision == Revision::Hw81 {
            send(card, CMD_SET_FLASH_1681_81, &mut [], 20)?;
        }
        send(card, CMD_SET_MAP_TABLE_ADDRESS, &mut [], 0)?;

        let mut flash = Ak2iFlash { card, revision };
        FlashIo::new(&mut flash).with_progress(progress).write(address, buf, true)
    }

    /// Install the ntrboot seed table and FIRM, keeping the rest of the
    /// touched sectors as they were.
    pub fn inject_ntrboot<T: Transport>(
        &mut self,
        card: &mut Card<T>,
        key: &KeySeed,
        firm: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let revision = self.detected()?;
        let max_firm = (revision.max_length() - NTRBOOT_BASE - FIRM_OFFSET) as usize;
        let too_large = || Error::PayloadTooLarge {
            size: firm.len(),
            max: max_firm,
        };
        let firm_len = len_u32(firm.len()).map_err(|_| too_large())?;
        let buf_size = FIRM_OFFSET
            .checked_add(firm_len)
            .ok_or_else(too_large)
            .and_then(|end| page_round_up(end, SECTOR_SIZE))?;
        if buf_size > revision.max_length() - NTRBOOT_BASE {
            return Err(too_large());
        }

        info!("AK2i: injecting ntrboot");
        let mut buf = vec![0u8; buf_size as usize];
        self.read_flash(card, NTRBOOT_BASE, &mut buf, &mut *progress)?;

        buf[..SEED_BYTES].copy_from_slice(&key.to_bytes());
        buf[FIRM_OFFSET as usize..][..firm.len()].copy_from_slice(firm);
        buf[CHIPID_OFFSET..][..CHIPID_AND_LENGTH.len()].copy_from_slice(&CHIPID_AND_LENGTH);

        self.write_flash(card, NTRBOOT_BASE, &buf, progress)
    }
}

/// Raw primitives bound to a detected cart.
struct Ak2iFlash<'c, T: Transport> {
    card: &'c mut Card<T>,
    revision: Revision,
}

impl<T: Transport> Ak2iFlash<'_, T> {
    fn wait_flash_busy(&mut self, address: u32) -> Result<()> {
        for _ in 0..BUSY_POLLS {
            let mut state = [0u8; 4];
            send(self.card, CMD_WAIT_FLASH_BUSY, &mut state, 4)?;
            if resp_u32(state) & 1 == 0 {
                return Ok(());
            }
        }
        Err(Error::BusyTimeout {
            address,
            polls: BUSY_POLLS,
        })
    }

    fn addressed(&self, hw44: [u8; 8], hw81: [u8; 8], address: u32) -> [u8; 8] {
        let [_, a2, a1, a0] = address.to_be_bytes();
        let mut cmd = match self.revision {
            Revision::Hw44 => hw44,
            Revision::Hw81 => hw81,
        };
        cmd[1] = match self.revision {
            Revision::Hw44 => a2 & 0x1F,
            Revision::Hw81 => a2,
        };
        cmd[2] = a1;
        cmd[3] = a0;
        cmd
    }

    fn program_latency(&self) -> u16 {
        match self.revision {
            Revision::Hw44 => 0,
            Revision::Hw81 => 20,
        }
    }
}

impl<T: Transport> RawFlash for Ak2iFlash<'_, T> {
    fn geometry(&self) -> Geometry {
        GEOMETRY
    }

    fn raw_read(&mut self, address: u32, dest: &mut [u8]) -> Result<()> {
        debug!("AK2i: read({address:#010X})");
        let mut cmd = CMD_READ_FLASH;
        cmd[1..5].copy_from_slice(&address.to_be_bytes());
        send(self.card, cmd, dest, 2)
    }

    fn raw_erase(&mut self, address: u32) -> Result<()> {
        debug!("AK2i: erase({address:#010X})");
        let cmd = self.addressed(CMD_ERASE_FLASH, CMD_ERASE_FLASH_81, address);
        send(self.card, cmd, &mut [], self.program_latency())?;
        self.wait_flash_busy(address)
    }

    fn raw_write(&mut self, address: u32, src: &[u8]) -> Result<()> {
        let Some(&value) = src.first() else {
            return Err(Error::InvalidRange);
        };
        let mut cmd = self.addressed(CMD_WRITE_BYTE_FLASH, CMD_WRITE_BYTE_FLASH_81, address);
        cmd[4] = value;
        send(self.card, cmd, &mut [], 20)?;
        self.wait_flash_busy(address)
    }
}


#[cfg(test)]
mod tests {
    use super::sim::Ak2iSim;
    use super::*;
    use crate::mock::{MockTransport, test_keys, test_seed};

    fn cart(hw: u32) -> (Card<MockTransport<Ak2iSim>>, Ak2i) {
        let mut card = Card::new(MockTransport::new(Ak2iSim::new(hw)), test_keys());
        card.init().unwrap();
        let mut dev = Ak2i::new();
        dev.initialize(&mut card).unwrap();
        (card, dev)
    }

    #[test]
    fn detects_revisions() {
        let (card, dev) = cart(0x4444_4444);
        assert_eq!(dev.revision(), Some(Revision::Hw44));
        assert_eq!(dev.max_length(), 0x20_0000);
        let tail: Vec<[u8; 8]> = card.transport().sent[3..].iter().map(|s| s.cmd.to_bytes()).collect();
        assert_eq!(
            tail,
            [CMD_GET_HW_REVISION, CMD_SET_MAP_TABLE_ADDRESS, CMD_ACTIVE_FAT_MAP, CMD_UNLOCK_ASIC]
        );

        let (_, dev) = cart(0x8181_8181);
        assert_eq!(dev.max_length(), 0x100_0000);
        assert_eq!(
            (GEOMETRY.read_size(), GEOMETRY.erase_size(), GEOMETRY.write_size()),
            (0x200, SECTOR_SIZE, 1)
        );

        let mut card = Card::new(MockTransport::new(Ak2iSim::new(0xFFFF_FFFF)), test_keys());
        card.init().unwrap();
        let mut dev = Ak2i::new();
        assert!(matches!(dev.initialize(&mut card), Err(Error::NotDetected)));
        assert_eq!(dev.max_length(), 0);
    }

    #[test]
    fn program_and_read_back_hw81() {
        let (mut card, mut dev) = cart(0x8181_8181);
        let data = [0x12, 0x34, 0x56];
        dev.write_flash(&mut card, 0x1_0010, &data, &mut ()).unwrap();

        let erase: Vec<_> = card
            .transport()
            .sent
            .iter()
            .filter(|s| s.cmd.to_bytes()[5] == 0x80)
            .map(|s| s.cmd.to_bytes())
            .collect();
        assert_eq!(erase, [[0xD4, 0x01, 0x00, 0x00, 0x30, 0x80, 0x00, 0x35]]);
        assert!(
            card.transport()
                .sent
                .iter()
                .any(|s| s.cmd.to_bytes() == [0xD4, 0x01, 0x00, 0x11, 0x34, 0xA0, 0x00, 0x63])
        );

        let mut back = [0u8; 3];
        dev.read_flash(&mut card, 0x1_0010, &mut back, &mut ()).unwrap();
        assert_eq!(back, data);
        assert_eq!(card.transport().sim.flash[0x1_000F], 0xFF);
    }

    #[test]
    fn stuck_busy_bit_times_out() {
        let (mut card, mut dev) = cart(0x4444_4444);
        card.transport_mut().sim.busy_forever = true;
        let err = dev.write_flash(&mut card, 0x20, &[0], &mut ()).unwrap_err();
        assert!(matches!(
            err,
            Error::BusyTimeout {
                address: 0,
                polls: BUSY_POLLS
            }
        ));
    }

    #[test]
    fn ntrboot_payload_layout() {
        let (mut card, mut dev) = cart(0x4444_4444);
        {
            let flash = &mut card.transport_mut().sim.flash;
            flash[0x8_0000..0x9_0000].fill(0x00);
            flash[0x8_8000] = 0x5A;
        }
        let firm: Vec<u8> = (0..0x180).map(|i| i as u8).collect();
        dev.inject_ntrboot(&mut card, &test_seed(), &firm, &mut ()).unwrap();

        let flash = &card.transport().sim.flash;
        assert_eq!(flash[0x8_0000..0x8_1048], test_seed().to_bytes()[..]);
        assert_eq!(flash[0x8_1FC0..0x8_1FC8], CHIPID_AND_LENGTH);
        assert_eq!(flash[0x8_9E00..0x8_9F80], firm[..]);
        assert_eq!(flash[0x8_8000], 0x5A);
        assert_eq!(flash[0x8_9F80], 0x00);
    }

    #[test]
    fn oversized_firm_is_rejected() {
        let (mut card, mut dev) = cart(0x4444_4444);
        let firm = vec![0u8; 0x20_0000 - 0x8_0000 - 0x9E00 + 1];
        assert!(matches!(
            dev.inject_ntrboot(&mut card, &test_seed(), &firm, &mut ()),
            Err(Error::PayloadTooLarge { max: 0x17_6200, .. })
        ));
    }
}

//! The cartridge link: handshake state machine and command framing.
//!
//! ## Handshake
//! ```text
//!        reset_link            begin_cipher1            begin_cipher2
//!  ──────────────► Raw ──────────────────► Cipher1 ──────────────────► Cipher2
//!                   ▲                                                    │
//!                   └──────────────────── reset_link ────────────────────┘
//! ```
//! * **Raw** - plaintext commands at the slow clock. The chip ID and the
//!   identification block are read here.
//! * **Cipher1** (KEY1) - every command word is Blowfish-encrypted and
//!   carries a session nonce and a counter that must advance by one per
//!   command, even when a transfer fails.
//! * **Cipher2** (KEY2) - the slot hardware encrypts commands and data;
//!   the host only sends plain command words with the KEY2 flag bits set.
//!
//! A failed step never moves the status: a Cipher1 attempt that fails
//! leaves the link in Raw, a failed Cipher2 attempt leaves it in Cipher1.
//! Because the cartridge itself may have moved on, callers reset the link
//! before the next attempt.

use std::io::{self, Cursor};

use log::{debug, warn};

use super::command::{
    Command, KEY1_ACTIVATE_KEY2, KEY1_CHIPID, KEY1_INIT_KEY2, KEY2_CHIPID, RAW_CHIPID, RAW_DUMMY,
    RAW_HEADER_READ, key1_command, key1_plaintext,
};
use super::flags::RomCnt;
use super::header::{HEADER_SIZE, Identification};
use crate::crypto::blowfish::KeySchedule;
use crate::keys::{Key1Variant, KeyStore};
use crate::utils::resp_u32;
use crate::{Error, Result};

/// Response length of the flush command sent after a reset.
pub const DUMMY_LEN: usize = 0x2000;
/// Settle time after the flush command.
pub const RESET_DELAY_US: u32 = 4_000;

const NONCE_IJ: u32 = 0x11A473;
const NONCE_COUNTER: u32 = 0x39D46;
const KEY2_MN: u32 = 0xC99ACE;
const KEY2_SEED_BYTES: [u8; 8] = [0xE8, 0x4D, 0x5A, 0xB1, 0x17, 0x8F, 0x99, 0xD5];
const KEY2_Y: u64 = 0x5C_879B_9B05;

/// The physical side of the cartridge slot.
///
/// Implemented by the platform layer (bit-banged bus, console registers,
/// USB bridge, ...). Errors are reported as I/O errors and surface as
/// protocol failures, never panics.
pub trait Transport {
    /// Power-cycle / reset the cartridge.
    fn reset_card(&mut self) -> io::Result<()>;

    /// Clock out `cmd` and read `resp.len()` response bytes.
    fn send_command(&mut self, cmd: &[u8; 8], resp: &mut [u8], flags: RomCnt) -> io::Result<()>;

    /// Busy-wait for `micros` microseconds.
    fn delay(&mut self, micros: u32);

    /// Whether the slot has a KEY2 unit that can be seeded.
    fn has_hw_key2(&self) -> bool {
        false
    }

    /// Load the KEY2 X/Y registers.
    fn init_key2_seed(&mut self, _x: u64, _y: u64) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn reset_card(&mut self) -> io::Result<()> {
        (**self).reset_card()
    }

    fn send_command(&mut self, cmd: &[u8; 8], resp: &mut [u8], flags: RomCnt) -> io::Result<()> {
        (**self).send_command(cmd, resp, flags)
    }

    fn delay(&mut self, micros: u32) {
        (**self).delay(micros)
    }

    fn has_hw_key2(&self) -> bool {
        (**self).has_hw_key2()
    }

    fn init_key2_seed(&mut self, x: u64, y: u64) -> io::Result<()> {
        (**self).init_key2_seed(x, y)
    }
}

/// Handshake stage of a cartridge link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Unencrypted.
    #[default]
    Raw,
    /// KEY1 (Blowfish) command encryption.
    Cipher1,
    /// KEY2 hardware encryption.
    Cipher2,
}

/// Per-link session values. Owned by [`Card`] and never handed out.
#[derive(Debug, Default)]
struct CardState {
    chip_id: u32,
    game_code: u32,
    key_seed_byte: u8,
    hdr_key1_romcnt: RomCnt,
    hdr_key2_romcnt: RomCnt,
    schedule: Option<KeySchedule>,
    nonce_counter: u32,
    nonce_ij: u32,
    nonce_l: u16,
    key2_mn: u32,
    transfer_timing_cipher1: RomCnt,
    transfer_timing_cipher2: RomCnt,
    status: Status,
}

/// One cartridge link: the transport, the key material and the session.
pub struct Card<T: Transport> {
    transport: T,
    keys: KeyStore,
    state: CardState,
}

impl<T: Transport> Card<T> {
    /// Wrap a transport. The link starts in [`Status::Raw`] but nothing is
    /// sent until [`Card::reset_link`] / [`Card::init`].
    pub fn new(transport: T, keys: KeyStore) -> Self {
        Self {
            transport,
            keys,
            state: CardState::default(),
        }
    }

    pub fn status(&self) -> Status {
        self.state.status
    }

    /// Chip ID read in the Raw stage.
    pub fn chip_id(&self) -> u32 {
        self.state.chip_id
    }

    pub fn game_code(&self) -> u32 {
        self.state.game_code
    }

    /// The counter value the next KEY1 command will carry.
    pub fn nonce_counter(&self) -> u32 {
        self.state.nonce_counter
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Wait on the transport's clock.
    pub fn delay(&mut self, micros: u32) {
        self.transport.delay(micros)
    }

    fn expect(&self, expected: Status) -> Result<()> {
        if self.state.status != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state.status,
            });
        }
        Ok(())
    }

    /// Reset the cartridge and drop back to [`Status::Raw`].
    ///
    /// Only a failing transport reset is an error; the flush command that
    /// follows may time out on some cartridges.
    pub fn reset_link(&mut self) -> Result<()> {
        self.transport.reset_card()?;
        debug!("** card reset **");
        self.state = CardState::default();

        let mut scratch = vec![0u8; DUMMY_LEN];
        if let Err(e) = self.transfer(Command::new(RAW_DUMMY, 0), &mut scratch, RomCnt::RAW) {
            warn!("dummy command after reset failed: {e}");
        }
        self.transport.delay(RESET_DELAY_US);
        Ok(())
    }

    /// Read the chip ID and the identification block.
    pub fn read_identification(&mut self) -> Result<()> {
        self.expect(Status::Raw)?;

        let mut id = [0u8; 4];
        self.transfer(Command::new(RAW_CHIPID, 0), &mut id, RomCnt::RAW)?;
        self.state.chip_id = resp_u32(id);
        debug!("read chip id = {:08X}", self.state.chip_id);

        let mut hdr = vec![0u8; HEADER_SIZE];
        self.transfer(Command::new(RAW_HEADER_READ, 0), &mut hdr, RomCnt::RAW)?;
        let ident = Identification::parse(&mut Cursor::new(&hdr))?;
        self.apply_identification(ident);
        Ok(())
    }

    /// [`Card::reset_link`] followed by [`Card::read_identification`].
    pub fn init(&mut self) -> Result<()> {
        self.reset_link()?;
        self.read_identification()
    }

    /// Replace the header-derived timing words and seed byte, for carts
    /// whose identification block does not describe their secure mode.
    pub fn override_identification(&mut self, key1_romcnt: RomCnt, key2_romcnt: RomCnt, key2_seed: u8) -> Result<()> {
        self.expect(Status::Raw)?;
        self.apply_identification(Identification {
            game_code: self.state.game_code,
            key2_seed,
            key1_romcnt,
            key2_romcnt,
        });
        Ok(())
    }

    fn apply_identification(&mut self, ident: Identification) {
        let st = &mut self.state;
        st.game_code = ident.game_code;
        st.key_seed_byte = ident.key2_seed;
        st.hdr_key1_romcnt = ident.key1_romcnt;
        st.transfer_timing_cipher1 = ident.key1_romcnt;
        st.hdr_key2_romcnt = ident.key2_romcnt;
        st.transfer_timing_cipher2 = ident.key2_romcnt;
        debug!(
            "identification: game_code = {:08X}, key1 romcnt = {:08X}, key2 romcnt = {:08X}, key2 seed = {:X}",
            st.game_code,
            st.hdr_key1_romcnt.bits(),
            st.hdr_key2_romcnt.bits(),
            st.key_seed_byte
        );
    }

    /// Enter KEY1 using the seed table for `variant`.
    ///
    /// On failure the link stays in [`Status::Raw`]; the cartridge may
    /// not, so reset before trying another variant.
    pub fn begin_cipher1(&mut self, variant: Key1Variant) -> Result<()> {
        self.expect(Status::Raw)?;
        if !self.transport.has_hw_key2() {
            debug!("KEY1 fail: transport has no KEY2 support");
            return Err(Error::NoHardwareKey2);
        }
        let seed = self.keys.get(variant).ok_or(Error::MissingKey(variant))?;
        self.state.schedule = Some(KeySchedule::for_game_code(seed, self.state.game_code));

        self.enter_cipher1().map_err(|e| e.during(Status::Cipher1))?;
        self.state.status = Status::Cipher1;
        debug!("KEY1 active ({variant:?})");
        Ok(())
    }

    fn enter_cipher1(&mut self) -> Result<()> {
        let st = &mut self.state;
        st.key2_mn = KEY2_MN;
        st.nonce_ij = NONCE_IJ;
        st.nonce_counter = NONCE_COUNTER;
        st.nonce_l = 0;

        let activate = Command::activate_key1(st.nonce_ij, st.nonce_counter);
        let flags = RomCnt::activate_key1(st.transfer_timing_cipher2);
        self.transfer(activate, &mut [], flags)?;

        let st = &mut self.state;
        st.transfer_timing_cipher1 = RomCnt::key1_from_header(st.hdr_key1_romcnt, st.transfer_timing_cipher2);
        let (l, mn) = (st.nonce_l, st.key2_mn);
        self.send_key1(KEY1_INIT_KEY2, l, mn, &mut [])?;

        self.seed_key2()?;
        self.state.transfer_timing_cipher1 |= RomCnt::SEC_EN | RomCnt::SEC_DAT;

        let mut id = [0u8; 4];
        let (l, ij) = (self.state.nonce_l, self.state.nonce_ij);
        self.send_key1(KEY1_CHIPID, l, ij, &mut id)?;
        self.check_chip_id(Status::Cipher1, resp_u32(id))
    }

    fn seed_key2(&mut self) -> Result<()> {
        let st = &self.state;
        let x = KEY2_SEED_BYTES[(st.key_seed_byte & 7) as usize] as u64 + ((st.key2_mn as u64) << 15) + 0x6000;
        debug!("seed KEY2: {x:X} {KEY2_Y:X}");
        self.transport.init_key2_seed(x, KEY2_Y)?;
        Ok(())
    }

    fn check_chip_id(&self, stage: Status, actual: u32) -> Result<()> {
        if actual != self.state.chip_id {
            debug!(
                "{stage:?} fail: mismatching chip id: (raw) {:08X} != {actual:08X}",
                self.state.chip_id
            );
            return Err(Error::ChipIdMismatch {
                stage,
                expected: self.state.chip_id,
                actual,
            });
        }
        Ok(())
    }

    /// Enter KEY2. Requires [`Status::Cipher1`]; a failure leaves it there.
    pub fn begin_cipher2(&mut self) -> Result<()> {
        self.expect(Status::Cipher1)?;
        if !self.transport.has_hw_key2() {
            return Err(Error::NoHardwareKey2);
        }
        self.enter_cipher2().map_err(|e| e.during(Status::Cipher2))?;
        self.state.status = Status::Cipher2;
        debug!("KEY2 active");
        Ok(())
    }

    fn enter_cipher2(&mut self) -> Result<()> {
        let (l, ij) = (self.state.nonce_l, self.state.nonce_ij);
        self.send_key1(KEY1_ACTIVATE_KEY2, l, ij, &mut [])?;
        self.state.transfer_timing_cipher2 = RomCnt::key2_from_header(self.state.hdr_key2_romcnt);

        let mut id = [0u8; 4];
        let flags = self.state.transfer_timing_cipher2;
        self.transfer(Command::new(KEY2_CHIPID, 0), &mut id, flags)?;
        self.check_chip_id(Status::Cipher2, resp_u32(id))
    }

    // The counter is consumed before the transfer so a failed command still
    // advances it; the cartridge counts the command either way.
    fn send_key1(&mut self, cmd: u8, arg: u16, ij: u32, resp: &mut [u8]) -> Result<()> {
        let k = self.state.nonce_counter;
        self.state.nonce_counter = k.wrapping_add(1);

        let Some(schedule) = self.state.schedule.as_ref() else {
            return Err(Error::InvalidState {
                expected: Status::Cipher1,
                actual: self.state.status,
            });
        };
        debug!("sending KEY1 cmd: {:016X} (plaintext)", key1_plaintext(cmd, arg, ij, k));
        let command = key1_command(schedule, cmd, arg, ij, k);
        let flags = self.state.transfer_timing_cipher1;
        self.transfer(command, resp, flags)
    }

    /// Send a command framed for the current stage.
    ///
    /// * Raw / Cipher2: `opcode` followed by the low 56 bits of `args`,
    ///   sent with the stage's transfer flags.
    /// * Cipher1: `opcode & 0xF` as the KEY1 command, `args as u16` as its
    ///   16-bit argument, the session nonce and the next counter value.
    pub fn send_command(&mut self, opcode: u8, args: u64, resp: &mut [u8]) -> Result<()> {
        match self.state.status {
            Status::Raw => self.transfer(Command::new(opcode, args), resp, RomCnt::RAW),
            Status::Cipher1 => {
                let ij = self.state.nonce_ij;
                self.send_key1(opcode, args as u16, ij, resp)
            }
            Status::Cipher2 => {
                let flags = self.state.transfer_timing_cipher2;
                self.transfer(Command::new(opcode, args), resp, flags)
            }
        }
    }

    /// Send an already-built command word with explicit flags, bypassing
    /// stage framing. Vendor commands of the individual carts go here.
    pub fn transfer(&mut self, cmd: Command, resp: &mut [u8], flags: RomCnt) -> Result<()> {
        let bytes = cmd.to_bytes();
        debug!("sending cmd: {bytes:02X?} flags {:08X} resp {:#X}", flags.bits(), resp.len());
        self.transport.send_command(&bytes, resp, flags)?;
        Ok(())
    }
}

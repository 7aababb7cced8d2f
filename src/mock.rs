//! Test doubles: a scriptable cartridge slot and an in-memory flash chip.

use std::io;

use crate::card::command::{KEY1_CHIPID, KEY2_CHIPID, RAW_CHIPID, RAW_HEADER_READ, decode_key1};
use crate::card::header::HEADER_SIZE;
use crate::card::{Command, RomCnt, Transport};
use crate::crypto::blowfish::KeySchedule;
use crate::flash::{Geometry, RawFlash};
use crate::keys::{Key1Variant, KeySeed, KeyStore, PS_WORDS};
use crate::{Error, Result};

/// Synthetic seed table. Every golden value in the test suite is computed
/// over this table.
pub(crate) fn test_seed() -> KeySeed {
    let mut words = [0u32; PS_WORDS];
    for (i, w) in words.iter_mut().enumerate() {
        *w = 0x243F_6A88u32
            .wrapping_add((i as u32).wrapping_mul(0x9E37_79B9))
            .rotate_left(i as u32 % 32);
    }
    KeySeed::from_words(words)
}

/// A second table that differs from [`test_seed`] in every word.
pub(crate) fn other_seed() -> KeySeed {
    let mut words = *test_seed().words();
    for (i, w) in words.iter_mut().enumerate() {
        *w ^= 0x5A5A_0000 | i as u32;
    }
    KeySeed::from_words(words)
}

/// A key store holding [`test_seed`] as the NTR table only.
pub(crate) fn test_keys() -> KeyStore {
    let mut keys = KeyStore::new();
    keys.insert(Key1Variant::Ntr, test_seed());
    keys
}

/// Answers the commands a [`MockTransport`] receives.
pub(crate) trait Responder {
    fn respond(&mut self, cmd: Command, resp: &mut [u8], flags: RomCnt) -> io::Result<()>;
}

/// A retail-like cartridge that follows the handshake.
pub(crate) struct CardSim {
    pub chip_id: u32,
    pub key1_chip_id: u32,
    pub key2_chip_id: u32,
    pub header: Vec<u8>,
    /// When set, KEY1 chip-id queries are decrypted and only answered
    /// correctly if they were encrypted with this schedule.
    pub schedule: Option<KeySchedule>,
}

impl CardSim {
    pub fn new(chip_id: u32, game_code: u32) -> Self {
        let mut header = vec![0u8; HEADER_SIZE];
        header[0x0C..0x10].copy_from_slice(&game_code.to_le_bytes());
        header[0x60..0x64].copy_from_slice(&0x0041_6657u32.to_le_bytes());
        header[0x64..0x68].copy_from_slice(&0x0818_08F8u32.to_le_bytes());
        Self {
            chip_id,
            key1_chip_id: chip_id,
            key2_chip_id: chip_id,
            header,
            schedule: None,
        }
    }

    pub fn keyed_with(mut self, seed: &KeySeed) -> Self {
        let game_code = u32::from_le_bytes([
            self.header[0x0C],
            self.header[0x0D],
            self.header[0x0E],
            self.header[0x0F],
        ]);
        self.schedule = Some(KeySchedule::for_game_code(seed, game_code));
        self
    }
}

pub(crate) fn fill_u32(resp: &mut [u8], v: u32) {
    for (dst, src) in resp.iter_mut().zip(v.to_le_bytes().into_iter().cycle()) {
        *dst = src;
    }
}

impl Responder for CardSim {
    fn respond(&mut self, cmd: Command, resp: &mut [u8], flags: RomCnt) -> io::Result<()> {
        if flags.contains(RomCnt::SEC_LARGE) {
            let id = match &self.schedule {
                Some(s) if decode_key1(s, cmd).cmd != KEY1_CHIPID => 0xFFFF_FFFF,
                Some(_) => self.chip_id,
                None => self.key1_chip_id,
            };
            fill_u32(resp, id);
            return Ok(());
        }
        match cmd.opcode() {
            RAW_CHIPID => fill_u32(resp, self.chip_id),
            RAW_HEADER_READ if resp.len() == HEADER_SIZE => resp.copy_from_slice(&self.header),
            KEY2_CHIPID => fill_u32(resp, self.key2_chip_id),
            _ => resp.fill(0xFF),
        }
        Ok(())
    }
}

/// One command as seen by the transport.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sent {
    pub cmd: Command,
    pub len: usize,
    pub flags: RomCnt,
}

/// Records everything the protocol layer does and hands commands to a
/// [`Responder`].
pub(crate) struct MockTransport<R: Responder = CardSim> {
    pub sim: R,
    pub sent: Vec<Sent>,
    pub resets: usize,
    pub delays: Vec<u32>,
    pub key2_seeds: Vec<(u64, u64)>,
    pub hw_key2: bool,
    pub fail_reset: bool,
    /// Indices into `sent` whose transfer reports a timeout.
    pub fail_sends: Vec<usize>,
}

impl MockTransport<CardSim> {
    pub fn cartridge(sim: CardSim) -> Self {
        Self::new(sim)
    }
}

impl<R: Responder> MockTransport<R> {
    pub fn new(sim: R) -> Self {
        Self {
            sim,
            sent: Vec::new(),
            resets: 0,
            delays: Vec::new(),
            key2_seeds: Vec::new(),
            hw_key2: true,
            fail_reset: false,
            fail_sends: Vec::new(),
        }
    }
}

impl<R: Responder> Transport for MockTransport<R> {
    fn reset_card(&mut self) -> io::Result<()> {
        if self.fail_reset {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no cartridge"));
        }
        self.resets += 1;
        Ok(())
    }

    fn send_command(&mut self, cmd: &[u8; 8], resp: &mut [u8], flags: RomCnt) -> io::Result<()> {
        let cmd = Command::from_bytes(*cmd);
        let idx = self.sent.len();
        self.sent.push(Sent {
            cmd,
            len: resp.len(),
            flags,
        });
        if self.fail_sends.contains(&idx) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "slot timeout"));
        }
        self.sim.respond(cmd, resp, flags)
    }

    fn delay(&mut self, micros: u32) {
        self.delays.push(micros);
    }

    fn has_hw_key2(&self) -> bool {
        self.hw_key2
    }

    fn init_key2_seed(&mut self, x: u64, y: u64) -> io::Result<()> {
        self.key2_seeds.push((x, y));
        Ok(())
    }
}

/// NOR-like memory: erase sets a page to 0xFF, writes can only clear bits.
pub(crate) struct MockFlash {
    pub geometry: Geometry,
    pub data: Vec<u8>,
    pub reads: usize,
    pub erases: Vec<u32>,
    pub writes: Vec<u32>,
    pub fail_erase_at: Option<u32>,
    pub fail_write_at: Option<u32>,
    /// Number of upcoming write primitives whose first byte lands with
    /// bit 0 stuck at zero.
    pub corrupt_writes: usize,
}

impl MockFlash {
    pub fn new(geometry: Geometry, size: usize) -> Self {
        Self {
            geometry,
            data: vec![0xFF; size],
            reads: 0,
            erases: Vec::new(),
            writes: Vec::new(),
            fail_erase_at: None,
            fail_write_at: None,
            corrupt_writes: 0,
        }
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let start = address as usize;
        let end = start.checked_add(len).ok_or(Error::InvalidRange)?;
        if end > self.data.len() {
            return Err(Error::InvalidRange);
        }
        Ok(start..end)
    }
}

impl RawFlash for MockFlash {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn raw_read(&mut self, address: u32, dest: &mut [u8]) -> Result<()> {
        if self.geometry.read_size() != 1 {
            assert_eq!(dest.len() as u32, self.geometry.read_size());
        }
        self.reads += 1;
        // Reads running off the end return erased bytes, like a mirror of
        // unprogrammed space.
        for (i, b) in dest.iter_mut().enumerate() {
            *b = self.data.get(address as usize + i).copied().unwrap_or(0xFF);
        }
        Ok(())
    }

    fn raw_erase(&mut self, address: u32) -> Result<()> {
        assert_eq!(address % self.geometry.erase_size(), 0);
        if self.fail_erase_at == Some(address) {
            return Err(Error::Io(io::Error::other("erase rejected")));
        }
        let r = self.range(address, self.geometry.erase_size() as usize)?;
        self.data[r].fill(0xFF);
        self.erases.push(address);
        Ok(())
    }

    fn raw_write(&mut self, address: u32, src: &[u8]) -> Result<()> {
        assert_eq!(address % self.geometry.write_size(), 0);
        assert_eq!(src.len() as u32, self.geometry.write_size());
        if self.fail_write_at == Some(address) {
            return Err(Error::Io(io::Error::other("program rejected")));
        }
        let r = self.range(address, src.len())?;
        for (dst, s) in self.data[r.clone()].iter_mut().zip(src) {
            *dst &= *s;
        }
        if self.corrupt_writes > 0 {
            self.corrupt_writes -= 1;
            self.data[r.start] &= !1;
        }
        self.writes.push(address);
        Ok(())
    }
}

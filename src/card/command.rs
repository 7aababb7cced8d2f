//! Command words - the 8 bytes clocked out before every transfer.
//!
//! A [`Command`] stores the word as a `u64` whose **big-endian** bytes are
//! the bytes on the wire, so the first byte sent is the top byte and hex
//! literals read left to right like a bus trace.
//!
//! ## Raw layouts used by the handshake
//! ```text
//! 9F 00 00 00 00 00 00 00   dummy (flush)
//! 00 00 00 00 00 00 00 00   read identification block
//! 90 00 00 00 00 00 00 00   read chip ID
//! 3C ii ij jj 0k kk kk 00   activate KEY1 (i/j/k = session nonce/counter)
//! B8 00 00 00 00 00 00 00   read chip ID (sent with KEY2 flags)
//! ```
//!
//! ## KEY1 plaintext (nibbles, before encryption)
//! ```text
//! C llll iii jjj kkkkk
//! │  │    └──┬──┘  └── 20-bit command counter (+1 per command)
//! │  │       └──────── 24-bit nonce (or the KEY2 seed for cmd 4)
//! │  └──────────────── 16-bit argument
//! └─────────────────── command (1 chip ID, 2 secure read, 4 init KEY2, A activate KEY2)
//! ```
//! The plaintext is encrypted with [`KeySchedule::encrypt_u64`] and the
//! resulting word is sent unchanged.

use crate::crypto::blowfish::KeySchedule;

pub const RAW_DUMMY: u8 = 0x9F;
pub const RAW_HEADER_READ: u8 = 0x00;
pub const RAW_CHIPID: u8 = 0x90;
pub const RAW_ACTIVATE_KEY1: u8 = 0x3C;

pub const KEY1_CHIPID: u8 = 0x1;
pub const KEY1_SECURE_READ: u8 = 0x2;
pub const KEY1_INIT_KEY2: u8 = 0x4;
pub const KEY1_ACTIVATE_KEY2: u8 = 0xA;

pub const KEY2_DATA_READ: u8 = 0xB7;
pub const KEY2_CHIPID: u8 = 0xB8;

/// One 8-byte command word in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command(pub u64);

impl Command {
    /// `opcode` followed by the low 56 bits of `args`.
    #[inline]
    pub const fn new(opcode: u8, args: u64) -> Self {
        Command(((opcode as u64) << 56) | (args & 0x00FF_FFFF_FFFF_FFFF))
    }

    /// Take eight bytes exactly as they go out on the bus.
    #[inline]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Command(u64::from_be_bytes(bytes))
    }

    #[inline]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub const fn opcode(self) -> u8 {
        (self.0 >> 56) as u8
    }

    /// Raw "activate KEY1" carrying the session nonce and counter.
    pub const fn activate_key1(ij: u32, k: u32) -> Self {
        Command::new(
            RAW_ACTIVATE_KEY1,
            (((ij & 0xFF_FFFF) as u64) << 32) | (((k & 0xF_FFFF) as u64) << 8),
        )
    }
}

/// The 64-bit KEY1 plaintext for one command.
#[inline]
pub const fn key1_plaintext(cmd: u8, arg: u16, ij: u32, k: u32) -> u64 {
    (((cmd & 0xF) as u64) << 60)
        | ((arg as u64) << 44)
        | (((ij & 0xFF_FFFF) as u64) << 20)
        | ((k & 0xF_FFFF) as u64)
}

/// Build and encrypt a KEY1 command.
pub fn key1_command(schedule: &KeySchedule, cmd: u8, arg: u16, ij: u32, k: u32) -> Command {
    Command(schedule.encrypt_u64(key1_plaintext(cmd, arg, ij, k)))
}

/// Fields recovered from a KEY1 plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key1Fields {
    pub cmd: u8,
    pub arg: u16,
    pub ij: u32,
    pub k: u32,
}

/// Decrypt a KEY1 command and split it into its fields.
pub fn decode_key1(schedule: &KeySchedule, command: Command) -> Key1Fields {
    let p = schedule.decrypt_u64(command.0);
    Key1Fields {
        cmd: (p >> 60) as u8,
        arg: (p >> 44) as u16,
        ij: ((p >> 20) & 0xFF_FFFF) as u32,
        k: (p & 0xF_FFFF) as u32,
    }
}

/// Arguments placing a 32-bit address in bytes 1..5, most significant
/// byte first, as vendor read/erase commands expect.
#[inline]
pub const fn address_args(address: u32) -> u64 {
    (address as u64) << 24
}

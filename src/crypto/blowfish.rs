//! KEY1 - the cartridge protocol's Blowfish variant.
//!
//! ## Differences from textbook Blowfish
//!
//! * The P-array and S-boxes do not start from the digits of pi; they are
//!   a fixed table taken from the console boot ROM ([`KeySeed`]).
//! * The key is three 32-bit words derived from the 4-byte game code, and
//!   it is itself encrypted (in place) before being mixed in.
//! * Key words are byte-swapped before they are XOR-ed into the P-array.
//! * Keying runs twice, with the already-encrypted key words carried over
//!   from the first pass.
//!
//! The Feistel network is the standard 16 rounds over two 32-bit halves,
//! with the F function built from four 256-entry S-box lookups.
//!
//! Not constant-time; this is a protocol framing cipher, not a secret.

use crate::keys::{KeySeed, P_WORDS, PS_WORDS};

// Offsets of the four S-boxes inside the flat P + S table.
const S0: usize = P_WORDS;
const S1: usize = P_WORDS + 0x100;
const S2: usize = P_WORDS + 0x200;
const S3: usize = P_WORDS + 0x300;

/// A keyed P-array + S-box table.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySchedule {
    ps: Box<[u32; PS_WORDS]>,
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeySchedule({:08X}..)", self.ps[0])
    }
}

/// Derive the three KEY1 key words from a game code.
#[inline]
pub fn game_code_key(game_code: u32) -> [u32; 3] {
    [game_code, game_code >> 1, game_code << 1]
}

/// Key `seed` with `key`, running the keying pass twice.
///
/// `key` is copied; the second pass sees the words as the first pass left
/// them, matching what the cartridge computes.
pub fn build_key_schedule(seed: &KeySeed, key: &[u32; 3]) -> KeySchedule {
    let mut schedule = KeySchedule::from_seed(seed);
    let mut key = *key;
    schedule.apply_key(&mut key);
    schedule.apply_key(&mut key);
    schedule
}

impl KeySchedule {
    /// Start from an unkeyed seed table.
    pub fn from_seed(seed: &KeySeed) -> Self {
        Self {
            ps: Box::new(*seed.words()),
        }
    }

    /// Schedule for the cartridge with `game_code`.
    pub fn for_game_code(seed: &KeySeed, game_code: u32) -> Self {
        build_key_schedule(seed, &game_code_key(game_code))
    }

    pub fn words(&self) -> &[u32; PS_WORDS] {
        &self.ps
    }

    // F: split the word into bytes and combine the four S-box outputs with
    // add/xor/add, top byte first.
    #[inline]
    fn f(&self, z: u32) -> u32 {
        let ps = &self.ps;
        let mut x = ps[S0 + (z >> 24) as usize];
        x = ps[S1 + ((z >> 16) & 0xFF) as usize].wrapping_add(x);
        x ^= ps[S2 + ((z >> 8) & 0xFF) as usize];
        ps[S3 + (z & 0xFF) as usize].wrapping_add(x)
    }

    /// Encrypt one block in place. `lr[1]` enters as the left half.
    pub fn encrypt(&self, lr: &mut [u32; 2]) {
        let mut x = lr[1];
        let mut y = lr[0];
        for i in 0..16 {
            let z = self.ps[i] ^ x;
            x = y ^ self.f(z);
            y = z;
        }
        lr[0] = x ^ self.ps[16];
        lr[1] = y ^ self.ps[17];
    }

    /// Inverse of [`KeySchedule::encrypt`]: the same network with the
    /// P-array walked backwards.
    pub fn decrypt(&self, lr: &mut [u32; 2]) {
        let mut x = lr[1];
        let mut y = lr[0];
        for i in (2..=17).rev() {
            let z = self.ps[i] ^ x;
            x = y ^ self.f(z);
            y = z;
        }
        lr[0] = x ^ self.ps[1];
        lr[1] = y ^ self.ps[0];
    }

    /// Encrypt a 64-bit word treated as (low, high) halves.
    pub fn encrypt_u64(&self, v: u64) -> u64 {
        let mut lr = [v as u32, (v >> 32) as u32];
        self.encrypt(&mut lr);
        (lr[0] as u64) | ((lr[1] as u64) << 32)
    }

    /// Decrypt a 64-bit word treated as (low, high) halves.
    pub fn decrypt_u64(&self, v: u64) -> u64 {
        let mut lr = [v as u32, (v >> 32) as u32];
        self.decrypt(&mut lr);
        (lr[0] as u64) | ((lr[1] as u64) << 32)
    }

    /// One keying pass. Encrypts `key` in place, folds it into the P-array
    /// and then re-derives the whole table (P-array and all four S-boxes)
    /// by chaining encryptions of a zero block through it.
    pub fn apply_key(&mut self, key: &mut [u32; 3]) {
        let mut pair = [key[1], key[2]];
        self.encrypt(&mut pair);
        [key[1], key[2]] = pair;

        let mut pair = [key[0], key[1]];
        self.encrypt(&mut pair);
        [key[0], key[1]] = pair;

        for i in 0..P_WORDS {
            self.ps[i] ^= key[i % 2].swap_bytes();
        }

        let mut scratch = [0u32; 2];
        for i in (0..PS_WORDS).step_by(2) {
            self.encrypt(&mut scratch);
            self.ps[i] = scratch[1];
            self.ps[i + 1] = scratch[0];
        }
    }
}

//! KEY1 seed material for the cartridge handshake.
//!
//! The KEY1 cipher is keyed from a fixed table of P-array and S-box words
//! (0x1048 bytes) that ships inside the console's boot ROM. Several
//! variants exist:
//!
//! * **NTR** - the table every retail DS cartridge is keyed with.
//! * **B9 retail** / **B9 dev** - the tables the 3DS boot ROM uses when it
//!   chain-loads from the cartridge slot ("ntrboot").
//!
//! A cartridge does not advertise which table it expects, so drivers try
//! each loaded variant in turn (see [`crate::card::Card::begin_cipher1`]).
//!
//! This module intentionally avoids cryptographic operations - it is a
//! plain data container. The schedule derivation lives in
//! [`crate::crypto::blowfish`].
//!
//! ## Key file format
//! `name = hex_value` text, one entry per line, comments prefixed with `;`.
//! Recognised names are `key1_ntr`, `key1_b9_retail` and `key1_b9_dev`;
//! each value is 0x1048 bytes of little-endian words.

use std::io::{BufRead, BufReader, Read};

use crate::utils::le_words;
use crate::{Error, Result};

/// Number of P-array words.
pub const P_WORDS: usize = 0x12;
/// Number of words in P-array plus the four S-boxes.
pub const PS_WORDS: usize = 0x412;
/// Size of a serialized seed table in bytes.
pub const SEED_BYTES: usize = PS_WORDS * 4;

/// Which seed table a handshake attempt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key1Variant {
    /// Retail DS cartridges.
    Ntr,
    /// 3DS boot ROM, retail units.
    B9Retail,
    /// 3DS boot ROM, development units.
    B9Dev,
}

impl Key1Variant {
    /// Every variant, in the order drivers should try them.
    pub const ALL: [Key1Variant; 3] = [Key1Variant::Ntr, Key1Variant::B9Retail, Key1Variant::B9Dev];

    fn key_name(self) -> &'static str {
        match self {
            Key1Variant::Ntr => "key1_ntr",
            Key1Variant::B9Retail => "key1_b9_retail",
            Key1Variant::B9Dev => "key1_b9_dev",
        }
    }
}

/// A P-array + S-box seed table, before any game-code keying.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySeed {
    words: Box<[u32; PS_WORDS]>,
}

impl KeySeed {
    /// Build a seed from its raw words.
    pub fn from_words(words: [u32; PS_WORDS]) -> Self {
        Self {
            words: Box::new(words),
        }
    }

    /// Parse a 0x1048-byte little-endian table.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SEED_BYTES {
            return Err(Error::Parse("KEY1 seed must be 0x1048 bytes"));
        }
        let mut words = Box::new([0u32; PS_WORDS]);
        le_words(bytes, &mut words[..])?;
        Ok(Self { words })
    }

    /// Serialize back to the 0x1048-byte on-flash layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn words(&self) -> &[u32; PS_WORDS] {
        &self.words
    }
}

impl std::fmt::Debug for KeySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeySeed({:08X}..)", self.words[0])
    }
}

/// Seed tables indexed by [`Key1Variant`].
#[derive(Debug, Default, Clone)]
pub struct KeyStore {
    seeds: [Option<KeySeed>; 3],
}

impl KeyStore {
    /// Create an empty key store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the seed for `variant`, replacing any previous one.
    pub fn insert(&mut self, variant: Key1Variant, seed: KeySeed) {
        self.seeds[variant as usize] = Some(seed);
    }

    /// Look up the seed for `variant`.
    pub fn get(&self, variant: Key1Variant) -> Option<&KeySeed> {
        self.seeds[variant as usize].as_ref()
    }

    /// Variants that have a seed loaded, in trial order.
    pub fn loaded(&self) -> impl Iterator<Item = Key1Variant> + '_ {
        Key1Variant::ALL
            .into_iter()
            .filter(|v| self.get(*v).is_some())
    }

    /// Load seeds from a key file (see the module docs for the format).
    ///
    /// Unknown names are skipped so the file can be shared with other
    /// tools. A recognised name with a malformed value is an error.
    pub fn load_keys<R: Read>(&mut self, reader: R) -> Result<()> {
        let buf = BufReader::new(reader);
        for line in buf.lines() {
            let line = line.map_err(Error::Io)?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let name = name.trim();
            let Some(variant) = Key1Variant::ALL
                .into_iter()
                .find(|v| v.key_name() == name)
            else {
                continue;
            };
            let bytes = decode_hex(value.trim())?;
            self.insert(variant, KeySeed::from_bytes(&bytes)?);
        }
        Ok(())
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::Parse("odd number of hex digits"));
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| -> Result<u8> { Ok((hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?) })
        .collect()
}

fn hex_nibble(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::Parse("invalid hex digit")),
    }
}

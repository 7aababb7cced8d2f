//! **ntrkit** - cartridge protocol and flash programming for NDS flashcarts.
//!
//! # Modules
//! | Module | Purpose |
//! |--------|---------|
//! | [`crypto::blowfish`] | KEY1 block cipher and key schedule |
//! | [`card`]    | Raw → KEY1 → KEY2 handshake over a [`card::Transport`] |
//! | [`flash`]   | Range reads and writes over raw flash primitives |
//! | [`keys`]    | Boot ROM seed tables per KEY1 variant |
//! | `devices`   | Flashcart drivers and detection (feature `devices`) |
//!
//! # Usage
//! ```ignore
//! let mut keys = KeyStore::new();
//! keys.load_keys(File::open("ntrboot.keys")?)?;
//! let mut card = Card::new(slot, keys);
//!
//! let mut registry = Registry::new();
//! let device = registry.detect(&mut card)?;
//! device.inject_ntrboot(&mut card, &seed, &firm, &mut ())?;
//! device.shutdown(&mut card)?;
//! ```

pub mod card;
pub mod crypto;
#[cfg(feature = "devices")]
pub mod devices;
pub mod error;
pub mod flash;
pub mod keys;
pub(crate) mod utils;

#[cfg(test)]
mod mock;

pub use error::{Error, Result};

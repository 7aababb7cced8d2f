//! Cryptographic operations for the cartridge protocol.
//!
//! The only cipher the host has to run in software is KEY1, a Blowfish
//! variant the cartridge uses to authenticate the first encrypted stage of
//! the handshake. KEY2 (the stream cipher of the final stage) is always
//! done by the cartridge-slot hardware; the host only computes its seed.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`blowfish`] | KEY1 block cipher and game-code key schedule |
//!
//! ## Key hierarchy (brief)
//!
//! ```text
//! boot ROM seed table (0x1048 bytes, see crate::keys)
//!   └── apply_key(game_code, game_code >> 1, game_code << 1)  x2
//!         └── KEY1 schedule → encrypts every Cipher1-stage command word
//!               └── "init KEY2" command carries the KEY2 seed to the card
//! ```

pub mod blowfish;

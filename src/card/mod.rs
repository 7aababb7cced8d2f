//! Cartridge slot protocol.
//!
//! [`Card`] drives the Raw → KEY1 → KEY2 handshake over a [`Transport`]
//! and frames commands for whichever stage the link is in. The submodules
//! hold the pieces it is built from:
//!
//! * [`flags`] - the ROMCNT word handed to the transport with each command
//! * [`command`] - command word layouts and KEY1 encryption
//! * [`header`] - the identification block read in the Raw stage

pub mod command;
pub mod flags;
pub mod header;
pub mod protocol;

pub use command::Command;
pub use flags::RomCnt;
pub use header::Identification;
pub use protocol::{Card, Status, Transport};

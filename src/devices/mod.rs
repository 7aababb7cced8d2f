//! Flashcart drivers and the registry used to find the one in the slot.
//!
//! Every driver is a variant of [`Device`]. A driver talks to its cart
//! through a [`Card`] and implements the raw read/erase/program
//! primitives as a private [`RawFlash`](crate::flash::RawFlash), driven by
//! [`FlashIo`](crate::flash::FlashIo).
//!
//! | Module | Carts |
//! |--------|-------|
//! | [`ak2i`] | Acekard 2i HW-44 / HW-81, R4i Ultra |
//! | [`r4isdhc`] | R4iSDHC RTS / B9S family |

pub mod ak2i;
pub mod r4isdhc;

use log::{debug, info};

use crate::card::{Card, Transport};
use crate::flash::Progress;
use crate::keys::KeySeed;
use crate::{Error, Result};

pub use ak2i::Ak2i;
pub use r4isdhc::R4iSdhc;

/// A supported flashcart.
#[derive(Debug, Clone)]
pub enum Device {
    Ak2i(Ak2i),
    R4iSdhc(R4iSdhc),
}

impl Device {
    pub fn name(&self) -> &'static str {
        match self {
            Device::Ak2i(_) => ak2i::NAME,
            Device::R4iSdhc(_) => r4isdhc::NAME,
        }
    }

    pub fn author(&self) -> &'static str {
        match self {
            Device::Ak2i(_) => ak2i::AUTHOR,
            Device::R4iSdhc(_) => r4isdhc::AUTHOR,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Device::Ak2i(_) => ak2i::DESCRIPTION,
            Device::R4iSdhc(_) => r4isdhc::DESCRIPTION,
        }
    }

    /// Flash size in bytes. Zero while it depends on a revision that has
    /// not been detected yet.
    pub fn max_length(&self) -> u32 {
        match self {
            Device::Ak2i(d) => d.max_length(),
            Device::R4iSdhc(_) => r4isdhc::MAX_LENGTH,
        }
    }

    /// Probe for the cart and bring it into a state where flash can be
    /// accessed. Returns [`Error::NotDetected`] if it is some other cart.
    pub fn initialize<T: Transport>(&mut self, card: &mut Card<T>) -> Result<()> {
        match self {
            Device::Ak2i(d) => d.initialize(card),
            Device::R4iSdhc(d) => d.initialize(card),
        }
    }

    pub fn shutdown<T: Transport>(&mut self, card: &mut Card<T>) -> Result<()> {
        match self {
            Device::Ak2i(d) => d.shutdown(card),
            Device::R4iSdhc(d) => d.shutdown(card),
        }
    }

    fn check_range(&self, address: u32, len: usize) -> Result<()> {
        let max = self.max_length();
        if max == 0 {
            return Ok(());
        }
        let end = u32::try_from(len)
            .ok()
            .and_then(|len| address.checked_add(len))
            .ok_or(Error::InvalidRange)?;
        if end > max {
            return Err(Error::InvalidRange);
        }
        Ok(())
    }

    pub fn read_flash<T: Transport>(
        &mut self,
        card: &mut Card<T>,
        address: u32,
        buf: &mut [u8],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        self.check_range(address, buf.len())?;
        match self {
            Device::Ak2i(d) => d.read_flash(card, address, buf, progress),
            Device::R4iSdhc(d) => d.read_flash(card, address, buf, progress),
        }
    }

    pub fn write_flash<T: Transport>(
        &mut self,
        card: &mut Card<T>,
        address: u32,
        buf: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        self.check_range(address, buf.len())?;
        match self {
            Device::Ak2i(d) => d.write_flash(card, address, buf, progress),
            Device::R4iSdhc(d) => d.write_flash(card, address, buf, progress),
        }
    }

    /// Install the ntrboot seed table and `firm` in the cart's layout.
    pub fn inject_ntrboot<T: Transport>(
        &mut self,
        card: &mut Card<T>,
        key: &KeySeed,
        firm: &[u8],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        info!("{}: injecting ntrboot ({:#X} byte FIRM)", self.name(), firm.len());
        match self {
            Device::Ak2i(d) => d.inject_ntrboot(card, key, firm, progress),
            Device::R4iSdhc(d) => d.inject_ntrboot(card, key, firm, progress),
        }
    }
}

/// Detection order.
static DEVICES: &[fn() -> Device] = &[
    || Device::Ak2i(Ak2i::new()),
    || Device::R4iSdhc(R4iSdhc::new()),
];

/// Every driver in detection order.
#[derive(Debug, Clone)]
pub struct Registry {
    devices: Vec<Device>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            devices: DEVICES.iter().map(|ctor| ctor()).collect(),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Reset the link and try each driver in turn; the first whose
    /// `initialize` succeeds is returned.
    ///
    /// A failing reset aborts detection. Any error from a driver only
    /// moves on to the next one.
    pub fn detect<T: Transport>(&mut self, card: &mut Card<T>) -> Result<&mut Device> {
        for device in self.devices.iter_mut() {
            card.init()?;
            match device.initialize(card) {
                Ok(()) => {
                    info!("detected {}", device.name());
                    return Ok(device);
                }
                Err(e) => debug!("{} not detected: {e}", device.name()),
            }
        }
        Err(Error::NotDetected)
    }
}

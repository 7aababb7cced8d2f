//! Library-wide error and result types.

use std::fmt;
use std::io;

use crate::card::Status;
use crate::keys::Key1Variant;

/// Result alias used throughout ntrkit.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
///
/// Every failure is reported through this type; nothing in the library
/// panics on hardware misbehaviour.
#[derive(Debug)]
pub enum Error {
    /// The transport failed outside a handshake step.
    Io(io::Error),
    /// The transport failed while a handshake step was in progress.
    Handshake { stage: Status, source: io::Error },
    /// The chip ID read back in an encrypted stage differs from the raw one.
    ChipIdMismatch {
        stage: Status,
        expected: u32,
        actual: u32,
    },
    /// The transport has no hardware KEY2 unit to seed.
    NoHardwareKey2,
    /// No seed table is loaded for the requested key variant.
    MissingKey(Key1Variant),
    /// An operation was issued in the wrong handshake stage.
    InvalidState { expected: Status, actual: Status },
    /// Flash granularity powers are inconsistent.
    Geometry(&'static str),
    /// An address or size would fall outside the valid region.
    InvalidRange,
    /// A read primitive failed after `transferred` bytes were copied.
    Read {
        address: u32,
        transferred: u32,
        source: Box<Error>,
    },
    /// An erase primitive failed.
    Erase { address: u32 },
    /// A write primitive failed.
    Write { address: u32 },
    /// Flash contents differ from what was just written.
    Verify { address: u32 },
    /// A busy/sanity poll loop gave up.
    BusyTimeout { address: u32, polls: u32 },
    /// No driver recognised the inserted cartridge.
    NotDetected,
    /// The payload does not fit into the device layout.
    PayloadTooLarge { size: usize, max: usize },
    /// Key material is malformed (message describes which part).
    Parse(&'static str),
}

impl Error {
    /// True for the failures a driver may recover from by retrying the
    /// handshake with another key variant after a full reset.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Error::Handshake { .. }
                | Error::ChipIdMismatch { .. }
                | Error::NoHardwareKey2
                | Error::MissingKey(_)
        )
    }

    /// Re-tag a transport error as a failure of handshake `stage`.
    pub(crate) fn during(self, stage: Status) -> Self {
        match self {
            Error::Io(source) => Error::Handshake { stage, source },
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "transport error: {e}"),
            Error::Handshake { stage, source } => {
                write!(f, "handshake failed entering {stage:?}: {source}")
            }
            Error::ChipIdMismatch {
                stage,
                expected,
                actual,
            } => write!(
                f,
                "chip id mismatch in {stage:?}: expected {expected:08X}, got {actual:08X}"
            ),
            Error::NoHardwareKey2 => write!(f, "transport has no hardware KEY2 support"),
            Error::MissingKey(v) => write!(f, "no KEY1 seed loaded for {v:?}"),
            Error::InvalidState { expected, actual } => {
                write!(f, "card is in {actual:?}, expected {expected:?}")
            }
            Error::Geometry(s) => write!(f, "invalid flash geometry: {s}"),
            Error::InvalidRange => write!(f, "invalid address or size"),
            Error::Read {
                address,
                transferred,
                source,
            } => write!(
                f,
                "flash read failed at {address:#X} after {transferred:#X} bytes: {source}"
            ),
            Error::Erase { address } => write!(f, "flash erase failed at {address:#X}"),
            Error::Write { address } => write!(f, "flash write failed at {address:#X}"),
            Error::Verify { address } => {
                write!(f, "flash verification failed for write at {address:#X}")
            }
            Error::BusyTimeout { address, polls } => {
                write!(f, "flash still busy at {address:#X} after {polls} polls")
            }
            Error::NotDetected => write!(f, "no supported flashcart detected"),
            Error::PayloadTooLarge { size, max } => {
                write!(f, "payload of {size:#X} bytes exceeds {max:#X}")
            }
            Error::Parse(s) => write!(f, "parse error: {s}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::Handshake { source: e, .. } => Some(e),
            Error::Read { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_become_handshake_failures() {
        let e = Error::from(io::Error::new(io::ErrorKind::TimedOut, "slot")).during(Status::Cipher1);
        assert!(matches!(e, Error::Handshake { stage: Status::Cipher1, .. }));
        assert!(e.is_handshake_failure());
    }

    #[test]
    fn flash_failures_are_not_handshake_failures() {
        assert!(!Error::Verify { address: 0 }.is_handshake_failure());
        assert!(!Error::BusyTimeout { address: 0, polls: 10 }.is_handshake_failure());
        let e = Error::Erase { address: 0x1000 }.during(Status::Raw);
        assert!(matches!(e, Error::Erase { address: 0x1000 }));
    }
}

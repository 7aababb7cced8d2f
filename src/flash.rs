//! Range-based flash access on top of fixed-granularity primitives.
//!
//! A device exposes three raw operations through [`RawFlash`], each with
//! its own transfer size:
//!
//! | Primitive   | Size                  | Alignment of `address`     |
//! |-------------|-----------------------|----------------------------|
//! | `raw_read`  | read size (1 = any)   | none                       |
//! | `raw_erase` | one erase page        | erase page                 |
//! | `raw_write` | one write page        | write page                 |
//!
//! [`FlashIo`] turns these into `read(address, buf)` / `write(address, buf)`
//! over arbitrary ranges. Writes are read-modify-write per erase page and
//! skip pages whose contents already match, so re-running an interrupted
//! write only touches the pages that still differ.

use log::{debug, error, warn};

use crate::utils::{len_u32, page_round_up};
use crate::{Error, Result};

/// Block size for reads when the primitive accepts any size.
pub const FREE_READ_BLOCK: u32 = 0x1000;

/// Transfer sizes of a flash device, as powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    read_power: u8,
    erase_power: u8,
    write_power: u8,
}

impl Geometry {
    /// Validate and build a geometry.
    ///
    /// The erase page must be at least as large as the write page, which
    /// (both being powers of two) makes it an exact multiple.
    pub fn new(read_power: u32, erase_power: u32, write_power: u32) -> Result<Self> {
        if read_power >= 32 || erase_power >= 32 || write_power >= 32 {
            return Err(Error::Geometry("granularity power must be below 32"));
        }
        Self::checked(read_power, erase_power, write_power)
            .ok_or(Error::Geometry("erase page smaller than write page"))
    }

    /// [`Geometry::new`] for constant contexts.
    pub const fn checked(read_power: u32, erase_power: u32, write_power: u32) -> Option<Self> {
        if read_power >= 32 || erase_power >= 32 || write_power >= 32 || erase_power < write_power {
            return None;
        }
        Some(Self {
            read_power: read_power as u8,
            erase_power: erase_power as u8,
            write_power: write_power as u8,
        })
    }

    #[inline]
    pub const fn read_size(&self) -> u32 {
        1 << self.read_power
    }

    #[inline]
    pub const fn erase_size(&self) -> u32 {
        1 << self.erase_power
    }

    #[inline]
    pub const fn write_size(&self) -> u32 {
        1 << self.write_power
    }
}

/// The three primitives a device binds for [`FlashIo`].
pub trait RawFlash {
    fn geometry(&self) -> Geometry;

    /// Fill `dest` from `address`. `dest.len()` is exactly the read size
    /// unless the read size is 1. No alignment is guaranteed.
    fn raw_read(&mut self, address: u32, dest: &mut [u8]) -> Result<()>;

    /// Erase the page at `address`, which is erase-page aligned.
    fn raw_erase(&mut self, address: u32) -> Result<()>;

    /// Program one write page. `address` is write-page aligned and
    /// `src.len()` is the write size.
    fn raw_write(&mut self, address: u32, src: &[u8]) -> Result<()>;
}

impl<F: RawFlash + ?Sized> RawFlash for &mut F {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }

    fn raw_read(&mut self, address: u32, dest: &mut [u8]) -> Result<()> {
        (**self).raw_read(address, dest)
    }

    fn raw_erase(&mut self, address: u32) -> Result<()> {
        (**self).raw_erase(address)
    }

    fn raw_write(&mut self, address: u32, src: &[u8]) -> Result<()> {
        (**self).raw_write(address, src)
    }
}

/// Progress sink. Purely advisory.
pub trait Progress {
    fn report(&mut self, current: u32, total: u32, label: &str);
}

/// No progress output.
impl Progress for () {
    fn report(&mut self, _current: u32, _total: u32, _label: &str) {}
}

impl<F: FnMut(u32, u32, &str)> Progress for F {
    fn report(&mut self, current: u32, total: u32, label: &str) {
        self(current, total, label)
    }
}

impl Progress for &mut (dyn Progress + '_) {
    fn report(&mut self, current: u32, total: u32, label: &str) {
        (**self).report(current, total, label)
    }
}

// Primitive failures are reported as erase/write errors at the page
// address, except busy timeouts which keep their own kind.
fn primitive_error(e: Error, as_kind: Error) -> Error {
    match e {
        Error::BusyTimeout { .. } => e,
        other => {
            error!("{as_kind}: {other}");
            as_kind
        }
    }
}

// A range may end exactly at the top of the 32-bit address space.
fn check_end(start: u32, length: u32) -> Result<()> {
    if length > 0 {
        start.checked_add(length - 1).ok_or(Error::InvalidRange)?;
    }
    Ok(())
}

/// Range reads and writes over a [`RawFlash`].
pub struct FlashIo<'a, F: RawFlash + ?Sized, P: Progress = ()> {
    dev: &'a mut F,
    progress: P,
}

impl<'a, F: RawFlash + ?Sized> FlashIo<'a, F> {
    pub fn new(dev: &'a mut F) -> Self {
        Self { dev, progress: () }
    }
}

impl<'a, F: RawFlash + ?Sized, P: Progress> FlashIo<'a, F, P> {
    /// Report progress of calls made with `show_progress` to `progress`.
    pub fn with_progress<Q: Progress>(self, progress: Q) -> FlashIo<'a, F, Q> {
        FlashIo {
            dev: self.dev,
            progress,
        }
    }

    /// Read `dest.len()` bytes from `start`.
    ///
    /// A failed primitive is reported as [`Error::Read`] with the number of
    /// bytes already copied into `dest`.
    pub fn read(&mut self, start: u32, dest: &mut [u8], show_progress: bool) -> Result<()> {
        let length = len_u32(dest.len())?;
        check_end(start, length)?;

        let read_size = self.dev.geometry().read_size();
        let free_read = read_size == 1;
        if free_read && !show_progress {
            return self.dev.raw_read(start, dest).map_err(|e| Error::Read {
                address: start,
                transferred: 0,
                source: Box::new(e),
            });
        }

        let block = if free_read { FREE_READ_BLOCK } else { read_size };
        let mut odd = Vec::new();
        let mut cur = 0u32;
        if show_progress {
            self.progress.report(cur, length, "Reading flash");
        }

        while cur < length {
            let n = block.min(length - cur);
            let address = start + cur;
            let out = &mut dest[cur as usize..(cur + n) as usize];
            let res = if n != block && !free_read {
                // The primitive always transfers a full block.
                odd.resize(block as usize, 0);
                self.dev
                    .raw_read(address, &mut odd)
                    .map(|()| out.copy_from_slice(&odd[..n as usize]))
            } else {
                self.dev.raw_read(address, out)
            };
            res.map_err(|e| Error::Read {
                address,
                transferred: cur,
                source: Box::new(e),
            })?;

            cur += n;
            if show_progress {
                self.progress.report(cur, length, "Reading flash");
            }
        }
        Ok(())
    }

    /// Write `src` at `dest_address`. See [`FlashIo::write_labeled`].
    pub fn write(&mut self, dest_address: u32, src: &[u8], show_progress: bool) -> Result<()> {
        self.write_labeled(dest_address, src, show_progress, "Writing flash")
    }

    /// Write `src` at `dest_address`, reporting progress under `label`.
    ///
    /// Every erase page overlapping the range is read; pages whose bytes
    /// already match are left alone, the rest are erased, patched and
    /// rewritten in write-page steps. The range is then read back and
    /// compared. Pages written before a failure stay written; calling again
    /// only rewrites what still differs.
    pub fn write_labeled(&mut self, dest_address: u32, src: &[u8], show_progress: bool, label: &str) -> Result<()> {
        let length = len_u32(src.len())?;
        if length == 0 {
            return Ok(());
        }
        check_end(dest_address, length)?;

        let erase = self.dev.geometry().erase_size();
        let mask = erase - 1;
        let real_start = dest_address & !mask;
        let first_page_offset = dest_address & mask;
        let real_length = page_round_up(
            length.checked_add(first_page_offset).ok_or(Error::InvalidRange)?,
            erase,
        )?;

        let mut page = vec![0u8; erase as usize];
        let mut cur = 0u32;
        if show_progress {
            self.progress.report(cur, real_length, label);
        }

        while cur < real_length {
            let page_addr = real_start + cur;
            let buf_ofs = dest_address.saturating_sub(page_addr) as usize;
            let src_ofs = cur.saturating_sub(first_page_offset) as usize;
            let len = (erase as usize - buf_ofs).min(src.len() - src_ofs);
            let new = &src[src_ofs..src_ofs + len];

            self.read(page_addr, &mut page, false)?;
            if page[buf_ofs..buf_ofs + len] == *new {
                debug!("page {page_addr:#X} unchanged");
            } else {
                self.dev
                    .raw_erase(page_addr)
                    .map_err(|e| primitive_error(e, Error::Erase { address: page_addr }))?;
                page[buf_ofs..buf_ofs + len].copy_from_slice(new);
                self.write_page(page_addr, &page)?;
            }

            cur += erase;
            if show_progress {
                self.progress.report(cur, real_length, label);
            }
        }

        self.verify(dest_address, src)
    }

    /// [`FlashIo::write`], repeated up to `attempts` times while the
    /// read-back does not match. Other failures are returned immediately.
    pub fn write_with_retry(&mut self, dest_address: u32, src: &[u8], attempts: u32, show_progress: bool) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.write(dest_address, src, show_progress) {
                Err(Error::Verify { address }) if attempt < attempts => {
                    warn!("verification failed at {address:#X}, retrying ({attempt}/{attempts})");
                    attempt += 1;
                }
                res => return res,
            }
        }
    }

    fn write_page(&mut self, page_addr: u32, page: &[u8]) -> Result<()> {
        let write_size = self.dev.geometry().write_size();
        let mut address = page_addr;
        for chunk in page.chunks_exact(write_size as usize) {
            self.dev
                .raw_write(address, chunk)
                .map_err(|e| primitive_error(e, Error::Write { address }))?;
            address = address.wrapping_add(write_size);
        }
        Ok(())
    }

    // Full read-back if a buffer of that size can be had, otherwise only
    // the first and last four bytes.
    fn verify(&mut self, address: u32, src: &[u8]) -> Result<()> {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(src.len()).is_err() {
            warn!("no memory for a full read-back of {:#X} bytes", src.len());
            return self.verify_edges(address, src);
        }
        buf.resize(src.len(), 0);
        self.read(address, &mut buf, false)?;
        if buf != src {
            warn!("flash write verification failed");
            return Err(Error::Verify { address });
        }
        Ok(())
    }

    fn verify_edges(&mut self, address: u32, src: &[u8]) -> Result<()> {
        let head = src.len().min(4);
        let mut t = [0u8; 4];
        self.read(address, &mut t[..head], false)?;
        if t[..head] != src[..head] {
            warn!("flash write start verification failed");
            return Err(Error::Verify { address });
        }

        if src.len() > 4 {
            let tail = src.len() - 4;
            self.read(address + tail as u32, &mut t, false)?;
            if t[..] != src[tail..] {
                warn!("flash write end verification failed");
                return Err(Error::Verify { address });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFlash;

    fn flash(read: u32, erase: u32, write: u32, size: usize) -> MockFlash {
        MockFlash::new(Geometry::new(read, erase, write).unwrap(), size)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
    }

    #[test]
    fn geometry_rejects_bad_powers() {
        assert!(matches!(Geometry::new(0, 8, 9), Err(Error::Geometry(_))));
        assert!(matches!(Geometry::new(32, 12, 8), Err(Error::Geometry(_))));
        let g = Geometry::new(9, 16, 0).unwrap();
        assert_eq!((g.read_size(), g.erase_size(), g.write_size()), (0x200, 0x10000, 1));

        const G: Option<Geometry> = Geometry::checked(2, 12, 8);
        assert_eq!(G, Geometry::new(2, 12, 8).ok());
        assert_eq!(Geometry::checked(0, 8, 9), None);
        assert_eq!(Geometry::checked(0, 40, 8), None);
    }

    #[test]
    fn free_read_without_progress_is_one_call() {
        let mut dev = flash(0, 12, 8, 0x10000);
        dev.data[0x1234..0x1238].copy_from_slice(&[1, 2, 3, 4]);
        let mut buf = vec![0u8; 0x5001];
        FlashIo::new(&mut dev).read(0x1234, &mut buf, false).unwrap();
        assert_eq!(dev.reads, 1);
        assert_eq!(buf[..4], [1, 2, 3, 4]);

        let mut calls = 0;
        let mut counter = |_: u32, _: u32, _: &str| calls += 1;
        let mut io = FlashIo::new(&mut dev).with_progress(&mut counter);
        io.read(0, &mut buf, true).unwrap();
        // 0x5001 bytes in 0x1000 blocks.
        assert_eq!(dev.reads, 1 + 6);
        assert_eq!(calls, 7);
    }

    #[test]
    fn sized_reads_use_whole_blocks() {
        let mut dev = flash(9, 16, 0, 0x20000);
        dev.data[..0x20000].copy_from_slice(&pattern(0x20000, 7));
        let mut buf = vec![0u8; 0x301];
        FlashIo::new(&mut dev).read(0x10, &mut buf, false).unwrap();
        assert_eq!(dev.reads, 2);
        assert_eq!(buf, dev.data[0x10..0x311]);
    }

    #[test]
    fn read_failure_reports_transferred_bytes() {
        struct Failing(u32);
        impl RawFlash for Failing {
            fn geometry(&self) -> Geometry {
                Geometry::new(2, 12, 8).unwrap()
            }
            fn raw_read(&mut self, address: u32, dest: &mut [u8]) -> Result<()> {
                if address >= self.0 {
                    return Err(Error::BusyTimeout { address, polls: 1 });
                }
                dest.fill(0);
                Ok(())
            }
            fn raw_erase(&mut self, _: u32) -> Result<()> {
                Ok(())
            }
            fn raw_write(&mut self, _: u32, _: &[u8]) -> Result<()> {
                Ok(())
            }
        }

        let mut dev = Failing(0x18);
        let err = FlashIo::new(&mut dev).read(0x10, &mut [0u8; 0x20], false).unwrap_err();
        assert!(matches!(
            err,
            Error::Read {
                address: 0x18,
                transferred: 8,
                ..
            }
        ));
    }

    #[test]
    fn single_byte_in_large_erase_page() {
        let mut dev = flash(9, 16, 8, 0x20000);
        let before = pattern(0x20000, 0x3C);
        dev.data.copy_from_slice(&before);

        FlashIo::new(&mut dev).write(0x1000, &[0xAB], false).unwrap();

        assert_eq!(dev.erases, [0]);
        assert_eq!(dev.writes, (0..0x100).map(|i| i * 0x100).collect::<Vec<u32>>());
        assert_eq!(dev.data[0x1000], 0xAB);
        for (i, (a, b)) in dev.data.iter().zip(&before).enumerate() {
            if i != 0x1000 {
                assert_eq!(a, b, "byte {i:#X} changed");
            }
        }
    }

    #[test]
    fn second_identical_write_touches_nothing() {
        let mut dev = flash(2, 12, 8, 0x8000);
        let data = pattern(0x2345, 1);
        FlashIo::new(&mut dev).write(0x0FF0, &data, false).unwrap();
        assert_eq!(dev.erases.len(), 4);

        dev.erases.clear();
        dev.writes.clear();
        FlashIo::new(&mut dev).write(0x0FF0, &data, false).unwrap();
        assert!(dev.erases.is_empty());
        assert!(dev.writes.is_empty());
    }

    #[test]
    fn unaligned_write_page_count() {
        for (addr, len) in [(0x0u32, 0x1000usize), (0x7FF, 2), (0x1801, 0x1000), (0x2FFF, 0x2002)] {
            let mut dev = flash(0, 11, 4, 0x10000);
            dev.data.fill(0);
            FlashIo::new(&mut dev).write(addr, &pattern(len, 0x80), false).unwrap();

            let erase = 0x800u32;
            let expected = (len as u32 + (addr % erase)).div_ceil(erase);
            assert_eq!(dev.erases.len() as u32, expected, "write at {addr:#X}+{len:#X}");
            let mut pages = dev.erases.clone();
            pages.dedup();
            assert_eq!(pages.len(), dev.erases.len());
            assert_eq!(dev.data[addr as usize..addr as usize + len], pattern(len, 0x80));
        }
    }

    #[test]
    fn empty_write_is_a_no_op() {
        let mut dev = flash(0, 12, 8, 0x1000);
        FlashIo::new(&mut dev).write(0x10, &[], false).unwrap();
        assert_eq!(dev.reads, 0);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut dev = flash(0, 12, 8, 0x1000);
        let mut io = FlashIo::new(&mut dev);
        assert!(matches!(io.write(u32::MAX - 1, &[0; 4], false), Err(Error::InvalidRange)));
        assert!(matches!(io.read(u32::MAX, &mut [0; 2], false), Err(Error::InvalidRange)));
    }

    #[test]
    fn range_may_end_at_top_of_address_space() {
        // The mock reads past its backing store as erased bytes.
        let mut dev = flash(0, 12, 8, 0x1000);
        let mut io = FlashIo::new(&mut dev);
        let mut buf = [0u8; 4];
        io.read(u32::MAX - 3, &mut buf, false).unwrap();
        assert_eq!(buf, [0xFF; 4]);
        io.write(0xFFFF_F000, &[0xFF; 4], false).unwrap();
        io.write(u32::MAX - 3, &[0xFF; 4], false).unwrap();
        assert!(dev.erases.is_empty());
    }

    #[test]
    fn verification_failure_and_retry() {
        let mut dev = flash(0, 12, 8, 0x2000);
        dev.data.fill(0);
        dev.corrupt_writes = 1;
        let data = vec![0xABu8; 0x100];
        assert!(matches!(
            FlashIo::new(&mut dev).write(0, &data, false),
            Err(Error::Verify { address: 0 })
        ));

        dev.corrupt_writes = 1;
        dev.erases.clear();
        FlashIo::new(&mut dev).write_with_retry(0, &data, 3, false).unwrap();
        // The first attempt rewrote the page and failed again; the second
        // fixed it.
        assert_eq!(dev.erases, [0, 0]);
        assert_eq!(dev.data[..0x100], data[..]);
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let mut dev = flash(0, 12, 8, 0x2000);
        dev.data.fill(0);
        dev.corrupt_writes = usize::MAX;
        let res = FlashIo::new(&mut dev).write_with_retry(0, &[0x55; 0x10], 2, false);
        assert!(matches!(res, Err(Error::Verify { .. })));
        assert_eq!(dev.erases.len(), 2);
    }

    #[test]
    fn primitive_failures_propagate() {
        let mut dev = flash(0, 12, 8, 0x4000);
        dev.data.fill(0);
        dev.fail_erase_at = Some(0x1000);
        let err = FlashIo::new(&mut dev).write(0x800, &[0x11; 0x1000], false).unwrap_err();
        assert!(matches!(err, Error::Erase { address: 0x1000 }));
        // The first page was completed before the failure.
        assert_eq!(dev.data[0x800], 0x11);

        let mut dev = flash(0, 12, 8, 0x4000);
        dev.data.fill(0);
        dev.fail_write_at = Some(0x2000);
        let err = FlashIo::new(&mut dev).write(0x2000, &[0x22; 0x10], false).unwrap_err();
        assert!(matches!(err, Error::Write { address: 0x2000 }));
        // Retry after the fault clears only redoes the broken page.
        dev.fail_write_at = None;
        dev.erases.clear();
        FlashIo::new(&mut dev).write(0x2000, &[0x22; 0x10], false).unwrap();
        assert_eq!(dev.erases, [0x2000]);
    }

    #[test]
    fn edge_verification() {
        let mut dev = flash(0, 12, 8, 0x1000);
        dev.data[0x100..0x110].copy_from_slice(&pattern(0x10, 9));
        let mut io = FlashIo::new(&mut dev);
        io.verify_edges(0x100, &pattern(0x10, 9)).unwrap();

        // Middle bytes are not checked.
        let mut wrong = pattern(0x10, 9);
        wrong[8] ^= 0xFF;
        io.verify_edges(0x100, &wrong).unwrap();

        wrong[0xF] ^= 1;
        assert!(matches!(io.verify_edges(0x100, &wrong), Err(Error::Verify { address: 0x100 })));
        assert!(matches!(io.verify_edges(0x100, &[0x00, 0x01]), Err(Error::Verify { .. })));
    }

    #[test]
    fn progress_is_reported_with_label() {
        let mut dev = flash(0, 12, 8, 0x4000);
        let mut seen = Vec::new();
        let mut sink = |cur: u32, total: u32, label: &str| seen.push((cur, total, label.to_owned()));
        FlashIo::new(&mut dev)
            .with_progress(&mut sink)
            .write_labeled(0x800, &[0; 0x1000], true, "FIRM")
            .unwrap();
        assert_eq!(
            seen,
            [
                (0, 0x2000, "FIRM".to_owned()),
                (0x1000, 0x2000, "FIRM".to_owned()),
                (0x2000, 0x2000, "FIRM".to_owned()),
            ]
        );
    }
}

//! Byte range to LBA range translation

use crate::device::Geometry;
use flexalloc_common::{Error, Result};

/// An inclusive range of logical blocks
///
/// Constructors never fail: inputs that are misaligned, empty or run past
/// the end of the namespace yield a range with `valid == false` and all
/// other fields zeroed. Callers check [`LbaRange::is_valid`] before use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LbaRange {
    /// First block
    pub slba: u64,
    /// Last block (inclusive)
    pub elba: u64,
    /// Number of blocks, `elba - slba + 1`
    pub naddrs: u64,
    pub valid: bool,
}

impl LbaRange {
    /// Range covering `nbytes` bytes starting at byte `offset`
    ///
    /// Both values must be multiples of the block size.
    #[must_use]
    pub fn from_offset_nbytes(geo: &Geometry, offset: u64, nbytes: u64) -> Self {
        let lba = u64::from(geo.lba_nbytes);
        if lba == 0 || offset % lba != 0 || nbytes % lba != 0 {
            return Self::default();
        }
        Self::from_slba_naddrs(geo, offset / lba, nbytes / lba)
    }

    /// Range covering `naddrs` blocks starting at block `slba`
    #[must_use]
    pub fn from_slba_naddrs(geo: &Geometry, slba: u64, naddrs: u64) -> Self {
        if naddrs == 0 {
            return Self::default();
        }
        match slba.checked_add(naddrs) {
            Some(end) if end <= geo.nlbas() => Self {
                slba,
                elba: end - 1,
                naddrs,
                valid: true,
            },
            _ => Self::default(),
        }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// Size of the range in bytes
    #[must_use]
    pub const fn nbytes(&self, lba_nbytes: u32) -> u64 {
        self.naddrs * lba_nbytes as u64
    }

    pub(crate) fn require_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(Error::validation(
                "LBA range is misaligned, empty or beyond the end of the device",
            ))
        }
    }
}

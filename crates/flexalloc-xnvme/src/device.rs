//! Device collaborator contract
//!
//! The submission layer never talks to hardware directly. It consumes a
//! geometry description, a synchronous command primitive and an
//! asynchronous queue through the [`NvmeDevice`] trait.

use crate::queue::{AsyncIo, CommandQueue};
use crate::raw_io::AlignedBuffer;
use flexalloc_common::{CplStatus, Error, GeometryType, Opcode, Result, SubmitError, ZoneAction};

/// Smallest maximum-data-transfer size accepted by [`sanity_check`]
///
/// Some backends fall back to this value when they cannot query the
/// controller, which usually means the process lacks admin privileges.
pub const MIN_MDTS_NBYTES: u32 = 512;

/// Zone resource limits of a zoned namespace
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ZoneLimits {
    /// Maximum active resources
    pub max_active: u32,
    /// Maximum open resources
    pub max_open: u32,
}

/// Namespace geometry as reported by the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Conventional or zoned
    pub geo_type: GeometryType,
    /// Bytes per logical block
    pub lba_nbytes: u32,
    /// Total capacity in bytes
    pub tbytes: u64,
    /// Maximum data transfer per command in bytes
    pub mdts_nbytes: u32,
    /// Number of zones (zero for conventional namespaces)
    pub nzone: u32,
    /// Blocks per zone (zero for conventional namespaces)
    pub nsect: u64,
    /// Zone resource limits (zoned namespaces only)
    pub zone_limits: Option<ZoneLimits>,
}

impl Geometry {
    /// Geometry of a conventional namespace
    #[must_use]
    pub const fn conventional(lba_nbytes: u32, tbytes: u64, mdts_nbytes: u32) -> Self {
        Self {
            geo_type: GeometryType::Conventional,
            lba_nbytes,
            tbytes,
            mdts_nbytes,
            nzone: 0,
            nsect: 0,
            zone_limits: None,
        }
    }

    /// Geometry of a zoned namespace with `nzone` zones of `nsect` blocks
    #[must_use]
    pub const fn zoned(
        lba_nbytes: u32,
        nzone: u32,
        nsect: u64,
        mdts_nbytes: u32,
        limits: ZoneLimits,
    ) -> Self {
        Self {
            geo_type: GeometryType::Zoned,
            lba_nbytes,
            tbytes: nzone as u64 * nsect * lba_nbytes as u64,
            mdts_nbytes,
            nzone,
            nsect,
            zone_limits: Some(limits),
        }
    }

    /// Total number of addressable blocks
    #[must_use]
    pub const fn nlbas(&self) -> u64 {
        if self.lba_nbytes == 0 {
            0
        } else {
            self.tbytes / self.lba_nbytes as u64
        }
    }

    /// Maximum blocks per command
    ///
    /// Bounded by the 16-bit block count field of read/write commands.
    #[must_use]
    pub fn mdts_naddrs(&self) -> u32 {
        if self.lba_nbytes == 0 {
            return 0;
        }
        (self.mdts_nbytes / self.lba_nbytes).min(u32::from(u16::MAX))
    }

    #[must_use]
    pub const fn is_zoned(&self) -> bool {
        matches!(self.geo_type, GeometryType::Zoned)
    }

    /// Zone number holding `lba`, if the namespace is zoned
    #[must_use]
    pub const fn lba_to_zone(&self, lba: u64) -> Option<u64> {
        if self.is_zoned() && self.nsect > 0 {
            Some(lba / self.nsect)
        } else {
            None
        }
    }
}

/// One synchronous device command
///
/// `nlb` is zero-based: a value of 0 transfers one block.
#[derive(Debug)]
pub enum NvmCommand<'a> {
    Read {
        slba: u64,
        nlb: u16,
        buf: &'a mut [u8],
    },
    Write {
        slba: u64,
        nlb: u16,
        buf: &'a [u8],
    },
    WriteZeroes {
        slba: u64,
        nlb: u16,
    },
    ZoneMgmtSend {
        slba: u64,
        action: ZoneAction,
        all: bool,
    },
}

impl NvmCommand<'_> {
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Read { .. } => Opcode::Read,
            Self::Write { .. } => Opcode::Write,
            Self::WriteZeroes { .. } => Opcode::WriteZeroes,
            Self::ZoneMgmtSend { .. } => Opcode::ZoneMgmtSend,
        }
    }

    #[must_use]
    pub const fn slba(&self) -> u64 {
        match self {
            Self::Read { slba, .. }
            | Self::Write { slba, .. }
            | Self::WriteZeroes { slba, .. }
            | Self::ZoneMgmtSend { slba, .. } => *slba,
        }
    }

    /// Zero-based block count, if the command addresses a block range
    #[must_use]
    pub const fn nlb(&self) -> Option<u16> {
        match self {
            Self::Read { nlb, .. } | Self::Write { nlb, .. } | Self::WriteZeroes { nlb, .. } => {
                Some(*nlb)
            }
            Self::ZoneMgmtSend { .. } => None,
        }
    }
}

/// A namespace that can execute commands synchronously and through a queue
pub trait NvmeDevice {
    /// Asynchronous queue type handed out by [`NvmeDevice::queue_init`]
    type Queue<'a>: CommandQueue<'a>
    where
        Self: 'a;

    /// Namespace geometry
    fn geometry(&self) -> &Geometry;

    /// Namespace identifier
    fn nsid(&self) -> u32 {
        1
    }

    /// Submit one command and wait for its completion
    ///
    /// `Err` means the command never reached the device; `Ok` carries the
    /// completion status, which may itself be a failure.
    fn execute(&self, cmd: NvmCommand<'_>) -> std::result::Result<CplStatus, SubmitError>;

    /// Create an asynchronous queue with `capacity` entries
    ///
    /// Capacity must be a power of two. Failure is a resource error.
    fn queue_init<'a>(&'a self, capacity: u32) -> Result<Self::Queue<'a>>;

    /// Admission check for asynchronous submissions
    ///
    /// Backends with a device-side queue depth below the queue capacity
    /// report `Busy` here.
    fn admit(
        &self,
        _io: &AsyncIo<'_>,
        _outstanding: u32,
    ) -> std::result::Result<(), SubmitError> {
        Ok(())
    }

    /// Allocate a zeroed buffer aligned to the block size
    fn alloc_buf(&self, nbytes: usize) -> Result<AlignedBuffer> {
        AlignedBuffer::try_with_alignment(nbytes, self.geometry().lba_nbytes as usize)
    }
}

/// Reject devices whose transfer limit suggests missing privileges
///
/// Checks the data device and, when present, the metadata device.
pub fn sanity_check(geo: &Geometry, md_geo: Option<&Geometry>) -> Result<()> {
    for (name, geo) in std::iter::once(("device", geo)).chain(md_geo.map(|g| ("md device", g))) {
        if geo.mdts_nbytes <= MIN_MDTS_NBYTES {
            return Err(Error::geometry(format!(
                "{name} reports a maximum data transfer of {} bytes (<= {MIN_MDTS_NBYTES}); \
                 this usually means the process lacks administrative privileges",
                geo.mdts_nbytes
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mdts_naddrs_is_capped_by_count_field() {
        // 65536 blocks of 4 KB fits the MDTS but not the 16-bit count field
        let geo = Geometry::conventional(4096, 1 << 40, 65536 * 4096);
        assert_eq!(geo.mdts_naddrs(), 65535);

        let geo = Geometry::conventional(4096, 1 << 30, 128 * 1024);
        assert_eq!(geo.mdts_naddrs(), 32);

        let geo = Geometry::conventional(512, 1 << 30, 128 * 1024);
        assert_eq!(geo.mdts_naddrs(), 256);
    }

    #[test]
    fn test_zoned_geometry() {
        let limits = ZoneLimits {
            max_active: 14,
            max_open: 14,
        };
        let geo = Geometry::zoned(4096, 8, 256, 128 * 1024, limits);
        assert!(geo.is_zoned());
        assert_eq!(geo.tbytes, 8 * 256 * 4096);
        assert_eq!(geo.nlbas(), 8 * 256);
        assert_eq!(geo.lba_to_zone(0), Some(0));
        assert_eq!(geo.lba_to_zone(511), Some(1));
        assert_eq!(geo.zone_limits, Some(limits));

        let conv = Geometry::conventional(4096, 1 << 20, 4096);
        assert_eq!(conv.lba_to_zone(0), None);
    }

    #[test]
    fn test_sanity_check() {
        let good = Geometry::conventional(4096, 1 << 30, 128 * 1024);
        let bad = Geometry::conventional(512, 1 << 30, 512);

        sanity_check(&good, None).unwrap();
        sanity_check(&good, Some(&good)).unwrap();
        assert!(matches!(sanity_check(&bad, None), Err(Error::Geometry(_))));
        assert!(matches!(
            sanity_check(&good, Some(&bad)),
            Err(Error::Geometry(msg)) if msg.starts_with("md device")
        ));
    }

    #[test]
    fn test_command_accessors() {
        let mut buf = vec![0u8; 4096];
        let cmd = NvmCommand::Read {
            slba: 42,
            nlb: 0,
            buf: &mut buf,
        };
        assert_eq!(cmd.opcode(), Opcode::Read);
        assert_eq!(cmd.slba(), 42);
        assert_eq!(cmd.nlb(), Some(0));

        let cmd = NvmCommand::ZoneMgmtSend {
            slba: 0,
            action: ZoneAction::Reset,
            all: true,
        };
        assert_eq!(cmd.opcode(), Opcode::ZoneMgmtSend);
        assert_eq!(cmd.nlb(), None);
    }
}

//! Device-facing value types
//!
//! These types describe commands, their outcomes and device geometry kinds.
//! They are shared between the submission layer and the error taxonomy.

use derive_more::Display;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a data transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
}

impl Direction {
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

/// Kind of namespace geometry reported by the device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryType {
    /// Conventional block namespace
    #[default]
    #[display("conventional")]
    Conventional,
    /// Zoned namespace (sequential-write zones with explicit management)
    #[display("zoned")]
    Zoned,
}

/// Command opcode, used to label failures and the command log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Opcode {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    #[display("write-zeroes")]
    WriteZeroes,
    #[display("zone-mgmt-send")]
    ZoneMgmtSend,
}

impl From<Direction> for Opcode {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Read => Self::Read,
            Direction::Write => Self::Write,
        }
    }
}

/// Completion status of a device command
///
/// Holds the combined status code type and status code; zero is success.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CplStatus(u16);

impl CplStatus {
    pub const SUCCESS: Self = Self(0x0000);
    pub const INVALID_OPCODE: Self = Self(0x0001);
    pub const INVALID_FIELD: Self = Self(0x0002);
    pub const INTERNAL_ERROR: Self = Self(0x0006);
    pub const LBA_OUT_OF_RANGE: Self = Self(0x0080);
    pub const ZONE_BOUNDARY_ERROR: Self = Self(0x01B8);
    pub const ZONE_INVALID_WRITE: Self = Self(0x01BC);
    pub const ZONE_INVALID_TRANSITION: Self = Self(0x01BF);

    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Status code type (bits 8..11)
    #[must_use]
    pub const fn sct(self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    /// Status code (bits 0..8)
    #[must_use]
    pub const fn sc(self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl fmt::Debug for CplStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CplStatus(sct={:#x}, sc={:#04x})", self.sct(), self.sc())
    }
}

impl fmt::Display for CplStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Reason a command could not be submitted
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Queue is full; retry after draining a completion
    #[error("queue busy")]
    Busy,

    /// Resources temporarily unavailable; retry after draining a completion
    #[error("resource temporarily unavailable")]
    Again,

    /// Submission refused outright
    #[error("submission rejected: {0}")]
    Rejected(Errno),
}

impl SubmitError {
    /// Map a raw errno onto the submission taxonomy
    #[must_use]
    pub const fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::EBUSY => Self::Busy,
            Errno::EAGAIN => Self::Again,
            other => Self::Rejected(other),
        }
    }

    #[must_use]
    pub const fn errno(self) -> Errno {
        match self {
            Self::Busy => Errno::EBUSY,
            Self::Again => Errno::EAGAIN,
            Self::Rejected(errno) => errno,
        }
    }

    /// Backpressure conditions that a drain-and-retry can resolve
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Busy | Self::Again)
    }
}

/// Zone management send actions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ZoneAction {
    #[display("close")]
    Close = 0x01,
    #[display("finish")]
    Finish = 0x02,
    #[display("open")]
    Open = 0x03,
    #[display("reset")]
    Reset = 0x04,
    #[display("offline")]
    Offline = 0x05,
    #[display("set-zde")]
    SetDescriptorExtension = 0x10,
}

impl ZoneAction {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_error_from_errno() {
        assert_eq!(SubmitError::from_errno(Errno::EBUSY), SubmitError::Busy);
        assert_eq!(SubmitError::from_errno(Errno::EAGAIN), SubmitError::Again);
        assert_eq!(
            SubmitError::from_errno(Errno::EIO),
            SubmitError::Rejected(Errno::EIO)
        );
        assert!(SubmitError::Busy.is_transient());
        assert!(SubmitError::Again.is_transient());
        assert!(!SubmitError::Rejected(Errno::EINVAL).is_transient());
        assert_eq!(SubmitError::Rejected(Errno::EIO).errno(), Errno::EIO);
    }

    #[test]
    fn test_cpl_status_fields() {
        assert!(CplStatus::SUCCESS.is_success());
        assert!(!CplStatus::INTERNAL_ERROR.is_success());

        let status = CplStatus::ZONE_INVALID_TRANSITION;
        assert_eq!(status.sct(), 1);
        assert_eq!(status.sc(), 0xbf);
        assert_eq!(status.to_string(), "0x01bf");
    }

    #[test]
    fn test_opcode_from_direction() {
        assert_eq!(Opcode::from(Direction::Read), Opcode::Read);
        assert_eq!(Opcode::from(Direction::Write), Opcode::Write);
        assert!(Direction::Write.is_write());
        assert_eq!(Opcode::WriteZeroes.to_string(), "write-zeroes");
    }

    #[test]
    fn test_zone_action_codes() {
        assert_eq!(ZoneAction::Reset.code(), 0x04);
        assert_eq!(ZoneAction::SetDescriptorExtension.code(), 0x10);
        assert_eq!(ZoneAction::Finish.to_string(), "finish");
    }
}

//! Chunked synchronous I/O
//!
//! A sequential transfer over an LBA range is split into consecutive
//! commands of at most [`Geometry::mdts_naddrs`] blocks. The first failing
//! command aborts the transfer; earlier segments are not rolled back.
//!
//! [`Geometry::mdts_naddrs`]: crate::device::Geometry::mdts_naddrs

use crate::device::{NvmCommand, NvmeDevice};
use crate::range::LbaRange;
use flexalloc_common::{Error, Opcode, Result};
use tracing::{debug, error};

/// Data side of a sequential transfer
#[derive(Debug)]
pub enum SeqOp<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
    WriteZeroes,
}

impl SeqOp<'_> {
    const fn opcode(&self) -> Opcode {
        match self {
            Self::Read(_) => Opcode::Read,
            Self::Write(_) => Opcode::Write,
            Self::WriteZeroes => Opcode::WriteZeroes,
        }
    }

    const fn buf_len(&self) -> Option<usize> {
        match self {
            Self::Read(buf) => Some(buf.len()),
            Self::Write(buf) => Some(buf.len()),
            Self::WriteZeroes => None,
        }
    }
}

/// Transfer `range` with as few device commands as the transfer limit allows
pub fn transfer<D>(dev: &D, range: &LbaRange, mut op: SeqOp<'_>) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    range.require_valid()?;
    let geo = dev.geometry();
    let lba = geo.lba_nbytes as usize;
    let max_naddrs = u64::from(geo.mdts_naddrs());
    if max_naddrs == 0 {
        return Err(Error::geometry(format!(
            "maximum transfer of {} bytes is smaller than one {lba}-byte block",
            geo.mdts_nbytes
        )));
    }
    let opcode = op.opcode();
    if let Some(len) = op.buf_len() {
        let needed = range.nbytes(geo.lba_nbytes);
        if (len as u64) < needed {
            return Err(Error::validation(format!(
                "{opcode} of {needed} bytes with a buffer of {len} bytes"
            )));
        }
    }

    debug!(
        %opcode,
        slba = range.slba,
        naddrs = range.naddrs,
        segments = range.naddrs.div_ceil(max_naddrs),
        "sequential transfer"
    );

    let mut slba = range.slba;
    let mut offset = 0usize;
    while slba <= range.elba {
        let naddrs = (range.elba - slba + 1).min(max_naddrs);
        let nlb = (naddrs - 1) as u16;
        let end = offset + naddrs as usize * lba;

        let cmd = match &mut op {
            SeqOp::Read(buf) => NvmCommand::Read {
                slba,
                nlb,
                buf: &mut buf[offset..end],
            },
            SeqOp::Write(buf) => NvmCommand::Write {
                slba,
                nlb,
                buf: &buf[offset..end],
            },
            SeqOp::WriteZeroes => NvmCommand::WriteZeroes { slba, nlb },
        };

        match dev.execute(cmd) {
            Ok(status) if status.is_success() => {}
            Ok(status) => {
                error!(%opcode, slba, nlb, %status, "sequential command failed");
                return Err(Error::Completion {
                    op: opcode,
                    slba,
                    status,
                });
            }
            Err(e) => {
                error!(%opcode, slba, nlb, "sequential command not submitted: {}", e);
                return Err(Error::Submission {
                    op: opcode,
                    slba,
                    error: e,
                });
            }
        }

        slba += naddrs;
        offset = end;
    }
    Ok(())
}

pub fn read_range<D>(dev: &D, range: &LbaRange, buf: &mut [u8]) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    transfer(dev, range, SeqOp::Read(buf))
}

pub fn write_range<D>(dev: &D, range: &LbaRange, buf: &[u8]) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    transfer(dev, range, SeqOp::Write(buf))
}

pub fn write_zeroes_range<D>(dev: &D, range: &LbaRange) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    transfer(dev, range, SeqOp::WriteZeroes)
}

/// Read `naddrs` blocks starting at `slba`
pub fn read_blocks<D>(dev: &D, slba: u64, naddrs: u64, buf: &mut [u8]) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    read_range(dev, &LbaRange::from_slba_naddrs(dev.geometry(), slba, naddrs), buf)
}

/// Write `naddrs` blocks starting at `slba`
pub fn write_blocks<D>(dev: &D, slba: u64, naddrs: u64, buf: &[u8]) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    write_range(dev, &LbaRange::from_slba_naddrs(dev.geometry(), slba, naddrs), buf)
}

pub fn write_zeroes_blocks<D>(dev: &D, slba: u64, naddrs: u64) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    write_zeroes_range(dev, &LbaRange::from_slba_naddrs(dev.geometry(), slba, naddrs))
}

/// Read `nbytes` bytes at byte `offset`; both must be block aligned
pub fn read_bytes<D>(dev: &D, offset: u64, nbytes: u64, buf: &mut [u8]) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    read_range(dev, &LbaRange::from_offset_nbytes(dev.geometry(), offset, nbytes), buf)
}

/// Write `nbytes` bytes at byte `offset`; both must be block aligned
pub fn write_bytes<D>(dev: &D, offset: u64, nbytes: u64, buf: &[u8]) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    write_range(dev, &LbaRange::from_offset_nbytes(dev.geometry(), offset, nbytes), buf)
}

pub fn write_zeroes_bytes<D>(dev: &D, offset: u64, nbytes: u64) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    write_zeroes_range(dev, &LbaRange::from_offset_nbytes(dev.geometry(), offset, nbytes))
}

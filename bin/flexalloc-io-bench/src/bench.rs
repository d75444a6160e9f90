//! Bench phases

use flexalloc_common::config::StripeConfig;
use flexalloc_common::{Direction, Result};
use flexalloc_xnvme::{AlignedBuffer, FileDevice, NvmeDevice, StripeEngine, StripeParams, seq};
use rand::RngCore;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Chunked synchronous write and read at offset 0
    Sequential,
    /// Striped asynchronous write and read over the configured layout
    Striped,
    /// Write-zeroes over a random pattern, verified by a sequential read
    Zeroes,
}

impl Phase {
    const fn name(self) -> &'static str {
        match self {
            Self::Sequential => "seq",
            Self::Striped => "stripe",
            Self::Zeroes => "zero",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one phase
#[derive(Debug, Serialize)]
pub struct PhaseResult {
    pub phase: &'static str,
    pub nbytes: u64,
    pub write_ms: f64,
    pub read_ms: f64,
    pub write_mib_s: f64,
    pub read_mib_s: f64,
    /// Device commands issued by the striped write, if striped
    pub commands: Option<u32>,
    pub expected_crc: u32,
    pub actual_crc: u32,
    pub verified: bool,
}

impl PhaseResult {
    fn new(
        phase: Phase,
        nbytes: u64,
        write: Duration,
        read: Duration,
        expected_crc: u32,
        actual_crc: u32,
    ) -> Self {
        Self {
            phase: phase.name(),
            nbytes,
            write_ms: write.as_secs_f64() * 1000.0,
            read_ms: read.as_secs_f64() * 1000.0,
            write_mib_s: mib_per_sec(nbytes, write),
            read_mib_s: mib_per_sec(nbytes, read),
            commands: None,
            expected_crc,
            actual_crc,
            verified: expected_crc == actual_crc,
        }
    }

    pub fn log(&self) {
        if self.verified {
            info!(
                "{}: {} bytes, write {:.1} MiB/s, read {:.1} MiB/s, crc32c {:#010x}",
                self.phase, self.nbytes, self.write_mib_s, self.read_mib_s, self.actual_crc
            );
        } else {
            warn!(
                "{}: checksum mismatch, expected {:#010x}, read back {:#010x}",
                self.phase, self.expected_crc, self.actual_crc
            );
        }
    }
}

fn mib_per_sec(nbytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    nbytes as f64 / (1024.0 * 1024.0) / secs
}

/// Runs phases against one device
pub struct Bench<'d> {
    dev: &'d FileDevice,
    stripe: &'d StripeConfig,
    xfer_nbytes: u64,
}

impl<'d> Bench<'d> {
    pub const fn new(dev: &'d FileDevice, stripe: &'d StripeConfig, xfer_nbytes: u64) -> Self {
        Self {
            dev,
            stripe,
            xfer_nbytes,
        }
    }

    pub fn run(&self, phase: Phase) -> Result<PhaseResult> {
        debug!(%phase, xfer_nbytes = self.xfer_nbytes, "starting phase");
        match phase {
            Phase::Sequential => self.sequential(),
            Phase::Striped => self.striped(),
            Phase::Zeroes => self.zeroes(),
        }
    }

    fn pattern(&self) -> Result<AlignedBuffer> {
        let mut buf = self.dev.alloc_buf(self.xfer_nbytes as usize)?;
        rand::thread_rng().fill_bytes(&mut buf);
        Ok(buf)
    }

    fn sequential(&self) -> Result<PhaseResult> {
        let data = self.pattern()?;
        let expected = crc32c::crc32c(&data);

        let start = Instant::now();
        seq::write_bytes(self.dev, 0, self.xfer_nbytes, &data)?;
        let write = start.elapsed();

        let mut out = self.dev.alloc_buf(data.len())?;
        let start = Instant::now();
        seq::read_bytes(self.dev, 0, self.xfer_nbytes, &mut out)?;
        let read = start.elapsed();

        let actual = crc32c::crc32c(&out);
        Ok(PhaseResult::new(
            Phase::Sequential,
            self.xfer_nbytes,
            write,
            read,
            expected,
            actual,
        ))
    }

    fn striped(&self) -> Result<PhaseResult> {
        let data = self.pattern()?;
        let expected = crc32c::crc32c(&data);
        let engine = StripeEngine::new(self.dev);
        let geo = self.dev.geometry();

        let sp = StripeParams::from_config(self.stripe, geo, 0, self.xfer_nbytes, Direction::Write);
        let start = Instant::now();
        let report = engine.write(&data, &sp)?;
        let write = start.elapsed();
        debug!(
            commands = report.commands(),
            members = report.members.len(),
            "striped write finished"
        );

        let sp = StripeParams {
            direction: Direction::Read,
            ..sp
        };
        let mut out = self.dev.alloc_buf(data.len())?;
        let start = Instant::now();
        engine.read(&mut out, &sp)?;
        let read = start.elapsed();

        let actual = crc32c::crc32c(&out);
        let mut result = PhaseResult::new(
            Phase::Striped,
            self.xfer_nbytes,
            write,
            read,
            expected,
            actual,
        );
        result.commands = Some(report.commands());
        Ok(result)
    }

    fn zeroes(&self) -> Result<PhaseResult> {
        let data = self.pattern()?;
        seq::write_bytes(self.dev, 0, self.xfer_nbytes, &data)?;

        let start = Instant::now();
        seq::write_zeroes_bytes(self.dev, 0, self.xfer_nbytes)?;
        let write = start.elapsed();

        let mut out = self.pattern()?;
        let start = Instant::now();
        seq::read_bytes(self.dev, 0, self.xfer_nbytes, &mut out)?;
        let read = start.elapsed();

        let expected = crc32c::crc32c(&vec![0u8; out.len()]);
        let actual = crc32c::crc32c(&out);
        Ok(PhaseResult::new(
            Phase::Zeroes,
            self.xfer_nbytes,
            write,
            read,
            expected,
            actual,
        ))
    }
}

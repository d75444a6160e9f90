//! Stripe address translation
//!
//! A striped transfer addresses a virtual byte space that is dealt out to
//! `width` members in chunks of `chunk_nbytes`, round robin. Each member
//! owns `obj_nlbs` contiguous blocks on the device, the members laid out
//! back to back from `obj_start_nbytes`.
//!
//! ```text
//! virtual:  | c0 | c1 | c2 | c3 | c4 | c5 | c6 | c7 | ...      (width = 4)
//!              │    │    │    │    │
//! device:   | c0 c4 .. | c1 c5 .. | c2 c6 .. | c3 c7 .. |
//!            member 0   member 1   member 2   member 3
//! ```
//!
//! The caller's buffer is in virtual (global) order, so a member's
//! consecutive chunks sit `chunk_nbytes * width` apart in the buffer.

use crate::device::Geometry;
use flexalloc_common::config::StripeConfig;
use flexalloc_common::{Direction, Error, Result};

pub use flexalloc_common::config::{MAX_CHUNK_NLBS, MAX_STRIPE_WIDTH};

/// Map `zoffset` in a space cut into `chunk`-sized pieces onto a space
/// where consecutive pieces are `step` apart
///
/// `translate(z, c, s) = z % c + (z / c) * s`
///
/// # Panics
/// Panics if `chunk` is zero.
#[must_use]
pub const fn translate(zoffset: u64, chunk: u64, step: u64) -> u64 {
    zoffset % chunk + (zoffset / chunk) * step
}

/// Immutable description of one striped transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripeParams {
    /// Transfer length in bytes
    pub xfer_nbytes: u64,
    /// Transfer start in the striped virtual space
    pub xfer_snbytes: u64,
    /// Bytes placed on one member before moving to the next
    pub chunk_nbytes: u64,
    /// Number of members
    pub width: u32,
    /// Blocks owned by each member
    pub obj_nlbs: u64,
    /// Device byte offset of member 0
    pub obj_start_nbytes: u64,
    pub lba_nbytes: u32,
    pub direction: Direction,
}

impl StripeParams {
    /// Build parameters for a transfer using the configured stripe layout
    #[must_use]
    pub const fn from_config(
        config: &StripeConfig,
        geo: &Geometry,
        xfer_snbytes: u64,
        xfer_nbytes: u64,
        direction: Direction,
    ) -> Self {
        Self {
            xfer_nbytes,
            xfer_snbytes,
            chunk_nbytes: config.chunk_nbytes,
            width: config.width,
            obj_nlbs: config.obj_nlbs,
            obj_start_nbytes: config.obj_start_nbytes,
            lba_nbytes: geo.lba_nbytes,
            direction,
        }
    }

    /// Bytes owned by each member
    #[must_use]
    pub const fn obj_nbytes(&self) -> u64 {
        self.obj_nlbs * self.lba_nbytes as u64
    }

    /// Bytes addressable through the striped virtual space
    #[must_use]
    pub const fn stripe_nbytes(&self) -> u64 {
        self.width as u64 * self.obj_nbytes()
    }

    /// Check alignment and bounds; every other method assumes this passed
    pub fn validate(&self) -> Result<()> {
        let lba = u64::from(self.lba_nbytes);
        if lba == 0 {
            return Err(Error::validation("block size is zero"));
        }
        if self.width == 0 || self.width > MAX_STRIPE_WIDTH {
            return Err(Error::validation(format!(
                "stripe width {} outside 1..={MAX_STRIPE_WIDTH}",
                self.width
            )));
        }
        if self.xfer_nbytes % lba != 0 || self.xfer_snbytes % lba != 0 {
            return Err(Error::validation(format!(
                "transfer of {} bytes at {} is not aligned to {lba}",
                self.xfer_nbytes, self.xfer_snbytes
            )));
        }
        if self.chunk_nbytes == 0 || self.chunk_nbytes % lba != 0 {
            return Err(Error::validation(format!(
                "chunk size {} is not a non-zero multiple of {lba}",
                self.chunk_nbytes
            )));
        }
        if self.chunk_nbytes / lba > MAX_CHUNK_NLBS {
            return Err(Error::validation(format!(
                "chunk of {} blocks exceeds the per-command limit of {MAX_CHUNK_NLBS}",
                self.chunk_nbytes / lba
            )));
        }
        if self.obj_start_nbytes % lba != 0 {
            return Err(Error::validation(format!(
                "member start offset {} is not aligned to {lba}",
                self.obj_start_nbytes
            )));
        }

        let obj_nbytes = self
            .obj_nlbs
            .checked_mul(lba)
            .filter(|&n| n > 0 && n % self.chunk_nbytes == 0)
            .ok_or_else(|| {
                Error::validation(format!(
                    "member capacity of {} blocks is not a non-zero multiple of the chunk size",
                    self.obj_nlbs
                ))
            })?;
        let stripe_nbytes = obj_nbytes
            .checked_mul(u64::from(self.width))
            .and_then(|n| n.checked_add(self.obj_start_nbytes).map(|_| n))
            .ok_or_else(|| Error::validation("stripe size overflows the address space"))?;

        // First translation step must not overflow for any in-range offset
        (stripe_nbytes / self.chunk_nbytes)
            .checked_mul(obj_nbytes)
            .ok_or_else(|| Error::validation("stripe size overflows the address space"))?;

        match self.xfer_snbytes.checked_add(self.xfer_nbytes) {
            Some(end) if end <= stripe_nbytes => Ok(()),
            _ => Err(Error::validation(format!(
                "transfer of {} bytes at {} exceeds the stripe size {stripe_nbytes}",
                self.xfer_nbytes, self.xfer_snbytes
            ))),
        }
    }

    /// Device LBA holding byte `sbuf_nbytes` of the transfer
    #[must_use]
    pub const fn slba_at(&self, sbuf_nbytes: u64) -> u64 {
        let zoffset = self.xfer_snbytes + sbuf_nbytes;
        let obj_offset = translate(zoffset, self.chunk_nbytes, self.obj_nbytes());
        let dev_offset = translate(obj_offset, self.stripe_nbytes(), self.chunk_nbytes);
        (dev_offset + self.obj_start_nbytes) / self.lba_nbytes as u64
    }

    /// Bytes from `sbuf_nbytes` to the end of its chunk or the transfer
    ///
    /// Only the first chunk of a member can start inside a chunk; for every
    /// later one this is `min(chunk_nbytes, remaining)`.
    #[must_use]
    pub const fn chunk_nbytes_at(&self, sbuf_nbytes: u64) -> u64 {
        let into_chunk = (self.xfer_snbytes + sbuf_nbytes) % self.chunk_nbytes;
        let remaining = self.xfer_nbytes - sbuf_nbytes;
        let left_in_chunk = self.chunk_nbytes - into_chunk;
        if remaining < left_in_chunk {
            remaining
        } else {
            left_in_chunk
        }
    }

    /// Zero-based block count of the command starting at `sbuf_nbytes`
    #[must_use]
    pub const fn nlb_at(&self, sbuf_nbytes: u64) -> u16 {
        (self.chunk_nbytes_at(sbuf_nbytes) / self.lba_nbytes as u64 - 1) as u16
    }

    /// Buffer offset of a member's next chunk after transferring `nlb + 1`
    /// blocks at `sbuf_nbytes`
    #[must_use]
    pub const fn next_sbuf(&self, sbuf_nbytes: u64, nlb: u16) -> u64 {
        sbuf_nbytes
            + (nlb as u64 + 1) * self.lba_nbytes as u64
            + self.chunk_nbytes * (self.width as u64 - 1)
    }

    /// Chunk lengths in buffer order
    ///
    /// Chunk `k` belongs to the member chain `k % width`.
    pub fn segments(&self) -> impl Iterator<Item = u64> + '_ {
        let mut sbuf = 0;
        std::iter::from_fn(move || {
            if sbuf >= self.xfer_nbytes {
                return None;
            }
            let len = self.chunk_nbytes_at(sbuf);
            sbuf += len;
            Some(len)
        })
    }
}

/// Progress of one member chain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StripeCursor {
    /// LBA of the command in flight
    pub slba: u64,
    /// Zero-based block count of the command in flight
    pub nlb: u16,
    /// Buffer offset of the command in flight
    pub sbuf_nbytes: u64,
    pub submitted: u32,
    pub completed: u32,
    /// Commands that completed with a failure status
    pub ecount: u32,
}

impl StripeCursor {
    /// Cursor positioned on the chunk at `sbuf_nbytes`
    #[must_use]
    pub const fn start(sp: &StripeParams, sbuf_nbytes: u64) -> Self {
        Self {
            slba: sp.slba_at(sbuf_nbytes),
            nlb: sp.nlb_at(sbuf_nbytes),
            sbuf_nbytes,
            submitted: 0,
            completed: 0,
            ecount: 0,
        }
    }

    /// Move to the member's next chunk; `false` once the transfer is exhausted
    pub const fn advance(&mut self, sp: &StripeParams) -> bool {
        let next = sp.next_sbuf(self.sbuf_nbytes, self.nlb);
        self.sbuf_nbytes = next;
        if next >= sp.xfer_nbytes {
            return false;
        }
        // Same member, next row: directly after the chunk just transferred
        self.slba += self.nlb as u64 + 1;
        self.nlb = sp.nlb_at(next);
        true
    }

    /// Bytes covered by the command in flight
    #[must_use]
    pub const fn nbytes(&self, lba_nbytes: u32) -> u64 {
        (self.nlb as u64 + 1) * lba_nbytes as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(width: u32, chunk: u64, xfer_snbytes: u64, xfer_nbytes: u64) -> StripeParams {
        StripeParams {
            xfer_nbytes,
            xfer_snbytes,
            chunk_nbytes: chunk,
            width,
            obj_nlbs: 256,
            obj_start_nbytes: 0,
            lba_nbytes: 4096,
            direction: Direction::Write,
        }
    }

    #[test]
    fn test_translate() {
        assert_eq!(translate(0, 4096, 1 << 20), 0);
        assert_eq!(translate(4095, 4096, 1 << 20), 4095);
        assert_eq!(translate(4096, 4096, 1 << 20), 1 << 20);
        assert_eq!(translate(2 * 4096 + 7, 4096, 100), 207);
    }

    #[test]
    fn test_four_wide_layout() {
        // 1 MiB per member, 16 KiB transfer: one chunk per member
        let sp = params(4, 4096, 0, 16384);
        sp.validate().unwrap();
        assert_eq!(sp.obj_nbytes(), 1 << 20);

        let segments: Vec<u64> = sp.segments().collect();
        assert_eq!(segments, vec![4096; 4]);

        for member in 0..4u64 {
            let mut cursor = StripeCursor::start(&sp, member * 4096);
            assert_eq!(cursor.slba, member * 256);
            assert_eq!(cursor.nlb, 0);
            assert!(!cursor.advance(&sp));
        }
    }

    #[test]
    fn test_second_row() {
        let sp = params(4, 4096, 0, 8 * 4096);
        let mut cursor = StripeCursor::start(&sp, 4096);
        assert_eq!(cursor.slba, 256);
        assert!(cursor.advance(&sp));
        assert_eq!(cursor.sbuf_nbytes, 5 * 4096);
        assert_eq!(cursor.slba, 257);
        assert_eq!(cursor.slba, sp.slba_at(cursor.sbuf_nbytes));
        assert!(!cursor.advance(&sp));
    }

    #[test]
    fn test_unaligned_start_shortens_first_chunk() {
        // Start one block into chunk 1 (member 1), 16 KB chunks
        let sp = params(2, 16384, 16384 + 4096, 40960);
        sp.validate().unwrap();

        let segments: Vec<u64> = sp.segments().collect();
        assert_eq!(segments, vec![12288, 16384, 12288]);

        let first = StripeCursor::start(&sp, 0);
        assert_eq!(first.slba, 256 + 1);
        assert_eq!(first.nlb, 2);

        let second = StripeCursor::start(&sp, 12288);
        assert_eq!(second.slba, 4);
        assert_eq!(second.nlb, 3);
    }

    #[test]
    fn test_short_transfer_limits_first_chunk() {
        // Remaining bytes, not the chunk size, bound the first command
        let sp = params(4, 16384, 4096, 4096);
        let cursor = StripeCursor::start(&sp, 0);
        assert_eq!(cursor.nlb, 0);
        assert_eq!(sp.segments().count(), 1);
    }

    #[test]
    fn test_member_start_offset() {
        let mut sp = params(2, 4096, 0, 8192);
        sp.obj_start_nbytes = 1 << 20;
        assert_eq!(StripeCursor::start(&sp, 0).slba, 256);
        assert_eq!(StripeCursor::start(&sp, 4096).slba, 512);
    }

    #[test]
    fn test_validate() {
        let sp = params(4, 4096, 0, 16384);
        sp.validate().unwrap();

        let mut bad = sp.clone();
        bad.width = MAX_STRIPE_WIDTH + 1;
        assert!(matches!(bad.validate(), Err(Error::Validation(_))));

        let mut bad = sp.clone();
        bad.width = 0;
        assert!(bad.validate().is_err());

        let mut bad = sp.clone();
        bad.xfer_nbytes = 1000;
        assert!(bad.validate().is_err());

        let mut bad = sp.clone();
        bad.xfer_snbytes = 512;
        assert!(bad.validate().is_err());

        let mut bad = sp.clone();
        bad.chunk_nbytes = 6000;
        assert!(bad.validate().is_err());

        let mut bad = sp.clone();
        bad.chunk_nbytes = 4096 * 65537;
        bad.obj_nlbs = 65537 * 2;
        assert!(bad.validate().is_err());

        let mut bad = sp.clone();
        bad.obj_nlbs = 3;
        bad.chunk_nbytes = 8192;
        assert!(bad.validate().is_err());

        let mut bad = sp.clone();
        bad.xfer_snbytes = 4 << 20;
        assert!(bad.validate().is_err());

        let mut bad = sp;
        bad.obj_nlbs = u64::MAX / 4096;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_from_config() {
        let config = StripeConfig::default();
        let geo = Geometry::conventional(4096, 1 << 30, 128 * 1024);
        let sp = StripeParams::from_config(&config, &geo, 0, 65536, Direction::Read);
        assert_eq!(sp.width, config.width);
        assert_eq!(sp.lba_nbytes, 4096);
        sp.validate().unwrap();
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn translate_of_zero_is_zero(chunk in 1u64..1 << 32, step in 0u64..1 << 32) {
                prop_assert_eq!(translate(0, chunk, step), 0);
                prop_assert_eq!(
                    translate(12345, chunk, step),
                    translate(12345, chunk, step)
                );
            }

            /// Chains cover every buffer byte exactly once, at the LBA the
            /// direct translation gives
            #[test]
            fn cursors_conserve_the_transfer(
                width in 1u32..=16,
                chunk_nlbs in 1u64..=8,
                rows in 1u64..=8,
                start_nlbs in 0u64..64,
                xfer_nlbs in 1u64..256,
            ) {
                let lba = 512u64;
                let stripe_nlbs = u64::from(width) * chunk_nlbs * rows;
                let start_nlbs = start_nlbs % stripe_nlbs;
                let xfer_nlbs = 1 + xfer_nlbs % (stripe_nlbs - start_nlbs);
                let sp = StripeParams {
                    xfer_nbytes: xfer_nlbs * lba,
                    xfer_snbytes: start_nlbs * lba,
                    chunk_nbytes: chunk_nlbs * lba,
                    width,
                    obj_nlbs: chunk_nlbs * rows,
                    obj_start_nbytes: 0,
                    lba_nbytes: 512,
                    direction: Direction::Write,
                };
                prop_assert!(sp.validate().is_ok());

                let segments: Vec<u64> = sp.segments().collect();
                let mut covered = vec![0u8; sp.xfer_nbytes as usize];
                let mut lbas = std::collections::HashSet::new();
                let chains = segments.len().min(width as usize);
                let mut seg_offset = 0u64;
                let offsets: Vec<u64> = segments
                    .iter()
                    .map(|len| {
                        let off = seg_offset;
                        seg_offset += len;
                        off
                    })
                    .collect();

                for chain in 0..chains {
                    let mut cursor = StripeCursor::start(&sp, offsets[chain]);
                    let mut k = chain;
                    loop {
                        prop_assert_eq!(cursor.sbuf_nbytes, offsets[k]);
                        prop_assert_eq!(cursor.nbytes(sp.lba_nbytes), segments[k]);
                        prop_assert_eq!(cursor.slba, sp.slba_at(cursor.sbuf_nbytes));
                        for b in 0..=u64::from(cursor.nlb) {
                            prop_assert!(lbas.insert(cursor.slba + b));
                        }
                        let range = cursor.sbuf_nbytes as usize
                            ..(cursor.sbuf_nbytes + cursor.nbytes(sp.lba_nbytes)) as usize;
                        for byte in &mut covered[range] {
                            *byte += 1;
                        }
                        if !cursor.advance(&sp) {
                            break;
                        }
                        k += width as usize;
                    }
                }

                prop_assert!(covered.iter().all(|&n| n == 1));
                prop_assert_eq!(segments.iter().sum::<u64>(), sp.xfer_nbytes);
                prop_assert!(lbas.iter().all(|&l| l < sp.stripe_nbytes() / lba));
            }
        }
    }
}

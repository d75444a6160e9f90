#![allow(clippy::result_large_err)]
//! Flexalloc xNVMe environment - block I/O submission layer
//!
//! This crate turns byte-addressed, possibly striped transfer requests into
//! device commands:
//! - LBA range translation (`range`)
//! - Stripe address translation (`stripe`)
//! - Striped asynchronous engine (`striped`)
//! - Chunked synchronous I/O bounded by the device transfer size (`seq`)
//! - Zone management dispatch (`zone`)
//!
//! The device itself is a collaborator behind the [`NvmeDevice`] trait.
//! Two backends ship with the crate: a file-backed device (`raw_io`) and an
//! in-memory device with fault injection (`mem`).
//!
//! ```text
//! caller buffer ──► range / stripe translation ──► NvmeDevice::execute      (seq, zone)
//!                                              └─► CommandQueue::submit     (striped)
//!                                                      │ poke / wait
//!                                                      ▼
//!                                              CompletionHandler (per-member resubmit)
//! ```

pub mod device;
pub mod mem;
pub mod queue;
pub mod range;
pub mod raw_io;
pub mod seq;
pub mod stripe;
pub mod striped;
pub mod zone;

// Re-exports
pub use device::{Geometry, MIN_MDTS_NBYTES, NvmCommand, NvmeDevice, ZoneLimits, sanity_check};
pub use flexalloc_common::{
    CplStatus, Direction, Error, GeometryType, Opcode, Result, SubmitError, ZoneAction,
};
pub use mem::{CommandRecord, FaultPlan, MemDevice, ZoneState};
pub use queue::{AsyncIo, CmdCtx, CommandQueue, CompletionHandler, EmulatedQueue, IoBuf, Rejected};
pub use range::LbaRange;
pub use raw_io::{AlignedBuffer, FileDevice};
pub use stripe::{MAX_CHUNK_NLBS, MAX_STRIPE_WIDTH, StripeCursor, StripeParams, translate};
pub use striped::{MemberReport, MemberState, SUBMIT_RETRY_LIMIT, StripeEngine, StripeReport};

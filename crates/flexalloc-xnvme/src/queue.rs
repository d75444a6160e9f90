//! Asynchronous command queue
//!
//! A queue hands out command contexts, accepts submissions bound to a
//! context, and reports completions to a [`CompletionHandler`] while the
//! caller polls (`poke`) or blocks (`wait`). Handlers run on the polling
//! thread and may resubmit on the context they were given.
//!
//! [`EmulatedQueue`] implements the contract on top of any device's
//! synchronous primitive: submissions are parked in a FIFO and executed
//! when the queue is polled.

use crate::device::{NvmCommand, NvmeDevice};
use flexalloc_common::{CplStatus, Direction, Error, Result, SubmitError};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Handle for one outstanding asynchronous command
///
/// Not `Clone`: a context is either idle in the caller's hands, parked in
/// the queue with one command, or back in the queue's free pool.
#[derive(Debug, PartialEq, Eq)]
pub struct CmdCtx {
    slot: u32,
    cb_arg: usize,
}

impl CmdCtx {
    /// Create a context for queue slot `slot` (for queue implementations)
    #[must_use]
    pub const fn new(slot: u32) -> Self {
        Self { slot, cb_arg: 0 }
    }

    #[must_use]
    pub const fn slot(&self) -> u32 {
        self.slot
    }

    /// Opaque argument passed back with the completion
    #[must_use]
    pub const fn cb_arg(&self) -> usize {
        self.cb_arg
    }

    pub fn set_cb_arg(&mut self, cb_arg: usize) {
        self.cb_arg = cb_arg;
    }
}

/// Caller-owned data region for one command
#[derive(Debug)]
pub enum IoBuf<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl<'a> IoBuf<'a> {
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::Read(buf) => buf.len(),
            Self::Write(buf) => buf.len(),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Read(_) => Direction::Read,
            Self::Write(_) => Direction::Write,
        }
    }

    /// Split into two disjoint views at `mid`
    ///
    /// # Panics
    /// Panics if `mid > self.len()`.
    #[must_use]
    pub fn split_at(self, mid: usize) -> (Self, Self) {
        match self {
            Self::Read(buf) => {
                let (head, tail) = buf.split_at_mut(mid);
                (Self::Read(head), Self::Read(tail))
            }
            Self::Write(buf) => {
                let (head, tail) = buf.split_at(mid);
                (Self::Write(head), Self::Write(tail))
            }
        }
    }
}

/// An asynchronous read or write
#[derive(Debug)]
pub struct AsyncIo<'a> {
    pub slba: u64,
    /// Zero-based block count
    pub nlb: u16,
    pub buf: IoBuf<'a>,
}

impl<'a> AsyncIo<'a> {
    #[must_use]
    pub fn into_command(self) -> NvmCommand<'a> {
        match self.buf {
            IoBuf::Read(buf) => NvmCommand::Read {
                slba: self.slba,
                nlb: self.nlb,
                buf,
            },
            IoBuf::Write(buf) => NvmCommand::Write {
                slba: self.slba,
                nlb: self.nlb,
                buf,
            },
        }
    }
}

/// A submission the queue refused, handed back intact for a retry
#[derive(Debug)]
pub struct Rejected<'a> {
    pub error: SubmitError,
    pub ctx: CmdCtx,
    pub io: AsyncIo<'a>,
}

/// Receives completions while the queue is polled
pub trait CompletionHandler<Q: ?Sized> {
    /// Called once per completed command, on the polling thread
    ///
    /// The handler owns `ctx` again: it must either resubmit on it or
    /// return it with [`CommandQueue::put_cmd_ctx`].
    fn on_completion(&mut self, queue: &mut Q, ctx: CmdCtx, status: CplStatus);
}

impl<Q: ?Sized, F> CompletionHandler<Q> for F
where
    F: FnMut(&mut Q, CmdCtx, CplStatus),
{
    fn on_completion(&mut self, queue: &mut Q, ctx: CmdCtx, status: CplStatus) {
        self(queue, ctx, status);
    }
}

/// Asynchronous submission queue bound to caller buffers of lifetime `'a`
pub trait CommandQueue<'a> {
    /// Number of entries the queue was created with
    fn capacity(&self) -> u32;

    /// Commands submitted and not yet completed
    fn outstanding(&self) -> u32;

    /// Take a context from the free pool
    fn get_cmd_ctx(&mut self) -> Option<CmdCtx>;

    /// Return a context to the free pool
    fn put_cmd_ctx(&mut self, ctx: CmdCtx);

    /// Submit `io` on `ctx`
    fn submit(&mut self, ctx: CmdCtx, io: AsyncIo<'a>) -> std::result::Result<(), Rejected<'a>>;

    /// Process up to `max` available completions without blocking
    ///
    /// `max == 0` processes everything available at the time of the call.
    /// Returns the number of completions processed.
    fn poke<H>(&mut self, max: u32, handler: &mut H) -> Result<u32>
    where
        H: CompletionHandler<Self>;

    /// Process completions until nothing is outstanding
    fn wait<H>(&mut self, handler: &mut H) -> Result<u32>
    where
        H: CompletionHandler<Self>;

    /// Tear the queue down; fails if commands are still outstanding
    fn term(self) -> Result<()>
    where
        Self: Sized;
}

/// Queue emulated on top of a device's synchronous primitive
pub struct EmulatedQueue<'a, D: ?Sized> {
    dev: &'a D,
    capacity: u32,
    free: Vec<u32>,
    pending: VecDeque<(CmdCtx, AsyncIo<'a>)>,
}

impl<'a, D: NvmeDevice + ?Sized> EmulatedQueue<'a, D> {
    /// Create a queue of `capacity` entries over `dev`
    pub fn new(dev: &'a D, capacity: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::resource(format!(
                "queue capacity {capacity} is not a non-zero power of two"
            )));
        }
        debug!(capacity, "emulated queue initialized");
        Ok(Self {
            dev,
            capacity,
            free: (0..capacity).rev().collect(),
            pending: VecDeque::with_capacity(capacity as usize),
        })
    }

    fn complete_one<H>(&mut self, handler: &mut H) -> bool
    where
        H: CompletionHandler<Self>,
    {
        let Some((ctx, io)) = self.pending.pop_front() else {
            return false;
        };
        let slba = io.slba;
        let status = match self.dev.execute(io.into_command()) {
            Ok(status) => status,
            Err(e) => {
                warn!(slba, slot = ctx.slot(), "queued command failed to execute: {}", e);
                CplStatus::INTERNAL_ERROR
            }
        };
        handler.on_completion(self, ctx, status);
        true
    }
}

impl<'a, D: NvmeDevice + ?Sized> CommandQueue<'a> for EmulatedQueue<'a, D> {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn outstanding(&self) -> u32 {
        self.pending.len() as u32
    }

    fn get_cmd_ctx(&mut self) -> Option<CmdCtx> {
        self.free.pop().map(CmdCtx::new)
    }

    fn put_cmd_ctx(&mut self, ctx: CmdCtx) {
        debug_assert!(ctx.slot() < self.capacity);
        debug_assert!(!self.free.contains(&ctx.slot()));
        self.free.push(ctx.slot());
    }

    fn submit(&mut self, ctx: CmdCtx, io: AsyncIo<'a>) -> std::result::Result<(), Rejected<'a>> {
        let outstanding = self.outstanding();
        let admitted = if outstanding >= self.capacity {
            Err(SubmitError::Busy)
        } else {
            self.dev.admit(&io, outstanding)
        };
        match admitted {
            Ok(()) => {
                self.pending.push_back((ctx, io));
                Ok(())
            }
            Err(error) => Err(Rejected { error, ctx, io }),
        }
    }

    fn poke<H>(&mut self, max: u32, handler: &mut H) -> Result<u32>
    where
        H: CompletionHandler<Self>,
    {
        // Completions submitted by handlers during this call wait for the next poke
        let available = self.outstanding();
        let limit = if max == 0 { available } else { max.min(available) };

        let mut reaped = 0;
        while reaped < limit && self.complete_one(handler) {
            reaped += 1;
        }
        Ok(reaped)
    }

    fn wait<H>(&mut self, handler: &mut H) -> Result<u32>
    where
        H: CompletionHandler<Self>,
    {
        let mut reaped = 0;
        while self.complete_one(handler) {
            reaped += 1;
        }
        Ok(reaped)
    }

    fn term(self) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(Error::resource(format!(
                "queue terminated with {} command(s) outstanding",
                self.pending.len()
            )));
        }
        debug!(capacity = self.capacity, "emulated queue terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{FaultPlan, MemDevice};

    type MemQueue<'a> = EmulatedQueue<'a, MemDevice>;

    // Pins the queue lifetime so closures can resubmit borrowed buffers
    fn handler<'a, F>(f: F) -> F
    where
        F: FnMut(&mut MemQueue<'a>, CmdCtx, CplStatus),
    {
        f
    }

    fn write_io(buf: &[u8], slba: u64) -> AsyncIo<'_> {
        AsyncIo {
            slba,
            nlb: 0,
            buf: IoBuf::Write(buf),
        }
    }

    #[test]
    fn test_capacity_must_be_power_of_two() {
        let dev = MemDevice::conventional(512, 64, 4096);
        assert!(matches!(
            EmulatedQueue::new(&dev, 6),
            Err(Error::Resource(_))
        ));
        assert!(EmulatedQueue::new(&dev, 0).is_err());
        assert!(EmulatedQueue::new(&dev, 8).is_ok());
    }

    #[test]
    fn test_context_pool() {
        let dev = MemDevice::conventional(512, 64, 4096);
        let mut queue = EmulatedQueue::new(&dev, 2).unwrap();

        let a = queue.get_cmd_ctx().unwrap();
        let b = queue.get_cmd_ctx().unwrap();
        assert_ne!(a.slot(), b.slot());
        assert!(queue.get_cmd_ctx().is_none());

        queue.put_cmd_ctx(a);
        assert!(queue.get_cmd_ctx().is_some());
        queue.put_cmd_ctx(b);
    }

    #[test]
    fn test_submit_beyond_capacity_is_busy() {
        let dev = MemDevice::conventional(512, 64, 4096);
        let data = vec![0xabu8; 512];
        let mut queue = EmulatedQueue::new(&dev, 1).unwrap();

        let ctx = queue.get_cmd_ctx().unwrap();
        queue.submit(ctx, write_io(&data, 0)).unwrap();
        assert_eq!(queue.outstanding(), 1);

        let rejected = queue
            .submit(CmdCtx::new(0), write_io(&data, 1))
            .unwrap_err();
        assert_eq!(rejected.error, SubmitError::Busy);
        assert_eq!(rejected.io.slba, 1);

        let mut done = Vec::new();
        let reaped = queue
            .wait(&mut handler(|q, ctx, status| {
                done.push(status);
                q.put_cmd_ctx(ctx);
            }))
            .unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(done, vec![CplStatus::SUCCESS]);
        queue.term().unwrap();

        assert_eq!(dev.read_raw(0, 512), data);
    }

    #[test]
    fn test_poke_defers_resubmissions_to_next_call() {
        let dev = MemDevice::conventional(512, 64, 4096);
        let data = vec![1u8; 512];
        let mut queue = EmulatedQueue::new(&dev, 4).unwrap();

        let ctx = queue.get_cmd_ctx().unwrap();
        queue.submit(ctx, write_io(&data, 0)).unwrap();

        // Each completion resubmits at the next LBA until LBA 3
        let mut chain = handler(|q, ctx, _| {
            let next = dev.commands().len() as u64;
            if next < 4 {
                q.submit(ctx, write_io(&data, next)).unwrap();
            } else {
                q.put_cmd_ctx(ctx);
            }
        });

        assert_eq!(queue.poke(0, &mut chain).unwrap(), 1);
        assert_eq!(queue.outstanding(), 1);
        assert_eq!(queue.wait(&mut chain).unwrap(), 3);
        assert_eq!(queue.outstanding(), 0);
        queue.term().unwrap();
        assert_eq!(dev.commands().len(), 4);
    }

    #[test]
    fn test_term_with_outstanding_commands_fails() {
        let dev = MemDevice::conventional(512, 64, 4096);
        let data = vec![0u8; 512];
        let mut queue = EmulatedQueue::new(&dev, 2).unwrap();
        let ctx = queue.get_cmd_ctx().unwrap();
        queue.submit(ctx, write_io(&data, 0)).unwrap();

        assert!(matches!(queue.term(), Err(Error::Resource(_))));
        // Dropped without executing
        assert!(dev.commands().is_empty());
    }

    #[test]
    fn test_device_admission_limit() {
        let dev = MemDevice::conventional(512, 64, 4096).with_faults(FaultPlan {
            queue_depth: Some(1),
            ..FaultPlan::default()
        });
        let data = vec![0u8; 512];
        let mut queue = EmulatedQueue::new(&dev, 4).unwrap();

        let a = queue.get_cmd_ctx().unwrap();
        let b = queue.get_cmd_ctx().unwrap();
        queue.submit(a, write_io(&data, 0)).unwrap();
        let rejected = queue.submit(b, write_io(&data, 1)).unwrap_err();
        assert!(rejected.error.is_transient());

        let mut put = handler(|q, ctx, _| q.put_cmd_ctx(ctx));
        assert_eq!(queue.poke(1, &mut put).unwrap(), 1);
        queue.submit(rejected.ctx, rejected.io).unwrap();
        queue.wait(&mut put).unwrap();
        queue.term().unwrap();
        assert_eq!(dev.commands().len(), 2);
    }
}

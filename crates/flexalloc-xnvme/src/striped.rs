//! Striped asynchronous engine
//!
//! Drives one command chain per stripe member through a device queue. A
//! chain has at most one command in flight; its completion handler advances
//! the chain's cursor and resubmits on the same context until the chain's
//! share of the transfer is exhausted.
//!
//! Progress is cooperative: completions are processed only while the engine
//! polls or waits on the queue, on the calling thread.
//!
//! ```text
//!                 ┌──────────── backpressure ─────────────┐
//!                 ▼                                       │
//!  Idle ──► Submitted ──► completion ──► more work? ──yes─┴─► Submitted
//!   │                                        │
//!   │ hard submit failure                    no
//!   ▼                                        ▼
//!  Aborted                                 Drained
//! ```

use crate::device::NvmeDevice;
use crate::queue::{AsyncIo, CmdCtx, CommandQueue, CompletionHandler, IoBuf};
use crate::stripe::{StripeCursor, StripeParams};
use flexalloc_common::{CplStatus, Error, Result};
use std::collections::VecDeque;
use tracing::{debug, error, trace, warn};

/// Consecutive drain-and-retry rounds without a reaped completion before a
/// backpressured chain is given up
pub const SUBMIT_RETRY_LIMIT: u32 = 1024;

/// Where a member chain stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    /// No command submitted yet
    Idle,
    /// One command in flight
    Submitted,
    /// Next command refused by a full queue, waiting to be resubmitted
    Backpressured,
    /// Share of the transfer exhausted, context returned
    Drained,
    /// Chain stopped by a submission failure
    Aborted,
}

/// Outcome of one member chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberReport {
    pub submitted: u32,
    pub completed: u32,
    /// Failed completions plus a failed submission, if any
    pub errors: u32,
    pub state: MemberState,
}

/// Outcome of a successful striped transfer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StripeReport {
    pub members: Vec<MemberReport>,
}

impl StripeReport {
    /// Commands issued across all members
    #[must_use]
    pub fn commands(&self) -> u32 {
        self.members.iter().map(|m| m.submitted).sum()
    }

    fn into_result(self) -> Result<Self> {
        let failed_members = self.members.iter().filter(|m| m.errors > 0).count() as u32;
        match self.members.iter().enumerate().find(|(_, m)| m.errors > 0) {
            None => Ok(self),
            Some((member, m)) => Err(Error::StripeIo {
                member: member as u32,
                errors: m.errors,
                failed_members,
            }),
        }
    }
}

struct Member<'a> {
    cursor: StripeCursor,
    /// Buffer views of the chunks still to submit, in order
    bufs: VecDeque<IoBuf<'a>>,
    state: MemberState,
}

impl Member<'_> {
    fn report(&self) -> MemberReport {
        MemberReport {
            submitted: self.cursor.submitted,
            completed: self.cursor.completed,
            errors: self.cursor.ecount,
            state: self.state,
        }
    }
}

/// Per-call engine state shared with the completion handler
struct StripeChains<'s, 'a> {
    sp: &'s StripeParams,
    members: Vec<Member<'a>>,
    /// Resubmissions refused with backpressure inside a completion
    deferred: VecDeque<(CmdCtx, AsyncIo<'a>)>,
}

impl<'s, 'a> StripeChains<'s, 'a> {
    /// Deal the buffer's chunks round robin to at most `width` chains
    fn new(sp: &'s StripeParams, buf: IoBuf<'a>) -> Self {
        let width = sp.width as usize;
        let mut members: Vec<Member<'a>> = Vec::with_capacity(width);
        let mut rest = buf;
        let mut sbuf = 0;
        for (k, len) in sp.segments().enumerate() {
            let (head, tail) = rest.split_at(len as usize);
            rest = tail;
            if k < width {
                members.push(Member {
                    cursor: StripeCursor::start(sp, sbuf),
                    bufs: VecDeque::new(),
                    state: MemberState::Idle,
                });
            }
            members[k % width].bufs.push_back(head);
            sbuf += len;
        }
        Self {
            sp,
            members,
            deferred: VecDeque::new(),
        }
    }

    /// Command for the chunk the member's cursor points at
    fn next_io(&mut self, idx: usize) -> Option<AsyncIo<'a>> {
        let member = &mut self.members[idx];
        let buf = member.bufs.pop_front()?;
        debug_assert_eq!(
            buf.len() as u64,
            member.cursor.nbytes(self.sp.lba_nbytes),
            "chunk view and cursor disagree"
        );
        Some(AsyncIo {
            slba: member.cursor.slba,
            nlb: member.cursor.nlb,
            buf,
        })
    }

    fn submitted(&mut self, idx: usize) {
        let member = &mut self.members[idx];
        member.cursor.submitted += 1;
        member.state = MemberState::Submitted;
    }

    fn abort<Q>(&mut self, queue: &mut Q, idx: usize, ctx: CmdCtx)
    where
        Q: CommandQueue<'a> + ?Sized,
    {
        queue.put_cmd_ctx(ctx);
        let member = &mut self.members[idx];
        member.cursor.ecount += 1;
        member.state = MemberState::Aborted;
    }

    fn report(&self) -> StripeReport {
        StripeReport {
            members: self.members.iter().map(Member::report).collect(),
        }
    }
}

impl<'a, Q> CompletionHandler<Q> for StripeChains<'_, 'a>
where
    Q: CommandQueue<'a>,
{
    fn on_completion(&mut self, queue: &mut Q, ctx: CmdCtx, status: CplStatus) {
        let idx = ctx.cb_arg();
        let sp = self.sp;
        let member = &mut self.members[idx];
        member.cursor.completed += 1;
        if !status.is_success() {
            member.cursor.ecount += 1;
            warn!(
                member = idx,
                slba = member.cursor.slba,
                nlb = member.cursor.nlb,
                %status,
                "stripe member command failed"
            );
        }

        if !member.cursor.advance(sp) {
            trace!(member = idx, completed = member.cursor.completed, "stripe member drained");
            member.state = MemberState::Drained;
            queue.put_cmd_ctx(ctx);
            return;
        }

        let Some(io) = self.next_io(idx) else {
            warn!(member = idx, "stripe member ran out of buffer before its cursor");
            self.abort(queue, idx, ctx);
            return;
        };
        match queue.submit(ctx, io) {
            Ok(()) => self.submitted(idx),
            Err(rejected) if rejected.error.is_transient() => {
                trace!(member = idx, slba = rejected.io.slba, "resubmission deferred");
                self.members[idx].state = MemberState::Backpressured;
                self.deferred.push_back((rejected.ctx, rejected.io));
            }
            Err(rejected) => {
                warn!(
                    member = idx,
                    slba = rejected.io.slba,
                    "stripe member resubmission failed: {}",
                    rejected.error
                );
                self.abort(queue, idx, rejected.ctx);
            }
        }
    }
}

/// Striped read/write engine over one device
pub struct StripeEngine<'d, D: ?Sized> {
    dev: &'d D,
    retry_limit: u32,
}

impl<'d, D> StripeEngine<'d, D>
where
    D: NvmeDevice + ?Sized,
{
    pub const fn new(dev: &'d D) -> Self {
        Self {
            dev,
            retry_limit: SUBMIT_RETRY_LIMIT,
        }
    }

    /// Override [`SUBMIT_RETRY_LIMIT`]
    #[must_use]
    pub const fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Write `buf`, laid out in transfer order, across the stripe
    pub fn write(&self, buf: &[u8], sp: &StripeParams) -> Result<StripeReport> {
        self.run(IoBuf::Write(buf), sp)
    }

    /// Read the stripe into `buf` in transfer order
    pub fn read(&self, buf: &mut [u8], sp: &StripeParams) -> Result<StripeReport> {
        self.run(IoBuf::Read(buf), sp)
    }

    /// Run one striped transfer
    ///
    /// Succeeds only if every member chain finished without a failed
    /// command. Failures are not rolled back: chunks written by other
    /// commands stay written.
    pub fn run(&self, buf: IoBuf<'_>, sp: &StripeParams) -> Result<StripeReport> {
        self.check(&buf, sp)?;
        if sp.xfer_nbytes == 0 {
            return Ok(StripeReport::default());
        }

        let (buf, _) = buf.split_at(sp.xfer_nbytes as usize);
        let mut chains = StripeChains::new(sp, buf);
        let capacity = (2 * sp.width).next_power_of_two();
        let mut queue = self.dev.queue_init(capacity).inspect_err(|e| {
            error!(capacity, "failed to initialize stripe queue: {}", e);
        })?;

        debug!(
            direction = %sp.direction,
            xfer_nbytes = sp.xfer_nbytes,
            xfer_snbytes = sp.xfer_snbytes,
            width = sp.width,
            chains = chains.members.len(),
            capacity,
            "striped transfer"
        );

        for idx in 0..chains.members.len() {
            let Some(mut ctx) = queue.get_cmd_ctx() else {
                self.drain(&mut queue, &mut chains)?;
                queue.term()?;
                return Err(Error::resource(format!(
                    "queue of {capacity} entries ran out of command contexts"
                )));
            };
            ctx.set_cb_arg(idx);
            match chains.next_io(idx) {
                Some(io) => self.submit_with_retry(&mut queue, &mut chains, ctx, io)?,
                None => queue.put_cmd_ctx(ctx),
            }
        }

        self.drain(&mut queue, &mut chains)?;
        queue.term().inspect_err(|e| {
            error!("failed to tear down stripe queue: {}", e);
        })?;

        let report = chains.report();
        debug!(commands = report.commands(), "striped transfer finished");
        report.into_result()
    }

    fn check(&self, buf: &IoBuf<'_>, sp: &StripeParams) -> Result<()> {
        sp.validate()?;
        let geo = self.dev.geometry();
        if sp.lba_nbytes != geo.lba_nbytes {
            return Err(Error::validation(format!(
                "stripe block size {} does not match the device block size {}",
                sp.lba_nbytes, geo.lba_nbytes
            )));
        }
        if buf.direction() != sp.direction {
            return Err(Error::validation(format!(
                "{} buffer passed to a striped {}",
                buf.direction(),
                sp.direction
            )));
        }
        if (buf.len() as u64) < sp.xfer_nbytes {
            return Err(Error::validation(format!(
                "buffer of {} bytes is shorter than the transfer of {}",
                buf.len(),
                sp.xfer_nbytes
            )));
        }
        match sp.obj_start_nbytes.checked_add(sp.stripe_nbytes()) {
            Some(end) if end <= geo.tbytes => Ok(()),
            _ => Err(Error::validation(format!(
                "stripe of {} bytes at {} exceeds the device size {}",
                sp.stripe_nbytes(),
                sp.obj_start_nbytes,
                geo.tbytes
            ))),
        }
    }

    /// Submit, draining one completion per refused attempt
    ///
    /// A chain that cannot be submitted is aborted; its siblings carry on.
    fn submit_with_retry<'a, Q>(
        &self,
        queue: &mut Q,
        chains: &mut StripeChains<'_, 'a>,
        mut ctx: CmdCtx,
        mut io: AsyncIo<'a>,
    ) -> Result<()>
    where
        Q: CommandQueue<'a>,
    {
        let idx = ctx.cb_arg();
        let mut stalled = 0;
        loop {
            match queue.submit(ctx, io) {
                Ok(()) => {
                    chains.submitted(idx);
                    return Ok(());
                }
                Err(rejected) if rejected.error.is_transient() => {
                    (ctx, io) = (rejected.ctx, rejected.io);
                    if stalled >= self.retry_limit {
                        warn!(
                            member = idx,
                            slba = io.slba,
                            retries = stalled,
                            "stripe member gave up on a full queue"
                        );
                        chains.abort(queue, idx, ctx);
                        return Ok(());
                    }
                    chains.members[idx].state = MemberState::Backpressured;
                    if queue.poke(1, chains)? == 0 {
                        stalled += 1;
                    } else {
                        stalled = 0;
                    }
                }
                Err(rejected) => {
                    warn!(
                        member = idx,
                        slba = rejected.io.slba,
                        "stripe member submission failed: {}",
                        rejected.error
                    );
                    chains.abort(queue, idx, rejected.ctx);
                    return Ok(());
                }
            }
        }
    }

    /// Process completions and deferred resubmissions until the queue is empty
    fn drain<'a, Q>(&self, queue: &mut Q, chains: &mut StripeChains<'_, 'a>) -> Result<()>
    where
        Q: CommandQueue<'a>,
    {
        loop {
            if let Some((ctx, io)) = chains.deferred.pop_front() {
                self.submit_with_retry(queue, chains, ctx, io)?;
                continue;
            }
            if queue.outstanding() == 0 {
                return Ok(());
            }
            queue.wait(chains)?;
        }
    }
}

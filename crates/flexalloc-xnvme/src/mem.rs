//! In-memory namespace with a command log and fault injection
//!
//! `MemDevice` keeps the whole namespace in a byte vector. Every command
//! that reaches the device is appended to a log, which lets callers assert
//! on exactly which commands a transfer issued. Faults are keyed by the
//! starting LBA of a command.

use crate::device::{Geometry, NvmCommand, NvmeDevice, ZoneLimits};
use crate::queue::{AsyncIo, EmulatedQueue};
use flexalloc_common::{CplStatus, Error, Opcode, Result, SubmitError, ZoneAction};
use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::trace;

/// Faults injected into a [`MemDevice`]
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// Commands starting at these LBAs complete with `INTERNAL_ERROR`
    /// without touching the media
    pub fail_completion_at: HashSet<u64>,
    /// Commands starting at these LBAs are refused at submission
    pub reject_submission_at: HashSet<u64>,
    /// Device-side queue depth; asynchronous submissions beyond it are `Busy`
    pub queue_depth: Option<u32>,
    /// The first asynchronous submission at each of these LBAs is `Busy`
    pub busy_once_at: HashSet<u64>,
    /// Queue creation fails
    pub fail_queue_init: bool,
}

/// One command as seen by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandRecord {
    pub op: Opcode,
    pub slba: u64,
    /// Zero-based block count, `None` for zone management
    pub nlb: Option<u16>,
    /// Zone management action and select-all flag
    pub zone_action: Option<(ZoneAction, bool)>,
    pub status: CplStatus,
}

/// Zone state machine, simplified from the zoned namespace command set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneState {
    Empty,
    ImplicitlyOpen,
    ExplicitlyOpen,
    Closed,
    Full,
    Offline,
}

#[derive(Clone, Copy, Debug)]
struct Zone {
    state: ZoneState,
    wp: u64,
}

struct MemState {
    data: Vec<u8>,
    zones: Vec<Zone>,
    log: Vec<CommandRecord>,
}

/// In-memory conventional or zoned namespace
pub struct MemDevice {
    geo: Geometry,
    state: Mutex<MemState>,
    faults: Mutex<FaultPlan>,
}

impl MemDevice {
    /// Conventional namespace of `nlbas` blocks
    #[must_use]
    pub fn conventional(lba_nbytes: u32, nlbas: u64, mdts_nbytes: u32) -> Self {
        let geo = Geometry::conventional(lba_nbytes, nlbas * u64::from(lba_nbytes), mdts_nbytes);
        Self::with_geometry(geo, Vec::new())
    }

    /// Zoned namespace of `nzone` zones with `nsect` blocks each, all empty
    #[must_use]
    pub fn zoned(lba_nbytes: u32, nzone: u32, nsect: u64, mdts_nbytes: u32) -> Self {
        let limits = ZoneLimits {
            max_active: nzone,
            max_open: nzone,
        };
        let geo = Geometry::zoned(lba_nbytes, nzone, nsect, mdts_nbytes, limits);
        let zones = (0..u64::from(nzone))
            .map(|z| Zone {
                state: ZoneState::Empty,
                wp: z * nsect,
            })
            .collect();
        Self::with_geometry(geo, zones)
    }

    fn with_geometry(geo: Geometry, zones: Vec<Zone>) -> Self {
        let nbytes = usize::try_from(geo.tbytes).unwrap_or(usize::MAX);
        Self {
            geo,
            state: Mutex::new(MemState {
                data: vec![0; nbytes],
                zones,
                log: Vec::new(),
            }),
            faults: Mutex::new(FaultPlan::default()),
        }
    }

    #[must_use]
    pub fn with_faults(self, faults: FaultPlan) -> Self {
        *self.faults.lock() = faults;
        self
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        *self.faults.lock() = faults;
    }

    /// Commands that reached the device, in execution order
    #[must_use]
    pub fn commands(&self) -> Vec<CommandRecord> {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Copy `nbytes` of media starting at byte `offset`, bypassing the log
    #[must_use]
    pub fn read_raw(&self, offset: u64, nbytes: usize) -> Vec<u8> {
        let state = self.state.lock();
        let start = offset as usize;
        state.data[start..start + nbytes].to_vec()
    }

    #[must_use]
    pub fn zone_state(&self, zone: u64) -> Option<ZoneState> {
        self.state.lock().zones.get(zone as usize).map(|z| z.state)
    }

    /// Write pointer of `zone` in blocks
    #[must_use]
    pub fn write_pointer(&self, zone: u64) -> Option<u64> {
        self.state.lock().zones.get(zone as usize).map(|z| z.wp)
    }

    fn apply(&self, state: &mut MemState, cmd: NvmCommand<'_>) -> CplStatus {
        let lba = self.geo.lba_nbytes as usize;
        if let Some(nlb) = cmd.nlb() {
            let in_range = cmd
                .slba()
                .checked_add(u64::from(nlb) + 1)
                .is_some_and(|end| end <= self.geo.nlbas());
            if !in_range {
                return CplStatus::LBA_OUT_OF_RANGE;
            }
        }

        match cmd {
            NvmCommand::Read { slba, nlb, buf } => {
                let nbytes = (usize::from(nlb) + 1) * lba;
                if buf.len() < nbytes {
                    return CplStatus::INVALID_FIELD;
                }
                let start = slba as usize * lba;
                buf[..nbytes].copy_from_slice(&state.data[start..start + nbytes]);
                CplStatus::SUCCESS
            }
            NvmCommand::Write { slba, nlb, buf } => {
                let nbytes = (usize::from(nlb) + 1) * lba;
                if buf.len() < nbytes {
                    return CplStatus::INVALID_FIELD;
                }
                let status = self.advance_write_pointer(state, slba, nlb);
                if status.is_success() {
                    let start = slba as usize * lba;
                    state.data[start..start + nbytes].copy_from_slice(&buf[..nbytes]);
                }
                status
            }
            NvmCommand::WriteZeroes { slba, nlb } => {
                let status = self.advance_write_pointer(state, slba, nlb);
                if status.is_success() {
                    let start = slba as usize * lba;
                    let nbytes = (usize::from(nlb) + 1) * lba;
                    state.data[start..start + nbytes].fill(0);
                }
                status
            }
            NvmCommand::ZoneMgmtSend { slba, action, all } => {
                self.zone_mgmt(state, slba, action, all)
            }
        }
    }

    fn advance_write_pointer(&self, state: &mut MemState, slba: u64, nlb: u16) -> CplStatus {
        let Some(zone_no) = self.geo.lba_to_zone(slba) else {
            return CplStatus::SUCCESS;
        };
        let nsect = self.geo.nsect;
        let zone_end = (zone_no + 1) * nsect;
        let end = slba + u64::from(nlb) + 1;
        let zone = &mut state.zones[zone_no as usize];

        if !matches!(
            zone.state,
            ZoneState::Empty | ZoneState::ImplicitlyOpen | ZoneState::ExplicitlyOpen | ZoneState::Closed
        ) || slba != zone.wp
        {
            return CplStatus::ZONE_INVALID_WRITE;
        }
        if end > zone_end {
            return CplStatus::ZONE_BOUNDARY_ERROR;
        }

        zone.wp = end;
        zone.state = if end == zone_end {
            ZoneState::Full
        } else if zone.state == ZoneState::ExplicitlyOpen {
            ZoneState::ExplicitlyOpen
        } else {
            ZoneState::ImplicitlyOpen
        };
        CplStatus::SUCCESS
    }

    fn zone_mgmt(&self, state: &mut MemState, slba: u64, action: ZoneAction, all: bool) -> CplStatus {
        if !self.geo.is_zoned() {
            return CplStatus::INVALID_OPCODE;
        }
        let nsect = self.geo.nsect;

        if all {
            // Select-all only touches zones the action applies to
            for (zone_no, zone) in state.zones.iter_mut().enumerate() {
                let start = zone_no as u64 * nsect;
                if let Some(next) = transition(*zone, action, start, nsect) {
                    *zone = next;
                }
            }
            return CplStatus::SUCCESS;
        }

        if slba >= self.geo.nlbas() {
            return CplStatus::LBA_OUT_OF_RANGE;
        }
        if slba % nsect != 0 {
            return CplStatus::INVALID_FIELD;
        }
        if action == ZoneAction::SetDescriptorExtension {
            return CplStatus::INVALID_FIELD;
        }
        let zone = &mut state.zones[(slba / nsect) as usize];
        match transition(*zone, action, slba, nsect) {
            Some(next) => {
                *zone = next;
                CplStatus::SUCCESS
            }
            None => CplStatus::ZONE_INVALID_TRANSITION,
        }
    }
}

fn transition(zone: Zone, action: ZoneAction, start: u64, nsect: u64) -> Option<Zone> {
    use ZoneState::{Closed, Empty, ExplicitlyOpen, Full, ImplicitlyOpen, Offline};

    let state = match (action, zone.state) {
        (_, Offline) => return None,
        (ZoneAction::Reset, _) => {
            return Some(Zone {
                state: Empty,
                wp: start,
            });
        }
        (ZoneAction::Open, Empty | ImplicitlyOpen | ExplicitlyOpen | Closed) => ExplicitlyOpen,
        (ZoneAction::Close, ImplicitlyOpen | ExplicitlyOpen | Closed) => Closed,
        (ZoneAction::Finish, Empty | ImplicitlyOpen | ExplicitlyOpen | Closed | Full) => {
            return Some(Zone {
                state: Full,
                wp: start + nsect,
            });
        }
        (ZoneAction::Offline, Empty | Closed | Full) => Offline,
        _ => return None,
    };
    Some(Zone { state, ..zone })
}

impl NvmeDevice for MemDevice {
    type Queue<'a> = EmulatedQueue<'a, Self>;

    fn geometry(&self) -> &Geometry {
        &self.geo
    }

    fn execute(&self, cmd: NvmCommand<'_>) -> std::result::Result<CplStatus, SubmitError> {
        let (op, slba, nlb) = (cmd.opcode(), cmd.slba(), cmd.nlb());
        let zone_action = match &cmd {
            NvmCommand::ZoneMgmtSend { action, all, .. } => Some((*action, *all)),
            _ => None,
        };

        let fail = {
            let faults = self.faults.lock();
            if faults.reject_submission_at.contains(&slba) {
                return Err(SubmitError::Rejected(Errno::EIO));
            }
            faults.fail_completion_at.contains(&slba)
        };

        let mut state = self.state.lock();
        let status = if fail {
            CplStatus::INTERNAL_ERROR
        } else {
            self.apply(&mut state, cmd)
        };
        trace!(%op, slba, ?nlb, %status, "mem device command");
        state.log.push(CommandRecord {
            op,
            slba,
            nlb,
            zone_action,
            status,
        });
        Ok(status)
    }

    fn queue_init<'a>(&'a self, capacity: u32) -> Result<Self::Queue<'a>> {
        if self.faults.lock().fail_queue_init {
            return Err(Error::resource("injected queue initialization failure"));
        }
        EmulatedQueue::new(self, capacity)
    }

    fn admit(&self, io: &AsyncIo<'_>, outstanding: u32) -> std::result::Result<(), SubmitError> {
        let mut faults = self.faults.lock();
        if faults.reject_submission_at.contains(&io.slba) {
            return Err(SubmitError::Rejected(Errno::EIO));
        }
        if faults.busy_once_at.remove(&io.slba) {
            return Err(SubmitError::Busy);
        }
        match faults.queue_depth {
            Some(depth) if outstanding >= depth => Err(SubmitError::Busy),
            _ => Ok(()),
        }
    }
}

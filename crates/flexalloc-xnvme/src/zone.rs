//! Zone management dispatch

use crate::device::{NvmCommand, NvmeDevice, ZoneLimits};
use flexalloc_common::{Error, Opcode, Result, ZoneAction};
use tracing::{debug, error};

/// Send one zone management command
///
/// With `all` set the action applies to every zone in one command and
/// `slba` is ignored by the device; otherwise it targets the zone starting
/// at `slba`. Fails with a geometry error, issuing nothing, when the
/// namespace is not zoned.
pub fn zone_mgmt_send<D>(dev: &D, slba: u64, action: ZoneAction, all: bool) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    if !dev.geometry().is_zoned() {
        return Err(Error::geometry(format!(
            "zone {action} requires a zoned namespace, device is {}",
            dev.geometry().geo_type
        )));
    }

    debug!(slba, %action, all, "zone management send");
    match dev.execute(NvmCommand::ZoneMgmtSend { slba, action, all }) {
        Ok(status) if status.is_success() => Ok(()),
        Ok(status) => {
            error!(slba, %action, all, %status, "zone management failed");
            Err(Error::Completion {
                op: Opcode::ZoneMgmtSend,
                slba,
                status,
            })
        }
        Err(e) => {
            error!(slba, %action, all, "zone management not submitted: {}", e);
            Err(Error::Submission {
                op: Opcode::ZoneMgmtSend,
                slba,
                error: e,
            })
        }
    }
}

/// Bring a device into a formattable state
///
/// Zoned namespaces get every zone reset with a single select-all command.
/// Conventional namespaces need nothing.
pub fn prepare_format<D>(dev: &D) -> Result<()>
where
    D: NvmeDevice + ?Sized,
{
    if dev.geometry().is_zoned() {
        zone_mgmt_send(dev, 0, ZoneAction::Reset, true)?;
    }
    Ok(())
}

/// Active and open resource limits of a zoned namespace
pub fn zone_limits<D>(dev: &D) -> Result<ZoneLimits>
where
    D: NvmeDevice + ?Sized,
{
    let geo = dev.geometry();
    geo.zone_limits
        .filter(|_| geo.is_zoned())
        .ok_or_else(|| Error::geometry("zone limits are only reported by zoned namespaces"))
}

// Copyright 2025 meshprobe contributors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Nordic CTRL-AP: chip-level erase-all and protection release.
//!
//! The CTRL-AP answers even while APPROTECT blocks the MEM-AP, so this is
//! the recovery path for locked parts. Its ERASEALL wipes flash *and*
//! UICR, which is what clears APPROTECT.

use crate::dap::ApReg;
use crate::hal::{Clock, DebugPin, Delay};
use crate::nrf52::{
    is_ctrl_ap_idr, CTRL_AP_APPROTECTSTATUS, CTRL_AP_ERASEALL, CTRL_AP_ERASEALLSTATUS,
    CTRL_AP_RESET, ERASED_WORD, FLASH_SIZE, UICR_APPROTECT,
};
use crate::{dap, target};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// ERASEALLSTATUS never reached 0 inside the budget. The target is in
    /// an indeterminate state; power cycle before trying anything else.
    UnlockTimeout,
    /// Session could not be re-established after the erase.
    Reconnect,
    /// Flash or UICR did not read erased after the unlock.
    Verify { addr: u32, value: u32 },
    Bus(dap::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<dap::Error> for Error {
    fn from(e: dap::Error) -> Self {
        Error::Bus(e)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct UnlockReport {
    pub ap_index: u8,
    /// APPROTECTSTATUS before the erase, when readable.
    pub protect_status: Option<u32>,
    pub elapsed_ms: u64,
}

// Erase-all can take over a minute on some samples.
const ERASE_ALL_BUDGET_MS: u64 = 120_000;
const ERASE_ALL_POLL_MS: u32 = 250;
// Log when the status has not moved for this long.
const STALL_LOG_MS: u64 = 5_000;

const RESET_SETTLE_MS: u32 = 10;

/// Find the CTRL-AP by IDR. Falls back to index 1, where Nordic has
/// always put it.
pub fn find_ctrl_ap<P, D, C>(target: &mut target::Target<P, D, C>) -> Result<u8>
where
    P: DebugPin,
    D: Delay,
    C: Clock,
{
    for index in 0..=255u8 {
        let idr = target.dap().ap_read(index, ApReg::IDR.into())?;
        if is_ctrl_ap_idr(idr) {
            log::debug!("CTRL-AP at index {} (IDR {:08x})", index, idr);
            return Ok(index);
        }
    }
    log::warn!("no CTRL-AP IDR match in scan, assuming index 1");
    Ok(1)
}

/// Full unlock: erase-all through the CTRL-AP, then re-establish the
/// session and verify flash and UICR read erased.
pub fn mass_erase<P, D, C>(target: &mut target::Target<P, D, C>) -> Result<UnlockReport>
where
    P: DebugPin,
    D: Delay,
    C: Clock,
{
    let started = target.now_ms();
    let ap = find_ctrl_ap(target)?;

    // Informational only; the erase goes ahead regardless.
    let protect_status = target.dap().ap_read(ap, CTRL_AP_APPROTECTSTATUS).ok();
    if let Some(status) = protect_status {
        log::info!("APPROTECTSTATUS before erase: {:08x}", status);
    }

    // Hold the core in reset across the erase.
    target.dap().ap_write(ap, CTRL_AP_RESET, 1)?;
    target.pause_ms(RESET_SETTLE_MS);
    target.dap().ap_write(ap, CTRL_AP_ERASEALL, 1)?;

    poll_erase_all(target, ap)?;

    target.dap().ap_write(ap, CTRL_AP_RESET, 0)?;

    // The part comes back with a fresh debug domain; reconnect from
    // scratch before touching memory.
    target.disconnect();
    target.pause_ms(100);
    target.connect().map_err(|e| {
        log::error!("reconnect after unlock failed: {:?}", e);
        Error::Reconnect
    })?;

    verify_unlocked(target)?;

    Ok(UnlockReport {
        ap_index: ap,
        protect_status,
        elapsed_ms: target.now_ms() - started,
    })
}

fn poll_erase_all<P, D, C>(target: &mut target::Target<P, D, C>, ap: u8) -> Result<()>
where
    P: DebugPin,
    D: Delay,
    C: Clock,
{
    let deadline = target.now_ms() + ERASE_ALL_BUDGET_MS;
    let mut last_status = u32::MAX;
    let mut last_change = target.now_ms();

    loop {
        let status = target.dap().ap_read(ap, CTRL_AP_ERASEALLSTATUS)?;
        if status == 0 {
            return Ok(());
        }

        let now = target.now_ms();
        if status != last_status {
            last_status = status;
            last_change = now;
        } else if now - last_change >= STALL_LOG_MS {
            log::info!(
                "erase-all still running, status {:08x} unchanged for {} s",
                status,
                (now - last_change) / 1000
            );
            last_change = now;
        }

        if now > deadline {
            log::error!("CTRL-AP erase-all never completed, status {:08x}", status);
            return Err(Error::UnlockTimeout);
        }
        target.pause_ms(ERASE_ALL_POLL_MS);
    }
}

// A handful of samples across flash, then APPROTECT itself.
fn verify_unlocked<P, D, C>(target: &mut target::Target<P, D, C>) -> Result<()>
where
    P: DebugPin,
    D: Delay,
    C: Clock,
{
    let samples = [
        0x0000_0000,
        0x0000_1000,
        0x0001_0000,
        0x0004_0000,
        0x0008_0000,
        0x000C_0000,
        FLASH_SIZE - 0x1000,
        FLASH_SIZE - 4,
        UICR_APPROTECT,
    ];
    for addr in samples {
        let value = target.read32(addr).map_err(|_| Error::Reconnect)?;
        if value != ERASED_WORD {
            log::error!("post-unlock readback {:08x} at {:08x}", value, addr);
            return Err(Error::Verify { addr, value });
        }
    }
    Ok(())
}

// Copyright 2025 meshprobe contributors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Debug session management: wake, identify, power up, tear down.

use crate::dap::{Dap, DpRead, DpWrite};
use crate::hal::{Clock, DebugPin, Delay};
use crate::{dap, nrf52};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// IDCODE read as 0 or all-ones on both wake paths.
    NoTarget,
    /// CDBGPWRUPACK/CSYSPWRUPACK never asserted.
    PowerUpTimeout,
    /// IDCODE became 0/all-ones mid-session.
    LinkLost,
    /// Operation needs a connected session.
    NotConnected,
    /// Alignment or range violation.
    InvalidArgument,
    Bus(dap::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<dap::Error> for Error {
    fn from(e: dap::Error) -> Self {
        Error::Bus(e)
    }
}

// DP CTRL/STAT power-up request and acknowledge bits.
const CDBGPWRUPREQ: u32 = 1 << 28;
const CSYSPWRUPREQ: u32 = 1 << 30;
const CDBGPWRUPACK: u32 = 1 << 29;
const CSYSPWRUPACK: u32 = 1 << 31;
const PWRUP_REQ: u32 = CDBGPWRUPREQ | CSYSPWRUPREQ;
const PWRUP_ACK: u32 = CDBGPWRUPACK | CSYSPWRUPACK;

const PWRUP_TIMEOUT_MS: u64 = 100;

// MEM-AP CSW fields (ADIv5 11.2.1). The Prot field is the nRF52's
// implementation-defined default for privileged data access.
const CSW_SIZE_WORD: u32 = 0x2;
const CSW_ADDRINC_SINGLE: u32 = 1 << 4;
const CSW_DEVICE_EN: u32 = 1 << 6;
const CSW_PROT_DEFAULT: u32 = 0x23 << 24;

/// 32-bit transfers, auto-increment, debug enabled.
pub const CSW_WORD_AUTOINC: u32 =
    CSW_PROT_DEFAULT | CSW_DEVICE_EN | CSW_ADDRINC_SINGLE | CSW_SIZE_WORD;

/// The AP index the MEM-AP lives at on every nRF52.
pub const MEM_AP: u8 = 0;

pub struct Target<P: DebugPin, D: Delay, C: Clock> {
    pub(crate) dap: Dap<P, D>,
    pub(crate) clock: C,
    connected: bool,
    last_idcode: u32,
}

impl<P: DebugPin, D: Delay, C: Clock> Target<P, D, C> {
    pub fn new(dap: Dap<P, D>, clock: C) -> Self {
        Target {
            dap,
            clock,
            connected: false,
            last_idcode: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_idcode(&self) -> u32 {
        self.last_idcode
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn pause_ms(&mut self, ms: u32) {
        self.dap.pause_ms(ms);
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Establish a debug session: wake the DP, identify it, power up the
    /// debug domain and configure the MEM-AP for auto-incrementing word
    /// access. Returns the IDCODE.
    pub fn connect(&mut self) -> Result<u32> {
        self.connected = false;

        // Newer DPs boot dormant; try the dormant wakeup first and fall
        // back to the classic line reset + JTAG-to-SWD switch.
        self.dap.dormant_wakeup();
        let idcode = match self.probe_idcode() {
            Some(id) => id,
            None => {
                self.dap.line_reset();
                self.dap.jtag_to_swd();
                self.dap.line_reset();
                self.probe_idcode().ok_or(Error::NoTarget)?
            }
        };

        // Clear any sticky errors left over from a previous session.
        self.dap.dp_write(DpWrite::Abort, 0x1E)?;

        self.power_up()?;

        self.dap
            .ap_write(MEM_AP, crate::dap::ApReg::CSW.into(), CSW_WORD_AUTOINC)?;

        self.connected = true;
        self.last_idcode = idcode;
        log::info!("SWD session up, IDCODE {:08x}", idcode);
        Ok(idcode)
    }

    /// Line-reset the target so later line noise cannot be mistaken for a
    /// frame, and forget the session.
    pub fn disconnect(&mut self) {
        self.dap.line_reset();
        self.connected = false;
    }

    /// Re-reads IDCODE; 0/all-ones means the target is gone.
    pub fn check_link(&mut self) -> Result<u32> {
        match self.dap.dp_read(DpRead::Idcode) {
            Ok(id) if id != 0 && id != 0xFFFF_FFFF => Ok(id),
            _ => {
                self.connected = false;
                Err(Error::LinkLost)
            }
        }
    }

    /// Pulse the hardware reset line, when wired.
    pub fn hw_reset(&mut self, hold_ms: u32) {
        self.dap.set_nreset(true);
        self.dap.pause_ms(hold_ms);
        self.dap.set_nreset(false);
    }

    pub(crate) fn dap(&mut self) -> &mut Dap<P, D> {
        &mut self.dap
    }

    fn probe_idcode(&mut self) -> Option<u32> {
        match self.dap.dp_read(DpRead::Idcode) {
            Ok(id) if id != 0 && id != 0xFFFF_FFFF => Some(id),
            _ => None,
        }
    }

    fn power_up(&mut self) -> Result<()> {
        self.dap.dp_write(DpWrite::CtrlStat, PWRUP_REQ)?;
        let deadline = self.clock.now_ms() + PWRUP_TIMEOUT_MS;
        loop {
            let stat = self.dap.dp_read(DpRead::CtrlStat)?;
            if stat & PWRUP_ACK == PWRUP_ACK {
                return Ok(());
            }
            if self.clock.now_ms() > deadline {
                log::warn!("debug power-up stuck, CTRL/STAT {:08x}", stat);
                return Err(Error::PowerUpTimeout);
            }
            self.dap.pause_ms(1);
        }
    }

    /// Convenience probe used by the identify surface: part code from the
    /// FICR, only meaningful once connected.
    pub fn read_part(&mut self) -> Result<u32> {
        self.read32(nrf52::FICR_INFO_PART)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csw_matches_nrf52_reference_value() {
        // The value the flasher has always programmed, recomputed from
        // named CSW fields.
        assert_eq!(CSW_WORD_AUTOINC, 0x2300_0052);
    }
}

// Copyright 2025 meshprobe contributors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! DP/AP transactions with retry and sticky-error recovery.
//!
//! Wraps the raw line driver with ADIv5 policy: WAIT yields and retries,
//! FAULT clears the sticky flags through ABORT before retrying, AP reads
//! are presented synchronously by chaining the RDBUFF fetch, and DP SELECT
//! is cached so AP/bank switches cost one write.

use crate::hal::{DebugPin, Delay};
use crate::swd::{self, Port, Swd};
use num_enum::IntoPrimitive;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// FAULT persisted after the retry budget; sticky error not cleared.
    BusFault,
    /// Target kept answering WAIT; unresponsive.
    BusWait,
    /// Parity mismatch twice in a row, or a malformed ACK.
    Protocol,
}

pub type Result<T> = core::result::Result<T, Error>;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
pub enum DpRead {
    Idcode = 0x0,
    CtrlStat = 0x4,
    Rdbuff = 0xC,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
pub enum DpWrite {
    Abort = 0x0,
    CtrlStat = 0x4,
    Select = 0x8,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[allow(clippy::upper_case_acronyms)]
pub enum ApReg {
    CSW = 0x00,
    TAR = 0x04,
    DRW = 0x0C,
    IDR = 0xFC,
}

// ABORT write clearing ORUNERR, WDERR, STKERR, STKCMPERR and DAPABORT.
const ABORT_CLEAR_ALL: u32 = 0x1E;

const RETRY_ATTEMPTS: usize = 10;

pub struct Dap<P: DebugPin, D: Delay> {
    swd: Swd<P, D>,
    // last value written to DP SELECT, if known
    select: Option<u32>,
}

impl<P: DebugPin, D: Delay> Dap<P, D> {
    pub fn new(swd: Swd<P, D>) -> Self {
        Dap { swd, select: None }
    }

    pub fn into_inner(self) -> Swd<P, D> {
        self.swd
    }

    pub fn line_reset(&mut self) {
        // A line reset also resets the DP's SELECT register state.
        self.select = None;
        self.swd.line_reset();
    }

    pub fn jtag_to_swd(&mut self) {
        self.select = None;
        self.swd.jtag_to_swd();
    }

    pub fn dormant_wakeup(&mut self) {
        self.select = None;
        self.swd.dormant_wakeup();
    }

    pub fn set_nreset(&mut self, asserted: bool) {
        self.swd.set_nreset(asserted);
    }

    pub(crate) fn pause_ms(&mut self, ms: u32) {
        self.swd.pause_ms(ms);
    }

    pub fn dp_read(&mut self, reg: DpRead) -> Result<u32> {
        self.retry(|swd| swd.read(Port::Dp, reg.into()))
    }

    pub fn dp_write(&mut self, reg: DpWrite, value: u32) -> Result<()> {
        if reg == DpWrite::Select {
            self.select = Some(value);
        }
        self.retry(|swd| swd.write(Port::Dp, reg.into(), value))
    }

    /// Synchronous AP register read: posts the read, then fetches the
    /// result from RDBUFF. Callers never see the posted-read pipeline.
    pub fn ap_read(&mut self, apsel: u8, addr: u8) -> Result<u32> {
        self.select_ap(apsel, addr)?;
        self.retry(|swd| swd.read(Port::Ap, addr & 0x0C))?;
        self.dp_read(DpRead::Rdbuff)
    }

    pub fn ap_write(&mut self, apsel: u8, addr: u8, value: u32) -> Result<()> {
        self.select_ap(apsel, addr)?;
        self.retry(|swd| swd.write(Port::Ap, addr & 0x0C, value))
    }

    /// Posted AP read for pipelined block transfers: returns the payload
    /// of the *previous* AP read. The first result of a pipeline is
    /// stale; the final payload comes from [`Dap::rdbuff`].
    pub(crate) fn ap_read_posted(&mut self, apsel: u8, addr: u8) -> Result<u32> {
        self.select_ap(apsel, addr)?;
        self.retry(|swd| swd.read(Port::Ap, addr & 0x0C))
    }

    pub(crate) fn rdbuff(&mut self) -> Result<u32> {
        self.dp_read(DpRead::Rdbuff)
    }

    /// DP SELECT encodes {APSEL[31:24], APBANKSEL[7:4], DPBANKSEL[3:0]}.
    fn select_ap(&mut self, apsel: u8, addr: u8) -> Result<()> {
        let sel = ((apsel as u32) << 24) | (addr as u32 & 0xF0);
        if self.select != Some(sel) {
            self.dp_write(DpWrite::Select, sel)?;
        }
        Ok(())
    }

    fn retry<T>(&mut self, mut op: impl FnMut(&mut Swd<P, D>) -> swd::Result<T>) -> Result<T> {
        let mut parity_errors = 0;
        let mut verdict = Error::BusWait;
        for _ in 0..RETRY_ATTEMPTS {
            match op(&mut self.swd) {
                Ok(v) => return Ok(v),
                Err(swd::Error::AckWait) => {
                    verdict = Error::BusWait;
                    self.swd.pause_ms(1);
                }
                Err(swd::Error::AckFault) => {
                    verdict = Error::BusFault;
                    self.clear_sticky()?;
                }
                Err(swd::Error::BadParity) => {
                    parity_errors += 1;
                    if parity_errors >= 2 {
                        return Err(Error::Protocol);
                    }
                }
                Err(swd::Error::AckProtocol) | Err(swd::Error::AckUnknown(_)) => {
                    return Err(Error::Protocol);
                }
            }
        }
        log::warn!("DAP retry budget exhausted: {:?}", verdict);
        Err(verdict)
    }

    fn clear_sticky(&mut self) -> Result<()> {
        self.swd
            .write(Port::Dp, DpWrite::Abort.into(), ABORT_CLEAR_ALL)
            .map_err(|_| Error::BusFault)
    }
}

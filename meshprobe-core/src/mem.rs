//! 32-bit memory access through the MEM-AP.
//!
//! Single accesses write TAR then touch DRW. Block transfers lean on the
//! CSW auto-increment and the posted-read pipeline, re-writing TAR at
//! every 1 KiB boundary because auto-increment is only architected to
//! carry within that window.

use crate::dap::ApReg;
use crate::hal::{Clock, DebugPin, Delay};
use crate::target::{Error, Result, Target, MEM_AP};

// Auto-increment window (ADIv5 11.2.4).
const TAR_WINDOW: u32 = 1024;

impl<P: DebugPin, D: Delay, C: Clock> Target<P, D, C> {
    pub fn read32(&mut self, addr: u32) -> Result<u32> {
        self.ensure_connected()?;
        if addr & 3 != 0 {
            return Err(Error::InvalidArgument);
        }
        self.dap.ap_write(MEM_AP, ApReg::TAR.into(), addr)?;
        Ok(self.dap.ap_read(MEM_AP, ApReg::DRW.into())?)
    }

    pub fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.ensure_connected()?;
        if addr & 3 != 0 {
            return Err(Error::InvalidArgument);
        }
        self.dap.ap_write(MEM_AP, ApReg::TAR.into(), addr)?;
        self.dap.ap_write(MEM_AP, ApReg::DRW.into(), value)?;
        Ok(())
    }

    /// Reads `out.len()` consecutive words starting at `addr`.
    pub fn read_block(&mut self, addr: u32, out: &mut [u32]) -> Result<()> {
        self.ensure_connected()?;
        if addr & 3 != 0 {
            return Err(Error::InvalidArgument);
        }
        if out.is_empty() {
            return Ok(());
        }

        let mut addr = addr;
        let mut filled = 0;
        while filled < out.len() {
            let window_left = (TAR_WINDOW - (addr % TAR_WINDOW)) as usize / 4;
            let count = window_left.min(out.len() - filled);

            self.dap.ap_write(MEM_AP, ApReg::TAR.into(), addr)?;
            // First posted read primes the pipeline; each subsequent one
            // returns its predecessor, RDBUFF drains the last.
            self.dap.ap_read_posted(MEM_AP, ApReg::DRW.into())?;
            for i in 1..count {
                out[filled + i - 1] = self.dap.ap_read_posted(MEM_AP, ApReg::DRW.into())?;
            }
            out[filled + count - 1] = self.dap.rdbuff()?;

            filled += count;
            addr += (count * 4) as u32;
        }
        Ok(())
    }

    /// Writes consecutive words starting at `addr`.
    pub fn write_block(&mut self, addr: u32, words: &[u32]) -> Result<()> {
        self.ensure_connected()?;
        if addr & 3 != 0 {
            return Err(Error::InvalidArgument);
        }

        let mut addr = addr;
        let mut sent = 0;
        while sent < words.len() {
            let window_left = (TAR_WINDOW - (addr % TAR_WINDOW)) as usize / 4;
            let count = window_left.min(words.len() - sent);

            self.dap.ap_write(MEM_AP, ApReg::TAR.into(), addr)?;
            for &word in &words[sent..sent + count] {
                self.dap.ap_write(MEM_AP, ApReg::DRW.into(), word)?;
            }

            sent += count;
            addr += (count * 4) as u32;
        }
        Ok(())
    }
}

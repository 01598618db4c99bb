// Copyright 2025 meshprobe contributors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! nRF52 NVMC flash engine.
//!
//! Every operation follows the same discipline: CONFIG writes are read
//! back and verified, READY is required to settle before the operation is
//! issued, and CONFIG is restored to read-only on every exit path. The
//! engine borrows the debug session per operation and keeps no state.

use crate::hal::{Clock, DebugPin, Delay};
use crate::nrf52::{
    page_base, APPROTECT_HW_DISABLED, CONFIG_EEN, CONFIG_REN, CONFIG_WEN, ERASED_BYTE,
    ERASED_WORD, NVMC_CONFIG, NVMC_ERASEALL, NVMC_ERASEPAGE, NVMC_READY, PAGE_SIZE,
    UICR_APPROTECT,
};
use crate::target::{self, Target};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Erase,
    Program,
    Verify,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The flash operation failed; `addr` is the word or register that
    /// did not behave.
    Flash { phase: Phase, addr: u32 },
    Bus(target::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<target::Error> for Error {
    fn from(e: target::Error) -> Self {
        Error::Bus(e)
    }
}

// Typical page erase time, plus the poll budget after it.
const ERASE_SETTLE_MS: u32 = 90;
const ERASE_BUDGET_MS: u64 = 400;
const ERASE_POLL_MS: u32 = 10;

const WRITE_BUDGET_MS: u64 = 50;
const ERASE_ALL_BUDGET_MS: u64 = 500;

// Words programmed between READY polls during a buffer program.
const READY_BATCH_BYTES: u32 = 256;

pub struct Nvmc<'a, P: DebugPin, D: Delay, C: Clock> {
    target: &'a mut Target<P, D, C>,
}

impl<'a, P: DebugPin, D: Delay, C: Clock> Nvmc<'a, P, D, C> {
    pub fn new(target: &'a mut Target<P, D, C>) -> Self {
        Nvmc { target }
    }

    /// Erase the page containing `addr` and verify it reads back erased.
    pub fn erase_page(&mut self, addr: u32) -> Result<()> {
        let page = page_base(addr);
        let result = self.erase_page_inner(page);
        if result.is_err() {
            let _ = self.restore_ren();
        }
        result
    }

    fn erase_page_inner(&mut self, page: u32) -> Result<()> {
        self.wait_ready(Phase::Erase, page, 100)?;
        self.set_config(Phase::Erase, CONFIG_EEN)?;
        self.target.write32(NVMC_ERASEPAGE, page)?;

        self.target.pause_ms(ERASE_SETTLE_MS);
        self.poll_ready(Phase::Erase, page, ERASE_BUDGET_MS, ERASE_POLL_MS)?;

        self.restore_ren()?;
        self.verify_erased(page)
    }

    /// Program one word. The caller is responsible for the page being
    /// erased; verification is deferred to buffer-level verify.
    pub fn program_word(&mut self, addr: u32, value: u32) -> Result<()> {
        let result = self.program_word_inner(addr, value);
        if result.is_err() {
            let _ = self.restore_ren();
        }
        result
    }

    fn program_word_inner(&mut self, addr: u32, value: u32) -> Result<()> {
        self.wait_ready(Phase::Program, addr, 100)?;
        self.set_config(Phase::Program, CONFIG_WEN)?;
        self.target.write32(addr, value)?;
        self.poll_ready(Phase::Program, addr, WRITE_BUDGET_MS, 1)?;
        self.restore_ren()
    }

    /// Program `data` at `addr` with a single write-enable window.
    ///
    /// Unaligned edges are read-modify-written; the bytes being replaced
    /// must still be erased, anything else means the covering page was
    /// never erased for this image. A zero-length buffer never touches
    /// the NVMC.
    pub fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let result = self.program_inner(addr, data);
        if result.is_err() {
            let _ = self.restore_ren();
        }
        result
    }

    fn program_inner(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.wait_ready(Phase::Program, addr, 100)?;
        self.set_config(Phase::Program, CONFIG_WEN)?;

        let mut addr = addr;
        let mut idx = 0usize;

        // Unaligned prefix: patch the live word.
        let lead = (addr & 3) as usize;
        if lead != 0 {
            let word_addr = addr & !3;
            let take = (4 - lead).min(data.len());
            self.patch_word(word_addr, lead, &data[..take])?;
            idx += take;
            addr = word_addr + 4;
        }

        // Aligned body, READY polled in coarse batches.
        let mut since_poll = 0u32;
        while data.len() - idx >= 4 {
            let word = u32::from_le_bytes([
                data[idx],
                data[idx + 1],
                data[idx + 2],
                data[idx + 3],
            ]);
            self.target.write32(addr, word)?;
            idx += 4;
            addr += 4;
            since_poll += 4;
            let last_word = data.len() - idx < 4;
            if since_poll >= READY_BATCH_BYTES || last_word {
                self.poll_ready(Phase::Program, addr - 4, WRITE_BUDGET_MS, 1)?;
                since_poll = 0;
            }
        }

        // Unaligned tail, symmetric to the prefix.
        if idx < data.len() {
            self.patch_word(addr, 0, &data[idx..])?;
        }

        self.restore_ren()
    }

    /// Read-modify-write `bytes` into the word at `word_addr`, starting
    /// at byte `offset`. The target byte lanes must read erased.
    fn patch_word(&mut self, word_addr: u32, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut lanes = self.target.read32(word_addr)?.to_le_bytes();
        for (i, &b) in bytes.iter().enumerate() {
            if lanes[offset + i] != ERASED_BYTE {
                log::error!(
                    "partial word at {:08x} not erased (lane {} = {:02x})",
                    word_addr,
                    offset + i,
                    lanes[offset + i]
                );
                return Err(Error::Flash {
                    phase: Phase::Program,
                    addr: word_addr,
                });
            }
            lanes[offset + i] = b;
        }
        self.target.write32(word_addr, u32::from_le_bytes(lanes))?;
        self.poll_ready(Phase::Program, word_addr, WRITE_BUDGET_MS, 1)
    }

    /// Erase all of code flash. Leaves the UICR and APPROTECT untouched;
    /// a protected part needs the CTRL-AP path instead.
    pub fn erase_all(&mut self) -> Result<()> {
        let result = self.erase_all_inner();
        if result.is_err() {
            let _ = self.restore_ren();
        }
        result
    }

    fn erase_all_inner(&mut self) -> Result<()> {
        self.wait_ready(Phase::Erase, NVMC_ERASEALL, 100)?;
        self.set_config(Phase::Erase, CONFIG_EEN)?;
        self.target.write32(NVMC_ERASEALL, 1)?;
        self.poll_ready(Phase::Erase, NVMC_ERASEALL, ERASE_ALL_BUDGET_MS, ERASE_POLL_MS)?;
        self.restore_ren()
    }

    /// Erase the UICR page and program the hardware-disable sentinel into
    /// APPROTECT, so protection stays off across power cycles.
    pub fn disable_approtect(&mut self) -> Result<()> {
        self.erase_page(UICR_APPROTECT)?;
        self.program_word(UICR_APPROTECT, APPROTECT_HW_DISABLED)?;
        let readback = self.target.read32(UICR_APPROTECT)?;
        if readback != APPROTECT_HW_DISABLED {
            return Err(Error::Flash {
                phase: Phase::Verify,
                addr: UICR_APPROTECT,
            });
        }
        Ok(())
    }

    /// Compare flash contents against `data`.
    pub fn verify(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let mut words = [0u32; 64];
        let mut offset = 0usize;
        while offset < data.len() {
            let base = (addr + offset as u32) & !3;
            let span_end = (addr as usize + data.len() + 3) & !3;
            let count = (((span_end as u32 - base) / 4) as usize).min(words.len());
            self.target.read_block(base, &mut words[..count])?;

            for i in 0..count * 4 {
                let flash_addr = base + i as u32;
                if flash_addr < addr + offset as u32 {
                    continue;
                }
                let data_idx = (flash_addr - addr) as usize;
                if data_idx >= data.len() {
                    break;
                }
                let got = words[i / 4].to_le_bytes()[i % 4];
                if got != data[data_idx] {
                    log::error!(
                        "verify mismatch at {:08x}: wrote {:02x}, read {:02x}",
                        flash_addr,
                        data[data_idx],
                        got
                    );
                    return Err(Error::Flash {
                        phase: Phase::Verify,
                        addr: flash_addr,
                    });
                }
            }
            offset = (base as usize + count * 4) - addr as usize;
        }
        Ok(())
    }

    /// Write CONFIG and verify the mode took; then require READY to read
    /// the same twice in a row before any operation is issued.
    fn set_config(&mut self, phase: Phase, mode: u32) -> Result<()> {
        self.target.write32(NVMC_CONFIG, mode)?;
        let readback = self.target.read32(NVMC_CONFIG)? & 0x3;
        if readback != mode {
            log::error!("NVMC CONFIG stuck: wrote {}, read {}", mode, readback);
            return Err(Error::Flash {
                phase,
                addr: NVMC_CONFIG,
            });
        }

        let mut prev = self.target.read32(NVMC_READY)? & 1;
        for _ in 0..100 {
            let now = self.target.read32(NVMC_READY)? & 1;
            if now == prev {
                return Ok(());
            }
            prev = now;
            self.target.pause_ms(1);
        }
        Err(Error::Flash {
            phase,
            addr: NVMC_READY,
        })
    }

    fn restore_ren(&mut self) -> Result<()> {
        self.set_config(Phase::Program, CONFIG_REN)
    }

    /// Quick pre-operation READY check with a short budget.
    fn wait_ready(&mut self, phase: Phase, addr: u32, budget_ms: u64) -> Result<()> {
        self.poll_ready(phase, addr, budget_ms, 1)
    }

    fn poll_ready(&mut self, phase: Phase, addr: u32, budget_ms: u64, interval_ms: u32) -> Result<()> {
        let deadline = self.target.now_ms() + budget_ms;
        loop {
            if self.target.read32(NVMC_READY)? & 1 == 1 {
                return Ok(());
            }
            if self.target.now_ms() > deadline {
                log::error!("NVMC not ready after {} ms ({:?})", budget_ms, phase);
                return Err(Error::Flash { phase, addr });
            }
            self.target.pause_ms(interval_ms);
        }
    }

    /// Sample four offsets across the page; a mismatch gets one re-read
    /// after a short delay before the erase is declared failed.
    fn verify_erased(&mut self, page: u32) -> Result<()> {
        for offset in [0, 4, 8, PAGE_SIZE - 4] {
            let addr = page + offset;
            let mut value = self.target.read32(addr)?;
            if value != ERASED_WORD {
                self.target.pause_ms(5);
                value = self.target.read32(addr)?;
            }
            if value != ERASED_WORD {
                log::error!("page {:08x} not erased: {:08x} at {:08x}", page, value, addr);
                return Err(Error::Flash {
                    phase: Phase::Verify,
                    addr,
                });
            }
        }
        Ok(())
    }
}

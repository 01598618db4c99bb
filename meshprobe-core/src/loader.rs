//! Image loading: coalesces decoded HEX records into page-aligned chunks
//! and pushes them through the flash engine.
//!
//! The coalescing buffer absorbs the tiny records HEX files are made of;
//! a flush erases the covering pages (once per page per upload) and
//! programs and verifies the buffer. Progress is pushed out through a
//! sink so the HTTP surface can report it while an upload is running.

use crate::hal::{Clock, DebugPin, Delay};
use crate::ihex;
use crate::nrf52::{page_base, FLASH_SIZE, PAGE_SIZE, UICR_BASE};
use crate::nvmc::{self, Nvmc};
use crate::target::Target;
use heapless::Vec;

/// What an upload claims to contain. Biases the default base address used
/// when the HEX stream has no extended-address records of its own.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    App,
    SoftDevice,
    Bootloader,
    Full,
}

impl Kind {
    pub fn default_base(self) -> u32 {
        match self {
            // Meshtastic application image above the SoftDevice
            Kind::App => 0x0002_6000,
            Kind::SoftDevice => 0x0000_0000,
            Kind::Bootloader => 0x000F_4000,
            Kind::Full => 0x0000_0000,
        }
    }

    pub fn from_query(s: &str) -> Option<Self> {
        match s {
            "app" => Some(Kind::App),
            "softdevice" => Some(Kind::SoftDevice),
            "bootloader" => Some(Kind::Bootloader),
            "full" => Some(Kind::Full),
            _ => None,
        }
    }
}

/// Snapshot of a running upload, polled by `/progress`.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    pub in_progress: bool,
    /// HEX payload bytes accepted from the stream.
    pub received: u32,
    /// Bytes actually programmed into flash.
    pub flashed: u32,
    /// Total expected, when the client announced one (Content-Length).
    pub total: u32,
    pub message: heapless::String<64>,
}

pub trait ProgressSink {
    fn update(&self, progress: &Progress);
}

/// No-op sink for callers that don't report progress.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn update(&self, _progress: &Progress) {}
}

pub const COALESCE_CAP: usize = 16 * 1024;

// 1 MiB of flash plus the UICR page, one bit per page.
const PAGE_BITMAP_BYTES: usize = (FLASH_SIZE / PAGE_SIZE) as usize / 8 + 1;
const UICR_PAGE_BIT: usize = (FLASH_SIZE / PAGE_SIZE) as usize;

/// Streams page-aligned chunks into flash. Pages are erased the first
/// time any chunk of the upload touches them, so scattered records within
/// one page cost a single erase.
pub struct FlashLoader<'a, 's, P: DebugPin, D: Delay, C: Clock, S: ProgressSink> {
    target: &'a mut Target<P, D, C>,
    erased: [u8; PAGE_BITMAP_BYTES],
    progress: Progress,
    sink: &'s S,
}

impl<'a, 's, P: DebugPin, D: Delay, C: Clock, S: ProgressSink> FlashLoader<'a, 's, P, D, C, S> {
    pub fn new(target: &'a mut Target<P, D, C>, total: u32, sink: &'s S) -> Self {
        let mut progress = Progress {
            in_progress: true,
            total,
            ..Progress::default()
        };
        let _ = progress.message.push_str("flashing");
        sink.update(&progress);
        FlashLoader {
            target,
            erased: [0; PAGE_BITMAP_BYTES],
            progress,
            sink,
        }
    }

    /// Erase the pages covering `[addr, addr+len)`, program and verify.
    pub fn flush(&mut self, addr: u32, data: &[u8]) -> nvmc::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let first = page_base(addr);
        let last = page_base(addr + data.len() as u32 - 1);
        let mut page = first;
        while page <= last {
            if !self.page_erased(page) {
                Nvmc::new(self.target).erase_page(page)?;
                self.mark_erased(page);
            }
            page += PAGE_SIZE;
        }

        let mut nvmc = Nvmc::new(self.target);
        nvmc.program(addr, data)?;
        nvmc.verify(addr, data)?;

        self.progress.flashed += data.len() as u32;
        self.sink.update(&self.progress);
        Ok(())
    }

    pub fn note_received(&mut self, bytes: u32) {
        self.progress.received += bytes;
        self.sink.update(&self.progress);
    }

    pub fn finish(&mut self, message: &str) {
        self.progress.in_progress = false;
        self.progress.message.clear();
        let _ = self.progress.message.push_str(message);
        self.sink.update(&self.progress);
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    fn page_bit(page: u32) -> Option<usize> {
        if page < FLASH_SIZE {
            Some((page / PAGE_SIZE) as usize)
        } else if page_base(page) == page_base(UICR_BASE) {
            Some(UICR_PAGE_BIT)
        } else {
            // peripheral or FICR space; never erased through here
            None
        }
    }

    fn page_erased(&self, page: u32) -> bool {
        match Self::page_bit(page) {
            Some(bit) => self.erased[bit / 8] & (1 << (bit % 8)) != 0,
            None => false,
        }
    }

    fn mark_erased(&mut self, page: u32) {
        if let Some(bit) = Self::page_bit(page) {
            self.erased[bit / 8] |= 1 << (bit % 8);
        }
    }
}

/// The 16 KiB coalescing buffer between the HEX parser and the flash
/// path. `bytes[0..len]` is always a contiguous image starting at `base`;
/// a gap, a full buffer or a 64 KiB linear-address boundary forces a
/// flush.
pub struct Coalescer<F> {
    base: u32,
    buf: Vec<u8, COALESCE_CAP>,
    flush: F,
}

impl<F, E> Coalescer<F>
where
    F: FnMut(u32, &[u8]) -> Result<(), E>,
{
    pub fn new(flush: F) -> Self {
        Coalescer {
            base: 0,
            buf: Vec::new(),
            flush,
        }
    }

    fn flush_now(&mut self) -> Result<(), E> {
        if !self.buf.is_empty() {
            (self.flush)(self.base, &self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl<F, E> ihex::Sink for Coalescer<F>
where
    F: FnMut(u32, &[u8]) -> Result<(), E>,
{
    type Error = E;

    fn data(&mut self, addr: u32, payload: &[u8]) -> Result<(), E> {
        let contiguous = addr == self.base + self.buf.len() as u32;
        if !self.buf.is_empty() && (!contiguous || self.buf.len() + payload.len() > COALESCE_CAP) {
            self.flush_now()?;
        }
        if self.buf.is_empty() {
            self.base = addr;
        }
        // a single record always fits an empty buffer
        let _ = self.buf.extend_from_slice(payload);
        Ok(())
    }

    fn eof(&mut self) -> Result<(), E> {
        self.flush_now()
    }

    fn linear_break(&mut self) -> Result<(), E> {
        self.flush_now()
    }
}

#![allow(dead_code)]

//! Bit-level simulated nRF52 target.
//!
//! Implements the target side of the SWD wire protocol behind the
//! `DebugPin` trait: it watches SWCLK edges, decodes request frames,
//! answers ACK/data phases with correct turnaround timing, and models a
//! DP, a MEM-AP with posted reads, the NVMC, the UICR and the Nordic
//! CTRL-AP. Tests drive the real drivers against it.

use meshprobe_core::hal::{Clock, DebugPin, Delay};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub const FLASH_SIZE: usize = 1024 * 1024;
pub const PAGE_SIZE: usize = 4096;
const UICR_BASE: u32 = 0x1000_1000;
const UICR_SIZE: u32 = 0x1000;

const NVMC_READY: u32 = 0x4001_E400;
const NVMC_CONFIG: u32 = 0x4001_E504;
const NVMC_ERASEPAGE: u32 = 0x4001_E508;
const NVMC_ERASEALL: u32 = 0x4001_E50C;

const ACK_OK: u8 = 0b001;
const ACK_WAIT: u8 = 0b010;
const ACK_FAULT: u8 = 0b100;

// CTRL/STAT STICKYERR
const STICKYERR: u32 = 1 << 5;

#[derive(Copy, Clone, Debug)]
struct Request {
    ap: bool,
    read: bool,
    addr: u8,
}

#[derive(Copy, Clone, Debug)]
enum Phase {
    /// Waiting for a line reset.
    Unsynced,
    /// Synced, waiting for a start bit.
    Idle,
    Request {
        bits: u8,
        count: u8,
    },
    /// Request accepted; two falling edges until the ACK drives.
    AckTurn {
        req: Request,
        falls: u8,
    },
    /// Target shifting ACK (and read data) out, LSB first.
    ShiftOut {
        bits: u64,
        remaining: u8,
        write_after: Option<Request>,
    },
    /// Turnaround before host-driven write data.
    WriteTurn {
        req: Request,
    },
    WriteData {
        req: Request,
        value: u64,
        count: u8,
    },
}

pub struct Sim {
    // line
    host_driving: bool,
    host_level: bool,
    target_out: bool,
    clk: bool,
    phase: Phase,
    ones_run: u32,

    // DP
    idcode: u32,
    select: u32,
    ctrl_stat: u32,
    sticky_err: bool,
    ap_buffer: u32,

    // MEM-AP
    csw: u32,
    tar: u32,

    // memories
    pub flash: Vec<u8>,
    pub uicr: Vec<u8>,
    nvmc_config: u32,

    // CTRL-AP
    ctrl_reset: u32,
    erase_pending: bool,
    erase_polls_left: u32,
    pub erase_all_count: u32,

    /// MEM-AP data access blocked until a CTRL-AP erase-all.
    pub protected: bool,

    // fault injection
    pub wait_responses: u32,
    pub fault_next: bool,

    pub transactions: u32,
}

impl Sim {
    pub fn new() -> Self {
        Sim {
            host_driving: false,
            host_level: false,
            target_out: false,
            clk: false,
            phase: Phase::Unsynced,
            ones_run: 0,
            idcode: meshprobe_core::nrf52::IDCODE_NRF52840,
            select: 0,
            ctrl_stat: 0,
            sticky_err: false,
            ap_buffer: 0,
            csw: 0,
            tar: 0,
            flash: vec![0xFF; FLASH_SIZE],
            uicr: vec![0xFF; UICR_SIZE as usize],
            nvmc_config: 0,
            ctrl_reset: 0,
            erase_pending: false,
            erase_polls_left: 0,
            erase_all_count: 0,
            protected: false,
            wait_responses: 0,
            fault_next: false,
            transactions: 0,
        }
    }

    pub fn sticky_err(&self) -> bool {
        self.sticky_err
    }

    pub fn flash_word(&self, addr: u32) -> u32 {
        let a = addr as usize;
        u32::from_le_bytes([
            self.flash[a],
            self.flash[a + 1],
            self.flash[a + 2],
            self.flash[a + 3],
        ])
    }

    fn line_level(&self) -> bool {
        if self.host_driving {
            self.host_level
        } else {
            self.target_out
        }
    }

    fn clk_edge(&mut self, high: bool) {
        if self.clk == high {
            return;
        }
        self.clk = high;
        if high {
            self.rising();
        } else {
            self.falling();
        }
    }

    fn rising(&mut self) {
        let level = self.line_level();
        match self.phase {
            Phase::Unsynced => {
                if level {
                    self.ones_run += 1;
                } else {
                    if self.ones_run >= 50 {
                        self.phase = Phase::Idle;
                    }
                    self.ones_run = 0;
                }
            }
            Phase::Idle => {
                if level {
                    self.ones_run += 1;
                    self.phase = Phase::Request { bits: 1, count: 1 };
                } else {
                    self.ones_run = 0;
                }
            }
            Phase::Request { mut bits, mut count } => {
                if level {
                    self.ones_run += 1;
                    bits |= 1 << count;
                } else {
                    self.ones_run = 0;
                }
                count += 1;
                if count < 8 {
                    self.phase = Phase::Request { bits, count };
                } else {
                    match Self::parse_request(bits) {
                        Some(req) => {
                            self.phase = Phase::AckTurn { req, falls: 0 };
                        }
                        None => self.phase = Phase::Unsynced,
                    }
                }
            }
            Phase::WriteTurn { req } => {
                self.phase = Phase::WriteData {
                    req,
                    value: 0,
                    count: 0,
                };
            }
            Phase::WriteData {
                req,
                mut value,
                mut count,
            } => {
                if level {
                    value |= 1u64 << count;
                }
                count += 1;
                if count < 33 {
                    self.phase = Phase::WriteData { req, value, count };
                } else {
                    let data = value as u32;
                    let parity = (value >> 32) as u32 & 1;
                    if parity == data.count_ones() & 1 {
                        self.bus_write(req, data);
                    }
                    self.ones_run = 0;
                    self.phase = Phase::Idle;
                }
            }
            _ => (),
        }
    }

    fn falling(&mut self) {
        match self.phase {
            Phase::AckTurn { req, falls } => {
                if falls == 0 {
                    self.phase = Phase::AckTurn { req, falls: 1 };
                    return;
                }
                self.ones_run = 0;
                self.transactions += 1;
                let ack = self.decide_ack(req);
                let (mut bits, remaining, write_after) = if ack != ACK_OK {
                    (ack as u64, 3u8, None)
                } else if req.read {
                    let data = self.bus_read(req);
                    let parity = (data.count_ones() & 1) as u64;
                    (
                        ack as u64 | (data as u64) << 3 | parity << 35,
                        36,
                        None,
                    )
                } else {
                    (ack as u64, 3, Some(req))
                };
                self.target_out = bits & 1 != 0;
                bits >>= 1;
                self.phase = Phase::ShiftOut {
                    bits,
                    remaining: remaining - 1,
                    write_after,
                };
            }
            Phase::ShiftOut {
                mut bits,
                remaining,
                write_after,
            } => {
                if remaining > 0 {
                    self.target_out = bits & 1 != 0;
                    bits >>= 1;
                    self.phase = Phase::ShiftOut {
                        bits,
                        remaining: remaining - 1,
                        write_after,
                    };
                } else {
                    self.target_out = false;
                    self.phase = match write_after {
                        Some(req) => Phase::WriteTurn { req },
                        None => Phase::Idle,
                    };
                }
            }
            _ => (),
        }
    }

    fn parse_request(bits: u8) -> Option<Request> {
        let start = bits & 1 != 0;
        let ap = bits >> 1 & 1 != 0;
        let read = bits >> 2 & 1 != 0;
        let a = bits >> 3 & 0b11;
        let parity = bits >> 5 & 1;
        let stop = bits >> 6 & 1 != 0;
        let park = bits >> 7 & 1 != 0;
        let computed = (bits >> 1 & 0xF).count_ones() as u8 & 1;
        if start && !stop && park && parity == computed {
            Some(Request {
                ap,
                read,
                addr: a << 2,
            })
        } else {
            None
        }
    }

    fn apsel(&self) -> u8 {
        (self.select >> 24) as u8
    }

    fn ap_addr(&self, req: &Request) -> u8 {
        (self.select as u8 & 0xF0) | req.addr
    }

    fn decide_ack(&mut self, req: Request) -> u8 {
        if self.wait_responses > 0 {
            self.wait_responses -= 1;
            return ACK_WAIT;
        }
        if req.ap {
            if self.fault_next {
                self.fault_next = false;
                self.sticky_err = true;
                return ACK_FAULT;
            }
            if self.sticky_err {
                return ACK_FAULT;
            }
            // APPROTECT blocks MEM-AP data access; AP registers still
            // respond so IDR scans work.
            if self.protected && self.apsel() == 0 && self.ap_addr(&req) == 0x0C {
                self.sticky_err = true;
                return ACK_FAULT;
            }
        }
        ACK_OK
    }

    fn bus_read(&mut self, req: Request) -> u32 {
        if !req.ap {
            match req.addr {
                0x0 => self.idcode,
                0x4 => self.read_ctrl_stat(),
                0xC => self.ap_buffer,
                _ => 0,
            }
        } else {
            // posted: this transaction returns the previous AP read
            let prev = self.ap_buffer;
            let addr = self.ap_addr(&req);
            self.ap_buffer = self.ap_read(self.apsel(), addr);
            prev
        }
    }

    fn bus_write(&mut self, req: Request, value: u32) {
        if !req.ap {
            match req.addr {
                0x0 => {
                    // ABORT
                    if value & 0x1E != 0 {
                        self.sticky_err = false;
                    }
                }
                0x4 => self.ctrl_stat = value,
                0x8 => self.select = value,
                _ => (),
            }
        } else {
            let addr = self.ap_addr(&req);
            self.ap_write(self.apsel(), addr, value);
        }
    }

    fn read_ctrl_stat(&self) -> u32 {
        let mut v = self.ctrl_stat & 0x5000_0000;
        // power-up acks track the request bits
        if self.ctrl_stat & (1 << 28) != 0 {
            v |= 1 << 29;
        }
        if self.ctrl_stat & (1 << 30) != 0 {
            v |= 1 << 31;
        }
        if self.sticky_err {
            v |= STICKYERR;
        }
        v
    }

    fn ap_read(&mut self, apsel: u8, addr: u8) -> u32 {
        match (apsel, addr) {
            (0, 0x00) => self.csw,
            (0, 0x04) => self.tar,
            (0, 0x0C) => {
                let value = self.mem_read32(self.tar);
                if self.csw & 0x10 != 0 {
                    self.tar = self.tar.wrapping_add(4);
                }
                value
            }
            (0, 0xFC) => 0x2477_0011,
            (1, 0x00) => self.ctrl_reset,
            (1, 0x08) => {
                if self.erase_pending {
                    if self.erase_polls_left > 0 {
                        self.erase_polls_left -= 1;
                        1
                    } else {
                        self.erase_pending = false;
                        self.complete_erase_all();
                        0
                    }
                } else {
                    0
                }
            }
            (1, 0x0C) => u32::from(!self.protected),
            (1, 0xFC) => 0x0288_0000,
            _ => 0,
        }
    }

    fn ap_write(&mut self, apsel: u8, addr: u8, value: u32) {
        match (apsel, addr) {
            (0, 0x00) => self.csw = value,
            (0, 0x04) => self.tar = value,
            (0, 0x0C) => {
                self.mem_write32(self.tar, value);
                if self.csw & 0x10 != 0 {
                    self.tar = self.tar.wrapping_add(4);
                }
            }
            (1, 0x00) => self.ctrl_reset = value,
            (1, 0x04) => {
                if value == 1 {
                    self.erase_pending = true;
                    self.erase_polls_left = 3;
                    self.erase_all_count += 1;
                }
            }
            _ => (),
        }
    }

    fn complete_erase_all(&mut self) {
        self.flash.fill(0xFF);
        self.uicr.fill(0xFF);
        self.protected = false;
    }

    fn mem_read32(&mut self, addr: u32) -> u32 {
        if (addr as usize) < FLASH_SIZE {
            return self.flash_word(addr);
        }
        if (UICR_BASE..UICR_BASE + UICR_SIZE).contains(&addr) {
            let o = (addr - UICR_BASE) as usize;
            return u32::from_le_bytes([
                self.uicr[o],
                self.uicr[o + 1],
                self.uicr[o + 2],
                self.uicr[o + 3],
            ]);
        }
        match addr {
            NVMC_READY => 1,
            NVMC_CONFIG => self.nvmc_config,
            0x1000_0100 => 0x0005_2840, // FICR INFO.PART
            _ => 0,
        }
    }

    fn mem_write32(&mut self, addr: u32, value: u32) {
        match addr {
            NVMC_CONFIG => self.nvmc_config = value & 3,
            NVMC_ERASEPAGE => {
                if self.nvmc_config == 2 {
                    self.erase_page(value);
                }
            }
            NVMC_ERASEALL => {
                if self.nvmc_config == 2 && value == 1 {
                    // NVMC erase-all wipes code flash, not the UICR
                    self.flash.fill(0xFF);
                }
            }
            _ => {
                if self.nvmc_config == 1 {
                    // programming ANDs into the array, like real flash
                    let bytes = value.to_le_bytes();
                    if (addr as usize) + 4 <= FLASH_SIZE {
                        for (i, b) in bytes.iter().enumerate() {
                            self.flash[addr as usize + i] &= b;
                        }
                    } else if (UICR_BASE..UICR_BASE + UICR_SIZE - 3).contains(&addr) {
                        let o = (addr - UICR_BASE) as usize;
                        for (i, b) in bytes.iter().enumerate() {
                            self.uicr[o + i] &= b;
                        }
                    }
                }
            }
        }
    }

    fn erase_page(&mut self, addr: u32) {
        let page = addr & !(PAGE_SIZE as u32 - 1);
        if (page as usize) < FLASH_SIZE {
            self.flash[page as usize..page as usize + PAGE_SIZE].fill(0xFF);
        } else if page == UICR_BASE & !(PAGE_SIZE as u32 - 1) {
            self.uicr.fill(0xFF);
        }
    }
}

/// Shared handle the pin stand-ins talk to.
pub type SimHandle = Rc<RefCell<Sim>>;

pub fn sim() -> SimHandle {
    Rc::new(RefCell::new(Sim::new()))
}

#[derive(Copy, Clone, PartialEq)]
pub enum Role {
    Swclk,
    Swdio,
    Nreset,
}

pub struct SimPin {
    sim: SimHandle,
    role: Role,
}

impl SimPin {
    pub fn new(sim: &SimHandle, role: Role) -> Self {
        SimPin {
            sim: sim.clone(),
            role,
        }
    }
}

impl DebugPin for SimPin {
    fn set_output(&mut self) {
        if self.role == Role::Swdio {
            self.sim.borrow_mut().host_driving = true;
        }
    }

    fn set_input(&mut self) {
        if self.role == Role::Swdio {
            self.sim.borrow_mut().host_driving = false;
        }
    }

    fn set_high(&mut self) {
        let mut sim = self.sim.borrow_mut();
        match self.role {
            Role::Swclk => sim.clk_edge(true),
            Role::Swdio => sim.host_level = true,
            Role::Nreset => (),
        }
    }

    fn set_low(&mut self) {
        let mut sim = self.sim.borrow_mut();
        match self.role {
            Role::Swclk => sim.clk_edge(false),
            Role::Swdio => sim.host_level = false,
            Role::Nreset => (),
        }
    }

    fn is_high(&self) -> bool {
        let sim = self.sim.borrow();
        match self.role {
            Role::Swdio => sim.line_level(),
            Role::Swclk => sim.clk,
            Role::Nreset => true,
        }
    }
}

pub struct NoDelay;

impl Delay for NoDelay {
    fn delay_us(&mut self, _us: u32) {}

    fn delay_cycles(&mut self, _cycles: u32) {}
}

/// Monotonic test clock; advances on every read so wait loops always
/// make progress.
#[derive(Clone)]
pub struct TestClock(Rc<Cell<u64>>);

impl TestClock {
    pub fn new() -> Self {
        TestClock(Rc::new(Cell::new(0)))
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        let t = self.0.get() + 1;
        self.0.set(t);
        t
    }
}

pub type SimTarget = meshprobe_core::target::Target<SimPin, NoDelay, TestClock>;

/// A ready-to-connect target wired to a fresh simulator.
pub fn target(sim: &SimHandle) -> SimTarget {
    let swd = meshprobe_core::swd::Swd::new(
        SimPin::new(sim, Role::Swclk),
        SimPin::new(sim, Role::Swdio),
        Some(SimPin::new(sim, Role::Nreset)),
        NoDelay,
        0,
    );
    let dap = meshprobe_core::dap::Dap::new(swd);
    meshprobe_core::target::Target::new(dap, TestClock::new())
}

// Copyright 2025 meshprobe contributors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Bit-banged SWD line driver.
//!
//! Produces the raw SWD bit-stream on two GPIOs. Data is changed on the
//! falling edge of SWCLK and sampled by the target on the rising edge;
//! reads sample the line just before driving the rising edge. One call is
//! one transaction; retry policy lives a layer up in [`crate::dap`].

use crate::hal::{DebugPin, Delay};
use num_enum::IntoPrimitive;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    BadParity,
    AckWait,
    AckFault,
    AckProtocol,
    AckUnknown(u8),
}

pub type Result<T> = core::result::Result<T, Error>;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
pub enum Port {
    Dp = 0,
    Ap = 1,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, IntoPrimitive)]
enum RnW {
    W = 0,
    R = 1,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ack {
    Ok = 0b001,
    Wait = 0b010,
    Fault = 0b100,
    Protocol = 0b111,
}

impl Ack {
    pub fn try_ok(ack: u8) -> Result<()> {
        match ack {
            v if v == (Ack::Ok as u8) => Ok(()),
            v if v == (Ack::Wait as u8) => Err(Error::AckWait),
            v if v == (Ack::Fault as u8) => Err(Error::AckFault),
            v if v == (Ack::Protocol as u8) => Err(Error::AckProtocol),
            _ => Err(Error::AckUnknown(ack)),
        }
    }
}

/// Who currently owns SWDIO. Tracked so the turnaround cycle is inserted
/// exactly once per direction change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DrivePhase {
    Drive,
    Release,
}

// ADIv5 B4.3.3: at least 50 cycles with SWDIO high resets the line.
const LINE_RESET_HIGH_CYCLES: u32 = 56;

// 16-bit JTAG-to-SWD select sequence, transmitted LSB first.
const JTAG_TO_SWD: u16 = 0xE79E;

// 128-bit dormant-to-SWD selection alert, each word sent MSB first.
const SELECTION_ALERT: [u32; 4] = [0x49CF_9046, 0xA9B4_A161, 0x97F5_BBC7, 0x4570_3D98];

// SWD activation code following the selection alert, sent MSB first.
const SWD_ACTIVATION_CODE: u8 = 0x58;

pub struct Swd<P: DebugPin, D: Delay> {
    swclk: P,
    swdio: P,
    nreset: Option<P>,
    delay: D,
    // no-op count per half bit cell; tunes the bit rate below the
    // target's maximum SWD frequency
    half_cycle: u32,
    drive_phase: DrivePhase,
}

impl<P: DebugPin, D: Delay> Swd<P, D> {
    pub fn new(mut swclk: P, mut swdio: P, nreset: Option<P>, delay: D, half_cycle: u32) -> Self {
        swclk.set_low();
        swclk.set_output();
        // The target owns the SWDIO pull; start released until the first
        // sequence takes the bus.
        swdio.set_input();
        Swd {
            swclk,
            swdio,
            nreset,
            delay,
            half_cycle,
            drive_phase: DrivePhase::Release,
        }
    }

    /// Releases both pins and returns them. The session calls this when
    /// the target is handed back to the world.
    pub fn release(mut self) -> (P, P, Option<P>) {
        self.swclk.set_input();
        self.swdio.set_input();
        (self.swclk, self.swdio, self.nreset)
    }

    pub(crate) fn pause_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Drive SWDIO high for ≥50 cycles, then one low cycle.
    pub fn line_reset(&mut self) {
        critical_section::with(|_| {
            self.take_bus();
            self.swdio.set_high();
            self.clock_out(LINE_RESET_HIGH_CYCLES);
            self.swdio.set_low();
            self.clock_out(1);
        })
    }

    /// JTAG-to-SWD switch sequence. Callers bracket this with line resets.
    pub fn jtag_to_swd(&mut self) {
        critical_section::with(|_| {
            self.take_bus();
            self.write_bits_lsb(JTAG_TO_SWD as u32, 16);
        })
    }

    /// Wake a dormant SW-DP: 8 high cycles, the 128-bit selection alert,
    /// 4 low cycles, the SWD activation code, then a line reset.
    pub fn dormant_wakeup(&mut self) {
        critical_section::with(|_| {
            self.take_bus();
            self.swdio.set_high();
            self.clock_out(8);
            for word in SELECTION_ALERT {
                self.write_bits_msb(word, 32);
            }
            self.swdio.set_low();
            self.clock_out(4);
            self.write_bits_msb(SWD_ACTIVATION_CODE as u32, 8);
        });
        self.line_reset();
    }

    /// Hold or release the target's hardware reset line, if wired.
    pub fn set_nreset(&mut self, asserted: bool) {
        if let Some(pin) = self.nreset.as_mut() {
            if asserted {
                pin.set_low();
                pin.set_output();
            } else {
                // release to input; the target's pull brings it up
                pin.set_input();
            }
        }
    }

    pub fn read(&mut self, port: Port, addr: u8) -> Result<u32> {
        critical_section::with(|_| self.read_inner(port, addr))
    }

    pub fn write(&mut self, port: Port, addr: u8, data: u32) -> Result<()> {
        critical_section::with(|_| self.write_inner(port, addr, data))
    }

    fn read_inner(&mut self, port: Port, addr: u8) -> Result<u32> {
        self.take_bus();
        self.write_bits_lsb(Self::make_request(port, RnW::R, addr) as u32, 8);
        self.turn_to_target();

        let ack = self.read_bits(3) as u8;
        match Ack::try_ok(ack) {
            Ok(()) => (),
            Err(e) => {
                self.dummy_data_phase();
                return Err(e);
            }
        }

        let data = self.read_bits(32);
        let parity = self.read_bits(1);
        // Back to driving SWDIO so it doesn't float high
        self.turn_to_host();
        self.write_bit(false);

        if parity == data.count_ones() & 1 {
            Ok(data)
        } else {
            Err(Error::BadParity)
        }
    }

    fn write_inner(&mut self, port: Port, addr: u8, data: u32) -> Result<()> {
        self.take_bus();
        self.write_bits_lsb(Self::make_request(port, RnW::W, addr) as u32, 8);
        self.turn_to_target();

        let ack = self.read_bits(3) as u8;
        match Ack::try_ok(ack) {
            Ok(()) => (),
            Err(e) => {
                self.dummy_data_phase();
                return Err(e);
            }
        }

        self.turn_to_host();
        self.write_bits_lsb(data, 32);
        self.write_bit(data.count_ones() & 1 == 1);
        self.write_bit(false);
        Ok(())
    }

    // After a non-OK ACK the target has released the bus but still expects
    // a data phase if sticky-overrun is enabled; clock out 32 zero bits and
    // the park cycle so either configuration stays in sync.
    fn dummy_data_phase(&mut self) {
        self.turn_to_host();
        self.write_bits_lsb(0, 32);
        self.write_bit(false);
    }

    fn make_request(port: Port, rnw: RnW, addr: u8) -> u8 {
        let a = (addr >> 2) & 0b11;
        let req = 1 | ((port as u8) << 1) | ((rnw as u8) << 2) | (a << 3) | (1 << 7);
        let parity = (req >> 1 & 0xF).count_ones() as u8 & 1;
        req | (parity << 5)
    }

    #[inline]
    fn write_bit(&mut self, bit: bool) {
        if bit {
            self.swdio.set_high();
        } else {
            self.swdio.set_low();
        }
        self.delay.delay_cycles(self.half_cycle);
        self.swclk.set_high();
        self.delay.delay_cycles(self.half_cycle);
        self.swclk.set_low();
    }

    #[inline]
    fn read_bit(&mut self) -> bool {
        self.delay.delay_cycles(self.half_cycle);
        // Sample before the rising edge; the target shifts on it.
        let bit = self.swdio.is_high();
        self.swclk.set_high();
        self.delay.delay_cycles(self.half_cycle);
        self.swclk.set_low();
        bit
    }

    fn write_bits_lsb(&mut self, value: u32, count: u8) {
        let mut value = value;
        for _ in 0..count {
            self.write_bit(value & 1 != 0);
            value >>= 1;
        }
    }

    fn write_bits_msb(&mut self, value: u32, count: u8) {
        for i in (0..count).rev() {
            self.write_bit(value >> i & 1 != 0);
        }
    }

    fn read_bits(&mut self, count: u8) -> u32 {
        let mut value = 0;
        for i in 0..count {
            if self.read_bit() {
                value |= 1 << i;
            }
        }
        value
    }

    /// Clock cycles with SWDIO held at its current level.
    fn clock_out(&mut self, cycles: u32) {
        for _ in 0..cycles {
            self.delay.delay_cycles(self.half_cycle);
            self.swclk.set_high();
            self.delay.delay_cycles(self.half_cycle);
            self.swclk.set_low();
        }
    }

    /// One turnaround cycle with the line released, then the target owns
    /// SWDIO.
    fn turn_to_target(&mut self) {
        debug_assert_eq!(self.drive_phase, DrivePhase::Drive);
        self.swdio.set_input();
        self.clock_out(1);
        self.drive_phase = DrivePhase::Release;
    }

    /// One turnaround cycle with the line released, then the host drives.
    fn turn_to_host(&mut self) {
        debug_assert_eq!(self.drive_phase, DrivePhase::Release);
        self.clock_out(1);
        self.swdio.set_output();
        self.drive_phase = DrivePhase::Drive;
    }

    fn take_bus(&mut self) {
        if self.drive_phase == DrivePhase::Release {
            self.turn_to_host();
        }
    }
}

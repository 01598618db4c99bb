//! esp-hal implementations of the core's collaborator traits.

use esp_hal::gpio::{
    DriveMode, DriveStrength, Flex, InputConfig, OutputConfig, Pull,
};
use meshprobe_core::hal::{Clock, DebugPin, Delay};

/// A GPIO in flexible mode, handed to the SWD driver. Starts as an input
/// without a pull: the target owns the SWDIO pull.
pub struct FlexPin<'a> {
    pin: Flex<'a>,
}

impl<'a> FlexPin<'a> {
    pub fn new(mut pin: Flex<'a>) -> Self {
        let input_config = InputConfig::default().with_pull(Pull::None);
        pin.apply_input_config(&input_config);
        let output_config = OutputConfig::default()
            .with_drive_strength(DriveStrength::_20mA)
            .with_drive_mode(DriveMode::PushPull);
        pin.apply_output_config(&output_config);
        pin.set_input_enable(true);
        FlexPin { pin }
    }
}

impl DebugPin for FlexPin<'_> {
    fn set_output(&mut self) {
        self.pin.set_input_enable(false);
        self.pin.set_output_enable(true);
    }

    fn set_input(&mut self) {
        self.pin.set_output_enable(false);
        self.pin.set_input_enable(true);
    }

    fn set_high(&mut self) {
        self.pin.set_high();
    }

    fn set_low(&mut self) {
        self.pin.set_low();
    }

    fn is_high(&self) -> bool {
        self.pin.is_high()
    }
}

/// Busy-wait pacing for SWD bit cells and the short NVMC waits. The
/// half-cycle count passed to the SWD driver is in these units.
pub struct CycleDelay {
    cycles_per_us: u32,
}

impl CycleDelay {
    pub fn new(cpu_mhz: u32) -> Self {
        CycleDelay {
            cycles_per_us: cpu_mhz,
        }
    }
}

impl Delay for CycleDelay {
    fn delay_us(&mut self, us: u32) {
        riscv::asm::delay(us.saturating_mul(self.cycles_per_us));
    }

    fn delay_cycles(&mut self, cycles: u32) {
        riscv::asm::delay(cycles);
    }
}

/// Milliseconds since boot, from the embassy time driver.
#[derive(Copy, Clone)]
pub struct UptimeClock;

impl Clock for UptimeClock {
    fn now_ms(&self) -> u64 {
        embassy_time::Instant::now().as_millis()
    }
}

//! Target power rail, switched through a MOSFET gate.
//!
//! Board revisions disagree on the gate polarity, so it is a persisted
//! configuration bit, never a compile-time convention. Verify against
//! the schematic before changing the stored default.

use embassy_time::Timer;
use esp_hal::gpio::Output;

pub const POLARITY_KEY: &str = "rail_active_low";

pub struct PowerRail<'a> {
    gate: Output<'a>,
    active_low: bool,
    on: bool,
}

impl<'a> PowerRail<'a> {
    pub fn new(gate: Output<'a>, active_low: bool) -> Self {
        let mut rail = PowerRail {
            gate,
            active_low,
            on: false,
        };
        rail.set(false);
        rail
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn set(&mut self, on: bool) {
        let level_high = on != self.active_low;
        if level_high {
            self.gate.set_high();
        } else {
            self.gate.set_low();
        }
        self.on = on;
        log::info!("target rail {}", if on { "on" } else { "off" });
    }

    pub async fn reboot(&mut self) {
        self.set(false);
        Timer::after_millis(500).await;
        self.set(true);
    }
}

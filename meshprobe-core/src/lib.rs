#![no_std]

pub mod ble;
pub mod ctrlap;
pub mod dap;
pub mod hal;
pub mod ihex;
pub mod loader;
pub mod mem;
pub mod nrf52;
pub mod nvmc;
pub mod proxy;
pub mod swd;
pub mod target;

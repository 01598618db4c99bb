//! Application state and the operations the HTTP surface invokes.
//!
//! Handlers are thin: they parse the request, call one of these
//! operations and serialize the outcome. Every SWD operation takes the
//! session mutex for its whole duration, so the line driver is strictly
//! single-writer.

use core::cell::RefCell;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use heapless::{String, Vec};

use meshprobe_core::ble::Addr;
use meshprobe_core::hal::KvStore;
use meshprobe_core::loader::Progress;
use meshprobe_core::nrf52::{APPROTECT_HW_DISABLED, UICR_APPROTECT};
use meshprobe_core::proxy::{FanOut, Frame};
use meshprobe_core::target::Target;
use meshprobe_core::{ctrlap, dap, nvmc, target};

use crate::kv::FlashKv;
use crate::pins::{CycleDelay, FlexPin, UptimeClock};
use crate::power::PowerRail;

pub type ProbeTarget = Target<FlexPin<'static>, CycleDelay, UptimeClock>;
pub type Json = String<512>;

/// Commands from the HTTP surface to the BLE supervisor task.
#[derive(Clone, Debug)]
pub enum BleCommand {
    Connect(Addr),
    Disconnect,
    Passkey(u32),
    StartScan,
    StopScan,
}

#[derive(Clone, Debug, Default)]
pub struct BleStatus {
    pub state: &'static str,
    pub peer: Option<Addr>,
}

#[derive(Clone, Debug)]
pub struct ScanResult {
    pub addr: Addr,
    pub rssi: i8,
    pub name: String<24>,
}

pub const MAX_SCAN_RESULTS: usize = 16;

pub static BLE_COMMANDS: Channel<CriticalSectionRawMutex, BleCommand, 4> = Channel::new();
/// Chunked TCP-to-BLE frames, drained by the BLE supervisor.
pub static BLE_TX: Channel<CriticalSectionRawMutex, Frame, 4> = Channel::new();

pub struct App {
    pub swd: Mutex<CriticalSectionRawMutex, ProbeTarget>,
    pub power: Mutex<CriticalSectionRawMutex, PowerRail<'static>>,
    pub kv: BlockingMutex<CriticalSectionRawMutex, RefCell<FlashKv>>,
    pub fanout: FanOut,
    pub progress: BlockingMutex<CriticalSectionRawMutex, RefCell<Progress>>,
    pub ble_status: BlockingMutex<CriticalSectionRawMutex, RefCell<BleStatus>>,
    pub scan_results:
        BlockingMutex<CriticalSectionRawMutex, RefCell<Vec<ScanResult, MAX_SCAN_RESULTS>>>,
    pub ble_mtu: AtomicU16,
    pub shutdown: AtomicBool,
}

impl App {
    pub fn new(target: ProbeTarget, power: PowerRail<'static>, kv: FlashKv) -> Self {
        App {
            swd: Mutex::new(target),
            power: Mutex::new(power),
            kv: BlockingMutex::new(RefCell::new(kv)),
            fanout: FanOut::new(),
            progress: BlockingMutex::new(RefCell::new(Progress::default())),
            ble_status: BlockingMutex::new(RefCell::new(BleStatus {
                state: "IDLE",
                peer: None,
            })),
            scan_results: BlockingMutex::new(RefCell::new(Vec::new())),
            ble_mtu: AtomicU16::new(23),
            shutdown: AtomicBool::new(false),
        }
    }

    pub async fn check_swd(&self) -> Json {
        let mut target = self.swd.lock().await;
        if !target.is_connected() {
            if let Err(e) = target.connect() {
                self.record_error(target_code(&e));
                return err_json(target_code(&e), "target not responding");
            }
        }

        let idcode = target.last_idcode();
        let mut out = Json::new();
        match target.read32(UICR_APPROTECT) {
            Ok(word) => {
                let approtect = if word == 0xFFFF_FFFF || word == APPROTECT_HW_DISABLED {
                    "disabled"
                } else {
                    "enabled"
                };
                let _ = write!(
                    out,
                    "{{\"connected\":true,\"idcode\":\"0x{:08X}\",\"approtect\":\"{}\",\"status\":\"ok\",\"version\":\"{}\"}}",
                    idcode, approtect, crate::VERSION
                );
            }
            Err(_) => {
                // a locked part answers on the DP but faults on memory
                let _ = write!(
                    out,
                    "{{\"connected\":true,\"idcode\":\"0x{:08X}\",\"approtect\":\"blocked\",\"status\":\"protected\",\"version\":\"{}\"}}",
                    idcode, crate::VERSION
                );
            }
        }
        out
    }

    pub async fn release_swd(&self) -> Json {
        let mut target = self.swd.lock().await;
        target.disconnect();
        let mut out = Json::new();
        let _ = out.push_str("released");
        out
    }

    pub async fn erase_all(&self) -> Json {
        let mut target = self.swd.lock().await;
        if let Err(e) = ensure_connected(&mut target) {
            return e;
        }
        match nvmc::Nvmc::new(&mut target).erase_all() {
            Ok(()) => ok_json("flash erased (UICR untouched)"),
            Err(e) => {
                self.record_error(nvmc_code(&e));
                err_json(nvmc_code(&e), "erase failed")
            }
        }
    }

    pub async fn disable_protection(&self) -> Json {
        let mut target = self.swd.lock().await;
        if let Err(e) = ensure_connected(&mut target) {
            return e;
        }
        match nvmc::Nvmc::new(&mut target).disable_approtect() {
            Ok(()) => ok_json("APPROTECT disable sentinel programmed"),
            Err(e) => {
                self.record_error(nvmc_code(&e));
                err_json(nvmc_code(&e), "could not program UICR")
            }
        }
    }

    pub async fn mass_erase(&self) -> Json {
        let mut target = self.swd.lock().await;
        if let Err(e) = ensure_connected(&mut target) {
            return e;
        }
        match ctrlap::mass_erase(&mut target) {
            Ok(report) => {
                let mut out = Json::new();
                let _ = write!(
                    out,
                    "{{\"success\":true,\"message\":\"unlocked via CTRL-AP {} in {} ms\"}}",
                    report.ap_index, report.elapsed_ms
                );
                out
            }
            Err(e) => {
                self.record_error(ctrlap_code(&e));
                // an interrupted erase leaves the part indeterminate
                err_json(ctrlap_code(&e), "unlock failed; power cycle the target")
            }
        }
    }

    pub fn progress_json(&self) -> Json {
        let mut out = Json::new();
        self.progress.lock(|p| {
            let p = p.borrow();
            let _ = write!(
                out,
                "{{\"in_progress\":{},\"received\":{},\"flashed\":{},\"total\":{},\"message\":\"{}\"}}",
                p.in_progress, p.received, p.flashed, p.total, p.message
            );
        });
        out
    }

    pub fn set_progress(&self, value: &Progress) {
        self.progress.lock(|p| {
            *p.borrow_mut() = value.clone();
        });
    }

    pub async fn power_set(&self, on: bool) -> Json {
        self.power.lock().await.set(on);
        ok_json(if on { "rail on" } else { "rail off" })
    }

    pub async fn power_reboot(&self) -> Json {
        self.power.lock().await.reboot().await;
        ok_json("rail cycled")
    }

    pub fn ble_status_json(&self) -> Json {
        let mut out = Json::new();
        self.ble_status.lock(|s| {
            let s = s.borrow();
            let _ = match s.peer {
                Some(peer) => write!(
                    out,
                    "{{\"connected\":{},\"state\":\"{}\",\"peer_addr\":\"{}\"}}",
                    s.state == "READY",
                    s.state,
                    peer
                ),
                None => write!(
                    out,
                    "{{\"connected\":false,\"state\":\"{}\",\"peer_addr\":null}}",
                    s.state
                ),
            };
        });
        out
    }

    pub fn set_ble_status(&self, state: &'static str, peer: Option<Addr>) {
        self.ble_status.lock(|s| {
            let mut s = s.borrow_mut();
            s.state = state;
            s.peer = peer;
        });
    }

    pub fn ble_command(&self, command: BleCommand) -> Json {
        match BLE_COMMANDS.try_send(command) {
            Ok(()) => ok_json("queued"),
            Err(_) => err_json("busy", "BLE command queue full"),
        }
    }

    pub fn scan_results_json(&self) -> Json {
        let mut out = Json::new();
        let _ = out.push_str("{\"devices\":[");
        self.scan_results.lock(|r| {
            for (i, dev) in r.borrow().iter().enumerate() {
                if i > 0 {
                    let _ = out.push(',');
                }
                let _ = write!(
                    out,
                    "{{\"addr\":\"{}\",\"rssi\":{},\"name\":\"{}\"}}",
                    dev.addr, dev.rssi, dev.name
                );
            }
        });
        let _ = out.push_str("]}");
        out
    }

    pub fn note_scan_result(&self, result: ScanResult) {
        self.scan_results.lock(|r| {
            let mut r = r.borrow_mut();
            if let Some(existing) = r.iter_mut().find(|d| d.addr == result.addr) {
                *existing = result;
            } else {
                let _ = r.push(result);
            }
        });
    }

    pub fn clear_scan_results(&self) -> Json {
        self.scan_results.lock(|r| r.borrow_mut().clear());
        ok_json("cleared")
    }

    pub fn mtu(&self) -> u16 {
        self.ble_mtu.load(Ordering::Relaxed)
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.ble_mtu.store(mtu, Ordering::Relaxed);
    }

    /// Queue one already-chunked frame for the BLE link.
    pub async fn ble_send(&self, chunk: &[u8]) -> Result<(), ()> {
        let mut frame = Frame::new();
        frame.extend_from_slice(chunk).map_err(|_| ())?;
        BLE_TX.send(frame).await;
        Ok(())
    }

    /// Persist the last error so it survives a power cycle.
    pub fn record_error(&self, code: &str) {
        self.kv.lock(|kv| {
            let _ = kv.borrow_mut().put("last_error", code.as_bytes());
        });
    }
}

fn ensure_connected(target: &mut ProbeTarget) -> Result<(), Json> {
    if target.is_connected() {
        return Ok(());
    }
    target
        .connect()
        .map(|_| ())
        .map_err(|e| err_json(target_code(&e), "target not responding"))
}

pub fn ok_json(message: &str) -> Json {
    let mut out = Json::new();
    let _ = write!(out, "{{\"success\":true,\"message\":\"{}\"}}", message);
    out
}

pub fn err_json(code: &str, message: &str) -> Json {
    let mut out = Json::new();
    let _ = write!(
        out,
        "{{\"success\":false,\"code\":\"{}\",\"message\":\"{}\"}}",
        code, message
    );
    out
}

pub fn target_code(e: &target::Error) -> &'static str {
    match e {
        target::Error::NoTarget => "no_target",
        target::Error::PowerUpTimeout => "powerup_timeout",
        target::Error::LinkLost => "link_lost",
        target::Error::NotConnected => "not_connected",
        target::Error::InvalidArgument => "invalid_argument",
        target::Error::Bus(e) => dap_code(e),
    }
}

pub fn dap_code(e: &dap::Error) -> &'static str {
    match e {
        dap::Error::BusFault => "bus_fault",
        dap::Error::BusWait => "bus_wait",
        dap::Error::Protocol => "protocol_error",
    }
}

pub fn nvmc_code(e: &nvmc::Error) -> &'static str {
    match e {
        nvmc::Error::Flash { phase, .. } => match phase {
            nvmc::Phase::Erase => "flash_erase",
            nvmc::Phase::Program => "flash_program",
            nvmc::Phase::Verify => "flash_verify",
        },
        nvmc::Error::Bus(e) => target_code(e),
    }
}

pub fn ctrlap_code(e: &ctrlap::Error) -> &'static str {
    match e {
        ctrlap::Error::UnlockTimeout => "unlock_timeout",
        ctrlap::Error::Reconnect => "reconnect_failed",
        ctrlap::Error::Verify { .. } => "unlock_verify",
        ctrlap::Error::Bus(e) => dap_code(e),
    }
}

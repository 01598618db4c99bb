#![no_std]
#![no_main]

mod app;
mod ble_host;
mod bonds;
mod http;
mod kv;
mod monitor;
mod net;
mod pins;
mod power;

use bt_hci::controller::ExternalController;
use embassy_executor::Spawner;
use embassy_net::StackResources;
use embassy_time::Timer;
use esp_backtrace as _;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Flex, Level, Output, OutputConfig};
use esp_hal::rng::Rng;
use esp_hal::timer::systimer::SystemTimer;
use esp_hal::timer::timg::TimerGroup;
use esp_wifi::ble::controller::BleConnector;
use esp_wifi::EspWifiController;
use static_cell::StaticCell;

use meshprobe_core::dap::Dap;
use meshprobe_core::hal::KvStore;
use meshprobe_core::swd::Swd;
use meshprobe_core::target::Target;

use crate::app::App;
use crate::kv::FlashKv;
use crate::pins::{CycleDelay, FlexPin, UptimeClock};
use crate::power::PowerRail;

pub const VERSION: &str = git_version::git_version!(fallback = "v0.3.0");

// Fallback credentials for a bench bring-up; the persistent store wins.
const DEFAULT_SSID: &str = match option_env!("MESHPROBE_SSID") {
    Some(v) => v,
    None => "meshprobe-setup",
};
const DEFAULT_PASSWORD: &str = match option_env!("MESHPROBE_PASSWORD") {
    Some(v) => v,
    None => "",
};

// Half a bit cell in CPU cycles. 40 cycles at 160 MHz clocks SWD near
// 2 MHz, inside the nRF52's limit with margin.
const SWD_HALF_CYCLE: u32 = 40;
const CPU_MHZ: u32 = 160;

esp_bootloader_esp_idf::esp_app_desc!();

static APP: StaticCell<App> = StaticCell::new();
static WIFI: StaticCell<EspWifiController<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<8>> = StaticCell::new();
static SSID: StaticCell<heapless::String<32>> = StaticCell::new();
static PASSWORD: StaticCell<heapless::String<64>> = StaticCell::new();

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) {
    esp_println::logger::init_logger_from_env();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);
    esp_alloc::heap_allocator!(size: 96 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let mut rng = Rng::new(peripherals.RNG);
    let systimer = SystemTimer::new(peripherals.SYSTIMER);
    esp_hal_embassy::init(systimer.alarm0);

    log::info!("meshprobe {} booting", VERSION);

    // SWD pins; nRESET is optional on the harness but wired here
    let swclk = FlexPin::new(Flex::new(peripherals.GPIO4));
    let swdio = FlexPin::new(Flex::new(peripherals.GPIO3));
    let nreset = FlexPin::new(Flex::new(peripherals.GPIO5));
    let swd = Swd::new(
        swclk,
        swdio,
        Some(nreset),
        CycleDelay::new(CPU_MHZ),
        SWD_HALF_CYCLE,
    );
    let target = Target::new(Dap::new(swd), UptimeClock);

    let mut kv = FlashKv::new();
    let rail_active_low = kv.get_bool(power::POLARITY_KEY, true);
    let gate_idle = if rail_active_low { Level::High } else { Level::Low };
    let rail = PowerRail::new(
        Output::new(peripherals.GPIO6, gate_idle, OutputConfig::default()),
        rail_active_low,
    );

    // station credentials: persistent store first, build-time fallback
    let ssid: &'static str = {
        let mut buf = [0u8; 32];
        let mut s = heapless::String::new();
        match kv.get("wifi_ssid", &mut buf) {
            Some(n) => {
                let _ = s.push_str(core::str::from_utf8(&buf[..n]).unwrap_or(DEFAULT_SSID));
            }
            None => {
                let _ = s.push_str(DEFAULT_SSID);
            }
        }
        SSID.init(s).as_str()
    };
    let password: &'static str = {
        let mut buf = [0u8; 64];
        let mut s = heapless::String::new();
        match kv.get("wifi_password", &mut buf) {
            Some(n) => {
                let _ = s.push_str(core::str::from_utf8(&buf[..n]).unwrap_or(DEFAULT_PASSWORD));
            }
            None => {
                let _ = s.push_str(DEFAULT_PASSWORD);
            }
        }
        PASSWORD.init(s).as_str()
    };

    let app: &'static App = APP.init(App::new(target, rail, kv));

    // radio: Wi-Fi station + BLE controller share the init
    let wifi_ctrl = WIFI.init(esp_wifi::init(timg0.timer0, rng).unwrap());
    let (controller, interfaces) = esp_wifi::wifi::new(wifi_ctrl, peripherals.WIFI).unwrap();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        embassy_net::Config::dhcpv4(Default::default()),
        NET_RESOURCES.init(StackResources::new()),
        seed,
    );

    let transport = BleConnector::new(wifi_ctrl, peripherals.BT);
    let ble_controller = ExternalController::new(transport);

    spawner.spawn(net::wifi_connection(controller, ssid, password)).unwrap();
    spawner.spawn(net::net_task(runner)).unwrap();
    spawner.spawn(http::http_task(stack, app)).unwrap();
    for _ in 0..5 {
        spawner.spawn(net::proxy_task(stack, app)).unwrap();
    }
    spawner.spawn(ble_host::ble_supervisor(app)).unwrap();
    spawner.spawn(ble_host::ble_driver(ble_controller, app)).unwrap();
    spawner.spawn(monitor::monitor_task(app)).unwrap();

    stack.wait_config_up().await;
    if let Some(config) = stack.config_v4() {
        log::info!("ready at http://{}/ (proxy on :{})", config.address.address(), net::PROXY_PORT);
    }

    loop {
        Timer::after_secs(3600).await;
    }
}

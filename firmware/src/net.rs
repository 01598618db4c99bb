//! Wi-Fi station bring-up and the TCP side of the serial bridge.
//!
//! The proxy listens on port 4403 with one accepting socket per client
//! slot plus one spare. The spare exists so a connection beyond the
//! client limit is accepted and immediately closed with a diagnostic
//! instead of hanging in the backlog.

use core::sync::atomic::Ordering;

use embassy_futures::select::{select3, Either3};
use embassy_net::tcp::TcpSocket;
use embassy_net::{IpListenEndpoint, Stack};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;
use esp_wifi::wifi::{
    ClientConfiguration, Configuration, WifiController, WifiDevice, WifiEvent, WifiState,
};

use meshprobe_core::proxy::chunks;

use crate::app::App;

pub const PROXY_PORT: u16 = 4403;

#[embassy_executor::task]
pub async fn wifi_connection(mut controller: WifiController<'static>, ssid: &'static str, password: &'static str) {
    log::info!("wifi connection task start");
    loop {
        if esp_wifi::wifi::wifi_state() == WifiState::StaConnected {
            // wait until we lose the association, then reconnect
            controller.wait_for_event(WifiEvent::StaDisconnected).await;
            Timer::after_secs(5).await;
        }
        if !matches!(controller.is_started(), Ok(true)) {
            let config = Configuration::Client(ClientConfiguration {
                ssid: ssid.into(),
                password: password.into(),
                ..Default::default()
            });
            controller.set_configuration(&config).unwrap();
            controller.start_async().await.unwrap();
        }
        match controller.connect_async().await {
            Ok(()) => log::info!("wifi associated to {}", ssid),
            Err(e) => {
                log::warn!("wifi connect failed: {:?}", e);
                Timer::after_secs(5).await;
            }
        }
    }
}

#[embassy_executor::task]
pub async fn net_task(mut runner: embassy_net::Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}

// MAX_CLIENTS + 1 accepting sockets
#[embassy_executor::task(pool_size = 5)]
pub async fn proxy_task(stack: Stack<'static>, app: &'static App) -> ! {
    let mut rx_buffer = [0u8; 1024];
    let mut tx_buffer = [0u8; 1024];
    loop {
        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        if let Err(e) = socket
            .accept(IpListenEndpoint {
                addr: None,
                port: PROXY_PORT,
            })
            .await
        {
            log::warn!("proxy accept failed: {:?}", e);
            Timer::after_secs(1).await;
            continue;
        }

        match app.fanout.claim() {
            Ok(slot) => {
                log::info!("proxy client {} connected", slot);
                serve_client(&mut socket, slot, app).await;
                app.fanout.release(slot);
                log::info!("proxy client {} gone", slot);
            }
            Err(_) => {
                log::warn!("proxy client limit reached, closing new connection");
            }
        }
        socket.close();
        let _ = socket.flush().await;
        socket.abort();
    }
}

async fn serve_client(socket: &mut TcpSocket<'_>, slot: usize, app: &'static App) {
    let mut buf = [0u8; 256];
    loop {
        match select3(
            socket.read(&mut buf),
            app.fanout.next_frame(slot),
            Timer::after_secs(1),
        )
        .await
        {
            Either3::First(Ok(0)) | Either3::First(Err(_)) => return,
            Either3::First(Ok(n)) => {
                // chunk to the current link MTU, short pause between
                // chunks so the peripheral's buffer keeps up
                let mtu = app.mtu();
                let total = chunks(&buf[..n], mtu).count();
                for (i, chunk) in chunks(&buf[..n], mtu).enumerate() {
                    if app.ble_send(chunk).await.is_err() {
                        log::warn!("BLE send dropped {} bytes", chunk.len());
                        break;
                    }
                    if i + 1 < total {
                        Timer::after_millis(5).await;
                    }
                }
            }
            Either3::Second(frame) => {
                if socket.write_all(&frame).await.is_err() {
                    return;
                }
            }
            Either3::Third(()) => {
                // periodic tick: observe shutdown and slow-client flags
                if app.shutdown.load(Ordering::Relaxed) || app.fanout.is_dead(slot) {
                    return;
                }
            }
        }
    }
}

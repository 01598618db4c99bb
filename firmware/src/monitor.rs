//! Periodic health monitor.
//!
//! Once a minute: verify a held SWD session still answers (two misses
//! drop it), and log a one-line status. Skipped entirely while a flash
//! operation holds the session mutex.

use embassy_time::{Duration, Ticker};

use crate::app::App;

const LINK_STRIKES: u8 = 2;

#[embassy_executor::task]
pub async fn monitor_task(app: &'static App) -> ! {
    let mut ticker = Ticker::every(Duration::from_secs(60));
    let mut strikes = 0u8;
    loop {
        ticker.next().await;

        if let Ok(mut target) = app.swd.try_lock() {
            if target.is_connected() {
                match target.check_link() {
                    Ok(_) => strikes = 0,
                    Err(_) => {
                        strikes += 1;
                        log::warn!("SWD link check missed ({}/{})", strikes, LINK_STRIKES);
                        if strikes >= LINK_STRIKES {
                            log::warn!("target vanished, dropping SWD session");
                            target.disconnect();
                            strikes = 0;
                        }
                    }
                }
            } else {
                strikes = 0;
            }
        }

        log::info!(
            "up {}s, proxy clients {}, mtu {}",
            embassy_time::Instant::now().as_secs(),
            app.fanout.live_clients(),
            app.mtu()
        );
    }
}

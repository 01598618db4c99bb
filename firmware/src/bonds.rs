//! BLE bond material in the persistent store.
//!
//! Keys are derived from the peer address; the security manager hands us
//! opaque blobs and gets them back verbatim. Deleting a bond is what the
//! REPEAT_PAIRING path uses to recover from a peer that forgot us.

use core::fmt::Write;

use heapless::String;
use meshprobe_core::ble::Addr;
use meshprobe_core::hal::KvStore;

use crate::app::App;

fn key(addr: &Addr) -> String<24> {
    let mut k = String::new();
    let a = addr.0;
    let _ = write!(
        k,
        "bond:{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        a[0], a[1], a[2], a[3], a[4], a[5]
    );
    k
}

pub fn store(app: &App, addr: &Addr, material: &[u8]) {
    app.kv.lock(|kv| {
        if kv.borrow_mut().put(&key(addr), material).is_err() {
            log::warn!("bond store full, not persisting {}", addr);
        }
    });
}

pub fn load(app: &App, addr: &Addr, buf: &mut [u8]) -> Option<usize> {
    app.kv.lock(|kv| kv.borrow_mut().get(&key(addr), buf))
}

pub fn erase(app: &App, addr: &Addr) {
    app.kv.lock(|kv| kv.borrow_mut().erase(&key(addr)));
}

//! CTRL-AP protection recovery against the simulated target.

mod common;

use common::{sim, target};
use meshprobe_core::nrf52::UICR_APPROTECT;
use meshprobe_core::{ctrlap, target as session};

#[test]
fn protected_part_blocks_memory_access() {
    let bus = sim();
    bus.borrow_mut().protected = true;
    let mut t = target(&bus);

    // the DP and AP registers still answer, so connect succeeds...
    t.connect().unwrap();
    // ...but any data access faults out
    assert!(matches!(
        t.read32(UICR_APPROTECT),
        Err(session::Error::Bus(_))
    ));
}

#[test]
fn ctrl_ap_mass_erase_unlocks_and_verifies() {
    let bus = sim();
    {
        let mut s = bus.borrow_mut();
        s.protected = true;
        s.flash.fill(0x5A);
        let o = (UICR_APPROTECT - 0x1000_1000) as usize;
        s.uicr[o..o + 4].copy_from_slice(&0u32.to_le_bytes());
    }
    let mut t = target(&bus);
    t.connect().unwrap();

    let report = ctrlap::mass_erase(&mut t).unwrap();
    assert_eq!(report.ap_index, 1);
    assert_eq!(bus.borrow().erase_all_count, 1);

    // session is live again and everything reads erased
    assert!(t.is_connected());
    assert_eq!(t.read32(0x0).unwrap(), 0xFFFF_FFFF);
    assert_eq!(t.read32(UICR_APPROTECT).unwrap(), 0xFFFF_FFFF);
}

#[test]
fn unlock_works_on_an_unprotected_part_too() {
    let bus = sim();
    bus.borrow_mut().flash[0x1000..0x2000].fill(0xAB);
    let mut t = target(&bus);
    t.connect().unwrap();

    let report = ctrlap::mass_erase(&mut t).unwrap();
    assert_eq!(report.ap_index, 1);
    assert_eq!(t.read32(0x1000).unwrap(), 0xFFFF_FFFF);
}

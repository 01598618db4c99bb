//! NVMC engine behavior against the simulated target.

mod common;

use common::{sim, target};
use meshprobe_core::nrf52::{
    APPROTECT_HW_DISABLED, CONFIG_REN, NVMC_CONFIG, PAGE_SIZE, UICR_APPROTECT,
};
use meshprobe_core::nvmc::{Error, Nvmc, Phase};

#[test]
fn erase_and_program_round_trip() {
    let bus = sim();
    {
        // page starts dirty so the erase has work to do
        let mut s = bus.borrow_mut();
        for b in &mut s.flash[0x26000..0x27000] {
            *b = 0x00;
        }
    }
    let mut t = target(&bus);
    t.connect().unwrap();

    let payload = [
        0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99,
        0xAA, 0xBB,
    ];

    let mut nvmc = Nvmc::new(&mut t);
    nvmc.erase_page(0x26000).unwrap();
    nvmc.program(0x26000, &payload).unwrap();
    nvmc.verify(0x26000, &payload).unwrap();

    // little-endian word assembly
    assert_eq!(t.read32(0x26000).unwrap(), 0xEFBE_ADDE);
    assert_eq!(t.read32(0x2600C).unwrap(), 0xBBAA_9988);

    // NVMC left in read-only mode
    assert_eq!(t.read32(NVMC_CONFIG).unwrap(), CONFIG_REN);
}

#[test]
fn erase_is_aligned_and_idempotent() {
    let bus = sim();
    {
        let mut s = bus.borrow_mut();
        s.flash[0x5000..0x6000].fill(0x55);
    }
    let mut t = target(&bus);
    t.connect().unwrap();

    // erase via an unaligned address inside the page
    Nvmc::new(&mut t).erase_page(0x5ABC).unwrap();
    for offset in (0..PAGE_SIZE).step_by(4) {
        assert_eq!(t.read32(0x5000 + offset).unwrap(), 0xFFFF_FFFF);
    }

    // erasing an already-erased page leaves it erased
    Nvmc::new(&mut t).erase_page(0x5000).unwrap();
    assert_eq!(t.read32(0x5000).unwrap(), 0xFFFF_FFFF);
}

#[test]
fn unaligned_program_patches_the_edges() {
    let bus = sim();
    let mut t = target(&bus);
    t.connect().unwrap();

    let data = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
    let mut nvmc = Nvmc::new(&mut t);
    nvmc.erase_page(0x8000).unwrap();
    // starts one byte into a word, ends mid-word
    nvmc.program(0x8001, &data).unwrap();
    nvmc.verify(0x8001, &data).unwrap();

    let s = bus.borrow();
    assert_eq!(s.flash[0x8000], 0xFF);
    assert_eq!(&s.flash[0x8001..0x8008], &data);
    assert_eq!(s.flash[0x8008], 0xFF);
}

#[test]
fn zero_length_program_never_touches_the_nvmc() {
    let bus = sim();
    let mut t = target(&bus);
    t.connect().unwrap();
    let before = bus.borrow().transactions;

    Nvmc::new(&mut t).program(0x9000, &[]).unwrap();
    assert_eq!(bus.borrow().transactions, before);
}

#[test]
fn programming_a_dirty_word_is_refused() {
    let bus = sim();
    {
        let mut s = bus.borrow_mut();
        s.flash[0xA001] = 0x00;
    }
    let mut t = target(&bus);
    t.connect().unwrap();

    // unaligned program that would patch into the dirty word
    let err = Nvmc::new(&mut t).program(0xA001, &[0xAB]).unwrap_err();
    assert_eq!(
        err,
        Error::Flash {
            phase: Phase::Program,
            addr: 0xA000
        }
    );
    // engine restored read-only mode on the failure path
    assert_eq!(t.read32(NVMC_CONFIG).unwrap(), CONFIG_REN);
}

#[test]
fn mass_erase_spares_the_uicr() {
    let bus = sim();
    {
        let mut s = bus.borrow_mut();
        s.flash[0x0..0x1000].fill(0x00);
        let o = (UICR_APPROTECT - 0x1000_1000) as usize;
        s.uicr[o..o + 4].copy_from_slice(&0x0000_0000u32.to_le_bytes());
    }
    let mut t = target(&bus);
    t.connect().unwrap();

    Nvmc::new(&mut t).erase_all().unwrap();

    assert_eq!(t.read32(0x0).unwrap(), 0xFFFF_FFFF);
    // UICR (and with it APPROTECT) survives the NVMC path
    assert_eq!(t.read32(UICR_APPROTECT).unwrap(), 0x0000_0000);
}

#[test]
fn disable_approtect_programs_the_sentinel() {
    let bus = sim();
    let mut t = target(&bus);
    t.connect().unwrap();

    Nvmc::new(&mut t).disable_approtect().unwrap();
    assert_eq!(t.read32(UICR_APPROTECT).unwrap(), APPROTECT_HW_DISABLED);
}

#[test]
fn large_program_round_trips() {
    let bus = sim();
    let mut t = target(&bus);
    t.connect().unwrap();

    // 3 KiB pattern exercising the coarse READY batching
    let data: Vec<u8> = (0..3072).map(|i| (i * 7 % 256) as u8).collect();
    let mut nvmc = Nvmc::new(&mut t);
    nvmc.erase_page(0x40000).unwrap();
    nvmc.program(0x40000, &data).unwrap();
    nvmc.verify(0x40000, &data).unwrap();

    let s = bus.borrow();
    assert_eq!(&s.flash[0x40000..0x40000 + 3072], &data[..]);
}

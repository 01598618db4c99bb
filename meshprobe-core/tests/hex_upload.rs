//! Streaming HEX ingest end-to-end: parser → coalescer → flash.

mod common;

use common::{sim, target, SimHandle, SimTarget};
use meshprobe_core::ihex::Parser;
use meshprobe_core::loader::{Coalescer, FlashLoader, Kind, SilentProgress};
use meshprobe_core::nvmc;

fn upload(t: &mut SimTarget, kind: Kind, hex: &[u8]) -> Result<(), nvmc::Error> {
    let mut loader = FlashLoader::new(t, 0, &SilentProgress);
    let mut parser = Parser::with_base(kind.default_base());
    let mut sink = Coalescer::new(|base, data: &[u8]| loader.flush(base, data));
    match parser.feed(hex, &mut sink) {
        Ok(()) => Ok(()),
        Err(meshprobe_core::ihex::Error::Sink(e)) => Err(e),
        Err(other) => panic!("unexpected parse failure: {:?}", other),
    }
}

fn encode_data(addr: u16, payload: &[u8]) -> String {
    use core::fmt::Write;
    let mut line = String::new();
    write!(line, ":{:02X}{:04X}00", payload.len(), addr).unwrap();
    let mut sum = (payload.len() as u8)
        .wrapping_add((addr >> 8) as u8)
        .wrapping_add(addr as u8);
    for &b in payload {
        write!(line, "{:02X}", b).unwrap();
        sum = sum.wrapping_add(b);
    }
    write!(line, "{:02X}\r\n", sum.wrapping_neg()).unwrap();
    line
}

fn connected(bus: &SimHandle) -> SimTarget {
    let mut t = target(bus);
    t.connect().unwrap();
    t
}

#[test]
fn classic_record_lands_in_flash() {
    let bus = sim();
    let mut t = connected(&bus);

    upload(
        &mut t,
        Kind::SoftDevice,
        b":10010000214601360121470136007EFE09D2190140\n:00000001FF\n",
    )
    .unwrap();

    let s = bus.borrow();
    assert_eq!(
        &s.flash[0x100..0x110],
        &[
            0x21, 0x46, 0x01, 0x36, 0x01, 0x21, 0x47, 0x01, 0x36, 0x00, 0x7E, 0xFE, 0x09, 0xD2,
            0x19, 0x01
        ]
    );
    // untouched neighbours stay erased
    assert_eq!(s.flash[0xFF], 0xFF);
    assert_eq!(s.flash[0x110], 0xFF);
}

#[test]
fn app_upload_is_biased_to_the_app_base() {
    let bus = sim();
    let mut t = connected(&bus);

    let mut hex = encode_data(0x0000, &[0xAA, 0xBB, 0xCC, 0xDD]);
    hex.push_str(":00000001FF\n");
    upload(&mut t, Kind::App, hex.as_bytes()).unwrap();

    let s = bus.borrow();
    assert_eq!(&s.flash[0x26000..0x26004], &[0xAA, 0xBB, 0xCC, 0xDD]);
}

#[test]
fn scattered_records_in_one_page_erase_once() {
    let bus = sim();
    {
        bus.borrow_mut().flash[0x26000..0x27000].fill(0x00);
    }
    let mut t = connected(&bus);

    // two distant records within the same page force two flushes but
    // only one erase of the page
    let mut hex = encode_data(0x0000, &[0x11, 0x22]);
    hex.push_str(&encode_data(0x0800, &[0x33, 0x44]));
    hex.push_str(":00000001FF\n");
    upload(&mut t, Kind::App, hex.as_bytes()).unwrap();

    let s = bus.borrow();
    assert_eq!(&s.flash[0x26000..0x26002], &[0x11, 0x22]);
    assert_eq!(&s.flash[0x26800..0x26802], &[0x33, 0x44]);
    // had the second flush re-erased the page, the first record would
    // have been wiped
}

#[test]
fn crossing_a_linear_boundary_flushes_at_the_boundary() {
    let bus = sim();
    let mut t = connected(&bus);

    // contiguous data straddling 0x1_0000, split by a type-04 record
    let mut hex = String::from(":020000040000FA\n");
    hex.push_str(&encode_data(0xFFFC, &[1, 2, 3, 4]));
    hex.push_str(":020000040001F9\n");
    hex.push_str(&encode_data(0x0000, &[5, 6, 7, 8]));
    hex.push_str(":00000001FF\n");
    upload(&mut t, Kind::Full, hex.as_bytes()).unwrap();

    let s = bus.borrow();
    assert_eq!(&s.flash[0xFFFC..0x10004], &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn bad_checksum_aborts_the_upload() {
    let bus = sim();
    let mut t = connected(&bus);

    let mut loader = FlashLoader::new(&mut t, 0, &SilentProgress);
    let mut parser = Parser::new();
    let mut sink = Coalescer::new(|base, data: &[u8]| loader.flush(base, data));
    let err = parser
        .feed(b":10010000214601360121470136007EFE09D2190141\n", &mut sink)
        .unwrap_err();
    assert_eq!(err, meshprobe_core::ihex::Error::Checksum);
}

#[test]
fn multi_page_image_programs_and_verifies() {
    let bus = sim();
    let mut t = connected(&bus);

    // 20 KiB contiguous image at 0x26000: spans six pages and overflows
    // the 16 KiB coalescing buffer, forcing an interior flush
    let mut hex = String::from(":020000040002F8\n");
    let mut addr32 = 0x26000u32;
    let image: Vec<u8> = (0..20 * 1024).map(|i| (i % 253) as u8).collect();
    for chunk in image.chunks(32) {
        hex.push_str(&encode_data(addr32 as u16, chunk));
        addr32 += chunk.len() as u32;
    }
    hex.push_str(":00000001FF\n");

    upload(&mut t, Kind::Full, hex.as_bytes()).unwrap();

    let s = bus.borrow();
    assert_eq!(&s.flash[0x26000..0x26000 + image.len()], &image[..]);
}

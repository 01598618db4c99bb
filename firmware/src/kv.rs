//! Flash-backed key-value store.
//!
//! One 4 KiB sector near the top of the module's flash holds small
//! records (Wi-Fi credentials, BLE bonds, the rail polarity bit, the
//! last-error string). The whole sector is cached in RAM and rewritten
//! on every put; write volume here is tiny.

use embedded_storage::{ReadStorage, Storage};
use esp_storage::FlashStorage;
use heapless::{FnvIndexMap, String, Vec};
use meshprobe_core::hal::{KvStore, StoreFull};

const SECTOR_ADDR: u32 = 0x3F_8000;
const SECTOR_SIZE: usize = 4096;
const MAGIC: [u8; 4] = *b"mpkv";

const MAX_KEY: usize = 24;
const MAX_VALUE: usize = 96;
const MAX_RECORDS: usize = 16;

pub struct FlashKv {
    flash: FlashStorage,
    cache: FnvIndexMap<String<MAX_KEY>, Vec<u8, MAX_VALUE>, MAX_RECORDS>,
}

impl FlashKv {
    pub fn new() -> Self {
        let mut kv = FlashKv {
            flash: FlashStorage::new(),
            cache: FnvIndexMap::new(),
        };
        kv.load();
        kv
    }

    fn load(&mut self) {
        let mut sector = [0u8; SECTOR_SIZE];
        if self.flash.read(SECTOR_ADDR, &mut sector).is_err() {
            log::warn!("kv: flash read failed, starting empty");
            return;
        }
        if sector[..4] != MAGIC {
            log::info!("kv: no store found, starting empty");
            return;
        }

        let mut at = 4;
        while at + 2 <= SECTOR_SIZE {
            let klen = sector[at] as usize;
            if klen == 0xFF || klen == 0 {
                break;
            }
            let vlen = sector[at + 1] as usize;
            if klen > MAX_KEY || vlen > MAX_VALUE || at + 2 + klen + vlen > SECTOR_SIZE {
                log::warn!("kv: corrupt record at {}, ignoring the rest", at);
                break;
            }
            let key = &sector[at + 2..at + 2 + klen];
            let value = &sector[at + 2 + klen..at + 2 + klen + vlen];
            if let Ok(key) = core::str::from_utf8(key) {
                let mut k = String::new();
                let mut v = Vec::new();
                if k.push_str(key).is_ok() && v.extend_from_slice(value).is_ok() {
                    let _ = self.cache.insert(k, v);
                }
            }
            at += 2 + klen + vlen;
        }
        log::debug!("kv: loaded {} records", self.cache.len());
    }

    fn save(&mut self) -> Result<(), StoreFull> {
        let mut sector = [0xFFu8; SECTOR_SIZE];
        sector[..4].copy_from_slice(&MAGIC);
        let mut at = 4;
        for (key, value) in &self.cache {
            let need = 2 + key.len() + value.len();
            if at + need > SECTOR_SIZE {
                return Err(StoreFull);
            }
            sector[at] = key.len() as u8;
            sector[at + 1] = value.len() as u8;
            sector[at + 2..at + 2 + key.len()].copy_from_slice(key.as_bytes());
            sector[at + 2 + key.len()..at + need].copy_from_slice(value);
            at += need;
        }
        self.flash
            .write(SECTOR_ADDR, &sector)
            .map_err(|_| StoreFull)
    }

    /// Single-byte boolean convenience used for configuration bits.
    pub fn get_bool(&mut self, key: &str, default: bool) -> bool {
        let mut buf = [0u8; 1];
        match self.get(key, &mut buf) {
            Some(1) => buf[0] != 0,
            _ => default,
        }
    }
}

impl KvStore for FlashKv {
    fn get(&mut self, key: &str, buf: &mut [u8]) -> Option<usize> {
        let value = self.cache.get(&String::<MAX_KEY>::try_from(key).ok()?)?;
        let n = value.len().min(buf.len());
        buf[..n].copy_from_slice(&value[..n]);
        Some(n)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreFull> {
        let k = String::try_from(key).map_err(|_| StoreFull)?;
        let mut v = Vec::new();
        v.extend_from_slice(value).map_err(|_| StoreFull)?;
        self.cache.insert(k, v).map_err(|_| StoreFull)?;
        self.save()
    }

    fn erase(&mut self, key: &str) {
        if let Ok(k) = String::<MAX_KEY>::try_from(key) {
            if self.cache.remove(&k).is_some() {
                let _ = self.save();
            }
        }
    }
}

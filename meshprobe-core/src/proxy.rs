//! Fan-out between one BLE serial link and up to four TCP clients.
//!
//! The registry owns the client slots; the firmware owns the sockets.
//! Each live slot has a bounded queue the BLE notify path broadcasts
//! into, so a notification is delivered exactly once per client and the
//! notify callback never blocks. A client whose queue overflows is
//! marked dead and its socket task tears it down.

use core::cell::RefCell;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Bind,
    Accept,
    /// All client slots taken; the new connection gets closed.
    ClientLimit,
    Send,
    Recv,
}

pub type Result<T> = core::result::Result<T, Error>;

pub const MAX_CLIENTS: usize = 4;
pub const QUEUE_DEPTH: usize = 8;

/// One BLE notification, delivered atomically per client.
pub type Frame = Vec<u8, 247>;

/// ATT write payload limit for a given MTU, capped at 244 bytes.
pub fn chunk_len(mtu: u16) -> usize {
    (mtu.saturating_sub(3) as usize).clamp(1, 244)
}

/// Split a TCP read into BLE-writable chunks: `⌈len / (mtu−3)⌉` pieces.
pub fn chunks(data: &[u8], mtu: u16) -> impl Iterator<Item = &[u8]> {
    data.chunks(chunk_len(mtu))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Slot {
    Free,
    Live,
    /// Queue overflowed; socket task must close and release.
    Dead,
}

pub struct FanOut {
    slots: Mutex<CriticalSectionRawMutex, RefCell<[Slot; MAX_CLIENTS]>>,
    queues: [Channel<CriticalSectionRawMutex, Frame, QUEUE_DEPTH>; MAX_CLIENTS],
}

impl FanOut {
    pub const fn new() -> Self {
        FanOut {
            slots: Mutex::new(RefCell::new([Slot::Free; MAX_CLIENTS])),
            queues: [const { Channel::new() }; MAX_CLIENTS],
        }
    }

    /// Reserve a slot for a freshly accepted socket.
    pub fn claim(&self) -> Result<usize> {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            for (i, slot) in slots.iter_mut().enumerate() {
                if *slot == Slot::Free {
                    *slot = Slot::Live;
                    // drop anything queued while the slot was free
                    while self.queues[i].try_receive().is_ok() {}
                    return Ok(i);
                }
            }
            Err(Error::ClientLimit)
        })
    }

    pub fn release(&self, index: usize) {
        self.slots.lock(|slots| {
            slots.borrow_mut()[index] = Slot::Free;
        });
        while self.queues[index].try_receive().is_ok() {}
    }

    pub fn live_clients(&self) -> usize {
        self.slots.lock(|slots| {
            slots
                .borrow()
                .iter()
                .filter(|s| **s == Slot::Live)
                .count()
        })
    }

    /// True once the slot's queue has overflowed; the owning socket task
    /// should close the connection.
    pub fn is_dead(&self, index: usize) -> bool {
        self.slots.lock(|slots| slots.borrow()[index] == Slot::Dead)
    }

    /// Deliver one notification to every live client, exactly once each.
    /// Returns how many clients it reached. Never blocks: a full queue
    /// kills that client instead.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let mut frame = Frame::new();
        if frame.extend_from_slice(data).is_err() {
            log::warn!("dropping oversized notification ({} bytes)", data.len());
            return 0;
        }

        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let mut delivered = 0;
            for (i, slot) in slots.iter_mut().enumerate() {
                if *slot != Slot::Live {
                    continue;
                }
                if self.queues[i].try_send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    log::warn!("client {} too slow, dropping it", i);
                    *slot = Slot::Dead;
                }
            }
            delivered
        })
    }

    /// Receive the next frame queued for `index`. Firmware awaits this
    /// concurrently with the socket.
    pub async fn next_frame(&self, index: usize) -> Frame {
        self.queues[index].receive().await
    }

    pub fn try_next_frame(&self, index: usize) -> Option<Frame> {
        self.queues[index].try_receive().ok()
    }
}

impl Default for FanOut {
    fn default() -> Self {
        FanOut::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_law() {
        // ⌈L / (mtu − 3)⌉ writes for a payload of length L
        for (len, mtu, expect) in [
            (1usize, 23u16, 1usize),
            (20, 23, 1),
            (21, 23, 2),
            (40, 23, 2),
            (100, 23, 5),
            (244, 247, 1),
            (245, 247, 2),
            (1000, 515, 5), // capped at 244 per chunk
        ] {
            assert_eq!(chunks(&vec_of(len), mtu).count(), expect, "len {len} mtu {mtu}");
        }
    }

    #[test]
    fn chunks_cover_payload_in_order() {
        let data: [u8; 50] = core::array::from_fn(|i| i as u8);
        let mut rebuilt = [0u8; 50];
        let mut at = 0;
        for chunk in chunks(&data, 23) {
            rebuilt[at..at + chunk.len()].copy_from_slice(chunk);
            at += chunk.len();
        }
        assert_eq!(at, 50);
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn broadcast_reaches_each_live_client_once() {
        let fanout = FanOut::new();
        let a = fanout.claim().unwrap();
        let b = fanout.claim().unwrap();

        assert_eq!(fanout.broadcast(&[1, 2, 3]), 2);
        assert_eq!(fanout.try_next_frame(a).unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(fanout.try_next_frame(b).unwrap().as_slice(), &[1, 2, 3]);
        assert!(fanout.try_next_frame(a).is_none());
    }

    #[test]
    fn claim_respects_client_limit() {
        let fanout = FanOut::new();
        for _ in 0..MAX_CLIENTS {
            fanout.claim().unwrap();
        }
        assert_eq!(fanout.claim(), Err(Error::ClientLimit));

        fanout.release(0);
        assert_eq!(fanout.claim(), Ok(0));
    }

    #[test]
    fn overflowing_client_is_dropped_not_blocked() {
        let fanout = FanOut::new();
        let a = fanout.claim().unwrap();
        for _ in 0..QUEUE_DEPTH {
            assert_eq!(fanout.broadcast(&[0xAA]), 1);
        }
        // queue full now; the next broadcast kills the client
        assert_eq!(fanout.broadcast(&[0xBB]), 0);
        assert!(fanout.is_dead(a));
        // release brings the slot back
        fanout.release(a);
        assert!(!fanout.is_dead(a));
    }

    #[test]
    fn released_slot_queue_is_emptied() {
        let fanout = FanOut::new();
        let a = fanout.claim().unwrap();
        fanout.broadcast(&[1]);
        fanout.release(a);
        let a2 = fanout.claim().unwrap();
        assert_eq!(a, a2);
        assert!(fanout.try_next_frame(a2).is_none());
    }

    fn vec_of(len: usize) -> std::vec::Vec<u8> {
        std::vec![0u8; len]
    }

    extern crate std;
}

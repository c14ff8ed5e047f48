//! Bounded lossy handoff between the USB completion callback and the
//! application thread.

use std::cell::UnsafeCell;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::convert;
use crate::types::OutputFormat;

/// Number of frame slots in the ring.
const FRAME_SLOTS: usize = 4;

/// How long `dequeue` waits for the producer before reporting no frame.
const DEQUEUE_WAIT: Duration = Duration::from_millis(50);

/// Fixed-slot ring carrying completed bayer frames.
///
/// The producer (the transfer completion callback) writes payload bytes
/// directly into the slot at `head`; the consumer decodes out of the slot
/// at `tail`. When the consumer lags, the producer overwrites its own
/// newest frame in place instead of stalling the transfer engine, so a
/// slow consumer loses frames but never sees torn ones. One slot stays
/// reserved so the producer can never reach the slot being read.
pub(crate) struct FrameRing {
    frame_size: usize,
    buf: UnsafeCell<Box<[u8]>>,
    state: Mutex<State>,
    frame_ready: Condvar,
}

#[derive(Default)]
struct State {
    head: usize,
    tail: usize,
    available: usize,
}

// The index protocol keeps producer and consumer on disjoint slots, so the
// buffer is never touched from both sides at once.
unsafe impl Send for FrameRing {}
unsafe impl Sync for FrameRing {}

impl FrameRing {
    pub(crate) fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            buf: UnsafeCell::new(vec![0u8; frame_size * FRAME_SLOTS].into_boxed_slice()),
            state: Mutex::new(State::default()),
            frame_ready: Condvar::new(),
        }
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        unsafe { (*self.buf.get()).as_mut_ptr().add(slot * self.frame_size) }
    }

    /// Slot the producer fills before its first `enqueue`.
    pub(crate) fn producer_slot(&self) -> *mut u8 {
        self.slot_ptr(self.state.lock().unwrap().head)
    }

    /// Publish the frame in the current producer slot and return the slot
    /// for the next one.
    ///
    /// With the consumer lagging (`available >= FRAME_SLOTS - 1`) the same
    /// slot is handed back and the newest frame is overwritten in place.
    pub(crate) fn enqueue(&self) -> *mut u8 {
        let mut state = self.state.lock().unwrap();
        if state.available >= FRAME_SLOTS - 1 {
            return self.slot_ptr(state.head);
        }
        state.head = (state.head + 1) % FRAME_SLOTS;
        state.available += 1;
        let slot = self.slot_ptr(state.head);
        self.frame_ready.notify_one();
        slot
    }

    /// Wait up to 50 ms for a completed frame, then decode it into `dest`.
    /// Returns false when no frame arrived in time.
    pub(crate) fn dequeue(
        &self,
        dest: &mut [u8],
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> bool {
        let state = self.state.lock().unwrap();
        let (mut state, timeout) = self
            .frame_ready
            .wait_timeout_while(state, DEQUEUE_WAIT, |s| s.available == 0)
            .unwrap();
        if timeout.timed_out() {
            return false;
        }

        let (w, h) = (width as usize, height as usize);
        // The producer never touches the tail slot while it is unconsumed.
        let src = unsafe {
            std::slice::from_raw_parts(self.slot_ptr(state.tail), self.frame_size)
        };
        match format {
            OutputFormat::Bayer => dest[..self.frame_size].copy_from_slice(src),
            OutputFormat::Bgr => convert::debayer_rgb(w, h, src, dest, true),
            OutputFormat::Rgb => convert::debayer_rgb(w, h, src, dest, false),
            OutputFormat::Gray => convert::debayer_gray(w, h, src, dest),
        }

        state.tail = (state.tail + 1) % FRAME_SLOTS;
        state.available -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(slot: *mut u8, len: usize, value: u8) {
        unsafe { std::slice::from_raw_parts_mut(slot, len) }.fill(value);
    }

    #[test]
    fn test_dequeue_times_out_when_empty() {
        let ring = FrameRing::new(16);
        let mut out = [0u8; 16];
        assert!(!ring.dequeue(&mut out, 4, 4, OutputFormat::Bayer));
    }

    #[test]
    fn test_slow_consumer_overwrites_newest_in_place() {
        let ring = FrameRing::new(16);
        let mut slot = ring.producer_slot();
        for frame in 1..=10u8 {
            fill(slot, 16, frame);
            slot = ring.enqueue();
        }

        // Only the first three frames were published; the rest landed in
        // the reserved head slot, each overwriting the previous.
        let mut out = [0u8; 16];
        for expected in 1..=3u8 {
            assert!(ring.dequeue(&mut out, 4, 4, OutputFormat::Bayer));
            assert_eq!(out, [expected; 16]);
        }
        assert!(!ring.dequeue(&mut out, 4, 4, OutputFormat::Bayer));
    }

    #[test]
    fn test_drain_then_publish_delivers_newest_frame() {
        let ring = FrameRing::new(16);
        let mut slot = ring.producer_slot();
        for frame in 1..=10u8 {
            fill(slot, 16, frame);
            slot = ring.enqueue();
        }

        let mut out = [0u8; 16];
        for _ in 0..3 {
            assert!(ring.dequeue(&mut out, 4, 4, OutputFormat::Bayer));
        }

        // The head slot still holds frame 10; the next enqueue publishes it.
        fill(slot, 16, 11);
        ring.enqueue();
        assert!(ring.dequeue(&mut out, 4, 4, OutputFormat::Bayer));
        assert_eq!(out, [11; 16]);
    }
}

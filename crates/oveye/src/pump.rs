//! Asynchronous bulk-transfer pump and UVC-lite payload parser.
//!
//! Five bulk transfers stay in flight against the camera's streaming
//! endpoint. Completions are dispatched on the event thread, scanned for
//! UVC payload strides and copied straight into the frame ring's producer
//! slot, then resubmitted. The safe layer of the host library has no
//! asynchronous transfer API, so this module drives `rusb::ffi` directly.

use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::{Arc, Condvar, Mutex};

use rusb::ffi;
use rusb::ffi::constants::{
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_TYPE_BULK,
};
use rusb::{Context, DeviceHandle};

use crate::error::{usb_error_from_code, Error};
use crate::ring::FrameRing;
use crate::usb;

/// Size of one bulk transfer region.
const TRANSFER_SIZE: usize = 65536;
/// Number of transfers kept in flight.
const NUM_TRANSFERS: usize = 5;
/// The bridge emits payloads in fixed strides; the final stride of a
/// completion may be shorter.
const PAYLOAD_SIZE: usize = 2048;
/// Every payload stride starts with a 12-byte UVC header.
const HEADER_SIZE: usize = 12;

// UVC payload header flag bits (bmHeaderInfo).
const UVC_STREAM_ERR: u8 = 1 << 6;
const UVC_STREAM_PTS: u8 = 1 << 2;
const UVC_STREAM_EOF: u8 = 1 << 1;
const UVC_STREAM_FID: u8 = 1 << 0;

/// Classification of one payload while moving its bytes into the frame
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Discard,
    First,
    Inter,
    Last,
}

/// Owns the in-flight transfers and reassembles their payloads into ring
/// slots.
///
/// Parser state is only touched from the event thread (the host library
/// dispatches completions serially), so it needs no locking. The
/// application thread interacts with the drain mutex/condvar and, through
/// the camera, with the ring.
pub(crate) struct UrbPump {
    xfr: [*mut ffi::libusb_transfer; NUM_TRANSFERS],
    transfer_buffer: Vec<u8>,
    ring: Option<Arc<FrameRing>>,
    cur_frame: *mut u8,
    frame_data_len: usize,
    frame_size: usize,
    last_packet_kind: PacketKind,
    last_pts: u32,
    last_fid: u16,
    active_transfers: Mutex<usize>,
    transfers_done: Condvar,
    registered: bool,
}

// Raw transfer pointers are only dereferenced on the event thread, or on
// the owning thread after `close_transfers` has observed every completion.
unsafe impl Send for UrbPump {}

impl UrbPump {
    /// The pump is boxed so the completion callbacks see a stable address
    /// through their user-data pointer.
    pub(crate) fn new() -> Box<Self> {
        Box::new(Self {
            xfr: [ptr::null_mut(); NUM_TRANSFERS],
            transfer_buffer: Vec::new(),
            ring: None,
            cur_frame: ptr::null_mut(),
            frame_data_len: 0,
            frame_size: 0,
            last_packet_kind: PacketKind::Discard,
            last_pts: 0,
            last_fid: 0,
            active_transfers: Mutex::new(0),
            transfers_done: Condvar::new(),
            registered: false,
        })
    }

    pub(crate) fn ring(&self) -> Option<&FrameRing> {
        self.ring.as_deref()
    }

    /// Reset the parser and allocate the ring for `frame_size`-byte frames.
    fn prepare(&mut self, frame_size: usize) {
        let ring = Arc::new(FrameRing::new(frame_size));
        self.cur_frame = ring.producer_slot();
        self.ring = Some(ring);
        self.frame_data_len = 0;
        self.frame_size = frame_size;
        self.last_packet_kind = PacketKind::Discard;
        self.last_pts = 0;
        self.last_fid = 0;
    }

    /// Allocate and submit the in-flight transfers against the streaming
    /// endpoint, then register the camera with the event loop.
    pub(crate) fn start_transfers(
        &mut self,
        handle: &mut DeviceHandle<Context>,
        frame_size: usize,
    ) -> Result<(), Error> {
        self.prepare(frame_size);

        let endpoint =
            find_bulk_in_endpoint(&handle.device()).ok_or(Error::NoBulkEndpoint)?;
        if let Err(err) = handle.clear_halt(endpoint) {
            log::warn!("clear halt on endpoint 0x{endpoint:02x} failed: {err}");
        }

        self.transfer_buffer = vec![0u8; TRANSFER_SIZE * NUM_TRANSFERS];
        let user_data = self as *mut Self as *mut c_void;

        let mut first_failure = None;
        let mut submitted = 0;
        for index in 0..NUM_TRANSFERS {
            unsafe {
                let xfr = ffi::libusb_alloc_transfer(0);
                (*xfr).dev_handle = handle.as_raw();
                (*xfr).endpoint = endpoint;
                (*xfr).transfer_type = LIBUSB_TRANSFER_TYPE_BULK as u8;
                (*xfr).timeout = 0;
                (*xfr).buffer = self.transfer_buffer.as_mut_ptr().add(index * TRANSFER_SIZE);
                (*xfr).length = TRANSFER_SIZE as c_int;
                (*xfr).num_iso_packets = 0;
                (*xfr).callback = on_transfer_done;
                (*xfr).user_data = user_data;
                self.xfr[index] = xfr;

                *self.active_transfers.lock().unwrap() += 1;
                let rc = ffi::libusb_submit_transfer(xfr);
                if rc != 0 {
                    log::warn!("bulk transfer submit failed: {rc}");
                    *self.active_transfers.lock().unwrap() -= 1;
                    ffi::libusb_free_transfer(xfr);
                    self.xfr[index] = ptr::null_mut();
                    first_failure.get_or_insert(usb_error_from_code(rc));
                } else {
                    submitted += 1;
                }
            }
        }

        // Register with the event loop only if something is actually in
        // flight; `close_transfers` deregisters exactly once.
        if submitted > 0 {
            usb::manager().camera_started();
            self.registered = true;
        }

        match first_failure {
            None => Ok(()),
            Some(err) => Err(Error::Usb(err)),
        }
    }

    /// Cancel the in-flight transfers, wait until every completion has been
    /// observed, then free them and deregister from the event loop.
    /// Idempotent; also invoked from drop.
    ///
    /// When invoked on the event thread itself (bulk I/O error paths) this
    /// only cancels: the drain would deadlock against the event loop it is
    /// running inside, so the owning thread finishes the teardown on the
    /// next `stop`.
    pub(crate) fn close_transfers(&mut self) {
        if self.xfr.iter().all(|xfr| xfr.is_null()) {
            self.deregister();
            return;
        }

        let mut active = self.active_transfers.lock().unwrap();
        for &xfr in &self.xfr {
            if !xfr.is_null() {
                // Already-completed transfers report NOT_FOUND; fine.
                unsafe { ffi::libusb_cancel_transfer(xfr) };
            }
        }

        if usb::manager().on_event_thread() {
            return;
        }

        while *active > 0 {
            active = self.transfers_done.wait(active).unwrap();
        }
        drop(active);

        for xfr in &mut self.xfr {
            if !xfr.is_null() {
                unsafe { ffi::libusb_free_transfer(*xfr) };
                *xfr = ptr::null_mut();
            }
        }

        self.deregister();
    }

    /// Balance a prior `camera_started` exactly once.
    fn deregister(&mut self) {
        if self.registered {
            self.registered = false;
            usb::manager().camera_stopped();
        }
    }

    fn transfer_finished(&self) {
        let mut active = self.active_transfers.lock().unwrap();
        *active = active.saturating_sub(1);
        self.transfers_done.notify_one();
    }

    /// Walk one completion in payload strides and feed each through the
    /// reassembly state machine.
    fn pkt_scan(&mut self, data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            let len = rest.len().min(PAYLOAD_SIZE);
            self.scan_payload(&rest[..len]);
            rest = &rest[len..];
        }
    }

    /// A frame starts when the FID bit toggles or the PTS changes, and ends
    /// on EOF with exactly the right number of accumulated bytes.
    fn scan_payload(&mut self, payload: &[u8]) {
        if payload.len() < HEADER_SIZE || payload[0] != HEADER_SIZE as u8 {
            if usb::debug_enabled() {
                log::debug!("bad payload header");
            }
            return self.frame_add(PacketKind::Discard, &[]);
        }

        let flags = payload[1];
        if flags & UVC_STREAM_ERR != 0 {
            if usb::debug_enabled() {
                log::debug!("payload error bit set");
            }
            return self.frame_add(PacketKind::Discard, &[]);
        }
        if flags & UVC_STREAM_PTS == 0 {
            if usb::debug_enabled() {
                log::debug!("payload missing PTS");
            }
            return self.frame_add(PacketKind::Discard, &[]);
        }

        let pts = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
        let fid = u16::from(flags & UVC_STREAM_FID);
        let body = &payload[HEADER_SIZE..];

        if pts != self.last_pts || fid != self.last_fid {
            // The previous frame never saw its EOF; drop it rather than
            // deliver a glitched image.
            if self.last_packet_kind == PacketKind::Inter {
                self.frame_add(PacketKind::Discard, &[]);
            }
            self.last_pts = pts;
            self.last_fid = fid;
            self.frame_add(PacketKind::First, body);
        } else if flags & UVC_STREAM_EOF != 0 {
            self.last_pts = 0;
            if self.frame_data_len + body.len() != self.frame_size {
                self.frame_add(PacketKind::Discard, &[]);
            } else {
                self.frame_add(PacketKind::Last, body);
            }
        } else {
            self.frame_add(PacketKind::Inter, body);
        }
    }

    /// Append one classified payload body to the frame under assembly.
    fn frame_add(&mut self, kind: PacketKind, data: &[u8]) {
        let mut kind = kind;
        if kind == PacketKind::First {
            self.frame_data_len = 0;
        } else {
            match self.last_packet_kind {
                // Swallow the rest of a discarded frame.
                PacketKind::Discard => {
                    if kind == PacketKind::Last {
                        self.frame_data_len = 0;
                    }
                    return;
                }
                // The frame is complete; ignore stragglers until a new
                // frame starts.
                PacketKind::Last => return,
                _ => {}
            }
        }

        if !data.is_empty() {
            if self.frame_data_len + data.len() > self.frame_size {
                kind = PacketKind::Discard;
                self.frame_data_len = 0;
            } else if !self.cur_frame.is_null() {
                unsafe {
                    ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        self.cur_frame.add(self.frame_data_len),
                        data.len(),
                    );
                }
                self.frame_data_len += data.len();
            }
        }

        self.last_packet_kind = kind;

        if kind == PacketKind::Last {
            self.frame_data_len = 0;
            if let Some(ring) = &self.ring {
                self.cur_frame = ring.enqueue();
            }
        }
    }
}

impl Drop for UrbPump {
    fn drop(&mut self) {
        self.close_transfers();
    }
}

/// Completion callback, invoked on the event thread. The pump outlives
/// every invocation because `close_transfers` drains before freeing.
extern "system" fn on_transfer_done(xfr: *mut ffi::libusb_transfer) {
    let pump = unsafe { &mut *((*xfr).user_data as *mut UrbPump) };
    let status = unsafe { (*xfr).status };

    if status != LIBUSB_TRANSFER_COMPLETED {
        log::debug!("transfer finished with status {status}");
        pump.transfer_finished();
        if status != LIBUSB_TRANSFER_CANCELLED {
            // Bulk I/O went bad; take the whole stream down.
            pump.close_transfers();
        }
        return;
    }

    let payload = unsafe {
        std::slice::from_raw_parts((*xfr).buffer, (*xfr).actual_length as usize)
    };
    pump.pkt_scan(payload);

    if unsafe { ffi::libusb_submit_transfer(xfr) } < 0 {
        log::warn!("resubmitting bulk transfer failed");
        pump.transfer_finished();
        pump.close_transfers();
    }
}

/// First bulk-in endpoint of the first interface's alternate setting 0.
fn find_bulk_in_endpoint(device: &rusb::Device<Context>) -> Option<u8> {
    let config = device.active_config_descriptor().ok()?;
    let interface = config.interfaces().next()?;
    let setting = interface.descriptors().next()?;
    setting
        .endpoint_descriptors()
        .find(|ep| {
            ep.transfer_type() == rusb::TransferType::Bulk
                && ep.direction() == rusb::Direction::In
                && ep.max_packet_size() != 0
        })
        .map(|ep| ep.address())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert;
    use crate::types::OutputFormat;

    const W: usize = 16;
    const H: usize = 16;
    const FRAME: usize = W * H;

    fn payload(flags: u8, pts: u32, body: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_SIZE];
        data[0] = HEADER_SIZE as u8;
        data[1] = UVC_STREAM_PTS | flags;
        data[2..6].copy_from_slice(&pts.to_le_bytes());
        data.extend_from_slice(body);
        data
    }

    /// Send one whole frame split over several payloads, the final one
    /// carrying EOF.
    fn send_frame(pump: &mut UrbPump, pts: u32, fid: u8, frame: &[u8]) {
        let mut chunks = frame.chunks(100).peekable();
        while let Some(body) = chunks.next() {
            let eof = if chunks.peek().is_none() { UVC_STREAM_EOF } else { 0 };
            pump.pkt_scan(&payload(eof | (fid & UVC_STREAM_FID), pts, body));
        }
    }

    fn dequeue(pump: &UrbPump, format: OutputFormat, dest: &mut [u8]) -> bool {
        pump.ring()
            .expect("ring allocated")
            .dequeue(dest, W as u32, H as u32, format)
    }

    fn test_frame(seed: u8) -> Vec<u8> {
        (0..FRAME).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_happy_path_delivers_debayered_frame() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        let frame = test_frame(3);
        send_frame(&mut pump, 1, 0, &frame);

        let mut out = vec![0u8; FRAME * 3];
        assert!(dequeue(&pump, OutputFormat::Bgr, &mut out));

        let mut expected = vec![0u8; FRAME * 3];
        convert::debayer_rgb(W, H, &frame, &mut expected, true);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_bayer_passthrough_across_fid_toggle() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        let first = test_frame(1);
        let second = test_frame(2);
        send_frame(&mut pump, 1, 0, &first);
        send_frame(&mut pump, 2, 1, &second);

        let mut out = vec![0u8; FRAME];
        assert!(dequeue(&pump, OutputFormat::Bayer, &mut out));
        assert_eq!(out, first);
        assert!(dequeue(&pump, OutputFormat::Bayer, &mut out));
        assert_eq!(out, second);
    }

    #[test]
    fn test_eof_size_mismatch_discards_frame() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        // One byte short at EOF: the frame must not surface.
        let frame = test_frame(9);
        pump.pkt_scan(&payload(0, 1, &frame[..100]));
        pump.pkt_scan(&payload(UVC_STREAM_EOF, 1, &frame[100..FRAME - 1]));

        let mut out = vec![0u8; FRAME];
        assert!(!dequeue(&pump, OutputFormat::Bayer, &mut out));

        // The next well-formed frame is delivered normally.
        let good = test_frame(4);
        send_frame(&mut pump, 2, 1, &good);
        assert!(dequeue(&pump, OutputFormat::Bayer, &mut out));
        assert_eq!(out, good);
    }

    #[test]
    fn test_abandoned_partial_frame_is_dropped() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        // A frame that starts but never sees its EOF...
        pump.pkt_scan(&payload(0, 1, &[0xaa; 100]));
        pump.pkt_scan(&payload(0, 1, &[0xbb; 100]));

        // ...is abandoned when the next frame starts.
        let good = test_frame(5);
        send_frame(&mut pump, 2, 1, &good);

        let mut out = vec![0u8; FRAME];
        assert!(dequeue(&pump, OutputFormat::Bayer, &mut out));
        assert_eq!(out, good);
        assert!(!dequeue(&pump, OutputFormat::Bayer, &mut out));
    }

    #[test]
    fn test_error_bit_discards_payload() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        pump.pkt_scan(&payload(UVC_STREAM_ERR, 1, &[0xcc; 100]));
        let mut out = vec![0u8; FRAME];
        assert!(!dequeue(&pump, OutputFormat::Bayer, &mut out));
    }

    #[test]
    fn test_missing_pts_discards_payload() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        let mut bad = payload(0, 1, &[0xdd; 100]);
        bad[1] &= !UVC_STREAM_PTS;
        pump.pkt_scan(&bad);

        let mut out = vec![0u8; FRAME];
        assert!(!dequeue(&pump, OutputFormat::Bayer, &mut out));
    }

    #[test]
    fn test_bad_header_length_discards_payload() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        let mut bad = payload(0, 1, &[0xee; 100]);
        bad[0] = 11;
        pump.pkt_scan(&bad);

        let mut out = vec![0u8; FRAME];
        assert!(!dequeue(&pump, OutputFormat::Bayer, &mut out));
    }

    #[test]
    fn test_oversized_frame_is_reclassified_as_discard() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        // More body bytes than a frame can hold, without an EOF.
        pump.pkt_scan(&payload(0, 1, &[0x11; 200]));
        pump.pkt_scan(&payload(0, 1, &[0x22; 100]));

        let mut out = vec![0u8; FRAME];
        assert!(!dequeue(&pump, OutputFormat::Bayer, &mut out));

        // Recovery with a clean frame.
        let good = test_frame(6);
        send_frame(&mut pump, 2, 1, &good);
        assert!(dequeue(&pump, OutputFormat::Bayer, &mut out));
        assert_eq!(out, good);
    }

    #[test]
    fn test_slow_consumer_keeps_latest_frames_only() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        for n in 0..10u32 {
            send_frame(&mut pump, n + 1, (n % 2) as u8, &test_frame(n as u8));
        }

        // The ring holds three published frames; everything later collapsed
        // into the reserved producer slot.
        let mut out = vec![0u8; FRAME];
        let mut delivered = 0;
        while dequeue(&pump, OutputFormat::Bayer, &mut out) {
            delivered += 1;
        }
        assert_eq!(delivered, 3);
    }

    #[test]
    fn test_payload_strides_split_inside_one_completion() {
        let mut pump = UrbPump::new();
        pump.prepare(FRAME);

        // Two payloads back-to-back in a single completion buffer: the
        // first padded to a full stride, the second carrying EOF.
        let frame = test_frame(8);
        let first_body_len = PAYLOAD_SIZE - HEADER_SIZE;
        let mut frame_padded = frame.clone();
        frame_padded.resize(first_body_len, 0);

        let mut completion = payload(0, 1, &frame_padded);
        completion.extend_from_slice(&payload(UVC_STREAM_EOF, 1, &[]));

        // The first stride alone overruns the frame, so everything is
        // discarded: the stride walk still has to classify both headers.
        pump.pkt_scan(&completion);
        let mut out = vec![0u8; FRAME];
        assert!(!dequeue(&pump, OutputFormat::Bayer, &mut out));
    }
}
